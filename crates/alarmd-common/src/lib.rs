//! Domain types shared by the alarm aggregation engine, its storage backend
//! and the daemon.

pub mod id;
pub mod types;
