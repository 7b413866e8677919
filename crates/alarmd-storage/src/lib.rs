//! Relational persistence for events, strategies, alerts and operator logs.
//!
//! [`store::AlarmStore`] implements the engine's collaborator traits on top
//! of SeaORM, so the same code runs against SQLite, PostgreSQL or MySQL.
//! Row locks use `SELECT ... FOR UPDATE` where the backend has them; SQLite
//! serializes writers at the database level instead.

pub mod entities;
pub mod error;
pub mod store;

#[cfg(test)]
mod tests;

pub use store::AlarmStore;
