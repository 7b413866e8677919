pub mod config;
pub mod daemon;
pub mod seed;
