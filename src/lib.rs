pub mod command;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod keys;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod session;
pub mod store;
pub mod wal;
pub mod wire;
