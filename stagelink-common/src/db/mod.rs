//! Database models and the persistence store

pub mod init;
pub mod models;
pub mod store;

pub use init::{init_database, init_memory_database};
pub use models::{CustomInstrument, Request, RequestAction, Room};
pub use store::Store;
