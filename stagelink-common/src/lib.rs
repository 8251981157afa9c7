//! # StageLink Common Library
//!
//! Shared code for the StageLink gateway and client:
//! - Database models and the persistence store (rooms, requests, instruments)
//! - Wire protocol types (client/server message envelopes)
//! - Configuration loading
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod proto;

pub use error::{Error, Result};
