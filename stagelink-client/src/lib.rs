//! # StageLink Client Session
//!
//! Maintains one logical subscription to a room across transport hiccups:
//! reconnects with monotonic backoff, treats every fresh snapshot as
//! authoritative, and exposes the live room view derived purely from
//! replayed + streamed events.

pub mod backoff;
pub mod session;

pub use backoff::Backoff;
pub use session::{ClientSession, RoomView, SessionError, SessionEvent, SessionOptions};
