//! Protocol boundary: typed commands, typed events, and the client trait

pub mod client;
pub mod event;
pub mod types;

pub use client::{ProtocolClient, ProtocolClientExt};
pub use event::PageEvent;
pub use types::{ErrorReason, HeaderEntry};
