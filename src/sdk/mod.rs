//! High-level client API.
//!
//! [`UaClient`] is the entry point most applications need: it connects, keeps the session
//! alive across channel loss and delivers subscription notifications. The lower layers stay
//! public for callers that drive channels or sessions themselves.
pub mod client;

pub use client::{ClientError, UaClient};
