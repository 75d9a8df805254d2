//! Forward Protocol Classification
//!
//! Derives, from the forward address scheme, how an unreachable upstream is
//! signalled back to the inbound peer.

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
