//! Common types used by the token signer and its daemon.
pub mod error;
pub mod util;
