//! A signing token daemon.
//!
//! Tokens hold the private keys used for authentication and signing. They
//! are either the single software token, backed by PIN protected PKCS#12
//! key stores on disk, or hardware tokens exposed by PKCS#11 modules. Every
//! token is driven by its own worker, the [`signer::TokenManager`] routes
//! requests to them.
pub mod commons;
pub mod constants;
pub mod daemon;
pub mod signer;
