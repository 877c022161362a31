//! Signing tokens: the software token, PKCS#11 hardware tokens, the keys
//! and certificates they hold, and the dispatcher routing requests to the
//! worker owning each token.
pub mod algorithm;
pub mod directory;
pub mod dispatch;
#[cfg(feature = "hsm")]
pub mod hsm;
pub mod model;
pub mod pin;
pub mod soft;
pub mod tokenconf;
pub mod verify;
pub mod worker;
pub mod x509;

pub use self::dispatch::TokenManager;
pub use crate::commons::error::{Error, ErrorKind};
