//! Hardware tokens behind PKCS#11 modules.
#[cfg(test)]
pub mod mock;
mod module;
mod pkcs11;
mod worker;

pub use self::module::{HsmCertObject, HsmError, HsmKeyHandle, HsmKeyObject, HsmModule, HsmSession, HsmTokenInfo};
pub use self::pkcs11::Pkcs11Module;
pub use self::worker::HsmTokenWorker;
