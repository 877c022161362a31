//! The software token: keys in PIN protected PKCS#12 files on disk.
mod keystore;
mod worker;

pub use self::keystore::KeyStore;
pub use self::worker::SoftTokenWorker;
