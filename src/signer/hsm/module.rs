use std::fmt;

use bytes::Bytes;
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::daemon::config::ModuleConf;
use crate::signer::algorithm::SignInput;
use crate::signer::hsm::pkcs11::{Pkcs11Module, Pkcs11Session};
use crate::signer::model::TokenStatus;

#[cfg(test)]
use crate::signer::hsm::mock::{MockModule, MockSession};

//------------ HsmError ------------------------------------------------------

/// The outcome of a failed call into a hardware module.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HsmError {
    /// The library or device failed, the module needs a reload.
    DeviceFault(String),

    /// The PIN was refused, with the token status this implies.
    Pin(TokenStatus),

    /// Any other failure.
    Failed(String),
}

impl HsmError {
    pub fn is_device_fault(&self) -> bool {
        matches!(self, HsmError::DeviceFault(_))
    }
}

impl fmt::Display for HsmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HsmError::DeviceFault(msg) => write!(f, "device fault: {}", msg),
            HsmError::Pin(status) => write!(f, "PIN refused: {}", status),
            HsmError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl From<HsmError> for Error {
    fn from(e: HsmError) -> Self {
        match e {
            HsmError::DeviceFault(msg) => Error::DeviceFault(msg),
            HsmError::Pin(_) => Error::PinIncorrect,
            HsmError::Failed(msg) => Error::Internal(msg),
        }
    }
}

//------------ Objects -------------------------------------------------------

/// A token found in a slot of a module.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HsmTokenInfo {
    pub slot_index: usize,
    pub serial_number: String,
    pub label: String,
    pub write_protected: bool,
}

/// A private key object on a token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HsmKeyObject {
    pub id: Vec<u8>,
    pub label: Option<String>,
}

/// A certificate object on a token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HsmCertObject {
    pub id: Vec<u8>,
    pub value: Bytes,
}

/// A resolved private key, only valid for the session it came from.
#[derive(Clone, Debug)]
pub enum HsmKeyHandle {
    Pkcs11(cryptoki::object::ObjectHandle),

    #[cfg(test)]
    Mock(Vec<u8>),
}

//------------ HsmModule -----------------------------------------------------

/// A loaded hardware module.
#[derive(Debug)]
pub enum HsmModule {
    Pkcs11(Pkcs11Module),

    #[cfg(test)]
    Mock(MockModule),
}

impl HsmModule {
    pub fn conf(&self) -> &ModuleConf {
        match self {
            HsmModule::Pkcs11(module) => module.conf(),
            #[cfg(test)]
            HsmModule::Mock(module) => module.conf(),
        }
    }

    pub fn name(&self) -> &str {
        &self.conf().name
    }

    /// Lists the tokens currently present in the slots of the module.
    pub fn tokens(&self) -> Result<Vec<HsmTokenInfo>, HsmError> {
        match self {
            HsmModule::Pkcs11(module) => module.tokens(),
            #[cfg(test)]
            HsmModule::Mock(module) => module.tokens(),
        }
    }

    pub fn open_session(&self, slot_index: usize) -> Result<HsmSession, HsmError> {
        match self {
            HsmModule::Pkcs11(module) => module.open_session(slot_index).map(HsmSession::Pkcs11),
            #[cfg(test)]
            HsmModule::Mock(module) => module.open_session(slot_index).map(HsmSession::Mock),
        }
    }

    /// Finalizes and reloads the library. All sessions must be closed.
    pub fn reload(&self) -> Result<(), HsmError> {
        match self {
            HsmModule::Pkcs11(module) => module.reload(),
            #[cfg(test)]
            HsmModule::Mock(module) => module.reload(),
        }
    }

    /// Builds the token id from the configured format.
    pub fn token_id(&self, info: &HsmTokenInfo) -> String {
        self.conf()
            .token_id_format
            .replace("{moduleType}", self.name())
            .replace("{slotIndex}", &info.slot_index.to_string())
            .replace("{serialNumber}", &info.serial_number)
            .replace("{label}", &info.label)
    }
}

//------------ HsmSession ----------------------------------------------------

/// A session with one token.
pub enum HsmSession {
    Pkcs11(Pkcs11Session),

    #[cfg(test)]
    Mock(MockSession),
}

impl HsmSession {
    pub fn login(&self, pin: &SecretString) -> Result<(), HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.login(pin),
            #[cfg(test)]
            HsmSession::Mock(session) => session.login(pin),
        }
    }

    pub fn logout(&self) -> Result<(), HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.logout(),
            #[cfg(test)]
            HsmSession::Mock(session) => session.logout(),
        }
    }

    pub fn private_keys(&self) -> Result<Vec<HsmKeyObject>, HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.private_keys(),
            #[cfg(test)]
            HsmSession::Mock(session) => session.private_keys(),
        }
    }

    /// The DER encoded SubjectPublicKeyInfo of the key with the given id.
    pub fn public_key(&self, id: &[u8]) -> Result<Option<Bytes>, HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.public_key(id),
            #[cfg(test)]
            HsmSession::Mock(session) => session.public_key(id),
        }
    }

    pub fn certificates(&self) -> Result<Vec<HsmCertObject>, HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.certificates(),
            #[cfg(test)]
            HsmSession::Mock(session) => session.certificates(),
        }
    }

    /// Generates an RSA key pair, returns its SubjectPublicKeyInfo.
    pub fn generate_key_pair(
        &self,
        id: &[u8],
        label: Option<&str>,
        bits: u32,
    ) -> Result<Bytes, HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.generate_key_pair(id, label, bits),
            #[cfg(test)]
            HsmSession::Mock(session) => session.generate_key_pair(id, label, bits),
        }
    }

    pub fn destroy_key(&self, id: &[u8]) -> Result<(), HsmError> {
        match self {
            HsmSession::Pkcs11(session) => session.destroy_key(id),
            #[cfg(test)]
            HsmSession::Mock(session) => session.destroy_key(id),
        }
    }

    pub fn find_private_key(&self, id: &[u8]) -> Result<Option<HsmKeyHandle>, HsmError> {
        match self {
            HsmSession::Pkcs11(session) => {
                Ok(session.find_private_key(id)?.map(HsmKeyHandle::Pkcs11))
            }
            #[cfg(test)]
            HsmSession::Mock(session) => Ok(session.find_private_key(id)?.map(HsmKeyHandle::Mock)),
        }
    }

    pub fn sign(&self, key: &HsmKeyHandle, input: &SignInput) -> Result<Bytes, HsmError> {
        match (self, key) {
            (HsmSession::Pkcs11(session), HsmKeyHandle::Pkcs11(handle)) => session.sign(*handle, input),
            #[cfg(test)]
            (HsmSession::Mock(session), HsmKeyHandle::Mock(id)) => session.sign(id, input),
            #[cfg(test)]
            _ => Err(HsmError::Failed("key handle from another module".to_string())),
        }
    }
}

//------------ Tests ---------------------------------------------------------
