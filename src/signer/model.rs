//! Tokens, their keys, and the certificates and certificate requests bound
//! to those keys.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::commons::error::Error;
use crate::commons::util::ext_serde;
use crate::constants::{DEFAULT_SIGN_MECHANISM, SOFT_TOKEN_ID, SOFT_TOKEN_MODULE_TYPE};

//------------ TokenType -----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Software,
    Hardware,
}

//------------ TokenStatus ---------------------------------------------------

/// The status a token reports, independent of its activity.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    #[default]
    Ok,
    NotInitialized,
    UserPinIncorrect,
    UserPinLocked,
    UserPinInvalid,
    UserPinExpired,
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TokenStatus::Ok => "OK",
            TokenStatus::NotInitialized => "NOT_INITIALIZED",
            TokenStatus::UserPinIncorrect => "USER_PIN_INCORRECT",
            TokenStatus::UserPinLocked => "USER_PIN_LOCKED",
            TokenStatus::UserPinInvalid => "USER_PIN_INVALID",
            TokenStatus::UserPinExpired => "USER_PIN_EXPIRED",
        };
        f.write_str(s)
    }
}

//------------ TokenState ----------------------------------------------------

/// The state of the token state machine.
///
/// This is derived from the availability, status and activity of a token
/// rather than stored.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenState {
    Unavailable,
    NotInitialized,
    PinIncorrect,
    Active,
    Inactive,
}

//------------ Token ---------------------------------------------------------

/// A software or hardware token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Token {
    pub id: String,

    #[serde(rename = "type")]
    pub token_type: TokenType,

    pub module_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub available: bool,

    #[serde(default)]
    pub active: bool,

    #[serde(default)]
    pub status: TokenStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_index: Option<usize>,

    #[serde(default)]
    pub info: BTreeMap<String, String>,

    #[serde(default = "batch_signing_default")]
    pub batch_signing_enabled: bool,

    #[serde(default)]
    pub keys: Vec<Key>,
}

fn batch_signing_default() -> bool {
    true
}

impl Token {
    /// The software token, not yet known to be initialized.
    pub fn software() -> Self {
        Token {
            id: SOFT_TOKEN_ID.to_string(),
            token_type: TokenType::Software,
            module_type: SOFT_TOKEN_MODULE_TYPE.to_string(),
            friendly_name: None,
            read_only: false,
            available: false,
            active: false,
            status: TokenStatus::NotInitialized,
            serial_number: None,
            label: None,
            slot_index: None,
            info: BTreeMap::new(),
            batch_signing_enabled: true,
            keys: vec![],
        }
    }

    pub fn hardware(id: String, module_type: &str) -> Self {
        Token {
            id,
            token_type: TokenType::Hardware,
            module_type: module_type.to_string(),
            friendly_name: None,
            read_only: false,
            available: false,
            active: false,
            status: TokenStatus::Ok,
            serial_number: None,
            label: None,
            slot_index: None,
            info: BTreeMap::new(),
            batch_signing_enabled: true,
            keys: vec![],
        }
    }

    pub fn is_software(&self) -> bool {
        self.token_type == TokenType::Software
    }

    pub fn state(&self) -> TokenState {
        if !self.available {
            TokenState::Unavailable
        } else if self.status == TokenStatus::NotInitialized {
            TokenState::NotInitialized
        } else if self.status != TokenStatus::Ok {
            TokenState::PinIncorrect
        } else if self.active {
            TokenState::Active
        } else {
            TokenState::Inactive
        }
    }

    pub fn key(&self, key_id: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.id == key_id)
    }

    pub fn key_mut(&mut self, key_id: &str) -> Option<&mut Key> {
        self.keys.iter_mut().find(|k| k.id == key_id)
    }
}

//------------ KeyUsage ------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    Signing,
    Authentication,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyUsage::Signing => f.write_str("signing"),
            KeyUsage::Authentication => f.write_str("authentication"),
        }
    }
}

impl FromStr for KeyUsage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "signing" => Ok(KeyUsage::Signing),
            "authentication" | "auth" => Ok(KeyUsage::Authentication),
            _ => Err(Error::invalid(format!("unknown key usage '{}'", s))),
        }
    }
}

//------------ Key -----------------------------------------------------------

/// A key pair on a token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Key {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<KeyUsage>,

    /// Base64 encoded SubjectPublicKeyInfo, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default)]
    pub available: bool,

    pub sign_mechanism_name: String,

    #[serde(default)]
    pub certs: Vec<CertificateInfo>,

    #[serde(default)]
    pub cert_requests: Vec<CertRequestInfo>,

    /// Set once the last certificate or certificate request was removed,
    /// the next reconciliation deletes the key from its token.
    #[serde(skip)]
    pub pending_deletion: bool,
}

impl Key {
    pub fn new(id: String) -> Self {
        Key {
            id,
            label: None,
            friendly_name: None,
            usage: None,
            public_key: None,
            available: false,
            sign_mechanism_name: DEFAULT_SIGN_MECHANISM.to_string(),
            certs: vec![],
            cert_requests: vec![],
            pending_deletion: false,
        }
    }

    /// Whether a certificate or certificate request binds this key.
    pub fn is_bound(&self) -> bool {
        !self.certs.is_empty() || !self.cert_requests.is_empty()
    }

    pub fn is_orphaned(&self) -> bool {
        self.pending_deletion && !self.is_bound()
    }

    pub fn set_public_key_der(&mut self, der: &[u8]) {
        self.public_key = Some(BASE64.encode(der));
    }

    pub fn public_key_der(&self) -> Result<Option<Bytes>, Error> {
        match &self.public_key {
            Some(encoded) => {
                let der = BASE64
                    .decode(encoded)
                    .map_err(|e| Error::internal(format!("invalid public key of key '{}': {}", self.id, e)))?;
                Ok(Some(Bytes::from(der)))
            }
            None => Ok(None),
        }
    }

    pub fn cert(&self, cert_id: &str) -> Option<&CertificateInfo> {
        self.certs.iter().find(|c| c.id == cert_id)
    }
}

//------------ CertStatus ----------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    Saved,
    RegInProgress,
    Registered,
    DeletionInProgress,
    GlobalError,
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CertStatus::Saved => "saved",
            CertStatus::RegInProgress => "registration in progress",
            CertStatus::Registered => "registered",
            CertStatus::DeletionInProgress => "deletion in progress",
            CertStatus::GlobalError => "global error",
        };
        f.write_str(s)
    }
}

impl FromStr for CertStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "saved" => Ok(CertStatus::Saved),
            "registration in progress" | "reg_in_progress" => Ok(CertStatus::RegInProgress),
            "registered" => Ok(CertStatus::Registered),
            "deletion in progress" | "deletion_in_progress" => Ok(CertStatus::DeletionInProgress),
            "global error" | "global_error" => Ok(CertStatus::GlobalError),
            _ => Err(Error::invalid(format!("unknown certificate status '{}'", s))),
        }
    }
}

//------------ CertificateInfo -----------------------------------------------

/// A certificate attached to a key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertificateInfo {
    /// The upper case hex SHA-1 hash of the certificate.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,

    #[serde(deserialize_with = "ext_serde::de_bytes", serialize_with = "ext_serde::ser_bytes")]
    pub bytes: Bytes,

    pub status: CertStatus,

    #[serde(default)]
    pub active: bool,

    /// False for certificates only found on a device.
    #[serde(default)]
    pub saved_to_configuration: bool,

    #[serde(
        default,
        deserialize_with = "ext_serde::de_bytes_opt",
        serialize_with = "ext_serde::ser_bytes_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub ocsp_response: Option<Bytes>,
}

impl CertificateInfo {
    pub fn new(member_id: Option<String>, bytes: Bytes, status: CertStatus) -> Self {
        CertificateInfo {
            id: sha1_hex(&bytes),
            member_id,
            bytes,
            status,
            active: false,
            saved_to_configuration: true,
            ocsp_response: None,
        }
    }

    pub fn sha1_hash(&self) -> String {
        sha1_hex(&self.bytes)
    }

    pub fn sha256_hash(&self) -> String {
        hex::encode_upper(openssl::sha::sha256(&self.bytes))
    }
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode_upper(openssl::sha::sha1(bytes))
}

//------------ CertRequestFormat ---------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertRequestFormat {
    Pem,
    Der,
}

impl FromStr for CertRequestFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pem" => Ok(CertRequestFormat::Pem),
            "der" => Ok(CertRequestFormat::Der),
            _ => Err(Error::invalid(format!("unknown request format '{}'", s))),
        }
    }
}

//------------ CertRequestInfo -----------------------------------------------

/// A pending certificate signing request for a key.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertRequestInfo {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,

    pub subject_name: String,

    pub usage: KeyUsage,

    pub format: CertRequestFormat,
}

//------------ GeneratedCertRequest ------------------------------------------

/// The outcome of a certificate request generation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedCertRequest {
    pub cert_req_id: String,
    pub csr: Bytes,
    pub format: CertRequestFormat,
}

//------------ SecurityServerId ----------------------------------------------

/// Identifies the server an authentication key is used for.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SecurityServerId {
    pub owner: String,
    pub server_code: String,
}

impl fmt::Display for SecurityServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.server_code)
    }
}

//------------ AuthKeyInfo ---------------------------------------------------

/// Everything a TLS stack needs to use the authentication key.
#[derive(Debug)]
pub struct AuthKeyInfo {
    pub alias: String,
    pub key_store_file: PathBuf,
    pub password: SecretString,
    pub cert: CertificateInfo,
}

//------------ Tests ---------------------------------------------------------
