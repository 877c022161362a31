//! The persisted snapshot of the Token Directory.
use std::path::Path;

use log::debug;
use openssl::sha::sha256;
use serde::{Deserialize, Serialize};

use crate::commons::error::Error;
use crate::commons::util::file;
use crate::signer::model::{Key, Token};

/// The SHA-256 of a snapshot file, to tell our own writes from changes
/// made by others.
pub type ConfDigest = [u8; 32];

//------------ KeyConf -------------------------------------------------------

/// The document that is written to disk whenever the directory changes.
///
/// Of every token it holds only the keys that carry a saved certificate or
/// a certificate request. Everything else is found again when the workers
/// reconcile their devices.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyConf {
    #[serde(default)]
    tokens: Vec<Token>,
}

impl KeyConf {
    pub fn snapshot<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|token| {
                let keys = token.keys.iter().filter_map(Self::persisted_key).collect();
                Token {
                    keys,
                    ..token.clone()
                }
            })
            .collect();
        KeyConf { tokens }
    }

    fn persisted_key(key: &Key) -> Option<Key> {
        if !Self::persists(key) {
            return None;
        }
        let certs = key
            .certs
            .iter()
            .filter(|c| c.saved_to_configuration)
            .cloned()
            .collect();
        Some(Key {
            certs,
            ..key.clone()
        })
    }

    /// Whether the snapshot carries the key.
    pub fn persists(key: &Key) -> bool {
        key.certs.iter().any(|c| c.saved_to_configuration) || !key.cert_requests.is_empty()
    }

    /// Loads the snapshot and the digest of the file it came from. An
    /// absent file is an empty directory.
    pub fn load_with_digest(path: &Path) -> Result<(Self, Option<ConfDigest>), Error> {
        match file::read_if_exists(path)? {
            Some(bytes) => {
                let conf = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::Internal(format!("could not parse '{}': {}", path.display(), e))
                })?;
                Ok((conf, Some(sha256(&bytes))))
            }
            None => {
                debug!("No key configuration at '{}', starting empty", path.display());
                Ok((KeyConf::default(), None))
            }
        }
    }

    /// Returns the digest of the snapshot file currently on disk.
    pub fn digest(path: &Path) -> Result<Option<ConfDigest>, Error> {
        Ok(file::read_if_exists(path)?.map(|bytes| sha256(&bytes)))
    }

    /// Saves the snapshot and returns the digest of what was written.
    pub fn save(&self, path: &Path, tmp_dir: &Path) -> Result<ConfDigest, Error> {
        let json = serde_json::to_vec_pretty(self)?;
        file::save_atomic(&json, path, tmp_dir)?;
        Ok(sha256(&json))
    }

    /// Returns the loaded tokens, all unavailable and inactive until their
    /// workers have looked at them.
    pub fn into_tokens(self) -> Vec<Token> {
        self.tokens
            .into_iter()
            .map(|mut token| {
                token.available = false;
                token.active = false;
                for key in token.keys.iter_mut() {
                    key.available = false;
                }
                token
            })
            .collect()
    }
}

//------------ Tests ---------------------------------------------------------
