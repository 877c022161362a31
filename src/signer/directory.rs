//! The Token Directory: the in-memory catalog of all tokens, keys,
//! certificates and certificate requests.
//!
//! Lookups by id or certificate hash go through indexes that are kept next
//! to the tokens. Mutations are applied in memory, callers then call
//! [`TokenDirectory::persist`] to write a snapshot.
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use log::{debug, info, trace};

use crate::commons::error::Error;
use crate::daemon::config::Config;
use crate::signer::model::{CertRequestInfo, CertStatus, CertificateInfo, Key, Token};
use crate::signer::tokenconf::{ConfDigest, KeyConf};

//------------ DirectoryState ------------------------------------------------

#[derive(Debug, Default)]
struct DirectoryState {
    tokens: BTreeMap<String, Token>,

    /// key id -> token id
    key_tokens: HashMap<String, String>,

    /// certificate id -> key id
    cert_keys: HashMap<String, String>,

    /// upper case SHA-1 and SHA-256 hex hash -> certificate id
    cert_hashes: HashMap<String, String>,

    /// certificate request id -> key id
    cert_req_keys: HashMap<String, String>,
}

impl DirectoryState {
    fn new(tokens: Vec<Token>) -> Self {
        let mut state = DirectoryState {
            tokens: tokens.into_iter().map(|t| (t.id.clone(), t)).collect(),
            ..Default::default()
        };
        state.reindex();
        state
    }

    fn reindex(&mut self) {
        self.key_tokens.clear();
        self.cert_keys.clear();
        self.cert_hashes.clear();
        self.cert_req_keys.clear();

        for token in self.tokens.values() {
            for key in &token.keys {
                self.key_tokens.insert(key.id.clone(), token.id.clone());
                for cert in &key.certs {
                    self.cert_keys.insert(cert.id.clone(), key.id.clone());
                    self.cert_hashes.insert(cert.sha1_hash(), cert.id.clone());
                    self.cert_hashes.insert(cert.sha256_hash(), cert.id.clone());
                }
                for req in &key.cert_requests {
                    self.cert_req_keys.insert(req.id.clone(), key.id.clone());
                }
            }
        }
    }

    fn token(&self, token_id: &str) -> Result<&Token, Error> {
        self.tokens
            .get(token_id)
            .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))
    }

    fn token_id_for_key(&self, key_id: &str) -> Result<&String, Error> {
        self.key_tokens
            .get(key_id)
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    fn key(&self, key_id: &str) -> Result<&Key, Error> {
        let token_id = self.token_id_for_key(key_id)?;
        self.token(token_id)?
            .key(key_id)
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    fn key_mut(&mut self, key_id: &str) -> Result<&mut Key, Error> {
        let token_id = self.token_id_for_key(key_id)?.clone();
        self.tokens
            .get_mut(&token_id)
            .and_then(|t| t.key_mut(key_id))
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))
    }

    fn key_id_for_cert(&self, cert_id: &str) -> Result<String, Error> {
        self.cert_keys
            .get(cert_id)
            .cloned()
            .ok_or_else(|| Error::CertNotFound(cert_id.to_string()))
    }

    fn cert(&self, cert_id: &str) -> Result<(String, CertificateInfo), Error> {
        let key_id = self.key_id_for_cert(cert_id)?;
        let cert = self
            .key(&key_id)?
            .cert(cert_id)
            .cloned()
            .ok_or_else(|| Error::CertNotFound(cert_id.to_string()))?;
        Ok((key_id, cert))
    }

    /// Merges tokens read from the snapshot file.
    ///
    /// The file wins for everything it carries. Availability, activity and
    /// the other facts only a device can tell are kept, as are OCSP
    /// responses and the keys and certificates the snapshot never holds.
    /// Returns the ids of the certificates that were not known before.
    fn merge(&mut self, file_tokens: Vec<Token>) -> Vec<String> {
        let mut known_tokens = std::mem::take(&mut self.tokens);
        let mut added = vec![];

        for mut token in file_tokens {
            match known_tokens.remove(&token.id) {
                Some(known) => merge_token(&mut token, known, &mut added),
                None => added.extend(token.keys.iter().flat_map(cert_ids)),
            }
            self.tokens.insert(token.id.clone(), token);
        }
        self.tokens.append(&mut known_tokens);

        self.reindex();
        added
    }
}

fn cert_ids(key: &Key) -> impl Iterator<Item = String> + '_ {
    key.certs.iter().map(|c| c.id.clone())
}

fn merge_token(token: &mut Token, known: Token, added: &mut Vec<String>) {
    token.module_type = known.module_type;
    token.read_only = known.read_only;
    token.available = known.available;
    token.active = known.active;
    token.status = known.status;
    token.info = known.info;
    if known.slot_index.is_some() {
        token.slot_index = known.slot_index;
    }

    let mut known_keys = known.keys;
    for key in token.keys.iter_mut() {
        match known_keys.iter().position(|k| k.id == key.id) {
            Some(pos) => merge_key(key, known_keys.remove(pos), added),
            None => added.extend(cert_ids(key)),
        }
    }
    token
        .keys
        .extend(known_keys.into_iter().filter(|k| !KeyConf::persists(k)));
}

fn merge_key(key: &mut Key, known: Key, added: &mut Vec<String>) {
    key.available = known.available;
    if key.public_key.is_none() {
        key.public_key = known.public_key;
    }

    let mut known_certs = known.certs;
    for cert in key.certs.iter_mut() {
        match known_certs.iter().position(|c| c.id == cert.id) {
            Some(pos) => {
                let known = known_certs.remove(pos);
                if cert.ocsp_response.is_none() {
                    cert.ocsp_response = known.ocsp_response;
                }
            }
            None => added.push(cert.id.clone()),
        }
    }
    key.certs
        .extend(known_certs.into_iter().filter(|c| !c.saved_to_configuration));
    key.pending_deletion = known.pending_deletion && !key.is_bound();
}

//------------ TokenDirectory ------------------------------------------------

/// The single owned catalog of tokens, shared by the dispatcher and the
/// token workers.
#[derive(Debug)]
pub struct TokenDirectory {
    state: RwLock<DirectoryState>,

    // Digest of the snapshot file as last read or written. The lock also
    // serializes snapshots so that a later state is never overwritten by
    // an earlier one.
    persisted: Mutex<Option<ConfDigest>>,

    conf_file: PathBuf,
    tmp_dir: PathBuf,
}

/// # Create and persist
impl TokenDirectory {
    pub fn new(conf_file: PathBuf, tmp_dir: PathBuf, tokens: Vec<Token>) -> Self {
        TokenDirectory {
            state: RwLock::new(DirectoryState::new(tokens)),
            persisted: Mutex::new(None),
            conf_file,
            tmp_dir,
        }
    }

    /// Loads the directory from the snapshot in the data dir.
    pub fn load(config: &Config) -> Result<Self, Error> {
        let conf_file = config.key_conf_file();
        let (conf, digest) = KeyConf::load_with_digest(&conf_file)?;
        let tokens = conf.into_tokens();
        debug!(
            "Loaded {} token(s) from '{}'",
            tokens.len(),
            conf_file.display()
        );
        let directory = Self::new(conf_file, config.tmp_dir(), tokens);
        *directory.persisted()? = digest;
        Ok(directory)
    }

    /// Writes a snapshot of the current state.
    pub fn persist(&self) -> Result<(), Error> {
        let mut persisted = self.persisted()?;

        let conf = {
            let state = self.read()?;
            KeyConf::snapshot(state.tokens.values())
        };
        *persisted = Some(conf.save(&self.conf_file, &self.tmp_dir)?);
        trace!("Saved token directory to '{}'", self.conf_file.display());
        Ok(())
    }

    /// Merges the snapshot file into the directory if it was changed by
    /// someone else since this directory last read or wrote it.
    ///
    /// Returns the ids of the certificates the merge added.
    pub fn merge_changed_conf(&self) -> Result<Vec<String>, Error> {
        let mut persisted = self.persisted()?;

        match KeyConf::digest(&self.conf_file)? {
            Some(digest) if Some(digest) != *persisted => {}
            _ => return Ok(vec![]),
        }

        info!(
            "Key configuration '{}' changed on disk, merging",
            self.conf_file.display()
        );
        let (conf, digest) = KeyConf::load_with_digest(&self.conf_file)?;
        let added = self.write()?.merge(conf.into_tokens());
        *persisted = digest;
        Ok(added)
    }

    fn persisted(&self) -> Result<MutexGuard<'_, Option<ConfDigest>>, Error> {
        self.persisted
            .lock()
            .map_err(|_| Error::internal("token directory persist lock poisoned"))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, DirectoryState>, Error> {
        self.state
            .read()
            .map_err(|_| Error::internal("token directory lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, DirectoryState>, Error> {
        self.state
            .write()
            .map_err(|_| Error::internal("token directory lock poisoned"))
    }
}

/// # Lookups
impl TokenDirectory {
    pub fn tokens(&self) -> Result<Vec<Token>, Error> {
        Ok(self.read()?.tokens.values().cloned().collect())
    }

    pub fn token(&self, token_id: &str) -> Result<Token, Error> {
        self.read()?.token(token_id).cloned()
    }

    pub fn key(&self, key_id: &str) -> Result<Key, Error> {
        self.read()?.key(key_id).cloned()
    }

    pub fn token_id_for_key(&self, key_id: &str) -> Result<String, Error> {
        self.read()?.token_id_for_key(key_id).cloned()
    }

    pub fn token_for_key(&self, key_id: &str) -> Result<Token, Error> {
        let state = self.read()?;
        let token_id = state.token_id_for_key(key_id)?;
        state.token(token_id).cloned()
    }

    /// Returns the id of the key holding the certificate and the certificate.
    pub fn cert(&self, cert_id: &str) -> Result<(String, CertificateInfo), Error> {
        self.read()?.cert(cert_id)
    }

    /// Finds a certificate by its SHA-1 or SHA-256 hex hash, in any case.
    pub fn cert_for_hash(&self, hash: &str) -> Result<(String, CertificateInfo), Error> {
        let state = self.read()?;
        let cert_id = state
            .cert_hashes
            .get(&hash.to_ascii_uppercase())
            .ok_or_else(|| Error::CertNotFound(hash.to_string()))?;
        state.cert(cert_id)
    }

    pub fn cert_request(&self, req_id: &str) -> Result<(String, CertRequestInfo), Error> {
        let state = self.read()?;
        let key_id = state
            .cert_req_keys
            .get(req_id)
            .ok_or_else(|| Error::CertRequestNotFound(req_id.to_string()))?;
        let req = state
            .key(key_id)?
            .cert_requests
            .iter()
            .find(|r| r.id == req_id)
            .cloned()
            .ok_or_else(|| Error::CertRequestNotFound(req_id.to_string()))?;
        Ok((key_id.clone(), req))
    }

    pub fn member_certs(&self, member_id: &str) -> Result<Vec<CertificateInfo>, Error> {
        let state = self.read()?;
        Ok(state
            .tokens
            .values()
            .flat_map(|t| t.keys.iter())
            .flat_map(|k| k.certs.iter())
            .filter(|c| c.member_id.as_deref() == Some(member_id))
            .cloned()
            .collect())
    }

    /// Finds the key with the given base64 encoded public key.
    pub fn key_for_public_key(&self, public_key: &str) -> Result<Option<Key>, Error> {
        let state = self.read()?;
        Ok(state
            .tokens
            .values()
            .flat_map(|t| t.keys.iter())
            .find(|k| k.public_key.as_deref() == Some(public_key))
            .cloned())
    }

    /// Finds a key without a known public key that already holds the given
    /// certificate as an unsaved certificate.
    pub fn key_for_unsaved_cert(&self, cert_bytes: &[u8]) -> Result<Option<Key>, Error> {
        let state = self.read()?;
        Ok(state
            .tokens
            .values()
            .flat_map(|t| t.keys.iter())
            .filter(|k| k.public_key.is_none())
            .find(|k| {
                k.certs
                    .iter()
                    .any(|c| !c.saved_to_configuration && c.bytes.as_ref() == cert_bytes)
            })
            .cloned())
    }

    /// False for unknown keys.
    pub fn is_key_available(&self, key_id: &str) -> Result<bool, Error> {
        let state = self.read()?;
        Ok(state.key(key_id).map(|k| k.available).unwrap_or(false))
    }
}

/// # Mutations
///
/// Every mutation touches the subtree of one token and is expected to run
/// on the worker that owns it.
impl TokenDirectory {
    /// Applies a change to a token and updates the indexes.
    pub fn update_token<R>(
        &self,
        token_id: &str,
        op: impl FnOnce(&mut Token) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut state = self.write()?;
        let token = state
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))?;
        let res = op(token);
        state.reindex();
        res
    }

    /// Applies a change to a key and updates the indexes.
    pub fn update_key<R>(
        &self,
        key_id: &str,
        op: impl FnOnce(&mut Key) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut state = self.write()?;
        let res = op(state.key_mut(key_id)?);
        state.reindex();
        res
    }

    /// Adds the token unless there is one with that id already. Returns
    /// whether it was added.
    pub fn add_token(&self, token: Token) -> Result<bool, Error> {
        let mut state = self.write()?;
        if state.tokens.contains_key(&token.id) {
            return Ok(false);
        }
        debug!("[{}] Adding token", token.id);
        state.tokens.insert(token.id.clone(), token);
        state.reindex();
        Ok(true)
    }

    pub fn remove_token(&self, token_id: &str) -> Result<Option<Token>, Error> {
        let mut state = self.write()?;
        let token = state.tokens.remove(token_id);
        if token.is_some() {
            debug!("[{}] Removed token", token_id);
        }
        state.reindex();
        Ok(token)
    }

    pub fn set_token_available(&self, token_id: &str, available: bool) -> Result<(), Error> {
        self.update_token(token_id, |t| {
            t.available = available;
            Ok(())
        })
    }

    pub fn set_token_active(&self, token_id: &str, active: bool) -> Result<(), Error> {
        self.update_token(token_id, |t| {
            t.active = active;
            Ok(())
        })
    }


    pub fn set_token_friendly_name(&self, token_id: &str, name: &str) -> Result<(), Error> {
        self.update_token(token_id, |t| {
            t.friendly_name = Some(name.to_string());
            Ok(())
        })
    }

    /// Marks all keys of a token (un)available.
    pub fn set_keys_available(&self, token_id: &str, available: bool) -> Result<(), Error> {
        self.update_token(token_id, |t| {
            for key in t.keys.iter_mut() {
                key.available = available;
            }
            Ok(())
        })
    }

    pub fn add_key(&self, token_id: &str, key: Key) -> Result<(), Error> {
        let mut state = self.write()?;
        if state.key_tokens.contains_key(&key.id) {
            return Err(Error::internal(format!("key '{}' already exists", key.id)));
        }
        let token = state
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))?;
        debug!("[{}] Adding key '{}'", token_id, key.id);
        token.keys.push(key);
        state.reindex();
        Ok(())
    }

    pub fn remove_key(&self, key_id: &str) -> Result<Key, Error> {
        let mut state = self.write()?;
        let token_id = state.token_id_for_key(key_id)?.clone();
        let token = state
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| Error::TokenNotFound(token_id.clone()))?;
        let pos = token
            .keys
            .iter()
            .position(|k| k.id == key_id)
            .ok_or_else(|| Error::KeyNotFound(key_id.to_string()))?;
        let key = token.keys.remove(pos);
        debug!("[{}] Removed key '{}'", token_id, key_id);
        state.reindex();
        Ok(key)
    }

    pub fn set_key_available(&self, key_id: &str, available: bool) -> Result<(), Error> {
        self.update_key(key_id, |k| {
            k.available = available;
            Ok(())
        })
    }

    pub fn set_key_friendly_name(&self, key_id: &str, name: &str) -> Result<(), Error> {
        self.update_key(key_id, |k| {
            k.friendly_name = Some(name.to_string());
            Ok(())
        })
    }

    pub fn set_key_label(&self, key_id: &str, label: &str) -> Result<(), Error> {
        self.update_key(key_id, |k| {
            k.label = Some(label.to_string());
            Ok(())
        })
    }


    pub fn set_key_public_key(&self, key_id: &str, der: &[u8]) -> Result<(), Error> {
        self.update_key(key_id, |k| {
            k.set_public_key_der(der);
            Ok(())
        })
    }

    pub fn add_cert(&self, key_id: &str, cert: CertificateInfo) -> Result<(), Error> {
        self.update_key(key_id, |k| {
            debug!("Adding certificate '{}' to key '{}'", cert.id, k.id);
            k.pending_deletion = false;
            k.certs.push(cert);
            Ok(())
        })
    }

    /// Removes a certificate. A key left without certificates and requests
    /// is marked for deletion from its token.
    pub fn remove_cert(&self, cert_id: &str) -> Result<CertificateInfo, Error> {
        let key_id = self.read()?.key_id_for_cert(cert_id)?;
        self.update_key(&key_id, |k| {
            let pos = k
                .certs
                .iter()
                .position(|c| c.id == cert_id)
                .ok_or_else(|| Error::CertNotFound(cert_id.to_string()))?;
            let cert = k.certs.remove(pos);
            if !k.is_bound() {
                k.pending_deletion = true;
            }
            Ok(cert)
        })
    }

    fn update_cert(
        &self,
        cert_id: &str,
        op: impl FnOnce(&mut CertificateInfo),
    ) -> Result<(), Error> {
        let key_id = self.read()?.key_id_for_cert(cert_id)?;
        self.update_key(&key_id, |k| {
            let cert = k
                .certs
                .iter_mut()
                .find(|c| c.id == cert_id)
                .ok_or_else(|| Error::CertNotFound(cert_id.to_string()))?;
            op(cert);
            Ok(())
        })
    }

    pub fn set_cert_status(&self, cert_id: &str, status: CertStatus) -> Result<(), Error> {
        self.update_cert(cert_id, |c| c.status = status)
    }

    pub fn set_cert_active(&self, cert_id: &str, active: bool) -> Result<(), Error> {
        self.update_cert(cert_id, |c| c.active = active)
    }

    pub fn set_ocsp_response(&self, cert_id: &str, ocsp: Bytes) -> Result<(), Error> {
        self.update_cert(cert_id, |c| c.ocsp_response = Some(ocsp))
    }

    pub fn add_cert_request(&self, key_id: &str, req: CertRequestInfo) -> Result<(), Error> {
        self.update_key(key_id, |k| {
            debug!("Adding certificate request '{}' to key '{}'", req.id, k.id);
            k.pending_deletion = false;
            k.cert_requests.push(req);
            Ok(())
        })
    }

    /// Removes a certificate request. A key left without certificates and
    /// requests is marked for deletion from its token.
    pub fn remove_cert_request(&self, req_id: &str) -> Result<CertRequestInfo, Error> {
        let (key_id, _) = self.cert_request(req_id)?;
        self.update_key(&key_id, |k| {
            let pos = k
                .cert_requests
                .iter()
                .position(|r| r.id == req_id)
                .ok_or_else(|| Error::CertRequestNotFound(req_id.to_string()))?;
            let req = k.cert_requests.remove(pos);
            if !k.is_bound() {
                k.pending_deletion = true;
            }
            Ok(req)
        })
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::test_under_tmp;
    use crate::signer::model::{CertRequestFormat, KeyUsage};

    fn directory(dir: &std::path::Path) -> TokenDirectory {
        let mut token = Token::software();
        token.available = true;
        TokenDirectory::new(dir.join("keyconf.json"), dir.join("tmp"), vec![token])
    }

    fn request(id: &str) -> CertRequestInfo {
        CertRequestInfo {
            id: id.to_string(),
            member_id: Some("INSTANCE/COM/1234".to_string()),
            subject_name: "CN=1234".to_string(),
            usage: KeyUsage::Signing,
            format: CertRequestFormat::Der,
        }
    }

    #[test]
    fn finds_certs_by_hash_in_any_case() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            dir.add_key("0", Key::new("K1".to_string())).unwrap();

            let cert = CertificateInfo::new(None, Bytes::from_static(b"cert"), CertStatus::Saved);
            let sha1 = cert.sha1_hash();
            let sha256 = cert.sha256_hash();
            dir.add_cert("K1", cert).unwrap();

            assert_eq!(dir.cert_for_hash(&sha1).unwrap().0, "K1");
            assert_eq!(dir.cert_for_hash(&sha256.to_lowercase()).unwrap().0, "K1");
            assert_eq!(dir.token_id_for_key("K1").unwrap(), "0");
            assert!(matches!(
                dir.cert_for_hash("00"),
                Err(Error::CertNotFound(_))
            ));
        })
    }

    #[test]
    fn removing_last_binding_marks_key_for_deletion() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            dir.add_key("0", Key::new("K1".to_string())).unwrap();
            dir.add_cert_request("K1", request("R1")).unwrap();
            let cert = CertificateInfo::new(None, Bytes::from_static(b"cert"), CertStatus::Saved);
            let cert_id = cert.id.clone();
            dir.add_cert("K1", cert).unwrap();

            dir.remove_cert(&cert_id).unwrap();
            assert!(!dir.key("K1").unwrap().pending_deletion);

            dir.remove_cert_request("R1").unwrap();
            assert!(dir.key("K1").unwrap().is_orphaned());
            assert!(matches!(
                dir.cert_request("R1"),
                Err(Error::CertRequestNotFound(_))
            ));
        })
    }

    #[test]
    fn persist_and_load() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            dir.add_key("0", Key::new("K1".to_string())).unwrap();
            dir.add_key("0", Key::new("K2".to_string())).unwrap();
            dir.add_cert_request("K1", request("R1")).unwrap();
            dir.set_token_friendly_name("0", "soft").unwrap();
            dir.persist().unwrap();

            let config = Config::test(&d);
            let loaded = TokenDirectory::load(&config).unwrap();
            let token = loaded.token("0").unwrap();
            assert_eq!(token.friendly_name.as_deref(), Some("soft"));
            assert!(!token.available);
            assert_eq!(token.keys.len(), 1);
            assert_eq!(loaded.cert_request("R1").unwrap().0, "K1");
            assert!(matches!(loaded.key("K2"), Err(Error::KeyNotFound(_))));
        })
    }

    #[test]
    fn own_snapshots_are_not_merged() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            dir.add_key("0", Key::new("K1".to_string())).unwrap();
            dir.add_cert_request("K1", request("R1")).unwrap();
            dir.persist().unwrap();

            assert!(dir.merge_changed_conf().unwrap().is_empty());
            assert!(dir.token("0").unwrap().available);
        })
    }

    #[test]
    fn changes_on_disk_are_merged() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            dir.set_token_active("0", true).unwrap();
            dir.add_key("0", Key::new("K1".to_string())).unwrap();
            dir.add_key("0", Key::new("BARE".to_string())).unwrap();
            dir.set_key_available("K1", true).unwrap();
            let known = CertificateInfo::new(None, Bytes::from_static(b"known"), CertStatus::Saved);
            let known_id = known.id.clone();
            dir.add_cert("K1", known).unwrap();
            dir.set_ocsp_response(&known_id, Bytes::from_static(b"ocsp")).unwrap();
            dir.persist().unwrap();

            // Someone else edits the file: renames K1, gives it another
            // certificate and adds a key with a request.
            let mut edited = dir.token("0").unwrap();
            edited.keys.retain(|k| k.id == "K1");
            edited.keys[0].friendly_name = Some("renamed".to_string());
            edited.keys[0].certs[0].ocsp_response = None;
            let new = CertificateInfo::new(None, Bytes::from_static(b"new"), CertStatus::Saved);
            let new_id = new.id.clone();
            edited.keys[0].certs.push(new);
            let mut k2 = Key::new("K2".to_string());
            k2.cert_requests.push(request("R2"));
            edited.keys.push(k2);
            KeyConf::snapshot([&edited])
                .save(&d.join("keyconf.json"), &d.join("tmp"))
                .unwrap();

            assert_eq!(dir.merge_changed_conf().unwrap(), vec![new_id.clone()]);
            assert!(dir.merge_changed_conf().unwrap().is_empty());

            let token = dir.token("0").unwrap();
            assert!(token.available);
            assert!(token.active);

            let k1 = dir.key("K1").unwrap();
            assert!(k1.available);
            assert_eq!(k1.friendly_name.as_deref(), Some("renamed"));
            assert_eq!(
                dir.cert(&known_id).unwrap().1.ocsp_response.as_deref(),
                Some(&b"ocsp"[..])
            );
            assert_eq!(dir.cert_for_hash(&new_id).unwrap().0, "K1");
            assert_eq!(dir.cert_request("R2").unwrap().0, "K2");
            assert!(!dir.key("K2").unwrap().available);
            assert!(dir.key("BARE").is_ok());
        })
    }

    #[test]
    fn keys_removed_on_disk_are_dropped() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            dir.add_key("0", Key::new("K1".to_string())).unwrap();
            dir.add_cert_request("K1", request("R1")).unwrap();
            dir.persist().unwrap();

            let mut edited = dir.token("0").unwrap();
            edited.keys.clear();
            KeyConf::snapshot([&edited])
                .save(&d.join("keyconf.json"), &d.join("tmp"))
                .unwrap();

            assert!(dir.merge_changed_conf().unwrap().is_empty());
            assert!(matches!(dir.key("K1"), Err(Error::KeyNotFound(_))));
            assert!(matches!(
                dir.cert_request("R1"),
                Err(Error::CertRequestNotFound(_))
            ));
        })
    }

    #[test]
    fn unknown_keys_are_not_available() {
        test_under_tmp(|d| {
            let dir = directory(&d);
            assert!(!dir.is_key_available("nope").unwrap());
            assert!(matches!(
                dir.add_key("missing", Key::new("K".to_string())),
                Err(Error::TokenNotFound(_))
            ));
        })
    }
}
