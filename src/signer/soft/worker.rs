use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use openssl::pkey::{PKey, Private};
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;
use crate::commons::util::file::FileLock;
use crate::constants::{KEY_ID_LENGTH, SOFT_TOKEN_ID, SOFT_TOKEN_LOCK_FILE};
use crate::daemon::config::Config;
use crate::signer::algorithm::SignAlgorithm;
use crate::signer::directory::TokenDirectory;
use crate::signer::model::{Key, TokenStatus};
use crate::signer::pin::{LoginGate, PinPolicy, PinStore};
use crate::signer::soft::KeyStore;

//------------ SoftTokenWorker -----------------------------------------------

/// The worker owning the software token.
pub struct SoftTokenWorker {
    token_id: String,
    directory: Arc<TokenDirectory>,
    pins: Arc<PinStore>,
    keystore: KeyStore,
    locks_dir: PathBuf,
    enforce_pin_policy: bool,
    gate: Arc<LoginGate>,

    // Decrypted keys, only while the token is active.
    private_keys: HashMap<String, PKey<Private>>,

    // Whether the PIN key store was ever seen, a store that disappears
    // makes the token unavailable rather than uninitialized.
    initialized_seen: bool,
}

impl SoftTokenWorker {
    pub fn new(config: &Config, directory: Arc<TokenDirectory>, pins: Arc<PinStore>) -> Self {
        let keystore = KeyStore::new(config.soft_token_dir(), config.tmp_dir(), config.key_length);
        let initialized_seen = keystore.is_initialized();
        SoftTokenWorker {
            token_id: SOFT_TOKEN_ID.to_string(),
            directory,
            pins,
            keystore,
            locks_dir: config.locks_dir(),
            enforce_pin_policy: config.enforce_token_pin_policy,
            gate: Arc::new(LoginGate::default()),
            private_keys: HashMap::new(),
            initialized_seen,
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn directory(&self) -> &TokenDirectory {
        &self.directory
    }

    pub fn close(&mut self) {
        self.private_keys.clear();
    }
}

/// # Token state
impl SoftTokenWorker {
    /// Reconciles the token and its keys with the key stores on disk.
    pub fn refresh(&mut self) -> Result<(), Error> {
        let initialized = self.keystore.is_initialized();
        if initialized {
            self.initialized_seen = true;
        }
        let available = initialized || !self.initialized_seen;

        if !initialized && !self.private_keys.is_empty() {
            warn!(
                "[{}] PIN key store '{}' disappeared",
                self.token_id,
                self.keystore.pin_store_path().display()
            );
            self.private_keys.clear();
            self.pins.clear(&self.token_id);
        }

        self.directory.update_token(&self.token_id, |token| {
            token.available = available;
            if !initialized {
                token.active = false;
                if available {
                    token.status = TokenStatus::NotInitialized;
                }
            } else if token.status == TokenStatus::NotInitialized {
                token.status = TokenStatus::Ok;
            }
            Ok(())
        })?;

        if initialized {
            self.delete_orphaned_keys()?;
            self.sync_keys()?;
        } else {
            self.directory.set_keys_available(&self.token_id, false)?;
        }

        self.directory.persist()
    }

    fn delete_orphaned_keys(&mut self) -> Result<(), Error> {
        let token = self.directory.token(&self.token_id)?;
        for key in token.keys.iter().filter(|k| k.is_orphaned()) {
            info!(
                "[{}] Deleting key '{}', it has no certificates or requests left",
                self.token_id, key.id
            );
            self.keystore.delete_key(&key.id)?;
            self.private_keys.remove(&key.id);
            self.directory.remove_key(&key.id)?;
        }
        Ok(())
    }

    /// Registers keys found on disk and determines key availability.
    fn sync_keys(&mut self) -> Result<(), Error> {
        let on_disk: HashSet<String> = self.keystore.key_ids()?.into_iter().collect();

        let token = self.directory.token(&self.token_id)?;
        for key_id in &on_disk {
            if token.key(key_id).is_none() {
                debug!("[{}] Found key '{}' on disk", self.token_id, key_id);
                self.directory.add_key(&self.token_id, Key::new(key_id.clone()))?;
            }
        }

        let pin = if token.active {
            self.pins.get(&self.token_id)
        } else {
            None
        };
        if !token.active {
            self.private_keys.clear();
        }

        let token = self.directory.token(&self.token_id)?;
        for key in &token.keys {
            let available = match &pin {
                Some(pin) if on_disk.contains(&key.id) => match self.private_key(&key.id, pin) {
                    Ok(pkey) => {
                        if key.public_key.is_none() {
                            self.directory
                                .set_key_public_key(&key.id, &pkey.public_key_to_der()?)?;
                        }
                        true
                    }
                    Err(e) => {
                        warn!("[{}] Cannot load key '{}': {}", self.token_id, key.id, e);
                        false
                    }
                },
                _ => false,
            };
            if !available {
                self.private_keys.remove(&key.id);
            }
            self.directory.set_key_available(&key.id, available)?;
        }
        Ok(())
    }

    pub fn activate(&mut self, pin: Option<SecretString>) -> Result<(), Error> {
        if !self.gate.is_allowed() {
            return Err(Error::LoginNotAllowed(self.token_id.clone()));
        }
        if !self.keystore.is_initialized() {
            return Err(Error::TokenNotInitialized(self.token_id.clone()));
        }

        let pin = pin
            .or_else(|| self.pins.get(&self.token_id))
            .ok_or_else(|| Error::invalid("no PIN given"))?;

        match self.keystore.verify_pin(&pin) {
            Ok(()) => {}
            Err(Error::PinIncorrect) => {
                warn!("[{}] Activation failed, PIN incorrect", self.token_id);
                self.pins.clear(&self.token_id);
                self.private_keys.clear();
                self.directory.update_token(&self.token_id, |token| {
                    token.status = TokenStatus::UserPinIncorrect;
                    token.active = false;
                    Ok(())
                })?;
                self.directory.persist()?;
                return Err(Error::PinIncorrect);
            }
            Err(e) => return Err(e),
        }

        self.pins.store(&self.token_id, &pin);
        self.directory.update_token(&self.token_id, |token| {
            token.status = TokenStatus::Ok;
            token.active = true;
            Ok(())
        })?;
        info!("[{}] Token activated", self.token_id);
        self.refresh()
    }

    pub fn deactivate(&mut self) -> Result<(), Error> {
        self.private_keys.clear();
        self.pins.clear(&self.token_id);
        self.directory.set_token_active(&self.token_id, false)?;
        self.directory.set_keys_available(&self.token_id, false)?;
        self.directory.persist()?;
        info!("[{}] Token deactivated", self.token_id);
        Ok(())
    }

    pub fn initialize(&mut self, pin: SecretString) -> Result<(), Error> {
        if self.keystore.is_initialized() {
            return Err(Error::TokenAlreadyInitialized(self.token_id.clone()));
        }
        PinPolicy::check(&pin, self.enforce_pin_policy)?;

        let mut lock = FileLock::create(&self.locks_dir, SOFT_TOKEN_LOCK_FILE)?;
        let _locked = lock.write()?;

        self.keystore.initialize(&pin)?;
        self.initialized_seen = true;

        self.directory.update_token(&self.token_id, |token| {
            token.status = TokenStatus::Ok;
            token.available = true;
            token.active = false;
            Ok(())
        })?;
        self.directory.persist()?;
        info!("[{}] Software token initialized", self.token_id);
        Ok(())
    }

    /// Changes the PIN, re-encrypting all key stores.
    ///
    /// The token is inactive afterwards, activation is refused while the
    /// key stores are rewritten.
    pub fn update_pin(&mut self, old: SecretString, new: SecretString) -> Result<(), Error> {
        if !self.keystore.is_initialized() {
            return Err(Error::TokenNotInitialized(self.token_id.clone()));
        }
        let held_differs = self
            .pins
            .get(&self.token_id)
            .is_some_and(|held| held.expose_secret() != old.expose_secret());
        let old_pin_ok = match self.keystore.verify_pin(&old) {
            Ok(()) => !held_differs,
            Err(Error::PinIncorrect) => false,
            Err(e) => return Err(e),
        };
        if !old_pin_ok {
            warn!("[{}] PIN change refused, old PIN incorrect", self.token_id);
            self.directory.update_token(&self.token_id, |token| {
                token.status = TokenStatus::UserPinIncorrect;
                Ok(())
            })?;
            self.directory.persist()?;
            return Err(Error::PinIncorrect);
        }
        PinPolicy::check(&new, self.enforce_pin_policy)?;

        let gate = self.gate.clone();
        let _closed = gate.close();

        let mut lock = FileLock::create(&self.locks_dir, SOFT_TOKEN_LOCK_FILE)?;
        let _locked = lock.write()?;

        info!("[{}] Changing software token PIN", self.token_id);
        self.deactivate()?;
        self.keystore.change_pin(&old, &new)
    }
}

/// # Keys
impl SoftTokenWorker {
    fn active_pin(&self) -> Result<SecretString, Error> {
        let token = self.directory.token(&self.token_id)?;
        if !token.active {
            return Err(Error::TokenNotActive(self.token_id.clone()));
        }
        self.pins
            .get(&self.token_id)
            .ok_or_else(|| Error::TokenNotActive(self.token_id.clone()))
    }

    fn private_key(&mut self, key_id: &str, pin: &SecretString) -> Result<PKey<Private>, Error> {
        if let Some(pkey) = self.private_keys.get(key_id) {
            return Ok(pkey.clone());
        }
        let pkey = self.keystore.load_private_key(key_id, pin)?;
        self.private_keys.insert(key_id.to_string(), pkey.clone());
        Ok(pkey)
    }

    pub fn generate_key(&mut self, label: Option<String>) -> Result<Key, Error> {
        let pin = self.active_pin()?;

        let key_id = hex::encode_upper(rand::random::<[u8; KEY_ID_LENGTH]>());
        let pkey = self.keystore.generate_key(&key_id, &pin)?;

        let mut key = Key::new(key_id.clone());
        key.label = label;
        key.available = true;
        key.set_public_key_der(&pkey.public_key_to_der()?);

        self.private_keys.insert(key_id.clone(), pkey);
        self.directory.add_key(&self.token_id, key.clone())?;
        self.directory.persist()?;
        info!("[{}] Generated key '{}'", self.token_id, key_id);
        Ok(key)
    }

    pub fn delete_key(&mut self, key_id: &str) -> Result<(), Error> {
        // fails for unknown keys before touching the disk
        self.directory.key(key_id)?;
        if !self.keystore.delete_key(key_id)? {
            warn!("[{}] Key '{}' had no key store", self.token_id, key_id);
        }
        self.private_keys.remove(key_id);
        self.directory.remove_key(key_id)?;
        self.directory.persist()?;
        info!("[{}] Deleted key '{}'", self.token_id, key_id);
        Ok(())
    }

    /// Signs the digest with the mechanism configured for the key.
    pub fn sign(&mut self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]) -> Result<Bytes, Error> {
        let key = self.directory.key(key_id)?;
        let input = algorithm.prepare(&key.sign_mechanism_name, digest)?;

        let pin = self.active_pin()?;
        if !key.available {
            return Err(Error::KeyNotAvailable(key_id.to_string()));
        }

        let pkey = self.private_key(key_id, &pin)?;
        Ok(input.sign_with(&pkey)?)
    }
}

//------------ Tests ---------------------------------------------------------
