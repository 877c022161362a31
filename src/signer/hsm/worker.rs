use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use secrecy::SecretString;

use crate::commons::error::Error;
use crate::constants::KEY_ID_LENGTH;
use crate::signer::algorithm::SignAlgorithm;
use crate::signer::directory::TokenDirectory;
use crate::signer::hsm::{HsmError, HsmKeyHandle, HsmModule, HsmSession, HsmTokenInfo};
use crate::signer::model::{CertStatus, CertificateInfo, Key, TokenStatus, sha1_hex};
use crate::signer::pin::PinStore;
use crate::signer::x509::ParsedCert;

//------------ HsmTokenWorker ------------------------------------------------

/// The worker owning one token in a slot of a hardware module.
///
/// The session and the resolved key handles live here only. A device fault
/// drops both, the next command opens a fresh session.
pub struct HsmTokenWorker {
    token_id: String,
    module: Arc<HsmModule>,
    info: HsmTokenInfo,
    directory: Arc<TokenDirectory>,
    pins: Arc<PinStore>,
    key_length: u32,

    session: Option<HsmSession>,
    key_handles: HashMap<String, HsmKeyHandle>,
}

impl HsmTokenWorker {
    pub fn new(
        module: Arc<HsmModule>,
        info: &HsmTokenInfo,
        directory: Arc<TokenDirectory>,
        pins: Arc<PinStore>,
        key_length: u32,
    ) -> Self {
        HsmTokenWorker {
            token_id: module.token_id(info),
            info: info.clone(),
            module,
            directory,
            pins,
            key_length,
            session: None,
            key_handles: HashMap::new(),
        }
    }

    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn directory(&self) -> &TokenDirectory {
        &self.directory
    }

    /// Logs in again with a PIN remembered from before a restart.
    pub fn start(&mut self) {
        if let Some(pin) = self.pins.get(&self.token_id) {
            if let Err(e) = self.activate(Some(pin)) {
                warn!("[{}] Cannot log in again: {}", self.token_id, e);
            }
        }
    }

    pub fn close(&mut self) {
        self.key_handles.clear();
        self.session = None;
    }
}

/// # Device access
impl HsmTokenWorker {
    fn session(&mut self) -> Result<&HsmSession, HsmError> {
        if self.session.is_none() {
            let session = match self.module.open_session(self.info.slot_index) {
                Ok(session) => session,
                Err(e) => return Err(self.fault(e)),
            };
            self.session = Some(session);
            debug!("[{}] Opened session", self.token_id);
        }
        self.session
            .as_ref()
            .ok_or_else(|| HsmError::Failed("no session".to_string()))
    }

    fn fault(&mut self, err: HsmError) -> HsmError {
        if err.is_device_fault() {
            warn!("[{}] Dropping session after {}", self.token_id, err);
            self.key_handles.clear();
            self.session = None;
        }
        err
    }

    fn call<T>(&mut self, op: impl FnOnce(&HsmSession) -> Result<T, HsmError>) -> Result<T, HsmError> {
        let res = op(self.session()?);
        res.map_err(|e| self.fault(e))
    }

    fn device<T>(&mut self, op: impl FnOnce(&HsmSession) -> Result<T, HsmError>) -> Result<T, Error> {
        self.call(op).map_err(Error::from)
    }
}

/// # Token state
impl HsmTokenWorker {
    /// Reconciles the token, its keys and certificates with the device.
    pub fn refresh(&mut self) -> Result<(), Error> {
        if let Err(e) = self.call(|_| Ok(())) {
            warn!("[{}] Token not available: {}", self.token_id, e);
            self.set_unavailable()?;
            return Err(e.into());
        }

        let info = &self.info;
        let batch_signing_enabled = self.module.conf().batch_signing_enabled;
        let token = self.directory.update_token(&self.token_id, |token| {
            token.available = true;
            token.read_only = info.write_protected;
            token.slot_index = Some(info.slot_index);
            token.serial_number = Some(info.serial_number.clone());
            token.label = Some(info.label.clone());
            token.batch_signing_enabled = batch_signing_enabled;
            Ok(token.clone())
        })?;

        if token.active {
            if !self.info.write_protected {
                self.delete_orphaned_keys()?;
            }
            self.sync_keys()?;
            self.sync_certs()?;
        } else {
            self.key_handles.clear();
            self.directory.set_keys_available(&self.token_id, false)?;
        }
        self.directory.persist()
    }

    fn set_unavailable(&mut self) -> Result<(), Error> {
        self.key_handles.clear();
        self.directory.set_token_available(&self.token_id, false)?;
        self.directory.set_keys_available(&self.token_id, false)?;
        self.directory.persist()
    }

    fn delete_orphaned_keys(&mut self) -> Result<(), Error> {
        let token = self.directory.token(&self.token_id)?;
        for key in token.keys.iter().filter(|k| k.is_orphaned()) {
            info!(
                "[{}] Deleting key '{}', it has no certificates or requests left",
                self.token_id, key.id
            );
            let id = decode_key_id(&key.id)?;
            self.device(|s| s.destroy_key(&id))?;
            self.key_handles.remove(&key.id);
            self.directory.remove_key(&key.id)?;
        }
        Ok(())
    }

    /// Registers keys found on the device and determines key availability.
    fn sync_keys(&mut self) -> Result<(), Error> {
        let objects = self.device(|s| s.private_keys())?;
        let mechanism = self.module.conf().sign_mechanism.clone();

        let mut present = HashSet::new();
        for object in objects {
            let key_id = hex::encode_upper(&object.id);
            present.insert(key_id.clone());

            match self.directory.token_id_for_key(&key_id) {
                Ok(token_id) if token_id != self.token_id => {
                    warn!(
                        "[{}] Ignoring key '{}', it is known on token '{}'",
                        self.token_id, key_id, token_id
                    );
                    continue;
                }
                Ok(_) => {}
                Err(_) => {
                    debug!("[{}] Found key '{}' on device", self.token_id, key_id);
                    let mut key = Key::new(key_id.clone());
                    key.label = object.label.clone();
                    key.sign_mechanism_name = mechanism.clone();
                    self.directory.add_key(&self.token_id, key)?;
                }
            }

            if self.directory.key(&key_id)?.public_key.is_none() {
                if let Some(der) = self.device(|s| s.public_key(&object.id))? {
                    self.directory.set_key_public_key(&key_id, &der)?;
                }
            }
            self.directory.set_key_available(&key_id, true)?;
        }

        let token = self.directory.token(&self.token_id)?;
        for key in token.keys.iter().filter(|k| !present.contains(&k.id)) {
            if key.available {
                debug!("[{}] Key '{}' is gone from the device", self.token_id, key.id);
            }
            self.key_handles.remove(&key.id);
            self.directory.set_key_available(&key.id, false)?;
        }
        Ok(())
    }

    /// Attaches certificates stored on the device to their keys. These are
    /// not saved to the configuration.
    fn sync_certs(&mut self) -> Result<(), Error> {
        let objects = self.device(|s| s.certificates())?;
        for object in objects {
            let cert_id = sha1_hex(&object.value);
            if self.directory.cert(&cert_id).is_ok() {
                continue;
            }

            let public_key = match ParsedCert::from_bytes(&object.value)
                .and_then(|cert| cert.public_key_base64())
            {
                Ok(public_key) => public_key,
                Err(e) => {
                    warn!("[{}] Skipping unreadable device certificate: {}", self.token_id, e);
                    continue;
                }
            };

            let key = self.directory.key_for_public_key(&public_key)?.filter(|key| {
                self.directory
                    .token_id_for_key(&key.id)
                    .map(|token_id| token_id == self.token_id)
                    .unwrap_or(false)
            });
            match key {
                Some(key) => {
                    let mut cert = CertificateInfo::new(None, object.value, CertStatus::Registered);
                    cert.saved_to_configuration = false;
                    cert.active = true;
                    debug!(
                        "[{}] Found certificate '{}' for key '{}' on device",
                        self.token_id, cert.id, key.id
                    );
                    self.directory.add_cert(&key.id, cert)?;
                }
                None => debug!(
                    "[{}] No key for device certificate '{}'",
                    self.token_id, cert_id
                ),
            }
        }
        Ok(())
    }

    pub fn activate(&mut self, pin: Option<SecretString>) -> Result<(), Error> {
        let pin = pin
            .or_else(|| self.pins.get(&self.token_id))
            .ok_or_else(|| Error::invalid("no PIN given"))?;

        match self.call(|s| s.login(&pin)) {
            Ok(()) => {
                self.pins.store(&self.token_id, &pin);
                self.directory.update_token(&self.token_id, |token| {
                    token.status = TokenStatus::Ok;
                    token.active = true;
                    Ok(())
                })?;
                info!("[{}] Token activated", self.token_id);
                self.refresh()
            }
            Err(HsmError::Pin(status)) => {
                warn!("[{}] Activation failed: {}", self.token_id, status);
                self.pins.clear(&self.token_id);
                self.directory.update_token(&self.token_id, |token| {
                    token.status = status;
                    token.active = false;
                    Ok(())
                })?;
                self.directory.persist()?;
                Err(Error::PinIncorrect)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn deactivate(&mut self) -> Result<(), Error> {
        if self.session.is_some() {
            if let Err(e) = self.call(|s| s.logout()) {
                warn!("[{}] Logout failed: {}", self.token_id, e);
            }
        }
        self.key_handles.clear();
        self.pins.clear(&self.token_id);
        self.directory.set_token_active(&self.token_id, false)?;
        self.directory.set_keys_available(&self.token_id, false)?;
        self.directory.persist()?;
        info!("[{}] Token deactivated", self.token_id);
        Ok(())
    }
}

/// # Keys
impl HsmTokenWorker {
    fn check_active(&self) -> Result<(), Error> {
        if self.directory.token(&self.token_id)?.active {
            Ok(())
        } else {
            Err(Error::TokenNotActive(self.token_id.clone()))
        }
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.info.write_protected {
            Err(Error::TokenReadOnly(self.token_id.clone()))
        } else {
            Ok(())
        }
    }

    pub fn generate_key(&mut self, label: Option<String>) -> Result<Key, Error> {
        self.check_active()?;
        self.check_writable()?;

        let id = rand::random::<[u8; KEY_ID_LENGTH]>();
        let bits = self.key_length;
        let spki = self.device(|s| s.generate_key_pair(&id, label.as_deref(), bits))?;

        let mut key = Key::new(hex::encode_upper(id));
        key.label = label;
        key.available = true;
        key.sign_mechanism_name = self.module.conf().sign_mechanism.clone();
        key.set_public_key_der(&spki);

        self.directory.add_key(&self.token_id, key.clone())?;
        self.directory.persist()?;
        info!("[{}] Generated key '{}'", self.token_id, key.id);
        Ok(key)
    }

    pub fn delete_key(&mut self, key_id: &str) -> Result<(), Error> {
        self.directory.key(key_id)?;
        self.check_writable()?;
        self.check_active()?;

        let id = decode_key_id(key_id)?;
        self.device(|s| s.destroy_key(&id))?;
        self.key_handles.remove(key_id);
        self.directory.remove_key(key_id)?;
        self.directory.persist()?;
        info!("[{}] Deleted key '{}'", self.token_id, key_id);
        Ok(())
    }

    fn key_handle(&mut self, key_id: &str) -> Result<HsmKeyHandle, Error> {
        if let Some(handle) = self.key_handles.get(key_id) {
            return Ok(handle.clone());
        }
        let id = decode_key_id(key_id)?;
        let handle = self
            .device(|s| s.find_private_key(&id))?
            .ok_or_else(|| Error::KeyNotAvailable(key_id.to_string()))?;
        self.key_handles.insert(key_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Signs the digest on the device.
    pub fn sign(&mut self, key_id: &str, algorithm: SignAlgorithm, digest: &[u8]) -> Result<Bytes, Error> {
        let key = self.directory.key(key_id)?;
        let input = algorithm.prepare(&key.sign_mechanism_name, digest)?;

        self.check_active()?;
        if !key.available {
            return Err(Error::KeyNotAvailable(key_id.to_string()));
        }

        let handle = self.key_handle(key_id)?;
        self.device(|s| s.sign(&handle, &input))
    }
}

fn decode_key_id(key_id: &str) -> Result<Vec<u8>, Error> {
    hex::decode(key_id).map_err(|e| Error::invalid(format!("invalid key id '{}': {}", key_id, e)))
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chrono::{Duration, Utc};
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Padding;
    use openssl::sign::{RsaPssSaltlen, Verifier};

    use super::*;
    use crate::commons::test::{GOOD_PIN, OTHER_PIN, test_under_tmp};
    use crate::signer::algorithm::DigestAlgorithm;
    use crate::signer::hsm::mock::{FnIdx, MockModule};
    use crate::signer::model::{KeyUsage, Token, TokenState};
    use crate::signer::x509::{Name, TbsCertificate};

    fn pin(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    fn setup(d: &Path, write_protected: bool) -> (MockModule, HsmTokenWorker) {
        setup_module(d, MockModule::new("mockhsm"), write_protected)
    }

    fn setup_module(d: &Path, mock: MockModule, write_protected: bool) -> (MockModule, HsmTokenWorker) {
        mock.set_pin(GOOD_PIN);
        let slot = mock.add_token("1234", "signing", write_protected);

        let module = Arc::new(HsmModule::Mock(mock.clone()));
        let info = module.tokens().unwrap().remove(slot);
        let token = Token::hardware(module.token_id(&info), module.name());
        let directory = Arc::new(TokenDirectory::new(
            d.join("keyconf.json"),
            d.join("tmp"),
            vec![token],
        ));
        let worker = HsmTokenWorker::new(module, &info, directory, Arc::new(PinStore::new()), 2048);
        (mock, worker)
    }

    fn state(worker: &HsmTokenWorker) -> TokenState {
        worker.directory.token(&worker.token_id).unwrap().state()
    }

    #[test]
    fn activate_discovers_device_keys() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, false);
            mock.add_key(0, &[0xAB, 0x01], Some("existing"));

            worker.refresh().unwrap();
            assert_eq!(worker.token_id(), "mockhsm-0-1234-signing");
            assert_eq!(state(&worker), TokenState::Inactive);

            worker.activate(Some(pin(GOOD_PIN))).unwrap();
            assert_eq!(state(&worker), TokenState::Active);

            let key = worker.directory.key("AB01").unwrap();
            assert!(key.available);
            assert_eq!(key.label.as_deref(), Some("existing"));
            assert!(key.public_key.is_some());

            worker.deactivate().unwrap();
            assert!(!worker.directory.key("AB01").unwrap().available);
            assert!(!worker.pins.contains(&worker.token_id));
        })
    }

    #[test]
    fn wrong_pin_sets_status() {
        test_under_tmp(|d| {
            let (_mock, mut worker) = setup(&d, false);
            worker.refresh().unwrap();
            assert!(matches!(
                worker.activate(Some(pin(OTHER_PIN))),
                Err(Error::PinIncorrect)
            ));
            let token = worker.directory.token(&worker.token_id).unwrap();
            assert_eq!(token.status, TokenStatus::UserPinIncorrect);
            assert_eq!(token.state(), TokenState::PinIncorrect);

            worker.activate(Some(pin(GOOD_PIN))).unwrap();
            assert_eq!(state(&worker), TokenState::Active);
        })
    }

    #[test]
    fn generate_sign_and_delete() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, false);
            worker.activate(Some(pin(GOOD_PIN))).unwrap();

            let key = worker.generate_key(Some("new".to_string())).unwrap();
            let id = hex::decode(&key.id).unwrap();
            assert!(mock.has_key(0, &id));

            let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();
            let alg = SignAlgorithm::rsa(DigestAlgorithm::Sha256);
            let signature = worker.sign(&key.id, alg, &digest).unwrap();
            worker.sign(&key.id, alg, &digest).unwrap();
            assert_eq!(mock.calls(FnIdx::FindPrivateKey), 1);

            let der = key.public_key_der().unwrap().unwrap();
            let pkey = PKey::public_key_from_der(&der).unwrap();
            let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey).unwrap();
            verifier.update(b"data").unwrap();
            assert!(verifier.verify(&signature).unwrap());

            worker.delete_key(&key.id).unwrap();
            assert!(!mock.has_key(0, &id));
            assert!(matches!(worker.directory.key(&key.id), Err(Error::KeyNotFound(_))));
        })
    }

    #[test]
    fn read_only_token_refuses_key_changes() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, true);
            mock.add_key(0, &[0x01], None);
            worker.activate(Some(pin(GOOD_PIN))).unwrap();

            assert!(matches!(
                worker.generate_key(None),
                Err(Error::TokenReadOnly(_))
            ));
            assert!(matches!(
                worker.delete_key("01"),
                Err(Error::TokenReadOnly(_))
            ));
            assert_eq!(mock.calls(FnIdx::GenerateKeyPair), 0);
            assert!(mock.has_key(0, &[0x01]));
        })
    }

    #[test]
    fn unsupported_algorithm_never_reaches_device() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, false);
            mock.add_key(0, &[0x02], None);
            worker.activate(Some(pin(GOOD_PIN))).unwrap();

            let alg = "SHA256withRSAandMGF1".parse::<SignAlgorithm>().unwrap();
            let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();
            assert!(matches!(
                worker.sign("02", alg, &digest),
                Err(Error::UnsupportedAlgorithm(_))
            ));
            assert_eq!(mock.calls(FnIdx::FindPrivateKey), 0);
            assert_eq!(mock.calls(FnIdx::Sign), 0);
        })
    }

    #[test]
    fn pss_module_signs_with_pss() {
        test_under_tmp(|d| {
            let mock = MockModule::new("mockhsm").with_sign_mechanism("CKM_RSA_PKCS_PSS");
            let (mock, mut worker) = setup_module(&d, mock, false);
            let pkey = mock.add_key(0, &[0x04], None);
            worker.activate(Some(pin(GOOD_PIN))).unwrap();
            assert_eq!(
                worker.directory.key("04").unwrap().sign_mechanism_name,
                "CKM_RSA_PKCS_PSS"
            );

            let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();
            let pkcs1 = SignAlgorithm::rsa(DigestAlgorithm::Sha256);
            assert!(matches!(
                worker.sign("04", pkcs1, &digest),
                Err(Error::UnsupportedAlgorithm(_))
            ));

            let pss = "SHA256withRSAandMGF1".parse::<SignAlgorithm>().unwrap();
            let signature = worker.sign("04", pss, &digest).unwrap();

            let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey).unwrap();
            verifier.set_rsa_padding(Padding::PKCS1_PSS).unwrap();
            verifier.set_rsa_mgf1_md(MessageDigest::sha256()).unwrap();
            verifier.set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH).unwrap();
            verifier.update(b"data").unwrap();
            assert!(verifier.verify(&signature).unwrap());
        })
    }

    #[test]
    fn device_fault_drops_session() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, false);
            mock.add_key(0, &[0x03], None);
            worker.activate(Some(pin(GOOD_PIN))).unwrap();

            let alg = SignAlgorithm::rsa(DigestAlgorithm::Sha256);
            let digest = DigestAlgorithm::Sha256.digest(b"data").unwrap();
            mock.fail_next_sign();
            let err = worker.sign("03", alg, &digest).unwrap_err();
            assert!(err.is_device_fault());
            assert!(worker.session.is_none());
            assert!(worker.key_handles.is_empty());

            mock.reload().unwrap();
            worker.start();
            worker.sign("03", alg, &digest).unwrap();
        })
    }

    #[test]
    fn orphaned_keys_are_deleted_from_device() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, false);
            mock.add_key(0, &[0x04], None);
            worker.activate(Some(pin(GOOD_PIN))).unwrap();

            worker
                .directory
                .update_key("04", |key| {
                    key.pending_deletion = true;
                    Ok(())
                })
                .unwrap();
            worker.refresh().unwrap();

            assert!(!mock.has_key(0, &[0x04]));
            assert!(worker.directory.key("04").is_err());
            assert_eq!(mock.calls(FnIdx::DestroyKey), 1);
        })
    }

    #[test]
    fn device_certificates_are_attached() {
        test_under_tmp(|d| {
            let (mock, mut worker) = setup(&d, false);
            let pkey = mock.add_key(0, &[0x05], None);

            let now = Utc::now();
            let tbs = TbsCertificate::new(
                1,
                &Name::common_name("device").unwrap(),
                now,
                now + Duration::days(365),
                &pkey.public_key_to_der().unwrap(),
                KeyUsage::Signing,
                SignAlgorithm::rsa(DigestAlgorithm::Sha256),
            )
            .unwrap();
            let mut signer =
                openssl::sign::Signer::new(MessageDigest::sha256(), &pkey).unwrap();
            signer.update(tbs.to_be_signed()).unwrap();
            let cert = tbs.into_certificate(Bytes::from(signer.sign_to_vec().unwrap()));
            mock.add_cert(0, &[0x05], cert.clone());

            worker.activate(Some(pin(GOOD_PIN))).unwrap();

            let (key_id, info) = worker.directory.cert(&sha1_hex(&cert)).unwrap();
            assert_eq!(key_id, "05");
            assert!(!info.saved_to_configuration);
            assert!(info.active);
            assert_eq!(info.status, CertStatus::Registered);

            // a second pass does not duplicate it
            worker.refresh().unwrap();
            assert_eq!(worker.directory.key("05").unwrap().certs.len(), 1);
        })
    }
}
