//! The dispatcher: routes requests to the worker owning a token, and
//! recovers hardware modules after device faults.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use openssl::x509::X509;
use secrecy::SecretString;
use tokio::sync::RwLock;

use crate::commons::error::Error;
use crate::constants::SOFT_TOKEN_ID;
use crate::daemon::config::Config;
use crate::signer::algorithm::SignAlgorithm;
use crate::signer::directory::TokenDirectory;
use crate::signer::model::{
    AuthKeyInfo, CertRequestFormat, CertRequestInfo, CertStatus, CertificateInfo,
    GeneratedCertRequest, Key, KeyUsage, SecurityServerId, Token, sha1_hex,
};
use crate::signer::pin::PinStore;
use crate::signer::soft::{KeyStore, SoftTokenWorker};
use crate::signer::verify::CertVerifier;
use crate::signer::worker::{TokenWorker, WorkerClient, WorkerHandle};
use crate::signer::x509::{Name, ParsedCert, TbsCertRequest, TbsCertificate};

#[cfg(feature = "hsm")]
use std::collections::HashSet;

#[cfg(feature = "hsm")]
use crate::signer::hsm::{HsmModule, HsmTokenInfo, HsmTokenWorker, Pkcs11Module};

#[cfg(feature = "hsm")]
use crate::signer::tokenconf::KeyConf;

//------------ Workers -------------------------------------------------------

#[derive(Debug, Default)]
struct Workers {
    handles: HashMap<String, WorkerHandle>,

    /// module name -> number of reloads
    generations: HashMap<String, u64>,
}

impl Workers {
    fn client(&self, token_id: &str) -> Result<WorkerClient, Error> {
        self.handles
            .get(token_id)
            .map(WorkerHandle::client)
            .ok_or_else(|| Error::TokenNotFound(token_id.to_string()))
    }

    fn clients(&self) -> Vec<WorkerClient> {
        self.handles.values().map(WorkerHandle::client).collect()
    }

    fn generation(&self, module: &str) -> u64 {
        self.generations.get(module).copied().unwrap_or(0)
    }

    #[cfg(feature = "hsm")]
    fn module_token_ids(&self, module: &str) -> Vec<String> {
        self.handles
            .values()
            .filter(|handle| handle.module() == Some(module))
            .map(|handle| handle.token_id().to_string())
            .collect()
    }

    #[cfg(feature = "hsm")]
    async fn stop(&mut self, token_id: &str) {
        if let Some(handle) = self.handles.remove(token_id) {
            handle.stop().await;
        }
    }
}

//------------ TokenManager --------------------------------------------------

/// Accepts all token, key and certificate commands.
///
/// Lookups are answered from the Token Directory. Everything that touches
/// a token goes to the worker owning it, so commands for one token run one
/// at a time in the order they arrived.
pub struct TokenManager {
    config: Arc<Config>,
    directory: Arc<TokenDirectory>,
    pins: Arc<PinStore>,
    verifier: Arc<dyn CertVerifier>,
    workers: RwLock<Workers>,

    #[cfg(feature = "hsm")]
    modules: Vec<Arc<HsmModule>>,
}

/// # Set up and tear down
impl TokenManager {
    /// Loads the Token Directory and starts the software token worker.
    ///
    /// Hardware tokens are picked up by the first [`TokenManager::refresh`].
    pub fn build(config: Arc<Config>, verifier: Arc<dyn CertVerifier>) -> Result<Self, Error> {
        let manager = Self::create(config, verifier)?;

        #[cfg(feature = "hsm")]
        let manager = {
            let modules = manager
                .config
                .hsm_modules
                .iter()
                .map(|conf| Arc::new(HsmModule::Pkcs11(Pkcs11Module::new(conf.clone()))))
                .collect();
            TokenManager { modules, ..manager }
        };

        Ok(manager)
    }

    #[cfg(all(test, feature = "hsm"))]
    pub fn with_modules(
        config: Arc<Config>,
        verifier: Arc<dyn CertVerifier>,
        modules: Vec<HsmModule>,
    ) -> Result<Self, Error> {
        let manager = Self::create(config, verifier)?;
        Ok(TokenManager {
            modules: modules.into_iter().map(Arc::new).collect(),
            ..manager
        })
    }

    fn create(config: Arc<Config>, verifier: Arc<dyn CertVerifier>) -> Result<Self, Error> {
        let directory = Arc::new(TokenDirectory::load(&config)?);
        directory.add_token(Token::software())?;
        let pins = Arc::new(PinStore::new());

        let soft = SoftTokenWorker::new(&config, directory.clone(), pins.clone());
        let mut workers = Workers::default();
        workers.handles.insert(
            SOFT_TOKEN_ID.to_string(),
            WorkerHandle::spawn(TokenWorker::Software(soft), None)?,
        );

        Ok(TokenManager {
            config,
            directory,
            pins,
            verifier,
            workers: RwLock::new(workers),
            #[cfg(feature = "hsm")]
            modules: vec![],
        })
    }

    /// The reconciliation tick.
    ///
    /// Merges changes made to the key configuration on disk, picks up
    /// tokens that appeared in or disappeared from the hardware modules,
    /// then refreshes every token. A module whose tokens report a device
    /// fault is reloaded once. Certificates added by the merge get their
    /// OCSP responses last, once their tokens have workers.
    pub async fn refresh(&self) -> Result<(), Error> {
        let merged = self.directory.merge_changed_conf().unwrap_or_else(|e| {
            warn!("Cannot merge the key configuration from disk: {}", e);
            vec![]
        });
        self.directory.add_token(Token::software())?;

        #[cfg(feature = "hsm")]
        for module in &self.modules {
            let res = match module_tokens(module).await {
                Ok(infos) => {
                    let mut workers = self.workers.write().await;
                    self.sync_module(module, infos, &mut workers).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = res {
                warn!("[{}] Cannot list tokens: {}", module.name(), e);
                if e.is_device_fault() {
                    self.reload_module(module.name(), None).await;
                }
            }
        }

        let clients = self.workers.read().await.clients();
        let results = join_all(clients.iter().map(|client| client.refresh())).await;

        #[cfg(feature = "hsm")]
        let mut faulted: Vec<String> = vec![];
        for (client, res) in clients.iter().zip(results) {
            if let Err(e) = res {
                warn!("[{}] Refresh failed: {}", client.token_id(), e);
                #[cfg(feature = "hsm")]
                if let Some(module) = client.module().filter(|_| e.is_device_fault()) {
                    if !faulted.iter().any(|m| m == module) {
                        faulted.push(module.to_string());
                    }
                }
            }
        }
        #[cfg(feature = "hsm")]
        for module in faulted {
            self.reload_module(&module, None).await;
        }

        for cert_id in merged {
            match self
                .directory
                .cert(&cert_id)
                .and_then(|(_, info)| ParsedCert::from_bytes(&info.bytes))
            {
                Ok(cert) => self.fetch_ocsp(&cert_id, cert.x509()).await,
                Err(e) => warn!("Cannot read merged certificate '{}': {}", cert_id, e),
            }
        }
        Ok(())
    }

    /// Stops all workers after they finished their pending commands.
    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.write().await;
            workers.handles.drain().map(|(_, handle)| handle).collect()
        };
        join_all(handles.into_iter().map(WorkerHandle::stop)).await;
        info!("All token workers stopped");
    }
}

/// # Hardware modules
#[cfg(feature = "hsm")]
impl TokenManager {
    /// Starts workers for new tokens of a module and stops those of tokens
    /// that are gone.
    async fn sync_module(
        &self,
        module: &Arc<HsmModule>,
        infos: Vec<HsmTokenInfo>,
        workers: &mut Workers,
    ) -> Result<(), Error> {
        let name = module.name();

        let mut present = HashSet::new();
        for info in infos {
            let token_id = module.token_id(&info);
            present.insert(token_id.clone());

            let known_slot = self.directory.token(&token_id).ok().and_then(|t| t.slot_index);
            if workers.handles.contains_key(&token_id) {
                if known_slot == Some(info.slot_index) {
                    continue;
                }
                debug!("[{}] Token moved to slot {}", token_id, info.slot_index);
                workers.stop(&token_id).await;
            }

            let mut token = Token::hardware(token_id.clone(), name);
            token.slot_index = Some(info.slot_index);
            token.serial_number = Some(info.serial_number.clone());
            token.label = Some(info.label.clone());
            token.read_only = info.write_protected;
            token.batch_signing_enabled = module.conf().batch_signing_enabled;
            if self.directory.add_token(token)? {
                info!("[{}] Found token in slot {} of module '{}'", token_id, info.slot_index, name);
            } else {
                let slot_index = info.slot_index;
                self.directory.update_token(&token_id, |token| {
                    token.slot_index = Some(slot_index);
                    Ok(())
                })?;
            }

            let worker = HsmTokenWorker::new(
                module.clone(),
                &info,
                self.directory.clone(),
                self.pins.clone(),
                self.config.key_length,
            );
            let handle = WorkerHandle::spawn(TokenWorker::Hardware(worker), Some(name))?;
            workers.handles.insert(token_id, handle);
        }

        for token_id in workers.module_token_ids(name) {
            if !present.contains(&token_id) {
                info!("[{}] Token is gone from module '{}'", token_id, name);
                workers.stop(&token_id).await;
            }
        }

        // A missing token is kept, unavailable, while the key configuration
        // holds something of it.
        for token in self.directory.tokens()? {
            if token.is_software() || token.module_type != name || present.contains(&token.id) {
                continue;
            }
            if !token.keys.iter().any(KeyConf::persists) {
                info!("[{}] Removing token, no certificates or requests left", token.id);
                self.directory.remove_token(&token.id)?;
            } else if token.available {
                self.directory.set_token_available(&token.id, false)?;
                self.directory.set_keys_available(&token.id, false)?;
            }
        }
        self.directory.persist()
    }

    /// Stops the workers of a module, reloads the library and starts fresh
    /// workers for the tokens found.
    ///
    /// With `seen` the reload only happens if no other reload happened
    /// since that generation of the module was observed.
    async fn reload_module(&self, name: &str, seen: Option<u64>) {
        let module = match self.modules.iter().find(|m| m.name() == name) {
            Some(module) => module.clone(),
            None => return,
        };

        let clients = {
            let mut workers = self.workers.write().await;
            if seen.is_some_and(|seen| seen != workers.generation(name)) {
                debug!("[{}] Module was reloaded already", name);
                return;
            }

            warn!("[{}] Reloading module after a device fault", name);
            for token_id in workers.module_token_ids(name) {
                workers.stop(&token_id).await;
            }

            let reloading = module.clone();
            match tokio::task::spawn_blocking(move || reloading.reload()).await {
                Ok(Ok(())) => info!("[{}] Module reloaded", name),
                Ok(Err(e)) => error!("[{}] Cannot reload module: {}", name, e),
                Err(e) => error!("[{}] Cannot reload module: {}", name, e),
            }
            *workers.generations.entry(name.to_string()).or_default() += 1;

            let synced = match module_tokens(&module).await {
                Ok(infos) => self.sync_module(&module, infos, &mut workers).await,
                Err(e) => Err(e),
            };
            if let Err(e) = synced {
                error!("[{}] Cannot list tokens after reload: {}", name, e);
            }
            workers
                .handles
                .values()
                .filter(|handle| handle.module() == Some(name))
                .map(WorkerHandle::client)
                .collect::<Vec<_>>()
        };

        for client in clients {
            if let Err(e) = client.refresh().await {
                warn!("[{}] Refresh after reload failed: {}", client.token_id(), e);
            }
        }
    }
}

/// Lists the tokens of a module off the async runtime, loading the library
/// may take a while.
#[cfg(feature = "hsm")]
async fn module_tokens(module: &Arc<HsmModule>) -> Result<Vec<HsmTokenInfo>, Error> {
    let module = module.clone();
    let infos = tokio::task::spawn_blocking(move || module.tokens())
        .await
        .map_err(Error::internal)??;
    Ok(infos)
}

/// # Routing
impl TokenManager {
    async fn client(&self, token_id: &str) -> Result<(WorkerClient, u64), Error> {
        let workers = self.workers.read().await;
        let client = workers.client(token_id)?;
        let generation = client.module().map(|m| workers.generation(m)).unwrap_or(0);
        Ok((client, generation))
    }

    /// Runs an operation on the worker of a token. A device fault reloads
    /// the module of the token before the error is returned.
    async fn call<T, F, Fut>(&self, token_id: &str, op: F) -> Result<T, Error>
    where
        F: FnOnce(WorkerClient) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let (client, generation) = self.client(token_id).await?;
        let module = client.module().map(ToString::to_string);

        let res = op(client).await;

        if let (Err(e), Some(module)) = (&res, module) {
            if e.is_device_fault() {
                #[cfg(feature = "hsm")]
                self.reload_module(&module, Some(generation)).await;
                #[cfg(not(feature = "hsm"))]
                let _ = (module, generation);
            }
        }
        res
    }

    /// Runs a directory change on the worker owning the key.
    async fn apply_for_key<F>(&self, key_id: &str, op: F) -> Result<(), Error>
    where
        F: FnOnce(&TokenDirectory) -> Result<(), Error> + Send + 'static,
    {
        let token_id = self.directory.token_id_for_key(key_id)?;
        self.call(&token_id, |client| async move { client.apply(op).await })
            .await
    }

    async fn apply_for_cert<F>(&self, cert_id: &str, op: F) -> Result<(), Error>
    where
        F: FnOnce(&TokenDirectory) -> Result<(), Error> + Send + 'static,
    {
        let (key_id, _) = self.directory.cert(cert_id)?;
        self.apply_for_key(&key_id, op).await
    }
}

/// # Tokens
impl TokenManager {
    pub fn list_tokens(&self) -> Result<Vec<Token>, Error> {
        self.directory.tokens()
    }

    pub fn get_token_info(&self, token_id: &str) -> Result<Token, Error> {
        self.directory.token(token_id)
    }

    pub async fn set_token_friendly_name(&self, token_id: &str, name: &str) -> Result<(), Error> {
        let id = token_id.to_string();
        let name = name.to_string();
        self.call(token_id, |client| async move {
            client
                .apply(move |dir| dir.set_token_friendly_name(&id, &name))
                .await
        })
        .await
    }

    /// Logs in to or out of a token. Without a PIN a remembered one is used.
    pub async fn activate_token(
        &self,
        token_id: &str,
        activate: bool,
        pin: Option<SecretString>,
    ) -> Result<(), Error> {
        self.call(token_id, |client| async move {
            if activate {
                client.activate(pin).await
            } else {
                client.deactivate().await
            }
        })
        .await
    }

    pub async fn initialize_software_token(&self, pin: SecretString) -> Result<(), Error> {
        self.call(SOFT_TOKEN_ID, |client| async move {
            client.initialize_software_token(pin).await
        })
        .await
    }

    pub async fn update_software_token_pin(
        &self,
        old: SecretString,
        new: SecretString,
    ) -> Result<(), Error> {
        self.call(SOFT_TOKEN_ID, |client| async move {
            client.update_software_token_pin(old, new).await
        })
        .await
    }
}

/// # Keys
impl TokenManager {
    pub async fn generate_key(&self, token_id: &str, label: Option<String>) -> Result<Key, Error> {
        self.call(token_id, |client| async move { client.generate_key(label).await })
            .await
    }

    pub fn get_key_info(&self, key_id: &str) -> Result<Key, Error> {
        self.directory.key(key_id)
    }

    /// Unknown keys are not available.
    pub fn is_key_available(&self, key_id: &str) -> Result<bool, Error> {
        self.directory.is_key_available(key_id)
    }

    pub async fn set_key_friendly_name(&self, key_id: &str, name: &str) -> Result<(), Error> {
        let id = key_id.to_string();
        let name = name.to_string();
        self.apply_for_key(key_id, move |dir| dir.set_key_friendly_name(&id, &name))
            .await
    }

    pub async fn set_key_label(&self, key_id: &str, label: &str) -> Result<(), Error> {
        let id = key_id.to_string();
        let label = label.to_string();
        self.apply_for_key(key_id, move |dir| dir.set_key_label(&id, &label))
            .await
    }

    /// Deletes a key from its token, or only strips its certificates and
    /// certificate requests from the configuration.
    ///
    /// A key that stays on its token is found again by the next refresh.
    pub async fn delete_key(&self, key_id: &str, from_device: bool) -> Result<(), Error> {
        let token_id = self.directory.token_id_for_key(key_id)?;
        if from_device {
            let key_id = key_id.to_string();
            self.call(&token_id, |client| async move { client.delete_key(&key_id).await })
                .await
        } else {
            let id = key_id.to_string();
            self.apply_for_key(key_id, move |dir| {
                dir.update_key(&id, |key| {
                    key.certs.clear();
                    key.cert_requests.clear();
                    key.pending_deletion = false;
                    Ok(())
                })
            })
            .await
        }
    }

    pub fn get_sign_mechanism(&self, key_id: &str) -> Result<String, Error> {
        Ok(self.directory.key(key_id)?.sign_mechanism_name)
    }

    pub fn is_batch_signing_enabled(&self, key_id: &str) -> Result<bool, Error> {
        Ok(self.directory.token_for_key(key_id)?.batch_signing_enabled)
    }

    /// Finds the authentication key and certificate to use for the given
    /// server.
    pub fn get_auth_key(&self, server: &SecurityServerId) -> Result<AuthKeyInfo, Error> {
        let token = self.directory.token(SOFT_TOKEN_ID)?;
        if !token.active {
            return Err(Error::TokenNotActive(token.id));
        }
        let password = self
            .pins
            .get(SOFT_TOKEN_ID)
            .ok_or_else(|| Error::TokenNotActive(token.id.clone()))?;

        let keystore = KeyStore::new(
            self.config.soft_token_dir(),
            self.config.tmp_dir(),
            self.config.key_length,
        );

        let auth_keys = token
            .keys
            .iter()
            .filter(|key| key.available && key.usage == Some(KeyUsage::Authentication));
        for key in auth_keys {
            for cert in key.certs.iter().filter(|c| c.active) {
                let x509 = X509::from_der(&cert.bytes)?;
                match self
                    .verifier
                    .verify_auth_cert(server, &x509, cert.ocsp_response.as_deref())
                {
                    Ok(()) => {
                        return Ok(AuthKeyInfo {
                            alias: key.id.clone(),
                            key_store_file: keystore.key_path(&key.id),
                            password,
                            cert: cert.clone(),
                        });
                    }
                    Err(e) => debug!(
                        "Certificate '{}' cannot authenticate {}: {}",
                        cert.id, server, e
                    ),
                }
            }
        }
        Err(Error::KeyNotFound(format!("authentication key for {}", server)))
    }
}

/// # Signing
impl TokenManager {
    /// Signs a digest computed by the caller.
    ///
    /// The algorithm is checked before the request reaches the token.
    pub async fn sign(&self, key_id: &str, algorithm_id: &str, digest: Bytes) -> Result<Bytes, Error> {
        let algorithm = algorithm_id.parse::<SignAlgorithm>()?;
        self.sign_digest(key_id, algorithm, digest).await
    }

    async fn sign_digest(
        &self,
        key_id: &str,
        algorithm: SignAlgorithm,
        digest: Bytes,
    ) -> Result<Bytes, Error> {
        let token_id = self.directory.token_id_for_key(key_id)?;
        let key_id = key_id.to_string();
        self.call(&token_id, |client| async move {
            client.sign(&key_id, algorithm, digest).await
        })
        .await
    }

    /// Signs to-be-signed certificate or request bytes through the regular
    /// signing path, bounded by the signature timeout.
    async fn sign_tbs(&self, key_id: &str, tbs: &[u8], algorithm: SignAlgorithm) -> Result<Bytes, Error> {
        let hash = algorithm.digest().digest(tbs)?;
        let signing = self.sign_digest(key_id, algorithm, hash);
        match tokio::time::timeout(self.config.signature_timeout(), signing).await {
            Ok(res) => res,
            Err(_) => {
                error!("Signature calculation with key '{}' timed out", key_id);
                Err(Error::SignatureTimeout)
            }
        }
    }
}

/// # Certificate requests
impl TokenManager {
    pub async fn generate_cert_request(
        &self,
        key_id: &str,
        member_id: Option<String>,
        usage: KeyUsage,
        subject_name: &str,
        format: CertRequestFormat,
    ) -> Result<GeneratedCertRequest, Error> {
        let key = self.directory.key(key_id)?;
        let token = self.directory.token_for_key(key_id)?;
        check_usage(&key, &token, usage)?;

        let subject = Name::parse(subject_name)?;
        let public_key = key
            .public_key_der()?
            .ok_or_else(|| Error::KeyNotAvailable(key_id.to_string()))?;

        let algorithm =
            SignAlgorithm::for_mechanism(&key.sign_mechanism_name, self.config.csr_signature_digest)?;
        let tbs = TbsCertRequest::new(&subject, &public_key, usage, algorithm)?;
        let signature = self
            .sign_tbs(key_id, tbs.to_be_signed(), tbs.sign_algorithm())
            .await?;
        let csr = tbs.into_request(signature, format);

        // without a member only the subject has to match
        let existing = key.cert_requests.iter().find(|req| {
            (member_id.is_none() || req.member_id == member_id)
                && req.subject_name.eq_ignore_ascii_case(subject_name)
        });
        let cert_req_id = match existing {
            Some(req) => {
                debug!("Reusing certificate request '{}' of key '{}'", req.id, key_id);
                req.id.clone()
            }
            None => {
                let req = CertRequestInfo {
                    id: uuid::Uuid::new_v4().to_string(),
                    member_id,
                    subject_name: subject_name.to_string(),
                    usage,
                    format,
                };
                let cert_req_id = req.id.clone();
                let id = key_id.to_string();
                self.apply_for_key(key_id, move |dir| {
                    dir.add_cert_request(&id, req)?;
                    dir.update_key(&id, |key| {
                        key.usage.get_or_insert(usage);
                        Ok(())
                    })
                })
                .await?;
                cert_req_id
            }
        };

        Ok(GeneratedCertRequest {
            cert_req_id,
            csr,
            format,
        })
    }

    pub async fn delete_cert_request(&self, cert_req_id: &str) -> Result<(), Error> {
        let (key_id, _) = self.directory.cert_request(cert_req_id)?;
        let id = cert_req_id.to_string();
        self.apply_for_key(&key_id, move |dir| dir.remove_cert_request(&id).map(|_| ()))
            .await
    }
}

/// # Certificates
impl TokenManager {
    /// Attaches a certificate to the key holding its public key. Returns
    /// the id of that key.
    pub async fn import_cert(
        &self,
        cert_bytes: &[u8],
        status: CertStatus,
        member_id: Option<String>,
    ) -> Result<String, Error> {
        let cert = ParsedCert::from_bytes(cert_bytes)?;
        let cert_id = sha1_hex(cert.der());

        if let Ok((key_id, existing)) = self.directory.cert(&cert_id) {
            if existing.saved_to_configuration {
                return Err(Error::CertificateExists(format!(
                    "certificate '{}' is already attached to key '{}'",
                    cert_id, key_id
                )));
            }
        }

        let key = match self.directory.key_for_public_key(&cert.public_key_base64()?)? {
            Some(key) => key,
            None => match self.directory.key_for_unsaved_cert(cert.der())? {
                Some(key) => {
                    // Compatibility path for keys without a known public key.
                    warn!(
                        "Matched certificate '{}' to key '{}' by its unsaved certificate, \
                         the key has no known public key",
                        cert_id, key.id
                    );
                    key
                }
                None => return Err(Error::KeyNotFound(format!("for certificate {}", cert_id))),
            },
        };

        let token = self.directory.token_for_key(&key.id)?;
        let usage = cert.usage()?;
        check_usage(&key, &token, usage)?;

        if !cert.is_self_signed() {
            self.verifier
                .verify_chain(cert.x509())
                .map_err(Error::CertImportFailed)?;
        }

        let subject = cert.subject_normalized();
        let info = CertificateInfo::new(member_id.clone(), cert.der().clone(), status);
        let key_id = key.id.clone();
        {
            let key_id = key_id.clone();
            let cert_id = cert_id.clone();
            self.apply_for_key(&key.id, move |dir| {
                if dir.cert(&cert_id).is_ok() {
                    dir.remove_cert(&cert_id)?;
                }
                dir.add_cert(&key_id, info)?;
                dir.update_key(&key_id, |key| {
                    key.usage.get_or_insert(usage);
                    Ok(())
                })?;

                let redundant: Vec<String> = dir
                    .key(&key_id)?
                    .cert_requests
                    .iter()
                    .filter(|req| req.member_id == member_id)
                    .filter(|req| {
                        Name::parse(&req.subject_name)
                            .map(|name| name.normalized() == subject)
                            .unwrap_or(false)
                    })
                    .map(|req| req.id.clone())
                    .collect();
                for req_id in redundant {
                    debug!("Removing certificate request '{}', its certificate arrived", req_id);
                    dir.remove_cert_request(&req_id)?;
                }
                Ok(())
            })
            .await?;
        }
        info!("Imported certificate '{}' for key '{}'", cert_id, key_id);

        // The import stands even if the OCSP response cannot be had now.
        self.fetch_ocsp(&cert_id, cert.x509()).await;

        Ok(key_id)
    }

    /// Fetches and stores the OCSP response for a certificate. Failures
    /// are logged only.
    async fn fetch_ocsp(&self, cert_id: &str, cert: &X509) {
        match self.verifier.fetch_ocsp(cert) {
            Ok(Some(ocsp)) => {
                let id = cert_id.to_string();
                if let Err(e) = self
                    .apply_for_cert(cert_id, move |dir| dir.set_ocsp_response(&id, ocsp))
                    .await
                {
                    warn!("Cannot store OCSP response for certificate '{}': {}", cert_id, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot fetch OCSP response for certificate '{}': {}", cert_id, e),
        }
    }

    /// Activates a certificate.
    ///
    /// A certificate that is not self-signed must have a valid chain and a
    /// fresh OCSP response. A missing response is fetched and stored first.
    pub async fn activate_cert(&self, cert_id: &str) -> Result<(), Error> {
        let (_, info) = self.directory.cert(cert_id)?;
        let cert = ParsedCert::from_bytes(&info.bytes)?;

        if !cert.is_self_signed() {
            self.verifier
                .verify_chain(cert.x509())
                .map_err(Error::CertImportFailed)?;

            let ocsp = match info.ocsp_response {
                Some(ocsp) => Some(ocsp),
                None => match self.verifier.fetch_ocsp(cert.x509()) {
                    Ok(Some(ocsp)) => {
                        let id = cert_id.to_string();
                        let stored = ocsp.clone();
                        self.apply_for_cert(cert_id, move |dir| dir.set_ocsp_response(&id, stored))
                            .await?;
                        Some(ocsp)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!("Cannot fetch OCSP response for certificate '{}': {}", cert_id, e);
                        None
                    }
                },
            };
            self.verifier
                .verify_ocsp(cert.x509(), ocsp.as_deref())
                .map_err(|e| {
                    Error::CertImportFailed(format!(
                        "certificate '{}' has no valid OCSP status: {}",
                        cert_id, e
                    ))
                })?;
        }

        self.set_cert_active(cert_id, true).await
    }

    pub async fn deactivate_cert(&self, cert_id: &str) -> Result<(), Error> {
        self.set_cert_active(cert_id, false).await
    }

    async fn set_cert_active(&self, cert_id: &str, active: bool) -> Result<(), Error> {
        let id = cert_id.to_string();
        self.apply_for_cert(cert_id, move |dir| dir.set_cert_active(&id, active))
            .await
    }

    /// Removes a certificate. A key left without certificates and requests
    /// is deleted from its token by the next refresh.
    pub async fn delete_cert(&self, cert_id: &str) -> Result<(), Error> {
        let id = cert_id.to_string();
        self.apply_for_cert(cert_id, move |dir| dir.remove_cert(&id).map(|_| ()))
            .await
    }

    pub async fn set_cert_status(&self, cert_id: &str, status: CertStatus) -> Result<(), Error> {
        let id = cert_id.to_string();
        self.apply_for_cert(cert_id, move |dir| dir.set_cert_status(&id, status))
            .await
    }

    pub async fn set_ocsp_response(&self, cert_hash: &str, ocsp: Bytes) -> Result<(), Error> {
        let (_, cert) = self.directory.cert_for_hash(cert_hash)?;
        let id = cert.id.clone();
        self.apply_for_cert(&cert.id, move |dir| dir.set_ocsp_response(&id, ocsp))
            .await
    }

    pub fn get_key_id_for_cert_hash(&self, cert_hash: &str) -> Result<String, Error> {
        Ok(self.directory.cert_for_hash(cert_hash)?.0)
    }

    pub fn get_cert_info_for_hash(&self, cert_hash: &str) -> Result<CertificateInfo, Error> {
        Ok(self.directory.cert_for_hash(cert_hash)?.1)
    }

    pub fn get_member_certs(&self, member_id: &str) -> Result<Vec<CertificateInfo>, Error> {
        self.directory.member_certs(member_id)
    }

    /// Issues a self-signed certificate for a key, imports it as registered
    /// and activates it. Returns the DER encoded certificate.
    pub async fn generate_self_signed_cert(
        &self,
        key_id: &str,
        common_name: &str,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        usage: KeyUsage,
        member_id: Option<String>,
    ) -> Result<Bytes, Error> {
        let key = self.directory.key(key_id)?;
        let token = self.directory.token_for_key(key_id)?;
        check_usage(&key, &token, usage)?;

        let public_key = key
            .public_key_der()?
            .ok_or_else(|| Error::KeyNotAvailable(key_id.to_string()))?;

        let tbs = TbsCertificate::new(
            rand::random::<u64>() >> 1,
            &Name::common_name(common_name)?,
            not_before,
            not_after,
            &public_key,
            usage,
            SignAlgorithm::for_mechanism(&key.sign_mechanism_name, self.config.csr_signature_digest)?,
        )?;
        let signature = self
            .sign_tbs(key_id, tbs.to_be_signed(), tbs.sign_algorithm())
            .await?;
        let cert = tbs.into_certificate(signature);

        self.import_cert(&cert, CertStatus::Registered, member_id)
            .await?;
        self.activate_cert(&sha1_hex(&cert)).await?;
        Ok(cert)
    }
}

/// Authentication keys must live on the software token, and a key keeps
/// the usage it was first given.
fn check_usage(key: &Key, token: &Token, usage: KeyUsage) -> Result<(), Error> {
    if usage == KeyUsage::Authentication && !token.is_software() {
        return Err(Error::WrongCertUsage(format!(
            "authentication keys must be on the software token, not on '{}'",
            token.id
        )));
    }
    match key.usage {
        Some(fixed) if fixed != usage => Err(Error::WrongCertUsage(format!(
            "key '{}' is used for {}, not {}",
            key.id, fixed, usage
        ))),
        _ => Ok(()),
    }
}

//------------ Tests ---------------------------------------------------------
