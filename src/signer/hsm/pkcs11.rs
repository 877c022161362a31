//! Access to PKCS#11 libraries through `cryptoki`.
use std::ffi::c_ulong;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use backoff::ExponentialBackoff;
use bytes::Bytes;
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::rsa::{PkcsMgfType, PkcsPssParams};
use cryptoki::mechanism::{Mechanism, MechanismType};
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::{AuthPin, Ulong};
use log::{debug, error, info, warn};
use openssl::bn::BigNum;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use secrecy::{ExposeSecret, SecretString};

use crate::daemon::config::ModuleConf;
use crate::signer::algorithm::{DigestAlgorithm, SignInput, SignMechanism};
use crate::signer::hsm::module::{HsmCertObject, HsmError, HsmKeyObject, HsmTokenInfo};
use crate::signer::model::TokenStatus;

/// The time to wait between an initial and subsequent attempt at loading a
/// library.
const RETRY_LOAD_AFTER: Duration = Duration::from_secs(2);

/// How much longer to wait from one attempt to the next.
const RETRY_LOAD_AFTER_MULTIPLIER: f64 = 1.5;

/// The maximum amount of time to keep retrying.
const RETRY_LOAD_UNTIL_MAX: Duration = Duration::from_secs(30);

const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

//------------ Pkcs11Module --------------------------------------------------

/// A PKCS#11 library, loaded on first use.
///
/// Dropping the last reference to the context finalizes the library, so
/// all sessions must be gone before [`Pkcs11Module::reload`].
pub struct Pkcs11Module {
    conf: ModuleConf,
    ctx: RwLock<Option<Pkcs11>>,
}

impl fmt::Debug for Pkcs11Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Module")
            .field("conf", &self.conf)
            .finish()
    }
}

impl Pkcs11Module {
    pub fn new(conf: ModuleConf) -> Self {
        Pkcs11Module {
            conf,
            ctx: RwLock::new(None),
        }
    }

    pub fn conf(&self) -> &ModuleConf {
        &self.conf
    }

    fn context(&self) -> Result<Pkcs11, HsmError> {
        {
            let ctx = self
                .ctx
                .read()
                .map_err(|_| HsmError::Failed("module lock poisoned".to_string()))?;
            if let Some(ctx) = ctx.as_ref() {
                return Ok(ctx.clone());
            }
        }

        let mut ctx = self
            .ctx
            .write()
            .map_err(|_| HsmError::Failed("module lock poisoned".to_string()))?;
        match ctx.as_ref() {
            Some(loaded) => Ok(loaded.clone()),
            None => {
                let loaded = self.load()?;
                *ctx = Some(loaded.clone());
                Ok(loaded)
            }
        }
    }

    /// Loads and initializes the library, retrying with backoff.
    fn load(&self) -> Result<Pkcs11, HsmError> {
        let name = &self.conf.name;
        let lib = &self.conf.lib;

        let backoff_policy = ExponentialBackoff {
            initial_interval: RETRY_LOAD_AFTER,
            multiplier: RETRY_LOAD_AFTER_MULTIPLIER,
            max_elapsed_time: Some(RETRY_LOAD_UNTIL_MAX),
            ..Default::default()
        };

        let notify = |err, next: Duration| {
            warn!(
                "[{}] Loading PKCS#11 library failed, retrying in {} seconds: {}",
                name,
                next.as_secs(),
                err
            );
        };

        let op = || {
            let ctx = Pkcs11::new(lib).map_err(|e| {
                backoff::Error::transient(HsmError::Failed(format!(
                    "cannot load '{}': {}",
                    lib.display(),
                    e
                )))
            })?;
            ctx.initialize(CInitializeArgs::OsThreads).map_err(|e| {
                backoff::Error::transient(HsmError::Failed(format!(
                    "cannot initialize '{}': {}",
                    lib.display(),
                    e
                )))
            })?;
            Ok(ctx)
        };

        match backoff::retry_notify(backoff_policy, op, notify) {
            Ok(ctx) => {
                info!("[{}] Loaded PKCS#11 library '{}'", name, lib.display());
                Ok(ctx)
            }
            Err(backoff::Error::Permanent(err)) | Err(backoff::Error::Transient { err, .. }) => {
                error!("[{}] Loading PKCS#11 library failed, giving up: {}", name, err);
                Err(err)
            }
        }
    }

    pub fn reload(&self) -> Result<(), HsmError> {
        let mut ctx = self
            .ctx
            .write()
            .map_err(|_| HsmError::Failed("module lock poisoned".to_string()))?;
        if ctx.take().is_some() {
            debug!("[{}] Finalized PKCS#11 library", self.conf.name);
        }
        *ctx = Some(self.load()?);
        Ok(())
    }

    pub fn tokens(&self) -> Result<Vec<HsmTokenInfo>, HsmError> {
        let ctx = self.context()?;
        let slots = ctx.get_slots_with_token().map_err(classify)?;
        slots
            .iter()
            .enumerate()
            .map(|(slot_index, slot)| {
                let info = ctx.get_token_info(*slot).map_err(classify)?;
                Ok(HsmTokenInfo {
                    slot_index,
                    serial_number: info.serial_number().trim().to_string(),
                    label: info.label().trim().to_string(),
                    write_protected: info.write_protected() || self.conf.read_only,
                })
            })
            .collect()
    }

    pub fn open_session(&self, slot_index: usize) -> Result<Pkcs11Session, HsmError> {
        let ctx = self.context()?;
        let slots = ctx.get_slots_with_token().map_err(classify)?;
        let slot = slots
            .get(slot_index)
            .copied()
            .ok_or_else(|| HsmError::DeviceFault(format!("no token in slot {}", slot_index)))?;

        let session = match ctx.open_rw_session(slot) {
            Ok(session) => session,
            Err(CryptokiError::Pkcs11(RvError::TokenWriteProtected, _)) => {
                ctx.open_ro_session(slot).map_err(classify)?
            }
            Err(e) => return Err(classify(e)),
        };
        Ok(Pkcs11Session { session })
    }
}

//------------ Pkcs11Session -------------------------------------------------

pub struct Pkcs11Session {
    session: Session,
}

impl Pkcs11Session {
    pub fn login(&self, pin: &SecretString) -> Result<(), HsmError> {
        let pin = AuthPin::new(pin.expose_secret().as_str().into());
        match self.session.login(UserType::User, Some(&pin)) {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    pub fn logout(&self) -> Result<(), HsmError> {
        match self.session.logout() {
            Ok(()) | Err(CryptokiError::Pkcs11(RvError::UserNotLoggedIn, _)) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }

    fn find(&self, template: &[Attribute]) -> Result<Vec<ObjectHandle>, HsmError> {
        self.session.find_objects(template).map_err(classify)
    }

    pub fn private_keys(&self) -> Result<Vec<HsmKeyObject>, HsmError> {
        let mut keys = vec![];
        for handle in self.find(&[Attribute::Class(ObjectClass::PRIVATE_KEY)])? {
            let mut id = None;
            let mut label = None;
            let attrs = self
                .session
                .get_attributes(handle, &[AttributeType::Id, AttributeType::Label])
                .map_err(classify)?;
            for attr in attrs {
                match attr {
                    Attribute::Id(value) if !value.is_empty() => id = Some(value),
                    Attribute::Label(value) => {
                        label = Some(String::from_utf8_lossy(&value).trim().to_string())
                    }
                    _ => {}
                }
            }
            match id {
                Some(id) => keys.push(HsmKeyObject { id, label }),
                None => debug!("Skipping private key without CKA_ID"),
            }
        }
        Ok(keys)
    }

    fn rsa_public_key(&self, handle: ObjectHandle) -> Result<Bytes, HsmError> {
        let attrs = self
            .session
            .get_attributes(handle, &[AttributeType::Modulus, AttributeType::PublicExponent])
            .map_err(classify)?;
        let mut modulus = None;
        let mut exponent = None;
        for attr in attrs {
            match attr {
                Attribute::Modulus(value) => modulus = Some(value),
                Attribute::PublicExponent(value) => exponent = Some(value),
                _ => {}
            }
        }
        let (modulus, exponent) = modulus
            .zip(exponent)
            .ok_or_else(|| HsmError::Failed("public key is not an RSA key".to_string()))?;

        let der = BigNum::from_slice(&modulus)
            .and_then(|n| Ok((n, BigNum::from_slice(&exponent)?)))
            .and_then(|(n, e)| Rsa::from_public_components(n, e))
            .and_then(PKey::from_rsa)
            .and_then(|pkey| pkey.public_key_to_der())
            .map_err(|e| HsmError::Failed(format!("cannot encode public key: {}", e)))?;
        Ok(Bytes::from(der))
    }

    pub fn public_key(&self, id: &[u8]) -> Result<Option<Bytes>, HsmError> {
        let template = [
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::Id(id.to_vec()),
        ];
        match self.find(&template)?.first() {
            Some(handle) => self.rsa_public_key(*handle).map(Some),
            None => Ok(None),
        }
    }

    pub fn certificates(&self) -> Result<Vec<HsmCertObject>, HsmError> {
        let mut certs = vec![];
        for handle in self.find(&[Attribute::Class(ObjectClass::CERTIFICATE)])? {
            let mut id = vec![];
            let mut value = None;
            let attrs = self
                .session
                .get_attributes(handle, &[AttributeType::Id, AttributeType::Value])
                .map_err(classify)?;
            for attr in attrs {
                match attr {
                    Attribute::Id(v) => id = v,
                    Attribute::Value(v) => value = Some(Bytes::from(v)),
                    _ => {}
                }
            }
            if let Some(value) = value {
                certs.push(HsmCertObject { id, value });
            }
        }
        Ok(certs)
    }

    pub fn generate_key_pair(
        &self,
        id: &[u8],
        label: Option<&str>,
        bits: u32,
    ) -> Result<Bytes, HsmError> {
        let mut public = vec![
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::ModulusBits((bits as u64).into()),
            Attribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()),
            Attribute::Id(id.to_vec()),
        ];
        let mut private = vec![
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
            Attribute::Extractable(false),
            Attribute::Id(id.to_vec()),
        ];
        if let Some(label) = label {
            public.push(Attribute::Label(label.as_bytes().to_vec()));
            private.push(Attribute::Label(label.as_bytes().to_vec()));
        }

        let (public_handle, _) = self
            .session
            .generate_key_pair(&Mechanism::RsaPkcsKeyPairGen, &public, &private)
            .map_err(classify)?;
        self.rsa_public_key(public_handle)
    }

    pub fn destroy_key(&self, id: &[u8]) -> Result<(), HsmError> {
        for class in [ObjectClass::PRIVATE_KEY, ObjectClass::PUBLIC_KEY] {
            let template = [Attribute::Class(class), Attribute::Id(id.to_vec())];
            for handle in self.find(&template)? {
                self.session.destroy_object(handle).map_err(classify)?;
            }
        }
        Ok(())
    }

    pub fn find_private_key(&self, id: &[u8]) -> Result<Option<ObjectHandle>, HsmError> {
        let template = [
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::Id(id.to_vec()),
        ];
        Ok(self.find(&template)?.first().copied())
    }

    pub fn sign(&self, key: ObjectHandle, input: &SignInput) -> Result<Bytes, HsmError> {
        let mechanism = match input.mechanism() {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::RsaPkcsPss => Mechanism::RsaPkcsPss(pss_params(input)?),
        };
        self.session
            .sign(&mechanism, key, input.data())
            .map(Bytes::from)
            .map_err(classify)
    }
}

fn pss_params(input: &SignInput) -> Result<PkcsPssParams, HsmError> {
    let (hash_alg, mgf) = match input.digest() {
        DigestAlgorithm::Sha256 => (MechanismType::SHA256, PkcsMgfType::MGF1_SHA256),
        DigestAlgorithm::Sha384 => (MechanismType::SHA384, PkcsMgfType::MGF1_SHA384),
        DigestAlgorithm::Sha512 => (MechanismType::SHA512, PkcsMgfType::MGF1_SHA512),
        other => {
            return Err(HsmError::Failed(format!("no PSS parameters for {}", other)));
        }
    };
    Ok(PkcsPssParams {
        hash_alg,
        mgf,
        s_len: Ulong::from(input.pss_salt_len() as c_ulong),
    })
}

//------------ Error classification ------------------------------------------

/// Separates faults of the library or device, which call for a reload of
/// the module, from ordinary failures.
fn classify(err: CryptokiError) -> HsmError {
    let rv = match &err {
        CryptokiError::Pkcs11(rv, _) => *rv,
        _ => return HsmError::Failed(err.to_string()),
    };
    match rv {
        RvError::DeviceError
        | RvError::DeviceMemory
        | RvError::DeviceRemoved
        | RvError::GeneralError
        | RvError::FunctionFailed
        | RvError::SessionClosed
        | RvError::SessionHandleInvalid
        | RvError::TokenNotPresent
        | RvError::CryptokiNotInitialized => HsmError::DeviceFault(err.to_string()),
        RvError::PinIncorrect => HsmError::Pin(TokenStatus::UserPinIncorrect),
        RvError::PinLocked => HsmError::Pin(TokenStatus::UserPinLocked),
        RvError::PinLenRange => HsmError::Pin(TokenStatus::UserPinInvalid),
        RvError::PinExpired => HsmError::Pin(TokenStatus::UserPinExpired),
        _ => HsmError::Failed(err.to_string()),
    }
}

//------------ Tests ---------------------------------------------------------
