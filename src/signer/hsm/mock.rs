//! An in-memory hardware module for tests.
//!
//! Counts calls, tracks how many signatures run at the same time and can
//! be told to fail with a device fault.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use secrecy::{ExposeSecret, SecretString};

use crate::constants::{DEFAULT_SIGN_MECHANISM, DEFAULT_TOKEN_ID_FORMAT};
use crate::daemon::config::ModuleConf;
use crate::signer::algorithm::SignInput;
use crate::signer::hsm::module::{HsmCertObject, HsmError, HsmKeyObject, HsmTokenInfo};
use crate::signer::model::TokenStatus;

const SIGN_DELAY: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FnIdx {
    OpenSession,
    Login,
    FindPrivateKey,
    GenerateKeyPair,
    DestroyKey,
    Sign,
}

struct MockKey {
    id: Vec<u8>,
    label: Option<String>,
    rsa: Rsa<Private>,
}

struct MockToken {
    serial_number: String,
    label: String,
    write_protected: bool,
    keys: Vec<MockKey>,
    certs: Vec<HsmCertObject>,
    logged_in: bool,
}

#[derive(Default)]
struct MockState {
    pin: String,
    tokens: Vec<MockToken>,
    calls: HashMap<FnIdx, usize>,
    in_flight: usize,
    max_in_flight: usize,
    reloads: usize,
    fail_next_sign: bool,

    // A faulted module fails every call until it is reloaded.
    faulted: bool,
}

impl MockState {
    fn count(&mut self, idx: FnIdx) {
        *self.calls.entry(idx).or_default() += 1;
    }

    fn check(&self) -> Result<(), HsmError> {
        if self.faulted {
            Err(HsmError::DeviceFault("CKR_DEVICE_ERROR".to_string()))
        } else {
            Ok(())
        }
    }

    fn token(&mut self, slot_index: usize) -> Result<&mut MockToken, HsmError> {
        self.tokens
            .get_mut(slot_index)
            .ok_or_else(|| HsmError::DeviceFault("CKR_TOKEN_NOT_PRESENT".to_string()))
    }

    fn logged_in(&mut self, slot_index: usize) -> Result<&mut MockToken, HsmError> {
        self.check()?;
        let token = self.token(slot_index)?;
        if token.logged_in {
            Ok(token)
        } else {
            Err(HsmError::Failed("CKR_USER_NOT_LOGGED_IN".to_string()))
        }
    }
}

//------------ MockModule ----------------------------------------------------

#[derive(Clone)]
pub struct MockModule {
    conf: ModuleConf,
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockModule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MockModule").field("conf", &self.conf).finish()
    }
}

impl MockModule {
    pub fn new(name: &str) -> Self {
        MockModule {
            conf: ModuleConf {
                name: name.to_string(),
                lib: "/dev/null/mock.so".into(),
                sign_mechanism: DEFAULT_SIGN_MECHANISM.to_string(),
                batch_signing_enabled: true,
                read_only: false,
                token_id_format: DEFAULT_TOKEN_ID_FORMAT.to_string(),
            },
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_sign_mechanism(mut self, mechanism: &str) -> Self {
        self.conf.sign_mechanism = mechanism.to_string();
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn conf(&self) -> &ModuleConf {
        &self.conf
    }

    pub fn tokens(&self) -> Result<Vec<HsmTokenInfo>, HsmError> {
        let state = self.state();
        state.check()?;
        Ok(state
            .tokens
            .iter()
            .enumerate()
            .map(|(slot_index, token)| HsmTokenInfo {
                slot_index,
                serial_number: token.serial_number.clone(),
                label: token.label.clone(),
                write_protected: token.write_protected || self.conf.read_only,
            })
            .collect())
    }

    pub fn open_session(&self, slot_index: usize) -> Result<MockSession, HsmError> {
        let mut state = self.state();
        state.count(FnIdx::OpenSession);
        state.check()?;
        state.token(slot_index)?;
        Ok(MockSession {
            module: self.clone(),
            slot_index,
        })
    }

    pub fn reload(&self) -> Result<(), HsmError> {
        let mut state = self.state();
        state.reloads += 1;
        state.faulted = false;
        for token in state.tokens.iter_mut() {
            token.logged_in = false;
        }
        Ok(())
    }
}

/// # Test control
impl MockModule {
    pub fn set_pin(&self, pin: &str) {
        self.state().pin = pin.to_string();
    }

    /// Inserts a token, returns its slot index.
    pub fn add_token(&self, serial_number: &str, label: &str, write_protected: bool) -> usize {
        let mut state = self.state();
        state.tokens.push(MockToken {
            serial_number: serial_number.to_string(),
            label: label.to_string(),
            write_protected,
            keys: vec![],
            certs: vec![],
            logged_in: false,
        });
        state.tokens.len() - 1
    }

    /// Pulls the token from its slot, the tokens after it move up a slot.
    pub fn remove_token(&self, slot_index: usize) {
        self.state().tokens.remove(slot_index);
    }

    /// Puts a key pair on a token, returns the private key.
    pub fn add_key(&self, slot_index: usize, id: &[u8], label: Option<&str>) -> PKey<Private> {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa.clone()).unwrap();
        self.state().tokens[slot_index].keys.push(MockKey {
            id: id.to_vec(),
            label: label.map(ToString::to_string),
            rsa,
        });
        pkey
    }

    pub fn add_cert(&self, slot_index: usize, id: &[u8], value: Bytes) {
        self.state().tokens[slot_index].certs.push(HsmCertObject {
            id: id.to_vec(),
            value,
        });
    }

    pub fn has_key(&self, slot_index: usize, id: &[u8]) -> bool {
        self.state().tokens[slot_index].keys.iter().any(|k| k.id == id)
    }

    pub fn calls(&self, idx: FnIdx) -> usize {
        self.state().calls.get(&idx).copied().unwrap_or(0)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    pub fn reloads(&self) -> usize {
        self.state().reloads
    }

    /// Makes the next signature fail with a device fault, leaving the
    /// module faulted until reloaded.
    pub fn fail_next_sign(&self) {
        self.state().fail_next_sign = true;
    }
}

//------------ MockSession ---------------------------------------------------

pub struct MockSession {
    module: MockModule,
    slot_index: usize,
}

impl MockSession {
    pub fn login(&self, pin: &SecretString) -> Result<(), HsmError> {
        let mut state = self.module.state();
        state.count(FnIdx::Login);
        state.check()?;
        let correct = state.pin == *pin.expose_secret();
        let token = state.token(self.slot_index)?;
        if correct {
            token.logged_in = true;
            Ok(())
        } else {
            Err(HsmError::Pin(TokenStatus::UserPinIncorrect))
        }
    }

    pub fn logout(&self) -> Result<(), HsmError> {
        let mut state = self.module.state();
        state.check()?;
        state.token(self.slot_index)?.logged_in = false;
        Ok(())
    }

    pub fn private_keys(&self) -> Result<Vec<HsmKeyObject>, HsmError> {
        let mut state = self.module.state();
        let token = state.logged_in(self.slot_index)?;
        Ok(token
            .keys
            .iter()
            .map(|k| HsmKeyObject {
                id: k.id.clone(),
                label: k.label.clone(),
            })
            .collect())
    }

    pub fn public_key(&self, id: &[u8]) -> Result<Option<Bytes>, HsmError> {
        let mut state = self.module.state();
        state.check()?;
        let token = state.token(self.slot_index)?;
        match token.keys.iter().find(|k| k.id == id) {
            Some(key) => {
                let der = PKey::from_rsa(key.rsa.clone())
                    .and_then(|pkey| pkey.public_key_to_der())
                    .map_err(|e| HsmError::Failed(e.to_string()))?;
                Ok(Some(Bytes::from(der)))
            }
            None => Ok(None),
        }
    }

    pub fn certificates(&self) -> Result<Vec<HsmCertObject>, HsmError> {
        let mut state = self.module.state();
        state.check()?;
        Ok(state.token(self.slot_index)?.certs.clone())
    }

    pub fn generate_key_pair(
        &self,
        id: &[u8],
        label: Option<&str>,
        bits: u32,
    ) -> Result<Bytes, HsmError> {
        {
            let mut state = self.module.state();
            state.count(FnIdx::GenerateKeyPair);
            let token = state.logged_in(self.slot_index)?;
            if token.write_protected {
                return Err(HsmError::Failed("CKR_TOKEN_WRITE_PROTECTED".to_string()));
            }
        }
        let rsa = Rsa::generate(bits).map_err(|e| HsmError::Failed(e.to_string()))?;
        let der = PKey::from_rsa(rsa.clone())
            .and_then(|pkey| pkey.public_key_to_der())
            .map_err(|e| HsmError::Failed(e.to_string()))?;

        let mut state = self.module.state();
        state.logged_in(self.slot_index)?.keys.push(MockKey {
            id: id.to_vec(),
            label: label.map(ToString::to_string),
            rsa,
        });
        Ok(Bytes::from(der))
    }

    pub fn destroy_key(&self, id: &[u8]) -> Result<(), HsmError> {
        let mut state = self.module.state();
        state.count(FnIdx::DestroyKey);
        state.logged_in(self.slot_index)?.keys.retain(|k| k.id != id);
        Ok(())
    }

    pub fn find_private_key(&self, id: &[u8]) -> Result<Option<Vec<u8>>, HsmError> {
        let mut state = self.module.state();
        state.count(FnIdx::FindPrivateKey);
        let token = state.logged_in(self.slot_index)?;
        Ok(token.keys.iter().find(|k| k.id == id).map(|k| k.id.clone()))
    }

    pub fn sign(&self, id: &[u8], input: &SignInput) -> Result<Bytes, HsmError> {
        let rsa = {
            let mut state = self.module.state();
            state.count(FnIdx::Sign);
            if state.fail_next_sign {
                state.fail_next_sign = false;
                state.faulted = true;
            }
            let rsa = state
                .logged_in(self.slot_index)?
                .keys
                .iter()
                .find(|k| k.id == id)
                .map(|k| k.rsa.clone())
                .ok_or_else(|| HsmError::Failed("CKR_KEY_HANDLE_INVALID".to_string()))?;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            rsa
        };

        thread::sleep(SIGN_DELAY);
        let res = PKey::from_rsa(rsa).and_then(|pkey| input.sign_with(&pkey));

        self.module.state().in_flight -= 1;

        res.map_err(|e| HsmError::Failed(e.to_string()))
    }
}
