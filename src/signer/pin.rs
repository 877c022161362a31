//! Token PINs: the process wide PIN store, the PIN policy and the login
//! gate used while a PIN is being changed.
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::Error;

//------------ PinStore ------------------------------------------------------

/// Holds the PINs of activated tokens, keyed by token id.
///
/// Workers read it on activation and clear it on deactivation, a wrong PIN
/// or a PIN change. PINs are never logged.
#[derive(Debug, Default)]
pub struct PinStore {
    pins: RwLock<HashMap<String, SecretString>>,
}

impl PinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, token_id: &str) -> Option<SecretString> {
        match self.pins.read() {
            Ok(pins) => pins
                .get(token_id)
                .map(|pin| SecretString::new(pin.expose_secret().clone())),
            Err(_) => {
                warn!("PIN store lock poisoned");
                None
            }
        }
    }

    pub fn contains(&self, token_id: &str) -> bool {
        self.pins
            .read()
            .map(|pins| pins.contains_key(token_id))
            .unwrap_or(false)
    }

    pub fn store(&self, token_id: &str, pin: &SecretString) {
        match self.pins.write() {
            Ok(mut pins) => {
                pins.insert(
                    token_id.to_string(),
                    SecretString::new(pin.expose_secret().clone()),
                );
            }
            Err(_) => warn!("PIN store lock poisoned, PIN for token '{}' not kept", token_id),
        }
    }

    pub fn clear(&self, token_id: &str) {
        match self.pins.write() {
            Ok(mut pins) => {
                pins.remove(token_id);
            }
            Err(_) => warn!("PIN store lock poisoned, PIN for token '{}' not cleared", token_id),
        }
    }
}

//------------ PinPolicy -----------------------------------------------------

/// The complexity policy for software token PINs.
///
/// A PIN must be at least [`PinPolicy::MIN_LENGTH`] printable ASCII
/// characters long and use at least three of lower case letters, upper
/// case letters, digits and other characters.
pub struct PinPolicy;

impl PinPolicy {
    pub const MIN_LENGTH: usize = 10;

    const MIN_CHAR_CLASSES: usize = 3;

    pub fn is_valid(pin: &str) -> bool {
        if pin.chars().count() < Self::MIN_LENGTH {
            return false;
        }
        if !pin.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return false;
        }

        let classes = [
            pin.chars().any(|c| c.is_ascii_lowercase()),
            pin.chars().any(|c| c.is_ascii_uppercase()),
            pin.chars().any(|c| c.is_ascii_digit()),
            pin.chars().any(|c| !c.is_ascii_alphanumeric()),
        ];
        classes.iter().filter(|present| **present).count() >= Self::MIN_CHAR_CLASSES
    }

    /// Checks the PIN if the policy is enforced.
    pub fn check(pin: &SecretString, enforce: bool) -> Result<(), Error> {
        if enforce && !Self::is_valid(pin.expose_secret()) {
            Err(Error::PinPolicyViolation)
        } else {
            Ok(())
        }
    }
}

//------------ LoginGate -----------------------------------------------------

/// Decides whether a token may be activated.
#[derive(Debug)]
pub struct LoginGate {
    allowed: AtomicBool,
}

impl Default for LoginGate {
    fn default() -> Self {
        LoginGate {
            allowed: AtomicBool::new(true),
        }
    }
}

impl LoginGate {
    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    /// Disallows logins until the returned guard is dropped.
    pub fn close(&self) -> LoginGateGuard<'_> {
        self.allowed.store(false, Ordering::SeqCst);
        LoginGateGuard { gate: self }
    }
}

/// Re-opens the [`LoginGate`] when dropped.
pub struct LoginGateGuard<'a> {
    gate: &'a LoginGate,
}

impl Drop for LoginGateGuard<'_> {
    fn drop(&mut self) {
        self.gate.allowed.store(true, Ordering::SeqCst);
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::test::{GOOD_PIN, OTHER_PIN};

    #[test]
    fn policy() {
        assert!(PinPolicy::is_valid(GOOD_PIN));
        assert!(PinPolicy::is_valid(OTHER_PIN));
        assert!(PinPolicy::is_valid("abcdefgh12XY"));
        assert!(PinPolicy::is_valid("abcdefgh1-#!"));

        assert!(!PinPolicy::is_valid("Short-1"));
        assert!(!PinPolicy::is_valid("alllowercaseletters"));
        assert!(!PinPolicy::is_valid("lowerandUPPERonly"));
        assert!(!PinPolicy::is_valid("Unicode-Pin-ä1"));

        let weak = SecretString::new("1234".to_string());
        assert!(PinPolicy::check(&weak, false).is_ok());
        assert!(matches!(
            PinPolicy::check(&weak, true),
            Err(Error::PinPolicyViolation)
        ));
    }

    #[test]
    fn store_get_clear() {
        let store = PinStore::new();
        assert!(store.get("0").is_none());

        store.store("0", &SecretString::new(GOOD_PIN.to_string()));
        assert!(store.contains("0"));
        assert_eq!(store.get("0").unwrap().expose_secret(), GOOD_PIN);

        store.clear("0");
        assert!(store.get("0").is_none());
    }

    #[test]
    fn gate_reopens_on_drop() {
        let gate = LoginGate::default();
        {
            let _guard = gate.close();
            assert!(!gate.is_allowed());
        }
        assert!(gate.is_allowed());
    }
}
