//! PKCS#12 key stores of the software token.
//!
//! Every key lives in its own `<key id>.p12` file, encrypted with the token
//! PIN. The hidden `.softtoken.p12` store only exists to prove the PIN: a
//! token is initialized once it is there.
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::{debug, error, info, warn};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::{ParsedPkcs12_2, Pkcs12};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use secrecy::{ExposeSecret, SecretString};

use crate::commons::error::{Error, IoError};
use crate::commons::util::file;
use crate::constants::{KEY_DIR_BACKUP_SUFFIX, KEY_STORE_EXTENSION, PIN_ALIAS, PIN_KEY_STORE_NAME};

/// Validity of the certificate each store carries next to its key.
const PLACEHOLDER_CERT_VALIDITY_DAYS: u32 = 20 * 365;

//------------ KeyStore ------------------------------------------------------

#[derive(Clone, Debug)]
pub struct KeyStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
    key_length: u32,
}

/// # Layout
impl KeyStore {
    pub fn new(dir: PathBuf, tmp_dir: PathBuf, key_length: u32) -> Self {
        KeyStore {
            dir,
            tmp_dir,
            key_length,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pin_store_path(&self) -> PathBuf {
        self.store_path(PIN_KEY_STORE_NAME)
    }

    pub fn key_path(&self, key_id: &str) -> PathBuf {
        self.store_path(key_id)
    }

    fn store_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, KEY_STORE_EXTENSION))
    }

    pub fn is_initialized(&self) -> bool {
        self.pin_store_path().is_file()
    }

    /// The ids of all keys with a key store, sorted.
    pub fn key_ids(&self) -> Result<Vec<String>, Error> {
        Ok(file::list_stems_with_extension(&self.dir, KEY_STORE_EXTENSION)?)
    }
}

/// # PIN
impl KeyStore {
    /// Creates the key store directory and the PIN key store.
    pub fn initialize(&self, pin: &SecretString) -> Result<(), Error> {
        file::create_dir(&self.dir)?;
        let pkey = self.new_private_key()?;
        let der = build_store(PIN_ALIAS, &pkey, &placeholder_cert(PIN_ALIAS, &pkey)?, pin)?;
        file::save_atomic(&der, &self.pin_store_path(), &self.tmp_dir)?;
        info!("Created PIN key store '{}'", self.pin_store_path().display());
        Ok(())
    }

    /// Checks the PIN against the PIN key store.
    pub fn verify_pin(&self, pin: &SecretString) -> Result<(), Error> {
        let der = file::read(&self.pin_store_path())?;
        open_store(&der, pin).map_err(|_| Error::PinIncorrect)?;
        Ok(())
    }

    /// Re-encrypts every key store with a new PIN.
    ///
    /// The new stores are written to a fresh sibling directory that then
    /// takes the place of the key store directory. The old directory is
    /// kept as a backup until the swap succeeded. An older backup is moved
    /// out of the way with a timestamp suffix, never deleted.
    pub fn change_pin(&self, old: &SecretString, new: &SecretString) -> Result<(), Error> {
        self.verify_pin(old)?;

        let parent = self
            .dir
            .parent()
            .ok_or_else(|| Error::internal("key store directory has no parent"))?;
        let dir_name = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::internal("key store directory has no name"))?;

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}-", dir_name))
            .tempdir_in(parent)
            .map_err(|e| {
                Error::io(
                    format!("cannot create temporary dir in '{}'", parent.display()),
                    e,
                )
            })?;

        self.reencrypt_into(tmp.path(), old, new)?;
        file::sync_dir(tmp.path())?;

        let backup = parent.join(format!("{}.{}", dir_name, KEY_DIR_BACKUP_SUFFIX));
        if backup.exists() {
            let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
            let aside = parent.join(format!("{}.{}-{}", dir_name, KEY_DIR_BACKUP_SUFFIX, stamp));
            warn!(
                "Moving existing key store backup '{}' to '{}'",
                backup.display(),
                aside.display()
            );
            file::rename(&backup, &aside)?;
        }

        self.swap_in(&tmp.into_path(), parent, &backup, file::rename)?;

        info!("Re-encrypted key stores in '{}' with new PIN", self.dir.display());
        Ok(())
    }

    /// Replaces the key store directory with `new_dir`.
    ///
    /// The current directory is renamed to `backup` first and only removed
    /// once `new_dir` is in place and synced. If `move_into_place` fails
    /// the backup is renamed back.
    fn swap_in(
        &self,
        new_dir: &Path,
        parent: &Path,
        backup: &Path,
        move_into_place: impl FnOnce(&Path, &Path) -> Result<(), IoError>,
    ) -> Result<(), Error> {
        if let Err(e) = file::rename(&self.dir, backup) {
            let _ = file::remove_dir_all(new_dir);
            return Err(e.into());
        }
        file::sync_dir(parent)?;

        if let Err(e) = move_into_place(new_dir, &self.dir) {
            error!(
                "Cannot move re-encrypted key stores into place: {}. Restoring '{}'",
                e,
                backup.display()
            );
            if let Err(restore) = file::rename(backup, &self.dir).and_then(|_| file::sync_dir(parent)) {
                error!(
                    "Cannot restore key stores from '{}': {}. Manual recovery needed",
                    backup.display(),
                    restore
                );
            }
            let _ = file::remove_dir_all(new_dir);
            return Err(e.into());
        }
        file::sync_dir(parent)?;

        if let Err(e) = file::remove_dir_all(backup) {
            error!(
                "PIN changed, but the old key stores at '{}' could not be removed: {}",
                backup.display(),
                e
            );
        }
        Ok(())
    }

    /// Writes every entry of the key store directory to `target`, with the
    /// key stores re-encrypted under the new PIN. Every file is synced.
    /// Anything other than a plain file is refused so that nothing is lost
    /// when the old directory is removed.
    fn reencrypt_into(
        &self,
        target: &Path,
        old: &SecretString,
        new: &SecretString,
    ) -> Result<(), Error> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            Error::io(format!("cannot read dir '{}'", self.dir.display()), e)
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::io(format!("cannot read dir '{}'", self.dir.display()), e)
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| {
                Error::io(format!("cannot inspect '{}'", path.display()), e)
            })?;
            if !file_type.is_file() {
                return Err(Error::internal(format!(
                    "cannot change PIN: '{}' in the key store dir is not a file",
                    path.display()
                )));
            }
            let file_name = entry.file_name();
            let target_path = target.join(&file_name);

            let is_store = path.extension().and_then(|e| e.to_str()) == Some(KEY_STORE_EXTENSION);
            if !is_store {
                file::write_synced(&file::read(&path)?, &target_path)?;
                continue;
            }

            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let alias = if stem == PIN_KEY_STORE_NAME {
                PIN_ALIAS
            } else {
                stem.as_str()
            };

            let parsed = open_store(&file::read(&path)?, old)?;
            let (pkey, cert) = store_content(parsed, &path)?;
            let der = build_store(alias, &pkey, &cert, new)?;
            file::write_synced(&der, &target_path)?;
            debug!("Re-encrypted key store '{}'", file_name.to_string_lossy());
        }
        Ok(())
    }
}

/// # Keys
impl KeyStore {
    /// Generates a key pair and stores it under the given id.
    pub fn generate_key(&self, key_id: &str, pin: &SecretString) -> Result<PKey<Private>, Error> {
        let path = self.key_path(key_id);
        if path.exists() {
            return Err(Error::internal(format!("key store for '{}' exists", key_id)));
        }
        let pkey = self.new_private_key()?;
        let der = build_store(key_id, &pkey, &placeholder_cert(key_id, &pkey)?, pin)?;
        file::save_atomic(&der, &path, &self.tmp_dir)?;
        Ok(pkey)
    }

    pub fn load_private_key(&self, key_id: &str, pin: &SecretString) -> Result<PKey<Private>, Error> {
        let path = self.key_path(key_id);
        let der = file::read(&path)?;
        let parsed = open_store(&der, pin)?;
        let (pkey, _) = store_content(parsed, &path)?;
        Ok(pkey)
    }

    /// Removes the key store, returns whether there was one.
    pub fn delete_key(&self, key_id: &str) -> Result<bool, IoError> {
        file::delete_if_exists(&self.key_path(key_id))
    }

    fn new_private_key(&self) -> Result<PKey<Private>, Error> {
        let rsa = Rsa::generate(self.key_length)?;
        Ok(PKey::from_rsa(rsa)?)
    }
}

//------------ Helpers -------------------------------------------------------

fn open_store(der: &[u8], pin: &SecretString) -> Result<ParsedPkcs12_2, ErrorStack> {
    Pkcs12::from_der(der)?.parse2(pin.expose_secret())
}

fn store_content(parsed: ParsedPkcs12_2, path: &Path) -> Result<(PKey<Private>, X509), Error> {
    match (parsed.pkey, parsed.cert) {
        (Some(pkey), Some(cert)) => Ok((pkey, cert)),
        _ => Err(Error::internal(format!(
            "key store '{}' lacks a key or certificate",
            path.display()
        ))),
    }
}

fn build_store(
    alias: &str,
    pkey: &PKey<Private>,
    cert: &X509,
    pin: &SecretString,
) -> Result<Vec<u8>, Error> {
    let store = Pkcs12::builder()
        .name(alias)
        .pkey(pkey)
        .cert(cert)
        .build2(pin.expose_secret())?;
    Ok(store.to_der()?)
}

fn placeholder_cert(alias: &str, pkey: &PKey<Private>) -> Result<X509, ErrorStack> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, alias)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(PLACEHOLDER_CERT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.sign(pkey, MessageDigest::sha256())?;
    Ok(builder.build())
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::commons::test::{GOOD_PIN, OTHER_PIN, test_under_tmp};

    fn pin(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    fn store(d: &Path) -> KeyStore {
        KeyStore::new(d.join("softtoken"), d.join("tmp"), 2048)
    }

    fn dir_content(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .map(|e| (e.file_name().to_string_lossy().to_string(), fs::read(e.path()).unwrap()))
            .collect()
    }

    #[test]
    fn initialize_and_verify() {
        test_under_tmp(|d| {
            let store = store(&d);
            assert!(!store.is_initialized());

            store.initialize(&pin(GOOD_PIN)).unwrap();
            assert!(store.is_initialized());
            assert!(store.key_ids().unwrap().is_empty());

            store.verify_pin(&pin(GOOD_PIN)).unwrap();
            assert!(matches!(
                store.verify_pin(&pin(OTHER_PIN)),
                Err(Error::PinIncorrect)
            ));
        })
    }

    #[test]
    fn generate_load_delete() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();

            let pkey = store.generate_key("ABCD", &pin(GOOD_PIN)).unwrap();
            assert_eq!(store.key_ids().unwrap(), vec!["ABCD".to_string()]);

            let loaded = store.load_private_key("ABCD", &pin(GOOD_PIN)).unwrap();
            assert_eq!(
                loaded.public_key_to_der().unwrap(),
                pkey.public_key_to_der().unwrap()
            );
            assert!(store.load_private_key("ABCD", &pin(OTHER_PIN)).is_err());

            assert!(store.delete_key("ABCD").unwrap());
            assert!(!store.delete_key("ABCD").unwrap());
            assert!(store.key_ids().unwrap().is_empty());
        })
    }

    #[test]
    fn change_pin_keeps_keys() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();
            let pkey = store.generate_key("K1", &pin(GOOD_PIN)).unwrap();

            store.change_pin(&pin(GOOD_PIN), &pin(OTHER_PIN)).unwrap();

            assert!(store.verify_pin(&pin(GOOD_PIN)).is_err());
            store.verify_pin(&pin(OTHER_PIN)).unwrap();
            let loaded = store.load_private_key("K1", &pin(OTHER_PIN)).unwrap();
            assert_eq!(
                loaded.public_key_to_der().unwrap(),
                pkey.public_key_to_der().unwrap()
            );

            // no backup or temporary dirs are left behind
            let mut names: Vec<_> = fs::read_dir(&d)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .filter(|n| n.contains("softtoken"))
                .collect();
            names.sort();
            assert_eq!(names, vec!["softtoken".to_string()]);
        })
    }

    #[test]
    fn change_pin_with_wrong_old_pin_changes_nothing() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();
            store.generate_key("K1", &pin(GOOD_PIN)).unwrap();
            let before = dir_content(store.dir());

            assert!(matches!(
                store.change_pin(&pin("Wrong-Pin-0003"), &pin(OTHER_PIN)),
                Err(Error::PinIncorrect)
            ));

            assert_eq!(dir_content(store.dir()), before);
            store.verify_pin(&pin(GOOD_PIN)).unwrap();
        })
    }

    #[test]
    fn change_pin_keeps_older_backup() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();

            let backup = d.join("softtoken.bak");
            fs::create_dir_all(&backup).unwrap();
            fs::write(backup.join("marker"), b"old").unwrap();

            store.change_pin(&pin(GOOD_PIN), &pin(OTHER_PIN)).unwrap();

            assert!(!backup.exists());
            let aside: Vec<_> = fs::read_dir(&d)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with("softtoken.bak-"))
                .collect();
            assert_eq!(aside.len(), 1);
            assert_eq!(fs::read(d.join(&aside[0]).join("marker")).unwrap(), b"old");
        })
    }

    #[test]
    fn failed_swap_restores_key_stores() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();
            store.generate_key("K1", &pin(GOOD_PIN)).unwrap();
            let before = dir_content(store.dir());

            let replacement = d.join(".softtoken-new");
            fs::create_dir_all(&replacement).unwrap();
            store
                .reencrypt_into(&replacement, &pin(GOOD_PIN), &pin(OTHER_PIN))
                .unwrap();

            let backup = d.join("softtoken.bak");
            let res = store.swap_in(&replacement, &d, &backup, |from, _| {
                Err(IoError::new(
                    format!("refusing to move '{}'", from.display()),
                    std::io::Error::other("disk full"),
                ))
            });
            assert!(res.is_err());

            assert_eq!(dir_content(store.dir()), before);
            assert!(!backup.exists());
            assert!(!replacement.exists());
            store.verify_pin(&pin(GOOD_PIN)).unwrap();
            store.load_private_key("K1", &pin(GOOD_PIN)).unwrap();
        })
    }

    #[test]
    fn change_pin_refuses_unknown_dirs() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();
            fs::create_dir_all(store.dir().join("extra")).unwrap();

            assert!(store.change_pin(&pin(GOOD_PIN), &pin(OTHER_PIN)).is_err());

            store.verify_pin(&pin(GOOD_PIN)).unwrap();
            assert!(store.dir().join("extra").is_dir());
            assert!(!d.join("softtoken.bak").exists());
        })
    }

    #[test]
    fn change_pin_keeps_other_files() {
        test_under_tmp(|d| {
            let store = store(&d);
            store.initialize(&pin(GOOD_PIN)).unwrap();
            fs::write(store.dir().join("notes.txt"), b"keep me").unwrap();

            store.change_pin(&pin(GOOD_PIN), &pin(OTHER_PIN)).unwrap();

            assert_eq!(fs::read(store.dir().join("notes.txt")).unwrap(), b"keep me");
        })
    }
}
