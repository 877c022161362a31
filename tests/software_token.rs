//! Runs the software token through the public token manager: key life
//! cycle across restarts and PIN rotation.
use std::path::Path;
use std::sync::Arc;

use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Verifier;
use secrecy::SecretString;

use tokensigner::constants::SOFT_TOKEN_ID;
use tokensigner::daemon::config::Config;
use tokensigner::signer::algorithm::DigestAlgorithm;
use tokensigner::signer::model::{CertRequestFormat, KeyUsage, TokenState, TokenStatus};
use tokensigner::signer::verify::PermissiveVerifier;
use tokensigner::signer::{Error, TokenManager};

const PIN: &str = "Secret-Pin-0001";
const NEW_PIN: &str = "Other-Secret-0002";

fn pin(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

async fn manager(d: &Path) -> TokenManager {
    let config = Arc::new(Config::test(d));
    let manager = TokenManager::build(config, Arc::new(PermissiveVerifier)).unwrap();
    manager.refresh().await.unwrap();
    manager
}

async fn sign_and_verify(manager: &TokenManager, key_id: &str) {
    let digest = DigestAlgorithm::Sha256.digest(b"some data").unwrap();
    let signature = manager.sign(key_id, "SHA256withRSA", digest).await.unwrap();

    let spki = manager.get_key_info(key_id).unwrap().public_key_der().unwrap().unwrap();
    let pkey = PKey::public_key_from_der(&spki).unwrap();
    let mut verifier = Verifier::new(MessageDigest::sha256(), &pkey).unwrap();
    verifier.update(b"some data").unwrap();
    assert!(verifier.verify(&signature).unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn keys_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    let (key_id, bare_key_id, cert_req_id) = {
        let manager = manager(dir.path()).await;
        assert_eq!(
            manager.get_token_info(SOFT_TOKEN_ID).unwrap().status,
            TokenStatus::NotInitialized
        );

        manager.initialize_software_token(pin(PIN)).await.unwrap();
        manager.activate_token(SOFT_TOKEN_ID, true, Some(pin(PIN))).await.unwrap();

        let key = manager.generate_key(SOFT_TOKEN_ID, Some("signing".to_string())).await.unwrap();
        manager.set_key_friendly_name(&key.id, "my key").await.unwrap();
        let req = manager
            .generate_cert_request(
                &key.id,
                Some("INSTANCE/COM/1234".to_string()),
                KeyUsage::Signing,
                "C=FI, O=Test, CN=1234",
                CertRequestFormat::Der,
            )
            .await
            .unwrap();
        sign_and_verify(&manager, &key.id).await;

        // a key with neither certificates nor requests is not in the
        // key configuration, only its key store is
        let bare = manager.generate_key(SOFT_TOKEN_ID, None).await.unwrap();
        manager.set_key_friendly_name(&bare.id, "bare").await.unwrap();

        manager.shutdown().await;
        (key.id, bare.id, req.cert_req_id)
    };

    let manager = manager(dir.path()).await;
    let token = manager.get_token_info(SOFT_TOKEN_ID).unwrap();
    assert_eq!(token.state(), TokenState::Inactive);

    let key = manager.get_key_info(&key_id).unwrap();
    assert_eq!(key.friendly_name.as_deref(), Some("my key"));
    assert_eq!(key.label.as_deref(), Some("signing"));
    assert_eq!(key.cert_requests.len(), 1);
    assert_eq!(key.cert_requests[0].id, cert_req_id);
    assert!(!key.available);

    let bare = manager.get_key_info(&bare_key_id).unwrap();
    assert_eq!(bare.friendly_name, None);

    manager.activate_token(SOFT_TOKEN_ID, true, Some(pin(PIN))).await.unwrap();
    assert!(manager.is_key_available(&key_id).unwrap());
    assert!(manager.is_key_available(&bare_key_id).unwrap());
    sign_and_verify(&manager, &key_id).await;
    sign_and_verify(&manager, &bare_key_id).await;

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pin_rotation_keeps_keys_usable() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(dir.path()).await;

    // too weak for the PIN policy
    assert!(matches!(
        manager.initialize_software_token(pin("1234")).await,
        Err(Error::PinPolicyViolation)
    ));

    manager.initialize_software_token(pin(PIN)).await.unwrap();
    manager.activate_token(SOFT_TOKEN_ID, true, Some(pin(PIN))).await.unwrap();
    let key = manager.generate_key(SOFT_TOKEN_ID, None).await.unwrap();

    assert!(matches!(
        manager.update_software_token_pin(pin(NEW_PIN), pin(PIN)).await,
        Err(Error::PinIncorrect)
    ));

    manager.update_software_token_pin(pin(PIN), pin(NEW_PIN)).await.unwrap();
    assert!(!manager.get_token_info(SOFT_TOKEN_ID).unwrap().active);

    assert!(matches!(
        manager.activate_token(SOFT_TOKEN_ID, true, Some(pin(PIN))).await,
        Err(Error::PinIncorrect)
    ));
    assert_eq!(
        manager.get_token_info(SOFT_TOKEN_ID).unwrap().status,
        TokenStatus::UserPinIncorrect
    );

    manager.activate_token(SOFT_TOKEN_ID, true, Some(pin(NEW_PIN))).await.unwrap();
    assert_eq!(manager.get_token_info(SOFT_TOKEN_ID).unwrap().status, TokenStatus::Ok);
    sign_and_verify(&manager, &key.id).await;

    manager.shutdown().await;
}
