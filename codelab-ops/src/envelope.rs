//! Envelope encryption between the inference client and server.
//!
//! The client generates a one-time data encryption key (DEK), seals the
//! prompt with it, and wraps the DEK with KMS. The server unwraps the DEK
//! through KMS, opens the prompt, and seals its reply under the same DEK.
use std::{fmt, sync::Arc};

// "NONCE_LEN" is the per-message nonce, 12-byte
// ref. <https://www.rfc-editor.org/rfc/rfc5116#section-5.1>
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::{
    errors::{Error, Result},
    humanize,
    kms::Wrapper,
};

pub const DEK_LEN: usize = 32;

/// Binds a sealed prompt to the request direction.
pub const REQUEST_AAD: &str = "confidential-inference-request";
/// Binds a sealed reply to the response direction.
pub const RESPONSE_AAD: &str = "confidential-inference-response";

/// Represents a one-time AES-256 data encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey([u8; DEK_LEN]);

impl DataKey {
    /// Generates a key from the system CSPRNG.
    pub fn generate() -> Result<Self> {
        let mut b = [0u8; DEK_LEN];
        SystemRandom::new()
            .fill(&mut b)
            .map_err(|e| Error::other(format!("failed to generate data key ({:?})", e)))?;
        Ok(Self(b))
    }

    pub fn from_slice(d: &[u8]) -> Result<Self> {
        if d.len() != DEK_LEN {
            return Err(Error::other(format!(
                "data key must be {}-byte, got {}-byte",
                DEK_LEN,
                d.len()
            )));
        }
        let mut b = [0u8; DEK_LEN];
        b.copy_from_slice(d);
        Ok(Self(b))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey(<redacted>)")
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

fn aead_key(key: &DataKey) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.as_bytes())
        .map_err(|e| Error::other(format!("failed to create UnboundKey ({:?})", e)))?;
    Ok(LessSafeKey::new(unbound))
}

/// Seals the data with AES-256-GCM under a fresh random nonce.
/// The sealed bytes are aligned as below:
/// [ Nonce bytes ][ data ciphertext ][ tag ]
pub fn seal(key: &DataKey, aad: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|e| Error::other(format!("failed to generate nonce ({:?})", e)))?;

    let mut cipher = plaintext.to_vec();
    aead_key(key)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut cipher,
        )
        .map_err(|e| Error::other(format!("failed to seal ({:?})", e)))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + cipher.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&cipher);
    Ok(sealed)
}

/// Opens data sealed by "seal" with the same key and AAD.
pub fn open(key: &DataKey, aad: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    let min_len = NONCE_LEN + AES_256_GCM.tag_len();
    if sealed.len() < min_len {
        return Err(Error::other(format!(
            "sealed data too short ({}-byte, need at least {}-byte)",
            sealed.len(),
            min_len
        )));
    }

    let (nonce_bytes, cipher) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|e| Error::other(format!("invalid nonce ({:?})", e)))?;

    let mut cipher = cipher.to_vec();
    let plaintext = aead_key(key)?
        .open_in_place(nonce, Aad::from(aad), &mut cipher)
        .map_err(|_| Error::other("failed to open sealed data (authentication failed)"))?;
    Ok(plaintext.to_vec())
}

/// Represents the encrypted prompt sent to "/generate".
#[serde_as]
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
pub struct Request {
    #[serde_as(as = "Base64")]
    pub ciphertext: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub wrapped_dek: Vec<u8>,
}

/// Represents the encrypted generation result.
#[serde_as]
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
pub struct Reply {
    #[serde_as(as = "Base64")]
    pub generated_code_ciphertext: Vec<u8>,
}

/// Represents a failed request.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
pub struct ErrorReply {
    pub error: String,
}

/// Implements the envelope encryption exchange on top of a key wrapper.
#[derive(Clone)]
pub struct Manager {
    wrapper: Arc<dyn Wrapper>,
}

impl Manager {
    pub fn new(wrapper: Arc<dyn Wrapper>) -> Self {
        Self { wrapper }
    }

    /// Generates a DEK, seals the prompt and wraps the DEK.
    /// The DEK is returned to open the reply.
    pub async fn seal_request(&self, plaintext: &[u8]) -> Result<(Request, DataKey)> {
        log::info!(
            "envelope-encrypting request (size before encryption {})",
            humanize::bytes(plaintext.len())
        );
        let dek = DataKey::generate()?;
        let ciphertext = seal(&dek, REQUEST_AAD, plaintext)?;
        let wrapped_dek = self.wrapper.wrap(dek.as_bytes()).await?;
        Ok((
            Request {
                ciphertext,
                wrapped_dek,
            },
            dek,
        ))
    }

    /// Unwraps the DEK and opens the prompt.
    /// The DEK is returned to seal the reply.
    pub async fn open_request(&self, req: &Request) -> Result<(Vec<u8>, DataKey)> {
        log::info!(
            "envelope-decrypting request (ciphertext size {}, wrapped key size {})",
            humanize::bytes(req.ciphertext.len()),
            humanize::bytes(req.wrapped_dek.len())
        );
        let unwrapped = self.wrapper.unwrap(&req.wrapped_dek).await?;
        let dek = DataKey::from_slice(&unwrapped)?;
        let plaintext = open(&dek, REQUEST_AAD, &req.ciphertext)?;
        Ok((plaintext, dek))
    }

    pub fn seal_reply(&self, dek: &DataKey, plaintext: &[u8]) -> Result<Reply> {
        Ok(Reply {
            generated_code_ciphertext: seal(dek, RESPONSE_AAD, plaintext)?,
        })
    }

    pub fn open_reply(&self, dek: &DataKey, reply: &Reply) -> Result<Vec<u8>> {
        open(dek, RESPONSE_AAD, &reply.generated_code_ciphertext)
    }
}

#[cfg(test)]
fn test_manager() -> Manager {
    Manager::new(Arc::new(crate::kms::local::Wrapper::new(
        DataKey::generate().unwrap(),
    )))
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- envelope::test_seal_open --exact --show-output
#[test]
fn test_seal_open() {
    let key = DataKey::generate().unwrap();

    let sealed = seal(&key, REQUEST_AAD, b"def fibonacci(n):").unwrap();
    assert_eq!(sealed.len(), NONCE_LEN + 17 + AES_256_GCM.tag_len());
    assert_eq!(
        open(&key, REQUEST_AAD, &sealed).unwrap(),
        b"def fibonacci(n):".to_vec()
    );

    // fresh nonce every time
    let sealed2 = seal(&key, REQUEST_AAD, b"def fibonacci(n):").unwrap();
    assert_ne!(sealed, sealed2);

    // empty plaintext still carries the nonce and the tag
    let empty = seal(&key, REQUEST_AAD, b"").unwrap();
    assert!(open(&key, REQUEST_AAD, &empty).unwrap().is_empty());

    // direction is bound through the AAD
    assert!(open(&key, RESPONSE_AAD, &sealed).is_err());

    let mut tampered = sealed.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert!(open(&key, REQUEST_AAD, &tampered).is_err());

    let other = DataKey::generate().unwrap();
    assert!(open(&other, REQUEST_AAD, &sealed).is_err());

    let err = open(&key, REQUEST_AAD, &sealed[..NONCE_LEN + 3]).unwrap_err();
    assert!(err.message().contains("too short"));
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- envelope::test_data_key --exact --show-output
#[test]
fn test_data_key() {
    let a = DataKey::generate().unwrap();
    let b = DataKey::generate().unwrap();
    assert_ne!(a, b);
    assert_eq!(a.as_bytes().len(), DEK_LEN);
    assert_eq!(format!("{:?}", a), "DataKey(<redacted>)");

    assert_eq!(DataKey::from_slice(a.as_bytes()).unwrap(), a);
    assert!(DataKey::from_slice(&[0u8; 16]).is_err());
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- envelope::test_wire_format --exact --show-output
#[test]
fn test_wire_format() {
    let req = Request {
        ciphertext: b"hello".to_vec(),
        wrapped_dek: vec![0xff, 0x00],
    };
    let v = serde_json::to_value(&req).unwrap();
    assert_eq!(
        v,
        serde_json::json!({ "ciphertext": "aGVsbG8=", "wrapped_dek": "/wA=" })
    );
    let decoded: Request = serde_json::from_value(v).unwrap();
    assert_eq!(decoded, req);

    let reply: Reply =
        serde_json::from_str(r#"{"generated_code_ciphertext": "aGVsbG8="}"#).unwrap();
    assert_eq!(reply.generated_code_ciphertext, b"hello".to_vec());

    assert!(serde_json::from_str::<Request>(r#"{"ciphertext": "aGVsbG8="}"#).is_err());
    assert!(
        serde_json::from_str::<Request>(r#"{"ciphertext": "%%%", "wrapped_dek": "/wA="}"#)
            .is_err()
    );
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- envelope::test_manager_exchange --exact --show-output
#[tokio::test]
async fn test_manager_exchange() {
    let _ = env_logger::builder().is_test(true).try_init();

    let manager = test_manager();

    // client
    let (req, client_dek) = manager
        .seal_request("write a function to reverse a string".as_bytes())
        .await
        .unwrap();
    assert_ne!(&req.wrapped_dek[..], client_dek.as_bytes());

    // server
    let (prompt, server_dek) = manager.open_request(&req).await.unwrap();
    assert_eq!(prompt, b"write a function to reverse a string".to_vec());
    assert_eq!(server_dek, client_dek);
    let reply = manager.seal_reply(&server_dek, b"def reverse(s): return s[::-1]").unwrap();

    // client
    let answer = manager.open_reply(&client_dek, &reply).unwrap();
    assert_eq!(answer, b"def reverse(s): return s[::-1]".to_vec());

    // a request cannot be passed off as a reply
    let bounced = Reply {
        generated_code_ciphertext: req.ciphertext.clone(),
    };
    assert!(manager.open_reply(&client_dek, &bounced).is_err());
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- envelope::test_manager_bad_unwrap --exact --show-output
#[tokio::test]
async fn test_manager_bad_unwrap() {
    use async_trait::async_trait;

    struct ShortKey;

    #[async_trait]
    impl Wrapper for ShortKey {
        async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
            Ok(plaintext.to_vec())
        }
        async fn unwrap(&self, _wrapped: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![7u8; 16])
        }
    }

    let manager = Manager::new(Arc::new(ShortKey));
    let (req, _) = manager.seal_request(b"prompt").await.unwrap();
    let err = manager.open_request(&req).await.unwrap_err();
    assert!(err.message().contains("32-byte"));

    // wrapped with one KMS key, unwrapped with another
    let (req, _) = test_manager().seal_request(b"prompt").await.unwrap();
    assert!(test_manager().open_request(&req).await.is_err());
}
