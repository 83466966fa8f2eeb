pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as, DisplayFromStr};

use crate::{
    credential::{decode_json, TokenSource},
    errors::{Error, Result},
    humanize,
};

pub const CLOUD_KMS_ENDPOINT: &str = "https://cloudkms.googleapis.com";

/// Returns the resource name of a KMS crypto key.
pub fn crypto_key_path(project_id: &str, location: &str, key_ring: &str, key: &str) -> String {
    format!("projects/{project_id}/locations/{location}/keyRings/{key_ring}/cryptoKeys/{key}")
}

/// Wraps and unwraps data encryption keys with a key the caller never sees.
#[async_trait]
pub trait Wrapper: Send + Sync {
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>>;
}

#[serde_as]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncryptRequest<'a> {
    #[serde_as(as = "Base64")]
    plaintext: &'a [u8],
    #[serde_as(as = "DisplayFromStr")]
    plaintext_crc32c: u32,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EncryptResponse {
    /// The crypto key version that encrypted the data.
    #[serde(default)]
    name: String,
    #[serde_as(as = "Base64")]
    ciphertext: Vec<u8>,
    #[serde_as(as = "DisplayFromStr")]
    ciphertext_crc32c: u32,
    #[serde(default)]
    verified_plaintext_crc32c: bool,
}

#[serde_as]
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecryptRequest<'a> {
    #[serde_as(as = "Base64")]
    ciphertext: &'a [u8],
    #[serde_as(as = "DisplayFromStr")]
    ciphertext_crc32c: u32,
}

#[serde_as]
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DecryptResponse {
    #[serde_as(as = "Base64")]
    plaintext: Vec<u8>,
    #[serde_as(as = "DisplayFromStr")]
    plaintext_crc32c: u32,
}

/// Implements the Cloud KMS symmetric encrypt/decrypt client.
/// Every call carries and verifies CRC32C checksums.
/// ref. <https://cloud.google.com/kms/docs/data-integrity-guidelines>
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: String,
    key_name: String,
    tokens: Arc<TokenSource>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(key_name: &str, tokens: Arc<TokenSource>) -> Self {
        Self::with_endpoint(CLOUD_KMS_ENDPOINT, key_name, tokens)
    }

    pub fn with_endpoint(endpoint: &str, key_name: &str, tokens: Arc<TokenSource>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            key_name: key_name.to_string(),
            tokens,
            http: reqwest::Client::new(),
        }
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Cloud KMS answers with the key version name, "{key}/cryptoKeyVersions/{n}".
    fn is_key_or_version(&self, name: &str) -> bool {
        match name.strip_prefix(self.key_name.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix("/cryptoKeyVersions/")
                .map_or(false, |v| !v.is_empty() && !v.contains('/')),
            None => false,
        }
    }

    /// Encrypts data with the crypto key. Cloud KMS accepts up to 64 KiB
    /// of plaintext per call, which is far more than any data key.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        log::info!(
            "encrypting data with '{}' (plaintext size {})",
            self.key_name,
            humanize::bytes(plaintext.len())
        );

        let url = format!("{}/v1/{}:encrypt", self.endpoint, self.key_name);
        let req = self.tokens.authorize(self.http.post(url)).await?;
        let resp = req
            .json(&EncryptRequest {
                plaintext,
                plaintext_crc32c: crc32c::crc32c(plaintext),
            })
            .send()
            .await
            .map_err(|e| Error::from_reqwest("encrypt", e))?;
        let out: EncryptResponse = decode_json("encrypt", resp).await?;

        if !self.is_key_or_version(&out.name) {
            log::warn!("encrypt response names '{}', expected '{}'", out.name, self.key_name);
            return Err(corrupted("Encrypt: response for unexpected key"));
        }
        if !out.verified_plaintext_crc32c {
            return Err(corrupted("Encrypt: request corrupted in-transit"));
        }
        if crc32c::crc32c(&out.ciphertext) != out.ciphertext_crc32c {
            return Err(corrupted("Encrypt: response corrupted in-transit"));
        }

        log::info!(
            "encrypted data (ciphertext size {})",
            humanize::bytes(out.ciphertext.len())
        );
        Ok(out.ciphertext)
    }

    /// Decrypts data that was encrypted with the crypto key.
    pub async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        log::info!(
            "decrypting data with '{}' (ciphertext size {})",
            self.key_name,
            humanize::bytes(ciphertext.len())
        );

        let url = format!("{}/v1/{}:decrypt", self.endpoint, self.key_name);
        let req = self.tokens.authorize(self.http.post(url)).await?;
        let resp = req
            .json(&DecryptRequest {
                ciphertext,
                ciphertext_crc32c: crc32c::crc32c(ciphertext),
            })
            .send()
            .await
            .map_err(|e| Error::from_reqwest("decrypt", e))?;
        let out: DecryptResponse = decode_json("decrypt", resp).await?;

        if crc32c::crc32c(&out.plaintext) != out.plaintext_crc32c {
            return Err(corrupted("Decrypt: response corrupted in-transit"));
        }

        log::info!(
            "decrypted data (plaintext size {})",
            humanize::bytes(out.plaintext.len())
        );
        Ok(out.plaintext)
    }
}

fn corrupted(msg: &str) -> Error {
    Error::API {
        message: String::from(msg),
        is_retryable: false,
    }
}

#[async_trait]
impl Wrapper for Client {
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(plaintext).await
    }
    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.decrypt(wrapped).await
    }
}

/// Stands in for Cloud KMS in tests. "Encrypts" by reversing the bytes,
/// which is enough to tell wrapped from unwrapped data. When "corrupt" is
/// set, the returned checksums are off by one.
#[cfg(test)]
pub(crate) async fn spawn_fake_kms(
    key_name: &'static str,
    corrupt: bool,
) -> (std::net::SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warp::Filter;

    #[serde_as]
    #[derive(Deserialize)]
    struct Req {
        #[serde_as(as = "Option<Base64>")]
        #[serde(default)]
        plaintext: Option<Vec<u8>>,
        #[serde_as(as = "Option<Base64>")]
        #[serde(default)]
        ciphertext: Option<Vec<u8>>,
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let routes = warp::post()
        .and(warp::path("v1"))
        .and(warp::path::tail())
        .and(warp::header::<String>("authorization"))
        .and(warp::body::json())
        .map(move |tail: warp::path::Tail, auth: String, req: Req| {
            counter.fetch_add(1, Ordering::SeqCst);
            let bump = u32::from(corrupt);
            let path = tail.as_str().to_string();
            let authorized = auth == "Bearer kms-token";
            let body = if !authorized || !path.starts_with(key_name) {
                serde_json::json!({ "error": { "code": 403, "message": "denied" } })
            } else if path.ends_with(":encrypt") {
                let mut d = req.plaintext.unwrap_or_default();
                d.reverse();
                let crc = crc32c::crc32c(&d).wrapping_add(bump);
                serde_json::json!({
                    "name": format!("{key_name}/cryptoKeyVersions/1"),
                    "ciphertext": base64_encode(&d),
                    "ciphertextCrc32c": crc.to_string(),
                    "verifiedPlaintextCrc32c": true,
                })
            } else {
                let mut d = req.ciphertext.unwrap_or_default();
                d.reverse();
                let crc = crc32c::crc32c(&d).wrapping_add(bump);
                serde_json::json!({
                    "plaintext": base64_encode(&d),
                    "plaintextCrc32c": crc.to_string(),
                })
            };
            let status = if body.get("error").is_some() {
                warp::http::StatusCode::FORBIDDEN
            } else {
                warp::http::StatusCode::OK
            };
            warp::reply::with_status(warp::reply::json(&body), status)
        });
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, calls)
}

#[cfg(test)]
fn base64_encode(d: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(d)
}

#[cfg(test)]
const TEST_KEY: &str = "projects/p/locations/global/keyRings/r/cryptoKeys/k";

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- kms::test_crypto_key_path --exact --show-output
#[test]
fn test_crypto_key_path() {
    assert_eq!(crypto_key_path("p", "global", "r", "k"), TEST_KEY);
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- kms::test_client --exact --show-output
#[tokio::test]
async fn test_client() {
    use crate::credential::Provider;

    let _ = env_logger::builder().is_test(true).try_init();

    let (addr, calls) = spawn_fake_kms(TEST_KEY, false).await;
    let tokens = Arc::new(TokenSource::new(Provider::Static(String::from("kms-token"))));
    let cli = Client::with_endpoint(&format!("http://{addr}/"), TEST_KEY, tokens);
    assert_eq!(cli.key_name(), TEST_KEY);

    let wrapped = cli.wrap(b"data-encryption-key").await.unwrap();
    assert_eq!(wrapped, b"yek-noitpyrcne-atad".to_vec());
    let unwrapped = cli.unwrap(&wrapped).await.unwrap();
    assert_eq!(unwrapped, b"data-encryption-key".to_vec());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

    // wrong key name
    let other = Client::with_endpoint(
        &format!("http://{addr}"),
        "projects/p/locations/global/keyRings/r/cryptoKeys/other",
        Arc::new(TokenSource::new(Provider::Static(String::from("kms-token")))),
    );
    let err = other.encrypt(b"x").await.unwrap_err();
    assert!(err.message().contains("403"));
    assert!(!err.is_retryable());

    // no credentials
    let anonymous =
        Client::with_endpoint(&format!("http://{addr}"), TEST_KEY, Arc::new(TokenSource::anonymous()));
    assert!(anonymous.decrypt(b"x").await.is_err());
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- kms::test_client_corrupted --exact --show-output
#[tokio::test]
async fn test_client_corrupted() {
    use crate::credential::Provider;

    let _ = env_logger::builder().is_test(true).try_init();

    let (addr, _) = spawn_fake_kms(TEST_KEY, true).await;
    let tokens = Arc::new(TokenSource::new(Provider::Static(String::from("kms-token"))));
    let cli = Client::with_endpoint(&format!("http://{addr}"), TEST_KEY, tokens);

    let err = cli.encrypt(b"secret").await.unwrap_err();
    assert_eq!(err.message(), "Encrypt: response corrupted in-transit");
    let err = cli.decrypt(b"terces").await.unwrap_err();
    assert_eq!(err.message(), "Decrypt: response corrupted in-transit");
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- kms::test_client_unexpected_key --exact --show-output
#[tokio::test]
async fn test_client_unexpected_key() {
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    // well-formed and checksummed, but produced by another key
    let routes = warp::post().and(warp::path("v1")).map(|| {
        let ciphertext = b"ciphertext".to_vec();
        warp::reply::json(&serde_json::json!({
            "name": "projects/p/locations/global/keyRings/r/cryptoKeys/other/cryptoKeyVersions/1",
            "ciphertext": base64_encode(&ciphertext),
            "ciphertextCrc32c": crc32c::crc32c(&ciphertext).to_string(),
            "verifiedPlaintextCrc32c": true,
        }))
    });
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let cli = Client::with_endpoint(
        &format!("http://{addr}"),
        TEST_KEY,
        Arc::new(TokenSource::anonymous()),
    );
    let err = cli.encrypt(b"secret").await.unwrap_err();
    assert_eq!(err.message(), "Encrypt: response for unexpected key");
    assert!(!err.is_retryable());

    assert!(cli.is_key_or_version(TEST_KEY));
    assert!(cli.is_key_or_version(&format!("{TEST_KEY}/cryptoKeyVersions/7")));
    assert!(!cli.is_key_or_version(""));
    assert!(!cli.is_key_or_version(&format!("{TEST_KEY}2")));
    assert!(!cli.is_key_or_version(&format!("{TEST_KEY}/cryptoKeyVersions/")));
}
