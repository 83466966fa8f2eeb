use std::{fs, io};

use async_trait::async_trait;

use crate::{
    envelope::{self, DataKey},
    errors::Result,
};

const AAD_TAG: &str = "codelab-local-key-wrap";

/// Wraps data keys under a key-encryption key held in process memory.
/// Only meant for running the client and the server without Cloud KMS.
pub struct Wrapper {
    kek: DataKey,
}

impl Wrapper {
    pub fn new(kek: DataKey) -> Self {
        Self { kek }
    }

    /// Loads a hex-encoded 32-byte key-encryption key from a file.
    pub fn load(file_path: &str) -> io::Result<Self> {
        log::info!("loading local key-encryption key from {}", file_path);
        let d = fs::read_to_string(file_path)?;
        let kek = hex::decode(d.trim()).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid hex key in {} ({})", file_path, e),
            )
        })?;
        let kek = DataKey::from_slice(&kek).map_err(io::Error::from)?;
        Ok(Self::new(kek))
    }
}

#[async_trait]
impl super::Wrapper for Wrapper {
    async fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        envelope::seal(&self.kek, AAD_TAG, plaintext)
    }
    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        envelope::open(&self.kek, AAD_TAG, wrapped)
    }
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- kms::local::test_wrapper --exact --show-output
#[tokio::test]
async fn test_wrapper() {
    use std::io::Write;

    use super::Wrapper as _;

    let _ = env_logger::builder().is_test(true).try_init();

    let kek = DataKey::generate().unwrap();
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "{}", hex::encode(kek.as_bytes())).unwrap();
    let w = Wrapper::load(f.path().to_str().unwrap()).unwrap();

    let dek = DataKey::generate().unwrap();
    let wrapped = w.wrap(dek.as_bytes()).await.unwrap();
    assert_ne!(&wrapped[..], dek.as_bytes());
    assert_eq!(&w.unwrap(&wrapped).await.unwrap()[..], dek.as_bytes());

    // a different key-encryption key cannot unwrap
    let other = Wrapper::new(DataKey::generate().unwrap());
    assert!(other.unwrap(&wrapped).await.is_err());

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"not-hex").unwrap();
    let err = Wrapper::load(f.path().to_str().unwrap()).err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
}
