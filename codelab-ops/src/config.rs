use std::{
    env,
    fs::{self, File},
    io::{self, Error, ErrorKind, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

/// The attestation token the Confidential Space launcher writes for the workload.
pub const DEFAULT_CREDENTIAL_SOURCE_FILE: &str =
    "/run/container_launcher/attestation_verifier_claims_token";

/// Represents the codelab configuration shared by the server, the client
/// and the workloads. Every section is optional; each binary validates
/// the sections it needs.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_identity: Option<WorkloadIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<KmsKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Storage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_server_url: Option<String>,
}

/// Identifies the workload identity pool provider and the service account
/// the attested workload impersonates.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub struct WorkloadIdentity {
    pub project_id: String,
    pub project_number: String,
    pub pool: String,
    pub provider: String,
    pub service_account: String,
    #[serde(default = "default_credential_source_file")]
    pub credential_source_file: String,
}

fn default_credential_source_file() -> String {
    String::from(DEFAULT_CREDENTIAL_SOURCE_FILE)
}

/// Identifies the KMS key that wraps the data encryption keys.
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub struct KmsKey {
    pub project_id: String,
    pub location: String,
    pub key_ring: String,
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone, Default)]
#[serde(rename_all = "snake_case")]
pub struct Storage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_prefix: Option<String>,
    /// Bucket of the model owner that holds the protected model archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_bucket: Option<String>,
}

impl Config {
    /// Reads the configuration from the codelab environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|k| env::var(k).ok())
    }

    /// Reads the configuration through the given variable lookup.
    /// A section is only set if at least one of its variables is found.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).filter(|v| !v.is_empty());
        let or_empty = |k: &str| get(k).unwrap_or_default();

        let wi_vars = [
            "PRIMUS_PROJECT_NUMBER",
            "PRIMUS_WORKLOAD_IDENTITY_POOL",
            "PRIMUS_WIP_PROVIDER",
            "PRIMUS_SERVICEACCOUNT",
        ];
        let workload_identity = if wi_vars.iter().any(|&k| get(k).is_some()) {
            Some(WorkloadIdentity {
                project_id: or_empty("PRIMUS_PROJECT_ID"),
                project_number: or_empty("PRIMUS_PROJECT_NUMBER"),
                pool: or_empty("PRIMUS_WORKLOAD_IDENTITY_POOL"),
                provider: or_empty("PRIMUS_WIP_PROVIDER"),
                service_account: or_empty("PRIMUS_SERVICEACCOUNT"),
                credential_source_file: default_credential_source_file(),
            })
        } else {
            None
        };

        // the digital asset codelab names the key "PRIMUS_KEY"
        let key = get("PRIMUS_KEY_ID").or_else(|| get("PRIMUS_KEY"));
        let kms = if key.is_some() || get("PRIMUS_KEYRING").is_some() {
            Some(KmsKey {
                project_id: or_empty("PRIMUS_PROJECT_ID"),
                location: or_empty("PRIMUS_PROJECT_LOCATION"),
                key_ring: or_empty("PRIMUS_KEYRING"),
                key: key.unwrap_or_default(),
            })
        } else {
            None
        };

        let storage = Storage {
            model_bucket: get("PRIMUS_MODEL_STORAGE_BUCKET"),
            model_prefix: None,
            input_bucket: get("PRIMUS_INPUT_STORAGE_BUCKET"),
            image_bucket: get("SECUNDUS_INPUT_STORAGE_BUCKET"),
            result_bucket: get("SECUNDUS_RESULT_STORAGE_BUCKET"),
        };
        let storage = if storage == Storage::default() {
            None
        } else {
            Some(storage)
        };

        Self {
            workload_identity,
            kms,
            storage,
            inference_server_url: get("INFERENCE_SERVER_URL"),
        }
    }

    /// Loads the configuration from the file if given, otherwise from the environment.
    pub fn load_or_env(file_path: Option<&str>) -> io::Result<Self> {
        match file_path {
            Some(p) if !p.is_empty() => Self::load(p),
            _ => {
                log::info!("loading Config from environment variables");
                Ok(Self::from_env())
            }
        }
    }

    pub fn encode_yaml(&self) -> io::Result<String> {
        serde_yaml::to_string(&self).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to serialize Config to YAML {}", e),
            )
        })
    }

    pub fn sync(&self, file_path: &str) -> io::Result<()> {
        log::info!("syncing Config to '{}'", file_path);

        let path = Path::new(file_path);
        if let Some(parent_dir) = path.parent() {
            log::info!("creating parent dir '{}'", parent_dir.display());
            fs::create_dir_all(parent_dir)?;
        }

        let d = self.encode_yaml()?;
        let mut f = File::create(file_path)?;
        f.write_all(d.as_bytes())
    }

    pub fn load(file_path: &str) -> io::Result<Self> {
        log::info!("loading Config from {}", file_path);

        if !Path::new(file_path).exists() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("file {} does not exists", file_path),
            ));
        }

        let f = File::open(file_path).map_err(|e| {
            Error::new(
                ErrorKind::Other,
                format!("failed to open {} ({})", file_path, e),
            )
        })?;
        serde_yaml::from_reader(f)
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("invalid YAML: {}", e)))
    }

    /// Validates every section that is present.
    pub fn validate(&self) -> io::Result<()> {
        log::info!("validating Config");

        if let Some(wi) = &self.workload_identity {
            require("workload_identity.project_id", &wi.project_id)?;
            require("workload_identity.project_number", &wi.project_number)?;
            require("workload_identity.pool", &wi.pool)?;
            require("workload_identity.provider", &wi.provider)?;
            require("workload_identity.service_account", &wi.service_account)?;
            require(
                "workload_identity.credential_source_file",
                &wi.credential_source_file,
            )?;
        }
        if let Some(k) = &self.kms {
            require("kms.project_id", &k.project_id)?;
            require("kms.location", &k.location)?;
            require("kms.key_ring", &k.key_ring)?;
            require("kms.key", &k.key)?;
        }
        if let Some(u) = &self.inference_server_url {
            if !u.starts_with("http://") && !u.starts_with("https://") {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("inference_server_url '{}' is not an HTTP URL", u),
                ));
            }
        }

        Ok(())
    }

    pub fn workload_identity(&self) -> io::Result<&WorkloadIdentity> {
        self.workload_identity
            .as_ref()
            .ok_or_else(|| missing("workload_identity"))
    }

    pub fn kms(&self) -> io::Result<&KmsKey> {
        self.kms.as_ref().ok_or_else(|| missing("kms"))
    }

    pub fn storage(&self) -> io::Result<&Storage> {
        self.storage.as_ref().ok_or_else(|| missing("storage"))
    }
}

impl KmsKey {
    /// Returns the full resource name of the crypto key.
    pub fn name(&self) -> String {
        crate::kms::crypto_key_path(&self.project_id, &self.location, &self.key_ring, &self.key)
    }
}

impl Storage {
    pub fn model_bucket(&self) -> io::Result<&str> {
        configured("storage.model_bucket", &self.model_bucket)
    }

    pub fn input_bucket(&self) -> io::Result<&str> {
        configured("storage.input_bucket", &self.input_bucket)
    }

    pub fn image_bucket(&self) -> io::Result<&str> {
        configured("storage.image_bucket", &self.image_bucket)
    }

    pub fn result_bucket(&self) -> io::Result<&str> {
        configured("storage.result_bucket", &self.result_bucket)
    }
}

/// Returns the value or an "InvalidInput" error naming the missing field.
fn configured<'a>(field: &str, v: &'a Option<String>) -> io::Result<&'a str> {
    match v {
        Some(s) if !s.is_empty() => Ok(s.as_str()),
        _ => Err(missing(field)),
    }
}

fn require(field: &str, v: &str) -> io::Result<()> {
    if v.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("{} is empty", field),
        ));
    }
    Ok(())
}

fn missing(field: &str) -> Error {
    Error::new(ErrorKind::InvalidInput, format!("{} is not configured", field))
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- config::test_config --exact --show-output
#[test]
fn test_config() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .is_test(true)
        .try_init();

    let contents = r#"

workload_identity:
  project_id: primus-project
  project_number: "123456789"
  pool: primus-pool
  provider: primus-provider
  service_account: run-confidential-vm

kms:
  project_id: primus-project
  location: global
  key_ring: primus-keyring
  key: primus-key

storage:
  model_bucket: vertex-model-garden-public-us
  model_prefix: codegemma/codegemma-2b

inference_server_url: http://10.0.0.2:8080/generate

"#;
    let mut f = tempfile::NamedTempFile::new().unwrap();
    let ret = f.write_all(contents.as_bytes());
    assert!(ret.is_ok());
    let config_path = f.path().to_str().unwrap();

    let cfg = Config::load(config_path).unwrap();
    cfg.validate().unwrap();

    let wi = cfg.workload_identity().unwrap();
    assert_eq!(wi.project_number, "123456789");
    assert_eq!(wi.credential_source_file, DEFAULT_CREDENTIAL_SOURCE_FILE);
    assert_eq!(
        cfg.kms().unwrap().name(),
        "projects/primus-project/locations/global/keyRings/primus-keyring/cryptoKeys/primus-key"
    );
    let storage = cfg.storage().unwrap();
    assert_eq!(
        storage.model_bucket().unwrap(),
        "vertex-model-garden-public-us"
    );
    let err = storage.result_bucket().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().contains("storage.result_bucket"));

    let tmp_dir = tempfile::tempdir().unwrap();
    let synced = tmp_dir.path().join("nested").join("config.yaml");
    let synced = synced.to_str().unwrap();
    cfg.sync(synced).unwrap();
    assert_eq!(Config::load(synced).unwrap(), cfg);

    let err = Config::load(tmp_dir.path().join("nope.yaml").to_str().unwrap()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- config::test_config_validate --exact --show-output
#[test]
fn test_config_validate() {
    let mut cfg = Config {
        kms: Some(KmsKey {
            project_id: String::from("p"),
            location: String::from("global"),
            key_ring: String::new(),
            key: String::from("k"),
        }),
        ..Default::default()
    };
    let err = cfg.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().contains("kms.key_ring"));

    cfg.kms.as_mut().unwrap().key_ring = String::from("r");
    cfg.validate().unwrap();

    cfg.inference_server_url = Some(String::from("10.0.0.2:8080/generate"));
    assert!(cfg.validate().is_err());

    assert!(Config::default().workload_identity().is_err());
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- config::test_config_from_vars --exact --show-output
#[test]
fn test_config_from_vars() {
    use std::collections::HashMap;

    let vars: HashMap<&str, &str> = [
        ("PRIMUS_PROJECT_ID", "primus-project"),
        ("PRIMUS_PROJECT_NUMBER", "42"),
        ("PRIMUS_PROJECT_LOCATION", "us-central1"),
        ("PRIMUS_KEYRING", "ring"),
        ("PRIMUS_KEY", "legacy-key"),
        ("PRIMUS_WORKLOAD_IDENTITY_POOL", "pool"),
        ("PRIMUS_WIP_PROVIDER", "attestation-verifier"),
        ("PRIMUS_SERVICEACCOUNT", "run-confidential-vm"),
        ("SECUNDUS_RESULT_STORAGE_BUCKET", "secundus-results"),
        ("INFERENCE_SERVER_URL", ""),
    ]
    .into_iter()
    .collect();

    let cfg = Config::from_vars(|k| vars.get(k).map(|v| v.to_string()));
    cfg.validate().unwrap();

    let wi = cfg.workload_identity.as_ref().unwrap();
    assert_eq!(wi.provider, "attestation-verifier");
    assert_eq!(wi.credential_source_file, DEFAULT_CREDENTIAL_SOURCE_FILE);

    let k = cfg.kms.as_ref().unwrap();
    assert_eq!(k.key, "legacy-key");
    assert_eq!(k.location, "us-central1");

    let storage = cfg.storage.as_ref().unwrap();
    assert_eq!(storage.result_bucket.as_deref(), Some("secundus-results"));
    assert!(storage.model_bucket.is_none());

    // empty values count as unset
    assert!(cfg.inference_server_url.is_none());

    let cfg = Config::from_vars(|_| None);
    assert_eq!(cfg, Config::default());
}
