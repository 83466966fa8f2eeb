//! Workload identity federation: builds the "external_account" credential
//! configuration and exchanges the attestation token for access tokens.
use std::{
    fs::{self, File},
    io::{self, Error as IoError, ErrorKind, Write},
    path::Path,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    config::WorkloadIdentity,
    errors::{Error, Result},
};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

pub const STS_TOKEN_URL: &str = "https://sts.googleapis.com/v1/token";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

pub const EXTERNAL_ACCOUNT_TYPE: &str = "external_account";
pub const SUBJECT_TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
const GRANT_TYPE_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const REQUESTED_TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Impersonated tokens are requested for one hour.
const IMPERSONATION_LIFETIME: &str = "3600s";

/// Tokens are refreshed this many seconds before they expire.
const EXPIRY_SKEW_SECONDS: i64 = 60;
/// Google access tokens live at most 12 hours; longer "expires_in" values are clamped.
const MAX_TOKEN_LIFETIME_SECONDS: i64 = 12 * 60 * 60;

/// Returns the resource name of the workload identity pool provider.
pub fn provider_name(project_number: &str, pool: &str, provider: &str) -> String {
    format!(
        "projects/{project_number}/locations/global/workloadIdentityPools/{pool}/providers/{provider}"
    )
}

/// Returns the e-mail of a user-managed service account.
pub fn service_account_email(service_account: &str, project_id: &str) -> String {
    format!("{service_account}@{project_id}.iam.gserviceaccount.com")
}

/// Represents the "external_account" credential configuration.
/// ref. <https://google.aip.dev/auth/4117>
#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
pub struct ExternalAccount {
    #[serde(rename = "type")]
    pub kind: String,
    pub audience: String,
    pub subject_token_type: String,
    pub token_url: String,
    pub credential_source: CredentialSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_impersonation_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Eq, PartialEq, Clone)]
pub struct CredentialSource {
    pub file: String,
}

impl ExternalAccount {
    pub fn from_workload_identity(wi: &WorkloadIdentity) -> Self {
        let provider = provider_name(&wi.project_number, &wi.pool, &wi.provider);
        let email = service_account_email(&wi.service_account, &wi.project_id);
        Self {
            kind: String::from(EXTERNAL_ACCOUNT_TYPE),
            audience: format!("//iam.googleapis.com/{provider}"),
            subject_token_type: String::from(SUBJECT_TOKEN_TYPE_JWT),
            token_url: String::from(STS_TOKEN_URL),
            credential_source: CredentialSource {
                file: wi.credential_source_file.clone(),
            },
            service_account_impersonation_url: Some(format!(
                "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/{email}:generateAccessToken"
            )),
        }
    }

    pub fn encode_json(&self) -> io::Result<String> {
        serde_json::to_string_pretty(&self).map_err(|e| {
            IoError::new(
                ErrorKind::Other,
                format!("failed to serialize ExternalAccount to JSON {}", e),
            )
        })
    }

    pub fn sync(&self, file_path: &str) -> io::Result<()> {
        log::info!("syncing ExternalAccount to '{}'", file_path);

        let path = Path::new(file_path);
        if let Some(parent_dir) = path.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        let d = self.encode_json()?;
        let mut f = File::create(file_path)?;
        f.write_all(d.as_bytes())
    }

    pub fn load(file_path: &str) -> io::Result<Self> {
        log::info!("loading ExternalAccount from {}", file_path);

        if !Path::new(file_path).exists() {
            return Err(IoError::new(
                ErrorKind::NotFound,
                format!("file {} does not exists", file_path),
            ));
        }

        let f = File::open(file_path)?;
        let ea: Self = serde_json::from_reader(f)
            .map_err(|e| IoError::new(ErrorKind::InvalidInput, format!("invalid JSON: {}", e)))?;
        if ea.kind != EXTERNAL_ACCOUNT_TYPE {
            return Err(IoError::new(
                ErrorKind::InvalidInput,
                format!("unexpected credential type '{}'", ea.kind),
            ));
        }
        Ok(ea)
    }
}

/// Represents a bearer access token and its expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn expiring_in(token: String, seconds: i64) -> Result<Self> {
        if seconds <= 0 {
            return Err(Error::other(format!("invalid token lifetime {}s", seconds)));
        }
        let seconds = seconds.min(MAX_TOKEN_LIFETIME_SECONDS);
        let expires_at = Utc::now()
            .checked_add_signed(Duration::seconds(seconds))
            .ok_or_else(|| Error::other(format!("token lifetime {}s out of range", seconds)))?;
        Ok(Self { token, expires_at })
    }

    /// Returns true if the token is still usable at "now" with the refresh skew applied.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_SKEW_SECONDS) < self.expires_at
    }
}

/// Defines where the access tokens come from.
#[derive(Debug, Clone)]
pub enum Provider {
    /// Workload identity federation with an attestation token.
    ExternalAccount(ExternalAccount),
    /// The default service account of the VM, from the metadata server.
    Metadata { url: String },
    /// A caller-supplied bearer token.
    Static(String),
    /// No credentials (e.g., public buckets).
    Anonymous,
}

#[derive(Debug, Deserialize)]
struct StsResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ImpersonationRequest<'a> {
    scope: &'a [String],
    lifetime: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpersonationResponse {
    access_token: String,
    #[serde(with = "rfc3339")]
    expire_time: DateTime<Utc>,
}

mod rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Fetches and caches access tokens for one provider.
#[derive(Debug)]
pub struct TokenSource {
    provider: Provider,
    scopes: Vec<String>,
    http: reqwest::Client,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            scopes: vec![String::from(CLOUD_PLATFORM_SCOPE)],
            http: reqwest::Client::new(),
            cached: Mutex::new(None),
        }
    }

    /// Impersonates the workload identity service account.
    pub fn external_account(wi: &WorkloadIdentity) -> Self {
        Self::new(Provider::ExternalAccount(
            ExternalAccount::from_workload_identity(wi),
        ))
    }

    /// Uses the default credentials of the VM.
    pub fn metadata() -> Self {
        Self::new(Provider::Metadata {
            url: String::from(METADATA_TOKEN_URL),
        })
    }

    pub fn anonymous() -> Self {
        Self::new(Provider::Anonymous)
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Returns a bearer token, or None for anonymous access.
    pub async fn token(&self) -> Result<Option<String>> {
        let mut cached = self.cached.lock().await;
        if let Some(t) = cached.as_ref() {
            if t.is_fresh(Utc::now()) {
                return Ok(Some(t.token.clone()));
            }
            log::info!("access token expires at {}, refreshing", t.expires_at);
        }

        let fetched = match &self.provider {
            Provider::Anonymous => return Ok(None),
            Provider::Static(t) => return Ok(Some(t.clone())),
            Provider::ExternalAccount(ea) => self.fetch_external_account(ea).await?,
            Provider::Metadata { url } => self.fetch_metadata(url).await?,
        };
        let token = fetched.token.clone();
        *cached = Some(fetched);
        Ok(Some(token))
    }

    /// Sets the authorization header, if the provider has credentials.
    pub async fn authorize(&self, req: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match self.token().await? {
            Some(t) => Ok(req.bearer_auth(t)),
            None => Ok(req),
        }
    }

    async fn fetch_external_account(&self, ea: &ExternalAccount) -> Result<AccessToken> {
        log::info!(
            "exchanging subject token from '{}' for audience '{}'",
            ea.credential_source.file,
            ea.audience
        );
        let subject_token = tokio::fs::read_to_string(&ea.credential_source.file)
            .await
            .map_err(|e| {
                Error::other(format!(
                    "failed to read subject token {} ({})",
                    ea.credential_source.file, e
                ))
            })?;
        let subject_token = subject_token.trim();
        if subject_token.is_empty() {
            return Err(Error::other(format!(
                "empty subject token in {}",
                ea.credential_source.file
            )));
        }

        let scope = self.scopes.join(" ");
        let form = [
            ("grant_type", GRANT_TYPE_TOKEN_EXCHANGE),
            ("audience", ea.audience.as_str()),
            ("scope", scope.as_str()),
            ("requested_token_type", REQUESTED_TOKEN_TYPE_ACCESS_TOKEN),
            ("subject_token", subject_token),
            ("subject_token_type", ea.subject_token_type.as_str()),
        ];
        let resp = self
            .http
            .post(&ea.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::from_reqwest("token exchange", e))?;
        let sts: StsResponse = decode_json("token exchange", resp).await?;
        let federated =
            AccessToken::expiring_in(sts.access_token, sts.expires_in.unwrap_or(3600))?;

        let url = match &ea.service_account_impersonation_url {
            Some(u) if !u.is_empty() => u,
            _ => {
                log::info!("using federated token without impersonation");
                return Ok(federated);
            }
        };

        log::info!("impersonating service account via '{}'", url);
        let resp = self
            .http
            .post(url)
            .bearer_auth(&federated.token)
            .json(&ImpersonationRequest {
                scope: &self.scopes,
                lifetime: IMPERSONATION_LIFETIME,
            })
            .send()
            .await
            .map_err(|e| Error::from_reqwest("generateAccessToken", e))?;
        let imp: ImpersonationResponse = decode_json("generateAccessToken", resp).await?;
        log::info!("impersonated token expires at {}", imp.expire_time);

        Ok(AccessToken {
            token: imp.access_token,
            expires_at: imp.expire_time,
        })
    }

    async fn fetch_metadata(&self, url: &str) -> Result<AccessToken> {
        log::info!("fetching default credentials from metadata server");
        let resp = self
            .http
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::from_reqwest("metadata token", e))?;
        let t: StsResponse = decode_json("metadata token", resp).await?;
        AccessToken::expiring_in(t.access_token, t.expires_in.unwrap_or(3600))
    }
}

/// Decodes a JSON body, turning non-2xx responses into API errors.
pub(crate) async fn decode_json<T>(op: &str, resp: reqwest::Response) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::from_status(op, status, &body));
    }
    resp.json::<T>()
        .await
        .map_err(|e| Error::other(format!("failed to decode {op} response ({e})")))
}

#[cfg(test)]
fn test_workload_identity(credential_source_file: &str) -> WorkloadIdentity {
    WorkloadIdentity {
        project_id: String::from("primus-project"),
        project_number: String::from("123456789"),
        pool: String::from("primus-pool"),
        provider: String::from("attestation-verifier"),
        service_account: String::from("run-confidential-vm"),
        credential_source_file: String::from(credential_source_file),
    }
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- credential::test_external_account --exact --show-output
#[test]
fn test_external_account() {
    let _ = env_logger::builder().is_test(true).try_init();

    let ea = ExternalAccount::from_workload_identity(&test_workload_identity(
        crate::config::DEFAULT_CREDENTIAL_SOURCE_FILE,
    ));
    assert_eq!(
        ea.audience,
        "//iam.googleapis.com/projects/123456789/locations/global/workloadIdentityPools/primus-pool/providers/attestation-verifier"
    );
    assert_eq!(
        ea.service_account_impersonation_url.as_deref(),
        Some("https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/run-confidential-vm@primus-project.iam.gserviceaccount.com:generateAccessToken")
    );

    let encoded: serde_json::Value = serde_json::from_str(&ea.encode_json().unwrap()).unwrap();
    assert_eq!(encoded["type"], "external_account");
    assert_eq!(encoded["token_url"], STS_TOKEN_URL);
    assert_eq!(
        encoded["credential_source"]["file"],
        "/run/container_launcher/attestation_verifier_claims_token"
    );

    let tmp_dir = tempfile::tempdir().unwrap();
    let p = tmp_dir.path().join("credential-config.json");
    let p = p.to_str().unwrap();
    ea.sync(p).unwrap();
    assert_eq!(ExternalAccount::load(p).unwrap(), ea);

    let mut other = ea.clone();
    other.kind = String::from("service_account");
    other.sync(p).unwrap();
    assert_eq!(
        ExternalAccount::load(p).unwrap_err().kind(),
        ErrorKind::InvalidInput
    );
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- credential::test_access_token_is_fresh --exact --show-output
#[test]
fn test_access_token_is_fresh() {
    let now = Utc::now();
    let t = AccessToken {
        token: String::from("t"),
        expires_at: now + Duration::seconds(120),
    };
    assert!(t.is_fresh(now));
    assert!(!t.is_fresh(now + Duration::seconds(61)));
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- credential::test_token_source_external_account --exact --show-output
#[tokio::test]
async fn test_token_source_external_account() {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    let exchanges = Arc::new(AtomicUsize::new(0));
    let counter = exchanges.clone();
    let sts = warp::path!("v1" / "token")
        .and(warp::post())
        .and(warp::body::form())
        .map(move |form: HashMap<String, String>| {
            counter.fetch_add(1, Ordering::SeqCst);
            let ok = form.get("grant_type").map(String::as_str) == Some(GRANT_TYPE_TOKEN_EXCHANGE)
                && form.get("subject_token_type").map(String::as_str)
                    == Some(SUBJECT_TOKEN_TYPE_JWT)
                && form.get("scope").map(String::as_str) == Some(CLOUD_PLATFORM_SCOPE);
            let subject = form.get("subject_token").cloned().unwrap_or_default();
            warp::reply::json(&serde_json::json!({
                "access_token": if ok { format!("federated-{subject}") } else { String::from("bad-form") },
                "issued_token_type": REQUESTED_TOKEN_TYPE_ACCESS_TOKEN,
                "token_type": "Bearer",
                "expires_in": 3600,
            }))
        });
    let iam = warp::path!("v1" / "impersonate")
        .and(warp::post())
        .and(warp::header::<String>("authorization"))
        .and(warp::body::json())
        .map(|auth: String, body: serde_json::Value| {
            let bearer = auth.trim_start_matches("Bearer ").to_string();
            let lifetime = body["lifetime"].as_str().unwrap_or_default().to_string();
            warp::reply::json(&serde_json::json!({
                "accessToken": format!("impersonated-{bearer}-{lifetime}"),
                "expireTime": (Utc::now() + Duration::hours(1)).to_rfc3339(),
            }))
        });
    let (addr, server) = warp::serve(sts.or(iam)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"attestation-jwt\n").unwrap();

    let mut ea =
        ExternalAccount::from_workload_identity(&test_workload_identity(f.path().to_str().unwrap()));
    ea.token_url = format!("http://{addr}/v1/token");
    ea.service_account_impersonation_url = Some(format!("http://{addr}/v1/impersonate"));

    let ts = TokenSource::new(Provider::ExternalAccount(ea.clone()));
    let token = ts.token().await.unwrap();
    assert_eq!(
        token.as_deref(),
        Some("impersonated-federated-attestation-jwt-3600s")
    );

    // served from the cache
    let token = ts.token().await.unwrap();
    assert_eq!(
        token.as_deref(),
        Some("impersonated-federated-attestation-jwt-3600s")
    );
    assert_eq!(exchanges.load(Ordering::SeqCst), 1);

    // without impersonation, the federated token is used as is
    ea.service_account_impersonation_url = None;
    let ts = TokenSource::new(Provider::ExternalAccount(ea.clone()));
    assert_eq!(
        ts.token().await.unwrap().as_deref(),
        Some("federated-attestation-jwt")
    );

    // empty attestation token
    let empty = tempfile::NamedTempFile::new().unwrap();
    ea.credential_source.file = empty.path().to_str().unwrap().to_string();
    let ts = TokenSource::new(Provider::ExternalAccount(ea));
    assert!(ts.token().await.is_err());
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- credential::test_token_source_metadata --exact --show-output
#[tokio::test]
async fn test_token_source_metadata() {
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    let metadata = warp::path!("token")
        .and(warp::header::exact("metadata-flavor", "Google"))
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "access_token": "default-sa-token",
                "expires_in": 1799,
                "token_type": "Bearer",
            }))
        });
    let (addr, server) = warp::serve(metadata).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let ts = TokenSource::new(Provider::Metadata {
        url: format!("http://{addr}/token"),
    });
    assert_eq!(ts.token().await.unwrap().as_deref(), Some("default-sa-token"));

    let ts = TokenSource::new(Provider::Metadata {
        url: format!("http://{addr}/missing"),
    });
    let err = ts.token().await.unwrap_err();
    assert!(err.message().contains("404"));

    assert!(TokenSource::anonymous().token().await.unwrap().is_none());
    assert_eq!(
        TokenSource::new(Provider::Static(String::from("abc")))
            .token()
            .await
            .unwrap()
            .as_deref(),
        Some("abc")
    );
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- credential::test_token_source_lifetime --exact --show-output
#[tokio::test]
async fn test_token_source_lifetime() {
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    let metadata = warp::path!("token" / String).map(|lifetime: String| {
        let expires_in = match lifetime.as_str() {
            "max" => i64::MAX,
            "min" => i64::MIN,
            _ => 0,
        };
        warp::reply::json(&serde_json::json!({
            "access_token": "default-sa-token",
            "expires_in": expires_in,
            "token_type": "Bearer",
        }))
    });
    let (addr, server) = warp::serve(metadata).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let ts = TokenSource::new(Provider::Metadata {
        url: format!("http://{addr}/token/max"),
    });
    assert_eq!(ts.token().await.unwrap().as_deref(), Some("default-sa-token"));
    let expires_at = ts.cached.lock().await.as_ref().unwrap().expires_at;
    assert!(expires_at <= Utc::now() + Duration::seconds(MAX_TOKEN_LIFETIME_SECONDS));
    assert!(expires_at > Utc::now() + Duration::seconds(MAX_TOKEN_LIFETIME_SECONDS - 60));

    for lifetime in ["min", "zero"] {
        let ts = TokenSource::new(Provider::Metadata {
            url: format!("http://{addr}/token/{lifetime}"),
        });
        let err = ts.token().await.unwrap_err();
        assert!(err.message().contains("invalid token lifetime"));
        assert!(!err.is_retryable());
    }

    assert!(AccessToken::expiring_in(String::from("t"), i64::MAX).is_ok());
    assert!(AccessToken::expiring_in(String::from("t"), -1).is_err());
}
