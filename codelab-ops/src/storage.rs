use std::{path::Path, sync::Arc};

use reqwest::Url;
use serde::Deserialize;

use crate::{
    credential::{decode_json, TokenSource},
    errors::{Error, Result},
    humanize,
};

pub const CLOUD_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";

/// Represents one object in a bucket listing.
#[derive(Debug, Deserialize, Eq, PartialEq, Clone)]
pub struct Object {
    pub name: String,
    /// The JSON API encodes uint64 as string.
    #[serde(default)]
    pub size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<Object>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Implements the Cloud Storage JSON API client.
#[derive(Debug, Clone)]
pub struct Manager {
    endpoint: String,
    tokens: Arc<TokenSource>,
    http: reqwest::Client,
}

impl Manager {
    pub fn new(tokens: Arc<TokenSource>) -> Self {
        Self::with_endpoint(CLOUD_STORAGE_ENDPOINT, tokens)
    }

    pub fn with_endpoint(endpoint: &str, tokens: Arc<TokenSource>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tokens,
            http: reqwest::Client::new(),
        }
    }

    /// Builds "{endpoint}/{prefix...}/b/{bucket}/o[/{object}]" with each
    /// dynamic part encoded as a single path segment.
    fn url(&self, prefix: &[&str], bucket: &str, object: Option<&str>) -> Result<Url> {
        let mut u = Url::parse(&self.endpoint)
            .map_err(|e| Error::other(format!("invalid endpoint {} ({})", self.endpoint, e)))?;
        {
            let mut segs = u
                .path_segments_mut()
                .map_err(|_| Error::other(format!("endpoint {} cannot be a base", self.endpoint)))?;
            segs.pop_if_empty();
            segs.extend(prefix);
            segs.push("b").push(bucket).push("o");
            if let Some(o) = object {
                segs.push(o);
            }
        }
        Ok(u)
    }

    /// Lists all objects with the prefix, following the pagination.
    pub async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<Object>> {
        log::info!("listing objects in bucket '{}' (prefix {:?})", bucket, prefix);

        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut u = self.url(&["storage", "v1"], bucket, None)?;
            {
                let mut q = u.query_pairs_mut();
                if let Some(p) = prefix {
                    q.append_pair("prefix", p);
                }
                if let Some(t) = &page_token {
                    q.append_pair("pageToken", t);
                }
            }

            let req = self.tokens.authorize(self.http.get(u)).await?;
            let resp = req
                .send()
                .await
                .map_err(|e| Error::from_reqwest("list objects", e))?;
            let page: ListResponse = decode_json("list objects", resp).await?;
            objects.extend(page.items);

            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        log::info!("listed {} objects in bucket '{}'", objects.len(), bucket);
        Ok(objects)
    }

    /// Reads the object contents.
    pub async fn get_object(&self, bucket: &str, name: &str) -> Result<Vec<u8>> {
        log::info!("downloading 'gs://{}/{}'", bucket, name);

        let mut u = self.url(&["storage", "v1"], bucket, Some(name))?;
        u.query_pairs_mut().append_pair("alt", "media");

        let req = self.tokens.authorize(self.http.get(u)).await?;
        let resp = req
            .send()
            .await
            .map_err(|e| Error::from_reqwest("get object", e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::from_status("get object", status, &body));
        }
        let d = resp
            .bytes()
            .await
            .map_err(|e| Error::from_reqwest("get object", e))?;

        log::info!(
            "downloaded 'gs://{}/{}' ({})",
            bucket,
            name,
            humanize::bytes(d.len())
        );
        Ok(d.to_vec())
    }

    /// Downloads the object to a local file, creating the parent directory.
    pub async fn download_file(&self, bucket: &str, name: &str, file_path: &Path) -> Result<()> {
        let d = self.get_object(bucket, name).await?;
        if let Some(parent) = file_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::other(format!("failed to create {} ({})", parent.display(), e))
            })?;
        }
        tokio::fs::write(file_path, &d)
            .await
            .map_err(|e| Error::other(format!("failed to write {} ({})", file_path.display(), e)))
    }

    /// Downloads every object under the prefix into the directory, named by
    /// the last path component. Returns the number of files written.
    pub async fn download_prefix(&self, bucket: &str, prefix: &str, dir: &Path) -> Result<usize> {
        log::info!(
            "downloading 'gs://{}/{}' into {}",
            bucket,
            prefix,
            dir.display()
        );
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::other(format!("failed to create {} ({})", dir.display(), e)))?;

        let mut written = 0;
        for obj in self.list_objects(bucket, Some(prefix)).await? {
            let base = match base_name(&obj.name) {
                Some(b) => b,
                None => {
                    log::debug!("skipping directory placeholder '{}'", obj.name);
                    continue;
                }
            };
            self.download_file(bucket, &obj.name, &dir.join(base))
                .await?;
            written += 1;
        }
        Ok(written)
    }

    /// Uploads the contents as the object, replacing any existing one.
    pub async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        d: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        log::info!(
            "uploading 'gs://{}/{}' ({})",
            bucket,
            name,
            humanize::bytes(d.len())
        );

        let mut u = self.url(&["upload", "storage", "v1"], bucket, None)?;
        u.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", name);

        let req = self.tokens.authorize(self.http.post(u)).await?;
        let resp = req
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(d)
            .send()
            .await
            .map_err(|e| Error::from_reqwest("put object", e))?;
        let uploaded: Object = decode_json("put object", resp).await?;

        log::info!("uploaded 'gs://{}/{}'", bucket, uploaded.name);
        Ok(())
    }
}

/// Returns the last path component of an object name, or None for
/// "directory" placeholders.
pub fn base_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.ends_with('/') {
        return None;
    }
    name.rsplit('/').next()
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- storage::test_base_name --exact --show-output
#[test]
fn test_base_name() {
    assert_eq!(base_name("codegemma/codegemma-2b/config.json"), Some("config.json"));
    assert_eq!(base_name("model.tar.gz"), Some("model.tar.gz"));
    assert_eq!(base_name("codegemma/codegemma-2b/"), None);
    assert_eq!(base_name(""), None);
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- storage::test_manager --exact --show-output
#[tokio::test]
async fn test_manager() {
    use std::{collections::HashMap, sync::Mutex};
    use warp::Filter;

    use crate::credential::Provider;

    let _ = env_logger::builder().is_test(true).try_init();

    let uploads: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));

    // two pages: the second one is only served with the page token
    let list = warp::get()
        .and(warp::path!("storage" / "v1" / "b" / String / "o"))
        .and(warp::query::<HashMap<String, String>>())
        .map(|bucket: String, q: HashMap<String, String>| {
            let prefix = q.get("prefix").cloned().unwrap_or_default();
            let body = match q.get("pageToken").map(String::as_str) {
                None => serde_json::json!({
                    "kind": "storage#objects",
                    "items": [
                        { "name": prefix.clone(), "size": "0" },
                        { "name": format!("{prefix}config.json"), "size": "2" },
                    ],
                    "nextPageToken": format!("{bucket}-page-2"),
                }),
                Some(_) => serde_json::json!({
                    "kind": "storage#objects",
                    "items": [ { "name": format!("{prefix}weights/model.safetensors"), "size": "4" } ],
                }),
            };
            warp::reply::json(&body)
        });
    let media = warp::get()
        .and(warp::path!("storage" / "v1" / "b" / String / "o" / String))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .map(
            |_bucket: String, object: String, q: HashMap<String, String>, auth: Option<String>| {
                let ok = q.get("alt").map(String::as_str) == Some("media") && auth.is_none();
                let status = if ok {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::BAD_REQUEST
                };
                warp::reply::with_status(format!("contents of {object}"), status)
            },
        );
    let store = uploads.clone();
    let upload = warp::post()
        .and(warp::path!("upload" / "storage" / "v1" / "b" / String / "o"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::<String>("authorization"))
        .and(warp::body::bytes())
        .map(
            move |bucket: String, q: HashMap<String, String>, auth: String, body: bytes::Bytes| {
                let name = q.get("name").cloned().unwrap_or_default();
                if auth == "Bearer writer" && q.get("uploadType").map(String::as_str) == Some("media") {
                    store
                        .lock()
                        .unwrap()
                        .insert(format!("{bucket}/{name}"), body.to_vec());
                }
                warp::reply::json(&serde_json::json!({ "bucket": bucket, "name": name }))
            },
        );
    let (addr, server) =
        warp::serve(list.or(media).or(upload)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let endpoint = format!("http://{addr}");
    let public = Manager::with_endpoint(&endpoint, Arc::new(TokenSource::anonymous()));

    let objects = public
        .list_objects("models", Some("codegemma/codegemma-2b/"))
        .await
        .unwrap();
    assert_eq!(objects.len(), 3);
    assert_eq!(objects[2].name, "codegemma/codegemma-2b/weights/model.safetensors");

    let d = public.get_object("models", "model.tar.gz").await.unwrap();
    assert_eq!(d, b"contents of model.tar.gz".to_vec());

    let tmp_dir = tempfile::tempdir().unwrap();
    let n = public
        .download_prefix("models", "codegemma/codegemma-2b/", tmp_dir.path())
        .await
        .unwrap();
    assert_eq!(n, 2);
    assert!(tmp_dir.path().join("config.json").exists());
    assert!(tmp_dir.path().join("model.safetensors").exists());

    let writer = Manager::with_endpoint(
        &endpoint,
        Arc::new(TokenSource::new(Provider::Static(String::from("writer")))),
    );
    writer
        .put_object("results", "result", b"Image: a.jpg".to_vec(), "text/plain")
        .await
        .unwrap();
    assert_eq!(
        uploads.lock().unwrap().get("results/result"),
        Some(&b"Image: a.jpg".to_vec())
    );

    // authenticated media download is refused by the fake
    assert!(writer.get_object("models", "model.tar.gz").await.is_err());
}
