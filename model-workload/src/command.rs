use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::flags;
use codelab_ops::{
    compress,
    config::Config,
    credential::TokenSource,
    errors::Result,
    inference::classify::{self, Classifier, HttpClassifier},
    storage,
};

/// The model owner publishes the protected model under this name.
pub const MODEL_OBJECT: &str = "model.tar.gz";
/// The only output of the workload.
pub const RESULT_OBJECT: &str = "result";

pub async fn execute(opts: flags::Options) -> io::Result<()> {
    println!("starting {} with {:?}", crate::APP_NAME, opts);

    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );

    let config = Config::load_or_env(Some(opts.config_file.as_str()))?;
    config.validate()?;
    let buckets = config.storage()?;
    let result_bucket = buckets.result_bucket()?;

    // the model owner's bucket is only readable through workload identity,
    // images and results use the default credentials of the VM
    let owner = storage::Manager::new(Arc::new(TokenSource::external_account(
        config.workload_identity()?,
    )));
    let default = storage::Manager::new(Arc::new(TokenSource::metadata()));

    let workload = Workload {
        owner,
        default,
        classifier: Arc::new(HttpClassifier::new(&opts.classifier_url)),
        input_bucket: buckets.input_bucket()?.to_string(),
        image_bucket: buckets.image_bucket()?.to_string(),
        model_dir: PathBuf::from(&opts.model_dir),
    };
    workload.run_and_upload(result_bucket).await
}

pub struct Workload {
    pub owner: storage::Manager,
    pub default: storage::Manager,
    pub classifier: Arc<dyn Classifier>,
    pub input_bucket: String,
    pub image_bucket: String,
    pub model_dir: PathBuf,
}

impl Workload {
    /// Returns the contents of the result object. Failing to fetch the
    /// model or to list the images is reported as "Error: ..." rather than
    /// returned, since the result object is the only output the data owner
    /// can see.
    pub async fn run(&self) -> String {
        if let Err(e) = self.fetch_model().await {
            log::warn!("failed to fetch model ({})", e);
            return format!("Error: {}", e);
        }

        let objects = match self.default.list_objects(&self.image_bucket, None).await {
            Ok(objects) => objects,
            Err(e) => {
                log::warn!("failed to list images ({})", e);
                return format!("Error: {}", e);
            }
        };

        let mut lines = Vec::new();
        for obj in objects.iter().filter(|o| classify::is_image(&o.name)) {
            let response = match self.classify(&obj.name).await {
                Ok(c) => serde_json::to_value(c)
                    .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
                Err(e) => {
                    log::warn!("failed to classify '{}' ({})", obj.name, e.message());
                    serde_json::json!({ "error": e.message() })
                }
            };
            lines.push(classify::result_line(&obj.name, &response));
        }

        log::info!("classified {} images", lines.len());
        lines.join("\n")
    }

    /// Runs the workload and writes the result object with the default
    /// credentials, including an "Error: ..." result.
    pub async fn run_and_upload(&self, result_bucket: &str) -> io::Result<()> {
        let result = self.run().await;
        self.default
            .put_object(result_bucket, RESULT_OBJECT, result.into_bytes(), "text/plain")
            .await?;
        log::info!("wrote 'gs://{}/{}'", result_bucket, RESULT_OBJECT);
        Ok(())
    }

    async fn fetch_model(&self) -> io::Result<()> {
        let archive = self.model_dir.join(MODEL_OBJECT);
        self.owner
            .download_file(&self.input_bucket, MODEL_OBJECT, &archive)
            .await?;
        let n = unpack(&archive, &self.model_dir).await?;
        log::info!("unpacked {} model files", n);
        Ok(())
    }

    async fn classify(&self, name: &str) -> Result<classify::Classification> {
        let image = self.default.get_object(&self.image_bucket, name).await?;
        let scores = self.classifier.classify(&image).await?;
        classify::top_k(&scores, classify::TOP_K)
    }
}

async fn unpack(archive: &Path, dir: &Path) -> io::Result<usize> {
    let (archive, dir) = (archive.to_path_buf(), dir.to_path_buf());
    tokio::task::spawn_blocking(move || compress::unpack_tar_gzip(&archive, &dir))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("unpack task failed ({})", e)))?
}

#[cfg(test)]
fn model_archive() -> Vec<u8> {
    use flate2::{write::GzEncoder, Compression};

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(5);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "saved_model.pb", b"model".as_slice())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

#[cfg(test)]
type Uploads = Arc<std::sync::Mutex<std::collections::HashMap<String, (Option<String>, Vec<u8>)>>>;

/// Serves "owner" (model archive), "images", uploads into "results" and a
/// classifier that scores class 2 highest for every image except "broken.png".
/// Uploads are recorded by "bucket/name" with their authorization header.
#[cfg(test)]
async fn spawn_fakes(model: Option<Vec<u8>>) -> (std::net::SocketAddr, Uploads) {
    use std::collections::HashMap;
    use warp::{http::StatusCode, Filter};

    let uploads: Uploads = Arc::new(std::sync::Mutex::new(HashMap::new()));

    let list = warp::get()
        .and(warp::path!("storage" / "v1" / "b" / String / "o"))
        .map(|bucket: String| {
            if bucket != "images" {
                return warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({ "error": "not found" })),
                    StatusCode::NOT_FOUND,
                );
            }
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "items": [
                        { "name": "cat.jpg" },
                        { "name": "notes.txt" },
                        { "name": "broken.png" },
                        { "name": "DOG.JPEG" },
                    ],
                })),
                StatusCode::OK,
            )
        });
    let media = warp::get()
        .and(warp::path!("storage" / "v1" / "b" / String / "o" / String))
        .and(warp::query::<HashMap<String, String>>())
        .map(move |bucket: String, object: String, _q: HashMap<String, String>| {
            let body = match (bucket.as_str(), object.as_str(), &model) {
                ("owner", MODEL_OBJECT, Some(m)) => Some(m.clone()),
                ("images", "broken.png", _) => Some(b"broken".to_vec()),
                ("images", _, _) => Some(b"image".to_vec()),
                _ => None,
            };
            match body {
                Some(b) => warp::reply::with_status(b, StatusCode::OK),
                None => warp::reply::with_status(b"no such object".to_vec(), StatusCode::NOT_FOUND),
            }
        });
    let predict = warp::post()
        .and(warp::path!("predict"))
        .and(warp::body::json())
        .map(|body: serde_json::Value| {
            // "broken" base64-encodes to "YnJva2Vu"
            if body["instances"][0]["b64"] == "YnJva2Vu" {
                return warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({ "error": "cannot decode image" })),
                    StatusCode::BAD_REQUEST,
                );
            }
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "predictions": [[0.1, 0.2, 0.9, 0.05, 0.3, 0.0]]
                })),
                StatusCode::OK,
            )
        });

    let store = uploads.clone();
    let upload = warp::post()
        .and(warp::path!("upload" / "storage" / "v1" / "b" / String / "o"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .map(
            move |bucket: String,
                  q: HashMap<String, String>,
                  auth: Option<String>,
                  body: bytes::Bytes| {
                let name = q.get("name").cloned().unwrap_or_default();
                if bucket != "results" {
                    return warp::reply::with_status(
                        warp::reply::json(&serde_json::json!({ "error": "forbidden" })),
                        StatusCode::FORBIDDEN,
                    );
                }
                store
                    .lock()
                    .unwrap()
                    .insert(format!("{bucket}/{name}"), (auth, body.to_vec()));
                warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({ "bucket": bucket, "name": name })),
                    StatusCode::OK,
                )
            },
        );

    let (addr, server) = warp::serve(list.or(media).or(predict).or(upload))
        .bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (addr, uploads)
}

#[cfg(test)]
fn test_workload(addr: std::net::SocketAddr, model_dir: &Path) -> Workload {
    let endpoint = format!("http://{addr}");
    Workload {
        owner: storage::Manager::with_endpoint(&endpoint, Arc::new(TokenSource::anonymous())),
        default: storage::Manager::with_endpoint(&endpoint, Arc::new(TokenSource::anonymous())),
        classifier: Arc::new(HttpClassifier::new(&format!("{endpoint}/predict"))),
        input_bucket: String::from("owner"),
        image_bucket: String::from("images"),
        model_dir: model_dir.to_path_buf(),
    }
}

/// RUST_LOG=debug cargo test --package model-workload --bin model-workload -- command::test_run --exact --show-output
#[tokio::test]
async fn test_run() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (addr, _) = spawn_fakes(Some(model_archive())).await;
    let tmp_dir = tempfile::tempdir().unwrap();
    let result = test_workload(addr, tmp_dir.path()).run().await;

    assert!(tmp_dir.path().join("saved_model.pb").exists());

    let lines: Vec<&str> = result.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("Image: cat.jpg, Response: "));
    assert!(lines[0].contains(r#""predicted_class":2"#));
    assert!(lines[1].starts_with("Image: broken.png, Response: {\"error\":"));
    assert!(lines[2].starts_with("Image: DOG.JPEG, Response: "));

    let response: serde_json::Value =
        serde_json::from_str(lines[2].trim_start_matches("Image: DOG.JPEG, Response: ")).unwrap();
    let top: Vec<u64> = response["top_k_predictions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["class_index"].as_u64().unwrap())
        .collect();
    assert_eq!(top, vec![2, 4, 1, 0, 3]);
}

/// RUST_LOG=debug cargo test --package model-workload --bin model-workload -- command::test_run_without_model --exact --show-output
#[tokio::test]
async fn test_run_without_model() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (addr, _) = spawn_fakes(None).await;
    let tmp_dir = tempfile::tempdir().unwrap();
    let result = test_workload(addr, tmp_dir.path()).run().await;
    assert!(result.starts_with("Error: "));
    assert!(!result.contains("Image: "));

    // listing fails once the model is in place
    let (addr, _) = spawn_fakes(Some(model_archive())).await;
    let mut workload = test_workload(addr, tmp_dir.path());
    workload.image_bucket = String::from("missing");
    let result = workload.run().await;
    assert!(result.starts_with("Error: "));
}

/// RUST_LOG=debug cargo test --package model-workload --bin model-workload -- command::test_run_and_upload --exact --show-output
#[tokio::test]
async fn test_run_and_upload() {
    let _ = env_logger::builder().is_test(true).try_init();

    let key = format!("results/{RESULT_OBJECT}");

    let (addr, uploads) = spawn_fakes(Some(model_archive())).await;
    let tmp_dir = tempfile::tempdir().unwrap();
    test_workload(addr, tmp_dir.path())
        .run_and_upload("results")
        .await
        .unwrap();
    let (auth, body) = uploads.lock().unwrap().get(&key).cloned().unwrap();
    // the test workload's default credentials are anonymous
    assert_eq!(auth, None);
    let body = String::from_utf8(body).unwrap();
    assert_eq!(body.lines().count(), 3);
    assert!(body.starts_with("Image: cat.jpg, Response: "));

    // a failed run still writes its error as the result
    let (addr, uploads) = spawn_fakes(None).await;
    let tmp_dir = tempfile::tempdir().unwrap();
    test_workload(addr, tmp_dir.path())
        .run_and_upload("results")
        .await
        .unwrap();
    let (_, body) = uploads.lock().unwrap().get(&key).cloned().unwrap();
    assert!(String::from_utf8(body).unwrap().starts_with("Error: "));

    // the upload failing is the one error that is returned
    let (addr, uploads) = spawn_fakes(Some(model_archive())).await;
    let tmp_dir = tempfile::tempdir().unwrap();
    assert!(test_workload(addr, tmp_dir.path())
        .run_and_upload("locked")
        .await
        .is_err());
    assert!(uploads.lock().unwrap().is_empty());
}
