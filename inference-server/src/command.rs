use std::{
    io::{self, Error, ErrorKind},
    path::Path,
    sync::Arc,
};

use crate::{flags, routes};
use codelab_ops::{
    config::Config,
    credential::TokenSource,
    envelope::Manager,
    inference::{self, Generator},
    kms::{self, Wrapper},
    storage,
};

/// Public bucket the model weights are published to.
pub const DEFAULT_MODEL_BUCKET: &str = "vertex-model-garden-public-us";
pub const DEFAULT_MODEL_PREFIX: &str = "codegemma/codegemma-2b";

pub async fn execute(opts: flags::Options) -> io::Result<()> {
    println!("starting {} with {:?}", crate::APP_NAME, opts);

    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, opts.log_level),
    );

    let config = Config::load_or_env(Some(opts.config_file.as_str()))?;
    config.validate()?;

    let wrapper = build_wrapper(&config, &opts.local_kek_file)?;

    if opts.skip_model_download {
        log::info!("skipping model download");
    } else {
        // the weights are public, so no credentials are sent
        let storage_manager = storage::Manager::new(Arc::new(TokenSource::anonymous()));
        download_model(&storage_manager, &config, &opts.model_dir).await?;
    }

    let generator = build_generator(&opts.generator, &opts.generator_url)?;

    let state = Arc::new(routes::State {
        manager: Manager::new(wrapper),
        generator,
    });

    log::info!("serving on {}", opts.http_host);
    warp::serve(routes::routes(state)).run(opts.http_host).await;

    Ok(())
}

/// Wraps data keys with the local key file if one is given, or with the
/// configured KMS key through workload identity otherwise.
fn build_wrapper(config: &Config, local_kek_file: &str) -> io::Result<Arc<dyn Wrapper>> {
    if !local_kek_file.is_empty() {
        log::warn!("wrapping keys locally with '{}' (not KMS)", local_kek_file);
        return Ok(Arc::new(kms::local::Wrapper::load(local_kek_file)?));
    }

    let kms_key = config.kms()?;
    let tokens = Arc::new(TokenSource::external_account(config.workload_identity()?));
    Ok(Arc::new(kms::Client::new(&kms_key.name(), tokens)))
}

fn build_generator(kind: &str, url: &str) -> io::Result<Arc<dyn Generator>> {
    match kind {
        "echo" => {
            log::warn!("echo generator returns the prompt as is");
            Ok(Arc::new(inference::Echo))
        }
        "http" => {
            if url.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "--generator-url is required for the http generator",
                ));
            }
            Ok(Arc::new(inference::Http::new(url)))
        }
        other => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("unknown generator '{}'", other),
        )),
    }
}

/// Returns the model bucket and prefix, falling back to the public defaults.
fn model_location(config: &Config) -> (String, String) {
    let storage = config.storage.clone().unwrap_or_default();
    (
        storage
            .model_bucket
            .unwrap_or_else(|| String::from(DEFAULT_MODEL_BUCKET)),
        storage
            .model_prefix
            .unwrap_or_else(|| String::from(DEFAULT_MODEL_PREFIX)),
    )
}

/// Fetches the model files into the directory. An empty prefix is an error.
async fn download_model(
    storage_manager: &storage::Manager,
    config: &Config,
    model_dir: &str,
) -> io::Result<()> {
    let (bucket, prefix) = model_location(config);

    let n = storage_manager
        .download_prefix(&bucket, &prefix, Path::new(model_dir))
        .await?;
    if n == 0 {
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("no model files under 'gs://{}/{}'", bucket, prefix),
        ));
    }

    log::info!("downloaded {} model files into '{}'", n, model_dir);
    Ok(())
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- command::test_build_wrapper --exact --show-output
#[tokio::test]
async fn test_build_wrapper() {
    use std::io::Write;

    use codelab_ops::config::{KmsKey, WorkloadIdentity};

    let _ = env_logger::builder().is_test(true).try_init();

    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "{}", "11".repeat(32)).unwrap();
    let kek_file = f.path().to_str().unwrap();

    // the local key file wins even without any KMS configuration
    let wrapper = build_wrapper(&Config::default(), kek_file).unwrap();
    let wrapped = wrapper.wrap(b"data key").await.unwrap();
    let reloaded = build_wrapper(&Config::default(), kek_file).unwrap();
    assert_eq!(reloaded.unwrap(&wrapped).await.unwrap(), b"data key".to_vec());

    let err = build_wrapper(&Config::default(), "").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let mut bad = tempfile::NamedTempFile::new().unwrap();
    writeln!(bad, "not hex").unwrap();
    assert!(build_wrapper(&Config::default(), bad.path().to_str().unwrap()).is_err());

    let config = Config {
        workload_identity: Some(WorkloadIdentity {
            project_id: String::from("primus-project"),
            project_number: String::from("123456789"),
            pool: String::from("primus-pool"),
            provider: String::from("attestation-verifier"),
            service_account: String::from("run-confidential-vm"),
            credential_source_file: String::from("/tmp/token"),
        }),
        kms: Some(KmsKey {
            project_id: String::from("primus-project"),
            location: String::from("global"),
            key_ring: String::from("primus-keyring"),
            key: String::from("primus-key"),
        }),
        ..Default::default()
    };
    assert!(build_wrapper(&config, "").is_ok());
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- command::test_build_generator --exact --show-output
#[tokio::test]
async fn test_build_generator() {
    let _ = env_logger::builder().is_test(true).try_init();

    let echo = build_generator("echo", "").unwrap();
    assert_eq!(echo.generate("def add(a, b):").await.unwrap(), "def add(a, b):");

    assert!(build_generator("http", "http://127.0.0.1:8081/generate").is_ok());

    let err = build_generator("http", "").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let err = build_generator("onnx", "").err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(err.to_string().contains("onnx"));
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- command::test_download_model --exact --show-output
#[tokio::test]
async fn test_download_model() {
    use std::{collections::HashMap, sync::Mutex};

    use codelab_ops::config::Storage;
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    // every request's authorization header, if any
    let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

    let list_seen = seen.clone();
    let list = warp::get()
        .and(warp::path!("storage" / "v1" / "b" / String / "o"))
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .map(
            move |bucket: String, q: HashMap<String, String>, auth: Option<String>| {
                list_seen.lock().unwrap().push(auth);
                let prefix = q.get("prefix").cloned().unwrap_or_default();
                let items = if bucket == "models" && prefix == "codegemma/codegemma-2b/" {
                    serde_json::json!([
                        { "name": prefix.clone(), "size": "0" },
                        { "name": format!("{prefix}config.json"), "size": "2" },
                        { "name": format!("{prefix}model.safetensors"), "size": "7" },
                    ])
                } else {
                    serde_json::json!([])
                };
                warp::reply::json(&serde_json::json!({ "items": items }))
            },
        );
    let media_seen = seen.clone();
    let media = warp::get()
        .and(warp::path!("storage" / "v1" / "b" / String / "o" / String))
        .and(warp::header::optional::<String>("authorization"))
        .map(move |_bucket: String, _object: String, auth: Option<String>| {
            media_seen.lock().unwrap().push(auth);
            "weights"
        });
    let (addr, server) = warp::serve(list.or(media)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let storage_manager = storage::Manager::with_endpoint(
        &format!("http://{addr}"),
        Arc::new(TokenSource::anonymous()),
    );
    let config_with = |prefix: &str| Config {
        storage: Some(Storage {
            model_bucket: Some(String::from("models")),
            model_prefix: Some(prefix.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };

    let tmp_dir = tempfile::tempdir().unwrap();
    let model_dir = tmp_dir.path().join("codegemma-2b");
    let model_dir = model_dir.to_str().unwrap();
    download_model(&storage_manager, &config_with("codegemma/codegemma-2b/"), model_dir)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(Path::new(model_dir).join("config.json")).unwrap(),
        "weights"
    );
    assert!(Path::new(model_dir).join("model.safetensors").exists());

    let seen_auth = seen.lock().unwrap().clone();
    assert_eq!(seen_auth.len(), 3);
    assert!(seen_auth.iter().all(Option::is_none));

    let err = download_model(&storage_manager, &config_with("missing/"), model_dir)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("gs://models/missing/"));
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- command::test_model_location --exact --show-output
#[test]
fn test_model_location() {
    use codelab_ops::config::Storage;

    assert_eq!(
        model_location(&Config::default()),
        (
            String::from(DEFAULT_MODEL_BUCKET),
            String::from(DEFAULT_MODEL_PREFIX)
        )
    );

    let config = Config {
        storage: Some(Storage {
            model_prefix: Some(String::from("codegemma/codegemma-7b")),
            ..Default::default()
        }),
        ..Default::default()
    };
    assert_eq!(
        model_location(&config),
        (
            String::from(DEFAULT_MODEL_BUCKET),
            String::from("codegemma/codegemma-7b")
        )
    );
}
