use std::sync::Arc;

use codelab_ops::{
    envelope::{ErrorReply, Manager, Reply, Request},
    errors::{Error, Result},
    inference::Generator,
};
use warp::{http::StatusCode, Filter};

/// Upper bound on a "/generate" body: a sealed prompt plus a wrapped DEK.
pub const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

/// Shared by every request.
pub struct State {
    pub manager: Manager,
    pub generator: Arc<dyn Generator>,
}

/// POST /generate and GET /health.
pub fn routes(
    state: Arc<State>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let state = warp::any().map(move || state.clone());

    // the body is decoded in the handler so malformed requests get the
    // JSON error reply rather than a rejection, oversized ones are rejected
    // with 413 before they are buffered
    let generate = warp::path("generate")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_REQUEST_BYTES))
        .and(warp::body::bytes())
        .and(state)
        .then(|body: bytes::Bytes, state: Arc<State>| async move {
            match handle_generate(&state, &body).await {
                Ok(reply) => warp::reply::with_status(warp::reply::json(&reply), StatusCode::OK),
                Err(e) => {
                    log::warn!("failed to generate ({})", e.message());
                    warp::reply::with_status(
                        warp::reply::json(&ErrorReply { error: e.message() }),
                        StatusCode::INTERNAL_SERVER_ERROR,
                    )
                }
            }
        });

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "ok");

    generate.or(health)
}

async fn handle_generate(state: &State, body: &[u8]) -> Result<Reply> {
    let req: Request = serde_json::from_slice(body).map_err(|e| Error::Other {
        message: format!("invalid request ({})", e),
        is_retryable: false,
    })?;

    let (prompt, dek) = state.manager.open_request(&req).await?;
    let prompt = String::from_utf8(prompt).map_err(|e| Error::Other {
        message: format!("prompt is not UTF-8 ({})", e),
        is_retryable: false,
    })?;
    log::info!("decrypted prompt ({} characters)", prompt.chars().count());

    let generated = state.generator.generate(&prompt).await?;
    state.manager.seal_reply(&dek, generated.as_bytes())
}

#[cfg(test)]
fn test_state() -> (Arc<State>, Manager) {
    use codelab_ops::{envelope::DataKey, inference::Echo, kms::local};

    let manager = Manager::new(Arc::new(local::Wrapper::new(DataKey::generate().unwrap())));
    (
        Arc::new(State {
            manager: manager.clone(),
            generator: Arc::new(Echo),
        }),
        manager,
    )
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- routes::test_generate --exact --show-output
#[tokio::test]
async fn test_generate() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (state, client) = test_state();
    let filter = routes(state);

    let (req, dek) = client
        .seal_request(b"def fibonacci(n):")
        .await
        .unwrap();
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .json(&req)
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let reply: Reply = serde_json::from_slice(resp.body()).unwrap();
    let generated = client.open_reply(&dek, &reply).unwrap();
    assert_eq!(generated, b"def fibonacci(n):".to_vec());
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- routes::test_generate_errors --exact --show-output
#[tokio::test]
async fn test_generate_errors() {
    use codelab_ops::{envelope::DataKey, kms::local};

    let _ = env_logger::builder().is_test(true).try_init();

    let (state, _) = test_state();
    let filter = routes(state);

    let error_of = |body: &[u8]| -> String {
        let e: ErrorReply = serde_json::from_slice(body).unwrap();
        e.error
    };

    // not JSON
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .body("hello")
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(error_of(resp.body()).starts_with("invalid request"));

    // missing field
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .json(&serde_json::json!({ "ciphertext": "AAAA" }))
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // not base64
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .json(&serde_json::json!({ "ciphertext": "!!", "wrapped_dek": "!!" }))
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // DEK wrapped under another key-encryption key
    let other = Manager::new(Arc::new(local::Wrapper::new(DataKey::generate().unwrap())));
    let (req, _) = other.seal_request(b"print(1)").await.unwrap();
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .json(&req)
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!error_of(resp.body()).is_empty());
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- routes::test_generate_body_limit --exact --show-output
#[tokio::test]
async fn test_generate_body_limit() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (state, client) = test_state();
    let filter = routes(state);

    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .body(vec![b'a'; 2 * MAX_REQUEST_BYTES as usize])
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // a prompt just under the limit still goes through
    let (req, dek) = client
        .seal_request(&vec![b'a'; (MAX_REQUEST_BYTES / 2) as usize])
        .await
        .unwrap();
    let body = serde_json::to_vec(&req).unwrap();
    assert!((body.len() as u64) < MAX_REQUEST_BYTES);
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .body(body)
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let reply: Reply = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(client.open_reply(&dek, &reply).unwrap().len(), (MAX_REQUEST_BYTES / 2) as usize);
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- routes::test_generator_error --exact --show-output
#[tokio::test]
async fn test_generator_error() {
    use async_trait::async_trait;
    use codelab_ops::{envelope::DataKey, kms::local};

    struct Unavailable;

    #[async_trait]
    impl Generator for Unavailable {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Err(Error::API {
                message: String::from("model not loaded"),
                is_retryable: true,
            })
        }
    }

    let manager = Manager::new(Arc::new(local::Wrapper::new(DataKey::generate().unwrap())));
    let filter = routes(Arc::new(State {
        manager: manager.clone(),
        generator: Arc::new(Unavailable),
    }));

    let (req, _) = manager.seal_request(b"x").await.unwrap();
    let resp = warp::test::request()
        .method("POST")
        .path("/generate")
        .json(&req)
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let e: ErrorReply = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(e.error, "model not loaded");
}

/// RUST_LOG=debug cargo test --package inference-server --bin inference-server -- routes::test_health --exact --show-output
#[tokio::test]
async fn test_health() {
    let (state, _) = test_state();
    let filter = routes(state);

    let resp = warp::test::request()
        .method("GET")
        .path("/health")
        .reply(&filter)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"ok");

    let resp = warp::test::request()
        .method("GET")
        .path("/generate")
        .reply(&filter)
        .await;
    assert_ne!(resp.status(), StatusCode::OK);
}
