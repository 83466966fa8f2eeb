pub mod classify;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    credential::decode_json,
    errors::{Error, Result},
};

/// Generation is capped at 128 new tokens per prompt.
pub const MAX_NEW_TOKENS: u32 = 128;

/// Generates text (e.g., code) for a prompt.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Returns the prompt as is. Useful to exercise the encrypted exchange
/// without a model.
#[derive(Debug, Clone, Default)]
pub struct Echo;

#[async_trait]
impl Generator for Echo {
    async fn generate(&self, prompt: &str) -> Result<String> {
        Ok(prompt.to_string())
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    inputs: &'a str,
    parameters: GenerateParameters,
}

#[derive(Debug, Serialize)]
struct GenerateParameters {
    max_new_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct Generated {
    generated_text: String,
}

/// Text-generation servers answer with either one object or a one-element list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GenerateResponse {
    One(Generated),
    Many(Vec<Generated>),
}

/// Calls a text-generation HTTP endpoint that serves the model.
#[derive(Debug, Clone)]
pub struct Http {
    url: String,
    max_new_tokens: u32,
    http: reqwest::Client,
}

impl Http {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            max_new_tokens: MAX_NEW_TOKENS,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_max_new_tokens(mut self, n: u32) -> Self {
        self.max_new_tokens = n;
        self
    }
}

#[async_trait]
impl Generator for Http {
    async fn generate(&self, prompt: &str) -> Result<String> {
        log::info!(
            "generating with '{}' (max new tokens {})",
            self.url,
            self.max_new_tokens
        );
        let resp = self
            .http
            .post(&self.url)
            .json(&GenerateRequest {
                inputs: prompt,
                parameters: GenerateParameters {
                    max_new_tokens: self.max_new_tokens,
                },
            })
            .send()
            .await
            .map_err(|e| Error::from_reqwest("generate", e))?;

        match decode_json::<GenerateResponse>("generate", resp).await? {
            GenerateResponse::One(g) => Ok(g.generated_text),
            GenerateResponse::Many(mut gs) => {
                if gs.is_empty() {
                    return Err(Error::other("generate returned no results"));
                }
                Ok(gs.swap_remove(0).generated_text)
            }
        }
    }
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- inference::test_echo --exact --show-output
#[tokio::test]
async fn test_echo() {
    assert_eq!(Echo.generate("def add(a, b):").await.unwrap(), "def add(a, b):");
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- inference::test_http --exact --show-output
#[tokio::test]
async fn test_http() {
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    let object = warp::path("object")
        .and(warp::body::json())
        .map(|body: serde_json::Value| {
            let inputs = body["inputs"].as_str().unwrap_or_default();
            let max = body["parameters"]["max_new_tokens"].as_u64().unwrap_or_default();
            warp::reply::json(&serde_json::json!({
                "generated_text": format!("{inputs} # {max} tokens")
            }))
        });
    let list = warp::path("list").map(|| {
        warp::reply::json(&serde_json::json!([{ "generated_text": "first" }, { "generated_text": "second" }]))
    });
    let empty = warp::path("empty").map(|| warp::reply::json(&serde_json::json!([])));
    let (addr, server) =
        warp::serve(object.or(list).or(empty)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let g = Http::new(&format!("http://{addr}/object"));
    assert_eq!(
        g.generate("def add(a, b):").await.unwrap(),
        "def add(a, b): # 128 tokens"
    );
    let g = Http::new(&format!("http://{addr}/object")).with_max_new_tokens(16);
    assert_eq!(g.generate("x").await.unwrap(), "x # 16 tokens");

    let g = Http::new(&format!("http://{addr}/list"));
    assert_eq!(g.generate("x").await.unwrap(), "first");

    let g = Http::new(&format!("http://{addr}/empty"));
    assert!(g.generate("x").await.is_err());

    let g = Http::new(&format!("http://{addr}/missing"));
    assert!(g.generate("x").await.is_err());
}
