use std::cmp::Ordering;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::{
    credential::decode_json,
    errors::{Error, Result},
    humanize,
};

/// Number of top predictions reported per image.
pub const TOP_K: usize = 5;

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".JPG", ".JPEG", ".PNG"];

/// Returns true if the object name looks like an image the model accepts.
pub fn is_image(name: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Scores an encoded image against every class of the model.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<Vec<f32>>;
}

#[serde_as]
#[derive(Debug, Serialize)]
struct Instance<'a> {
    #[serde_as(as = "Base64")]
    b64: &'a [u8],
}

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    instances: Vec<Instance<'a>>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<f32>>,
}

/// Calls a REST "predict" endpoint serving the unpacked model.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    url: String,
    http: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, image: &[u8]) -> Result<Vec<f32>> {
        log::info!(
            "classifying image ({}) with '{}'",
            humanize::bytes(image.len()),
            self.url
        );
        let resp = self
            .http
            .post(&self.url)
            .json(&PredictRequest {
                instances: vec![Instance { b64: image }],
            })
            .send()
            .await
            .map_err(|e| Error::from_reqwest("predict", e))?;
        let out: PredictResponse = decode_json("predict", resp).await?;
        out.predictions
            .into_iter()
            .next()
            .ok_or_else(|| Error::other("predict returned no predictions"))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Prediction {
    pub class_index: usize,
    pub score: f32,
}

/// Represents the classification result of one image.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Classification {
    pub predicted_class: usize,
    pub top_k_predictions: Vec<Prediction>,
}

/// Picks the "k" best scoring classes, best first. Ties keep the lower
/// class index first; NaN scores rank last.
pub fn top_k(scores: &[f32], k: usize) -> Result<Classification> {
    if scores.is_empty() {
        return Err(Error::other("no scores to rank"));
    }

    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| {
        let (sa, sb) = (scores[a], scores[b]);
        match (sa.is_nan(), sb.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => sb.partial_cmp(&sa).unwrap_or(Ordering::Equal),
        }
    });

    let top_k_predictions: Vec<Prediction> = indices
        .iter()
        .take(k)
        .map(|&i| Prediction {
            class_index: i,
            score: scores[i],
        })
        .collect();
    Ok(Classification {
        predicted_class: indices[0],
        top_k_predictions,
    })
}

/// Formats one line of the workload result.
pub fn result_line(image_name: &str, response: &serde_json::Value) -> String {
    format!("Image: {}, Response: {}", image_name, response)
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- inference::classify::test_is_image --exact --show-output
#[test]
fn test_is_image() {
    assert!(is_image("cat.jpg"));
    assert!(is_image("dir/dog.JPEG"));
    assert!(is_image("bird.png"));
    assert!(!is_image("mixed.Jpg"));
    assert!(!is_image("notes.txt"));
    assert!(!is_image("jpg"));
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- inference::classify::test_top_k --exact --show-output
#[test]
fn test_top_k() {
    let scores = [0.1, 0.7, f32::NAN, 0.05, 0.7, 0.9, 0.2];
    let c = top_k(&scores, TOP_K).unwrap();
    assert_eq!(c.predicted_class, 5);
    let order: Vec<usize> = c.top_k_predictions.iter().map(|p| p.class_index).collect();
    assert_eq!(order, vec![5, 1, 4, 6, 0]);
    assert_eq!(c.top_k_predictions[0].score, 0.9);

    // fewer classes than k
    let c = top_k(&[0.3, 0.6], TOP_K).unwrap();
    assert_eq!(c.top_k_predictions.len(), 2);
    assert_eq!(c.predicted_class, 1);

    assert!(top_k(&[], TOP_K).is_err());

    let v = serde_json::to_value(top_k(&[0.25, 0.75], 1).unwrap()).unwrap();
    assert_eq!(
        v,
        serde_json::json!({
            "predicted_class": 1,
            "top_k_predictions": [{ "class_index": 1, "score": 0.75 }],
        })
    );
    assert_eq!(
        result_line("cat.jpg", &serde_json::json!({ "predicted_class": 1 })),
        r#"Image: cat.jpg, Response: {"predicted_class":1}"#
    );
}

/// RUST_LOG=debug cargo test --package codelab-ops --lib -- inference::classify::test_http_classifier --exact --show-output
#[tokio::test]
async fn test_http_classifier() {
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    // scores the image by its length so the test can tell images apart
    let predict = warp::path!("v1" / "models" / "classifier:predict")
        .and(warp::body::json())
        .map(|body: serde_json::Value| {
            let b64 = body["instances"][0]["b64"].as_str().unwrap_or_default();
            warp::reply::json(&serde_json::json!({
                "predictions": [[0.0, b64.len() as f32, 1.0]]
            }))
        });
    let (addr, server) = warp::serve(predict).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let c = HttpClassifier::new(&format!("http://{addr}/v1/models/classifier:predict"));
    // 6 bytes encode to 8 base64 characters
    let scores = c.classify(b"\x89PNG\r\n").await.unwrap();
    assert_eq!(scores, vec![0.0, 8.0, 1.0]);
    assert_eq!(top_k(&scores, TOP_K).unwrap().predicted_class, 1);

    let c = HttpClassifier::new(&format!("http://{addr}/v1/models/missing:predict"));
    assert!(c.classify(b"x").await.is_err());
}
