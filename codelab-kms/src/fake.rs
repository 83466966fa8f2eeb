use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD, Engine};
use warp::Filter;

pub const KEY_NAME: &str = "projects/primus-project/locations/global/keyRings/primus-keyring/cryptoKeys/primus-key";
pub const ACCESS_TOKEN: &str = "codelab-token";

/// Serves KMS encrypt/decrypt by reversing the payload, with valid checksums.
pub async fn spawn_kms() -> SocketAddr {
    let routes = warp::post()
        .and(warp::path("v1"))
        .and(warp::path::tail())
        .and(warp::header::<String>("authorization"))
        .and(warp::body::json())
        .map(|tail: warp::path::Tail, auth: String, body: serde_json::Value| {
            if auth != format!("Bearer {ACCESS_TOKEN}") {
                return warp::reply::with_status(
                    warp::reply::json(&serde_json::json!({ "error": { "code": 401 } })),
                    warp::http::StatusCode::UNAUTHORIZED,
                );
            }
            let (field, encrypting) = if tail.as_str().ends_with(":encrypt") {
                ("plaintext", true)
            } else {
                ("ciphertext", false)
            };
            let mut d = STANDARD
                .decode(body[field].as_str().unwrap_or_default())
                .unwrap_or_default();
            d.reverse();
            let crc = crc32c::crc32c(&d).to_string();
            let out = if encrypting {
                serde_json::json!({
                    "name": format!("{KEY_NAME}/cryptoKeyVersions/1"),
                    "ciphertext": STANDARD.encode(&d),
                    "ciphertextCrc32c": crc,
                    "verifiedPlaintextCrc32c": true,
                })
            } else {
                serde_json::json!({ "plaintext": STANDARD.encode(&d), "plaintextCrc32c": crc })
            };
            warp::reply::with_status(warp::reply::json(&out), warp::http::StatusCode::OK)
        });
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}
