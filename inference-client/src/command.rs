use std::{
    io::{self, stdout, Error, ErrorKind},
    sync::Arc,
};

use crate::flags;
use codelab_ops::{
    config::Config,
    credential::{Provider, TokenSource},
    envelope::{ErrorReply, Manager, Reply, Request},
    kms::{self, Wrapper},
};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use dialoguer::{theme::ColorfulTheme, Input};

pub async fn execute(opts: flags::Options) -> io::Result<()> {
    println!("starting {} with {:?}", crate::APP_NAME, opts);

    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );

    let config = Config::load_or_env(Some(opts.config_file.as_str()))?;
    config.validate()?;

    let server_url = if !opts.server_url.is_empty() {
        opts.server_url.clone()
    } else {
        config.inference_server_url.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                "no server URL (set --server-url or INFERENCE_SERVER_URL)",
            )
        })?
    };

    let wrapper: Arc<dyn Wrapper> = if !opts.local_kek_file.is_empty() {
        log::warn!("wrapping keys locally with '{}' (not KMS)", opts.local_kek_file);
        Arc::new(kms::local::Wrapper::load(&opts.local_kek_file)?)
    } else {
        let tokens = if opts.access_token.is_empty() {
            TokenSource::metadata()
        } else {
            TokenSource::new(Provider::Static(opts.access_token.clone()))
        };
        Arc::new(kms::Client::new(&config.kms()?.name(), Arc::new(tokens)))
    };
    let manager = Manager::new(wrapper);

    let prompt = if opts.prompt.is_empty() {
        Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("Enter your prompt")
            .interact_text()?
    } else {
        opts.prompt.clone()
    };

    let exchanged = exchange(&manager, &reqwest::Client::new(), &server_url, &prompt).await?;

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print("\nsent encrypted payload\n"),
        ResetColor
    )?;
    println!("{}", to_json(&exchanged.request)?);

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print("\nreceived encrypted response\n"),
        ResetColor
    )?;
    println!("{}", to_json(&exchanged.reply)?);

    execute!(
        stdout(),
        SetForegroundColor(Color::Blue),
        Print("\ndecrypted response\n"),
        ResetColor
    )?;
    println!("{}", exchanged.generated);

    Ok(())
}

/// Represents one round trip with the server.
#[derive(Debug)]
pub struct Exchanged {
    pub request: Request,
    pub reply: Reply,
    pub generated: String,
}

/// Seals the prompt, posts it to the server and opens the reply with the
/// data key the request was sealed with.
pub async fn exchange(
    manager: &Manager,
    http: &reqwest::Client,
    server_url: &str,
    prompt: &str,
) -> io::Result<Exchanged> {
    let (request, dek) = manager.seal_request(prompt.as_bytes()).await?;

    log::info!("sending encrypted prompt to '{}'", server_url);
    let resp = http
        .post(server_url)
        .json(&request)
        .send()
        .await
        .map_err(|e| Error::new(ErrorKind::Other, format!("failed to send ({})", e)))?;

    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::new(ErrorKind::Other, format!("failed to read reply ({})", e)))?;
    if !status.is_success() {
        let message = match serde_json::from_slice::<ErrorReply>(&body) {
            Ok(e) => e.error,
            Err(_) => String::from_utf8_lossy(&body).to_string(),
        };
        return Err(Error::new(
            ErrorKind::Other,
            format!("server returned {} ({})", status, message),
        ));
    }

    let reply: Reply = serde_json::from_slice(&body)
        .map_err(|e| Error::new(ErrorKind::InvalidData, format!("invalid reply ({})", e)))?;
    let generated = manager.open_reply(&dek, &reply)?;
    let generated = String::from_utf8(generated).map_err(|e| {
        Error::new(
            ErrorKind::InvalidData,
            format!("generated code is not UTF-8 ({})", e),
        )
    })?;

    Ok(Exchanged {
        request,
        reply,
        generated,
    })
}

fn to_json<T: serde::Serialize>(v: &T) -> io::Result<String> {
    serde_json::to_string_pretty(v)
        .map_err(|e| Error::new(ErrorKind::Other, format!("failed to encode JSON ({})", e)))
}

/// RUST_LOG=debug cargo test --package inference-client --bin inference-client -- command::test_exchange --exact --show-output
#[tokio::test]
async fn test_exchange() {
    use codelab_ops::envelope::DataKey;
    use warp::Filter;

    let _ = env_logger::builder().is_test(true).try_init();

    let manager = Manager::new(Arc::new(kms::local::Wrapper::new(
        DataKey::generate().unwrap(),
    )));

    // upper-cases the prompt under the request's data key
    let server = manager.clone();
    let generate = warp::path("generate")
        .and(warp::post())
        .and(warp::body::json())
        .then(move |req: Request| {
            let server = server.clone();
            async move {
                let (prompt, dek) = server.open_request(&req).await.unwrap();
                let generated = String::from_utf8(prompt).unwrap().to_uppercase();
                warp::reply::json(&server.seal_reply(&dek, generated.as_bytes()).unwrap())
            }
        });
    let failing = warp::path("failing").map(|| {
        warp::reply::with_status(
            warp::reply::json(&ErrorReply {
                error: String::from("failed to unwrap"),
            }),
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        )
    });
    let (addr, srv) = warp::serve(generate.or(failing)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(srv);

    let http = reqwest::Client::new();
    let exchanged = exchange(
        &manager,
        &http,
        &format!("http://{addr}/generate"),
        "def hello():",
    )
    .await
    .unwrap();
    assert_eq!(exchanged.generated, "DEF HELLO():");
    assert!(!exchanged.request.wrapped_dek.is_empty());
    assert_ne!(exchanged.request.ciphertext, b"def hello():".to_vec());

    let err = exchange(&manager, &http, &format!("http://{addr}/failing"), "x")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to unwrap"));
}
