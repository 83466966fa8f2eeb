use std::{
    fs,
    io::{self, stdout, Error, ErrorKind},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Arg, Command};
use codelab_ops::{config::Config, kms};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};

use crate::credentials;

pub const NAME: &str = "decrypt";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Decrypts base64 ciphertext with the KMS key, verifying CRC32C checksums both ways")
        .arg(
            Arg::new("LOG_LEVEL")
                .long("log-level")
                .short('l')
                .help("Sets the log level")
                .required(false)
                .num_args(1)
                .value_parser(["debug", "info"])
                .default_value("info"),
        )
        .arg(
            Arg::new("CONFIG_FILE")
                .long("config-file")
                .short('c')
                .help("Sets the YAML configuration file path (if empty, reads the environment variables)")
                .required(false)
                .num_args(1),
        )
        .arg(credentials::credentials_arg())
        .arg(credentials::access_token_arg())
        .arg(
            Arg::new("CIPHERTEXT")
                .long("ciphertext")
                .help("Sets the base64 ciphertext to decrypt")
                .required(false)
                .num_args(1)
                .conflicts_with("CIPHERTEXT_FILE"),
        )
        .arg(
            Arg::new("CIPHERTEXT_FILE")
                .long("ciphertext-file")
                .help("Sets the file with the base64 ciphertext to decrypt")
                .required(false)
                .num_args(1),
        )
}

#[derive(Debug)]
pub struct Options {
    pub log_level: String,
    pub config_file: String,
    pub credentials: String,
    pub access_token: String,
    pub ciphertext: String,
    pub ciphertext_file: String,
}

pub async fn execute(opts: Options) -> io::Result<()> {
    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );

    let encoded = if !opts.ciphertext_file.is_empty() {
        fs::read_to_string(&opts.ciphertext_file)?
    } else if !opts.ciphertext.is_empty() {
        opts.ciphertext.clone()
    } else {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "either --ciphertext or --ciphertext-file is required",
        ));
    };

    let config = Config::load_or_env(Some(opts.config_file.as_str()))?;
    config.validate()?;
    let tokens = credentials::token_source(&opts.credentials, &opts.access_token, &config)?;
    let cli = kms::Client::new(&config.kms()?.name(), Arc::new(tokens));

    let plaintext = decrypt_from_base64(&cli, &encoded).await?;

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print(format!("\ndecrypted with '{}'\n", cli.key_name())),
        ResetColor
    )?;
    println!("{}", plaintext);
    Ok(())
}

/// Decodes the base64 ciphertext and decrypts it to UTF-8 text.
pub async fn decrypt_from_base64(cli: &kms::Client, encoded: &str) -> io::Result<String> {
    let ciphertext = STANDARD.decode(encoded.trim()).map_err(|e| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("invalid base64 ciphertext ({})", e),
        )
    })?;
    let plaintext = cli.decrypt(&ciphertext).await?;
    String::from_utf8(plaintext).map_err(|e| {
        Error::new(
            ErrorKind::InvalidData,
            format!("plaintext is not UTF-8 ({})", e),
        )
    })
}

/// RUST_LOG=debug cargo test --package codelab-kms --bin codelab-kms -- decrypt::test_decrypt_from_base64 --exact --show-output
#[tokio::test]
async fn test_decrypt_from_base64() {
    use codelab_ops::credential::{Provider, TokenSource};

    use crate::fake;

    let _ = env_logger::builder().is_test(true).try_init();

    let addr = fake::spawn_kms().await;
    let cli = kms::Client::with_endpoint(
        &format!("http://{addr}"),
        fake::KEY_NAME,
        Arc::new(TokenSource::new(Provider::Static(String::from(
            fake::ACCESS_TOKEN,
        )))),
    );

    // trailing newline as written by "encrypt --output-file" and editors
    let encoded = format!("{}\n", STANDARD.encode(b"yek-etavirp"));
    assert_eq!(
        decrypt_from_base64(&cli, &encoded).await.unwrap(),
        "private-key"
    );

    let err = decrypt_from_base64(&cli, "not base64!").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = decrypt_from_base64(&cli, &STANDARD.encode([0xff, 0xfe]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidData);
}
