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

pub const NAME: &str = "encrypt";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Encrypts data with the KMS key and prints the base64 ciphertext")
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
            Arg::new("PLAINTEXT")
                .long("plaintext")
                .help("Sets the text to encrypt")
                .required(false)
                .num_args(1)
                .conflicts_with("PLAINTEXT_FILE"),
        )
        .arg(
            Arg::new("PLAINTEXT_FILE")
                .long("plaintext-file")
                .help("Sets the file to encrypt")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("OUTPUT_FILE")
                .long("output-file")
                .short('o')
                .help("Sets the file to write the base64 ciphertext to (if empty, only prints)")
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
    pub plaintext: String,
    pub plaintext_file: String,
    pub output_file: String,
}

pub async fn execute(opts: Options) -> io::Result<()> {
    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &opts.log_level),
    );

    let plaintext = if !opts.plaintext_file.is_empty() {
        fs::read(&opts.plaintext_file)?
    } else if !opts.plaintext.is_empty() {
        opts.plaintext.as_bytes().to_vec()
    } else {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "either --plaintext or --plaintext-file is required",
        ));
    };

    let config = Config::load_or_env(Some(opts.config_file.as_str()))?;
    config.validate()?;
    let tokens = credentials::token_source(&opts.credentials, &opts.access_token, &config)?;
    let cli = kms::Client::new(&config.kms()?.name(), Arc::new(tokens));

    let encoded = encrypt_to_base64(&cli, &plaintext).await?;

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print(format!("\nencrypted with '{}'\n", cli.key_name())),
        ResetColor
    )?;
    println!("{}", encoded);

    if !opts.output_file.is_empty() {
        log::info!("writing ciphertext to '{}'", opts.output_file);
        fs::write(&opts.output_file, &encoded)?;
    }
    Ok(())
}

/// Encrypts the data and encodes the ciphertext in standard base64.
pub async fn encrypt_to_base64(cli: &kms::Client, plaintext: &[u8]) -> io::Result<String> {
    let ciphertext = cli.encrypt(plaintext).await?;
    Ok(STANDARD.encode(ciphertext))
}

/// RUST_LOG=debug cargo test --package codelab-kms --bin codelab-kms -- encrypt::test_encrypt_to_base64 --exact --show-output
#[tokio::test]
async fn test_encrypt_to_base64() {
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

    let encoded = encrypt_to_base64(&cli, b"0xabc").await.unwrap();
    assert_eq!(STANDARD.decode(&encoded).unwrap(), b"cba0x".to_vec());

    let denied = kms::Client::with_endpoint(
        &format!("http://{addr}"),
        fake::KEY_NAME,
        Arc::new(TokenSource::new(Provider::Static(random_manager::secure_string(10)))),
    );
    assert!(encrypt_to_base64(&denied, b"0xabc").await.is_err());
}
