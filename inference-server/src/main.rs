mod command;
mod flags;
mod routes;

use std::{
    io::{self, Error, ErrorKind},
    net::SocketAddr,
};

use clap::{crate_version, Arg, ArgAction, Command};

pub const APP_NAME: &str = "inference-server";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Serves code generation for envelope-encrypted prompts")
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
            Arg::new("HTTP_HOST")
                .long("http-host")
                .help("Sets the HTTP host/port to serve (127.0.0.1:8080 to only serve locally)")
                .required(false)
                .num_args(1)
                .default_value("0.0.0.0:8080"),
        )
        .arg(
            Arg::new("CONFIG_FILE")
                .long("config-file")
                .short('c')
                .help("Sets the YAML configuration file path (if empty, reads the environment variables)")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("MODEL_DIR")
                .long("model-dir")
                .help("Sets the local directory to download the model files to")
                .required(false)
                .num_args(1)
                .default_value("/tmp/codegemma-2b"),
        )
        .arg(
            Arg::new("SKIP_MODEL_DOWNLOAD")
                .long("skip-model-download")
                .help("Skips downloading the model files (e.g., already served by the generator)")
                .required(false)
                .num_args(0)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("GENERATOR")
                .long("generator")
                .help("Sets the generation backend")
                .required(false)
                .num_args(1)
                .value_parser(["echo", "http"])
                .default_value("http"),
        )
        .arg(
            Arg::new("GENERATOR_URL")
                .long("generator-url")
                .help("Sets the text-generation endpoint that serves the model")
                .required(false)
                .num_args(1)
                .default_value("http://127.0.0.1:8081/generate"),
        )
        .arg(
            Arg::new("LOCAL_KEK_FILE")
                .long("local-kek-file")
                .help("Sets the hex-encoded key file to unwrap data keys without KMS (only for testing)")
                .required(false)
                .num_args(1),
        )
        .get_matches();

    println!("{} version: {}", APP_NAME, crate_version!());

    let http_host = matches
        .get_one::<String>("HTTP_HOST")
        .unwrap_or(&String::from("0.0.0.0:8080"))
        .clone();
    let http_host: SocketAddr = http_host.parse().map_err(|e| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("invalid --http-host '{}' ({})", http_host, e),
        )
    })?;

    command::execute(flags::Options {
        log_level: matches
            .get_one::<String>("LOG_LEVEL")
            .unwrap_or(&String::from("info"))
            .clone(),
        http_host,
        config_file: matches
            .get_one::<String>("CONFIG_FILE")
            .unwrap_or(&String::new())
            .clone(),
        model_dir: matches
            .get_one::<String>("MODEL_DIR")
            .unwrap_or(&String::from("/tmp/codegemma-2b"))
            .clone(),
        skip_model_download: matches.get_flag("SKIP_MODEL_DOWNLOAD"),
        generator: matches
            .get_one::<String>("GENERATOR")
            .unwrap_or(&String::from("http"))
            .clone(),
        generator_url: matches
            .get_one::<String>("GENERATOR_URL")
            .unwrap_or(&String::new())
            .clone(),
        local_kek_file: matches
            .get_one::<String>("LOCAL_KEK_FILE")
            .unwrap_or(&String::new())
            .clone(),
    })
    .await
}
