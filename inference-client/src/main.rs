mod command;
mod flags;

use std::io;

use clap::{crate_version, Arg, Command};

pub const APP_NAME: &str = "inference-client";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Sends an envelope-encrypted prompt to the inference server")
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
        .arg(
            Arg::new("SERVER_URL")
                .long("server-url")
                .help("Sets the generate endpoint (e.g., http://[HOST]:8080/generate), overrides INFERENCE_SERVER_URL")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("PROMPT")
                .long("prompt")
                .short('p')
                .help("Sets the prompt (if empty, asks for one)")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("ACCESS_TOKEN")
                .long("access-token")
                .help("Sets the bearer token for KMS (if empty, uses the VM default credentials)")
                .required(false)
                .num_args(1),
        )
        .arg(
            Arg::new("LOCAL_KEK_FILE")
                .long("local-kek-file")
                .help("Sets the hex-encoded key file to wrap data keys without KMS (only for testing)")
                .required(false)
                .num_args(1),
        )
        .get_matches();

    println!("{} version: {}", APP_NAME, crate_version!());

    command::execute(flags::Options {
        log_level: matches
            .get_one::<String>("LOG_LEVEL")
            .unwrap_or(&String::from("info"))
            .clone(),
        config_file: matches
            .get_one::<String>("CONFIG_FILE")
            .unwrap_or(&String::new())
            .clone(),
        server_url: matches
            .get_one::<String>("SERVER_URL")
            .unwrap_or(&String::new())
            .clone(),
        prompt: matches
            .get_one::<String>("PROMPT")
            .unwrap_or(&String::new())
            .clone(),
        access_token: matches
            .get_one::<String>("ACCESS_TOKEN")
            .unwrap_or(&String::new())
            .clone(),
        local_kek_file: matches
            .get_one::<String>("LOCAL_KEK_FILE")
            .unwrap_or(&String::new())
            .clone(),
    })
    .await
}
