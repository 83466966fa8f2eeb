mod command;
mod flags;

use std::io;

use clap::{crate_version, Arg, Command};

pub const APP_NAME: &str = "model-workload";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Classifies images with a protected model and uploads the results")
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
            Arg::new("MODEL_DIR")
                .long("model-dir")
                .help("Sets the local directory to download and unpack the model to")
                .required(false)
                .num_args(1)
                .default_value("/tmp/model"),
        )
        .arg(
            Arg::new("CLASSIFIER_URL")
                .long("classifier-url")
                .help("Sets the predict endpoint that serves the unpacked model")
                .required(false)
                .num_args(1)
                .default_value("http://127.0.0.1:8501/v1/models/model:predict"),
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
        model_dir: matches
            .get_one::<String>("MODEL_DIR")
            .unwrap_or(&String::from("/tmp/model"))
            .clone(),
        classifier_url: matches
            .get_one::<String>("CLASSIFIER_URL")
            .unwrap_or(&String::new())
            .clone(),
    })
    .await
}
