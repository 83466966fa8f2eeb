use std::io::{self, stdout};

use clap::{Arg, Command};
use codelab_ops::{config::Config, credential::ExternalAccount};
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};

pub const NAME: &str = "credential-config";

pub fn command() -> Command {
    Command::new(NAME)
        .about("Prints the external account credential configuration of the workload identity")
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
            Arg::new("OUTPUT_FILE")
                .long("output-file")
                .short('o')
                .help("Sets the JSON file to write the credential configuration to (if empty, only prints)")
                .required(false)
                .num_args(1),
        )
}

pub fn execute(log_level: &str, config_file: &str, output_file: &str) -> io::Result<()> {
    // ref. <https://github.com/env-logger-rs/env_logger/issues/47>
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, log_level),
    );

    let ea = load_external_account(config_file)?;

    execute!(
        stdout(),
        SetForegroundColor(Color::Green),
        Print(format!("\ncredential configuration for '{}'\n", ea.audience)),
        ResetColor
    )?;
    println!("{}", ea.encode_json()?);

    if !output_file.is_empty() {
        ea.sync(output_file)?;
    }
    Ok(())
}

fn load_external_account(config_file: &str) -> io::Result<ExternalAccount> {
    let config = Config::load_or_env(Some(config_file))?;
    config.validate()?;
    Ok(ExternalAccount::from_workload_identity(
        config.workload_identity()?,
    ))
}

/// RUST_LOG=debug cargo test --package codelab-kms --bin codelab-kms -- credential_config::test_load_external_account --exact --show-output
#[test]
fn test_load_external_account() {
    use codelab_ops::config::WorkloadIdentity;

    let _ = env_logger::builder().is_test(true).try_init();

    let tmp_dir = tempfile::tempdir().unwrap();
    let config_path = tmp_dir.path().join("config.yaml");
    let config_path = config_path.to_str().unwrap();

    let config = Config {
        workload_identity: Some(WorkloadIdentity {
            project_id: String::from("primus-project"),
            project_number: String::from("123456789"),
            pool: String::from("primus-pool"),
            provider: String::from("attestation-verifier"),
            service_account: String::from("run-confidential-vm"),
            credential_source_file: String::from("/tmp/token"),
        }),
        ..Default::default()
    };
    config.sync(config_path).unwrap();

    let ea = load_external_account(config_path).unwrap();
    assert_eq!(
        ea.audience,
        "//iam.googleapis.com/projects/123456789/locations/global/workloadIdentityPools/primus-pool/providers/attestation-verifier"
    );
    assert_eq!(ea.credential_source.file, "/tmp/token");
    assert_eq!(
        ea.service_account_impersonation_url.as_deref(),
        Some("https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts/run-confidential-vm@primus-project.iam.gserviceaccount.com:generateAccessToken")
    );

    let out_path = tmp_dir.path().join("credential-config.json");
    ea.sync(out_path.to_str().unwrap()).unwrap();
    assert_eq!(ExternalAccount::load(out_path.to_str().unwrap()).unwrap(), ea);

    // no workload identity section
    Config::default().sync(config_path).unwrap();
    assert!(load_external_account(config_path).is_err());
}
