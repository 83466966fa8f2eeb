use std::io::{self, Error, ErrorKind};

use clap::Arg;
use codelab_ops::{
    config::Config,
    credential::{Provider, TokenSource},
};

pub fn credentials_arg() -> Arg {
    Arg::new("CREDENTIALS")
        .long("credentials")
        .help("Sets where the KMS access token comes from ('workload-identity' inside the attested workload)")
        .required(false)
        .num_args(1)
        .value_parser(["workload-identity", "metadata", "static"])
        .default_value("workload-identity")
}

pub fn access_token_arg() -> Arg {
    Arg::new("ACCESS_TOKEN")
        .long("access-token")
        .help("Sets the bearer token for the 'static' credentials")
        .required(false)
        .num_args(1)
}

/// Picks the token provider for the KMS calls.
pub fn token_source(credentials: &str, access_token: &str, config: &Config) -> io::Result<TokenSource> {
    match credentials {
        "workload-identity" => Ok(TokenSource::external_account(config.workload_identity()?)),
        "metadata" => Ok(TokenSource::metadata()),
        "static" => {
            if access_token.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    "--access-token is required for the 'static' credentials",
                ));
            }
            Ok(TokenSource::new(Provider::Static(access_token.to_string())))
        }
        other => Err(Error::new(
            ErrorKind::InvalidInput,
            format!("unknown credentials '{}'", other),
        )),
    }
}

/// RUST_LOG=debug cargo test --package codelab-kms --bin codelab-kms -- credentials::test_token_source --exact --show-output
#[test]
fn test_token_source() {
    let config = Config::default();

    // no workload identity configured
    let err = token_source("workload-identity", "", &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let config = Config::from_vars(|k| match k {
        "PRIMUS_PROJECT_ID" => Some(String::from("primus-project")),
        "PRIMUS_PROJECT_NUMBER" => Some(String::from("123456789")),
        "PRIMUS_WORKLOAD_IDENTITY_POOL" => Some(String::from("pool")),
        "PRIMUS_WIP_PROVIDER" => Some(String::from("attestation-verifier")),
        "PRIMUS_SERVICEACCOUNT" => Some(String::from("run-confidential-vm")),
        _ => None,
    });
    let ts = token_source("workload-identity", "", &config).unwrap();
    assert!(matches!(ts.provider(), Provider::ExternalAccount(_)));

    let ts = token_source("metadata", "", &config).unwrap();
    assert!(matches!(ts.provider(), Provider::Metadata { .. }));

    let ts = token_source("static", "ya29.token", &config).unwrap();
    assert!(matches!(ts.provider(), Provider::Static(t) if t == "ya29.token"));
    assert!(token_source("static", "", &config).is_err());
    assert!(token_source("oauth", "", &config).is_err());
}
