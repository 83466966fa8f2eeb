mod credential_config;
mod credentials;
mod decrypt;
mod encrypt;
#[cfg(test)]
mod fake;

use std::io;

use clap::{crate_version, ArgMatches, Command};

const APP_NAME: &str = "codelab-kms";

#[tokio::main]
async fn main() -> io::Result<()> {
    let matches = Command::new(APP_NAME)
        .version(crate_version!())
        .about("Cloud KMS tools for the confidential computing workloads")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommands(vec![
            encrypt::command(),
            decrypt::command(),
            credential_config::command(),
        ])
        .get_matches();

    match matches.subcommand() {
        Some((encrypt::NAME, sub_matches)) => {
            encrypt::execute(encrypt::Options {
                log_level: string_of(sub_matches, "LOG_LEVEL", "info"),
                config_file: string_of(sub_matches, "CONFIG_FILE", ""),
                credentials: string_of(sub_matches, "CREDENTIALS", "workload-identity"),
                access_token: string_of(sub_matches, "ACCESS_TOKEN", ""),
                plaintext: string_of(sub_matches, "PLAINTEXT", ""),
                plaintext_file: string_of(sub_matches, "PLAINTEXT_FILE", ""),
                output_file: string_of(sub_matches, "OUTPUT_FILE", ""),
            })
            .await?;
        }

        Some((decrypt::NAME, sub_matches)) => {
            decrypt::execute(decrypt::Options {
                log_level: string_of(sub_matches, "LOG_LEVEL", "info"),
                config_file: string_of(sub_matches, "CONFIG_FILE", ""),
                credentials: string_of(sub_matches, "CREDENTIALS", "workload-identity"),
                access_token: string_of(sub_matches, "ACCESS_TOKEN", ""),
                ciphertext: string_of(sub_matches, "CIPHERTEXT", ""),
                ciphertext_file: string_of(sub_matches, "CIPHERTEXT_FILE", ""),
            })
            .await?;
        }

        Some((credential_config::NAME, sub_matches)) => {
            credential_config::execute(
                &string_of(sub_matches, "LOG_LEVEL", "info"),
                &string_of(sub_matches, "CONFIG_FILE", ""),
                &string_of(sub_matches, "OUTPUT_FILE", ""),
            )?;
        }

        _ => unreachable!("unknown subcommand"),
    }

    Ok(())
}

fn string_of(matches: &ArgMatches, id: &str, default: &str) -> String {
    matches
        .get_one::<String>(id)
        .cloned()
        .unwrap_or_else(|| String::from(default))
}
