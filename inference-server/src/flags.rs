use std::net::SocketAddr;

/// Defines flag options.
#[derive(Debug)]
pub struct Options {
    pub log_level: String,
    pub http_host: SocketAddr,
    pub config_file: String,
    pub model_dir: String,
    pub skip_model_download: bool,
    pub generator: String,
    pub generator_url: String,
    pub local_kek_file: String,
}
