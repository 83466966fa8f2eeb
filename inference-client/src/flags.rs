use std::fmt;

/// Defines flag options.
pub struct Options {
    pub log_level: String,
    pub config_file: String,
    pub server_url: String,
    pub prompt: String,
    pub access_token: String,
    pub local_kek_file: String,
}

/// Never prints the access token.
impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("log_level", &self.log_level)
            .field("config_file", &self.config_file)
            .field("server_url", &self.server_url)
            .field("prompt", &self.prompt)
            .field(
                "access_token",
                &if self.access_token.is_empty() { "" } else { "<redacted>" },
            )
            .field("local_kek_file", &self.local_kek_file)
            .finish()
    }
}
