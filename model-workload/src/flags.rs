/// Defines flag options.
#[derive(Debug)]
pub struct Options {
    pub log_level: String,
    pub config_file: String,
    pub model_dir: String,
    pub classifier_url: String,
}
