use serde_derive::{Deserialize, Serialize};
use sloggers::Config;

/// Injectable logging configuration. Mirrors the shape `sloggers::LoggerConfig` accepts, kept
/// as its own type so hosts can build one in code without round-tripping through TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(rename = "type")]
    pub sink: String,
    pub level: String,
    pub destination: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            sink: "terminal".to_string(),
            level: "debug".to_string(),
            destination: "stderr".to_string(),
        }
    }
}

/// Builds a `slog::Logger` from a `LogConfig`. Unlike a hardcoded TOML literal, this lets the
/// hosting application choose sink/level/destination instead of always writing to stderr.
pub fn init_from_config(config: &LogConfig) -> slog::Logger {
    let toml = format!(
        "type = \"{}\"\nlevel = \"{}\"\ndestination = \"{}\"\n",
        config.sink, config.level, config.destination
    );

    let logger_config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("invalid logging configuration");

    logger_config
        .build_logger()
        .expect("failed to build logger")
}

/// Convenience entry point for hosts that just want sane defaults on stderr.
pub fn init() -> slog::Logger {
    init_from_config(&LogConfig::default())
}
