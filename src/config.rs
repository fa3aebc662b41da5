//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Supports YAML configuration files; later sources override earlier ones.

use crate::{Result, TunnelError};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Custom deserializer for optional paths that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings every tunnel is built from
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub flow_control: FlowControlConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub post_buffer: PostBufferConfig,
}

/// Backlog thresholds for pausing and resuming source reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowControlConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Resume a throttled source once its backlog drops strictly below this
    #[serde(default = "default_low_water")]
    pub low_water: u64,
    /// Throttle a source once its backlog reaches this
    #[serde(default = "default_high_water")]
    pub high_water: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            low_water: default_low_water(),
            high_water: default_high_water(),
        }
    }
}

impl FlowControlConfig {
    /// Zero water marks mean "not configured"
    fn apply_zero_defaults(&mut self) {
        if self.low_water == 0 {
            self.low_water = default_low_water();
        }
        if self.high_water == 0 {
            self.high_water = default_high_water();
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.low_water > self.high_water {
            return Err(format!(
                "low_water ({}) must not exceed high_water ({})",
                self.low_water, self.high_water
            ));
        }
        if self.enabled && self.high_water == 0 {
            return Err("high_water must be greater than 0 when flow control is enabled".to_string());
        }
        Ok(())
    }
}

fn default_low_water() -> u64 {
    32 * 1024
}

fn default_high_water() -> u64 {
    64 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Largest chunk emitted when encoding
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: i64,
    #[serde(default = "default_true")]
    pub drop_chunked_trailers: bool,
    #[serde(default = "default_true")]
    pub strict_chunk_parsing: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            drop_chunked_trailers: true,
            strict_chunk_parsing: true,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_chunk_size <= 0 {
            return Err(format!(
                "max_chunk_size must be positive, got {}",
                self.max_chunk_size
            ));
        }
        Ok(())
    }
}

fn default_max_chunk_size() -> i64 {
    crate::chunked::DEFAULT_MAX_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}

/// Request body capture for replay after a redirect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostBufferConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_post_buffer_size")]
    pub max_size: i64,
}

impl Default for PostBufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: default_post_buffer_size(),
        }
    }
}

fn default_post_buffer_size() -> i64 {
    2048
}

impl TunnelConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.flow_control.validate()?;
        self.chunking.validate()?;
        if self.post_buffer.enabled && self.post_buffer.max_size < 0 {
            return Err("post_buffer.max_size must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Daily rolling log files are written here when set
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Resolve configuration for already parsed arguments
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides();

        // Override with command line arguments
        config.apply_cli_overrides(matches);

        config.tunnel.flow_control.apply_zero_defaults();
        config.validate()?;

        if config.tunnel.flow_control.enabled {
            info!(
                "Flow control enabled (low_water: {}, high_water: {})",
                config.tunnel.flow_control.low_water, config.tunnel.flow_control.high_water
            );
        } else {
            info!("Flow control disabled");
        }
        info!(
            "Chunking: max_chunk_size={}, drop_trailers={}, strict={}",
            config.tunnel.chunking.max_chunk_size,
            config.tunnel.chunking.drop_chunked_trailers,
            config.tunnel.chunking.strict_chunk_parsing
        );
        if config.tunnel.post_buffer.enabled {
            info!(
                "Request body capture enabled (max_size: {})",
                config.tunnel.post_buffer.max_size
            );
        }

        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate().map_err(|e| {
            TunnelError::ConfigError(format!("Invalid tunnel configuration: {}", e))
        })
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("proxy-tunnel")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Tunnels a body through producers and consumers with chunked transcoding")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("input")
                    .short('i')
                    .long("input")
                    .value_name("FILE")
                    .help("File whose bytes are produced into the tunnel"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("FILE")
                    .help("File written by the client consumer"),
            )
            .arg(
                Arg::new("cache-output")
                    .long("cache-output")
                    .value_name("FILE")
                    .help("File written by an additional cache-write consumer"),
            )
            .arg(
                Arg::new("action")
                    .long("action")
                    .value_name("ACTION")
                    .value_parser(["none", "chunk", "dechunk", "passthru"])
                    .default_value("none")
                    .help("Chunking action applied to the input"),
            )
            .arg(
                Arg::new("skip-bytes")
                    .long("skip-bytes")
                    .value_name("BYTES")
                    .help("Header bytes at the start of the input passed through untouched"),
            )
            .arg(
                Arg::new("block-size")
                    .long("block-size")
                    .value_name("BYTES")
                    .help("Bytes moved per I/O step (default: 4096)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("log-dir")
                    .long("log-dir")
                    .value_name("DIR")
                    .help("Directory for daily rolling log files"),
            )
            .arg(
                Arg::new("flow-control")
                    .long("flow-control")
                    .action(clap::ArgAction::SetTrue)
                    .help("Enable flow control"),
            )
            .arg(
                Arg::new("low-water")
                    .long("low-water")
                    .value_name("BYTES")
                    .help("Backlog below which a throttled source resumes"),
            )
            .arg(
                Arg::new("high-water")
                    .long("high-water")
                    .value_name("BYTES")
                    .help("Backlog at which a source is throttled"),
            )
            .arg(
                Arg::new("max-chunk-size")
                    .long("max-chunk-size")
                    .value_name("BYTES")
                    .help("Largest chunk emitted when chunking (default: 4096)"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TunnelError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            TunnelError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("TUNNEL_FLOW_CONTROL_ENABLED") {
            self.tunnel.flow_control.enabled = enabled.to_lowercase() == "true";
        }

        if let Some(low) = env_parse("TUNNEL_LOW_WATER") {
            self.tunnel.flow_control.low_water = low;
        }

        if let Some(high) = env_parse("TUNNEL_HIGH_WATER") {
            self.tunnel.flow_control.high_water = high;
        }

        if let Some(size) = env_parse("TUNNEL_MAX_CHUNK_SIZE") {
            self.tunnel.chunking.max_chunk_size = size;
        }

        if let Ok(drop) = std::env::var("TUNNEL_DROP_TRAILERS") {
            self.tunnel.chunking.drop_chunked_trailers = drop.to_lowercase() == "true";
        }

        if let Ok(strict) = std::env::var("TUNNEL_STRICT_CHUNK_PARSING") {
            self.tunnel.chunking.strict_chunk_parsing = strict.to_lowercase() == "true";
        }

        if let Some(size) = env_parse::<i64>("TUNNEL_POST_BUFFER_SIZE") {
            self.tunnel.post_buffer.enabled = size > 0;
            self.tunnel.post_buffer.max_size = size.max(0);
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Ok(dir) = std::env::var("LOG_DIR") {
            self.logging.log_dir = Some(pathbuf_serde::expand_tilde(&dir));
        }
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if let Some(dir) = matches.get_one::<String>("log-dir") {
            self.logging.log_dir = Some(pathbuf_serde::expand_tilde(dir));
        }

        if matches.get_flag("flow-control") {
            self.tunnel.flow_control.enabled = true;
        }

        if let Some(low) = parse_arg(matches, "low-water") {
            self.tunnel.flow_control.low_water = low;
        }

        if let Some(high) = parse_arg(matches, "high-water") {
            self.tunnel.flow_control.high_water = high;
        }

        if let Some(size) = parse_arg(matches, "max-chunk-size") {
            self.tunnel.chunking.max_chunk_size = size;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={}", key, value);
            None
        }
    }
}

fn parse_arg<T: std::str::FromStr>(matches: &ArgMatches, id: &str) -> Option<T> {
    let value = matches.get_one::<String>(id)?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable --{} {}", id, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::TestResult;
    use quickcheck_macros::quickcheck;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.tunnel.flow_control.enabled);
        assert_eq!(config.tunnel.flow_control.low_water, 32768);
        assert_eq!(config.tunnel.flow_control.high_water, 65536);
        assert_eq!(config.tunnel.chunking.max_chunk_size, 4096);
        assert!(config.tunnel.chunking.drop_chunked_trailers);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
tunnel:
  flow_control:
    enabled: true
    high_water: 2000
logging:
  log_dir: "/var/log/tunnel"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.tunnel.flow_control.enabled);
        assert_eq!(config.tunnel.flow_control.high_water, 2000);
        assert_eq!(config.tunnel.flow_control.low_water, 32768);
        assert_eq!(config.tunnel.post_buffer.max_size, 2048);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/var/log/tunnel")));
    }

    #[test]
    fn test_null_log_dir() {
        let config: Config = serde_yaml::from_str("logging:\n  log_dir: null\n").unwrap();
        assert_eq!(config.logging.log_dir, None);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "tunnel:\n  chunking:\n    max_chunk_size: 512\n    strict_chunk_parsing: false\n"
        )
        .unwrap();
        let config = Config::load_from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.tunnel.chunking.max_chunk_size, 512);
        assert!(!config.tunnel.chunking.strict_chunk_parsing);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = Config::load_from_file("/nonexistent/tunnel.yaml").unwrap_err();
        assert!(matches!(err, TunnelError::ConfigError(_)));
    }

    #[test]
    fn test_zero_water_marks_fall_back() {
        let mut flow = FlowControlConfig {
            enabled: true,
            low_water: 0,
            high_water: 0,
        };
        flow.apply_zero_defaults();
        assert_eq!(flow, FlowControlConfig { enabled: true, ..Default::default() });
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("TUNNEL_FLOW_CONTROL_ENABLED", "TRUE");
        std::env::set_var("TUNNEL_LOW_WATER", "100");
        std::env::set_var("TUNNEL_HIGH_WATER", "not-a-number");
        std::env::set_var("TUNNEL_POST_BUFFER_SIZE", "8192");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TUNNEL_FLOW_CONTROL_ENABLED");
        std::env::remove_var("TUNNEL_LOW_WATER");
        std::env::remove_var("TUNNEL_HIGH_WATER");
        std::env::remove_var("TUNNEL_POST_BUFFER_SIZE");

        assert!(config.tunnel.flow_control.enabled);
        assert_eq!(config.tunnel.flow_control.low_water, 100);
        assert_eq!(config.tunnel.flow_control.high_water, 65536);
        assert!(config.tunnel.post_buffer.enabled);
        assert_eq!(config.tunnel.post_buffer.max_size, 8192);
    }

    #[test]
    fn test_cli_overrides() {
        let matches = Config::build_cli()
            .try_get_matches_from([
                "proxy-tunnel",
                "--flow-control",
                "--low-water",
                "10",
                "--high-water",
                "20",
                "--max-chunk-size",
                "64",
            ])
            .unwrap();
        let mut config = Config::default();
        config.apply_cli_overrides(&matches);
        assert!(config.tunnel.flow_control.enabled);
        assert_eq!(config.tunnel.flow_control.low_water, 10);
        assert_eq!(config.tunnel.flow_control.high_water, 20);
        assert_eq!(config.tunnel.chunking.max_chunk_size, 64);
    }

    #[test]
    fn test_rejects_inverted_water_marks() {
        let mut config = Config::default();
        config.tunnel.flow_control.low_water = 10;
        config.tunnel.flow_control.high_water = 5;
        assert!(matches!(config.validate(), Err(TunnelError::ConfigError(_))));
    }

    #[quickcheck]
    fn prop_flow_control_validation(enabled: bool, low: u32, high: u32) -> TestResult {
        let flow = FlowControlConfig {
            enabled,
            low_water: low as u64,
            high_water: high as u64,
        };
        let should_be_valid = low <= high && !(enabled && high == 0);
        TestResult::from_bool(flow.validate().is_ok() == should_be_valid)
    }
}
