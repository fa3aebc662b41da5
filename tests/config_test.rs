//! Configuration Loading Tests
//!
//! File, command line and validation layering as seen by the binary.

use proxy_tunnel::config::Config;
use proxy_tunnel::TunnelError;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn config_file(yaml: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_command_line_overrides_file() {
    let file = config_file(
        r#"
tunnel:
  flow_control:
    enabled: false
    low_water: 1000
    high_water: 5000
  chunking:
    max_chunk_size: 1024
logging:
  log_level: warn
"#,
    );
    let path = file.path().to_str().unwrap();
    let matches = Config::build_cli()
        .try_get_matches_from([
            "proxy-tunnel",
            "--config",
            path,
            "--flow-control",
            "--high-water",
            "8000",
            "--log-level",
            "debug",
        ])
        .unwrap();

    let config = Config::from_matches(&matches).unwrap();
    assert!(config.tunnel.flow_control.enabled);
    assert_eq!(config.tunnel.flow_control.low_water, 1000);
    assert_eq!(config.tunnel.flow_control.high_water, 8000);
    assert_eq!(config.tunnel.chunking.max_chunk_size, 1024);
    assert_eq!(config.logging.log_level, "debug");
}

#[test]
fn test_zero_water_marks_in_file_use_defaults() {
    let file = config_file(
        r#"
tunnel:
  flow_control:
    enabled: true
    low_water: 0
    high_water: 0
"#,
    );
    let matches = Config::build_cli()
        .try_get_matches_from(["proxy-tunnel", "-c", file.path().to_str().unwrap()])
        .unwrap();

    let config = Config::from_matches(&matches).unwrap();
    assert_eq!(config.tunnel.flow_control.low_water, 32 * 1024);
    assert_eq!(config.tunnel.flow_control.high_water, 64 * 1024);
}

#[test]
fn test_invalid_combination_is_rejected() {
    let file = config_file("tunnel:\n  flow_control:\n    low_water: 9000\n    high_water: 100\n");
    let matches = Config::build_cli()
        .try_get_matches_from(["proxy-tunnel", "-c", file.path().to_str().unwrap()])
        .unwrap();

    let err = Config::from_matches(&matches).unwrap_err();
    assert!(matches!(err, TunnelError::ConfigError(_)));
}

#[test]
fn test_malformed_yaml_is_reported() {
    let file = config_file("tunnel: [not, a, map");
    let matches = Config::build_cli()
        .try_get_matches_from(["proxy-tunnel", "-c", file.path().to_str().unwrap()])
        .unwrap();

    match Config::from_matches(&matches) {
        Err(TunnelError::ConfigError(msg)) => assert!(msg.contains("Failed to parse")),
        other => panic!("expected a parse error, got {:?}", other),
    }
}

#[test]
fn test_log_dir_from_command_line() {
    let dir = tempfile::TempDir::new().unwrap();
    let matches = Config::build_cli()
        .try_get_matches_from([
            "proxy-tunnel",
            "--log-dir",
            dir.path().to_str().unwrap(),
        ])
        .unwrap();

    let config = Config::from_matches(&matches).unwrap();
    assert_eq!(config.logging.log_dir, Some(PathBuf::from(dir.path())));
}

#[test]
fn test_action_values_are_checked() {
    assert!(Config::build_cli()
        .try_get_matches_from(["proxy-tunnel", "--action", "gzip"])
        .is_err());
    let matches = Config::build_cli()
        .try_get_matches_from(["proxy-tunnel"])
        .unwrap();
    assert_eq!(
        matches.get_one::<String>("action").map(String::as_str),
        Some("none")
    );
}
