//! Loading the application config from disk.

use std::io::Write;

use rust_qdaq::{AppConfig, QdaqError};
use serial_test::serial;
use tempfile::NamedTempFile;

const CONFIG: &str = r#"
[application]
name = "fridge 2"
log_level = "info"

[sweep]
inter_loop_margin = 0.1

[ramp_speeds]
dac_ch2 = 0.25

[[instruments]]
id = "dac"
type = "mock_voltage_source"
[instruments.config]
channels = 4
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn loads_file() {
    let file = write_config(CONFIG);
    let config = AppConfig::load_from(file.path()).unwrap();

    assert_eq!(config.application.name, "fridge 2");
    assert_eq!(config.sweep.inter_loop_margin, 0.1);
    assert_eq!(config.ramp_speeds.get("dac_ch2"), Some(&0.25));
    assert_eq!(config.hardware().instruments.len(), 1);
}

#[test]
#[serial]
fn environment_overrides_file() {
    let file = write_config(CONFIG);
    std::env::set_var("QDAQ_APPLICATION__LOG_LEVEL", "debug");
    let loaded = AppConfig::load_from(file.path());
    std::env::remove_var("QDAQ_APPLICATION__LOG_LEVEL");

    assert_eq!(loaded.unwrap().application.log_level, "debug");
}

#[test]
#[serial]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = AppConfig::load_from(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, QdaqError::Io(_)));
}

#[test]
#[serial]
fn invalid_timing_rejected() {
    let file = write_config(
        r#"
[application]
name = "x"

[sweep]
min_demod_latency = -1.0
"#,
    );
    let err = AppConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, QdaqError::Validation { parameter, .. } if parameter == "sweep.min_demod_latency"));
}

#[tokio::test]
#[serial]
async fn shipped_config_builds_mock_bench() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/qdaq.toml");
    let config = AppConfig::load_from(path).unwrap();
    let registry = config.build_registry().await.unwrap();

    for id in ["dac_ch1", "dac_ch4", "lockin", "counter", "scope", "awg", "fgen"] {
        assert!(registry.contains(id), "{id} not registered");
    }
    assert_eq!(config.sweep_driver(&registry).timing(), config.sweep);
}
