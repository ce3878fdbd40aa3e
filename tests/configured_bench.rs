//! A mock bench described entirely by the application config.

use std::sync::Arc;
use std::time::Duration;

use rust_qdaq::prelude::*;
use serde_json::Value;
use tokio::time::Instant;

const BENCH: &str = r#"
[application]
name = "mock bench"

[ramp_speeds]
dac_ch1 = 0.5

[[instruments]]
id = "dac"
type = "mock_voltage_source"
[instruments.config]
channels = 2

[[instruments]]
id = "lockin"
type = "mock_lockin"
"#;

#[tokio::test(start_paused = true)]
async fn configured_ramp_speed_paces_the_sweep() {
    let config = AppConfig::from_toml_str(BENCH).unwrap();
    let registry = config.build_registry().await.unwrap();
    assert!(registry.contains("dac_ch1"));
    assert!(registry.contains("dac_ch2"));

    let axis = SweepAxis::from_registry(&registry, "dac_ch1", 0.0, 1.0, 2).unwrap();
    let lockin: Arc<dyn Detector> =
        Arc::new(BufferedDetector::from_registry(&registry, "lockin").unwrap());

    let started = Instant::now();
    let outcome = config
        .sweep_driver(&registry)
        .do1d(&axis, &[lockin])
        .await
        .unwrap();

    assert_eq!(outcome.steps, 2);
    // 1 V at the configured 0.5 V/s
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(
        registry.get_parameter("dac_ch1", "slope").unwrap(),
        Value::Null
    );
}

#[tokio::test]
async fn unknown_driver_type_fails_registry_build() {
    let config = AppConfig::from_toml_str(
        r#"
[application]
name = "x"

[[instruments]]
id = "vna"
type = "network_analyzer"
"#,
    )
    .unwrap();
    assert!(config.build_registry().await.is_err());
}
