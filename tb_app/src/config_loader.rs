use std::path::Path;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use tb_ratelimit::BucketConfig;

/// Settings for the gate binary
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GateConfigFile {
    pub bucket: BucketConfig,

    /// Also write logs to a daily rolling file in this directory
    #[serde(default)]
    pub log_dir: Option<String>,

    /// How often idle keys are swept, if the bucket has an idle timeout
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_sweep_interval_ms() -> u64 {
    10_000
}

impl Default for GateConfigFile {
    fn default() -> Self {
        Self { bucket: BucketConfig::default(), log_dir: None, sweep_interval_ms: default_sweep_interval_ms() }
    }
}

/// Load gate settings from `path`, overridden by `TB_`-prefixed environment
/// variables (e.g. `TB_BUCKET__CAPACITY=20`)
pub fn load_gate_config<P: AsRef<Path>>(path: P) -> Result<GateConfigFile, ConfigError> {
    let config = Config::builder()
        .add_source(File::from(path.as_ref()))
        .add_source(Environment::with_prefix("TB").prefix_separator("_").separator("__").try_parsing(true))
        .build()?;

    config.try_deserialize()
}
