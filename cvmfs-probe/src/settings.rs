//! Process-level settings.
//!
//! Loaded from an optional YAML file plus environment variables (with `__`
//! as the nesting separator); a `.env` file is honored. Probe instances are
//! declared as blocks of directives:
//!
//! ```yaml
//! interval: 120
//! probes:
//!   - directives:
//!       - key: repo
//!         values: ["atlas.cern.ch", "cms.cern.ch"]
//!       - key: attribute
//!         values: usedfd
//!       - key: mounttimeout
//!         values: "10"
//! ```

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::config::Directive;

const DEFAULT_READ_INTERVAL_SECONDS: u64 = 60;

/// One block of directives, yielding one independently scheduled probe
/// instance.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProbeBlock {
    #[serde(default)]
    pub directives: Vec<Directive>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    /// Global sampling cadence in seconds, for instances without their own
    /// `interval` directive.
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub probes: Vec<ProbeBlock>,
}

fn default_interval() -> u64 {
    DEFAULT_READ_INTERVAL_SECONDS
}

impl Settings {
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }
        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }
}
