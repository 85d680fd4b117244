//! Probe instance configuration.
//!
//! A probe instance is described by an ordered list of [`Directive`]s, the
//! same shape the monitoring daemon's config blocks have: a key plus one or
//! more string values. Parsing folds them into an immutable [`ProbeConfig`].

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::telemetry::PLUGIN_NAME;

const DEFAULT_MEMORY: bool = true;
const DEFAULT_MOUNTTIME: bool = true;
const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(5);

/// One configuration node: a key and its ordered values.
///
/// Both `values: "atlas.cern.ch"` and `values: ["atlas.cern.ch", ...]` are
/// accepted when deserializing, matching the one-or-many value nodes of the
/// daemon's config format.
#[derive(Debug, Clone, Deserialize)]
pub struct Directive {
    pub key: String,
    #[serde(deserialize_with = "one_or_many")]
    pub values: Vec<String>,
}

impl Directive {
    pub fn new(key: &str, values: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Immutable snapshot of the directives for one probe instance.
///
/// Constructed once by [`ProbeConfig::from_directives`] and never mutated
/// afterwards; the scheduler shares it with the instance's read loop.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Repositories to probe, in directive order.
    pub repos: Vec<String>,
    /// Extended-attribute counters to sample, in directive order.
    pub attributes: Vec<String>,
    pub memory: bool,
    pub mounttime: bool,
    pub mount_timeout: Duration,
    /// Per-instance sampling cadence; `None` defers to the scheduler's
    /// global default.
    pub interval: Option<Duration>,
    /// Distinguishes this instance from siblings when registering with the
    /// scheduler. Assigned at construction, never changes.
    pub instance_id: String,
    pub verbose: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            repos: Vec::new(),
            attributes: Vec::new(),
            memory: DEFAULT_MEMORY,
            mounttime: DEFAULT_MOUNTTIME,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
            interval: None,
            instance_id: Uuid::new_v4().simple().to_string(),
            verbose: false,
        }
    }
}

impl ProbeConfig {
    /// Fold an ordered directive list into a configuration.
    ///
    /// Directive keys are case-insensitive; unknown keys are ignored.
    /// Malformed boolean values are logged and leave the field at its prior
    /// value. Malformed integer values (`mounttimeout`, `interval`) fail the
    /// whole configuration step; the caller registers nothing.
    pub fn from_directives(directives: &[Directive]) -> Result<Self> {
        let mut config = Self::default();

        for directive in directives {
            match directive.key.to_lowercase().as_str() {
                "repo" => config.repos.extend(directive.values.iter().cloned()),
                "attribute" => config.attributes.extend(directive.values.iter().cloned()),
                "memory" => apply_bool(&mut config.memory, directive, "Memory"),
                "mounttime" => apply_bool(&mut config.mounttime, directive, "MountTime"),
                "verbose" => apply_bool(&mut config.verbose, directive, "Verbose"),
                "mounttimeout" => {
                    let seconds: u64 = single_value(directive)?.parse().with_context(|| {
                        format!("invalid MountTimeout value {:?}", directive.values)
                    })?;
                    config.mount_timeout = Duration::from_secs(seconds);
                }
                "interval" => {
                    let seconds: i64 = single_value(directive)?
                        .parse()
                        .with_context(|| format!("invalid Interval value {:?}", directive.values))?;
                    // Non-positive means "use the global cadence".
                    if seconds > 0 {
                        config.interval = Some(Duration::from_secs(seconds as u64));
                    }
                }
                _ => {}
            }
        }

        Ok(config)
    }

    pub fn effective_interval(&self, default: Duration) -> Duration {
        self.interval.unwrap_or(default)
    }
}

impl fmt::Display for ProbeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interval = match self.interval {
            Some(i) => format!("{}s", i.as_secs()),
            None => "global interval".to_string(),
        };
        write!(
            f,
            "Repos: {:?} - Attributes: {:?} - Memory: {} - MountTime: {} - MountTimeout: {}s - Interval: {} - Instance: {} - Verbose: {}",
            self.repos,
            self.attributes,
            self.memory,
            self.mounttime,
            self.mount_timeout.as_secs(),
            interval,
            self.instance_id,
            self.verbose,
        )
    }
}

fn single_value(directive: &Directive) -> Result<&str> {
    directive
        .values
        .first()
        .map(String::as_str)
        .with_context(|| format!("directive {} has no value", directive.key))
}

fn apply_bool(field: &mut bool, directive: &Directive, name: &str) {
    match directive.values.first() {
        Some(value) => match parse_bool(value) {
            Some(parsed) => *field = parsed,
            None => info!(
                "{PLUGIN_NAME}: {name} value {value} is not valid. It must be either True or False"
            ),
        },
        None => info!(
            "{PLUGIN_NAME}: {name} directive has no value. It must be either True or False"
        ),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}
