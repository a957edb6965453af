//! Runtime configuration: one TOML file, environment overrides layered on
//! top via `figment`, same pattern as the pack's `fud-core` config loader.
//! A missing file is not an error — every field below has a default.

use std::path::PathBuf;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::DetectorError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    /// Every Nth memory event is admitted; 1 means "admit everything".
    pub period: u32,
    /// DRace's `lossy` knob: drop buffered events on a full buffer rather
    /// than process every one.
    pub lossy: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            period: 1,
            lossy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstrumentationConfig {
    pub memory: bool,
    pub stack: bool,
    pub symbols: bool,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        InstrumentationConfig {
            memory: true,
            stack: true,
            symbols: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExcludeConfig {
    pub modules: Vec<String>,
    pub path_prefixes: Vec<String>,
    /// DRace's `exclude_master`: skip instrumenting the thread that called
    /// `init`.
    pub master_thread: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub xml_file: Option<PathBuf>,
    pub terminal: bool,
    pub rate_limit_per_second: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            xml_file: None,
            terminal: true,
            rate_limit_per_second: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sampling: SamplingConfig,
    pub instrumentation: InstrumentationConfig,
    pub exclude: ExcludeConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Defaults layered with, in order of increasing precedence: a TOML
    /// file at `path` (skipped entirely if absent) and `RACEWATCH_`-
    /// prefixed environment variables.
    pub fn load(path: Option<&std::path::Path>) -> Result<Config, DetectorError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            }
        }
        figment = figment.merge(Env::prefixed("RACEWATCH_").split("_"));
        figment
            .extract()
            .map_err(|e| DetectorError::usage(format!("invalid configuration: {e}")))
    }
}
