// ⚙️ Harvest Configuration - defaults plus LOAN_ATLAS_* overrides

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How long a "not found" geocoding answer stays authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeCachePolicy {
    /// Never ask the geocoder about that text again
    Permanent,

    /// Re-query once the entry is older than the window
    RetryAfter(Duration),
}

impl FromStr for NegativeCachePolicy {
    type Err = anyhow::Error;

    /// `permanent`, or a whole number of hours (`72h`)
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("permanent") {
            return Ok(NegativeCachePolicy::Permanent);
        }

        let hours: u64 = s
            .strip_suffix('h')
            .unwrap_or(s)
            .parse()
            .with_context(|| format!("Invalid negative cache policy: {:?}", s))?;
        Ok(NegativeCachePolicy::RetryAfter(Duration::from_secs(hours * 3600)))
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Base URL of the lending API (no trailing slash)
    pub api_base: String,

    /// Base URL of the geocoding endpoint
    pub geocoder_base: String,

    /// Pause before every lending API call
    pub source_delay: Duration,

    /// Pause before lending API calls made while folding snapshot files
    pub snapshot_delay: Duration,

    /// Pause before every geocoding call
    pub geocode_delay: Duration,

    /// Per-record failures tolerated before the run aborts
    pub max_errors: usize,

    /// Root for persisted state and exported datasets
    pub data_dir: PathBuf,

    /// Where bulk snapshot files `<n>.json` live
    pub snapshot_dir: PathBuf,

    /// Program plus leading arguments; the run id is appended
    pub renderer: Vec<String>,

    pub negative_cache: NegativeCachePolicy,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        HarvestConfig {
            api_base: "http://api.kivaws.org/v1".to_string(),
            geocoder_base: "http://maps.googleapis.com/maps/geo".to_string(),
            source_delay: Duration::from_secs(3),
            snapshot_delay: Duration::from_secs(1),
            geocode_delay: Duration::from_secs(1),
            max_errors: 30,
            data_dir: PathBuf::from("data"),
            snapshot_dir: PathBuf::from("loans"),
            renderer: vec![
                "Rscript".to_string(),
                "draw_custom_map.R".to_string(),
                "--args".to_string(),
            ],
            negative_cache: NegativeCachePolicy::Permanent,
        }
    }
}

impl HarvestConfig {
    /// Defaults overridden by any `LOAN_ATLAS_*` variable that is set.
    pub fn from_env() -> Result<Self> {
        let mut config = HarvestConfig::default();

        if let Some(v) = optional_env("LOAN_ATLAS_API_BASE") {
            config.api_base = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = optional_env("LOAN_ATLAS_GEOCODER_BASE") {
            config.geocoder_base = v;
        }
        if let Some(v) = optional_env("LOAN_ATLAS_SOURCE_DELAY_MS") {
            config.source_delay = parse_millis("LOAN_ATLAS_SOURCE_DELAY_MS", &v)?;
        }
        if let Some(v) = optional_env("LOAN_ATLAS_SNAPSHOT_DELAY_MS") {
            config.snapshot_delay = parse_millis("LOAN_ATLAS_SNAPSHOT_DELAY_MS", &v)?;
        }
        if let Some(v) = optional_env("LOAN_ATLAS_GEOCODE_DELAY_MS") {
            config.geocode_delay = parse_millis("LOAN_ATLAS_GEOCODE_DELAY_MS", &v)?;
        }
        if let Some(v) = optional_env("LOAN_ATLAS_MAX_ERRORS") {
            config.max_errors = v
                .parse()
                .with_context(|| format!("LOAN_ATLAS_MAX_ERRORS must be a number, got {:?}", v))?;
        }
        if let Some(v) = optional_env("LOAN_ATLAS_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = optional_env("LOAN_ATLAS_SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(v);
        }
        if let Some(v) = optional_env("LOAN_ATLAS_RENDERER") {
            config.renderer = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = optional_env("LOAN_ATLAS_NEGATIVE_CACHE") {
            config.negative_cache = v.parse()?;
        }

        Ok(config)
    }

    /// Settings for tests and offline runs: no pauses at all.
    pub fn without_delays(mut self) -> Self {
        self.source_delay = Duration::ZERO;
        self.snapshot_delay = Duration::ZERO;
        self.geocode_delay = Duration::ZERO;
        self
    }

    /// Snapshot runs call the lending API at the snapshot pace.
    pub fn for_snapshots(mut self) -> Self {
        self.source_delay = self.snapshot_delay;
        self
    }

    pub fn log_summary(&self) {
        info!(
            api_base = self.api_base.as_str(),
            source_delay_ms = self.source_delay.as_millis() as u64,
            geocode_delay_ms = self.geocode_delay.as_millis() as u64,
            max_errors = self.max_errors,
            data_dir = %self.data_dir.display(),
            negative_cache = ?self.negative_cache,
            "Harvest configuration"
        );
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a number of milliseconds, got {:?}", key, value))?;
    Ok(Duration::from_millis(ms))
}
