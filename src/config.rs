use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::{AggregatorOptions, View, ViewFactory};
use crate::ipfix::element::Registry;
use crate::ipfix::provider::FlowFilter;

/// Top-level configuration for a flowagg run.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// What to aggregate and how to merge.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Where flow records come from.
    #[serde(default)]
    pub input: InputConfig,

    /// How results are rendered.
    #[serde(default)]
    pub output: OutputConfig,

    /// How often progress is logged while aggregating. Default: 1s.
    #[serde(default = "default_progress_interval", with = "humantime_serde")]
    pub progress_interval: Duration,
}

/// Aggregation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Comma-separated key fields (e.g., "srcip, dstport").
    #[serde(default)]
    pub keys: String,

    /// Comma-separated value fields. Default: "flows, packets, bytes".
    #[serde(default = "default_values")]
    pub values: String,

    /// Comma-separated order fields, each optionally suffixed /asc or /desc.
    #[serde(default)]
    pub order_by: String,

    /// Maximum number of output records. 0 means unlimited.
    #[serde(default)]
    pub limit: Option<usize>,

    /// Worker thread count. Default: available parallelism.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Merge per-thread results into one table. Default: true.
    #[serde(default = "default_true")]
    pub merge: bool,

    /// Keep only the best N records with the threshold merge. 0 merges all.
    #[serde(default)]
    pub topk: usize,

    /// Drop biflow halves without octets and packets. Default: true.
    #[serde(default = "default_true")]
    pub biflow_autoignore: bool,

    /// Row limit per table for the threshold merge.
    #[serde(default)]
    pub max_rows: Option<usize>,

    /// Record filter.
    #[serde(default)]
    pub filter: Option<FilterConfig>,
}

/// Keeps record halves whose element equals a value.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Element name or "<pen>:<id>" reference.
    pub element: String,

    /// Required unsigned value.
    pub equals: u64,
}

/// Input configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct InputConfig {
    /// Glob patterns of flow files.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Output configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct OutputConfig {
    /// Output format. Default: table.
    #[serde(default)]
    pub format: OutputFormat,
}

/// Output format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_values() -> String {
    "flows, packets, bytes".to_string()
}

fn default_threads() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

fn default_true() -> bool {
    true
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(1)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            aggregation: AggregationConfig::default(),
            input: InputConfig::default(),
            output: OutputConfig::default(),
            progress_interval: default_progress_interval(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            keys: String::new(),
            values: default_values(),
            order_by: String::new(),
            limit: None,
            threads: default_threads(),
            merge: true,
            topk: 0,
            biflow_autoignore: true,
            max_rows: None,
            filter: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;

        if agg.keys.trim().is_empty() {
            bail!("aggregation.keys is required");
        }

        if agg.threads == 0 {
            bail!("aggregation.threads must be positive");
        }

        if agg.max_rows == Some(0) {
            bail!("aggregation.max_rows must be positive");
        }

        if agg.topk > 0 {
            if !agg.merge {
                bail!("aggregation.topk requires aggregation.merge");
            }
            if agg.order_by.trim().is_empty() {
                bail!("aggregation.topk requires aggregation.order_by");
            }
        }

        if self.progress_interval.is_zero() {
            bail!("progress_interval must be positive");
        }

        Ok(())
    }
}

impl AggregationConfig {
    /// Compiles the configured view, applying the output limit.
    pub fn create_view(&self, registry: &Registry) -> Result<View> {
        let mut view = ViewFactory::new(registry)
            .create_view(&self.keys, &self.values, &self.order_by)
            .context("compiling aggregation view")?;
        view.set_output_limit(self.limit.filter(|&n| n > 0));
        Ok(view)
    }

    /// Builds the threaded aggregator options, resolving the filter element.
    pub fn options(&self, registry: &Registry) -> Result<AggregatorOptions> {
        let filter = match &self.filter {
            Some(f) => {
                let elem = registry
                    .find_name(&f.element)
                    .or_else(|| registry.find_ref(&f.element))
                    .with_context(|| format!("cannot find filter element \"{}\"", f.element))?;
                Some(FlowFilter::uint_equals(elem.pen, elem.id, f.equals))
            }
            None => None,
        };

        Ok(AggregatorOptions {
            threads: self.threads,
            merge_results: self.merge,
            merge_topk: self.topk,
            biflow_autoignore: self.biflow_autoignore,
            filter,
            max_rows: self.max_rows,
        })
    }
}

impl InputConfig {
    /// Expands the patterns into a sorted, de-duplicated list of files.
    ///
    /// A pattern matching nothing is logged and skipped.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for pattern in &self.patterns {
            let entries =
                glob::glob(pattern).with_context(|| format!("invalid input pattern {pattern}"))?;

            let before = files.len();
            for entry in entries {
                match entry {
                    Ok(path) if path.is_file() => files.push(path),
                    Ok(_) => {}
                    Err(e) => warn!(pattern = %pattern, error = %e, "cannot read input path"),
                }
            }
            if files.len() == before {
                warn!(pattern = %pattern, "input pattern matched no files");
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}
