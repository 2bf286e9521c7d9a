//! Runtime configuration for eventforge.
//!
//! Configuration is loaded from a YAML or JSON file and mirrors the shape of
//! the on-disk config: a `global` block, a list of raw sample definitions,
//! and auxiliary template / rater / generator definitions. Raw sample
//! definitions are turned into validated [`crate::sample::Sample`] records by
//! the pipeline at startup; validation failures disable the offending sample
//! without halting the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::rater::RaterSpec;
use crate::sample::{CustomGenerator, Event};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading '{0}': {1}")]
    Io(PathBuf, std::io::Error),

    #[error("parse error in '{0}': {1}")]
    Parse(PathBuf, String),

    #[error("unsupported config extension '{0}'")]
    UnsupportedExtension(String),

    #[error("no samples configured")]
    NoSamples,
}

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "eventforge", about = "Synthetic event generator for load testing and demos")]
pub struct Cli {
    /// Path to configuration file (YAML or JSON).
    #[arg(short, long, default_value = "config.yml")]
    pub config: PathBuf,

    /// Additional directory to scan for sample files.
    #[arg(short, long)]
    pub samples_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub samples: Vec<SampleConfig>,
    pub templates: Vec<TemplateConfig>,
    pub raters: Vec<RaterConfig>,
    pub generators: Vec<GeneratorConfig>,
}

/// Global pipeline knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Render timestamps in UTC instead of local time.
    pub utc: bool,

    /// Number of generator workers.
    pub generator_workers: usize,

    /// Number of output workers.
    pub output_workers: usize,

    /// Bound of the generator work queue.
    pub generator_queue_length: usize,

    /// Bound of the output work queue.
    pub output_queue_length: usize,

    /// Seconds between throughput read-outs.
    pub rot_interval: u64,

    /// Generation-cache reuse span: each freshly generated batch is replayed
    /// for this many following intervals. Zero disables caching.
    pub cache_intervals: u32,

    /// Force injection of a `_time` field even for templates that do not
    /// require one.
    pub add_time: bool,

    /// Default output binding, copied into every sample.
    pub output: OutputConfig,

    /// Directories scanned for additional sample files.
    pub samples_dir: Vec<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            utc: false,
            generator_workers: 1,
            output_workers: 1,
            generator_queue_length: 50,
            output_queue_length: 10,
            rot_interval: 60,
            cache_intervals: 0,
            add_time: false,
            output: OutputConfig::default(),
            samples_dir: Vec::new(),
        }
    }
}

/// Output binding: which sink, which wire format, and sink tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputConfig {
    /// Sink name: stdout, devnull, buf, file, http, network, kafka, kinesis,
    /// splunktcp, splunktcpuf.
    pub outputter: String,

    /// Wire format: raw, json, splunkhec, splunktcp, rfc3164, rfc5424,
    /// elasticsearch, or the name of a user template.
    pub output_template: String,

    /// Base path for the file sink.
    pub file_name: PathBuf,

    /// Rotation threshold for the file sink.
    pub max_bytes: u64,

    /// Number of rotated files kept by the file sink.
    pub backup_files: u32,

    /// Flush threshold for buffering sinks (http, splunktcp).
    pub buffer_bytes: usize,

    /// Candidate endpoints; buffering sinks pick one at random.
    pub endpoints: Vec<String>,

    /// Extra HTTP headers.
    pub headers: HashMap<String, String>,

    /// Network sink protocol: tcp or udp.
    pub protocol: String,

    /// Dial/request timeout in seconds.
    pub timeout: u64,

    /// Kafka topic / Kinesis stream name.
    pub topic: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            outputter: "stdout".to_string(),
            output_template: "raw".to_string(),
            file_name: PathBuf::from("eventforge.out"),
            max_bytes: 10 * 1024 * 1024,
            backup_files: 5,
            buffer_bytes: 4096,
            endpoints: Vec::new(),
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )]),
            protocol: "tcp".to_string(),
            timeout: 10,
            topic: "eventforge".to_string(),
        }
    }
}

/// A raw, unvalidated sample definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SampleConfig {
    pub name: String,
    pub description: String,
    pub disabled: bool,

    /// `sample`, `replay`, or the name of a custom generator.
    pub generator: String,
    pub rater: String,

    /// Seconds between scheduler ticks.
    pub interval: u64,
    pub count: i64,
    pub end_intervals: u64,

    pub earliest: String,
    pub latest: String,
    pub begin: String,
    pub end: String,

    pub randomize_count: f64,
    pub randomize_events: bool,

    /// Default field tokens substitute into when they name none.
    pub field: String,

    pub tokens: Vec<TokenConfig>,
    pub lines: Vec<Event>,
}

/// A raw token definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub token_type: String,

    /// `template` or `regex`.
    pub format: String,

    /// Literal marker for template format, pattern for regex format.
    pub token: String,

    pub field: String,
    pub group: i32,

    /// Random replacement kind, timestamp format, or static value,
    /// depending on `type`.
    pub replacement: String,

    pub lower: i64,
    pub upper: i64,
    pub precision: usize,
    pub length: usize,

    pub choice: Vec<String>,
    pub weighted_choice: Vec<WeightedChoiceConfig>,
    pub field_choice: Vec<Event>,
    pub src_field: String,

    /// Name of a loaded sample to use as the token's lookup table.
    pub sample: String,

    /// Rater name for `rated` tokens.
    pub rater: String,

    pub script: String,
    pub init: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightedChoiceConfig {
    pub weight: u32,
    pub choice: String,
}

/// A user output template: header/row/footer expansion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    pub header: String,
    pub row: String,
    pub footer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RaterConfig {
    pub name: String,

    #[serde(rename = "type")]
    pub rater_type: String,

    pub script: String,
    pub options: RaterOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RaterOptions {
    pub hour_of_day: HashMap<u32, f64>,
    pub minute_of_hour: HashMap<u32, f64>,
    pub day_of_week: HashMap<u32, f64>,
    pub kbps: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneratorConfig {
    pub name: String,
    pub script: String,

    /// Script loaded from a file when `script` is empty.
    pub file_name: String,

    pub single_threaded: bool,
    pub options: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a YAML or JSON file, then scan any configured
    /// sample directories.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let mut config = Self::parse(&data, path)?;

        let config_dir = path.parent().map(Path::to_path_buf);
        for dir in config.global.samples_dir.clone() {
            let dir = match (&config_dir, dir.is_relative()) {
                (Some(base), true) => base.join(&dir),
                _ => dir,
            };
            config.read_samples_dir(&dir);
        }
        config.read_generator_files(config_dir.as_deref());
        Ok(config)
    }

    /// Parse a config document; the path selects YAML or JSON and is used in
    /// diagnostics only.
    pub fn parse(data: &str, path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("yml")
            .to_ascii_lowercase();
        match ext.as_str() {
            "yml" | "yaml" => serde_yaml::from_str(data)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string())),
            "json" => serde_json::from_str(data)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string())),
            other => Err(ConfigError::UnsupportedExtension(other.to_string())),
        }
    }

    /// Parse a YAML config from a string. Test and embedding convenience.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(data)
            .map_err(|e| ConfigError::Parse(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Scan a directory for sample files: full definitions (`.yml`/`.yaml`/
    /// `.json`), flat line files (`.sample`), and CSV tables (`.csv`). Flat
    /// and CSV samples load disabled; they exist to back token lookup tables.
    pub fn read_samples_dir(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot read samples directory");
                return;
            }
        };
        let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        paths.sort();

        for path in paths {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            let result = match ext.as_str() {
                "yml" | "yaml" | "json" => self.read_full_sample(&path),
                "sample" => self.read_flat_sample(&path),
                "csv" => self.read_csv_sample(&path),
                _ => continue,
            };
            if let Err(e) = result {
                error!(file = %path.display(), error = %e, "skipping sample file");
            }
        }
    }

    fn read_full_sample(&mut self, path: &Path) -> Result<(), ConfigError> {
        debug!(file = %path.display(), "loading sample definition");
        let data =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("yml");
        let sample: SampleConfig = if ext.eq_ignore_ascii_case("json") {
            serde_json::from_str(&data)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?
        } else {
            serde_yaml::from_str(&data)
                .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?
        };
        self.samples.push(sample);
        Ok(())
    }

    fn read_flat_sample(&mut self, path: &Path) -> Result<(), ConfigError> {
        debug!(file = %path.display(), "loading flat sample");
        let data =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let lines = data
            .lines()
            .map(|l| HashMap::from([("_raw".to_string(), l.to_string())]))
            .collect();
        self.samples.push(SampleConfig {
            name: file_name_of(path),
            disabled: true,
            lines,
            ..Default::default()
        });
        Ok(())
    }

    fn read_csv_sample(&mut self, path: &Path) -> Result<(), ConfigError> {
        debug!(file = %path.display(), "loading CSV sample");
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        let headers = reader
            .headers()
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?
            .clone();
        let mut lines = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
            let mut row = HashMap::with_capacity(headers.len());
            for (field, value) in headers.iter().zip(record.iter()) {
                row.insert(field.to_string(), value.to_string());
            }
            lines.push(row);
        }
        self.samples.push(SampleConfig {
            name: file_name_of(path),
            disabled: true,
            lines,
            ..Default::default()
        });
        Ok(())
    }

    /// Resolve generators whose script lives in a separate file.
    fn read_generator_files(&mut self, config_dir: Option<&Path>) {
        for gen in &mut self.generators {
            if gen.script.is_empty() && !gen.file_name.is_empty() {
                let mut path = PathBuf::from(&gen.file_name);
                if path.is_relative() {
                    if let Some(base) = config_dir {
                        let candidate = base.join(&path);
                        if candidate.exists() {
                            path = candidate;
                        }
                    }
                }
                match std::fs::read_to_string(&path) {
                    Ok(script) => gen.script = script,
                    Err(e) => {
                        error!(
                            generator = %gen.name,
                            file = %path.display(),
                            error = %e,
                            "cannot read generator script"
                        );
                    }
                }
            }
        }
    }

    /// The rater registry, including the built-in `default`.
    pub fn rater_registry(&self) -> HashMap<String, RaterSpec> {
        let mut registry = HashMap::new();
        registry.insert("default".to_string(), RaterSpec::Default);
        for r in &self.raters {
            let spec = match r.rater_type.as_str() {
                "config" => RaterSpec::Config {
                    hour_of_day: r.options.hour_of_day.clone(),
                    minute_of_hour: r.options.minute_of_hour.clone(),
                    day_of_week: r.options.day_of_week.clone(),
                },
                "kbps" => RaterSpec::Kbps {
                    kbps: r.options.kbps,
                },
                "script" => RaterSpec::Script {
                    script: r.script.clone(),
                },
                _ => RaterSpec::Default,
            };
            registry.insert(r.name.clone(), spec);
        }
        registry
    }

    /// The custom-generator registry.
    pub fn generator_registry(&self) -> HashMap<String, CustomGenerator> {
        self.generators
            .iter()
            .map(|g| {
                (
                    g.name.clone(),
                    CustomGenerator {
                        name: g.name.clone(),
                        script: g.script.clone(),
                        single_threaded: g.single_threaded,
                        options: g.options.clone(),
                    },
                )
            })
            .collect()
    }

    /// Raw lines of every loaded sample, keyed by name. Backs token lookup
    /// tables, which may reference disabled flat/CSV samples.
    pub fn sample_tables(&self) -> HashMap<String, Vec<Event>> {
        self.samples
            .iter()
            .map(|s| (s.name.clone(), s.lines.clone()))
            .collect()
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.global.generator_workers, 1);
        assert_eq!(cfg.global.generator_queue_length, 50);
        assert_eq!(cfg.global.output.outputter, "stdout");
        assert_eq!(cfg.global.output.output_template, "raw");
    }

    #[test]
    fn test_parse_yaml() {
        let cfg = Config::from_yaml(
            r#"
global:
  generatorWorkers: 4
  output:
    outputter: devnull
samples:
  - name: basic
    interval: 1
    count: 5
    lines:
      - _raw: hello
"#,
        )
        .unwrap();
        assert_eq!(cfg.global.generator_workers, 4);
        assert_eq!(cfg.global.output.outputter, "devnull");
        // Unset globals keep their defaults.
        assert_eq!(cfg.global.output_workers, 1);
        assert_eq!(cfg.samples.len(), 1);
        assert_eq!(cfg.samples[0].count, 5);
        assert_eq!(cfg.samples[0].lines[0]["_raw"], "hello");
    }

    #[test]
    fn test_rater_registry_always_has_default() {
        let cfg = Config::default();
        let registry = cfg.rater_registry();
        assert!(matches!(registry.get("default"), Some(RaterSpec::Default)));
    }

    #[test]
    fn test_flat_sample_loading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("users.sample"), "alice\nbob\n").unwrap();
        let mut cfg = Config::default();
        cfg.read_samples_dir(dir.path());
        assert_eq!(cfg.samples.len(), 1);
        assert!(cfg.samples[0].disabled);
        assert_eq!(cfg.samples[0].name, "users.sample");
        assert_eq!(cfg.samples[0].lines[1]["_raw"], "bob");
    }

    #[test]
    fn test_csv_sample_loading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("markets.csv"),
            "city,zip\nBOSTON,2123\nHARTFORD,6101\n",
        )
        .unwrap();
        let mut cfg = Config::default();
        cfg.read_samples_dir(dir.path());
        assert_eq!(cfg.samples.len(), 1);
        assert_eq!(cfg.samples[0].lines[0]["city"], "BOSTON");
        assert_eq!(cfg.samples[0].lines[1]["zip"], "6101");
    }
}
