//! Configuration for a PyFlow stage
//!
//! Configuration is loaded from a TOML file, then selected fields can be
//! overridden from environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stage::StageKind;
use crate::value::ValueType;

/// Complete configuration of one stage and the runtime it runs in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Embedded runtime preparation
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Diagnostics
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Job identity seen by embedded code
    #[serde(default)]
    pub job: JobConfig,

    /// The stage and its callable
    pub stage: StageConfig,

    /// Checkpointing
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Named key/value sets readable through `app_config(name)`
    #[serde(default)]
    pub app_config: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Bootstrap script executed once per process before any stage runs
    #[serde(default)]
    pub setup_script: Option<PathBuf>,

    /// Toolkit root; `opt/python/modules` and `opt/python/packages` below it
    /// are appended to the module search path
    #[serde(default)]
    pub toolkit_dir: Option<PathBuf>,

    /// Extra module search path entries
    #[serde(default)]
    pub python_path: Vec<PathBuf>,

    /// Module providing `dumps`/`loads` for checkpoints and pickled callables
    #[serde(default = "default_serializer")]
    pub serializer: String,
}

fn default_serializer() -> String {
    "dill".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            setup_script: None,
            toolkit_dir: None,
            python_path: Vec::new(),
            serializer: default_serializer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset; also the threshold
    /// applied to application log records
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub job_id: u64,

    #[serde(default)]
    pub pe_id: u64,

    #[serde(default = "default_job_name")]
    pub job_name: String,

    #[serde(default = "default_channel")]
    pub channel: i32,

    #[serde(default = "default_channel")]
    pub local_channel: i32,

    #[serde(default)]
    pub max_channels: i32,

    #[serde(default)]
    pub local_max_channels: i32,
}

fn default_job_name() -> String {
    "default".to_string()
}

fn default_channel() -> i32 {
    -1
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_id: 0,
            pe_id: 0,
            job_name: default_job_name(),
            channel: default_channel(),
            local_channel: default_channel(),
            max_channels: 0,
            local_max_channels: 0,
        }
    }
}

/// How values cross the boundary in addition to plain marshaling
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStyle {
    /// Marshaled typed value
    #[default]
    Object,
    /// Blob holding a serialized object
    Pickle,
    /// String holding JSON
    Json,
    /// `str()` of the object
    String,
}

impl WireStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            WireStyle::Object => "object",
            WireStyle::Pickle => "pickle",
            WireStyle::Json => "json",
            WireStyle::String => "string",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,

    pub kind: StageKind,

    /// Module holding the callable
    #[serde(default)]
    pub module: Option<String>,

    /// Attribute name of the callable within `module`
    #[serde(default)]
    pub function: Option<String>,

    /// Base64 of a serialized callable, used instead of `module`/`function`
    #[serde(default)]
    pub pickled_callable: Option<String>,

    /// Type of incoming records
    #[serde(default)]
    pub input_type: Option<ValueType>,

    /// Type produced by transform, map, flat_map and source stages
    #[serde(default)]
    pub output_type: Option<ValueType>,

    #[serde(default)]
    pub input_style: WireStyle,

    #[serde(default)]
    pub output_style: WireStyle,

    /// Overrides the stateful guess (instances are stateful, functions are not)
    #[serde(default)]
    pub stateful: Option<bool>,

    /// Pass blobs to the callable as memory views instead of copies
    #[serde(default)]
    pub zero_copy_blobs: bool,

    /// Types of the ports embedded code may submit to
    #[serde(default)]
    pub output_ports: Vec<ValueType>,
}

impl StageConfig {
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        StageConfig {
            name: name.into(),
            kind,
            module: None,
            function: None,
            pickled_callable: None,
            input_type: None,
            output_type: None,
            input_style: WireStyle::Object,
            output_style: WireStyle::Object,
            stateful: None,
            zero_copy_blobs: false,
            output_ports: Vec::new(),
        }
    }

    pub fn with_function(mut self, module: impl Into<String>, function: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self.function = Some(function.into());
        self
    }

    pub fn with_output_type(mut self, ty: ValueType) -> Self {
        self.output_type = Some(ty);
        self
    }

    pub fn with_input_type(mut self, ty: ValueType) -> Self {
        self.input_type = Some(ty);
        self
    }

    /// Full check for a stage that loads its own callable
    pub fn validate(&self) -> Result<()> {
        match (&self.module, &self.function, &self.pickled_callable) {
            (Some(_), Some(_), None) | (None, None, Some(_)) => {}
            (_, _, Some(_)) => {
                return Err(Error::ConfigError(format!(
                    "stage '{}': pickled_callable excludes module/function",
                    self.name
                )))
            }
            _ => {
                return Err(Error::ConfigError(format!(
                    "stage '{}': set both module and function, or pickled_callable",
                    self.name
                )))
            }
        }
        self.validate_outputs()
    }

    /// Name and output checks, for stages handed a callable directly
    pub fn validate_outputs(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::ConfigError("stage name is empty".to_string()));
        }
        if self.kind.produces_values() && self.output_type.is_none() {
            return Err(Error::ConfigError(format!(
                "stage '{}': {} stages need output_type",
                self.name, self.kind
            )));
        }
        if self.output_style != WireStyle::Object {
            let expected = match self.output_style {
                WireStyle::Pickle => ValueType::Blob,
                _ => ValueType::String,
            };
            if let Some(ty) = &self.output_type {
                if *ty != expected {
                    return Err(Error::ConfigError(format!(
                        "stage '{}': output_style {} produces {}, not {}",
                        self.name,
                        self.output_style.as_str(),
                        expected,
                        ty
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Where the stage runner keeps checkpoint files
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl BridgeConfig {
    /// Defaults for everything except the stage
    pub fn for_stage(stage: StageConfig) -> Self {
        BridgeConfig {
            runtime: RuntimeConfig::default(),
            logging: LoggingConfig::default(),
            job: JobConfig::default(),
            stage,
            checkpoint: CheckpointConfig::default(),
            app_config: BTreeMap::new(),
        }
    }

    /// Load from a TOML file and apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.stage.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// `PYFLOW_SETUP_SCRIPT`, `PYFLOW_LOG_LEVEL`, `PYFLOW_CHECKPOINT_DIR`
    pub fn apply_env(&mut self) {
        if let Ok(script) = std::env::var("PYFLOW_SETUP_SCRIPT") {
            self.runtime.setup_script = Some(PathBuf::from(script));
        }
        if let Ok(level) = std::env::var("PYFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(dir) = std::env::var("PYFLOW_CHECKPOINT_DIR") {
            self.checkpoint.directory = Some(PathBuf::from(dir));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [runtime]
        setup_script = "/opt/app/setup.py"
        python_path = ["/opt/app/lib"]

        [job]
        job_id = 42
        job_name = "wordcount"
        channel = 1
        max_channels = 4

        [stage]
        name = "double"
        kind = "transform"
        module = "app.stages"
        function = "double"
        input_type = "int64"
        output_type = "int64"
        output_ports = ["rstring"]

        [checkpoint]
        enabled = true

        [app_config.db]
        host = "localhost"
        port = "5432"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = BridgeConfig::from_toml(FULL).unwrap();
        assert_eq!(config.runtime.serializer, "dill");
        assert_eq!(config.job.job_id, 42);
        assert_eq!(config.job.local_channel, -1);
        assert_eq!(config.stage.kind, StageKind::Transform);
        assert_eq!(config.stage.output_type, Some(ValueType::Int64));
        assert_eq!(config.stage.output_ports, vec![ValueType::String]);
        assert!(config.checkpoint.enabled);
        assert_eq!(config.app_config["db"]["port"], "5432");
        assert_eq!(config.logging.level, "info");
        config.stage.validate().unwrap();
    }

    #[test]
    fn test_validate_callable_source() {
        let stage = StageConfig::new("s", StageKind::Sink);
        assert!(stage.validate().is_err());

        let stage = StageConfig::new("s", StageKind::Sink).with_function("m", "f");
        stage.validate().unwrap();

        let mut stage = StageConfig::new("s", StageKind::Sink).with_function("m", "f");
        stage.pickled_callable = Some("gASV".to_string());
        assert!(stage.validate().is_err());
    }

    #[test]
    fn test_validate_output_requirements() {
        let stage = StageConfig::new("t", StageKind::Transform).with_function("m", "f");
        assert!(stage.validate().is_err());

        let mut stage = StageConfig::new("t", StageKind::Map)
            .with_function("m", "f")
            .with_output_type(ValueType::Int32);
        stage.output_style = WireStyle::Json;
        assert!(stage.validate().is_err());
        stage.output_type = Some(ValueType::String);
        stage.validate().unwrap();
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let text = "[stage]\nname = \"x\"\nkind = \"sink\"\ninput_type = \"list<int>\"\n";
        assert!(matches!(BridgeConfig::from_toml(text), Err(Error::ConfigError(_))));
    }
}
