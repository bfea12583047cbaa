//! Execution context of a stage as seen from embedded code
//!
//! [`ExecutionContext`] is implemented by the host pipeline. [`LocalContext`]
//! is a self-contained implementation used by the stage runner and tests: it
//! keeps identifiers from configuration and collects submitted output.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::logging::Severity;
use crate::metrics::MetricRegistry;
use crate::value::{TypedValue, ValueType};

/// Stream marker submitted in place of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// End of a window
    Window,
    /// No more records will follow
    Final,
}

/// What a stage emitted to one of its output ports
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    Value(TypedValue),
    Marker(Marker),
}

/// Host facts and services exposed to a running stage
pub trait ExecutionContext: Send + Sync {
    fn job_id(&self) -> u64;
    fn pe_id(&self) -> u64;
    fn job_name(&self) -> &str;
    fn stage_name(&self) -> &str;

    /// Index of this stage within its parallel region, -1 outside one
    fn channel(&self) -> i32;
    fn local_channel(&self) -> i32;
    fn max_channels(&self) -> i32;
    fn local_max_channels(&self) -> i32;

    fn metrics(&self) -> &MetricRegistry;

    /// Named key/value configuration set
    fn app_config(&self, name: &str) -> Option<BTreeMap<String, String>>;

    /// Records below this severity are discarded
    fn log_threshold(&self) -> Severity;

    /// Declared type of an output port
    fn output_type(&self, port: usize) -> Option<ValueType>;

    fn submit(&self, port: usize, value: TypedValue) -> Result<()>;

    fn submit_marker(&self, port: usize, marker: Marker) -> Result<()>;
}

/// In-process context backed by configuration
#[derive(Debug)]
pub struct LocalContext {
    job: JobConfig,
    stage_name: String,
    threshold: Severity,
    app_config: BTreeMap<String, BTreeMap<String, String>>,
    output_ports: Vec<ValueType>,
    metrics: MetricRegistry,
    emitted: Mutex<Vec<(usize, Emitted)>>,
}

impl LocalContext {
    pub fn new(stage_name: impl Into<String>) -> Self {
        LocalContext {
            job: JobConfig::default(),
            stage_name: stage_name.into(),
            threshold: Severity::Info,
            app_config: BTreeMap::new(),
            output_ports: Vec::new(),
            metrics: MetricRegistry::new(),
            emitted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.job = job;
        self
    }

    pub fn with_threshold(mut self, threshold: Severity) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_output_ports(mut self, ports: Vec<ValueType>) -> Self {
        self.output_ports = ports;
        self
    }

    pub fn with_app_config(mut self, name: impl Into<String>, entries: BTreeMap<String, String>) -> Self {
        self.app_config.insert(name.into(), entries);
        self
    }

    /// Everything submitted so far, in submission order
    pub fn take_emitted(&self) -> Vec<(usize, Emitted)> {
        std::mem::take(&mut *self.emitted.lock())
    }

    fn check_port(&self, port: usize) -> Result<()> {
        if port >= self.output_ports.len() {
            return Err(Error::Context(format!(
                "stage '{}' has {} output port(s), no port {}",
                self.stage_name,
                self.output_ports.len(),
                port
            )));
        }
        Ok(())
    }
}

impl ExecutionContext for LocalContext {
    fn job_id(&self) -> u64 {
        self.job.job_id
    }

    fn pe_id(&self) -> u64 {
        self.job.pe_id
    }

    fn job_name(&self) -> &str {
        &self.job.job_name
    }

    fn stage_name(&self) -> &str {
        &self.stage_name
    }

    fn channel(&self) -> i32 {
        self.job.channel
    }

    fn local_channel(&self) -> i32 {
        self.job.local_channel
    }

    fn max_channels(&self) -> i32 {
        self.job.max_channels
    }

    fn local_max_channels(&self) -> i32 {
        self.job.local_max_channels
    }

    fn metrics(&self) -> &MetricRegistry {
        &self.metrics
    }

    fn app_config(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.app_config.get(name).cloned()
    }

    fn log_threshold(&self) -> Severity {
        self.threshold
    }

    fn output_type(&self, port: usize) -> Option<ValueType> {
        self.output_ports.get(port).cloned()
    }

    fn submit(&self, port: usize, value: TypedValue) -> Result<()> {
        self.check_port(port)?;
        if !value.conforms_to(&self.output_ports[port]) {
            return Err(Error::Context(format!(
                "{} value does not conform to port {} type {}",
                value.type_name(),
                port,
                self.output_ports[port]
            )));
        }
        self.emitted.lock().push((port, Emitted::Value(value)));
        Ok(())
    }

    fn submit_marker(&self, port: usize, marker: Marker) -> Result<()> {
        self.check_port(port)?;
        self.emitted.lock().push((port, Emitted::Marker(marker)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_checks_port_and_type() {
        let ctx = LocalContext::new("src").with_output_ports(vec![ValueType::Int32]);
        ctx.submit(0, TypedValue::Int32(1)).unwrap();
        ctx.submit_marker(0, Marker::Window).unwrap();
        assert!(ctx.submit(1, TypedValue::Int32(1)).is_err());
        assert!(ctx.submit(0, TypedValue::from("x")).is_err());

        let emitted = ctx.take_emitted();
        assert_eq!(
            emitted,
            vec![
                (0, Emitted::Value(TypedValue::Int32(1))),
                (0, Emitted::Marker(Marker::Window)),
            ]
        );
        assert!(ctx.take_emitted().is_empty());
    }

    #[test]
    fn test_defaults_outside_parallel_region() {
        let ctx = LocalContext::new("s");
        assert_eq!(ctx.channel(), -1);
        assert_eq!(ctx.max_channels(), 0);
        assert_eq!(ctx.job_name(), "default");
        assert!(ctx.app_config("missing").is_none());
    }
}
