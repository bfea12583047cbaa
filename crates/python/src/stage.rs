//! A pipeline stage backed by an embedded callable
//!
//! [`PythonStage`] owns one [`StageCallable`] behind a per-stage mutex.
//! Every operation takes that mutex first and the interpreter lock second,
//! so record processing, checkpointing and reset never interleave for one
//! stage, and the lock order is the same everywhere.
//!
//! ```no_run
//! use pyflow_core::config::StageConfig;
//! use pyflow_core::{StageKind, TypedValue, ValueType};
//! use pyflow_python::{with_lock, StageBuilder};
//! use pyo3::prelude::*;
//!
//! # fn main() -> pyflow_core::Result<()> {
//! pyflow_python::ensure_started()?;
//! let double = with_lock(|py| -> PyResult<Py<PyAny>> {
//!     Ok(py.eval(pyo3::ffi::c_str!("lambda x: x * 2"), None, None)?.unbind())
//! })
//! .map_err(|e| pyflow_core::Error::Setup(e.to_string()))?;
//!
//! let config = StageConfig::new("double", StageKind::Transform).with_output_type(ValueType::Int64);
//! let stage = StageBuilder::new(config).build(double)?;
//! assert_eq!(stage.transform(&TypedValue::Int64(21))?, Some(TypedValue::Int64(42)));
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use pyo3::prelude::*;

use pyflow_core::checkpoint::{CheckpointSink, CheckpointSource};
use pyflow_core::config::{BridgeConfig, RuntimeConfig, StageConfig, WireStyle};
use pyflow_core::context::{ExecutionContext, LocalContext};
use pyflow_core::metrics::{CustomMetric, MetricKind, EXCEPTIONS_SUPPRESSED};
use pyflow_core::{Error, Result, StageKind, TypedValue, ValueType};

use crate::callable::{build_target, load_pickled, StageCallable};
use crate::checkpoint::{checkpoint_failure, CheckpointState, Checkpointer, Serializer};
use crate::context;
use crate::exception::{flush_diagnostics, ExceptionInfo};
use crate::invoke::{CallSite, SourcePoll};
use crate::lock::{self, with_lock};
use crate::marshal::CallScope;
use crate::runtime::{self, EmbeddedRuntime};

/// Where a stage's callable comes from
enum CallableSource {
    /// Already constructed by the host
    Object(Py<PyAny>),
    /// `module.function`
    Named { module: String, function: String },
    /// Base64 of a serialized callable
    Pickled(String),
}

impl CallableSource {
    fn load<'py>(
        self,
        py: Python<'py>,
        runtime: &EmbeddedRuntime,
        serializer: &Serializer,
    ) -> Result<Bound<'py, PyAny>> {
        match self {
            CallableSource::Object(object) => Ok(object.into_bound(py)),
            CallableSource::Named { module, function } => runtime.resolve(py, &module, &function),
            CallableSource::Pickled(encoded) => load_pickled(py, &encoded, serializer.bind(py)),
        }
    }
}

/// Builds a [`PythonStage`] around a callable
pub struct StageBuilder {
    config: StageConfig,
    serializer: String,
    checkpointing: bool,
    context: Option<Arc<dyn ExecutionContext>>,
}

impl StageBuilder {
    pub fn new(config: StageConfig) -> Self {
        StageBuilder {
            config,
            serializer: RuntimeConfig::default().serializer,
            checkpointing: false,
            context: None,
        }
    }

    /// Module used for checkpoints and pickled callables
    pub fn serializer(mut self, module: impl Into<String>) -> Self {
        self.serializer = module.into();
        self
    }

    pub fn checkpointing(mut self, enabled: bool) -> Self {
        self.checkpointing = enabled;
        self
    }

    /// Context seen through `pyflow_ec`; defaults to a [`LocalContext`]
    /// with the configured output ports
    pub fn context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Build around a callable the host already holds
    pub fn build(self, callable: Py<PyAny>) -> Result<PythonStage> {
        self.build_from(CallableSource::Object(callable))
    }

    fn build_from(self, source: CallableSource) -> Result<PythonStage> {
        let StageBuilder {
            config,
            serializer,
            checkpointing,
            context,
        } = self;
        config.validate_outputs()?;
        let runtime = runtime::ensure_started()?;

        let context: Arc<dyn ExecutionContext> = match context {
            Some(context) => context,
            None => Arc::new(LocalContext::new(config.name.clone()).with_output_ports(config.output_ports.clone())),
        };
        let suppressed = context.metrics().create(
            EXCEPTIONS_SUPPRESSED,
            "Exceptions suppressed by the callable's __exit__",
            MetricKind::Counter,
            0,
        )?;

        let state = {
            let _active = context::enter(Arc::clone(&context));
            with_lock(|py| -> Result<StageState> {
                let serializer = Serializer::load(py, &serializer)?;
                let user = source.load(py, runtime, &serializer)?;
                let target = build_target(user, &config, serializer.name())?;
                let mut callable = StageCallable::adopt(target, config.stateful)?;
                callable.enter(py).map_err(|e| {
                    let what = format!("stage '{}' __enter__", config.name);
                    ExceptionInfo::from_err(py, e, "__enter__").into_setup_error(py, &what)
                })?;

                let mut checkpointer = Checkpointer::new(serializer, checkpointing);
                checkpointer.verify(py, &mut callable, &suppressed, &config.name)?;
                Ok(StageState {
                    callable: Some(callable),
                    checkpointer,
                })
            })?
        };

        tracing::info!(
            stage = %config.name,
            kind = %config.kind,
            checkpoint = %state.checkpointer.state(),
            serializer = state.checkpointer.serializer().name(),
            "Python stage ready"
        );

        Ok(PythonStage {
            zero_copy: config.zero_copy_blobs || config.input_style == WireStyle::Pickle,
            name: config.name,
            kind: config.kind,
            output_type: config.output_type,
            context,
            suppressed,
            state: Mutex::new(state),
        })
    }
}

struct StageState {
    /// `None` once the stage is shut down
    callable: Option<StageCallable>,
    checkpointer: Checkpointer,
}

/// One stage's embedded callable and everything needed to call it
pub struct PythonStage {
    name: String,
    kind: StageKind,
    output_type: Option<ValueType>,

    /// Blobs cross as views rather than copies
    zero_copy: bool,

    context: Arc<dyn ExecutionContext>,

    /// `nExceptionsSuppressed`
    suppressed: Arc<CustomMetric>,

    state: Mutex<StageState>,
}

impl std::fmt::Debug for PythonStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PythonStage")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("output_type", &self.output_type)
            .finish_non_exhaustive()
    }
}

impl PythonStage {
    /// Prepare the runtime from `config` and load the configured callable
    pub fn from_config(config: &BridgeConfig, context: Arc<dyn ExecutionContext>) -> Result<Self> {
        let stage = &config.stage;
        stage.validate()?;
        let runtime = runtime::ensure_started()?;
        runtime.configure(&config.runtime)?;

        let source = match (&stage.module, &stage.function, &stage.pickled_callable) {
            (Some(module), Some(function), None) => CallableSource::Named {
                module: module.clone(),
                function: function.clone(),
            },
            (None, None, Some(encoded)) => CallableSource::Pickled(encoded.clone()),
            _ => return Err(Error::ConfigError(format!("stage '{}' has no callable", stage.name))),
        };

        StageBuilder::new(stage.clone())
            .serializer(config.runtime.serializer.clone())
            .checkpointing(config.checkpoint.enabled)
            .context(context)
            .build_from(source)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    pub fn context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.state.lock().checkpointer.state()
    }

    /// Exceptions swallowed by `__exit__` so far
    pub fn suppressed_count(&self) -> i64 {
        self.suppressed.value()
    }

    fn output_type(&self) -> Result<&ValueType> {
        self.output_type.as_ref().ok_or_else(|| {
            Error::ConfigError(format!("{} stage '{}' has no output_type", self.kind, self.name))
        })
    }

    /// Run `f` against the callable: stage mutex, then context, then lock
    fn call<R>(&self, call_kind: &str, f: impl for<'a, 'py> FnOnce(&CallSite<'a, 'py>) -> Result<R>) -> Result<R> {
        let state = self.state.lock();
        let callable = state
            .callable
            .as_ref()
            .ok_or_else(|| Error::StageClosed(self.name.clone()))?;
        let location = format!("{}:{}", self.name, call_kind);
        let _active = context::enter(Arc::clone(&self.context));

        with_lock(|py| {
            let scope = CallScope::new(py, self.zero_copy);
            let site = CallSite {
                scope: &scope,
                callable,
                suppressed: &self.suppressed,
                location: &location,
            };
            let result = f(&site);
            scope.release_views();
            if result.is_err() {
                flush_diagnostics(py);
            }
            result
        })
    }

    pub fn sink(&self, value: &TypedValue) -> Result<()> {
        self.call("sink", |site| site.sink(value))
    }

    pub fn filter(&self, value: &TypedValue) -> Result<bool> {
        self.call("filter", |site| site.filter(value))
    }

    /// `None` drops the record
    pub fn transform(&self, value: &TypedValue) -> Result<Option<TypedValue>> {
        let output = self.output_type()?;
        self.call("transform", |site| site.transform(value, output))
    }

    pub fn map(&self, value: &TypedValue) -> Result<Option<TypedValue>> {
        let output = self.output_type()?;
        self.call("map", |site| site.map(value, output))
    }

    /// Map for `occurrences` consumers of the same output.
    ///
    /// With a blob output type, the blobs share the memory of the `bytes`
    /// object the callable returned.
    pub fn map_shared(&self, value: &TypedValue, occurrences: usize) -> Result<Option<Vec<TypedValue>>> {
        let output = self.output_type()?;
        if *output == ValueType::Blob {
            return self.call("map", |site| site.map_shared(value, occurrences));
        }
        Ok(self.map(value)?.map(|mapped| vec![mapped; occurrences]))
    }

    /// Pass an embedded object through the callable without marshaling
    pub fn transform_object(&self, object: Py<PyAny>) -> Result<Option<Py<PyAny>>> {
        self.call("transform", |site| {
            let object = object.into_bound(site.scope.py());
            Ok(site.transform_object(object)?.map(Bound::unbind))
        })
    }

    /// `None` when the failure was suppressed
    pub fn hash(&self, value: &TypedValue) -> Result<Option<i64>> {
        self.call("hash", |site| site.hash(value))
    }

    pub fn flat_map(&self, value: &TypedValue) -> Result<Vec<TypedValue>> {
        let output = self.output_type()?;
        self.call("flat_map", |site| site.flat_map(value, output))
    }

    /// Next value of a source stage
    pub fn poll_source(&self) -> Result<SourcePoll> {
        let output = self.output_type()?;
        self.call("source", |site| site.poll_source(output))
    }

    /// A window marker arrived
    pub fn punctuation(&self) -> Result<()> {
        self.call("punctuation", |site| site.punctuation())
    }

    /// Process one record according to the stage kind.
    ///
    /// A passing filter returns the record itself; a hash stage returns its
    /// hash as `int64`.
    pub fn process(&self, input: &TypedValue) -> Result<Vec<TypedValue>> {
        match self.kind {
            StageKind::Sink => self.sink(input).map(|_| Vec::new()),
            StageKind::Filter => Ok(if self.filter(input)? {
                vec![input.clone()]
            } else {
                Vec::new()
            }),
            StageKind::Transform => Ok(self.transform(input)?.into_iter().collect()),
            StageKind::Map => Ok(self.map(input)?.into_iter().collect()),
            StageKind::Hash => Ok(self.hash(input)?.map(TypedValue::Int64).into_iter().collect()),
            StageKind::FlatMap => self.flat_map(input),
            StageKind::Source => Err(Error::Context(format!(
                "source stage '{}' takes no input",
                self.name
            ))),
        }
    }

    /// Write the current callable to `sink`; `false` unless checkpointing
    /// is verified for this stage
    pub fn checkpoint(&self, sink: &mut dyn CheckpointSink) -> Result<bool> {
        let state = self.state.lock();
        let callable = state
            .callable
            .as_ref()
            .ok_or_else(|| Error::StageClosed(self.name.clone()))?;
        let snapshot = with_lock(|py| state.checkpointer.snapshot(py, callable))?;
        match snapshot {
            Some(bytes) => {
                sink.write_bytes(&bytes).map_err(checkpoint_failure)?;
                tracing::debug!(stage = %self.name, bytes = bytes.len(), "Checkpoint written");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the callable with one read from `source`.
    ///
    /// Any failure is fatal: the stage is shut down and the error returned.
    pub fn reset(&self, source: &mut dyn CheckpointSource) -> Result<bool> {
        let mut state = self.state.lock();
        if state.checkpointer.state() != CheckpointState::Verified {
            return Ok(false);
        }
        let bytes = match source.read_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.abandon(&mut state);
                return Err(checkpoint_failure(err));
            }
        };
        self.install(&mut state, &bytes).map(|_| true)
    }

    /// Replace the callable with the snapshot taken at setup
    pub fn reset_to_initial_state(&self) -> Result<bool> {
        let mut state = self.state.lock();
        if state.checkpointer.state() != CheckpointState::Verified {
            return Ok(false);
        }
        let bytes = match state.checkpointer.initial() {
            Some(bytes) => bytes.to_vec(),
            None => return Ok(false),
        };
        self.install(&mut state, &bytes).map(|_| true)
    }

    fn install(&self, state: &mut StageState, bytes: &[u8]) -> Result<()> {
        let _active = context::enter(Arc::clone(&self.context));
        let outcome = with_lock(|py| -> Result<()> {
            let restored = state.checkpointer.restore(py, bytes)?;
            let mut fresh = StageCallable::adopt(restored, Some(true)).map_err(checkpoint_failure)?;

            if let Some(mut previous) = state.callable.take() {
                previous.exit(py).map_err(|e| {
                    ExceptionInfo::from_err(py, e, "__exit__").into_checkpoint_error(py, "exit of replaced callable")
                })?;
            }
            fresh.enter(py).map_err(|e| {
                ExceptionInfo::from_err(py, e, "__enter__").into_checkpoint_error(py, "enter of restored callable")
            })?;
            state.callable = Some(fresh);
            Ok(())
        });

        match outcome {
            Ok(()) => {
                tracing::info!(stage = %self.name, bytes = bytes.len(), "Stage reset from checkpoint");
                Ok(())
            }
            Err(err) => {
                tracing::error!(stage = %self.name, error = %err, "Reset failed; stage is no longer usable");
                self.abandon(state);
                Err(err)
            }
        }
    }

    /// Tear down whatever callable is left after a failed reset
    fn abandon(&self, state: &mut StageState) {
        if let Some(mut callable) = state.callable.take() {
            with_lock(|py| {
                if let Err(e) = callable.exit(py) {
                    ExceptionInfo::from_err(py, e, "__exit__").report(py);
                }
                drop(callable);
                flush_diagnostics(py);
            });
        }
    }

    /// Flush output, run `__exit__` once and release the callable.
    ///
    /// Calling this again, or any call kind afterwards, finds the stage closed.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(mut callable) = state.callable.take() else {
            return Ok(());
        };
        let _active = context::enter(Arc::clone(&self.context));
        let result = with_lock(|py| {
            flush_diagnostics(py);
            let exited = callable
                .exit(py)
                .map_err(|e| ExceptionInfo::from_err(py, e, "__exit__").into_host_error(py));
            drop(callable);
            flush_diagnostics(py);
            exited
        });
        tracing::info!(
            stage = %self.name,
            suppressed = self.suppressed.value(),
            "Python stage shut down"
        );
        result
    }
}

impl Drop for PythonStage {
    fn drop(&mut self) {
        if self.state.get_mut().callable.is_none() {
            return;
        }
        if lock::is_held() {
            // the lock cannot be taken again on this thread
            let Some(mut callable) = self.state.get_mut().callable.take() else {
                return;
            };
            let name = self.name.clone();
            let owner = Arc::clone(&self.context);
            tracing::warn!(stage = %name, "Stage dropped under the interpreter lock; __exit__ deferred");
            lock::defer(move |py| {
                let _active = context::enter(owner);
                if let Err(e) = callable.exit(py) {
                    ExceptionInfo::from_err(py, e, "__exit__").report(py);
                }
                drop(callable);
                flush_diagnostics(py);
                tracing::debug!(stage = %name, "Deferred stage teardown finished");
            });
            return;
        }
        if let Err(err) = self.shutdown() {
            tracing::warn!(stage = %self.name, error = %err, "Error during stage shutdown");
        }
    }
}
