//! Async pipeline node wrapping a [`PythonStage`]
//!
//! Embedded calls block on the stage mutex and the interpreter lock, so each
//! one runs on tokio's blocking pool and never on a runtime worker.

use std::sync::Arc;

use async_trait::async_trait;

use pyflow_core::context::Marker;
use pyflow_core::{Error, Result, StageExecutor, StageInfo, TypedValue};

use crate::invoke::SourcePoll;
use crate::stage::PythonStage;

pub struct PythonStageNode {
    stage: Arc<PythonStage>,
    description: Option<String>,
}

impl PythonStageNode {
    pub fn new(stage: PythonStage) -> Self {
        PythonStageNode {
            stage: Arc::new(stage),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn stage(&self) -> &Arc<PythonStage> {
        &self.stage
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PythonStage) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let stage = Arc::clone(&self.stage);
        tokio::task::spawn_blocking(move || f(&stage))
            .await
            .map_err(|e| Error::Other(format!("stage '{}' task failed: {}", self.stage.name(), e)))?
    }

    /// Next value of a source stage; `None` once it is exhausted
    pub async fn next_value(&self) -> Result<Option<TypedValue>> {
        loop {
            match self.blocking(|stage| stage.poll_source()).await? {
                SourcePoll::Value(value) => return Ok(Some(value)),
                SourcePoll::Suppressed => continue,
                SourcePoll::Exhausted => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl StageExecutor for PythonStageNode {
    async fn initialize(&mut self) -> Result<()> {
        tracing::debug!(stage = %self.stage.name(), kind = %self.stage.kind(), "Initializing Python stage node");
        Ok(())
    }

    async fn process(&mut self, input: TypedValue) -> Result<Vec<TypedValue>> {
        self.blocking(move |stage| stage.process(&input)).await
    }

    async fn on_marker(&mut self, marker: Marker) -> Result<()> {
        match marker {
            Marker::Window => self.blocking(|stage| stage.punctuation()).await,
            Marker::Final => Ok(()),
        }
    }

    async fn cleanup(&mut self) -> Result<()> {
        self.blocking(|stage| stage.shutdown()).await
    }

    fn info(&self) -> StageInfo {
        StageInfo {
            name: self.stage.name().to_string(),
            kind: self.stage.kind(),
            description: self.description.clone(),
        }
    }
}
