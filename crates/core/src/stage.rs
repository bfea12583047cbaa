//! Stage kinds and the async executor interface used by host pipelines

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::Marker;
use crate::error::Result;
use crate::value::TypedValue;

/// Processing intent of a stage, which fixes how its callable's result is read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Result discarded
    Sink,
    /// Result read as a boolean
    Filter,
    /// Null result drops the record, anything else is the output value
    Transform,
    /// Result is an integer used for partitioning
    Hash,
    /// Like transform, with shared blob pass-through
    Map,
    /// Result is an iterable of output values
    FlatMap,
    /// No input; the callable returns an iterable that is drained one value per poll
    Source,
}

impl StageKind {
    /// Kinds whose outputs are typed values of the declared output type
    pub fn produces_values(self) -> bool {
        matches!(
            self,
            StageKind::Transform | StageKind::Map | StageKind::FlatMap | StageKind::Source
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Sink => "sink",
            StageKind::Filter => "filter",
            StageKind::Transform => "transform",
            StageKind::Hash => "hash",
            StageKind::Map => "map",
            StageKind::FlatMap => "flat_map",
            StageKind::Source => "source",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive information about a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInfo {
    pub name: String,
    pub kind: StageKind,
    pub description: Option<String>,
}

/// Stage lifecycle as driven by a host pipeline
///
/// All executable stages implement this trait to take part in the
/// pipeline lifecycle.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Called once before any record
    async fn initialize(&mut self) -> Result<()>;

    /// Process one record. Returns zero or more output values; a filter
    /// returns the record itself when it passes, a hash stage returns the
    /// hash as `int64`.
    async fn process(&mut self, input: TypedValue) -> Result<Vec<TypedValue>>;

    /// A marker arrived on the input
    async fn on_marker(&mut self, marker: Marker) -> Result<()>;

    /// Called once after the last record
    async fn cleanup(&mut self) -> Result<()>;

    fn info(&self) -> StageInfo;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_roundtrip_through_serde() {
        for kind in [
            StageKind::Sink,
            StageKind::Filter,
            StageKind::Transform,
            StageKind::Hash,
            StageKind::Map,
            StageKind::FlatMap,
            StageKind::Source,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
            assert_eq!(serde_json::from_str::<StageKind>(&json).unwrap(), kind);
        }
        assert!(!StageKind::Hash.produces_values());
        assert!(StageKind::FlatMap.produces_values());
    }
}
