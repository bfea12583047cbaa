//! Checkpointing stage callables and resetting from checkpoints

mod common;

use pyflow_core::checkpoint::{CheckpointSink, FileCheckpointStore, MemoryCheckpoint};
use pyflow_core::config::StageConfig;
use pyflow_core::{Error, StageKind, TypedValue, ValueType};
use pyflow_python::{CheckpointState, PythonStage, StageBuilder};

use common::{define_module, eval_in, object};

const STATEFUL: &str = r#"
import threading

EVENTS = []

class Counter:
    def __init__(self):
        self.n = 0
    def __call__(self, x):
        self.n += 1
        return self.n

class Tracked(Counter):
    def __enter__(self):
        EVENTS.append("enter")
    def __exit__(self, kind, value, tb):
        EVENTS.append("exit %d" % self.n)

class Locked:
    def __init__(self):
        self.lock = threading.Lock()
    def __call__(self, x):
        return x

class ForgivingLocked(Locked):
    def __exit__(self, kind, value, tb):
        return True

class Mutable(Counter):
    def __call__(self, x):
        if x == 99:
            self.handle = threading.Lock()
        return super().__call__(x)

def stateless(x):
    return x
"#;

fn counting(module: &str, class: &str, name: &str) -> PythonStage {
    StageBuilder::new(StageConfig::new(name, StageKind::Transform).with_output_type(ValueType::Int64))
        .serializer("pickle")
        .checkpointing(true)
        .build(object(module, class, true))
        .unwrap()
}

fn next(stage: &PythonStage) -> i64 {
    match stage.transform(&TypedValue::Int64(0)).unwrap() {
        Some(TypedValue::Int64(n)) => n,
        other => panic!("unexpected output {:?}", other),
    }
}

#[test]
fn test_restored_stage_continues_from_checkpoint() {
    let m = define_module("checkpoint", STATEFUL);
    let first = counting(&m, "Counter", "counter");
    assert_eq!(first.checkpoint_state(), CheckpointState::Verified);
    for _ in 0..5 {
        next(&first);
    }

    let mut store = MemoryCheckpoint::new();
    assert!(first.checkpoint(&mut store).unwrap());
    assert_eq!(store.len(), 1);

    let second = counting(&m, "Counter", "counter");
    assert_eq!(next(&second), 1);
    assert!(second.reset(&mut store).unwrap());
    assert_eq!(next(&second), 6);
    // the original is unaffected
    assert_eq!(next(&first), 6);
}

#[test]
fn test_reset_to_initial_state() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = counting(&m, "Counter", "initial");
    for _ in 0..3 {
        next(&stage);
    }
    assert!(stage.reset_to_initial_state().unwrap());
    assert_eq!(next(&stage), 1);
}

#[test]
fn test_functions_are_not_checkpointed() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = StageBuilder::new(StageConfig::new("fn", StageKind::Transform).with_output_type(ValueType::Int64))
        .serializer("pickle")
        .checkpointing(true)
        .build(object(&m, "stateless", false))
        .unwrap();
    assert_eq!(stage.checkpoint_state(), CheckpointState::Unchecked);

    let mut store = MemoryCheckpoint::new();
    assert!(!stage.checkpoint(&mut store).unwrap());
    assert!(store.is_empty());
    assert!(!stage.reset(&mut store).unwrap());
    assert!(!stage.reset_to_initial_state().unwrap());
}

#[test]
fn test_checkpointing_off_leaves_instances_unchecked() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = StageBuilder::new(StageConfig::new("off", StageKind::Transform).with_output_type(ValueType::Int64))
        .serializer("pickle")
        .build(object(&m, "Locked", true))
        .unwrap();
    assert_eq!(stage.checkpoint_state(), CheckpointState::Unchecked);
}

#[test]
fn test_unserializable_callable_with_suppression_disables_checkpointing() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = StageBuilder::new(StageConfig::new("locked", StageKind::Sink))
        .serializer("pickle")
        .checkpointing(true)
        .build(object(&m, "ForgivingLocked", true))
        .unwrap();
    assert_eq!(stage.checkpoint_state(), CheckpointState::Disabled);
    assert_eq!(stage.suppressed_count(), 1);

    let mut store = MemoryCheckpoint::new();
    assert!(!stage.checkpoint(&mut store).unwrap());
    stage.sink(&TypedValue::Int32(1)).unwrap();
}

#[test]
fn test_unserializable_callable_without_hook_fails_setup() {
    let m = define_module("checkpoint", STATEFUL);
    let err = StageBuilder::new(StageConfig::new("locked", StageKind::Sink))
        .serializer("pickle")
        .checkpointing(true)
        .build(object(&m, "Locked", true))
        .unwrap_err();
    match err {
        Error::Setup(message) => assert!(message.contains("locked"), "message: {}", message),
        other => panic!("expected setup error, got {:?}", other),
    }
}

#[test]
fn test_corrupted_checkpoint_is_fatal() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = counting(&m, "Counter", "corrupt");
    let mut store = MemoryCheckpoint::new();
    store.write_bytes(b"definitely not a pickle").unwrap();

    let err = stage.reset(&mut store).unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)), "got {:?}", err);
    assert!(err.is_fatal());
    assert!(matches!(
        stage.transform(&TypedValue::Int64(0)),
        Err(Error::StageClosed(_))
    ));
}

#[test]
fn test_missing_checkpoint_is_fatal() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = counting(&m, "Counter", "missing");
    let mut empty = MemoryCheckpoint::new();
    assert!(matches!(stage.reset(&mut empty), Err(Error::Checkpoint(_))));
    assert!(matches!(stage.checkpoint(&mut empty), Err(Error::StageClosed(_))));
}

#[test]
fn test_state_that_becomes_unserializable_fails_checkpoint() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = counting(&m, "Mutable", "mutable");
    next(&stage);
    stage.transform(&TypedValue::Int64(99)).unwrap();

    let mut store = MemoryCheckpoint::new();
    let err = stage.checkpoint(&mut store).unwrap_err();
    assert!(matches!(err, Error::Checkpoint(_)), "got {:?}", err);
    assert!(store.is_empty());
}

#[test]
fn test_reset_exits_replaced_callable_and_enters_restored_one() {
    let m = define_module("checkpoint", STATEFUL);
    let stage = counting(&m, "Tracked", "tracked");
    assert_eq!(eval_in::<Vec<String>>(&m, "EVENTS"), vec!["enter"]);

    next(&stage);
    next(&stage);
    let mut store = MemoryCheckpoint::new();
    assert!(stage.checkpoint(&mut store).unwrap());
    next(&stage);

    assert!(stage.reset(&mut store).unwrap());
    assert_eq!(eval_in::<Vec<String>>(&m, "EVENTS"), vec!["enter", "exit 3", "enter"]);
    assert_eq!(next(&stage), 3);

    stage.shutdown().unwrap();
    assert_eq!(
        eval_in::<Vec<String>>(&m, "EVENTS"),
        vec!["enter", "exit 3", "enter", "exit 3"]
    );
}

#[test]
fn test_file_store_roundtrip() {
    let m = define_module("checkpoint", STATEFUL);
    let dir = tempfile::tempdir().unwrap();
    let store = FileCheckpointStore::open(dir.path()).unwrap();

    let stage = counting(&m, "Counter", "filed");
    next(&stage);
    next(&stage);
    let mut sink = store.sink("filed", 1);
    assert!(stage.checkpoint(&mut sink).unwrap());
    assert_eq!(store.latest("filed").unwrap(), Some(1));

    let restored = counting(&m, "Counter", "filed");
    let mut source = store.source("filed", 1);
    assert!(restored.reset(&mut source).unwrap());
    assert_eq!(next(&restored), 3);

    let mut wrong = store.source("filed", 2);
    assert!(matches!(restored.reset(&mut wrong), Err(Error::Checkpoint(_))));
}
