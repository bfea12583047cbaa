//! Invoking stage callables for every call kind

mod common;

use pyflow_core::config::{BridgeConfig, StageConfig};
use pyflow_core::context::LocalContext;
use pyflow_core::{Error, StageKind, TypedValue, ValueType};
use pyflow_python::{with_lock, PythonStage, SourcePoll, StageBuilder};

use common::{define_module, eval_in, object, refcount};
use pyo3::types::PyAnyMethods;

const FUNCTIONS: &str = r#"
import base64
import pickle

SEEN = []
CONTROL = ["".join(["hel", "lo"])]
PAYLOAD = b"shared payload"
OBJ = object()

def double(x):
    return x * 2

def isPositive(x):
    return x > 0

def record(x):
    SEEN.append(x)

def explode(x):
    raise ValueError("bad record %r" % (x,))

def maybe(x):
    return None if x < 0 else x + 1

def length(x):
    return len(x)

def words(x):
    return [None if w == "skip" else w for w in x.split()]

def numbers():
    return range(3)

def identity(x):
    return x

def payload(x):
    return PAYLOAD

def pickled(fn):
    return base64.b64encode(pickle.dumps(fn)).decode()
"#;

fn stage(module: &str, function: &str, kind: StageKind, output: Option<ValueType>) -> PythonStage {
    let mut config = StageConfig::new(function, kind);
    config.output_type = output;
    StageBuilder::new(config)
        .build(object(module, function, false))
        .unwrap()
}

#[test]
fn test_transform_doubles() {
    let m = define_module("call_kinds", FUNCTIONS);
    let double = stage(&m, "double", StageKind::Transform, Some(ValueType::Int64));
    assert_eq!(double.transform(&TypedValue::Int64(21)).unwrap(), Some(TypedValue::Int64(42)));
    assert_eq!(
        double.process(&TypedValue::Int64(-4)).unwrap(),
        vec![TypedValue::Int64(-8)]
    );
}

#[test]
fn test_none_result_drops_record() {
    let m = define_module("call_kinds", FUNCTIONS);
    let maybe = stage(&m, "maybe", StageKind::Map, Some(ValueType::Int32));
    assert_eq!(maybe.map(&TypedValue::Int32(-1)).unwrap(), None);
    assert_eq!(maybe.map(&TypedValue::Int32(1)).unwrap(), Some(TypedValue::Int32(2)));
    assert!(maybe.process(&TypedValue::Int32(-5)).unwrap().is_empty());
}

#[test]
fn test_filter_reads_truthiness() {
    let m = define_module("call_kinds", FUNCTIONS);
    let positive = stage(&m, "isPositive", StageKind::Filter, None);
    assert!(!positive.filter(&TypedValue::Int32(-3)).unwrap());
    assert!(positive.filter(&TypedValue::Int32(3)).unwrap());
    assert_eq!(
        positive.process(&TypedValue::Int32(7)).unwrap(),
        vec![TypedValue::Int32(7)]
    );
    assert!(positive.process(&TypedValue::Int32(0)).unwrap().is_empty());
}

#[test]
fn test_sink_keeps_no_extra_references() {
    let m = define_module("call_kinds", FUNCTIONS);
    let record = stage(&m, "record", StageKind::Sink, None);
    record.sink(&TypedValue::String("hello".into())).unwrap();

    assert_eq!(eval_in::<Vec<String>>(&m, "SEEN"), vec!["hello".to_string()]);
    let seen: isize = eval_in(&m, "__import__('sys').getrefcount(SEEN[0])");
    let control: isize = eval_in(&m, "__import__('sys').getrefcount(CONTROL[0])");
    assert_eq!(seen, control);
}

#[test]
fn test_raising_callable_is_application_error() {
    let m = define_module("call_kinds", FUNCTIONS);
    let explode = stage(&m, "explode", StageKind::Transform, Some(ValueType::Int32));
    match explode.transform(&TypedValue::Int32(1)).unwrap_err() {
        Error::Application { location, kind, message } => {
            assert_eq!(location, "explode:transform");
            assert_eq!(kind, "ValueError");
            assert!(message.contains("bad record 1"), "message: {}", message);
        }
        other => panic!("expected application error, got {:?}", other),
    }
    // the stage stays usable after an application error
    assert!(explode.transform(&TypedValue::Int32(2)).unwrap_err().is_application());
}

#[test]
fn test_wrong_result_type_is_conversion_error() {
    let m = define_module("call_kinds", FUNCTIONS);
    let double = stage(&m, "double", StageKind::Transform, Some(ValueType::String));
    let err = double.transform(&TypedValue::Int64(2)).unwrap_err();
    assert!(err.is_conversion(), "got {:?}", err);

    let narrow = stage(&m, "double", StageKind::Transform, Some(ValueType::UInt8));
    let err = narrow.transform(&TypedValue::UInt8(200)).unwrap_err();
    assert!(err.is_conversion(), "got {:?}", err);
}

#[test]
fn test_hash_returns_integer() {
    let m = define_module("call_kinds", FUNCTIONS);
    let length = stage(&m, "length", StageKind::Hash, None);
    assert_eq!(length.hash(&TypedValue::String("hello".into())).unwrap(), Some(5));
    assert_eq!(
        length.process(&TypedValue::String("abc".into())).unwrap(),
        vec![TypedValue::Int64(3)]
    );

    let not_int = stage(&m, "identity", StageKind::Hash, None);
    assert!(not_int.hash(&TypedValue::String("x".into())).unwrap_err().is_conversion());
}

#[test]
fn test_flat_map_skips_none() {
    let m = define_module("call_kinds", FUNCTIONS);
    let words = stage(&m, "words", StageKind::FlatMap, Some(ValueType::String));
    let out = words.flat_map(&TypedValue::String("a skip b c".into())).unwrap();
    assert_eq!(
        out,
        vec![
            TypedValue::String("a".into()),
            TypedValue::String("b".into()),
            TypedValue::String("c".into()),
        ]
    );
    assert!(words.flat_map(&TypedValue::String(String::new())).unwrap().is_empty());
}

#[test]
fn test_source_drains_iterable() {
    let m = define_module("call_kinds", FUNCTIONS);
    let numbers = stage(&m, "numbers", StageKind::Source, Some(ValueType::Int64));
    let mut polled = Vec::new();
    loop {
        match numbers.poll_source().unwrap() {
            SourcePoll::Value(value) => polled.push(value),
            SourcePoll::Suppressed => continue,
            SourcePoll::Exhausted => break,
        }
    }
    assert_eq!(polled, vec![TypedValue::Int64(0), TypedValue::Int64(1), TypedValue::Int64(2)]);
    assert_eq!(numbers.poll_source().unwrap(), SourcePoll::Exhausted);
    assert!(matches!(numbers.process(&TypedValue::Int64(0)), Err(Error::Context(_))));
}

#[test]
fn test_object_passthrough_balances_references() {
    let m = define_module("call_kinds", FUNCTIONS);
    let identity = stage(&m, "identity", StageKind::Transform, Some(ValueType::Int64));
    let baseline = refcount(&m, "OBJ");

    let out = identity.transform_object(object(&m, "OBJ", false)).unwrap().unwrap();
    with_lock(|py| {
        let obj = py.import(m.as_str()).unwrap().getattr("OBJ").unwrap();
        assert_eq!(out.bind(py).as_ptr(), obj.as_ptr());
        drop(out);
    });
    assert_eq!(refcount(&m, "OBJ"), baseline);
}

#[test]
fn test_shared_blobs_hold_one_reference_each() {
    let m = define_module("call_kinds", FUNCTIONS);
    let payload = stage(&m, "payload", StageKind::Map, Some(ValueType::Blob));
    let baseline = refcount(&m, "PAYLOAD");

    let blobs = payload.map_shared(&TypedValue::Int32(0), 3).unwrap().unwrap();
    assert_eq!(blobs.len(), 3);
    for blob in &blobs {
        assert_eq!(&blob.as_bytes().unwrap()[..], b"shared payload");
    }
    assert_eq!(refcount(&m, "PAYLOAD"), baseline + 3);

    with_lock(|_py| drop(blobs));
    assert_eq!(refcount(&m, "PAYLOAD"), baseline);
}

#[test]
fn test_shared_map_copies_non_blob_outputs() {
    let m = define_module("call_kinds", FUNCTIONS);
    let double = stage(&m, "double", StageKind::Map, Some(ValueType::Int32));
    assert_eq!(
        double.map_shared(&TypedValue::Int32(5), 2).unwrap(),
        Some(vec![TypedValue::Int32(10), TypedValue::Int32(10)])
    );
}

#[test]
fn test_named_and_pickled_callables_from_config() {
    let m = define_module("call_kinds", FUNCTIONS);

    let named = StageConfig::new("named", StageKind::Transform)
        .with_function(m.as_str(), "double")
        .with_output_type(ValueType::Int32);
    let mut config = BridgeConfig::for_stage(named);
    config.runtime.serializer = "pickle".to_string();
    let context = std::sync::Arc::new(LocalContext::new("named"));
    let stage = PythonStage::from_config(&config, context).unwrap();
    assert_eq!(stage.transform(&TypedValue::Int32(4)).unwrap(), Some(TypedValue::Int32(8)));

    let encoded: String = eval_in(&m, "pickled(double)");
    let mut pickled = StageConfig::new("pickled", StageKind::Transform).with_output_type(ValueType::Int32);
    pickled.pickled_callable = Some(encoded);
    let mut config = BridgeConfig::for_stage(pickled);
    config.runtime.serializer = "pickle".to_string();
    let context = std::sync::Arc::new(LocalContext::new("pickled"));
    let stage = PythonStage::from_config(&config, context).unwrap();
    assert_eq!(stage.transform(&TypedValue::Int32(6)).unwrap(), Some(TypedValue::Int32(12)));
}

#[test]
fn test_unknown_function_is_setup_error() {
    let m = define_module("call_kinds", FUNCTIONS);
    let config = BridgeConfig::for_stage(
        StageConfig::new("missing", StageKind::Sink).with_function(m.as_str(), "no_such_function"),
    );
    let err = PythonStage::from_config(&config, std::sync::Arc::new(LocalContext::new("missing"))).unwrap_err();
    assert!(matches!(err, Error::Setup(_)), "got {:?}", err);
}

#[test]
fn test_calls_after_shutdown_find_stage_closed() {
    let m = define_module("call_kinds", FUNCTIONS);
    let double = stage(&m, "double", StageKind::Transform, Some(ValueType::Int64));
    double.shutdown().unwrap();
    double.shutdown().unwrap();
    assert!(matches!(
        double.transform(&TypedValue::Int64(1)),
        Err(Error::StageClosed(name)) if name == "double"
    ));
}
