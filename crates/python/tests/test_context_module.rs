//! The `pyflow_ec` module as seen by embedded code

mod common;

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::Arc;

use pyflow_core::config::{JobConfig, StageConfig};
use pyflow_core::context::{Emitted, ExecutionContext, LocalContext, Marker};
use pyflow_core::logging::Severity;
use pyflow_core::{Error, StageKind, TypedValue, ValueType};
use pyflow_python::{with_lock, PythonStage, StageBuilder};
use pyo3::exceptions::PyRuntimeError;

use common::{define_module, object};

const USES_CONTEXT: &str = r#"
import pyflow_ec as ec

def describe(x):
    return "%s/%s/%d/%d/%d/%d" % (
        ec.job_name(), ec.stage_name(), ec.job_id(), ec.pe_id(), ec.channel(), ec.max_channels())

def count(x):
    ec.create_custom_metric("seen", "records seen")
    ec.create_custom_metric("last", kind="gauge")
    ec.metric_set("last", x)
    return ec.metric_inc("seen")

def config_value(key):
    entries = ec.app_config("db")
    return None if entries is None else entries.get(key)

def levels(x):
    ec.log("info", "visible message", ["io", "db"])
    ec.trace(10, "below threshold")
    return [ec.is_enabled("error"), ec.is_enabled("info"), ec.is_enabled("debug"), ec.is_enabled(10)]

def fan_out(x):
    ec.submit(0, x * 2)
    ec.submit(1, str(x))
    ec.submit_marker(0)
    ec.submit_marker(1, "final")

def bad_port(x):
    ec.submit(9, x)

def bad_metric_kind(x):
    ec.create_custom_metric("weird", kind="histogram")

def overflow_metric(x):
    ec.create_custom_metric("huge", initial=2 ** 63 - 2)
    return ec.metric_inc("huge", x)
"#;

fn with_context(module: &str, function: &str, output: Option<ValueType>, context: Arc<LocalContext>) -> PythonStage {
    let kind = if output.is_some() { StageKind::Transform } else { StageKind::Sink };
    let mut config = StageConfig::new(function, kind);
    config.output_type = output;
    StageBuilder::new(config)
        .context(context)
        .build(object(module, function, false))
        .unwrap()
}

#[test]
fn test_identity_of_the_running_stage() {
    let m = define_module("context", USES_CONTEXT);
    let job = JobConfig {
        job_id: 7,
        pe_id: 3,
        job_name: "nightly".into(),
        channel: 2,
        local_channel: 0,
        max_channels: 4,
        local_max_channels: 1,
    };
    let context = Arc::new(LocalContext::new("describer").with_job(job));
    let stage = with_context(&m, "describe", Some(ValueType::String), context);
    assert_eq!(
        stage.transform(&TypedValue::Int32(0)).unwrap(),
        Some(TypedValue::String("nightly/describer/7/3/2/4".into()))
    );
}

#[test]
fn test_metrics_created_by_embedded_code_are_visible_to_the_host() {
    let m = define_module("context", USES_CONTEXT);
    let context = Arc::new(LocalContext::new("counter"));
    let stage = with_context(&m, "count", Some(ValueType::Int64), context.clone());
    stage.transform(&TypedValue::Int64(10)).unwrap();
    assert_eq!(
        stage.transform(&TypedValue::Int64(20)).unwrap(),
        Some(TypedValue::Int64(2))
    );

    let snapshot = context.metrics().snapshot();
    assert_eq!(snapshot.get("seen"), Some(&2));
    assert_eq!(snapshot.get("last"), Some(&20));
    assert_eq!(snapshot.get("nExceptionsSuppressed"), Some(&0));
}

#[test]
fn test_app_config_is_readable() {
    let m = define_module("context", USES_CONTEXT);
    let entries = BTreeMap::from([("host".to_string(), "db.local".to_string())]);
    let context = Arc::new(LocalContext::new("configured").with_app_config("db", entries));
    let stage = with_context(&m, "config_value", Some(ValueType::optional(ValueType::String)), context);
    assert_eq!(
        stage.transform(&TypedValue::String("host".into())).unwrap(),
        Some(TypedValue::some(TypedValue::String("db.local".into())))
    );
    assert_eq!(
        stage.transform(&TypedValue::String("port".into())).unwrap(),
        None
    );
}

#[test]
fn test_log_threshold_applies() {
    let m = define_module("context", USES_CONTEXT);
    let context = Arc::new(LocalContext::new("levels").with_threshold(Severity::Info));
    let stage = with_context(&m, "levels", Some(ValueType::list(ValueType::Boolean)), context);
    assert_eq!(
        stage.transform(&TypedValue::Int32(0)).unwrap(),
        Some(TypedValue::List(vec![
            TypedValue::Boolean(true),
            TypedValue::Boolean(true),
            TypedValue::Boolean(false),
            TypedValue::Boolean(false),
        ]))
    );
}

#[test]
fn test_submit_reaches_output_ports() {
    let m = define_module("context", USES_CONTEXT);
    let context = Arc::new(
        LocalContext::new("fan_out").with_output_ports(vec![ValueType::Int64, ValueType::String]),
    );
    let stage = with_context(&m, "fan_out", None, context.clone());
    stage.sink(&TypedValue::Int64(21)).unwrap();

    assert_eq!(
        context.take_emitted(),
        vec![
            (0, Emitted::Value(TypedValue::Int64(42))),
            (1, Emitted::Value(TypedValue::String("21".into()))),
            (0, Emitted::Marker(Marker::Window)),
            (1, Emitted::Marker(Marker::Final)),
        ]
    );
}

#[test]
fn test_misuse_raises_in_embedded_code() {
    let m = define_module("context", USES_CONTEXT);
    let context = Arc::new(LocalContext::new("misuse").with_output_ports(vec![ValueType::Int64]));

    let bad_port = with_context(&m, "bad_port", None, context.clone());
    match bad_port.sink(&TypedValue::Int64(1)).unwrap_err() {
        Error::Application { kind, message, .. } => {
            assert_eq!(kind, "ValueError");
            assert!(message.contains("9"), "message: {}", message);
        }
        other => panic!("expected application error, got {:?}", other),
    }

    let bad_kind = with_context(&m, "bad_metric_kind", None, context);
    match bad_kind.sink(&TypedValue::Int64(1)).unwrap_err() {
        Error::Application { kind, .. } => assert_eq!(kind, "ValueError"),
        other => panic!("expected application error, got {:?}", other),
    }
}

#[test]
fn test_metric_overflow_raises_instead_of_wrapping() {
    let m = define_module("context", USES_CONTEXT);
    let context = Arc::new(LocalContext::new("overflow"));
    let stage = with_context(&m, "overflow_metric", Some(ValueType::Int64), context.clone());
    assert_eq!(
        stage.transform(&TypedValue::Int64(1)).unwrap(),
        Some(TypedValue::Int64(i64::MAX))
    );
    match stage.transform(&TypedValue::Int64(1)).unwrap_err() {
        Error::Application { kind, message, .. } => {
            assert_eq!(kind, "ValueError");
            assert!(message.contains("huge"), "message: {}", message);
        }
        other => panic!("expected application error, got {:?}", other),
    }
    assert_eq!(context.metrics().snapshot().get("huge"), Some(&i64::MAX));
}

#[test]
fn test_unavailable_outside_a_stage() {
    common::start();
    with_lock(|py| {
        let code = CString::new("__import__('pyflow_ec').job_id()").unwrap();
        let err = py.eval(&code, None, None).unwrap_err();
        assert!(err.is_instance_of::<PyRuntimeError>(py));
    });
}
