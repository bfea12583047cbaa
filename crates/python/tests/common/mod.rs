//! Shared helpers for the embedded-stage integration tests

#![allow(dead_code)]

use std::ffi::CString;
use std::sync::atomic::{AtomicUsize, Ordering};

use pyflow_python::with_lock;
use pyo3::prelude::*;
use pyo3::types::PyModule;

static MODULES: AtomicUsize = AtomicUsize::new(0);

/// Start the runtime once per test binary
pub fn start() {
    pyflow_python::ensure_started().expect("embedded runtime should start");
}

/// Register `code` as a fresh module and return its unique name
pub fn define_module(prefix: &str, code: &str) -> String {
    start();
    let name = format!("{}_{}", prefix, MODULES.fetch_add(1, Ordering::SeqCst));
    let source = CString::new(code).unwrap();
    let file = CString::new(format!("{}.py", name)).unwrap();
    let module = CString::new(name.clone()).unwrap();
    with_lock(|py| {
        PyModule::from_code(py, &source, &file, &module)
            .unwrap_or_else(|e| panic!("module {} failed to load: {}", name, e));
    });
    name
}

/// Look up `module.attr`, calling it with no arguments when `construct` is set
pub fn object(module: &str, attr: &str, construct: bool) -> Py<PyAny> {
    with_lock(|py| {
        let value = py.import(module).unwrap().getattr(attr).unwrap();
        if construct {
            value.call0().unwrap().unbind()
        } else {
            value.unbind()
        }
    })
}

/// Evaluate a Python expression against `module`'s globals
pub fn eval_in<T>(module: &str, expr: &str) -> T
where
    T: for<'py> FromPyObject<'py>,
{
    let code = CString::new(expr).unwrap();
    with_lock(|py| {
        let globals = py.import(module).unwrap().dict();
        py.eval(&code, Some(&globals), None).unwrap().extract().unwrap()
    })
}

/// Reference count of `module.attr`
pub fn refcount(module: &str, attr: &str) -> isize {
    with_lock(|py| {
        let value = py.import(module).unwrap().getattr(attr).unwrap();
        // the temporary `value` holds one extra reference
        value.get_refcnt() - 1
    })
}
