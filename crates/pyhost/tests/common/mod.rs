//! Shared interpreter session for integration tests.
//!
//! The interpreter can only be started once per process, so every test in a binary shares one
//! session. It is configured from the `PYHOST_*` environment variables, falling back to probing
//! `python3` on `PATH`, with [`MARKER_VAR`] added to its environment.
//!
//! When no embeddable interpreter is found the tests return early after printing a banner, unless
//! `PYHOST_REQUIRE_PYTHON` is set, in which case they fail.

use std::{env, path::Path, sync::OnceLock};

use pyhost::{Globals, InitConfig, Outputs, PyObject, Python, Value};

/// Variable every test session sets in the interpreter's environment.
pub const MARKER_VAR: &str = "PYHOST_TEST_MARKER";
const REQUIRE_ENV: &str = "PYHOST_REQUIRE_PYTHON";

pub fn python() -> Option<&'static Python> {
    static SESSION: OnceLock<Option<Python>> = OnceLock::new();
    SESSION
        .get_or_init(|| match start() {
            Ok(python) => Some(python),
            Err(reason) => {
                assert!(env::var_os(REQUIRE_ENV).is_none(), "{REQUIRE_ENV} is set but {reason}");
                eprintln!();
                eprintln!("==================================================================");
                eprintln!("  pyhost integration tests SKIPPED: {reason}");
                eprintln!("  set {REQUIRE_ENV}=1 to make this a failure");
                eprintln!("==================================================================");
                None
            }
        })
        .as_ref()
}

fn start() -> Result<Python, String> {
    let config = InitConfig::from_env()
        .or_else(|_| InitConfig::probe(Path::new("python3")))
        .map_err(|err| format!("no embeddable Python found ({err})"))?;
    Python::init(config.env_var(MARKER_VAR, "set")).map_err(|err| format!("Python failed to start ({err})"))
}

/// Evaluates `source` with no globals and discarded output, returning the decoded result.
pub fn eval_value(python: &Python, source: &str) -> Value {
    let output = python.eval(source, &Globals::new(), &Outputs::discard()).unwrap();
    match output.result {
        Some(result) => python.decode(&result).unwrap(),
        None => Value::None,
    }
}

/// Builds globals from name/object pairs.
pub fn globals<const N: usize>(pairs: [(&str, &PyObject); N]) -> Globals {
    pairs.into_iter().map(|(name, object)| (name.to_owned(), object.clone())).collect()
}

/// Returns the shared session, or returns from the calling test if there is none.
macro_rules! python_or_skip {
    () => {
        match common::python() {
            Some(python) => python,
            None => return,
        }
    };
}
