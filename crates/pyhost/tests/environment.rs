//! Environment overrides applied at startup.
//!
//! Kept in its own binary so the host environment is observed before the interpreter starts.

#[macro_use]
mod common;

use std::env;

use pyhost::{Outputs, Value};

use crate::common::{MARKER_VAR, eval_value, globals};

#[test]
fn overrides_are_added_to_the_inherited_environment() {
    let host_path = env::var_os("PATH");
    let python = python_or_skip!();

    let name = python.string(MARKER_VAR).unwrap();
    let output = python
        .eval("import os\nos.environ.get(name)", &globals([("name", &name)]), &Outputs::discard())
        .unwrap();
    assert_eq!(python.decode(output.result.as_ref().unwrap()).unwrap(), Value::Str("set".to_owned()));

    // inherited variables survive, in the interpreter and in the host process
    assert_eq!(
        eval_value(python, "import os\n'PATH' in os.environ"),
        Value::Bool(host_path.is_some())
    );
    assert_eq!(env::var_os("PATH"), host_path);
}
