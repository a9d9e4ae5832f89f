#![doc = include_str!("../../../README.md")]

mod capsule;
mod compile;
pub mod config;
mod convert;
mod error;
mod eval;
mod exception;
mod ffi;
mod gil;
mod io;
mod janitor;
mod mailbox;
mod object;
mod python;
pub mod scope;
mod value;

pub use crate::{
    compile::CodeHash,
    config::{ConfigError, InitConfig},
    error::{Error, LoadError, PyException, SyntaxError, UsageError},
    eval::{EvalOutput, Globals},
    io::{CollectOutput, NoOutput, OutputSink, Outputs, StdOutput},
    mailbox::{Mailbox, MailboxId, TaggedObject},
    object::PyObject,
    python::Python,
    scope::ScopeAnalysis,
    value::{Decoded, Value},
};
