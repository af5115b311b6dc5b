//! Cinder: a small dynamic scripting language compiled to bytecode and run on
//! a stack VM, with a persistent REPL session.

pub mod bytecode;
pub mod config;
pub mod error;
pub mod frontend;
pub mod lang;
pub mod modules;
pub mod runtime;

pub use crate::config::{Config, ConfigError};
pub use crate::error::Error;
pub use crate::lang::value::{Builtin, Value};
pub use crate::runtime::context::CancelToken;
pub use crate::runtime::interpreter::Interpreter;
pub use crate::runtime::vm::VmConfig;
