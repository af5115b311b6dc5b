//! # Cinder language model
//!
//! The syntax tree produced by the parser and the dynamic values the VM
//! operates on.

pub mod ast;
pub mod value;
