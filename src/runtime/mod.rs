pub mod context;
pub mod frame;
pub mod globals;
pub mod interpreter;
pub mod ops;
pub mod runtime_error;
pub mod vm;
