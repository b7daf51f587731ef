#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines,
    clippy::missing_errors_doc
)]

//! WebAssembly → native AOT compiler front end.
//!
//! Two stages: a loader/validator that parses a binary module and enforces
//! the static rules (producing a [`module::Module`] that borrows the input
//! buffer), and an LLVM emitter that lowers every function body plus the
//! host runtime ABI (instance lifecycle, exception plumbing, export-API
//! table) into an LLVM module for the backend to turn into an object file.

pub mod config;
pub mod error;
pub mod llvm_backend;
pub mod module;
pub mod natives;
pub mod opcode;
pub mod reader;
pub mod sections;
pub mod trap;
pub mod validator;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use config::{CompOptions, OutputFormat};
pub use error::{Error, Result};
pub use llvm_backend::{compile_module, compile_to_ir, compile_to_object};
pub use module::loader::parse;
pub use trap::ExceptionId;
