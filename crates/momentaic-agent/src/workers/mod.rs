//! Built-in worker adapters.
//!
//! `FnWorker` wraps an async closure so application code can register a
//! worker without writing a type. `CommandWorker` runs a shell command and
//! parses its reply.

pub mod command;
pub mod function;

pub use command::CommandWorker;
pub use function::FnWorker;
