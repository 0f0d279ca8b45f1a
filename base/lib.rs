//! Infrastructure shared by the pipeline: a typed error, a clock
//! abstraction for testability, a graceful-shutdown primitive, logging
//! setup and datetime helpers. No domain knowledge lives here.

pub mod clock;
mod error;
pub mod shutdown;
pub mod time;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};
