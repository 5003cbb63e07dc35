//! Helpers shared by all PIXL rust executables.

mod logging;

pub use logging::{init_logging, LogArgs, LogFormat, LogLevel};
