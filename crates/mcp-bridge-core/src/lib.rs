//! mcp-bridge core - platform-independent building blocks
//!
//! Configuration, the error taxonomy, process management traits, the byte
//! relay and the diagnostic sink shared by the platform crates and the
//! listener facade.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod process;
pub mod relay;

pub use config::*;
pub use diagnostics::{DiagnosticCodec, DiagnosticSink, TracingSink, WriterSink, drain};
pub use error::*;
pub use process::*;
pub use relay::{
    DEFAULT_BUFFER_SIZE, Direction, RelayEnd, RelayOutcome, StreamError, StreamOperation, pump,
    relay,
};
