//! Calling-convention adapters for iterator-based HTTP handlers
//!
//! Handlers come in two conventions. A simple handler returns the whole
//! `(status, headers, body)` triple; a full handler is additionally handed a
//! status callback and returns only a body. [`lite`] and [`lighten`] adapt
//! between the two so middleware written for one can wrap handlers written
//! for the other, and every body's close hook still runs exactly once.

#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![warn(missing_docs)]

pub mod adapter;
pub mod bindings;
/// Response bodies with exactly-once close semantics
pub mod body;
pub mod bridge;
pub mod cleanup;
pub mod config;
pub mod environ;
pub mod error;
pub mod handler;
pub mod harness;
pub mod types;

pub use adapter::{Adapted, lighten, lighten_with, lite};
pub use body::{Body, CloseHook, ResponseWrapper};
pub use bridge::Writer;
pub use cleanup::{AggregateClose, Registration};
pub use config::{Config, WriteBridge};
pub use environ::{Environ, ErrorLog, Input};
pub use error::{Error, Result, Violation};
pub use handler::{ExcInfo, FullApp, Handler, HeaderSlot, SimpleApp, StartResponse};
pub use types::{Headers, Reply, Response, Status};
