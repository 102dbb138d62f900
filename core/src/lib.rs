//! Asynchronous HTTP client engine for an embedding host.
//!
//! # Overview
//! The engine multiplexes many logical HTTP clients, each running a fixed
//! pool of workers over a bounded request queue, while a single sequential
//! dispatcher drains the host's command stream and answers every command
//! exactly once. Request and response bodies can stream incrementally
//! through per-exchange contexts, in both directions at once.
//!
//! # Design
//! - The host boundary is two traits (`CommandSource`, `HostReply`); the
//!   shared-library crate implements them over the C ABI, tests over
//!   channels.
//! - The dispatcher never blocks on network I/O: requests run on workers,
//!   body writes and overload spill-over run on detached tasks, and each
//!   streaming response gets one pump task.
//! - Commands decode into one enum variant per kind, so a kind can only
//!   see the fields it actually has.

pub mod command;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod reply;

mod client;
mod multipart;
mod request;
mod stream;

pub use command::{ClientConfig, Command, RequestSpec, DEFAULT_WORKERS};
pub use dispatch::Engine;
pub use error::EngineError;
pub use host::{CommandSource, HostReply, TaskHandle};
