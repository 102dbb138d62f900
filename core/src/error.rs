//! Error types for the fetch engine.
//!
//! # Design
//! The dispatcher reacts differently depending on the variant: a `Decode`
//! error terminates the engine (the command stream can no longer be
//! trusted), a `Config` error fails one client-creation attempt, and
//! everything else is marshaled into an error reply while the engine keeps
//! running.

use std::fmt;

/// Errors produced by the engine core.
#[derive(Debug)]
pub enum EngineError {
    /// The host delivered a command payload that could not be decoded.
    Decode(String),

    /// A client configuration could not be applied (unreadable trust file,
    /// invalid server name, unsupported protocol version).
    Config(String),

    /// A request-level transport failure: connect errors, protocol errors,
    /// body I/O errors.
    Transport(String),

    /// The referenced client handle is not registered.
    UnknownClient(u64),

    /// The referenced client has been closed and accepts no further work.
    ClientClosed(u64),

    /// The referenced stream id is not registered with the client.
    UnknownStream(u64),

    /// The stream's body channel is closed; no more bytes can move.
    StreamClosed(u64),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Decode(msg) => write!(f, "invalid command: {msg}"),
            EngineError::Config(msg) => write!(f, "invalid client configuration: {msg}"),
            EngineError::Transport(msg) => write!(f, "request failed: {msg}"),
            EngineError::UnknownClient(handle) => write!(f, "unknown client {handle}"),
            EngineError::ClientClosed(handle) => write!(f, "client {handle} is closed"),
            EngineError::UnknownStream(id) => write!(f, "unknown stream {id}"),
            EngineError::StreamClosed(id) => write!(f, "stream {id} is closed"),
        }
    }
}

impl std::error::Error for EngineError {}
