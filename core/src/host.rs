//! The boundary to the embedding host runtime.
//!
//! # Design
//! The core never touches the host ABI directly. `CommandSource` and
//! `HostReply` describe the two primitives the host provides — a blocking
//! "next command" and a "deliver bytes for this task" — so the FFI crate can
//! implement them over C symbols while tests implement them over channels.
//! `TaskHandle` is an opaque token minted by the host; the engine's only
//! obligation is to pass each one to `reply` exactly once.

/// Opaque identifier of one host task awaiting its reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub u64);

/// The host's blocking command feed.
pub trait CommandSource: Send {
    /// Block until the host hands over the next command payload, or return
    /// `None` when the host is shutting down.
    fn next(&mut self) -> Option<(TaskHandle, Vec<u8>)>;
}

/// The host's reply primitive.
///
/// Every task handle must be answered exactly once. `rc` is zero on
/// success; a missing payload is delivered as an empty reply.
pub trait HostReply: Send + Sync + 'static {
    fn reply(&self, task: TaskHandle, rc: i32, payload: Option<Vec<u8>>);
}
