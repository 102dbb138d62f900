//! Shared-library entry point embedding the fetch engine.
//!
//! # Overview
//! The host loads this library and calls `libffi_init` once, passing an
//! opaque task-queue pointer. The engine then runs on a dedicated thread,
//! pulling commands with the host's blocking poll and answering each one
//! through its respond primitive.
//!
//! # Design
//! - `libffi_init` wraps its body in `catch_unwind` so panics never cross
//!   the FFI boundary.
//! - The dispatch thread owns the engine and its runtime; `libffi_init`
//!   returns as soon as the thread is up.
//! - Logging goes to stderr through a `tracing` fmt subscriber, installed
//!   once and filtered by `RUST_LOG`.

mod host;

use std::ffi::{c_char, c_int, c_void};
use std::panic::catch_unwind;
use std::sync::{Arc, Once};

use courier_core::{Engine, HostReply};
use tracing::error;

use host::{NginxHost, TaskQueue};

static INIT_LOGGING: Once = Once::new();

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

/// Start the engine against the host's task queue.
///
/// Returns 0 on success, 1 if the queue pointer is null or the dispatch
/// thread could not be started. `_cfg` is reserved by the host ABI and
/// unused.
#[unsafe(no_mangle)]
pub extern "C" fn libffi_init(_cfg: *const c_char, tq: *mut c_void) -> c_int {
    catch_unwind(|| {
        init_logging();
        if tq.is_null() {
            error!("libffi_init called with a null task queue");
            return 1;
        }
        let queue = TaskQueue::new(tq);
        let spawned = std::thread::Builder::new()
            .name("courier-dispatch".to_string())
            .spawn(move || {
                let host: Arc<dyn HostReply> = Arc::new(NginxHost);
                match Engine::new(host) {
                    Ok(engine) => {
                        if let Err(err) = engine.run(queue) {
                            error!(error = %err, "engine terminated");
                        }
                    }
                    Err(err) => error!(error = %err, "engine failed to start"),
                }
            });
        match spawned {
            Ok(_) => 0,
            Err(err) => {
                error!(error = %err, "failed to spawn dispatch thread");
                1
            }
        }
    })
    .unwrap_or(1)
}
