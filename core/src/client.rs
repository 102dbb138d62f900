//! One logical HTTP client: the outbound capability, a bounded request
//! queue, a fixed worker pool, and the registry of in-flight streams.
//!
//! # Design
//! The capability is a pooled hyper client over a rustls connector, built
//! once from the creation-time configuration and never mutated. Workers
//! share the queue's receive side; closing the send side is the only
//! shutdown signal they ever get — each finishes its current request and
//! exits when the drained queue reports closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use dashmap::DashMap;
use tracing::debug;

use crate::command::{ClientConfig, RequestSpec, StreamId};
use crate::error::EngineError;
use crate::host::{HostReply, TaskHandle};
use crate::request::{run_request, OutboundBody};
use crate::stream::StreamContext;

/// Hard capacity of the per-client request queue.
pub(crate) const QUEUE_CAPACITY: usize = 1000;
/// Queue depth beyond which issue-request sheds to a detached task.
pub(crate) const QUEUE_SHED_THRESHOLD: usize = 100;

pub(crate) type HttpCapability = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    OutboundBody,
>;

pub(crate) type Job = (TaskHandle, RequestSpec);

/// One logical HTTP client.
pub(crate) struct Client {
    http: HttpCapability,
    queue: Sender<Job>,
    pub(crate) streams: DashMap<StreamId, Arc<StreamContext>>,
    next_stream: AtomicU64,
    compression: bool,
}

impl Client {
    /// Build the capability from `config` and start the worker pool.
    pub(crate) fn start(
        config: &ClientConfig,
        runtime: &tokio::runtime::Handle,
        host: &Arc<dyn HostReply>,
    ) -> Result<Arc<Client>, EngineError> {
        let http = build_capability(config)?;
        let (queue_tx, queue_rx) = async_channel::bounded(QUEUE_CAPACITY);
        let client = Arc::new(Client {
            http,
            queue: queue_tx,
            streams: DashMap::new(),
            next_stream: AtomicU64::new(0),
            compression: config.compression,
        });
        for _ in 0..config.workers() {
            runtime.spawn(worker_loop(client.clone(), host.clone(), queue_rx.clone()));
        }
        Ok(client)
    }

    pub(crate) fn http(&self) -> &HttpCapability {
        &self.http
    }

    pub(crate) fn compression(&self) -> bool {
        self.compression
    }

    /// Stream ids start at 1 and never repeat within this client.
    pub(crate) fn next_stream_id(&self) -> StreamId {
        self.next_stream.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn stream(&self, id: StreamId) -> Option<Arc<StreamContext>> {
        self.streams.get(&id).map(|entry| entry.value().clone())
    }

    pub(crate) fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a request for the worker pool. Blocks the caller (not the
    /// runtime) while the queue is at hard capacity.
    pub(crate) fn enqueue_blocking(&self, handle: u64, job: Job) -> Result<(), EngineError> {
        self.queue
            .send_blocking(job)
            .map_err(|_| EngineError::ClientClosed(handle))
    }

    /// Close the request queue and force-close every surviving stream.
    /// Requests already picked up by a worker complete naturally.
    pub(crate) fn close(&self) {
        self.queue.close();
        for entry in self.streams.iter() {
            entry.value().close();
        }
        self.streams.clear();
    }
}

async fn worker_loop(client: Arc<Client>, host: Arc<dyn HostReply>, queue: Receiver<Job>) {
    while let Ok((task, spec)) = queue.recv().await {
        run_request(client.clone(), host.clone(), task, spec).await;
    }
    debug!("worker exiting, request queue closed");
}

/// Assemble the pooled hyper client described by `config`.
fn build_capability(config: &ClientConfig) -> Result<HttpCapability, EngineError> {
    let tls = tls_config(config)?;
    let builder = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http();
    let builder = match config.ssl_server_name.clone() {
        Some(name) => {
            let server_name = rustls::pki_types::ServerName::try_from(name.clone())
                .map_err(|_| EngineError::Config(format!("invalid tls server name: {name}")))?;
            builder.with_server_name_resolver(hyper_rustls::FixedServerNameResolver::new(
                server_name,
            ))
        }
        None => builder,
    };
    let connector = match config.version {
        None if config.upgrade => builder.enable_all_versions().build(),
        None | Some(1) => builder.enable_http1().build(),
        Some(2) => builder.enable_http2().build(),
        Some(other) => {
            return Err(EngineError::Config(format!(
                "unsupported protocol version {other}"
            )))
        }
    };

    let mut client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new());
    if let Some(limit) = config.max_idle_per_host {
        client.pool_max_idle_per_host(limit);
    }
    if config.version == Some(2) {
        client.http2_only(true);
    }
    Ok(client.build(connector))
}

/// Union of the system trust store and any configured trust files.
/// A file that cannot be read or parsed fails the whole creation attempt.
fn tls_config(config: &ClientConfig) -> Result<rustls::ClientConfig, EngineError> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        debug!(error = %error, "skipping unusable system root");
    }
    for cert in native.certs {
        if let Err(err) = roots.add(cert) {
            debug!(error = %err, "skipping unusable system root");
        }
    }
    for path in &config.ssl_verify {
        let pem = std::fs::read(path)
            .map_err(|err| EngineError::Config(format!("trust file {path}: {err}")))?;
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert =
                cert.map_err(|err| EngineError::Config(format!("trust file {path}: {err}")))?;
            roots
                .add(cert)
                .map_err(|err| EngineError::Config(format!("trust file {path}: {err}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(EngineError::Config(format!(
                "trust file {path}: no certificates found"
            )));
        }
    }
    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
