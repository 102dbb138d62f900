//! The dispatcher: one sequential loop over host commands.
//!
//! # Design
//! The loop runs on the caller's thread and never awaits. Anything that can
//! block on network or pipe I/O — request execution, body writes, the
//! response pumps — runs on the engine's tokio runtime. The one sanctioned
//! stall is the hard-capacity request-queue send in `issue_request`, which
//! only triggers between the shedding threshold and the queue limit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, error, info};

use crate::client::{Client, QUEUE_SHED_THRESHOLD};
use crate::command::{ClientConfig, ClientHandle, Command, RequestSpec, StreamId};
use crate::error::EngineError;
use crate::host::{CommandSource, HostReply, TaskHandle};
use crate::reply::{encode, error_payload, wire_headers};
use crate::request::run_request;
use crate::stream::{ReadOffer, Settle, StreamContext};

/// The engine: client registry, runtime, and the dispatch loop.
pub struct Engine {
    runtime: tokio::runtime::Runtime,
    clients: DashMap<ClientHandle, Arc<Client>>,
    next_client: AtomicU64,
    host: Arc<dyn HostReply>,
}

impl Engine {
    pub fn new(host: Arc<dyn HostReply>) -> Result<Engine, EngineError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("courier-worker")
            .build()
            .map_err(|err| EngineError::Config(format!("runtime: {err}")))?;
        Ok(Engine {
            runtime,
            clients: DashMap::new(),
            next_client: AtomicU64::new(0),
            host,
        })
    }

    /// Pull commands until the host signals shutdown or a payload fails to
    /// decode. A decode failure still answers the offending task before the
    /// engine goes down.
    pub fn run(&self, mut source: impl CommandSource) -> Result<(), EngineError> {
        while let Some((task, raw)) = source.next() {
            match Command::decode(&raw) {
                Ok(command) => self.handle(task, command),
                Err(err) => {
                    error!(error = %err, "undecodable command, shutting down");
                    self.host.reply(task, 1, Some(error_payload(&err.to_string())));
                    return Err(err);
                }
            }
        }
        info!("command stream ended, engine shutting down");
        Ok(())
    }

    fn handle(&self, task: TaskHandle, command: Command) {
        match command {
            Command::NewClient { config } => self.new_client(task, config),
            Command::CloseClient { client } => self.close_client(task, client),
            Command::IssueRequest { client, spec } => self.issue_request(task, client, spec),
            Command::WriteRequestBody {
                client,
                stream,
                chunk,
            } => self.write_request_body(task, client, stream, chunk),
            Command::ReadResponseBody { client, stream } => {
                self.read_response_body(task, client, stream)
            }
            Command::ReadTrailer { client, stream } => self.read_trailer(task, client, stream),
            Command::CloseRequest { client, stream } => self.close_request(task, client, stream),
        }
    }

    fn new_client(&self, task: TaskHandle, config: ClientConfig) {
        match Client::start(&config, self.runtime.handle(), &self.host) {
            Ok(client) => {
                let handle = self.next_client.fetch_add(1, Ordering::Relaxed) + 1;
                self.clients.insert(handle, client);
                debug!(client = handle, workers = config.workers(), "client created");
                self.host
                    .reply(task, 0, Some(handle.to_string().into_bytes()));
            }
            Err(err) => {
                error!(error = %err, "client creation failed");
                self.reply_error(task, &err);
            }
        }
    }

    fn close_client(&self, task: TaskHandle, handle: ClientHandle) {
        match self.clients.remove(&handle) {
            Some((_, client)) => {
                client.close();
                debug!(client = handle, "client closed");
                self.host.reply(task, 0, None);
            }
            None => self.reply_error(task, &EngineError::UnknownClient(handle)),
        }
    }

    /// Below the shedding threshold the request joins the bounded queue;
    /// past it, a detached task runs the request so command intake never
    /// stalls behind a saturated worker pool.
    fn issue_request(&self, task: TaskHandle, handle: ClientHandle, spec: RequestSpec) {
        let Some(client) = self.client(handle) else {
            return self.reply_error(task, &EngineError::UnknownClient(handle));
        };
        if client.queue_depth() < QUEUE_SHED_THRESHOLD {
            if let Err(err) = client.enqueue_blocking(handle, (task, spec)) {
                self.reply_error(task, &err);
            }
        } else {
            debug!(client = handle, "request queue saturated, running detached");
            self.runtime
                .spawn(run_request(client, self.host.clone(), task, spec));
        }
    }

    /// Body writes run detached because the pipe applies backpressure: a
    /// write blocks until the transport has drained the previous chunk.
    fn write_request_body(
        &self,
        task: TaskHandle,
        handle: ClientHandle,
        stream: StreamId,
        chunk: Option<String>,
    ) {
        let ctx = match self.stream(handle, stream) {
            Ok(ctx) => ctx,
            Err(err) => return self.reply_error(task, &err),
        };
        let host = self.host.clone();
        self.runtime.spawn(async move {
            match chunk {
                Some(text) => match ctx.write_end() {
                    Some(pipe) => {
                        if pipe.send(Bytes::from(text)).await.is_ok() {
                            host.reply(task, 0, None);
                        } else {
                            host.reply(
                                task,
                                1,
                                Some(error_payload(&EngineError::StreamClosed(stream).to_string())),
                            );
                        }
                    }
                    None => host.reply(
                        task,
                        1,
                        Some(error_payload("stream has no body writer")),
                    ),
                },
                // End-of-body: the reply for this task is the eventual
                // response head, delivered when the blocked HTTP call
                // finishes.
                None => match ctx.settle_task(task) {
                    Settle::Stashed => ctx.finish_write(),
                    Settle::Reply(task, rc, payload) => {
                        ctx.finish_write();
                        host.reply(task, rc, Some(payload));
                    }
                    Settle::AlreadyClosed => host.reply(
                        task,
                        1,
                        Some(error_payload("request body already closed")),
                    ),
                },
            }
        });
    }

    fn read_response_body(&self, task: TaskHandle, handle: ClientHandle, stream: StreamId) {
        match self.stream(handle, stream) {
            Ok(ctx) => match ctx.offer_read(task) {
                ReadOffer::Queued => {}
                // No pump yet (response pending) or the previous read is
                // still in flight: empty success, the host retries.
                ReadOffer::Busy | ReadOffer::NotStreaming => self.host.reply(task, 0, None),
                ReadOffer::Closed => self.reply_error(task, &EngineError::StreamClosed(stream)),
            },
            Err(err) => self.reply_error(task, &err),
        }
    }

    fn read_trailer(&self, task: TaskHandle, handle: ClientHandle, stream: StreamId) {
        match self.stream(handle, stream) {
            Ok(ctx) => match ctx.trailers() {
                Some(trailers) => {
                    let (rc, payload) = encode(&wire_headers(&trailers));
                    self.host.reply(task, rc, Some(payload));
                }
                None => self.host.reply(task, 0, None),
            },
            Err(err) => self.reply_error(task, &err),
        }
    }

    fn close_request(&self, task: TaskHandle, handle: ClientHandle, stream: StreamId) {
        let Some(client) = self.client(handle) else {
            return self.reply_error(task, &EngineError::UnknownClient(handle));
        };
        match client.streams.remove(&stream) {
            Some((_, ctx)) => {
                ctx.close();
                debug!(client = handle, stream, "stream closed");
                self.host.reply(task, 0, None);
            }
            None => self.reply_error(task, &EngineError::UnknownStream(stream)),
        }
    }

    fn client(&self, handle: ClientHandle) -> Option<Arc<Client>> {
        self.clients.get(&handle).map(|entry| entry.value().clone())
    }

    fn stream(
        &self,
        handle: ClientHandle,
        stream: StreamId,
    ) -> Result<Arc<StreamContext>, EngineError> {
        let client = self
            .client(handle)
            .ok_or(EngineError::UnknownClient(handle))?;
        client
            .stream(stream)
            .ok_or(EngineError::UnknownStream(stream))
    }

    fn reply_error(&self, task: TaskHandle, err: &EngineError) {
        self.host
            .reply(task, 1, Some(error_payload(&err.to_string())));
    }
}
