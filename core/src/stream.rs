//! Per-exchange streaming state: the request-body pipe, the pending-read
//! queue, and the pump that services incremental response-body reads.
//!
//! # Design
//! One `StreamContext` serves both directions of an exchange; which fields
//! are populated depends on whether the host asked to write the request
//! body, read the response body, or both. The context is shared between the
//! dispatcher, the worker that runs the request, and the pump, so every
//! field sits behind its own mutex and closing is idempotent.

use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender, TrySendError};
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Body;
use tracing::{debug, warn};

use crate::command::StreamId;
use crate::host::{HostReply, TaskHandle};

/// Initial capacity of the pump's read buffer; doubles when a pass fills it.
pub(crate) const READ_BUF_INIT: usize = 512;
/// Depth of the pending-read queue.
pub(crate) const READ_QUEUE_DEPTH: usize = 100;
/// Depth of the request-body pipe; writers block until the transport drains.
pub(crate) const BODY_PIPE_DEPTH: usize = 1;

/// Outcome of offering a read command to the pending-read queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOffer {
    /// Accepted; the pump will reply.
    Queued,
    /// A previous read is still being serviced; the host should retry.
    Busy,
    /// The pump has finished; no further reads can be serviced.
    Closed,
    /// No response is being streamed on this context yet.
    NotStreaming,
}

/// Outcome of stashing the end-of-body task on the context.
#[derive(Debug)]
pub(crate) enum Settle {
    /// The HTTP exchange already finished; reply with its outcome now.
    Reply(TaskHandle, i32, Vec<u8>),
    /// Stashed; the worker replies when the exchange finishes.
    Stashed,
    /// The body was already closed; the task needs its own error reply.
    AlreadyClosed,
}

/// Reply hand-off between the dispatcher (which learns the end-of-body task
/// handle) and the worker (which learns the HTTP outcome). Whichever side
/// arrives second performs the reply.
#[derive(Debug)]
enum WriterExchange {
    Idle,
    Task(TaskHandle),
    Outcome(i32, Vec<u8>),
    Settled,
}

/// State of one in-flight body exchange.
pub(crate) struct StreamContext {
    pub id: StreamId,
    writer: Mutex<Option<Sender<Bytes>>>,
    reads: Mutex<Option<Sender<TaskHandle>>>,
    trailers: Mutex<Option<HeaderMap>>,
    exchange: Mutex<WriterExchange>,
}

impl StreamContext {
    /// Context for a request whose body streams in from write commands.
    pub(crate) fn for_writer(id: StreamId, pipe: Sender<Bytes>) -> Self {
        StreamContext {
            id,
            writer: Mutex::new(Some(pipe)),
            reads: Mutex::new(None),
            trailers: Mutex::new(None),
            exchange: Mutex::new(WriterExchange::Idle),
        }
    }

    /// Context for a response whose body streams out through read commands.
    pub(crate) fn for_reader(id: StreamId) -> Self {
        StreamContext {
            id,
            writer: Mutex::new(None),
            reads: Mutex::new(None),
            trailers: Mutex::new(None),
            exchange: Mutex::new(WriterExchange::Idle),
        }
    }

    /// The write end of the request-body pipe, if this context has one.
    pub(crate) fn write_end(&self) -> Option<Sender<Bytes>> {
        self.writer.lock().unwrap().clone()
    }

    /// Close the request-body pipe; the blocked HTTP call sees end-of-body.
    pub(crate) fn finish_write(&self) {
        if let Some(pipe) = self.writer.lock().unwrap().take() {
            pipe.close();
        }
    }

    /// Drop the (already closed) pipe when the context is reused for the
    /// response side of the same exchange.
    pub(crate) fn clear_writer(&self) {
        self.writer.lock().unwrap().take();
    }

    pub(crate) fn attach_reads(&self, queue: Sender<TaskHandle>) {
        *self.reads.lock().unwrap() = Some(queue);
    }

    /// Non-blocking hand-off of a read command to the pump.
    pub(crate) fn offer_read(&self, task: TaskHandle) -> ReadOffer {
        match &*self.reads.lock().unwrap() {
            None => ReadOffer::NotStreaming,
            Some(queue) => match queue.try_send(task) {
                Ok(()) => ReadOffer::Queued,
                Err(TrySendError::Full(_)) => ReadOffer::Busy,
                Err(TrySendError::Closed(_)) => ReadOffer::Closed,
            },
        }
    }

    pub(crate) fn set_trailers(&self, trailers: HeaderMap) {
        *self.trailers.lock().unwrap() = Some(trailers);
    }

    pub(crate) fn trailers(&self) -> Option<HeaderMap> {
        self.trailers.lock().unwrap().clone()
    }

    /// Record the end-of-body task so the eventual HTTP outcome can answer
    /// it, or hand back the outcome if it already arrived.
    pub(crate) fn settle_task(&self, task: TaskHandle) -> Settle {
        let mut exchange = self.exchange.lock().unwrap();
        match std::mem::replace(&mut *exchange, WriterExchange::Settled) {
            WriterExchange::Idle => {
                *exchange = WriterExchange::Task(task);
                Settle::Stashed
            }
            WriterExchange::Outcome(rc, payload) => Settle::Reply(task, rc, payload),
            WriterExchange::Task(previous) => {
                *exchange = WriterExchange::Task(previous);
                Settle::AlreadyClosed
            }
            WriterExchange::Settled => Settle::AlreadyClosed,
        }
    }

    /// Record the HTTP outcome, or hand back the stashed task it answers.
    pub(crate) fn settle_outcome(
        &self,
        rc: i32,
        payload: Vec<u8>,
    ) -> Option<(TaskHandle, i32, Vec<u8>)> {
        let mut exchange = self.exchange.lock().unwrap();
        match std::mem::replace(&mut *exchange, WriterExchange::Settled) {
            WriterExchange::Idle => {
                *exchange = WriterExchange::Outcome(rc, payload);
                None
            }
            WriterExchange::Task(task) => Some((task, rc, payload)),
            WriterExchange::Outcome(..) | WriterExchange::Settled => None,
        }
    }

    /// Force-close both directions. Blocked writers and the pump's queue
    /// consumer unblock with a closed-channel error.
    pub(crate) fn close(&self) {
        if let Some(pipe) = self.writer.lock().unwrap().take() {
            pipe.close();
        }
        if let Some(queue) = self.reads.lock().unwrap().take() {
            queue.close();
        }
    }
}

/// Chunked reader over a response body, one host-sized chunk per call.
pub(crate) struct BodyReader<B> {
    body: B,
    buf: Vec<u8>,
    pending: Bytes,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl<B> BodyReader<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    pub(crate) fn new(body: B) -> Self {
        BodyReader {
            body,
            buf: Vec::with_capacity(READ_BUF_INIT),
            pending: Bytes::new(),
            trailers: None,
            done: false,
        }
    }

    /// All frames consumed and nothing is buffered.
    pub(crate) fn finished(&self) -> bool {
        self.done && self.pending.is_empty()
    }

    pub(crate) fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }

    /// Accumulate bytes for one read command: the buffer doubles each time
    /// a pass fills it exactly, and the read stops on a short pass or
    /// end-of-stream. Returns empty once the body is exhausted; a read
    /// error is logged and treated as end-of-stream with whatever bytes
    /// were accumulated.
    pub(crate) async fn read_chunk(&mut self) -> Vec<u8> {
        loop {
            if self.buf.len() == self.buf.capacity() {
                let grow = self.buf.capacity().max(READ_BUF_INIT);
                self.buf.reserve(grow);
            }
            if self.pending.is_empty() && !self.done {
                match self.body.frame().await {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) => self.pending = data,
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                self.trailers = Some(trailers);
                            }
                        }
                    },
                    Some(Err(err)) => {
                        warn!(error = %err, "response body read failed");
                        self.done = true;
                    }
                    None => self.done = true,
                }
                continue;
            }
            if self.pending.is_empty() {
                let chunk = self.buf.clone();
                self.buf.clear();
                return chunk;
            }
            let room = self.buf.capacity() - self.buf.len();
            let take = room.min(self.pending.len());
            self.buf.extend_from_slice(&self.pending[..take]);
            self.pending.advance(take);
            if self.buf.len() < self.buf.capacity() {
                let chunk = self.buf.clone();
                self.buf.clear();
                return chunk;
            }
        }
    }
}

/// Service the pending-read queue of one streaming response.
///
/// Each queued read command is answered with the next chunk of body bytes;
/// a zero-byte reply is the terminal chunk. Once the terminal chunk has
/// been delivered the queue is closed, so later reads observe a closed
/// queue instead of hanging.
pub(crate) async fn pump_response_body<B>(
    ctx: Arc<StreamContext>,
    reads: Receiver<TaskHandle>,
    body: B,
    host: Arc<dyn HostReply>,
) where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut reader = BodyReader::new(body);
    while let Ok(task) = reads.recv().await {
        let chunk = reader.read_chunk().await;
        if let Some(trailers) = reader.take_trailers() {
            ctx.set_trailers(trailers);
        }
        let terminal = reader.finished() && chunk.is_empty();
        host.reply(task, 0, Some(chunk));
        if terminal {
            break;
        }
    }
    reads.close();
    // Reads that were already queued when the stream ended still get their
    // terminal chunk; nothing waits forever.
    while let Ok(task) = reads.try_recv() {
        host.reply(task, 0, Some(Vec::new()));
    }
    debug!(stream = ctx.id, "response body pump finished");
}
