//! Request execution: one HTTP exchange, from decoded spec to host reply.
//!
//! # Design
//! `run_request` is the single entry point used by workers and by detached
//! overload tasks, so the reply discipline lives in exactly one place. The
//! streaming-writer path replies twice over the exchange's lifetime — the
//! stream id immediately, the response head when the transport finishes
//! draining the body pipe — but each reply answers a different host task.

use std::convert::Infallible;
use std::sync::Arc;

use async_channel::Receiver;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use tracing::warn;

use crate::client::Client;
use crate::command::RequestSpec;
use crate::error::EngineError;
use crate::host::{HostReply, TaskHandle};
use crate::multipart;
use crate::reply::{encode, error_payload, wire_headers, ResponseHead};
use crate::stream::{pump_response_body, StreamContext, BODY_PIPE_DEPTH, READ_QUEUE_DEPTH};

/// Request bodies handed to the HTTP capability.
pub(crate) type OutboundBody = BoxBody<Bytes, Infallible>;

/// Execute one issue-request command and answer its host task(s).
pub(crate) async fn run_request(
    client: Arc<Client>,
    host: Arc<dyn HostReply>,
    task: TaskHandle,
    spec: RequestSpec,
) {
    if spec.body_writer {
        let (pipe_tx, pipe_rx) = async_channel::bounded(BODY_PIPE_DEPTH);
        let id = client.next_stream_id();
        let ctx = Arc::new(StreamContext::for_writer(id, pipe_tx));
        client.streams.insert(id, ctx.clone());
        host.reply(task, 0, Some(id.to_string().into_bytes()));

        let (rc, payload) = execute(&client, &host, &spec, Some(&ctx), Some(pipe_rx)).await;
        if let Some((task, rc, payload)) = ctx.settle_outcome(rc, payload) {
            host.reply(task, rc, Some(payload));
        }
    } else {
        let (rc, payload) = execute(&client, &host, &spec, None, None).await;
        host.reply(task, rc, Some(payload));
    }
}

/// Perform the exchange and marshal its outcome into a reply payload.
async fn execute(
    client: &Arc<Client>,
    host: &Arc<dyn HostReply>,
    spec: &RequestSpec,
    writer_ctx: Option<&Arc<StreamContext>>,
    pipe: Option<Receiver<Bytes>>,
) -> (i32, Vec<u8>) {
    match send(client, spec, pipe).await {
        Ok(response) => marshal(client, host, spec, writer_ctx, response).await,
        Err(err) => {
            warn!(url = %spec.url, error = %err, "request failed");
            (1, error_payload(&err.to_string()))
        }
    }
}

/// Build and send the HTTP request.
async fn send(
    client: &Client,
    spec: &RequestSpec,
    pipe: Option<Receiver<Bytes>>,
) -> Result<http::Response<Incoming>, EngineError> {
    let url = build_url(spec)?;
    let mut builder = http::Request::builder()
        .method(spec.method()?)
        .uri(url.as_str());
    if let Some(headers) = &spec.headers {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if client.compression() {
        builder = builder.header(http::header::ACCEPT_ENCODING, "gzip");
    }

    let mut content_type = None;
    let body: OutboundBody = if let Some(pipe) = pipe {
        BodyExt::boxed(StreamBody::new(pipe.map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)))))
    } else if let Some(text) = &spec.body {
        Full::new(Bytes::from(text.clone())).boxed()
    } else if let Some(files) = &spec.files {
        let encoded = multipart::multipart(spec.form.as_ref(), files).await?;
        content_type = Some(encoded.content_type);
        Full::new(encoded.body).boxed()
    } else if let Some(form) = &spec.form {
        let encoded = multipart::urlencode(form);
        content_type = Some(encoded.content_type);
        Full::new(encoded.body).boxed()
    } else {
        Empty::<Bytes>::new().boxed()
    };
    if let Some(content_type) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
    }

    let request = builder
        .body(body)
        .map_err(|err| EngineError::Transport(err.to_string()))?;
    client
        .http()
        .request(request)
        .await
        .map_err(|err| EngineError::Transport(err.to_string()))
}

/// Merge query args into the request URL.
fn build_url(spec: &RequestSpec) -> Result<url::Url, EngineError> {
    let mut url = url::Url::parse(&spec.url)
        .map_err(|err| EngineError::Transport(format!("url {}: {err}", spec.url)))?;
    if let Some(args) = &spec.args {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in args {
            pairs.append_pair(name, &multipart::stringify(value));
        }
    }
    Ok(url)
}

/// Turn the response into a reply payload; in streaming mode this also
/// starts the body pump before the head goes back.
async fn marshal(
    client: &Arc<Client>,
    host: &Arc<dyn HostReply>,
    spec: &RequestSpec,
    writer_ctx: Option<&Arc<StreamContext>>,
    response: http::Response<Incoming>,
) -> (i32, Vec<u8>) {
    let (parts, body) = response.into_parts();
    let mut head = ResponseHead::from_parts(parts.status, parts.version, &parts.headers);

    if spec.body_reader {
        let ctx = match writer_ctx {
            Some(ctx) => {
                ctx.clear_writer();
                ctx.clone()
            }
            None => {
                let id = client.next_stream_id();
                let ctx = Arc::new(StreamContext::for_reader(id));
                client.streams.insert(id, ctx.clone());
                ctx
            }
        };
        head.req_id = Some(ctx.id);
        let (read_tx, read_rx) = async_channel::bounded(READ_QUEUE_DEPTH);
        ctx.attach_reads(read_tx);
        tokio::spawn(pump_response_body(ctx, read_rx, body, host.clone()));
        encode(&head)
    } else {
        match body.collect().await {
            Ok(collected) => {
                if let Some(trailers) = collected.trailers() {
                    head.trailer = Some(wire_headers(trailers));
                }
                head.set_body(&collected.to_bytes());
                encode(&head)
            }
            Err(err) => {
                warn!(url = %spec.url, error = %err, "reading response body failed");
                (1, error_payload(&err.to_string()))
            }
        }
    }
}
