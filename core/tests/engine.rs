//! End-to-end engine tests: a channel-backed host driving the real
//! dispatcher against the live mock server.
//!
//! Each test starts its own engine (on a helper thread, the way the
//! embedding host would) and its own mock server on a random port, then
//! speaks the wire protocol: JSON commands in, correlated replies out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use base64::Engine as _;
use courier_core::{CommandSource, Engine, EngineError, HostReply, TaskHandle};
use serde_json::{json, Value};

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Replies recorded per task handle, with a condvar for waiters.
#[derive(Clone, Default)]
struct ReplyLog(Arc<(Mutex<HashMap<u64, (i32, Vec<u8>)>>, Condvar)>);

impl HostReply for ReplyLog {
    fn reply(&self, task: TaskHandle, rc: i32, payload: Option<Vec<u8>>) {
        let (lock, cvar) = &*self.0;
        let mut replies = lock.lock().unwrap();
        let previous = replies.insert(task.0, (rc, payload.unwrap_or_default()));
        assert!(previous.is_none(), "task {} answered twice", task.0);
        cvar.notify_all();
    }
}

impl ReplyLog {
    fn wait(&self, task: u64) -> (i32, Vec<u8>) {
        let (lock, cvar) = &*self.0;
        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut replies = lock.lock().unwrap();
        loop {
            if let Some(reply) = replies.remove(&task) {
                return reply;
            }
            let left = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or_else(|| panic!("timed out waiting for reply to task {task}"));
            let (guard, _) = cvar.wait_timeout(replies, left).unwrap();
            replies = guard;
        }
    }
}

struct ChannelSource(mpsc::Receiver<(TaskHandle, Vec<u8>)>);

impl CommandSource for ChannelSource {
    fn next(&mut self) -> Option<(TaskHandle, Vec<u8>)> {
        self.0.recv().ok()
    }
}

struct Harness {
    commands: mpsc::Sender<(TaskHandle, Vec<u8>)>,
    replies: ReplyLog,
    next_task: AtomicU64,
    engine: Option<std::thread::JoinHandle<Result<(), EngineError>>>,
    base_url: String,
}

impl Harness {
    fn start() -> Harness {
        let base_url = spawn_mock_server();
        let (commands, feed) = mpsc::channel();
        let replies = ReplyLog::default();
        let host = replies.clone();
        let engine = std::thread::spawn(move || {
            let engine = Engine::new(Arc::new(host))?;
            engine.run(ChannelSource(feed))
        });
        Harness {
            commands,
            replies,
            next_task: AtomicU64::new(0),
            engine: Some(engine),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn send_raw(&self, raw: Vec<u8>) -> u64 {
        let task = self.next_task.fetch_add(1, Ordering::Relaxed) + 1;
        self.commands
            .send((TaskHandle(task), raw))
            .expect("engine stopped accepting commands");
        task
    }

    fn send(&self, command: Value) -> u64 {
        self.send_raw(command.to_string().into_bytes())
    }

    fn call(&self, command: Value) -> (i32, Vec<u8>) {
        let task = self.send(command);
        self.replies.wait(task)
    }

    fn call_ok(&self, command: Value) -> Vec<u8> {
        let (rc, payload) = self.call(command);
        assert_eq!(
            rc,
            0,
            "unexpected error reply: {}",
            String::from_utf8_lossy(&payload)
        );
        payload
    }

    fn call_err(&self, command: Value) -> String {
        let (rc, payload) = self.call(command);
        assert_ne!(rc, 0, "expected an error reply");
        let json: Value = serde_json::from_slice(&payload).expect("error reply is JSON");
        json["error"].as_str().expect("error field").to_string()
    }

    fn new_client(&self, config: Value) -> u64 {
        let payload = self.call_ok(json!({"cmd": 0, "client_config": config}));
        String::from_utf8(payload)
            .expect("handle is text")
            .parse()
            .expect("handle is numeric")
    }

    /// Drop the command feed and join the engine thread.
    fn shutdown(mut self) -> Result<(), EngineError> {
        let engine = self.engine.take().expect("engine already joined");
        drop(self.commands);
        engine.join().expect("engine thread panicked")
    }
}

fn spawn_mock_server() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });
    format!("http://{addr}")
}

fn head_json(payload: &[u8]) -> Value {
    serde_json::from_slice(payload).expect("response head is JSON")
}

fn base64_body(head: &Value) -> Vec<u8> {
    base64::engine::general_purpose::STANDARD
        .decode(head["body"].as_str().expect("base64 body present"))
        .expect("body decodes")
}

#[test]
fn buffered_get_returns_base64_body() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/ok")},
    }));
    let head = head_json(&payload);
    assert_eq!(head["status"], 200);
    assert_eq!(head["proto_major"], 1);
    assert_eq!(head["proto_minor"], 1);
    assert_eq!(base64_body(&head), b"ok");
    assert!(head.get("req_id").is_none());
}

#[test]
fn client_handles_are_textual_and_monotonic() {
    let h = Harness::start();
    assert_eq!(h.new_client(json!({})), 1);
    assert_eq!(h.new_client(json!({"workers": 1})), 2);
}

#[test]
fn request_level_failures_keep_the_engine_alive() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    // Nothing listens on this port; the request fails, the engine persists.
    let error = h.call_err(json!({
        "cmd": 2, "client": client,
        "req": {"url": "http://127.0.0.1:9/nope"},
    }));
    assert!(error.contains("request failed"), "got: {error}");

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/ok")},
    }));
    assert_eq!(head_json(&payload)["status"], 200);
}

#[test]
fn unknown_client_and_stream_fail_cleanly() {
    let h = Harness::start();
    let error = h.call_err(json!({"cmd": 2, "client": 99, "req": {"url": "http://x/"}}));
    assert!(error.contains("unknown client 99"), "got: {error}");

    let client = h.new_client(json!({}));
    let error = h.call_err(json!({"cmd": 4, "client": client, "req_id": 42}));
    assert!(error.contains("unknown stream 42"), "got: {error}");
}

#[test]
fn streaming_response_delivers_all_bytes_then_a_terminal_chunk() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/bytes/1500"), "body_reader": true},
    }));
    let head = head_json(&payload);
    assert_eq!(head["status"], 200);
    let stream = head["req_id"].as_u64().expect("stream id assigned");
    assert!(head.get("body").is_none(), "streaming head carries no body");

    let mut collected = Vec::new();
    loop {
        let chunk = h.call_ok(json!({"cmd": 4, "client": client, "req_id": stream}));
        if chunk.is_empty() {
            break;
        }
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, mock_server::pattern(1500));

    // Past the terminal chunk the pending-read queue is closed.
    let error = h.call_err(json!({"cmd": 4, "client": client, "req_id": stream}));
    assert!(error.contains("closed"), "got: {error}");

    h.call_ok(json!({"cmd": 6, "client": client, "req_id": stream}));
}

#[test]
fn streamed_request_body_arrives_as_one_contiguous_body() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/echo"), "method": 1, "body_writer": true},
    }));
    let stream: u64 = String::from_utf8(payload).unwrap().parse().unwrap();

    for chunk in ["hello ", "streaming ", "world"] {
        h.call_ok(json!({
            "cmd": 3, "client": client, "req_id": stream,
            "req": {"body": chunk},
        }));
    }
    // End-of-body; its reply is the buffered response head.
    let payload = h.call_ok(json!({"cmd": 3, "client": client, "req_id": stream}));
    let head = head_json(&payload);
    assert_eq!(head["status"], 200);
    assert_eq!(base64_body(&head), b"hello streaming world");
}

#[test]
fn writer_reader_exchange_reuses_the_stream_id() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/echo"), "method": 1,
                "body_writer": true, "body_reader": true},
    }));
    let stream: u64 = String::from_utf8(payload).unwrap().parse().unwrap();

    h.call_ok(json!({
        "cmd": 3, "client": client, "req_id": stream,
        "req": {"body": "round trip"},
    }));
    let payload = h.call_ok(json!({"cmd": 3, "client": client, "req_id": stream}));
    let head = head_json(&payload);
    assert_eq!(head["status"], 200);
    assert_eq!(head["req_id"].as_u64(), Some(stream));

    let mut collected = Vec::new();
    loop {
        let chunk = h.call_ok(json!({"cmd": 4, "client": client, "req_id": stream}));
        if chunk.is_empty() {
            break;
        }
        collected.extend_from_slice(&chunk);
    }
    assert_eq!(collected, b"round trip");
}

#[test]
fn form_fields_are_urlencoded_and_args_reach_the_query() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {
            "url": h.url("/inspect"), "method": 1,
            "args": {"tag": 7},
            "form": {"a": "1"},
        },
    }));
    let head = head_json(&payload);
    assert_eq!(head["status"], 200);
    let inspected: Value = serde_json::from_slice(&base64_body(&head)).unwrap();
    assert_eq!(inspected["content_type"], "application/x-www-form-urlencoded");
    assert_eq!(inspected["query"], "tag=7");
    assert_eq!(inspected["len"], 3); // "a=1"
}

#[test]
fn close_client_force_closes_its_streams() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/echo"), "method": 1, "body_writer": true},
    }));
    let stream: u64 = String::from_utf8(payload).unwrap().parse().unwrap();

    // The end-of-body reply races with the close; collect it if it comes.
    let end_task = h.send(json!({"cmd": 3, "client": client, "req_id": stream}));
    let _ = h.replies.wait(end_task);

    h.call_ok(json!({"cmd": 1, "client": client}));

    // Every later reference to the closed client fails cleanly.
    let error = h.call_err(json!({"cmd": 4, "client": client, "req_id": stream}));
    assert!(error.contains("unknown client"), "got: {error}");
    let error = h.call_err(json!({"cmd": 1, "client": client}));
    assert!(error.contains("unknown client"), "got: {error}");
}

#[test]
fn trust_file_failure_registers_no_client() {
    let h = Harness::start();
    let error = h.call_err(json!({
        "cmd": 0,
        "client_config": {"ssl_verify": ["/definitely/missing/ca.pem"]},
    }));
    assert!(error.contains("trust file"), "got: {error}");

    // The failed attempt consumed no handle.
    assert_eq!(h.new_client(json!({})), 1);
}

#[test]
fn overload_sheds_past_the_queue_threshold_and_answers_everything() {
    let h = Harness::start();
    let client = h.new_client(json!({"workers": 2}));

    let tasks: Vec<u64> = (0..150)
        .map(|_| {
            h.send(json!({
                "cmd": 2, "client": client,
                "req": {"url": h.url("/slow?ms=30")},
            }))
        })
        .collect();

    for task in tasks {
        let (rc, payload) = h.replies.wait(task);
        assert_eq!(rc, 0);
        let head = head_json(&payload);
        assert_eq!(head["status"], 200);
    }
}

#[test]
fn read_trailer_replies_empty_when_the_response_has_none() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/bytes/10"), "body_reader": true},
    }));
    let stream = head_json(&payload)["req_id"].as_u64().unwrap();

    let trailer = h.call_ok(json!({"cmd": 5, "client": client, "req_id": stream}));
    assert!(trailer.is_empty());
}

#[test]
fn close_request_frees_the_stream() {
    let h = Harness::start();
    let client = h.new_client(json!({}));

    let payload = h.call_ok(json!({
        "cmd": 2, "client": client,
        "req": {"url": h.url("/bytes/10"), "body_reader": true},
    }));
    let stream = head_json(&payload)["req_id"].as_u64().unwrap();

    h.call_ok(json!({"cmd": 6, "client": client, "req_id": stream}));
    let error = h.call_err(json!({"cmd": 4, "client": client, "req_id": stream}));
    assert!(error.contains("unknown stream"), "got: {error}");
}

#[test]
fn undecodable_command_answers_then_terminates_the_engine() {
    let h = Harness::start();
    let task = h.send_raw(b"this is not json".to_vec());
    let (rc, payload) = h.replies.wait(task);
    assert_ne!(rc, 0);
    let json: Value = serde_json::from_slice(&payload).unwrap();
    assert!(json["error"].as_str().unwrap().contains("invalid command"));

    let result = h.shutdown();
    assert!(matches!(result, Err(EngineError::Decode(_))));
}

#[test]
fn clean_shutdown_when_the_command_stream_ends() {
    let h = Harness::start();
    h.new_client(json!({}));
    assert!(h.shutdown().is_ok());
}
