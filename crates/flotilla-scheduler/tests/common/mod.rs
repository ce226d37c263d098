//! In-process fake master for integration tests.
//!
//! Speaks just enough HTTP/1.1 over a raw `TcpListener`: SUBSCRIBE gets a
//! scripted reply (a chunked RecordIO stream by default), every other call
//! is recorded and answered with 202, and `GET /master/redirect` answers
//! according to the configured probe behaviour.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flotilla_core::SchedulerConfig;
use flotilla_scheduler::recordio::encode;
use flotilla_scheduler::{Endpoint, Notification};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// How to answer the next SUBSCRIBE.
#[derive(Debug, Clone)]
pub enum SubscribeReply {
    Stream(String),
    Redirect(String),
    MissingStreamId,
    Status(u16),
}

/// How to answer `GET /master/redirect`.
#[derive(Debug, Clone)]
pub enum ProbeReply {
    Redirect(String),
    NotFound,
    Hang,
}

/// One request as the master saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    /// Lowercased names.
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl Recorded {
    pub fn call_type(&self) -> &str {
        self.body["type"].as_str().unwrap_or_default()
    }
}

/// An open subscription; events written here reach the scheduler.
pub struct Subscription {
    pub request: Recorded,
    stream: TcpStream,
}

impl Subscription {
    pub async fn send(&mut self, event: Value) {
        let record = encode(&serde_json::to_vec(&event).unwrap());
        self.send_raw(&record).await;
    }

    /// Write `bytes` as one HTTP chunk.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let mut chunk = format!("{:x}\r\n", bytes.len()).into_bytes();
        chunk.extend_from_slice(bytes);
        chunk.extend_from_slice(b"\r\n");
        self.stream.write_all(&chunk).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// End the stream cleanly.
    pub async fn close(mut self) {
        let _ = self.stream.write_all(b"0\r\n\r\n").await;
        let _ = self.stream.shutdown().await;
    }
}

struct Shared {
    script: Mutex<VecDeque<SubscribeReply>>,
    probe: Mutex<ProbeReply>,
    subscribes: Mutex<u32>,
}

pub struct FakeMaster {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    calls: mpsc::UnboundedReceiver<Recorded>,
    subscriptions: mpsc::UnboundedReceiver<Subscription>,
}

impl FakeMaster {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            script: Mutex::new(VecDeque::new()),
            probe: Mutex::new(ProbeReply::NotFound),
            subscribes: Mutex::new(0),
        });
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let (subs_tx, subscriptions) = mpsc::unbounded_channel();

        let state = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = state.clone();
                let calls_tx = calls_tx.clone();
                let subs_tx = subs_tx.clone();
                tokio::spawn(async move {
                    serve(stream, state, calls_tx, subs_tx).await;
                });
            }
        });

        Self {
            addr,
            shared,
            calls,
            subscriptions,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.addr.port())
    }

    /// Queue the reply for a future SUBSCRIBE.
    pub fn script(&self, reply: SubscribeReply) {
        self.shared.script.lock().unwrap().push_back(reply);
    }

    pub fn set_probe(&self, reply: ProbeReply) {
        *self.shared.probe.lock().unwrap() = reply;
    }

    pub fn subscribe_count(&self) -> u32 {
        *self.shared.subscribes.lock().unwrap()
    }

    pub async fn next_call(&mut self) -> Recorded {
        tokio::time::timeout(WAIT, self.calls.recv())
            .await
            .expect("timed out waiting for a call")
            .expect("master stopped")
    }

    /// Next call of the given type, skipping others.
    pub async fn next_call_of(&mut self, kind: &str) -> Recorded {
        loop {
            let call = self.next_call().await;
            if call.call_type() == kind {
                return call;
            }
        }
    }

    pub async fn next_subscription(&mut self) -> Subscription {
        tokio::time::timeout(WAIT, self.subscriptions.recv())
            .await
            .expect("timed out waiting for SUBSCRIBE")
            .expect("master stopped")
    }

    /// Whether a subscription arrives within `within`.
    pub async fn subscription_within(&mut self, within: Duration) -> Option<Subscription> {
        tokio::time::timeout(within, self.subscriptions.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn serve(
    mut stream: TcpStream,
    shared: Arc<Shared>,
    calls_tx: mpsc::UnboundedSender<Recorded>,
    subs_tx: mpsc::UnboundedSender<Subscription>,
) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };

    if request.path == "/master/redirect" {
        let probe = shared.probe.lock().unwrap().clone();
        match probe {
            ProbeReply::Redirect(location) => {
                let head = format!(
                    "HTTP/1.1 307 Temporary Redirect\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(head.as_bytes()).await;
            }
            ProbeReply::NotFound => {
                let _ = stream
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
            ProbeReply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
        return;
    }

    if request.call_type() != "SUBSCRIBE" {
        let _ = calls_tx.send(request);
        let _ = stream
            .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await;
        return;
    }

    let n = {
        let mut count = shared.subscribes.lock().unwrap();
        *count += 1;
        *count
    };
    let reply = shared
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| SubscribeReply::Stream(format!("stream-{n}")));

    match reply {
        SubscribeReply::Stream(stream_id) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nMesos-Stream-Id: {stream_id}\r\nTransfer-Encoding: chunked\r\n\r\n"
            );
            if stream.write_all(head.as_bytes()).await.is_ok() {
                let _ = subs_tx.send(Subscription { request, stream });
            }
        }
        SubscribeReply::Redirect(location) => {
            let head = format!(
                "HTTP/1.1 307 Temporary Redirect\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            );
            let _ = stream.write_all(head.as_bytes()).await;
        }
        SubscribeReply::MissingStreamId => {
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
        }
        SubscribeReply::Status(status) => {
            let head = format!(
                "HTTP/1.1 {status} Rejected\r\nContent-Length: 8\r\nConnection: close\r\n\r\nrejected"
            );
            let _ = stream.write_all(head.as_bytes()).await;
        }
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    // Absolute-form targets carry the authority; keep only the path.
    let path = match target.strip_prefix("http://") {
        Some(rest) => rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".to_string()),
        None => target,
    };
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };

    Some(Recorded {
        method,
        path,
        headers,
        body,
    })
}

/// Scheduler config pointing at `master`.
pub fn config(master: &FakeMaster, tasks: &str) -> SchedulerConfig {
    let toml = format!(
        r#"
[framework]
name = "fw"

[master]
host = "127.0.0.1"
port = {port}
idle_timeout = "10s"
request_timeout = "2s"

[scheduler]
serial_numbered_tasks = true

{tasks}
"#,
        port = master.addr.port()
    );
    SchedulerConfig::from_toml_str(&toml).unwrap()
}

pub const WEB_TASK: &str = r#"
[[tasks]]
name = "web"
instances = 1
allow_scaling = true

[tasks.resources]
cpus = 0.2
mem = 128.0
disk = 10.0
ports = 1

[tasks.command]
value = "./serve"
"#;

/// Wait for a notification matching `pred`, skipping the rest.
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    pred: impl Fn(&Notification) -> bool,
) -> Notification {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(n) if pred(&n) => return n,
                Some(_) => continue,
                None => panic!("scheduler stopped"),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

pub fn subscribed_event(framework_id: &str) -> Value {
    serde_json::json!({
        "type": "SUBSCRIBED",
        "subscribed": {
            "framework_id": { "value": framework_id },
            "heartbeat_interval_seconds": 15.0
        }
    })
}

pub fn offers_event(offer_id: &str) -> Value {
    serde_json::json!({
        "type": "OFFERS",
        "offers": { "offers": [{
            "id": { "value": offer_id },
            "agent_id": { "value": "agent-1" },
            "hostname": "node-1",
            "resources": [
                { "name": "cpus", "type": "SCALAR", "scalar": { "value": 1.1 } },
                { "name": "mem", "type": "SCALAR", "scalar": { "value": 256.0 } },
                { "name": "disk", "type": "SCALAR", "scalar": { "value": 1000.0 } },
                { "name": "ports", "type": "RANGES",
                  "ranges": { "range": [{ "begin": 8080, "end": 8090 }] } }
            ]
        }]}
    })
}

pub fn update_event(task_id: &str, state: &str, uuid: Option<&str>) -> Value {
    let mut status = serde_json::json!({
        "task_id": { "value": task_id },
        "state": state,
        "agent_id": { "value": "agent-1" }
    });
    if let Some(uuid) = uuid {
        status["uuid"] = Value::String(uuid.to_string());
    }
    serde_json::json!({ "type": "UPDATE", "update": { "status": status } })
}
