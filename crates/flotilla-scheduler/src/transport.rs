//! HTTP/1.1 exchanges with the master.
//!
//! Every request opens its own connection (hyper `conn::http1` over a
//! tokio `TcpStream`), so the long-lived subscription and the short action
//! calls never share a socket. Timeouts are applied by the caller.

use std::fmt;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HOST, LOCATION, USER_AGENT};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};

/// Session token header returned on SUBSCRIBE and echoed on every call.
pub const STREAM_ID_HEADER: &str = "Mesos-Stream-Id";
/// Master endpoint answering with a redirect to the current leader.
pub const REDIRECT_PATH: &str = "/master/redirect";

const USER_AGENT_VALUE: &str = concat!("flotilla/", env!("CARGO_PKG_VERSION"));

/// A master address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, falling back to `default_port` when no port is
    /// given.
    pub fn parse(address: &str, default_port: u16) -> Option<Self> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().ok()?;
                Some(Self::new(host, port))
            }
            Some(_) => None,
            None => Some(Self::new(address, default_port)),
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Extract the target of a redirect. The master sends `//host:port/path`;
/// absolute `http://` locations are accepted too.
pub fn parse_location(location: &str, default_port: u16) -> Option<Endpoint> {
    let rest = location
        .strip_prefix("http:")
        .or_else(|| location.strip_prefix("https:"))
        .unwrap_or(location);
    let rest = rest.strip_prefix("//")?;
    let authority = rest.split('/').next().unwrap_or_default();
    Endpoint::parse(authority, default_port)
}

/// How the master answered SUBSCRIBE.
#[derive(Debug)]
pub enum SubscribeOutcome {
    /// 200 with a session token; `body` is the event stream.
    Stream { stream_id: String, body: Incoming },
    /// 307 to another master.
    Redirect(Endpoint),
    /// 200 without a session token.
    MissingStreamId,
    /// Any other status.
    Rejected { status: u16, body: String },
}

async fn connect(endpoint: &Endpoint) -> SchedulerResult<SendRequest<Full<Bytes>>> {
    let stream = tokio::net::TcpStream::connect(endpoint.authority())
        .await
        .map_err(|e| SchedulerError::Transport(format!("connect {endpoint}: {e}")))?;
    let io = TokioIo::new(stream);
    let (sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| SchedulerError::Transport(format!("handshake with {endpoint}: {e}")))?;

    // Drive the connection in the background.
    let peer = endpoint.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(endpoint = %peer, error = %e, "connection closed with error");
        }
    });
    Ok(sender)
}

fn request(
    method: Method,
    endpoint: &Endpoint,
    path: &str,
    stream_id: Option<&str>,
    body: Vec<u8>,
) -> SchedulerResult<Request<Full<Bytes>>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, endpoint.authority())
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(ACCEPT, "application/json");
    if !body.is_empty() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    if let Some(stream_id) = stream_id {
        builder = builder.header(STREAM_ID_HEADER, stream_id);
    }
    builder
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| SchedulerError::Transport(format!("building request: {e}")))
}

async fn read_body(body: Incoming) -> String {
    match body.collect().await {
        Ok(collected) => String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
        Err(e) => format!("<unreadable body: {e}>"),
    }
}

/// Open the subscription.
pub async fn subscribe(
    endpoint: &Endpoint,
    path: &str,
    body: Vec<u8>,
) -> SchedulerResult<SubscribeOutcome> {
    let mut sender = connect(endpoint).await?;
    let req = request(Method::POST, endpoint, path, None, body)?;
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| SchedulerError::Transport(format!("SUBSCRIBE to {endpoint}: {e}")))?;

    let status = resp.status();
    match status {
        StatusCode::OK => {
            let stream_id = resp
                .headers()
                .get(STREAM_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            match stream_id {
                Some(stream_id) => Ok(SubscribeOutcome::Stream {
                    stream_id,
                    body: resp.into_body(),
                }),
                None => Ok(SubscribeOutcome::MissingStreamId),
            }
        }
        StatusCode::TEMPORARY_REDIRECT => {
            let target = resp
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| parse_location(location, endpoint.port));
            match target {
                Some(target) => Ok(SubscribeOutcome::Redirect(target)),
                None => Ok(SubscribeOutcome::Rejected {
                    status: status.as_u16(),
                    body: "redirect without a usable Location header".to_string(),
                }),
            }
        }
        _ => Ok(SubscribeOutcome::Rejected {
            status: status.as_u16(),
            body: read_body(resp.into_body()).await,
        }),
    }
}

/// Send one action call; returns the status and response body.
pub async fn call(
    endpoint: &Endpoint,
    path: &str,
    stream_id: Option<&str>,
    body: Vec<u8>,
) -> SchedulerResult<(u16, String)> {
    let mut sender = connect(endpoint).await?;
    let req = request(Method::POST, endpoint, path, stream_id, body)?;
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| SchedulerError::Transport(format!("call to {endpoint}: {e}")))?;
    let status = resp.status().as_u16();
    let body = read_body(resp.into_body()).await;
    Ok((status, body))
}

/// Ask `endpoint` where the leader is. `Some` when it answered with a
/// redirect, `None` for any other response.
pub async fn probe_redirect(endpoint: &Endpoint) -> SchedulerResult<Option<Endpoint>> {
    let mut sender = connect(endpoint).await?;
    let req = request(Method::GET, endpoint, REDIRECT_PATH, None, Vec::new())?;
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| SchedulerError::Transport(format!("probe of {endpoint}: {e}")))?;
    if resp.status() != StatusCode::TEMPORARY_REDIRECT {
        debug!(%endpoint, status = %resp.status(), "probe answered without redirect");
        return Ok(None);
    }
    Ok(resp
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|location| parse_location(location, endpoint.port)))
}
