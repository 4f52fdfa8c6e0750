//! Test doubles: a loopback HTTP stub and scripted source/notifier fakes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::discord::{Author, ChannelInfo, GuildInfo, MessageSource, SourceMessage};
use crate::error::SourceError;
use crate::notify::Notifier;
use crate::targets::ChannelTarget;

#[derive(Debug, Clone)]
pub struct StubResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl StubResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    fn render(&self) -> String {
        let mut out = format!("HTTP/1.1 {} Stub\r\n", self.status);
        for (name, value) in &self.headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.body.len(),
            self.body
        ));
        out
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub request_line: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }
}

/// Serves canned responses in order, repeating the last one once exhausted.
pub struct StubServer {
    base: String,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl StubServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub async fn spawn_stub(responses: Vec<StubResponse>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));
    let captured = requests.clone();

    tokio::spawn(async move {
        let mut served = 0usize;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let Some(request) = read_request(&mut stream).await else {
                continue;
            };
            captured.lock().unwrap().push(request);

            let response = responses
                .get(served)
                .or_else(|| responses.last())
                .map(StubResponse::render)
                .unwrap_or_default();
            served += 1;
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    StubServer {
        base: format!("http://{}", addr),
        requests,
    }
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(body_start + content_length);
    let body = String::from_utf8_lossy(&buf[body_start..body_end]).to_string();

    Some(CapturedRequest {
        request_line,
        headers,
        body,
    })
}

pub fn message(id: &str, content: &str) -> SourceMessage {
    SourceMessage {
        id: id.to_string(),
        author: Author {
            id: "42".to_string(),
            username: Some("ferris".to_string()),
            global_name: None,
        },
        content: content.to_string(),
        timestamp: format!("2026-01-01T00:00:{:02}+00:00", id.parse::<u64>().unwrap_or(0) % 60),
        attachments: Vec::new(),
    }
}

/// A message source driven by a script of per-call results.
#[derive(Default)]
pub struct ScriptedSource {
    latest: Mutex<VecDeque<Result<Vec<SourceMessage>, SourceError>>>,
    after: Mutex<VecDeque<Result<Vec<SourceMessage>, SourceError>>>,
    /// `after` argument of every `recent_messages` call.
    calls: Mutex<Vec<Option<String>>>,
    pub by_id: Mutex<Vec<SourceMessage>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result for a baseline lookup (`after == None`).
    pub fn push_latest(&self, result: Result<Vec<SourceMessage>, SourceError>) {
        self.latest.lock().unwrap().push_back(result);
    }

    /// Queue a result for an incremental fetch. Messages are given
    /// newest-first, the way Discord returns them.
    pub fn push_after(&self, result: Result<Vec<SourceMessage>, SourceError>) {
        self.after.lock().unwrap().push_back(result);
    }

    pub fn calls(&self) -> Vec<Option<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn recent_messages(
        &self,
        _channel_id: &str,
        limit: usize,
        after: Option<&str>,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        self.calls.lock().unwrap().push(after.map(str::to_string));
        let queue = if after.is_some() { &self.after } else { &self.latest };
        let next = queue.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(Vec::new())).map(|mut messages| {
            messages.truncate(limit);
            messages
        })
    }

    async fn message(&self, _channel_id: &str, message_id: &str) -> Result<SourceMessage, SourceError> {
        self.by_id
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| SourceError::Http {
                status: reqwest::StatusCode::NOT_FOUND,
                body: "Unknown Message".to_string(),
            })
    }

    async fn channel(&self, channel_id: &str) -> Result<ChannelInfo, SourceError> {
        Ok(ChannelInfo {
            id: channel_id.to_string(),
            name: Some(format!("chan-{}", channel_id)),
            guild_id: None,
        })
    }

    async fn guild(&self, guild_id: &str) -> Result<GuildInfo, SourceError> {
        Ok(GuildInfo {
            id: guild_id.to_string(),
            name: Some(format!("guild-{}", guild_id)),
            icon: Some("a_icon".to_string()),
        })
    }
}

/// Records every notification, in delivery order.
#[derive(Default)]
pub struct RecordingNotifier {
    pub delivered: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn ids(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &SourceMessage, target: &ChannelTarget) {
        self.delivered
            .lock()
            .unwrap()
            .push((target.key(), message.id.clone()));
    }
}
