//! Shared helpers for relay integration tests: a scripted in-memory backend
//! and a sink recording everything sent to the client.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use range_relay::{
    Backend, BufferedBody, ClientSink, FetchRequest, FetchResponse, FetchResponseHead, OutwardHead, RelayError,
    Result,
};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Deterministic resource content
pub fn resource(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// One scripted backend reply
pub struct Reply {
    head: Option<FetchResponseHead>,
    chunks: Vec<Bytes>,
    interrupted: bool,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Reply {
            head: Some(FetchResponseHead::new(
                StatusCode::from_u16(status).expect("valid status"),
            )),
            chunks: Vec::new(),
            interrupted: false,
        }
    }

    /// The fetch fails before any response arrives
    pub fn transport_error() -> Self {
        Reply {
            head: None,
            chunks: Vec::new(),
            interrupted: false,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.head = self.head.map(|head| head.with_header(name, value));
        self
    }

    pub fn origin(mut self, origin: &str) -> Self {
        self.head = self.head.map(|head| head.with_origin(origin));
        self
    }

    pub fn body(mut self, data: &[u8]) -> Self {
        self.chunks.push(Bytes::copy_from_slice(data));
        self
    }

    /// The body stream fails after the scripted chunks
    pub fn interrupted(mut self) -> Self {
        self.interrupted = true;
        self
    }
}

/// Backend answering fetches from a script, recording every request
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Reply>) -> Self {
        ScriptedBackend {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn ranges(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.range).collect()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RelayError::HttpError("no scripted reply left".to_string()))?;

        let head = reply
            .head
            .ok_or_else(|| RelayError::HttpError("connection refused".to_string()))?;

        let body = if reply.interrupted {
            BufferedBody::interrupted(reply.chunks, RelayError::HttpError("connection reset".to_string()))
        } else {
            BufferedBody::new(reply.chunks)
        };

        Ok(FetchResponse::new(head, body))
    }
}

/// Sink recording what the client would receive
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub heads: Vec<OutwardHead>,
    pub body: Vec<u8>,
    pub finished: bool,
}

impl RecordingSink {
    pub fn status(&self) -> Option<StatusCode> {
        self.heads.first().map(|head| head.status)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.heads
            .first()
            .and_then(|head| head.headers.get(name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    async fn send_head(&mut self, head: OutwardHead) -> Result<()> {
        self.heads.push(head);
        Ok(())
    }

    async fn send_body(&mut self, chunk: Bytes) -> Result<()> {
        self.body.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
