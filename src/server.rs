//! HTTP/1 front server relaying client GETs through [`RangeRelay`]
//!
//! Each request runs its relay session on its own task. The session writes
//! into a [`ChannelSink`]; the response head is handed over through a
//! oneshot channel and the body streams through an mpsc channel, so bytes
//! reach the client while later fetches are still pending.

use crate::error::{RelayError, Result};
use crate::relay::{ClientRequest, ClientSink, RangeRelay, RelayOutcome};
use crate::response_composer::OutwardHead;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use http::Method;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type RelayBody = BoxBody<Bytes, Infallible>;

/// Body chunks buffered between the session and the connection
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Front server
pub struct RelayServer {
    relay: Arc<RangeRelay>,
    addr: SocketAddr,
}

impl RelayServer {
    pub fn new(relay: Arc<RangeRelay>, addr: SocketAddr) -> Self {
        Self { relay, addr }
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Range relay listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let relay = Arc::clone(&self.relay);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| handle_request(Arc::clone(&relay), req));
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection from {} ended with error: {:?}", peer, err);
                }
            });
        }
    }
}

async fn handle_request(
    relay: Arc<RangeRelay>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<RelayBody>, Infallible> {
    if req.uri().path() == "/health" {
        return Ok(full_response(
            StatusCode::OK,
            Some("application/json"),
            r#"{"status":"healthy"}"#,
        ));
    }

    if req.method() != Method::GET {
        return Ok(full_response(StatusCode::METHOD_NOT_ALLOWED, Some("text/plain"), "Method not allowed"));
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let range = req.headers().get(RANGE).and_then(|v| v.to_str().ok());
    let client_request = ClientRequest::new(path, range);

    info!("GET {} range={:?}", client_request.path, client_request.range);

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    let mut sink = ChannelSink {
        head_tx: Some(head_tx),
        body_tx: Some(body_tx),
    };

    let session = tokio::spawn(async move { relay.handle(&client_request, &mut sink).await });

    match head_rx.await {
        Ok(head) => Ok(streaming_response(head, body_rx)),
        Err(_) => {
            // The session ended without producing a head
            let status = match session.await {
                Ok(Ok(RelayOutcome::Declined)) => StatusCode::NOT_FOUND,
                Ok(Ok(RelayOutcome::Served(summary))) => summary.status,
                Ok(Err(e)) => StatusCode::from_u16(e.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                Err(join_error) => {
                    error!("Relay session panicked: {}", join_error);
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            Ok(full_response(status, None, ""))
        }
    }
}

fn streaming_response(head: OutwardHead, body_rx: mpsc::Receiver<Bytes>) -> Response<RelayBody> {
    let mut response = Response::new(ChannelBody { rx: body_rx }.boxed());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

fn full_response(status: StatusCode, content_type: Option<&'static str>, body: &'static str) -> Response<RelayBody> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())).boxed());
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    response
}

/// Client sink writing into the response channels
pub struct ChannelSink {
    head_tx: Option<oneshot::Sender<OutwardHead>>,
    body_tx: Option<mpsc::Sender<Bytes>>,
}

#[async_trait]
impl ClientSink for ChannelSink {
    async fn send_head(&mut self, head: OutwardHead) -> Result<()> {
        let head_tx = self
            .head_tx
            .take()
            .ok_or_else(|| RelayError::InternalError("response head sent twice".to_string()))?;
        head_tx
            .send(head)
            .map_err(|_| RelayError::IoError("client went away before the response head".to_string()))
    }

    async fn send_body(&mut self, chunk: Bytes) -> Result<()> {
        let body_tx = self
            .body_tx
            .as_ref()
            .ok_or_else(|| RelayError::InternalError("body sent after finish".to_string()))?;
        body_tx.send(chunk).await.map_err(|_| {
            warn!("Client disconnected mid-body");
            RelayError::IoError("client disconnected".to_string())
        })
    }

    async fn finish(&mut self) -> Result<()> {
        self.body_tx = None;
        Ok(())
    }
}

/// Response body fed by the relay session
struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(|chunk| Ok(Frame::data(chunk))))
    }
}
