//! HTTP Receiver
//!
//! One POST endpoint at the node's subpath. Without ask headers the body is
//! a batch of messages that are handed to the local inbox; with ask headers
//! the body is one encoded content and the response is held open until the
//! local handler finishes.
//!
//! `GET <subpath>/health` serves the node health snapshot.
//!
//! Request bodies are read up to a size limit; larger ones are answered
//! with 413 before the rest of the body is buffered.

use crate::protocol::{headers, AskHeaders, TokenVerifier};
use crate::{Result, TransportError};
use async_trait::async_trait;
use codec::ContentEncoding;
use hyper::body::HttpBody;
use hyper::header::HeaderValue;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::ActorMessage;

/// Body limit used unless `with_max_body_size` overrides it
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Local side the receiver hands inbound messages to
#[async_trait]
pub trait InboxHandler: Send + Sync + 'static {
    /// Accept a batch of fire-and-forget messages
    async fn deliver(&self, messages: Vec<ActorMessage>) -> anyhow::Result<()>;

    /// Run an ask to completion, `None` when the handler returned nothing
    async fn ask(&self, message: ActorMessage) -> anyhow::Result<Option<Vec<u8>>>;

    /// Health snapshot served on `GET <subpath>/health`
    fn health(&self) -> serde_json::Value;
}

/// HTTP server side of the transport
pub struct HttpReceiver {
    addr: SocketAddr,
    subpath: String,
    verifier: TokenVerifier,
    content_encoding: ContentEncoding,
    max_body_size: usize,
    handler: Arc<dyn InboxHandler>,
}

struct ReceiverContext {
    subpath: String,
    health_path: String,
    verifier: TokenVerifier,
    content_encoding: ContentEncoding,
    max_body_size: usize,
    handler: Arc<dyn InboxHandler>,
}

impl HttpReceiver {
    pub fn new(
        addr: SocketAddr,
        subpath: impl Into<String>,
        token: Option<String>,
        content_encoding: ContentEncoding,
        handler: Arc<dyn InboxHandler>,
    ) -> Self {
        Self {
            addr,
            subpath: normalize_subpath(&subpath.into()),
            verifier: TokenVerifier::new(token),
            content_encoding,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            handler,
        }
    }

    /// Largest request body accepted, in bytes
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Bind and serve until `shutdown` resolves. Returns the bound address,
    /// which differs from the configured one when port 0 was requested.
    pub async fn start<F>(self, shutdown: F) -> Result<(SocketAddr, JoinHandle<()>)>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let context = Arc::new(ReceiverContext {
            health_path: format!("{}/health", self.subpath.trim_end_matches('/')),
            subpath: self.subpath,
            verifier: self.verifier,
            content_encoding: self.content_encoding,
            max_body_size: self.max_body_size,
            handler: self.handler,
        });

        let make_svc = make_service_fn(move |_conn| {
            let context = Arc::clone(&context);
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let context = Arc::clone(&context);
                    handle_request(req, context)
                }))
            }
        });

        let server = Server::try_bind(&self.addr)?.serve(make_svc);
        let local_addr = server.local_addr();
        info!("Actor receiver listening on http://{}", local_addr);

        let handle = tokio::spawn(async move {
            if let Err(e) = server.with_graceful_shutdown(shutdown).await {
                error!("Actor receiver error: {}", e);
            }
            info!("Actor receiver stopped");
        });
        Ok((local_addr, handle))
    }
}

fn normalize_subpath(subpath: &str) -> String {
    let trimmed = subpath.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn error_status(error: &TransportError) -> StatusCode {
    match error {
        TransportError::Security { .. } => StatusCode::UNAUTHORIZED,
        TransportError::Codec { .. } | TransportError::Protocol { .. } => StatusCode::BAD_REQUEST,
        TransportError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_request(
    req: Request<Body>,
    context: Arc<ReceiverContext>,
) -> std::result::Result<Response<Body>, Infallible> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };

    let response = if path == context.health_path {
        if req.method() != Method::GET {
            respond(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        } else {
            handle_health(&req, &context)
        }
    } else if path == context.subpath {
        if req.method() != Method::POST {
            respond(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        } else {
            match handle_post(req, &context).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(category = e.category(), error = %e, "Rejected inbound request");
                    respond(error_status(&e), e.to_string())
                }
            }
        }
    } else {
        respond(StatusCode::NOT_FOUND, "Not found")
    };
    Ok(response)
}

fn header<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn handle_health(req: &Request<Body>, context: &ReceiverContext) -> Response<Body> {
    if let Err(e) = context.verifier.verify(header(req, headers::TOKEN)) {
        return respond(error_status(&e), e.to_string());
    }
    let body = serde_json::to_vec_pretty(&context.handler.health()).unwrap_or_default();
    let mut response = respond(StatusCode::OK, body);
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

async fn handle_post(req: Request<Body>, context: &ReceiverContext) -> Result<Response<Body>> {
    context.verifier.verify(header(&req, headers::TOKEN))?;
    let codec = ContentEncoding::from_header(header(&req, headers::CONTENT_ENCODING))?;
    let ask = AskHeaders::parse(|name| header(&req, name))?;
    let body = read_body(req.into_body(), context.max_body_size).await?;

    match ask {
        Some(ask) => {
            let content = codec::decode_payload(&body, codec)?;
            let message = ask.into_message(content);
            debug!(message_id = %message.id, dst = %message.dst, "Received ask");
            match context.handler.ask(message).await {
                Ok(Some(result)) => {
                    let body = codec::encode_payload(&result, context.content_encoding)?;
                    let mut response = respond(StatusCode::OK, body);
                    response.headers_mut().insert(
                        headers::CONTENT_ENCODING,
                        HeaderValue::from_static(context.content_encoding.as_str()),
                    );
                    Ok(response)
                }
                Ok(None) => Ok(respond(StatusCode::NO_CONTENT, Body::empty())),
                Err(e) => {
                    warn!(error = %e, "Ask failed");
                    Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
                }
            }
        }
        None => {
            let messages = codec::batch_decode(&body, codec)?;
            debug!(count = messages.len(), "Received message batch");
            context
                .handler
                .deliver(messages)
                .await
                .map_err(|e| TransportError::system(format!("{:#}", e)))?;
            Ok(respond(StatusCode::NO_CONTENT, Body::empty()))
        }
    }
}

/// Buffer `body`, failing as soon as it is known to exceed `limit`
async fn read_body(mut body: Body, limit: usize) -> Result<Vec<u8>> {
    if body.size_hint().lower() > limit as u64 {
        return Err(TransportError::payload_too_large(limit));
    }
    let mut buf = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(TransportError::payload_too_large(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_subpath() {
        assert_eq!(normalize_subpath("/api/actor/"), "/api/actor");
        assert_eq!(normalize_subpath("api"), "/api");
        assert_eq!(normalize_subpath(""), "/");
        assert_eq!(normalize_subpath("/"), "/");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&TransportError::security("bad token")),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            error_status(&codec::CodecError::unsupported("xml").into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&TransportError::payload_too_large(16)),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            error_status(&TransportError::system("down")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_read_body_limit() {
        let body = read_body(Body::from(vec![7u8; 16]), 16).await.unwrap();
        assert_eq!(body.len(), 16);

        let err = read_body(Body::from(vec![7u8; 17]), 16).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge { limit: 16 }));

        // streamed bodies carry no length up front
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(vec![1u8; 10]), Ok(vec![2u8; 10])];
        let streamed = Body::wrap_stream(futures::stream::iter(chunks));
        let err = read_body(streamed, 16).await.unwrap_err();
        assert_eq!(err.category(), "payload_too_large");
    }
}
