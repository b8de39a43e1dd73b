//! Transport client: typed requests against the remote API.
//!
//! The [`Transport`] trait is the seam between the coordinators and the network.
//! [`HttpTransport`](http::HttpTransport) talks to a real server through reqwest;
//! [`MockTransport`](mock::MockTransport) replays scripted responses in tests.
//!
//! A transport never touches the entity cache. It turns a [`Request`] into either
//! a [`Response`] (2xx) or a [`TransportError`].

pub mod http;
pub mod mock;

use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{DecodeError, QueryError, TransportError};

pub use http::HttpTransport;
pub use mock::MockTransport;

/// How the caller wants the success body handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    /// Structured JSON data.
    #[default]
    Json,
    /// Raw binary payload; callers read response headers alongside it.
    Blob,
}

/// One part of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        bytes: Bytes,
    },
}

/// Request payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

/// A request relative to the transport's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    pub response_kind: ResponseKind,
}

impl Request {
    /// Creates a request with no body expecting a JSON response.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            response_kind: ResponseKind::Json,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attaches a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    /// Attaches a multipart form body.
    #[must_use]
    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    /// Asks for the raw binary payload instead of JSON.
    #[must_use]
    pub const fn blob(mut self) -> Self {
        self.response_kind = ResponseKind::Blob;
        self
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(status: u16, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Decodes the body as JSON of the expected shape.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the media type of the body without parameters.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }
}

/// Issues requests against the remote API.
pub trait Transport: Send + Sync {
    /// Sends the request and resolves with the 2xx response or a transport error.
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>>;
}

/// Sends `request` and decodes the success body as `T`.
///
/// # Errors
///
/// Returns [`QueryError::Transport`] for network or status failures and
/// [`QueryError::Decode`] for a malformed success body.
pub async fn fetch_json<T>(transport: &dyn Transport, request: Request) -> Result<T, QueryError>
where
    T: DeserializeOwned,
{
    let response = transport.send(request).await?;
    Ok(response.json()?)
}
