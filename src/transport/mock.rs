//! Scripted transport for testing.
//!
//! [`MockTransport`] answers requests from per-route reply queues, records every
//! request it sees, and can hold a reply back until the test releases it. This
//! makes it possible to observe cache state while a request is still in flight.
//!
//! ```
//! use slide_sync::transport::{MockTransport, Request, Transport};
//! use serde_json::json;
//!
//! # tokio_test_block_on(async {
//! let mock = MockTransport::new();
//! mock.push_json("GET", "/repositories", json!([]));
//!
//! let response = mock.send(Request::get("/repositories")).await.unwrap();
//! assert_eq!(response.status, 200);
//! assert_eq!(mock.request_count("GET", "/repositories"), 1);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;

use crate::error::TransportError;

use super::{Request, Response, Transport};

type Reply = Result<Response, TransportError>;

struct Scripted {
    reply: Reply,
    gate: Option<oneshot::Receiver<()>>,
}

/// Releases a held reply when dropped or when [`Gate::open`] is called.
#[derive(Debug)]
pub struct Gate(Option<oneshot::Sender<()>>);

impl Gate {
    /// Lets the held reply resolve.
    pub fn open(mut self) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(());
        }
    }
}

/// A transport that replays scripted replies.
///
/// Cloning shares the same scripts and request log.
#[derive(Clone, Default)]
pub struct MockTransport {
    routes: Arc<DashMap<(String, String), VecDeque<Scripted>>>,
    log: Arc<Mutex<Vec<Request>>>,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply for the next request to `method path`.
    pub fn push(&self, method: &str, path: &str, reply: Reply) {
        self.enqueue(method, path, reply, None);
    }

    /// Queues a 200 JSON reply.
    ///
    /// # Panics
    ///
    /// Panics if `value` cannot be serialized to JSON.
    pub fn push_json(&self, method: &str, path: &str, value: impl Serialize) {
        self.push(method, path, Ok(json_response(value)));
    }

    /// Queues a non-success status reply with a JSON error body.
    pub fn push_status(&self, method: &str, path: &str, status: u16) {
        self.push(
            method,
            path,
            Err(TransportError::Status {
                status,
                body: Some(json!({ "detail": format!("HTTP {status}") })),
            }),
        );
    }

    /// Queues a reply that stays pending until the returned [`Gate`] is opened.
    #[must_use]
    pub fn push_gated(&self, method: &str, path: &str, reply: Reply) -> Gate {
        let (tx, rx) = oneshot::channel();
        self.enqueue(method, path, reply, Some(rx));
        Gate(Some(tx))
    }

    /// Returns every request sent so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<Request> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns how many requests were sent to `method path`.
    #[must_use]
    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.method.as_str() == method && r.path == path)
            .count()
    }

    fn enqueue(&self, method: &str, path: &str, reply: Reply, gate: Option<oneshot::Receiver<()>>) {
        self.routes
            .entry((method.to_owned(), path.to_owned()))
            .or_default()
            .push_back(Scripted { reply, gate });
    }
}

impl Transport for MockTransport {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        let route = (request.method.as_str().to_owned(), request.path.clone());
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let scripted = self
            .routes
            .get_mut(&route)
            .and_then(|mut queue| queue.pop_front());

        Box::pin(async move {
            let Some(Scripted { reply, gate }) = scripted else {
                return Err(TransportError::Status {
                    status: 404,
                    body: Some(json!({ "detail": format!("no reply scripted for {} {}", route.0, route.1) })),
                });
            };
            if let Some(gate) = gate {
                // A dropped gate also releases the reply.
                let _ = gate.await;
            }
            reply
        })
    }
}

/// Builds a 200 response with a JSON body.
///
/// # Panics
///
/// Panics if `value` cannot be serialized to JSON.
pub fn json_response(value: impl Serialize) -> Response {
    let body = serde_json::to_vec(&value).expect("mock reply must serialize");
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Response::new(200, headers, body)
}

/// Builds a 200 response with a binary body and the given headers.
#[must_use]
pub fn blob_response(body: impl Into<Bytes>, headers: &[(&'static str, &str)]) -> Response {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            map.insert(*name, value);
        }
    }
    Response::new(200, map, body)
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}
