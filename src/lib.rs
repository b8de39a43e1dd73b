//! # slide-sync - optimistic cache synchronization for a slide repository client
//!
//! slide-sync keeps a client-side view of a remote slide repository in step
//! with the server. Reads are served from a shared cache and refreshed in the
//! background; writes show up locally before the server confirms them and are
//! rolled back when it refuses.
//!
//! ## Architecture
//!
//! The crate is built from five parts:
//!
//! 1. **Transport**: typed requests against the remote API
//! 2. **Entity cache**: keyed entries with status, error and freshness
//! 3. **Query coordinator**: deduplicated fetches and stale-while-revalidate reads
//! 4. **Mutation coordinator**: optimistic writes with snapshot rollback
//! 5. **Download handler**: one-shot binary artifacts saved to disk
//!
//! ## Core Components
//!
//! - [`QueryClient`](query::QueryClient): shared cache plus fetch and mutation bookkeeping
//! - [`Query`](query::Query): one remote resource bound to a [`QueryKey`](key::QueryKey)
//! - [`Mutation`](mutation::Mutation): a remote write with an optimistic patch
//! - [`ArtifactDownloader`](download::ArtifactDownloader): saves generated presentations
//! - [`SlideApi`](api::SlideApi): handles for repositories, slides and generation
//!
//! ## Example
//!
//! ```rust
//! use futures::FutureExt;
//! use serde_json::json;
//! use slide_sync::prelude::*;
//! use slide_sync::transport::fetch_json;
//! use std::sync::Arc;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let mock = MockTransport::new();
//! mock.push_json("GET", "/repositories", json!(["Q1 Review"]));
//! let transport: Arc<dyn Transport> = Arc::new(mock);
//!
//! let client = QueryClient::new();
//! let query = Query::new(query_key!["repositories"], client, move || {
//!     let transport = Arc::clone(&transport);
//!     async move { fetch_json::<Vec<String>>(transport.as_ref(), Request::get("/repositories")).await }
//!         .boxed()
//! });
//!
//! let state = query.fetch().await;
//! assert_eq!(state.data(), Some(&vec!["Q1 Review".to_string()]));
//! # });
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod key;
pub mod mutation;
pub mod prelude;
pub mod query;
pub mod transport;
