//! Prelude module for convenient imports.
//!
//! ```
//! use slide_sync::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`], [`Query`] and [`QueryResult`] - reading remote data
//! - [`Mutation`] - optimistic writes
//! - [`EntityCache`], [`CacheEntry`] and [`Status`] - the shared cache
//! - [`QueryKey`] and [`query_key!`](crate::query_key) - cache keys
//! - [`Transport`], [`Request`] and the bundled transports
//! - The error types

pub use crate::api::SlideApi;
pub use crate::cache::{CacheEntry, EntityCache, Status};
pub use crate::config::{ClientConfig, QueryConfig};
pub use crate::download::{Artifact, ArtifactDownloader, ArtifactSink, DirectorySink};
pub use crate::error::{DownloadError, MutationError, QueryError, TransportError};
pub use crate::key::QueryKey;
pub use crate::mutation::Mutation;
pub use crate::query::{Query, QueryClient, QueryResult};
pub use crate::query_key;
pub use crate::transport::{HttpTransport, MockTransport, Request, Transport};
