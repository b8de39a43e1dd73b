//! Bindings for the slide repository API.
//!
//! [`SlideApi`] hands out one handle per remote collection. Handles created
//! from the same `SlideApi` share a cache, so a write through one is seen by
//! every other handle on the same key.
//!
//! ```rust,no_run
//! use slide_sync::api::{SlideApi, SlideUpdate};
//! use slide_sync::config::ClientConfig;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let api = SlideApi::new(&ClientConfig::from_env()?)?;
//!
//! let repositories = api.repositories();
//! repositories.load().await;
//! for repository in repositories.items() {
//!     println!("{} ({} slides)", repository.title, repository.number_of_slides);
//! }
//!
//! let slides = api.slides("r1");
//! slides.load().await;
//! slides
//!     .update_metadata("s1", SlideUpdate::default().title("New Title"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod generate;
mod models;
mod repositories;
mod slides;

use std::sync::Arc;

use crate::config::{ClientConfig, QueryConfig};
use crate::download::{ArtifactDownloader, ArtifactSink};
use crate::error::ConfigError;
use crate::query::QueryClient;
use crate::transport::{HttpTransport, Transport};

pub use generate::PresentationGenerator;
pub use models::{PresentationRequest, Repository, RepositoryUpload, Slide, SlideUpdate, UploadResponse};
pub use repositories::Repositories;
pub use slides::Slides;

/// Entry point for the slide repository API.
#[derive(Clone)]
pub struct SlideApi {
    transport: Arc<dyn Transport>,
    client: QueryClient,
}

impl SlideApi {
    /// Connects to the server described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(config)?;
        Ok(Self::with_transport(Arc::new(transport), config.query))
    }

    /// Uses `transport` for every request.
    #[must_use]
    pub fn with_transport(transport: Arc<dyn Transport>, config: QueryConfig) -> Self {
        Self {
            transport,
            client: QueryClient::with_config(config),
        }
    }

    #[must_use]
    pub const fn client(&self) -> &QueryClient {
        &self.client
    }

    #[must_use]
    pub fn repositories(&self) -> Repositories {
        Repositories::new(self.client.clone(), Arc::clone(&self.transport))
    }

    #[must_use]
    pub fn slides(&self, repository_id: impl Into<String>) -> Slides {
        Slides::new(self.client.clone(), Arc::clone(&self.transport), repository_id.into())
    }

    /// Returns a generator that saves presentations into `sink`.
    #[must_use]
    pub fn generator(&self, sink: Arc<dyn ArtifactSink>) -> PresentationGenerator {
        PresentationGenerator::new(ArtifactDownloader::new(Arc::clone(&self.transport), sink))
    }

    /// Drops all cached data and idle mutation locks, and cancels running fetches.
    pub fn clear(&self) {
        self.client.clear();
    }
}

impl std::fmt::Debug for SlideApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlideApi")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}
