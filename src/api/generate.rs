use tracing::debug;

use crate::download::{Artifact, ArtifactDownloader};
use crate::error::{DecodeError, DownloadError, QueryError};
use crate::transport::Request;

use super::models::PresentationRequest;

const GENERATE_PATH: &str = "/completions/generate-presentation";

/// Requests generated presentations and saves them as files.
///
/// Generation never touches the entity cache.
#[derive(Debug, Clone)]
pub struct PresentationGenerator {
    downloader: ArtifactDownloader,
}

impl PresentationGenerator {
    #[must_use]
    pub const fn new(downloader: ArtifactDownloader) -> Self {
        Self { downloader }
    }

    /// Generates a presentation from `input` and saves it.
    ///
    /// The file is named by the server's `Content-Disposition` header, or
    /// after `input.title` when the header is missing.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if the request fails, the server does not
    /// answer with a presentation, or the file cannot be written.
    pub async fn generate(&self, input: &PresentationRequest) -> Result<Artifact, DownloadError> {
        let body = serde_json::to_value(input).map_err(|e| QueryError::from(DecodeError::from(e)))?;
        debug!(title = %input.title, "generating presentation");
        self.downloader
            .download(Request::post(GENERATE_PATH).json(body).blob(), &input.title)
            .await
    }

    /// Returns `true` while a generation request is running.
    #[must_use]
    pub fn is_generating(&self) -> bool {
        self.downloader.is_downloading()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DirectorySink, PPTX_CONTENT_TYPE};
    use crate::transport::mock::blob_response;
    use crate::transport::{MockTransport, RequestBody};
    use std::sync::Arc;

    fn request() -> PresentationRequest {
        PresentationRequest {
            title: "Q1 Deck".to_string(),
            client_name: "Acme".to_string(),
            industry: "Retail".to_string(),
            description: "Quarterly review".to_string(),
            target_audience: "Executives".to_string(),
            key_messages: vec!["growth".to_string()],
            num_slides: Some(8),
            ..PresentationRequest::default()
        }
    }

    #[tokio::test]
    async fn test_generate_posts_input_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        let gate = mock.push_gated(
            "POST",
            GENERATE_PATH,
            Ok(blob_response(vec![7; 16], &[("content-type", PPTX_CONTENT_TYPE)])),
        );
        let generator = PresentationGenerator::new(ArtifactDownloader::new(
            Arc::new(mock.clone()),
            Arc::new(DirectorySink::new(dir.path())),
        ));

        let task = tokio::spawn({
            let generator = generator.clone();
            async move { generator.generate(&request()).await }
        });
        tokio::task::yield_now().await;
        assert!(generator.is_generating());

        gate.open();
        let artifact = task.await.unwrap().unwrap();
        assert_eq!(artifact.filename, "Q1_Deck.pptx");
        assert_eq!(artifact.size, 16);
        assert!(!generator.is_generating());

        let sent = &mock.requests()[0];
        let RequestBody::Json(body) = &sent.body else {
            panic!("expected a JSON body");
        };
        assert_eq!(body["client_name"], "Acme");
        assert_eq!(body["num_slides"], 8);
    }
}
