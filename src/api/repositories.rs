use std::sync::Arc;

use futures::FutureExt;
use futures::stream::BoxStream;
use tracing::info;

use crate::error::{MutationError, QueryError};
use crate::key::QueryKey;
use crate::mutation::Mutation;
use crate::query::{Query, QueryClient, QueryResult};
use crate::query_key;
use crate::transport::{Request, Transport, fetch_json};

use super::models::{Repository, RepositoryUpload, UploadResponse};

const LIST_PATH: &str = "/repositories";
const UPLOAD_PATH: &str = "/repository/upload";

/// The repository collection, cached under `["repositories"]`.
#[derive(Clone)]
pub struct Repositories {
    query: Query<Vec<Repository>>,
    transport: Arc<dyn Transport>,
}

impl Repositories {
    pub(crate) fn new(client: QueryClient, transport: Arc<dyn Transport>) -> Self {
        let fetch_transport = Arc::clone(&transport);
        let query = Query::new(Self::key(), client, move || {
            let transport = Arc::clone(&fetch_transport);
            async move { fetch_json(transport.as_ref(), Request::get(LIST_PATH)).await }.boxed()
        });
        Self { query, transport }
    }

    #[must_use]
    pub fn key() -> QueryKey {
        query_key!["repositories"]
    }

    #[must_use]
    pub const fn query(&self) -> &Query<Vec<Repository>> {
        &self.query
    }

    /// Returns the cached state, starting a fetch if one is due.
    #[must_use]
    pub fn state(&self) -> QueryResult<Vec<Repository>> {
        self.query.read()
    }

    /// Cached repositories, empty until the first fetch lands.
    #[must_use]
    pub fn items(&self) -> Vec<Repository> {
        self.state().data.unwrap_or_default()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state().is_loading()
    }

    #[must_use]
    pub fn error(&self) -> Option<QueryError> {
        self.state().error
    }

    /// Waits for the list if nothing is cached yet.
    pub async fn load(&self) -> QueryResult<Vec<Repository>> {
        self.query.fetch().await
    }

    /// Refetches the list.
    ///
    /// # Errors
    ///
    /// Returns the fetch error.
    pub async fn refetch(&self) -> Result<Vec<Repository>, QueryError> {
        self.query.refetch().await
    }

    pub fn watch(&self) -> BoxStream<'static, QueryResult<Vec<Repository>>> {
        self.query.watch()
    }

    /// Uploads a presentation as a new repository.
    ///
    /// The list is not patched ahead of the server; it is invalidated once the
    /// upload settles, so the next read picks up the new repository.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError`] if the upload fails.
    pub async fn upload(&self, upload: RepositoryUpload) -> Result<UploadResponse, MutationError> {
        let transport = Arc::clone(&self.transport);
        let response = Mutation::<Vec<Repository>, UploadResponse>::new(Self::key())
            .execute(self.query.client(), move || async move {
                let request = Request::post(UPLOAD_PATH).multipart(upload.into_form());
                fetch_json(transport.as_ref(), request).await
            })
            .await?;

        info!(
            presentation_id = %response.presentation_id,
            message = %response.message,
            "repository uploaded"
        );
        Ok(response)
    }

    /// Returns `true` while an upload is running.
    #[must_use]
    pub fn is_uploading(&self) -> bool {
        self.query.client().is_mutating(&Self::key())
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::json_response;
    use crate::transport::{MockTransport, RequestBody};
    use serde_json::json;

    fn repositories(mock: &MockTransport) -> Repositories {
        Repositories::new(QueryClient::new(), Arc::new(mock.clone()))
    }

    fn repository(id: &str) -> serde_json::Value {
        json!({
            "id": id,
            "title": format!("Deck {id}"),
            "number_of_slides": 3,
            "created_at": "2024-01-01T00:00:00"
        })
    }

    #[tokio::test]
    async fn test_items_empty_before_first_fetch() {
        let mock = MockTransport::new();
        let _gate = mock.push_gated("GET", LIST_PATH, Ok(json_response(json!([]))));
        let repositories = repositories(&mock);

        assert!(repositories.items().is_empty());
        assert!(repositories.is_loading());
        assert_eq!(repositories.error(), None);
    }

    #[tokio::test]
    async fn test_load_lists_repositories() {
        let mock = MockTransport::new();
        mock.push_json("GET", LIST_PATH, json!([repository("r1"), repository("r2")]));
        let repositories = repositories(&mock);

        let state = repositories.load().await;

        assert!(state.is_success());
        let ids: Vec<_> = repositories.items().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_upload_sends_form_and_invalidates_list() {
        let mock = MockTransport::new();
        mock.push_json("GET", LIST_PATH, json!([repository("r1")]));
        mock.push_json(
            "POST",
            UPLOAD_PATH,
            json!({"message": "ok", "storage_path": "/d.pptx", "presentation_id": 5}),
        );
        let repositories = repositories(&mock);
        repositories.load().await;

        let response = repositories
            .upload(RepositoryUpload::new("Deck", "deck.pptx", vec![0u8; 4]))
            .await
            .unwrap();

        assert_eq!(response.presentation_id, "5");
        assert!(!repositories.is_uploading());
        let upload = mock
            .requests()
            .into_iter()
            .find(|r| r.path == UPLOAD_PATH)
            .unwrap();
        assert!(matches!(upload.body, RequestBody::Multipart(ref parts) if parts.len() == 2));
        let entry = repositories
            .query()
            .client()
            .cache()
            .get::<Vec<Repository>>(&Repositories::key())
            .unwrap();
        assert!(entry.is_invalidated);
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_list() {
        let mock = MockTransport::new();
        mock.push_json("GET", LIST_PATH, json!([repository("r1")]));
        mock.push_status("POST", UPLOAD_PATH, 500);
        let repositories = repositories(&mock);
        repositories.load().await;

        let err = repositories
            .upload(RepositoryUpload::new("Deck", "deck.pptx", vec![1]))
            .await
            .unwrap_err();

        assert_eq!(err.source.status(), Some(500));
        assert_eq!(err.key, Repositories::key());
        let entry = repositories
            .query()
            .client()
            .cache()
            .get::<Vec<Repository>>(&Repositories::key())
            .unwrap();
        assert_eq!(entry.data.map(|d| d.len()), Some(1));
    }
}
