use std::sync::Arc;

use futures::FutureExt;
use futures::stream::BoxStream;

use crate::error::{DecodeError, MutationError, QueryError};
use crate::key::QueryKey;
use crate::mutation::Mutation;
use crate::query::{Query, QueryClient, QueryResult};
use crate::query_key;
use crate::transport::{Request, Transport, fetch_json};

use super::models::{Slide, SlideUpdate};

/// The slides of one repository, cached under `["slides", repository_id]`.
#[derive(Clone)]
pub struct Slides {
    repository_id: String,
    query: Query<Vec<Slide>>,
    transport: Arc<dyn Transport>,
}

impl Slides {
    pub(crate) fn new(client: QueryClient, transport: Arc<dyn Transport>, repository_id: String) -> Self {
        let fetch_transport = Arc::clone(&transport);
        let path = format!("/slides/{}", urlencoding::encode(&repository_id));
        let query = Query::new(Self::key(&repository_id), client, move || {
            let transport = Arc::clone(&fetch_transport);
            let request = Request::get(path.clone());
            async move { fetch_json(transport.as_ref(), request).await }.boxed()
        });
        Self {
            repository_id,
            query,
            transport,
        }
    }

    #[must_use]
    pub fn key(repository_id: &str) -> QueryKey {
        query_key!["slides", repository_id]
    }

    #[must_use]
    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    #[must_use]
    pub const fn query(&self) -> &Query<Vec<Slide>> {
        &self.query
    }

    #[must_use]
    pub fn state(&self) -> QueryResult<Vec<Slide>> {
        self.query.read()
    }

    #[must_use]
    pub fn items(&self) -> Vec<Slide> {
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

    pub async fn load(&self) -> QueryResult<Vec<Slide>> {
        self.query.fetch().await
    }

    /// # Errors
    ///
    /// Returns the fetch error.
    pub async fn refetch(&self) -> Result<Vec<Slide>, QueryError> {
        self.query.refetch().await
    }

    pub fn watch(&self) -> BoxStream<'static, QueryResult<Vec<Slide>>> {
        self.query.watch()
    }

    /// Updates one slide's metadata.
    ///
    /// The cached slide shows the new values immediately. They are reverted if
    /// the server rejects the update, and the list is refetched either way.
    ///
    /// # Errors
    ///
    /// Returns [`MutationError`] if the update fails.
    pub async fn update_metadata(&self, slide_id: &str, update: SlideUpdate) -> Result<Slide, MutationError> {
        let transport = Arc::clone(&self.transport);
        let target = slide_id.to_string();
        let patch = update.clone();
        let path = format!("/slides/metadata/{}", urlencoding::encode(slide_id));
        let _pending = self.query.client().begin_mutation(&self.slide_key(slide_id));

        Mutation::<Vec<Slide>, Slide>::new(self.query.key().clone())
            .optimistic(move |slides| {
                slides.map(|slides| {
                    slides
                        .iter()
                        .cloned()
                        .map(|mut slide| {
                            if slide.id == target {
                                patch.apply_to(&mut slide);
                            }
                            slide
                        })
                        .collect()
                })
            })
            .execute(self.query.client(), move || async move {
                let body = serde_json::to_value(&update).map_err(DecodeError::from)?;
                fetch_json(transport.as_ref(), Request::put(path).json(body)).await
            })
            .await
    }

    /// Returns `true` while a metadata update for this repository is running.
    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.query.client().is_mutating(self.query.key())
    }

    /// Returns `true` while an update to `slide_id` is running or queued.
    #[must_use]
    pub fn is_updating_slide(&self, slide_id: &str) -> bool {
        self.query.client().is_mutating(&self.slide_key(slide_id))
    }

    fn slide_key(&self, slide_id: &str) -> QueryKey {
        self.query.key().clone().with(slide_id)
    }
}

impl std::fmt::Debug for Slides {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slides")
            .field("repository_id", &self.repository_id)
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use crate::transport::mock::json_response;
    use crate::transport::RequestBody;
    use serde_json::json;

    fn slides(mock: &MockTransport) -> Slides {
        Slides::new(QueryClient::new(), Arc::new(mock.clone()), "r1".to_string())
    }

    fn titles(slides: &Slides) -> Vec<Option<String>> {
        slides.items().into_iter().map(|s| s.title).collect()
    }

    #[tokio::test]
    async fn test_key_per_repository() {
        assert_eq!(Slides::key("r1"), query_key!["slides", "r1"]);
        assert_ne!(Slides::key("r1"), Slides::key("r2"));
    }

    #[tokio::test]
    async fn test_ids_are_encoded_in_paths() {
        let mock = MockTransport::new();
        mock.push_json("GET", "/slides/team%2Fq1%20deck", json!([{"id": "a/1?x"}]));
        mock.push_json("PUT", "/slides/metadata/a%2F1%3Fx", json!({"id": "a/1?x", "title": "T"}));
        let slides = Slides::new(
            QueryClient::new(),
            Arc::new(mock.clone()),
            "team/q1 deck".to_string(),
        );

        let state = slides.load().await;
        assert!(state.is_success());
        slides
            .update_metadata("a/1?x", SlideUpdate::default().title("T"))
            .await
            .unwrap();

        assert_eq!(mock.request_count("GET", "/slides/team%2Fq1%20deck"), 1);
        assert_eq!(mock.request_count("PUT", "/slides/metadata/a%2F1%3Fx"), 1);
        // The cache key keeps the raw id.
        assert_eq!(slides.query().key(), &Slides::key("team/q1 deck"));
    }

    #[tokio::test]
    async fn test_update_patches_only_target_slide() {
        let mock = MockTransport::new();
        mock.push_json(
            "GET",
            "/slides/r1",
            json!([{"id": "s1", "title": "Old"}, {"id": "s2", "title": "Other"}]),
        );
        let gate = mock.push_gated(
            "PUT",
            "/slides/metadata/s1",
            Ok(json_response(json!({"id": "s1", "title": "New Title"}))),
        );
        let slides = slides(&mock);
        slides.load().await;

        let task = tokio::spawn({
            let slides = slides.clone();
            async move {
                slides
                    .update_metadata("s1", SlideUpdate::default().title("New Title"))
                    .await
            }
        });
        tokio::task::yield_now().await;

        assert!(slides.is_updating());
        assert!(slides.is_updating_slide("s1"));
        assert!(!slides.is_updating_slide("s2"));
        let cached = slides
            .query()
            .client()
            .cache()
            .get::<Vec<Slide>>(slides.query().key())
            .and_then(|e| e.data)
            .unwrap();
        assert_eq!(cached[0].title.as_deref(), Some("New Title"));
        assert_eq!(cached[1].title.as_deref(), Some("Other"));

        gate.open();
        let updated = task.await.unwrap().unwrap();
        assert_eq!(updated.title.as_deref(), Some("New Title"));
        assert!(!slides.is_updating());
        assert!(!slides.is_updating_slide("s1"));

        let put = mock
            .requests()
            .into_iter()
            .find(|r| r.path == "/slides/metadata/s1")
            .unwrap();
        assert_eq!(put.body, RequestBody::Json(json!({"title": "New Title"})));
    }

    #[tokio::test]
    async fn test_rejected_update_reverts() {
        let mock = MockTransport::new();
        mock.push_json("GET", "/slides/r1", json!([{"id": "s1", "title": "Old"}]));
        mock.push_status("PUT", "/slides/metadata/s1", 500);
        let slides = slides(&mock);
        slides.load().await;

        let err = slides
            .update_metadata("s1", SlideUpdate::default().title("New"))
            .await
            .unwrap_err();

        assert_eq!(err.source.status(), Some(500));
        let entry = slides
            .query()
            .client()
            .cache()
            .get::<Vec<Slide>>(slides.query().key())
            .unwrap();
        assert_eq!(entry.data.unwrap()[0].title.as_deref(), Some("Old"));
        assert!(entry.is_invalidated);
    }

    #[tokio::test]
    async fn test_refetch_after_update_replaces_prediction() {
        let mock = MockTransport::new();
        mock.push_json("GET", "/slides/r1", json!([{"id": "s1", "title": "Old"}]));
        mock.push_json("PUT", "/slides/metadata/s1", json!({"id": "s1", "title": "Server"}));
        mock.push_json("GET", "/slides/r1", json!([{"id": "s1", "title": "Server"}]));
        let slides = slides(&mock);
        slides.load().await;

        slides
            .update_metadata("s1", SlideUpdate::default().title("Mine"))
            .await
            .unwrap();
        assert_eq!(titles(&slides), vec![Some("Mine".to_string())]);

        slides.refetch().await.unwrap();
        assert_eq!(titles(&slides), vec![Some("Server".to_string())]);
        assert_eq!(mock.request_count("GET", "/slides/r1"), 2);
    }
}
