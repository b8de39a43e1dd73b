//! Wire types for the slide repository API.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

use crate::download::PPTX_CONTENT_TYPE;
use crate::transport::FormPart;

/// An uploaded presentation whose slides make up a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default)]
    pub number_of_slides: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    pub created_at: String,
}

/// Metadata for one slide in a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slide {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

/// A partial update to a slide's metadata. Only `Some` fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlideUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl SlideUpdate {
    #[must_use]
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn slide_type(mut self, slide_type: impl Into<String>) -> Self {
        self.slide_type = Some(slide_type.into());
        self
    }

    #[must_use]
    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }

    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Returns `true` if no field is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.category.is_none()
            && self.slide_type.is_none()
            && self.purpose.is_none()
            && self.tags.is_none()
    }

    /// Overwrites the fields of `slide` that this update sets.
    pub fn apply_to(&self, slide: &mut Slide) {
        if let Some(title) = &self.title {
            slide.title = Some(title.clone());
        }
        if let Some(category) = &self.category {
            slide.category = Some(category.clone());
        }
        if let Some(slide_type) = &self.slide_type {
            slide.slide_type = Some(slide_type.clone());
        }
        if let Some(purpose) = &self.purpose {
            slide.purpose = Some(purpose.clone());
        }
        if let Some(tags) = &self.tags {
            slide.tags = Some(tags.clone());
        }
    }
}

/// Server acknowledgement of a repository upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub storage_path: String,
    #[serde(deserialize_with = "string_or_number")]
    pub presentation_id: String,
}

/// A presentation file to upload as a new repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryUpload {
    pub title: String,
    pub file_name: String,
    pub bytes: Bytes,
}

impl RepositoryUpload {
    #[must_use]
    pub fn new(title: impl Into<String>, file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            title: title.into(),
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }

    /// Reads the file at `path`, naming the upload after the file.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    pub async fn from_path(title: impl Into<String>, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map_or_else(|| "presentation.pptx".to_string(), |n| n.to_string_lossy().into_owned());
        Ok(Self::new(title, file_name, bytes))
    }

    /// Builds the `file` and `title` form parts.
    pub(crate) fn into_form(self) -> Vec<FormPart> {
        vec![
            FormPart::File {
                name: "file".to_string(),
                file_name: self.file_name,
                content_type: Some(PPTX_CONTENT_TYPE.to_string()),
                bytes: self.bytes,
            },
            FormPart::Text {
                name: "title".to_string(),
                value: self.title,
            },
        ]
    }
}

/// Input for generating a presentation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationRequest {
    pub title: String,
    pub client_name: String,
    pub industry: String,
    pub description: String,
    pub target_audience: String,
    pub key_messages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_slides: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_slide_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<String>,
}

/// Ids are strings on this side; the server may send them as integers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Int(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Str(id) => id,
        Id::Int(id) => id.to_string(),
    })
}
