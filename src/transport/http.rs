use futures::future::BoxFuture;
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client as ReqwestClient, RequestBuilder};
use serde_json::Value;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ConfigError, TransportError};

use super::{FormPart, Request, RequestBody, Response, ResponseKind, Transport};

/// reqwest-backed transport rooted at a fixed base URL.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: ReqwestClient,
    base_url: String,
}

impl HttpTransport {
    /// Builds a transport from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Client`] if the underlying HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let mut builder = ReqwestClient::builder().timeout(config.timeout);
        if let Some(agent) = &config.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| ConfigError::Client(err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Returns the full URL for a path relative to the base URL.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    fn build(&self, request: Request) -> Result<RequestBuilder, TransportError> {
        let accept = match request.response_kind {
            ResponseKind::Json => HeaderValue::from_static("application/json"),
            ResponseKind::Blob => HeaderValue::from_static("*/*"),
        };
        let builder = self
            .client
            .request(request.method, self.url(&request.path))
            .header(ACCEPT, accept);

        Ok(match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Multipart(parts) => builder.multipart(into_form(parts)?),
        })
    }
}

fn into_form(parts: Vec<FormPart>) -> Result<Form, TransportError> {
    parts.into_iter().try_fold(Form::new(), |form, part| {
        Ok(match part {
            FormPart::Text { name, value } => form.text(name, value),
            FormPart::File {
                name,
                file_name,
                content_type,
                bytes,
            } => {
                let mut file = Part::bytes(bytes.to_vec()).file_name(file_name);
                if let Some(mime) = content_type {
                    file = file.mime_str(&mime)?;
                }
                form.part(name, file)
            }
        })
    })
}

impl Transport for HttpTransport {
    fn send(&self, request: Request) -> BoxFuture<'_, Result<Response, TransportError>> {
        Box::pin(async move {
            let method = request.method.clone();
            let url = self.url(&request.path);
            let builder = self.build(request)?;

            debug!(%method, %url, "sending HTTP request");
            let response = builder.send().await.map_err(|err| {
                debug!(%method, %url, error = %err, "HTTP request failed");
                TransportError::from(err)
            })?;

            let status = response.status();
            debug!(%method, %url, %status, "received HTTP response");

            if !status.is_success() {
                // The status is kept even when the error body cannot be read.
                let body = response
                    .bytes()
                    .await
                    .ok()
                    .and_then(|body| serde_json::from_slice::<Value>(&body).ok());
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            let headers = response.headers().clone();
            let body = response.bytes().await?;

            Ok(Response {
                status: status.as_u16(),
                headers,
                body,
            })
        })
    }
}
