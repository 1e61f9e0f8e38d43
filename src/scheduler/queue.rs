//! Client for the external job queue service.
//!
//! The service lists pending jobs as a paginated JSON document and accepts
//! PATCH updates at each job's `url`:
//!
//! ```text
//! GET   <endpoint>?started=False&backend=<backend>
//!       -> {"count": 1, "next": null, "previous": null, "results": [Job, ...]}
//! PATCH <job.url>   {"started": true}
//! PATCH <job.url>   {"status_code": 0, "output_path": "..."}
//! ```

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::job::{Job, JobUpdate};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The endpoint is not a valid URL.
    #[error("Invalid queue URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    /// Transport or decoding failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("{method} {url} returned {status}: {body}")]
    UnexpectedStatus {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },
}

/// One page of the pending job listing.
#[derive(Debug, Clone, Deserialize)]
pub struct JobPage {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<Job>,
}

/// Source of pending jobs and sink for their status updates.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// The next job nobody has started, if any.
    async fn next_pending(&self) -> Result<Option<Job>, QueueError>;

    /// Sends `update` for `job`.
    async fn update(&self, job: &Job, update: &JobUpdate) -> Result<(), QueueError>;
}

/// [`JobQueue`] over the queue service's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpJobQueue {
    client: Client,
    endpoint: Url,
    backend: String,
    auth: Option<(String, String)>,
}

impl HttpJobQueue {
    pub fn new(endpoint: &str, backend: impl Into<String>) -> Result<Self, QueueError> {
        let endpoint = Url::parse(endpoint).map_err(|e| QueueError::InvalidUrl {
            url: endpoint.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            client: Client::new(),
            endpoint,
            backend: backend.into(),
            auth: None,
        })
    }

    /// Sends HTTP basic auth with every request.
    pub fn with_basic_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.auth = Some((user.into(), pass.into()));
        self
    }

    /// Uses a preconfigured HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// URL listing jobs that have not been started on this backend.
    pub fn pending_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("started", "False")
            .append_pair("backend", &self.backend);
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, pass)) => request.basic_auth(user, Some(pass)),
            None => request,
        }
    }

    async fn check(
        method: &'static str,
        url: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, QueueError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(QueueError::UnexpectedStatus {
            method,
            url: url.to_string(),
            status: status.as_u16(),
            body,
        })
    }

    /// Fetches the first page of pending jobs.
    pub async fn pending(&self) -> Result<JobPage, QueueError> {
        let url = self.pending_url();
        let response = self.authorize(self.client.get(url.clone())).send().await?;
        let response = Self::check("GET", url.as_str(), response).await?;
        let page: JobPage = response.json().await?;
        debug!(count = page.count, "Fetched pending jobs");
        Ok(page)
    }
}

#[async_trait]
impl JobQueue for HttpJobQueue {
    async fn next_pending(&self) -> Result<Option<Job>, QueueError> {
        Ok(self.pending().await?.results.into_iter().next())
    }

    async fn update(&self, job: &Job, update: &JobUpdate) -> Result<(), QueueError> {
        let response = self
            .authorize(self.client.patch(&job.url))
            .json(update)
            .send()
            .await?;
        Self::check("PATCH", &job.url, response).await?;
        debug!(job_id = %job.id(), "Updated job");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_url() {
        let queue = HttpJobQueue::new("http://test.com/jobs/", "tpp").unwrap();
        assert_eq!(
            queue.pending_url().as_str(),
            "http://test.com/jobs/?started=False&backend=tpp"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(matches!(
            HttpJobQueue::new("not a url", "tpp"),
            Err(QueueError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_page_deserialization() {
        let page: JobPage = serde_json::from_str(
            r#"{"count": 0, "next": null, "previous": null, "results": []}"#,
        )
        .unwrap();
        assert_eq!(page.count, 0);
        assert!(page.results.is_empty());
    }
}
