use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::*;

const USER_AGENT: &str = concat!("blockpull/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("failed to build http client")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}: {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VolumesResponse {
    pub volumes: Vec<VolumeInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub volume_id: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot_id: SnapshotId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotStateResponse {
    pub state: SnapshotState,
}

/// A client for a block snapshot gateway.
///
/// Blocks are listed with `GET /snapshots/{id}/blocks?maxResults=&pageToken=` and
/// fetched with `GET /snapshots/{id}/blocks/{index}?blockToken=`. Volumes and
/// snapshot lifecycle live under `/volumes` and `/snapshots`.
#[derive(Debug, Clone)]
pub struct HttpSnapshotService {
    endpoint: Url,
    client: Client,
    auth_token: Option<String>,
}

async fn decode<T: DeserializeOwned>(url: Url, response: Response) -> Result<T, HttpError> {
    response.json().await.map_err(|source| HttpError::Request {
        url: url.to_string(),
        source,
    })
}

impl HttpSnapshotService {
    /// Every request, including a single block fetch, is bounded by `request_timeout`.
    pub fn new(
        endpoint: &str,
        auth_token: Option<String>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, HttpError> {
        let mut builder = Client::builder().user_agent(USER_AGENT);
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(HttpError::Client)?;

        let invalid = |reason: String| HttpError::InvalidEndpoint {
            endpoint: endpoint.into(),
            reason,
        };
        let endpoint = Url::parse(endpoint).map_err(|err| invalid(err.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(invalid("not a base url".into()));
        }

        Ok(Self {
            endpoint,
            client,
            auth_token,
        })
    }

    /// Appends `segments` to the endpoint path, percent-encoding each of them.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<Response, HttpError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|source| HttpError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, HttpError> {
        let url = self.url(segments);
        let response = self.send(&url, self.client.get(url.clone())).await?;
        decode(url, response).await
    }
}

#[async_trait::async_trait]
impl BlockSource for HttpSnapshotService {
    type Error = HttpError;

    async fn list_blocks(
        &self,
        snapshot: &SnapshotId,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<BlockPage, HttpError> {
        let url = self.url(&["snapshots", snapshot.0.as_str(), "blocks"]);
        let mut request = self
            .client
            .get(url.clone())
            .query(&[("maxResults", max_results.to_string())]);
        if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
        }

        let response = self.send(&url, request).await?;
        let page: BlockPage = decode(url, response).await?;
        debug!(blocks = page.blocks.len(), more = page.next_token.is_some(), "listed page");
        Ok(page)
    }

    async fn fetch_block(
        &self,
        snapshot: &SnapshotId,
        index: u64,
        token: &BlockToken,
    ) -> Result<Bytes, HttpError> {
        let index = index.to_string();
        let url = self.url(&["snapshots", snapshot.0.as_str(), "blocks", index.as_str()]);
        let request = self
            .client
            .get(url.clone())
            .query(&[("blockToken", token.0.as_str())]);

        let response = self.send(&url, request).await?;
        response.bytes().await.map_err(|source| HttpError::Request {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait::async_trait]
impl SnapshotService for HttpSnapshotService {
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, HttpError> {
        let response: VolumesResponse = self.get_json(&["volumes"]).await?;
        Ok(response.volumes)
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Option<VolumeInfo>, HttpError> {
        match self.get_json(&["volumes", volume_id]).await {
            Ok(volume) => Ok(Some(volume)),
            Err(HttpError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
    ) -> Result<SnapshotId, HttpError> {
        let url = self.url(&["snapshots"]);
        let request = self.client.post(url.clone()).json(&CreateSnapshotRequest {
            volume_id: volume_id.into(),
            description: description.into(),
        });

        let response = self.send(&url, request).await?;
        let created: CreateSnapshotResponse = decode(url, response).await?;
        Ok(created.snapshot_id)
    }

    async fn snapshot_state(&self, snapshot: &SnapshotId) -> Result<SnapshotState, HttpError> {
        let response: SnapshotStateResponse =
            self.get_json(&["snapshots", snapshot.0.as_str()]).await?;
        Ok(response.state)
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotId) -> Result<(), HttpError> {
        let url = self.url(&["snapshots", snapshot.0.as_str()]);
        self.send(&url, self.client.delete(url.clone())).await?;
        Ok(())
    }
}
