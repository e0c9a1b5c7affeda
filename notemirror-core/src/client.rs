use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::models::{Block, BlockPage, NodeMetadata, normalize_node_id};

const DEFAULT_BASE_URL: &str = "https://api.notemirror.io";
const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiError {
    pub fn class(&self) -> ApiErrorClass {
        match self {
            ApiError::Request(err) if err.is_timeout() || err.is_connect() => {
                ApiErrorClass::Transient
            }
            ApiError::Request(_) | ApiError::Url(_) => ApiErrorClass::Permanent,
            ApiError::Api { status, .. } => match *status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiErrorClass::Auth,
                StatusCode::TOO_MANY_REQUESTS => ApiErrorClass::RateLimit,
                status if status.is_server_error() => ApiErrorClass::Transient,
                _ => ApiErrorClass::Permanent,
            },
        }
    }
}

#[derive(Clone)]
pub struct NodeClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl NodeClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lightweight per-node metadata: id, timestamp, properties. No content.
    pub async fn get_node_metadata(&self, id: &str) -> Result<NodeMetadata, ApiError> {
        let url = self.endpoint(&format!("/v1/nodes/{}", normalize_node_id(id)))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// One page of a node's direct child blocks.
    pub async fn list_child_blocks(
        &self,
        id: &str,
        cursor: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<BlockPage, ApiError> {
        let mut url =
            self.endpoint(&format!("/v1/nodes/{}/children", normalize_node_id(id)))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair(
                "page_size",
                &page_size.unwrap_or(DEFAULT_PAGE_SIZE).to_string(),
            );
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// All direct child blocks of a node, following pagination cursors.
    pub async fn list_child_blocks_all(&self, id: &str) -> Result<Vec<Block>, ApiError> {
        let mut blocks = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .list_child_blocks(id, cursor.as_deref(), Some(DEFAULT_PAGE_SIZE))
                .await?;
            blocks.extend(page.results);
            if !page.has_more {
                break;
            }
            let Some(next) = page.next_cursor else {
                break;
            };
            cursor = Some(next);
        }
        Ok(blocks)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        Ok(response.json().await?)
    }
}
