//! Memory manager API client

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::MemoryStore;
use crate::config::MemoryApiConfig;
use crate::{Error, Result};

const SECRET_HEADER: &str = "X-API-Secret";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveMemoryRequest<'a> {
    summary_memory: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemoryResponse {
    #[serde(default, alias = "memory", alias = "content")]
    summary_memory: Option<String>,
}

/// Client for the device memory manager service
pub struct ManagerMemoryClient {
    client: reqwest::Client,
    base_url: String,
    secret: Option<SecretString>,
}

impl ManagerMemoryClient {
    #[must_use]
    pub fn new(client: reqwest::Client, config: &MemoryApiConfig) -> Self {
        if config.secret.is_none() {
            tracing::warn!("memory API secret not set, requests will be unauthenticated");
        }
        Self {
            client,
            base_url: config.base_url.clone(),
            secret: config.secret.clone(),
        }
    }

    /// Build `{base}/{route..}/{device_id}` with the device id as one
    /// percent-encoded path segment
    fn endpoint(&self, route: &[&str], device_id: &str) -> Result<Url> {
        if matches!(device_id, "" | "." | "..") {
            return Err(Error::Memory(format!("invalid device id {device_id:?}")));
        }

        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Memory(format!("invalid memory API url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| Error::Memory("memory API url cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(route)
            .push(device_id);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.secret {
            Some(secret) => request.header(SECRET_HEADER, secret.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl MemoryStore for ManagerMemoryClient {
    async fn save(&self, device_id: &str, content: &str) -> Result<()> {
        let url = self.endpoint(&["agent", "saveMemory"], device_id)?;
        let response = self
            .authorize(self.client.put(url))
            .json(&SaveMemoryRequest {
                summary_memory: content,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, device_id, "memory save rejected");
            return Err(Error::Memory(format!("save failed {status}: {body}")));
        }

        tracing::info!(device_id, chars = content.chars().count(), "memory saved");
        Ok(())
    }

    async fn recall(&self, device_id: &str, query: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["agent", "memory"], device_id)?;
        let response = self
            .authorize(self.client.get(url))
            .query(&[("query", query)])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Memory(format!("recall failed {status}: {body}")));
        }

        let memory: MemoryResponse = response.json().await?;
        let found = memory.summary_memory.filter(|m| !m.trim().is_empty());
        tracing::debug!(device_id, found = found.is_some(), "memory recalled");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_url: &str) -> ManagerMemoryClient {
        let config = MemoryApiConfig {
            base_url: base_url.to_string(),
            secret: None,
        };
        ManagerMemoryClient::new(reqwest::Client::new(), &config)
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let url = client("http://manager.local/api/")
            .endpoint(&["agent", "memory"], "esp-1")
            .unwrap();
        assert_eq!(url.as_str(), "http://manager.local/api/agent/memory/esp-1");
    }

    #[test]
    fn test_device_id_stays_in_one_segment() {
        let url = client("http://manager.local")
            .endpoint(&["agent", "memory"], "../../admin/users?x=")
            .unwrap();

        assert!(url.path().starts_with("/agent/memory/"), "{url}");
        assert!(url.query().is_none(), "{url}");
        let segments: Vec<_> = url.path_segments().unwrap().collect();
        assert_eq!(segments.len(), 3, "{url}");
        assert!(!segments[2].contains('/'));
    }

    #[test]
    fn test_dot_device_ids_rejected() {
        let client = client("http://manager.local");
        for device_id in ["", ".", ".."] {
            assert!(client.endpoint(&["agent", "memory"], device_id).is_err());
        }
    }
}
