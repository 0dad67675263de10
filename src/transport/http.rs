//! HTTP transport backed by `reqwest`.
//!
//! The client keeps a cookie store, so the session cookie set by the
//! sign-in call travels with every later request.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};
use url::Url;

use crate::config::ApiSettings;
use crate::infra::error::InfraError;

use super::{ApiRequest, ApiResponse, Transport, TransportError};

pub struct ReqwestTransport {
    client: Client,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(settings.request_timeout)
            .user_agent(concat!("studysync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| InfraError::http_client(format!("failed to build client: {err}")))?;
        Ok(Self::with_client(client, settings.base_url.clone()))
    }

    pub fn with_client(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resolve(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|err| TransportError::invalid_target(path, err.to_string()))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.resolve(&request.path)?;
        let mut builder = self.client.request(request.method.clone(), url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| TransportError::unreachable(&request.path, err.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::unreachable(&request.path, err.to_string()))?;

        debug!(status, bytes = body.len(), "API response received");

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
