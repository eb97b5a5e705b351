//! HTTP licensing backend.

use super::{
    ActivationRequest, BackendError, BackendResult, DeactivationRequest, LicenseBackend,
    MeterUsesReport, Rejection, ReleaseInfo, ReleaseQuery, SyncRequest, TrialActivationRequest,
};
use crate::config::{EngineConfig, NetworkSettings};
use crate::error::{LicenseError, LicenseResult};
use async_trait::async_trait;
use reqwest::{Client, Proxy, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
struct MeterUsesBody<'a> {
    fingerprint: &'a str,
    product_id: String,
    total_uses: u64,
    uses: u64,
}

#[derive(Debug, Clone)]
struct Transport {
    client: Client,
    base_url: String,
}

/// [`LicenseBackend`] over the keyward HTTP API.
pub struct HttpBackend {
    default_host: String,
    timeout: Duration,
    transport: RwLock<Transport>,
}

impl HttpBackend {
    /// Creates a backend talking to `config.host_url`.
    pub fn new(config: &EngineConfig) -> LicenseResult<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = build_client(timeout, None)
            .map_err(|e| LicenseError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            default_host: config.host_url.trim_end_matches('/').to_string(),
            timeout,
            transport: RwLock::new(Transport {
                client,
                base_url: config.host_url.trim_end_matches('/').to_string(),
            }),
        })
    }

    /// Base URL requests currently go to.
    pub fn base_url(&self) -> String {
        self.transport().base_url
    }

    fn transport(&self) -> Transport {
        self.transport
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    async fn send(request: RequestBuilder) -> BackendResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(BackendError::RateLimited);
        }
        if status.is_server_error() {
            return Err(BackendError::Server(format!("HTTP {status}")));
        }

        let body: Option<ErrorBody> = response.json().await.ok();
        match body.as_ref().and_then(|b| rejection_for(&b.code)) {
            Some(rejection) => {
                debug!(
                    "backend rejected request: {:?} ({})",
                    rejection,
                    body.as_ref().map(|b| b.message.as_str()).unwrap_or_default()
                );
                Err(BackendError::Rejected(rejection))
            }
            None => Err(BackendError::Server(format!(
                "HTTP {status}: {}",
                body.map(|b| b.code).unwrap_or_default()
            ))),
        }
    }

    async fn token(request: RequestBuilder) -> BackendResult<String> {
        let response = Self::send(request).await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Server(format!("malformed token response: {e}")))?;
        Ok(body.token)
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("base_url", &self.base_url())
            .finish()
    }
}

#[async_trait]
impl LicenseBackend for HttpBackend {
    async fn activate(&self, request: &ActivationRequest) -> BackendResult<String> {
        let t = self.transport();
        let url = format!("{}/v1/activations", t.base_url);
        Self::token(t.client.post(url).json(request)).await
    }

    async fn deactivate(&self, request: &DeactivationRequest) -> BackendResult<()> {
        let t = self.transport();
        let url = format!("{}/v1/activations/{}", t.base_url, request.activation_id);
        Self::send(t.client.delete(url).json(request)).await?;
        Ok(())
    }

    async fn sync_activation(&self, request: &SyncRequest) -> BackendResult<String> {
        let t = self.transport();
        let url = format!("{}/v1/activations/{}", t.base_url, request.activation_id);
        Self::token(t.client.patch(url).json(request)).await
    }

    async fn activate_trial(&self, request: &TrialActivationRequest) -> BackendResult<String> {
        let t = self.transport();
        let url = format!("{}/v1/trial-activations", t.base_url);
        Self::token(t.client.post(url).json(request)).await
    }

    async fn report_meter_uses(&self, report: &MeterUsesReport) -> BackendResult<()> {
        let t = self.transport();
        let url = format!(
            "{}/v1/activations/{}/meter-attributes/{}",
            t.base_url, report.activation_id, report.attribute.name
        );
        let body = MeterUsesBody {
            fingerprint: &report.fingerprint,
            product_id: report.product_id.to_string(),
            total_uses: report.attribute.total_uses,
            uses: report.attribute.uses,
        };
        Self::send(t.client.put(url).json(&body)).await?;
        Ok(())
    }

    async fn check_release(&self, query: &ReleaseQuery) -> BackendResult<ReleaseInfo> {
        let t = self.transport();
        let url = format!("{}/v1/releases/latest", t.base_url);
        let mut params = vec![
            ("productId", query.product_id.to_string()),
            ("platform", query.platform.clone()),
            ("version", query.version.clone()),
            ("channel", query.channel.clone()),
        ];
        if let Some(key) = &query.license_key {
            params.push(("key", key.clone()));
        }
        let response = Self::send(t.client.get(url).query(&params)).await?;
        response
            .json()
            .await
            .map_err(|e| BackendError::Server(format!("malformed release response: {e}")))
    }

    fn apply_network_settings(&self, settings: &NetworkSettings) -> BackendResult<()> {
        let client = build_client(self.timeout, settings.proxy.as_deref()).map_err(|e| {
            warn!("rejecting proxy {:?}: {e}", settings.proxy);
            BackendError::Network(e.to_string())
        })?;
        let base_url = settings
            .host_url
            .clone()
            .unwrap_or_else(|| self.default_host.clone());
        debug!("HTTP backend now targets {base_url}");

        let mut transport = self
            .transport
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *transport = Transport { client, base_url };
        Ok(())
    }
}

fn build_client(timeout: Duration, proxy: Option<&str>) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .user_agent(concat!("keyward/", env!("CARGO_PKG_VERSION")));
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

fn rejection_for(code: &str) -> Option<Rejection> {
    serde_json::from_value(serde_json::Value::String(code.to_string())).ok()
}
