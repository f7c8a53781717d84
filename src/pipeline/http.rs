//! JSON-over-HTTP implementations of the AI collaborators.
//!
//! One `reqwest::Client` per tenant, carrying that tenant's credentials,
//! held in an injected [`TenantCache`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::CollaboratorError;
use crate::pipeline::collaborators::{
    Categorizer, ItineraryMatcher, ResponseDrafter, VisionExtractor,
};
use crate::pipeline::types::{
    CategorizationResult, DraftContext, DraftKind, DraftedResponse, ExtractedData,
    InboundMessage, ItineraryEvaluation, VisionResult,
};
use crate::tenant::TenantCache;

const TENANT_HEADER: &str = "x-tenant-id";

pub struct HttpCollaborators {
    base_url: String,
    default_key: Option<SecretString>,
    tenant_keys: HashMap<String, SecretString>,
    timeout: Duration,
    clients: Arc<TenantCache<reqwest::Client>>,
}

impl HttpCollaborators {
    pub fn new(config: &PipelineConfig, clients: Arc<TenantCache<reqwest::Client>>) -> Self {
        Self {
            base_url: config.collaborator_base_url.clone(),
            default_key: config.collaborator_api_key.clone(),
            tenant_keys: config.tenant_api_keys.clone(),
            timeout: config.request_timeout,
            clients,
        }
    }

    /// Drop the cached client so the next call rebuilds it.
    pub async fn invalidate(&self, tenant_id: &str) {
        if self.clients.invalidate(tenant_id).await {
            debug!(tenant_id, "Invalidated collaborator client");
        }
    }

    fn api_key(&self, tenant_id: &str) -> Option<&SecretString> {
        self.tenant_keys
            .get(tenant_id)
            .or(self.default_key.as_ref())
    }

    async fn client(&self, tenant_id: &str) -> Result<reqwest::Client, CollaboratorError> {
        self.clients
            .get_or_try_insert_with(tenant_id, || async { self.build_client(tenant_id) })
            .await
    }

    fn build_client(&self, tenant_id: &str) -> Result<reqwest::Client, CollaboratorError> {
        let not_configured = |reason: String| CollaboratorError::NotConfigured {
            service: "collaborator".to_string(),
            reason,
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            TENANT_HEADER,
            HeaderValue::from_str(tenant_id)
                .map_err(|e| not_configured(format!("invalid tenant id: {e}")))?,
        );
        if let Some(key) = self.api_key(tenant_id) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
                .map_err(|e| not_configured(format!("invalid API key: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        } else {
            warn!(tenant_id, "No collaborator API key configured");
        }

        reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| not_configured(format!("failed to build HTTP client: {e}")))
    }

    async fn post<B, R>(
        &self,
        service: &str,
        tenant_id: &str,
        path: &str,
        body: &B,
    ) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let client = self.client(tenant_id).await?;
        let url = format!("{}/{}", self.base_url, path);

        let resp = client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(service, self.timeout, e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(service, status, retry_after, &body));
        }

        resp.json::<R>()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse {
                service: service.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Failures before a status line arrived.
fn transport_error(service: &str, timeout: Duration, e: reqwest::Error) -> CollaboratorError {
    if e.is_timeout() {
        CollaboratorError::Timeout {
            service: service.to_string(),
            after: timeout,
        }
    } else {
        CollaboratorError::Network {
            service: service.to_string(),
            reason: e.to_string(),
        }
    }
}

/// 429 and 5xx are worth retrying; any other non-success status is final.
fn status_error(
    service: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> CollaboratorError {
    let reason: String = body.chars().take(200).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        CollaboratorError::RateLimited {
            service: service.to_string(),
            retry_after,
        }
    } else if status.is_server_error() {
        CollaboratorError::Upstream {
            service: service.to_string(),
            status: status.as_u16(),
            reason,
        }
    } else {
        CollaboratorError::Rejected {
            service: service.to_string(),
            reason: format!("HTTP {status}: {reason}"),
        }
    }
}

#[async_trait]
impl Categorizer for HttpCollaborators {
    async fn categorize_and_extract(
        &self,
        message: &InboundMessage,
    ) -> Result<CategorizationResult, CollaboratorError> {
        let mut result: CategorizationResult = self
            .post(
                "categorizer",
                &message.tenant_id,
                "v1/categorize",
                &json!({ "message": message, "tenantId": message.tenant_id }),
            )
            .await?;
        result.confidence = result.confidence.min(100);
        Ok(result)
    }
}

#[async_trait]
impl VisionExtractor for HttpCollaborators {
    async fn extract_contacts(
        &self,
        message: &InboundMessage,
    ) -> Result<VisionResult, CollaboratorError> {
        let images: Vec<_> = message.image_attachments().collect();
        self.post(
            "vision",
            &message.tenant_id,
            "v1/vision/contacts",
            &json!({ "messageId": message.id, "tenantId": message.tenant_id, "attachments": images }),
        )
        .await
    }
}

#[async_trait]
impl ItineraryMatcher for HttpCollaborators {
    async fn evaluate(
        &self,
        extracted: &ExtractedData,
        tenant_id: &str,
    ) -> Result<ItineraryEvaluation, CollaboratorError> {
        self.post(
            "itinerary",
            tenant_id,
            "v1/itinerary/evaluate",
            &json!({ "extractedData": extracted, "tenantId": tenant_id }),
        )
        .await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DraftRequest<'a> {
    kind: DraftKind,
    context: &'a DraftContext<'a>,
}

#[async_trait]
impl ResponseDrafter for HttpCollaborators {
    async fn draft(
        &self,
        kind: DraftKind,
        context: &DraftContext<'_>,
    ) -> Result<DraftedResponse, CollaboratorError> {
        let mut draft: DraftedResponse = self
            .post(
                "drafter",
                &context.message.tenant_id,
                "v1/responses/draft",
                &DraftRequest { kind, context },
            )
            .await?;
        draft.kind = kind;
        Ok(draft)
    }
}
