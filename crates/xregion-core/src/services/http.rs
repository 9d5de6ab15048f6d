//! HTTP implementation of [`AccountServices`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{AccountServices, MergeRequest, ServiceError};
use crate::config::ServicesConfig;

/// Header carrying the transaction uid on every call.
pub const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

const BILLING: &str = "billing";
const WORKORDER: &str = "work-order";
const VM: &str = "vm";

#[derive(Debug, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    success: bool,
}

/// Calls the billing, work-order and VM services over HTTP.
///
/// A call succeeds only on a 2xx status whose JSON body reports
/// `"success": true`.
#[derive(Debug, Clone)]
pub struct HttpAccountServices {
    billing_url: Option<String>,
    workorder_url: Option<String>,
    vm_url: Option<String>,
    client: reqwest::Client,
}

fn normalize(url: Option<&String>) -> Option<String> {
    url.map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
}

impl HttpAccountServices {
    /// Builds a client from the `[services]` section.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Configuration`] if the HTTP client cannot be
    /// built.
    pub fn from_config(config: &ServicesConfig) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Configuration(e.to_string()))?;
        Ok(Self {
            billing_url: normalize(config.billing_url.as_ref()),
            workorder_url: normalize(config.workorder_url.as_ref()),
            vm_url: normalize(config.vm_url.as_ref()),
            client,
        })
    }

    async fn call(
        &self,
        service: &'static str,
        base_url: Option<&str>,
        path: &str,
        request: &MergeRequest,
    ) -> Result<(), ServiceError> {
        let base_url = base_url.ok_or(ServiceError::NotConfigured { service })?;
        let url = format!("{base_url}{path}");
        debug!(service, %url, transaction_uid = %request.transaction_uid, "calling service");

        let transport = |e: reqwest::Error| ServiceError::Transport {
            service,
            message: e.to_string(),
        };
        let response = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, &request.transaction_uid)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if !status.is_success() {
            warn!(service, status = status.as_u16(), "service call failed");
            return Err(ServiceError::Api {
                service,
                status: status.as_u16(),
                message: body,
            });
        }
        match serde_json::from_str::<ServiceReply>(&body) {
            Ok(ServiceReply { success: true }) => Ok(()),
            _ => Err(ServiceError::Rejected {
                service,
                message: body,
            }),
        }
    }
}

#[async_trait]
impl AccountServices for HttpAccountServices {
    fn is_configured(&self) -> bool {
        self.billing_url.is_some() && self.workorder_url.is_some() && self.vm_url.is_some()
    }

    async fn transfer_balance(&self, request: &MergeRequest) -> Result<(), ServiceError> {
        self.call(
            BILLING,
            self.billing_url.as_deref(),
            "/account/v1alpha1/merge-user",
            request,
        )
        .await
    }

    async fn migrate_work_orders(&self, request: &MergeRequest) -> Result<(), ServiceError> {
        self.call(
            WORKORDER,
            self.workorder_url.as_deref(),
            "/api/v1/migrate-user",
            request,
        )
        .await
    }

    async fn merge_vms(&self, request: &MergeRequest) -> Result<(), ServiceError> {
        self.call(VM, self.vm_url.as_deref(), "/api/v1/merge-user", request)
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn request() -> MergeRequest {
        MergeRequest {
            transaction_uid: "txn-1".into(),
            merge_user_uid: "m1".into(),
            user_uid: "u1".into(),
        }
    }

    fn services(server: &MockServer) -> HttpAccountServices {
        let uri = server.uri();
        HttpAccountServices::from_config(&ServicesConfig {
            billing_url: Some(format!("{uri}/")),
            workorder_url: Some(uri.clone()),
            vm_url: Some(uri),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn blank_urls_are_unconfigured() {
        let services = HttpAccountServices::from_config(&ServicesConfig {
            billing_url: Some("http://billing".into()),
            workorder_url: Some("  ".into()),
            vm_url: Some("http://vm".into()),
            timeout_secs: 5,
        })
        .unwrap();
        assert!(!services.is_configured());
    }

    #[tokio::test]
    async fn unconfigured_service_fails_without_calling() {
        let services = HttpAccountServices::from_config(&ServicesConfig::default()).unwrap();
        let err = services.merge_vms(&request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotConfigured { service: "vm" }));
    }

    #[tokio::test]
    async fn success_requires_flag_in_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/account/v1alpha1/merge-user"))
            .and(header(IDEMPOTENCY_HEADER, "txn-1"))
            .and(body_json(json!({
                "transactionUid": "txn-1",
                "mergeUserUid": "m1",
                "userUid": "u1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/migrate-user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": false })))
            .mount(&server)
            .await;

        let services = services(&server);
        assert!(services.is_configured());
        services.transfer_balance(&request()).await.unwrap();
        let err = services.migrate_work_orders(&request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Rejected { service: "work-order", .. }));
    }

    #[tokio::test]
    async fn non_2xx_is_an_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/merge-user"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "success": true })))
            .mount(&server)
            .await;

        let err = services(&server).merge_vms(&request()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Api { service: "vm", status: 500, .. }));
    }
}
