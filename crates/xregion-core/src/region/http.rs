//! HTTP client for the local region's account service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use super::{RegionError, RegionalUserApi, RoleBinding, UserResource, WorkspaceRole};

/// [`RegionalUserApi`] over the regional account service's REST surface.
///
/// A 404 on a read means the object is absent; a 404 on a delete means it
/// was already deleted.
#[derive(Debug, Clone)]
pub struct HttpRegionalApi {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RoleRequest<'a> {
    workspace: &'a str,
    user_uid: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<WorkspaceRole>,
}

impl HttpRegionalApi {
    /// Creates a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Configuration`] for an empty base URL or if the
    /// HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RegionError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RegionError::Configuration(
                "base_url must not be empty".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .map_err(|e| RegionError::Configuration(e.to_string()))?;
        Ok(Self { base_url, client })
    }

    async fn post_role(&self, action: &str, body: &RoleRequest<'_>) -> Result<(), RegionError> {
        let url = format!("{}/api/v1/roles/{action}", self.base_url);
        debug!(%url, workspace = body.workspace, user_uid = body.user_uid, "role request");
        let response = self.client.post(url).json(body).send().await?;
        ensure_success(response).await.map(drop)
    }
}

async fn ensure_success(response: Response) -> Result<Response, RegionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(RegionError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl RegionalUserApi for HttpRegionalApi {
    async fn find_user_resource(&self, user_uid: &str) -> Result<Option<UserResource>, RegionError> {
        let url = format!("{}/api/v1/users/{user_uid}/resource", self.base_url);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resource = ensure_success(response).await?.json().await?;
        Ok(Some(resource))
    }

    async fn delete_user_resource(&self, resource: &UserResource) -> Result<(), RegionError> {
        let url = format!("{}/api/v1/resources/{}", self.base_url, resource.name);
        let response = self.client.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(resource = %resource.name, "resource already deleted");
            return Ok(());
        }
        ensure_success(response).await.map(drop)
    }

    async fn workspace_roles(&self, user_uid: &str) -> Result<Vec<RoleBinding>, RegionError> {
        let url = format!("{}/api/v1/users/{user_uid}/roles", self.base_url);
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Ok(ensure_success(response).await?.json().await?)
    }

    async fn grant_role(
        &self,
        workspace: &str,
        user_uid: &str,
        role: WorkspaceRole,
    ) -> Result<(), RegionError> {
        self.post_role(
            "grant",
            &RoleRequest {
                workspace,
                user_uid,
                role: Some(role),
            },
        )
        .await
    }

    async fn deprive_role(&self, workspace: &str, user_uid: &str) -> Result<(), RegionError> {
        self.post_role(
            "deprive",
            &RoleRequest {
                workspace,
                user_uid,
                role: None,
            },
        )
        .await
    }

    async fn update_role(
        &self,
        workspace: &str,
        user_uid: &str,
        role: WorkspaceRole,
    ) -> Result<(), RegionError> {
        self.post_role(
            "update",
            &RoleRequest {
                workspace,
                user_uid,
                role: Some(role),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> HttpRegionalApi {
        HttpRegionalApi::new(server.uri(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn missing_resource_reads_as_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/u1/resource"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert_eq!(client(&server).find_user_resource("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn found_resource_is_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/u1/resource"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "userUid": "u1", "name": "ns-u1" })),
            )
            .mount(&server)
            .await;

        let resource = client(&server).find_user_resource("u1").await.unwrap().unwrap();
        assert_eq!(resource.name, "ns-u1");
    }

    #[tokio::test]
    async fn delete_treats_not_found_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/resources/ns-u1"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let resource = UserResource {
            user_uid: "u1".into(),
            name: "ns-u1".into(),
        };
        client(&server).delete_user_resource(&resource).await.unwrap();
    }

    #[tokio::test]
    async fn server_error_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/users/u1/roles"))
            .respond_with(ResponseTemplate::new(503).set_body_string("not ready"))
            .mount(&server)
            .await;

        let err = client(&server).workspace_roles("u1").await.unwrap_err();
        assert!(
            matches!(err, RegionError::Api { status: 503, ref message } if message == "not ready"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn role_mutations_post_camel_case_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/roles/update"))
            .and(body_json(json!({ "workspace": "ns-a", "userUid": "u1", "role": "owner" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/roles/deprive"))
            .and(body_json(json!({ "workspace": "ns-a", "userUid": "m1" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server);
        api.update_role("ns-a", "u1", WorkspaceRole::Owner).await.unwrap();
        api.deprive_role("ns-a", "m1").await.unwrap();
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = HttpRegionalApi::new("/", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RegionError::Configuration(_)));
    }
}
