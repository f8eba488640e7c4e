//! Authentication and authorization for the secure metrics endpoint.
//!
//! Callers present a bearer token. The token is checked with a
//! `TokenReview`, then the caller must be allowed `get` on the `/metrics`
//! non-resource URL through a `SubjectAccessReview`.

use crate::error::ControllerError;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use k8s_openapi::api::authorization::v1::{NonResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec};
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Path guarded by the authorizer
pub const METRICS_PATH: &str = "/metrics";

/// Identity behind a bearer token
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsUser {
    /// User name, e.g. `system:serviceaccount:monitoring:prometheus`
    pub username: String,
    /// User UID
    pub uid: Option<String>,
    /// Group memberships
    pub groups: Vec<String>,
    /// Extra attributes from the authenticator
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Decides who may scrape metrics
#[async_trait]
pub trait MetricsAuthorizer: Send + Sync {
    /// Resolve a bearer token; `None` when the token is not valid
    async fn authenticate(&self, token: &str) -> Result<Option<MetricsUser>, ControllerError>;

    /// Whether `user` may `get` the metrics path
    async fn authorize(&self, user: &MetricsUser) -> Result<bool, ControllerError>;
}

/// Authorizer backed by the API server's review APIs
#[derive(Clone)]
pub struct KubeMetricsAuthorizer {
    client: Client,
}

impl std::fmt::Debug for KubeMetricsAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeMetricsAuthorizer").finish_non_exhaustive()
    }
}

impl KubeMetricsAuthorizer {
    /// Create an authorizer using `client`'s credentials
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn user_from_status(status: &TokenReviewStatus) -> Option<MetricsUser> {
    if !status.authenticated.unwrap_or(false) {
        debug!(error = ?status.error, "Metrics token not authenticated");
        return None;
    }
    let user = status.user.as_ref()?;
    Some(MetricsUser {
        username: user.username.clone()?,
        uid: user.uid.clone(),
        groups: user.groups.clone().unwrap_or_default(),
        extra: user.extra.clone().unwrap_or_default(),
    })
}

fn access_review(user: &MetricsUser) -> SubjectAccessReview {
    SubjectAccessReview {
        metadata: Default::default(),
        spec: SubjectAccessReviewSpec {
            user: Some(user.username.clone()),
            uid: user.uid.clone(),
            groups: Some(user.groups.clone()),
            extra: (!user.extra.is_empty()).then(|| user.extra.clone()),
            non_resource_attributes: Some(NonResourceAttributes {
                path: Some(METRICS_PATH.to_string()),
                verb: Some("get".to_string()),
            }),
            ..Default::default()
        },
        status: None,
    }
}

#[async_trait]
impl MetricsAuthorizer for KubeMetricsAuthorizer {
    async fn authenticate(&self, token: &str) -> Result<Option<MetricsUser>, ControllerError> {
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            status: None,
        };
        let result = Api::<TokenReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        Ok(result.status.as_ref().and_then(user_from_status))
    }

    async fn authorize(&self, user: &MetricsUser) -> Result<bool, ControllerError> {
        let result = Api::<SubjectAccessReview>::all(self.client.clone())
            .create(&PostParams::default(), &access_review(user))
            .await?;
        Ok(result.status.is_some_and(|s| s.allowed))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Middleware rejecting unauthenticated (401) and unauthorized (403) callers
pub async fn require_metrics_access(
    State(authorizer): State<Arc<dyn MetricsAuthorizer>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()).map(str::to_owned) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    let user = match authorizer.authenticate(&token).await {
        Ok(Some(user)) => user,
        Ok(None) => return StatusCode::UNAUTHORIZED.into_response(),
        Err(e) => {
            warn!("Metrics token review failed: {}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match authorizer.authorize(&user).await {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            debug!(user = %user.username, "Metrics access denied");
            StatusCode::FORBIDDEN.into_response()
        }
        Err(e) => {
            warn!("Metrics access review failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
