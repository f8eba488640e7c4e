//! APIC API client
//!
//! Implements the APIC REST client for EPG and contract operations.
//! Based on the APIC managed-object API: `/api/node/mo/<dn>.json` for
//! object reads and writes, `/api/node/class/...` for class queries.

use crate::apic_trait::ApicClientTrait;
use crate::auth::{ApicAuth, ApicConfig, Credentials, RequestSigner, session_cookie};
use crate::dn;
use crate::error::ApicError;
use crate::models::{self, ApicResponse, ManagedObject};
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

const LOGIN_PATH: &str = "/api/aaaLogin.json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// APIC API client
pub struct ApicClient {
    client: Client,
    base_url: String,
    username: String,
    credentials: Credentials,
    /// Session token from the last password login
    token: RwLock<Option<String>>,
}

impl fmt::Debug for ApicClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApicClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password_auth", &self.uses_password())
            .finish_non_exhaustive()
    }
}

impl ApicClient {
    /// Create a new APIC client without contacting the controller
    ///
    /// TLS certificate verification is disabled: APIC ships with a
    /// self-signed certificate.
    pub fn new(config: &ApicConfig) -> Result<Self, ApicError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;

        let credentials = match &config.auth {
            ApicAuth::Password(password) => Credentials::Password(password.clone()),
            ApicAuth::Certificate { private_key, cert_name } => {
                let cert_dn = dn::user_cert_dn(&config.username, cert_name);
                Credentials::Certificate(RequestSigner::from_pem(private_key, cert_dn)?)
            }
        };

        Ok(Self {
            client,
            base_url: config.base_url(),
            username: config.username.clone(),
            credentials,
            token: RwLock::new(None),
        })
    }

    /// Create a client and validate connectivity with a "list system" read
    ///
    /// # Errors
    /// Fails when the key cannot be parsed, login is rejected or APIC is
    /// unreachable.
    pub async fn connect(config: &ApicConfig) -> Result<Self, ApicError> {
        let client = Self::new(config)?;
        let nodes = client.list_system().await?;
        debug!("Connected to APIC at {} ({} fabric nodes)", client.base_url, nodes.len());
        Ok(client)
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True when authenticating with username/password
    pub fn uses_password(&self) -> bool {
        matches!(self.credentials, Credentials::Password(_))
    }

    /// Log in with the configured password and cache the session token
    pub async fn login(&self) -> Result<String, ApicError> {
        let Credentials::Password(password) = &self.credentials else {
            return Err(ApicError::InvalidRequest(
                "login requires password authentication".to_string(),
            ));
        };

        debug!("Logging in to APIC as {}", self.username);
        let body = serde_json::to_string(&models::login_payload(&self.username, password))?;
        let response = self.send(&Method::POST, LOGIN_PATH, &body, None).await?;
        let decoded = Self::decode(LOGIN_PATH, response).await.map_err(|e| match e {
            ApicError::Http(e) => ApicError::Http(e),
            other => ApicError::Authentication(other.to_string()),
        })?;

        let token = decoded
            .objects("aaaLogin")
            .next()
            .and_then(|mo| mo.attr("token"))
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ApicError::Authentication("login response carried no token".to_string()))?
            .to_string();

        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    /// List fabric nodes; used as the connectivity probe
    pub async fn list_system(&self) -> Result<Vec<ManagedObject>, ApicError> {
        let path = format!("/api/node/class/{}.json", models::TOP_SYSTEM_CLASS);
        let response = self.request(Method::GET, &path, None).await?;
        Ok(response.objects(models::TOP_SYSTEM_CLASS).cloned().collect())
    }

    /// Create or update an EPG and bind it to its bridge and VMM domains
    ///
    /// Each write is an APIC upsert, so repeating the call converges to the
    /// same state. The VMM binding is read back because APIC accepts the
    /// relation even when the domain does not resolve.
    pub async fn create_epg(
        &self,
        name: &str,
        app: &str,
        tenant: &str,
        bd: &str,
        vmm: &str,
        vmm_type: &str,
    ) -> Result<(), ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, name);
        debug!("Saving EPG {}", epg_dn);
        let payload = models::epg_payload(
            &epg_dn,
            name,
            dn::EPG_DESCRIPTION,
            &dn::orchestrator_annotation(vmm_type),
        );
        self.post_mo(&epg_dn, &payload).await?;

        debug!("Binding EPG {} to bridge domain {}", epg_dn, bd);
        self.post_mo(&dn::child_dn(&epg_dn, dn::BD_RELATION_RN), &models::bd_relation_payload(bd))
            .await?;

        let vmm_dn = dn::vmm_domain_dn(vmm_type, vmm);
        debug!("Binding EPG {} to VMM domain {}", epg_dn, vmm_dn);
        self.post_mo(
            &dn::child_dn(&epg_dn, &dn::vmm_relation_rn(&vmm_dn)),
            &models::vmm_relation_payload(&vmm_dn),
        )
        .await?;

        let bindings = self.vmm_bindings(&epg_dn).await?;
        if !bindings.iter().any(|t_dn| *t_dn == vmm_dn) {
            return Err(ApicError::NotFound(format!(
                "VMM domain binding {vmm_dn} not readable on {epg_dn}"
            )));
        }
        Ok(())
    }

    /// Target DNs of the EPG's VMM domain relations
    pub async fn vmm_bindings(&self, epg_dn: &str) -> Result<Vec<String>, ApicError> {
        let path = format!(
            "/api/node/mo/{epg_dn}.json?query-target=children&target-subtree-class={}",
            models::VMM_RELATION_CLASS
        );
        let response = self.request(Method::GET, &path, None).await?;
        Ok(response.attribute_values(models::VMM_RELATION_CLASS, "tDn"))
    }

    /// Delete an EPG; a missing EPG is not an error
    pub async fn delete_epg(&self, name: &str, app: &str, tenant: &str) -> Result<(), ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, name);
        debug!("Deleting EPG {}", epg_dn);
        match self.request(Method::DELETE, &mo_path(&epg_dn), None).await {
            Ok(_) => Ok(()),
            Err(ApicError::NotFound(_)) => {
                debug!("EPG {} already absent", epg_dn);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Check whether an EPG exists
    pub async fn epg_exists(&self, name: &str, app: &str, tenant: &str) -> Result<bool, ApicError> {
        let epg_dn = dn::epg_dn(tenant, app, name);
        let response = match self.request(Method::GET, &mo_path(&epg_dn), None).await {
            Ok(response) => response,
            Err(ApicError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(response
            .objects(models::EPG_CLASS)
            .next()
            .and_then(|mo| mo.attr("dn"))
            .is_some_and(|dn| !dn.is_empty()))
    }

    /// Attach a consumed contract to an EPG
    pub async fn consume_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        let relation_dn = dn::child_dn(&dn::epg_dn(tenant, app, epg), &dn::consumer_rn(contract));
        debug!("Creating consumer relation {}", relation_dn);
        self.post_mo(&relation_dn, &models::contract_relation_payload(models::CONSUMER_CLASS, contract))
            .await
    }

    /// Attach a provided contract to an EPG
    pub async fn provide_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        let relation_dn = dn::child_dn(&dn::epg_dn(tenant, app, epg), &dn::provider_rn(contract));
        debug!("Creating provider relation {}", relation_dn);
        self.post_mo(&relation_dn, &models::contract_relation_payload(models::PROVIDER_CLASS, contract))
            .await
    }

    /// Contracts the EPG consumes
    pub async fn get_consumed_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        self.list_contracts(&dn::epg_dn(tenant, app, epg), models::CONSUMER_CLASS).await
    }

    /// Contracts the EPG provides
    pub async fn get_provided_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        self.list_contracts(&dn::epg_dn(tenant, app, epg), models::PROVIDER_CLASS).await
    }

    async fn list_contracts(&self, epg_dn: &str, class: &str) -> Result<Vec<String>, ApicError> {
        let path = format!("/api/node/class/{epg_dn}/{class}.json");
        match self.request(Method::GET, &path, None).await {
            Ok(response) => Ok(response.attribute_values(class, models::CONTRACT_NAME_ATTR)),
            Err(e) if e.is_missing_parent() => {
                debug!("EPG {} has no {} relations yet: {}", epg_dn, class, e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn post_mo(&self, dn: &str, payload: &Value) -> Result<(), ApicError> {
        self.request(Method::POST, &mo_path(dn), Some(payload)).await.map(|_| ())
    }

    /// Send one authenticated request and decode the APIC envelope
    ///
    /// A password session rejected with 401/403 is renewed once and the
    /// request replayed.
    async fn request(&self, method: Method, path: &str, payload: Option<&Value>) -> Result<ApicResponse, ApicError> {
        let body = payload.map(serde_json::to_string).transpose()?.unwrap_or_default();
        debug!("APIC {} {}", method, path);

        let cookie = self.auth_cookie(&method, path, &body).await?;
        let mut response = self.send(&method, path, &body, Some(&cookie)).await?;

        let status = response.status();
        if self.uses_password() && (status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN) {
            debug!("APIC session rejected ({}), logging in again", status);
            self.login().await?;
            let cookie = self.auth_cookie(&method, path, &body).await?;
            response = self.send(&method, path, &body, Some(&cookie)).await?;
        }

        let decoded = Self::decode(path, response).await;
        if let Err(e) = &decoded {
            debug!("APIC {} {} failed: {}", method, path, e);
        }
        decoded
    }

    async fn auth_cookie(&self, method: &Method, path: &str, body: &str) -> Result<String, ApicError> {
        match &self.credentials {
            Credentials::Certificate(signer) => signer.cookie(method.as_str(), path, body),
            Credentials::Password(_) => {
                let cached = self.token.read().await.clone();
                let token = match cached {
                    Some(token) => token,
                    None => self.login().await?,
                };
                Ok(session_cookie(&token))
            }
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        body: &str,
        cookie: Option<&str>,
    ) -> Result<reqwest::Response, ApicError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(ACCEPT, "application/json");
        if let Some(cookie) = cookie {
            request = request.header(COOKIE, cookie);
        }
        if !body.is_empty() {
            request = request.header(CONTENT_TYPE, "application/json").body(body.to_string());
        }
        Ok(request.send().await?)
    }

    async fn decode(path: &str, response: reqwest::Response) -> Result<ApicResponse, ApicError> {
        let status = response.status();
        let text = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Err(ApicError::NotFound(path.to_string()));
        }

        let parsed = if text.trim().is_empty() {
            Ok(ApicResponse::default())
        } else {
            serde_json::from_str::<ApicResponse>(&text)
        };

        if let Ok(envelope) = &parsed {
            if let Some((code, message)) = envelope.error() {
                return Err(ApicError::Api { code, text: message });
            }
        }

        if !status.is_success() {
            return Err(ApicError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(parsed?)
    }
}

fn mo_path(dn: &str) -> String {
    format!("/api/node/mo/{dn}.json")
}

#[async_trait::async_trait]
impl ApicClientTrait for ApicClient {
    async fn create_epg(
        &self,
        name: &str,
        app: &str,
        tenant: &str,
        bd: &str,
        vmm: &str,
        vmm_type: &str,
    ) -> Result<(), ApicError> {
        self.create_epg(name, app, tenant, bd, vmm, vmm_type).await
    }

    async fn delete_epg(&self, name: &str, app: &str, tenant: &str) -> Result<(), ApicError> {
        self.delete_epg(name, app, tenant).await
    }

    async fn epg_exists(&self, name: &str, app: &str, tenant: &str) -> Result<bool, ApicError> {
        self.epg_exists(name, app, tenant).await
    }

    async fn consume_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        self.consume_contract(epg, app, tenant, contract).await
    }

    async fn provide_contract(&self, epg: &str, app: &str, tenant: &str, contract: &str) -> Result<(), ApicError> {
        self.provide_contract(epg, app, tenant, contract).await
    }

    async fn get_consumed_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        self.get_consumed_contracts(epg, app, tenant).await
    }

    async fn get_provided_contracts(&self, epg: &str, app: &str, tenant: &str) -> Result<Vec<String>, ApicError> {
        self.get_provided_contracts(epg, app, tenant).await
    }
}
