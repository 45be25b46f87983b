//! Hypervisor REST client for VM power control.
//!
//! Speaks the vSphere Automation API: a session token from `POST /api/session`
//! is sent in `vmware-api-session-id` on every call. Power actions check the
//! current state first so repeating one is a no-op.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::HypervisorConfig;
use crate::node::PowerState;

const SESSION_HEADER: &str = "vmware-api-session-id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the hypervisor API.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// HTTP request failed
    #[error("http error: {0}")]
    Http(String),

    /// Connection to the hypervisor failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// VM not known to the hypervisor
    #[error("vm not found: {0}")]
    VmNotFound(String),

    /// Unexpected response body
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HypervisorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            HypervisorError::ConnectionFailed(e.to_string())
        } else if e.is_decode() {
            HypervisorError::Decode(e.to_string())
        } else {
            HypervisorError::Http(e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

/// Map an API power state string to [`PowerState`].
pub fn parse_power_state(state: &str) -> Result<PowerState, HypervisorError> {
    match state {
        "POWERED_ON" => Ok(PowerState::On),
        "POWERED_OFF" => Ok(PowerState::Off),
        "SUSPENDED" => Ok(PowerState::Suspended),
        other => Err(HypervisorError::Decode(format!("power state {:?}", other))),
    }
}

/// Client for the hypervisor's VM power API.
pub struct HypervisorClient {
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    session: Mutex<Option<String>>,
}

impl HypervisorClient {
    /// Build a client. Does not log in until the first call.
    pub fn new(config: &HypervisorConfig, password: String) -> Result<Self, HypervisorError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password,
            http,
            session: Mutex::new(None),
        })
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL of a VM's power resource.
    pub fn power_url(&self, vm: &str) -> String {
        format!("{}/api/vcenter/vm/{}/power", self.base_url, vm)
    }

    /// URL of a VM's guest power resource.
    pub fn guest_power_url(&self, vm: &str) -> String {
        format!("{}/api/vcenter/vm/{}/guest/power", self.base_url, vm)
    }

    async fn token(&self) -> Result<String, HypervisorError> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}/api/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(HypervisorError::Auth(self.username.clone()));
        }
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HypervisorError::Http(body));
        }

        let token: String = response.json().await?;
        tracing::debug!(url = %self.base_url, "hypervisor session established");
        *session = Some(token.clone());
        Ok(token)
    }

    async fn forget_session(&self) {
        *self.session.lock().await = None;
    }

    async fn send(
        &self,
        vm: &str,
        build: impl Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, HypervisorError> {
        // One retry with a fresh session if the token expired.
        for attempt in 0..2 {
            let token = self.token().await?;
            let response = build(&self.http, &token).send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED && attempt == 0 {
                self.forget_session().await;
                continue;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(HypervisorError::VmNotFound(vm.to_string()));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(HypervisorError::Http(format!("{}: {}", status, body)));
            }
            return Ok(response);
        }
        Err(HypervisorError::Auth(self.username.clone()))
    }

    /// Current power state of `vm`.
    pub async fn power_state(&self, vm: &str) -> Result<PowerState, HypervisorError> {
        let url = self.power_url(vm);
        let response = self
            .send(vm, |http, token| http.get(&url).header(SESSION_HEADER, token))
            .await?;
        let info: PowerInfo = response.json().await?;
        parse_power_state(&info.state)
    }

    async fn power_action(&self, vm: &str, action: &str) -> Result<(), HypervisorError> {
        let url = format!("{}?action={}", self.power_url(vm), action);
        self.send(vm, |http, token| http.post(&url).header(SESSION_HEADER, token))
            .await?;
        tracing::info!(%vm, %action, "hypervisor power action");
        Ok(())
    }

    /// Power `vm` on. No-op if already on; resumes a suspended VM.
    pub async fn power_on(&self, vm: &str) -> Result<(), HypervisorError> {
        if self.power_state(vm).await? == PowerState::On {
            return Ok(());
        }
        self.power_action(vm, "start").await
    }

    /// Hard power `vm` off. No-op if already off.
    pub async fn power_off(&self, vm: &str) -> Result<(), HypervisorError> {
        if self.power_state(vm).await? == PowerState::Off {
            return Ok(());
        }
        self.power_action(vm, "stop").await
    }

    /// Hard reset a powered-on `vm`.
    pub async fn reset(&self, vm: &str) -> Result<(), HypervisorError> {
        self.power_action(vm, "reset").await
    }

    /// Ask the guest OS to reboot (needs guest tools).
    pub async fn guest_reboot(&self, vm: &str) -> Result<(), HypervisorError> {
        let url = format!("{}?action=reboot", self.guest_power_url(vm));
        self.send(vm, |http, token| http.post(&url).header(SESSION_HEADER, token))
            .await?;
        tracing::info!(%vm, "guest reboot requested");
        Ok(())
    }
}
