//! Cluster management API seam.
//!
//! The harness reads layout and status, submits the initial layout, and adds
//! or removes members through [`ManagementClient`]. Deployments talk to the
//! members' management gateway over HTTP ([`HttpManagementClient`]); harness
//! self-tests use [`SimCluster`](crate::sim::SimCluster).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fault_types::{ClusterStatusReport, Layout, NodeId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Default per-request timeout for management calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Management API errors.
#[derive(Debug, Clone, Error)]
pub enum ManagementError {
    /// No endpoint could be reached.
    #[error("no management endpoint reachable: {0}")]
    Unreachable(String),

    /// Request failed with an unexpected HTTP status.
    #[error("http error: {0}")]
    Http(String),

    /// The cluster refused the request (e.g. no quorum, stale epoch).
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Response body did not match the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
}

/// Operations the harness needs from the cluster's management API.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Current layout (may be served from cache).
    async fn get_layout(&self) -> Result<Layout, ManagementError>;

    /// Current cluster status report.
    async fn get_cluster_status(&self) -> Result<ClusterStatusReport, ManagementError>;

    /// Drop any cached layout so the next `get_layout` is fresh.
    fn invalidate_layout_cache(&self);

    /// Submit the initial layout.
    async fn bootstrap(&self, layout: &Layout) -> Result<(), ManagementError>;

    /// Add `endpoint` to the cluster.
    async fn add_node(
        &self,
        endpoint: &NodeId,
        retries: u32,
        timeout: Duration,
        poll_period: Duration,
    ) -> Result<(), ManagementError>;

    /// Remove `endpoint` from the cluster.
    async fn remove_node(
        &self,
        endpoint: &NodeId,
        retries: u32,
        timeout: Duration,
        poll_period: Duration,
    ) -> Result<(), ManagementError>;

    /// Reset a node's local state so it can rejoin.
    async fn reset(&self, endpoint: &NodeId) -> Result<(), ManagementError>;
}

/// Builds a [`ManagementClient`] for a set of node endpoints.
pub trait ManagementConnector: Send + Sync {
    /// Connect to the cluster formed by `endpoints`.
    fn connect(&self, endpoints: &[NodeId]) -> Result<Arc<dyn ManagementClient>, ManagementError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MembershipRequest<'a> {
    endpoint: &'a str,
    retries: u32,
    timeout_ms: u64,
    poll_period_ms: u64,
}

#[derive(Debug, Serialize)]
struct ResetRequest<'a> {
    endpoint: &'a str,
}

/// JSON-over-HTTP client for the members' management gateway.
///
/// Tries endpoints in order and moves to the next one when a member cannot
/// be reached. The last endpoint that answered is tried first next time.
pub struct HttpManagementClient {
    endpoints: Vec<NodeId>,
    http: reqwest::Client,
    preferred: Mutex<usize>,
    layout_cache: Mutex<Option<Layout>>,
}

impl HttpManagementClient {
    /// Create a client for `endpoints`.
    pub fn new(endpoints: &[NodeId]) -> Result<Self, ManagementError> {
        if endpoints.is_empty() {
            return Err(ManagementError::Unreachable("no endpoints".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ManagementError::Http(e.to_string()))?;
        Ok(Self {
            endpoints: endpoints.to_vec(),
            http,
            preferred: Mutex::new(0),
            layout_cache: Mutex::new(None),
        })
    }

    /// Build the URL of a management resource on `endpoint`.
    pub fn url(endpoint: &NodeId, path: &str) -> String {
        format!("http://{}/management/{}", endpoint, path)
    }

    fn order(&self) -> Vec<usize> {
        let start = *self.preferred.lock().unwrap_or_else(|e| e.into_inner());
        (0..self.endpoints.len())
            .map(|i| (start + i) % self.endpoints.len())
            .collect()
    }

    async fn call(
        &self,
        build: impl Fn(&reqwest::Client, &NodeId) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ManagementError> {
        let mut failures = Vec::new();

        for i in self.order() {
            let endpoint = &self.endpoints[i];
            let response = match build(&self.http, endpoint).send().await {
                Ok(response) => response,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!(%endpoint, error = %e, "management endpoint unreachable");
                    failures.push(format!("{}: {}", endpoint, e));
                    continue;
                }
                Err(e) => return Err(ManagementError::Http(e.to_string())),
            };

            *self.preferred.lock().unwrap_or_else(|e| e.into_inner()) = i;

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() || status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
                return Err(ManagementError::Rejected(format!("{}: {}", status, body)));
            }
            return Err(ManagementError::Http(format!("{}: {}", status, body)));
        }

        Err(ManagementError::Unreachable(failures.join("; ")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ManagementError> {
        let response = self
            .call(|http, endpoint| http.get(Self::url(endpoint, path)))
            .await?;
        response
            .json()
            .await
            .map_err(|e| ManagementError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ManagementClient for HttpManagementClient {
    async fn get_layout(&self) -> Result<Layout, ManagementError> {
        if let Some(layout) = self
            .layout_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(layout);
        }
        let layout: Layout = self.get_json("layout").await?;
        *self.layout_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(layout.clone());
        Ok(layout)
    }

    async fn get_cluster_status(&self) -> Result<ClusterStatusReport, ManagementError> {
        self.get_json("status").await
    }

    fn invalidate_layout_cache(&self) {
        *self.layout_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    async fn bootstrap(&self, layout: &Layout) -> Result<(), ManagementError> {
        self.call(|http, endpoint| http.post(Self::url(endpoint, "bootstrap")).json(layout))
            .await?;
        self.invalidate_layout_cache();
        Ok(())
    }

    async fn add_node(
        &self,
        endpoint: &NodeId,
        retries: u32,
        timeout: Duration,
        poll_period: Duration,
    ) -> Result<(), ManagementError> {
        let request = MembershipRequest {
            endpoint: endpoint.as_str(),
            retries,
            timeout_ms: timeout.as_millis() as u64,
            poll_period_ms: poll_period.as_millis() as u64,
        };
        self.call(|http, target| {
            http.post(Self::url(target, "nodes"))
                .timeout(timeout + REQUEST_TIMEOUT)
                .json(&request)
        })
        .await?;
        self.invalidate_layout_cache();
        Ok(())
    }

    async fn remove_node(
        &self,
        endpoint: &NodeId,
        retries: u32,
        timeout: Duration,
        poll_period: Duration,
    ) -> Result<(), ManagementError> {
        let request = MembershipRequest {
            endpoint: endpoint.as_str(),
            retries,
            timeout_ms: timeout.as_millis() as u64,
            poll_period_ms: poll_period.as_millis() as u64,
        };
        self.call(|http, target| {
            http.delete(Self::url(target, "nodes"))
                .timeout(timeout + REQUEST_TIMEOUT)
                .json(&request)
        })
        .await?;
        self.invalidate_layout_cache();
        Ok(())
    }

    async fn reset(&self, endpoint: &NodeId) -> Result<(), ManagementError> {
        let request = ResetRequest {
            endpoint: endpoint.as_str(),
        };
        self.call(|http, target| http.post(Self::url(target, "reset")).json(&request))
            .await?;
        self.invalidate_layout_cache();
        Ok(())
    }
}

/// [`ManagementConnector`] producing [`HttpManagementClient`]s.
#[derive(Debug, Default, Clone)]
pub struct HttpConnector;

impl ManagementConnector for HttpConnector {
    fn connect(&self, endpoints: &[NodeId]) -> Result<Arc<dyn ManagementClient>, ManagementError> {
        Ok(Arc::new(HttpManagementClient::new(endpoints)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<NodeId> {
        vec![
            NodeId::from_parts("127.0.0.1", 1),
            NodeId::from_parts("127.0.0.1", 2),
            NodeId::from_parts("127.0.0.1", 3),
        ]
    }

    #[test]
    fn url_layout() {
        assert_eq!(
            HttpManagementClient::url(&NodeId::from_parts("172.29.0.10", 9000), "layout"),
            "http://172.29.0.10:9000/management/layout"
        );
    }

    #[test]
    fn empty_endpoints_rejected() {
        assert!(matches!(
            HttpManagementClient::new(&[]),
            Err(ManagementError::Unreachable(_))
        ));
    }

    #[test]
    fn order_starts_at_preferred() {
        let client = HttpManagementClient::new(&endpoints()).unwrap();
        assert_eq!(client.order(), vec![0, 1, 2]);
        *client.preferred.lock().unwrap() = 2;
        assert_eq!(client.order(), vec![2, 0, 1]);
    }

    #[test]
    fn membership_request_shape() {
        let request = MembershipRequest {
            endpoint: "172.29.0.13:9000",
            retries: 3,
            timeout_ms: 300_000,
            poll_period_ms: 1000,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["endpoint"], "172.29.0.13:9000");
        assert_eq!(json["timeoutMs"], 300_000);
        assert_eq!(json["pollPeriodMs"], 1000);
    }

    #[tokio::test]
    async fn all_endpoints_down_is_unreachable() {
        // Port 1 on loopback refuses connections.
        let client = HttpManagementClient::new(&endpoints()[..1]).unwrap();
        let err = client.get_cluster_status().await.unwrap_err();
        assert!(matches!(err, ManagementError::Unreachable(_)));
    }
}
