use std::net::{IpAddr, SocketAddr};

use serde_json::Value;

use crate::error::{ProxyError, ProxyResult};
use crate::registry::InProcessRegistry;
use crate::service::{ProxyReply, RequestBody, HEALTH_ENDPOINT};

/// Agent-side caller. Uses the in-process service when `(host, port)` is registered,
/// HTTP otherwise; replies are identical either way.
#[derive(Debug, Clone)]
pub struct CommProxyClient {
    host: String,
    port: u16,
    action_endpoint: String,
    registry: InProcessRegistry,
    http: reqwest::Client,
}

impl CommProxyClient {
    pub fn new(
        host: &str,
        port: u16,
        action_endpoint: &str,
        registry: InProcessRegistry,
    ) -> ProxyResult<Self> {
        if !action_endpoint.starts_with('/') {
            return Err(ProxyError::InvalidAddress(action_endpoint.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            action_endpoint: action_endpoint.to_string(),
            registry,
            http: reqwest::Client::new(),
        })
    }

    pub async fn get_health(&self) -> ProxyResult<ProxyReply> {
        self.call("GET", HEALTH_ENDPOINT, None).await
    }

    pub async fn post_act(&self, action: &Value) -> ProxyResult<ProxyReply> {
        let body = serde_json::to_vec(action)
            .map_err(|e| droidaudit_core::AuditError::Internal(e.to_string()))?;
        self.call("POST", &self.action_endpoint, Some(body)).await
    }

    /// Sends raw bytes to the action endpoint, for callers replaying captured bodies.
    pub async fn post_act_raw(&self, body: Vec<u8>) -> ProxyResult<ProxyReply> {
        self.call("POST", &self.action_endpoint, Some(body)).await
    }

    async fn call(&self, method: &str, path: &str, body: Option<Vec<u8>>) -> ProxyResult<ProxyReply> {
        if let Some(service) = self.registry.lookup(&self.host, self.port) {
            let bytes = body.unwrap_or_default();
            return service.handle(method, path, RequestBody::Bytes(&bytes));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| ProxyError::InvalidAddress(self.host.clone()))?;
        let addr = SocketAddr::new(ip, self.port);
        let url = format!("http://{addr}{path}");
        let request = match (method, body) {
            ("POST", Some(b)) => self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(b),
            ("POST", None) => self.http.post(url),
            _ => self.http.get(url),
        };
        let response = request
            .send()
            .await
            .map_err(|source| ProxyError::Http { addr, source })?;
        let status = response.status().as_u16();
        let body = response
            .json::<Value>()
            .await
            .map_err(|source| ProxyError::Http { addr, source })?;
        Ok(ProxyReply { status, body })
    }
}
