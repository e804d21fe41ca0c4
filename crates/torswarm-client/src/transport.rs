use std::collections::HashMap;
use std::error::Error as _;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::{Client, Proxy};

use torswarm_core::circuit::SocksEndpoint;
use torswarm_core::error::TransportError;
use torswarm_core::traits::{FetchRequest, FetchResponse, Transport};

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; rv:128.0) Gecko/20100101 Firefox/128.0";

/// HTTP transport using reqwest, one client per SOCKS endpoint and generation.
///
/// Clients are built lazily and reused while the circuit generation stays the
/// same. A new generation replaces the client, dropping its pooled
/// keep-alive connections, and authenticates to the proxy with new SOCKS
/// credentials so Tor routes it over a different circuit. DNS is resolved by
/// Tor (`socks5h`), never locally.
#[derive(Clone)]
pub struct ReqwestTransport {
    clients: Arc<Mutex<HashMap<SocksEndpoint, (u64, Client)>>>,
    user_agent: String,
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_user_agent(DEFAULT_USER_AGENT)
    }

    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            user_agent: user_agent.into(),
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<SocksEndpoint, (u64, Client)>> {
        self.clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn client_for(
        &self,
        endpoint: &SocksEndpoint,
        generation: u64,
    ) -> Result<Client, TransportError> {
        if let Some((cached, client)) = self.lock_clients().get(endpoint)
            && *cached == generation
        {
            return Ok(client.clone());
        }

        let proxy = Proxy::all(endpoint.isolated_proxy_url(generation))
            .map_err(|e| TransportError::InvalidRequest(format!("bad proxy {endpoint}: {e}")))?;
        let client = Client::builder()
            .proxy(proxy)
            .user_agent(&self.user_agent)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build client: {e}")))?;

        let mut clients = self.lock_clients();
        match clients.get(endpoint) {
            Some((cached, client)) if *cached == generation => Ok(client.clone()),
            _ => {
                tracing::debug!(%endpoint, generation, "Built HTTP client for circuit generation");
                clients.insert(endpoint.clone(), (generation, client.clone()));
                Ok(client)
            }
        }
    }
}

impl Transport for ReqwestTransport {
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        endpoint: &SocksEndpoint,
    ) -> Result<FetchResponse, TransportError> {
        let client = self.client_for(endpoint, request.generation)?;

        let mut builder = client.get(request.url).timeout(request.timeout);
        for (name, value) in request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let timeout_ms = request.timeout.as_millis() as u64;
        let response = builder
            .send()
            .await
            .map_err(|e| map_error(&e, timeout_ms))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_error(&e, timeout_ms))?;

        Ok(FetchResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Full error text including every source, e.g. the SOCKS reply behind a connect error.
fn error_chain(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn map_error(error: &reqwest::Error, timeout_ms: u64) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout(timeout_ms);
    }
    if error.is_builder() {
        return TransportError::InvalidRequest(error_chain(error));
    }

    let text = error_chain(error);
    let lower = text.to_lowercase();
    if lower.contains("socks") || lower.contains("proxy") {
        TransportError::Proxy(text)
    } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake")
    {
        TransportError::Tls(text)
    } else if error.is_connect() {
        TransportError::Connect(text)
    } else {
        TransportError::Other(text)
    }
}
