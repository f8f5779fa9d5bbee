//! Reverse proxy for forwarding requests to inference backends, plus the
//! reachability probe used for routing decisions.

use crate::types::GatewayError;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::{debug, error};

/// Shared forwarding client. Cheap to clone, safe to share without locking.
#[derive(Clone)]
pub struct Proxy {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    probe_path: String,
    probe_timeout: Duration,
}

impl Proxy {
    pub fn new(probe_path: impl Into<String>, probe_timeout: Duration) -> Self {
        // Plain http for local tiers, TLS for hosted ones
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self {
            client,
            probe_path: probe_path.into(),
            probe_timeout,
        }
    }

    /// Forward a request to `base_url`, keeping its path, query, headers and
    /// body. The backend's status and body are passed through unchanged.
    pub async fn forward(
        &self,
        mut req: Request<Body>,
        base_url: &str,
    ) -> Result<Response<Body>, GatewayError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        let uri: Uri = join(base_url, &path_and_query)
            .parse()
            .map_err(|e| GatewayError::BackendConnection(format!("invalid backend URL: {}", e)))?;

        *req.uri_mut() = uri;
        req.headers_mut().remove("host");

        let resp = self.client.request(req).await.map_err(|e| {
            error!(backend = %base_url, error = %e, "Proxy error");
            GatewayError::BackendConnection(e.to_string())
        })?;
        let (parts, body) = resp.into_parts();
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Bounded liveness check: `GET {base_url}{probe_path}` must answer 2xx
    /// within the probe timeout.
    pub async fn probe(&self, base_url: &str) -> bool {
        let Ok(uri) = join(base_url, &self.probe_path).parse::<Uri>() else {
            return false;
        };
        let Ok(request) = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
        else {
            return false;
        };

        match tokio::time::timeout(self.probe_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(e)) => {
                debug!(backend = %base_url, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(backend = %base_url, "Probe timed out");
                false
            }
        }
    }
}

fn join(base_url: &str, path_and_query: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path_and_query)
}

/// Build a JSON response with the given status.
pub fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    let mut resp = Response::new(Body::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    resp
}
