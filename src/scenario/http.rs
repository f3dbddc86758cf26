use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, Request, Uri};
use hyper::body::Bytes;
use url::Url;

use crate::engine::http_client::RequestTimings;
use crate::stats::{Tags, HTTP_REQS, HTTP_REQ_DURATION, HTTP_REQ_FAILED};

use super::ScenarioShared;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One request of a batch (or a single request), in caller-specified order.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub method: String,
    pub url: String,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            body: None,
            headers: HashMap::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        let mut spec = Self::new("POST", url);
        spec.body = Some(body.into());
        spec
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one request. A transport failure or timeout is represented as a
/// response with `status == 0` and `error` set, never as a panic or a
/// batch-level failure.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    pub error: Option<String>,
    pub timings: RequestTimings,
}

impl Response {
    fn failed(error: String, duration: Duration) -> Self {
        Self {
            status: 0,
            headers: HashMap::new(),
            body: Bytes::new(),
            error: Some(error),
            timings: RequestTimings { duration, ..Default::default() },
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Parse the body as JSON and resolve a dot-separated path; `""` yields
    /// the whole document. Array segments are numeric indices.
    pub fn json(&self, path: &str) -> Option<serde_json::Value> {
        let mut value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        if path.is_empty() {
            return Some(value);
        }
        for segment in path.split('.') {
            value = match value {
                serde_json::Value::Object(mut map) => map.remove(segment)?,
                serde_json::Value::Array(mut arr) => {
                    let idx: usize = segment.parse().ok()?;
                    if idx >= arr.len() {
                        return None;
                    }
                    arr.swap_remove(idx)
                }
                _ => return None,
            };
        }
        Some(value)
    }

    pub fn body_contains(&self, needle: &str) -> bool {
        self.body_text().contains(needle)
    }

    /// Header lookup, falling back to a case-insensitive scan; with `value`
    /// the header must also match it exactly.
    pub fn has_header(&self, name: &str, value: Option<&str>) -> bool {
        let matches = |v: &String| value.is_none_or(|expected| v.as_str() == expected);
        if let Some(v) = self.headers.get(name) {
            return matches(v);
        }
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .any(|(k, v)| k.to_lowercase() == name_lower && matches(v))
    }
}

/// Convert a url::Url to http::Uri using component extraction.
/// This avoids the full string re-parsing that Uri::try_from(String) performs.
fn url_to_uri(url: &Url) -> Option<Uri> {
    let scheme = url.scheme();
    let host = url.host_str()?;

    let authority = if let Some(port) = url.port() {
        format!("{}:{}", host, port)
    } else {
        host.to_string()
    };

    let path = url.path();
    let path_and_query = if let Some(query) = url.query() {
        format!("{}?{}", path, query)
    } else {
        path.to_string()
    };

    Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path_and_query.as_str())
        .build()
        .ok()
}

/// HTTP facade handed to scenarios through their context. Records the
/// built-in request metrics for every call.
#[derive(Clone)]
pub struct Http {
    shared: Arc<ScenarioShared>,
}

impl Http {
    pub(crate) fn new(shared: Arc<ScenarioShared>) -> Self {
        Self { shared }
    }

    pub async fn get(&self, url: impl Into<String>) -> Response {
        self.request(RequestSpec::get(url)).await
    }

    pub async fn post(&self, url: impl Into<String>, body: impl Into<String>) -> Response {
        self.request(RequestSpec::post(url, body)).await
    }

    pub async fn put(&self, url: impl Into<String>, body: impl Into<String>) -> Response {
        self.request(RequestSpec::new("PUT", url).with_body(body)).await
    }

    pub async fn delete(&self, url: impl Into<String>) -> Response {
        self.request(RequestSpec::new("DELETE", url)).await
    }

    /// Issue one request; failures fold into the returned `Response`.
    pub async fn request(&self, spec: RequestSpec) -> Response {
        let method = spec.method.to_uppercase();
        let started = Instant::now();
        let response = match self.dispatch(&spec).await {
            Ok((resp, timings)) => {
                let status = resp.status().as_u16();
                let mut headers = HashMap::with_capacity(resp.headers().len());
                for (name, val) in resp.headers() {
                    if let Ok(val_str) = val.to_str() {
                        headers.insert(name.to_string(), val_str.to_string());
                    }
                }
                Response {
                    status,
                    headers,
                    body: resp.into_body(),
                    error: None,
                    timings,
                }
            }
            Err(error) => Response::failed(error, started.elapsed()),
        };
        self.record(&method, &response);
        response
    }

    /// Execute all requests concurrently; the result list has the same length
    /// and order as the input regardless of completion order.
    pub async fn batch(&self, specs: Vec<RequestSpec>) -> Vec<Response> {
        futures::future::join_all(specs.into_iter().map(|spec| self.request(spec))).await
    }

    async fn dispatch(
        &self,
        spec: &RequestSpec,
    ) -> Result<(http::Response<Bytes>, RequestTimings), String> {
        let url = Url::parse(&spec.url).map_err(|e| format!("invalid url: {}", e))?;
        let uri = url_to_uri(&url).ok_or_else(|| format!("invalid url: {}", spec.url))?;
        let method = Method::from_bytes(spec.method.to_uppercase().as_bytes())
            .map_err(|_| format!("invalid method: {}", spec.method))?;

        let mut builder = Request::builder().method(method).uri(uri);
        for (k, v) in &spec.headers {
            builder = builder.header(k, v);
        }
        let req = builder
            .body(spec.body.clone().unwrap_or_default())
            .map_err(|e| e.to_string())?;

        let timeout = spec.timeout.unwrap_or(DEFAULT_TIMEOUT);
        match tokio::time::timeout(timeout, self.shared.client.request(req)).await {
            Ok(Ok(pair)) => Ok(pair),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("request timeout".to_string()),
        }
    }

    fn record(&self, method: &str, response: &Response) {
        let mut tags = Tags::new();
        tags.insert("method".to_string(), method.to_string());
        tags.insert("status".to_string(), response.status.to_string());
        let group = self.shared.group_path.lock().clone();
        if !group.is_empty() {
            tags.insert("group".to_string(), group);
        }
        let registry = &self.shared.registry;
        let _ = registry.counter_add(HTTP_REQS, tags.clone(), 1.0);
        let _ = registry.trend_add(
            HTTP_REQ_DURATION,
            tags.clone(),
            response.timings.duration.as_secs_f64() * 1000.0,
        );
        let _ = registry.rate_add(HTTP_REQ_FAILED, tags, response.is_error());
    }
}
