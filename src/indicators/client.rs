use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use std::future::Future;

use crate::error::FetchError;

/// Status and body of an HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl HttpResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A single GET against an upstream. Timeouts are applied by the caller,
/// which drops the returned future to abort the request.
pub trait Transport: Send + Sync + 'static {
  fn get(&self, url: &str) -> impl Future<Output = Result<HttpResponse, FetchError>> + Send;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let client = reqwest::Client::builder()
      .user_agent(concat!("PainelODSSergipe/", env!("CARGO_PKG_VERSION")))
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Transport for HttpTransport {
  async fn get(&self, url: &str) -> Result<HttpResponse, FetchError> {
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| FetchError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::Transport(e.to_string()))?;

    Ok(HttpResponse {
      status,
      body: body.to_vec(),
    })
  }
}
