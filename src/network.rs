//! Network access for the interception layer.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;

use crate::cache::{Request, Response};

/// Transport used to reach the real network.
///
/// An `Err` means the request never produced a response (offline, DNS, timeout).
/// Error statuses are ordinary responses.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// `reqwest`-backed network client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(30))
      .user_agent(concat!("tablecache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
      .to_vec();

    debug!(url = %request.url, status, bytes = body.len(), "Network response");

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
