//! Reachability probes.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{ConnectivityState, TransportKind};

/// A platform reachability primitive.
///
/// `Ok` carries the observed state, including "unreachable". `Err` means the
/// primitive itself broke and the monitor falls back to its fail policy.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
  async fn probe(&self) -> Result<ConnectivityState>;
}

/// Probes reachability with an HTTP HEAD request.
///
/// Any response, whatever its status, counts as reachable. Connect and timeout
/// failures count as unreachable. Anything else is a probe failure.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: &str, timeout: Duration) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid probe URL {}: {}", url, e))?;
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .connect_timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build probe client: {}", e))?;

    Ok(Self { client, url })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
  async fn probe(&self) -> Result<ConnectivityState> {
    match self.client.head(self.url.clone()).send().await {
      Ok(response) => {
        debug!(url = %self.url, status = %response.status(), "probe reached host");
        Ok(ConnectivityState::online(TransportKind::Unknown))
      }
      Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
        debug!(url = %self.url, error = %e, "probe could not reach host");
        Ok(ConnectivityState::offline())
      }
      Err(e) => Err(eyre!("Probe of {} failed: {}", self.url, e)),
    }
  }
}
