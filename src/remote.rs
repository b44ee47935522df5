//! HTTP data-access client for the catalog API.
//!
//! This is the network side the sync layer is handed: it fetches JSON for
//! read-through and applies mutations for write-through and queue replay.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::RemoteConfig;
use crate::queue::{resource_id_of, MutationKind, MutationRecord};
use crate::sync::RemoteApplier;

/// Catalog API client
#[derive(Clone)]
pub struct HttpClient {
  client: reqwest::Client,
  base: Url,
  token: Option<String>,
}

impl HttpClient {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let base_url = config
      .base_url
      .as_deref()
      .ok_or_else(|| eyre!("No remote.base_url configured"))?;
    let base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid remote.base_url {}: {}", base_url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("remote.base_url {} cannot be used as a base", base_url));
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  /// Build `base/segment/segment...`, escaping each segment.
  fn endpoint(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.base.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Base URL {} cannot take a path", self.base))?
      .pop_if_empty()
      .extend(segments.iter().flat_map(|s| s.split('/')).filter(|s| !s.is_empty()));
    Ok(url)
  }

  fn fetch_url(&self, path: &str) -> Result<Url> {
    let (path, query) = match path.split_once('?') {
      Some((p, q)) => (p, Some(q)),
      None => (path, None),
    };
    let mut url = self.endpoint(&[path])?;
    url.set_query(query);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// GET a JSON document at `path` relative to the base URL.
  ///
  /// `path` may carry a query string, e.g. `listings?category=bikes`.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = self.fetch_url(path)?;
    debug!(%url, "fetching");

    let response = self
      .request(Method::GET, url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Fetch of {} rejected: {}", url, e))?;

    response
      .json::<T>()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  /// Apply a write directly.
  ///
  /// `idempotency_key` is sent as `Idempotency-Key` so the server can drop
  /// replays of a mutation it already accepted.
  pub async fn send(
    &self,
    kind: MutationKind,
    target: &str,
    payload: &Value,
    idempotency_key: Option<&str>,
  ) -> Result<()> {
    let (method, url) = self.route(kind, target, payload)?;
    debug!(%method, %url, "sending mutation");

    let mut builder = self.request(method, url.clone());
    if kind != MutationKind::Delete {
      builder = builder.json(payload);
    }
    if let Some(key) = idempotency_key {
      builder = builder.header("Idempotency-Key", key);
    }

    builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to {} {}: {}", kind, url, e))?
      .error_for_status()
      .map_err(|e| eyre!("{} {} rejected: {}", kind, url, e))?;

    Ok(())
  }

  /// Method and URL for a mutation.
  ///
  /// Creates post to the collection; updates and deletes address the resource
  /// by the payload's `id`.
  fn route(&self, kind: MutationKind, target: &str, payload: &Value) -> Result<(Method, Url)> {
    let id = || {
      resource_id_of(payload).ok_or_else(|| eyre!("{} on {} needs an \"id\" in its payload", kind, target))
    };

    match kind {
      MutationKind::Create => Ok((Method::POST, self.endpoint(&[target])?)),
      MutationKind::Update => Ok((Method::PATCH, self.endpoint(&[target, &id()?])?)),
      MutationKind::Delete => Ok((Method::DELETE, self.endpoint(&[target, &id()?])?)),
    }
  }
}

#[async_trait]
impl RemoteApplier for HttpClient {
  async fn apply(&self, record: &MutationRecord) -> Result<()> {
    self
      .send(record.kind, &record.target, &record.payload, Some(&record.id))
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn client(base: &str) -> HttpClient {
    HttpClient::new(
      &RemoteConfig {
        base_url: Some(base.to_string()),
        timeout_ms: 1000,
      },
      None,
    )
    .unwrap()
  }

  #[test]
  fn requires_base_url() {
    assert!(HttpClient::new(&RemoteConfig::default(), None).is_err());
    assert!(HttpClient::new(
      &RemoteConfig {
        base_url: Some("mailto:someone@example.com".into()),
        timeout_ms: 1000
      },
      None
    )
    .is_err());
  }

  #[test]
  fn routes_mutations() {
    let c = client("https://api.example.com/v1");

    let (method, url) = c
      .route(MutationKind::Create, "listings", &json!({"title": "bike"}))
      .unwrap();
    assert_eq!(method, Method::POST);
    assert_eq!(url.as_str(), "https://api.example.com/v1/listings");

    let (method, url) = c
      .route(MutationKind::Update, "listings", &json!({"id": "p1", "price": 500}))
      .unwrap();
    assert_eq!(method, Method::PATCH);
    assert_eq!(url.as_str(), "https://api.example.com/v1/listings/p1");

    let (method, url) = c
      .route(MutationKind::Delete, "listings", &json!({"id": 42}))
      .unwrap();
    assert_eq!(method, Method::DELETE);
    assert_eq!(url.as_str(), "https://api.example.com/v1/listings/42");

    assert!(c.route(MutationKind::Update, "listings", &json!({})).is_err());
  }

  #[test]
  fn endpoint_handles_slashes_and_escaping() {
    let c = client("https://api.example.com/v1/");
    assert_eq!(
      c.endpoint(&["/listings/p1"]).unwrap().as_str(),
      "https://api.example.com/v1/listings/p1"
    );
    assert_eq!(
      c.endpoint(&["listings", "a b"]).unwrap().as_str(),
      "https://api.example.com/v1/listings/a%20b"
    );
    assert_eq!(
      c.fetch_url("listings?category=bikes&sort=price").unwrap().as_str(),
      "https://api.example.com/v1/listings?category=bikes&sort=price"
    );
  }
}
