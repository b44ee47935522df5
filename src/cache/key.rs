//! Cache keys for catalog reads.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::traits::QueryKey;

/// Cache key for a catalog read.
///
/// Query-shaped keys are hashed so that equivalent requests share one cache
/// entry: filter order and spacing never matter, and neither does the case of
/// filter names, sort fields or search text. Filter values keep their case,
/// since ids and SKUs are case-sensitive. Every key starts with its collection
/// so a collection's entries can be dropped together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogKey {
  /// A filtered, sorted page of a collection
  Listings {
    collection: String,
    filters: BTreeMap<String, String>,
    sort: Option<String>,
    page: Option<u32>,
  },
  /// Free-text search within a collection
  Search { collection: String, text: String },
  /// One resource by id
  Resource { collection: String, id: String },
}

impl CatalogKey {
  pub fn listings(collection: impl Into<String>) -> Self {
    Self::Listings {
      collection: collection.into(),
      filters: BTreeMap::new(),
      sort: None,
      page: None,
    }
  }

  pub fn resource(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self::Resource {
      collection: collection.into(),
      id: id.into(),
    }
  }

  pub fn search(collection: impl Into<String>, text: impl Into<String>) -> Self {
    Self::Search {
      collection: collection.into(),
      text: text.into(),
    }
  }

  /// Add a filter. Only meaningful for `Listings`.
  pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    if let Self::Listings { filters, .. } = &mut self {
      filters.insert(field.into(), value.into());
    }
    self
  }

  pub fn sort(mut self, by: impl Into<String>) -> Self {
    if let Self::Listings { sort, .. } = &mut self {
      *sort = Some(by.into());
    }
    self
  }

  pub fn page(mut self, n: u32) -> Self {
    if let Self::Listings { page, .. } = &mut self {
      *page = Some(n);
    }
    self
  }

  pub fn collection(&self) -> &str {
    match self {
      Self::Listings { collection, .. }
      | Self::Search { collection, .. }
      | Self::Resource { collection, .. } => collection,
    }
  }
}

impl QueryKey for CatalogKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::Resource { collection, id } => return format!("{}:{}", collection, id),
      Self::Listings {
        filters,
        sort,
        page,
        ..
      } => {
        let filters = filters
          .iter()
          .map(|(k, v)| (fold(k), collapse(v)))
          .collect::<BTreeMap<_, _>>()
          .into_iter()
          .map(|(k, v)| format!("{}={}", k, v))
          .collect::<Vec<_>>()
          .join("&");
        format!(
          "listings:{}:{}:{}",
          filters,
          sort.as_deref().map(fold).unwrap_or_default(),
          page.unwrap_or(0)
        )
      }
      Self::Search { text, .. } => format!("search:{}", fold(text)),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{}:q:{}", self.collection(), hex::encode(hasher.finalize()))
  }

  fn description(&self) -> String {
    match self {
      Self::Listings {
        collection,
        filters,
        sort,
        page,
      } => {
        let mut desc = format!("{} listings", collection);
        if !filters.is_empty() {
          let f: Vec<String> = filters.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
          desc.push_str(&format!(" where {}", f.join(", ")));
        }
        if let Some(s) = sort {
          desc.push_str(&format!(" by {}", s));
        }
        if let Some(p) = page {
          desc.push_str(&format!(" page {}", p));
        }
        desc
      }
      Self::Search { collection, text } => format!("{} search: {}", collection, text),
      Self::Resource { collection, id } => format!("{} {}", collection, id),
    }
  }
}

/// Trim and collapse inner whitespace runs.
fn collapse(s: &str) -> String {
  s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `collapse`, then lowercase.
fn fold(s: &str) -> String {
  collapse(s).to_lowercase()
}
