//! Queued mutation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

/// Kind of write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
  Create,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MutationKind::Create => write!(f, "create"),
      MutationKind::Update => write!(f, "update"),
      MutationKind::Delete => write!(f, "delete"),
    }
  }
}

impl FromStr for MutationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "create" => Ok(MutationKind::Create),
      "update" => Ok(MutationKind::Update),
      "delete" => Ok(MutationKind::Delete),
      other => Err(format!("unknown mutation kind: {}", other)),
    }
  }
}

/// A write waiting to be applied remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
  /// Unique, sorts in enqueue order
  pub id: String,
  pub kind: MutationKind,
  /// Collection the mutation applies to (e.g. "listings")
  pub target: String,
  /// Operation data; update and delete carry the resource id
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed replay attempts so far
  #[serde(default)]
  pub attempts: u32,
  /// Error from the most recent failed attempt
  #[serde(default)]
  pub last_error: Option<String>,
}

impl MutationRecord {
  pub(crate) fn new(kind: MutationKind, target: String, payload: Value, now: DateTime<Utc>) -> Self {
    Self {
      id: next_id(now),
      kind,
      target,
      payload,
      enqueued_at: now,
      attempts: 0,
      last_error: None,
    }
  }

  /// Identifier of the resource the mutation touches, if the payload has one.
  pub fn resource_id(&self) -> Option<String> {
    resource_id_of(&self.payload)
  }
}

/// The `id` field of a mutation payload, as a string.
pub(crate) fn resource_id_of(payload: &Value) -> Option<String> {
  match payload.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

static LAST_ID_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Generate a record id: a zero-padded millisecond stamp followed by a random
/// suffix.
///
/// The stamp is forced strictly increasing within the process, so ids sort in
/// generation order even when the wall clock stalls or steps back.
fn next_id(now: DateTime<Utc>) -> String {
  let wall = now.timestamp_millis().max(0);
  let mut last = LAST_ID_MILLIS.load(Ordering::SeqCst);
  let stamp = loop {
    let candidate = wall.max(last + 1);
    match LAST_ID_MILLIS.compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst) {
      Ok(_) => break candidate,
      Err(actual) => last = actual,
    }
  };

  let suffix = uuid::Uuid::new_v4().simple().to_string();
  format!("{:015}-{}", stamp, &suffix[..12])
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn ids_sort_in_generation_order() {
    let now = Utc::now();
    let ids: Vec<String> = (0..500).map(|_| next_id(now)).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);

    let unique: std::collections::HashSet<_> = ids.iter().collect();
    assert_eq!(unique.len(), ids.len());
  }

  #[test]
  fn ids_survive_clock_going_backwards() {
    let now = Utc::now();
    let a = next_id(now);
    let b = next_id(now - chrono::Duration::hours(1));
    assert!(b > a);
  }

  #[test]
  fn resource_id_from_payload() {
    let now = Utc::now();
    let rec = MutationRecord::new(
      MutationKind::Update,
      "listings".into(),
      json!({"id": "p1", "price": 500}),
      now,
    );
    assert_eq!(rec.resource_id().as_deref(), Some("p1"));

    let rec = MutationRecord::new(MutationKind::Delete, "listings".into(), json!({"id": 7}), now);
    assert_eq!(rec.resource_id().as_deref(), Some("7"));

    let rec = MutationRecord::new(MutationKind::Create, "listings".into(), json!({"title": "x"}), now);
    assert_eq!(rec.resource_id(), None);
  }

  #[test]
  fn kind_parses_case_insensitively() {
    assert_eq!("UPDATE".parse::<MutationKind>().unwrap(), MutationKind::Update);
    assert!("upsert".parse::<MutationKind>().is_err());
    assert_eq!(MutationKind::Delete.to_string(), "delete");
  }

  #[test]
  fn old_records_without_attempts_still_decode() {
    let rec: MutationRecord = serde_json::from_value(json!({
      "id": "000000000000001-abc",
      "kind": "create",
      "target": "listings",
      "payload": {},
      "enqueued_at": "2024-01-01T00:00:00Z"
    }))
    .unwrap();
    assert_eq!(rec.attempts, 0);
    assert_eq!(rec.last_error, None);
  }
}
