//! Entity kinds, the generic row shape, and the per-kind result map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// A flattened record as handed to the store: column name → JSON value.
///
/// Ordered so that generated SQL is stable across runs.
pub type Row = BTreeMap<String, Value>;

/// Every entity table keys on this column.
pub const KEY_COLUMN: &str = "id";

/// Stamped by the store on every write.
pub const SYNCED_AT_COLUMN: &str = "synced_at";

// ─── EntityKind ──────────────────────────────────────────────────────────────

/// The kinds of remote records the bridge mirrors into its store.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  EnumIter,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
  TrackedEntity,
  Enrollment,
  Attribute,
  Event,
  OrgUnit,
  DataElement,
}

impl EntityKind {
  /// The four kinds produced by flattening tracker records.
  pub const TRACKER: [EntityKind; 4] = [
    EntityKind::TrackedEntity,
    EntityKind::Enrollment,
    EntityKind::Attribute,
    EntityKind::Event,
  ];

  /// Name of the table rows of this kind are stored in.
  pub fn table(self) -> &'static str {
    match self {
      EntityKind::TrackedEntity => "tracked_entity_instances",
      EntityKind::Enrollment => "enrollments",
      EntityKind::Attribute => "attributes",
      EntityKind::Event => "events",
      EntityKind::OrgUnit => "organisation_units",
      EntityKind::DataElement => "data_elements",
    }
  }

  pub fn key_column(self) -> &'static str { KEY_COLUMN }
}

// ─── KindFlags ───────────────────────────────────────────────────────────────

/// Which tracker kinds a sync run should produce and persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindFlags {
  pub teis:        bool,
  pub enrollments: bool,
  pub attributes:  bool,
  pub events:      bool,
}

impl KindFlags {
  pub fn all() -> Self {
    Self { teis: true, enrollments: true, attributes: true, events: true }
  }

  pub fn none() -> Self {
    Self { teis: false, enrollments: false, attributes: false, events: false }
  }

  /// Non-tracker kinds are never gated by these flags.
  pub fn is_enabled(&self, kind: EntityKind) -> bool {
    match kind {
      EntityKind::TrackedEntity => self.teis,
      EntityKind::Enrollment => self.enrollments,
      EntityKind::Attribute => self.attributes,
      EntityKind::Event => self.events,
      EntityKind::OrgUnit | EntityKind::DataElement => true,
    }
  }

  /// A full run is the only kind allowed to advance the sync watermark.
  pub fn is_full(&self) -> bool {
    self.teis && self.enrollments && self.attributes && self.events
  }
}

impl Default for KindFlags {
  fn default() -> Self { Self::all() }
}

// ─── KindMap ─────────────────────────────────────────────────────────────────

/// Items grouped by entity kind; the single result shape of every fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct KindMap<T> {
  inner: BTreeMap<EntityKind, Vec<T>>,
}

impl<T> Default for KindMap<T> {
  fn default() -> Self { Self { inner: BTreeMap::new() } }
}

impl<T> KindMap<T> {
  pub fn new() -> Self { Self::default() }

  /// Append `items` to whatever is already held for `kind`.
  pub fn extend(&mut self, kind: EntityKind, items: impl IntoIterator<Item = T>) {
    self.inner.entry(kind).or_default().extend(items);
  }

  pub fn push(&mut self, kind: EntityKind, item: T) {
    self.inner.entry(kind).or_default().push(item);
  }

  /// Concatenate `other` into `self`, kind by kind.
  pub fn merge(&mut self, other: KindMap<T>) {
    for (kind, items) in other.inner {
      self.extend(kind, items);
    }
  }

  pub fn get(&self, kind: EntityKind) -> &[T] {
    self.inner.get(&kind).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn count(&self, kind: EntityKind) -> usize { self.get(kind).len() }

  pub fn contains(&self, kind: EntityKind) -> bool { self.inner.contains_key(&kind) }

  pub fn is_empty(&self) -> bool { self.inner.values().all(Vec::is_empty) }

  pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &[T])> {
    self.inner.iter().map(|(k, v)| (*k, v.as_slice()))
  }

  pub fn into_inner(self) -> BTreeMap<EntityKind, Vec<T>> { self.inner }
}

impl<T> FromIterator<(EntityKind, Vec<T>)> for KindMap<T> {
  fn from_iter<I: IntoIterator<Item = (EntityKind, Vec<T>)>>(iter: I) -> Self {
    let mut map = KindMap::new();
    for (kind, items) in iter {
      map.extend(kind, items);
    }
    map
  }
}
