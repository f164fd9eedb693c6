//! Flattening of nested tracked-entity graphs into per-kind row sets.
//!
//! A raw record is a tracked entity carrying `enrollments`, each carrying
//! `events` and `attributes`. The graph is walked read-only; deletion of a
//! parent cascades to everything beneath it.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
  entity::{EntityKind, KEY_COLUMN, KindFlags, KindMap, Row},
  record::{
    AttributeRow, EnrollmentRow, EventRow, Object, TrackedEntityRow, is_deleted,
    text,
  },
};

/// Keys stripped at every level of a tracker payload before flattening.
pub const UNWANTED_KEYS: &[&str] = &[
  "lastUpdatedAtClient",
  "lastUpdatedByUserInfo",
  "createdByUserInfo",
  "storedBy",
  "href",
];

/// Rows and delete-id lists produced from one batch of raw records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Flattened {
  pub rows:    KindMap<Row>,
  pub deletes: KindMap<String>,
}

impl Flattened {
  pub fn count(&self, kind: EntityKind) -> usize { self.rows.count(kind) }

  /// Rows of `kind` that should be upserted: those whose id is not also
  /// scheduled for deletion.
  pub fn writable(&self, kind: EntityKind) -> Vec<Row> {
    let doomed: HashSet<&str> =
      self.deletes.get(kind).iter().map(String::as_str).collect();
    self
      .rows
      .get(kind)
      .iter()
      .filter(|row| {
        row
          .get(KEY_COLUMN)
          .and_then(Value::as_str)
          .is_none_or(|id| !doomed.contains(id))
      })
      .cloned()
      .collect()
  }
}

fn children<'a>(obj: &'a Object, key: &str) -> impl Iterator<Item = &'a Object> {
  obj
    .get(key)
    .and_then(Value::as_array)
    .into_iter()
    .flatten()
    .filter_map(Value::as_object)
}

/// Flatten `raw` tracked-entity records for `program`.
///
/// Kinds disabled in `flags` produce neither rows nor delete ids.
pub fn flatten(raw: &[Value], program: &str, flags: KindFlags) -> Flattened {
  let mut out = Flattened::default();

  for tei in raw.iter().filter_map(Value::as_object) {
    let tei_deleted = is_deleted(tei);
    let tei_id = text(tei, "trackedEntityInstance");

    for enrollment in children(tei, "enrollments") {
      let enrollment_deleted = tei_deleted || is_deleted(enrollment);

      for event in children(enrollment, "events") {
        if enrollment_deleted || is_deleted(event) {
          if let Some(id) = text(event, "event") {
            out.deletes.push(EntityKind::Event, id);
          }
          continue;
        }
        match EventRow::from_raw(event, program) {
          Ok(row) => out.rows.push(EntityKind::Event, row.into_row()),
          Err(e) => warn!(error = %e, "skipping event"),
        }
      }

      let owner = text(enrollment, "trackedEntityInstance").or_else(|| tei_id.clone());
      match owner.map(|owner| AttributeRow::for_enrollment(enrollment, &owner, program)) {
        Some(Ok(mut attrs)) => {
          let mut attrs_deleted = enrollment_deleted;
          for attribute in children(enrollment, "attributes") {
            if is_deleted(attribute) {
              attrs_deleted = true;
              continue;
            }
            if let Some(attr_id) = text(attribute, "attribute").filter(|s| !s.is_empty()) {
              let value = attribute.get("value").cloned().unwrap_or(Value::Null);
              attrs.extra.insert(attr_id, value);
            }
          }
          if attrs_deleted {
            out.deletes.push(EntityKind::Attribute, attrs.id());
          }
          out.rows.push(EntityKind::Attribute, attrs.into_row());
        }
        Some(Err(e)) => warn!(error = %e, "skipping attribute row"),
        None => warn!("skipping attribute row without a tracked entity id"),
      }

      if enrollment_deleted {
        if let Some(id) = text(enrollment, "enrollment") {
          out.deletes.push(EntityKind::Enrollment, id);
        }
        continue;
      }
      match EnrollmentRow::from_raw(enrollment, program) {
        Ok(row) => out.rows.push(EntityKind::Enrollment, row.into_row()),
        Err(e) => warn!(error = %e, "skipping enrollment"),
      }
    }

    if tei_deleted {
      if let Some(id) = tei_id {
        out.deletes.push(EntityKind::TrackedEntity, id);
      }
      continue;
    }
    match TrackedEntityRow::from_raw(tei, program) {
      Ok(row) => out.rows.push(EntityKind::TrackedEntity, row.into_row()),
      Err(e) => warn!(error = %e, "skipping tracked entity"),
    }
  }

  let out = Flattened {
    rows:    gate(out.rows, flags),
    deletes: gate(out.deletes, flags),
  };

  debug!(
    teis = out.count(EntityKind::TrackedEntity),
    enrollments = out.count(EntityKind::Enrollment),
    attributes = out.count(EntityKind::Attribute),
    events = out.count(EntityKind::Event),
    "flattened tracker records"
  );
  out
}

fn gate<T>(map: KindMap<T>, flags: KindFlags) -> KindMap<T> {
  map
    .into_inner()
    .into_iter()
    .filter(|(kind, _)| flags.is_enabled(*kind))
    .collect()
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn live_record() -> Value {
    json!({
      "trackedEntityInstance": "T1",
      "orgUnit": "OU1",
      "trackedEntityType": "person",
      "enrollments": [{
        "enrollment": "E1",
        "trackedEntityInstance": "T1",
        "orgUnit": "OU1",
        "status": "ACTIVE",
        "attributes": [
          {"attribute": "A1", "value": "Kossi"},
          {"attribute": "A2", "value": "yes"}
        ],
        "events": [{
          "event": "V1",
          "enrollment": "E1",
          "trackedEntityInstance": "T1",
          "dataValues": [{"dataElement": "DE1", "value": "5"}]
        }]
      }]
    })
  }

  #[test]
  fn live_record_produces_one_row_per_kind() {
    let out = flatten(&[live_record()], "P1", KindFlags::all());
    for kind in EntityKind::TRACKER {
      assert_eq!(out.count(kind), 1, "{kind}");
      assert!(out.deletes.get(kind).is_empty(), "{kind}");
    }

    let event = &out.rows.get(EntityKind::Event)[0];
    assert_eq!(event["DE1"], json!("5"));

    let attrs = &out.rows.get(EntityKind::Attribute)[0];
    assert_eq!(attrs["id"], json!("T1-E1"));
    assert_eq!(attrs["A1"], json!("Kossi"));
    assert_eq!(attrs["A2"], json!(true));
  }

  #[test]
  fn deleted_tei_cascades() {
    let mut raw = live_record();
    raw["deleted"] = json!(true);
    let out = flatten(&[raw], "P1", KindFlags::all());

    for kind in [EntityKind::TrackedEntity, EntityKind::Enrollment, EntityKind::Event] {
      assert_eq!(out.count(kind), 0, "{kind}");
      assert_eq!(out.deletes.count(kind), 1, "{kind}");
    }
    assert_eq!(out.deletes.get(EntityKind::Attribute), &["T1-E1".to_owned()]);
    assert!(out.writable(EntityKind::Attribute).is_empty());
  }

  #[test]
  fn deleted_event_only_affects_itself() {
    let mut raw = live_record();
    raw["enrollments"][0]["events"][0]["deleted"] = json!(true);
    let out = flatten(&[raw], "P1", KindFlags::all());

    assert_eq!(out.count(EntityKind::Event), 0);
    assert_eq!(out.deletes.get(EntityKind::Event), &["V1".to_owned()]);
    assert_eq!(out.count(EntityKind::Enrollment), 1);
    assert_eq!(out.count(EntityKind::TrackedEntity), 1);
  }

  #[test]
  fn deleted_attribute_is_listed_once() {
    let mut raw = live_record();
    raw["enrollments"][0]["attributes"][0]["deleted"] = json!(true);
    raw["enrollments"][0]["attributes"][1]["deleted"] = json!(true);
    let out = flatten(&[raw], "P1", KindFlags::all());
    assert_eq!(out.deletes.count(EntityKind::Attribute), 1);
  }

  #[test]
  fn disabled_kinds_are_skipped() {
    let flags = KindFlags { events: false, attributes: false, ..KindFlags::all() };
    let out = flatten(&[live_record()], "P1", flags);
    assert_eq!(out.count(EntityKind::Event), 0);
    assert_eq!(out.count(EntityKind::Attribute), 0);
    assert_eq!(out.count(EntityKind::TrackedEntity), 1);
  }

  #[test]
  fn non_objects_are_ignored_and_input_is_untouched() {
    let raw = vec![json!("junk"), json!(42), live_record()];
    let before = raw.clone();
    let out = flatten(&raw, "P1", KindFlags::all());
    assert_eq!(out.count(EntityKind::TrackedEntity), 1);
    assert_eq!(raw, before);
  }
}
