//! Typed row model for each stored entity kind.
//!
//! Every struct carries its static columns as fields. Tracker kinds also carry
//! an `extra` map for columns discovered at runtime (event data values,
//! enrollment attributes). Rows are lowered to the generic [`Row`] only when
//! they cross into the store; on a name collision the typed field wins.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
  Error, Result,
  clean::{clean, clean_str},
  entity::{KEY_COLUMN, Row},
};

pub type Object = Map<String, Value>;

// ─── Raw accessors ───────────────────────────────────────────────────────────

/// Read a scalar field as text. Numbers and booleans are rendered; containers
/// and nulls read as absent.
pub fn text(obj: &Object, key: &str) -> Option<String> {
  match obj.get(key)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    Value::Bool(b) => Some(b.to_string()),
    _ => None,
  }
}

/// First present field among `keys`.
fn first_text(obj: &Object, keys: &[&str]) -> Option<String> {
  keys.iter().find_map(|k| text(obj, k).filter(|s| !s.is_empty()))
}

/// Read the remote `deleted` flag, tolerating string spellings.
pub fn is_deleted(obj: &Object) -> bool {
  match obj.get("deleted") {
    Some(Value::Bool(b)) => *b,
    Some(Value::String(s)) => clean_str(s) == Value::Bool(true),
    _ => false,
  }
}

fn required(obj: &Object, key: &'static str) -> Result<String> {
  text(obj, key)
    .filter(|s| !s.trim().is_empty())
    .ok_or(Error::MissingField(key))
}

// ─── Row lowering ────────────────────────────────────────────────────────────

/// Assembles a [`Row`] from extension columns first, then typed columns, and
/// cleans every value on the way out.
struct RowBuilder {
  row: Row,
}

impl RowBuilder {
  fn with_extra(extra: BTreeMap<String, Value>) -> Self { Self { row: extra } }

  fn set(mut self, column: &str, value: impl Into<Value>) -> Self {
    self.row.insert(column.to_owned(), value.into());
    self
  }

  fn finish(self) -> Row {
    self.row.into_iter().map(|(k, v)| (k, clean(&v))).collect()
  }
}

// ─── Tracked entity ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntityRow {
  pub id:           String,
  pub orgunit_id:   Option<String>,
  pub created:      Option<String>,
  pub last_updated: Option<String>,
  pub entity_type:  Option<String>,
  pub deleted:      bool,
  pub program:      String,
}

impl TrackedEntityRow {
  pub fn from_raw(tei: &Object, program: &str) -> Result<Self> {
    Ok(Self {
      id:           required(tei, "trackedEntityInstance")?,
      orgunit_id:   text(tei, "orgUnit"),
      created:      first_text(tei, &["createdAtClient", "created"]),
      last_updated: text(tei, "lastUpdated"),
      entity_type:  text(tei, "trackedEntityType"),
      deleted:      is_deleted(tei),
      program:      program.to_owned(),
    })
  }

  pub fn into_row(self) -> Row {
    RowBuilder::with_extra(BTreeMap::new())
      .set(KEY_COLUMN, self.id)
      .set("orgunit_id", self.orgunit_id)
      .set("created", self.created)
      .set("last_updated", self.last_updated)
      .set("type", self.entity_type)
      .set("deleted", self.deleted)
      .set("program", self.program)
      .finish()
  }
}

// ─── Enrollment ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentRow {
  pub id:              String,
  pub tei_id:          Option<String>,
  pub orgunit_id:      Option<String>,
  pub program:         String,
  pub tei_type:        Option<String>,
  pub enrollment_date: Option<String>,
  pub incident_date:   Option<String>,
  pub status:          Option<String>,
  pub deleted:         bool,
  pub created:         Option<String>,
  pub last_updated:    Option<String>,
}

impl EnrollmentRow {
  pub fn from_raw(enrollment: &Object, program: &str) -> Result<Self> {
    Ok(Self {
      id:              required(enrollment, "enrollment")?,
      tei_id:          text(enrollment, "trackedEntityInstance"),
      orgunit_id:      text(enrollment, "orgUnit"),
      program:         program.to_owned(),
      tei_type:        text(enrollment, "trackedEntityType"),
      enrollment_date: text(enrollment, "enrollmentDate"),
      incident_date:   text(enrollment, "incidentDate"),
      status:          text(enrollment, "status"),
      deleted:         is_deleted(enrollment),
      created:         first_text(enrollment, &["createdAtClient", "created"]),
      last_updated:    text(enrollment, "lastUpdated"),
    })
  }

  pub fn into_row(self) -> Row {
    RowBuilder::with_extra(BTreeMap::new())
      .set(KEY_COLUMN, self.id)
      .set("tei_id", self.tei_id)
      .set("orgunit_id", self.orgunit_id)
      .set("program", self.program)
      .set("tei_type", self.tei_type)
      .set("enrollment_date", self.enrollment_date)
      .set("incident_date", self.incident_date)
      .set("status", self.status)
      .set("deleted", self.deleted)
      .set("created", self.created)
      .set("last_updated", self.last_updated)
      .finish()
  }
}

// ─── Attribute row ───────────────────────────────────────────────────────────

/// One wide row per (tracked entity, enrollment) pair; attribute ids are the
/// extension columns.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRow {
  pub tei_id:        String,
  pub enrollment_id: String,
  pub orgunit_id:    Option<String>,
  pub program:       String,
  pub created:       Option<String>,
  pub status:        Option<String>,
  pub deleted:       bool,
  pub extra:         BTreeMap<String, Value>,
}

impl AttributeRow {
  /// Seed the row from its enrollment; attribute values are added by the
  /// caller into `extra`.
  pub fn for_enrollment(enrollment: &Object, tei_id: &str, program: &str) -> Result<Self> {
    Ok(Self {
      tei_id:        tei_id.to_owned(),
      enrollment_id: required(enrollment, "enrollment")?,
      orgunit_id:    text(enrollment, "orgUnit"),
      program:       program.to_owned(),
      created:       text(enrollment, "created"),
      status:        text(enrollment, "status"),
      deleted:       is_deleted(enrollment),
      extra:         BTreeMap::new(),
    })
  }

  pub fn id(&self) -> String { format!("{}-{}", self.tei_id, self.enrollment_id) }

  pub fn into_row(self) -> Row {
    let id = self.id();
    RowBuilder::with_extra(self.extra)
      .set(KEY_COLUMN, id)
      .set("tei_id", self.tei_id)
      .set("enrollment_id", self.enrollment_id)
      .set("orgunit_id", self.orgunit_id)
      .set("program", self.program)
      .set("created", self.created)
      .set("status", self.status)
      .set("deleted", self.deleted)
      .finish()
  }
}

// ─── Event ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
  pub id:                         String,
  pub enrollment_id:              Option<String>,
  pub tei_id:                     Option<String>,
  pub program:                    String,
  pub program_stage_id:           Option<String>,
  pub orgunit_id:                 Option<String>,
  pub enrollment_status:          Option<String>,
  pub status:                     Option<String>,
  pub event_date:                 Option<String>,
  pub due_date:                   Option<String>,
  pub attribute_category_options: Option<String>,
  pub attribute_option_combo:     Option<String>,
  pub created:                    Option<String>,
  pub last_updated:               Option<String>,
  pub deleted:                    bool,
  /// Data element id → value.
  pub extra:                      BTreeMap<String, Value>,
}

impl EventRow {
  pub fn from_raw(event: &Object, program: &str) -> Result<Self> {
    let extra = event
      .get("dataValues")
      .and_then(Value::as_array)
      .into_iter()
      .flatten()
      .filter_map(Value::as_object)
      .filter_map(|dv| {
        let de = text(dv, "dataElement").filter(|s| !s.is_empty())?;
        Some((de, dv.get("value").cloned().unwrap_or(Value::Null)))
      })
      .collect();

    Ok(Self {
      id:                         required(event, "event")?,
      enrollment_id:              text(event, "enrollment"),
      tei_id:                     text(event, "trackedEntityInstance"),
      program:                    program.to_owned(),
      program_stage_id:           text(event, "programStage"),
      orgunit_id:                 text(event, "orgUnit"),
      enrollment_status:          text(event, "enrollmentStatus"),
      status:                     text(event, "status"),
      event_date:                 text(event, "eventDate"),
      due_date:                   text(event, "dueDate"),
      attribute_category_options: text(event, "attributeCategoryOptions"),
      attribute_option_combo:     text(event, "attributeOptionCombo"),
      created:                    first_text(event, &["createdAtClient", "created"]),
      last_updated:               text(event, "lastUpdated"),
      deleted:                    is_deleted(event),
      extra,
    })
  }

  pub fn into_row(self) -> Row {
    RowBuilder::with_extra(self.extra)
      .set(KEY_COLUMN, self.id)
      .set("enrollment_id", self.enrollment_id)
      .set("tei_id", self.tei_id)
      .set("program", self.program)
      .set("program_stage_id", self.program_stage_id)
      .set("orgunit_id", self.orgunit_id)
      .set("enrollment_status", self.enrollment_status)
      .set("status", self.status)
      .set("event_date", self.event_date)
      .set("due_date", self.due_date)
      .set("attribute_category_options", self.attribute_category_options)
      .set("attribute_option_combo", self.attribute_option_combo)
      .set("created", self.created)
      .set("last_updated", self.last_updated)
      .set("deleted", self.deleted)
      .finish()
  }
}

// ─── Reference data ──────────────────────────────────────────────────────────

/// Lower a serialisable reference record into a cleaned row.
fn lower<T: Serialize>(record: &T) -> Result<Row> {
  let row: Row = serde_json::from_value(serde_json::to_value(record)?)?;
  Ok(row.into_iter().map(|(k, v)| (k, clean(&v))).collect())
}

/// Read with the remote's camelCase names, stored with snake_case columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "camelCase", serialize = "snake_case"))]
pub struct OrgUnit {
  pub id:         String,
  #[serde(default)]
  pub name:       Option<String>,
  #[serde(default)]
  pub short_name: Option<String>,
  #[serde(default)]
  pub level:      Option<i64>,
  #[serde(default)]
  pub parent:     Option<Value>,
}

impl OrgUnit {
  pub fn into_row(self) -> Result<Row> { lower(&self) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "camelCase", serialize = "snake_case"))]
pub struct DataElement {
  pub id:                  String,
  #[serde(default)]
  pub name:                Option<String>,
  #[serde(default)]
  pub code:                Option<String>,
  #[serde(default)]
  pub short_name:          Option<String>,
  #[serde(default)]
  pub display_name:        Option<String>,
  #[serde(default)]
  pub display_form_name:   Option<String>,
  #[serde(default)]
  pub value_type:          Option<String>,
  #[serde(default)]
  pub domain_type:         Option<String>,
  #[serde(default)]
  pub aggregation_type:    Option<String>,
  #[serde(default)]
  pub dimension_item_type: Option<String>,
  #[serde(default)]
  pub zero_is_significant: Option<bool>,
  #[serde(default)]
  pub option_set_value:    Option<bool>,
  #[serde(default)]
  pub category_combo:      Option<Value>,
  #[serde(default)]
  pub option_set:          Option<Value>,
  #[serde(default)]
  pub data_element_groups: Option<Value>,
  #[serde(default)]
  pub data_set_elements:   Option<Value>,
  #[serde(default)]
  pub aggregation_levels:  Option<Value>,
  #[serde(default)]
  pub created:             Option<String>,
}

impl DataElement {
  pub fn into_row(self) -> Result<Row> { lower(&self) }
}
