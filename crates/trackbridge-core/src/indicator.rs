//! Indicator aggregation: SQL generation over the materialised view and the
//! mapping of result rows into outbound data value sets.

use std::{collections::{BTreeMap, HashMap}, path::Path};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result, entity::Row};

pub const STATUSES: &[&str] = &["ASC", "RC"];
pub const SEXES: &[&str] = &["M", "F"];
pub const AGE_GROUPS: &[&str] = &["18-29", "30-44", "45-59", "60-75", "75+"];

/// Grouping columns present in every aggregation result.
pub const PERIOD_COLUMN: &str = "period";
pub const ORGUNIT_COLUMN: &str = "orgunit_id";

// ─── Groups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupShape {
  /// One sum per (indicator, status).
  StatusSplit,
  /// One sum per (indicator, status, sex, age group).
  DemographicSplit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndicatorGroup {
  pub name:       &'static str,
  pub shape:      GroupShape,
  pub indicators: Vec<&'static str>,
}

/// The indicator groups aggregated from the community-worker view.
pub fn default_groups() -> Vec<IndicatorGroup> {
  use GroupShape::*;
  vec![
    IndicatorGroup {
      name:       "proposals",
      shape:      StatusSplit,
      indicators: vec!["proposition_faite", "proposition_valide"],
    },
    IndicatorGroup {
      name:       "supervision",
      shape:      StatusSplit,
      indicators: vec![
        "supervision_rfs",
        "supervision_rm",
        "supervision_asc_superviseur",
        "supervision_niveau_district",
        "supervision_niveau_regions",
        "supervision_niveau_central",
      ],
    },
    IndicatorGroup {
      name:       "training",
      shape:      StatusSplit,
      indicators: vec![
        "formation_pecimne",
        "formation_paludisme",
        "formation_pf_communautaire",
        "formation_gestion_meg",
        "formation_comm_vih",
        "formation_malnutrition",
        "formation_pec_pvvih",
        "formation_promotion",
        "formation_change_cptm",
        "formation_assainissement",
        "formation_coinfection_tb",
        "formation_maladi_non_transmissible",
        "formation_Maladi_tropicale",
        "formation_suivi_rapportage",
        "formation_qualite_soins_nc",
        "formation_sante_mere",
        "formation_surveil_epidemiologique",
        "formation_others",
      ],
    },
    IndicatorGroup {
      name:       "equipment",
      shape:      StatusSplit,
      indicators: vec![
        "sac_good_state",
        "velo_good_state",
        "stylos_good_state",
        "torche_good_state",
        "bottes_good_state",
        "caisse_good_state",
        "affiches_good_state",
        "powerbank_good_state",
        "smartphone_good_state",
        "thermometre_good_state",
        "boites_a_images_good_state",
        "impermeables_raglan_good_state",
        "autres_equipement",
      ],
    },
    IndicatorGroup {
      name:       "attrition",
      shape:      StatusSplit,
      indicators: vec!["demission", "abandon", "licenciement", "faute_grave"],
    },
    IndicatorGroup {
      name:       "demographics",
      shape:      DemographicSplit,
      indicators: vec![
        "total",
        "actif",
        "decede",
        "suivi_animateur_endogene",
        "reunion_mensuelle",
        "rapport_mensuel",
      ],
    },
  ]
}

// ─── SQL generation ──────────────────────────────────────────────────────────

/// Plain SQL identifier: ASCII letter or underscore, then letters, digits or
/// underscores.
pub fn validate_identifier(name: &str) -> Result<&str> {
  let mut chars = name.chars();
  let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
  if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
    Ok(name)
  } else {
    Err(Error::InvalidIdentifier(name.to_owned()))
  }
}

fn age_suffix(age_group: &str) -> String {
  age_group.replace('-', "_").replace('+', "plus").replace(' ', "_")
}

/// Result column name for a status-split sum.
pub fn status_alias(indicator: &str, status: &str) -> String {
  format!("{indicator}_{status}").to_lowercase()
}

/// Result column name for a demographic-split sum.
pub fn demographic_alias(indicator: &str, status: &str, sex: &str, age_group: &str) -> String {
  format!("{indicator}_{status}_{sex}_{}", age_suffix(age_group)).to_lowercase()
}

/// Build the aggregation query for `group` over `view`.
///
/// When `filtered`, the query takes two positional parameters: `?1` period
/// and `?2` organisation unit.
pub fn build_query(group: &IndicatorGroup, view: &str, filtered: bool) -> Result<String> {
  let view = validate_identifier(view)?;
  let mut columns = vec![PERIOD_COLUMN.to_owned(), ORGUNIT_COLUMN.to_owned()];

  match group.shape {
    GroupShape::StatusSplit => {
      for status in STATUSES {
        for ind in &group.indicators {
          let ind = validate_identifier(ind)?;
          columns.push(format!(
            "SUM({ind}) FILTER (WHERE status = '{status}') AS {}",
            status_alias(ind, status)
          ));
        }
      }
    }
    GroupShape::DemographicSplit => {
      for age in AGE_GROUPS {
        for sex in SEXES {
          for status in STATUSES {
            for ind in &group.indicators {
              let ind = validate_identifier(ind)?;
              columns.push(format!(
                "SUM({ind}) FILTER (WHERE status = '{status}' AND sex = '{sex}' AND age_group = '{age}') AS {}",
                demographic_alias(ind, status, sex, age)
              ));
            }
          }
        }
      }
    }
  }

  let filter = if filtered {
    format!("\nWHERE {PERIOD_COLUMN} = ?1 AND {ORGUNIT_COLUMN} = ?2")
  } else {
    String::new()
  };

  Ok(format!(
    "SELECT\n    {}\nFROM {view}{filter}\nGROUP BY {PERIOD_COLUMN}, {ORGUNIT_COLUMN}",
    columns.join(",\n    ")
  ))
}

// ─── Indicator map ───────────────────────────────────────────────────────────

/// Remote data element and category option combo for one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
  pub de:    String,
  pub combo: String,
}

/// Result column → remote target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndicatorMap(pub BTreeMap<String, Target>);

impl IndicatorMap {
  pub fn from_json(text: &str) -> Result<Self> { Ok(serde_json::from_str(text)?) }

  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    Self::from_json(&std::fs::read_to_string(path)?)
  }

  pub fn get(&self, column: &str) -> Option<&Target> { self.0.get(column) }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromIterator<(String, Target)> for IndicatorMap {
  fn from_iter<I: IntoIterator<Item = (String, Target)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValue {
  pub data_element:          String,
  pub category_option_combo: String,
  pub value:                 i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataValueSet {
  pub data_set:       String,
  pub period:         String,
  pub org_unit:       String,
  pub completed_date: String,
  pub data_values:    Vec<DataValue>,
}

/// `completedDate` as the destination expects it.
pub fn completion_date(now: NaiveDateTime) -> String {
  now.format("%Y-%m-%dT%H:%M:%S.000").to_string()
}

fn as_count(value: &Value) -> Option<i64> {
  match value {
    Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
    Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
    _ => None,
  }
}

fn as_key(value: Option<&Value>) -> Option<String> {
  match value? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Group aggregation rows by (period, orgunit) into data value sets.
///
/// Only positive values of mapped columns are kept; sets that end up empty
/// are dropped. Sets appear in the order their key is first seen.
pub fn build_payloads<'a>(
  rows: impl IntoIterator<Item = &'a Row>,
  map: &IndicatorMap,
  dataset_id: &str,
  completed_date: &str,
) -> Vec<DataValueSet> {
  let mut sets: Vec<DataValueSet> = Vec::new();
  let mut index: HashMap<(String, String), usize> = HashMap::new();

  for row in rows {
    let (Some(period), Some(org_unit)) =
      (as_key(row.get(PERIOD_COLUMN)), as_key(row.get(ORGUNIT_COLUMN)))
    else {
      continue;
    };

    let slot = *index.entry((period.clone(), org_unit.clone())).or_insert_with(|| {
      sets.push(DataValueSet {
        data_set: dataset_id.to_owned(),
        period,
        org_unit,
        completed_date: completed_date.to_owned(),
        data_values: Vec::new(),
      });
      sets.len() - 1
    });

    for (column, value) in row {
      if column == PERIOD_COLUMN || column == ORGUNIT_COLUMN {
        continue;
      }
      let Some(count) = as_count(value).filter(|n| *n > 0) else { continue };
      let Some(target) = map.get(column) else { continue };
      sets[slot].data_values.push(DataValue {
        data_element:          target.de.clone(),
        category_option_combo: target.combo.clone(),
        value:                 count,
      });
    }
  }

  sets.retain(|s| !s.data_values.is_empty());
  sets
}
