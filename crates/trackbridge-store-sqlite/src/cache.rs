//! Process-local record of schema facts already verified against the
//! catalog. Purely a performance aid: losing it only costs redundant checks.

use std::{
  collections::{HashMap, HashSet},
  sync::{PoisonError, RwLock},
};

#[derive(Debug, Default)]
struct State {
  tables:  HashSet<String>,
  /// Lower-cased column names per table.
  columns: HashMap<String, HashSet<String>>,
  /// (table, key column) pairs with a verified primary key or unique index.
  keys:    HashSet<(String, String)>,
}

#[derive(Debug, Default)]
pub struct SchemaCache {
  state: RwLock<State>,
}

impl SchemaCache {
  pub fn has_table(&self, table: &str) -> bool {
    self.state.read().unwrap_or_else(PoisonError::into_inner).tables.contains(table)
  }

  pub fn mark_table(&self, table: &str) {
    self
      .state
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .tables
      .insert(table.to_owned());
  }

  /// Names from `columns` not yet verified for `table`, in input order.
  pub fn missing_columns<'c>(
    &self,
    table: &str,
    columns: impl IntoIterator<Item = &'c str>,
  ) -> Vec<&'c str> {
    let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
    let known = state.columns.get(table);
    columns
      .into_iter()
      .filter(|c| known.is_none_or(|k| !k.contains(&c.to_lowercase())))
      .collect()
  }

  pub fn mark_columns<'c>(&self, table: &str, columns: impl IntoIterator<Item = &'c str>) {
    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
    state
      .columns
      .entry(table.to_owned())
      .or_default()
      .extend(columns.into_iter().map(str::to_lowercase));
  }

  pub fn has_key(&self, table: &str, key: &str) -> bool {
    self
      .state
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .keys
      .contains(&(table.to_owned(), key.to_lowercase()))
  }

  pub fn mark_key(&self, table: &str, key: &str) {
    self
      .state
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .keys
      .insert((table.to_owned(), key.to_lowercase()));
  }
}
