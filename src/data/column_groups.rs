use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::model::{Dataset, ROOT_PATH};
use crate::error::{CapError, Result};

// ---------------------------------------------------------------------------
// ColumnGroups – semantic sensor groups over physical columns
// ---------------------------------------------------------------------------

/// Maps a group id (e.g. `irr_poa`) to the ordered physical columns of the
/// sensors in that group.
///
/// Serializes as a plain object of arrays, the same shape as a column-groups
/// JSON or YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnGroups {
    groups: BTreeMap<String, Vec<String>>,
}

impl ColumnGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns of `group_id`.
    pub fn lookup(&self, group_id: &str) -> Result<&[String]> {
        self.groups
            .get(group_id)
            .map(Vec::as_slice)
            .ok_or_else(|| CapError::UnknownGroup {
                group: group_id.to_string(),
                path: ROOT_PATH.to_string(),
            })
    }

    /// The only column of `group_id`; fails unless the group has exactly one.
    pub fn single_column(&self, group_id: &str) -> Result<&str> {
        match self.lookup(group_id)? {
            [only] => Ok(only.as_str()),
            cols => Err(CapError::AmbiguousGroup {
                group: group_id.to_string(),
                count: cols.len(),
                path: ROOT_PATH.to_string(),
            }),
        }
    }

    /// The column of `id` when it names a single-column group.
    pub fn as_single(&self, id: &str) -> Option<&str> {
        match self.groups.get(id).map(Vec::as_slice) {
            Some([only]) => Some(only.as_str()),
            _ => None,
        }
    }

    /// Insert a group or overwrite its columns.
    pub fn add_group<S: Into<String>>(&mut self, group_id: impl Into<String>, columns: impl IntoIterator<Item = S>) {
        let group_id = group_id.into();
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if self.groups.insert(group_id.clone(), columns).is_some() {
            log::debug!("Column group '{group_id}' overwritten");
        }
    }

    pub fn contains(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.groups.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Check that every column referenced by a group exists in `data`.
    pub fn validate(&self, data: &Dataset) -> Result<()> {
        for (group, columns) in &self.groups {
            if let Some(missing) = columns.iter().find(|c| !data.contains_column(c)) {
                return Err(CapError::MissingGroupColumn {
                    group: group.clone(),
                    column: missing.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn from_yaml_str(text: &str) -> serde_yaml::Result<Self> {
        serde_yaml::from_str(text)
    }
}

impl<K, C, S> FromIterator<(K, C)> for ColumnGroups
where
    K: Into<String>,
    C: IntoIterator<Item = S>,
    S: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, C)>>(iter: I) -> Self {
        let mut groups = ColumnGroups::new();
        for (id, columns) in iter {
            groups.add_group(id, columns);
        }
        groups
    }
}
