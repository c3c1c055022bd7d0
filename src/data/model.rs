use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};

use super::column_groups::ColumnGroups;
use crate::error::{CapError, Result};

/// Path reported by structural errors raised outside a resolver pass.
pub const ROOT_PATH: &str = ".";

// ---------------------------------------------------------------------------
// AggFunc – row-wise aggregation across the columns of a group
// ---------------------------------------------------------------------------

/// Row-wise aggregation applied across every column of a column group.
///
/// NaN cells are skipped. A row with no finite values aggregates to NaN for
/// `mean`, `min` and `max`, and to `0.0` for `sum`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Mean,
    Sum,
    Min,
    Max,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Mean => "mean",
            AggFunc::Sum => "sum",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }

    /// Aggregate one row of values.
    pub fn apply(&self, values: impl IntoIterator<Item = f64>) -> f64 {
        let mut count = 0usize;
        let mut acc: Option<f64> = None;
        for v in values.into_iter().filter(|v| !v.is_nan()) {
            count += 1;
            acc = Some(match (self, acc) {
                (_, None) => v,
                (AggFunc::Mean | AggFunc::Sum, Some(a)) => a + v,
                (AggFunc::Min, Some(a)) => a.min(v),
                (AggFunc::Max, Some(a)) => a.max(v),
            });
        }
        match (self, acc) {
            (AggFunc::Sum, None) => 0.0,
            (_, None) => f64::NAN,
            (AggFunc::Mean, Some(total)) => total / count as f64,
            (_, Some(v)) => v,
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggFunc {
    type Err = CapError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(AggFunc::Mean),
            "sum" => Ok(AggFunc::Sum),
            "min" => Ok(AggFunc::Min),
            "max" => Ok(AggFunc::Max),
            other => Err(CapError::UnsupportedAggregation {
                func: other.to_string(),
                path: ROOT_PATH.to_string(),
            }),
        }
    }
}

/// Deterministic name of the column holding `agg_func` applied to `group_id`.
pub fn agg_column_name(group_id: &str, agg_func: &str) -> String {
    format!("{group_id}_{agg_func}_agg")
}

// ---------------------------------------------------------------------------
// Timestep – most common spacing of a timestamp index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestep(Duration);

impl Timestep {
    pub fn new(step: Duration) -> Self {
        Timestep(step)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn as_hours(&self) -> f64 {
        self.0.num_milliseconds() as f64 / 3_600_000.0
    }

    pub fn as_minutes(&self) -> f64 {
        self.0.num_milliseconds() as f64 / 60_000.0
    }
}

impl fmt::Display for Timestep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.num_seconds();
        if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}min", secs / 60)
        } else if self.0.num_milliseconds() % 1000 == 0 {
            write!(f, "{secs}s")
        } else {
            write!(f, "{}ms", self.0.num_milliseconds())
        }
    }
}

// ---------------------------------------------------------------------------
// Dataset – timestamp-indexed numeric table
// ---------------------------------------------------------------------------

/// A table of `f64` columns sharing one strictly increasing timestamp index.
///
/// NaN marks a missing measurement. Column order is insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    index: Vec<NaiveDateTime>,
    column_names: Vec<String>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl Dataset {
    /// An empty-columned dataset over `index`.
    pub fn new(index: Vec<NaiveDateTime>) -> Result<Self> {
        if let Some(w) = index.windows(2).find(|w| w[1] <= w[0]) {
            return Err(CapError::UnorderedIndex(w[1]));
        }
        Ok(Dataset {
            index,
            column_names: Vec::new(),
            columns: BTreeMap::new(),
        })
    }

    /// Build a dataset from an ordered index and named columns.
    pub fn from_columns<S: Into<String>>(
        index: Vec<NaiveDateTime>,
        columns: impl IntoIterator<Item = (S, Vec<f64>)>,
    ) -> Result<Self> {
        let mut ds = Dataset::new(index)?;
        for (name, values) in columns {
            ds.insert_column(name, values)?;
        }
        Ok(ds)
    }

    /// Build a dataset from rows in any order.
    ///
    /// Rows are sorted by timestamp. Rows repeating an earlier timestamp are
    /// dropped (first occurrence wins) and reported with a warning.
    pub fn from_unsorted<S: Into<String>>(
        index: Vec<NaiveDateTime>,
        columns: impl IntoIterator<Item = (S, Vec<f64>)>,
    ) -> Result<Self> {
        let columns: Vec<(String, Vec<f64>)> =
            columns.into_iter().map(|(n, v)| (n.into(), v)).collect();
        for (name, values) in &columns {
            if values.len() != index.len() {
                return Err(CapError::LengthMismatch {
                    column: name.clone(),
                    expected: index.len(),
                    found: values.len(),
                });
            }
        }

        let mut order: Vec<usize> = (0..index.len()).collect();
        order.sort_by_key(|&i| index[i]);

        let mut keep: Vec<usize> = Vec::with_capacity(order.len());
        let mut dropped: Vec<NaiveDateTime> = Vec::new();
        for i in order {
            match keep.last() {
                Some(&prev) if index[prev] == index[i] => dropped.push(index[i]),
                _ => keep.push(i),
            }
        }
        if !dropped.is_empty() {
            log::warn!(
                "Dropping {} rows with duplicate timestamps: {:?}",
                dropped.len(),
                dropped
            );
        }

        let sorted_index = keep.iter().map(|&i| index[i]).collect();
        let sorted_columns = columns
            .into_iter()
            .map(|(name, values)| (name, keep.iter().map(|&i| values[i]).collect()));
        Dataset::from_columns(sorted_index, sorted_columns)
    }

    /// A dataset with no rows and the given (empty) columns.
    pub fn empty_with_columns<S: AsRef<str>>(names: &[S]) -> Self {
        let mut ds = Dataset::default();
        for name in names {
            let name = name.as_ref();
            if !ds.columns.contains_key(name) {
                ds.column_names.push(name.to_string());
                ds.columns.insert(name.to_string(), Vec::new());
            }
        }
        ds
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the dataset has no rows.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        &self.index
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn require_column(&self, name: &str) -> Result<&[f64]> {
        self.column(name)
            .ok_or_else(|| CapError::UnknownColumn(name.to_string()))
    }

    /// Add a column, or replace the values of an existing one in place.
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if values.len() != self.index.len() {
            return Err(CapError::LengthMismatch {
                column: name,
                expected: self.index.len(),
                found: values.len(),
            });
        }
        if !self.columns.contains_key(&name) {
            self.column_names.push(name.clone());
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// The rows at `positions`, which must be ascending and in bounds.
    pub fn take_rows(&self, positions: &[usize]) -> Dataset {
        Dataset {
            index: positions.iter().map(|&i| self.index[i]).collect(),
            column_names: self.column_names.clone(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), positions.iter().map(|&i| values[i]).collect()))
                .collect(),
        }
    }

    /// Positions of the rows whose timestamp satisfies `keep`.
    pub fn positions_where(&self, mut keep: impl FnMut(usize) -> bool) -> Vec<usize> {
        (0..self.len()).filter(|&i| keep(i)).collect()
    }

    /// Positions in this dataset of each timestamp in `timestamps` that is
    /// present, in index order.
    pub fn positions_of(&self, timestamps: &[NaiveDateTime]) -> Vec<usize> {
        let mut positions: Vec<usize> = timestamps
            .iter()
            .filter_map(|ts| self.index.binary_search(ts).ok())
            .collect();
        positions.sort_unstable();
        positions.dedup();
        positions
    }

    /// A dataset with the same index and only the named columns, in the
    /// order given.
    pub fn select_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<Dataset> {
        let mut out = Dataset {
            index: self.index.clone(),
            ..Dataset::default()
        };
        for name in names {
            let values = self.require_column(name.as_ref())?.to_vec();
            out.insert_column(name.as_ref(), values)?;
        }
        Ok(out)
    }

    /// Row-wise aggregate of `names`.
    pub fn aggregate_rows<S: AsRef<str>>(&self, names: &[S], func: AggFunc) -> Result<Vec<f64>> {
        let cols = names
            .iter()
            .map(|n| self.require_column(n.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok((0..self.len())
            .map(|row| func.apply(cols.iter().map(|c| c[row])))
            .collect())
    }

    /// Aggregate every column of `group_id` row by row and store the result
    /// as `{group_id}_{agg_func}_agg`, returning that name.
    ///
    /// A column already carrying the name is reused as is.
    pub fn aggregate_group(
        &mut self,
        groups: &ColumnGroups,
        group_id: &str,
        func: AggFunc,
    ) -> Result<String> {
        let name = agg_column_name(group_id, func.as_str());
        if self.contains_column(&name) {
            log::debug!("Aggregated column '{name}' already present, reusing it");
            return Ok(name);
        }
        let members = groups.lookup(group_id)?;
        let values = self.aggregate_rows(members, func)?;
        self.insert_column(name.clone(), values)?;
        log::info!(
            "Added column '{name}' as the row-wise {func} of group '{group_id}' ({} columns)",
            members.len()
        );
        Ok(name)
    }

    /// Most frequent spacing between consecutive timestamps.
    ///
    /// Ties go to the shorter spacing. `None` for fewer than two rows.
    pub fn common_timestep(&self) -> Option<Timestep> {
        let mut counts: BTreeMap<Duration, usize> = BTreeMap::new();
        for w in self.index.windows(2) {
            *counts.entry(w[1] - w[0]).or_default() += 1;
        }
        let mut best: Option<(Duration, usize)> = None;
        for (step, count) in counts {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((step, count));
            }
        }
        best.map(|(step, _)| Timestep::new(step))
    }

    /// Conform the index to a regular grid at the common timestep.
    ///
    /// Missing intervals are filled with NaN rows. Timestamps that do not fall
    /// on the grid are dropped. Returns the new dataset and the number of
    /// intervals added.
    pub fn reindex(&self) -> Result<(Dataset, usize)> {
        let (Some(step), Some(&first), Some(&last)) =
            (self.common_timestep(), self.index.first(), self.index.last())
        else {
            return Ok((self.clone(), 0));
        };

        let mut grid = Vec::new();
        let mut ts = first;
        while ts <= last {
            grid.push(ts);
            ts += step.duration();
        }

        let sources: Vec<Option<usize>> = grid
            .iter()
            .map(|ts| self.index.binary_search(ts).ok())
            .collect();
        let mut out = Dataset::new(grid)?;
        for name in &self.column_names {
            let values = &self.columns[name];
            let filled = sources
                .iter()
                .map(|src| src.map_or(f64::NAN, |i| values[i]))
                .collect();
            out.insert_column(name.clone(), filled)?;
        }

        let added = out.len().saturating_sub(self.len());
        log::info!("Frequency determined to be {step}; {added} intervals added to index");
        Ok((out, added))
    }
}
