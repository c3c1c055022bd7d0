use crate::calc::derivations::{DerivationConfig, DerivationRegistry};
use crate::calc::params::HeatCoefficientTable;
use crate::calc::resolver::{self, ResolveReport};
use crate::calc::spec::RegressionColumns;
use crate::data::column_groups::ColumnGroups;
use crate::data::filter::FilterChain;
use crate::data::model::{AggFunc, Dataset, Timestep};
use crate::error::{CapError, Result};

// ---------------------------------------------------------------------------
// CapData – one analysis session over a plant dataset
// ---------------------------------------------------------------------------

/// A measured or modeled dataset together with its column groups, the
/// current row filter and the regression-column specification.
#[derive(Debug)]
pub struct CapData {
    /// Label used in log messages.
    pub name: String,

    /// The full dataset. Columns are only ever added.
    data: Dataset,

    /// Positions (into `data`) of the rows passing every applied filter.
    filtered: Vec<usize>,

    column_groups: ColumnGroups,

    /// Regression variable → how to compute it. Rewritten in place by
    /// [`CapData::process_regression_columns`].
    pub regression_cols: RegressionColumns,

    derivations: DerivationRegistry,

    /// Descriptions of the filters applied since the last reset.
    applied_filters: Vec<String>,
}

impl CapData {
    /// Bind `data` to its column groups, which must only name existing
    /// columns. Uses the built-in derivations with default settings.
    pub fn new(name: impl Into<String>, data: Dataset, column_groups: ColumnGroups) -> Result<Self> {
        column_groups.validate(&data)?;
        let derivations =
            DerivationRegistry::standard(&DerivationConfig::default(), &HeatCoefficientTable::sandia());
        Ok(CapData {
            name: name.into(),
            filtered: (0..data.len()).collect(),
            data,
            column_groups,
            regression_cols: RegressionColumns::new(),
            derivations,
            applied_filters: Vec::new(),
        })
    }

    pub fn with_derivations(mut self, derivations: DerivationRegistry) -> Self {
        self.derivations = derivations;
        self
    }

    pub fn with_regression_cols(mut self, regression_cols: RegressionColumns) -> Self {
        self.regression_cols = regression_cols;
        self
    }

    /// Rebuild the built-in derivations from `config`.
    pub fn configure_derivations(&mut self, config: &DerivationConfig, table: &HeatCoefficientTable) {
        self.derivations = DerivationRegistry::standard(config, table);
    }

    pub fn data(&self) -> &Dataset {
        &self.data
    }

    pub fn column_groups(&self) -> &ColumnGroups {
        &self.column_groups
    }

    pub fn derivations(&self) -> &DerivationRegistry {
        &self.derivations
    }

    pub fn derivations_mut(&mut self) -> &mut DerivationRegistry {
        &mut self.derivations
    }

    pub fn timestep(&self) -> Option<Timestep> {
        self.data.common_timestep()
    }

    /// Insert or overwrite a column group. Its columns must exist.
    pub fn add_column_group<S: Into<String>>(
        &mut self,
        group_id: &str,
        columns: impl IntoIterator<Item = S>,
    ) -> Result<()> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if let Some(missing) = columns.iter().find(|c| !self.data.contains_column(c)) {
            return Err(CapError::MissingGroupColumn {
                group: group_id.to_string(),
                column: missing.clone(),
            });
        }
        self.column_groups.add_group(group_id, columns);
        Ok(())
    }

    /// Add (or replace) a column of the full dataset. The filtered view
    /// picks it up on the next [`CapData::filtered_subset`].
    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        self.data.insert_column(name, values)
    }

    /// Row-wise aggregate of a column group, stored as
    /// `{group_id}_{agg_func}_agg`. Calling it again reuses the column.
    pub fn agg_group(&mut self, group_id: &str, agg_func: &str) -> Result<String> {
        let func: AggFunc = agg_func.parse()?;
        self.data.aggregate_group(&self.column_groups, group_id, func)
    }

    // -- Filtering --

    /// The rows passing the applied filters, with every column.
    pub fn filtered_subset(&self) -> Dataset {
        self.data.take_rows(&self.filtered)
    }

    pub fn filtered_len(&self) -> usize {
        self.filtered.len()
    }

    /// A filter chain over the current filtered view.
    pub fn filter_chain(&self) -> FilterChain {
        FilterChain::new(self.filtered_subset())
    }

    /// Narrow the filtered view to the rows of `chain`'s output, recomputing
    /// the chain first if it has pending changes. Returns the number of rows
    /// removed.
    ///
    /// Rows already filtered out stay out, so a chain built over the full
    /// dataset combines with earlier filters.
    pub fn apply_filters(&mut self, chain: &mut FilterChain) -> usize {
        chain.recompute();
        let keep = self.data.positions_of(chain.output().index());
        let before = self.filtered.len();
        self.filtered.retain(|i| keep.binary_search(i).is_ok());
        let removed = before - self.filtered.len();

        for (position, warning) in chain.warnings() {
            log::warn!("{}: filter {position} did not apply: {warning}", self.name);
        }
        self.applied_filters.extend(chain.descriptions());
        log::info!(
            "{}: filters removed {removed} rows, {} of {} remain",
            self.name,
            self.filtered.len(),
            self.data.len()
        );
        removed
    }

    pub fn filter_descriptions(&self) -> &[String] {
        &self.applied_filters
    }

    /// Undo every filter.
    pub fn reset_filter(&mut self) {
        self.filtered = (0..self.data.len()).collect();
        self.applied_filters.clear();
    }

    /// Conform the dataset to a regular index at its common timestep,
    /// resetting the filter. Returns the number of intervals added.
    pub fn reindex(&mut self) -> Result<usize> {
        let (data, added) = self.data.reindex()?;
        self.data = data;
        self.reset_filter();
        Ok(added)
    }

    // -- Regression columns --

    /// Resolve `regression_cols` against the full dataset, adding the
    /// aggregated and derived columns it asks for.
    pub fn process_regression_columns(&mut self) -> Result<ResolveReport> {
        let report = resolver::resolve(
            &mut self.regression_cols,
            &mut self.data,
            &self.column_groups,
            &self.derivations,
        )?;
        log::info!(
            "{}: regression columns resolved, {} columns added",
            self.name,
            report.created_columns.len()
        );
        Ok(report)
    }

    /// Physical column behind a resolved regression variable.
    pub fn regression_column(&self, variable: &str) -> Result<&str> {
        let id = self
            .regression_cols
            .get(variable)
            .and_then(|p| p.as_column())
            .ok_or_else(|| CapError::UnresolvedParameter(variable.to_string()))?;
        if let Some(column) = self.column_groups.as_single(id) {
            return Ok(column);
        }
        if self.data.contains_column(id) {
            return Ok(id);
        }
        if self.column_groups.contains(id) {
            return Err(CapError::UnresolvedParameter(variable.to_string()));
        }
        Err(CapError::UnknownColumn(id.to_string()))
    }

    /// The filtered rows of every regression variable, each column named
    /// after its variable.
    pub fn regression_view(&self) -> Result<Dataset> {
        let index = self.filtered.iter().map(|&i| self.data.index()[i]).collect();
        let mut view = Dataset::new(index)?;
        for variable in self.regression_cols.keys() {
            let values = self.data.require_column(self.regression_column(variable)?)?;
            view.insert_column(variable.clone(), self.filtered.iter().map(|&i| values[i]).collect())?;
        }
        Ok(view)
    }
}
