use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use super::clear_sky::{ClearSkyDetector, WindowedClearSky};
use super::model::Dataset;
use super::outliers::{EllipticEnvelope, OutlierDetector};
use crate::error::{CapError, FilterWarning, Result};

// ---------------------------------------------------------------------------
// Filter parameters
// ---------------------------------------------------------------------------

fn default_irradiance_range() -> (f64, f64) {
    (0.0, 1200.0)
}

fn default_contamination() -> f64 {
    0.04
}

fn default_support_fraction() -> f64 {
    0.9
}

fn default_window_minutes() -> u32 {
    10
}

fn yes() -> bool {
    true
}

/// One row-selection stage. Its output is a function of the upstream
/// output and these parameters only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Filter {
    /// Keep rows whose irradiance lies in the inclusive `range`.
    Irradiance {
        column: String,
        /// Power column reported alongside irradiance when the input is empty.
        #[serde(default)]
        power_column: Option<String>,
        #[serde(default = "default_irradiance_range")]
        range: (f64, f64),
    },
    /// Keep rows inside the inclusive period, or only those outside it when
    /// `drop` is set.
    Time {
        start: NaiveDateTime,
        end: NaiveDateTime,
        #[serde(default)]
        drop: bool,
    },
    /// Keep the inliers of an elliptic envelope fitted to two columns.
    Outliers {
        columns: Vec<String>,
        #[serde(default = "default_contamination")]
        contamination: f64,
        #[serde(default = "default_support_fraction")]
        support_fraction: f64,
        #[serde(default = "yes")]
        apply: bool,
    },
    /// Keep the periods where measured irradiance tracks the modeled
    /// clear-sky irradiance (or the periods where it does not).
    ClearSky {
        measured: String,
        modeled: String,
        #[serde(default = "default_window_minutes")]
        window_minutes: u32,
        #[serde(default = "yes")]
        keep_clear: bool,
    },
}

/// Result of running one filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutput {
    pub data: Dataset,
    pub warning: Option<FilterWarning>,
}

impl FilterOutput {
    fn rows(upstream: &Dataset, positions: &[usize]) -> Self {
        FilterOutput {
            data: upstream.take_rows(positions),
            warning: None,
        }
    }

    fn unchanged(upstream: &Dataset) -> Self {
        FilterOutput {
            data: upstream.clone(),
            warning: None,
        }
    }

    fn with_warning(mut self, warning: FilterWarning) -> Self {
        log::warn!("{warning}");
        self.warning = Some(warning);
        self
    }

    /// Pass the input through and surface `warning`.
    fn pass_through(upstream: &Dataset, warning: FilterWarning) -> Self {
        log::warn!("{warning}; passing {} rows through unchanged", upstream.len());
        FilterOutput {
            data: upstream.clone(),
            warning: Some(warning),
        }
    }
}

/// The outlier and clear-sky algorithms the filters delegate to.
#[derive(Debug)]
pub struct Detectors {
    pub outliers: Box<dyn OutlierDetector>,
    pub clear_sky: Box<dyn ClearSkyDetector>,
}

impl Default for Detectors {
    fn default() -> Self {
        Detectors {
            outliers: Box::new(EllipticEnvelope::default()),
            clear_sky: Box::new(WindowedClearSky::default()),
        }
    }
}

impl Filter {
    /// Time filter covering whole days, `start` 00:00 through the end of `end`.
    pub fn for_dates(start: NaiveDate, end: NaiveDate, drop: bool) -> Self {
        let midnight = NaiveTime::default();
        Filter::Time {
            start: start.and_time(midnight),
            end: end.and_time(midnight) + Duration::days(1) - Duration::nanoseconds(1),
            drop,
        }
    }

    /// Audit line rendered from the current parameters.
    pub fn description(&self) -> String {
        match self {
            Filter::Irradiance { range, .. } => {
                format!("This filter removes irradiance below {} and above {}", range.0, range.1)
            }
            Filter::Time { start, end, drop } => {
                let action = if *drop { "removes" } else { "keeps only" };
                format!("This filter {action} the data from {start} to {end}")
            }
            Filter::Outliers { apply: false, .. } => "This filter is disabled and keeps all data".to_string(),
            Filter::Outliers { columns, contamination, support_fraction, .. } => format!(
                "This filter removes outliers of {} with a contamination of {contamination} \
                 and a support fraction of {support_fraction}",
                columns.join(" vs "),
            ),
            Filter::ClearSky { measured, modeled, window_minutes, keep_clear } => format!(
                "This filter keeps only the {} periods found comparing {measured} to {modeled} \
                 over {window_minutes} minute windows",
                if *keep_clear { "clear" } else { "cloudy" },
            ),
        }
    }

    /// Compute this filter's output from `upstream`.
    pub fn recompute(&self, upstream: &Dataset, detectors: &Detectors) -> FilterOutput {
        match self {
            Filter::Irradiance { column, power_column, range } => {
                if upstream.is_empty() {
                    let mut expected = vec![column.as_str()];
                    expected.extend(power_column.as_deref());
                    return FilterOutput {
                        data: Dataset::empty_with_columns(&expected),
                        warning: None,
                    };
                }
                let (low, high) = *range;
                if !(low <= high) {
                    return FilterOutput::pass_through(
                        upstream,
                        FilterWarning::InvalidParameter(format!("irradiance range ({low}, {high})")),
                    );
                }
                let Some(irr) = upstream.column(column) else {
                    return FilterOutput::pass_through(upstream, FilterWarning::MissingColumn(column.clone()));
                };
                let keep = upstream.positions_where(|i| irr[i] >= low && irr[i] <= high);
                FilterOutput::rows(upstream, &keep)
            }
            Filter::Time { start, end, drop } => {
                if start > end {
                    return FilterOutput::pass_through(
                        upstream,
                        FilterWarning::InvalidParameter(format!("period starts at {start} after it ends at {end}")),
                    );
                }
                let index = upstream.index();
                let keep = upstream.positions_where(|i| (index[i] >= *start && index[i] <= *end) != *drop);
                FilterOutput::rows(upstream, &keep)
            }
            Filter::Outliers { columns, contamination, support_fraction, apply } => {
                if !apply || upstream.is_empty() {
                    return FilterOutput::unchanged(upstream);
                }
                let [x_col, y_col] = columns.as_slice() else {
                    let warning = if columns.len() > 2 {
                        FilterWarning::TooManyColumns { count: columns.len() }
                    } else {
                        FilterWarning::InvalidParameter(format!(
                            "outlier filter needs two columns, got {}",
                            columns.len()
                        ))
                    };
                    return FilterOutput::pass_through(upstream, warning);
                };
                if !(0.0..=0.5).contains(contamination) || !(0.0..=1.0).contains(support_fraction) {
                    return FilterOutput::pass_through(
                        upstream,
                        FilterWarning::InvalidParameter(format!(
                            "contamination {contamination}, support fraction {support_fraction}"
                        )),
                    );
                }
                let (x, y) = match (upstream.column(x_col), upstream.column(y_col)) {
                    (Some(x), Some(y)) => (x, y),
                    (None, _) => return FilterOutput::pass_through(upstream, FilterWarning::MissingColumn(x_col.clone())),
                    (_, None) => return FilterOutput::pass_through(upstream, FilterWarning::MissingColumn(y_col.clone())),
                };

                let finite = upstream.positions_where(|i| x[i].is_finite() && y[i].is_finite());
                let fx: Vec<f64> = finite.iter().map(|&i| x[i]).collect();
                let fy: Vec<f64> = finite.iter().map(|&i| y[i]).collect();
                let Some(labels) = detectors
                    .outliers
                    .fit_predict(&fx, &fy, *contamination, *support_fraction)
                else {
                    return FilterOutput::pass_through(upstream, FilterWarning::NoOutlierModelConvergence);
                };
                let mut labels = finite.iter().zip(&labels).peekable();
                let keep = upstream.positions_where(|i| match labels.next_if(|&(&p, _)| p == i) {
                    Some((_, &label)) => label == 1,
                    None => true,
                });
                log::debug!("Outlier filter removed {} of {} rows", upstream.len() - keep.len(), upstream.len());
                let unclassified = upstream.len() - finite.len();
                let out = FilterOutput::rows(upstream, &keep);
                if unclassified > 0 {
                    out.with_warning(FilterWarning::UnclassifiedRows { count: unclassified })
                } else {
                    out
                }
            }
            Filter::ClearSky { measured, modeled, window_minutes, keep_clear } => {
                if upstream.is_empty() {
                    return FilterOutput::unchanged(upstream);
                }
                let (meas, clear) = match (upstream.column(measured), upstream.column(modeled)) {
                    (Some(m), Some(c)) => (m, c),
                    (None, _) => return FilterOutput::pass_through(upstream, FilterWarning::MissingColumn(measured.clone())),
                    (_, None) => return FilterOutput::pass_through(upstream, FilterWarning::MissingColumn(modeled.clone())),
                };
                let is_clear = detectors
                    .clear_sky
                    .detect(upstream.index(), meas, clear, *window_minutes);
                if !is_clear.iter().any(|&c| c) {
                    return FilterOutput::pass_through(
                        upstream,
                        FilterWarning::NoClearIntervals { window_minutes: *window_minutes },
                    );
                }
                let keep = upstream.positions_where(|i| is_clear.get(i).copied().unwrap_or(false) == *keep_clear);
                FilterOutput::rows(upstream, &keep)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FilterChain – a straight line of filters over a base dataset
// ---------------------------------------------------------------------------

/// A filter and its most recently computed output.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterNode {
    filter: Filter,
    output: Dataset,
    warning: Option<FilterWarning>,
}

impl FilterNode {
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn output(&self) -> &Dataset {
        &self.output
    }

    pub fn warning(&self) -> Option<&FilterWarning> {
        self.warning.as_ref()
    }
}

/// Filters applied one after the other, each to the output of the previous
/// one (the first to the base dataset).
///
/// Changing a filter recomputes that node and the nodes downstream of it,
/// never the nodes upstream. Changes made through [`FilterChain::filter_mut`]
/// take effect on the next [`FilterChain::recompute`].
#[derive(Debug)]
pub struct FilterChain {
    base: Dataset,
    nodes: Vec<FilterNode>,
    detectors: Detectors,
    stale_from: Option<usize>,
}

impl FilterChain {
    pub fn new(base: Dataset) -> Self {
        Self::with_detectors(base, Detectors::default())
    }

    pub fn with_detectors(base: Dataset, detectors: Detectors) -> Self {
        FilterChain {
            base,
            nodes: Vec::new(),
            detectors,
            stale_from: None,
        }
    }

    pub fn base(&self) -> &Dataset {
        &self.base
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[FilterNode] {
        &self.nodes
    }

    pub fn node(&self, position: usize) -> Result<&FilterNode> {
        self.nodes.get(position).ok_or(CapError::NoSuchFilter(position))
    }

    fn upstream(&self, position: usize) -> &Dataset {
        match position.checked_sub(1) {
            Some(prev) => &self.nodes[prev].output,
            None => &self.base,
        }
    }

    /// Output of the last filter, or the base dataset for an empty chain.
    pub fn output(&self) -> &Dataset {
        self.nodes.last().map_or(&self.base, |n| &n.output)
    }

    /// Whether parameter changes are waiting for [`FilterChain::recompute`].
    pub fn is_stale(&self) -> bool {
        self.stale_from.is_some()
    }

    /// Append a filter fed by the current chain output and compute it.
    pub fn push(&mut self, filter: Filter) -> &Dataset {
        self.recompute();
        let out = filter.recompute(self.output(), &self.detectors);
        log::info!("{}: {} -> {} rows", filter.description(), self.output().len(), out.data.len());
        self.nodes.push(FilterNode {
            filter,
            output: out.data,
            warning: out.warning,
        });
        self.output()
    }

    /// Replace the filter at `position` and recompute from there down.
    pub fn update(&mut self, position: usize, filter: Filter) -> Result<()> {
        *self.filter_mut(position)? = filter;
        self.recompute();
        Ok(())
    }

    /// Edit a filter in place. The chain is stale until [`FilterChain::recompute`].
    pub fn filter_mut(&mut self, position: usize) -> Result<&mut Filter> {
        let node = self.nodes.get_mut(position).ok_or(CapError::NoSuchFilter(position))?;
        self.stale_from = Some(self.stale_from.map_or(position, |s| s.min(position)));
        Ok(&mut node.filter)
    }

    /// Remove the filter at `position`; downstream filters are fed by its
    /// upstream from now on.
    pub fn remove(&mut self, position: usize) -> Result<Filter> {
        if position >= self.nodes.len() {
            return Err(CapError::NoSuchFilter(position));
        }
        let removed = self.nodes.remove(position);
        if position < self.nodes.len() {
            self.stale_from = Some(self.stale_from.map_or(position, |s| s.min(position)));
        } else if self.stale_from.is_some_and(|s| s >= self.nodes.len()) {
            self.stale_from = None;
        }
        self.recompute();
        Ok(removed.filter)
    }

    /// Swap the base dataset and recompute every filter.
    pub fn set_base(&mut self, base: Dataset) {
        self.base = base;
        self.stale_from = Some(0);
        self.recompute();
    }

    /// Recompute the stale nodes and everything downstream of them.
    pub fn recompute(&mut self) {
        let Some(from) = self.stale_from.take() else {
            return;
        };
        for position in from..self.nodes.len() {
            let out = self.nodes[position].filter.recompute(self.upstream(position), &self.detectors);
            let node = &mut self.nodes[position];
            node.output = out.data;
            node.warning = out.warning;
        }
        log::debug!("Recomputed filters {from}..{}", self.nodes.len());
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.filter.description()).collect()
    }

    /// Row count of the base dataset followed by that of each filter output.
    pub fn row_counts(&self) -> Vec<usize> {
        std::iter::once(self.base.len())
            .chain(self.nodes.iter().map(|n| n.output.len()))
            .collect()
    }

    /// Warnings raised by the last computation, by filter position.
    pub fn warnings(&self) -> Vec<(usize, &FilterWarning)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.warning.as_ref().map(|w| (i, w)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 1, day).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    /// Three days of hourly rows; irradiance climbs 0, 100, ... within each day.
    fn data() -> Dataset {
        let index: Vec<NaiveDateTime> = (1..=3).flat_map(|d| (0..12).map(move |h| ts(d, h))).collect();
        let poa: Vec<f64> = (0..36).map(|i| (i % 12) as f64 * 100.0).collect();
        let power: Vec<f64> = poa.iter().map(|p| p * 0.9).collect();
        Dataset::from_columns(index, [("poa", poa), ("power", power)]).unwrap()
    }

    fn irradiance(low: f64, high: f64) -> Filter {
        Filter::Irradiance {
            column: "poa".into(),
            power_column: Some("power".into()),
            range: (low, high),
        }
    }

    #[test]
    fn irradiance_range_is_inclusive() {
        let out = irradiance(200.0, 800.0).recompute(&data(), &Detectors::default());
        assert!(out.warning.is_none());
        assert_eq!(out.data.len(), 3 * 7);
        assert!(out.data.column("poa").unwrap().iter().all(|&p| (200.0..=800.0).contains(&p)));
    }

    #[test]
    fn irradiance_on_empty_input_has_expected_columns() {
        let out = irradiance(0.0, 1200.0).recompute(&Dataset::default(), &Detectors::default());
        assert_eq!(out.data.len(), 0);
        assert_eq!(out.data.column_names(), ["poa", "power"]);
    }

    #[test]
    fn time_filter_keep_and_drop() {
        let d = data();
        let keep = Filter::for_dates(ts(2, 0).date(), ts(2, 0).date(), false).recompute(&d, &Detectors::default());
        let drop = Filter::for_dates(ts(2, 0).date(), ts(2, 0).date(), true).recompute(&d, &Detectors::default());
        assert_eq!(keep.data.len(), 12);
        assert_eq!(drop.data.len(), 24);
        assert!(keep.data.index().iter().all(|t| t.date() == ts(2, 0).date()));
        assert!(drop.data.index().iter().all(|t| t.date() != ts(2, 0).date()));
    }

    #[test]
    fn outlier_guard_warns_and_passes_through() {
        let d = data();
        let f = Filter::Outliers {
            columns: vec!["poa".into(), "power".into(), "poa".into()],
            contamination: 0.04,
            support_fraction: 0.9,
            apply: true,
        };
        let out = f.recompute(&d, &Detectors::default());
        assert_eq!(out.data, d);
        assert_eq!(out.warning, Some(FilterWarning::TooManyColumns { count: 3 }));
    }

    #[test]
    fn collinear_outlier_input_does_not_converge() {
        let d = data();
        let f = Filter::Outliers {
            columns: vec!["poa".into(), "power".into()],
            contamination: 0.04,
            support_fraction: 0.9,
            apply: true,
        };
        let out = f.recompute(&d, &Detectors::default());
        assert_eq!(out.data, d);
        assert_eq!(out.warning, Some(FilterWarning::NoOutlierModelConvergence));
    }

    #[test]
    fn missing_column_passes_through() {
        let out = Filter::Irradiance { column: "ghi".into(), power_column: None, range: (0.0, 100.0) }
            .recompute(&data(), &Detectors::default());
        assert_eq!(out.data.len(), 36);
        assert_eq!(out.warning, Some(FilterWarning::MissingColumn("ghi".into())));
    }

    #[test]
    fn editing_a_node_recomputes_downstream_only() {
        let mut chain = FilterChain::new(data());
        chain.push(irradiance(100.0, 1100.0));
        chain.push(Filter::for_dates(ts(1, 0).date(), ts(2, 0).date(), false));
        assert_eq!(chain.row_counts(), [36, 33, 22]);

        if let Filter::Irradiance { range, .. } = chain.filter_mut(0).unwrap() {
            *range = (500.0, 1100.0);
        }
        assert!(chain.is_stale());
        assert_eq!(chain.output().len(), 22);
        chain.recompute();
        assert_eq!(chain.row_counts(), [36, 21, 14]);

        chain.update(1, Filter::for_dates(ts(1, 0).date(), ts(2, 0).date(), true)).unwrap();
        assert_eq!(chain.row_counts(), [36, 21, 7]);

        let removed = chain.remove(0).unwrap();
        assert!(matches!(removed, Filter::Irradiance { .. }));
        assert_eq!(chain.row_counts(), [36, 12]);
        assert!(matches!(chain.remove(5), Err(CapError::NoSuchFilter(5))));
    }

    /// Reports every interval clear and counts how often it was asked.
    #[derive(Debug, Default)]
    struct CountingClearSky {
        calls: Rc<Cell<usize>>,
    }

    impl ClearSkyDetector for CountingClearSky {
        fn detect(&self, index: &[NaiveDateTime], _: &[f64], _: &[f64], _: u32) -> Vec<bool> {
            self.calls.set(self.calls.get() + 1);
            vec![true; index.len()]
        }
    }

    #[test]
    fn upstream_filters_are_not_recomputed() {
        let clear_sky = CountingClearSky::default();
        let calls = clear_sky.calls.clone();
        let detectors = Detectors { outliers: Box::new(EllipticEnvelope::default()), clear_sky: Box::new(clear_sky) };
        let mut chain = FilterChain::with_detectors(data(), detectors);
        chain.push(Filter::ClearSky {
            measured: "poa".into(),
            modeled: "poa".into(),
            window_minutes: 60,
            keep_clear: true,
        });
        chain.push(irradiance(100.0, 1100.0));
        assert_eq!(calls.get(), 1);

        if let Filter::Irradiance { range, .. } = chain.filter_mut(1).unwrap() {
            *range = (500.0, 1100.0);
        }
        chain.recompute();
        chain.update(1, irradiance(200.0, 1100.0)).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(chain.row_counts(), [36, 36, 30]);

        if let Filter::ClearSky { window_minutes, .. } = chain.filter_mut(0).unwrap() {
            *window_minutes = 30;
        }
        chain.recompute();
        assert_eq!(calls.get(), 2);
        chain.set_base(data());
        assert_eq!(calls.get(), 3);
    }

    /// Labels every pair an inlier.
    #[derive(Debug)]
    struct AllInliers;

    impl OutlierDetector for AllInliers {
        fn fit_predict(&self, x: &[f64], _: &[f64], _: f64, _: f64) -> Option<Vec<i8>> {
            Some(vec![1; x.len()])
        }
    }

    #[test]
    fn rows_with_missing_values_skip_outlier_classification() {
        let mut d = data();
        let mut power = d.column("power").unwrap().to_vec();
        power[5] = f64::NAN;
        power[20] = f64::INFINITY;
        d.insert_column("power", power).unwrap();
        let f = Filter::Outliers {
            columns: vec!["poa".into(), "power".into()],
            contamination: 0.0,
            support_fraction: 0.9,
            apply: true,
        };
        let detectors = Detectors { outliers: Box::new(AllInliers), clear_sky: Box::new(WindowedClearSky::default()) };
        let out = f.recompute(&d, &detectors);
        assert_eq!(out.data.len(), 36);
        assert!(out.data.column("power").unwrap()[5].is_nan());
        assert_eq!(out.warning, Some(FilterWarning::UnclassifiedRows { count: 2 }));
    }

    #[test]
    fn descriptions_follow_parameters() {
        let mut chain = FilterChain::new(data());
        chain.push(irradiance(200.0, 800.0));
        chain.push(Filter::Time { start: ts(1, 0), end: ts(2, 0), drop: true });
        assert_eq!(
            chain.descriptions(),
            [
                "This filter removes irradiance below 200 and above 800",
                "This filter removes the data from 2021-01-01 00:00:00 to 2021-01-02 00:00:00",
            ]
        );
    }

    #[test]
    fn filters_deserialize_with_defaults() {
        let chain: Vec<Filter> = serde_json::from_str(
            r#"[
                {"kind": "irradiance", "column": "poa"},
                {"kind": "time", "start": "2021-01-01T00:00:00", "end": "2021-01-02T00:00:00", "drop": true},
                {"kind": "outliers", "columns": ["poa", "power"]},
                {"kind": "clear_sky", "measured": "poa", "modeled": "poa_csky"}
            ]"#,
        )
        .unwrap();
        assert_eq!(chain[0], Filter::Irradiance { column: "poa".into(), power_column: None, range: (0.0, 1200.0) });
        assert!(matches!(chain[2], Filter::Outliers { contamination, apply: true, .. } if contamination == 0.04));
        assert!(matches!(chain[3], Filter::ClearSky { window_minutes: 10, keep_clear: true, .. }));
    }
}
