use std::collections::{BTreeMap, HashMap};

use super::derivations::{ColumnParams, Derivation, DerivationRegistry};
use super::spec::{CalcParam, RegressionColumns};
use crate::data::column_groups::ColumnGroups;
use crate::data::model::{agg_column_name, AggFunc, Dataset};
use crate::error::{CapError, Result};

// ---------------------------------------------------------------------------
// Aggregation cache
// ---------------------------------------------------------------------------

/// Columns materialized for `(group_id, agg_func)` pairs during one pass.
#[derive(Debug, Clone, Default)]
pub struct AggCache {
    entries: HashMap<(String, String), String>,
}

impl AggCache {
    pub fn get(&self, group_id: &str, agg_func: &str) -> Option<&str> {
        self.entries
            .get(&(group_id.to_string(), agg_func.to_string()))
            .map(String::as_str)
    }

    pub fn insert(&mut self, group_id: &str, agg_func: &str, column: String) {
        self.entries
            .insert((group_id.to_string(), agg_func.to_string()), column);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What a resolution pass did to the dataset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveReport {
    /// Columns added to the dataset, in the order they were created.
    pub created_columns: Vec<String>,
    /// Aggregation requests answered from the cache.
    pub cache_hits: usize,
    /// Derivations invoked.
    pub derivations_run: usize,
}

impl ResolveReport {
    pub fn is_noop(&self) -> bool {
        self.created_columns.is_empty() && self.derivations_run == 0
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolve every node of `spec` to a column of `data`.
///
/// Aggregations and derivations are evaluated children first, their results
/// stored as columns, and each evaluated node is rewritten in place to the
/// name of its column. Resolving an already resolved specification does
/// nothing. On error the pass stops; nodes resolved so far stay rewritten.
pub fn resolve(
    spec: &mut RegressionColumns,
    data: &mut Dataset,
    groups: &ColumnGroups,
    derivations: &DerivationRegistry,
) -> Result<ResolveReport> {
    Resolver::new(data, groups, derivations).run(spec)
}

struct Resolver<'a> {
    data: &'a mut Dataset,
    groups: &'a ColumnGroups,
    derivations: &'a DerivationRegistry,
    cache: AggCache,
    /// Derivations whose parameters are being resolved, outermost first.
    resolving: Vec<String>,
    /// Derivations already written during this pass.
    derived: Vec<String>,
    report: ResolveReport,
}

impl<'a> Resolver<'a> {
    fn new(data: &'a mut Dataset, groups: &'a ColumnGroups, derivations: &'a DerivationRegistry) -> Self {
        Resolver {
            data,
            groups,
            derivations,
            cache: AggCache::default(),
            resolving: Vec::new(),
            derived: Vec::new(),
            report: ResolveReport::default(),
        }
    }

    fn run(mut self, spec: &mut RegressionColumns) -> Result<ResolveReport> {
        for (key, node) in spec.iter_mut() {
            match node {
                CalcParam::Column(id) => {
                    // Multi-column groups stay as they are until aggregated.
                    if let Some(column) = self.groups.as_single(id) {
                        log::debug!("'{key}': group '{id}' resolved to column '{column}'");
                        *id = column.to_string();
                    }
                }
                _ => {
                    let mut path = vec![key.clone()];
                    self.resolve_node(node, &mut path)?;
                }
            }
        }
        log::debug!(
            "Resolution pass created {} columns ({} cached aggregations)",
            self.report.created_columns.len(),
            self.cache.len()
        );
        Ok(self.report)
    }

    fn resolve_node(&mut self, node: &mut CalcParam, path: &mut Vec<String>) -> Result<()> {
        let column = match node {
            CalcParam::Column(_) => return Ok(()),
            CalcParam::Aggregate(group_id, agg_func) => self.aggregate(group_id, agg_func, path)?,
            CalcParam::Derive(name, params) => self.derive(name, params, path)?,
        };
        *node = CalcParam::Column(column);
        Ok(())
    }

    fn aggregate(&mut self, group_id: &str, agg_func: &str, path: &[String]) -> Result<String> {
        let at = path.join("/");
        let func: AggFunc = agg_func.parse().map_err(|e: CapError| e.at_path(&at))?;

        if let Some(column) = self.cache.get(group_id, agg_func) {
            self.report.cache_hits += 1;
            return Ok(column.to_string());
        }

        let expected = agg_column_name(group_id, agg_func);
        let column = if self.data.contains_column(&expected) {
            log::debug!("'{at}': reusing existing column '{expected}'");
            expected
        } else {
            let column = self
                .data
                .aggregate_group(self.groups, group_id, func)
                .map_err(|e| e.at_path(&at))?;
            self.report.created_columns.push(column.clone());
            column
        };
        self.cache.insert(group_id, agg_func, column.clone());
        Ok(column)
    }

    fn derive(
        &mut self,
        name: &str,
        params: &mut BTreeMap<String, CalcParam>,
        path: &mut Vec<String>,
    ) -> Result<String> {
        if self.resolving.iter().any(|n| n == name) {
            return Err(CapError::CyclicSpecification {
                name: name.to_string(),
                path: path.join("/"),
            });
        }
        let registry: &'a DerivationRegistry = self.derivations;
        let derivation = registry.get(name).ok_or_else(|| CapError::UnknownDerivation {
            name: name.to_string(),
            path: path.join("/"),
        })?;

        self.resolving.push(name.to_string());
        let result = self.derive_resolved(derivation, params, path);
        self.resolving.pop();
        result
    }

    fn derive_resolved(
        &mut self,
        derivation: &dyn Derivation,
        params: &mut BTreeMap<String, CalcParam>,
        path: &mut Vec<String>,
    ) -> Result<String> {
        let name = derivation.name();

        for (key, value) in params.iter_mut() {
            path.push(key.clone());
            let resolved = self.resolve_node(value, path);
            path.pop();
            resolved?;
        }

        let at = path.join("/");
        let mut columns = ColumnParams::new();
        for (key, value) in params.iter() {
            let id = value
                .as_column()
                .ok_or_else(|| CapError::UnresolvedParameter(format!("{at}/{key}")))?;
            let column = self.input_column(id, &format!("{at}/{key}"))?;
            columns.insert(key.clone(), column);
        }
        if let Some(missing) = derivation.inputs().iter().find(|k| !columns.contains_key(**k)) {
            return Err(CapError::MissingParameter {
                derivation: name.to_string(),
                parameter: missing.to_string(),
                path: at,
            });
        }

        let values = derivation
            .compute(&*self.data, &columns)
            .map_err(|e| e.at_path(&at))?;
        let existed = self.data.contains_column(name);
        self.data.insert_column(name, values)?;
        self.report.derivations_run += 1;
        if self.derived.iter().any(|d| d == name) {
            log::warn!("'{at}': '{name}' already derived in this pass, earlier result overwritten");
        } else if existed {
            log::debug!("'{at}': recomputed existing column '{name}'");
        }
        if !existed {
            self.report.created_columns.push(name.to_string());
        }
        self.derived.push(name.to_string());
        Ok(name.to_string())
    }

    /// Column to bind for a resolved parameter value.
    fn input_column(&self, id: &str, at: &str) -> Result<String> {
        if let Some(column) = self.groups.as_single(id) {
            return Ok(column.to_string());
        }
        if let Ok(members) = self.groups.lookup(id) {
            return Err(CapError::AmbiguousGroup {
                group: id.to_string(),
                count: members.len(),
                path: at.to_string(),
            });
        }
        if self.resolving.iter().any(|n| n == id) {
            return Err(CapError::CyclicSpecification {
                name: id.to_string(),
                path: at.to_string(),
            });
        }
        if self.data.contains_column(id) {
            return Ok(id.to_string());
        }
        Err(CapError::UnknownGroup {
            group: id.to_string(),
            path: at.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use chrono::NaiveDate;

    use super::*;

    /// Records the columns it was called with and writes a constant.
    #[derive(Debug, Clone)]
    struct Recorder {
        name: &'static str,
        inputs: &'static [&'static str],
        value: f64,
        calls: Rc<RefCell<Vec<ColumnParams>>>,
    }

    impl Recorder {
        fn new(name: &'static str, inputs: &'static [&'static str], value: f64) -> Self {
            Recorder { name, inputs, value, calls: Rc::default() }
        }
    }

    impl Derivation for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn inputs(&self) -> &[&'static str] {
            self.inputs
        }

        fn compute(&self, data: &Dataset, params: &ColumnParams) -> Result<Vec<f64>> {
            self.calls.borrow_mut().push(params.clone());
            Ok(vec![self.value; data.len()])
        }
    }

    fn dataset() -> Dataset {
        let start = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let index = (0..10).map(|i| start + chrono::Duration::minutes(5 * i)).collect();
        let cols = [
            "metered_power_kw", "pyran1", "pyran2", "temp_amb1", "temp_amb2",
            "wind_speed1", "wind_speed2", "irr_rpoa1", "irr_rpoa2",
        ];
        Dataset::from_columns(index, cols.iter().map(|c| (*c, vec![1.0; 10]))).unwrap()
    }

    fn groups() -> ColumnGroups {
        ColumnGroups::from_iter([
            ("real_pwr_mtr", vec!["metered_power_kw"]),
            ("irr_poa", vec!["pyran1", "pyran2"]),
            ("temp_amb", vec!["temp_amb1", "temp_amb2"]),
            ("wind_speed", vec!["wind_speed1", "wind_speed2"]),
            ("irr_rpoa", vec!["irr_rpoa1", "irr_rpoa2"]),
        ])
    }

    fn nested_spec() -> RegressionColumns {
        let poa = || CalcParam::aggregate("irr_poa", "mean");
        RegressionColumns::from([
            (
                "power_tc".to_string(),
                CalcParam::derive(
                    "test_func1",
                    [
                        ("power", CalcParam::from("real_pwr_mtr")),
                        (
                            "cell_temp",
                            CalcParam::derive(
                                "test_func2",
                                [
                                    ("poa", poa()),
                                    (
                                        "bom",
                                        CalcParam::derive(
                                            "test_func3",
                                            [
                                                ("poa", poa()),
                                                ("temp_amb", CalcParam::aggregate("temp_amb", "mean")),
                                                ("wind_speed", CalcParam::aggregate("wind_speed", "mean")),
                                            ],
                                        ),
                                    ),
                                ],
                            ),
                        ),
                    ],
                ),
            ),
            (
                "irr_total".to_string(),
                CalcParam::derive(
                    "test_func4",
                    [("poa", poa()), ("rpoa", CalcParam::aggregate("irr_rpoa", "mean"))],
                ),
            ),
        ])
    }

    #[test]
    fn resolves_nested_specification_bottom_up() {
        let f1 = Recorder::new("test_func1", &["power", "cell_temp"], 1.0);
        let f2 = Recorder::new("test_func2", &["poa", "bom"], 2.0);
        let f3 = Recorder::new("test_func3", &["poa", "temp_amb", "wind_speed"], 3.0);
        let f4 = Recorder::new("test_func4", &["poa", "rpoa"], 4.0);
        let (c1, c2, c3) = (f1.calls.clone(), f2.calls.clone(), f3.calls.clone());
        let mut registry = DerivationRegistry::new();
        for f in [f1, f2, f3, f4] {
            registry.register(f);
        }

        let mut data = dataset();
        let mut spec = nested_spec();
        let report = resolve(&mut spec, &mut data, &groups(), &registry).unwrap();

        assert_eq!(spec["power_tc"], CalcParam::column("test_func1"));
        assert_eq!(spec["irr_total"], CalcParam::column("test_func4"));
        assert_eq!(
            report.created_columns,
            [
                "irr_poa_mean_agg", "irr_rpoa_mean_agg", "test_func4", "temp_amb_mean_agg",
                "wind_speed_mean_agg", "test_func3", "test_func2", "test_func1",
            ]
        );
        assert_eq!(data.column_names().len(), 9 + 8);
        assert_eq!(report.cache_hits, 2);
        assert_eq!(report.derivations_run, 4);

        let bind = |pairs: &[(&str, &str)]| -> ColumnParams {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        assert_eq!(
            c1.borrow()[0],
            bind(&[("power", "metered_power_kw"), ("cell_temp", "test_func2")])
        );
        assert_eq!(c2.borrow()[0], bind(&[("poa", "irr_poa_mean_agg"), ("bom", "test_func3")]));
        assert_eq!(
            c3.borrow()[0],
            bind(&[
                ("poa", "irr_poa_mean_agg"),
                ("temp_amb", "temp_amb_mean_agg"),
                ("wind_speed", "wind_speed_mean_agg"),
            ])
        );
        assert_eq!(data.column("test_func3").unwrap(), &[3.0; 10]);
    }

    #[test]
    fn second_pass_is_a_noop() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("e", &["poa"], 1.0));
        let mut spec = RegressionColumns::from([
            ("power".to_string(), CalcParam::from("real_pwr_mtr")),
            ("poa".to_string(), CalcParam::aggregate("irr_poa", "mean")),
            ("e".to_string(), CalcParam::derive("e", [("poa", CalcParam::aggregate("irr_poa", "max"))])),
            ("t_amb".to_string(), CalcParam::from("temp_amb")),
        ]);
        let mut data = dataset();
        resolve(&mut spec, &mut data, &groups(), &registry).unwrap();
        let after_first = (spec.clone(), data.clone());

        let report = resolve(&mut spec, &mut data, &groups(), &registry).unwrap();
        assert!(report.is_noop());
        assert_eq!((spec, data), after_first);
    }

    #[test]
    fn single_column_groups_resolve_and_multi_column_groups_wait() {
        let mut spec = RegressionColumns::from([
            ("power".to_string(), CalcParam::from("real_pwr_mtr")),
            ("t_amb".to_string(), CalcParam::from("temp_amb")),
        ]);
        let mut data = dataset();
        resolve(&mut spec, &mut data, &groups(), &DerivationRegistry::new()).unwrap();
        assert_eq!(spec["power"], CalcParam::column("metered_power_kw"));
        assert_eq!(spec["t_amb"], CalcParam::column("temp_amb"));
    }

    #[test]
    fn existing_aggregate_column_is_reused() {
        let mut data = dataset();
        data.insert_column("irr_poa_mean_agg", vec![7.0; 10]).unwrap();
        let mut spec = RegressionColumns::from([("poa".to_string(), CalcParam::aggregate("irr_poa", "mean"))]);
        let report = resolve(&mut spec, &mut data, &groups(), &DerivationRegistry::new()).unwrap();
        assert!(report.created_columns.is_empty());
        assert_eq!(data.column("irr_poa_mean_agg").unwrap(), &[7.0; 10]);
        assert_eq!(spec["poa"], CalcParam::column("irr_poa_mean_agg"));
    }

    #[test]
    fn unknown_group_reports_path() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("bom", &["wind"], 1.0));
        let mut spec = RegressionColumns::from([(
            "t".to_string(),
            CalcParam::derive("bom", [("wind", CalcParam::aggregate("wind_gust", "mean"))]),
        )]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &registry).unwrap_err();
        assert_eq!(
            err,
            CapError::UnknownGroup { group: "wind_gust".into(), path: "t/wind".into() }
        );
    }

    #[test]
    fn unsupported_aggregation() {
        let mut spec = RegressionColumns::from([("poa".to_string(), CalcParam::aggregate("irr_poa", "median"))]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &DerivationRegistry::new()).unwrap_err();
        assert_eq!(
            err,
            CapError::UnsupportedAggregation { func: "median".into(), path: "poa".into() }
        );
    }

    #[test]
    fn nested_self_reference_is_cyclic() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("bom_temp", &["poa"], 1.0));
        let mut spec = RegressionColumns::from([(
            "t".to_string(),
            CalcParam::derive(
                "bom_temp",
                [("poa", CalcParam::derive("bom_temp", [("poa", CalcParam::aggregate("irr_poa", "mean"))]))],
            ),
        )]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &registry).unwrap_err();
        assert_eq!(
            err,
            CapError::CyclicSpecification { name: "bom_temp".into(), path: "t/poa".into() }
        );
    }

    #[test]
    fn parameter_naming_own_output_is_cyclic() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("cell_temp", &["bom"], 1.0));
        let mut spec = RegressionColumns::from([(
            "t".to_string(),
            CalcParam::derive("cell_temp", [("bom", CalcParam::from("cell_temp"))]),
        )]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &registry).unwrap_err();
        assert!(matches!(err, CapError::CyclicSpecification { name, .. } if name == "cell_temp"));
    }

    #[test]
    fn parameter_naming_own_existing_column_is_cyclic() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("cell_temp", &["bom"], 11.0));
        let mut data = dataset();
        data.insert_column("cell_temp", vec![10.0; 10]).unwrap();
        let mut spec = RegressionColumns::from([(
            "t".to_string(),
            CalcParam::derive("cell_temp", [("bom", CalcParam::from("cell_temp"))]),
        )]);
        let err = resolve(&mut spec, &mut data, &groups(), &registry).unwrap_err();
        assert_eq!(
            err,
            CapError::CyclicSpecification { name: "cell_temp".into(), path: "t/bom".into() }
        );
        assert_eq!(data.column("cell_temp").unwrap(), &[10.0; 10]);
    }

    #[test]
    fn sibling_derivations_share_one_column() {
        let bom = Recorder::new("bom_temp", &["poa"], 1.0);
        let calls = bom.calls.clone();
        let mut registry = DerivationRegistry::new();
        registry.register(bom);
        let mut spec = RegressionColumns::from([
            ("a".to_string(), CalcParam::derive("bom_temp", [("poa", CalcParam::aggregate("irr_poa", "mean"))])),
            ("b".to_string(), CalcParam::derive("bom_temp", [("poa", CalcParam::aggregate("irr_poa", "max"))])),
        ]);
        let mut data = dataset();
        let report = resolve(&mut spec, &mut data, &groups(), &registry).unwrap();
        assert_eq!(calls.borrow().len(), 2);
        assert_eq!(report.derivations_run, 2);
        assert_eq!(report.created_columns.iter().filter(|c| *c == "bom_temp").count(), 1);
        assert_eq!(spec["a"], spec["b"]);
    }

    #[test]
    fn multi_column_group_as_derivation_input_is_ambiguous() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("bom", &["poa"], 1.0));
        let mut spec = RegressionColumns::from([(
            "t".to_string(),
            CalcParam::derive("bom", [("poa", CalcParam::from("irr_poa"))]),
        )]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &registry).unwrap_err();
        assert!(matches!(err, CapError::AmbiguousGroup { count: 2, .. }));
    }

    #[test]
    fn unregistered_derivation_and_missing_parameter() {
        let mut registry = DerivationRegistry::new();
        registry.register(Recorder::new("needs_two", &["a", "b"], 1.0));

        let mut spec = RegressionColumns::from([(
            "x".to_string(),
            CalcParam::derive("nope", [("a", CalcParam::from("real_pwr_mtr"))]),
        )]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &registry).unwrap_err();
        assert!(matches!(err, CapError::UnknownDerivation { .. }));

        let mut spec = RegressionColumns::from([(
            "x".to_string(),
            CalcParam::derive("needs_two", [("a", CalcParam::from("real_pwr_mtr"))]),
        )]);
        let err = resolve(&mut spec, &mut dataset(), &groups(), &registry).unwrap_err();
        assert!(matches!(err, CapError::MissingParameter { parameter, .. } if parameter == "b"));
    }
}
