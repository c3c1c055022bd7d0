use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CalcParam – one node of a calculation-parameter specification
// ---------------------------------------------------------------------------

/// A node of the nested specification describing how a regression variable
/// is obtained from the measured data.
///
/// In configuration files a node is written as:
/// * `"irr_poa"` – a column group id or a column name
/// * `["irr_poa", "mean"]` – a row-wise aggregation of a group
/// * `["bom_temp", {"poa": ..., "temp_amb": ...}]` – a derivation applied to
///   the resolved parameters
///
/// Resolution rewrites aggregation and derivation nodes into `Column` nodes
/// naming the column they produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CalcParam {
    Column(String),
    Aggregate(String, String),
    Derive(String, BTreeMap<String, CalcParam>),
}

/// Regression variable name → how to obtain it.
pub type RegressionColumns = BTreeMap<String, CalcParam>;

impl CalcParam {
    pub fn column(name: impl Into<String>) -> Self {
        CalcParam::Column(name.into())
    }

    pub fn aggregate(group_id: impl Into<String>, agg_func: impl Into<String>) -> Self {
        CalcParam::Aggregate(group_id.into(), agg_func.into())
    }

    pub fn derive<K: Into<String>>(
        derivation: impl Into<String>,
        params: impl IntoIterator<Item = (K, CalcParam)>,
    ) -> Self {
        CalcParam::Derive(
            derivation.into(),
            params.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )
    }

    /// The column name once this node is resolved.
    pub fn as_column(&self) -> Option<&str> {
        match self {
            CalcParam::Column(name) => Some(name),
            _ => None,
        }
    }

    /// Whether this node and everything below it is a plain string.
    pub fn is_resolved(&self) -> bool {
        matches!(self, CalcParam::Column(_))
    }
}

impl From<&str> for CalcParam {
    fn from(name: &str) -> Self {
        CalcParam::Column(name.to_string())
    }
}

impl fmt::Display for CalcParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalcParam::Column(name) => write!(f, "{name}"),
            CalcParam::Aggregate(group, func) => write!(f, "{func}({group})"),
            CalcParam::Derive(name, params) => {
                write!(f, "{name}(")?;
                for (i, (key, value)) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}={value}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_nested_specification() {
        let json = r#"{
            "power": "real_pwr_mtr",
            "poa": ["irr_poa", "mean"],
            "t_cell": ["cell_temp", {
                "poa": ["irr_poa", "mean"],
                "bom": ["bom_temp", {
                    "poa": ["irr_poa", "mean"],
                    "temp_amb": ["temp_amb", "mean"],
                    "wind_speed": "wind"
                }]
            }]
        }"#;
        let spec: RegressionColumns = serde_json::from_str(json).unwrap();
        assert_eq!(spec["power"], CalcParam::column("real_pwr_mtr"));
        assert_eq!(spec["poa"], CalcParam::aggregate("irr_poa", "mean"));
        let CalcParam::Derive(name, params) = &spec["t_cell"] else {
            panic!("expected a derivation");
        };
        assert_eq!(name, "cell_temp");
        assert!(matches!(params["bom"], CalcParam::Derive(ref n, _) if n == "bom_temp"));
    }

    #[test]
    fn display_reads_like_a_call() {
        let node = CalcParam::derive(
            "e_total",
            [("poa", CalcParam::aggregate("irr_poa", "mean")), ("rpoa", "rpoa1".into())],
        );
        assert_eq!(node.to_string(), "e_total(poa=mean(irr_poa), rpoa=rpoa1)");
    }
}
