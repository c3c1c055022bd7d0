use chrono::NaiveDateTime;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Core error type
// ---------------------------------------------------------------------------

/// Errors raised by the dataset, the column groups and the calc-parameter
/// resolver.
///
/// Structural specification errors abort the resolution pass they occur in.
/// Their `path` is the chain of specification keys leading to the offending
/// node, joined with `/` (e.g. `power_tc/cell_temp/bom`).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CapError {
    #[error("unknown column group '{group}' (at '{path}')")]
    UnknownGroup { group: String, path: String },

    #[error("column group '{group}' has {count} columns, expected exactly one (at '{path}')")]
    AmbiguousGroup {
        group: String,
        count: usize,
        path: String,
    },

    #[error("unsupported aggregation '{func}' (at '{path}'), expected one of mean, sum, min, max")]
    UnsupportedAggregation { func: String, path: String },

    #[error("cyclic specification: '{name}' depends on itself (at '{path}')")]
    CyclicSpecification { name: String, path: String },

    #[error("no derivation named '{name}' is registered (at '{path}')")]
    UnknownDerivation { name: String, path: String },

    #[error("derivation '{derivation}' requires parameter '{parameter}' (at '{path}')")]
    MissingParameter {
        derivation: String,
        parameter: String,
        path: String,
    },

    #[error("dataset has no column '{0}'")]
    UnknownColumn(String),

    #[error("column group '{group}' references column '{column}' missing from the dataset")]
    MissingGroupColumn { group: String, column: String },

    #[error("column '{column}' has {found} values but the index has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },

    #[error("timestamp index is not strictly increasing at {0}")]
    UnorderedIndex(NaiveDateTime),

    #[error("no heat transfer coefficients for {module_type} modules on {racking} racking")]
    UnsupportedMounting { racking: String, module_type: String },

    #[error("setting '{0}' is required but was not configured")]
    MissingSetting(&'static str),

    #[error("regression parameter '{0}' is not resolved to a single column")]
    UnresolvedParameter(String),

    #[error("cannot determine a timestep from fewer than two timestamps")]
    IndeterminateTimestep,

    #[error("no data: {0}")]
    EmptyData(String),

    #[error("filter chain has no filter at position {0}")]
    NoSuchFilter(usize),
}

impl CapError {
    /// Attach the specification path to a structural error.
    pub(crate) fn at_path(mut self, at: &str) -> Self {
        match &mut self {
            CapError::UnknownGroup { path, .. }
            | CapError::AmbiguousGroup { path, .. }
            | CapError::UnsupportedAggregation { path, .. }
            | CapError::CyclicSpecification { path, .. }
            | CapError::UnknownDerivation { path, .. }
            | CapError::MissingParameter { path, .. } => *path = at.to_string(),
            _ => {}
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, CapError>;

// ---------------------------------------------------------------------------
// Recoverable filter conditions
// ---------------------------------------------------------------------------

/// A data-quality problem a filter recovered from, usually by passing its
/// input through unchanged.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FilterWarning {
    #[error("outlier filter needs exactly two columns, got {count}; aggregate the sensors first")]
    TooManyColumns { count: usize },

    #[error("column '{0}' is not in the filter input")]
    MissingColumn(String),

    #[error("no clear-sky intervals detected with a {window_minutes} minute window")]
    NoClearIntervals { window_minutes: u32 },

    #[error("{count} rows with missing values kept without outlier classification")]
    UnclassifiedRows { count: usize },

    #[error("outlier model could not be fitted to the data")]
    NoOutlierModelConvergence,

    #[error("invalid filter parameter: {0}")]
    InvalidParameter(String),
}
