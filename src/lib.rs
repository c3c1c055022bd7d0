//! Capacity and performance-ratio testing of PV plant SCADA data.
//!
//! A [`CapData`] binds a timestamp-indexed [`Dataset`] to its
//! [`ColumnGroups`]. Rows are narrowed with a [`FilterChain`] and the
//! regression variables described by a nested [`CalcParam`] specification
//! are materialized as columns by the resolver.

pub mod calc;
pub mod capdata;
pub mod data;
pub mod error;
pub mod prtest;

pub use calc::derivations::{Derivation, DerivationConfig, DerivationRegistry};
pub use calc::params::HeatCoefficientTable;
pub use calc::resolver::{resolve, ResolveReport};
pub use calc::spec::{CalcParam, RegressionColumns};
pub use capdata::CapData;
pub use data::column_groups::ColumnGroups;
pub use data::filter::{Filter, FilterChain};
pub use data::model::{AggFunc, Dataset, Timestep};
pub use error::{CapError, FilterWarning, Result};
