//! Performance ratio (PR) testing.

use std::fmt;

use crate::calc::params::{self, HeatCoefficients};
use crate::data::model::{Dataset, Timestep};
use crate::error::{CapError, Result};

/// Plant availability applied to the expected energy.
#[derive(Debug, Clone, PartialEq)]
pub enum Availability {
    Constant(f64),
    /// Per-interval availability read from a column of the input data.
    Column(String),
}

impl Default for Availability {
    fn default() -> Self {
        Availability::Constant(1.0)
    }
}

/// Adjustments shared by the PR calculations.
#[derive(Debug, Clone, PartialEq)]
pub struct PrOptions {
    /// Scale factor applied to the measured energy, e.g. 1000 for kWh → Wh.
    pub unit_adj: f64,
    /// Annual degradation in percent, e.g. 0.5.
    pub degradation: f64,
    /// Year of operation the degradation is applied for.
    pub year: i32,
    pub availability: Availability,
}

impl Default for PrOptions {
    fn default() -> Self {
        PrOptions {
            unit_adj: 1.0,
            degradation: 0.0,
            year: 1,
            availability: Availability::default(),
        }
    }
}

/// Result of a PR calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct PrResults {
    pub timestep: Timestep,
    /// Measured over expected energy, as a fraction.
    pub pr: f64,
    /// Summed module nameplate, W.
    pub dc_nameplate: f64,
    /// `ac_energy`, `expected_dc` and `pr_per_timestep` per interval.
    pub results: Dataset,
}

/// Pass/fail outcome against a contractual PR.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrVerdict {
    pub pr: f64,
    pub expected_pr: f64,
}

impl PrVerdict {
    pub fn passing(&self) -> bool {
        self.pr >= self.expected_pr
    }
}

impl fmt::Display for PrVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (status, relation) = if self.passing() { ("PASSING", "above") } else { ("FAILING", "below") };
        write!(
            f,
            "The test is {status} with a measured PR of {:.2}, which is {:.2} {relation} the expected PR of {:.2}",
            self.pr * 100.0,
            (self.pr - self.expected_pr).abs() * 100.0,
            self.expected_pr * 100.0,
        )
    }
}

impl PrResults {
    pub fn verdict(&self, expected_pr: f64) -> PrVerdict {
        PrVerdict { pr: self.pr, expected_pr }
    }
}

fn availability(data: &Dataset, availability: &Availability) -> Result<Vec<f64>> {
    match availability {
        Availability::Constant(a) => Ok(vec![*a; data.len()]),
        Availability::Column(name) => Ok(data.require_column(name)?.to_vec()),
    }
}

fn nan_sum(values: &[f64]) -> f64 {
    values.iter().filter(|v| !v.is_nan()).sum()
}

fn finish(
    data: &Dataset,
    ac_energy_col: &str,
    dc_nameplate: f64,
    timestep: Timestep,
    unit_adj: f64,
    expected_dc: Vec<f64>,
) -> Result<PrResults> {
    let ac_energy = data.require_column(ac_energy_col)?;
    let (measured, expected) = (nan_sum(ac_energy), nan_sum(&expected_dc));
    let pr = measured * unit_adj / expected;
    let per_step = ac_energy
        .iter()
        .zip(&expected_dc)
        .map(|(e, x)| e * unit_adj / x)
        .collect();

    let results = Dataset::from_columns(
        data.index().to_vec(),
        [
            ("ac_energy", ac_energy.to_vec()),
            ("expected_dc", expected_dc),
            ("pr_per_timestep", per_step),
        ],
    )?;
    log::info!("PR of {pr:.4} over {} intervals of {timestep}", data.len());
    Ok(PrResults { timestep, pr, dc_nameplate, results })
}

/// Performance ratio of measured AC energy (Wh per interval, after
/// `unit_adj`) to the nameplate energy expected from POA irradiance.
///
/// The interval length is the most common timestep of `data`. Measured and
/// expected energy are each summed over their own non-missing intervals.
pub fn perf_ratio(
    data: &Dataset,
    ac_energy_col: &str,
    poa_col: &str,
    dc_nameplate: f64,
    options: &PrOptions,
) -> Result<PrResults> {
    if data.is_empty() {
        return Err(CapError::EmptyData("performance ratio needs at least one interval".into()));
    }
    let timestep = data.common_timestep().ok_or(CapError::IndeterminateTimestep)?;
    let poa = data.require_column(poa_col)?;
    let avail = availability(data, &options.availability)?;
    let derate = (1.0 - options.degradation / 100.0).powi(options.year);
    let hours = timestep.as_hours();

    let expected_dc = poa
        .iter()
        .zip(&avail)
        .map(|(g, a)| a * dc_nameplate * g / 1000.0 * derate * hours)
        .collect();
    finish(data, ac_energy_col, dc_nameplate, timestep, options.unit_adj, expected_dc)
}

/// Columns read by [`perf_ratio_temp_corr_nrel`].
#[derive(Debug, Clone, Copy)]
pub struct WeatherColumns<'a> {
    pub ac_energy: &'a str,
    pub poa: &'a str,
    pub temp_amb: &'a str,
    pub wind_speed: &'a str,
}

/// NREL weather-corrected performance ratio: the expected energy uses a
/// nameplate corrected from `base_temp` to the modeled cell temperature of
/// each interval.
pub fn perf_ratio_temp_corr_nrel(
    data: &Dataset,
    columns: WeatherColumns<'_>,
    dc_nameplate: f64,
    power_temp_coeff: f64,
    base_temp: f64,
    heat: HeatCoefficients,
    options: &PrOptions,
) -> Result<PrResults> {
    if data.is_empty() {
        return Err(CapError::EmptyData("performance ratio needs at least one interval".into()));
    }
    let timestep = data.common_timestep().ok_or(CapError::IndeterminateTimestep)?;
    let poa = data.require_column(columns.poa)?;
    let temp_amb = data.require_column(columns.temp_amb)?;
    let wind = data.require_column(columns.wind_speed)?;
    let avail = availability(data, &options.availability)?;
    let hours = timestep.as_hours();

    let expected_dc = poa
        .iter()
        .zip(temp_amb)
        .zip(wind)
        .zip(&avail)
        .map(|(((&g, &t), &w), a)| {
            let bom = params::bom_temp(g, t, w, heat);
            let cell = params::cell_temp(bom, g, heat);
            let nameplate = params::power_temp_correct(dc_nameplate, cell, power_temp_coeff, base_temp);
            a * nameplate * g / 1000.0 * hours
        })
        .collect();
    finish(data, columns.ac_energy, dc_nameplate, timestep, options.unit_adj, expected_dc)
}
