use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::params::{self, Bifacial, HeatCoefficientTable, HeatCoefficients, ModuleType, Racking};
use crate::data::model::{Dataset, ROOT_PATH};
use crate::error::{CapError, Result};

/// Parameter name → column name, as handed to a [`Derivation`].
pub type ColumnParams = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Derivation trait and registry
// ---------------------------------------------------------------------------

/// A derived value computed row by row from existing columns.
///
/// The resolver stores the result as a new column named [`Derivation::name`].
/// Settings that are not columns (coefficients, module type, ...) live on the
/// implementing type.
pub trait Derivation: fmt::Debug {
    /// Identifier used in specifications and as the output column name.
    fn name(&self) -> &str;

    /// Parameter names that must be bound to a column.
    fn inputs(&self) -> &[&'static str];

    fn compute(&self, data: &Dataset, params: &ColumnParams) -> Result<Vec<f64>>;
}

/// Fetch the column bound to parameter `key`.
pub fn input<'a>(data: &'a Dataset, params: &ColumnParams, derivation: &str, key: &str) -> Result<&'a [f64]> {
    let column = params.get(key).ok_or_else(|| CapError::MissingParameter {
        derivation: derivation.to_string(),
        parameter: key.to_string(),
        path: ROOT_PATH.to_string(),
    })?;
    data.require_column(column)
}

/// Derivations available to the resolver, by name.
#[derive(Debug, Default)]
pub struct DerivationRegistry {
    derivations: BTreeMap<String, Box<dyn Derivation>>,
}

impl DerivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in derivations configured by `config`.
    ///
    /// Heat coefficients are looked up when a temperature derivation runs,
    /// so an unsupported mounting only fails `bom_temp` and `cell_temp`.
    pub fn standard(config: &DerivationConfig, coefficients: &HeatCoefficientTable) -> Self {
        if let Err(e) = coefficients.get(config.racking, config.module_type) {
            log::warn!("{e}; temperature derivations are unavailable");
        }
        let mut registry = Self::new();
        registry.register(BomTemp::new(config.racking, config.module_type, coefficients.clone()));
        registry.register(CellTemp::new(config.racking, config.module_type, coefficients.clone()));
        registry.register(PowerTempCorrect {
            power_temp_coeff: config.power_temp_coeff,
            base_temp: config.base_temp,
        });
        registry.register(ETotal { bifacial: config.bifacial });
        registry.register(RpoaPvsyst);
        registry
    }

    /// Add a derivation, returning any previous one with the same name.
    pub fn register(&mut self, derivation: impl Derivation + 'static) -> Option<Box<dyn Derivation>> {
        self.derivations
            .insert(derivation.name().to_string(), Box::new(derivation))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Derivation> {
        self.derivations.get(name).map(|d| d.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.derivations.keys().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Configuration of the built-in derivations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    pub module_type: ModuleType,
    pub racking: Racking,
    /// Percent per degree Celsius, e.g. -0.36.
    pub power_temp_coeff: Option<f64>,
    pub base_temp: f64,
    #[serde(flatten)]
    pub bifacial: Bifacial,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        DerivationConfig {
            module_type: ModuleType::default(),
            racking: Racking::default(),
            power_temp_coeff: None,
            base_temp: 25.0,
            bifacial: Bifacial::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in derivations
// ---------------------------------------------------------------------------

/// Racking and module type the Sandia temperature model is evaluated for.
#[derive(Debug, Clone)]
struct Mounting {
    racking: Racking,
    module_type: ModuleType,
    coefficients: HeatCoefficientTable,
}

impl Mounting {
    fn coeffs(&self) -> Result<HeatCoefficients> {
        self.coefficients.get(self.racking, self.module_type)
    }
}

#[derive(Debug, Clone)]
pub struct BomTemp {
    mounting: Mounting,
}

impl BomTemp {
    pub fn new(racking: Racking, module_type: ModuleType, coefficients: HeatCoefficientTable) -> Self {
        BomTemp { mounting: Mounting { racking, module_type, coefficients } }
    }
}

impl Derivation for BomTemp {
    fn name(&self) -> &str {
        "bom_temp"
    }

    fn inputs(&self) -> &[&'static str] {
        &["poa", "temp_amb", "wind_speed"]
    }

    fn compute(&self, data: &Dataset, p: &ColumnParams) -> Result<Vec<f64>> {
        let poa = input(data, p, self.name(), "poa")?;
        let temp_amb = input(data, p, self.name(), "temp_amb")?;
        let wind = input(data, p, self.name(), "wind_speed")?;
        let coeffs = self.mounting.coeffs()?;
        log::info!(
            "Calculating and adding \"bom_temp\" column as {} * e^({} + {} * {}) + {}. \
             Coefficients a and b assume \"{}\" modules and \"{}\" racking.",
            p["poa"], coeffs.a, coeffs.b, p["wind_speed"], p["temp_amb"],
            self.mounting.module_type, self.mounting.racking,
        );
        Ok(poa
            .iter()
            .zip(temp_amb)
            .zip(wind)
            .map(|((&g, &t), &w)| params::bom_temp(g, t, w, coeffs))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct CellTemp {
    mounting: Mounting,
}

impl CellTemp {
    pub fn new(racking: Racking, module_type: ModuleType, coefficients: HeatCoefficientTable) -> Self {
        CellTemp { mounting: Mounting { racking, module_type, coefficients } }
    }
}

impl Derivation for CellTemp {
    fn name(&self) -> &str {
        "cell_temp"
    }

    fn inputs(&self) -> &[&'static str] {
        &["bom", "poa"]
    }

    fn compute(&self, data: &Dataset, p: &ColumnParams) -> Result<Vec<f64>> {
        let bom = input(data, p, self.name(), "bom")?;
        let poa = input(data, p, self.name(), "poa")?;
        let coeffs = self.mounting.coeffs()?;
        log::info!(
            "Calculating and adding \"cell_temp\" column using the Sandia temperature model \
             assuming \"{}\" module type and \"{}\" racking from the \"{}\" and \"{}\" columns.",
            self.mounting.module_type, self.mounting.racking, p["bom"], p["poa"],
        );
        Ok(bom
            .iter()
            .zip(poa)
            .map(|(&b, &g)| params::cell_temp(b, g, coeffs))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct PowerTempCorrect {
    pub power_temp_coeff: Option<f64>,
    pub base_temp: f64,
}

impl Derivation for PowerTempCorrect {
    fn name(&self) -> &str {
        "power_temp_correct"
    }

    fn inputs(&self) -> &[&'static str] {
        &["power", "cell_temp"]
    }

    fn compute(&self, data: &Dataset, p: &ColumnParams) -> Result<Vec<f64>> {
        let coeff = self
            .power_temp_coeff
            .ok_or(CapError::MissingSetting("power_temp_coeff"))?;
        let power = input(data, p, self.name(), "power")?;
        let cell = input(data, p, self.name(), "cell_temp")?;
        log::info!(
            "Calculating and adding \"power_temp_correct\" column as ({}) / (1 + (({} / 100) * ({} - {})))",
            p["power"], coeff, p["cell_temp"], self.base_temp,
        );
        Ok(power
            .iter()
            .zip(cell)
            .map(|(&pw, &t)| params::power_temp_correct(pw, t, coeff, self.base_temp))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ETotal {
    pub bifacial: Bifacial,
}

impl Derivation for ETotal {
    fn name(&self) -> &str {
        "e_total"
    }

    fn inputs(&self) -> &[&'static str] {
        &["poa", "rpoa"]
    }

    fn compute(&self, data: &Dataset, p: &ColumnParams) -> Result<Vec<f64>> {
        let poa = input(data, p, self.name(), "poa")?;
        let rpoa = input(data, p, self.name(), "rpoa")?;
        let b = self.bifacial;
        log::info!(
            "Calculating and adding \"e_total\" column as {} + {} * {} * {} * (1 - {})",
            p["poa"], p["rpoa"], b.bifaciality, b.bifacial_frac, b.rear_shade,
        );
        Ok(poa
            .iter()
            .zip(rpoa)
            .map(|(&f, &r)| params::e_total(f, r, b))
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RpoaPvsyst;

impl Derivation for RpoaPvsyst {
    fn name(&self) -> &str {
        "rpoa_pvsyst"
    }

    fn inputs(&self) -> &[&'static str] {
        &["globbak", "backshd"]
    }

    fn compute(&self, data: &Dataset, p: &ColumnParams) -> Result<Vec<f64>> {
        let globbak = input(data, p, self.name(), "globbak")?;
        let backshd = input(data, p, self.name(), "backshd")?;
        log::info!(
            "Calculating and adding \"rpoa_pvsyst\" column as {} + {}",
            p["globbak"], p["backshd"],
        );
        Ok(globbak
            .iter()
            .zip(backshd)
            .map(|(&g, &s)| params::rpoa_pvsyst(g, s))
            .collect())
    }
}
