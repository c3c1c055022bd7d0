//! Stateless formulas for derived values (module temperatures, temperature
//! corrected power, bifacial irradiance).
//!
//! Thermal model equations follow the NREL Weather-Corrected Performance
//! Ratio report.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CapError, Result};

// ---------------------------------------------------------------------------
// Mounting and module construction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Racking {
    #[default]
    OpenRack,
    CloseRoofMount,
    InsulatedBack,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleType {
    GlassCellGlass,
    #[default]
    GlassCellPoly,
    PolyTfSteel,
}

impl fmt::Display for Racking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Racking::OpenRack => "open_rack",
            Racking::CloseRoofMount => "close_roof_mount",
            Racking::InsulatedBack => "insulated_back",
        })
    }
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleType::GlassCellGlass => "glass_cell_glass",
            ModuleType::GlassCellPoly => "glass_cell_poly",
            ModuleType::PolyTfSteel => "poly_tf_steel",
        })
    }
}

// ---------------------------------------------------------------------------
// Empirical heat transfer coefficients
// ---------------------------------------------------------------------------

/// Sandia module temperature model coefficients for one mounting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatCoefficients {
    pub a: f64,
    pub b: f64,
    /// Cell to back-of-module temperature difference at 1000 W/m^2.
    pub del_tcnd: f64,
}

/// Immutable lookup of [`HeatCoefficients`] by racking and module type.
///
/// Built once and handed to the derivations that need it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeatCoefficientTable {
    entries: BTreeMap<Racking, BTreeMap<ModuleType, HeatCoefficients>>,
}

impl HeatCoefficientTable {
    pub fn from_entries(entries: impl IntoIterator<Item = (Racking, ModuleType, HeatCoefficients)>) -> Self {
        let mut table: BTreeMap<Racking, BTreeMap<ModuleType, HeatCoefficients>> = BTreeMap::new();
        for (racking, module_type, coeffs) in entries {
            table.entry(racking).or_default().insert(module_type, coeffs);
        }
        HeatCoefficientTable { entries: table }
    }

    /// The standard Sandia coefficients.
    pub fn sandia() -> Self {
        let c = |a, b, del_tcnd| HeatCoefficients { a, b, del_tcnd };
        Self::from_entries([
            (Racking::OpenRack, ModuleType::GlassCellGlass, c(-3.47, -0.0594, 3.0)),
            (Racking::OpenRack, ModuleType::GlassCellPoly, c(-3.56, -0.0750, 3.0)),
            (Racking::OpenRack, ModuleType::PolyTfSteel, c(-3.58, -0.1130, 3.0)),
            (Racking::CloseRoofMount, ModuleType::GlassCellGlass, c(-2.98, -0.0471, 1.0)),
            (Racking::InsulatedBack, ModuleType::GlassCellPoly, c(-2.81, -0.0455, 0.0)),
        ])
    }

    pub fn get(&self, racking: Racking, module_type: ModuleType) -> Result<HeatCoefficients> {
        self.entries
            .get(&racking)
            .and_then(|m| m.get(&module_type))
            .copied()
            .ok_or_else(|| CapError::UnsupportedMounting {
                racking: racking.to_string(),
                module_type: module_type.to_string(),
            })
    }
}

impl Default for HeatCoefficientTable {
    fn default() -> Self {
        Self::sandia()
    }
}

// ---------------------------------------------------------------------------
// Formulas
// ---------------------------------------------------------------------------

/// Back-of-module temperature from POA irradiance, ambient temperature and
/// wind speed at 10 m.
pub fn bom_temp(poa: f64, temp_amb: f64, wind_speed: f64, coeffs: HeatCoefficients) -> f64 {
    poa * (coeffs.a + coeffs.b * wind_speed).exp() + temp_amb
}

/// Cell temperature from back-of-module temperature and POA irradiance.
pub fn cell_temp(bom: f64, poa: f64, coeffs: HeatCoefficients) -> f64 {
    bom + (poa / 1000.0) * coeffs.del_tcnd
}

/// Power corrected to `base_temp` using a power temperature coefficient in
/// percent per degree Celsius (e.g. -0.36).
pub fn power_temp_correct(power: f64, cell_temp: f64, power_temp_coeff: f64, base_temp: f64) -> f64 {
    power / (1.0 + (power_temp_coeff / 100.0) * (cell_temp - base_temp))
}

/// Bifacial gain settings for [`e_total`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bifacial {
    pub bifaciality: f64,
    /// Fraction of nameplate that is bifacial.
    pub bifacial_frac: f64,
    /// Fraction of rear irradiance lost to shading.
    pub rear_shade: f64,
}

impl Default for Bifacial {
    fn default() -> Self {
        Bifacial {
            bifaciality: 0.7,
            bifacial_frac: 1.0,
            rear_shade: 0.0,
        }
    }
}

/// Total plane-of-array irradiance from front and rear irradiance.
pub fn e_total(poa: f64, rpoa: f64, bifacial: Bifacial) -> f64 {
    poa + rpoa * bifacial.bifaciality * bifacial.bifacial_frac * (1.0 - bifacial.rear_shade)
}

/// PVsyst rear irradiance: global rear irradiance plus rear shading and IAM
/// losses.
pub fn rpoa_pvsyst(globbak: f64, backshd: f64) -> f64 {
    globbak + backshd
}

/// Irradiance-weighted average cell temperature. Pairs with a NaN are
/// ignored.
pub fn avg_typ_cell_temp(poa: &[f64], cell_temp: &[f64]) -> f64 {
    let (weighted, total) = poa
        .iter()
        .zip(cell_temp)
        .filter(|(p, t)| !p.is_nan() && !t.is_nan())
        .fold((0.0, 0.0), |(w, s), (p, t)| (w + p * t, s + p));
    weighted / total
}
