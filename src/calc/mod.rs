/// Calculated regression parameters.
///
/// ```text
///   RegressionColumns (nested CalcParam specification)
///        │
///        ▼
///   ┌──────────┐   aggregate groups  ┌─────────────┐
///   │ resolver  │ ──────────────────▶ │   Dataset    │
///   └──────────┘   run derivations    └─────────────┘
///        │               ▲
///        │               │ formulas, heat coefficients
///        │         ┌─────────────┐
///        └───────▶ │ derivations  │ ── params
///                  └─────────────┘
/// ```

pub mod derivations;
pub mod params;
pub mod resolver;
pub mod spec;
