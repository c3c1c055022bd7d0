/// Data layer: core types, loading, and filtering.
///
/// Architecture:
/// ```text
///  .parquet / .csv        .json / .yaml
///        │                     │
///        ▼                     ▼
///   ┌──────────┐        ┌──────────────┐
///   │  loader   │        │ column_groups │  group id → sensor columns
///   └──────────┘        └──────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  Dataset  │  timestamp index, f64 columns
///   └──────────┘
///        │
///        ▼
///   ┌──────────┐   outliers, clear_sky
///   │  filter   │  chain of filters → narrowed rows
///   └──────────┘
/// ```

pub mod clear_sky;
pub mod column_groups;
pub mod filter;
pub mod loader;
pub mod model;
pub mod outliers;
