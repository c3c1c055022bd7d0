use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{Array, Float64Array, TimestampMillisecondArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit};
use chrono::{DateTime, NaiveDateTime};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use super::column_groups::ColumnGroups;
use super::model::Dataset;

// ---------------------------------------------------------------------------
// Public entry-points
// ---------------------------------------------------------------------------

/// Load a plant dataset from a file.  Dispatch by extension.
///
/// Supported formats:
/// * `.parquet` – a timestamp column (`timestamp`, else the first column)
///   and numeric measurement columns
/// * `.csv`     – header row, timestamps in the first column, measurements
///   in the rest
///
/// Rows are sorted by timestamp and duplicate timestamps dropped.
pub fn load_file(path: &Path) -> Result<Dataset> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let data = match ext.as_str() {
        "parquet" | "pq" => load_parquet(path),
        "csv" => load_csv(path),
        other => bail!("Unsupported file extension: .{other}"),
    }
    .with_context(|| format!("loading {}", path.display()))?;

    log::info!(
        "Loaded {} rows x {} columns from {}",
        data.len(),
        data.column_names().len(),
        path.display()
    );
    Ok(data)
}

/// Load column groups from a `.json`, `.yaml` or `.yml` file holding an
/// object that maps group ids to arrays of column names.
pub fn load_column_groups(path: &Path) -> Result<ColumnGroups> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading column groups from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let groups = match ext.as_str() {
        "json" => ColumnGroups::from_json_str(&text).context("parsing column groups JSON")?,
        "yaml" | "yml" => ColumnGroups::from_yaml_str(&text).context("parsing column groups YAML")?,
        other => bail!("Unsupported column groups extension: .{other}"),
    };
    log::info!("Loaded {} column groups from {}", groups.len(), path.display());
    Ok(groups)
}

// ---------------------------------------------------------------------------
// CSV loader
// ---------------------------------------------------------------------------

const TIMESTAMP_FORMATS: [&str; 5] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// CSV layout:  header row with column names, the first column holds the
/// timestamps.  Cells that are not numbers (blank, `NaN`, `#N/A`, ...) load
/// as NaN.
fn load_csv(path: &Path) -> Result<Dataset> {
    let mut reader = csv::Reader::from_path(path).context("opening CSV")?;
    let headers: Vec<String> = reader
        .headers()
        .context("reading CSV headers")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.len() < 2 {
        bail!("CSV needs a timestamp column and at least one measurement column");
    }

    let mut index = Vec::new();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len() - 1];

    for (row_no, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("CSV row {row_no}"))?;
        let raw_ts = record.get(0).unwrap_or("");
        let ts = parse_timestamp(raw_ts)
            .with_context(|| format!("CSV row {row_no}: '{raw_ts}' is not a timestamp"))?;
        index.push(ts);
        for (col, values) in columns.iter_mut().enumerate() {
            let value = record
                .get(col + 1)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(f64::NAN);
            values.push(value);
        }
    }

    Ok(Dataset::from_unsorted(
        index,
        headers.into_iter().skip(1).zip(columns),
    )?)
}

// ---------------------------------------------------------------------------
// Parquet loader
// ---------------------------------------------------------------------------

/// Load a Parquet file of plant measurements.
///
/// Expected schema:
/// - `timestamp` (or the first column): Timestamp of any unit, Date64 or
///   ISO-8601 strings
/// - every other column castable to Float64 is a measurement; nulls and
///   strings that are not numbers load as NaN.  Columns that cannot be cast
///   (lists, structs, ...) are skipped with a warning.
///
/// Works with files written by **Pandas** (`df.to_parquet()`) and
/// **Polars** (`df.write_parquet()`).
fn load_parquet(path: &Path) -> Result<Dataset> {
    let file = std::fs::File::open(path).context("opening parquet file")?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("reading parquet metadata")?;
    let schema = builder.schema().clone();
    let reader = builder.build().context("building parquet reader")?;

    let ts_idx = schema.index_of("timestamp").unwrap_or(0);
    if schema.fields().is_empty() {
        bail!("Parquet file has no columns");
    }

    let mut measurement_cols: Vec<(usize, String)> = Vec::new();
    for (i, field) in schema.fields().iter().enumerate() {
        if i == ts_idx {
            continue;
        }
        if arrow::compute::can_cast_types(field.data_type(), &DataType::Float64) {
            measurement_cols.push((i, field.name().clone()));
        } else {
            log::warn!(
                "Skipping column '{}' of type {:?}: not numeric",
                field.name(),
                field.data_type()
            );
        }
    }

    let mut index = Vec::new();
    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); measurement_cols.len()];

    for batch_result in reader {
        let batch = batch_result.context("reading parquet record batch")?;
        index.extend(extract_timestamps(batch.column(ts_idx))?);
        for ((col_idx, name), values) in measurement_cols.iter().zip(columns.iter_mut()) {
            let floats = extract_f64(batch.column(*col_idx))
                .with_context(|| format!("reading column '{name}'"))?;
            values.extend(floats);
        }
    }

    let names = measurement_cols.into_iter().map(|(_, name)| name);
    Ok(Dataset::from_unsorted(index, names.zip(columns))?)
}

// -- Parquet / Arrow helpers --

fn extract_timestamps(col: &Arc<dyn Array>) -> Result<Vec<NaiveDateTime>> {
    let cast_col = cast(col, &DataType::Timestamp(TimeUnit::Millisecond, None))
        .with_context(|| format!("casting {:?} to timestamps", col.data_type()))?;
    let arr = cast_col
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .context("expected TimestampMillisecondArray")?;

    arr.iter()
        .enumerate()
        .map(|(row, v)| {
            v.and_then(DateTime::from_timestamp_millis)
                .map(|dt| dt.naive_utc())
                .with_context(|| format!("Row {row}: null or out-of-range timestamp"))
        })
        .collect()
}

fn extract_f64(col: &Arc<dyn Array>) -> Result<Vec<f64>> {
    let cast_col = cast(col, &DataType::Float64)
        .with_context(|| format!("casting {:?} to Float64", col.data_type()))?;
    let arr = cast_col
        .as_any()
        .downcast_ref::<Float64Array>()
        .context("expected Float64Array")?;
    Ok(arr.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;

    use super::*;

    #[test]
    fn csv_rows_are_sorted_and_bad_cells_are_nan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plant.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Timestamp,poa1,power").unwrap();
        writeln!(f, "2021-06-01 12:05:00,805.5,#N/A").unwrap();
        writeln!(f, "2021-06-01 12:00:00,800.0,600.0").unwrap();
        writeln!(f, "2021-06-01 12:00:00,1.0,1.0").unwrap();
        writeln!(f, "06/01/2021 12:10,,610.0").unwrap();
        drop(f);

        let data = load_file(&path).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.column_names(), ["poa1", "power"]);
        assert_eq!(data.column("poa1").unwrap()[0], 800.0);
        assert!(data.column("power").unwrap()[1].is_nan());
        assert!(data.column("poa1").unwrap()[2].is_nan());
    }

    #[test]
    fn parquet_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plant.parquet");
        let schema = Arc::new(Schema::new(vec![
            Field::new("timestamp", DataType::Timestamp(TimeUnit::Millisecond, None), false),
            Field::new("poa", DataType::Float64, true),
            Field::new("site", DataType::Utf8, true),
        ]));
        let start = 1_622_548_800_000_i64;
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(TimestampMillisecondArray::from(vec![start + 300_000, start])),
                Arc::new(Float64Array::from(vec![Some(900.0), None])),
                Arc::new(arrow::array::StringArray::from(vec!["a", "b"])),
            ],
        )
        .unwrap();
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = ArrowWriter::try_new(file, schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();

        let data = load_file(&path).unwrap();
        assert_eq!(data.len(), 2);
        assert!(data.index()[0] < data.index()[1]);
        let poa = data.column("poa").unwrap();
        assert!(poa[0].is_nan());
        assert_eq!(poa[1], 900.0);
    }

    #[test]
    fn column_groups_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groups.yml");
        std::fs::write(&path, "irr_poa:\n  - poa1\n  - poa2\nreal_pwr_mtr:\n  - power\n").unwrap();
        let groups = load_column_groups(&path).unwrap();
        assert_eq!(groups.lookup("irr_poa").unwrap(), ["poa1", "poa2"]);
        assert!(load_column_groups(&dir.path().join("groups.toml")).is_err());
    }

    #[test]
    fn unsupported_extension() {
        let err = load_file(Path::new("plant.xlsx")).unwrap_err();
        assert!(format!("{err:#}").contains("Unsupported file extension"));
    }
}
