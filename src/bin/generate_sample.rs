use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use chrono::{Duration, NaiveDate};
use parquet::arrow::ArrowWriter;
use pvcaptest::ColumnGroups;

/// Clear-sky POA irradiance for a fractional hour of the day.
fn clear_sky_poa(hour: f64) -> f64 {
    const SUNRISE: f64 = 6.0;
    const SUNSET: f64 = 19.0;
    if !(SUNRISE..=SUNSET).contains(&hour) {
        return 0.0;
    }
    1050.0 * (std::f64::consts::PI * (hour - SUNRISE) / (SUNSET - SUNRISE)).sin().powf(1.2)
}

/// Minimal deterministic PRNG (xoshiro256**)
struct SimpleRng {
    state: [u64; 4],
}

impl SimpleRng {
    fn new(seed: u64) -> Self {
        let mut s = [0u64; 4];
        let mut x = seed;
        for slot in &mut s {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
            *slot = x;
        }
        SimpleRng { state: s }
    }

    fn next_u64(&mut self) -> u64 {
        let result = (self.state[1].wrapping_mul(5))
            .rotate_left(7)
            .wrapping_mul(9);
        let t = self.state[1] << 17;
        self.state[2] ^= self.state[0];
        self.state[3] ^= self.state[1];
        self.state[1] ^= self.state[2];
        self.state[0] ^= self.state[3];
        self.state[2] ^= t;
        self.state[3] = self.state[3].rotate_left(45);
        result
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Box-Muller transform for normal distribution
    fn gauss(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-15);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let mut rng = SimpleRng::new(42);

    // Two days at 5 minute resolution; clouds pass on the second afternoon.
    let start = NaiveDate::from_ymd_opt(2023, 6, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .context("invalid start date")?;
    let steps = 2 * 24 * 12;

    let mut timestamps = Vec::with_capacity(steps);
    let mut poa: [Vec<f64>; 3] = Default::default();
    let mut t_amb: [Vec<f64>; 3] = Default::default();
    let mut wind = Vec::with_capacity(steps);
    let mut power = Vec::with_capacity(steps);

    for i in 0..steps {
        let ts = start + Duration::minutes(5 * i as i64);
        let day = i / (24 * 12);
        let hour = (i % (24 * 12)) as f64 / 12.0;

        let cloud = if day == 1 && hour > 13.0 && (i / 6) % 3 == 0 { 0.35 } else { 1.0 };
        let irr = clear_sky_poa(hour) * cloud;
        let ambient = 22.0 + 8.0 * (std::f64::consts::PI * (hour - 9.0) / 12.0).sin().max(0.0);
        let wind_speed = (2.5 + rng.gauss(0.0, 0.8)).max(0.0);

        for sensor in &mut poa {
            sensor.push((irr + rng.gauss(0.0, 5.0)).max(0.0));
        }
        for sensor in &mut t_amb {
            sensor.push(ambient + rng.gauss(0.0, 0.3));
        }
        wind.push(wind_speed);

        // 1 MW plant, -0.37 %/C, with an occasional curtailed interval.
        let cell = ambient + irr * (-3.56 - 0.075 * wind_speed).exp() + irr / 1000.0 * 3.0;
        let mut kw = 1000.0 * irr / 1000.0 * (1.0 - 0.0037 * (cell - 25.0)) * 0.97;
        if irr > 600.0 && rng.next_f64() < 0.02 {
            kw *= 0.5;
        }
        power.push(kw.max(0.0) + rng.gauss(0.0, 2.0).abs());
        timestamps.push(ts.and_utc().timestamp_millis());
    }

    let mut fields = vec![Field::new(
        "timestamp",
        DataType::Timestamp(TimeUnit::Millisecond, None),
        false,
    )];
    let mut arrays: Vec<Arc<dyn arrow::array::Array>> =
        vec![Arc::new(TimestampMillisecondArray::from(timestamps))];
    let mut push = |name: &str, values: Vec<f64>| {
        fields.push(Field::new(name, DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(values)));
    };
    for (n, values) in poa.into_iter().enumerate() {
        push(&format!("poa{}", n + 1), values);
    }
    for (n, values) in t_amb.into_iter().enumerate() {
        push(&format!("t_amb{}", n + 1), values);
    }
    push("wind", wind);
    push("power_kw", power);

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), arrays).context("building record batch")?;

    // Write Parquet
    let output_path = "sample_data.parquet";
    let file = std::fs::File::create(output_path).context("creating output file")?;
    let mut writer = ArrowWriter::try_new(file, schema, None).context("creating parquet writer")?;
    writer.write(&batch).context("writing batch")?;
    writer.close().context("closing parquet writer")?;

    // Midday of the first day
    let preview = pretty_format_batches(&[batch.slice(144, 5)]).context("formatting preview")?;
    log::info!("Sample rows:\n{preview}");

    let groups = ColumnGroups::from_iter([
        ("irr_poa", vec!["poa1", "poa2", "poa3"]),
        ("temp_amb", vec!["t_amb1", "t_amb2", "t_amb3"]),
        ("wind_speed", vec!["wind"]),
        ("real_pwr_mtr", vec!["power_kw"]),
    ]);
    let groups_path = "sample_column_groups.json";
    std::fs::write(groups_path, serde_json::to_string_pretty(&groups)?)
        .context("writing column groups")?;

    log::info!("Wrote {steps} intervals to {output_path} and {} groups to {groups_path}", groups.len());
    println!("Wrote {steps} intervals to {output_path} and column groups to {groups_path}");
    Ok(())
}
