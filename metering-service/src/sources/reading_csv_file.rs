use std::{fs::File, path::PathBuf, time::SystemTime};

use csv::StringRecord;
use metering_client::domain::{MeterKind, Reading};
use time::OffsetDateTime;

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

/// CSV backfill source for `Reading`.
///
/// Expected header columns (by name):
/// - at (RFC3339 timestamp)
/// - device_id
/// - room_number
/// - building_id
/// - kind (`electric` | `water`)
/// - energy_kwh, power_w, voltage_v, current_a (optional)
/// - total_liters, session_liters, flow_lpm, battery_pct (optional)
pub struct ReadingCsvFileSource {
    path: PathBuf,
}

impl ReadingCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_optional_f64(s: &str) -> Result<Option<f64>, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e| format!("invalid number '{trimmed}': {e}"))
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord) -> Result<Reading, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
            .ok_or_else(|| PipelineError::Source(format!("missing column '{name}' in CSV record")))
    };
    let optional = |name: &str| -> Result<Option<f64>, PipelineError> {
        match get(name) {
            Ok(raw) => parse_optional_f64(raw).map_err(|e| PipelineError::Source(format!("{name}: {e}"))),
            Err(_) => Ok(None),
        }
    };

    let at_str = get("at")?;
    let at = OffsetDateTime::parse(at_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| PipelineError::Source(format!("invalid at '{at_str}': {e}")))?;

    let kind: MeterKind = get("kind")?
        .parse()
        .map_err(|e| PipelineError::Source(format!("{e}")))?;

    let building_str = get("building_id")?;
    let building_id: i32 = building_str
        .trim()
        .parse()
        .map_err(|e| PipelineError::Source(format!("invalid building_id '{building_str}': {e}")))?;

    let device_id = get("device_id")?.trim().to_string();
    let room_number = get("room_number")?.trim().to_string();

    let mut reading = Reading::blank(&device_id, &room_number, building_id, kind, at);
    reading.energy_kwh = optional("energy_kwh")?;
    reading.power_w = optional("power_w")?;
    reading.voltage_v = optional("voltage_v")?;
    reading.current_a = optional("current_a")?;
    reading.total_liters = optional("total_liters")?;
    reading.session_liters = optional("session_liters")?;
    reading.flow_lpm = optional("flow_lpm")?;
    reading.battery_pct = optional("battery_pct")?;
    Ok(reading)
}

#[async_trait::async_trait]
impl Source<Reading> for ReadingCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<Reading> {
        // Blocking reader inside one task; backfill files are small enough for that.
        let path = self.path.clone();
        let s = async_stream::try_stream! {
            let file = File::open(&path)
                .map_err(|e| PipelineError::Source(format!("failed to open CSV file: {e}")))?;
            let mut rdr = csv::Reader::from_reader(file);
            let headers = rdr
                .headers()
                .map_err(|e| PipelineError::Source(format!("failed to read CSV headers: {e}")))?
                .clone();

            for result in rdr.records() {
                let record = result.map_err(|e| PipelineError::Source(format!(
                    "failed to read CSV record: {e}"
                )))?;

                let reading = match record_to_reading(&record, &headers) {
                    Ok(r) => r,
                    Err(e) => {
                        metrics::counter!("reading_csv_parse_errors_total").increment(1);
                        Err(e)?
                    }
                };

                yield Envelope {
                    payload: reading,
                    received_at: SystemTime::now(),
                };
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn parse(header: &str, row: &str) -> Result<Reading, PipelineError> {
        let headers = StringRecord::from(header.split(',').collect::<Vec<_>>());
        let record = StringRecord::from(row.split(',').collect::<Vec<_>>());
        record_to_reading(&record, &headers)
    }

    #[test]
    fn parses_electric_row_with_optional_gaps() {
        let r = parse(
            "at,device_id,room_number,building_id,kind,energy_kwh,power_w",
            "2024-05-01T00:00:00Z,dev-1,101,3,electric,120.5,",
        )
        .unwrap();
        assert_eq!(r.at, datetime!(2024-05-01 00:00:00 UTC));
        assert_eq!(r.building_id, 3);
        assert_eq!(r.kind, MeterKind::Electric);
        assert_eq!(r.energy_kwh, Some(120.5));
        assert_eq!(r.power_w, None);
        assert_eq!(r.flow_lpm, None);
    }

    #[test]
    fn rejects_unknown_kind_and_bad_numbers() {
        let header = "at,device_id,room_number,building_id,kind,total_liters";
        assert!(parse(header, "2024-05-01T00:00:00Z,d,101,3,gas,1").is_err());
        assert!(parse(header, "2024-05-01T00:00:00Z,d,101,3,water,lots").is_err());
        assert!(parse(header, "yesterday,d,101,3,water,1").is_err());
    }
}
