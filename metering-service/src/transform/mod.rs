use metering_client::domain::Reading;
use time::macros::datetime;

use crate::pipeline::{Envelope, PipelineError, Transform};

/// Pure validation of a polled or backfilled `Reading`.
///
/// Rules:
/// - every numeric field that is present must be finite and non-negative.
/// - the reading must carry at least one measurement.
/// - `at` must be within a broad sanity window [2000-01-01, 2100-01-01).
pub fn validate_reading(env: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
    let r = &env.payload;
    let reject = |reason: String| PipelineError::Rejected {
        device_id: r.device_id.clone(),
        reason,
    };

    let mut measured = false;
    for (name, value) in r.numeric_fields() {
        let Some(v) = value else { continue };
        if !v.is_finite() {
            return Err(reject(format!("{name} is not a finite number")));
        }
        if v < 0.0 {
            return Err(reject(format!("{name} must be non-negative")));
        }
        measured = true;
    }
    if !measured {
        return Err(reject("reading carries no measurement".to_string()));
    }

    let min_ts = datetime!(2000-01-01 00:00:00 UTC);
    let max_ts = datetime!(2100-01-01 00:00:00 UTC);
    if r.at < min_ts || r.at >= max_ts {
        return Err(reject("timestamp out of allowed range".to_string()));
    }

    Ok(env)
}

#[derive(Clone, Default)]
pub struct ReadingValidation;

#[async_trait::async_trait]
impl Transform<Reading, Reading> for ReadingValidation {
    async fn apply(&self, input: Envelope<Reading>) -> Result<Envelope<Reading>, PipelineError> {
        let kind = input.payload.kind.as_str();
        match validate_reading(input) {
            Ok(env) => Ok(env),
            Err(e) => {
                metrics::counter!("validation_readings_rejected_total", "kind" => kind).increment(1);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metering_client::domain::MeterKind;
    use time::OffsetDateTime;

    fn electric(at: OffsetDateTime, energy: Option<f64>, power: Option<f64>) -> Envelope<Reading> {
        let mut r = Reading::blank("dev-1", "101", 1, MeterKind::Electric, at);
        r.energy_kwh = energy;
        r.power_w = power;
        Envelope::now(r)
    }

    #[test]
    fn accepts_valid_reading() {
        let env = electric(datetime!(2024-01-01 00:00:00 UTC), Some(12.5), Some(300.0));
        assert!(validate_reading(env).is_ok());
    }

    #[test]
    fn rejects_negative_counter() {
        let env = electric(datetime!(2024-01-01 00:00:00 UTC), Some(-0.1), None);
        let err = validate_reading(env).unwrap_err();
        assert!(matches!(err, PipelineError::Rejected { .. }));
        assert_eq!(err.device_id(), Some("dev-1"));
    }

    #[test]
    fn rejects_nan_rate() {
        let env = electric(datetime!(2024-01-01 00:00:00 UTC), Some(1.0), Some(f64::NAN));
        assert!(matches!(validate_reading(env), Err(PipelineError::Rejected { .. })));
    }

    #[test]
    fn rejects_out_of_range_ts() {
        let env = electric(datetime!(1800-01-01 00:00:00 UTC), Some(1.0), None);
        assert!(matches!(validate_reading(env), Err(PipelineError::Rejected { .. })));

        let env = electric(datetime!(2100-01-01 00:00:00 UTC), Some(1.0), None);
        assert!(matches!(validate_reading(env), Err(PipelineError::Rejected { .. })));
    }

    #[test]
    fn rejects_empty_reading() {
        let env = electric(datetime!(2024-01-01 00:00:00 UTC), None, None);
        assert!(matches!(validate_reading(env), Err(PipelineError::Rejected { .. })));
    }
}
