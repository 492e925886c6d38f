//! Consumption estimation over a half-open interval `[start, end)`.
//!
//! Strategies run as a priority chain. Each one reports a definite result
//! (usage observed), a baseline (data observed but zero usage) or that it is
//! inapplicable (no data of its kind). The first definite result wins, then
//! the first baseline, then the empty result.

use metering_client::domain::{MeterKind, Reading};
use serde::Serialize;
use time::OffsetDateTime;

use crate::store::{ReadingStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    CounterDelta,
    RateIntegration,
    NoData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionResult {
    pub start_quantity: Option<f64>,
    pub end_quantity: Option<f64>,
    pub used_quantity: f64,
    pub start_observed_at: Option<OffsetDateTime>,
    pub end_observed_at: Option<OffsetDateTime>,
    pub method: Method,
}

impl ConsumptionResult {
    pub fn empty() -> Self {
        Self {
            start_quantity: None,
            end_quantity: None,
            used_quantity: 0.0,
            start_observed_at: None,
            end_observed_at: None,
            method: Method::NoData,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Estimate {
    Definite(ConsumptionResult),
    Baseline(ConsumptionResult),
    Inapplicable,
}

impl Estimate {
    fn from_result(result: ConsumptionResult) -> Self {
        if result.used_quantity > 0.0 {
            Estimate::Definite(result)
        } else {
            Estimate::Baseline(result)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    CounterDelta,
    RateIntegration,
}

pub const DEFAULT_CHAIN: [Strategy; 2] = [Strategy::CounterDelta, Strategy::RateIntegration];

impl Strategy {
    pub async fn apply<S>(
        self,
        store: &S,
        device_id: &str,
        kind: MeterKind,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Estimate, StoreError>
    where
        S: ReadingStore + ?Sized,
    {
        match self {
            Strategy::CounterDelta => {
                let opening = match store.latest_before(device_id, kind, start).await? {
                    Some(r) => Some(r),
                    None => store.first_in_range(device_id, kind, start, end).await?,
                };
                // A closing counter from before the interval says nothing about it.
                let closing = store
                    .latest_before(device_id, kind, end)
                    .await?
                    .filter(|r| r.at >= start);
                Ok(counter_delta(opening.as_ref(), closing.as_ref()))
            }
            Strategy::RateIntegration => {
                let samples = store.range(device_id, kind, start, end).await?;
                Ok(integrate(kind, &samples))
            }
        }
    }
}

/// `max(0, closing - opening)` over the kind's cumulative counter.
///
/// A counter that went backwards (reset or replacement) yields a zero
/// baseline rather than negative usage.
pub fn counter_delta(opening: Option<&Reading>, closing: Option<&Reading>) -> Estimate {
    let (Some(opening), Some(closing)) = (opening, closing) else {
        return Estimate::Inapplicable;
    };
    let (Some(start_q), Some(end_q)) = (opening.counter(), closing.counter()) else {
        return Estimate::Inapplicable;
    };

    Estimate::from_result(ConsumptionResult {
        start_quantity: Some(start_q),
        end_quantity: Some(end_q),
        used_quantity: (end_q - start_q).max(0.0),
        start_observed_at: Some(opening.at),
        end_observed_at: Some(closing.at),
        method: Method::CounterDelta,
    })
}

/// Trapezoidal integral of `(at, rate)` points, which must be sorted by time.
///
/// Electric rates are watts and the result is kWh; water rates are L/min and
/// the result is liters. The last point contributes no width of its own.
pub fn trapezoid(kind: MeterKind, points: &[(OffsetDateTime, f64)]) -> f64 {
    points
        .windows(2)
        .map(|pair| {
            let (t0, r0) = pair[0];
            let (t1, r1) = pair[1];
            let secs = (t1 - t0).as_seconds_f64().max(0.0);
            let avg = (r0 + r1) / 2.0;
            match kind {
                MeterKind::Electric => secs / 3600.0 * avg / 1000.0,
                MeterKind::Water => secs / 60.0 * avg,
            }
        })
        .sum()
}

/// Integrates the rate samples (`power_w` or `flow_lpm`) found in `readings`.
///
/// Needs at least two samples. Negative rates are treated as zero.
pub fn integrate(kind: MeterKind, readings: &[Reading]) -> Estimate {
    let mut points: Vec<(OffsetDateTime, f64)> = readings
        .iter()
        .filter(|r| r.kind == kind)
        .filter_map(|r| r.rate().filter(|v| v.is_finite()).map(|v| (r.at, v.max(0.0))))
        .collect();
    if points.len() < 2 {
        return Estimate::Inapplicable;
    }
    points.sort_by_key(|(at, _)| *at);

    let used = trapezoid(kind, &points);
    Estimate::from_result(ConsumptionResult {
        start_quantity: None,
        end_quantity: None,
        used_quantity: used,
        start_observed_at: points.first().map(|(at, _)| *at),
        end_observed_at: points.last().map(|(at, _)| *at),
        method: Method::RateIntegration,
    })
}

/// Runs `chain` in order and picks the winning estimate.
pub async fn estimate_with<S>(
    store: &S,
    chain: &[Strategy],
    device_id: &str,
    kind: MeterKind,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<ConsumptionResult, StoreError>
where
    S: ReadingStore + ?Sized,
{
    let mut baseline = None;
    for strategy in chain {
        match strategy.apply(store, device_id, kind, start, end).await? {
            Estimate::Definite(result) => return Ok(result),
            Estimate::Baseline(result) => {
                baseline.get_or_insert(result);
            }
            Estimate::Inapplicable => {}
        }
    }
    Ok(baseline.unwrap_or_else(ConsumptionResult::empty))
}

/// Default chain: counter delta, then rate integration.
pub async fn estimate<S>(
    store: &S,
    device_id: &str,
    kind: MeterKind,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<ConsumptionResult, StoreError>
where
    S: ReadingStore + ?Sized,
{
    estimate_with(store, &DEFAULT_CHAIN, device_id, kind, start, end).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::{macros::datetime, Duration};

    const START: OffsetDateTime = datetime!(2024-05-01 00:00 UTC);
    const END: OffsetDateTime = datetime!(2024-06-01 00:00 UTC);

    fn electric(at: OffsetDateTime, energy: Option<f64>, power: Option<f64>) -> Reading {
        let mut r = Reading::blank("e1", "101", 1, MeterKind::Electric, at);
        r.energy_kwh = energy;
        r.power_w = power;
        r
    }

    fn water(at: OffsetDateTime, total: Option<f64>, flow: Option<f64>) -> Reading {
        let mut r = Reading::blank("w1", "101", 1, MeterKind::Water, at);
        r.total_liters = total;
        r.flow_lpm = flow;
        r
    }

    #[test]
    fn counter_delta_is_clamped_at_zero() {
        let a = electric(START, Some(50.0), None);
        let b = electric(START + Duration::days(10), Some(20.0), None);
        match counter_delta(Some(&a), Some(&b)) {
            Estimate::Baseline(r) => {
                assert_eq!(r.used_quantity, 0.0);
                assert_eq!(r.start_quantity, Some(50.0));
                assert_eq!(r.end_quantity, Some(20.0));
            }
            other => panic!("expected baseline, got {other:?}"),
        }
        assert_eq!(counter_delta(Some(&a), None), Estimate::Inapplicable);
    }

    #[test]
    fn trapezoid_integrates_power_to_kwh() {
        let pts = [
            (START, 1000.0),
            (START + Duration::hours(1), 1000.0),
            (START + Duration::hours(3), 2000.0),
        ];
        // 1 kWh for the first hour, then 2h * 1.5 kW.
        assert!((trapezoid(MeterKind::Electric, &pts) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn integration_needs_two_samples() {
        let one = [water(START, None, Some(10.0))];
        assert_eq!(integrate(MeterKind::Water, &one), Estimate::Inapplicable);
        assert_eq!(integrate(MeterKind::Water, &[]), Estimate::Inapplicable);
    }

    #[test]
    fn integration_tolerates_out_of_order_and_negative_samples() {
        let samples = [
            water(START + Duration::minutes(30), None, Some(-5.0)),
            water(START, None, Some(10.0)),
            water(START + Duration::minutes(60), None, Some(10.0)),
        ];
        match integrate(MeterKind::Water, &samples) {
            Estimate::Definite(r) => {
                // 30 * (10 + 0) / 2 + 30 * (0 + 10) / 2
                assert!((r.used_quantity - 300.0).abs() < 1e-9);
                assert_eq!(r.start_observed_at, Some(START));
                assert_eq!(r.end_observed_at, Some(START + Duration::minutes(60)));
            }
            other => panic!("expected definite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn counter_delta_prefers_reading_before_interval() {
        let store = MemoryStore::new();
        store.push_reading(electric(START - Duration::hours(2), Some(90.0), None));
        store.push_reading(electric(START + Duration::days(1), Some(100.0), None));
        store.push_reading(electric(END - Duration::hours(1), Some(130.0), None));
        store.push_reading(electric(END + Duration::hours(1), Some(500.0), None));

        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r.method, Method::CounterDelta);
        assert_eq!(r.used_quantity, 40.0);
        assert_eq!(r.start_observed_at, Some(START - Duration::hours(2)));
        assert_eq!(r.end_observed_at, Some(END - Duration::hours(1)));
    }

    #[tokio::test]
    async fn new_device_is_measured_from_first_reading() {
        let store = MemoryStore::new();
        store.push_reading(electric(START + Duration::days(12), Some(7.0), None));
        store.push_reading(electric(START + Duration::days(20), Some(19.5), None));

        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r.used_quantity, 12.5);
        assert_eq!(r.start_quantity, Some(7.0));
    }

    #[tokio::test]
    async fn zero_delta_falls_back_to_integration() {
        let store = MemoryStore::new();
        store.push_reading(electric(START, Some(10.0), Some(500.0)));
        store.push_reading(electric(START + Duration::hours(2), Some(10.0), Some(500.0)));

        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r.method, Method::RateIntegration);
        assert!((r.used_quantity - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_usage_everywhere_keeps_counter_baseline() {
        let store = MemoryStore::new();
        store.push_reading(electric(START, Some(10.0), Some(0.0)));
        store.push_reading(electric(START + Duration::hours(2), Some(10.0), Some(0.0)));

        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r.method, Method::CounterDelta);
        assert_eq!(r.used_quantity, 0.0);
        assert_eq!(r.start_quantity, Some(10.0));
    }

    #[tokio::test]
    async fn no_readings_yields_empty_result() {
        let store = MemoryStore::new();
        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r, ConsumptionResult::empty());
        assert_eq!(r.start_observed_at, None);
        assert_eq!(r.end_observed_at, None);
    }

    #[tokio::test]
    async fn readings_only_before_interval_yield_empty_result() {
        let store = MemoryStore::new();
        store.push_reading(electric(datetime!(2024-04-20 00:00 UTC), Some(50.0), None));

        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r, ConsumptionResult::empty());
        assert_eq!(r.start_observed_at, None);
        assert_eq!(r.end_observed_at, None);
    }

    #[tokio::test]
    async fn chain_order_is_configurable() {
        let store = MemoryStore::new();
        store.push_reading(electric(START, Some(10.0), Some(1000.0)));
        store.push_reading(electric(START + Duration::hours(1), Some(15.0), Some(1000.0)));

        let integration_first = [Strategy::RateIntegration, Strategy::CounterDelta];
        let r = estimate_with(&store, &integration_first, "e1", MeterKind::Electric, START, END)
            .await
            .unwrap();
        assert_eq!(r.method, Method::RateIntegration);
        assert!((r.used_quantity - 1.0).abs() < 1e-9);

        let r = estimate(&store, "e1", MeterKind::Electric, START, END).await.unwrap();
        assert_eq!(r.method, Method::CounterDelta);
        assert_eq!(r.used_quantity, 5.0);
    }
}
