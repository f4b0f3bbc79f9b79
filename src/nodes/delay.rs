//! DELAY node - suspend the execution until a computed wake-up time.

use chrono::{DateTime, Duration, Utc};

use super::types::{NodeContext, Outcome};
use crate::workflow::DelayData;

/// Longest accepted delay. Anything beyond is almost certainly a unit mistake.
const MAX_DELAY_DAYS: f64 = 3650.0;

/// Convert a delay payload to a duration.
pub fn delay_duration(data: &DelayData) -> Result<Duration, String> {
    if !data.delay_value.is_finite() {
        return Err(format!("delay value {} is not a finite number", data.delay_value));
    }
    if data.delay_value <= 0.0 {
        return Err(format!("delay value must be positive, got {}", data.delay_value));
    }

    let seconds_per_unit = match data.delay_type.trim().to_lowercase().as_str() {
        "second" | "seconds" => 1.0,
        "minute" | "minutes" => 60.0,
        "hour" | "hours" => 3600.0,
        "day" | "days" => 86_400.0,
        other => return Err(format!("unknown delay unit '{}'", other)),
    };

    let total_seconds = data.delay_value * seconds_per_unit;
    if total_seconds > MAX_DELAY_DAYS * 86_400.0 {
        return Err(format!(
            "delay of {} {} exceeds the {} day maximum",
            data.delay_value, data.delay_type, MAX_DELAY_DAYS
        ));
    }

    Ok(Duration::milliseconds((total_seconds * 1000.0).round() as i64))
}

/// Compute the wake-up time for a DELAY node.
pub fn wake_at(data: &DelayData, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let duration = delay_duration(data)?;
    now.checked_add_signed(duration)
        .ok_or_else(|| "wake-up time is out of range".to_string())
}

/// Evaluate a DELAY node.
pub fn execute(data: &DelayData, ctx: &NodeContext) -> Outcome {
    match wake_at(data, ctx.now) {
        Ok(at) => Outcome::Suspend(at),
        Err(reason) => Outcome::Fail(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn delay(value: f64, unit: &str) -> DelayData {
        DelayData {
            delay_value: value,
            delay_type: unit.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_units() {
        assert_eq!(delay_duration(&delay(30.0, "seconds")).unwrap(), Duration::seconds(30));
        assert_eq!(delay_duration(&delay(5.0, "minutes")).unwrap(), Duration::minutes(5));
        assert_eq!(delay_duration(&delay(2.0, "hours")).unwrap(), Duration::hours(2));
        assert_eq!(delay_duration(&delay(1.5, "days")).unwrap(), Duration::hours(36));
        assert_eq!(delay_duration(&delay(1.0, "Days")).unwrap(), Duration::days(1));
    }

    #[test]
    fn test_suspends_until_now_plus_duration() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let ctx = NodeContext::new("wf", "lead-1", now);
        assert_eq!(
            execute(&delay(3.0, "days"), &ctx),
            Outcome::Suspend(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_misconfigured_delays_fail() {
        let ctx = NodeContext::new("wf", "lead-1", Utc::now());
        for data in [
            delay(0.0, "days"),
            delay(-1.0, "hours"),
            delay(f64::NAN, "minutes"),
            delay(f64::INFINITY, "seconds"),
            delay(1.0, "fortnights"),
            delay(100_000.0, "days"),
        ] {
            assert!(
                matches!(execute(&data, &ctx), Outcome::Fail(_)),
                "expected {:?} to fail",
                data
            );
        }
    }
}
