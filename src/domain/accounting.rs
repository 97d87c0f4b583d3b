//! Read-side spend accounting derived from the audit log.
//!
//! Nothing here is authoritative: every figure is recomputed from logs on
//! each query, and the on-chain delegation manager remains the only
//! enforcement point. Arithmetic stays in integer micro-units (6 decimals)
//! and converts to `f64` only at the output edge.
use crate::domain::permissions::{parse_micro_units, PermissionCatalog};
use crate::domain::types::{AgentLog, ChartPoint, LogStatus, PermissionEnvelope};
use crate::domain::metadata::LogMetadata;
use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};

pub const MICROS_PER_UNIT: u128 = 1_000_000;
const ESTIMATED_SPEND_PERCENT: u128 = 5;
const WEEK_DAYS: u64 = 7;
const WEEKDAY_LABELS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

pub fn micros_to_units(micros: u128) -> f64 {
    micros as f64 / MICROS_PER_UNIT as f64
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn period_limit_micros(envelope: Option<&PermissionEnvelope>) -> u128 {
    envelope
        .and_then(|envelope| envelope.primary_limit())
        .and_then(|limit| limit.amount_micros().ok())
        .unwrap_or(0)
}

/// A log counts toward spend only if a tool ran and produced a transaction.
pub fn is_settled(log: &AgentLog) -> bool {
    log.status == LogStatus::Executed
        && log
            .transaction_hash
            .as_deref()
            .is_some_and(|hash| !hash.trim().is_empty())
}

/// Exact `metadata.amount` if reported, else 5% of the agent's period limit.
pub fn attributed_spend_micros(log: &AgentLog, envelope: Option<&PermissionEnvelope>) -> u128 {
    let reported = log
        .metadata
        .as_deref()
        .and_then(|raw| LogMetadata::parse(raw).ok())
        .and_then(|metadata| metadata.amount)
        .and_then(|amount| parse_micro_units(&amount).ok());
    match reported {
        Some(amount) => amount,
        None => period_limit_micros(envelope) * ESTIMATED_SPEND_PERCENT / 100,
    }
}

/// Calendar days in the operator's configured zone.
#[derive(Clone, Copy, Debug)]
pub struct LocalCalendar {
    offset: FixedOffset,
}

impl LocalCalendar {
    pub fn new(utc_offset_minutes: i32) -> Result<Self, String> {
        let offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| format!("utc offset {utc_offset_minutes} minutes is out of range"))?;
        Ok(Self { offset })
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn day_of(&self, timestamp_ns: u64) -> NaiveDate {
        let secs = i64::try_from(timestamp_ns / 1_000_000_000).unwrap_or(i64::MAX);
        let nanos = u32::try_from(timestamp_ns % 1_000_000_000).unwrap_or(0);
        DateTime::from_timestamp(secs, nanos)
            .map(|utc| utc.with_timezone(&self.offset).date_naive())
            .unwrap_or(NaiveDate::MIN)
    }

    /// First nanosecond of `day` in this zone, clamped at the epoch.
    pub fn start_of_day_ns(&self, day: NaiveDate) -> u64 {
        let local_midnight = day.and_time(NaiveTime::MIN).and_utc().timestamp();
        let secs = local_midnight - i64::from(self.offset.local_minus_utc());
        u64::try_from(secs).unwrap_or(0).saturating_mul(1_000_000_000)
    }
}

/// Earliest timestamp any `weekly_series` point covers.
pub fn weekly_window_start_ns(calendar: &LocalCalendar, now_ns: u64) -> u64 {
    let today = calendar.day_of(now_ns);
    let first = today
        .checked_sub_days(Days::new(WEEK_DAYS - 1))
        .unwrap_or(today);
    calendar.start_of_day_ns(first)
}

/// Settled spend within one local calendar day.
pub fn spend_on_day_micros(
    logs: &[AgentLog],
    catalog: &PermissionCatalog,
    calendar: &LocalCalendar,
    day: NaiveDate,
) -> u128 {
    logs.iter()
        .filter(|log| is_settled(log) && calendar.day_of(log.created_at_ns) == day)
        .map(|log| attributed_spend_micros(log, catalog.envelope_for(&log.agent_name)))
        .sum()
}

pub fn today_spend_micros(
    logs: &[AgentLog],
    catalog: &PermissionCatalog,
    calendar: &LocalCalendar,
    now_ns: u64,
) -> u128 {
    spend_on_day_micros(logs, catalog, calendar, calendar.day_of(now_ns))
}

/// Seven points, oldest first, ending with today. The limit is the caller's
/// current daily limit on every point, not a historical value.
pub fn weekly_series(
    logs: &[AgentLog],
    catalog: &PermissionCatalog,
    calendar: &LocalCalendar,
    now_ns: u64,
    daily_limit_micros: u128,
) -> Vec<ChartPoint> {
    let today = calendar.day_of(now_ns);
    let limit = round2(micros_to_units(daily_limit_micros));
    (0..WEEK_DAYS)
        .rev()
        .map(|days_back| {
            let day = today.checked_sub_days(Days::new(days_back)).unwrap_or(today);
            let label = WEEKDAY_LABELS[day.weekday().num_days_from_sunday() as usize];
            ChartPoint {
                label: label.to_string(),
                date: day.format("%Y-%m-%d").to_string(),
                spending: round2(micros_to_units(spend_on_day_micros(
                    logs, catalog, calendar, day,
                ))),
                limit,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::permissions::{GAS_OPTIMISER, PORTFOLIO_REBALANCER};
    use crate::domain::types::ActionTargets;

    // 2025-10-15T12:00:00Z, a Wednesday.
    const NOON_NS: u64 = 1_760_529_600 * 1_000_000_000;
    const DAY_NS: u64 = 86_400 * 1_000_000_000;

    fn catalog() -> PermissionCatalog {
        PermissionCatalog::reference(&ActionTargets::default(), NOON_NS / 1_000_000_000)
    }

    fn log(agent: &str, status: LogStatus, hash: Option<&str>, amount: Option<&str>, at: u64) -> AgentLog {
        let metadata = LogMetadata {
            text: Some("done".to_string()),
            amount: amount.map(str::to_string),
            ..LogMetadata::default()
        };
        AgentLog {
            id: format!("log-{at}"),
            subscription_id: "sub-1".to_string(),
            agent_name: agent.to_string(),
            action: "Agent execution".to_string(),
            status,
            transaction_hash: hash.map(str::to_string),
            metadata: Some(metadata.to_json()),
            created_at_ns: at,
        }
    }

    #[test]
    fn explicit_amount_is_attributed_exactly() {
        let entry = log(PORTFOLIO_REBALANCER, LogStatus::Executed, Some("0xab"), Some("2000000"), NOON_NS);
        let catalog = catalog();
        let micros = attributed_spend_micros(&entry, catalog.envelope_for(PORTFOLIO_REBALANCER));
        assert_eq!(micros_to_units(micros), 2.0);
    }

    #[test]
    fn missing_amount_falls_back_to_five_percent_of_limit() {
        let entry = log(GAS_OPTIMISER, LogStatus::Executed, Some("0xab"), None, NOON_NS);
        let catalog = catalog();
        let micros = attributed_spend_micros(&entry, catalog.envelope_for(GAS_OPTIMISER));
        assert_eq!(micros, 50_000);
        assert_eq!(micros_to_units(micros), 0.05);
    }

    #[test]
    fn missing_amount_and_envelope_counts_as_zero() {
        let entry = log("Ops Agent", LogStatus::Executed, Some("0xab"), None, NOON_NS);
        assert_eq!(attributed_spend_micros(&entry, None), 0);
    }

    #[test]
    fn only_settled_logs_from_today_count() {
        let logs = vec![
            log(PORTFOLIO_REBALANCER, LogStatus::Executed, Some("0x01"), Some("1500000"), NOON_NS),
            log(PORTFOLIO_REBALANCER, LogStatus::Executed, None, Some("9000000"), NOON_NS),
            log(PORTFOLIO_REBALANCER, LogStatus::Analysed, Some("0x02"), Some("9000000"), NOON_NS),
            log(PORTFOLIO_REBALANCER, LogStatus::Executed, Some("0x03"), Some("9000000"), NOON_NS - DAY_NS),
            log(GAS_OPTIMISER, LogStatus::Executed, Some("0x04"), None, NOON_NS + 1),
        ];
        let spent = today_spend_micros(&logs, &catalog(), &LocalCalendar::utc(), NOON_NS);
        assert_eq!(spent, 1_550_000);
    }

    #[test]
    fn local_day_boundary_follows_offset() {
        // 23:30 UTC on Oct 15 is already Oct 16 in UTC+2.
        let late_ns = NOON_NS + 11 * 3_600 * 1_000_000_000 + 30 * 60 * 1_000_000_000;
        let plus_two = LocalCalendar::new(120).unwrap();
        assert_eq!(LocalCalendar::utc().day_of(late_ns).to_string(), "2025-10-15");
        assert_eq!(plus_two.day_of(late_ns).to_string(), "2025-10-16");
        assert!(LocalCalendar::new(i32::MAX).is_err());
    }

    #[test]
    fn weekly_window_starts_at_local_midnight_six_days_back() {
        // 2025-10-09T00:00:00Z
        let utc_start = (NOON_NS - 6 * DAY_NS) - 12 * 3_600 * 1_000_000_000;
        assert_eq!(weekly_window_start_ns(&LocalCalendar::utc(), NOON_NS), utc_start);

        let plus_two = LocalCalendar::new(120).unwrap();
        assert_eq!(
            weekly_window_start_ns(&plus_two, NOON_NS),
            utc_start - 2 * 3_600 * 1_000_000_000
        );
        assert_eq!(LocalCalendar::new(-300).unwrap().start_of_day_ns(NaiveDate::MIN), 0);
    }

    #[test]
    fn weekly_series_has_seven_days_ending_today_with_flat_limit() {
        let logs = vec![
            log(PORTFOLIO_REBALANCER, LogStatus::Executed, Some("0x01"), Some("1234567"), NOON_NS),
            log(PORTFOLIO_REBALANCER, LogStatus::Executed, Some("0x02"), Some("500000"), NOON_NS - 3 * DAY_NS),
            log(PORTFOLIO_REBALANCER, LogStatus::Executed, Some("0x03"), Some("700000"), NOON_NS - 9 * DAY_NS),
        ];
        let series = weekly_series(&logs, &catalog(), &LocalCalendar::utc(), NOON_NS, 3_000_000);

        assert_eq!(series.len(), 7);
        assert_eq!(series[6].date, "2025-10-15");
        assert_eq!(series[6].label, "WED");
        assert_eq!(series[0].date, "2025-10-09");
        assert_eq!(series[0].label, "THU");
        assert_eq!(series[6].spending, 1.23);
        assert_eq!(series[3].spending, 0.5);
        assert!(series.iter().all(|point| point.limit == 3.0));
        let total: f64 = series.iter().map(|point| point.spending).sum();
        assert!((total - 1.73).abs() < 1e-9);
    }
}
