//! Adaptive staleness-check interval.
//!
//! Upstream publishes at a predictable time of day. Outside that window the
//! cache can poll lazily; inside it, polling tightens so a fresh upload is
//! picked up within a few minutes.

use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};

use crate::Config;
use crate::version::VersionInfo;

/// Poll interval used while inside the expected-update window.
pub const NEAR_WINDOW_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound on the back-off used ahead of the expected-update window.
pub const PRE_WINDOW_CAP: Duration = Duration::from_secs(3600);

/// Next occurrence of `expected` (UTC wall clock), today's if it has not
/// passed yet, otherwise tomorrow's.
pub fn next_expected_update(now: DateTime<Utc>, expected: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(expected).and_utc();
    if now > today {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    } else {
        today
    }
}

/// How long to wait before the next staleness check.
///
/// Rules are evaluated in order, first match wins:
/// 1. unknown version: base interval
/// 2. upstream already carries today's data: max interval
/// 3. well before the update window: half the remaining lead time, capped at one hour
/// 4. within the update window: [`NEAR_WINDOW_INTERVAL`]
/// 5. otherwise: base interval
pub fn next_check_interval(
    now: DateTime<Utc>,
    current: Option<&VersionInfo>,
    config: &Config,
) -> Duration {
    let Some(version) = current else {
        return config.base_refresh_interval;
    };

    let expected = next_expected_update(now, config.expected_update_time);

    if version.last_modified.date_naive() == now.date_naive() {
        return config.max_refresh_interval;
    }

    let window = signed_secs(config.update_window);
    let time_to_window = (expected - now).num_seconds() - window;
    if time_to_window > 0 {
        let half = Duration::from_secs((time_to_window / 2) as u64);
        return half.min(PRE_WINDOW_CAP);
    }

    if (expected - now).num_seconds().abs() <= window {
        return NEAR_WINDOW_INTERVAL;
    }

    config.base_refresh_interval
}

/// Seconds until the next expected upstream update, for status reporting.
pub fn seconds_until_expected_update(now: DateTime<Utc>, expected: NaiveTime) -> u64 {
    (next_expected_update(now, expected) - now)
        .num_seconds()
        .max(0) as u64
}

fn signed_secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
