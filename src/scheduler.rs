//! Rate-limited send timing.
//!
//! [`next_allowed_send_delay`] is pure: it takes an explicit `now` and an
//! injected RNG so tests can pin both. The total delay is the sum of three
//! independent components — randomized jitter, the weekend skip, and the
//! offset into the campaign's daily send window.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use rand::Rng;

use crate::model::{CampaignSettings, Mailbox, SendWindow};

/// Inputs for the delay computation.
#[derive(Debug, Clone)]
pub struct SendTimingRules {
    /// Jitter bounds in seconds, sampled uniformly.
    pub min_delay_secs: u32,
    pub max_delay_secs: u32,
    /// Defer Saturday/Sunday sends to Monday 09:00 UTC.
    pub work_days_only: bool,
    /// Daily send window in `timezone`; `None` means any hour.
    pub send_window: Option<SendWindow>,
    pub timezone: Tz,
}

impl SendTimingRules {
    /// Combine campaign policy with per-mailbox jitter bounds.
    ///
    /// An unknown IANA name falls back to UTC; config validation warns about
    /// it at load time, never at send time.
    pub fn from_campaign(settings: &CampaignSettings, mailbox: &Mailbox) -> Self {
        let timezone: Tz = settings.timezone.parse().unwrap_or(Tz::UTC);
        Self {
            min_delay_secs: mailbox.min_delay_secs,
            max_delay_secs: mailbox.max_delay_secs,
            work_days_only: settings.work_days_only,
            send_window: settings.send_window,
            timezone,
        }
    }
}

/// Compute how long to wait before the mailbox may send.
pub fn next_allowed_send_delay<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    rules: &SendTimingRules,
    rng: &mut R,
) -> Duration {
    let jitter = jitter_secs(rules, rng);
    let weekend = if rules.work_days_only {
        weekend_offset_secs(now)
    } else {
        0
    };
    let window = match rules.send_window {
        Some(window) => window_offset_secs(now, window, rules.timezone),
        None => 0,
    };
    Duration::from_secs(jitter + weekend + window)
}

/// Uniform jitter in `[min_delay_secs, max_delay_secs]`, to avoid
/// provider-detectable send patterns.
fn jitter_secs<R: Rng + ?Sized>(rules: &SendTimingRules, rng: &mut R) -> u64 {
    let (lo, hi) = (
        u64::from(rules.min_delay_secs),
        u64::from(rules.max_delay_secs),
    );
    if hi <= lo { lo } else { rng.gen_range(lo..=hi) }
}

/// Seconds from `now` to the next Monday 09:00 UTC, or 0 on a weekday.
fn weekend_offset_secs(now: DateTime<Utc>) -> u64 {
    let days_ahead = match now.weekday() {
        Weekday::Sat => 2,
        Weekday::Sun => 1,
        _ => return 0,
    };
    let monday = now.date_naive() + chrono::Days::new(days_ahead);
    let target = monday
        .and_time(NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default())
        .and_utc();
    (target - now).num_seconds().max(0) as u64
}

/// Seconds from `now` to the window start in the campaign's timezone.
///
/// Before the window: wait until today's start. After the window: wait until
/// tomorrow's start. The arithmetic works on local wall-clock seconds, so a
/// DST transition shifts the result by at most the transition amount.
fn window_offset_secs(now: DateTime<Utc>, window: SendWindow, tz: Tz) -> u64 {
    const DAY: u64 = 86_400;
    let local = now.with_timezone(&tz).time();
    let t = u64::from(local.num_seconds_from_midnight());
    let start = u64::from(window.start.num_seconds_from_midnight());
    let end = u64::from(window.end.num_seconds_from_midnight());

    if t < start {
        start - t
    } else if t > end {
        DAY - t + start
    } else {
        0
    }
}
