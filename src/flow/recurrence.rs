// src/flow/recurrence.rs

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Timelike, Utc};

use crate::config::parse_duration;

/// When a flow wants a new run.
///
/// The flow never triggers itself; the scheduler's timer asks
/// [`Recurrence::is_due`] and starts a run when it answers yes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    /// A fixed period measured from the previous run's trigger time.
    Interval(Duration),
    /// Every hour at the given minute (UTC).
    Hourly { minute: u32 },
    /// Every day at the given time (UTC).
    Daily { hour: u32, minute: u32 },
}

impl Recurrence {
    /// Pure query over (policy, last trigger time, now). A flow that never
    /// ran is always due.
    pub fn is_due(&self, last_run: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_run else {
            return true;
        };

        match self {
            Recurrence::Interval(period) => TimeDelta::from_std(*period)
                .ok()
                .and_then(|delta| last.checked_add_signed(delta))
                .is_some_and(|next| now >= next),
            Recurrence::Hourly { .. } | Recurrence::Daily { .. } => {
                self.latest_slot(now).is_some_and(|slot| last < slot)
            }
        }
    }

    /// The most recent scheduled instant at or before `now`.
    fn latest_slot(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match *self {
            Recurrence::Interval(_) => None,
            Recurrence::Hourly { minute } => {
                let slot = now.with_minute(minute)?.with_second(0)?.with_nanosecond(0)?;
                if slot <= now {
                    Some(slot)
                } else {
                    slot.checked_sub_signed(TimeDelta::hours(1))
                }
            }
            Recurrence::Daily { hour, minute } => {
                let slot = now.date_naive().and_hms_opt(hour, minute, 0)?.and_utc();
                if slot <= now {
                    Some(slot)
                } else {
                    slot.checked_sub_signed(TimeDelta::days(1))
                }
            }
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Interval(d) => write!(f, "every:{}ms", d.as_millis()),
            Recurrence::Hourly { minute } => write!(f, "hourly@{minute:02}"),
            Recurrence::Daily { hour, minute } => write!(f, "daily@{hour:02}:{minute:02}"),
        }
    }
}

/// Accepts `daily`, `daily@HH:MM`, `hourly`, `hourly@MM` and `every:<duration>`.
impl FromStr for Recurrence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (kind, arg) = match s.split_once(['@', ':']) {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s.as_str(), None),
        };

        let number = |v: &str, max: u32, what: &str| -> Result<u32, String> {
            let n: u32 = v
                .trim()
                .parse()
                .map_err(|e| format!("invalid {what} '{v}': {e}"))?;
            if n > max {
                return Err(format!("{what} {n} out of range (max {max})"));
            }
            Ok(n)
        };

        match (kind, arg) {
            ("daily", None) => Ok(Recurrence::Daily { hour: 0, minute: 0 }),
            ("daily", Some(at)) => {
                let (h, m) = at
                    .split_once(':')
                    .ok_or_else(|| format!("daily time must be HH:MM, got '{at}'"))?;
                Ok(Recurrence::Daily {
                    hour: number(h, 23, "hour")?,
                    minute: number(m, 59, "minute")?,
                })
            }
            ("hourly", None) => Ok(Recurrence::Hourly { minute: 0 }),
            ("hourly", Some(m)) => Ok(Recurrence::Hourly {
                minute: number(m, 59, "minute")?,
            }),
            ("every", Some(d)) => {
                let period = parse_duration(d)?;
                if period.is_zero() {
                    return Err("recurrence interval must be greater than zero".to_string());
                }
                Ok(Recurrence::Interval(period))
            }
            _ => Err(format!(
                "invalid recurrence '{s}' (expected daily[@HH:MM], hourly[@MM] or every:<duration>)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn never_run_is_due() {
        assert!(Recurrence::Daily { hour: 2, minute: 0 }.is_due(None, at(1, 0)));
    }

    #[test]
    fn interval_waits_for_full_period() {
        let r = Recurrence::Interval(Duration::from_secs(600));
        assert!(!r.is_due(Some(at(10, 0)), at(10, 9)));
        assert!(r.is_due(Some(at(10, 0)), at(10, 10)));
    }

    #[test]
    fn daily_is_due_once_per_slot() {
        let r = Recurrence::Daily { hour: 2, minute: 30 };
        // Ran yesterday evening; today's 02:30 slot not reached yet.
        let last = at(20, 0) - TimeDelta::days(1);
        assert!(!r.is_due(Some(last), at(2, 0)));
        assert!(r.is_due(Some(last), at(2, 30)));
        // Already ran for today's slot.
        assert!(!r.is_due(Some(at(2, 31)), at(23, 0)));
    }

    #[test]
    fn hourly_wraps_to_previous_hour() {
        let r = Recurrence::Hourly { minute: 45 };
        assert!(!r.is_due(Some(at(9, 50)), at(10, 30)));
        assert!(r.is_due(Some(at(9, 40)), at(10, 30)));
    }

    #[test]
    fn parses_policies() {
        assert_eq!("daily".parse(), Ok(Recurrence::Daily { hour: 0, minute: 0 }));
        assert_eq!("daily@02:30".parse(), Ok(Recurrence::Daily { hour: 2, minute: 30 }));
        assert_eq!("hourly@15".parse(), Ok(Recurrence::Hourly { minute: 15 }));
        assert_eq!(
            "every:10m".parse(),
            Ok(Recurrence::Interval(Duration::from_secs(600)))
        );
        assert!("weekly".parse::<Recurrence>().is_err());
        assert!("daily@25:00".parse::<Recurrence>().is_err());
        assert!("every:0s".parse::<Recurrence>().is_err());
    }
}
