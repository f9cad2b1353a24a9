use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use std::collections::HashSet;

use crate::error::{Error, Result};

/// Timestamps of a raster's time steps, in band order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeAxis {
    steps: Vec<NaiveDateTime>,
}

impl TimeAxis {
    pub fn new(steps: Vec<NaiveDateTime>) -> Self {
        Self { steps }
    }

    /// Decodes CF-convention offsets such as `hours since 1800-01-01 00:00:00`.
    pub fn from_cf(values: &[f64], units: &str) -> Result<Self> {
        let (step, epoch) = parse_cf_units(units)?;
        let steps = values
            .iter()
            .map(|v| {
                let millis = v * step.num_milliseconds() as f64;
                if !millis.is_finite() {
                    return Err(Error::Config(format!("time value {v} is not finite")));
                }
                let overflow = || Error::Config(format!("time value {v} {units} overflows"));
                let millis = millis.round();
                if millis < i64::MIN as f64 || millis > i64::MAX as f64 {
                    return Err(overflow());
                }
                TimeDelta::try_milliseconds(millis as i64)
                    .and_then(|offset| epoch.checked_add_signed(offset))
                    .ok_or_else(overflow)
            })
            .collect::<Result<_>>()?;
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[NaiveDateTime] {
        &self.steps
    }

    /// One column label per step: the first four characters of `variable`,
    /// then the two-digit year and month, e.g. `rain-21-03`.
    ///
    /// Sub-monthly axes would collide on that pattern, so they get the day appended.
    pub fn labels(&self, variable: &str) -> Vec<String> {
        let prefix: String = variable.chars().take(4).collect();
        let monthly: Vec<String> = self
            .steps
            .iter()
            .map(|t| format!("{}-{}", prefix, t.format("%y-%m")))
            .collect();

        let distinct: HashSet<&String> = monthly.iter().collect();
        if distinct.len() == monthly.len() {
            return monthly;
        }
        self.steps
            .iter()
            .map(|t| format!("{}-{}", prefix, t.format("%y-%m-%d")))
            .collect()
    }
}

fn parse_cf_units(units: &str) -> Result<(TimeDelta, NaiveDateTime)> {
    let bad = || Error::Config(format!("unrecognised time units {units:?}"));
    let (unit, epoch) = units.trim().split_once(" since ").ok_or_else(bad)?;

    let step = match unit.trim().to_ascii_lowercase().as_str() {
        "days" | "day" | "d" => TimeDelta::days(1),
        "hours" | "hour" | "hrs" | "hr" | "h" => TimeDelta::hours(1),
        "minutes" | "minute" | "mins" | "min" => TimeDelta::minutes(1),
        "seconds" | "second" | "secs" | "sec" | "s" => TimeDelta::seconds(1),
        _ => return Err(bad()),
    };

    let epoch = epoch
        .trim()
        .trim_end_matches(" UTC")
        .trim_end_matches('Z')
        .trim();
    let parsed = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(epoch, f).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(epoch, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(bad)?;
    Ok((step, parsed))
}
