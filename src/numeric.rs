//! Plausibility filtering for raw numeric fields.
//!
//! Gateways forward whatever the attached inverter or battery reports, including
//! Modbus "no data" sentinels and wrapped uint32 counters. Values that fail
//! these checks become absent measurements instead of bogus readings.

use serde_json::Value;
use tracing::debug;

/// Register values Modbus devices use to signal missing or invalid data.
pub const MODBUS_SENTINELS: [f64; 5] = [65535.0, -32768.0, 32768.0, 32767.0, -32767.0];

/// Counters near the uint32 maximum are treated as wrapped garbage.
pub const OVERFLOW_THRESHOLD: f64 = 4_000_000_000.0;

/// Anything above this is implausible unless the field is an energy counter.
pub const LARGE_VALUE_LIMIT: f64 = 1e6;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Energy counters legitimately run into the millions of Wh.
    pub counter: bool,
    pub reject_overflow: bool,
}

impl Bounds {
    pub const ANY: Bounds = Bounds {
        min: None,
        max: None,
        counter: false,
        reject_overflow: false,
    };

    /// Monotonic energy counter: non-negative, large, overflow-checked.
    pub const COUNTER: Bounds = Bounds {
        min: Some(0.0),
        max: None,
        counter: true,
        reject_overflow: true,
    };

    pub const fn range(min: f64, max: f64) -> Self {
        Bounds {
            min: Some(min),
            max: Some(max),
            counter: false,
            reject_overflow: false,
        }
    }

    pub const fn at_least(min: f64) -> Self {
        Bounds {
            min: Some(min),
            max: None,
            counter: false,
            reject_overflow: false,
        }
    }
}

/// Validates an already numeric value. Returns `None` for anything implausible.
pub fn validate(num: f64, field: &str, bounds: Bounds) -> Option<f64> {
    if !num.is_finite() {
        debug!(field, num, "Rejected non-finite value");
        return None;
    }
    if MODBUS_SENTINELS.contains(&num) {
        debug!(field, num, "Rejected Modbus sentinel");
        return None;
    }
    if !bounds.counter && num.abs() > LARGE_VALUE_LIMIT {
        debug!(field, num, "Rejected unexpectedly large value");
        return None;
    }
    if bounds.reject_overflow && num.abs() > OVERFLOW_THRESHOLD {
        debug!(field, num, "Rejected overflowed counter");
        return None;
    }
    if bounds.min.is_some_and(|min| num < min) || bounds.max.is_some_and(|max| num > max) {
        debug!(field, num, ?bounds, "Rejected out of range value");
        return None;
    }
    Some(num)
}

/// Coerces a JSON field to a number the same way the gateway firmware is
/// sloppy about it: numbers, numeric strings and booleans are accepted.
pub fn validate_json(value: Option<&Value>, field: &str, bounds: Bounds) -> Option<f64> {
    let num = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(num) => num,
            Err(_) => {
                debug!(field, value = %s, "Cannot convert to number");
                return None;
            }
        },
        Value::Bool(b) => f64::from(u8::from(*b)),
        other => {
            debug!(field, value = %other, "Cannot convert to number");
            return None;
        }
    };
    validate(num, field, bounds)
}
