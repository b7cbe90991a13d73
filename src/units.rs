//! Units of measure.
//!
//! A unit is either *dimensional* (a linear map onto an exponent vector over
//! the base dimensions, e.g. `kg`, `m/s`, `degC`) or *reference-time* (`<unit>
//! since <epoch>` with an associated calendar). Dimensional units convert
//! through their scale and offset; reference-time units convert by shifting
//! between epochs, which requires the calendars to agree.
//!
//! The parser recognizes the unit vocabulary that actually occurs in the
//! datasets we process. It is not a general units database.

use std::fmt;

use chrono::NaiveDateTime;

/// Base-dimension exponents: length, mass, time, temperature.
type Dims = [i32; 4];

const DIMLESS: Dims = [0, 0, 0, 0];

#[derive(Debug, PartialEq)]
pub enum UnitsError {
    Parse(String),
    NotConvertible { from: String, to: String },
    CalendarMismatch { from: Calendar, to: Calendar },
    NotRootable(String),
    ReferenceTimeArithmetic(String),
}

impl fmt::Display for UnitsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitsError::Parse(text) => write!(f, "invalid units \"{}\"", text),
            UnitsError::NotConvertible { from, to } => {
                write!(f, "units \"{}\" are not convertible to \"{}\"", from, to)
            }
            UnitsError::CalendarMismatch { from, to } => write!(
                f,
                "calendar \"{}\" does not match calendar \"{}\"",
                from, to
            ),
            UnitsError::NotRootable(text) => {
                write!(f, "units \"{}\" do not have a whole root", text)
            }
            UnitsError::ReferenceTimeArithmetic(op) => write!(
                f,
                "operation \"{}\" is not defined on reference-time values",
                op
            ),
        }
    }
}

/// Calendars supported for reference-time units.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Calendar {
    Standard,
    NoLeap,
    AllLeap,
    Day360,
}

impl Calendar {
    pub fn parse(name: &str) -> Result<Self, UnitsError> {
        match name {
            "standard" | "gregorian" | "proleptic_gregorian" => Ok(Calendar::Standard),
            "noleap" | "365_day" => Ok(Calendar::NoLeap),
            "all_leap" | "366_day" => Ok(Calendar::AllLeap),
            "360_day" => Ok(Calendar::Day360),
            other => Err(UnitsError::Parse(format!("calendar {}", other))),
        }
    }
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Calendar::Standard => "standard",
            Calendar::NoLeap => "noleap",
            Calendar::AllLeap => "all_leap",
            Calendar::Day360 => "360_day",
        };
        write!(f, "{}", name)
    }
}

// Cumulative day counts at the start of each month for the fixed-length
// calendars.
const CUM_DAYS_365: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
const CUM_DAYS_366: [i64; 12] = [0, 31, 60, 91, 121, 152, 182, 213, 244, 274, 305, 335];

/// Seconds of `when` since year zero under the given calendar. Only
/// differences of these values are meaningful.
fn calendar_seconds(when: &NaiveDateTime, calendar: Calendar) -> f64 {
    use chrono::{Datelike, Timelike};

    let year = when.year() as i64;
    let month = when.month0() as usize;
    let day = when.day0() as i64;

    let days = match calendar {
        Calendar::Standard => {
            // chrono's day ordinal is exact for the proleptic Gregorian
            // calendar, which is what the standard calendar means here.
            let epoch = NaiveDateTime::parse_from_str("0001-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
                .unwrap();
            return when.signed_duration_since(epoch).num_seconds() as f64;
        }
        Calendar::NoLeap => year * 365 + CUM_DAYS_365[month] + day,
        Calendar::AllLeap => year * 366 + CUM_DAYS_366[month] + day,
        Calendar::Day360 => year * 360 + month as i64 * 30 + day,
    };

    let in_day = when.num_seconds_from_midnight() as i64;
    (days * 86_400 + in_day) as f64
}

/// The measure unit in front of `since`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeBase {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeBase {
    fn seconds(&self) -> f64 {
        match self {
            TimeBase::Seconds => 1.0,
            TimeBase::Minutes => 60.0,
            TimeBase::Hours => 3_600.0,
            TimeBase::Days => 86_400.0,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "s" | "sec" | "secs" | "second" | "seconds" => Some(TimeBase::Seconds),
            "min" | "mins" | "minute" | "minutes" => Some(TimeBase::Minutes),
            "h" | "hr" | "hrs" | "hour" | "hours" => Some(TimeBase::Hours),
            "d" | "day" | "days" => Some(TimeBase::Days),
            _ => None,
        }
    }
}

/// A unit of measure.
#[derive(Clone, Debug)]
pub enum Units {
    /// `value_in_base = scale * value + offset`, base determined by `dims`.
    Dimensional {
        repr: String,
        dims: Dims,
        scale: f64,
        offset: f64,
    },
    /// `<base> since <epoch>` under `calendar`.
    ReferenceTime {
        repr: String,
        base: TimeBase,
        epoch: NaiveDateTime,
        calendar: Calendar,
    },
}

impl PartialEq for Units {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Units::Dimensional {
                    dims: d1,
                    scale: s1,
                    offset: o1,
                    ..
                },
                Units::Dimensional {
                    dims: d2,
                    scale: s2,
                    offset: o2,
                    ..
                },
            ) => d1 == d2 && s1 == s2 && o1 == o2,
            (
                Units::ReferenceTime {
                    base: b1,
                    epoch: e1,
                    calendar: c1,
                    ..
                },
                Units::ReferenceTime {
                    base: b2,
                    epoch: e2,
                    calendar: c2,
                    ..
                },
            ) => b1 == b2 && e1 == e2 && c1 == c2,
            _ => false,
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Units::Dimensional { repr, .. } => write!(f, "{}", repr),
            Units::ReferenceTime { repr, .. } => write!(f, "{}", repr),
        }
    }
}

// Symbol table: name, dims, scale to base, offset to base. Base units are m,
// kg, s, K.
const SYMBOLS: &[(&str, Dims, f64, f64)] = &[
    ("1", DIMLESS, 1.0, 0.0),
    ("%", DIMLESS, 0.01, 0.0),
    ("m", [1, 0, 0, 0], 1.0, 0.0),
    ("g", [0, 1, 0, 0], 1.0e-3, 0.0),
    ("s", [0, 0, 1, 0], 1.0, 0.0),
    ("sec", [0, 0, 1, 0], 1.0, 0.0),
    ("min", [0, 0, 1, 0], 60.0, 0.0),
    ("h", [0, 0, 1, 0], 3_600.0, 0.0),
    ("hr", [0, 0, 1, 0], 3_600.0, 0.0),
    ("hour", [0, 0, 1, 0], 3_600.0, 0.0),
    ("d", [0, 0, 1, 0], 86_400.0, 0.0),
    ("day", [0, 0, 1, 0], 86_400.0, 0.0),
    ("K", [0, 0, 0, 1], 1.0, 0.0),
    ("degC", [0, 0, 0, 1], 1.0, 273.15),
    ("degF", [0, 0, 0, 1], 5.0 / 9.0, 255.372_222_222_222_24),
    ("N", [1, 1, -2, 0], 1.0, 0.0),
    ("Pa", [-1, 1, -2, 0], 1.0, 0.0),
    ("bar", [-1, 1, -2, 0], 1.0e5, 0.0),
    ("J", [2, 1, -2, 0], 1.0, 0.0),
    ("W", [2, 1, -3, 0], 1.0, 0.0),
];

const PREFIXES: &[(&str, f64)] = &[
    ("G", 1.0e9),
    ("M", 1.0e6),
    ("k", 1.0e3),
    ("h", 1.0e2),
    ("d", 1.0e-1),
    ("c", 1.0e-2),
    ("m", 1.0e-3),
    ("u", 1.0e-6),
    ("n", 1.0e-9),
];

fn lookup_symbol(name: &str) -> Option<(Dims, f64, f64)> {
    // Whole symbols win over prefixed ones, so "m" is the meter and not a
    // dangling milli prefix.
    for (symbol, dims, scale, offset) in SYMBOLS {
        if *symbol == name {
            return Some((*dims, *scale, *offset));
        }
    }

    for (prefix, factor) in PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            for (symbol, dims, scale, offset) in SYMBOLS {
                if *symbol == rest && *offset == 0.0 {
                    return Some((*dims, factor * scale, 0.0));
                }
            }
        }
    }

    None
}

fn parse_factor(factor: &str, invert: bool) -> Result<(Dims, f64, f64), UnitsError> {
    // Split a trailing signed integer exponent off the symbol, as in "m-2" or
    // "s2".
    let exp_at = factor
        .char_indices()
        .find(|(at, ch)| *at > 0 && (ch.is_ascii_digit() || *ch == '-'))
        .map(|(at, _)| at);

    let (name, exponent) = match exp_at {
        Some(at) => {
            let exponent = factor[at..]
                .parse::<i32>()
                .map_err(|_| UnitsError::Parse(factor.to_owned()))?;
            (&factor[..at], exponent)
        }
        None => (factor, 1),
    };

    let (dims, scale, offset) = match lookup_symbol(name) {
        Some(found) => found,
        None => return Err(UnitsError::Parse(factor.to_owned())),
    };

    let exponent = if invert { -exponent } else { exponent };

    let mut result_dims = DIMLESS;
    for (slot, dim) in result_dims.iter_mut().zip(dims.iter()) {
        *slot = dim * exponent;
    }

    Ok((result_dims, scale.powi(exponent), if exponent == 1 { offset } else { 0.0 }))
}

impl Units {
    /// The dimensionless unit `1`.
    pub fn one() -> Self {
        Units::Dimensional {
            repr: String::from("1"),
            dims: DIMLESS,
            scale: 1.0,
            offset: 0.0,
        }
    }

    /// Parses a unit string, optionally with a calendar name for
    /// reference-time forms. A missing calendar means the standard calendar.
    pub fn parse(text: &str, calendar: Option<&str>) -> Result<Self, UnitsError> {
        let text = text.trim();

        if let Some(at) = text.find(" since ") {
            let base = TimeBase::parse(text[..at].trim())
                .ok_or_else(|| UnitsError::Parse(text.to_owned()))?;
            let epoch = parse_epoch(text[at + 7..].trim())?;
            let calendar = match calendar {
                Some(name) => Calendar::parse(name)?,
                None => Calendar::Standard,
            };

            return Ok(Units::ReferenceTime {
                repr: text.to_owned(),
                base,
                epoch,
                calendar,
            });
        }

        let mut dims = DIMLESS;
        let mut scale = 1.0;
        let mut offset = 0.0;
        let mut n_factors = 0;
        let mut invert = false;

        for part in text.split_whitespace() {
            for (at, factor) in part.split('/').enumerate() {
                let factor = factor.trim();
                if factor.is_empty() {
                    return Err(UnitsError::Parse(text.to_owned()));
                }

                // A leading numeric factor, as in "0.001 kg".
                if at == 0 && n_factors == 0 {
                    if let Ok(number) = factor.parse::<f64>() {
                        scale *= number;
                        n_factors += 1;
                        continue;
                    }
                }

                let (f_dims, f_scale, f_offset) = parse_factor(factor, invert || at > 0)?;
                for (slot, dim) in dims.iter_mut().zip(f_dims.iter()) {
                    *slot += dim;
                }
                scale *= f_scale;
                offset = f_offset;
                n_factors += 1;

                if at > 0 {
                    invert = true;
                }
            }
        }

        if n_factors == 0 {
            return Err(UnitsError::Parse(text.to_owned()));
        }

        // An offset only survives when the unit is that single symbol;
        // compound forms like "degC m" are scale-only.
        if n_factors > 1 {
            offset = 0.0;
        }

        Ok(Units::Dimensional {
            repr: text.to_owned(),
            dims,
            scale,
            offset,
        })
    }

    /// Parses the unit from attribute values the way file metadata spells
    /// them: missing, empty, `?` and `unknown` all mean dimensionless.
    pub fn from_attrs(units: Option<&str>, calendar: Option<&str>) -> Result<Self, UnitsError> {
        match units {
            None | Some("") | Some("?") | Some("unknown") => Ok(Units::one()),
            Some(text) => Units::parse(text, calendar),
        }
    }

    pub fn is_reference_time(&self) -> bool {
        matches!(self, Units::ReferenceTime { .. })
    }

    pub fn calendar(&self) -> Option<Calendar> {
        match self {
            Units::ReferenceTime { calendar, .. } => Some(*calendar),
            Units::Dimensional { .. } => None,
        }
    }

    /// Whether values in these units can be converted into `other`.
    pub fn is_convertible(&self, other: &Units) -> bool {
        match (self, other) {
            (
                Units::Dimensional { dims: from, .. },
                Units::Dimensional { dims: to, .. },
            ) => from == to,
            (
                Units::ReferenceTime {
                    calendar: from, ..
                },
                Units::ReferenceTime { calendar: to, .. },
            ) => from == to,
            _ => false,
        }
    }

    /// The linear map `(gain, bias)` such that `value_in_other = gain * value
    /// + bias`.
    pub fn conversion(&self, other: &Units) -> Result<(f64, f64), UnitsError> {
        match (self, other) {
            (
                Units::Dimensional {
                    dims: d1,
                    scale: s1,
                    offset: o1,
                    ..
                },
                Units::Dimensional {
                    dims: d2,
                    scale: s2,
                    offset: o2,
                    ..
                },
            ) => {
                if d1 != d2 {
                    return Err(UnitsError::NotConvertible {
                        from: self.to_string(),
                        to: other.to_string(),
                    });
                }
                Ok((s1 / s2, (o1 - o2) / s2))
            }
            (
                Units::ReferenceTime {
                    base: b1,
                    epoch: e1,
                    calendar: c1,
                    ..
                },
                Units::ReferenceTime {
                    base: b2,
                    epoch: e2,
                    calendar: c2,
                    ..
                },
            ) => {
                if c1 != c2 {
                    return Err(UnitsError::CalendarMismatch {
                        from: *c1,
                        to: *c2,
                    });
                }
                let shift = calendar_seconds(e1, *c1) - calendar_seconds(e2, *c2);
                Ok((b1.seconds() / b2.seconds(), shift / b2.seconds()))
            }
            _ => Err(UnitsError::NotConvertible {
                from: self.to_string(),
                to: other.to_string(),
            }),
        }
    }

    /// Converts a buffer of values in place into `other`.
    pub fn convert_values(&self, other: &Units, values: &mut [f64]) -> Result<(), UnitsError> {
        let (gain, bias) = self.conversion(other)?;
        for value in values {
            *value = gain * *value + bias;
        }
        Ok(())
    }

    /// Unit of a product of two quantities. Offsets do not survive
    /// combination; reference-time units do not combine.
    pub fn multiply(&self, other: &Units) -> Result<Units, UnitsError> {
        match (self, other) {
            (
                Units::Dimensional {
                    dims: d1,
                    scale: s1,
                    ..
                },
                Units::Dimensional {
                    dims: d2,
                    scale: s2,
                    ..
                },
            ) => {
                let mut dims = DIMLESS;
                for ((slot, a), b) in dims.iter_mut().zip(d1.iter()).zip(d2.iter()) {
                    *slot = a + b;
                }
                Ok(Units::synthesized(dims, s1 * s2))
            }
            _ => Err(UnitsError::ReferenceTimeArithmetic(String::from("*"))),
        }
    }

    /// Unit of a quotient of two quantities.
    pub fn divide(&self, other: &Units) -> Result<Units, UnitsError> {
        match (self, other) {
            (
                Units::Dimensional {
                    dims: d1,
                    scale: s1,
                    ..
                },
                Units::Dimensional {
                    dims: d2,
                    scale: s2,
                    ..
                },
            ) => {
                let mut dims = DIMLESS;
                for ((slot, a), b) in dims.iter_mut().zip(d1.iter()).zip(d2.iter()) {
                    *slot = a - b;
                }
                Ok(Units::synthesized(dims, s1 / s2))
            }
            _ => Err(UnitsError::ReferenceTimeArithmetic(String::from("/"))),
        }
    }

    /// Unit raised to an integer power.
    pub fn pow(&self, exponent: i32) -> Result<Units, UnitsError> {
        match self {
            Units::Dimensional { dims, scale, .. } => {
                let mut result = DIMLESS;
                for (slot, dim) in result.iter_mut().zip(dims.iter()) {
                    *slot = dim * exponent;
                }
                Ok(Units::synthesized(result, scale.powi(exponent)))
            }
            Units::ReferenceTime { .. } => {
                Err(UnitsError::ReferenceTimeArithmetic(String::from("**")))
            }
        }
    }

    /// The `n`-th root of the unit, defined only when every exponent divides
    /// evenly and there is no offset.
    pub fn root(&self, n: i32) -> Result<Units, UnitsError> {
        match self {
            Units::Dimensional {
                dims,
                scale,
                offset,
                ..
            } => {
                if *offset != 0.0 || dims.iter().any(|dim| dim % n != 0) {
                    return Err(UnitsError::NotRootable(self.to_string()));
                }
                let mut result = DIMLESS;
                for (slot, dim) in result.iter_mut().zip(dims.iter()) {
                    *slot = dim / n;
                }
                Ok(Units::synthesized(result, scale.powf(1.0 / n as f64)))
            }
            Units::ReferenceTime { .. } => Err(UnitsError::NotRootable(self.to_string())),
        }
    }

    /// Unit of the difference of two reference-time values: the plain
    /// interval unit, no longer anchored to an epoch.
    pub fn interval(&self) -> Units {
        match self {
            Units::ReferenceTime { base, .. } => {
                let (repr, scale) = match base {
                    TimeBase::Seconds => ("s", 1.0),
                    TimeBase::Minutes => ("min", 60.0),
                    TimeBase::Hours => ("h", 3_600.0),
                    TimeBase::Days => ("day", 86_400.0),
                };
                Units::Dimensional {
                    repr: String::from(repr),
                    dims: [0, 0, 1, 0],
                    scale,
                    offset: 0.0,
                }
            }
            dimensional => dimensional.clone(),
        }
    }

    fn synthesized(dims: Dims, scale: f64) -> Units {
        let repr = if dims == DIMLESS && scale == 1.0 {
            String::from("1")
        } else {
            let mut parts = Vec::new();
            if scale != 1.0 {
                parts.push(format!("{}", scale));
            }
            for (symbol, dim) in ["m", "kg", "s", "K"].iter().zip(dims.iter()) {
                match dim {
                    0 => {}
                    1 => parts.push((*symbol).to_owned()),
                    n => parts.push(format!("{}{}", symbol, n)),
                }
            }
            if parts.is_empty() {
                String::from("1")
            } else {
                parts.join(" ")
            }
        };

        Units::Dimensional {
            repr,
            dims,
            scale,
            offset: 0.0,
        }
    }
}

fn parse_epoch(text: &str) -> Result<NaiveDateTime, UnitsError> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    for format in FORMATS {
        if let Ok(when) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(when);
        }
    }

    // A bare date has no time component for chrono to parse, so retry with
    // midnight appended.
    if let Ok(when) =
        NaiveDateTime::parse_from_str(&format!("{} 00:00:00", text), "%Y-%m-%d %H:%M:%S")
    {
        return Ok(when);
    }

    Err(UnitsError::Parse(text.to_owned()))
}
