//! ClickHouse literal encoding
//!
//! Turns typed values into the text ClickHouse expects when a value is
//! embedded directly in a query, e.g. the tuples of an `INSERT ... VALUES`
//! body or a parameter substituted into the query text.
//!
//! Mappings are the one exception: they are written as JSON objects, which is
//! what `FORMAT JSONEachRow` inserts accept. A mapping is only valid as a whole
//! row, never inside an array or tuple.

use chrono::{DateTime, NaiveDateTime, Timelike};
use chrono_tz::Tz;
use std::fmt;
use uuid::Uuid;

/// Quote used for string-like literals outside of mappings
pub const DEFAULT_QUOTE: char = '\'';

/// Quote used inside mappings, where output must be JSON
pub const JSON_QUOTE: char = '"';

/// A point in time, with or without a timezone
#[derive(Debug, Clone, PartialEq)]
pub enum Timestamp {
    Naive(NaiveDateTime),
    Zoned(DateTime<Tz>),
}

impl Timestamp {
    fn naive_local(&self) -> NaiveDateTime {
        match self {
            Timestamp::Naive(dt) => *dt,
            Timestamp::Zoned(dt) => dt.naive_local(),
        }
    }

    fn microsecond(&self) -> u32 {
        self.naive_local().nanosecond() / 1_000
    }

    /// Abbreviated zone name (`UTC`, `CET`, ...), if the timestamp carries one
    fn zone_abbreviation(&self) -> Option<String> {
        match self {
            Timestamp::Naive(_) => None,
            Timestamp::Zoned(dt) => Some(dt.format("%Z").to_string()),
        }
    }

    /// Seconds since the epoch. Naive timestamps are read as UTC.
    fn epoch_seconds(&self) -> f64 {
        let micros = match self {
            Timestamp::Naive(dt) => dt.and_utc().timestamp_micros(),
            Timestamp::Zoned(dt) => dt.timestamp_micros(),
        };
        micros as f64 / 1_000_000.0
    }

    /// Epoch seconds as text, always with a fractional part (`1709967930.0`)
    fn epoch_string(&self) -> String {
        let seconds = self.epoch_seconds();
        if seconds.fract() == 0.0 {
            format!("{:.1}", seconds)
        } else {
            format!("{}", seconds)
        }
    }

    /// Wall clock followed by the UTC offset for zoned timestamps
    fn param_string(&self) -> String {
        match self {
            Timestamp::Naive(_) => self.wall_clock(),
            Timestamp::Zoned(dt) => format!("{}{}", self.wall_clock(), dt.format("%:z")),
        }
    }

    fn wall_clock(&self) -> String {
        let local = self.naive_local();
        if self.microsecond() == 0 {
            local.format("%Y-%m-%d %H:%M:%S").to_string()
        } else {
            format!(
                "{}.{:06}",
                local.format("%Y-%m-%d %H:%M:%S"),
                self.microsecond()
            )
        }
    }
}

/// A value that can be written as a ClickHouse literal
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Uuid(Uuid),
    Timestamp(Timestamp),
    /// Ordered sequence, written as an `Array` literal
    Sequence(Vec<Value>),
    /// Fixed tuple, written as a `Tuple` literal
    Tuple(Vec<Value>),
    /// String-keyed mapping, written as a JSON object
    Mapping(Vec<(String, Value)>),
    /// Any other value, in its display form. Plain strings land here.
    Other(String),
}

impl Value {
    /// Encode this value with the default single quote
    pub fn encode(&self) -> Vec<u8> {
        encode(self, DEFAULT_QUOTE)
    }

    /// Encode into a `String`. Encoding only ever produces UTF-8.
    pub fn encode_to_string(&self) -> String {
        let mut out = String::new();
        write_value(&mut out, self, DEFAULT_QUOTE);
        out
    }

    /// Plain textual form sent as an out-of-band `param_<name>` value.
    ///
    /// Scalars are sent unquoted; containers use their literal form, which
    /// ClickHouse parses for `Array`/`Tuple`/`Map` typed parameters.
    pub fn to_param_string(&self) -> String {
        match self {
            Value::Null => "\\N".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Uuid(u) => u.hyphenated().to_string(),
            Value::Timestamp(ts) => ts.param_string(),
            Value::Other(s) => s.clone(),
            Value::Sequence(_) | Value::Tuple(_) | Value::Mapping(_) => self.encode_to_string(),
        }
    }
}

/// Encode `value` as ClickHouse literal bytes using `quote_char` for strings.
pub fn encode(value: &Value, quote_char: char) -> Vec<u8> {
    let mut out = String::new();
    write_value(&mut out, value, quote_char);
    out.into_bytes()
}

fn write_value(out: &mut String, value: &Value, quote_char: char) {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::UInt(u) => out.push_str(&u.to_string()),
        Value::Float(f) => out.push_str(&format_float(*f)),
        Value::Uuid(u) => {
            out.push(quote_char);
            out.push_str(&u.hyphenated().to_string());
            out.push(quote_char);
        }
        Value::Timestamp(ts) => write_timestamp(out, ts),
        Value::Sequence(items) => write_container(out, items, '[', ']'),
        Value::Tuple(items) => write_container(out, items, '(', ')'),
        Value::Mapping(entries) => write_mapping(out, entries),
        Value::Other(s) => write_quoted(out, s, quote_char),
    }
}

fn write_timestamp(out: &mut String, ts: &Timestamp) {
    let tz_arg = ts
        .zone_abbreviation()
        .map(|tz| format!(", '{}'", tz))
        .unwrap_or_default();

    if ts.microsecond() == 0 {
        out.push_str(&format!("toDateTime('{}'{})", ts.wall_clock(), tz_arg));
    } else {
        out.push_str(&format!("toDateTime64('{}', 6{})", ts.wall_clock(), tz_arg));
    }
}

// Container elements always use the default quote, even inside a mapping.
fn write_container(out: &mut String, items: &[Value], open: char, close: char) {
    out.push(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(out, item, DEFAULT_QUOTE);
    }
    out.push(close);
}

fn write_mapping(out: &mut String, entries: &[(String, Value)]) {
    out.push('{');
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_quoted(out, key, JSON_QUOTE);
        out.push(':');
        match value {
            // JSON has no NULL keyword
            Value::Null => out.push_str("null"),
            Value::Timestamp(ts) => write_quoted(out, &ts.epoch_string(), JSON_QUOTE),
            Value::Uuid(u) => write_quoted(out, &u.hyphenated().to_string(), JSON_QUOTE),
            other => write_value(out, other, JSON_QUOTE),
        }
    }
    out.push('}');
}

// Double-quoted output must stay valid JSON, so control characters are
// escaped there as well.
fn write_quoted(out: &mut String, s: &str, quote_char: char) {
    out.push(quote_char);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            c if c == quote_char => {
                out.push('\\');
                out.push(c);
            }
            '\n' if quote_char == JSON_QUOTE => out.push_str("\\n"),
            '\r' if quote_char == JSON_QUOTE => out.push_str("\\r"),
            '\t' if quote_char == JSON_QUOTE => out.push_str("\\t"),
            c if quote_char == JSON_QUOTE && (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote_char);
}

/// Integral floats print without a fractional part; everything else uses the
/// shortest representation that round-trips.
fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return "0".to_string();
    }
    if f.fract() == 0.0 {
        return format!("{:.0}", f);
    }
    format!("{}", f)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode_to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! impl_from_int {
    ($variant:ident: $($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

impl_from_int!(Int: i8, i16, i32, i64);
impl_from_int!(UInt: u8, u16, u32, u64);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Other(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Other(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::Timestamp(Timestamp::Naive(v))
    }
}

impl From<DateTime<Tz>> for Value {
    fn from(v: DateTime<Tz>) -> Self {
        Value::Timestamp(Timestamp::Zoned(v))
    }
}

impl From<DateTime<chrono::Utc>> for Value {
    fn from(v: DateTime<chrono::Utc>) -> Self {
        Value::Timestamp(Timestamp::Zoned(v.with_timezone(&Tz::UTC)))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Sequence(v.into_iter().map(Into::into).collect())
    }
}
