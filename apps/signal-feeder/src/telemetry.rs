use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

pub const MEASUREMENT: &str = "weather";
pub const TEMPERATURE_FIELD: &str = "temperature";

/// Tag and field maps are ordered by key so a point always flattens to the same line.
pub type TagSet = BTreeMap<String, String>;
pub type FieldSet = BTreeMap<String, String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetricError {
    #[error("metric `{measurement}` has no fields")]
    NoFields { measurement: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LineParseError {
    #[error("expected 3 space-separated sections, found {0}")]
    Sections(usize),
    #[error("line has no measurement name")]
    MissingMeasurement,
    #[error("malformed key=value pair `{0}`")]
    Pair(String),
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
    #[error(transparent)]
    Metric(#[from] MetricError),
}

/// One point for the line-protocol write endpoint:
/// `<measurement>,<tags> <fields> <timestamp_ms>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    measurement: String,
    tags: Arc<TagSet>,
    fields: FieldSet,
    timestamp_ms: i64,
}

impl Metric {
    pub fn new(
        measurement: impl Into<String>,
        tags: Arc<TagSet>,
        fields: FieldSet,
        timestamp_ms: i64,
    ) -> Result<Self, MetricError> {
        let measurement = measurement.into();
        if fields.is_empty() {
            return Err(MetricError::NoFields { measurement });
        }
        Ok(Self {
            measurement,
            tags,
            fields,
            timestamp_ms,
        })
    }

    /// Builds a point carrying exactly one field, which can never be empty.
    pub fn with_field(
        measurement: impl Into<String>,
        tags: Arc<TagSet>,
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        let mut fields = FieldSet::new();
        fields.insert(key.into(), value.into());
        Self {
            measurement: measurement.into(),
            tags,
            fields,
            timestamp_ms,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Renders the point as a single line-protocol line without a trailing newline.
    pub fn flatten(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The comma after the measurement is kept even with no tags.
        write_escaped(f, &self.measurement, MEASUREMENT_SPECIALS)?;
        f.write_char(',')?;
        write_pairs(f, &self.tags)?;
        f.write_char(' ')?;
        write_pairs(f, &self.fields)?;
        write!(f, " {}", self.timestamp_ms)
    }
}

const MEASUREMENT_SPECIALS: &[char] = &[',', ' ', '\\'];
const PAIR_SPECIALS: &[char] = &[',', '=', ' ', '\\'];

fn write_escaped(f: &mut fmt::Formatter<'_>, raw: &str, specials: &[char]) -> fmt::Result {
    for ch in raw.chars() {
        if specials.contains(&ch) {
            f.write_char('\\')?;
        }
        f.write_char(ch)?;
    }
    Ok(())
}

fn write_pairs(f: &mut fmt::Formatter<'_>, pairs: &BTreeMap<String, String>) -> fmt::Result {
    for (idx, (key, value)) in pairs.iter().enumerate() {
        if idx > 0 {
            f.write_char(',')?;
        }
        write_escaped(f, key, PAIR_SPECIALS)?;
        f.write_char('=')?;
        write_escaped(f, value, PAIR_SPECIALS)?;
    }
    Ok(())
}

impl FromStr for Metric {
    type Err = LineParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let sections = split_unescaped(line, ' ');
        let [head, fields, timestamp] = sections[..] else {
            return Err(LineParseError::Sections(sections.len()));
        };

        let (measurement, tags) = split_once_unescaped(head, ',').unwrap_or((head, ""));
        if measurement.is_empty() {
            return Err(LineParseError::MissingMeasurement);
        }
        let tags = parse_pairs(tags)?;
        let fields = parse_pairs(fields)?;
        let timestamp_ms = timestamp
            .parse::<i64>()
            .map_err(|_| LineParseError::Timestamp(timestamp.to_string()))?;

        Ok(Metric::new(
            unescape(measurement),
            Arc::new(tags),
            fields,
            timestamp_ms,
        )?)
    }
}

fn parse_pairs(section: &str) -> Result<BTreeMap<String, String>, LineParseError> {
    let mut pairs = BTreeMap::new();
    if section.is_empty() {
        return Ok(pairs);
    }
    for raw in split_unescaped(section, ',') {
        match split_once_unescaped(raw, '=') {
            Some((key, value)) if !key.is_empty() => {
                pairs.insert(unescape(key), unescape(value));
            }
            _ => return Err(LineParseError::Pair(raw.to_string())),
        }
    }
    Ok(pairs)
}

/// Byte offsets of `delim` occurrences not preceded by a backslash escape.
fn unescaped_positions(raw: &str, delim: char) -> impl Iterator<Item = usize> + '_ {
    let mut escaped = false;
    raw.char_indices().filter_map(move |(idx, ch)| {
        if escaped {
            escaped = false;
            None
        } else if ch == '\\' {
            escaped = true;
            None
        } else if ch == delim {
            Some(idx)
        } else {
            None
        }
    })
}

fn split_unescaped(raw: &str, delim: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for idx in unescaped_positions(raw, delim) {
        parts.push(&raw[start..idx]);
        start = idx + delim.len_utf8();
    }
    parts.push(&raw[start..]);
    parts
}

fn split_once_unescaped(raw: &str, delim: char) -> Option<(&str, &str)> {
    let idx = unescaped_positions(raw, delim).next()?;
    Some((&raw[..idx], &raw[idx + delim.len_utf8()..]))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => out.push(chars.next().unwrap_or('\\')),
            other => out.push(other),
        }
    }
    out
}
