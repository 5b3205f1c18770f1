use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};

// ---------------------------------------------------------------------------
// Flexible time values
// ---------------------------------------------------------------------------

/// Document fields whose values may be written either as integer seconds or as
/// a compact unit string ("90", "5m", "1h30m10s").
pub const TIME_FIELDS: &[&str] = &[
    "seconds",
    "minSeconds",
    "maxSeconds",
    "defaultSeconds",
    "optimalSeconds",
    "offsetSeconds",
    "bufferSeconds",
];

/// Parse a time string with optional `h`/`m`/`s` units into whole seconds.
///
/// Bare digits are seconds. Unit components may appear in any subset
/// ("1h", "5m", "1h30m10s"). Characters outside digits and units are
/// skipped. Strings with no recognizable component fall back to a plain
/// numeric parse; anything unparseable yields `0`.
pub fn parse_time_str(raw: &str) -> u64 {
    let s = raw.trim();
    if s.is_empty() {
        return 0;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().unwrap_or(0);
    }

    let mut total: u64 = 0;
    let mut current = String::new();
    let mut matched = false;
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if matches!(ch, 'h' | 'm' | 's') {
            if !current.is_empty() {
                let value: u64 = current.parse().unwrap_or(0);
                total += match ch {
                    'h' => value * 3600,
                    'm' => value * 60,
                    _ => value,
                };
                matched = true;
                current.clear();
            }
        }
    }

    if !matched {
        return s.parse::<f64>().map(|f| f.max(0.0) as u64).unwrap_or(0);
    }
    total
}

/// Parse any JSON value in a time position into whole seconds.
pub fn parse_time_value(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u
            } else {
                n.as_f64().map(|f| f.max(0.0) as u64).unwrap_or(0)
            }
        }
        serde_json::Value::String(s) => parse_time_str(s),
        _ => 0,
    }
}

/// Recursively rewrite every known time field (and string-valued `duration`
/// shorthands) in a raw document to integer seconds, so the typed model can
/// declare them as plain integers. Applying this twice equals applying it once.
pub fn normalize_time_fields(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let is_time_field = TIME_FIELDS.contains(&key.as_str())
                    || (key == "duration" && (entry.is_string() || entry.is_f64()));
                if is_time_field && !entry.is_object() && !entry.is_array() {
                    *entry = serde_json::Value::from(parse_time_value(entry));
                } else {
                    normalize_time_fields(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                normalize_time_fields(item);
            }
        }
        _ => {}
    }
}

/// Serde helper for struct fields (track stagger) that accept either an
/// integer or a unit string.
pub fn flexible_seconds<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(deserializer)?;
    Ok(parse_time_value(&raw))
}

// ---------------------------------------------------------------------------
// Wall-clock parsing (absolute triggers)
// ---------------------------------------------------------------------------

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d",
];

/// Parse an ISO 8601-ish datetime string into epoch seconds.
/// Trailing `Z` and `±HH:MM` offsets are stripped before naive parsing.
pub fn parse_wall_time(raw: &str) -> Option<f64> {
    let s = raw.trim().trim_end_matches('Z');
    let s = if let Some(pos) = s.rfind('+') {
        if pos > 10 {
            &s[..pos]
        } else {
            s
        }
    } else {
        s
    };
    let s = if s.len() > 19 && s.chars().nth(19) == Some('-') {
        &s[..19]
    } else {
        s
    };

    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp() as f64);
        }
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return d
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp() as f64);
    }
    None
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// How long a step runs once admitted.
#[derive(Debug, Clone, PartialEq)]
pub enum Duration {
    /// Runs for exactly `seconds`, then auto-completes.
    Fixed { seconds: u64 },
    /// Runs for `default` seconds unless manually completed (no earlier than
    /// `min`). `trigger_name` names the manual-completion trigger.
    Variable {
        min_seconds: u64,
        max_seconds: u64,
        default_seconds: u64,
        trigger_name: Option<String>,
    },
    /// Never auto-completes; `default` is a display estimate only.
    Indefinite {
        min_seconds: u64,
        default_seconds: u64,
        trigger_name: Option<String>,
    },
}

impl Duration {
    /// The duration used for planning and for the default-based expected end.
    pub fn planned(&self) -> u64 {
        match self {
            Duration::Fixed { seconds } => *seconds,
            Duration::Variable {
                default_seconds, ..
            } => *default_seconds,
            Duration::Indefinite {
                default_seconds, ..
            } => *default_seconds,
        }
    }

    /// Best-case duration for contention analysis.
    pub fn minimum(&self) -> u64 {
        match self {
            Duration::Fixed { seconds } => *seconds,
            Duration::Variable { min_seconds, .. } => *min_seconds,
            Duration::Indefinite { min_seconds, .. } => *min_seconds,
        }
    }

    /// Worst-case duration for contention analysis. Indefinite steps are
    /// open-ended, represented as `u64::MAX`; callers use saturating math.
    pub fn maximum(&self) -> u64 {
        match self {
            Duration::Fixed { seconds } => *seconds,
            Duration::Variable { max_seconds, .. } => *max_seconds,
            Duration::Indefinite { .. } => u64::MAX,
        }
    }

    pub fn manual_trigger(&self) -> Option<&str> {
        match self {
            Duration::Fixed { .. } => None,
            Duration::Variable { trigger_name, .. }
            | Duration::Indefinite { trigger_name, .. } => trigger_name.as_deref(),
        }
    }

    pub fn is_indefinite(&self) -> bool {
        matches!(self, Duration::Indefinite { .. })
    }
}

/// Wire shape for durations. Documents may write a bare number of seconds or
/// a typed object; `"manual"` is an accepted alias for `"indefinite"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum DurationSpec {
    Seconds(u64),
    Detailed(DetailedDuration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum DetailedDuration {
    #[serde(rename_all = "camelCase")]
    Fixed { seconds: u64 },
    #[serde(rename_all = "camelCase")]
    Variable {
        min_seconds: u64,
        max_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        optimal_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_name: Option<String>,
    },
    #[serde(alias = "manual")]
    #[serde(rename_all = "camelCase")]
    Indefinite {
        #[serde(default)]
        min_seconds: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_seconds: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger_name: Option<String>,
    },
}

impl From<DurationSpec> for Duration {
    fn from(spec: DurationSpec) -> Self {
        match spec {
            DurationSpec::Seconds(seconds) => Duration::Fixed { seconds },
            DurationSpec::Detailed(DetailedDuration::Fixed { seconds }) => {
                Duration::Fixed { seconds }
            }
            DurationSpec::Detailed(DetailedDuration::Variable {
                min_seconds,
                max_seconds,
                default_seconds,
                optimal_seconds,
                trigger_name,
            }) => Duration::Variable {
                min_seconds,
                max_seconds,
                default_seconds: default_seconds
                    .or(optimal_seconds)
                    .unwrap_or((min_seconds + max_seconds) / 2),
                trigger_name,
            },
            DurationSpec::Detailed(DetailedDuration::Indefinite {
                min_seconds,
                default_seconds,
                trigger_name,
            }) => Duration::Indefinite {
                min_seconds,
                default_seconds: default_seconds.unwrap_or(min_seconds + 60),
                trigger_name,
            },
        }
    }
}

impl From<&Duration> for DetailedDuration {
    fn from(duration: &Duration) -> Self {
        match duration {
            Duration::Fixed { seconds } => DetailedDuration::Fixed { seconds: *seconds },
            Duration::Variable {
                min_seconds,
                max_seconds,
                default_seconds,
                trigger_name,
            } => DetailedDuration::Variable {
                min_seconds: *min_seconds,
                max_seconds: *max_seconds,
                default_seconds: Some(*default_seconds),
                optimal_seconds: None,
                trigger_name: trigger_name.clone(),
            },
            Duration::Indefinite {
                min_seconds,
                default_seconds,
                trigger_name,
            } => DetailedDuration::Indefinite {
                min_seconds: *min_seconds,
                default_seconds: Some(*default_seconds),
                trigger_name: trigger_name.clone(),
            },
        }
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        DurationSpec::deserialize(deserializer).map(Duration::from)
    }
}

impl Serialize for Duration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        DetailedDuration::from(self).serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
