// k8see-event: Kubernetes event records as carried on the event stream.
//
// A stream entry is a flat map of field names to byte strings.  The exporter
// writes timestamps in the `2006-01-02 15:04:05 -0700 MST` layout, so the
// numeric offset is authoritative and the trailing zone name is informational.

use chrono::{DateTime, FixedOffset};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Field names
// ---------------------------------------------------------------------------

pub const EVENT_TIME: &str = "eventTime";
pub const FIRST_TIME: &str = "firstTime";
pub const EXPORTED_TIME: &str = "exportedTime";
pub const NAME: &str = "name";
pub const REASON: &str = "reason";
pub const TYPE: &str = "type";
pub const MESSAGE: &str = "message";
pub const NAMESPACE: &str = "namespace";

/// Timestamp layout without the trailing zone name; fractional seconds optional.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// Raw field map of a single stream entry.
pub type Fields = HashMap<String, Vec<u8>>;

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// One imported Kubernetes event.
///
/// Optional fields that were absent from the stream entry are empty strings,
/// which is also how they are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_time: DateTime<FixedOffset>,
    pub first_time: DateTime<FixedOffset>,
    /// When the exporter emitted the record; drives retention.
    pub exported_time: DateTime<FixedOffset>,
    pub name: String,
    pub reason: String,
    pub event_type: String,
    pub message: String,
    pub namespace: String,
}

/// Why a stream entry could not become an [`EventRecord`].
///
/// Every variant is permanent: redelivering the same entry fails the same way.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing field {0}")]
    Missing(&'static str),
    #[error("field {0} is not a string")]
    NotText(&'static str),
    #[error("field {field} is not a timestamp: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("empty name")]
    EmptyName,
}

impl EventRecord {
    /// Parse and validate the fields of one stream entry.
    pub fn from_fields(fields: &Fields) -> Result<Self, ParseError> {
        let event_time = required_timestamp(fields, EVENT_TIME)?;
        let first_time = required_timestamp(fields, FIRST_TIME)?;
        let exported_time = required_timestamp(fields, EXPORTED_TIME)?;
        let name = required_text(fields, NAME)?;
        if name.is_empty() {
            return Err(ParseError::EmptyName);
        }

        Ok(EventRecord {
            event_time,
            first_time,
            exported_time,
            name: name.to_owned(),
            reason: optional_text(fields, REASON),
            event_type: optional_text(fields, TYPE),
            message: optional_text(fields, MESSAGE),
            namespace: optional_text(fields, NAMESPACE),
        })
    }

    /// Render back into the stream field layout.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        for (key, value) in [
            (EVENT_TIME, format_timestamp(&self.event_time)),
            (FIRST_TIME, format_timestamp(&self.first_time)),
            (EXPORTED_TIME, format_timestamp(&self.exported_time)),
            (NAME, self.name.clone()),
            (REASON, self.reason.clone()),
            (TYPE, self.event_type.clone()),
            (MESSAGE, self.message.clone()),
            (NAMESPACE, self.namespace.clone()),
        ] {
            fields.insert(key.to_owned(), value.into_bytes());
        }
        fields
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Parse an exporter timestamp such as `2024-01-01 10:00:00 +0000 UTC`.
///
/// The zone name may be omitted; anything after it is rejected.
pub fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    let (parsed, rest) =
        DateTime::<FixedOffset>::parse_and_remainder(value, TIMESTAMP_FORMAT).ok()?;
    match rest.strip_prefix(' ') {
        None if rest.is_empty() => Some(parsed),
        Some(zone) if !zone.is_empty() && !zone.contains(char::is_whitespace) => Some(parsed),
        _ => None,
    }
}

/// Format a timestamp in the exporter layout.  The zone name is emitted only
/// for UTC, since a fixed offset carries no abbreviation.
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    let base = ts.format(TIMESTAMP_FORMAT).to_string();
    if ts.offset().local_minus_utc() == 0 {
        format!("{base} UTC")
    } else {
        base
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn required_text<'a>(fields: &'a Fields, key: &'static str) -> Result<&'a str, ParseError> {
    let raw = fields.get(key).ok_or(ParseError::Missing(key))?;
    std::str::from_utf8(raw).map_err(|_| ParseError::NotText(key))
}

fn required_timestamp(
    fields: &Fields,
    key: &'static str,
) -> Result<DateTime<FixedOffset>, ParseError> {
    let text = required_text(fields, key)?;
    parse_timestamp(text).ok_or_else(|| ParseError::InvalidTimestamp {
        field: key,
        value: text.to_owned(),
    })
}

fn optional_text(fields: &Fields, key: &str) -> String {
    fields
        .get(key)
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .unwrap_or_default()
        .to_owned()
}
