//! Distributed trace context.
//!
//! Two formats carry trace context between services: W3C trace context headers (`traceparent` and `tracestate`), and
//! the older JSON payload. Only the trace identifier and the remote sampled flag feed into sampling decisions; the
//! rest is identity carried along for the backend.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt as _, Snafu};

/// Name of the W3C header carrying the trace parent.
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Name of the W3C header carrying vendor-specific trace state.
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Major and minor version of the JSON payload format produced.
pub const PAYLOAD_VERSION: [u32; 2] = [0, 1];

const MAX_TRACESTATE_ENTRIES: usize = 32;

/// A distributed trace error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PayloadError {
    /// The payload could not be converted from or to JSON of the expected shape.
    #[snafu(display("Invalid distributed trace payload JSON: {}", source))]
    Json {
        /// Error source.
        source: serde_json::Error,
    },

    /// The payload's major version is not supported.
    #[snafu(display("Unsupported distributed trace payload version {}.{}.", major, minor))]
    UnsupportedVersion {
        /// Major version.
        major: u32,

        /// Minor version.
        minor: u32,
    },

    /// A required payload field was missing or empty.
    #[snafu(display("Distributed trace payload is missing required field '{}'.", field))]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },

    /// A `traceparent` header was malformed.
    #[snafu(display("Invalid traceparent '{}'.", value))]
    InvalidTraceparent {
        /// The rejected header value.
        value: String,
    },

    /// A payload came from an account that is not trusted.
    #[snafu(display("Distributed trace payload from untrusted account '{}'.", account))]
    UntrustedAccount {
        /// The payload's trusted account key, or its account when no key was sent.
        account: String,
    },
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_all_zeros(value: &str) -> bool {
    value.bytes().all(|b| b == b'0')
}

/// A parsed W3C `traceparent` header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Traceparent {
    version: u8,
    trace_id: String,
    parent_id: String,
    flags: u8,
}

impl Traceparent {
    const SAMPLED_FLAG: u8 = 0x01;

    /// Creates a version 00 traceparent.
    ///
    /// `trace_id` is expected to be 32 lowercase hex digits and `parent_id` 16.
    pub fn new<T, P>(trace_id: T, parent_id: P, sampled: bool) -> Self
    where
        T: Into<String>,
        P: Into<String>,
    {
        Self {
            version: 0,
            trace_id: trace_id.into(),
            parent_id: parent_id.into(),
            flags: if sampled { Self::SAMPLED_FLAG } else { 0 },
        }
    }

    /// Parses a `traceparent` header value.
    ///
    /// Version 00 headers must have exactly four fields. Later versions may append fields, which are ignored.
    ///
    /// # Errors
    ///
    /// If the header is malformed, uses the forbidden version `ff`, or carries an all-zero trace or parent identifier,
    /// an error is returned.
    pub fn parse(value: &str) -> Result<Self, PayloadError> {
        let invalid = || PayloadError::InvalidTraceparent {
            value: value.to_string(),
        };

        let fields: Vec<&str> = value.trim().split('-').collect();
        let [version, trace_id, parent_id, flags, rest @ ..] = fields.as_slice() else {
            return Err(invalid());
        };

        if !is_lower_hex(version, 2) || *version == "ff" {
            return Err(invalid());
        }
        let version = u8::from_str_radix(version, 16).map_err(|_| invalid())?;
        if version == 0 && !rest.is_empty() {
            return Err(invalid());
        }

        if !is_lower_hex(trace_id, 32) || is_all_zeros(trace_id) {
            return Err(invalid());
        }
        if !is_lower_hex(parent_id, 16) || is_all_zeros(parent_id) {
            return Err(invalid());
        }
        if !is_lower_hex(flags, 2) {
            return Err(invalid());
        }
        let flags = u8::from_str_radix(flags, 16).map_err(|_| invalid())?;

        Ok(Self {
            version,
            trace_id: trace_id.to_string(),
            parent_id: parent_id.to_string(),
            flags,
        })
    }

    /// Returns the format version.
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the trace identifier.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Returns the identifier of the remote parent span.
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Returns the trace flags.
    pub const fn flags(&self) -> u8 {
        self.flags
    }

    /// Returns `true` if the remote parent was sampled.
    pub const fn is_sampled(&self) -> bool {
        self.flags & Self::SAMPLED_FLAG != 0
    }
}

impl fmt::Display for Traceparent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{}-{}-{:02x}",
            self.version, self.trace_id, self.parent_id, self.flags
        )
    }
}

/// A W3C `tracestate` header.
///
/// The header is a list of `key=value` entries owned by different vendors. Entries are kept in order and otherwise
/// treated as opaque; malformed entries and entries past the 32nd are dropped.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tracestate {
    entries: Vec<(String, String)>,
}

impl Tracestate {
    /// Parses a `tracestate` header value.
    pub fn parse(value: &str) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();
        for member in value.split(',').map(str::trim).filter(|member| !member.is_empty()) {
            let Some((key, value)) = member.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() || entries.iter().any(|(existing, _)| existing == key) {
                continue;
            }
            entries.push((key.to_string(), value.to_string()));
            if entries.len() == MAX_TRACESTATE_ENTRIES {
                break;
            }
        }
        Self { entries }
    }

    /// Returns the value of a vendor's entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    /// Sets a vendor's entry, moving it to the front as the most recently updated one.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let key = key.into();
        self.entries.retain(|(existing, _)| *existing != key);
        self.entries.insert(0, (key, value.into()));
        self.entries.truncate(MAX_TRACESTATE_ENTRIES);
    }

    /// Returns the entries, in order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Returns `true` if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for Tracestate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}

/// W3C trace context headers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TraceContextHeaders {
    /// The `traceparent` header value.
    pub traceparent: Option<String>,

    /// The `tracestate` header value.
    pub tracestate: Option<String>,
}

impl TraceContextHeaders {
    /// Collects the trace context headers from a list of header name/value pairs.
    ///
    /// Header names are matched case-insensitively. Repeated `tracestate` headers are joined.
    pub fn from_pairs<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut collected = Self::default();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(TRACEPARENT_HEADER) {
                collected.traceparent = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(TRACESTATE_HEADER) {
                collected.tracestate = Some(match collected.tracestate.take() {
                    Some(existing) => format!("{},{}", existing, value),
                    None => value.to_string(),
                });
            }
        }
        collected
    }

    /// Returns the headers as name/value pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::with_capacity(2);
        if let Some(traceparent) = &self.traceparent {
            pairs.push((TRACEPARENT_HEADER, traceparent.as_str()));
        }
        if let Some(tracestate) = &self.tracestate {
            pairs.push((TRACESTATE_HEADER, tracestate.as_str()));
        }
        pairs
    }
}

/// The JSON distributed trace payload, as in `{"v":[0,1],"d":{...}}`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DistributedTracePayload {
    /// Major and minor format version.
    #[serde(rename = "v")]
    pub version: [u32; 2],

    /// Payload fields.
    #[serde(rename = "d")]
    pub data: PayloadData,
}

/// Fields of a [`DistributedTracePayload`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PayloadData {
    /// Type of the calling entity, usually `App`.
    #[serde(rename = "ty")]
    pub parent_type: String,

    /// Account of the caller.
    #[serde(rename = "ac")]
    pub account_id: String,

    /// Application of the caller.
    #[serde(rename = "ap")]
    pub application_id: String,

    /// Span identifier of the calling segment.
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,

    /// Transaction identifier of the caller.
    #[serde(rename = "tx", default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Trace identifier.
    #[serde(rename = "tr")]
    pub trace_id: String,

    /// Priority assigned by the caller.
    #[serde(rename = "pr", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,

    /// Whether the caller sampled the trace.
    #[serde(rename = "sa", default, skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,

    /// Creation time of the payload, in milliseconds since the Unix epoch.
    #[serde(rename = "ti")]
    pub timestamp: i64,

    /// Trusted account key, when it differs from the account.
    #[serde(rename = "tk", default, skip_serializing_if = "Option::is_none")]
    pub trusted_account_key: Option<String>,
}

impl DistributedTracePayload {
    /// Wraps payload fields with the current format version.
    pub fn new(data: PayloadData) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            data,
        }
    }

    /// Parses and validates a JSON payload.
    ///
    /// # Errors
    ///
    /// If the payload is not valid JSON, has a newer major version, or lacks a parent account, application, type,
    /// trace identifier, or both a span and a transaction identifier, an error is returned.
    pub fn parse(payload: &str) -> Result<Self, PayloadError> {
        let payload: Self = serde_json::from_str(payload).context(Json)?;
        payload.validate()?;
        Ok(payload)
    }

    fn validate(&self) -> Result<(), PayloadError> {
        let [major, minor] = self.version;
        if major > PAYLOAD_VERSION[0] {
            return Err(PayloadError::UnsupportedVersion { major, minor });
        }

        let data = &self.data;
        let required = [
            ("ty", data.parent_type.as_str()),
            ("ac", data.account_id.as_str()),
            ("ap", data.application_id.as_str()),
            ("tr", data.trace_id.as_str()),
        ];
        if let Some((field, _)) = required.into_iter().find(|(_, value)| value.is_empty()) {
            return Err(PayloadError::MissingField { field });
        }
        if data.span_id.is_none() && data.transaction_id.is_none() {
            return Err(PayloadError::MissingField { field: "id" });
        }
        Ok(())
    }

    /// Serializes the payload as JSON.
    ///
    /// # Errors
    ///
    /// If serialization fails, an error is returned.
    pub fn to_json(&self) -> Result<String, PayloadError> {
        serde_json::to_string(self).context(Json)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";

    #[test]
    fn traceparent_round_trips() {
        let header = format!("00-{}-00f067aa0ba902b7-01", TRACE_ID);
        let traceparent = Traceparent::parse(&header).unwrap();

        assert_eq!(traceparent.version(), 0);
        assert_eq!(traceparent.trace_id(), TRACE_ID);
        assert_eq!(traceparent.parent_id(), "00f067aa0ba902b7");
        assert!(traceparent.is_sampled());
        assert_eq!(traceparent.to_string(), header);

        let unsampled = Traceparent::new(TRACE_ID, "00f067aa0ba902b7", false);
        assert!(!unsampled.is_sampled());
        assert_eq!(unsampled.to_string(), format!("00-{}-00f067aa0ba902b7-00", TRACE_ID));
    }

    #[test]
    fn flags_other_than_sampled_are_ignored() {
        let traceparent = Traceparent::parse(&format!("00-{}-00f067aa0ba902b7-02", TRACE_ID)).unwrap();
        assert!(!traceparent.is_sampled());
        assert_eq!(traceparent.flags(), 2);
    }

    #[test]
    fn future_versions_may_append_fields() {
        let traceparent = Traceparent::parse(&format!("01-{}-00f067aa0ba902b7-01-extra", TRACE_ID)).unwrap();
        assert_eq!(traceparent.version(), 1);
        assert!(traceparent.is_sampled());
    }

    #[test]
    fn malformed_traceparents_are_rejected() {
        for header in [
            String::new(),
            "garbage".to_string(),
            format!("ff-{}-00f067aa0ba902b7-01", TRACE_ID),
            format!("00-{}-00f067aa0ba902b7-01-extra", TRACE_ID),
            format!("00-{}-00f067aa0ba902b7-01", "0".repeat(32)),
            format!("00-{}-0000000000000000-01", TRACE_ID),
            format!("00-{}-00f067aa0ba902b7-01", TRACE_ID.to_uppercase()),
            format!("00-{}-00f067aa0ba902b7-1", TRACE_ID),
            "00-abc-00f067aa0ba902b7-01".to_string(),
        ] {
            assert!(
                matches!(Traceparent::parse(&header), Err(PayloadError::InvalidTraceparent { .. })),
                "accepted '{}'",
                header
            );
        }
    }

    #[test]
    fn tracestate_entries() {
        let mut tracestate = Tracestate::parse("rojo=00f067aa0ba902b7, congo=t61rcWkgMzE,,bogus, rojo=dup");
        assert_eq!(tracestate.get("rojo"), Some("00f067aa0ba902b7"));
        assert_eq!(tracestate.get("congo"), Some("t61rcWkgMzE"));
        assert_eq!(tracestate.get("bogus"), None);
        assert_eq!(tracestate.to_string(), "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE");

        tracestate.insert("congo", "updated");
        assert_eq!(tracestate.to_string(), "congo=updated,rojo=00f067aa0ba902b7");
    }

    #[test]
    fn tracestate_is_bounded() {
        let header: Vec<String> = (0..40).map(|i| format!("k{}=v", i)).collect();
        let tracestate = Tracestate::parse(&header.join(","));
        assert_eq!(tracestate.entries().count(), MAX_TRACESTATE_ENTRIES);
        assert!(Tracestate::parse("").is_empty());
    }

    #[test]
    fn headers_from_pairs() {
        let headers = TraceContextHeaders::from_pairs([
            ("TraceParent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            ("tracestate", "a=1"),
            ("content-type", "text/plain"),
            ("Tracestate", "b=2"),
        ]);

        assert_eq!(
            headers.traceparent.as_deref(),
            Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
        );
        assert_eq!(headers.tracestate.as_deref(), Some("a=1,b=2"));
        assert_eq!(headers.to_pairs().len(), 2);
    }

    #[test]
    fn payload_parses() {
        let raw = json!({
            "v": [0, 1],
            "d": {
                "ty": "App",
                "ac": "33",
                "ap": "2827902",
                "id": "7d3efb1b173fecfa",
                "tx": "e8b91a159289ff74",
                "tr": TRACE_ID,
                "pr": 1.234567,
                "sa": true,
                "ti": 1518469636035_i64,
            }
        })
        .to_string();

        let payload = DistributedTracePayload::parse(&raw).unwrap();
        assert_eq!(payload.data.trace_id, TRACE_ID);
        assert_eq!(payload.data.sampled, Some(true));
        assert_eq!(payload.data.priority, Some(1.234567));
        assert_eq!(payload.data.trusted_account_key, None);

        let reparsed = DistributedTracePayload::parse(&payload.to_json().unwrap()).unwrap();
        assert_eq!(reparsed, payload);
    }

    #[test]
    fn payload_rejections() {
        assert!(matches!(
            DistributedTracePayload::parse("{not json"),
            Err(PayloadError::Json { .. })
        ));

        let newer = json!({ "v": [1, 0], "d": { "ty": "App", "ac": "1", "ap": "2", "id": "3", "tr": "4", "ti": 0 } });
        assert!(matches!(
            DistributedTracePayload::parse(&newer.to_string()),
            Err(PayloadError::UnsupportedVersion { major: 1, minor: 0 })
        ));

        let no_trace = json!({ "v": [0, 1], "d": { "ty": "App", "ac": "1", "ap": "2", "id": "3", "tr": "", "ti": 0 } });
        assert!(matches!(
            DistributedTracePayload::parse(&no_trace.to_string()),
            Err(PayloadError::MissingField { field: "tr" })
        ));

        let no_ids = json!({ "v": [0, 1], "d": { "ty": "App", "ac": "1", "ap": "2", "tr": "4", "ti": 0 } });
        assert!(matches!(
            DistributedTracePayload::parse(&no_ids.to_string()),
            Err(PayloadError::MissingField { field: "id" })
        ));
    }
}
