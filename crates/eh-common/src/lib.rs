use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Properties
// ============================================================================

/// Well-known system property names
pub mod system_properties {
    pub const MESSAGE_ID: &str = "messageId";
    pub const CORRELATION_ID: &str = "correlationId";
    pub const USER_ID: &str = "userId";
    pub const CONNECTION_DEVICE_ID: &str = "connectionDeviceId";
    pub const CONNECTION_MODULE_ID: &str = "connectionModuleId";
    pub const CONTENT_TYPE: &str = "contentType";
    pub const CONTENT_ENCODING: &str = "contentEncoding";
    pub const ENQUEUED_TIME: &str = "enqueuedTime";
    pub const OUTPUT_NAME: &str = "outputName";
}

/// String map with case-insensitive keys.
///
/// The first spelling of a key is kept for display and serialization;
/// lookups and equality ignore case.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Properties {
    entries: BTreeMap<String, (String, String)>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value for the same key (any casing)
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let key = key.into();
        let folded = key.to_lowercase();
        let value = value.into();
        match self.entries.get_mut(&folded) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                self.entries.insert(folded, (key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_lowercase())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate as (original key, value)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl PartialEq for Properties {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((k1, (_, v1)), (k2, (_, v2)))| k1 == k2 && v1 == v2)
    }
}

impl Eq for Properties {}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut properties = Properties::new();
        for (key, value) in iter {
            properties.insert(key, value);
        }
        properties
    }
}

impl From<BTreeMap<String, String>> for Properties {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<HashMap<String, String>> for Properties {
    fn from(map: HashMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<Properties> for BTreeMap<String, String> {
    fn from(properties: Properties) -> Self {
        properties.entries.into_values().collect()
    }
}

// ============================================================================
// Message Source
// ============================================================================

/// Hierarchical, slash-delimited origin of a message (`/messages`, `/twinChangeNotifications`, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageSource {
    path: Cow<'static, str>,
}

impl MessageSource {
    /// Device and module telemetry
    pub const TELEMETRY: MessageSource = MessageSource {
        path: Cow::Borrowed("/messages"),
    };

    /// Twin change notifications raised by the hub
    pub const TWIN_CHANGE_NOTIFICATIONS: MessageSource = MessageSource {
        path: Cow::Borrowed("/twinChangeNotifications"),
    };

    /// Parse a source path. A trailing `/*` selects the parent path and everything under it.
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        if !trimmed.starts_with('/') {
            return Err(CommonError::InvalidSource(format!(
                "'{}' must start with '/'",
                path
            )));
        }

        let without_wildcard = trimmed.strip_suffix("/*").unwrap_or(trimmed);
        let normalized = without_wildcard.trim_end_matches('/');
        if normalized.is_empty() {
            return Err(CommonError::InvalidSource(format!("'{}' has no segments", path)));
        }

        for segment in normalized[1..].split('/') {
            if segment.is_empty() {
                return Err(CommonError::InvalidSource(format!(
                    "'{}' contains an empty segment",
                    path
                )));
            }
            if segment.contains('*') {
                return Err(CommonError::InvalidSource(format!(
                    "'{}' may only use '*' as its final segment",
                    path
                )));
            }
        }

        Ok(Self {
            path: Cow::Owned(normalized.to_string()),
        })
    }

    /// `/messages/modules/{module}/outputs/{output}`
    pub fn module_output(module_id: &str, output_name: &str) -> Self {
        Self {
            path: Cow::Owned(format!("/messages/modules/{}/outputs/{}", module_id, output_name)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// True iff `other` is this source or nested under it, compared segment by segment.
    ///
    /// `/messages` matches `/messages` and `/messages/modules/m1/outputs/o1`,
    /// but not `/messagesExtra`.
    pub fn matches(&self, other: &MessageSource) -> bool {
        match other.path.strip_prefix(&*self.path) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn is_twin_change_notification(&self) -> bool {
        Self::TWIN_CHANGE_NOTIFICATIONS.matches(self)
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl Serialize for MessageSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.path)
    }
}

impl<'de> Deserialize<'de> for MessageSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        MessageSource::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Core Message Type
// ============================================================================

/// Immutable message envelope flowing from a source through the router to endpoints
#[derive(Debug, Clone)]
pub struct Message {
    source: MessageSource,
    body: Bytes,
    properties: Properties,
    system_properties: Properties,
    /// Position in the ingesting source's stream; 0 until the source assigns one
    offset: i64,
    enqueued_time: DateTime<Utc>,
}

impl Message {
    pub fn new(source: MessageSource, body: impl Into<Bytes>) -> Self {
        Self::builder(source, body).build()
    }

    pub fn builder(source: MessageSource, body: impl Into<Bytes>) -> MessageBuilder {
        MessageBuilder {
            source,
            body: body.into(),
            properties: Properties::new(),
            system_properties: Properties::new(),
            offset: 0,
            enqueued_time: None,
        }
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn system_properties(&self) -> &Properties {
        &self.system_properties
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn enqueued_time(&self) -> DateTime<Utc> {
        self.enqueued_time
    }

    /// Copy of this message stamped with a stream offset
    pub fn with_offset(&self, offset: i64) -> Message {
        Message {
            offset,
            ..self.clone()
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.system_properties.get(system_properties::MESSAGE_ID)
    }
}

/// Equality covers body and both property maps; offset, time and source are bookkeeping.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
            && self.properties == other.properties
            && self.system_properties == other.system_properties
    }
}

impl Eq for Message {}

pub struct MessageBuilder {
    source: MessageSource,
    body: Bytes,
    properties: Properties,
    system_properties: Properties,
    offset: i64,
    enqueued_time: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    pub fn properties(mut self, properties: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in properties {
            self.properties.insert(key, value);
        }
        self
    }

    pub fn system_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.system_properties.insert(key, value);
        self
    }

    pub fn system_properties(mut self, properties: impl IntoIterator<Item = (String, String)>) -> Self {
        for (key, value) in properties {
            self.system_properties.insert(key, value);
        }
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn enqueued_time(mut self, time: DateTime<Utc>) -> Self {
        self.enqueued_time = Some(time);
        self
    }

    pub fn build(self) -> Message {
        Message {
            source: self.source,
            body: self.body,
            properties: self.properties,
            system_properties: self.system_properties,
            offset: self.offset,
            enqueued_time: self.enqueued_time.unwrap_or_else(Utc::now),
        }
    }
}

// ============================================================================
// Checkpoint Types
// ============================================================================

/// Earliest timestamp a checkpoint will record. Earlier values are raised to it.
pub fn checkpoint_time_floor() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn clamp_time(time: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    time.map(|t| t.max(checkpoint_time_floor()))
}

/// Durable delivery progress of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CheckpointRecord", into = "CheckpointRecord")]
pub struct CheckpointData {
    offset: i64,
    last_failed_revival_time: Option<DateTime<Utc>>,
    unhealthy_since: Option<DateTime<Utc>>,
}

impl CheckpointData {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            last_failed_revival_time: None,
            unhealthy_since: None,
        }
    }

    pub fn with_health(
        offset: i64,
        last_failed_revival_time: Option<DateTime<Utc>>,
        unhealthy_since: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            offset,
            last_failed_revival_time: clamp_time(last_failed_revival_time),
            unhealthy_since: clamp_time(unhealthy_since),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn last_failed_revival_time(&self) -> Option<DateTime<Utc>> {
        self.last_failed_revival_time
    }

    pub fn unhealthy_since(&self) -> Option<DateTime<Utc>> {
        self.unhealthy_since
    }

    /// Same health timestamps, new offset
    pub fn with_offset(&self, offset: i64) -> Self {
        Self { offset, ..*self }
    }
}

impl Default for CheckpointData {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckpointRecord {
    offset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_failed_revival_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unhealthy_since: Option<DateTime<Utc>>,
}

impl From<CheckpointRecord> for CheckpointData {
    fn from(record: CheckpointRecord) -> Self {
        CheckpointData::with_health(record.offset, record.last_failed_revival_time, record.unhealthy_since)
    }
}

impl From<CheckpointData> for CheckpointRecord {
    fn from(data: CheckpointData) -> Self {
        Self {
            offset: data.offset,
            last_failed_revival_time: data.last_failed_revival_time,
            unhealthy_since: data.unhealthy_since,
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

fn default_condition() -> String {
    "true".to_string()
}

/// One route as delivered by the configuration subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteSpec {
    /// `{ "name", "source", "condition", "endpoints" }`
    Structured {
        name: String,
        source: String,
        #[serde(default = "default_condition")]
        condition: String,
        endpoints: Vec<String>,
    },
    /// `{ "name", "statement": "FROM /messages/* WHERE ... INTO ep1, ep2" }`
    Statement { name: String, statement: String },
}

impl RouteSpec {
    pub fn name(&self) -> &str {
        match self {
            RouteSpec::Structured { name, .. } | RouteSpec::Statement { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EndpointKind {
    /// POST each message body to `url`
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Accept and discard
    Null,
}

/// `{ "id", "url" }` is an HTTP endpoint; `kind` only needs to be spelled out
/// for other endpoint types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEndpointSpec")]
pub struct EndpointSpec {
    pub id: String,
    #[serde(flatten)]
    pub kind: EndpointKind,
}

#[derive(Deserialize)]
struct RawEndpointSpec {
    id: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

impl TryFrom<RawEndpointSpec> for EndpointSpec {
    type Error = String;

    fn try_from(raw: RawEndpointSpec) -> std::result::Result<Self, Self::Error> {
        let kind = match raw.kind.as_deref().unwrap_or("http") {
            "http" => EndpointKind::Http {
                url: raw
                    .url
                    .ok_or_else(|| format!("endpoint '{}' has no url", raw.id))?,
                headers: raw.headers,
                timeout_ms: raw.timeout_ms,
            },
            "null" => EndpointKind::Null,
            other => return Err(format!("endpoint '{}' has unknown kind '{}'", raw.id, other)),
        };
        Ok(Self { id: raw.id, kind })
    }
}

/// Complete routing configuration; always applied as one snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
}

impl RouterConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("Invalid message source: {0}")]
    InvalidSource(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CommonError>;
