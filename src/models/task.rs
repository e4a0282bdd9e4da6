use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use strum::Display;
use uuid::Uuid;

/// Highest priority level accepted by the broker.
pub const MAX_PRIORITY: u8 = 9;

/// Priority used when a caller does not ask for one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Opaque task identifier, generated at submission and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminator for how `image_data` is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ImageType {
    Bytes,
    Url,
}

/// Image handed to the detection model.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    Url(String),
}

impl ImageSource {
    pub fn image_type(&self) -> ImageType {
        match self {
            ImageSource::Bytes(_) => ImageType::Bytes,
            ImageSource::Url(_) => ImageType::Url,
        }
    }

    /// Transport-safe text form: base64 for raw bytes, the URL unchanged.
    pub fn encode(&self) -> String {
        match self {
            ImageSource::Bytes(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
            ImageSource::Url(url) => url.clone(),
        }
    }

    pub fn decode(image_type: ImageType, data: &str) -> Result<Self, base64::DecodeError> {
        match image_type {
            ImageType::Bytes => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map(ImageSource::Bytes),
            ImageType::Url => Ok(ImageSource::Url(data.to_string())),
        }
    }
}

/// Text prompts for detection. Keeps the caller's shape (single string or list)
/// so the wire format matches what was submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextQueries {
    Single(String),
    Many(Vec<String>),
}

impl TextQueries {
    pub fn as_slice(&self) -> &[String] {
        match self {
            TextQueries::Single(q) => std::slice::from_ref(q),
            TextQueries::Many(qs) => qs,
        }
    }

    /// True when no non-blank query is present.
    pub fn is_blank(&self) -> bool {
        self.as_slice().iter().all(|q| q.trim().is_empty())
    }

    /// Comma-joined form used by the detection backend's form fields.
    pub fn joined(&self) -> String {
        self.as_slice().join(",")
    }
}

impl From<&str> for TextQueries {
    fn from(value: &str) -> Self {
        TextQueries::Single(value.to_string())
    }
}

impl From<Vec<String>> for TextQueries {
    fn from(value: Vec<String>) -> Self {
        TextQueries::Many(value)
    }
}

/// Clamp a requested priority into the broker's supported range.
pub fn clamp_priority(priority: i64) -> u8 {
    priority.clamp(0, MAX_PRIORITY as i64) as u8
}

/// Accept any integer priority on the wire and clamp it into range.
fn deserialize_priority<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    i64::deserialize(deserializer).map(clamp_priority)
}

/// Accept RFC 3339 timestamps as well as offset-less ISO-8601 ones, which are
/// read as UTC.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(err) => raw
            .parse::<NaiveDateTime>()
            .map(|naive| naive.and_utc())
            .map_err(|_| err),
    }
}

/// A detection job as published to the task queue.
///
/// The serialized form is self-describing: decoding a message body yields the
/// full task without any lookup in the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub image_data: String,
    pub image_type: ImageType,
    pub text_queries: TextQueries,
    pub box_threshold: f64,
    pub text_threshold: f64,
    pub return_visualization: bool,
    #[serde(deserialize_with = "deserialize_priority")]
    pub priority: u8,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl Task {
    pub fn new(
        image: &ImageSource,
        text_queries: TextQueries,
        box_threshold: f64,
        text_threshold: f64,
        return_visualization: bool,
        priority: u8,
    ) -> Self {
        Self {
            task_id: TaskId::generate(),
            image_data: image.encode(),
            image_type: image.image_type(),
            text_queries,
            box_threshold,
            text_threshold,
            return_visualization,
            priority: priority.min(MAX_PRIORITY),
            timestamp: Utc::now(),
        }
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Decode `image_data` according to `image_type`.
    pub fn image_source(&self) -> Result<ImageSource, base64::DecodeError> {
        ImageSource::decode(self.image_type, &self.image_data)
    }
}
