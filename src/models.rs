//! Data model shared across the pipeline phases
//!
//! Raw types mirror the Skype export document one-to-one; unknown fields are
//! retained through serde flattening so the raw blob written to the database
//! stays faithful to the input. Transformed types are the normalized shape
//! the loader persists.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transform::handlers::StructuredData;

/// Verbatim Skype export document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExport {
    #[serde(rename = "userId")]
    pub user_id: String,

    #[serde(rename = "exportDate")]
    pub export_date: String,

    pub conversations: Vec<RawConversation>,

    /// Top-level fields beyond the documented three, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single conversation as it appears in the export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConversation {
    pub id: String,

    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,

    #[serde(rename = "MessageList", default)]
    pub message_list: Vec<RawMessage>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single message as it appears in the export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<String>,

    /// ISO-8601 timestamp string; kept raw because unparseable values are
    /// retained rather than rejected
    #[serde(rename = "originalarrivaltime", default)]
    pub original_arrival_time: Option<String>,

    #[serde(rename = "from", default)]
    pub from_id: Option<String>,

    /// Sender display name, when the export carries one
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub content: Option<String>,

    #[serde(rename = "messagetype", default)]
    pub message_type: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawMessage {
    /// Raw content with the export's missing-content default applied.
    pub fn content_or_empty(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Message type with the default handler's fallback applied.
    pub fn type_or_unknown(&self) -> &str {
        self.message_type.as_deref().unwrap_or("Unknown")
    }
}

/// Export-level metadata carried alongside the transformed conversations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    #[serde(rename = "userId")]
    pub user_id: String,

    #[serde(rename = "userDisplayName")]
    pub user_display_name: String,

    #[serde(rename = "exportDate")]
    pub export_date: String,

    #[serde(rename = "exportDateFormatted")]
    pub export_date_formatted: String,

    #[serde(rename = "conversationCount")]
    pub conversation_count: usize,
}

/// Fully transformed export
///
/// Conversation iteration order matches input order, which keeps repeated
/// transformations of the same document byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedExport {
    pub metadata: ExportMetadata,
    pub conversations: IndexMap<String, TransformedConversation>,
}

/// A normalized conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedConversation {
    pub id: String,

    #[serde(rename = "displayName")]
    pub display_name: String,

    #[serde(rename = "messageCount")]
    pub message_count: usize,

    #[serde(rename = "firstMessageTime")]
    pub first_message_time: Option<String>,

    #[serde(rename = "lastMessageTime")]
    pub last_message_time: Option<String>,

    /// Ordered by parsed timestamp ascending; unparseable timestamps form a
    /// suffix in original input order
    pub messages: Vec<TransformedMessage>,
}

/// A normalized message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedMessage {
    /// Raw timestamp string exactly as exported
    pub timestamp: String,

    #[serde(rename = "timestampFormatted")]
    pub timestamp_formatted: String,

    pub date: String,
    pub time: String,

    #[serde(rename = "fromId")]
    pub from_id: String,

    #[serde(rename = "fromName")]
    pub from_name: String,

    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(rename = "rawContent")]
    pub raw_content: String,

    #[serde(rename = "cleanedContent")]
    pub cleaned_content: String,

    #[serde(rename = "isEdited")]
    pub is_edited: bool,

    #[serde(rename = "editNote", skip_serializing_if = "Option::is_none")]
    pub edit_note: Option<String>,

    #[serde(rename = "structuredData")]
    pub structured_data: StructuredData,

    /// Parsed form of `timestamp`; None when parsing failed
    #[serde(skip)]
    pub parsed_timestamp: Option<DateTime<Utc>>,
}

/// Header of an export, available before any conversation has been read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportHeader {
    pub user_id: String,
    pub export_date: String,
}
