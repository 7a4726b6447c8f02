//! Per-message-type structured data extraction
//!
//! Every message runs through a handler picked by its `messagetype`. The
//! registry is populated once at construction and read-only afterwards:
//! exact type match first, then family prefix (`RichText/Media_*`), then
//! the unknown handler. Handler output is a tagged variant; the loader
//! writes Media/Poll/Location variants to their side tables.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::RawMessage;
use crate::transform::content;

/// Structured payload extracted from a message, keyed by its type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredData {
    Text {
        content: String,
    },
    Html {
        html_content: String,
    },
    Link {
        url: String,
        text: String,
    },
    Media {
        filename: String,
        filesize: i64,
        filetype: String,
        url: String,
        thumbnail_url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        width: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        height: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Poll {
        question: String,
        options: Vec<String>,
    },
    Location {
        latitude: String,
        longitude: String,
        address: String,
    },
    Call {
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
    },
    ScheduledCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<String>,
    },
    System {
        event: String,
    },
    ContactCard {
        contacts: Vec<ContactEntry>,
    },
    FileTransfer {
        filename: String,
        filesize: i64,
        url: String,
    },
    Edited {
        content: String,
    },
    Deleted,
    Unknown {
        raw_type: String,
    },
}

/// One shared contact inside a ContactCard message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEntry {
    pub id: String,
    pub name: String,
}

impl StructuredData {
    /// Variants that get a dedicated side table in the database.
    pub fn has_side_table(&self) -> bool {
        matches!(
            self,
            StructuredData::Media { .. }
                | StructuredData::Poll { .. }
                | StructuredData::Location { .. }
        )
    }
}

/// Extracts a structured payload from one raw message
pub trait MessageHandler: Send + Sync {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData>;
}

lazy_static! {
    static ref ATTR_URI: Regex = Regex::new(r#"uri="([^"]*)""#).unwrap();
    static ref ATTR_THUMBNAIL: Regex = Regex::new(r#"url_thumbnail="([^"]*)""#).unwrap();
    static ref ATTR_TYPE: Regex = Regex::new(r#"type="([^"]*)""#).unwrap();
    static ref ATTR_WIDTH: Regex = Regex::new(r#"width="(\d+)""#).unwrap();
    static ref ATTR_HEIGHT: Regex = Regex::new(r#"height="(\d+)""#).unwrap();
    static ref ATTR_DURATION: Regex = Regex::new(r#"duration="([^"]*)""#).unwrap();
    static ref TAG_ORIGINAL_NAME: Regex = Regex::new(r#"<OriginalName\s+v="([^"]*)""#).unwrap();
    static ref TAG_FILE_SIZE: Regex = Regex::new(r#"<FileSize\s+v="(\d+)""#).unwrap();
    static ref ATTR_FILE_SIZE: Regex = Regex::new(r#"filesize="(\d+)""#).unwrap();
    static ref TAG_DESCRIPTION: Regex = Regex::new(r#"<Description\s+v="([^"]*)""#).unwrap();
    static ref HREF: Regex = Regex::new(r#"href="([^"]*)""#).unwrap();
    static ref BARE_URL: Regex = Regex::new(r#"https?://[^\s<>"]+"#).unwrap();
    static ref ATTR_LATITUDE: Regex = Regex::new(r#"latitude="([^"]*)""#).unwrap();
    static ref ATTR_LONGITUDE: Regex = Regex::new(r#"longitude="([^"]*)""#).unwrap();
    static ref ATTR_ADDRESS: Regex = Regex::new(r#"address="([^"]*)""#).unwrap();
    static ref POLL_QUESTION: Regex =
        Regex::new(r"(?s)<pollquestion[^>]*>(.*?)</pollquestion>").unwrap();
    static ref POLL_OPTION: Regex =
        Regex::new(r"(?s)<polloption[^>]*>(.*?)</polloption>").unwrap();
    static ref CALL_DURATION: Regex = Regex::new(r"(?s)<duration>(.*?)</duration>").unwrap();
    static ref SCHEDULED_TITLE: Regex = Regex::new(r"(?s)<title[^>]*>(.*?)</title>").unwrap();
    static ref ATTR_START_TIME: Regex = Regex::new(r#"starttime="([^"]*)""#).unwrap();
    static ref CONTACT: Regex = Regex::new(r#"<c\s+t="[^"]*"\s+s="([^"]*)"\s+f="([^"]*)""#).unwrap();
    static ref DELETE_MARKER: Regex = Regex::new(r"<deletemember>|<delete_message>").unwrap();
}

fn attr(regex: &Regex, content: &str) -> Option<String> {
    regex
        .captures(content)
        .map(|c| c[1].to_string())
        .filter(|s| !s.is_empty())
}

fn numeric_attr<T: std::str::FromStr>(regex: &Regex, content: &str) -> Option<T> {
    attr(regex, content).and_then(|s| s.parse().ok())
}

struct TextHandler;

impl MessageHandler for TextHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        if DELETE_MARKER.is_match(raw) {
            return Ok(StructuredData::Deleted);
        }
        let cleaned = content::clean_content(raw);
        if content::has_edit_marker(raw) {
            return Ok(StructuredData::Edited { content: cleaned });
        }
        Ok(StructuredData::Text { content: cleaned })
    }
}

struct HtmlHandler;

impl MessageHandler for HtmlHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        Ok(StructuredData::Html {
            html_content: message.content_or_empty().to_string(),
        })
    }
}

struct LinkHandler;

impl MessageHandler for LinkHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        let url = attr(&HREF, raw)
            .or_else(|| BARE_URL.find(raw).map(|m| m.as_str().to_string()))
            .unwrap_or_default();
        Ok(StructuredData::Link {
            url,
            text: content::clean_content(raw),
        })
    }
}

struct MediaHandler;

impl MessageHandler for MediaHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        let filename = attr(&TAG_ORIGINAL_NAME, raw).unwrap_or_default();
        let filetype = attr(&ATTR_TYPE, raw).unwrap_or_else(|| {
            filename
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_string())
                .unwrap_or_default()
        });
        Ok(StructuredData::Media {
            filename,
            filesize: numeric_attr(&TAG_FILE_SIZE, raw)
                .or_else(|| numeric_attr(&ATTR_FILE_SIZE, raw))
                .unwrap_or(0),
            filetype,
            url: attr(&ATTR_URI, raw).unwrap_or_default(),
            thumbnail_url: attr(&ATTR_THUMBNAIL, raw).unwrap_or_default(),
            width: numeric_attr(&ATTR_WIDTH, raw),
            height: numeric_attr(&ATTR_HEIGHT, raw),
            duration: attr(&ATTR_DURATION, raw),
            description: attr(&TAG_DESCRIPTION, raw),
        })
    }
}

struct FileTransferHandler;

impl MessageHandler for FileTransferHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        Ok(StructuredData::FileTransfer {
            filename: attr(&TAG_ORIGINAL_NAME, raw).unwrap_or_default(),
            filesize: numeric_attr(&TAG_FILE_SIZE, raw)
                .or_else(|| numeric_attr(&ATTR_FILE_SIZE, raw))
                .unwrap_or(0),
            url: attr(&ATTR_URI, raw).unwrap_or_default(),
        })
    }
}

struct PollHandler;

impl MessageHandler for PollHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        let question = POLL_QUESTION
            .captures(raw)
            .map(|c| content::clean_content(&c[1]))
            .unwrap_or_default();
        let options = POLL_OPTION
            .captures_iter(raw)
            .map(|c| content::clean_content(&c[1]))
            .collect();
        Ok(StructuredData::Poll { question, options })
    }
}

struct LocationHandler;

impl MessageHandler for LocationHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        Ok(StructuredData::Location {
            latitude: attr(&ATTR_LATITUDE, raw).unwrap_or_default(),
            longitude: attr(&ATTR_LONGITUDE, raw).unwrap_or_default(),
            address: attr(&ATTR_ADDRESS, raw)
                .map(|a| content::clean_content(&a))
                .unwrap_or_default(),
        })
    }
}

struct CallHandler;

impl MessageHandler for CallHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        Ok(StructuredData::Call {
            duration: CALL_DURATION
                .captures(message.content_or_empty())
                .map(|c| c[1].trim().to_string()),
        })
    }
}

struct ScheduledCallHandler;

impl MessageHandler for ScheduledCallHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let raw = message.content_or_empty();
        Ok(StructuredData::ScheduledCall {
            title: SCHEDULED_TITLE
                .captures(raw)
                .map(|c| content::clean_content(&c[1])),
            start_time: attr(&ATTR_START_TIME, raw),
        })
    }
}

struct SystemHandler;

impl MessageHandler for SystemHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        Ok(StructuredData::System {
            event: content::clean_content(message.content_or_empty()),
        })
    }
}

struct ContactsHandler;

impl MessageHandler for ContactsHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        let contacts = CONTACT
            .captures_iter(message.content_or_empty())
            .map(|c| ContactEntry {
                id: c[1].to_string(),
                name: c[2].to_string(),
            })
            .collect();
        Ok(StructuredData::ContactCard { contacts })
    }
}

struct UnknownHandler;

impl MessageHandler for UnknownHandler {
    fn extract(&self, message: &RawMessage) -> Result<StructuredData> {
        Ok(StructuredData::Unknown {
            raw_type: message.type_or_unknown().to_string(),
        })
    }
}

/// Maps message-type strings to their handlers
pub struct MessageHandlerRegistry {
    exact: HashMap<String, Arc<dyn MessageHandler>>,
    families: Vec<(String, Arc<dyn MessageHandler>)>,
    unknown: Arc<dyn MessageHandler>,
}

impl MessageHandlerRegistry {
    /// Registry with the documented Skype message types wired up.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            exact: HashMap::new(),
            families: Vec::new(),
            unknown: Arc::new(UnknownHandler),
        };

        let text: Arc<dyn MessageHandler> = Arc::new(TextHandler);
        registry.register("RichText", text.clone());
        registry.register("Text", text);
        registry.register("RichText/HTML", Arc::new(HtmlHandler));
        registry.register("RichText/Link", Arc::new(LinkHandler));
        registry.register("RichText/UriObject", Arc::new(MediaHandler));
        registry.register("RichText/Media_GenericFile", Arc::new(FileTransferHandler));
        registry.register("Poll", Arc::new(PollHandler));
        registry.register("RichText/Location", Arc::new(LocationHandler));
        registry.register("Event/Call", Arc::new(CallHandler));
        registry.register("RichText/ScheduledCallInvite", Arc::new(ScheduledCallHandler));
        registry.register("SystemMessage", Arc::new(SystemHandler));
        registry.register("RichText/Contacts", Arc::new(ContactsHandler));

        registry.register_family("RichText/Media_", Arc::new(MediaHandler));
        registry.register_family("ThreadActivity/", Arc::new(SystemHandler));

        registry
    }

    pub fn register(&mut self, message_type: &str, handler: Arc<dyn MessageHandler>) {
        self.exact.insert(message_type.to_string(), handler);
    }

    pub fn register_family(&mut self, prefix: &str, handler: Arc<dyn MessageHandler>) {
        self.families.push((prefix.to_string(), handler));
    }

    /// Exact match, then family prefix, then the unknown handler.
    pub fn handler_for(&self, message_type: &str) -> &Arc<dyn MessageHandler> {
        if let Some(handler) = self.exact.get(message_type) {
            return handler;
        }
        for (prefix, handler) in &self.families {
            if message_type.starts_with(prefix.as_str()) {
                return handler;
            }
        }
        &self.unknown
    }
}
