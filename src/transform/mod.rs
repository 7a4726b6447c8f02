//! Transformation phase
//!
//! Normalizes raw conversations into the persisted shape: display-name
//! sanitization, timestamp parsing and deterministic ordering, placeholder
//! substitution for non-text message types, edit detection, content
//! cleaning, and per-message structured data via the handler registry.
//! Conversation-level work optionally fans out across a bounded worker set.

pub mod content;
pub mod handlers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use lazy_static::lazy_static;

use crate::context::{EtlContext, Phase};
use crate::error::{Error, Result};
use crate::models::{
    ExportMetadata, RawConversation, RawExport, RawMessage, TransformedConversation,
    TransformedExport, TransformedMessage,
};
use self::handlers::{MessageHandlerRegistry, StructuredData};

/// Message types whose content is kept verbatim instead of being replaced
/// by a placeholder.
const TEXTUAL_TYPES: [&str; 4] = ["RichText", "Text", "RichText/HTML", "RichText/Link"];

lazy_static! {
    /// Human-readable stand-ins for non-text message types
    static ref TYPE_PLACEHOLDERS: HashMap<&'static str, &'static str> = HashMap::from([
        ("Event/Call", "***A call started/ended***"),
        ("Poll", "***Created a poll***"),
        ("RichText/Media_Album", "***Sent an album of images***"),
        ("RichText/Media_AudioMsg", "***Sent a voice message***"),
        ("RichText/Media_CallRecording", "***Sent a call recording***"),
        ("RichText/Media_Card", "***Sent a media card***"),
        ("RichText/Media_FlikMsg", "***Sent a moji***"),
        ("RichText/Media_GenericFile", "***Sent a file***"),
        ("RichText/Media_Video", "***Sent a video message***"),
        ("RichText/UriObject", "***Sent a photo***"),
        ("RichText/ScheduledCallInvite", "***Scheduled a call***"),
        ("RichText/Location", "***Sent a location***"),
        ("RichText/Contacts", "***Sent a contact***"),
    ]);
}

/// Shared participant-id to display-name mapping built during a run
pub type IdentityMap = Arc<Mutex<HashMap<String, String>>>;

/// Placeholder content for a message type, when one applies.
fn placeholder_for(message_type: &str) -> Option<String> {
    if TEXTUAL_TYPES.contains(&message_type) {
        return None;
    }
    Some(
        TYPE_PLACEHOLDERS
            .get(message_type)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("***Sent a {message_type}***")),
    )
}

/// Non-fatal trouble encountered while transforming
pub struct TransformIncident {
    pub message: String,
}

/// Transformation phase component
pub struct Transformer {
    registry: Arc<MessageHandlerRegistry>,
}

impl Default for Transformer {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformer {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MessageHandlerRegistry::with_defaults()),
        }
    }

    pub fn with_registry(registry: MessageHandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Transform a whole export.
    pub async fn transform(
        &self,
        context: &mut EtlContext,
        raw: &RawExport,
    ) -> Result<TransformedExport> {
        let user_display_name = context
            .user_display_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| raw.user_id.clone());

        let export_date_formatted = content::parse_timestamp(&raw.export_date)
            .map(|(date, time, _)| format!("{date} {time}"))
            .unwrap_or_default();

        let metadata = ExportMetadata {
            user_id: raw.user_id.clone(),
            user_display_name: user_display_name.clone(),
            export_date: raw.export_date.clone(),
            export_date_formatted,
            conversation_count: raw.conversations.len(),
        };

        let identity: IdentityMap = Arc::new(Mutex::new(HashMap::from([(
            raw.user_id.clone(),
            user_display_name,
        )])));

        let parallel = context.config.parallel_processing
            && context.config.chunk_size > 0
            && raw.conversations.len() > 1;

        let outcomes = if parallel {
            self.transform_parallel(context, &raw.conversations, &identity)
                .await?
        } else {
            self.transform_sequential(context, &raw.conversations, &identity)
        };

        let mut conversations = IndexMap::with_capacity(outcomes.len());
        for (id, outcome) in outcomes {
            match outcome {
                Ok((conversation, incidents)) => {
                    for incident in incidents {
                        context.record_error(
                            Phase::Transform,
                            &Error::Transformation(incident.message),
                            false,
                        );
                    }
                    context.update_progress(1, conversation.messages.len() as u64);
                    conversations.insert(id, conversation);
                }
                Err(e) => {
                    tracing::warn!(conversation_id = %id, error = %e, "Skipping conversation");
                    context.record_error(Phase::Transform, &e, false);
                }
            }
        }

        let transformed = TransformedExport {
            metadata,
            conversations,
        };

        if let Some(dir) = context.config.output_dir.clone() {
            self.write_transformed_copy(&dir, &transformed)?;
        }

        Ok(transformed)
    }

    fn transform_sequential(
        &self,
        context: &mut EtlContext,
        conversations: &[RawConversation],
        identity: &IdentityMap,
    ) -> ConversationOutcomes {
        let mut outcomes = Vec::with_capacity(conversations.len());
        for (i, conversation) in conversations.iter().enumerate() {
            outcomes.push((
                conversation.id.clone(),
                self.transform_conversation(conversation, identity),
            ));
            if i % 50 == 49 {
                context.check_memory();
            }
        }
        outcomes
    }

    /// Fan conversations out in chunks across up to `max_workers` blocking
    /// workers. Chunk results are awaited in submission order, so output
    /// order matches input order.
    async fn transform_parallel(
        &self,
        context: &mut EtlContext,
        conversations: &[RawConversation],
        identity: &IdentityMap,
    ) -> Result<ConversationOutcomes> {
        let workers = context.config.effective_workers().max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
        let mut handles = Vec::new();

        for chunk in conversations.chunks(context.config.chunk_size) {
            let chunk: Vec<RawConversation> = chunk.to_vec();
            let registry = self.registry.clone();
            let identity = identity.clone();
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Transformation(format!("worker pool closed: {e}")))?;

            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                chunk
                    .into_iter()
                    .map(|conversation| {
                        let outcome =
                            transform_conversation_impl(&registry, &conversation, &identity);
                        (conversation.id, outcome)
                    })
                    .collect::<ConversationOutcomes>()
            }));
        }

        let mut outcomes = Vec::with_capacity(conversations.len());
        for handle in handles {
            let chunk_outcomes = handle
                .await
                .map_err(|e| Error::Transformation(format!("transform worker panicked: {e}")))?;
            outcomes.extend(chunk_outcomes);
            context.check_memory();
        }
        Ok(outcomes)
    }

    /// Transform a single conversation against the shared identity map.
    pub fn transform_conversation(
        &self,
        conversation: &RawConversation,
        identity: &IdentityMap,
    ) -> ConversationOutcome {
        transform_conversation_impl(&self.registry, conversation, identity)
    }

    fn write_transformed_copy(&self, dir: &str, transformed: &TransformedExport) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = std::path::Path::new(dir).join("transformed_data.json");
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), transformed)?;
        tracing::info!(path = %path.display(), "Transformed data saved");
        Ok(())
    }
}

/// Result of transforming one conversation, plus any non-fatal incidents
pub type ConversationOutcome = Result<(TransformedConversation, Vec<TransformIncident>)>;
type ConversationOutcomes = Vec<(String, ConversationOutcome)>;

fn transform_conversation_impl(
    registry: &MessageHandlerRegistry,
    conversation: &RawConversation,
    identity: &IdentityMap,
) -> ConversationOutcome {
    let display_name = match &conversation.display_name {
        None => content::display_name_from_id(&conversation.id),
        Some(name) if name.is_empty() => String::new(),
        Some(name) => content::safe_filename(name),
    };

    {
        let mut map = identity
            .lock()
            .map_err(|_| Error::Transformation("identity map lock poisoned".to_string()))?;
        map.insert(conversation.id.clone(), display_name.clone());
    }

    let mut incidents = Vec::new();
    let mut messages = Vec::with_capacity(conversation.message_list.len());

    for (index, raw_message) in conversation.message_list.iter().enumerate() {
        let previous_content = index
            .checked_sub(1)
            .map(|prev| conversation.message_list[prev].content_or_empty());
        match transform_message(registry, raw_message, previous_content, identity) {
            Ok(message) => messages.push(message),
            Err(e) => {
                incidents.push(TransformIncident {
                    message: format!(
                        "message {} in conversation {}: {}",
                        index, conversation.id, e
                    ),
                });
                messages.push(error_marker_message(raw_message));
            }
        }
    }

    // Parsed timestamps ascending; ties and unparseables keep input order,
    // with unparseables as a suffix
    messages.sort_by_key(|m| (m.parsed_timestamp.is_none(), m.parsed_timestamp));

    let first_message_time = messages.first().map(|m| m.timestamp.clone());
    let last_message_time = messages.last().map(|m| m.timestamp.clone());

    Ok((
        TransformedConversation {
            id: conversation.id.clone(),
            display_name,
            message_count: messages.len(),
            first_message_time,
            last_message_time,
            messages,
        },
        incidents,
    ))
}

fn transform_message(
    registry: &MessageHandlerRegistry,
    raw: &RawMessage,
    previous_content: Option<&str>,
    identity: &IdentityMap,
) -> Result<TransformedMessage> {
    let message_type = raw.type_or_unknown().to_string();
    let original_content = raw.content_or_empty().to_string();
    let raw_content = placeholder_for(&message_type).unwrap_or_else(|| original_content.clone());

    let timestamp = raw.original_arrival_time.clone().unwrap_or_default();
    let parsed = content::parse_timestamp(&timestamp);
    let (date, time) = parsed
        .as_ref()
        .map(|(d, t, _)| (d.clone(), t.clone()))
        .unwrap_or_default();
    let timestamp_formatted = parsed
        .as_ref()
        .map(|(d, t, _)| format!("{d} {t}"))
        .unwrap_or_default();

    let from_id = raw.from_id.clone().unwrap_or_default();
    let from_name = {
        let mut map = identity
            .lock()
            .map_err(|_| Error::Transformation("identity map lock poisoned".to_string()))?;
        if let Some(name) = raw.display_name.as_deref().filter(|n| !n.is_empty()) {
            map.insert(from_id.clone(), name.to_string());
        }
        map.get(&from_id).cloned().unwrap_or_else(|| from_id.clone())
    };

    // A message repeating the previous one verbatim and carrying the edit
    // marker is the edited rendition; the earlier copy stays unflagged.
    let is_edited = previous_content
        .map(|prev| original_content == prev && content::has_edit_marker(&original_content))
        .unwrap_or(false);
    let edit_note = is_edited.then(|| {
        format!(
            "--This user edited the following message at {time}, you are viewing the edited version--"
        )
    });

    let structured_data = registry.handler_for(&message_type).extract(raw)?;

    Ok(TransformedMessage {
        cleaned_content: content::clean_content(&raw_content),
        timestamp,
        timestamp_formatted,
        date,
        time,
        from_id,
        from_name,
        message_type,
        raw_content,
        is_edited,
        edit_note,
        structured_data,
        parsed_timestamp: parsed.map(|(_, _, instant)| instant),
    })
}

/// Stand-in record for a message whose transformation failed.
fn error_marker_message(raw: &RawMessage) -> TransformedMessage {
    let timestamp = raw.original_arrival_time.clone().unwrap_or_default();
    TransformedMessage {
        parsed_timestamp: content::parse_timestamp(&timestamp).map(|(_, _, i)| i),
        timestamp,
        timestamp_formatted: String::new(),
        date: String::new(),
        time: String::new(),
        from_id: raw.from_id.clone().unwrap_or_default(),
        from_name: raw.from_id.clone().unwrap_or_default(),
        message_type: "Error".to_string(),
        raw_content: raw.content_or_empty().to_string(),
        cleaned_content: String::new(),
        is_edited: false,
        edit_note: None,
        structured_data: StructuredData::Unknown {
            raw_type: raw.type_or_unknown().to_string(),
        },
    }
}
