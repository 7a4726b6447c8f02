//! Extraction phase
//!
//! Reads the export, validates its top-level shape, preserves a verbatim
//! copy for later inspection, and records input metrics on the context.

use std::io::Read;
use std::path::Path;

use serde_json::Value;

use crate::context::EtlContext;
use crate::error::{Error, Result};
use crate::models::{ExportHeader, RawExport};
use crate::reader;
use crate::reader::stream::ConversationStream;

/// Extraction phase component
#[derive(Default)]
pub struct Extractor;

impl Extractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract and validate a raw export from a file path.
    pub fn extract(&self, context: &mut EtlContext, path: &Path) -> Result<RawExport> {
        let document = reader::read(path)?;
        let raw = self.finish(context, document)?;

        context.metrics.bytes_read = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Ok(raw)
    }

    /// Extract and validate a raw export from an open reader.
    pub fn extract_reader<R: Read>(
        &self,
        context: &mut EtlContext,
        reader_input: R,
        name: Option<&str>,
    ) -> Result<RawExport> {
        let document = reader::read_object(reader_input, name)?;
        self.finish(context, document)
    }

    /// Open the export for the streaming variant: header now, conversations
    /// lazily.
    pub fn extract_stream(
        &self,
        context: &mut EtlContext,
        path: &Path,
    ) -> Result<(ExportHeader, ConversationStream)> {
        let (header, conversations) = reader::stream(path)?;

        if header.user_id.is_empty() {
            return Err(Error::Extraction("userId is empty".to_string()));
        }
        validate_export_date(&header.export_date)?;

        context.metrics.bytes_read = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        tracing::info!(
            user_id = %header.user_id,
            export_date = %header.export_date,
            "Export header read"
        );

        Ok((header, conversations))
    }

    fn finish(&self, context: &mut EtlContext, document: Value) -> Result<RawExport> {
        validate_document(&document)?;

        if let Some(dir) = context.config.output_dir.clone() {
            self.write_raw_copy(&dir, &document)?;
        }

        let raw: RawExport = serde_json::from_value(document)
            .map_err(|e| Error::Extraction(format!("export does not match schema: {e}")))?;

        context.metrics.conversation_count = raw.conversations.len() as u64;
        tracing::info!(
            user_id = %raw.user_id,
            conversations = raw.conversations.len(),
            "Extraction complete"
        );

        Ok(raw)
    }

    fn write_raw_copy(&self, dir: &str, document: &Value) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let path = Path::new(dir).join("raw_data.json");
        let file = std::fs::File::create(&path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), document)?;
        tracing::info!(path = %path.display(), "Raw data saved");
        Ok(())
    }
}

/// Top-level shape checks: `userId` non-empty, `exportDate` parseable,
/// `conversations` an array.
fn validate_document(document: &Value) -> Result<()> {
    let object = document
        .as_object()
        .ok_or_else(|| Error::Extraction("export is not a JSON object".to_string()))?;

    for field in ["userId", "exportDate", "conversations"] {
        if !object.contains_key(field) {
            return Err(Error::Extraction(format!(
                "required field '{field}' missing from export"
            )));
        }
    }

    match object.get("userId") {
        Some(Value::String(s)) if !s.is_empty() => {}
        _ => return Err(Error::Extraction("userId must be a non-empty string".to_string())),
    }

    match object.get("exportDate") {
        Some(Value::String(s)) => validate_export_date(s)?,
        _ => return Err(Error::Extraction("exportDate must be a string".to_string())),
    }

    if !object.get("conversations").map(Value::is_array).unwrap_or(false) {
        return Err(Error::Extraction("conversations must be an array".to_string()));
    }

    Ok(())
}

fn validate_export_date(raw: &str) -> Result<()> {
    crate::transform::content::parse_timestamp(raw)
        .map(|_| ())
        .ok_or_else(|| Error::Extraction(format!("exportDate is not ISO-8601: {raw}")))
}
