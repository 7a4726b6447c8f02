//! Pipeline orchestration
//!
//! Sequences the extract, transform and load phases over a shared context,
//! writes a checkpoint after every successful phase and before re-raising a
//! fatal error, and supports resuming a failed run from its checkpoint
//! file. The streaming variant fuses the three phases into a single pass
//! that keeps at most one conversation in memory.
//!
//! Phase components sit behind small traits so tests can substitute fakes
//! at construction time; the orchestrator owns construction of the real
//! ones.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::checkpoint;
use crate::config::{DatabaseConfig, PipelineConfig};
use crate::context::{EtlContext, Phase};

pub use crate::context::RunSummary;
use crate::error::{Error, Result};
use crate::extract::Extractor;
use crate::load::{ArchiveRegistration, LoadReport, LoadRequest, Loader};
use crate::models::{ExportHeader, RawConversation, RawExport, TransformedConversation, TransformedExport};
use crate::transform::{ConversationOutcome, IdentityMap, Transformer};

/// Default time allowed for in-flight work after a cancellation request
const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Boxed lazy conversation sequence, so fakes can stream from anywhere
pub type ConversationIter = Box<dyn Iterator<Item = Result<RawConversation>> + Send>;

/// Extraction seam
pub trait ExtractPhase: Send + Sync {
    fn extract(&self, context: &mut EtlContext, path: &Path) -> Result<RawExport>;
    fn extract_stream(
        &self,
        context: &mut EtlContext,
        path: &Path,
    ) -> Result<(ExportHeader, ConversationIter)>;
}

/// Transformation seam
#[async_trait]
pub trait TransformPhase: Send + Sync {
    async fn transform(
        &self,
        context: &mut EtlContext,
        raw: &RawExport,
    ) -> Result<TransformedExport>;

    fn transform_conversation(
        &self,
        conversation: &RawConversation,
        identity: &IdentityMap,
    ) -> ConversationOutcome;
}

/// Loading seam
#[async_trait]
pub trait LoadPhase: Send {
    async fn connect(&mut self, config: &DatabaseConfig) -> Result<()>;
    async fn close(&mut self);
    async fn load(&mut self, request: LoadRequest<'_>) -> Result<LoadReport>;
    async fn register_archive(&mut self, registration: ArchiveRegistration<'_>) -> Result<i64>;
    async fn load_streaming_batch(
        &mut self,
        archive_id: i64,
        conversation: &TransformedConversation,
    ) -> Result<LoadReport>;
}

impl ExtractPhase for Extractor {
    fn extract(&self, context: &mut EtlContext, path: &Path) -> Result<RawExport> {
        Extractor::extract(self, context, path)
    }

    fn extract_stream(
        &self,
        context: &mut EtlContext,
        path: &Path,
    ) -> Result<(ExportHeader, ConversationIter)> {
        let (header, conversations) = Extractor::extract_stream(self, context, path)?;
        Ok((header, Box::new(conversations)))
    }
}

#[async_trait]
impl TransformPhase for Transformer {
    async fn transform(
        &self,
        context: &mut EtlContext,
        raw: &RawExport,
    ) -> Result<TransformedExport> {
        Transformer::transform(self, context, raw).await
    }

    fn transform_conversation(
        &self,
        conversation: &RawConversation,
        identity: &IdentityMap,
    ) -> ConversationOutcome {
        Transformer::transform_conversation(self, conversation, identity)
    }
}

#[async_trait]
impl LoadPhase for Loader {
    async fn connect(&mut self, config: &DatabaseConfig) -> Result<()> {
        Loader::connect(self, config).await
    }

    async fn close(&mut self) {
        Loader::close(self).await
    }

    async fn load(&mut self, request: LoadRequest<'_>) -> Result<LoadReport> {
        Loader::load(self, request).await
    }

    async fn register_archive(&mut self, registration: ArchiveRegistration<'_>) -> Result<i64> {
        Loader::register_archive(self, registration).await
    }

    async fn load_streaming_batch(
        &mut self,
        archive_id: i64,
        conversation: &TransformedConversation,
    ) -> Result<LoadReport> {
        Loader::load_streaming_batch(self, archive_id, conversation).await
    }
}

/// Orchestrates one ETL task end to end
pub struct EtlPipeline {
    context: EtlContext,
    extractor: Box<dyn ExtractPhase>,
    transformer: Box<dyn TransformPhase>,
    loader: Box<dyn LoadPhase>,
    cancel_token: CancellationToken,
    cancel_grace: Duration,
}

impl EtlPipeline {
    /// Pipeline with the real phase components.
    pub fn new(
        db_config: DatabaseConfig,
        config: PipelineConfig,
        task_id: Option<String>,
    ) -> Self {
        let batch_size = config.batch_size;
        Self::with_components(
            EtlContext::new(db_config, config, task_id),
            Box::new(Extractor::new()),
            Box::new(Transformer::new()),
            Box::new(Loader::new(batch_size)),
        )
    }

    /// Pipeline over an existing context with injected phase components.
    pub fn with_components(
        context: EtlContext,
        extractor: Box<dyn ExtractPhase>,
        transformer: Box<dyn TransformPhase>,
        loader: Box<dyn LoadPhase>,
    ) -> Self {
        Self {
            context,
            extractor,
            transformer,
            loader,
            cancel_token: CancellationToken::new(),
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }

    /// Rebuild a pipeline from a checkpoint file. Credentials are not
    /// stored in checkpoints, so callers supply the database configuration
    /// again (or None to re-read the environment).
    pub fn load_from_checkpoint(
        path: &Path,
        db_config: Option<DatabaseConfig>,
    ) -> Result<Self> {
        let mut context = checkpoint::load(path)?;
        if let Some(db_config) = db_config {
            context.db_config = db_config;
        }
        // A phase interrupted mid-flight restarts cleanly
        context.current_phase = None;

        tracing::info!(
            task_id = %context.task_id,
            checkpoint = %path.display(),
            "Pipeline restored from checkpoint"
        );

        let batch_size = context.config.batch_size;
        Ok(Self::with_components(
            context,
            Box::new(Extractor::new()),
            Box::new(Transformer::new()),
            Box::new(Loader::new(batch_size)),
        ))
    }

    pub fn context(&self) -> &EtlContext {
        &self.context
    }

    /// Token adapters can use to request cancellation from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Stop accepting new work; in-flight units get the grace period.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Checkpoint files for the configured output directory, newest first.
    pub fn available_checkpoints(&self) -> Vec<PathBuf> {
        self.context
            .config
            .output_dir
            .as_deref()
            .map(|dir| checkpoint::list(Path::new(dir)).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Run the three-phase pipeline. Phases whose artifacts are already in
    /// the context (a resumed run) are skipped.
    pub async fn run(
        &mut self,
        path: &Path,
        user_display_name: Option<&str>,
    ) -> Result<RunSummary> {
        self.prepare_input(path, user_display_name);

        // Extract
        if self.context.raw_data.is_none() && self.context.transformed_data.is_none() {
            self.check_cancelled(Phase::Extract)?;
            self.context.start_phase(Phase::Extract, None)?;
            let raw = match self.extractor.extract(&mut self.context, path) {
                Ok(raw) => raw,
                Err(e) => return Err(self.fail(Phase::Extract, e)),
            };
            self.context
                .update_progress(raw.conversations.len() as u64, 0);
            self.context.raw_data = Some(raw);
            self.finish_phase(Phase::Extract)?;
        } else {
            tracing::info!("Raw data already present; skipping extract phase");
        }

        // Transform
        if self.context.transformed_data.is_none() {
            self.check_cancelled(Phase::Transform)?;
            self.context.start_phase(Phase::Transform, None)?;
            let raw = match self.context.raw_data.take() {
                Some(raw) => raw,
                None => {
                    let e =
                        Error::Validation("transform phase has no raw data to work on".to_string());
                    return Err(self.fail(Phase::Transform, e));
                }
            };
            let transformed = match self.transformer.transform(&mut self.context, &raw).await {
                Ok(transformed) => transformed,
                Err(e) => {
                    self.context.raw_data = Some(raw);
                    return Err(self.fail(Phase::Transform, e));
                }
            };
            self.context.raw_data = Some(raw);
            self.context.transformed_data = Some(transformed);
            self.finish_phase(Phase::Transform)?;
        } else {
            tracing::info!("Transformed data already present; skipping transform phase");
        }

        // Load
        self.check_cancelled(Phase::Load)?;
        self.context.start_phase(Phase::Load, None)?;
        if let Err(e) = self.loader.connect(&self.context.db_config.clone()).await {
            return Err(self.fail(Phase::Load, e));
        }

        let report = match (
            self.context.raw_data.as_ref(),
            self.context.transformed_data.as_ref(),
        ) {
            (Some(raw), Some(transformed)) => {
                self.loader
                    .load(LoadRequest {
                        raw,
                        transformed,
                        file_path: self.context.file_path.as_deref(),
                    })
                    .await
            }
            _ => Err(Error::Validation(
                "load phase is missing its input artifacts".to_string(),
            )),
        };
        self.loader.close().await;

        let report = match report {
            Ok(report) => report,
            Err(e) => return Err(self.fail(Phase::Load, e)),
        };

        self.context.export_id = Some(report.archive_id);
        self.context
            .update_progress(report.conversations, report.messages);
        for incident in &report.incidents {
            self.context
                .record_error(Phase::Load, &Error::Load(incident.clone()), false);
        }

        // Inter-phase buffers are done; the final checkpoint carries none
        self.context.raw_data = None;
        self.context.transformed_data = None;
        self.finish_phase(Phase::Load)?;

        tracing::info!(
            task_id = %self.context.task_id,
            archive_id = report.archive_id,
            "Pipeline completed"
        );
        Ok(self.summary(true))
    }

    /// Fused single-pass variant: extract, transform and load one
    /// conversation at a time.
    pub async fn run_streaming(
        &mut self,
        path: &Path,
        user_display_name: Option<&str>,
    ) -> Result<RunSummary> {
        self.prepare_input(path, user_display_name);

        self.check_cancelled(Phase::Streaming)?;
        self.context.start_phase(Phase::Streaming, None)?;

        let (header, conversations) =
            match self.extractor.extract_stream(&mut self.context, path) {
                Ok(parts) => parts,
                Err(e) => return Err(self.fail(Phase::Streaming, e)),
            };

        if let Err(e) = self.loader.connect(&self.context.db_config.clone()).await {
            return Err(self.fail(Phase::Streaming, e));
        }

        let result = self.stream_conversations(&header, conversations).await;
        self.loader.close().await;

        match result {
            Ok(()) => {
                self.finish_phase(Phase::Streaming)?;
                tracing::info!(task_id = %self.context.task_id, "Streaming pipeline completed");
                Ok(self.summary(true))
            }
            Err(e) => Err(self.fail(Phase::Streaming, e)),
        }
    }

    async fn stream_conversations(
        &mut self,
        header: &ExportHeader,
        conversations: ConversationIter,
    ) -> Result<()> {
        // The archive row exists before any conversation is written, with a
        // header-only raw blob standing in for the full document
        let raw_marker = serde_json::json!({
            "userId": header.user_id,
            "exportDate": header.export_date,
            "conversations": [],
            "streaming": true,
        });
        let file_path = self.context.file_path.clone();
        let archive_id = self
            .loader
            .register_archive(ArchiveRegistration {
                user_id: &header.user_id,
                export_date: &header.export_date,
                raw_data: raw_marker,
                file_path: file_path.as_deref(),
            })
            .await?;
        self.context.export_id = Some(archive_id);

        let user_display_name = self
            .context
            .user_display_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| header.user_id.clone());
        let identity: IdentityMap = std::sync::Arc::new(std::sync::Mutex::new(
            std::collections::HashMap::from([(header.user_id.clone(), user_display_name)]),
        ));

        let interval = self.context.config.checkpoint_interval.max(1);
        let mut messages_since_checkpoint = 0u64;

        for conversation in conversations {
            if self.cancel_token.is_cancelled() {
                return Err(Error::Cancelled(
                    "streaming run cancelled; checkpoint written".to_string(),
                ));
            }

            let conversation = conversation?;
            let conversation_id = conversation.id.clone();

            let (transformed, incidents) =
                match self.transformer.transform_conversation(&conversation, &identity) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            error = %e,
                            "Skipping conversation"
                        );
                        self.context.record_error(Phase::Streaming, &e, false);
                        continue;
                    }
                };
            for incident in incidents {
                self.context.record_error(
                    Phase::Streaming,
                    &Error::Transformation(incident.message),
                    false,
                );
            }

            // A cancellation arriving mid-load lets the in-flight
            // conversation finish within the grace period
            let token = self.cancel_token.clone();
            let grace = self.cancel_grace;
            let report = tokio::select! {
                result = self.loader.load_streaming_batch(archive_id, &transformed) => result?,
                _ = async {
                    token.cancelled().await;
                    tokio::time::sleep(grace).await;
                } => {
                    return Err(Error::Cancelled(
                        "grace period elapsed while a streaming load was in flight".to_string(),
                    ));
                }
            };
            self.context.update_progress(1, report.messages);
            for incident in &report.incidents {
                self.context
                    .record_error(Phase::Streaming, &Error::Load(incident.clone()), false);
            }

            messages_since_checkpoint += report.messages;
            if messages_since_checkpoint >= interval {
                messages_since_checkpoint = 0;
                self.context.check_memory();
                self.save_checkpoint_best_effort();
                if let Some(dir) = self.context.config.output_dir.as_deref() {
                    let keep = self.context.config.checkpoints_to_keep.max(1);
                    let _ = checkpoint::prune(Path::new(dir), keep);
                }
            }
        }

        Ok(())
    }

    /// Build the run summary from the context's current state.
    pub fn summary(&self, success: bool) -> RunSummary {
        self.context.summary(success)
    }

    fn prepare_input(&mut self, path: &Path, user_display_name: Option<&str>) {
        if let Some(name) = user_display_name {
            self.context.user_display_name = Some(name.to_string());
        }
        self.context.file_path = Some(path.display().to_string());
    }

    fn check_cancelled(&mut self, phase: Phase) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            let e = Error::Cancelled(format!("run cancelled before {phase}"));
            return Err(self.fail(phase, e));
        }
        Ok(())
    }

    /// End the phase, record its checkpoint, and persist it.
    fn finish_phase(&mut self, phase: Phase) -> Result<()> {
        self.context.end_phase()?;
        self.context.create_checkpoint(phase);
        self.save_checkpoint_best_effort();
        Ok(())
    }

    /// Record a fatal error and checkpoint the context before re-raising,
    /// so a later run can resume past the phases that already completed.
    fn fail(&mut self, phase: Phase, error: Error) -> Error {
        tracing::error!(phase = %phase, error = %error, "Phase failed");
        self.context.record_error(phase, &error, true);
        self.context.current_phase = None;
        self.save_checkpoint_best_effort();
        error
    }

    fn save_checkpoint_best_effort(&self) {
        if self.context.config.output_dir.is_none() {
            return;
        }
        if let Err(e) = checkpoint::save(&self.context) {
            tracing::error!(error = %e, "Failed to write checkpoint");
        }
    }
}
