//! Pipeline orchestration tests with injected fake phase components
//!
//! Exercises phase sequencing, checkpoint-on-success and
//! checkpoint-on-error, resumption from a checkpoint, and cancellation,
//! all without a database.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use skypevault::checkpoint;
use skypevault::context::{EtlContext, Phase};
use skypevault::error::{Error, Result};
use skypevault::extract::Extractor;
use skypevault::load::{ArchiveRegistration, LoadReport, LoadRequest};
use skypevault::models::{RawConversation, RawExport, TransformedConversation, TransformedExport};
use skypevault::pipeline::{
    ConversationIter, EtlPipeline, ExtractPhase, LoadPhase, TransformPhase,
};
use skypevault::transform::{ConversationOutcome, IdentityMap, Transformer};
use skypevault::{DatabaseConfig, PipelineConfig};

mod support {
    use super::*;

    pub fn write_export(dir: &Path, conversations: usize, messages_each: usize) -> std::path::PathBuf {
        let conversations: Vec<serde_json::Value> = (0..conversations)
            .map(|i| {
                serde_json::json!({
                    "id": format!("c:{i}"),
                    "displayName": format!("Conversation {i}"),
                    "MessageList": (0..messages_each).map(|j| serde_json::json!({
                        "id": format!("m{i}-{j}"),
                        "originalarrivaltime": format!("2023-01-01T{:02}:{:02}:00Z", i % 24, j % 60),
                        "from": "u2",
                        "content": format!("message {j}"),
                        "messagetype": "RichText",
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();

        let document = serde_json::json!({
            "userId": "u1",
            "exportDate": "2023-01-01T00:00:00Z",
            "conversations": conversations,
        });

        let path = dir.join("export.json");
        std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();
        path
    }

    pub fn context_with_output(dir: &Path, task_id: &str) -> EtlContext {
        EtlContext::new(
            DatabaseConfig::default(),
            PipelineConfig {
                output_dir: Some(dir.to_string_lossy().into_owned()),
                ..Default::default()
            },
            Some(task_id.to_string()),
        )
    }
}

/// Extractor wrapper that counts invocations
struct CountingExtractor {
    inner: Extractor,
    calls: Arc<AtomicUsize>,
}

impl ExtractPhase for CountingExtractor {
    fn extract(&self, context: &mut EtlContext, path: &Path) -> Result<RawExport> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(context, path)
    }

    fn extract_stream(
        &self,
        context: &mut EtlContext,
        path: &Path,
    ) -> Result<(skypevault::models::ExportHeader, ConversationIter)> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (header, stream) = self.inner.extract_stream(context, path)?;
        Ok((header, Box::new(stream)))
    }
}

/// Transformer that fails fatally after delegating the first conversation
struct FailingTransformer {
    inner: Transformer,
    armed: AtomicBool,
}

#[async_trait]
impl TransformPhase for FailingTransformer {
    async fn transform(
        &self,
        context: &mut EtlContext,
        raw: &RawExport,
    ) -> Result<TransformedExport> {
        if self.armed.swap(false, Ordering::SeqCst) {
            // Touch the first conversation, then blow up
            let identity: IdentityMap = Default::default();
            if let Some(first) = raw.conversations.first() {
                let _ = self.inner.transform_conversation(first, &identity);
            }
            return Err(Error::Other("injected transform failure".to_string()));
        }
        self.inner.transform(context, raw).await
    }

    fn transform_conversation(
        &self,
        conversation: &RawConversation,
        identity: &IdentityMap,
    ) -> ConversationOutcome {
        self.inner.transform_conversation(conversation, identity)
    }
}

#[derive(Default)]
struct MockLoaderState {
    connected: bool,
    archives: Vec<(String, String, Option<String>)>,
    loaded_conversations: Vec<String>,
    streamed_conversations: Vec<String>,
}

/// In-memory loader that records everything it is asked to persist
#[derive(Clone, Default)]
struct MockLoader {
    state: Arc<Mutex<MockLoaderState>>,
}

#[async_trait]
impl LoadPhase for MockLoader {
    async fn connect(&mut self, _config: &DatabaseConfig) -> Result<()> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().connected = false;
    }

    async fn load(&mut self, request: LoadRequest<'_>) -> Result<LoadReport> {
        let mut state = self.state.lock().unwrap();
        assert!(state.connected, "load called before connect");
        state.archives.push((
            request.transformed.metadata.user_id.clone(),
            request.transformed.metadata.export_date.clone(),
            request.file_path.map(str::to_string),
        ));
        let mut messages = 0u64;
        for (id, conversation) in &request.transformed.conversations {
            state.loaded_conversations.push(id.clone());
            messages += conversation.messages.len() as u64;
        }
        Ok(LoadReport {
            archive_id: 1,
            conversations: request.transformed.conversations.len() as u64,
            messages,
            skipped_rows: 0,
            incidents: Vec::new(),
        })
    }

    async fn register_archive(&mut self, registration: ArchiveRegistration<'_>) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        assert!(state.connected, "register_archive called before connect");
        state.archives.push((
            registration.user_id.to_string(),
            registration.export_date.to_string(),
            registration.file_path.map(str::to_string),
        ));
        Ok(1)
    }

    async fn load_streaming_batch(
        &mut self,
        _archive_id: i64,
        conversation: &TransformedConversation,
    ) -> Result<LoadReport> {
        let mut state = self.state.lock().unwrap();
        state.streamed_conversations.push(conversation.id.clone());
        Ok(LoadReport {
            archive_id: 1,
            conversations: 1,
            messages: conversation.messages.len() as u64,
            skipped_rows: 0,
            incidents: Vec::new(),
        })
    }
}

fn pipeline_with(
    context: EtlContext,
    extractor_calls: &Arc<AtomicUsize>,
    transformer: Box<dyn TransformPhase>,
    loader: MockLoader,
) -> EtlPipeline {
    EtlPipeline::with_components(
        context,
        Box::new(CountingExtractor {
            inner: Extractor::new(),
            calls: extractor_calls.clone(),
        }),
        transformer,
        Box::new(loader),
    )
}

#[tokio::test]
async fn full_run_sequences_phases_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let input = support::write_export(dir.path(), 3, 4);
    let context = support::context_with_output(dir.path(), "flow-1");

    let calls = Arc::new(AtomicUsize::new(0));
    let loader = MockLoader::default();
    let mut pipeline = pipeline_with(
        context,
        &calls,
        Box::new(Transformer::new()),
        loader.clone(),
    );

    let summary = pipeline.run(&input, Some("Tester")).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.export_id, Some(1));
    assert_eq!(summary.conversation_count, 3);
    assert_eq!(summary.message_count, 12);
    assert!(summary.phases.contains_key("extract"));
    assert!(summary.phases.contains_key("transform"));
    assert!(summary.phases.contains_key("load"));

    let state = loader.state.lock().unwrap();
    assert_eq!(state.archives.len(), 1);
    assert_eq!(state.loaded_conversations.len(), 3);
    // Input order preserved
    assert_eq!(state.loaded_conversations, vec!["c:0", "c:1", "c:2"]);

    // Final checkpoint carries no inter-phase artifacts
    let saved = checkpoint::load(&checkpoint::checkpoint_path(dir.path(), "flow-1")).unwrap();
    assert!(saved.raw_data.is_none());
    assert!(saved.transformed_data.is_none());
    assert!(saved.checkpoints.contains_key("extract"));
    assert!(saved.checkpoints.contains_key("load"));
}

#[tokio::test]
async fn transform_failure_checkpoints_then_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let input = support::write_export(dir.path(), 2, 3);
    let context = support::context_with_output(dir.path(), "flow-resume");

    let calls = Arc::new(AtomicUsize::new(0));
    let loader = MockLoader::default();
    let mut pipeline = pipeline_with(
        context,
        &calls,
        Box::new(FailingTransformer {
            inner: Transformer::new(),
            armed: AtomicBool::new(true),
        }),
        loader.clone(),
    );

    let error = pipeline.run(&input, Some("Tester")).await.unwrap_err();
    assert!(matches!(error, Error::Other(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Checkpoint written on failure carries the raw artifact
    let checkpoint_path = checkpoint::checkpoint_path(dir.path(), "flow-resume");
    let restored = checkpoint::load(&checkpoint_path).unwrap();
    assert!(restored.raw_data.is_some());
    assert!(restored.checkpoints["extract"].raw_data_available);
    assert!(restored.can_resume_from(Phase::Transform));
    assert!(restored.errors.iter().any(|e| e.fatal));

    // Resume with healthy components: extract is skipped, run completes
    let mut resumed = pipeline_with(
        restored,
        &calls,
        Box::new(Transformer::new()),
        loader.clone(),
    );
    let summary = resumed.run(&input, Some("Tester")).await.unwrap();

    assert!(summary.success);
    assert_eq!(summary.conversation_count, 2);
    assert_eq!(summary.message_count, 6);
    // Extractor was not invoked a second time
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelled_before_start_writes_checkpoint_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let input = support::write_export(dir.path(), 1, 1);
    let context = support::context_with_output(dir.path(), "flow-cancel");

    let calls = Arc::new(AtomicUsize::new(0));
    let mut pipeline = pipeline_with(
        context,
        &calls,
        Box::new(Transformer::new()),
        MockLoader::default(),
    );

    pipeline.cancel();
    let error = pipeline.run(&input, None).await.unwrap_err();
    assert!(matches!(error, Error::Cancelled(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(checkpoint::checkpoint_path(dir.path(), "flow-cancel").exists());
}

#[tokio::test]
async fn available_checkpoints_lists_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let input = support::write_export(dir.path(), 1, 1);

    for task in ["older-task", "newer-task"] {
        let context = support::context_with_output(dir.path(), task);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = pipeline_with(
            context,
            &calls,
            Box::new(Transformer::new()),
            MockLoader::default(),
        );
        pipeline.run(&input, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let context = support::context_with_output(dir.path(), "probe");
    let pipeline = EtlPipeline::with_components(
        context,
        Box::new(Extractor::new()),
        Box::new(Transformer::new()),
        Box::new(MockLoader::default()),
    );

    let checkpoints = pipeline.available_checkpoints();
    assert_eq!(checkpoints.len(), 2);
    for path in &checkpoints {
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("etl_checkpoint_"));
        assert!(name.ends_with(".json"));
    }
}

#[tokio::test]
async fn load_from_checkpoint_reconstructs_context() {
    let dir = tempfile::tempdir().unwrap();
    let mut context = support::context_with_output(dir.path(), "flow-restore");
    context.file_path = Some("/exports/skype.tar".to_string());
    let path = checkpoint::save(&context).unwrap();

    let pipeline = EtlPipeline::load_from_checkpoint(
        &path,
        Some(DatabaseConfig {
            dbname: "override_db".to_string(),
            ..Default::default()
        }),
    )
    .unwrap();

    assert_eq!(pipeline.context().task_id, "flow-restore");
    assert_eq!(pipeline.context().file_path.as_deref(), Some("/exports/skype.tar"));
    assert_eq!(pipeline.context().db_config.dbname, "override_db");
}
