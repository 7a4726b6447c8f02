//! End-to-end tests against a live PostgreSQL instance.
//!
//! Ignored by default; run with a database available and the `POSTGRES_*`
//! environment variables set:
//!
//! ```bash
//! POSTGRES_DB=skypevault_test cargo test --test postgres_load -- --ignored
//! ```
//!
//! Inputs use unique user and conversation ids per invocation so repeated
//! runs against the same database do not collide.

use std::path::{Path, PathBuf};

use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use uuid::Uuid;

use skypevault::pipeline::EtlPipeline;
use skypevault::{DatabaseConfig, PipelineConfig};

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

fn write_export(
    dir: &Path,
    file_name: &str,
    user_id: &str,
    conversations: &[serde_json::Value],
) -> PathBuf {
    let document = serde_json::json!({
        "userId": user_id,
        "exportDate": "2023-01-01T00:00:00Z",
        "conversations": conversations,
    });
    let path = dir.join(file_name);
    std::fs::write(&path, serde_json::to_vec(&document).unwrap()).unwrap();
    path
}

fn simple_conversation(id: &str, display_name: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "displayName": display_name,
        "MessageList": [{
            "id": "m1",
            "originalarrivaltime": "2023-01-01T00:00:01Z",
            "from": "u2",
            "content": "hi",
            "messagetype": "RichText",
        }],
    })
}

async fn test_pool(config: &DatabaseConfig) -> sqlx::PgPool {
    PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.url())
        .await
        .expect("cannot connect to test database")
}

fn pipeline(output_dir: &Path, db_config: DatabaseConfig) -> EtlPipeline {
    EtlPipeline::new(
        db_config,
        PipelineConfig {
            output_dir: Some(output_dir.to_string_lossy().into_owned()),
            batch_size: 50,
            ..Default::default()
        },
        None,
    )
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set POSTGRES_* env vars)"]
async fn happy_path_bare_json() {
    let db_config = DatabaseConfig::from_env().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let user_id = unique("user");
    let conv_id = unique("conv");

    let input = write_export(
        dir.path(),
        "input.json",
        &user_id,
        &[simple_conversation(&conv_id, "Alice")],
    );

    let mut etl = pipeline(dir.path(), db_config.clone());
    let summary = etl.run(&input, Some("Tester")).await.unwrap();
    assert!(summary.success);
    let archive_id = summary.export_id.unwrap();

    let pool = test_pool(&db_config).await;

    let archive = sqlx::query(
        "SELECT file_path, file_size, raw_data FROM archives WHERE archive_id = $1",
    )
    .bind(archive_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    let file_path: String = archive.get("file_path");
    // input.json normalized to input.tar by the CHECK-constraint rule
    assert!(file_path.ends_with("input.tar"), "got {file_path}");
    let raw_data: serde_json::Value = archive.get("raw_data");
    assert_eq!(raw_data["userId"], serde_json::json!(user_id));

    let conversation = sqlx::query(
        "SELECT display_name, message_count, archive_id FROM conversations
         WHERE conversation_id = $1",
    )
    .bind(&conv_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(conversation.get::<String, _>("display_name"), "Alice");
    assert_eq!(conversation.get::<i32, _>("message_count"), 1);
    assert_eq!(conversation.get::<i64, _>("archive_id"), archive_id);

    let message = sqlx::query(
        "SELECT cleaned_content, is_edited FROM messages WHERE conversation_id = $1",
    )
    .bind(&conv_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(message.get::<String, _>("cleaned_content"), "hi");
    assert!(!message.get::<bool, _>("is_edited"));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set POSTGRES_* env vars)"]
async fn rerun_reuses_archive_row() {
    let db_config = DatabaseConfig::from_env().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let user_id = unique("user");
    let conv_id = unique("conv");

    let input = write_export(
        dir.path(),
        "rerun.json",
        &user_id,
        &[simple_conversation(&conv_id, "Alice")],
    );

    let first = pipeline(dir.path(), db_config.clone())
        .run(&input, None)
        .await
        .unwrap();
    let second = pipeline(dir.path(), db_config.clone())
        .run(&input, None)
        .await
        .unwrap();

    // Same (user_id, export_date) pair keeps its archive id
    assert_eq!(first.export_id, second.export_id);

    let pool = test_pool(&db_config).await;
    let count: i64 =
        sqlx::query_scalar("SELECT count(*) FROM archives WHERE user_id = $1")
            .bind(&user_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);

    // Messages are replaced, not duplicated
    let messages: i64 =
        sqlx::query_scalar("SELECT count(*) FROM messages WHERE conversation_id = $1")
            .bind(&conv_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(messages, 1);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set POSTGRES_* env vars)"]
async fn side_tables_written_per_variant() {
    let db_config = DatabaseConfig::from_env().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let user_id = unique("user");
    let conv_id = unique("conv");

    let media_content = r#"<URIObject type="Picture.1" uri="https://img.example/1" url_thumbnail="https://img.example/t1"><OriginalName v="photo.jpg"/><FileSize v="2048"/></URIObject>"#;
    let poll_content = "<pollcontent><pollquestion>Lunch?</pollquestion><polloption>Pizza</polloption><polloption>Sushi</polloption></pollcontent>";
    let location_content = r#"<location latitude="52.5" longitude="13.4" address="Berlin"/>"#;

    let conversation = serde_json::json!({
        "id": conv_id,
        "displayName": "Mixed",
        "MessageList": [
            {"id": "m1", "originalarrivaltime": "2023-01-01T00:00:01Z", "from": "u2",
             "content": media_content, "messagetype": "RichText/Media_Album"},
            {"id": "m2", "originalarrivaltime": "2023-01-01T00:00:02Z", "from": "u2",
             "content": poll_content, "messagetype": "Poll"},
            {"id": "m3", "originalarrivaltime": "2023-01-01T00:00:03Z", "from": "u2",
             "content": location_content, "messagetype": "RichText/Location"},
        ],
    });

    let input = write_export(dir.path(), "variants.json", &user_id, &[conversation]);
    pipeline(dir.path(), db_config.clone())
        .run(&input, None)
        .await
        .unwrap();

    let pool = test_pool(&db_config).await;

    let media = sqlx::query(
        "SELECT mm.filename, mm.filesize FROM message_media mm
         JOIN messages m ON m.message_id = mm.message_id
         WHERE m.conversation_id = $1",
    )
    .bind(&conv_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(media.get::<String, _>("filename"), "photo.jpg");
    assert_eq!(media.get::<i64, _>("filesize"), 2048);

    let options: Vec<String> = sqlx::query_scalar(
        "SELECT po.option_text FROM message_poll_option po
         JOIN message_poll p ON p.poll_id = po.poll_id
         JOIN messages m ON m.message_id = p.message_id
         WHERE m.conversation_id = $1
         ORDER BY po.display_order",
    )
    .bind(&conv_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(options, vec!["Pizza", "Sushi"]);

    let address: String = sqlx::query_scalar(
        "SELECT ml.address FROM message_location ml
         JOIN messages m ON m.message_id = ml.message_id
         WHERE m.conversation_id = $1",
    )
    .bind(&conv_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(address, "Berlin");
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set POSTGRES_* env vars)"]
async fn streaming_matches_batch_results() {
    let db_config = DatabaseConfig::from_env().unwrap();
    let dir = tempfile::tempdir().unwrap();

    let build_conversations = |suffix: &str| -> Vec<serde_json::Value> {
        (0..5)
            .map(|i| {
                serde_json::json!({
                    "id": format!("conv-{suffix}-{i}"),
                    "displayName": format!("Chat {i}"),
                    "MessageList": (0..40).map(|j| serde_json::json!({
                        "id": format!("m{j}"),
                        "originalarrivaltime": format!("2023-01-01T00:{:02}:{:02}Z", j / 60, j % 60),
                        "from": "u2",
                        "content": format!("<b>text {j}</b>"),
                        "messagetype": "RichText",
                    })).collect::<Vec<_>>(),
                })
            })
            .collect()
    };

    let batch_user = unique("batch");
    let stream_user = unique("stream");
    let batch_suffix = Uuid::new_v4().to_string();
    let stream_suffix = Uuid::new_v4().to_string();

    let batch_input = write_export(
        dir.path(),
        "batch.json",
        &batch_user,
        &build_conversations(&batch_suffix),
    );
    let stream_input = write_export(
        dir.path(),
        "stream.json",
        &stream_user,
        &build_conversations(&stream_suffix),
    );

    pipeline(dir.path(), db_config.clone())
        .run(&batch_input, None)
        .await
        .unwrap();
    pipeline(dir.path(), db_config.clone())
        .run_streaming(&stream_input, None)
        .await
        .unwrap();

    let pool = test_pool(&db_config).await;

    let fetch = |suffix: String| {
        let pool = pool.clone();
        async move {
            let rows = sqlx::query(
                "SELECT m.conversation_id, m.cleaned_content
                 FROM messages m
                 WHERE m.conversation_id LIKE $1
                 ORDER BY m.conversation_id, m.timestamp, m.message_id",
            )
            .bind(format!("conv-{suffix}-%"))
            .fetch_all(&pool)
            .await
            .unwrap();
            rows.iter()
                .map(|row| {
                    let conv: String = row.get("conversation_id");
                    let content: String = row.get("cleaned_content");
                    // Normalize ids so the two datasets compare directly
                    (conv.rsplit('-').next().unwrap().to_string(), content)
                })
                .collect::<Vec<_>>()
        }
    };

    let batch_rows = fetch(batch_suffix).await;
    let stream_rows = fetch(stream_suffix).await;

    assert_eq!(batch_rows.len(), 200);
    assert_eq!(batch_rows, stream_rows);
}
