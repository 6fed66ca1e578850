//! Full pipeline run: one HL7 ORU submission through convert, route,
//! translate, batch (split + merge), and send.

use std::path::PathBuf;
use std::sync::Arc;

use relay_document::PathExpr;
use relay_pipeline::{
    FileTransport, MemoryQueue, PipelineContext, Queue, ReportEvent, handle_event,
    receivers_from_yaml, run_batch,
};
use relay_store::{
    ActionStatus, BlobStore, ConnectionConfig, MemoryBlobStore, MetadataStore, Row,
};
use relay_translate::{Translator, TranslatorConfig};
use uuid::Uuid;

const ORU: &str = "MSH|^~\\&|LAB|ACME|ELR|STATE|20240102030405||ORU^R01|CTRL123|P|2.5.1\r\
PID|1||PATID1234||DOE^JANE||19800101|F\r\
OBR|1|||94558-4^SARS-CoV-2 Ag^LN\r\
OBX|1|CWE|94558-4^SARS-CoV-2 Ag^LN||260373001^Detected^SCT\r\
OBX|2|CWE|95419-8^Symptomatic^LN||N^No^HL70136";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("relay_pipeline=debug,relay_store=debug")
        .with_test_writer()
        .try_init();
}

async fn context(delivery_dir: &std::path::Path) -> (PipelineContext, Arc<MemoryQueue>) {
    let store = MetadataStore::open(ConnectionConfig::in_memory())
        .await
        .unwrap();
    let queue = Arc::new(MemoryQueue::new());

    let receivers_yaml = format!(
        r"
- organization: state-doh
  name: elr
  format: HL7
  batch: MERGE
  timing:
    number_per_day: 24
    max_report_count: 100
  jurisdictional_filter:
    - exists(PID/f5)
  transport:
    type: file
    path: {}
  translation: oru-template
",
        delivery_dir.display()
    );

    let translator = Translator::new(
        TranslatorConfig::new(vec![PathBuf::from("tests/data")])
            .with_template("ORU_R01", "2.5.1", "oru-template"),
    );

    let ctx = PipelineContext {
        store,
        blobs: Arc::new(MemoryBlobStore::new()),
        queue: queue.clone(),
        transport: Arc::new(FileTransport::new()),
        translator: Arc::new(translator),
        receivers: receivers_from_yaml(&receivers_yaml).unwrap(),
        dedup_key_fields: vec![
            PathExpr::parse("MSH/f10").unwrap(),
            PathExpr::parse("PID/f5").unwrap(),
        ],
    };
    (ctx, queue)
}

async fn drain(ctx: &PipelineContext) {
    while let Some(event) = ctx.queue.dequeue().await.unwrap() {
        handle_event(ctx, &event).await.unwrap();
    }
}

async fn warning_tokens(ctx: &PipelineContext) -> Vec<String> {
    let mut tx = ctx.store.begin().await.unwrap();
    let mut filter = Row::new();
    filter.insert(
        "status".to_string(),
        relay_store::DbValue::String("send_warning".to_string()),
    );
    let rows = tx.query_rows("task", Some(&filter)).await.unwrap();
    tx.commit().await.unwrap();
    rows.iter()
        .map(|row| match row.get("retry_token") {
            Some(relay_store::DbValue::String(json)) => json.clone(),
            other => panic!("expected a parked token, found {other:?}"),
        })
        .collect()
}

#[tokio::test]
async fn oru_submission_flows_to_a_merged_delivery_file() {
    init_tracing();
    let delivery_dir = tempfile::tempdir().unwrap();
    let (ctx, queue) = context(delivery_dir.path()).await;

    // A raw submission lands in the blob store and triggers convert.
    let raw_blob = ctx
        .blobs
        .upload("submissions", "oru-1.hl7", ORU.as_bytes())
        .await
        .unwrap();
    let submission_id = Uuid::new_v4();
    queue
        .enqueue(&ReportEvent::Convert {
            report_id: submission_id,
            blob_url: raw_blob.url.clone(),
            digest: raw_blob.digest.clone(),
            blob_sub_folder_name: "reports".to_string(),
        })
        .await
        .unwrap();

    // Convert, route, translate. Translate enqueues nothing; batch
    // runs on its own clock.
    drain(&ctx).await;
    assert!(queue.is_empty().await);

    // Exactly one per-receiver report is ready for batching.
    let mut tx = ctx.store.begin().await.unwrap();
    let tasks = tx.query_rows("task", None).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        tasks[0].get("status"),
        Some(&relay_store::DbValue::String("translated".to_string()))
    );

    // Batch splits the two items and merges them back into one file.
    run_batch(&ctx, "elr", chrono::Utc::now(), 0).await.unwrap();
    drain(&ctx).await;

    let delivered: Vec<_> = std::fs::read_dir(delivery_dir.path())
        .unwrap()
        .map(|entry| entry.unwrap())
        .collect();
    assert_eq!(delivered.len(), 1);
    let filename = delivered[0].file_name().into_string().unwrap();
    assert!(filename.starts_with("state-doh-elr-"));
    assert!(filename.ends_with(".hl7"));

    // The delivered file is a well-formed message carrying both items.
    let content = std::fs::read_to_string(delivered[0].path()).unwrap();
    let reparsed = ctx.translator.parse(&content).unwrap();
    assert_eq!(reparsed.items().len(), 2);
    assert!(content.contains("260373001^Detected^SCT"));
    assert!(content.contains("DOE^JANE"));

    // The sent report's task reached its terminal status.
    let output_id = Uuid::parse_str(
        filename
            .trim_start_matches("state-doh-elr-")
            .trim_end_matches(".hl7"),
    )
    .unwrap();
    let mut tx = ctx.store.begin().await.unwrap();
    let mut filter = Row::new();
    filter.insert(
        "report_id".to_string(),
        relay_store::DbValue::String(output_id.to_string()),
    );
    let rows = tx.query_rows("task", Some(&filter)).await.unwrap();
    assert_eq!(
        rows[0].get("status"),
        Some(&relay_store::DbValue::String("sent".to_string()))
    );

    // Lineage: both delivered items trace back to one translated report.
    let edges = ctx
        .store
        .lineage_parents(&mut tx, output_id)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(edges.len(), 2);
    let mut parents: Vec<Uuid> = edges.iter().map(|e| e.parent_report_id).collect();
    parents.sort();
    parents.dedup();
    assert_eq!(parents.len(), 1);
    let child_indices: Vec<usize> = edges.iter().map(|e| e.child_index).collect();
    assert!(child_indices.contains(&0));
    assert!(child_indices.contains(&1));
}

#[tokio::test]
async fn duplicate_submissions_stop_at_convert() {
    init_tracing();
    let delivery_dir = tempfile::tempdir().unwrap();
    let (ctx, queue) = context(delivery_dir.path()).await;

    let raw_blob = ctx
        .blobs
        .upload("submissions", "oru-1.hl7", ORU.as_bytes())
        .await
        .unwrap();

    for _ in 0..2 {
        queue
            .enqueue(&ReportEvent::Convert {
                report_id: Uuid::new_v4(),
                blob_url: raw_blob.url.clone(),
                digest: raw_blob.digest.clone(),
                blob_sub_folder_name: "reports".to_string(),
            })
            .await
            .unwrap();
    }
    drain(&ctx).await;

    // Only the first submission produced a document and a task.
    let mut tx = ctx.store.begin().await.unwrap();
    let tasks = tx.query_rows("task", None).await.unwrap();
    let mut filter = Row::new();
    filter.insert(
        "status".to_string(),
        relay_store::DbValue::String(ActionStatus::Error.as_str().to_string()),
    );
    let errors = tx.query_rows("action_log", Some(&filter)).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(tasks.len(), 1);
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn failed_delivery_saves_a_retry_token_and_resend_recovers() {
    init_tracing();
    let delivery_dir = tempfile::tempdir().unwrap();
    let (ctx, queue) = context(delivery_dir.path()).await;

    let raw_blob = ctx
        .blobs
        .upload("submissions", "oru-1.hl7", ORU.as_bytes())
        .await
        .unwrap();
    queue
        .enqueue(&ReportEvent::Convert {
            report_id: Uuid::new_v4(),
            blob_url: raw_blob.url.clone(),
            digest: raw_blob.digest.clone(),
            blob_sub_folder_name: "reports".to_string(),
        })
        .await
        .unwrap();
    drain(&ctx).await;
    run_batch(&ctx, "elr", chrono::Utc::now(), 0).await.unwrap();

    // Force the delivery to fail by pre-creating the target file.
    let send_event = queue.dequeue().await.unwrap().unwrap();
    let ReportEvent::Send { ref filename, .. } = send_event else {
        panic!("expected a send event");
    };
    std::fs::write(delivery_dir.path().join(filename), b"occupied").unwrap();
    handle_event(&ctx, &send_event).await.unwrap();

    // The failure is recoverable: a token is parked on the task.
    let mut tx = ctx.store.begin().await.unwrap();
    let tokens = tx
        .query_rows("task", None)
        .await
        .unwrap()
        .into_iter()
        .filter(|row| {
            matches!(
                row.get("status"),
                Some(relay_store::DbValue::String(s)) if s == "send_warning"
            )
        })
        .count();
    tx.commit().await.unwrap();
    assert_eq!(tokens, 1);

    // Clearing the obstruction lets the resend job deliver.
    std::fs::remove_file(delivery_dir.path().join(filename)).unwrap();
    relay_pipeline::run_resend(&ctx, "elr").await.unwrap();

    let content = std::fs::read_to_string(delivery_dir.path().join(filename)).unwrap();
    assert!(content.starts_with("MSH|"));

    let mut tx = ctx.store.begin().await.unwrap();
    let mut filter = Row::new();
    filter.insert(
        "status".to_string(),
        relay_store::DbValue::String("sent".to_string()),
    );
    let sent = tx.query_rows("task", Some(&filter)).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn resend_keeps_the_token_while_the_destination_is_broken() {
    init_tracing();
    let scratch = tempfile::tempdir().unwrap();
    // A regular file where the delivery directory should be.
    let delivery_dir = scratch.path().join("out");
    std::fs::write(&delivery_dir, b"in the way").unwrap();
    let (ctx, queue) = context(&delivery_dir).await;

    let raw_blob = ctx
        .blobs
        .upload("submissions", "oru-1.hl7", ORU.as_bytes())
        .await
        .unwrap();
    queue
        .enqueue(&ReportEvent::Convert {
            report_id: Uuid::new_v4(),
            blob_url: raw_blob.url.clone(),
            digest: raw_blob.digest.clone(),
            blob_sub_folder_name: "reports".to_string(),
        })
        .await
        .unwrap();
    drain(&ctx).await;
    run_batch(&ctx, "elr", chrono::Utc::now(), 0).await.unwrap();
    drain(&ctx).await;

    // The send attempt failed recoverably.
    let tokens = warning_tokens(&ctx).await;
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].contains("\"retryCount\":0"));

    // A resend against the broken destination parks the token back
    // instead of stranding the task.
    relay_pipeline::run_resend(&ctx, "elr").await.unwrap();
    let tokens = warning_tokens(&ctx).await;
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].contains("\"retryCount\":1"));

    // Clearing the obstruction lets the next resend deliver.
    std::fs::remove_file(&delivery_dir).unwrap();
    relay_pipeline::run_resend(&ctx, "elr").await.unwrap();
    assert!(warning_tokens(&ctx).await.is_empty());
    let delivered: Vec<_> = std::fs::read_dir(&delivery_dir).unwrap().collect();
    assert_eq!(delivered.len(), 1);
}
