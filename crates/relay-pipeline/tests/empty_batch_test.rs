//! Empty batch-tick policies: well-formed empty delivery files,
//! once-only suppression, and the unsupported single-message case.

use std::path::PathBuf;
use std::sync::Arc;

use relay_pipeline::{
    FileTransport, MemoryQueue, PipelineContext, Queue, handle_event, receivers_from_yaml,
    run_batch,
};
use relay_store::{ConnectionConfig, DbValue, MemoryBlobStore, MetadataStore, Row};
use relay_translate::{Translator, TranslatorConfig};

async fn context(delivery_dir: &std::path::Path) -> (PipelineContext, Arc<MemoryQueue>) {
    let store = MetadataStore::open(ConnectionConfig::in_memory())
        .await
        .unwrap();
    let queue = Arc::new(MemoryQueue::new());

    let receivers_yaml = format!(
        r"
- organization: state-doh
  name: elr-batch
  format: HL7_BATCH
  batch: MERGE
  timing:
    number_per_day: 24
    when_empty:
      action: SEND
      only_once: true
  transport:
    type: file
    path: {dir}
  translation: oru-template
- organization: state-doh
  name: csv-feed
  format: CSV
  timing:
    number_per_day: 24
    when_empty:
      action: SEND
  transport:
    type: file
    path: {dir}
  translation: oru-template
- organization: state-doh
  name: elr-single
  format: HL7
  timing:
    number_per_day: 24
    when_empty:
      action: SEND
  transport:
    type: file
    path: {dir}
  translation: oru-template
",
        dir = delivery_dir.display()
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
        dedup_key_fields: Vec::new(),
    };
    (ctx, queue)
}

async fn drain(ctx: &PipelineContext) {
    while let Some(event) = ctx.queue.dequeue().await.unwrap() {
        handle_event(ctx, &event).await.unwrap();
    }
}

fn delivered_files(dir: &std::path::Path, prefix: &str) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|entry| entry.unwrap().file_name().into_string().unwrap())
        .filter(|name| name.starts_with(prefix))
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn empty_hl7_batch_tick_sends_envelopes_only_once() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _queue) = context(dir.path()).await;

    run_batch(&ctx, "elr-batch", chrono::Utc::now(), 0)
        .await
        .unwrap();
    drain(&ctx).await;

    let files = delivered_files(dir.path(), "state-doh-elr-batch-");
    assert_eq!(files.len(), 1);
    assert!(files[0].ends_with(".hl7"));
    let content = std::fs::read_to_string(dir.path().join(&files[0])).unwrap();
    assert_eq!(content, "FHS|^~\\&\rBHS|^~\\&\rBTS|0\rFTS|1");

    // only_once: a later empty tick sends nothing.
    run_batch(&ctx, "elr-batch", chrono::Utc::now(), 0)
        .await
        .unwrap();
    drain(&ctx).await;
    assert_eq!(delivered_files(dir.path(), "state-doh-elr-batch-").len(), 1);
}

#[tokio::test]
async fn empty_csv_tick_sends_a_header_only_file_each_tick() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _queue) = context(dir.path()).await;

    run_batch(&ctx, "csv-feed", chrono::Utc::now(), 0)
        .await
        .unwrap();
    drain(&ctx).await;
    run_batch(&ctx, "csv-feed", chrono::Utc::now(), 0)
        .await
        .unwrap();
    drain(&ctx).await;

    let files = delivered_files(dir.path(), "state-doh-csv-feed-");
    assert_eq!(files.len(), 2);
    for name in &files {
        let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(content, "item_index,field,value\n");
    }
}

#[tokio::test]
async fn empty_single_message_tick_is_a_recorded_error() {
    let dir = tempfile::tempdir().unwrap();
    let (ctx, queue) = context(dir.path()).await;

    run_batch(&ctx, "elr-single", chrono::Utc::now(), 0)
        .await
        .unwrap();

    // Nothing queued, nothing delivered; the defect is in the log.
    assert!(queue.is_empty().await);
    assert!(delivered_files(dir.path(), "state-doh-elr-single-").is_empty());

    let mut tx = ctx.store.begin().await.unwrap();
    let mut filter = Row::new();
    filter.insert("status".to_string(), DbValue::String("error".to_string()));
    let errors = tx.query_rows("action_log", Some(&filter)).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(errors.len(), 1);
    match errors[0].get("result") {
        Some(DbValue::String(result)) => assert!(result.contains("elr-single")),
        other => panic!("expected an error result, found {other:?}"),
    }
}
