//! Batch engine: group ready per-receiver reports into delivery files.
//!
//! A tick claims ready headers inside one store transaction, builds the
//! receiver's delivery files, and commits the claim, the output rows,
//! and the lineage together. Blobs are uploaded before the task rows
//! commit, so a send task never references a missing blob. Batch-level
//! failures are retried by widening the lookback window on the next
//! tick, not by a separate retry queue.

use chrono::{DateTime, Duration, Utc};
use relay_document::{Document, Node};
use relay_store::{
    ActionHistory, ActionStatus, DbTransaction, DbValue, ItemLineage, ReportFileRecord, Row,
    TaskRecord, TaskStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::ReportEvent;
use crate::receiver::{BatchOperation, EmptyAction, Receiver, ReportFormat};
use crate::stages::{PipelineContext, download_document, is_config_defect, record_terminal_error};
use crate::{Error, Result};

const DELIVERY_SUB_FOLDER: &str = "delivery";

/// How far back a tick looks for ready headers, in minutes. One full
/// cadence interval per retry attempt, plus padding for clock skew.
pub fn lookback_minutes(number_per_day: u32, retry_count: i32) -> i64 {
    let interval = 1440 / i64::from(number_per_day.max(1));
    interval * (i64::from(retry_count) + 1) + 10
}

/// One batching unit: a document plus the source item behind each of
/// its items, in item order.
struct Candidate {
    document: Document,
    origins: Vec<(Uuid, usize)>,
}

/// Run one batch tick for a receiver.
pub async fn run_batch(
    ctx: &PipelineContext,
    receiver_name: &str,
    now: DateTime<Utc>,
    retry_count: i32,
) -> Result<()> {
    let Some(receiver) = ctx.receiver(receiver_name) else {
        return record_terminal_error(
            ctx,
            "batch",
            None,
            &format!("unknown receiver '{receiver_name}'"),
        )
        .await;
    };

    let lookback = lookback_minutes(receiver.timing.number_per_day, retry_count);
    let backstop = now - Duration::minutes(lookback);

    let mut tx = ctx.store.begin().await?;
    let headers = ctx
        .store
        .fetch_and_claim_headers(&mut tx, receiver_name, backstop, now)
        .await?;

    if headers.is_empty() {
        return empty_tick(ctx, receiver, tx, now).await;
    }

    let mut candidates = Vec::new();
    for header in &headers {
        let document = download_document(ctx, &header.blob_url, &header.digest).await?;
        if receiver.format.is_single_item() {
            for (index, child) in document.split().into_iter().enumerate() {
                candidates.push(Candidate {
                    origins: vec![(header.report_id, index)],
                    document: child,
                });
            }
        } else {
            let origins = (0..document.items().len())
                .map(|index| (header.report_id, index))
                .collect();
            candidates.push(Candidate { document, origins });
        }
    }

    let groups = match receiver.batch {
        BatchOperation::Merge => chunk_by_items(candidates, receiver.timing.max_report_count),
        BatchOperation::None => candidates.into_iter().map(|c| vec![c]).collect(),
    };

    let mut history = ActionHistory::new("batch");
    for header in &headers {
        history.track_existing_input_report(header.report_id);
    }

    let mut pending = Vec::new();
    for group in groups {
        match build_output(ctx, receiver, &group, now, &mut tx, &mut history).await {
            Ok(event) => pending.push(event),
            Err(err) if is_config_defect(&err) => {
                // Leave the headers unclaimed; the backstop window
                // re-includes them once the configuration is fixed.
                warn!(receiver = receiver_name, "batch output failed: {err}");
                tx.rollback().await?;
                return record_terminal_error(
                    ctx,
                    "batch",
                    None,
                    &format!("batch output failed for '{receiver_name}': {err}"),
                )
                .await;
            }
            Err(err) => return Err(err),
        }
    }
    history.track_action_result(format!(
        "batched {} header(s) into {} file(s)",
        headers.len(),
        pending.len()
    ));
    history.record_action(&mut tx).await?;
    tx.commit().await?;

    for event in &pending {
        ctx.queue.enqueue(event).await?;
    }
    info!(
        receiver = receiver_name,
        headers = headers.len(),
        outputs = pending.len(),
        "batch tick complete"
    );
    Ok(())
}

/// Render, upload, and persist one delivery file; returns its send event.
async fn build_output(
    ctx: &PipelineContext,
    receiver: &Receiver,
    group: &[Candidate],
    now: DateTime<Utc>,
    tx: &mut DbTransaction,
    history: &mut ActionHistory,
) -> Result<ReportEvent> {
    let body = render_body(ctx, receiver, group)?;
    let item_count: usize = group.iter().map(|c| c.origins.len()).sum();

    let output_id = Uuid::new_v4();
    let filename = receiver.delivery_filename(output_id);
    let blob = ctx
        .blobs
        .upload(DELIVERY_SUB_FOLDER, &filename, &body)
        .await?;

    ctx.store
        .insert_report_file(
            tx,
            &ReportFileRecord {
                report_id: output_id,
                receiver: Some(receiver.name.clone()),
                format: receiver.format.as_str().to_string(),
                blob_url: blob.url.clone(),
                digest: blob.digest.clone(),
                dedup_hash: None,
                item_count,
                created_at: now,
            },
        )
        .await?;
    ctx.store
        .insert_task(
            tx,
            &TaskRecord {
                report_id: output_id,
                receiver: Some(receiver.name.clone()),
                next_action: "send".to_string(),
                next_action_at: now,
                retry_token: None,
                status: TaskStatus::SendQueued,
            },
        )
        .await?;

    history.track_created_report(output_id);
    let mut child_index = 0;
    for candidate in group {
        for (parent_id, parent_index) in &candidate.origins {
            history.track_item_lineages([ItemLineage::new(
                output_id,
                child_index,
                *parent_id,
                *parent_index,
            )]);
            child_index += 1;
        }
    }

    Ok(ReportEvent::Send {
        report_id: output_id,
        blob_url: blob.url,
        digest: blob.digest,
        blob_sub_folder_name: DELIVERY_SUB_FOLDER.to_string(),
        receiver: receiver.name.clone(),
        filename,
    })
}

/// A tick that found no ready headers.
async fn empty_tick(
    ctx: &PipelineContext,
    receiver: &Receiver,
    mut tx: DbTransaction,
    now: DateTime<Utc>,
) -> Result<()> {
    if receiver.timing.when_empty.action == EmptyAction::None {
        let mut history = ActionHistory::new("batch");
        history.set_status(ActionStatus::None);
        history.track_action_result("no ready headers");
        history.record_action(&mut tx).await?;
        tx.commit().await?;
        return Ok(());
    }

    // Empty-file actions are looked up by name so only_once can check
    // whether one was already sent.
    let action_name = format!("empty_batch:{}.{}", receiver.organization, receiver.name);
    if receiver.timing.when_empty.only_once {
        let mut filter = Row::new();
        filter.insert("action".to_string(), DbValue::String(action_name.clone()));
        if !tx.query_rows("action_log", Some(&filter)).await?.is_empty() {
            let mut history = ActionHistory::new("batch");
            history.set_status(ActionStatus::None);
            history.track_action_result("empty delivery already sent");
            history.record_action(&mut tx).await?;
            tx.commit().await?;
            return Ok(());
        }
    }

    let body = match receiver.format {
        ReportFormat::Hl7 => {
            // A single HL7 message has no well-formed empty rendition.
            tx.rollback().await?;
            let err = Error::EmptyBatchUnsupported {
                receiver: receiver.name.clone(),
            };
            return record_terminal_error(ctx, "batch", None, &err.to_string()).await;
        }
        ReportFormat::Hl7Batch => render_hl7_batch(&[]).into_bytes(),
        ReportFormat::Csv => render_csv(&[])?,
        ReportFormat::FhirNdjson => Vec::new(),
    };

    let output_id = Uuid::new_v4();
    let filename = receiver.delivery_filename(output_id);
    let blob = ctx
        .blobs
        .upload(DELIVERY_SUB_FOLDER, &filename, &body)
        .await?;

    ctx.store
        .insert_report_file(
            &mut tx,
            &ReportFileRecord {
                report_id: output_id,
                receiver: Some(receiver.name.clone()),
                format: receiver.format.as_str().to_string(),
                blob_url: blob.url.clone(),
                digest: blob.digest.clone(),
                dedup_hash: None,
                item_count: 0,
                created_at: now,
            },
        )
        .await?;
    ctx.store
        .insert_task(
            &mut tx,
            &TaskRecord {
                report_id: output_id,
                receiver: Some(receiver.name.clone()),
                next_action: "send".to_string(),
                next_action_at: now,
                retry_token: None,
                status: TaskStatus::SendQueued,
            },
        )
        .await?;

    let mut history = ActionHistory::new(action_name);
    history.track_created_report(output_id);
    history.track_action_result("empty delivery file");
    history.record_action(&mut tx).await?;
    tx.commit().await?;

    ctx.queue
        .enqueue(&ReportEvent::Send {
            report_id: output_id,
            blob_url: blob.url,
            digest: blob.digest,
            blob_sub_folder_name: DELIVERY_SUB_FOLDER.to_string(),
            receiver: receiver.name.clone(),
            filename,
        })
        .await?;
    info!(receiver = %receiver.name, "sent empty delivery file");
    Ok(())
}

/// Group candidates so no group exceeds the item cap. Unbounded means
/// one group.
fn chunk_by_items(candidates: Vec<Candidate>, max: Option<usize>) -> Vec<Vec<Candidate>> {
    let Some(max) = max.filter(|m| *m > 0) else {
        return vec![candidates];
    };

    let mut groups = Vec::new();
    let mut current: Vec<Candidate> = Vec::new();
    let mut count = 0;
    for candidate in candidates {
        let items = candidate.origins.len().max(1);
        if !current.is_empty() && count + items > max {
            groups.push(std::mem::take(&mut current));
            count = 0;
        }
        count += items;
        current.push(candidate);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn render_body(ctx: &PipelineContext, receiver: &Receiver, group: &[Candidate]) -> Result<Vec<u8>> {
    match receiver.format {
        ReportFormat::Hl7 => {
            let documents: Vec<Document> =
                group.iter().map(|c| c.document.clone()).collect();
            let merged = Document::merge(&documents)?;
            let rendered = ctx
                .translator
                .serialize_hl7_with_schema(&merged, &receiver.translation)?;
            Ok(rendered.into_bytes())
        }
        ReportFormat::Hl7Batch => {
            let mut messages = Vec::with_capacity(group.len());
            for candidate in group {
                messages.push(
                    ctx.translator
                        .serialize_hl7_with_schema(&candidate.document, &receiver.translation)?,
                );
            }
            Ok(render_hl7_batch(&messages).into_bytes())
        }
        ReportFormat::Csv => {
            let items: Vec<&Node> = group
                .iter()
                .flat_map(|c| c.document.items())
                .collect();
            render_csv(&items)
        }
        ReportFormat::FhirNdjson => {
            let mut out = Vec::new();
            for candidate in group {
                out.extend_from_slice(&serde_json::to_vec(&candidate.document)?);
                out.push(b'\n');
            }
            Ok(out)
        }
    }
}

/// Wrap rendered messages in FHS/BHS ... BTS/FTS batch envelopes.
fn render_hl7_batch(messages: &[String]) -> String {
    let mut out = String::new();
    out.push_str("FHS|^~\\&\r");
    out.push_str("BHS|^~\\&\r");
    for message in messages {
        out.push_str(message);
        out.push('\r');
    }
    out.push_str(&format!("BTS|{}\r", messages.len()));
    out.push_str("FTS|1");
    out
}

/// Long-format CSV: one record per leaf value of each item.
fn render_csv(items: &[&Node]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["item_index", "field", "value"])?;
    for (index, item) in items.iter().enumerate() {
        let mut rows = Vec::new();
        collect_leaves(item, String::new(), &mut rows);
        for (path, value) in rows {
            writer.write_record([index.to_string(), path, value])?;
        }
    }
    writer
        .into_inner()
        .map_err(|err| Error::config(format!("csv buffer error: {err}")))
}

fn collect_leaves(node: &Node, prefix: String, out: &mut Vec<(String, String)>) {
    for child in &node.children {
        let path = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{prefix}/{}", child.name)
        };
        if let Some(value) = child.value.as_ref().and_then(relay_document::Value::as_string) {
            if !value.is_empty() {
                out.push((path.clone(), value));
            }
        }
        collect_leaves(child, path, out);
    }
}
