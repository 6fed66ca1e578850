//! Stateless stage workers over a shared pipeline context.
//!
//! Error policy: configuration defects (bad schema, unknown receiver,
//! unparseable submission) are recorded as terminal action errors and
//! the worker returns `Ok`, so the queue substrate does not redeliver a
//! message that can never succeed. Infrastructure errors propagate as
//! `Err` and surface to the substrate's redelivery policy.

use std::sync::Arc;

use chrono::Utc;
use relay_document::{Document, PathExpr};
use relay_store::{
    ActionHistory, ActionStatus, BlobRef, BlobStore, DbTransaction, ItemLineage, MetadataStore,
    ReportFileRecord, TaskRecord, TaskStatus,
};
use relay_translate::Translator;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::run_batch;
use crate::message::ReportEvent;
use crate::queue::Queue;
use crate::receiver::{Receiver, ReportFormat};
use crate::transport::{DeliveryFile, DeliveryReceipt, RetryToken, Transport};
use crate::{Error, Result};

/// Shared dependencies of every stage worker.
pub struct PipelineContext {
    pub store: MetadataStore,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn Queue>,
    pub transport: Arc<dyn Transport>,
    pub translator: Arc<Translator>,
    pub receivers: Vec<Receiver>,
    /// Document paths hashed for duplicate detection, in declaration order.
    pub dedup_key_fields: Vec<PathExpr>,
}

impl PipelineContext {
    pub fn receiver(&self, name: &str) -> Option<&Receiver> {
        self.receivers.iter().find(|r| r.name == name)
    }
}

/// Dispatch one dequeued event to its stage worker.
pub async fn handle_event(ctx: &PipelineContext, event: &ReportEvent) -> Result<()> {
    match event {
        ReportEvent::Convert { .. } => run_convert(ctx, event).await,
        ReportEvent::Route { .. } => run_route(ctx, event).await,
        ReportEvent::Translate { .. } => run_translate(ctx, event).await,
        ReportEvent::Batch { receiver } => run_batch(ctx, receiver, Utc::now(), 0).await,
        ReportEvent::Send { .. } => run_send(ctx, event).await,
    }
}

/// Whether a failure is a defect in configuration or input data, which
/// no redelivery can fix.
pub(crate) fn is_config_defect(err: &Error) -> bool {
    matches!(
        err,
        Error::Config { .. }
            | Error::InvalidPayload { .. }
            | Error::EmptyBatchUnsupported { .. }
            | Error::Document(_)
            | Error::Schema(_)
            | Error::Translate(_)
            | Error::Csv(_)
    )
}

/// Record a terminal action error in its own transaction.
pub(crate) async fn record_terminal_error(
    ctx: &PipelineContext,
    action: &str,
    report_id: Option<Uuid>,
    details: &str,
) -> Result<()> {
    warn!(action, ?report_id, "{details}");
    let mut tx = ctx.store.begin().await?;
    let mut history = ActionHistory::new(action);
    history.set_status(ActionStatus::Error);
    if let Some(id) = report_id {
        history.track_existing_input_report(id);
    }
    history.track_action_result(details);
    history.record_action(&mut tx).await?;
    tx.commit().await?;
    Ok(())
}

pub(crate) async fn download_document(
    ctx: &PipelineContext,
    url: &str,
    digest: &str,
) -> Result<Document> {
    let blob = BlobRef {
        url: url.to_string(),
        digest: digest.to_string(),
    };
    let bytes = ctx.blobs.download(&blob).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn upload_document(
    ctx: &PipelineContext,
    sub_folder: &str,
    document: &Document,
) -> Result<BlobRef> {
    let bytes = serde_json::to_vec(document)?;
    let name = format!("{}.json", document.metadata.report_id);
    Ok(ctx.blobs.upload(sub_folder, &name, &bytes).await?)
}

/// Convert stage: parse a raw submission into the canonical document.
pub async fn run_convert(ctx: &PipelineContext, event: &ReportEvent) -> Result<()> {
    let ReportEvent::Convert {
        report_id,
        blob_url,
        digest,
        blob_sub_folder_name,
    } = event
    else {
        return Err(Error::config("convert worker received a non-convert event"));
    };

    let raw_blob = BlobRef {
        url: blob_url.clone(),
        digest: digest.clone(),
    };
    let bytes = ctx.blobs.download(&raw_blob).await?;
    let Ok(raw) = String::from_utf8(bytes) else {
        return record_terminal_error(
            ctx,
            "convert",
            Some(*report_id),
            "submission is not valid UTF-8",
        )
        .await;
    };

    let document = match ctx.translator.parse(&raw) {
        Ok(document) => document,
        Err(err) => {
            return record_terminal_error(
                ctx,
                "convert",
                Some(*report_id),
                &format!("submission could not be parsed: {err}"),
            )
            .await;
        }
    };

    let sender = document.metadata.sender_id.clone().unwrap_or_default();
    let key_fields = crate::dedup::extract_key_fields(&document, &ctx.dedup_key_fields);
    let dedup_hash = crate::dedup::digest(&sender, &key_fields);

    let mut tx = ctx.store.begin().await?;
    if ctx.store.dedup_hash_exists(&mut tx, &dedup_hash).await? {
        let mut history = ActionHistory::new("convert");
        history.set_status(ActionStatus::Error);
        history.track_existing_input_report(*report_id);
        history.track_action_result(format!("duplicate submission hash {dedup_hash}"));
        history.record_action(&mut tx).await?;
        tx.commit().await?;
        info!(%report_id, "duplicate submission dropped");
        return Ok(());
    }

    let doc_id = document.metadata.report_id;
    let doc_blob = upload_document(ctx, blob_sub_folder_name, &document).await?;

    ctx.store
        .insert_report_file(
            &mut tx,
            &ReportFileRecord {
                report_id: doc_id,
                receiver: None,
                format: "INTERNAL".to_string(),
                blob_url: doc_blob.url.clone(),
                digest: doc_blob.digest.clone(),
                dedup_hash: Some(dedup_hash),
                item_count: document.items().len(),
                created_at: Utc::now(),
            },
        )
        .await?;

    let mut history = ActionHistory::new("convert");
    history.track_existing_input_report(*report_id);
    history.track_created_report(doc_id);
    history.track_action_result(format!("parsed {} item(s)", document.items().len()));
    history.record_action(&mut tx).await?;
    tx.commit().await?;

    ctx.queue
        .enqueue(&ReportEvent::Route {
            report_id: doc_id,
            blob_url: doc_blob.url,
            digest: doc_blob.digest,
            blob_sub_folder_name: blob_sub_folder_name.clone(),
        })
        .await?;
    debug!(%doc_id, "convert complete");
    Ok(())
}

/// Route stage: match the document against receiver filters.
pub async fn run_route(ctx: &PipelineContext, event: &ReportEvent) -> Result<()> {
    let ReportEvent::Route {
        report_id,
        blob_url,
        digest,
        blob_sub_folder_name,
    } = event
    else {
        return Err(Error::config("route worker received a non-route event"));
    };

    let document = download_document(ctx, blob_url, digest).await?;
    let matched: Vec<&Receiver> = ctx
        .receivers
        .iter()
        .filter(|receiver| receiver.matches(&document))
        .collect();

    let mut tx = ctx.store.begin().await?;
    let mut history = ActionHistory::new("route");
    history.track_existing_input_report(*report_id);
    if matched.is_empty() {
        // A report no receiver wants is a normal terminal outcome.
        history.set_status(ActionStatus::None);
        history.track_action_result("no receivers matched");
        history.record_action(&mut tx).await?;
        tx.commit().await?;
        info!(%report_id, "no receivers matched");
        return Ok(());
    }
    for receiver in &matched {
        history.track_action_result(format!("matched {}.{}", receiver.organization, receiver.name));
    }
    history.record_action(&mut tx).await?;
    tx.commit().await?;

    for receiver in matched {
        ctx.queue
            .enqueue(&ReportEvent::Translate {
                report_id: *report_id,
                blob_url: blob_url.clone(),
                digest: digest.clone(),
                blob_sub_folder_name: blob_sub_folder_name.clone(),
                receiver: receiver.name.clone(),
            })
            .await?;
    }
    Ok(())
}

/// Translate stage: produce the per-receiver document.
pub async fn run_translate(ctx: &PipelineContext, event: &ReportEvent) -> Result<()> {
    let ReportEvent::Translate {
        report_id,
        blob_url,
        digest,
        blob_sub_folder_name,
        receiver,
    } = event
    else {
        return Err(Error::config(
            "translate worker received a non-translate event",
        ));
    };

    let Some(receiver) = ctx.receiver(receiver) else {
        return record_terminal_error(
            ctx,
            "translate",
            Some(*report_id),
            &format!("unknown receiver '{receiver}'"),
        )
        .await;
    };

    let document = download_document(ctx, blob_url, digest).await?;

    // HL7 formats run the schema engine and re-parse the rendered
    // message so the stored document reflects the receiver's template.
    // FHIR output passes the document through untouched.
    let translated = match receiver.format {
        ReportFormat::Hl7 | ReportFormat::Hl7Batch => {
            let rendered = match ctx
                .translator
                .serialize_hl7_with_schema(&document, &receiver.translation)
                .and_then(|rendered| ctx.translator.parse(&rendered))
            {
                Ok(translated) => translated,
                Err(err) => {
                    return record_terminal_error(
                        ctx,
                        "translate",
                        Some(*report_id),
                        &format!(
                            "translation failed for receiver '{}': {err}",
                            receiver.name
                        ),
                    )
                    .await;
                }
            };
            rendered
        }
        ReportFormat::Csv | ReportFormat::FhirNdjson => Document::merge(&[document.clone()])?,
    };

    let child_id = translated.metadata.report_id;
    let now = Utc::now();
    let child_blob = upload_document(ctx, blob_sub_folder_name, &translated).await?;

    let mut tx = ctx.store.begin().await?;
    ctx.store
        .insert_report_file(
            &mut tx,
            &ReportFileRecord {
                report_id: child_id,
                receiver: Some(receiver.name.clone()),
                format: receiver.format.as_str().to_string(),
                blob_url: child_blob.url,
                digest: child_blob.digest,
                dedup_hash: None,
                item_count: translated.items().len(),
                created_at: now,
            },
        )
        .await?;
    ctx.store
        .insert_task(
            &mut tx,
            &TaskRecord {
                report_id: child_id,
                receiver: Some(receiver.name.clone()),
                next_action: "batch".to_string(),
                next_action_at: now,
                retry_token: None,
                status: TaskStatus::Translated,
            },
        )
        .await?;

    let mut history = ActionHistory::new("translate");
    history.track_existing_input_report(*report_id);
    history.track_created_report(child_id);
    let shared = translated.items().len().min(document.items().len());
    history.track_item_lineages(
        (0..shared).map(|i| ItemLineage::new(child_id, i, *report_id, i)),
    );
    history.record_action(&mut tx).await?;
    tx.commit().await?;

    // Batch runs on its own clock; nothing to enqueue.
    debug!(%child_id, receiver = %receiver.name, "translate complete");
    Ok(())
}

/// Send stage: hand a finalized delivery file to the transport.
pub async fn run_send(ctx: &PipelineContext, event: &ReportEvent) -> Result<()> {
    let ReportEvent::Send {
        report_id,
        blob_url,
        digest,
        blob_sub_folder_name: _,
        receiver,
        filename,
    } = event
    else {
        return Err(Error::config("send worker received a non-send event"));
    };

    let Some(receiver) = ctx.receiver(receiver) else {
        return record_terminal_error(
            ctx,
            "send",
            Some(*report_id),
            &format!("unknown receiver '{receiver}'"),
        )
        .await;
    };

    let blob = BlobRef {
        url: blob_url.clone(),
        digest: digest.clone(),
    };
    let content = ctx.blobs.download(&blob).await?;

    let mut tx = ctx.store.begin().await?;
    let item_count = ctx
        .store
        .get_report_file(&mut tx, *report_id)
        .await?
        .map_or(0, |record| record.item_count);

    let file = DeliveryFile {
        filename: filename.clone(),
        content,
        item_count,
    };

    deliver(ctx, receiver, *report_id, &file, None, 0, &mut tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Resend job: drain persisted retry tokens for a receiver and retry
/// only the referenced items. Retry counts are unbounded here;
/// stopping is operational policy.
pub async fn run_resend(ctx: &PipelineContext, receiver_name: &str) -> Result<()> {
    let Some(receiver) = ctx.receiver(receiver_name) else {
        return record_terminal_error(
            ctx,
            "resend",
            None,
            &format!("unknown receiver '{receiver_name}'"),
        )
        .await;
    };

    let mut tx = ctx.store.begin().await?;
    let claims = ctx
        .store
        .outstanding_retry_tokens(&mut tx, receiver_name)
        .await?;
    tx.rollback().await?;
    info!(receiver = receiver_name, tokens = claims.len(), "resend tick");

    // Each token is consumed in the transaction that records the
    // retry's outcome, so a failure before commit leaves it parked.
    for claim in claims {
        let token = RetryToken::from_json(&claim.token_json)?;

        let mut tx = ctx.store.begin().await?;
        if !ctx.store.claim_retry_token(&mut tx, claim.report_id).await? {
            // Another resend tick got there first.
            tx.rollback().await?;
            continue;
        }
        let Some(record) = ctx.store.get_report_file(&mut tx, claim.report_id).await? else {
            tx.rollback().await?;
            record_terminal_error(
                ctx,
                "resend",
                Some(claim.report_id),
                "retry token references a missing report",
            )
            .await?;
            continue;
        };

        let blob = BlobRef {
            url: record.blob_url.clone(),
            digest: record.digest.clone(),
        };
        let content = ctx.blobs.download(&blob).await?;
        let file = DeliveryFile {
            filename: receiver.delivery_filename(claim.report_id),
            content,
            item_count: record.item_count,
        };
        let items = if RetryToken::is_all_items(Some(&token.items)) {
            None
        } else {
            Some(token.items.clone())
        };

        deliver(
            ctx,
            receiver,
            claim.report_id,
            &file,
            items.as_deref(),
            token.retry_count + 1,
            &mut tx,
        )
        .await?;
        tx.commit().await?;
    }
    Ok(())
}

/// One delivery attempt plus its outcome record, written through the
/// caller's transaction. The caller commits.
async fn deliver(
    ctx: &PipelineContext,
    receiver: &Receiver,
    report_id: Uuid,
    file: &DeliveryFile,
    items: Option<&[String]>,
    next_retry_count: i32,
    tx: &mut DbTransaction,
) -> Result<()> {
    let outcome = ctx.transport.send(&receiver.transport, file, items).await?;

    let mut history = ActionHistory::new("send");
    history.track_existing_input_report(report_id);

    match outcome {
        None => {
            let receipt = DeliveryReceipt::for_file(file);
            ctx.store
                .update_task_status(tx, report_id, TaskStatus::SendQueued, TaskStatus::Sent)
                .await?;
            history.track_action_result(format!(
                "delivered {} ({} bytes, {} items)",
                receipt.filename, receipt.byte_count, receipt.item_count
            ));
            info!(%report_id, filename = %receipt.filename, "delivered");
        }
        Some(failed) => {
            // Recoverable: persist the token and mark a warning, never
            // a hard error.
            let token = RetryToken::new(next_retry_count, failed.items);
            ctx.store
                .save_retry_token(tx, report_id, &token.to_json()?)
                .await?;
            history.set_status(ActionStatus::Warning);
            history.track_action_result(format!(
                "delivery of {} failed; retry token saved",
                file.filename
            ));
            warn!(%report_id, filename = %file.filename, "delivery failed, will retry");
        }
    }
    history.record_action(tx).await?;
    Ok(())
}
