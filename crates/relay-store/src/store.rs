//! Metadata store operations over the report, task, and audit tables.
//!
//! All operations take a [`DbTransaction`] so callers can commit a
//! stage's state change, its lineage edges, and its action record
//! atomically.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::connection::{DbConnection, DbTransaction};
use crate::schema::{DbValue, Row};
use crate::{ConnectionConfig, Error, Result};

pub(crate) const TABLE_REPORT_FILE: &str = "report_file";
pub(crate) const TABLE_TASK: &str = "task";
pub(crate) const TABLE_ACTION_LOG: &str = "action_log";
pub(crate) const TABLE_ITEM_LINEAGE: &str = "item_lineage";

/// Lifecycle of a per-report task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Per-receiver output persisted, waiting for a batch tick.
    Translated,
    /// Claimed by a batch tick.
    Batched,
    /// Delivery file uploaded, send task enqueued.
    SendQueued,
    /// Delivered.
    Sent,
    /// Delivery failed recoverably; a retry token is attached.
    SendWarning,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Translated => "translated",
            Self::Batched => "batched",
            Self::SendQueued => "send_queued",
            Self::Sent => "sent",
            Self::SendWarning => "send_warning",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "translated" => Ok(Self::Translated),
            "batched" => Ok(Self::Batched),
            "send_queued" => Ok(Self::SendQueued),
            "sent" => Ok(Self::Sent),
            "send_warning" => Ok(Self::SendWarning),
            other => Err(Error::query(
                TABLE_TASK,
                format!("Unknown task status '{other}'"),
            )),
        }
    }
}

/// Outcome recorded for a pipeline action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    /// Recoverable failure (e.g. a delivery that produced a retry token).
    Warning,
    Error,
    /// The action ran but had nothing to do.
    None,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::None => "none",
        }
    }
}

/// One stored report version.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportFileRecord {
    pub report_id: Uuid,
    pub receiver: Option<String>,
    pub format: String,
    pub blob_url: String,
    pub digest: String,
    pub dedup_hash: Option<String>,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

impl ReportFileRecord {
    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("report_id".into(), DbValue::String(self.report_id.to_string()));
        row.insert("receiver".into(), opt_string(self.receiver.clone()));
        row.insert("format".into(), DbValue::String(self.format.clone()));
        row.insert("blob_url".into(), DbValue::String(self.blob_url.clone()));
        row.insert("digest".into(), DbValue::String(self.digest.clone()));
        row.insert("dedup_hash".into(), opt_string(self.dedup_hash.clone()));
        row.insert("item_count".into(), DbValue::Integer(self.item_count as i64));
        row.insert(
            "created_at".into(),
            DbValue::String(self.created_at.to_rfc3339()),
        );
        row
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            report_id: uuid_column(row, TABLE_REPORT_FILE, "report_id")?,
            receiver: text_opt(row, "receiver"),
            format: text(row, TABLE_REPORT_FILE, "format")?,
            blob_url: text(row, TABLE_REPORT_FILE, "blob_url")?,
            digest: text(row, TABLE_REPORT_FILE, "digest")?,
            dedup_hash: text_opt(row, "dedup_hash"),
            item_count: integer(row, TABLE_REPORT_FILE, "item_count")?.max(0) as usize,
            created_at: timestamp(row, TABLE_REPORT_FILE, "created_at")?,
        })
    }
}

/// One per-report task row.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub report_id: Uuid,
    pub receiver: Option<String>,
    pub next_action: String,
    pub next_action_at: DateTime<Utc>,
    pub retry_token: Option<String>,
    pub status: TaskStatus,
}

impl TaskRecord {
    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("report_id".into(), DbValue::String(self.report_id.to_string()));
        row.insert("receiver".into(), opt_string(self.receiver.clone()));
        row.insert("next_action".into(), DbValue::String(self.next_action.clone()));
        row.insert(
            "next_action_at".into(),
            DbValue::String(self.next_action_at.to_rfc3339()),
        );
        row.insert("retry_token".into(), opt_string(self.retry_token.clone()));
        row.insert("status".into(), DbValue::String(self.status.as_str().into()));
        row
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            report_id: uuid_column(row, TABLE_TASK, "report_id")?,
            receiver: text_opt(row, "receiver"),
            next_action: text(row, TABLE_TASK, "next_action")?,
            next_action_at: timestamp(row, TABLE_TASK, "next_action_at")?,
            retry_token: text_opt(row, "retry_token"),
            status: TaskStatus::parse(&text(row, TABLE_TASK, "status")?)?,
        })
    }
}

/// Unit of work selected for batching: a claimed, not-yet-delivered
/// report plus its task metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub report_id: Uuid,
    pub receiver: String,
    pub blob_url: String,
    pub digest: String,
    pub item_count: usize,
    pub next_action_at: DateTime<Utc>,
}

/// A persisted retry token handed back to the resend job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryClaim {
    pub report_id: Uuid,
    pub token_json: String,
}

/// Lineage edge from one produced item back to one source item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemLineage {
    pub child_report_id: Uuid,
    pub child_index: usize,
    pub parent_report_id: Uuid,
    pub parent_index: usize,
}

impl ItemLineage {
    pub fn new(
        child_report_id: Uuid,
        child_index: usize,
        parent_report_id: Uuid,
        parent_index: usize,
    ) -> Self {
        Self {
            child_report_id,
            child_index,
            parent_report_id,
            parent_index,
        }
    }
}

/// Facade over the metadata database.
#[derive(Clone)]
pub struct MetadataStore {
    connection: DbConnection,
}

impl MetadataStore {
    pub fn new(connection: DbConnection) -> Self {
        Self { connection }
    }

    /// Connect and create the metadata tables.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        let connection = DbConnection::with_config(config);
        connection.connect().await?;
        connection.apply_schema().await?;
        Ok(Self::new(connection))
    }

    pub async fn begin(&self) -> Result<DbTransaction> {
        self.connection.begin_transaction().await
    }

    pub async fn insert_report_file(
        &self,
        tx: &mut DbTransaction,
        record: &ReportFileRecord,
    ) -> Result<()> {
        tx.insert_row(TABLE_REPORT_FILE, record.to_row()).await
    }

    pub async fn insert_task(&self, tx: &mut DbTransaction, record: &TaskRecord) -> Result<()> {
        tx.insert_row(TABLE_TASK, record.to_row()).await
    }

    /// Move a task from one status to another. Returns the number of
    /// rows changed; zero means the task was not in `from`.
    pub async fn update_task_status(
        &self,
        tx: &mut DbTransaction,
        report_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<usize> {
        let mut filter = Row::new();
        filter.insert("report_id".into(), DbValue::String(report_id.to_string()));
        filter.insert("status".into(), DbValue::String(from.as_str().into()));
        let mut updates = Row::new();
        updates.insert("status".into(), DbValue::String(to.as_str().into()));
        tx.update_rows(TABLE_TASK, &filter, &updates).await
    }

    pub async fn get_report_file(
        &self,
        tx: &mut DbTransaction,
        report_id: Uuid,
    ) -> Result<Option<ReportFileRecord>> {
        let mut filter = Row::new();
        filter.insert("report_id".into(), DbValue::String(report_id.to_string()));
        let rows = tx.query_rows(TABLE_REPORT_FILE, Some(&filter)).await?;
        rows.first().map(ReportFileRecord::from_row).transpose()
    }

    /// Duplicate-submission check for the convert stage.
    pub async fn dedup_hash_exists(&self, tx: &mut DbTransaction, hash: &str) -> Result<bool> {
        let mut filter = Row::new();
        filter.insert("dedup_hash".into(), DbValue::String(hash.to_string()));
        let rows = tx.query_rows(TABLE_REPORT_FILE, Some(&filter)).await?;
        Ok(!rows.is_empty())
    }

    /// Select ready headers for a receiver and claim them in the same
    /// transaction, flipping each task from `translated` to `batched`.
    ///
    /// Exclusion is by status, not time: the `[backstop, now]` window
    /// only bounds how far back to look. A task claimed by a concurrent
    /// tick is skipped because its status update changes zero rows.
    pub async fn fetch_and_claim_headers(
        &self,
        tx: &mut DbTransaction,
        receiver: &str,
        backstop: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Header>> {
        let mut filter = Row::new();
        filter.insert("receiver".into(), DbValue::String(receiver.to_string()));
        filter.insert(
            "status".into(),
            DbValue::String(TaskStatus::Translated.as_str().into()),
        );
        let candidates = tx.query_rows(TABLE_TASK, Some(&filter)).await?;

        let mut headers = Vec::new();
        for row in &candidates {
            let task = TaskRecord::from_row(row)?;
            if task.next_action_at < backstop || task.next_action_at > now {
                continue;
            }
            let claimed = self
                .update_task_status(tx, task.report_id, TaskStatus::Translated, TaskStatus::Batched)
                .await?;
            if claimed == 0 {
                continue;
            }
            let report = self
                .get_report_file(tx, task.report_id)
                .await?
                .ok_or_else(|| {
                    Error::query(
                        TABLE_REPORT_FILE,
                        format!("Task {} has no report file", task.report_id),
                    )
                })?;
            headers.push(Header {
                report_id: task.report_id,
                receiver: receiver.to_string(),
                blob_url: report.blob_url,
                digest: report.digest,
                item_count: report.item_count,
                next_action_at: task.next_action_at,
            });
        }

        debug!(
            receiver,
            candidates = candidates.len(),
            claimed = headers.len(),
            "batch header claim"
        );
        Ok(headers)
    }

    /// Attach a retry token to a task and mark it recoverable.
    pub async fn save_retry_token(
        &self,
        tx: &mut DbTransaction,
        report_id: Uuid,
        token_json: &str,
    ) -> Result<()> {
        let mut filter = Row::new();
        filter.insert("report_id".into(), DbValue::String(report_id.to_string()));
        let mut updates = Row::new();
        updates.insert("retry_token".into(), DbValue::String(token_json.to_string()));
        updates.insert(
            "status".into(),
            DbValue::String(TaskStatus::SendWarning.as_str().into()),
        );
        let changed = tx.update_rows(TABLE_TASK, &filter, &updates).await?;
        if changed == 0 {
            return Err(Error::query(
                TABLE_TASK,
                format!("No task found for report {report_id}"),
            ));
        }
        Ok(())
    }

    /// List outstanding retry tokens for a receiver without consuming
    /// them. Each claim must be taken with [`Self::claim_retry_token`]
    /// in the transaction that records the retry's outcome, so a crash
    /// between listing and delivering leaves the token parked.
    pub async fn outstanding_retry_tokens(
        &self,
        tx: &mut DbTransaction,
        receiver: &str,
    ) -> Result<Vec<RetryClaim>> {
        let mut filter = Row::new();
        filter.insert("receiver".into(), DbValue::String(receiver.to_string()));
        filter.insert(
            "status".into(),
            DbValue::String(TaskStatus::SendWarning.as_str().into()),
        );
        let rows = tx.query_rows(TABLE_TASK, Some(&filter)).await?;

        let mut claims = Vec::new();
        for row in &rows {
            let task = TaskRecord::from_row(row)?;
            let Some(token_json) = task.retry_token else {
                continue;
            };
            claims.push(RetryClaim {
                report_id: task.report_id,
                token_json,
            });
        }
        Ok(claims)
    }

    /// Consume one parked retry token, moving the task back to
    /// `send_queued` for the resend attempt. Returns false when another
    /// tick already claimed it.
    pub async fn claim_retry_token(
        &self,
        tx: &mut DbTransaction,
        report_id: Uuid,
    ) -> Result<bool> {
        let mut filter = Row::new();
        filter.insert("report_id".into(), DbValue::String(report_id.to_string()));
        filter.insert(
            "status".into(),
            DbValue::String(TaskStatus::SendWarning.as_str().into()),
        );
        let mut updates = Row::new();
        updates.insert("retry_token".into(), DbValue::Null);
        updates.insert(
            "status".into(),
            DbValue::String(TaskStatus::SendQueued.as_str().into()),
        );
        Ok(tx.update_rows(TABLE_TASK, &filter, &updates).await? > 0)
    }

    /// Count lineage parent edges of a report, for audit queries.
    pub async fn lineage_parents(
        &self,
        tx: &mut DbTransaction,
        child_report_id: Uuid,
    ) -> Result<Vec<ItemLineage>> {
        let mut filter = Row::new();
        filter.insert(
            "child_report_id".into(),
            DbValue::String(child_report_id.to_string()),
        );
        let rows = tx.query_rows(TABLE_ITEM_LINEAGE, Some(&filter)).await?;
        rows.iter()
            .map(|row| {
                Ok(ItemLineage {
                    child_report_id: uuid_column(row, TABLE_ITEM_LINEAGE, "child_report_id")?,
                    child_index: integer(row, TABLE_ITEM_LINEAGE, "child_index")?.max(0) as usize,
                    parent_report_id: uuid_column(row, TABLE_ITEM_LINEAGE, "parent_report_id")?,
                    parent_index: integer(row, TABLE_ITEM_LINEAGE, "parent_index")?.max(0) as usize,
                })
            })
            .collect()
    }
}

/// Append-only record of one pipeline action.
///
/// Accumulates what the action touched, then flushes to `action_log`
/// and `item_lineage` inside the stage's own transaction.
#[derive(Debug, Clone)]
pub struct ActionHistory {
    action: String,
    status: ActionStatus,
    input_reports: Vec<Uuid>,
    created_reports: Vec<Uuid>,
    lineages: Vec<ItemLineage>,
    results: Vec<String>,
}

impl ActionHistory {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            status: ActionStatus::Success,
            input_reports: Vec::new(),
            created_reports: Vec::new(),
            lineages: Vec::new(),
            results: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: ActionStatus) {
        self.status = status;
    }

    pub fn status(&self) -> ActionStatus {
        self.status
    }

    pub fn track_created_report(&mut self, report_id: Uuid) {
        self.created_reports.push(report_id);
    }

    pub fn track_existing_input_report(&mut self, report_id: Uuid) {
        self.input_reports.push(report_id);
    }

    pub fn track_item_lineages(&mut self, lineages: impl IntoIterator<Item = ItemLineage>) {
        self.lineages.extend(lineages);
    }

    pub fn track_action_result(&mut self, result: impl Into<String>) {
        self.results.push(result.into());
    }

    /// Flush the accumulated record. Append-only: one `action_log` row
    /// plus one `item_lineage` row per tracked edge.
    pub async fn record_action(&self, tx: &mut DbTransaction) -> Result<()> {
        let mut row = Row::new();
        row.insert("action_id".into(), DbValue::String(Uuid::new_v4().to_string()));
        row.insert("action".into(), DbValue::String(self.action.clone()));
        row.insert("status".into(), DbValue::String(self.status.as_str().into()));
        row.insert(
            "result".into(),
            if self.results.is_empty() {
                DbValue::Null
            } else {
                DbValue::String(self.results.join("; "))
            },
        );
        row.insert(
            "input_report_ids".into(),
            id_list_column(&self.input_reports)?,
        );
        row.insert(
            "created_report_ids".into(),
            id_list_column(&self.created_reports)?,
        );
        row.insert("created_at".into(), DbValue::String(Utc::now().to_rfc3339()));
        tx.insert_row(TABLE_ACTION_LOG, row).await?;

        for lineage in &self.lineages {
            let mut row = Row::new();
            row.insert("lineage_id".into(), DbValue::String(Uuid::new_v4().to_string()));
            row.insert(
                "child_report_id".into(),
                DbValue::String(lineage.child_report_id.to_string()),
            );
            row.insert(
                "child_index".into(),
                DbValue::Integer(lineage.child_index as i64),
            );
            row.insert(
                "parent_report_id".into(),
                DbValue::String(lineage.parent_report_id.to_string()),
            );
            row.insert(
                "parent_index".into(),
                DbValue::Integer(lineage.parent_index as i64),
            );
            tx.insert_row(TABLE_ITEM_LINEAGE, row).await?;
        }
        Ok(())
    }
}

fn opt_string(value: Option<String>) -> DbValue {
    value.map_or(DbValue::Null, DbValue::String)
}

fn id_list_column(ids: &[Uuid]) -> Result<DbValue> {
    if ids.is_empty() {
        return Ok(DbValue::Null);
    }
    let strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    Ok(DbValue::String(serde_json::to_string(&strings)?))
}

fn text(row: &Row, table: &str, column: &str) -> Result<String> {
    match row.get(column) {
        Some(DbValue::String(value)) => Ok(value.clone()),
        other => Err(Error::query(
            table,
            format!("Expected text in column '{column}', found {other:?}"),
        )),
    }
}

fn text_opt(row: &Row, column: &str) -> Option<String> {
    match row.get(column) {
        Some(DbValue::String(value)) => Some(value.clone()),
        _ => None,
    }
}

fn integer(row: &Row, table: &str, column: &str) -> Result<i64> {
    match row.get(column) {
        Some(DbValue::Integer(value)) => Ok(*value),
        other => Err(Error::query(
            table,
            format!("Expected integer in column '{column}', found {other:?}"),
        )),
    }
}

fn timestamp(row: &Row, table: &str, column: &str) -> Result<DateTime<Utc>> {
    let raw = text(row, table, column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| Error::query(table, format!("Invalid timestamp in '{column}': {err}")))
}

fn uuid_column(row: &Row, table: &str, column: &str) -> Result<Uuid> {
    let raw = text(row, table, column)?;
    Uuid::parse_str(&raw)
        .map_err(|err| Error::query(table, format!("Invalid uuid in '{column}': {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips() {
        for status in [
            TaskStatus::Translated,
            TaskStatus::Batched,
            TaskStatus::SendQueued,
            TaskStatus::Sent,
            TaskStatus::SendWarning,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(TaskStatus::parse("nope").is_err());
    }

    #[test]
    fn report_record_round_trips_through_row() {
        let record = ReportFileRecord {
            report_id: Uuid::new_v4(),
            receiver: Some("elr".to_string()),
            format: "HL7".to_string(),
            blob_url: "mem://reports/r1".to_string(),
            digest: "ABC".to_string(),
            dedup_hash: None,
            item_count: 2,
            created_at: Utc::now(),
        };
        let restored = ReportFileRecord::from_row(&record.to_row()).unwrap();
        assert_eq!(restored.report_id, record.report_id);
        assert_eq!(restored.receiver, record.receiver);
        assert_eq!(restored.item_count, 2);
        assert_eq!(restored.dedup_hash, None);
    }
}
