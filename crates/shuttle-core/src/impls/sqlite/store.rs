use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde_json::json;

use crate::domain::{
    AuditEventType, AuditRecord, COMPLETED_STATE, ExecutionOutput, ItemId, ItemKind, ItemStatus, NewWorkItem,
    ORCHESTRATOR_OWNER, StateData, StoreError, TaskType, Usage, UsageTotals, WorkItem, WorkerId,
    WorkflowState,
};
use crate::impls::sqlite::migrations::{SqliteMigration, current_schema_version, migration};
use crate::observability::QueueCounts;
use crate::ports::{
    Clock, EXHAUSTED_MESSAGE, ExhaustedItem, RecoverReport, RootOutcome, StateWrite,
    SubtaskResult, SubtaskWrite, WorkStore, WorkflowCommit, WorkflowStart, exhausted_reason,
};

const MIGRATIONS_TABLE: &str = "shuttle_schema_migrations";

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ITEM_COLUMNS: &str = "id, kind, parent_id, type_or_agent, iteration, input, output, error, \
     status, try_count, max_tries, locked_by, lease_timeout_ms, created_at_ms, updated_at_ms, \
     model_used, input_tokens, output_tokens, total_cost, generation_id";

/// Subtasks before root tasks, then oldest first.
const CLAIM_ORDER: &str =
    "CASE kind WHEN 'subtask' THEN 0 ELSE 1 END, created_at_ms, rowid";

/// Work store backed by one SQLite connection.
///
/// Blocking calls run on `spawn_blocking`. Several processes (or several
/// stores on the same file) coordinate through SQLite's write lock: every
/// mutation is an `IMMEDIATE` transaction and the busy timeout makes
/// contenders wait instead of failing.
pub struct SqliteWorkStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    database_path: Option<PathBuf>,
}

impl SqliteWorkStore {
    pub fn open(
        database_path: impl Into<PathBuf>,
        busy_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let database_path = database_path.into();
        let connection = open_connection(&database_path, busy_timeout)
            .map_err(|error| StoreError::sqlite("open", error))?;
        Self::from_connection(connection, clock, Some(database_path))
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let connection = Connection::open_in_memory()
            .and_then(|connection| {
                connection.pragma_update(None, "foreign_keys", "ON")?;
                Ok(connection)
            })
            .map_err(|error| StoreError::sqlite("open", error))?;
        Self::from_connection(connection, clock, None)
    }

    fn from_connection(
        mut connection: Connection,
        clock: Arc<dyn Clock>,
        database_path: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        migrate_to_latest(&mut connection).map_err(|error| StoreError::sqlite("migrate", error))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(connection)),
            clock,
            database_path,
        })
    }

    pub fn database_path(&self) -> Option<&Path> {
        self.database_path.as_deref()
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let connection = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        read_current_version(&connection).map_err(|error| StoreError::sqlite("schema_version", error))
    }

    fn now_ms(&self) -> i64 {
        dt_to_ms(self.clock.now())
    }

    async fn with_connection<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|error| StoreError::sqlite(operation, error))?
        .map_err(|error| match error {
            StoreError::Sqlite { message, .. } => StoreError::Sqlite {
                operation: operation.to_string(),
                message,
            },
            other => other,
        })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        StoreError::sqlite("query", error)
    }
}

#[async_trait]
impl WorkStore for SqliteWorkStore {
    async fn insert_item(&self, id: ItemId, item: NewWorkItem) -> Result<WorkItem, StoreError> {
        let now_ms = self.now_ms();
        self.with_connection("insert_item", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            insert_item(&tx, id, &item, now_ms)?;
            let inserted = fetch_item(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<WorkItem>, StoreError> {
        self.with_connection("get_item", move |connection| fetch_item(connection, id))
            .await
    }

    async fn list_subtasks(&self, parent: ItemId) -> Result<Vec<WorkItem>, StoreError> {
        self.with_connection("list_subtasks", move |connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {ITEM_COLUMNS} FROM work_items WHERE parent_id = ?1 \
                 ORDER BY created_at_ms, rowid"
            ))?;
            let rows = statement
                .query_map([id_text(parent)], ItemRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ItemRow::into_item).collect()
        })
        .await
    }

    async fn claim(
        &self,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<Option<WorkItem>, StoreError> {
        let now_ms = self.now_ms();
        let deadline_ms = now_ms.saturating_add(duration_ms(lease));
        let worker = worker.as_str().to_string();
        self.with_connection("claim", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = tx
                .query_row(
                    &format!(
                        "UPDATE work_items
                         SET status = 'running', locked_by = ?1, lease_timeout_ms = ?2,
                             try_count = try_count + 1, updated_at_ms = ?3
                         WHERE id = (
                             SELECT id FROM work_items
                             WHERE status = 'pending'
                               AND try_count < max_tries
                               AND (lease_timeout_ms IS NULL OR lease_timeout_ms <= ?3)
                             ORDER BY {CLAIM_ORDER}
                             LIMIT 1
                         )
                         RETURNING {ITEM_COLUMNS}"
                    ),
                    params![worker, deadline_ms, now_ms],
                    ItemRow::read,
                )
                .optional()?;
            tx.commit()?;
            row.map(ItemRow::into_item).transpose()
        })
        .await
    }

    async fn renew(
        &self,
        id: ItemId,
        worker: &WorkerId,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let now_ms = self.now_ms();
        let deadline_ms = now_ms.saturating_add(duration_ms(lease));
        let worker = worker.as_str().to_string();
        self.with_connection("renew", move |connection| {
            let changed = connection.execute(
                "UPDATE work_items SET lease_timeout_ms = ?1, updated_at_ms = ?2
                 WHERE id = ?3 AND status = 'running' AND locked_by = ?4",
                params![deadline_ms, now_ms, id_text(id), worker],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn recover(&self) -> Result<RecoverReport, StoreError> {
        let now_ms = self.now_ms();
        self.with_connection("recover", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let reset = {
                let mut statement = tx.prepare(
                    "UPDATE work_items
                     SET status = 'pending', locked_by = NULL, lease_timeout_ms = NULL,
                         updated_at_ms = ?1
                     WHERE status = 'running'
                       AND lease_timeout_ms IS NOT NULL AND lease_timeout_ms < ?1
                       AND try_count < max_tries
                     RETURNING id",
                )?;
                let ids = statement
                    .query_map([now_ms], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids.iter()
                    .map(|raw| parse_id(raw))
                    .collect::<Result<Vec<_>, _>>()?
            };

            let exhausted = {
                let mut statement = tx.prepare(
                    "UPDATE work_items
                     SET status = 'error', error = ?2, locked_by = NULL, lease_timeout_ms = NULL,
                         updated_at_ms = ?1
                     WHERE status = 'running'
                       AND lease_timeout_ms IS NOT NULL AND lease_timeout_ms < ?1
                       AND try_count >= max_tries
                     RETURNING id, kind, parent_id",
                )?;
                let rows = statement
                    .query_map(params![now_ms, EXHAUSTED_MESSAGE], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter()
                    .map(|(id, kind, parent_id)| {
                        Ok(ExhaustedItem {
                            id: parse_id(&id)?,
                            kind: parse_kind(&kind)?,
                            parent_id: parent_id.as_deref().map(parse_id).transpose()?,
                        })
                    })
                    .collect::<Result<Vec<_>, StoreError>>()?
            };

            let mut failed_roots = Vec::new();
            for item in &exhausted {
                let (ItemKind::Subtask, Some(root)) = (item.kind, item.parent_id) else {
                    continue;
                };
                if fail_exhausted_workflow(&tx, root, item.id, now_ms)? {
                    failed_roots.push(root);
                }
            }

            tx.commit()?;
            Ok(RecoverReport {
                reset,
                exhausted,
                failed_roots,
            })
        })
        .await
    }

    async fn complete_item(
        &self,
        id: ItemId,
        worker: &WorkerId,
        output: &ExecutionOutput,
    ) -> Result<bool, StoreError> {
        let now_ms = self.now_ms();
        let worker = worker.clone();
        let output = output.clone();
        self.with_connection("complete_item", move |connection| {
            write_done(connection, id, &worker, &output, now_ms)
        })
        .await
    }

    async fn fail_item(
        &self,
        id: ItemId,
        worker: &WorkerId,
        error: &str,
        retry: bool,
    ) -> Result<Option<ItemStatus>, StoreError> {
        let now_ms = self.now_ms();
        let worker = worker.clone();
        let error = error.to_string();
        self.with_connection("fail_item", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let budget = tx
                .query_row(
                    "SELECT try_count, max_tries FROM work_items
                     WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
                    params![id_text(id), worker.as_str()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            let status = match budget {
                None => None,
                Some((try_count, max_tries)) if retry && try_count < max_tries => {
                    tx.execute(
                        "UPDATE work_items
                         SET status = 'pending', error = ?1, locked_by = NULL,
                             lease_timeout_ms = NULL, updated_at_ms = ?2
                         WHERE id = ?3",
                        params![error, now_ms, id_text(id)],
                    )?;
                    Some(ItemStatus::Pending)
                }
                Some(_) => {
                    write_error(&tx, id, &worker, &error, now_ms)?;
                    Some(ItemStatus::Error)
                }
            };
            tx.commit()?;
            Ok(status)
        })
        .await
    }

    async fn start_workflow(&self, start: WorkflowStart) -> Result<(), StoreError> {
        let now_ms = self.now_ms();
        self.with_connection("start_workflow", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let parked = tx.execute(
                "UPDATE work_items SET locked_by = ?1, lease_timeout_ms = NULL, updated_at_ms = ?2
                 WHERE id = ?3 AND status = 'running' AND locked_by = ?4",
                params![
                    ORCHESTRATOR_OWNER,
                    now_ms,
                    id_text(start.root_id),
                    start.worker.as_str()
                ],
            )?;
            if parked != 1 {
                return Err(StoreError::Conflict(format!(
                    "root {} is not leased by {}",
                    start.root_id, start.worker
                )));
            }

            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM workflow_state WHERE parent_task_id = ?1",
                [id_text(start.root_id)],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Err(StoreError::Conflict(format!(
                    "workflow state already exists for {}",
                    start.root_id
                )));
            }

            insert_state(&tx, &start.state, now_ms)?;
            let (subtask_id, subtask) = &start.first_subtask;
            insert_item(&tx, *subtask_id, subtask, now_ms)?;
            append_audit(&tx, &start.audit, now_ms);

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn commit_workflow(&self, commit: WorkflowCommit) -> Result<(), StoreError> {
        let now_ms = self.now_ms();
        self.with_connection("commit_workflow", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(SubtaskWrite { id, worker, result }) = &commit.subtask {
                let written = match result {
                    SubtaskResult::Done(output) => write_done(&tx, *id, worker, output, now_ms)?,
                    SubtaskResult::Error(message) => write_error(&tx, *id, worker, message, now_ms)?,
                };
                if !written {
                    return Err(StoreError::Conflict(format!(
                        "subtask {id} is not leased by {worker}"
                    )));
                }
            }

            if let Some(write) = &commit.state {
                update_state(&tx, write, now_ms)?;
            }

            if let Some((subtask_id, subtask)) = &commit.next_subtask {
                insert_item(&tx, *subtask_id, subtask, now_ms)?;
            }

            if let Some(outcome) = &commit.root_outcome {
                write_root_outcome(&tx, commit.root_id, outcome, now_ms)?;
            }

            append_audit(&tx, &commit.audit, now_ms);
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_workflow_state(&self, root: ItemId) -> Result<Option<WorkflowState>, StoreError> {
        self.with_connection("get_workflow_state", move |connection| {
            let row = connection
                .query_row(
                    "SELECT parent_task_id, workflow_type, current_state, current_iteration,
                            max_iterations, state_data, updated_at_ms
                     FROM workflow_state WHERE parent_task_id = ?1",
                    [id_text(root)],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, i64>(6)?,
                        ))
                    },
                )
                .optional()?;

            row.map(
                |(parent, workflow_type, current_state, iteration, max_iterations, data, updated)| {
                    Ok(WorkflowState {
                        parent_task_id: parse_id(&parent)?,
                        workflow_type,
                        current_state,
                        current_iteration: to_u32(iteration, "current_iteration")?,
                        max_iterations: to_u32(max_iterations, "max_iterations")?,
                        state_data: serde_json::from_str::<StateData>(&data)?,
                        updated_at: ms_to_dt(updated)?,
                    })
                },
            )
            .transpose()
        })
        .await
    }

    async fn aggregate_usage(&self, root: ItemId) -> Result<UsageTotals, StoreError> {
        let now_ms = self.now_ms();
        self.with_connection("aggregate_usage", move |connection| {
            let tx = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (input_tokens, output_tokens, total_cost) = tx.query_row(
                "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0),
                        COALESCE(SUM(total_cost), 0.0)
                 FROM work_items WHERE parent_id = ?1",
                [id_text(root)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )?;

            let updated = tx.execute(
                "UPDATE work_items
                 SET input_tokens = ?1, output_tokens = ?2, total_cost = ?3, updated_at_ms = ?4
                 WHERE id = ?5",
                params![input_tokens, output_tokens, total_cost, now_ms, id_text(root)],
            )?;
            if updated != 1 {
                return Err(StoreError::NotFound(root));
            }
            tx.commit()?;

            Ok(UsageTotals {
                input_tokens: input_tokens.max(0) as u64,
                output_tokens: output_tokens.max(0) as u64,
                total_cost,
            })
        })
        .await
    }

    async fn counts_by_status(&self) -> Result<QueueCounts, StoreError> {
        self.with_connection("counts_by_status", |connection| {
            let mut counts = QueueCounts::default();
            let mut statement =
                connection.prepare("SELECT status, COUNT(*) FROM work_items GROUP BY status")?;
            let rows = statement
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (status, n) in rows {
                counts.add(parse_status(&status)?, n.max(0) as u64);
            }

            let parked: i64 = connection.query_row(
                "SELECT COUNT(*) FROM work_items
                 WHERE status = 'running' AND locked_by = ?1 AND lease_timeout_ms IS NULL",
                [ORCHESTRATOR_OWNER],
                |row| row.get(0),
            )?;
            counts.parked = parked.max(0) as u64;
            Ok(counts)
        })
        .await
    }

    async fn audit_log(&self, item: ItemId) -> Result<Vec<AuditRecord>, StoreError> {
        self.with_connection("audit_log", move |connection| {
            let mut statement = connection.prepare(
                "SELECT event_type, item_id, metadata FROM audit_log
                 WHERE item_id = ?1 ORDER BY id",
            )?;
            let rows = statement
                .query_map([id_text(item)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(event_type, item_id, metadata)| {
                    Ok(AuditRecord {
                        event_type: event_type
                            .parse::<AuditEventType>()
                            .map_err(StoreError::Corrupt)?,
                        item_id: parse_id(&item_id)?,
                        metadata: serde_json::from_str(&metadata)?,
                    })
                })
                .collect()
        })
        .await
    }
}

struct ItemRow {
    id: String,
    kind: String,
    parent_id: Option<String>,
    type_or_agent: String,
    iteration: i64,
    input: String,
    output: Option<String>,
    error: Option<String>,
    status: String,
    try_count: i64,
    max_tries: i64,
    locked_by: Option<String>,
    lease_timeout_ms: Option<i64>,
    created_at_ms: i64,
    updated_at_ms: i64,
    model_used: Option<String>,
    input_tokens: i64,
    output_tokens: i64,
    total_cost: f64,
    generation_id: Option<String>,
}

impl ItemRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            parent_id: row.get(2)?,
            type_or_agent: row.get(3)?,
            iteration: row.get(4)?,
            input: row.get(5)?,
            output: row.get(6)?,
            error: row.get(7)?,
            status: row.get(8)?,
            try_count: row.get(9)?,
            max_tries: row.get(10)?,
            locked_by: row.get(11)?,
            lease_timeout_ms: row.get(12)?,
            created_at_ms: row.get(13)?,
            updated_at_ms: row.get(14)?,
            model_used: row.get(15)?,
            input_tokens: row.get(16)?,
            output_tokens: row.get(17)?,
            total_cost: row.get(18)?,
            generation_id: row.get(19)?,
        })
    }

    fn into_item(self) -> Result<WorkItem, StoreError> {
        Ok(WorkItem {
            id: parse_id(&self.id)?,
            kind: parse_kind(&self.kind)?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            type_or_agent: TaskType::new(self.type_or_agent),
            iteration: to_u32(self.iteration, "iteration")?,
            input: serde_json::from_str(&self.input)?,
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: self.error,
            status: parse_status(&self.status)?,
            try_count: to_u32(self.try_count, "try_count")?,
            max_tries: to_u32(self.max_tries, "max_tries")?,
            locked_by: self.locked_by,
            lease_timeout: self.lease_timeout_ms.map(ms_to_dt).transpose()?,
            usage: Usage {
                model_used: self.model_used,
                input_tokens: self.input_tokens.max(0) as u64,
                output_tokens: self.output_tokens.max(0) as u64,
                total_cost: self.total_cost,
                generation_id: self.generation_id,
            },
            created_at: ms_to_dt(self.created_at_ms)?,
            updated_at: ms_to_dt(self.updated_at_ms)?,
        })
    }
}

fn fetch_item(connection: &Connection, id: ItemId) -> Result<Option<WorkItem>, StoreError> {
    connection
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            [id_text(id)],
            ItemRow::read,
        )
        .optional()?
        .map(ItemRow::into_item)
        .transpose()
}

fn insert_item(
    connection: &Connection,
    id: ItemId,
    item: &NewWorkItem,
    now_ms: i64,
) -> Result<(), StoreError> {
    connection.execute(
        "INSERT INTO work_items (
            id, kind, parent_id, type_or_agent, iteration, input, status,
            try_count, max_tries, created_at_ms, updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', 0, ?7, ?8, ?8)",
        params![
            id_text(id),
            item.kind.as_str(),
            item.parent_id.map(id_text),
            item.type_or_agent.as_str(),
            i64::from(item.iteration),
            serde_json::to_string(&item.input)?,
            i64::from(item.max_tries),
            now_ms,
        ],
    )?;
    Ok(())
}

fn write_done(
    connection: &Connection,
    id: ItemId,
    worker: &WorkerId,
    output: &ExecutionOutput,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let usage = output.usage.clone().unwrap_or_default();
    let changed = connection.execute(
        "UPDATE work_items
         SET status = 'done', output = ?1, error = NULL, lease_timeout_ms = NULL,
             model_used = ?2, input_tokens = ?3, output_tokens = ?4, total_cost = ?5,
             generation_id = ?6, updated_at_ms = ?7
         WHERE id = ?8 AND status = 'running' AND locked_by = ?9",
        params![
            serde_json::to_string(&output.output)?,
            usage.model_used,
            clamp_i64(usage.input_tokens),
            clamp_i64(usage.output_tokens),
            usage.total_cost,
            usage.generation_id,
            now_ms,
            id_text(id),
            worker.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

fn write_error(
    connection: &Connection,
    id: ItemId,
    worker: &WorkerId,
    message: &str,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let changed = connection.execute(
        "UPDATE work_items
         SET status = 'error', error = ?1, lease_timeout_ms = NULL, updated_at_ms = ?2
         WHERE id = ?3 AND status = 'running' AND locked_by = ?4",
        params![message, now_ms, id_text(id), worker.as_str()],
    )?;
    Ok(changed == 1)
}

fn write_root_outcome(
    connection: &Connection,
    root: ItemId,
    outcome: &RootOutcome,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let (status, output, error) = match outcome {
        RootOutcome::Done(output) => (ItemStatus::Done, Some(serde_json::to_string(output)?), None),
        RootOutcome::Error(message) => (ItemStatus::Error, None, Some(message.as_str())),
    };
    let changed = connection.execute(
        "UPDATE work_items
         SET status = ?1, output = COALESCE(?2, output), error = ?3,
             locked_by = NULL, lease_timeout_ms = NULL, updated_at_ms = ?4
         WHERE id = ?5 AND status IN ('pending', 'running')",
        params![status.as_str(), output, error, now_ms, id_text(root)],
    )?;
    Ok(changed == 1)
}

fn insert_state(
    connection: &Connection,
    state: &WorkflowState,
    now_ms: i64,
) -> Result<(), StoreError> {
    connection.execute(
        "INSERT INTO workflow_state (
            parent_task_id, workflow_type, current_state, current_iteration,
            max_iterations, state_data, updated_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id_text(state.parent_task_id),
            state.workflow_type,
            state.current_state,
            i64::from(state.current_iteration),
            i64::from(state.max_iterations),
            serde_json::to_string(&state.state_data)?,
            now_ms,
        ],
    )?;
    Ok(())
}

fn update_state(connection: &Connection, write: &StateWrite, now_ms: i64) -> Result<(), StoreError> {
    let next = &write.next;
    let changed = connection.execute(
        "UPDATE workflow_state
         SET current_state = ?1, current_iteration = ?2, max_iterations = ?3,
             state_data = ?4, updated_at_ms = ?5
         WHERE parent_task_id = ?6 AND current_state = ?7 AND current_iteration = ?8",
        params![
            next.current_state,
            i64::from(next.current_iteration),
            i64::from(next.max_iterations),
            serde_json::to_string(&next.state_data)?,
            now_ms,
            id_text(next.parent_task_id),
            write.expected_state,
            i64::from(write.expected_iteration),
        ],
    )?;
    if changed != 1 {
        return Err(StoreError::Conflict(format!(
            "workflow {} moved past {}@{}",
            next.parent_task_id, write.expected_state, write.expected_iteration
        )));
    }
    Ok(())
}

/// Close the workflow owning an exhausted subtask: state `completed` with the
/// failure recorded, root `error`. Returns false if the root was already
/// terminal.
fn fail_exhausted_workflow(
    connection: &Connection,
    root: ItemId,
    subtask: ItemId,
    now_ms: i64,
) -> Result<bool, StoreError> {
    let reason = exhausted_reason(subtask);
    let state_data = connection
        .query_row(
            "SELECT state_data FROM workflow_state
             WHERE parent_task_id = ?1 AND current_state != ?2",
            params![id_text(root), COMPLETED_STATE],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    if let Some(raw) = state_data {
        let mut data: StateData = serde_json::from_str(&raw)?;
        data.failure = Some(reason.clone());
        connection.execute(
            "UPDATE workflow_state SET current_state = ?1, state_data = ?2, updated_at_ms = ?3
             WHERE parent_task_id = ?4",
            params![COMPLETED_STATE, serde_json::to_string(&data)?, now_ms, id_text(root)],
        )?;
    }

    let failed = write_root_outcome(connection, root, &RootOutcome::Error(reason.clone()), now_ms)?;
    if failed {
        append_audit(
            connection,
            &[
                AuditRecord::new(
                    AuditEventType::SubtaskFailed,
                    subtask,
                    json!({ "parent_id": id_text(root), "error": EXHAUSTED_MESSAGE }),
                ),
                AuditRecord::new(AuditEventType::WorkflowFailed, root, json!({ "error": reason })),
            ],
            now_ms,
        );
    }
    Ok(failed)
}

/// Audit failures never abort the surrounding transaction.
fn append_audit(connection: &Connection, records: &[AuditRecord], now_ms: i64) {
    for record in records {
        if let Err(error) = connection.execute(
            "INSERT INTO audit_log (event_type, item_id, metadata, created_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.event_type.as_str(),
                id_text(record.item_id),
                record.metadata.to_string(),
                now_ms
            ],
        ) {
            tracing::error!(
                event_type = %record.event_type,
                item_id = %record.item_id,
                error = %error,
                "failed to append audit record"
            );
        }
    }
}

fn open_connection(database_path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(busy_timeout)?;
    connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get::<_, String>(0)
    })?;
    connection.pragma_update(None, "foreign_keys", "ON")?;
    Ok(connection)
}

fn migrate_to_latest(connection: &mut Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let current_version = read_current_version(connection)?;
    for version in (current_version + 1)..=current_schema_version() {
        if let Some(migration) = migration(version) {
            apply_up_migration(connection, migration)?;
        }
    }
    Ok(())
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at_unix INTEGER NOT NULL
        );"
    ))
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // Another process may have migrated while we waited for the lock.
    if read_current_version(&transaction)? >= migration.version {
        return Ok(());
    }
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()
}

/// Execute a migration one statement at a time. A "duplicate column name"
/// error from `ALTER TABLE ADD COLUMN`, which is not idempotent in SQLite,
/// skips only that statement. Statements are split on `;`, so migration
/// bodies must not contain one inside a literal.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        match connection.execute_batch(statement) {
            Ok(()) => {}
            Err(e) if e.to_string().contains("duplicate column name") => {
                tracing::debug!(statement, "column already present, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn id_text(id: ItemId) -> String {
    id.as_ulid().to_string()
}

fn parse_id(raw: &str) -> Result<ItemId, StoreError> {
    raw.parse::<ItemId>()
        .map_err(|error| StoreError::Corrupt(error.to_string()))
}

fn parse_kind(raw: &str) -> Result<ItemKind, StoreError> {
    raw.parse::<ItemKind>().map_err(StoreError::Corrupt)
}

fn parse_status(raw: &str) -> Result<ItemStatus, StoreError> {
    raw.parse::<ItemStatus>().map_err(StoreError::Corrupt)
}

fn to_u32(value: i64, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupt(format!("{field} out of range: {value}")))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}
