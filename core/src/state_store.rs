/// SQLite-backed implementation of the StateStore trait
/// Persists workflow state per session and pipeline executions per run, with versioned migrations
use crate::errors::{StateStoreError, StateStoreResult};
use crate::pipeline::execution::{ExecutionStatus, PipelineExecution, StepExecution, StepStatus};
use crate::traits::StateStore;
use crate::workflow::state::WorkflowState;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// SQLite-backed state store implementation
pub struct SqliteStateStore {
    /// Connection pool to SQLite database
    pool: SqlitePool,

    /// Path to the SQLite database file
    db_path: PathBuf,
}

/// Database migration record
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i32,
    pub name: String,
    pub description: Option<String>,
    pub applied_at: i64,
}

fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn db_error(context: &str, e: sqlx::Error) -> StateStoreError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        StateStoreError::InvariantViolation(format!("{}: {}", context, message))
    } else {
        StateStoreError::DatabaseError(format!("{}: {}", context, message))
    }
}

const EXECUTION_COLUMNS: &str = "id, pipeline_name, project_id, status, inputs_json, outputs_json, \
     resume_token, session_id, parent_execution_id, created_at, updated_at, completed_at";

const STEP_COLUMNS: &str = "execution_id, step_id, status, input, output, error, approval_token, \
     approved_by, approved_at, started_at, completed_at";

impl SqliteStateStore {
    /// Create a new SQLite state store. Call `initialize` before use.
    pub async fn new<P: AsRef<Path>>(db_path: P) -> StateStoreResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StateStoreError::DatabaseError(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())
            .map_err(|e| {
                StateStoreError::DatabaseError(format!("Failed to parse database path: {}", e))
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                StateStoreError::DatabaseError(format!("Failed to create database pool: {}", e))
            })?;

        Ok(SqliteStateStore { pool, db_path })
    }

    /// Initialized store backed by a private in-memory database.
    pub async fn in_memory() -> StateStoreResult<Self> {
        let connect_options = SqliteConnectOptions::from_str(":memory:")
            .map_err(|e| StateStoreError::DatabaseError(e.to_string()))?
            .foreign_keys(true);

        // Every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| {
                StateStoreError::DatabaseError(format!("Failed to create database pool: {}", e))
            })?;

        let mut store = SqliteStateStore {
            pool,
            db_path: PathBuf::from(":memory:"),
        };
        store.initialize().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Apply all pending migrations
    async fn apply_migrations(&self) -> StateStoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY NOT NULL,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                applied_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            StateStoreError::MigrationError(format!("Failed to create migrations table: {}", e))
        })?;

        let max_version: i32 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM migrations")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    StateStoreError::MigrationError(format!(
                        "Failed to query migration version: {}",
                        e
                    ))
                })?;

        let migrations: Vec<(i32, &str, &str, Vec<&str>)> = vec![
            (
                1,
                "create_workflow_states",
                "Create per-session workflow state table",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS workflow_states (
                        session_id TEXT PRIMARY KEY NOT NULL,
                        workflow_name TEXT NOT NULL,
                        step TEXT NOT NULL,
                        step_entered_at INTEGER NOT NULL,
                        step_action_count INTEGER NOT NULL DEFAULT 0,
                        total_action_count INTEGER NOT NULL DEFAULT 0,
                        variables TEXT NOT NULL DEFAULT '{}',
                        observations TEXT NOT NULL DEFAULT '[]',
                        reflection_pending INTEGER NOT NULL DEFAULT 0,
                        context_injected INTEGER NOT NULL DEFAULT 0,
                        updated_at INTEGER NOT NULL
                    )"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_workflow_states_workflow ON workflow_states(workflow_name)"#,
                ],
            ),
            (
                2,
                "create_pipeline_executions",
                "Create pipeline execution and step execution tables",
                vec![
                    r#"CREATE TABLE IF NOT EXISTS pipeline_executions (
                        id TEXT PRIMARY KEY NOT NULL,
                        pipeline_name TEXT NOT NULL,
                        project_id TEXT NOT NULL,
                        status TEXT NOT NULL DEFAULT 'pending',
                        inputs_json TEXT NOT NULL DEFAULT '{}',
                        outputs_json TEXT,
                        resume_token TEXT UNIQUE,
                        session_id TEXT,
                        parent_execution_id TEXT REFERENCES pipeline_executions(id),
                        created_at INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL,
                        completed_at INTEGER
                    )"#,
                    r#"CREATE TABLE IF NOT EXISTS step_executions (
                        execution_id TEXT NOT NULL REFERENCES pipeline_executions(id) ON DELETE CASCADE,
                        step_id TEXT NOT NULL,
                        status TEXT NOT NULL DEFAULT 'pending',
                        input TEXT,
                        output TEXT,
                        error TEXT,
                        approval_token TEXT UNIQUE,
                        approved_by TEXT,
                        approved_at INTEGER,
                        started_at INTEGER,
                        completed_at INTEGER,
                        PRIMARY KEY (execution_id, step_id)
                    )"#,
                ],
            ),
            (
                3,
                "add_execution_indexes",
                "Add lookup indexes for executions",
                vec![
                    r#"CREATE INDEX IF NOT EXISTS idx_pipeline_executions_project ON pipeline_executions(project_id, created_at DESC)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_pipeline_executions_status ON pipeline_executions(status)"#,
                    r#"CREATE INDEX IF NOT EXISTS idx_pipeline_executions_session ON pipeline_executions(session_id)"#,
                ],
            ),
        ];

        for (version, name, desc, statements) in migrations {
            if version > max_version {
                for statement in statements {
                    sqlx::query(statement)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| {
                            StateStoreError::MigrationError(format!(
                                "Failed to apply migration {}: {}",
                                name, e
                            ))
                        })?;
                }

                let now = Utc::now().timestamp();
                sqlx::query(
                    "INSERT INTO migrations (version, name, description, applied_at) VALUES (?, ?, ?, ?)"
                )
                .bind(version)
                .bind(name)
                .bind(Some(desc))
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| StateStoreError::MigrationError(
                    format!("Failed to record migration {}: {}", name, e)
                ))?;
            }
        }

        Ok(())
    }

    pub async fn get_migration_history(&self) -> StateStoreResult<Vec<Migration>> {
        let rows = sqlx::query(
            "SELECT version, name, description, applied_at FROM migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch migrations", e))?;

        Ok(rows
            .iter()
            .map(|row| Migration {
                version: row.get("version"),
                name: row.get("name"),
                description: row.get("description"),
                applied_at: row.get("applied_at"),
            })
            .collect())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_state(row: &SqliteRow) -> StateStoreResult<WorkflowState> {
        let variables: String = row.get("variables");
        let observations: String = row.get("observations");
        Ok(WorkflowState {
            session_id: row.get("session_id"),
            workflow_name: row.get("workflow_name"),
            step: row.get("step"),
            step_entered_at: from_millis(row.get("step_entered_at")),
            step_action_count: row.get("step_action_count"),
            total_action_count: row.get("total_action_count"),
            variables: serde_json::from_str(&variables).map_err(|e| {
                StateStoreError::SerializationError(format!("Invalid variables JSON: {}", e))
            })?,
            observations: serde_json::from_str(&observations).map_err(|e| {
                StateStoreError::SerializationError(format!("Invalid observations JSON: {}", e))
            })?,
            reflection_pending: row.get::<i64, _>("reflection_pending") != 0,
            context_injected: row.get::<i64, _>("context_injected") != 0,
            updated_at: from_millis(row.get("updated_at")),
        })
    }

    fn row_to_execution(row: &SqliteRow) -> StateStoreResult<PipelineExecution> {
        let status: String = row.get("status");
        Ok(PipelineExecution {
            id: row.get("id"),
            pipeline_name: row.get("pipeline_name"),
            project_id: row.get("project_id"),
            status: ExecutionStatus::from_str(&status)
                .map_err(StateStoreError::SerializationError)?,
            inputs_json: row.get("inputs_json"),
            outputs_json: row.get("outputs_json"),
            resume_token: row.get("resume_token"),
            session_id: row.get("session_id"),
            parent_execution_id: row.get("parent_execution_id"),
            created_at: from_millis(row.get("created_at")),
            updated_at: from_millis(row.get("updated_at")),
            completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        })
    }

    fn row_to_step(row: &SqliteRow) -> StateStoreResult<StepExecution> {
        let status: String = row.get("status");
        Ok(StepExecution {
            execution_id: row.get("execution_id"),
            step_id: row.get("step_id"),
            status: StepStatus::from_str(&status).map_err(StateStoreError::SerializationError)?,
            input: row.get("input"),
            output: row.get("output"),
            error: row.get("error"),
            approval_token: row.get("approval_token"),
            approved_by: row.get("approved_by"),
            approved_at: row.get::<Option<i64>, _>("approved_at").map(from_millis),
            started_at: row.get::<Option<i64>, _>("started_at").map(from_millis),
            completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
        })
    }

    fn check_step_invariants(step: &StepExecution) -> StateStoreResult<()> {
        if step.status == StepStatus::Completed && step.output.is_none() {
            return Err(StateStoreError::InvariantViolation(format!(
                "step {}/{} cannot complete without output",
                step.execution_id, step.step_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn initialize(&mut self) -> StateStoreResult<()> {
        self.apply_migrations().await
    }

    async fn get_state(&self, session_id: &str) -> StateStoreResult<Option<WorkflowState>> {
        let row = sqlx::query("SELECT * FROM workflow_states WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_error("Failed to fetch workflow state", e))?;

        row.as_ref().map(Self::row_to_state).transpose()
    }

    async fn save_state(&self, state: &WorkflowState) -> StateStoreResult<()> {
        let variables = serde_json::to_string(&state.variables).map_err(|e| {
            StateStoreError::SerializationError(format!("Failed to serialize variables: {}", e))
        })?;
        let observations = serde_json::to_string(&state.observations).map_err(|e| {
            StateStoreError::SerializationError(format!("Failed to serialize observations: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_states
            (session_id, workflow_name, step, step_entered_at, step_action_count, total_action_count,
             variables, observations, reflection_pending, context_injected, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.session_id)
        .bind(&state.workflow_name)
        .bind(&state.step)
        .bind(to_millis(&state.step_entered_at))
        .bind(state.step_action_count)
        .bind(state.total_action_count)
        .bind(variables)
        .bind(observations)
        .bind(state.reflection_pending as i64)
        .bind(state.context_injected as i64)
        .bind(to_millis(&state.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to save workflow state", e))?;

        Ok(())
    }

    async fn create_execution(&self, execution: &PipelineExecution) -> StateStoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO pipeline_executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            EXECUTION_COLUMNS
        ))
        .bind(&execution.id)
        .bind(&execution.pipeline_name)
        .bind(&execution.project_id)
        .bind(execution.status.as_str())
        .bind(&execution.inputs_json)
        .bind(&execution.outputs_json)
        .bind(&execution.resume_token)
        .bind(&execution.session_id)
        .bind(&execution.parent_execution_id)
        .bind(to_millis(&execution.created_at))
        .bind(to_millis(&execution.updated_at))
        .bind(execution.completed_at.as_ref().map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create execution", e))?;

        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> StateStoreResult<Option<PipelineExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pipeline_executions WHERE id = ?",
            EXECUTION_COLUMNS
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch execution", e))?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn update_execution(&self, execution: &PipelineExecution) -> StateStoreResult<()> {
        let current = self
            .get_execution(&execution.id)
            .await?
            .ok_or_else(|| StateStoreError::NotFound(format!("execution {}", execution.id)))?;

        if !current.status.can_transition_to(execution.status) {
            return Err(StateStoreError::InvalidTransition(format!(
                "execution {}: {} -> {}",
                execution.id, current.status, execution.status
            )));
        }

        sqlx::query(
            r#"
            UPDATE pipeline_executions
            SET status = ?, outputs_json = ?, resume_token = ?, session_id = ?,
                updated_at = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(execution.status.as_str())
        .bind(&execution.outputs_json)
        .bind(&execution.resume_token)
        .bind(&execution.session_id)
        .bind(to_millis(&execution.updated_at))
        .bind(execution.completed_at.as_ref().map(to_millis))
        .bind(&execution.id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update execution", e))?;

        Ok(())
    }

    async fn list_executions(
        &self,
        project_id: Option<&str>,
        status: Option<ExecutionStatus>,
        limit: usize,
    ) -> StateStoreResult<Vec<PipelineExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_executions
             WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC LIMIT ?3",
            EXECUTION_COLUMNS
        ))
        .bind(project_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list executions", e))?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn get_execution_by_resume_token(
        &self,
        resume_token: &str,
    ) -> StateStoreResult<Option<PipelineExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pipeline_executions WHERE resume_token = ?",
            EXECUTION_COLUMNS
        ))
        .bind(resume_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch execution by resume token", e))?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    async fn create_step_execution(&self, step: &StepExecution) -> StateStoreResult<()> {
        Self::check_step_invariants(step)?;

        sqlx::query(&format!(
            "INSERT INTO step_executions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            STEP_COLUMNS
        ))
        .bind(&step.execution_id)
        .bind(&step.step_id)
        .bind(step.status.as_str())
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.error)
        .bind(&step.approval_token)
        .bind(&step.approved_by)
        .bind(step.approved_at.as_ref().map(to_millis))
        .bind(step.started_at.as_ref().map(to_millis))
        .bind(step.completed_at.as_ref().map(to_millis))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create step execution", e))?;

        Ok(())
    }

    async fn update_step_execution(&self, step: &StepExecution) -> StateStoreResult<()> {
        Self::check_step_invariants(step)?;

        let current = self
            .get_step_execution(&step.execution_id, &step.step_id)
            .await?
            .ok_or_else(|| {
                StateStoreError::NotFound(format!("step {}/{}", step.execution_id, step.step_id))
            })?;

        if !current.status.can_transition_to(step.status) {
            return Err(StateStoreError::InvalidTransition(format!(
                "step {}/{}: {} -> {}",
                step.execution_id, step.step_id, current.status, step.status
            )));
        }

        sqlx::query(
            r#"
            UPDATE step_executions
            SET status = ?, input = ?, output = ?, error = ?, approval_token = ?,
                approved_by = ?, approved_at = ?, started_at = ?, completed_at = ?
            WHERE execution_id = ? AND step_id = ?
            "#,
        )
        .bind(step.status.as_str())
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.error)
        .bind(&step.approval_token)
        .bind(&step.approved_by)
        .bind(step.approved_at.as_ref().map(to_millis))
        .bind(step.started_at.as_ref().map(to_millis))
        .bind(step.completed_at.as_ref().map(to_millis))
        .bind(&step.execution_id)
        .bind(&step.step_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update step execution", e))?;

        Ok(())
    }

    async fn get_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> StateStoreResult<Option<StepExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE execution_id = ? AND step_id = ?",
            STEP_COLUMNS
        ))
        .bind(execution_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch step execution", e))?;

        row.as_ref().map(Self::row_to_step).transpose()
    }

    async fn list_step_executions(&self, execution_id: &str) -> StateStoreResult<Vec<StepExecution>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE execution_id = ? ORDER BY rowid",
            STEP_COLUMNS
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list step executions", e))?;

        rows.iter().map(Self::row_to_step).collect()
    }

    async fn get_step_by_approval_token(
        &self,
        approval_token: &str,
    ) -> StateStoreResult<Option<StepExecution>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM step_executions WHERE approval_token = ?",
            STEP_COLUMNS
        ))
        .bind(approval_token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to fetch step by approval token", e))?;

        row.as_ref().map(Self::row_to_step).transpose()
    }
}
