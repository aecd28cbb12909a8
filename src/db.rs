use std::str::FromStr;

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// Lifecycle of one prebuild task.
///
/// `PENDING -> RUNNING -> {SUCCESS | ERROR | CANCELLED}`. The terminal
/// states are mutually exclusive; the supervisor is the only writer while
/// an activity is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "PENDING" => TaskStatus::Pending,
            "RUNNING" => TaskStatus::Running,
            "SUCCESS" => TaskStatus::Success,
            "ERROR" => TaskStatus::Error,
            "CANCELLED" => TaskStatus::Cancelled,
            other => bail!("unknown task status {other:?} in database"),
        })
    }
}

/// One idempotent shell command inside a prebuild event. `idx` is the
/// stable ordinal among siblings; `log_group_id` names the task's log
/// stream.
#[derive(Debug, Clone)]
pub struct VmTask {
    pub id: i64,
    pub idx: i32,
    pub command: String,
    pub status: TaskStatus,
    pub log_group_id: i64,
}

#[derive(Debug, Clone)]
pub struct PrebuildEvent {
    pub id: i64,
    /// Ordered by `idx`.
    pub tasks: Vec<VmTask>,
}

/// The relational store behind the agent. Only three entities are
/// touched: prebuild events (read), task status (update), log chunks
/// (append).
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {url:?}"))?
            .create_if_missing(true);
        //a single connection keeps in-memory databases coherent and is
        //plenty for the agent's write rate
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("could not open database")?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS prebuild_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT
            )",
            "CREATE TABLE IF NOT EXISTS log_groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT
            )",
            "CREATE TABLE IF NOT EXISTS vm_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prebuild_event_id INTEGER NOT NULL REFERENCES prebuild_events(id),
                idx INTEGER NOT NULL,
                command TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                log_group_id INTEGER NOT NULL REFERENCES log_groups(id),
                UNIQUE(prebuild_event_id, idx)
            )",
            "CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                log_group_id INTEGER NOT NULL REFERENCES log_groups(id),
                idx INTEGER NOT NULL,
                content BLOB NOT NULL,
                UNIQUE(log_group_id, idx)
            )",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("failed to initialize database schema")?;
        }
        Ok(())
    }

    /// Loads a prebuild event and its tasks ordered by `idx`, failing if
    /// the event does not exist.
    pub async fn prebuild_event_with_tasks(&self, event_id: i64) -> Result<PrebuildEvent> {
        sqlx::query("SELECT id FROM prebuild_events WHERE id = ?")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query prebuild event")?
            .with_context(|| format!("prebuild event {event_id} does not exist"))?;

        let rows = sqlx::query(
            "SELECT id, idx, command, status, log_group_id
             FROM vm_tasks WHERE prebuild_event_id = ? ORDER BY idx",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to query vm tasks")?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            tasks.push(VmTask {
                id: row.get("id"),
                idx: row.get("idx"),
                command: row.get("command"),
                status: TaskStatus::parse(row.get::<String, _>("status").as_str())?,
                log_group_id: row.get("log_group_id"),
            });
        }
        Ok(PrebuildEvent {
            id: event_id,
            tasks,
        })
    }

    pub async fn update_task_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        let result = sqlx::query("UPDATE vm_tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(task_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to set task {task_id} status to {}", status.as_str()))?;
        if result.rows_affected() != 1 {
            bail!("task {task_id} does not exist, cannot set status");
        }
        Ok(())
    }

    /// Appends one chunk to a log group. The caller owns `idx` assignment;
    /// within a group it must be contiguous from zero.
    pub async fn append_log_chunk(&self, log_group_id: i64, idx: i64, content: &[u8]) -> Result<()> {
        sqlx::query("INSERT INTO logs (log_group_id, idx, content) VALUES (?, ?, ?)")
            .bind(log_group_id)
            .bind(idx)
            .bind(content)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to append log chunk {idx} to group {log_group_id}"))?;
        Ok(())
    }

    /// Returns a group's chunks ordered by `idx`.
    pub async fn log_chunks(&self, log_group_id: i64) -> Result<Vec<(i64, Vec<u8>)>> {
        let rows = sqlx::query("SELECT idx, content FROM logs WHERE log_group_id = ? ORDER BY idx")
            .bind(log_group_id)
            .fetch_all(&self.pool)
            .await
            .context("failed to query log chunks")?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("idx"), row.get("content")))
            .collect())
    }

    /// Inserts a prebuild event with one pending task per command, each
    /// with a fresh log group. The surrounding platform normally does
    /// this; the agent only reads events back.
    pub async fn create_prebuild_event(&self, commands: &[&str]) -> Result<PrebuildEvent> {
        let event_id = sqlx::query("INSERT INTO prebuild_events DEFAULT VALUES")
            .execute(&self.pool)
            .await
            .context("failed to insert prebuild event")?
            .last_insert_rowid();

        for (idx, command) in commands.iter().enumerate() {
            let log_group_id = sqlx::query("INSERT INTO log_groups DEFAULT VALUES")
                .execute(&self.pool)
                .await
                .context("failed to insert log group")?
                .last_insert_rowid();
            sqlx::query(
                "INSERT INTO vm_tasks (prebuild_event_id, idx, command, status, log_group_id)
                 VALUES (?, ?, ?, 'PENDING', ?)",
            )
            .bind(event_id)
            .bind(idx as i64)
            .bind(command)
            .bind(log_group_id)
            .execute(&self.pool)
            .await
            .context("failed to insert vm task")?;
        }

        self.prebuild_event_with_tasks(event_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Db {
        Db::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn event_round_trips_with_ordered_tasks() {
        let db = memory_db().await;
        let event = db
            .create_prebuild_event(&["echo A", "echo B", "echo C"])
            .await
            .unwrap();

        let loaded = db.prebuild_event_with_tasks(event.id).await.unwrap();
        assert_eq!(loaded.tasks.len(), 3);
        for (idx, task) in loaded.tasks.iter().enumerate() {
            assert_eq!(task.idx, idx as i32);
            assert_eq!(task.status, TaskStatus::Pending);
        }
        assert_eq!(loaded.tasks[1].command, "echo B");
        //each task gets its own log group
        let groups: std::collections::HashSet<_> =
            loaded.tasks.iter().map(|t| t.log_group_id).collect();
        assert_eq!(groups.len(), 3);
    }

    #[tokio::test]
    async fn missing_event_is_an_error() {
        let db = memory_db().await;
        assert!(db.prebuild_event_with_tasks(42).await.is_err());
    }

    #[tokio::test]
    async fn status_update_persists() {
        let db = memory_db().await;
        let event = db.create_prebuild_event(&["true"]).await.unwrap();
        let task_id = event.tasks[0].id;

        db.update_task_status(task_id, TaskStatus::Running)
            .await
            .unwrap();
        db.update_task_status(task_id, TaskStatus::Success)
            .await
            .unwrap();

        let loaded = db.prebuild_event_with_tasks(event.id).await.unwrap();
        assert_eq!(loaded.tasks[0].status, TaskStatus::Success);
    }

    #[tokio::test]
    async fn status_update_on_unknown_task_fails() {
        let db = memory_db().await;
        assert!(db
            .update_task_status(9000, TaskStatus::Running)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn log_chunks_come_back_in_idx_order() {
        let db = memory_db().await;
        let event = db.create_prebuild_event(&["true"]).await.unwrap();
        let group = event.tasks[0].log_group_id;

        db.append_log_chunk(group, 0, b"hello ").await.unwrap();
        db.append_log_chunk(group, 1, b"world\n").await.unwrap();

        let chunks = db.log_chunks(group).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0, b"hello ".to_vec()));
        assert_eq!(chunks[1], (1, b"world\n".to_vec()));
    }

    #[tokio::test]
    async fn duplicate_log_idx_is_rejected() {
        let db = memory_db().await;
        let event = db.create_prebuild_event(&["true"]).await.unwrap();
        let group = event.tasks[0].log_group_id;

        db.append_log_chunk(group, 0, b"once").await.unwrap();
        assert!(db.append_log_chunk(group, 0, b"twice").await.is_err());
    }
}

