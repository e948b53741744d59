//! Typed repository over the embedded SQLite store.
//!
//! Secret fields are encoded on write and decoded on read here, not via
//! ORM-style save/load callbacks — see the lifecycle-hooks design note.

use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::crypto::Codec;
use crate::error::{Error, Result};
use crate::store::models::*;

pub struct Store {
    pool: SqlitePool,
    codec: Codec,
}

impl Store {
    pub async fn connect(url: &str, codec: Codec) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool, codec };
        store.migrate_schema().await?;
        store.migrate_legacy_secrets().await?;
        Ok(store)
    }

    async fn migrate_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                client_id TEXT NOT NULL DEFAULT '',
                client_secret TEXT NOT NULL DEFAULT '',
                master_password TEXT NOT NULL DEFAULT '',
                is_official INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backup_destinations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_path TEXT NOT NULL DEFAULT '',
                webdav_url TEXT NOT NULL DEFAULT '',
                webdav_username TEXT NOT NULL DEFAULT '',
                webdav_password TEXT NOT NULL DEFAULT '',
                webdav_path TEXT NOT NULL DEFAULT '',
                s3_endpoint TEXT NOT NULL DEFAULT '',
                s3_region TEXT NOT NULL DEFAULT '',
                s3_bucket TEXT NOT NULL DEFAULT '',
                s3_access_key TEXT NOT NULL DEFAULT '',
                s3_secret_key TEXT NOT NULL DEFAULT '',
                s3_path TEXT NOT NULL DEFAULT '',
                target_server_id INTEGER,
                encrypted INTEGER NOT NULL DEFAULT 0,
                encryption_password TEXT NOT NULL DEFAULT '',
                max_backup_count INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS backup_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                source_server_id INTEGER NOT NULL,
                cron_expression TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_destinations (
                task_id INTEGER NOT NULL,
                destination_id INTEGER NOT NULL,
                PRIMARY KEY (task_id, destination_id)
            );

            CREATE TABLE IF NOT EXISTS backup_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                backup_file TEXT NOT NULL DEFAULT '',
                execution_logs TEXT NOT NULL DEFAULT '[]',
                start_time TEXT NOT NULL,
                end_time TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent: keys off the explicit `enc:v1:` prefix, never a
    /// byte-length heuristic.
    async fn migrate_legacy_secrets(&self) -> Result<()> {
        let rows = sqlx::query("SELECT id, client_secret, master_password FROM server_configs")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let id: Id = row.try_get("id")?;
            let client_secret: String = row.try_get("client_secret")?;
            let master_password: String = row.try_get("master_password")?;
            let new_secret = self.encode_if_needed(&client_secret)?;
            let new_password = self.encode_if_needed(&master_password)?;
            if new_secret != client_secret || new_password != master_password {
                sqlx::query(
                    "UPDATE server_configs SET client_secret = ?, master_password = ? WHERE id = ?",
                )
                .bind(new_secret)
                .bind(new_password)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }

        let rows = sqlx::query(
            "SELECT id, webdav_password, s3_access_key, s3_secret_key, encryption_password FROM backup_destinations",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let id: Id = row.try_get("id")?;
            let webdav_password: String = row.try_get("webdav_password")?;
            let s3_access_key: String = row.try_get("s3_access_key")?;
            let s3_secret_key: String = row.try_get("s3_secret_key")?;
            let encryption_password: String = row.try_get("encryption_password")?;

            let nw = self.encode_if_needed(&webdav_password)?;
            let na = self.encode_if_needed(&s3_access_key)?;
            let ns = self.encode_if_needed(&s3_secret_key)?;
            let ne = self.encode_if_needed(&encryption_password)?;

            if nw != webdav_password || na != s3_access_key || ns != s3_secret_key || ne != encryption_password {
                sqlx::query(
                    "UPDATE backup_destinations SET webdav_password = ?, s3_access_key = ?, s3_secret_key = ?, encryption_password = ? WHERE id = ?",
                )
                .bind(nw)
                .bind(na)
                .bind(ns)
                .bind(ne)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    fn encode_if_needed(&self, value: &str) -> Result<String> {
        if value.is_empty() || Codec::is_encrypted(value) {
            Ok(value.to_string())
        } else {
            self.codec.encrypt(value)
        }
    }

    fn decode(&self, value: &str) -> Result<String> {
        self.codec.decrypt(value)
    }

    // ---- ServerConfig ----

    pub async fn get_server_config(&self, id: Id) -> Result<Option<ServerConfig>> {
        let row = sqlx::query(
            "SELECT id, name, url, client_id, client_secret, master_password, is_official, enabled, created_at, updated_at FROM server_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| self.row_to_server_config(r)).transpose()
    }

    fn row_to_server_config(&self, row: sqlx::sqlite::SqliteRow) -> Result<ServerConfig> {
        Ok(ServerConfig {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            client_id: row.try_get("client_id")?,
            client_secret: self.decode(&row.try_get::<String, _>("client_secret")?)?,
            master_password: self.decode(&row.try_get::<String, _>("master_password")?)?,
            is_official: row.try_get::<i64, _>("is_official")? != 0,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn save_server_config(&self, cfg: &mut ServerConfig) -> Result<()> {
        let now = Utc::now();
        let client_secret = self.encode_if_needed(&cfg.client_secret)?;
        let master_password = self.encode_if_needed(&cfg.master_password)?;
        if cfg.id == 0 {
            cfg.created_at = now;
            cfg.updated_at = now;
            let id: i64 = sqlx::query(
                "INSERT INTO server_configs (name, url, client_id, client_secret, master_password, is_official, enabled, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(&cfg.name)
            .bind(&cfg.url)
            .bind(&cfg.client_id)
            .bind(&client_secret)
            .bind(&master_password)
            .bind(cfg.is_official)
            .bind(cfg.enabled)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;
            cfg.id = id;
        } else {
            cfg.updated_at = now;
            sqlx::query(
                "UPDATE server_configs SET name = ?, url = ?, client_id = ?, client_secret = ?, master_password = ?, is_official = ?, enabled = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&cfg.name)
            .bind(&cfg.url)
            .bind(&cfg.client_id)
            .bind(&client_secret)
            .bind(&master_password)
            .bind(cfg.is_official)
            .bind(cfg.enabled)
            .bind(now)
            .bind(cfg.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    // ---- BackupDestination ----

    pub async fn get_destination(&self, id: Id) -> Result<Option<BackupDestination>> {
        let row = sqlx::query("SELECT * FROM backup_destinations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.row_to_destination(r)).transpose()
    }

    fn row_to_destination(&self, row: sqlx::sqlite::SqliteRow) -> Result<BackupDestination> {
        let kind_str: String = row.try_get("kind")?;
        let kind = match kind_str.as_str() {
            "local" => DestinationKind::Local,
            "webdav" => DestinationKind::Webdav,
            "s3" => DestinationKind::S3,
            "server" => DestinationKind::Server,
            other => return Err(Error::config(format!("unknown destination kind {other}"))),
        };
        Ok(BackupDestination {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: Some(kind),
            local_path: row.try_get("local_path")?,
            webdav_url: row.try_get("webdav_url")?,
            webdav_username: row.try_get("webdav_username")?,
            webdav_password: self.decode(&row.try_get::<String, _>("webdav_password")?)?,
            webdav_path: row.try_get("webdav_path")?,
            s3_endpoint: row.try_get("s3_endpoint")?,
            s3_region: row.try_get("s3_region")?,
            s3_bucket: row.try_get("s3_bucket")?,
            s3_access_key: self.decode(&row.try_get::<String, _>("s3_access_key")?)?,
            s3_secret_key: self.decode(&row.try_get::<String, _>("s3_secret_key")?)?,
            s3_path: row.try_get("s3_path")?,
            target_server_id: row.try_get("target_server_id")?,
            encrypted: row.try_get::<i64, _>("encrypted")? != 0,
            encryption_password: self.decode(&row.try_get::<String, _>("encryption_password")?)?,
            max_backup_count: row.try_get("max_backup_count")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn save_destination(&self, dest: &mut BackupDestination) -> Result<()> {
        let now = Utc::now();
        let max_backup_count = dest.max_backup_count.max(0);
        let webdav_password = self.encode_if_needed(&dest.webdav_password)?;
        let s3_access_key = self.encode_if_needed(&dest.s3_access_key)?;
        let s3_secret_key = self.encode_if_needed(&dest.s3_secret_key)?;
        let encryption_password = self.encode_if_needed(&dest.encryption_password)?;
        let kind = dest.kind.unwrap_or(DestinationKind::Local).as_str();

        if dest.id == 0 {
            dest.created_at = now;
            dest.updated_at = now;
            let id: i64 = sqlx::query(
                r#"INSERT INTO backup_destinations
                   (name, kind, local_path, webdav_url, webdav_username, webdav_password, webdav_path,
                    s3_endpoint, s3_region, s3_bucket, s3_access_key, s3_secret_key, s3_path,
                    target_server_id, encrypted, encryption_password, max_backup_count, enabled,
                    created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   RETURNING id"#,
            )
            .bind(&dest.name)
            .bind(kind)
            .bind(&dest.local_path)
            .bind(&dest.webdav_url)
            .bind(&dest.webdav_username)
            .bind(&webdav_password)
            .bind(&dest.webdav_path)
            .bind(&dest.s3_endpoint)
            .bind(&dest.s3_region)
            .bind(&dest.s3_bucket)
            .bind(&s3_access_key)
            .bind(&s3_secret_key)
            .bind(&dest.s3_path)
            .bind(dest.target_server_id)
            .bind(dest.encrypted)
            .bind(&encryption_password)
            .bind(max_backup_count)
            .bind(dest.enabled)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;
            dest.id = id;
        } else {
            dest.updated_at = now;
            sqlx::query(
                r#"UPDATE backup_destinations SET
                   name = ?, kind = ?, local_path = ?, webdav_url = ?, webdav_username = ?, webdav_password = ?,
                   webdav_path = ?, s3_endpoint = ?, s3_region = ?, s3_bucket = ?, s3_access_key = ?,
                   s3_secret_key = ?, s3_path = ?, target_server_id = ?, encrypted = ?, encryption_password = ?,
                   max_backup_count = ?, enabled = ?, updated_at = ?
                   WHERE id = ?"#,
            )
            .bind(&dest.name)
            .bind(kind)
            .bind(&dest.local_path)
            .bind(&dest.webdav_url)
            .bind(&dest.webdav_username)
            .bind(&webdav_password)
            .bind(&dest.webdav_path)
            .bind(&dest.s3_endpoint)
            .bind(&dest.s3_region)
            .bind(&dest.s3_bucket)
            .bind(&s3_access_key)
            .bind(&s3_secret_key)
            .bind(&dest.s3_path)
            .bind(dest.target_server_id)
            .bind(dest.encrypted)
            .bind(&encryption_password)
            .bind(max_backup_count)
            .bind(dest.enabled)
            .bind(now)
            .bind(dest.id)
            .execute(&self.pool)
            .await?;
        }
        dest.max_backup_count = max_backup_count;
        Ok(())
    }

    // ---- BackupTask ----

    pub async fn get_task(&self, id: Id) -> Result<Option<BackupTask>> {
        let row = sqlx::query(
            "SELECT id, name, source_server_id, cron_expression, enabled, created_at, updated_at FROM backup_tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let destinations = self.load_task_destinations(id).await?;
        Ok(Some(BackupTask {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            source_server_id: row.try_get("source_server_id")?,
            cron_expression: row.try_get("cron_expression")?,
            enabled: row.try_get::<i64, _>("enabled")? != 0,
            destinations,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn load_task_destinations(&self, task_id: Id) -> Result<Vec<BackupDestination>> {
        let rows = sqlx::query(
            "SELECT d.* FROM backup_destinations d JOIN task_destinations td ON td.destination_id = d.id WHERE td.task_id = ?",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| self.row_to_destination(r)).collect()
    }

    /// Loads every enabled task with a non-empty cron expression, destinations preloaded.
    pub async fn list_schedulable_tasks(&self) -> Result<Vec<BackupTask>> {
        let rows = sqlx::query(
            "SELECT id, name, source_server_id, cron_expression, enabled, created_at, updated_at FROM backup_tasks WHERE enabled = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut tasks = Vec::new();
        for row in rows {
            let id: Id = row.try_get("id")?;
            let destinations = self.load_task_destinations(id).await?;
            tasks.push(BackupTask {
                id,
                name: row.try_get("name")?,
                source_server_id: row.try_get("source_server_id")?,
                cron_expression: row.try_get("cron_expression")?,
                enabled: true,
                destinations,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(tasks)
    }

    pub async fn save_task(&self, task: &mut BackupTask) -> Result<()> {
        let now = Utc::now();
        if task.id == 0 {
            task.created_at = now;
            task.updated_at = now;
            let id: i64 = sqlx::query(
                "INSERT INTO backup_tasks (name, source_server_id, cron_expression, enabled, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(&task.name)
            .bind(task.source_server_id)
            .bind(&task.cron_expression)
            .bind(task.enabled)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;
            task.id = id;
        } else {
            task.updated_at = now;
            sqlx::query(
                "UPDATE backup_tasks SET name = ?, source_server_id = ?, cron_expression = ?, enabled = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&task.name)
            .bind(task.source_server_id)
            .bind(&task.cron_expression)
            .bind(task.enabled)
            .bind(now)
            .bind(task.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Cascades into `task_destinations`; the task's backup logs are kept
    /// for audit purposes and are not deleted.
    pub async fn delete_task(&self, task_id: Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_destinations WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM backup_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_logs(&self, task_id: Id, limit: i64) -> Result<Vec<BackupLog>> {
        let rows = sqlx::query(
            "SELECT id, task_id, status, message, backup_file, execution_logs, start_time, end_time, created_at FROM backup_logs WHERE task_id = ? ORDER BY start_time DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(|r| self.row_to_log(r)).collect()
    }

    fn row_to_log(&self, row: sqlx::sqlite::SqliteRow) -> Result<BackupLog> {
        let status_str: String = row.try_get("status")?;
        let status = match status_str.as_str() {
            "running" => LogStatus::Running,
            "success" => LogStatus::Success,
            "failed" => LogStatus::Failed,
            other => return Err(Error::config(format!("unknown log status {other}"))),
        };
        let logs_json: String = row.try_get("execution_logs")?;
        let execution_logs: Vec<LogLine> = serde_json::from_str(&logs_json).unwrap_or_default();
        Ok(BackupLog {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            status,
            message: row.try_get("message")?,
            backup_file: row.try_get("backup_file")?,
            execution_logs,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn set_task_destinations(&self, task_id: Id, destination_ids: &[Id]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM task_destinations WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        for dest_id in destination_ids {
            sqlx::query("INSERT INTO task_destinations (task_id, destination_id) VALUES (?, ?)")
                .bind(task_id)
                .bind(dest_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- BackupLog ----

    pub async fn create_running_log(&self, task_id: Id, start_time: chrono::DateTime<Utc>) -> Result<Id> {
        let id: i64 = sqlx::query(
            "INSERT INTO backup_logs (task_id, status, message, backup_file, execution_logs, start_time, end_time, created_at) VALUES (?, ?, '', '', '[]', ?, NULL, ?) RETURNING id",
        )
        .bind(task_id)
        .bind(LogStatus::Running.as_str())
        .bind(start_time)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?
        .try_get("id")?;
        Ok(id)
    }

    pub async fn finish_log(
        &self,
        log_id: Id,
        status: LogStatus,
        message: &str,
        backup_file: &str,
        trace: &[LogLine],
        end_time: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let trace_json = serde_json::to_string(trace).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "UPDATE backup_logs SET status = ?, message = ?, backup_file = ?, execution_logs = ?, end_time = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(backup_file)
        .bind(trace_json)
        .bind(end_time)
        .bind(log_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
