//! Execution log stream.
//!
//! The runner XADDs entries while user code executes; the worker drains the
//! stream into `execution_logs` after the terminal DB write, then deletes
//! it. Stream order is authoritative — dense sequence numbers are assigned
//! at flush time.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use redis::AsyncCommands;
use serde_json::Value;
use uuid::Uuid;

use bfr_schemas::{keys, LogLevel};

use crate::CacheClient;

/// One entry as drained from the stream.
#[derive(Debug, Clone)]
pub struct StreamLogEntry {
    pub timestamp: NaiveDateTime,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<Value>,
}

impl CacheClient {
    /// Append one entry (used by in-process emitters and tests; the runner
    /// writes the same shape from its own process).
    pub async fn append_log(
        &self,
        execution_id: Uuid,
        level: LogLevel,
        message: &str,
        metadata: Option<&Value>,
    ) -> Result<()> {
        let key = keys::log_stream(execution_id);
        let ts = Utc::now().to_rfc3339();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&key)
            .arg("*")
            .arg("timestamp")
            .arg(ts)
            .arg("level")
            .arg(level.as_str())
            .arg("message")
            .arg(message);
        if let Some(meta) = metadata {
            cmd.arg("metadata")
                .arg(serde_json::to_string(meta).context("serialize log metadata")?);
        }
        let mut conn = self.conn();
        let _: String = cmd.query_async(&mut conn).await.context("append_log failed")?;
        Ok(())
    }

    /// Drain the whole stream in order. Entries with missing fields are
    /// kept with lenient defaults — user code writes these.
    pub async fn read_log_stream(&self, execution_id: Uuid) -> Result<Vec<StreamLogEntry>> {
        let key = keys::log_stream(execution_id);
        let mut conn = self.conn();

        // XRANGE key - +  → [(id, [field, value, ...]), ...]
        let raw: Vec<(String, Vec<String>)> = redis::cmd("XRANGE")
            .arg(&key)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .context("read_log_stream failed")?;

        let entries = raw
            .into_iter()
            .map(|(_id, fields)| {
                let mut timestamp = None;
                let mut level = LogLevel::Info;
                let mut message = String::new();
                let mut metadata = None;
                for pair in fields.chunks(2) {
                    let [name, value] = pair else { continue };
                    match name.as_str() {
                        "timestamp" => {
                            timestamp = DateTime::parse_from_rfc3339(value)
                                .ok()
                                .map(|t| t.naive_utc());
                        }
                        "level" => level = LogLevel::parse_lenient(value),
                        "message" => message = value.clone(),
                        "metadata" => metadata = serde_json::from_str(value).ok(),
                        _ => {}
                    }
                }
                StreamLogEntry {
                    timestamp: timestamp.unwrap_or_else(|| Utc::now().naive_utc()),
                    level,
                    message,
                    metadata,
                }
            })
            .collect();
        Ok(entries)
    }

    /// Drop the stream after a successful flush.
    pub async fn delete_log_stream(&self, execution_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: () = conn
            .del(keys::log_stream(execution_id))
            .await
            .context("delete_log_stream failed")?;
        Ok(())
    }
}
