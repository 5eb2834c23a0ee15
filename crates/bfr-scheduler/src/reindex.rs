//! On-demand workspace reindex.
//!
//! Walks the synced workspace, mirrors file contents into `platform_files`,
//! and streams progress on `reindex:<job_id>`. The heavier semantic
//! indexing (decorator discovery, embeddings) belongs to the file-index
//! collaborator; the fabric's part is the mirror the caches read from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};

use bfr_cache::CacheClient;
use bfr_schemas::{channels, BusMessage};

/// A request as published on the reindex channel.
#[derive(Debug, Clone, Deserialize)]
pub struct ReindexRequest {
    pub job_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Run one reindex job end to end; failures publish `reindex_failed`.
pub async fn handle_reindex_request(
    pool: &PgPool,
    cache: &CacheClient,
    workspace_dir: &Path,
    request: &ReindexRequest,
) {
    info!(job_id = %request.job_id, user_id = ?request.user_id, "starting reindex job");
    publish(cache, &request.job_id, BusMessage::ReindexProgress {
        job_id: request.job_id.clone(),
        phase: "started".to_string(),
        current: 0,
        total: 0,
        current_file: None,
    })
    .await;

    match reindex_workspace(pool, cache, workspace_dir, &request.job_id).await {
        Ok(count) => {
            info!(job_id = %request.job_id, files = count, "reindex completed");
            publish(cache, &request.job_id, BusMessage::ReindexCompleted {
                job_id: request.job_id.clone(),
                counts: Some(json!({"files": count})),
            })
            .await;
        }
        Err(err) => {
            warn!(job_id = %request.job_id, error = ?err, "reindex failed");
            publish(cache, &request.job_id, BusMessage::ReindexFailed {
                job_id: request.job_id.clone(),
                error: err.to_string(),
            })
            .await;
        }
    }
}

async fn reindex_workspace(
    pool: &PgPool,
    cache: &CacheClient,
    workspace_dir: &Path,
    job_id: &str,
) -> Result<u64> {
    let files = collect_files(workspace_dir)?;
    let total = files.len() as u64;
    let mut indexed = 0u64;

    for path in files {
        let relative = path
            .strip_prefix(workspace_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .into_owned();

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) => {
                // Binary or unreadable files are skipped, not fatal.
                warn!(file = %relative, error = %err, "skipping unreadable file");
                continue;
            }
        };
        bfr_db::workflows::upsert_platform_file(pool, &relative, &content).await?;
        indexed += 1;

        if indexed % 25 == 0 {
            publish(cache, job_id, BusMessage::ReindexProgress {
                job_id: job_id.to_string(),
                phase: "indexing".to_string(),
                current: indexed,
                total,
                current_file: Some(relative),
            })
            .await;
        }
    }

    // The requirements cache reads through platform_files; refresh it so
    // the mirror and the cache agree.
    if let Err(err) = cache.warm_requirements_cache(pool).await {
        warn!(error = ?err, "requirements re-warm after reindex failed");
    }
    Ok(indexed)
}

fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("read workspace dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

async fn publish(cache: &CacheClient, job_id: &str, message: BusMessage) {
    let channel = channels::reindex_job(job_id);
    if let Err(err) = cache.publish(&channel, &message).await {
        warn!(job_id, error = ?err, "reindex publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_files_skips_hidden_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("flows")).unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "requests\n").unwrap();
        std::fs::write(dir.path().join("flows/on_order.py"), "# wf\n").unwrap();
        std::fs::write(dir.path().join(".git/config"), "x").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| {
                p.strip_prefix(dir.path())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["flows/on_order.py", "requirements.txt"]);
    }
}
