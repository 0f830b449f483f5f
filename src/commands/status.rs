use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::adapters::SQLITE_DB_FILE_NAME;
use crate::cli::StatusArgs;
use crate::pipeline::{CheckpointManager, REPORT_FILE_NAME, ResultStore, Stage};

pub fn run(args: StatusArgs) -> Result<()> {
    let store = ResultStore::new(&args.output_dir())?;
    let checkpoint = CheckpointManager::new(store.root(), &args.run_name);

    info!(
        output_dir = %store.root().display(),
        run_name = %args.run_name,
        "status requested"
    );

    match checkpoint.load()? {
        Some(record) => {
            let completed = record
                .completed_stages
                .iter()
                .map(|stage| stage.as_str())
                .collect::<Vec<_>>()
                .join(",");
            info!(
                path = %checkpoint.path().display(),
                completed = %completed,
                updated_at = %record.updated_at,
                dataset_fingerprint = %record.dataset_fingerprint.unwrap_or_default(),
                search_results = record.search_results.as_ref().map_or(0, Vec::len),
                answer_results = record.answer_results.as_ref().map_or(0, Vec::len),
                evaluated = record.eval_results.as_ref().map_or(0, |eval| eval.total_questions),
                "loaded checkpoint"
            );
        }
        None => warn!(path = %checkpoint.path().display(), "checkpoint missing"),
    }

    for stage in Stage::ALL {
        let name = stage.artifact_name();
        if store.exists(name) {
            info!(stage = %stage, path = %store.path(name).display(), "artifact present");
        } else {
            warn!(stage = %stage, artifact = name, "artifact missing");
        }
    }
    if !store.exists(REPORT_FILE_NAME) {
        warn!(artifact = REPORT_FILE_NAME, "report missing");
    }

    let db_path = store.path(SQLITE_DB_FILE_NAME);
    if db_path.exists() {
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        let memories = query_count(&conn, "SELECT COUNT(*) FROM memories").unwrap_or(0);
        let conversations =
            query_count(&conn, "SELECT COUNT(DISTINCT conversation_id) FROM memories").unwrap_or(0);
        info!(
            path = %db_path.display(),
            conversations = conversations,
            memories = memories,
            "sqlite-fts memory store"
        );
    }

    Ok(())
}

fn query_count(conn: &Connection, sql: &str) -> Result<i64> {
    let count = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count)
}
