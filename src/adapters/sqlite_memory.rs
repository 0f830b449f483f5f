use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use regex::Regex;
use rusqlite::{Connection, params};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{AdapterConfig, IndexHandle, MemoryAdapter, SearchOptions, SystemInfo};
use crate::model::{Conversation, Metadata, RetrievedMemory, SearchResult};
use crate::util::{ensure_directory, now_utc_string};

const SYSTEM_NAME: &str = "sqlite-fts";
pub const DB_FILE_NAME: &str = "sqlite_fts_memory.sqlite";
const DB_SCHEMA_VERSION: &str = "0.1.0";

/// Local memory system: every message is one memory, retrieved with FTS5 `bm25` ranking
/// inside a single conversation.
pub struct SqliteMemoryAdapter {
    config: AdapterConfig,
    db_path: PathBuf,
    token_pattern: Regex,
}

impl SqliteMemoryAdapter {
    pub fn new(config: AdapterConfig, output_dir: &Path) -> Result<Self> {
        let token_pattern =
            Regex::new(r"[\p{L}\p{N}]+").context("failed to compile query token regex")?;
        Ok(Self {
            config,
            db_path: output_dir.join(DB_FILE_NAME),
            token_pattern,
        })
    }

    fn open(&self, db_path: &Path) -> Result<Connection> {
        if let Some(parent) = db_path.parent() {
            ensure_directory(parent)?;
        }
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        Ok(connection)
    }

    fn to_fts_query(&self, query: &str) -> String {
        self.token_pattern
            .find_iter(&query.to_lowercase())
            .map(|token| format!("\"{}\"", token.as_str()))
            .collect::<Vec<String>>()
            .join(" OR ")
    }

    fn ingest(&self, connection: &mut Connection, conversations: &[Conversation]) -> Result<usize> {
        let tx = connection.transaction()?;
        let mut inserted = 0usize;

        {
            let mut delete = tx.prepare("DELETE FROM memories WHERE conversation_id = ?1")?;
            let mut insert = tx.prepare(
                "
                INSERT INTO memories(
                  memory_id, conversation_id, message_index, speaker, role, timestamp, content, user_id
                )
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
            )?;

            for conversation in conversations {
                delete.execute([&conversation.conversation_id])?;

                for (index, message) in conversation.messages.iter().enumerate() {
                    let memory_id = format!("{}:{index}", conversation.conversation_id);
                    insert.execute(params![
                        memory_id,
                        &conversation.conversation_id,
                        index as i64,
                        &message.speaker_name,
                        &message.role,
                        message.timestamp.map(|ts| ts.to_rfc3339()),
                        &message.content,
                        user_id_for(conversation, &message.speaker_name),
                    ])?;
                    inserted += 1;
                }
            }
        }

        tx.execute("INSERT INTO memories_fts(memories_fts) VALUES('rebuild')", [])
            .context("failed to rebuild memories FTS index")?;
        tx.execute(
            "INSERT INTO metadata(key, value) VALUES('ingested_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            [now_utc_string()],
        )?;
        tx.commit()?;

        Ok(inserted)
    }

    fn holds_conversations(
        &self,
        connection: &Connection,
        conversations: &[Conversation],
    ) -> Result<bool> {
        let mut statement =
            connection.prepare("SELECT COUNT(*) FROM memories WHERE conversation_id = ?1")?;
        for conversation in conversations {
            let stored: i64 =
                statement.query_row([&conversation.conversation_id], |row| row.get(0))?;
            if stored as usize != conversation.messages.len() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl MemoryAdapter for SqliteMemoryAdapter {
    fn add(&self, conversations: &[Conversation]) -> Result<Metadata> {
        let mut connection = self.open(&self.db_path)?;
        let inserted = self.ingest(&mut connection, conversations)?;

        info!(
            conversations = conversations.len(),
            memories = inserted,
            path = %self.db_path.display(),
            "ingested conversations into local memory store"
        );

        let mut metadata = Metadata::new();
        metadata.insert("type".to_string(), json!("local"));
        metadata.insert("system".to_string(), json!(SYSTEM_NAME));
        metadata.insert(
            "conversation_ids".to_string(),
            json!(
                conversations
                    .iter()
                    .map(|conversation| conversation.conversation_id.as_str())
                    .collect::<Vec<_>>()
            ),
        );
        metadata.insert("memories_inserted".to_string(), json!(inserted));
        metadata.insert(
            "db_path".to_string(),
            json!(self.db_path.display().to_string()),
        );
        Ok(metadata)
    }

    fn build_or_recover_index(
        &self,
        conversations: &[Conversation],
        output_dir: &Path,
    ) -> Result<Option<IndexHandle>> {
        let db_path = output_dir.join(DB_FILE_NAME);
        let existed = db_path.is_file();
        let mut connection = self.open(&db_path)?;

        let recovered = existed && self.holds_conversations(&connection, conversations)?;
        if !recovered {
            info!(path = %db_path.display(), "local memory store incomplete, re-ingesting");
            self.ingest(&mut connection, conversations)?;
        }

        let mut metadata = Metadata::new();
        metadata.insert("recovered".to_string(), json!(recovered));
        metadata.insert("conversation_count".to_string(), json!(conversations.len()));

        Ok(Some(IndexHandle {
            location: Some(db_path),
            metadata,
        }))
    }

    fn search(
        &self,
        query: &str,
        conversation_id: &str,
        index: Option<&IndexHandle>,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        let started = Instant::now();
        let db_path = index
            .and_then(|handle| handle.location.clone())
            .unwrap_or_else(|| self.db_path.clone());
        if !db_path.is_file() {
            bail!(
                "local memory store {} does not exist; run the add stage first",
                db_path.display()
            );
        }

        let connection = self.open(&db_path)?;
        let fts_query = self.to_fts_query(query);
        let mut results = Vec::new();

        if !fts_query.is_empty() {
            let mut statement = connection.prepare(
                "
                SELECT
                  m.content,
                  m.speaker,
                  m.user_id,
                  m.message_index,
                  m.timestamp,
                  bm25(memories_fts)
                FROM memories_fts
                JOIN memories m ON m.rowid = memories_fts.rowid
                WHERE
                  memories_fts MATCH ?1
                  AND m.conversation_id = ?2
                ORDER BY bm25(memories_fts) ASC
                LIMIT ?3
                ",
            )?;

            let mut rows =
                statement.query(params![fts_query, conversation_id, options.top_k as i64])?;
            while let Some(row) = rows.next()? {
                let speaker: String = row.get(1)?;
                let timestamp: Option<String> = row.get(4)?;
                let bm25: f64 = row.get(5)?;

                let mut metadata = Metadata::new();
                metadata.insert("speaker".to_string(), json!(speaker));
                metadata.insert("message_index".to_string(), json!(row.get::<_, i64>(3)?));
                metadata.insert(
                    "timestamp".to_string(),
                    timestamp.map(Value::from).unwrap_or(Value::Null),
                );

                results.push(RetrievedMemory {
                    content: row.get(0)?,
                    score: -bm25,
                    user_id: Some(row.get(2)?),
                    metadata,
                    extra: Metadata::new(),
                });
            }
        }

        debug!(
            conversation = %conversation_id,
            hits = results.len(),
            "local memory search"
        );

        let mut retrieval_metadata = Metadata::new();
        retrieval_metadata.insert("system".to_string(), json!(SYSTEM_NAME));
        retrieval_metadata.insert("top_k".to_string(), json!(options.top_k));
        retrieval_metadata.insert(
            "formatted_context".to_string(),
            json!(format_context(&results)),
        );
        retrieval_metadata.insert(
            "latency_ms".to_string(),
            json!(started.elapsed().as_millis() as u64),
        );

        Ok(SearchResult {
            query: query.to_string(),
            conversation_id: conversation_id.to_string(),
            results,
            retrieval_metadata,
        })
    }

    fn system_info(&self) -> SystemInfo {
        let mut details = Metadata::new();
        details.insert("db_schema_version".to_string(), json!(DB_SCHEMA_VERSION));
        details.insert("retrieval".to_string(), json!("fts5-bm25"));
        SystemInfo {
            name: SYSTEM_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            details,
        }
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memories (
          memory_id TEXT PRIMARY KEY,
          conversation_id TEXT NOT NULL,
          message_index INTEGER NOT NULL,
          speaker TEXT NOT NULL,
          role TEXT NOT NULL,
          timestamp TEXT,
          content TEXT NOT NULL,
          user_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_memories_conversation ON memories(conversation_id, message_index);
        ",
    )?;

    connection
        .execute(
            "
            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts
            USING fts5(content, speaker, content='memories', content_rowid='rowid')
            ",
            [],
        )
        .context("failed to initialize FTS5 table memories_fts")?;

    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;

    Ok(())
}

fn user_id_for(conversation: &Conversation, speaker: &str) -> String {
    let hint_key = if speaker == conversation.speaker_a() {
        Some("speaker_a_user_id")
    } else if speaker == conversation.speaker_b() {
        Some("speaker_b_user_id")
    } else {
        None
    };

    if let Some(hint) = hint_key
        .and_then(|key| conversation.metadata.get(key))
        .and_then(Value::as_str)
    {
        return hint.to_string();
    }

    format!(
        "{}_{}",
        conversation.conversation_id,
        speaker.trim().to_lowercase().replace(' ', "_")
    )
}

fn format_context(results: &[RetrievedMemory]) -> String {
    results
        .iter()
        .map(|memory| {
            let speaker = memory
                .metadata
                .get("speaker")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            match memory.metadata.get("timestamp").and_then(Value::as_str) {
                Some(ts) => format!("[{ts}] {speaker}: {}", memory.content),
                None => format!("{speaker}: {}", memory.content),
            }
        })
        .collect::<Vec<String>>()
        .join("\n")
}
