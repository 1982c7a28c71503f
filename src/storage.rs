use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    migrate::MigrateDatabase,
    sqlite::{SqlitePoolOptions, SqliteRow},
    Executor, QueryBuilder, Row, Sqlite, SqlitePool,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::content::{parse_transcript, to_transcript};
use crate::models::{Conversation, ProviderRow, Role, Turn};

// Define the database schema using CREATE TABLE IF NOT EXISTS statements
const MIGRATIONS_SQL: &str = "
-- Conversations Table
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    title TEXT NOT NULL,
    icon TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL, -- Unix Timestamp (seconds)
    deleted_at INTEGER
);

-- Messages Table: one row per turn, parent_id forms the tree
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL, -- UUID
    conversation_id TEXT NOT NULL,
    parent_id TEXT,
    role TEXT NOT NULL, -- 'user', 'assistant' or 'system'
    content TEXT NOT NULL, -- JSON array of content blocks
    meta_info TEXT, -- JSON usage metadata
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_parent_id ON messages(parent_id);

-- Providers Table
CREATE TABLE IF NOT EXISTS providers (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    api_key TEXT NOT NULL, -- literal key or 'env:MY_API_KEY'
    provider_type TEXT NOT NULL, -- 'openai' or 'gemini'
    base_url TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '', -- JSON array of model configs
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    deleted_at INTEGER
);

-- System Settings Table (Key-Value, value is JSON)
CREATE TABLE IF NOT EXISTS system_config (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

const TURN_COLUMNS: &str =
    "id, conversation_id, parent_id, role, content, meta_info, created_at, deleted_at";

/// Result of writing a turn. A duplicate id is not an error: retries of the
/// same submission must be idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// The slice of persistence the streaming path depends on.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn insert_turn(&self, turn: &Turn) -> Result<InsertOutcome>;

    /// Returns the stored, non-deleted turns named by `path`, in path order.
    /// Ids that are missing are left out, so callers compare lengths.
    async fn fetch_ancestors(&self, conversation_id: Uuid, path: &[Uuid]) -> Result<Vec<Turn>>;
}

#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Connects to the database at `db_url`, creating it if needed, and runs migrations.
    pub async fn connect(db_url: &str) -> Result<Self> {
        log::info!("Connecting to database: {}", db_url);

        // Create the database file if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, kept alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema migrations.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        pool.execute(MIGRATIONS_SQL)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }

    // --- Conversations ---

    pub async fn create_conversation(&self, title: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4(),
            title: title.to_string(),
            icon: String::new(),
            created_at: Utc::now(),
            deleted_at: None,
        };

        sqlx::query("INSERT INTO conversations (id, title, icon, created_at) VALUES (?, ?, ?, ?)")
            .bind(conversation.id.to_string())
            .bind(&conversation.title)
            .bind(&conversation.icon)
            .bind(conversation.created_at.timestamp())
            .execute(&self.pool)
            .await
            .context("Failed to insert new conversation into database")?;

        log::info!("Created conversation with ID: {}", conversation.id);
        Ok(conversation)
    }

    /// Fetches a conversation unless it is missing or soft-deleted.
    pub async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, icon, created_at, deleted_at
            FROM conversations
            WHERE id = ? AND deleted_at IS NULL
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch conversation from database")?;

        row.map(|r| -> Result<Conversation> {
            Ok(Conversation {
                id: parse_uuid(&r, "id")?,
                title: r.try_get("title")?,
                icon: r.try_get("icon")?,
                created_at: timestamp(r.try_get("created_at")?)?,
                deleted_at: optional_timestamp(r.try_get("deleted_at")?)?,
            })
        })
        .transpose()
    }

    pub async fn update_conversation_title(
        &self,
        conversation_id: Uuid,
        title: &str,
        icon: &str,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE conversations SET title = ?, icon = ? WHERE id = ?")
            .bind(title)
            .bind(icon)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update conversation title in database")?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to retitle non-existent conversation: {}", conversation_id);
            return Err(anyhow::anyhow!("Conversation not found for renaming."));
        }
        log::info!("Retitled conversation {} to: {}", conversation_id, title);
        Ok(())
    }

    // --- Turns ---

    /// Every non-deleted turn of a conversation, oldest first.
    pub async fn list_turns(&self, conversation_id: Uuid) -> Result<Vec<Turn>> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM messages \
             WHERE conversation_id = ? AND deleted_at IS NULL \
             ORDER BY created_at ASC, rowid ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch messages from database")?;

        let turns = rows.iter().map(turn_from_row).collect::<Result<Vec<_>>>()?;
        log::debug!("Fetched {} turns for conversation {}", turns.len(), conversation_id);
        Ok(turns)
    }

    /// The `limit` most recent turns of a conversation, newest first.
    pub async fn latest_turns(&self, conversation_id: Uuid, limit: i64) -> Result<Vec<Turn>> {
        let sql = format!(
            "SELECT {TURN_COLUMNS} FROM messages \
             WHERE conversation_id = ? AND deleted_at IS NULL \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(conversation_id.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch latest messages from database")?;

        rows.iter().map(turn_from_row).collect()
    }

    // --- Providers & system config ---

    /// Active, non-deleted provider rows.
    pub async fn list_active_providers(&self) -> Result<Vec<ProviderRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, api_key, provider_type, base_url, model, is_active
            FROM providers
            WHERE is_active = 1 AND deleted_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch providers from database")?;

        rows.iter()
            .map(|row| -> Result<ProviderRow> {
                Ok(ProviderRow {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    api_key: row.try_get("api_key")?,
                    provider_type: row.try_get("provider_type")?,
                    base_url: row.try_get("base_url")?,
                    model: row.try_get("model")?,
                    is_active: row.try_get::<i64, _>("is_active")? != 0,
                })
            })
            .collect()
    }

    pub async fn add_provider(&self, provider: &ProviderRow) -> Result<()> {
        log::info!("Adding provider: {} ({})", provider.name, provider.id);
        sqlx::query(
            r#"
            INSERT INTO providers (id, name, api_key, provider_type, base_url, model, is_active, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&provider.id)
        .bind(&provider.name)
        .bind(&provider.api_key)
        .bind(&provider.provider_type)
        .bind(&provider.base_url)
        .bind(&provider.model)
        .bind(provider.is_active as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to insert provider into database")?;
        Ok(())
    }

    /// Adds a default OpenAI provider if no providers exist.
    pub async fn add_default_provider_if_none(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM providers")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count providers")?;

        if count > 0 {
            log::debug!("Found {} existing providers, skipping default.", count);
            return Ok(());
        }

        log::info!("No providers found, adding a default OpenAI provider.");
        self.add_provider(&ProviderRow {
            id: "openai".to_string(),
            name: "OpenAI".to_string(),
            // Read from the environment when the registry loads
            api_key: "env:OPENAI_API_KEY".to_string(),
            provider_type: "openai".to_string(),
            base_url: String::new(),
            model: r#"[{"id":"gpt-4o-mini","name":"GPT-4o mini","tool_call":true,"structured_output":true}]"#
                .to_string(),
            is_active: true,
        })
        .await
    }

    pub async fn list_system_config(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM system_config")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch system config from database")?;

        rows.iter()
            .map(|row| -> Result<(String, String)> {
                Ok((row.try_get("key")?, row.try_get("value")?))
            })
            .collect()
    }

    pub async fn set_system_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("Failed to write system config")?;
        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for StorageManager {
    async fn insert_turn(&self, turn: &Turn) -> Result<InsertOutcome> {
        log::debug!("Saving turn ID: {} to conversation: {}", turn.id, turn.conversation_id);

        let content = to_transcript(&turn.content)?;
        let meta_info = turn
            .meta_info
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize meta info")?;

        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, parent_id, role, content, meta_info, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(turn.id.to_string())
        .bind(turn.conversation_id.to_string())
        .bind(turn.parent_id.map(|id| id.to_string()))
        .bind(turn.role.as_str())
        .bind(content)
        .bind(meta_info)
        .bind(turn.created_at.timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                log::info!("Saved {} turn {}", turn.role.as_str(), turn.id);
                Ok(InsertOutcome::Inserted)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                log::info!("Turn {} already stored, treating insert as a no-op", turn.id);
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(anyhow::Error::from(e).context("Failed to insert message into database")),
        }
    }

    async fn fetch_ancestors(&self, conversation_id: Uuid, path: &[Uuid]) -> Result<Vec<Turn>> {
        if path.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TURN_COLUMNS} FROM messages WHERE deleted_at IS NULL AND conversation_id = "
        ));
        query.push_bind(conversation_id.to_string());
        query.push(" AND id IN (");
        let mut ids = query.separated(", ");
        for id in path {
            ids.push_bind(id.to_string());
        }
        ids.push_unseparated(")");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch message history")?;

        let mut by_id = rows
            .iter()
            .map(|row| turn_from_row(row).map(|turn| (turn.id, turn)))
            .collect::<Result<HashMap<_, _>>>()?;

        Ok(path.iter().filter_map(|id| by_id.remove(id)).collect())
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn> {
    let role: String = row.try_get("role")?;
    let content: String = row.try_get("content")?;
    let meta_info: Option<String> = row.try_get("meta_info")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;

    Ok(Turn {
        id: parse_uuid(row, "id")?,
        conversation_id: parse_uuid(row, "conversation_id")?,
        parent_id: parent_id
            .filter(|id| !id.is_empty())
            .map(|id| Uuid::parse_str(&id))
            .transpose()
            .context("Failed to parse parent ID")?,
        role: Role::parse(&role).with_context(|| format!("Unknown message role '{}'", role))?,
        content: parse_transcript(&content)?,
        meta_info: meta_info
            .filter(|raw| !raw.is_empty())
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("Failed to parse message meta info")?,
        created_at: timestamp(row.try_get("created_at")?)?,
        deleted_at: optional_timestamp(row.try_get("deleted_at")?)?,
    })
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).with_context(|| format!("Failed to parse {} '{}'", column, raw))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).context("Invalid timestamp")
}

fn optional_timestamp(secs: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    secs.map(timestamp).transpose()
}
