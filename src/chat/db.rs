//! All chat-store access lives here. Multi-write operations are one
//! transaction per logical step: chat creation with its first message,
//! message append, delete cascade, retry rewrite.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

use super::types::{
    AgentConfig, AttachmentMetadata, Chat, ChatType, Citation, ImageCitation, Message,
    MessageFeedback, MessageRole, UNTITLED_CHAT,
};

pub type SqlDb = Arc<SqlitePool>;

#[derive(Error, Debug)]
pub enum ChatDbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serde failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("chat {0} not found")]
    ChatNotFound(String),

    #[error("message {0} not found")]
    MessageNotFound(String),
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn init_sqlite(database_path: &std::path::Path) -> Result<SqlDb, ChatDbError> {
    let options = SqliteConnectOptions::from_str(&format!(
        "sqlite://{}",
        database_path.to_string_lossy()
    ))
    .map_err(sqlx::Error::from)?
    .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(Arc::new(pool))
}

fn encode_json<T: serde::Serialize>(value: &T) -> Option<String> {
    serde_json::to_string(value).ok()
}

fn decode_json<T: serde::de::DeserializeOwned + Default>(value: Option<String>) -> T {
    value
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

fn decode_json_opt<T: serde::de::DeserializeOwned>(value: Option<String>) -> Option<T> {
    value.and_then(|raw| serde_json::from_str(&raw).ok())
}

fn row_to_chat(row: &sqlx::sqlite::SqliteRow) -> Result<Chat, sqlx::Error> {
    let chat_type: String = row.try_get("chat_type")?;
    Ok(Chat {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        workspace_external_id: row.try_get("workspace_external_id")?,
        user_email: row.try_get("user_email")?,
        title: row.try_get("title")?,
        is_bookmarked: row.try_get::<i64, _>("is_bookmarked")? != 0,
        agent_external_id: row.try_get("agent_external_id")?,
        chat_type: if chat_type == "knowledge_base" {
            ChatType::KnowledgeBase
        } else {
            ChatType::Default
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_message(
    row: &sqlx::sqlite::SqliteRow,
    chat_external_id: &str,
) -> Result<Message, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(Message {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        chat_external_id: chat_external_id.to_owned(),
        role: if role == "assistant" {
            MessageRole::Assistant
        } else {
            MessageRole::User
        },
        content: row.try_get("content")?,
        thinking: row.try_get("thinking")?,
        classification: decode_json_opt(row.try_get("classification")?),
        file_ids: decode_json::<Vec<String>>(row.try_get("file_ids")?),
        thread_ids: decode_json::<Vec<String>>(row.try_get("thread_ids")?),
        sources: decode_json::<Vec<Citation>>(row.try_get("sources")?),
        image_citations: decode_json::<Vec<ImageCitation>>(row.try_get("image_citations")?),
        model_id: row.try_get("model_id")?,
        cost: row.try_get("cost")?,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        error_message: row.try_get("error_message")?,
        feedback: decode_json_opt(row.try_get("feedback")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Everything needed to insert a user turn.
#[derive(Debug, Clone, Default)]
pub struct NewUserMessage {
    pub content: String,
    pub file_ids: Vec<String>,
    pub thread_ids: Vec<String>,
    pub attachments: Vec<AttachmentMetadata>,
}

/// Everything the orchestrator has accumulated for an assistant turn.
#[derive(Debug, Clone, Default)]
pub struct NewAssistantMessage {
    pub content: String,
    pub thinking: Option<String>,
    pub sources: Vec<Citation>,
    pub image_citations: Vec<ImageCitation>,
    pub model_id: Option<String>,
    pub cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

async fn insert_message_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chat_id: i64,
    role: MessageRole,
    message: &NewUserMessage,
    created_at: i64,
) -> Result<i64, ChatDbError> {
    let external_id = uuid::Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT INTO messages (external_id, chat_id, role, content, file_ids, thread_ids, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&external_id)
    .bind(chat_id)
    .bind(role.as_str())
    .bind(&message.content)
    .bind(encode_json(&message.file_ids))
    .bind(encode_json(&message.thread_ids))
    .bind(created_at)
    .bind(created_at)
    .execute(&mut **tx)
    .await?;
    let message_id = result.last_insert_rowid();

    for attachment in message.attachments.iter() {
        sqlx::query(
            "INSERT INTO message_attachments (message_id, file_id, file_name, mime_type, file_size, is_image, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id)
        .bind(&attachment.file_id)
        .bind(&attachment.file_name)
        .bind(&attachment.mime_type)
        .bind(attachment.file_size)
        .bind(attachment.is_image as i64)
        .bind(created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(message_id)
}

/// New chat: chat row, first user message and attachment metadata land in a
/// single transaction.
pub async fn create_chat_with_first_message(
    db: &SqlDb,
    workspace_external_id: &str,
    user_email: &str,
    agent_external_id: Option<&str>,
    chat_type: ChatType,
    message: &NewUserMessage,
) -> Result<(Chat, Message), ChatDbError> {
    let now = now_ms();
    let chat_external_id = uuid::Uuid::new_v4().to_string();
    let mut tx = db.begin().await?;
    let chat_result = sqlx::query(
        "INSERT INTO chats (external_id, workspace_external_id, user_email, title, agent_external_id, chat_type, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&chat_external_id)
    .bind(workspace_external_id)
    .bind(user_email)
    .bind(UNTITLED_CHAT)
    .bind(agent_external_id)
    .bind(match chat_type {
        ChatType::Default => "default",
        ChatType::KnowledgeBase => "knowledge_base",
    })
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let chat_id = chat_result.last_insert_rowid();
    insert_message_tx(&mut tx, chat_id, MessageRole::User, message, now).await?;
    tx.commit().await?;

    let chat = get_chat_by_external_id(db, &chat_external_id)
        .await?
        .ok_or_else(|| ChatDbError::ChatNotFound(chat_external_id.to_owned()))?;
    let messages = get_chat_messages(db, &chat).await?;
    let user_message = messages
        .into_iter()
        .next_back()
        .ok_or_else(|| ChatDbError::MessageNotFound("first message".to_owned()))?;
    Ok((chat, user_message))
}

/// Existing chat: touch `updated_at`, read the prior conversation and insert
/// the new user message in one transaction. Returns prior messages ordered
/// by `created_at` (the new message excluded).
pub async fn append_user_message(
    db: &SqlDb,
    chat_external_id: &str,
    message: &NewUserMessage,
) -> Result<(Chat, Vec<Message>, Message), ChatDbError> {
    let now = now_ms();
    let mut tx = db.begin().await?;
    let chat_row = sqlx::query("SELECT * FROM chats WHERE external_id = ?")
        .bind(chat_external_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ChatDbError::ChatNotFound(chat_external_id.to_owned()))?;
    let chat = row_to_chat(&chat_row)?;

    sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(chat.id)
        .execute(&mut *tx)
        .await?;

    let prior_rows = sqlx::query("SELECT * FROM messages WHERE chat_id = ? ORDER BY created_at ASC, id ASC")
        .bind(chat.id)
        .fetch_all(&mut *tx)
        .await?;
    let prior = prior_rows
        .iter()
        .map(|row| row_to_message(row, chat_external_id))
        .collect::<Result<Vec<_>, _>>()?;

    // created_at strictly increases within a chat, even when the wall
    // clock has not moved past the previous turn yet
    let created_at = prior
        .last()
        .map(|last| now.max(last.created_at + 1))
        .unwrap_or(now);
    let message_id =
        insert_message_tx(&mut tx, chat.id, MessageRole::User, message, created_at).await?;
    tx.commit().await?;

    let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
        .bind(message_id)
        .fetch_one(db.as_ref())
        .await?;
    let user_message = row_to_message(&row, chat_external_id)?;
    Ok((chat, prior, user_message))
}

pub async fn get_chat_by_external_id(
    db: &SqlDb,
    chat_external_id: &str,
) -> Result<Option<Chat>, ChatDbError> {
    let row = sqlx::query("SELECT * FROM chats WHERE external_id = ?")
        .bind(chat_external_id)
        .fetch_optional(db.as_ref())
        .await?;
    row.map(|row| row_to_chat(&row)).transpose().map_err(Into::into)
}

pub async fn get_chat_messages(db: &SqlDb, chat: &Chat) -> Result<Vec<Message>, ChatDbError> {
    let rows = sqlx::query("SELECT * FROM messages WHERE chat_id = ? ORDER BY created_at ASC, id ASC")
        .bind(chat.id)
        .fetch_all(db.as_ref())
        .await?;
    rows.iter()
        .map(|row| row_to_message(row, &chat.external_id))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub async fn get_message_by_external_id(
    db: &SqlDb,
    message_external_id: &str,
) -> Result<Option<(Chat, Message)>, ChatDbError> {
    let row = sqlx::query(
        "SELECT messages.*, chats.external_id AS chat_external_id FROM messages \
         JOIN chats ON chats.id = messages.chat_id WHERE messages.external_id = ?",
    )
    .bind(message_external_id)
    .fetch_optional(db.as_ref())
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let chat_external_id: String = row.try_get("chat_external_id")?;
    let message = row_to_message(&row, &chat_external_id)?;
    let chat = get_chat_by_external_id(db, &chat_external_id)
        .await?
        .ok_or_else(|| ChatDbError::ChatNotFound(chat_external_id))?;
    Ok(Some((chat, message)))
}

/// Inserts an assistant turn. `created_at` is caller supplied: the retry
/// path pins it to `user.created_at + 1` to preserve the alternation order
/// without touching the user row.
pub async fn insert_assistant_message(
    db: &SqlDb,
    chat: &Chat,
    message: &NewAssistantMessage,
    created_at: i64,
) -> Result<Message, ChatDbError> {
    let external_id = uuid::Uuid::new_v4().to_string();
    let result = sqlx::query(
        "INSERT INTO messages (external_id, chat_id, role, content, thinking, sources, image_citations, model_id, cost, input_tokens, output_tokens, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&external_id)
    .bind(chat.id)
    .bind(MessageRole::Assistant.as_str())
    .bind(&message.content)
    .bind(&message.thinking)
    .bind(encode_json(&message.sources))
    .bind(encode_json(&message.image_citations))
    .bind(&message.model_id)
    .bind(message.cost)
    .bind(message.input_tokens)
    .bind(message.output_tokens)
    .bind(created_at)
    .bind(created_at)
    .execute(db.as_ref())
    .await?;
    let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
        .bind(result.last_insert_rowid())
        .fetch_one(db.as_ref())
        .await?;
    row_to_message(&row, &chat.external_id).map_err(Into::into)
}

/// Retry targeting an assistant turn regenerates it in place, `created_at`
/// stays untouched.
pub async fn update_assistant_message(
    db: &SqlDb,
    message_external_id: &str,
    message: &NewAssistantMessage,
) -> Result<(), ChatDbError> {
    sqlx::query(
        "UPDATE messages SET content = ?, thinking = ?, sources = ?, image_citations = ?, model_id = ?, cost = ?, input_tokens = ?, output_tokens = ?, error_message = NULL, updated_at = ? \
         WHERE external_id = ?",
    )
    .bind(&message.content)
    .bind(&message.thinking)
    .bind(encode_json(&message.sources))
    .bind(encode_json(&message.image_citations))
    .bind(&message.model_id)
    .bind(message.cost)
    .bind(message.input_tokens)
    .bind(message.output_tokens)
    .bind(now_ms())
    .bind(message_external_id)
    .execute(db.as_ref())
    .await?;
    Ok(())
}

pub async fn set_message_error(
    db: &SqlDb,
    message_external_id: &str,
    error_message: Option<&str>,
) -> Result<(), ChatDbError> {
    sqlx::query("UPDATE messages SET error_message = ?, updated_at = ? WHERE external_id = ?")
        .bind(error_message)
        .bind(now_ms())
        .bind(message_external_id)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

pub async fn set_message_classification(
    db: &SqlDb,
    message_external_id: &str,
    classification: &serde_json::Value,
) -> Result<(), ChatDbError> {
    sqlx::query("UPDATE messages SET classification = ?, updated_at = ? WHERE external_id = ?")
        .bind(serde_json::to_string(classification)?)
        .bind(now_ms())
        .bind(message_external_id)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

pub async fn set_message_feedback(
    db: &SqlDb,
    message_external_id: &str,
    feedback: &MessageFeedback,
) -> Result<(), ChatDbError> {
    sqlx::query("UPDATE messages SET feedback = ?, updated_at = ? WHERE external_id = ?")
        .bind(encode_json(feedback))
        .bind(now_ms())
        .bind(message_external_id)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

/// Deletes a chat and everything hanging off it in one transaction. Returns
/// the attachment file ids so the caller can drop the blobs outside the
/// transaction, best effort.
pub async fn delete_chat(db: &SqlDb, chat_external_id: &str) -> Result<Vec<String>, ChatDbError> {
    let mut tx = db.begin().await?;
    let chat_row = sqlx::query("SELECT * FROM chats WHERE external_id = ?")
        .bind(chat_external_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ChatDbError::ChatNotFound(chat_external_id.to_owned()))?;
    let chat = row_to_chat(&chat_row)?;

    let attachment_rows = sqlx::query(
        "SELECT message_attachments.file_id FROM message_attachments \
         JOIN messages ON messages.id = message_attachments.message_id WHERE messages.chat_id = ?",
    )
    .bind(chat.id)
    .fetch_all(&mut *tx)
    .await?;
    let attachment_file_ids = attachment_rows
        .iter()
        .map(|row| row.try_get::<String, _>("file_id"))
        .collect::<Result<Vec<_>, _>>()?;

    sqlx::query("DELETE FROM shared_chats WHERE chat_id = ?")
        .bind(chat.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chat_traces WHERE chat_external_id = ?")
        .bind(chat_external_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM message_attachments WHERE message_id IN (SELECT id FROM messages WHERE chat_id = ?)",
    )
    .bind(chat.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM messages WHERE chat_id = ?")
        .bind(chat.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chats WHERE id = ?")
        .bind(chat.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(attachment_file_ids)
}

pub async fn rename_chat(
    db: &SqlDb,
    chat_external_id: &str,
    title: &str,
) -> Result<(), ChatDbError> {
    sqlx::query("UPDATE chats SET title = ?, updated_at = ? WHERE external_id = ?")
        .bind(title)
        .bind(now_ms())
        .bind(chat_external_id)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

pub async fn set_chat_bookmarked(
    db: &SqlDb,
    chat_external_id: &str,
    bookmarked: bool,
) -> Result<(), ChatDbError> {
    sqlx::query("UPDATE chats SET is_bookmarked = ?, updated_at = ? WHERE external_id = ?")
        .bind(bookmarked as i64)
        .bind(now_ms())
        .bind(chat_external_id)
        .execute(db.as_ref())
        .await?;
    Ok(())
}

pub async fn list_chat_history(
    db: &SqlDb,
    user_email: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<Chat>, ChatDbError> {
    let rows = sqlx::query(
        "SELECT * FROM chats WHERE user_email = ? ORDER BY updated_at DESC LIMIT ? OFFSET ?",
    )
    .bind(user_email)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(db.as_ref())
    .await?;
    rows.iter()
        .map(|row| row_to_chat(row))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub async fn list_favorite_chats(db: &SqlDb, user_email: &str) -> Result<Vec<Chat>, ChatDbError> {
    let rows = sqlx::query(
        "SELECT * FROM chats WHERE user_email = ? AND is_bookmarked = 1 ORDER BY updated_at DESC",
    )
    .bind(user_email)
    .fetch_all(db.as_ref())
    .await?;
    rows.iter()
        .map(|row| row_to_chat(row))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub async fn insert_trace(
    db: &SqlDb,
    chat_external_id: &str,
    message_external_id: &str,
    trace: &serde_json::Value,
) -> Result<(), ChatDbError> {
    sqlx::query(
        "INSERT INTO chat_traces (chat_external_id, message_external_id, trace, created_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(chat_external_id)
    .bind(message_external_id)
    .bind(serde_json::to_string(trace)?)
    .bind(now_ms())
    .execute(db.as_ref())
    .await?;
    Ok(())
}

/// Retries overwrite the trace of the turn they regenerated.
pub async fn upsert_trace(
    db: &SqlDb,
    chat_external_id: &str,
    message_external_id: &str,
    trace: &serde_json::Value,
) -> Result<(), ChatDbError> {
    let updated = sqlx::query(
        "UPDATE chat_traces SET trace = ? WHERE chat_external_id = ? AND message_external_id = ?",
    )
    .bind(serde_json::to_string(trace)?)
    .bind(chat_external_id)
    .bind(message_external_id)
    .execute(db.as_ref())
    .await?;
    if updated.rows_affected() == 0 {
        insert_trace(db, chat_external_id, message_external_id, trace).await?;
    }
    Ok(())
}

pub async fn get_trace(
    db: &SqlDb,
    chat_external_id: &str,
    message_external_id: &str,
) -> Result<Option<serde_json::Value>, ChatDbError> {
    let row = sqlx::query(
        "SELECT trace FROM chat_traces WHERE chat_external_id = ? AND message_external_id = ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(chat_external_id)
    .bind(message_external_id)
    .fetch_optional(db.as_ref())
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let raw: String = row.try_get("trace")?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Per-user override of the hybrid search mix for the native rank profile.
pub async fn get_personalization_alpha(
    db: &SqlDb,
    user_email: &str,
) -> Result<Option<f64>, ChatDbError> {
    let row = sqlx::query("SELECT alpha FROM user_personalization WHERE user_email = ?")
        .bind(user_email)
        .fetch_optional(db.as_ref())
        .await?;
    Ok(row.and_then(|row| row.try_get::<Option<f64>, _>("alpha").ok().flatten()))
}

pub async fn get_agent_by_external_id(
    db: &SqlDb,
    agent_external_id: &str,
) -> Result<Option<AgentConfig>, ChatDbError> {
    let row = sqlx::query("SELECT * FROM agents WHERE external_id = ?")
        .bind(agent_external_id)
        .fetch_optional(db.as_ref())
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(AgentConfig {
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        prompt: row.try_get("prompt")?,
        apps: decode_json(row.try_get("apps")?),
        data_source_ids: decode_json(row.try_get("data_source_ids")?),
        channel_ids: decode_json(row.try_get("channel_ids")?),
        kb_file_ids: decode_json(row.try_get("kb_file_ids")?),
    }))
}

pub async fn get_message_attachments(
    db: &SqlDb,
    message_id: i64,
) -> Result<Vec<AttachmentMetadata>, ChatDbError> {
    let rows = sqlx::query("SELECT * FROM message_attachments WHERE message_id = ?")
        .bind(message_id)
        .fetch_all(db.as_ref())
        .await?;
    rows.iter()
        .map(|row| {
            Ok(AttachmentMetadata {
                file_id: row.try_get("file_id")?,
                file_name: row.try_get("file_name")?,
                mime_type: row.try_get("mime_type")?,
                file_size: row.try_get("file_size")?,
                is_image: row.try_get::<i64, _>("is_image")? != 0,
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> SqlDb {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite to open");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migrations to run");
        Arc::new(pool)
    }

    fn user_message(content: &str) -> NewUserMessage {
        NewUserMessage {
            content: content.to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_chat_inserts_first_message() {
        let db = test_db().await;
        let (chat, message) = create_chat_with_first_message(
            &db,
            "ws-1",
            "user@acme.com",
            None,
            ChatType::Default,
            &user_message("hello"),
        )
        .await
        .expect("chat creation to work");
        assert_eq!(chat.title, UNTITLED_CHAT);
        assert_eq!(message.content, "hello");
        assert!(message.is_user());
    }

    #[tokio::test]
    async fn test_retry_preserves_ordering_with_new_row() {
        let db = test_db().await;
        let (chat, user_msg) = create_chat_with_first_message(
            &db,
            "ws-1",
            "user@acme.com",
            None,
            ChatType::Default,
            &user_message("first question"),
        )
        .await
        .unwrap();

        let old = insert_assistant_message(
            &db,
            &chat,
            &NewAssistantMessage {
                content: "old answer".to_owned(),
                ..Default::default()
            },
            user_msg.created_at + 1,
        )
        .await
        .unwrap();

        // retry of the user turn: a new assistant row, pinned one unit past
        // the user turn
        let retried = insert_assistant_message(
            &db,
            &chat,
            &NewAssistantMessage {
                content: "new answer".to_owned(),
                ..Default::default()
            },
            user_msg.created_at + 1,
        )
        .await
        .unwrap();

        assert_eq!(retried.created_at, user_msg.created_at + 1);
        assert_ne!(retried.external_id, old.external_id);
    }

    #[tokio::test]
    async fn test_delete_chat_cascades_and_returns_attachments() {
        let db = test_db().await;
        let message = NewUserMessage {
            content: "with attachment".to_owned(),
            attachments: vec![AttachmentMetadata {
                file_id: "blob-1".to_owned(),
                file_name: "report.pdf".to_owned(),
                mime_type: "application/pdf".to_owned(),
                file_size: 1024,
                is_image: false,
            }],
            ..Default::default()
        };
        let (chat, msg) =
            create_chat_with_first_message(&db, "ws-1", "user@acme.com", None, ChatType::Default, &message)
                .await
                .unwrap();
        insert_trace(
            &db,
            &chat.external_id,
            &msg.external_id,
            &serde_json::json!({"name": "root"}),
        )
        .await
        .unwrap();

        let blobs = delete_chat(&db, &chat.external_id).await.unwrap();
        assert_eq!(blobs, vec!["blob-1".to_owned()]);
        assert!(get_chat_by_external_id(&db, &chat.external_id)
            .await
            .unwrap()
            .is_none());
        assert!(get_trace(&db, &chat.external_id, &msg.external_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_append_reads_prior_messages() {
        let db = test_db().await;
        let (chat, first) = create_chat_with_first_message(
            &db,
            "ws-1",
            "user@acme.com",
            None,
            ChatType::Default,
            &user_message("one"),
        )
        .await
        .unwrap();
        insert_assistant_message(
            &db,
            &chat,
            &NewAssistantMessage {
                content: "answer one".to_owned(),
                ..Default::default()
            },
            first.created_at + 1,
        )
        .await
        .unwrap();

        let (_, prior, new_message) =
            append_user_message(&db, &chat.external_id, &user_message("two"))
                .await
                .unwrap();
        assert_eq!(prior.len(), 2);
        assert_eq!(new_message.content, "two");
        // strict alternation over created_at ordering
        let all = get_chat_messages(&db, &chat).await.unwrap();
        let roles = all.iter().map(|m| m.role).collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![MessageRole::User, MessageRole::Assistant, MessageRole::User]
        );
    }
}
