//! The chat HTTP surface: message + retry streaming endpoints, cooperative
//! stop, and the session CRUD the client drives between turns.

use axum::extract::Query;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use llm_client::clients::types::{LLMClientCompletionRequest, LLMClientMessage};

use crate::agent::prompts;
use crate::agent::router::parse_json_response;
use crate::agent::types::{Agent, RequestContext, ResolvedModelConfig, RetryTarget};
use crate::application::application::Application;
use crate::chat::db::{self, NewUserMessage};
use crate::chat::types::{
    AgentConfig, AttachmentMetadata, Chat, ChatType, FeedbackType, Message, MessageFeedback,
};
use crate::trace::TraceSpan;

use super::answer_stream::{error_stream, generate_answer_stream};
use super::model_selection::{model_catalog, SelectedModelConfig};
use super::types::{json, ApiResponse, Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 100;

static FILE_PILL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\[[^\]]*\]\(doc:([^)]+)\)").expect("file pill regex to compile"));
static THREAD_PILL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@\[[^\]]*\]\(thread:([^)]+)\)").expect("thread pill regex to compile")
});

/// Pulls the pill-encoded document and thread references out of a message.
/// Pills render as `@[Title](doc:<id>)` and `@[Title](thread:<id>)`.
pub fn extract_context_pills(message: &str) -> (Vec<String>, Vec<String>) {
    let file_ids = FILE_PILL_RE
        .captures_iter(message)
        .map(|capture| capture[1].to_owned())
        .collect();
    let thread_ids = THREAD_PILL_RE
        .captures_iter(message)
        .map(|capture| capture[1].to_owned())
        .collect();
    (file_ids, thread_ids)
}

/// Identity arrives from the auth layer in front of this service.
fn request_context(headers: &HeaderMap, app: &Application) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };
    RequestContext {
        user_email: header("x-user-email").unwrap_or_else(|| "user@localhost".to_owned()),
        workspace_external_id: header("x-workspace-external-id")
            .unwrap_or_else(|| "default".to_owned()),
        timezone: header("x-timezone").unwrap_or_else(|| app.config.default_timezone.to_owned()),
        now: chrono::Utc::now(),
    }
}

fn resolve_model_config(raw: Option<&str>) -> Result<ResolvedModelConfig> {
    let config = match raw {
        Some(raw) => SelectedModelConfig::parse(raw)
            .map_err(|error| Error::user(format!("bad selectedModelConfig: {}", error)))?,
        None => SelectedModelConfig::default(),
    };
    Ok(config.resolve())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum KbItemType {
    #[default]
    File,
    Folder,
}

#[derive(Debug, Clone, Deserialize)]
struct KbItemSelection {
    id: String,
    #[serde(rename = "type", default)]
    item_type: KbItemType,
}

fn parse_kb_items(raw: Option<&str>) -> Result<(Vec<String>, Vec<String>)> {
    let Some(raw) = raw else {
        return Ok((Vec::new(), Vec::new()));
    };
    let selections: Vec<KbItemSelection> = serde_json::from_str(raw)
        .map_err(|error| Error::user(format!("bad selectedKbItems: {}", error)))?;
    let mut file_ids = Vec::new();
    let mut folder_ids = Vec::new();
    for selection in selections {
        match selection.item_type {
            KbItemType::File => file_ids.push(selection.id),
            KbItemType::Folder => folder_ids.push(selection.id),
        }
    }
    Ok((file_ids, folder_ids))
}

async fn load_agent_config(
    app: &Application,
    agent_external_id: Option<&str>,
) -> Result<Option<AgentConfig>> {
    match agent_external_id {
        Some(agent_external_id) => Ok(Some(
            db::get_agent_by_external_id(&app.sql, agent_external_id)
                .await?
                .ok_or_else(|| Error::not_found(format!("agent {} not found", agent_external_id)))?,
        )),
        None => Ok(None),
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_answer_agent(
    app: Application,
    ctx: RequestContext,
    chat: Chat,
    user_message: Message,
    previous_messages: Vec<Message>,
    model: ResolvedModelConfig,
    agent_config: Option<AgentConfig>,
    retry_target: RetryTarget,
    attachments: Vec<AttachmentMetadata>,
    kb_file_ids: Vec<String>,
    kb_folder_ids: Vec<String>,
) -> impl IntoResponse {
    let cancellation = app.stream_registry.register(&chat.external_id);
    let (sender, receiver) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let mut trace = TraceSpan::new("answer");
    trace.set_attr("chat_id", chat.external_id.to_owned());
    trace.set_attr("message_id", user_message.external_id.to_owned());
    trace.set_attr("model", model.label.to_owned());
    let kb_mode = chat.chat_type == ChatType::KnowledgeBase
        || !kb_file_ids.is_empty()
        || !kb_folder_ids.is_empty();

    let agent = Agent {
        application: app,
        chat,
        user_message,
        previous_messages,
        ctx,
        model,
        agent_config,
        retry_target,
        attachments,
        kb_file_ids,
        kb_folder_ids,
        sender,
        cancellation,
        trace,
        kb_mode,
        alpha: None,
        started: false,
        answer_text: String::new(),
        thinking: String::new(),
        sources: Vec::new(),
        citation_map: Default::default(),
        image_citations: Vec::new(),
        previous_results: Vec::new(),
        cost: 0.0,
        usage: Default::default(),
    };
    generate_answer_stream(agent, receiver)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQuery {
    pub message: String,
    pub chat_id: Option<String>,
    pub selected_model_config: Option<String>,
    pub selected_kb_items: Option<String>,
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agentic: bool,
}

pub async fn send_message(
    Extension(app): Extension<Application>,
    headers: HeaderMap,
    Query(query): Query<MessageQuery>,
    body: Option<Json<Vec<AttachmentMetadata>>>,
) -> Result<axum::response::Response> {
    let ctx = request_context(&headers, &app);
    let model = resolve_model_config(query.selected_model_config.as_deref())?;

    // The tool-calling runtime is a separate core; without it deployed the
    // agentic flag cannot be honored.
    if query.agentic && !model.websearch && !model.deep_research {
        return Ok(error_stream(
            "The agentic tool runtime is not enabled on this deployment.".to_owned(),
        )
        .into_response());
    }

    let (kb_file_ids, kb_folder_ids) = parse_kb_items(query.selected_kb_items.as_deref())?;
    let attachments = body.map(|Json(attachments)| attachments).unwrap_or_default();
    let (file_ids, thread_ids) = extract_context_pills(&query.message);
    let new_message = NewUserMessage {
        content: query.message.to_owned(),
        file_ids,
        thread_ids,
        attachments: attachments.to_vec(),
    };

    let (chat, previous_messages, user_message) = match query.chat_id.as_deref() {
        Some(chat_id) => db::append_user_message(&app.sql, chat_id, &new_message).await?,
        None => {
            let chat_type = if kb_file_ids.is_empty() && kb_folder_ids.is_empty() {
                ChatType::Default
            } else {
                ChatType::KnowledgeBase
            };
            let (chat, user_message) = db::create_chat_with_first_message(
                &app.sql,
                &ctx.workspace_external_id,
                &ctx.user_email,
                query.agent_id.as_deref(),
                chat_type,
                &new_message,
            )
            .await?;
            (chat, Vec::new(), user_message)
        }
    };

    let agent_external_id = chat
        .agent_external_id
        .clone()
        .or_else(|| query.agent_id.clone());
    let agent_config = load_agent_config(&app, agent_external_id.as_deref()).await?;

    Ok(spawn_answer_agent(
        app,
        ctx,
        chat,
        user_message,
        previous_messages,
        model,
        agent_config,
        RetryTarget::None,
        attachments,
        kb_file_ids,
        kb_folder_ids,
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    pub message_id: String,
    pub selected_model_config: Option<String>,
}

pub async fn retry(
    Extension(app): Extension<Application>,
    headers: HeaderMap,
    Json(request): Json<RetryRequest>,
) -> Result<axum::response::Response> {
    let ctx = request_context(&headers, &app);
    let model = resolve_model_config(request.selected_model_config.as_deref())?;

    let (chat, target) = db::get_message_by_external_id(&app.sql, &request.message_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("message {} not found", request.message_id)))?;
    let all_messages = db::get_chat_messages(&app.sql, &chat).await?;
    let position = all_messages
        .iter()
        .position(|message| message.external_id == target.external_id)
        .ok_or_else(|| Error::internal("message missing from its own chat"))?;

    // Retry uses the conversation up to (but not including) the targeted
    // message.
    let (user_message, previous_messages, retry_target) = if target.is_user() {
        (
            target.clone(),
            all_messages[..position].to_vec(),
            RetryTarget::UserTurn,
        )
    } else {
        let user_position = all_messages[..position]
            .iter()
            .rposition(|message| message.is_user())
            .ok_or_else(|| Error::internal("assistant message without a user turn"))?;
        (
            all_messages[user_position].clone(),
            all_messages[..user_position].to_vec(),
            RetryTarget::AssistantTurn {
                message_external_id: target.external_id.to_owned(),
            },
        )
    };

    let attachments = db::get_message_attachments(&app.sql, user_message.id).await?;
    let agent_config = load_agent_config(&app, chat.agent_external_id.as_deref()).await?;

    Ok(spawn_answer_agent(
        app,
        ctx,
        chat,
        user_message,
        previous_messages,
        model,
        agent_config,
        retry_target,
        attachments,
        Vec::new(),
        Vec::new(),
    )
    .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub chat_id: String,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub success: bool,
}

impl ApiResponse for StopResponse {}

pub async fn stop_streaming(
    Extension(app): Extension<Application>,
    Json(request): Json<StopRequest>,
) -> Result<impl IntoResponse> {
    // stopping a chat without an active stream is a deliberate no-op
    app.stream_registry.stop(&request.chat_id);
    Ok(json(StopResponse { success: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    pub chat_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatWithMessages {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

impl ApiResponse for ChatWithMessages {}

pub async fn get_chat(
    Extension(app): Extension<Application>,
    Query(query): Query<ChatQuery>,
) -> Result<impl IntoResponse> {
    let chat = db::get_chat_by_external_id(&app.sql, &query.chat_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("chat {} not found", query.chat_id)))?;
    let messages = db::get_chat_messages(&app.sql, &chat).await?;
    Ok(json(ChatWithMessages { chat, messages }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameRequest {
    pub chat_id: String,
    pub title: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

impl ApiResponse for SuccessResponse {}

pub async fn rename_chat(
    Extension(app): Extension<Application>,
    Json(request): Json<RenameRequest>,
) -> Result<impl IntoResponse> {
    db::rename_chat(&app.sql, &request.chat_id, &request.title).await?;
    Ok(json(SuccessResponse { success: true }))
}

pub async fn delete_chat(
    Extension(app): Extension<Application>,
    Json(request): Json<StopRequest>,
) -> Result<impl IntoResponse> {
    app.stream_registry.stop(&request.chat_id);
    let attachment_file_ids = db::delete_chat(&app.sql, &request.chat_id).await?;
    // blob removal is best effort and stays out of the transaction
    let attachment_dir = app.config.attachment_dir();
    tokio::spawn(async move {
        for file_id in attachment_file_ids {
            let path = attachment_dir.join(&file_id);
            if let Err(error) = tokio::fs::remove_file(&path).await {
                tracing::debug!(?error, ?path, "attachment blob removal failed");
            }
        }
    });
    Ok(json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkRequest {
    pub chat_id: String,
    #[serde(default = "default_bookmark")]
    pub bookmark: bool,
}

fn default_bookmark() -> bool {
    true
}

pub async fn bookmark_chat(
    Extension(app): Extension<Application>,
    Json(request): Json<BookmarkRequest>,
) -> Result<impl IntoResponse> {
    db::set_chat_bookmarked(&app.sql, &request.chat_id, request.bookmark).await?;
    Ok(json(SuccessResponse { success: true }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub page: usize,
}

const HISTORY_PAGE_SIZE: usize = 20;

#[derive(Debug, Serialize)]
pub struct ChatHistory {
    pub chats: Vec<Chat>,
}

impl ApiResponse for ChatHistory {}

pub async fn chat_history(
    Extension(app): Extension<Application>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse> {
    let ctx = request_context(&headers, &app);
    let chats = db::list_chat_history(
        &app.sql,
        &ctx.user_email,
        HISTORY_PAGE_SIZE,
        query.page * HISTORY_PAGE_SIZE,
    )
    .await?;
    Ok(json(ChatHistory { chats }))
}

pub async fn chat_favorites(
    Extension(app): Extension<Application>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let ctx = request_context(&headers, &app);
    let chats = db::list_favorite_chats(&app.sql, &ctx.user_email).await?;
    Ok(json(ChatHistory { chats }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceQuery {
    pub chat_id: String,
    pub message_id: String,
}

#[derive(Debug, Serialize)]
pub struct TraceResponse {
    pub trace: serde_json::Value,
}

impl ApiResponse for TraceResponse {}

pub async fn chat_trace(
    Extension(app): Extension<Application>,
    Query(query): Query<TraceQuery>,
) -> Result<impl IntoResponse> {
    let trace = db::get_trace(&app.sql, &query.chat_id, &query.message_id)
        .await?
        .ok_or_else(|| Error::not_found("no trace recorded for this message"))?;
    Ok(json(TraceResponse { trace }))
}

/// Accepts both feedback variants: the simple `{messageId, type}` form and
/// the enhanced form with structured feedback and an optional shared chat.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub message_id: String,
    #[serde(rename = "type")]
    pub feedback_type: FeedbackType,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub share_chat: Option<String>,
}

pub async fn message_feedback(
    Extension(app): Extension<Application>,
    Json(request): Json<FeedbackRequest>,
) -> Result<impl IntoResponse> {
    let feedback = MessageFeedback {
        feedback_type: request.feedback_type,
        feedback: request.feedback,
        share_chat: request.share_chat,
    };
    db::set_message_feedback(&app.sql, &request.message_id, &feedback).await?;
    Ok(json(SuccessResponse { success: true }))
}

#[derive(Debug, Serialize)]
pub struct FollowupQuestions {
    pub questions: Vec<String>,
}

impl ApiResponse for FollowupQuestions {}

pub async fn followup_questions(
    Extension(app): Extension<Application>,
    Json(request): Json<StopRequest>,
) -> Result<impl IntoResponse> {
    let chat = db::get_chat_by_external_id(&app.sql, &request.chat_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("chat {} not found", request.chat_id)))?;
    let messages = db::get_chat_messages(&app.sql, &chat).await?;
    let conversation = messages
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.content))
        .collect::<Vec<_>>()
        .join("\n");

    let llm_request = LLMClientCompletionRequest::from_messages(
        vec![LLMClientMessage::system(prompts::followup_questions_prompt(
            &conversation,
        ))],
        super::model_selection::llm_type_for_label("gpt-4o-mini"),
    );
    let api_key = app.llm_api_key(llm_request.model())?;
    let raw = app.llm_broker.completion(api_key, llm_request).await?;

    #[derive(Deserialize, Default)]
    struct Questions {
        #[serde(default)]
        questions: Vec<String>,
    }
    let mut questions = parse_json_response::<Questions>(&raw)
        .map(|parsed| parsed.questions)
        .unwrap_or_default();
    questions.truncate(3);
    Ok(json(FollowupQuestions { questions }))
}

#[derive(Debug, Serialize)]
pub struct ModelCatalogResponse {
    pub models: Vec<super::model_selection::ModelCatalogEntry>,
}

impl ApiResponse for ModelCatalogResponse {}

pub async fn models() -> Result<impl IntoResponse> {
    Ok(json(ModelCatalogResponse {
        models: model_catalog(),
    }))
}

#[derive(Debug, Serialize)]
pub struct TitleResponse {
    pub title: String,
}

impl ApiResponse for TitleResponse {}

/// Regenerates the chat title from the first exchange.
pub async fn regenerate_title(
    Extension(app): Extension<Application>,
    Json(request): Json<StopRequest>,
) -> Result<impl IntoResponse> {
    let chat = db::get_chat_by_external_id(&app.sql, &request.chat_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("chat {} not found", request.chat_id)))?;
    let messages = db::get_chat_messages(&app.sql, &chat).await?;
    let question = messages
        .iter()
        .find(|message| message.is_user())
        .map(|message| message.content.to_owned())
        .unwrap_or_default();
    let answer = messages
        .iter()
        .find(|message| message.is_assistant())
        .map(|message| message.content.to_owned())
        .unwrap_or_default();

    let llm_request = LLMClientCompletionRequest::from_messages(
        vec![LLMClientMessage::system(prompts::title_prompt(
            &question, &answer,
        ))],
        super::model_selection::llm_type_for_label("gpt-4o-mini"),
    );
    let api_key = app.llm_api_key(llm_request.model())?;
    let title = app
        .llm_broker
        .completion(api_key, llm_request)
        .await?
        .trim()
        .trim_matches('"')
        .to_owned();
    if title.is_empty() {
        return Err(Error::upstream("title generation produced nothing"));
    }
    db::rename_chat(&app.sql, &chat.external_id, &title).await?;
    Ok(json(TitleResponse { title }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_context_pills() {
        let message =
            "summarize @[Q3 Plan](doc:file-123) and the thread @[Budget](thread:thr-9) please";
        let (file_ids, thread_ids) = extract_context_pills(message);
        assert_eq!(file_ids, vec!["file-123".to_owned()]);
        assert_eq!(thread_ids, vec!["thr-9".to_owned()]);
    }

    #[test]
    fn test_extract_context_pills_empty() {
        let (file_ids, thread_ids) = extract_context_pills("plain question");
        assert!(file_ids.is_empty());
        assert!(thread_ids.is_empty());
    }

    #[test]
    fn test_parse_kb_items_split_by_type() {
        let (files, folders) = parse_kb_items(Some(
            r#"[{"id": "f1", "type": "file"}, {"id": "d1", "type": "folder"}]"#,
        ))
        .expect("kb items to parse");
        assert_eq!(files, vec!["f1".to_owned()]);
        assert_eq!(folders, vec!["d1".to_owned()]);
    }

    #[test]
    fn test_feedback_request_simple_variant() {
        let request: FeedbackRequest =
            serde_json::from_str(r#"{"messageId": "m1", "type": "like"}"#)
                .expect("simple feedback to parse");
        assert_eq!(request.feedback_type, FeedbackType::Like);
        assert!(request.feedback.is_empty());
        assert!(request.share_chat.is_none());
    }
}
