use std::collections::HashMap;

use llm_client::clients::types::{LLMClientError, LLMClientUsage, LLMType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::application::application::Application;
use crate::chat::db::ChatDbError;
use crate::chat::types::{
    AgentConfig, AttachmentMetadata, Chat, Citation, ImageCitation, Message,
};
use crate::search::client::SearchError;
use crate::search::types::{App, Entity, MailParticipants, SearchHit, TimestampRange};
use crate::trace::TraceSpan;

/// The most items a user can ask for through `GetItems` in one turn.
pub const MAX_USER_REQUEST_COUNT: usize = 50;
/// Global chunk budget shared by every document in an assembled context.
pub const GLOBAL_CHUNK_BUDGET: usize = 120;
/// Chunk budget used on the metadata paths, which carry few documents.
pub const METADATA_CHUNK_BUDGET: usize = 20;
/// Default retrieval lookback when the router does not narrow the window.
pub const DEFAULT_LOOKBACK_DAYS: i64 = 120;
/// Mail labels excluded from temporal searches.
pub const PROMO_MAIL_LABELS: [&str; 2] = ["CATEGORY_PROMOTIONS", "SPAM"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueryType {
    #[default]
    RetrieveInformation,
    GetItems,
    SearchWithFilters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalDirection {
    Prev,
    Next,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterFilters {
    pub apps: Vec<App>,
    pub entities: Vec<Entity>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub sort_direction: Option<SortDirection>,
    pub count: Option<usize>,
    pub offset: usize,
    pub mail_participants: Option<MailParticipants>,
}

impl RouterFilters {
    pub fn sort_descending(&self) -> bool {
        !matches!(self.sort_direction, Some(SortDirection::Asc))
    }

    /// Parses the router's ISO timestamps into a backend range. An inverted
    /// range is reported on the trace and replaced with no bounds, the
    /// caller then applies its default window.
    pub fn timestamp_range(&self, span: &mut TraceSpan) -> Option<TimestampRange> {
        let parse = |value: &Option<String>| {
            value.as_deref().and_then(|raw| {
                chrono::DateTime::parse_from_rfc3339(raw)
                    .map(|parsed| parsed.timestamp_millis())
                    .ok()
            })
        };
        let from = parse(&self.start_time);
        let to = parse(&self.end_time);
        if from.is_none() && to.is_none() {
            return None;
        }
        let range = TimestampRange::new(from, to);
        if !range.is_valid() {
            span.set_attr("invalid_time_range", true);
            span.set_attr(
                "requested_range",
                format!("{:?}..{:?}", self.start_time, self.end_time),
            );
            return None;
        }
        Some(range)
    }
}

/// Validated output of the single routing LLM call. Persisted on the user
/// message so follow-ups can inherit scope and advance pagination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterClassification {
    pub is_follow_up: bool,
    pub answer: Option<String>,
    pub query_rewrite: Option<String>,
    pub temporal_direction: Option<TemporalDirection>,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    pub filter_query: Option<String>,
    pub filters: RouterFilters,
}

impl RouterClassification {
    pub fn direct_answer(&self) -> Option<&str> {
        self.answer.as_deref().filter(|answer| !answer.is_empty())
    }

    pub fn retrieval_query<'a>(&'a self, original: &'a str) -> &'a str {
        self.query_rewrite
            .as_deref()
            .filter(|rewrite| !rewrite.is_empty())
            .unwrap_or(original)
    }

    pub fn targets_mail(&self) -> bool {
        self.filters.apps.is_empty() || self.filters.apps.contains(&App::Gmail)
    }

    pub fn targets_calendar(&self) -> bool {
        self.filters.apps.contains(&App::Calendar)
    }
}

/// Carries scope forward from the previous turn: app and entity filters are
/// inherited when missing, and a zero offset advances past the previous
/// page so "show me more" returns the next items.
pub fn apply_follow_up_inheritance(
    classification: &mut RouterClassification,
    previous: &RouterClassification,
) {
    if !classification.is_follow_up {
        return;
    }
    if classification.filters.apps.is_empty() {
        classification.filters.apps = previous.filters.apps.clone();
    }
    if classification.filters.entities.is_empty() {
        classification.filters.entities = previous.filters.entities.clone();
    }
    if classification.filters.mail_participants.is_none() {
        classification.filters.mail_participants = previous.filters.mail_participants.clone();
    }
    if classification.query_type == QueryType::GetItems
        && previous.query_type == QueryType::GetItems
        && classification.filters.offset == 0
    {
        classification.filters.offset =
            previous.filters.offset + previous.filters.count.unwrap_or(0);
    }
}

/// How a generation attempt concluded. Strategies return these instead of
/// using errors for control flow.
#[derive(Debug)]
pub enum AnswerOutcome {
    /// The model produced prose; the final rewritten text is attached.
    Answered(String),
    /// Retrieval found nothing to answer from.
    NoDocs,
    /// The strategy gave up and wants the iterative RAG fallback.
    Fallback,
    /// The client went away or the stop endpoint fired.
    StreamClosed,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("search failed: {0}")]
    Search(#[from] SearchError),

    #[error("llm call failed: {0}")]
    Llm(#[from] LLMClientError),

    #[error("chat store failed: {0}")]
    Db(#[from] ChatDbError),

    #[error("serde failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("router produced an unusable classification: {0}")]
    InvalidClassification(String),

    #[error("stream closed")]
    StreamClosed,
}

impl AgentError {
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, AgentError::StreamClosed)
    }

    /// The short phrase surfaced to users; detail stays in the logs and the
    /// trace.
    pub fn user_facing_message(&self) -> String {
        match self {
            AgentError::Llm(LLMClientError::RateLimitExceeded) => {
                "Rate limit exceeded. Please try again in a moment.".to_owned()
            }
            AgentError::Llm(LLMClientError::InvalidAPIKey) => {
                "The configured model credentials were rejected.".to_owned()
            }
            AgentError::Llm(LLMClientError::ContextLengthExceeded) => {
                "Input context is too large.".to_owned()
            }
            AgentError::Search(SearchError::DocumentNotFound(_, _)) => {
                "A referenced document could not be found.".to_owned()
            }
            _ => "Something went wrong. Please try again.".to_owned(),
        }
    }
}

pub const NO_ANSWER_ERROR: &str =
    "I could not find an answer for that. Please make your query more specific.";
pub const ATTACHMENT_STORAGE_FAILED: &str = "attachment_storage_failed";

/// Events flowing from the generator to the SSE adapter. Names map one to
/// one onto the wire events clients subscribe to.
#[derive(Debug, Clone)]
pub enum AnswerEvent {
    ResponseMetadata {
        chat_id: String,
        message_id: Option<String>,
    },
    ChatTitleUpdate {
        title: String,
    },
    AttachmentUpdate {
        message_id: String,
        attachments: Vec<AttachmentMetadata>,
    },
    Start,
    ResponseUpdate {
        text: String,
    },
    Reasoning {
        text: String,
    },
    CitationsUpdate {
        context_chunks: Vec<Citation>,
        citation_map: HashMap<usize, usize>,
    },
    ImageCitationUpdate(ImageCitation),
    DeepResearchReasoning {
        step: serde_json::Value,
    },
    Error {
        error: String,
    },
    End,
}

impl AnswerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            AnswerEvent::ResponseMetadata { .. } => "ResponseMetadata",
            AnswerEvent::ChatTitleUpdate { .. } => "ChatTitleUpdate",
            AnswerEvent::AttachmentUpdate { .. } => "AttachmentUpdate",
            AnswerEvent::Start => "Start",
            AnswerEvent::ResponseUpdate { .. } => "ResponseUpdate",
            AnswerEvent::Reasoning { .. } => "Reasoning",
            AnswerEvent::CitationsUpdate { .. } => "CitationsUpdate",
            AnswerEvent::ImageCitationUpdate(_) => "ImageCitationUpdate",
            AnswerEvent::DeepResearchReasoning { .. } => "DeepResearchReasoning",
            AnswerEvent::Error { .. } => "Error",
            AnswerEvent::End => "End",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            AnswerEvent::ResponseMetadata {
                chat_id,
                message_id,
            } => serde_json::json!({ "chatId": chat_id, "messageId": message_id }),
            AnswerEvent::ChatTitleUpdate { title } => serde_json::json!({ "title": title }),
            AnswerEvent::AttachmentUpdate {
                message_id,
                attachments,
            } => serde_json::json!({ "messageId": message_id, "attachments": attachments }),
            AnswerEvent::Start | AnswerEvent::End => serde_json::json!({}),
            AnswerEvent::ResponseUpdate { text } => serde_json::json!({ "text": text }),
            AnswerEvent::Reasoning { text } => serde_json::json!({ "text": text }),
            AnswerEvent::CitationsUpdate {
                context_chunks,
                citation_map,
            } => serde_json::json!({
                "contextChunks": context_chunks,
                "citationMap": citation_map,
            }),
            AnswerEvent::ImageCitationUpdate(image_citation) => {
                serde_json::to_value(image_citation).unwrap_or(serde_json::Value::Null)
            }
            AnswerEvent::DeepResearchReasoning { step } => step.clone(),
            AnswerEvent::Error { error } => serde_json::json!({ "error": error }),
        }
    }
}

/// Identity and environment of the requesting user, fed to the router so it
/// can resolve relative time expressions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_email: String,
    pub workspace_external_id: String,
    pub timezone: String,
    pub now: chrono::DateTime<chrono::Utc>,
}

/// Which message a retry regenerates.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryTarget {
    /// Fresh turn, no retry.
    None,
    /// Regenerate the reply to the user turn; inserts a new assistant row
    /// pinned at `user.created_at + 1`.
    UserTurn,
    /// Regenerate an existing assistant message in place.
    AssistantTurn { message_external_id: String },
}

/// The resolved model selection for one request.
#[derive(Debug, Clone)]
pub struct ResolvedModelConfig {
    pub llm_type: LLMType,
    pub label: String,
    pub reasoning: bool,
    pub websearch: bool,
    pub deep_research: bool,
}

/// One request's answer engine. Construction happens in the webserver
/// handler; the strategy methods live in sibling modules as further
/// `impl Agent` blocks.
pub struct Agent {
    pub application: Application,
    pub chat: Chat,
    pub user_message: Message,
    pub previous_messages: Vec<Message>,
    pub ctx: RequestContext,
    pub model: ResolvedModelConfig,
    pub agent_config: Option<AgentConfig>,
    pub retry_target: RetryTarget,
    pub attachments: Vec<AttachmentMetadata>,
    pub kb_file_ids: Vec<String>,
    pub kb_folder_ids: Vec<String>,
    pub sender: tokio::sync::mpsc::Sender<AnswerEvent>,
    pub cancellation: CancellationToken,
    pub trace: TraceSpan,
    pub kb_mode: bool,
    /// Per-user override of the hybrid mix, loaded from personalization.
    pub alpha: Option<f64>,

    // Streaming accumulation. `previous_results` holds every hit already
    // exposed to the model so citation indices stay unique across
    // iterations in reasoning mode.
    pub started: bool,
    pub answer_text: String,
    pub thinking: String,
    pub sources: Vec<Citation>,
    pub citation_map: HashMap<usize, usize>,
    pub image_citations: Vec<ImageCitation>,
    pub previous_results: Vec<SearchHit>,
    pub cost: f64,
    pub usage: LLMClientUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_round_trip() {
        let raw = serde_json::json!({
            "isFollowUp": false,
            "answer": null,
            "queryRewrite": "latest invoices",
            "temporalDirection": "next",
            "type": "GetItems",
            "filterQuery": null,
            "filters": {
                "apps": ["gmail"],
                "entities": [],
                "sortDirection": "desc",
                "count": 3,
                "mailParticipants": {"from": ["alice"]},
            }
        });
        let classification: RouterClassification =
            serde_json::from_value(raw).expect("classification to parse");
        assert_eq!(classification.query_type, QueryType::GetItems);
        assert_eq!(
            classification.temporal_direction,
            Some(TemporalDirection::Next)
        );
        assert_eq!(classification.filters.count, Some(3));
        assert!(classification.filters.sort_descending());
        assert_eq!(classification.retrieval_query("orig"), "latest invoices");
    }

    #[test]
    fn test_follow_up_advances_offset() {
        let previous = RouterClassification {
            query_type: QueryType::GetItems,
            filters: RouterFilters {
                apps: vec![App::Gmail],
                count: Some(10),
                offset: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut current = RouterClassification {
            is_follow_up: true,
            query_type: QueryType::GetItems,
            filters: RouterFilters {
                count: Some(10),
                ..Default::default()
            },
            ..Default::default()
        };
        apply_follow_up_inheritance(&mut current, &previous);
        assert_eq!(current.filters.offset, 10);
        assert_eq!(current.filters.apps, vec![App::Gmail]);
    }

    #[test]
    fn test_follow_up_keeps_explicit_offset() {
        let previous = RouterClassification {
            query_type: QueryType::GetItems,
            filters: RouterFilters {
                count: Some(10),
                offset: 10,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut current = RouterClassification {
            is_follow_up: true,
            query_type: QueryType::GetItems,
            filters: RouterFilters {
                offset: 30,
                ..Default::default()
            },
            ..Default::default()
        };
        apply_follow_up_inheritance(&mut current, &previous);
        assert_eq!(current.filters.offset, 30);
    }

    #[test]
    fn test_inverted_time_range_is_rejected_and_traced() {
        let filters = RouterFilters {
            start_time: Some("2024-06-01T00:00:00Z".to_owned()),
            end_time: Some("2024-01-01T00:00:00Z".to_owned()),
            ..Default::default()
        };
        let mut span = TraceSpan::new("test");
        assert!(filters.timestamp_range(&mut span).is_none());
        assert_eq!(span.attributes.get("invalid_time_range"), Some(&true.into()));
    }
}
