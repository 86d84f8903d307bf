//! The single routing LLM call: answer-from-history, rewrite and retrieval
//! plan classification, plus the follow-up topic threading that decides
//! which part of the conversation the router gets to see.

use std::collections::HashMap;

use llm_client::clients::types::{LLMClientCompletionRequest, LLMClientMessage};

use crate::chat::db;
use crate::chat::types::Message;
use crate::search::client::SearchOptions;
use crate::search::types::{App, HitFields, MailParticipants, RankProfile};

use super::prompts;
use super::types::{
    apply_follow_up_inheritance, Agent, AgentError, RouterClassification,
};

const NAME_RESOLUTION_HIT_COUNT: usize = 50;
const CHAIN_BREAK_LIMIT: usize = 5;

/// Strips an optional fenced-code wrapper and parses the model's JSON reply.
pub fn parse_json_response<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, AgentError> {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        body = rest.trim_start();
        if let Some(end) = body.rfind("```") {
            body = body[..end].trim_end();
        }
    }
    serde_json::from_str(body).map_err(Into::into)
}

/// Walks backward from the latest user turn, inheriting messages while the
/// persisted classification says `is_follow_up`, and includes the first
/// non-follow-up user message as the topic root. Returns indices into
/// `messages` in chronological order.
pub fn topic_thread(messages: &[Message]) -> Vec<usize> {
    if messages.is_empty() {
        return Vec::new();
    }
    let mut root = 0;
    for (index, message) in messages.iter().enumerate().rev() {
        if !message.is_user() {
            continue;
        }
        root = index;
        let is_follow_up = message
            .classification
            .as_ref()
            .and_then(|raw| serde_json::from_value::<RouterClassification>(raw.clone()).ok())
            .map(|classification| classification.is_follow_up)
            .unwrap_or(false);
        if !is_follow_up {
            break;
        }
    }
    (root..messages.len()).collect()
}

/// Classifications of user turns before the current topic root, surfaced to
/// the router so it can recognise context switches.
pub fn chain_break_classifications(
    messages: &[Message],
    topic: &[usize],
) -> Vec<RouterClassification> {
    let topic_start = topic.first().copied().unwrap_or(messages.len());
    messages[..topic_start]
        .iter()
        .rev()
        .filter(|message| message.is_user())
        .filter_map(|message| {
            message
                .classification
                .as_ref()
                .and_then(|raw| serde_json::from_value(raw.clone()).ok())
        })
        .take(CHAIN_BREAK_LIMIT)
        .collect()
}

fn format_chain_breaks(classifications: &[RouterClassification]) -> String {
    classifications
        .iter()
        .map(|classification| {
            format!(
                "- type: {:?}, apps: {:?}, filterQuery: {:?}",
                classification.query_type,
                classification.filters.apps,
                classification.filter_query,
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl Agent {
    /// Runs the routing call, persists the classification on the user turn
    /// and applies follow-up inheritance from the previous classification.
    pub async fn route(&mut self) -> Result<RouterClassification, AgentError> {
        let topic = topic_thread(&self.previous_messages);
        let chain_breaks =
            format_chain_breaks(&chain_break_classifications(&self.previous_messages, &topic));
        let previous_classification = self.previous_classification();
        let previous_json = previous_classification
            .as_ref()
            .and_then(|classification| serde_json::to_string(classification).ok());

        let mut messages = vec![LLMClientMessage::system(prompts::router_system_prompt(
            &self.ctx,
            &chain_breaks,
            previous_json.as_deref(),
        ))];
        for index in topic {
            let message = &self.previous_messages[index];
            if message.is_user() {
                messages.push(LLMClientMessage::user(message.content.to_owned()));
            } else if !message.content.is_empty() {
                messages.push(LLMClientMessage::assistant(message.content.to_owned()));
            }
        }
        messages.push(LLMClientMessage::user(self.user_message.content.to_owned()));

        let request =
            LLMClientCompletionRequest::from_messages(messages, self.model.llm_type.to_owned())
                .fix_message_structure();
        let raw = self.llm_completion(request).await?;
        let mut classification: RouterClassification = parse_json_response(&raw)
            .map_err(|_| AgentError::InvalidClassification(raw.to_owned()))?;

        if let Some(previous) = previous_classification.as_ref() {
            apply_follow_up_inheritance(&mut classification, previous);
        }

        {
            let span = self.trace.start_child("router");
            span.set_attr("is_follow_up", classification.is_follow_up);
            span.set_attr("type", format!("{:?}", classification.query_type));
            span.set_attr("direct_answer", classification.direct_answer().is_some());
            span.set_attr(
                "query_rewrite",
                classification.query_rewrite.clone().unwrap_or_default(),
            );
            span.end();
        }

        db::set_message_classification(
            &self.application.sql,
            &self.user_message.external_id,
            &serde_json::to_value(&classification)?,
        )
        .await?;

        Ok(classification)
    }

    /// Classification persisted on the most recent prior user turn.
    pub fn previous_classification(&self) -> Option<RouterClassification> {
        self.previous_messages
            .iter()
            .rev()
            .find(|message| message.is_user())
            .and_then(|message| message.classification.as_ref())
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
    }

    pub fn last_user_turn(&self) -> Option<&Message> {
        self.previous_messages
            .iter()
            .rev()
            .find(|message| message.is_user())
    }

    /// The router emits participant names as the user typed them. When the
    /// query targets mail, a second LLM call seeded with the top mail hits
    /// for those names maps each one to an address.
    pub async fn resolve_mail_participants(
        &mut self,
        participants: MailParticipants,
    ) -> Result<MailParticipants, AgentError> {
        let unresolved = participants
            .unresolved_names()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        if unresolved.is_empty() {
            return Ok(participants);
        }

        let options = SearchOptions::new(NAME_RESOLUTION_HIT_COUNT)
            .set_rank_profile(RankProfile::NativeRank);
        let hits = self
            .application
            .search
            .search(
                &unresolved.join(" "),
                &self.ctx.user_email,
                Some(&[App::Gmail]),
                None,
                &options,
            )
            .await?;
        let candidates = hits
            .iter()
            .filter_map(|hit| match &hit.fields {
                HitFields::Mail(fields) => Some(format!(
                    "From: {} To: {} Subject: {}",
                    fields.from,
                    fields.to.join(", "),
                    fields.subject,
                )),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let names = unresolved.iter().map(String::as_str).collect::<Vec<_>>();
        let request = LLMClientCompletionRequest::from_messages(
            vec![LLMClientMessage::system(prompts::name_resolution_prompt(
                &names,
                &candidates,
            ))],
            self.model.llm_type.to_owned(),
        );
        let raw = self.llm_completion(request).await?;

        #[derive(serde::Deserialize)]
        struct NameMapping {
            #[serde(default)]
            mapping: HashMap<String, String>,
        }
        let mapping = parse_json_response::<NameMapping>(&raw)
            .map(|parsed| parsed.mapping)
            .unwrap_or_default();

        let resolve = |entries: Vec<String>| {
            entries
                .into_iter()
                .map(|entry| mapping.get(&entry).cloned().unwrap_or(entry))
                .collect::<Vec<_>>()
        };
        Ok(MailParticipants {
            from: resolve(participants.from),
            to: resolve(participants.to),
            cc: resolve(participants.cc),
            bcc: resolve(participants.bcc),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::types::MessageRole;

    fn message(role: MessageRole, content: &str, is_follow_up: Option<bool>) -> Message {
        Message {
            id: 0,
            external_id: uuid::Uuid::new_v4().to_string(),
            chat_external_id: "chat".to_owned(),
            role,
            content: content.to_owned(),
            thinking: None,
            classification: is_follow_up.map(|is_follow_up| {
                serde_json::json!({ "isFollowUp": is_follow_up })
            }),
            file_ids: vec![],
            thread_ids: vec![],
            sources: vec![],
            image_citations: vec![],
            model_id: None,
            cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            error_message: None,
            feedback: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_topic_thread_stops_at_topic_root() {
        let messages = vec![
            message(MessageRole::User, "old topic", Some(false)),
            message(MessageRole::Assistant, "old answer", None),
            message(MessageRole::User, "new topic", Some(false)),
            message(MessageRole::Assistant, "new answer", None),
            message(MessageRole::User, "follow up", Some(true)),
            message(MessageRole::Assistant, "follow answer", None),
        ];
        let topic = topic_thread(&messages);
        assert_eq!(topic, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_topic_thread_without_classifications_is_last_turn() {
        let messages = vec![
            message(MessageRole::User, "one", None),
            message(MessageRole::Assistant, "a1", None),
            message(MessageRole::User, "two", None),
            message(MessageRole::Assistant, "a2", None),
        ];
        let topic = topic_thread(&messages);
        assert_eq!(topic, vec![2, 3]);
    }

    #[test]
    fn test_chain_breaks_exclude_topic() {
        let messages = vec![
            message(MessageRole::User, "old", Some(false)),
            message(MessageRole::Assistant, "a", None),
            message(MessageRole::User, "current", Some(false)),
        ];
        let topic = topic_thread(&messages);
        let breaks = chain_break_classifications(&messages, &topic);
        assert_eq!(breaks.len(), 1);
        assert!(!breaks[0].is_follow_up);
    }

    #[test]
    fn test_parse_json_response_strips_fences() {
        let parsed: RouterClassification =
            parse_json_response("```json\n{\"isFollowUp\": true}\n```").expect("to parse");
        assert!(parsed.is_follow_up);
    }
}
