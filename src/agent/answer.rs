//! The answer orchestrator: binds the router to a retrieval strategy, the
//! strategy's results to the context builder and the model's token stream to
//! the citation parser, then persists whatever came out — including partial
//! answers when the client went away mid-stream.

use base64::Engine;
use llm_client::clients::types::{
    LLMClientCompletionRequest, LLMClientCompletionResponse, LLMClientMessage,
};

use crate::chat::db::{self, NewAssistantMessage};
use crate::chat::types::{Citation, ImageCitation, Message};
use crate::search::client::SearchOptions;
use crate::search::types::{HitFields, RankProfile, SearchHit};

use super::citations::{group_line_citations, process_message, CitationStreamParser, ParsedEvent};
use super::context::{build_context, find_image_file_names, ContextOptions};
use super::prompts;
use super::router::{parse_json_response, topic_thread};
use super::types::{
    Agent, AgentError, AnswerEvent, AnswerOutcome, QueryType, RetryTarget, NO_ANSWER_ERROR,
};

const ANSWER_TEMPERATURE: f32 = 0.2;

pub fn mime_from_extension(file_name: &str) -> Option<String> {
    let extension = file_name.rsplit('.').next()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        _ => return None,
    };
    Some(mime.to_owned())
}

impl Agent {
    /// Sends one event to the transport. A cancelled token or a dropped
    /// receiver both read as the stream being closed, which strategies
    /// observe at their next yield point.
    pub async fn emit(&mut self, event: AnswerEvent) -> Result<(), AgentError> {
        if self.cancellation.is_cancelled() {
            return Err(AgentError::StreamClosed);
        }
        self.sender
            .send(event)
            .await
            .map_err(|_| AgentError::StreamClosed)
    }

    async fn emit_start_once(&mut self) -> Result<(), AgentError> {
        if !self.started {
            self.started = true;
            self.emit(AnswerEvent::Start).await?;
        }
        Ok(())
    }

    /// Where this iteration's context numbering begins. Reasoning streams
    /// keep a running count so citation indices stay globally unique.
    pub fn context_start_index(&self) -> usize {
        if self.model.reasoning {
            self.previous_results.len()
        } else {
            0
        }
    }

    /// Non-streaming helper for the router, rewriter, resolver and title
    /// calls.
    pub async fn llm_completion(
        &self,
        request: LLMClientCompletionRequest,
    ) -> Result<String, AgentError> {
        let api_key = self.application.llm_api_key(request.model())?;
        self.application
            .llm_broker
            .completion(api_key, request)
            .await
            .map_err(Into::into)
    }

    /// Builds the chat-completion request for an answer attempt: system
    /// prompt with context, the topic-pruned history, then the user turn.
    pub fn answer_request(&self, system_prompt: String) -> LLMClientCompletionRequest {
        let mut messages = vec![LLMClientMessage::system(system_prompt)];
        for index in topic_thread(&self.previous_messages) {
            let message = &self.previous_messages[index];
            if message.content.is_empty() {
                continue;
            }
            if message.is_user() {
                messages.push(LLMClientMessage::user(message.content.to_owned()));
            } else {
                messages.push(LLMClientMessage::assistant(message.content.to_owned()));
            }
        }
        messages.push(LLMClientMessage::user(self.user_message.content.to_owned()));
        LLMClientCompletionRequest::from_messages(messages, self.model.llm_type.to_owned())
            .set_temperature(ANSWER_TEMPERATURE)
            .set_thinking(self.model.reasoning)
            .fix_message_structure()
    }

    pub fn hit_to_citation(&self, hit: &SearchHit) -> Citation {
        let mut citation = Citation {
            doc_id: hit.doc_id().to_owned(),
            title: hit.title().to_owned(),
            url: hit.url().map(str::to_owned),
            app: hit.app(),
            entity: hit.entity(),
        };
        // Gmail doc ids are tenant scoped; clients need the requesting
        // user's mailbox-scoped id, including inside the deep link.
        if let HitFields::Mail(fields) = &hit.fields {
            if let Some(user_doc_id) = fields.user_map.get(&self.ctx.user_email) {
                if let Some(url) = citation.url.as_mut() {
                    *url = url.replace(citation.doc_id.as_str(), user_doc_id);
                }
                citation.doc_id = user_doc_id.to_owned();
            }
        }
        citation
    }

    async fn handle_parsed_event(
        &mut self,
        event: ParsedEvent,
        results: &[SearchHit],
        base_index: usize,
    ) -> Result<(), AgentError> {
        match event {
            ParsedEvent::Text(text) => {
                self.emit_start_once().await?;
                self.answer_text.push_str(&text);
                self.emit(AnswerEvent::ResponseUpdate { text }).await?;
            }
            ParsedEvent::Reasoning(text) => {
                self.emit_start_once().await?;
                self.thinking.push_str(&text);
                if self.model.deep_research {
                    self.emit(AnswerEvent::DeepResearchReasoning {
                        step: serde_json::json!({ "text": text }),
                    })
                    .await?;
                } else {
                    self.emit(AnswerEvent::Reasoning { text }).await?;
                }
            }
            ParsedEvent::TextCitation(marker) | ParsedEvent::KbCitation {
                doc_index: marker, ..
            } => {
                let Some(local) = marker
                    .checked_sub(base_index + 1)
                    .filter(|_| marker > base_index)
                else {
                    return Ok(());
                };
                let Some(hit) = results.get(local) else {
                    return Ok(());
                };
                if hit.is_hidden_from_citations() {
                    return Ok(());
                }
                let citation = self.hit_to_citation(hit);
                self.sources.push(citation);
                self.citation_map.insert(marker, self.sources.len() - 1);
                let update = AnswerEvent::CitationsUpdate {
                    context_chunks: self.sources.clone(),
                    citation_map: self.citation_map.clone(),
                };
                self.emit(update).await?;
            }
            ParsedEvent::ImageCitation {
                doc_index,
                image_index,
            } => {
                let Some(local) = doc_index
                    .checked_sub(base_index + 1)
                    .filter(|_| doc_index > base_index)
                else {
                    return Ok(());
                };
                let Some(hit) = results.get(local) else {
                    return Ok(());
                };
                let Some(image_path) = hit.image_file_names().get(image_index).cloned() else {
                    return Ok(());
                };
                let bytes = match self.application.search.get_image(&image_path).await {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        tracing::warn!(?error, %image_path, "image fetch failed, skipping");
                        return Ok(());
                    }
                };
                let image_citation = ImageCitation {
                    citation_key: format!("{}_{}", doc_index, image_index),
                    image_path,
                    image_data: base64::engine::general_purpose::STANDARD.encode(bytes),
                    mime_type: mime_from_extension(hit.image_file_names()[image_index].as_str()),
                    item: self.hit_to_citation(hit),
                };
                self.image_citations.push(image_citation.clone());
                self.emit(AnswerEvent::ImageCitationUpdate(image_citation))
                    .await?;
            }
        }
        Ok(())
    }

    /// Streams one answer attempt. Returns the extracted prose, or `None`
    /// when the model declined with `{"answer": null}` — the signal the
    /// iterating strategies use to keep going.
    pub async fn stream_llm_answer(
        &mut self,
        request: LLMClientCompletionRequest,
        results: &[SearchHit],
    ) -> Result<Option<String>, AgentError> {
        let base_index = self.context_start_index();
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let broker = self.application.llm_broker.clone();
        let api_key = self.application.llm_api_key(request.model())?;
        let llm_task: tokio::task::JoinHandle<
            Result<LLMClientCompletionResponse, llm_client::clients::types::LLMClientError>,
        > = tokio::spawn(async move { broker.stream_completion(api_key, request, sender).await });

        let mut parser = CitationStreamParser::new(base_index, self.kb_mode);
        while let Some(chunk) = receiver.recv().await {
            let Some(delta) = chunk.delta().map(str::to_owned) else {
                continue;
            };
            if parser.is_done() {
                continue;
            }
            for event in parser.push(&delta) {
                self.handle_parsed_event(event, results, base_index).await?;
            }
        }

        match llm_task.await {
            Ok(Ok(response)) => {
                if let Some(usage) = response.usage() {
                    self.usage.merge(usage);
                    self.cost += crate::webserver::model_selection::completion_cost(
                        &self.model.llm_type,
                        usage,
                    );
                }
            }
            Ok(Err(error)) => return Err(error.into()),
            Err(join_error) => {
                tracing::error!(?join_error, "llm stream task panicked");
                return Err(AgentError::Llm(
                    llm_client::clients::types::LLMClientError::FailedToGetResponse,
                ));
            }
        }

        if self.model.reasoning {
            self.previous_results.extend(results.iter().cloned());
        }

        let answer = parser.answer().to_owned();
        Ok((!answer.is_empty()).then_some(answer))
    }

    /// Streams an answer the router produced from conversation history, no
    /// retrieval involved.
    pub async fn stream_direct_answer(&mut self, answer: &str) -> Result<(), AgentError> {
        self.emit_start_once().await?;
        self.answer_text.push_str(answer);
        self.emit(AnswerEvent::ResponseUpdate {
            text: answer.to_owned(),
        })
        .await
    }

    /// Streams an answer from a fixed set of documents: context pills,
    /// attachments and knowledge-base selections all land here.
    pub async fn scoped_context_answer(
        &mut self,
        file_ids: Vec<String>,
    ) -> Result<AnswerOutcome, AgentError> {
        let query = self.user_message.content.to_owned();
        let attachment_only = !self.attachments.is_empty()
            && file_ids
                .iter()
                .all(|id| self.attachments.iter().any(|a| &a.file_id == id));

        let mut hits = if self.kb_mode {
            let folder_ids = self.kb_folder_ids.to_vec();
            self.application
                .search
                .search_kb_collection(&query, &self.ctx.user_email, &file_ids, &folder_ids, 40)
                .await?
        } else if file_ids.is_empty() {
            Vec::new()
        } else {
            let options = SearchOptions::new(40)
                .set_alpha(self.alpha)
                .set_rank_profile(if attachment_only {
                    RankProfile::AttachmentRank
                } else {
                    RankProfile::NativeRank
                });
            self.application
                .search
                .search_in_files(&query, &self.ctx.user_email, &file_ids, &options)
                .await?
        };

        if !self.user_message.thread_ids.is_empty() {
            let thread_hits = self
                .application
                .search
                .search_email_threads(&self.user_message.thread_ids, &self.ctx.user_email)
                .await?;
            hits = crate::search::types::merge_thread_expansion(hits, thread_hits);
        }

        {
            let span = self.trace.start_child("scoped_context");
            span.set_attr("file_count", file_ids.len() as i64);
            span.set_attr("hit_count", hits.len() as i64);
            span.end();
        }

        if hits.is_empty() {
            return Ok(AnswerOutcome::NoDocs);
        }

        let start_index = self.context_start_index();
        let options = ContextOptions {
            start_index,
            kb_mode: self.kb_mode,
            ..Default::default()
        };
        let context = build_context(&self.application.search, &hits, &options).await?;
        let image_names = find_image_file_names(&context, &hits, start_index);
        let request = self.answer_request(prompts::answer_system_prompt(
            &context,
            &self.ctx,
            &image_names,
            self.kb_mode,
        ));
        match self.stream_llm_answer(request, &hits).await? {
            Some(answer) => Ok(AnswerOutcome::Answered(answer)),
            None => Ok(AnswerOutcome::NoDocs),
        }
    }

    /// The full request flow: metadata events, scoped-context dispatch,
    /// routing and strategy selection.
    pub async fn answer_flow(&mut self) -> Result<AnswerOutcome, AgentError> {
        self.emit(AnswerEvent::ResponseMetadata {
            chat_id: self.chat.external_id.to_owned(),
            message_id: None,
        })
        .await?;
        self.emit(AnswerEvent::ChatTitleUpdate {
            title: self.chat.title.to_owned(),
        })
        .await?;
        if !self.attachments.is_empty() {
            self.emit(AnswerEvent::AttachmentUpdate {
                message_id: self.user_message.external_id.to_owned(),
                attachments: self.attachments.to_vec(),
            })
            .await?;
            // A missing blob is non-fatal: the client is told and the
            // answer proceeds over whatever context is still reachable.
            let attachment_dir = self.application.config.attachment_dir();
            for attachment in self.attachments.to_vec() {
                let blob_path = attachment_dir.join(&attachment.file_id);
                if tokio::fs::metadata(&blob_path).await.is_err() {
                    tracing::warn!(file_id = %attachment.file_id, "attachment blob missing");
                    self.emit(AnswerEvent::Error {
                        error: super::types::ATTACHMENT_STORAGE_FAILED.to_owned(),
                    })
                    .await?;
                }
            }
        }

        self.alpha =
            db::get_personalization_alpha(&self.application.sql, &self.ctx.user_email).await?;

        // Anything that pins the context to concrete documents bypasses the
        // router: selected files, knowledge-base items, attachments. A mix
        // of image and text attachments routes here as well.
        let mut scoped_file_ids = self.user_message.file_ids.to_vec();
        scoped_file_ids.extend(self.kb_file_ids.iter().cloned());
        scoped_file_ids.extend(
            self.attachments
                .iter()
                .map(|attachment| attachment.file_id.to_owned()),
        );
        let has_image_attachments = self.attachments.iter().any(|attachment| attachment.is_image);
        if !scoped_file_ids.is_empty() || !self.kb_folder_ids.is_empty() || has_image_attachments {
            return self.scoped_context_answer(scoped_file_ids).await;
        }

        let classification = self.route().await?;
        if let Some(answer) = classification.direct_answer().map(str::to_owned) {
            self.stream_direct_answer(&answer).await?;
            return Ok(AnswerOutcome::Answered(answer));
        }

        // Follow-ups inherit the previous turn's file and attachment scope
        // when the current turn does not carry its own.
        if classification.is_follow_up {
            let previous_turn = self
                .last_user_turn()
                .map(|message| (message.id, message.file_ids.to_vec()));
            if let Some((previous_id, mut inherited)) = previous_turn {
                let previous_attachments =
                    db::get_message_attachments(&self.application.sql, previous_id).await?;
                inherited.extend(
                    previous_attachments
                        .iter()
                        .map(|attachment| attachment.file_id.to_owned()),
                );
                if !inherited.is_empty() {
                    return self.scoped_context_answer(inherited).await;
                }
            }
        }

        let outcome = match classification.query_type {
            QueryType::GetItems if !classification.filters.apps.is_empty()
                || !classification.filters.entities.is_empty() =>
            {
                self.metadata_get_items(&classification).await?
            }
            QueryType::SearchWithFilters
                if classification.filter_query.is_some()
                    && (!classification.filters.apps.is_empty()
                        || !classification.filters.entities.is_empty()) =>
            {
                self.metadata_filtered_search(&classification).await?
            }
            _ if classification.temporal_direction.is_some()
                && classification.targets_calendar() =>
            {
                self.temporal_expansion(&classification).await?
            }
            _ => self.iterative_rag(&classification).await?,
        };

        match outcome {
            AnswerOutcome::Fallback => self.iterative_rag(&classification).await,
            other => Ok(other),
        }
    }

    /// Persists the assistant turn, honoring retry semantics, and stores the
    /// trace keyed by the user turn so a retry replaces it.
    pub async fn persist_assistant(&mut self) -> Result<Message, AgentError> {
        let mut content = process_message(&self.answer_text, &self.citation_map);
        if self.model.websearch {
            content = group_line_citations(&content);
        }
        let assistant = NewAssistantMessage {
            content,
            thinking: (!self.thinking.is_empty()).then(|| self.thinking.to_owned()),
            sources: self.sources.to_vec(),
            image_citations: self.image_citations.to_vec(),
            model_id: Some(self.model.label.to_owned()),
            cost: self.cost,
            input_tokens: self.usage.input_tokens as i64,
            output_tokens: self.usage.output_tokens as i64,
        };

        let message = match &self.retry_target {
            RetryTarget::AssistantTurn {
                message_external_id,
            } => {
                db::update_assistant_message(&self.application.sql, message_external_id, &assistant)
                    .await?;
                db::get_message_by_external_id(&self.application.sql, message_external_id)
                    .await?
                    .map(|(_, message)| message)
                    .ok_or_else(|| {
                        crate::chat::db::ChatDbError::MessageNotFound(
                            message_external_id.to_owned(),
                        )
                    })?
            }
            RetryTarget::UserTurn => {
                let message = db::insert_assistant_message(
                    &self.application.sql,
                    &self.chat,
                    &assistant,
                    self.user_message.created_at + 1,
                )
                .await?;
                db::set_message_error(&self.application.sql, &self.user_message.external_id, None)
                    .await?;
                message
            }
            RetryTarget::None => {
                let created_at = db::now_ms().max(self.user_message.created_at + 1);
                db::insert_assistant_message(&self.application.sql, &self.chat, &assistant, created_at)
                    .await?
            }
        };

        self.trace.set_attr("answer_length", self.answer_text.len() as i64);
        self.trace.set_attr("source_count", self.sources.len() as i64);
        self.trace.set_attr("cost", self.cost);
        self.trace.end();
        db::upsert_trace(
            &self.application.sql,
            &self.chat.external_id,
            &self.user_message.external_id,
            &self.trace.to_json(),
        )
        .await?;
        Ok(message)
    }

    async fn persist_trace_only(&mut self) {
        self.trace.end();
        let _ = db::upsert_trace(
            &self.application.sql,
            &self.chat.external_id,
            &self.user_message.external_id,
            &self.trace.to_json(),
        )
        .await;
    }

    async fn record_user_error(&mut self, error_message: &str) {
        let _ = db::set_message_error(
            &self.application.sql,
            &self.user_message.external_id,
            Some(error_message),
        )
        .await;
    }

    /// Drives the whole request to completion. Every exit path persists what
    /// it can and removes the registry entry.
    pub async fn run(mut self) {
        let chat_external_id = self.chat.external_id.to_owned();
        let is_first_turn = self.previous_messages.is_empty()
            && self.retry_target == RetryTarget::None;
        let result = self.answer_flow().await;

        match result {
            Ok(AnswerOutcome::Answered(_)) => match self.persist_assistant().await {
                Ok(message) => {
                    let _ = self
                        .emit(AnswerEvent::ResponseMetadata {
                            chat_id: chat_external_id.to_owned(),
                            message_id: Some(message.external_id.to_owned()),
                        })
                        .await;
                    let _ = self.emit(AnswerEvent::End).await;
                    if is_first_turn {
                        spawn_title_generation(
                            self.application.clone(),
                            self.chat.external_id.to_owned(),
                            self.user_message.content.to_owned(),
                            self.answer_text.to_owned(),
                            self.model.llm_type.to_owned(),
                        );
                    }
                }
                Err(error) => {
                    tracing::error!(?error, "failed to persist assistant message");
                    let _ = self
                        .emit(AnswerEvent::Error {
                            error: error.user_facing_message(),
                        })
                        .await;
                    let _ = self.emit(AnswerEvent::End).await;
                }
            },
            Ok(AnswerOutcome::NoDocs) | Ok(AnswerOutcome::Fallback) => {
                self.trace.set_attr("no_answer", true);
                self.record_user_error(NO_ANSWER_ERROR).await;
                self.persist_trace_only().await;
                let _ = self
                    .emit(AnswerEvent::Error {
                        error: NO_ANSWER_ERROR.to_owned(),
                    })
                    .await;
                let _ = self.emit(AnswerEvent::End).await;
            }
            Ok(AnswerOutcome::StreamClosed) | Err(AgentError::StreamClosed) => {
                // Persist whatever was generated, the ordering invariant is
                // the same as the success path. After a stop the client is
                // usually still connected, so End goes through the raw
                // sender, bypassing the cancelled token.
                self.trace.set_attr("stream_closed", true);
                if let Err(error) = self.persist_assistant().await {
                    tracing::error!(?error, "failed to persist partial answer");
                }
                let _ = self.sender.send(AnswerEvent::End).await;
            }
            Err(error) => {
                let phrase = error.user_facing_message();
                tracing::error!(?error, "answer generation failed");
                self.trace.set_attr("error", format!("{:?}", error));
                self.record_user_error(&phrase).await;
                self.persist_trace_only().await;
                let _ = self.emit(AnswerEvent::Error { error: phrase }).await;
                let _ = self.emit(AnswerEvent::End).await;
            }
        }

        self.application.stream_registry.remove(&chat_external_id);
    }
}

/// Upgrades the chat title from "Untitled" after the first exchange. Runs
/// detached: the stream is already closed when this completes.
fn spawn_title_generation(
    application: crate::application::application::Application,
    chat_external_id: String,
    question: String,
    answer: String,
    llm_type: llm_client::clients::types::LLMType,
) {
    tokio::spawn(async move {
        let request = LLMClientCompletionRequest::from_messages(
            vec![LLMClientMessage::system(prompts::title_prompt(
                &question, &answer,
            ))],
            llm_type,
        );
        let api_key = match application.llm_api_key(request.model()) {
            Ok(api_key) => api_key,
            Err(_) => return,
        };
        match application.llm_broker.completion(api_key, request).await {
            Ok(title) => {
                let title = title.trim().trim_matches('"').to_owned();
                if !title.is_empty() {
                    let _ = db::rename_chat(&application.sql, &chat_external_id, &title).await;
                }
            }
            Err(error) => tracing::warn!(?error, "title generation failed"),
        }
    });
}

/// Parsed reply of the query rewriter.
#[derive(Debug, serde::Deserialize)]
pub struct RewrittenQueries {
    #[serde(default)]
    pub queries: Vec<String>,
}

pub fn parse_rewritten_queries(raw: &str) -> Vec<String> {
    parse_json_response::<RewrittenQueries>(raw)
        .map(|parsed| parsed.queries)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension("chart.png").as_deref(), Some("image/png"));
        assert_eq!(
            mime_from_extension("photo.JPEG").as_deref(),
            Some("image/jpeg")
        );
        assert_eq!(mime_from_extension("notes.txt"), None);
        assert_eq!(mime_from_extension("noextension"), None);
    }

    #[test]
    fn test_parse_rewritten_queries() {
        let queries = parse_rewritten_queries("{\"queries\": [\"a\", \"b\"]}");
        assert_eq!(queries, vec!["a".to_owned(), "b".to_owned()]);
        assert!(parse_rewritten_queries("not json").is_empty());
    }
}
