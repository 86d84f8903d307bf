//! The default strategy: iterative time-filtered RAG with a mid-flight
//! query-rewrite round. Pages grow until the model commits to an answer.

use crate::search::client::SearchOptions;
use crate::search::types::{merge_thread_expansion, RankProfile, SearchHit, TimestampRange};

use llm_client::clients::types::{LLMClientCompletionRequest, LLMClientMessage};

use super::answer::parse_rewritten_queries;
use super::context::{build_context, find_image_file_names, ContextOptions};
use super::prompts;
use super::types::{
    Agent, AgentError, AnswerOutcome, RouterClassification, DEFAULT_LOOKBACK_DAYS,
};

const ITERATIVE_PAGE_SIZE: usize = 20;
const ITERATIVE_MAX_PAGES: usize = 4;
const LATEST_RESULTS_COUNT: usize = 10;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// The window searched when the router did not narrow one down.
pub fn default_lookback_window(now_ms: i64) -> TimestampRange {
    TimestampRange::new(Some(now_ms - DEFAULT_LOOKBACK_DAYS * DAY_MS), None)
}

impl Agent {
    pub async fn iterative_rag(
        &mut self,
        classification: &RouterClassification,
    ) -> Result<AnswerOutcome, AgentError> {
        let query = classification
            .retrieval_query(&self.user_message.content)
            .to_owned();
        let now_ms = self.ctx.now.timestamp_millis();
        let window = classification
            .filters
            .timestamp_range(&mut self.trace)
            .unwrap_or_else(|| default_lookback_window(now_ms));
        let apps = classification.filters.apps.to_vec();
        let apps_filter = (!apps.is_empty()).then_some(apps.as_slice());

        // Freshness anchor: the most recent documents matching the query,
        // excluded from the ranked page-0 fetch and unioned back in so page
        // 0 carries both relevance and recency.
        let latest_options = SearchOptions::new(LATEST_RESULTS_COUNT)
            .set_alpha(self.alpha)
            .set_rank_profile(RankProfile::GlobalSorted)
            .set_timestamp_range(Some(window));
        let latest_results = self
            .search_with_optional_agent_scope(&query, apps_filter, None, &latest_options)
            .await?;
        let latest_ids = latest_results
            .iter()
            .map(|hit| hit.doc_id().to_owned())
            .collect::<Vec<_>>();

        let mut first_page_context: Option<String> = None;

        for page in 0..ITERATIVE_MAX_PAGES {
            if page == ITERATIVE_MAX_PAGES / 2 {
                if let Some(outcome) = self
                    .rewrite_round(&query, first_page_context.as_deref(), window, &latest_results)
                    .await?
                {
                    return Ok(outcome);
                }
            }

            let mut options = SearchOptions::new(ITERATIVE_PAGE_SIZE * (page + 1))
                .set_offset(ITERATIVE_PAGE_SIZE * page)
                .set_alpha(self.alpha)
                .set_rank_profile(RankProfile::NativeRank)
                .set_timestamp_range(Some(window));
            if page == 0 {
                options = options.set_excluded_ids(latest_ids.to_vec());
            }
            let mut hits = self
                .search_with_optional_agent_scope(&query, apps_filter, None, &options)
                .await?;
            if page == 0 {
                hits = merge_thread_expansion(hits, latest_results.to_vec());
            }
            let hits = self
                .application
                .search
                .expand_email_threads(hits, &self.ctx.user_email)
                .await?;

            {
                let span = self.trace.start_child("rag_iteration");
                span.set_attr("page", page as i64);
                span.set_attr("hit_count", hits.len() as i64);
                span.set_attr(
                    "hit_ids",
                    hits.iter()
                        .map(|hit| hit.doc_id())
                        .collect::<Vec<_>>()
                        .join(","),
                );
                span.end();
            }

            if hits.is_empty() {
                continue;
            }

            let start_index = self.context_start_index();
            let context_options = ContextOptions {
                start_index,
                kb_mode: self.kb_mode,
                ..Default::default()
            };
            let context = build_context(&self.application.search, &hits, &context_options).await?;
            if page == 0 {
                first_page_context = Some(context.to_owned());
            }
            let image_names = find_image_file_names(&context, &hits, start_index);
            let request = self.answer_request(prompts::answer_system_prompt(
                &context,
                &self.ctx,
                &image_names,
                self.kb_mode,
            ));
            if let Some(answer) = self.stream_llm_answer(request, &hits).await? {
                return Ok(AnswerOutcome::Answered(answer));
            }
        }

        Ok(AnswerOutcome::NoDocs)
    }

    /// The query-rewrite round: alternative phrasings from the model, each
    /// searched and streamed until one answers.
    async fn rewrite_round(
        &mut self,
        query: &str,
        first_page_context: Option<&str>,
        window: TimestampRange,
        latest_results: &[SearchHit],
    ) -> Result<Option<AnswerOutcome>, AgentError> {
        let rewrite_request = LLMClientCompletionRequest::from_messages(
            vec![LLMClientMessage::system(prompts::query_rewrite_prompt(
                query,
                first_page_context.unwrap_or("(no results)"),
            ))],
            self.model.llm_type.to_owned(),
        );
        let raw = match self.llm_completion(rewrite_request).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(?error, "query rewriter failed, continuing pagination");
                return Ok(None);
            }
        };
        let alternatives = parse_rewritten_queries(&raw);

        {
            let span = self.trace.start_child("query_rewrite");
            span.set_attr("alternatives", alternatives.join(" | "));
            span.end();
        }

        for alternative in alternatives {
            let options = SearchOptions::new(ITERATIVE_PAGE_SIZE)
                .set_alpha(self.alpha)
                .set_rank_profile(RankProfile::NativeRank)
                .set_timestamp_range(Some(window));
            let hits = self
                .search_with_optional_agent_scope(&alternative, None, None, &options)
                .await?;
            let hits = merge_thread_expansion(hits, latest_results.to_vec());
            let hits = self
                .application
                .search
                .expand_email_threads(hits, &self.ctx.user_email)
                .await?;
            if hits.is_empty() {
                continue;
            }
            let start_index = self.context_start_index();
            let context_options = ContextOptions {
                start_index,
                kb_mode: self.kb_mode,
                ..Default::default()
            };
            let context = build_context(&self.application.search, &hits, &context_options).await?;
            let image_names = find_image_file_names(&context, &hits, start_index);
            let request = self.answer_request(prompts::answer_system_prompt(
                &context,
                &self.ctx,
                &image_names,
                self.kb_mode,
            ));
            if let Some(answer) = self.stream_llm_answer(request, &hits).await? {
                return Ok(Some(AnswerOutcome::Answered(answer)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_lookback_window() {
        let now = 1_700_000_000_000;
        let window = default_lookback_window(now);
        assert_eq!(window.from, Some(now - 120 * DAY_MS));
        assert_eq!(window.to, None);
    }
}
