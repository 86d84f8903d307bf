//! The two metadata-driven strategies: exact item fetches (`GetItems`) and
//! filtered content search (`SearchWithFilters`).

use crate::search::client::SearchOptions;
use crate::search::types::{App, RankProfile};

use super::context::{build_context, ContextOptions};
use super::prompts;
use super::types::{
    Agent, AgentError, AnswerOutcome, RouterClassification, MAX_USER_REQUEST_COUNT,
    METADATA_CHUNK_BUDGET,
};

const FILTER_SEARCH_PAGE_SIZE: usize = 20;
const FILTER_SEARCH_MAX_ITERATIONS: usize = 5;

/// Derives the backend schemas a classification targets. Entities win over
/// apps when both are present since they are more specific.
pub fn schemas_for_classification(classification: &RouterClassification) -> Vec<&'static str> {
    let mut schemas = Vec::new();
    if !classification.filters.entities.is_empty() {
        for entity in classification.filters.entities.iter() {
            let schema = entity.schema();
            if !schemas.contains(&schema) {
                schemas.push(schema);
            }
        }
        return schemas;
    }
    for app in classification.filters.apps.iter() {
        for schema in app.schemas() {
            if !schemas.contains(&schema) {
                schemas.push(schema);
            }
        }
    }
    schemas
}

/// Caps the requested page to the hard per-request limit.
pub fn effective_item_limit(count: Option<usize>, offset: usize) -> usize {
    (count.unwrap_or(FILTER_SEARCH_PAGE_SIZE) + offset).min(MAX_USER_REQUEST_COUNT)
}

impl Agent {
    /// `GetItems`: the user asked for exactly N items matching metadata
    /// filters. No relevance ranking, no thread expansion.
    pub async fn metadata_get_items(
        &mut self,
        classification: &RouterClassification,
    ) -> Result<AnswerOutcome, AgentError> {
        let mut filters = classification.filters.clone();
        if classification.targets_mail() {
            if let Some(participants) = filters.mail_participants.take() {
                filters.mail_participants =
                    Some(self.resolve_mail_participants(participants).await?);
            }
        }

        let schemas = schemas_for_classification(classification);
        let limit = effective_item_limit(filters.count, filters.offset);
        let timestamp_range = filters.timestamp_range(&mut self.trace);
        let hits = self
            .application
            .search
            .get_items(
                &self.ctx.user_email,
                &schemas,
                timestamp_range,
                limit,
                filters.offset,
                !filters.sort_descending(),
                filters.mail_participants.as_ref(),
            )
            .await?;

        {
            let span = self.trace.start_child("metadata_get_items");
            span.set_attr("schemas", format!("{:?}", schemas));
            span.set_attr("limit", limit as i64);
            span.set_attr("offset", filters.offset as i64);
            span.set_attr("hit_count", hits.len() as i64);
            span.end();
        }

        if hits.is_empty() {
            return Ok(AnswerOutcome::NoDocs);
        }

        let start_index = self.context_start_index();
        let options = ContextOptions {
            max_chunks_per_doc: METADATA_CHUNK_BUDGET,
            start_index,
            kb_mode: self.kb_mode,
        };
        let context = build_context(&self.application.search, &hits, &options).await?;
        let system_prompt = if classification.filters.apps.contains(&App::Gmail) {
            prompts::mail_answer_prompt(&context, &self.ctx)
        } else {
            prompts::answer_system_prompt(&context, &self.ctx, &[], self.kb_mode)
        };
        match self
            .stream_llm_answer(self.answer_request(system_prompt), &hits)
            .await?
        {
            Some(answer) => Ok(AnswerOutcome::Answered(answer)),
            // The filters matched documents but the model could not shape
            // them into an answer; the iterative path gets a chance.
            None => Ok(AnswerOutcome::Fallback),
        }
    }

    /// `SearchWithFilters`: content query plus metadata filters. Expands the
    /// page each round and falls back to iterative RAG when every page
    /// comes back unanswerable.
    pub async fn metadata_filtered_search(
        &mut self,
        classification: &RouterClassification,
    ) -> Result<AnswerOutcome, AgentError> {
        let Some(filter_query) = classification.filter_query.as_deref() else {
            return Ok(AnswerOutcome::Fallback);
        };
        let timestamp_range = classification.filters.timestamp_range(&mut self.trace);
        let rank_profile = if classification.filters.sort_descending() {
            RankProfile::GlobalSorted
        } else {
            RankProfile::NativeRank
        };

        for iteration in 0..FILTER_SEARCH_MAX_ITERATIONS {
            let options = SearchOptions::new(FILTER_SEARCH_PAGE_SIZE * (iteration + 1))
                .set_offset(FILTER_SEARCH_PAGE_SIZE * iteration)
                .set_alpha(self.alpha)
                .set_rank_profile(rank_profile)
                .set_timestamp_range(timestamp_range)
                .set_mail_participants(classification.filters.mail_participants.clone());
            let apps = classification.filters.apps.to_vec();
            let entities = classification.filters.entities.to_vec();
            let hits = self
                .search_with_optional_agent_scope(
                    filter_query,
                    (!apps.is_empty()).then_some(apps.as_slice()),
                    (!entities.is_empty()).then_some(entities.as_slice()),
                    &options,
                )
                .await?;
            let hits = self
                .application
                .search
                .expand_email_threads(hits, &self.ctx.user_email)
                .await?;

            {
                let span = self.trace.start_child("filtered_search_iteration");
                span.set_attr("iteration", iteration as i64);
                span.set_attr("hit_count", hits.len() as i64);
                span.end();
            }

            if hits.is_empty() {
                continue;
            }

            let start_index = self.context_start_index();
            let options = ContextOptions {
                start_index,
                kb_mode: self.kb_mode,
                ..Default::default()
            };
            let context = build_context(&self.application.search, &hits, &options).await?;
            let system_prompt =
                prompts::answer_system_prompt(&context, &self.ctx, &[], self.kb_mode);
            if let Some(answer) = self
                .stream_llm_answer(self.answer_request(system_prompt), &hits)
                .await?
            {
                return Ok(AnswerOutcome::Answered(answer));
            }
        }
        Ok(AnswerOutcome::Fallback)
    }

    /// Routes a search through the agent scope when the chat is bound to an
    /// agent, and straight through otherwise.
    pub async fn search_with_optional_agent_scope(
        &self,
        query: &str,
        apps: Option<&[App]>,
        entities: Option<&[crate::search::types::Entity]>,
        options: &SearchOptions,
    ) -> Result<Vec<crate::search::types::SearchHit>, AgentError> {
        match self.agent_config.as_ref() {
            Some(agent) => {
                let scope = crate::search::client::AgentScope {
                    apps: agent.apps.to_vec(),
                    data_source_ids: agent.data_source_ids.to_vec(),
                    channel_ids: agent.channel_ids.to_vec(),
                    kb_file_ids: agent.kb_file_ids.to_vec(),
                };
                self.application
                    .search
                    .search_agent(query, &self.ctx.user_email, apps, entities, &scope, options)
                    .await
                    .map_err(Into::into)
            }
            None => self
                .application
                .search
                .search(query, &self.ctx.user_email, apps, entities, options)
                .await
                .map_err(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::RouterFilters;
    use crate::search::types::Entity;

    #[test]
    fn test_effective_item_limit_caps_requests() {
        assert_eq!(effective_item_limit(Some(10), 0), 10);
        assert_eq!(effective_item_limit(Some(10), 3), 13);
        assert_eq!(effective_item_limit(Some(500), 0), MAX_USER_REQUEST_COUNT);
        assert_eq!(effective_item_limit(None, 0), 20);
    }

    #[test]
    fn test_schemas_prefer_entities_over_apps() {
        let classification = RouterClassification {
            filters: RouterFilters {
                apps: vec![App::Gmail, App::Drive],
                entities: vec![Entity::Mail],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(schemas_for_classification(&classification), vec!["mail"]);
    }

    #[test]
    fn test_schemas_union_apps() {
        let classification = RouterClassification {
            filters: RouterFilters {
                apps: vec![App::Gmail, App::Calendar],
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            schemas_for_classification(&classification),
            vec!["mail", "mail_attachment", "event"]
        );
    }
}
