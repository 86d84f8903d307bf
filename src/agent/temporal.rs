//! Temporal event expansion: a sliding window around now (or the router's
//! bounds) grows each round until calendar events or related mail show up.

use crate::search::client::SearchOptions;
use crate::search::types::{App, HitFields, SearchHit, TimestampRange};

use super::context::{build_context, ContextOptions};
use super::prompts;
use super::types::{
    Agent, AgentError, AnswerOutcome, RouterClassification, TemporalDirection, PROMO_MAIL_LABELS,
};

const TEMPORAL_MAX_ITERATIONS: usize = 10;
const TEMPORAL_BOUNDED_ITERATIONS: usize = 2;
const WINDOW_STEP_DAYS: i64 = 12;
const TEMPORAL_PAGE_SIZE: usize = 20;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// The search window for one iteration: grows linearly with the iteration
/// count, anchored on `now` unless the router supplied explicit bounds.
pub fn temporal_window(
    direction: TemporalDirection,
    now_ms: i64,
    bounds: Option<TimestampRange>,
    iteration: usize,
) -> TimestampRange {
    let window_ms = (2 + iteration as i64) * WINDOW_STEP_DAYS * DAY_MS;
    let anchor = match bounds {
        Some(range) => match direction {
            TemporalDirection::Next => range.from.unwrap_or(now_ms),
            TemporalDirection::Prev => range.to.unwrap_or(now_ms),
        },
        None => now_ms,
    };
    match direction {
        TemporalDirection::Next => TimestampRange::new(Some(anchor), Some(anchor + window_ms)),
        TemporalDirection::Prev => TimestampRange::new(Some(anchor - window_ms), Some(anchor)),
    }
}

/// Only mail and calendar hits carry meeting context; everything else the
/// union surfaced is dropped.
pub fn filter_meeting_hits(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    hits.into_iter()
        .filter(|hit| matches!(hit.fields, HitFields::Mail(_) | HitFields::Event(_)))
        .collect()
}

impl Agent {
    pub async fn temporal_expansion(
        &mut self,
        classification: &RouterClassification,
    ) -> Result<AnswerOutcome, AgentError> {
        let Some(direction) = classification.temporal_direction else {
            return Ok(AnswerOutcome::Fallback);
        };
        let bounds = classification.filters.timestamp_range(&mut self.trace);
        let both_bounds_given = bounds
            .map(|range| range.from.is_some() && range.to.is_some())
            .unwrap_or(false);
        let iterations = if both_bounds_given {
            TEMPORAL_BOUNDED_ITERATIONS
        } else {
            TEMPORAL_MAX_ITERATIONS
        };
        let now_ms = self.ctx.now.timestamp_millis();
        let query = classification.retrieval_query(&self.user_message.content).to_owned();

        let mut searched_window = temporal_window(direction, now_ms, bounds, 0);
        for iteration in 0..iterations {
            let window = temporal_window(direction, now_ms, bounds, iteration);
            searched_window = window;

            let calendar_options = SearchOptions::new(TEMPORAL_PAGE_SIZE)
                .set_alpha(self.alpha)
                .set_timestamp_range(Some(window));
            let mail_options = SearchOptions::new(TEMPORAL_PAGE_SIZE)
                .set_alpha(self.alpha)
                .set_timestamp_range(Some(window))
                .set_not_in_mail_labels(
                    PROMO_MAIL_LABELS.iter().map(|label| label.to_string()).collect(),
                );
            let (calendar_hits, mail_hits) = tokio::join!(
                self.search_with_optional_agent_scope(
                    &query,
                    Some(&[App::Calendar]),
                    None,
                    &calendar_options,
                ),
                self.search_with_optional_agent_scope(
                    &query,
                    Some(&[App::Gmail]),
                    None,
                    &mail_options,
                ),
            );
            let mut hits = calendar_hits?;
            hits.extend(mail_hits?);
            let hits = filter_meeting_hits(hits);

            {
                let span = self.trace.start_child("temporal_iteration");
                span.set_attr("iteration", iteration as i64);
                span.set_attr("window_from", window.from.unwrap_or_default());
                span.set_attr("window_to", window.to.unwrap_or_default());
                span.set_attr("hit_count", hits.len() as i64);
                span.end();
            }

            if hits.is_empty() {
                continue;
            }

            let start_index = self.context_start_index();
            let options = ContextOptions {
                start_index,
                kb_mode: false,
                ..Default::default()
            };
            let context = build_context(&self.application.search, &hits, &options).await?;
            let request = self.answer_request(prompts::meeting_answer_prompt(&context, &self.ctx));
            if let Some(answer) = self.stream_llm_answer(request, &hits).await? {
                return Ok(AnswerOutcome::Answered(answer));
            }
        }

        // Nothing in the whole searched range: tell the user what was
        // looked at instead of failing silently.
        let summary = prompts::empty_temporal_range_message(
            searched_window.from.unwrap_or(now_ms),
            searched_window.to.unwrap_or(now_ms),
        );
        self.stream_direct_answer(&summary).await?;
        Ok(AnswerOutcome::Answered(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::types::{EventFields, FileFields, MailFields};

    #[test]
    fn test_window_grows_linearly() {
        let now = 1_700_000_000_000;
        let first = temporal_window(TemporalDirection::Next, now, None, 0);
        let second = temporal_window(TemporalDirection::Next, now, None, 1);
        assert_eq!(first.from, Some(now));
        assert_eq!(first.to, Some(now + 2 * WINDOW_STEP_DAYS * DAY_MS));
        assert_eq!(second.to, Some(now + 3 * WINDOW_STEP_DAYS * DAY_MS));
    }

    #[test]
    fn test_prev_window_looks_backward() {
        let now = 1_700_000_000_000;
        let window = temporal_window(TemporalDirection::Prev, now, None, 0);
        assert_eq!(window.to, Some(now));
        assert_eq!(window.from, Some(now - 2 * WINDOW_STEP_DAYS * DAY_MS));
    }

    #[test]
    fn test_window_anchors_on_router_bounds() {
        let now = 1_700_000_000_000;
        let from = 1_600_000_000_000;
        let bounds = Some(TimestampRange::new(Some(from), None));
        let window = temporal_window(TemporalDirection::Next, now, bounds, 0);
        assert_eq!(window.from, Some(from));
    }

    #[test]
    fn test_filter_meeting_hits_drops_other_schemas() {
        let hits = vec![
            SearchHit {
                relevance: 0.9,
                fields: HitFields::Event(EventFields::default()),
            },
            SearchHit {
                relevance: 0.8,
                fields: HitFields::File(FileFields::default()),
            },
            SearchHit {
                relevance: 0.7,
                fields: HitFields::Mail(MailFields::default()),
            },
        ];
        let filtered = filter_meeting_hits(hits);
        assert_eq!(filtered.len(), 2);
    }
}
