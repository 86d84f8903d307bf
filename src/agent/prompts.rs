//! All prompts used by the answer engine. Retrieval prompts share the same
//! JSON reply protocol: the model answers with `{"answer": "..."}` and uses
//! `null` when the context cannot answer the question, which is what lets
//! the strategies iterate.

use super::types::RequestContext;

pub fn user_context_block(ctx: &RequestContext) -> String {
    format!(
        "User: {}\nWorkspace: {}\nTimezone: {}\nCurrent time: {}",
        ctx.user_email,
        ctx.workspace_external_id,
        ctx.timezone,
        ctx.now.to_rfc3339(),
    )
}

pub fn answer_system_prompt(
    context: &str,
    ctx: &RequestContext,
    image_names: &[String],
    kb_mode: bool,
) -> String {
    let citation_rule = if kb_mode {
        "Cite knowledge-base items inline as [index_item], e.g. [2_1] for item 1 of the document at Index 2."
    } else {
        "Cite sources inline as [index] using the Index numbers shown in the context. Cite images as [index_imageIndex] when an image directly supports the answer."
    };
    let image_block = if image_names.is_empty() {
        String::new()
    } else {
        format!(
            "\nImages available in the context: {}",
            image_names.join(", ")
        )
    };
    format!(
        r#"You are an assistant answering questions over a user's workspace documents.

{user_block}

Context:
{context}
{image_block}

Reply with a JSON object: {{"answer": "..."}}.
{citation_rule}
If the context does not contain enough information to answer, reply exactly {{"answer": null}}.
Do not invent sources or indices."#,
        user_block = user_context_block(ctx),
        context = context,
        image_block = image_block,
        citation_rule = citation_rule,
    )
}

pub fn mail_answer_prompt(context: &str, ctx: &RequestContext) -> String {
    format!(
        r#"You are an assistant summarizing and answering questions about the user's email.

{user_block}

Emails, newest first:
{context}

Reply with a JSON object: {{"answer": "..."}}.
Mention senders and dates where they matter and cite each email inline as [index].
When the user asked for a list of emails, present each on its own line.
If the emails above cannot answer the question, reply exactly {{"answer": null}}."#,
        user_block = user_context_block(ctx),
        context = context,
    )
}

pub fn meeting_answer_prompt(context: &str, ctx: &RequestContext) -> String {
    format!(
        r#"You are an assistant answering questions about the user's meetings and calendar.

{user_block}

Events and related mail:
{context}

Reply with a JSON object: {{"answer": "..."}}.
State times in the user's timezone, include attendees when relevant and cite events inline as [index].
If nothing in the context matches the asked time range, reply exactly {{"answer": null}}."#,
        user_block = user_context_block(ctx),
        context = context,
    )
}

pub fn router_system_prompt(
    ctx: &RequestContext,
    chain_breaks: &str,
    previous_classification: Option<&str>,
) -> String {
    let previous_block = match previous_classification {
        Some(previous) => format!("\nClassification of the previous user turn:\n{}", previous),
        None => String::new(),
    };
    format!(
        r#"You route questions over a user's workspace (gmail, drive, calendar, chat, knowledge-base).

{user_block}

Earlier topics in this conversation (most recent first):
{chain_breaks}{previous_block}

Decide, in order:
1. If the conversation history already answers the question, set "answer" to that reply and everything else to null.
2. Whether this turn continues the previous topic ("isFollowUp"). "Show me more" style turns are follow-ups: keep the previous filters and advance "offset" by the previous count.
3. Whether the question should be rewritten into a self-contained search query ("queryRewrite").
4. The retrieval plan:
   - "GetItems" when the user asks for the last/first N items matching metadata filters; set filters.count and filters.sortDirection.
   - "SearchWithFilters" when a content query combines with app or time filters; put the content terms in "filterQuery".
   - "RetrieveInformation" for everything else.
5. "temporalDirection": "next" for upcoming things, "prev" for past things, null otherwise.
6. filters.startTime/endTime as RFC3339 timestamps when the question names a time range.
7. filters.mailParticipants when the question names senders or recipients; use the names as given, they are resolved later.

Reply with exactly one JSON object:
{{"answer": string|null, "queryRewrite": string|null, "isFollowUp": bool,
  "temporalDirection": "prev"|"next"|null,
  "type": "GetItems"|"SearchWithFilters"|"RetrieveInformation",
  "filterQuery": string|null,
  "filters": {{"apps": [], "entities": [], "startTime": null, "endTime": null,
               "sortDirection": "asc"|"desc"|null, "count": null, "offset": 0,
               "mailParticipants": {{"from": [], "to": [], "cc": [], "bcc": []}}}}}}"#,
        user_block = user_context_block(ctx),
        chain_breaks = if chain_breaks.is_empty() {
            "(none)"
        } else {
            chain_breaks
        },
        previous_block = previous_block,
    )
}

pub fn query_rewrite_prompt(query: &str, context: &str) -> String {
    format!(
        r#"The search below did not answer the user's question. Produce up to 3 alternative
search queries likely to surface the missing documents: use synonyms, drop filler
words, try more specific phrasings.

Question: {query}

What the first search returned:
{context}

Reply with a JSON object: {{"queries": ["...", "..."]}}"#,
        query = query,
        context = context,
    )
}

pub fn name_resolution_prompt(names: &[&str], candidates: &str) -> String {
    format!(
        r#"Map each of these people to their email address using the mail excerpts below.
Keep entries that already are email addresses unchanged. If a name cannot be
resolved, keep the name as given.

Names: {names}

Mail excerpts:
{candidates}

Reply with a JSON object mapping each input to an address or the original name:
{{"mapping": {{"alice": "alice@acme.com"}}}}"#,
        names = names.join(", "),
        candidates = candidates,
    )
}

pub fn title_prompt(question: &str, answer: &str) -> String {
    format!(
        r#"Write a title of at most six words for this conversation. Reply with the
title only, no quotes.

Question: {question}

Answer: {answer}"#,
        question = question,
        answer = answer,
    )
}

pub fn followup_questions_prompt(conversation: &str) -> String {
    format!(
        r#"Suggest exactly 3 short follow-up questions the user might ask next in this
conversation. Stay within the topics already discussed.

Conversation:
{conversation}

Reply with a JSON object: {{"questions": ["...", "...", "..."]}}"#,
        conversation = conversation,
    )
}

/// Human-readable summary streamed when the temporal strategy exhausts its
/// window without finding anything.
pub fn empty_temporal_range_message(from_ms: i64, to_ms: i64) -> String {
    let format = |timestamp: i64| {
        chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp)
            .map(|parsed| parsed.format("%B %e, %Y").to_string())
            .unwrap_or_else(|| timestamp.to_string())
    };
    format!(
        "I looked through your calendar and mail between {} and {} and could not find any matching meetings or events.",
        format(from_ms),
        format(to_ms),
    )
}
