//! Incremental parser for the answer token protocol. The model emits an
//! optional `<think>` preamble followed by a JSON object whose `answer`
//! string value carries the user-facing prose, optionally wrapped in a
//! fenced code block. The parser extracts the answer prefix as it grows,
//! forwards reasoning verbatim and surfaces citation markers exactly once.

use std::collections::{HashMap, HashSet};

use llm_client::clients::types::{END_THINKING_TOKEN, START_THINKING_TOKEN};
use once_cell::sync::Lazy;
use regex::Regex;

static TEXT_CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("citation regex to compile"));
static SUB_CITATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)_(\d+)\]").expect("sub citation regex to compile"));

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Text(String),
    Reasoning(String),
    /// `[n]` in the prose. `n` is the global 1-based context index.
    TextCitation(usize),
    /// `[d_i]`: image `i` of the document at global context index `d`.
    ImageCitation {
        doc_index: usize,
        image_index: usize,
    },
    /// `[n_k]` with the knowledge-base mode flag set.
    KbCitation {
        doc_index: usize,
        item_index: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Pending,
    Reasoning,
    Body,
    Done,
}

#[derive(Debug, PartialEq)]
enum AnswerPrefix {
    NotYet,
    Null,
    Partial(String),
    Complete(String),
}

pub struct CitationStreamParser {
    state: ParserState,
    pending: String,
    reasoning_buffer: String,
    reasoning_emitted: usize,
    body: String,
    prose: String,
    yielded_citations: HashSet<usize>,
    yielded_images: HashSet<(usize, usize)>,
    base_index: usize,
    kb_mode: bool,
}

impl CitationStreamParser {
    /// `base_index` is the number of results already exposed in earlier
    /// iterations; marker numbers continue past it so indices never collide
    /// across iterations of a reasoning stream.
    pub fn new(base_index: usize, kb_mode: bool) -> Self {
        Self {
            state: ParserState::Pending,
            pending: String::new(),
            reasoning_buffer: String::new(),
            reasoning_emitted: 0,
            body: String::new(),
            prose: String::new(),
            yielded_citations: HashSet::new(),
            yielded_images: HashSet::new(),
            base_index,
            kb_mode,
        }
    }

    pub fn base_index(&self) -> usize {
        self.base_index
    }

    pub fn is_done(&self) -> bool {
        self.state == ParserState::Done
    }

    pub fn answer(&self) -> &str {
        &self.prose
    }

    /// Translates a global 1-based marker to an index into this iteration's
    /// result slice.
    pub fn resolve_marker(&self, marker: usize) -> Option<usize> {
        marker
            .checked_sub(self.base_index + 1)
            .filter(|_| marker > self.base_index)
    }

    pub fn push(&mut self, token: &str) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        match self.state {
            ParserState::Done => {}
            ParserState::Pending => {
                self.pending.push_str(token);
                let trimmed = self.pending.trim_start().to_owned();
                if let Some(rest) = trimmed.strip_prefix(START_THINKING_TOKEN) {
                    self.state = ParserState::Reasoning;
                    self.reasoning_buffer = rest.to_owned();
                    self.drain_reasoning(&mut events);
                } else if START_THINKING_TOKEN.starts_with(&trimmed) {
                    // still ambiguous, wait for more tokens
                } else {
                    self.state = ParserState::Body;
                    self.body = trimmed;
                    self.drain_body(&mut events);
                }
            }
            ParserState::Reasoning => {
                self.reasoning_buffer.push_str(token);
                self.drain_reasoning(&mut events);
            }
            ParserState::Body => {
                self.body.push_str(token);
                self.drain_body(&mut events);
            }
        }
        events
    }

    fn drain_reasoning(&mut self, events: &mut Vec<ParsedEvent>) {
        if let Some(end) = self.reasoning_buffer.find(END_THINKING_TOKEN) {
            if end > self.reasoning_emitted {
                events.push(ParsedEvent::Reasoning(
                    self.reasoning_buffer[self.reasoning_emitted..end].to_owned(),
                ));
                self.reasoning_emitted = end;
            }
            let rest = self.reasoning_buffer[end + END_THINKING_TOKEN.len()..]
                .trim_start()
                .to_owned();
            self.state = ParserState::Body;
            self.body = rest;
            self.drain_body(events);
            return;
        }
        // hold back any tail that could be the start of the end marker
        let safe_len = self.reasoning_buffer.len()
            - longest_suffix_prefix(&self.reasoning_buffer, END_THINKING_TOKEN);
        if safe_len > self.reasoning_emitted {
            events.push(ParsedEvent::Reasoning(
                self.reasoning_buffer[self.reasoning_emitted..safe_len].to_owned(),
            ));
            self.reasoning_emitted = safe_len;
        }
    }

    fn drain_body(&mut self, events: &mut Vec<ParsedEvent>) {
        match extract_answer_prefix(&self.body) {
            AnswerPrefix::NotYet => {
                if self.body.trim() == "}" {
                    self.state = ParserState::Done;
                }
            }
            AnswerPrefix::Null => {
                self.state = ParserState::Done;
            }
            AnswerPrefix::Partial(answer) => self.emit_new_prose(answer, events),
            AnswerPrefix::Complete(answer) => {
                self.emit_new_prose(answer, events);
                self.state = ParserState::Done;
            }
        }
    }

    fn emit_new_prose(&mut self, answer: String, events: &mut Vec<ParsedEvent>) {
        if answer.len() > self.prose.len() {
            let delta = answer[self.prose.len()..].to_owned();
            self.prose = answer;
            events.push(ParsedEvent::Text(delta));
            self.scan_citations(events);
        }
    }

    /// Scans the accumulated prose for citation markers. The yielded sets
    /// guarantee each marker is surfaced exactly once as the prose grows.
    fn scan_citations(&mut self, events: &mut Vec<ParsedEvent>) {
        for capture in SUB_CITATION_RE.captures_iter(&self.prose) {
            let doc_index: usize = capture[1].parse().unwrap_or(0);
            let sub_index: usize = capture[2].parse().unwrap_or(0);
            if self.kb_mode {
                if self.yielded_citations.insert(doc_index) {
                    events.push(ParsedEvent::KbCitation {
                        doc_index,
                        item_index: sub_index,
                    });
                }
            } else if self.yielded_images.insert((doc_index, sub_index)) {
                events.push(ParsedEvent::ImageCitation {
                    doc_index,
                    image_index: sub_index,
                });
            }
        }
        for capture in TEXT_CITATION_RE.captures_iter(&self.prose) {
            let doc_index: usize = capture[1].parse().unwrap_or(0);
            if self.yielded_citations.insert(doc_index) {
                events.push(ParsedEvent::TextCitation(doc_index));
            }
        }
    }
}

/// Length of the longest suffix of `haystack` which is a proper prefix of
/// `marker`.
fn longest_suffix_prefix(haystack: &str, marker: &str) -> usize {
    let max = marker.len().min(haystack.len());
    for len in (1..=max).rev() {
        if haystack.ends_with(&marker[..len]) {
            return len;
        }
    }
    0
}

/// Tolerant extraction of the `answer` string value's prefix out of a
/// possibly unterminated JSON object, handling leading whitespace, an
/// optional fenced-code wrapper and split escape sequences.
fn extract_answer_prefix(buffer: &str) -> AnswerPrefix {
    let mut body = buffer.trim_start();
    if body.starts_with("```") {
        match body.find('\n') {
            Some(newline) => body = body[newline + 1..].trim_start(),
            None => return AnswerPrefix::NotYet,
        }
    }
    if body == "}" {
        return AnswerPrefix::Null;
    }
    if !body.starts_with('{') {
        return AnswerPrefix::NotYet;
    }
    let key_position = match body.find("\"answer\"") {
        Some(position) => position,
        None => return AnswerPrefix::NotYet,
    };
    let mut rest = body[key_position + "\"answer\"".len()..].trim_start();
    match rest.strip_prefix(':') {
        Some(after) => rest = after.trim_start(),
        None => return AnswerPrefix::NotYet,
    }
    if rest.is_empty() {
        return AnswerPrefix::NotYet;
    }
    if rest.starts_with('"') {
        return decode_string_prefix(&rest[1..]);
    }
    if rest.starts_with("null") {
        return AnswerPrefix::Null;
    }
    if "null".starts_with(rest) {
        return AnswerPrefix::NotYet;
    }
    AnswerPrefix::NotYet
}

/// Decodes a JSON string value which may be cut off anywhere, including in
/// the middle of an escape sequence. Incomplete escapes are held back.
fn decode_string_prefix(raw: &str) -> AnswerPrefix {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => return AnswerPrefix::Complete(out),
            '\\' => {
                let Some(escaped) = chars.next() else {
                    return AnswerPrefix::Partial(out);
                };
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{0008}'),
                    'f' => out.push('\u{000C}'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '/' => out.push('/'),
                    'u' => {
                        let mut code = String::new();
                        for _ in 0..4 {
                            match chars.next() {
                                Some(hex) => code.push(hex),
                                None => return AnswerPrefix::Partial(out),
                            }
                        }
                        if let Some(decoded) =
                            u32::from_str_radix(&code, 16).ok().and_then(char::from_u32)
                        {
                            out.push(decoded);
                        }
                    }
                    other => out.push(other),
                }
            }
            other => out.push(other),
        }
    }
    AnswerPrefix::Partial(out)
}

/// Rewrites internal citation markers to 1-based display positions using
/// `citation_map: internal index -> position in sources`. Markers missing
/// from the map are left untouched.
pub fn process_message(text: &str, citation_map: &HashMap<usize, usize>) -> String {
    let with_subs = SUB_CITATION_RE.replace_all(text, |capture: &regex::Captures| {
        let doc_index: usize = capture[1].parse().unwrap_or(0);
        match citation_map.get(&doc_index) {
            Some(position) => format!("[{}]", position + 1),
            None => capture[0].to_owned(),
        }
    });
    TEXT_CITATION_RE
        .replace_all(&with_subs, |capture: &regex::Captures| {
            let doc_index: usize = capture[1].parse().unwrap_or(0);
            match citation_map.get(&doc_index) {
                Some(position) => format!("[{}]", position + 1),
                None => capture[0].to_owned(),
            }
        })
        .into_owned()
}

/// Web-search rendering: per line, citation markers are deduplicated and
/// regrouped at the end of the line in ascending order, one leading space
/// per marker.
pub fn group_line_citations(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            let mut markers = TEXT_CITATION_RE
                .captures_iter(line)
                .filter_map(|capture| capture[1].parse::<usize>().ok())
                .collect::<Vec<_>>();
            if markers.is_empty() {
                return line.to_owned();
            }
            markers.sort_unstable();
            markers.dedup();
            let stripped = TEXT_CITATION_RE.replace_all(line, "");
            let mut grouped = stripped.trim_end().to_owned();
            for marker in markers {
                grouped.push_str(&format!(" [{}]", marker));
            }
            grouped
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut CitationStreamParser, tokens: &[&str]) -> Vec<ParsedEvent> {
        tokens
            .iter()
            .flat_map(|token| parser.push(token))
            .collect()
    }

    fn collect_text(events: &[ParsedEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                ParsedEvent::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_plain_answer_streams_incrementally() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(
            &mut parser,
            &["{\"answer\": \"Our refund", " policy is 30 days", ".\"}"],
        );
        assert_eq!(collect_text(&events), "Our refund policy is 30 days.");
        assert!(parser.is_done());
    }

    #[test]
    fn test_fenced_answer_is_unwrapped() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(
            &mut parser,
            &["```json\n{\"answer\": \"hello\"}", "\n```"],
        );
        assert_eq!(collect_text(&events), "hello");
    }

    #[test]
    fn test_null_answer_yields_nothing() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(&mut parser, &["{\"answer\": nu", "ll}"]);
        assert!(collect_text(&events).is_empty());
        assert!(parser.is_done());
        assert!(parser.answer().is_empty());
    }

    #[test]
    fn test_degenerate_brace_ends_stream() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(&mut parser, &["}"]);
        assert!(events.is_empty());
        assert!(parser.is_done());
    }

    #[test]
    fn test_reasoning_preamble_is_forwarded() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(
            &mut parser,
            &[
                "<think>",
                "the user wants the refund policy",
                "</think>",
                "{\"answer\": \"30 days\"}",
            ],
        );
        let reasoning = events
            .iter()
            .filter_map(|event| match event {
                ParsedEvent::Reasoning(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(reasoning, "the user wants the refund policy");
        assert_eq!(collect_text(&events), "30 days");
    }

    #[test]
    fn test_end_thinking_marker_split_across_tokens() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(
            &mut parser,
            &["<think>pondering</th", "ink>{\"answer\": \"done\"}"],
        );
        let reasoning = events
            .iter()
            .filter_map(|event| match event {
                ParsedEvent::Reasoning(text) => Some(text.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(reasoning, "pondering");
        assert_eq!(collect_text(&events), "done");
    }

    #[test]
    fn test_citations_yielded_once_in_order() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(
            &mut parser,
            &["{\"answer\": \"see [1] and", " [2], also [1] again\"}"],
        );
        let citations = events
            .iter()
            .filter_map(|event| match event {
                ParsedEvent::TextCitation(index) => Some(*index),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(citations, vec![1, 2]);
    }

    #[test]
    fn test_citation_marker_split_across_tokens() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(&mut parser, &["{\"answer\": \"see [1", "]\"}"]);
        assert!(events.contains(&ParsedEvent::TextCitation(1)));
    }

    #[test]
    fn test_image_citation_markers() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(&mut parser, &["{\"answer\": \"diagram [2_0] here\"}"]);
        assert!(events.contains(&ParsedEvent::ImageCitation {
            doc_index: 2,
            image_index: 0
        }));
    }

    #[test]
    fn test_kb_mode_reads_sub_markers_as_kb_citations() {
        let mut parser = CitationStreamParser::new(0, true);
        let events = feed(&mut parser, &["{\"answer\": \"policy [1_3]\"}"]);
        assert!(events.contains(&ParsedEvent::KbCitation {
            doc_index: 1,
            item_index: 3
        }));
    }

    #[test]
    fn test_escaped_characters_in_answer() {
        let mut parser = CitationStreamParser::new(0, false);
        let events = feed(
            &mut parser,
            &["{\"answer\": \"line one\\nline", " two \\\"quoted\\\"\"}"],
        );
        assert_eq!(collect_text(&events), "line one\nline two \"quoted\"");
    }

    #[test]
    fn test_escape_split_across_tokens_is_held_back() {
        let mut parser = CitationStreamParser::new(0, false);
        let mut text = String::new();
        for token in ["{\"answer\": \"a\\", "nb\"}"] {
            text.push_str(&collect_text(&parser.push(token)));
        }
        assert_eq!(text, "a\nb");
    }

    #[test]
    fn test_base_index_resolution() {
        let parser = CitationStreamParser::new(5, false);
        assert_eq!(parser.resolve_marker(6), Some(0));
        assert_eq!(parser.resolve_marker(8), Some(2));
        assert_eq!(parser.resolve_marker(5), None);
        assert_eq!(parser.resolve_marker(0), None);
    }

    #[test]
    fn test_process_message_rewrites_to_display_positions() {
        let map = HashMap::from([(3, 0), (7, 1)]);
        let rewritten = process_message("first [3], second [7], unknown [9]", &map);
        assert_eq!(rewritten, "first [1], second [2], unknown [9]");
    }

    #[test]
    fn test_process_message_idempotent_for_same_map() {
        let map = HashMap::from([(3, 0), (7, 1)]);
        let once = process_message("a [3] b [7]", &map);
        let twice = process_message(&once, &map);
        assert_eq!(once, twice);

        let identity_map = HashMap::from([(1, 0), (2, 1)]);
        let text = "x [1] y [2]";
        let once = process_message(text, &identity_map);
        assert_eq!(once, text);
        assert_eq!(process_message(&once, &identity_map), once);
    }

    #[test]
    fn test_group_line_citations() {
        let grouped = group_line_citations("alpha [2] beta [1] gamma [2]\nno citations here");
        assert_eq!(grouped, "alpha  beta  gamma [1] [2]\nno citations here");
    }
}
