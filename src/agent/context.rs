//! Assembles the bounded, chunk-budgeted context block handed to the answer
//! model. Every hit becomes one numbered block; the numbering is global
//! across iterations so citation markers stay unambiguous.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::search::client::{SearchClient, SearchError};
use crate::search::types::{HitFields, SearchHit};

use super::types::GLOBAL_CHUNK_BUDGET;

/// Drive and knowledge-base files carry long documents and get a higher
/// per-doc ceiling than mail threads.
const DRIVE_CHUNK_CAP: usize = 40;
const MAIL_CHUNK_CAP: usize = 10;

static IMAGE_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)_(\d+)\]").expect("image marker regex to compile"));

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub max_chunks_per_doc: usize,
    /// Number of results already shown in earlier iterations. Blocks are
    /// numbered `start_index + 1 ..` so indices are 1-based and globally
    /// unique.
    pub start_index: usize,
    pub kb_mode: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_chunks_per_doc: DRIVE_CHUNK_CAP,
            start_index: 0,
            kb_mode: false,
        }
    }
}

fn schema_chunk_cap(hit: &SearchHit, default_cap: usize) -> usize {
    match &hit.fields {
        HitFields::File(_) | HitFields::KbFile(_) | HitFields::DatasourceFile(_) => {
            default_cap.min(DRIVE_CHUNK_CAP)
        }
        HitFields::Mail(_) | HitFields::MailAttachment(_) => default_cap.min(MAIL_CHUNK_CAP),
        _ => default_cap,
    }
}

/// Splits the global chunk budget across documents proportionally to their
/// relevance scores, capped per document. Budget left over after capping is
/// reclaimed greedily by the top-ranked documents.
pub fn allocate_chunk_budget(hits: &[SearchHit], total: usize, default_cap: usize) -> Vec<usize> {
    if hits.is_empty() {
        return Vec::new();
    }
    let caps = hits
        .iter()
        .map(|hit| schema_chunk_cap(hit, default_cap).min(hit.chunks().len()))
        .collect::<Vec<_>>();
    let weight_sum: f64 = hits.iter().map(|hit| hit.relevance.max(0.0)).sum();
    let mut budgets = if weight_sum > 0.0 {
        hits.iter()
            .zip(caps.iter())
            .map(|(hit, cap)| {
                let share = (total as f64 * hit.relevance.max(0.0) / weight_sum) as usize;
                share.min(*cap)
            })
            .collect::<Vec<_>>()
    } else {
        caps.iter()
            .map(|cap| (total / hits.len()).min(*cap))
            .collect::<Vec<_>>()
    };

    let mut leftover = total.saturating_sub(budgets.iter().sum());
    if leftover > 0 {
        let mut order = (0..hits.len()).collect::<Vec<_>>();
        order.sort_by(|a, b| {
            hits[*b]
                .relevance
                .partial_cmp(&hits[*a].relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for index in order {
            if leftover == 0 {
                break;
            }
            let headroom = caps[index].saturating_sub(budgets[index]);
            let grant = headroom.min(leftover);
            budgets[index] += grant;
            leftover -= grant;
        }
    }
    budgets
}

fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms)
        .map(|parsed| parsed.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn push_chunks(block: &mut String, chunks: &[String], budget: usize) {
    for chunk in chunks.iter().take(budget) {
        block.push('\n');
        block.push_str(chunk);
    }
}

/// Renders one hit as its numbered context block.
pub fn render_hit(hit: &SearchHit, index: usize, chunk_budget: usize) -> String {
    let mut block = format!("Index {}", index);
    match &hit.fields {
        HitFields::Mail(fields) => {
            block.push_str(&format!(
                "\nApp: Gmail\nSubject: {}\nFrom: {}\nTo: {}",
                fields.subject,
                fields.from,
                fields.to.join(", "),
            ));
            if !fields.cc.is_empty() {
                block.push_str(&format!("\nCc: {}", fields.cc.join(", ")));
            }
            block.push_str(&format!("\nSent: {}", format_timestamp(fields.timestamp)));
            push_chunks(&mut block, &fields.chunks, chunk_budget);
        }
        HitFields::MailAttachment(fields) => {
            block.push_str(&format!(
                "\nApp: Gmail\nAttachment: {}\nReceived: {}",
                fields.filename,
                format_timestamp(fields.timestamp),
            ));
            push_chunks(&mut block, &fields.chunks, chunk_budget);
        }
        HitFields::File(fields) => {
            block.push_str(&format!(
                "\nApp: Drive\nTitle: {}\nOwner: {}\nModified: {}",
                fields.title,
                fields.owner,
                format_timestamp(fields.timestamp),
            ));
            push_chunks(&mut block, &fields.chunks, chunk_budget);
        }
        HitFields::Event(fields) => {
            block.push_str(&format!(
                "\nApp: Calendar\nEvent: {}\nAttendees: {}\nWhen: {} to {}",
                fields.name,
                fields.attendees.join(", "),
                format_timestamp(fields.start_time),
                format_timestamp(fields.end_time),
            ));
            if !fields.description.is_empty() {
                block.push('\n');
                block.push_str(&fields.description);
            }
        }
        HitFields::ChatMessage(fields) => {
            block.push_str(&format!(
                "\nApp: Chat\nChannel: {}\nAuthor: {}\nAt: {}\n{}",
                fields.channel_name,
                fields.username,
                format_timestamp(fields.timestamp),
                fields.text,
            ));
        }
        HitFields::ChatContainer(fields) => {
            block.push_str(&format!("\nApp: Chat\nChannel: {}", fields.name));
            if !fields.description.is_empty() {
                block.push_str(&format!("\nDescription: {}", fields.description));
            }
        }
        HitFields::ChatUser(fields) => {
            block.push_str(&format!("\nApp: Chat\nUser: {} <{}>", fields.name, fields.email));
        }
        HitFields::KbFile(fields) => {
            block.push_str(&format!("\nApp: Knowledge Base\nTitle: {}", fields.title));
            push_chunks(&mut block, &fields.chunks, chunk_budget);
        }
        HitFields::DatasourceFile(fields) => {
            block.push_str(&format!("\nSource: {}", fields.name));
            push_chunks(&mut block, &fields.chunks, chunk_budget);
        }
    }
    block
}

/// Builds the full context. Chat-channel containers are enriched with their
/// creator's display name, the only per-hit lookup this path performs.
pub async fn build_context(
    search: &SearchClient,
    hits: &[SearchHit],
    options: &ContextOptions,
) -> Result<String, SearchError> {
    let budgets = allocate_chunk_budget(hits, GLOBAL_CHUNK_BUDGET, options.max_chunks_per_doc);
    let mut blocks = Vec::with_capacity(hits.len());
    for (position, hit) in hits.iter().enumerate() {
        let mut block = render_hit(hit, options.start_index + position + 1, budgets[position]);
        if let HitFields::ChatContainer(fields) = &hit.fields {
            if let Some(creator) = search.get_user_name(&fields.creator).await? {
                block.push_str(&format!("\nCreator: {}", creator));
            }
        }
        blocks.push(block);
    }
    Ok(blocks.join("\n\n"))
}

/// Finds `[d_i]` markers inside the assembled context and resolves them to
/// the image file names of the referenced documents.
pub fn find_image_file_names(context: &str, hits: &[SearchHit], start_index: usize) -> Vec<String> {
    let mut names = Vec::new();
    for capture in IMAGE_MARKER_RE.captures_iter(context) {
        let doc_index: usize = match capture[1].parse() {
            Ok(index) => index,
            Err(_) => continue,
        };
        let image_index: usize = match capture[2].parse() {
            Ok(index) => index,
            Err(_) => continue,
        };
        let Some(local) = doc_index
            .checked_sub(start_index + 1)
            .filter(|_| doc_index > start_index)
        else {
            continue;
        };
        if let Some(name) = hits
            .get(local)
            .and_then(|hit| hit.image_file_names().get(image_index))
        {
            if !names.contains(name) {
                names.push(name.to_owned());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::types::{FileFields, KbFileFields, MailFields};

    fn drive_hit(relevance: f64, chunk_count: usize) -> SearchHit {
        SearchHit {
            relevance,
            fields: HitFields::File(FileFields {
                doc_id: "d1".to_owned(),
                title: "roadmap".to_owned(),
                chunks: (0..chunk_count).map(|i| format!("chunk {}", i)).collect(),
                ..Default::default()
            }),
        }
    }

    fn mail_hit(relevance: f64, chunk_count: usize) -> SearchHit {
        SearchHit {
            relevance,
            fields: HitFields::Mail(MailFields {
                doc_id: "m1".to_owned(),
                subject: "budget review".to_owned(),
                from: "alice@acme.com".to_owned(),
                to: vec!["bob@acme.com".to_owned()],
                timestamp: 1714557600000,
                chunks: (0..chunk_count).map(|i| format!("mail chunk {}", i)).collect(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_budget_respects_total_and_caps() {
        let hits = vec![drive_hit(0.9, 100), mail_hit(0.1, 50)];
        let budgets = allocate_chunk_budget(&hits, 120, 40);
        assert!(budgets.iter().sum::<usize>() <= 120);
        assert!(budgets[0] <= DRIVE_CHUNK_CAP);
        assert!(budgets[1] <= MAIL_CHUNK_CAP);
        // the higher ranked drive doc gets the larger share
        assert!(budgets[0] > budgets[1]);
    }

    #[test]
    fn test_budget_leftover_reclaimed_by_top_ranked() {
        // both docs are small, so the proportional split leaves leftover
        // which has nowhere to go beyond the caps
        let hits = vec![drive_hit(0.6, 3), mail_hit(0.4, 2)];
        let budgets = allocate_chunk_budget(&hits, 120, 40);
        assert_eq!(budgets, vec![3, 2]);
    }

    #[test]
    fn test_budget_zero_relevance_splits_evenly() {
        let hits = vec![drive_hit(0.0, 10), drive_hit(0.0, 10)];
        let budgets = allocate_chunk_budget(&hits, 10, 40);
        assert_eq!(budgets.iter().sum::<usize>(), 10);
    }

    #[test]
    fn test_render_mail_block() {
        let block = render_hit(&mail_hit(0.5, 2), 3, 1);
        assert!(block.starts_with("Index 3\n"));
        assert!(block.contains("Subject: budget review"));
        assert!(block.contains("From: alice@acme.com"));
        assert!(block.contains("mail chunk 0"));
        assert!(!block.contains("mail chunk 1"));
    }

    #[test]
    fn test_find_image_file_names_resolves_markers() {
        let hits = vec![SearchHit {
            relevance: 0.8,
            fields: HitFields::KbFile(KbFileFields {
                doc_id: "kb1".to_owned(),
                title: "handbook".to_owned(),
                chunks: vec!["see [1_0] for the org chart".to_owned()],
                image_file_names: vec!["org-chart.png".to_owned()],
                ..Default::default()
            }),
        }];
        let context = render_hit(&hits[0], 1, 5);
        let names = find_image_file_names(&context, &hits, 0);
        assert_eq!(names, vec!["org-chart.png".to_owned()]);
    }

    #[test]
    fn test_find_image_file_names_ignores_out_of_range() {
        let hits = vec![drive_hit(0.5, 1)];
        let names = find_image_file_names("[5_0]", &hits, 0);
        assert!(names.is_empty());
    }
}
