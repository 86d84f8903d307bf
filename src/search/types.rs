use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Workspace applications a query can be scoped to. The router emits these
/// as strings, so the serde names are part of the wire contract with the
/// classification prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum App {
    Gmail,
    Drive,
    Calendar,
    Chat,
    KnowledgeBase,
    DataSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Entity {
    Mail,
    MailAttachment,
    DriveFile,
    Event,
    ChatMessage,
    ChatChannel,
    KbFile,
}

impl App {
    /// Backend schemas which hold this app's documents.
    pub fn schemas(&self) -> Vec<&'static str> {
        match self {
            App::Gmail => vec![schema::MAIL, schema::MAIL_ATTACHMENT],
            App::Drive => vec![schema::FILE],
            App::Calendar => vec![schema::EVENT],
            App::Chat => vec![schema::CHAT_MESSAGE],
            App::KnowledgeBase => vec![schema::KB_FILE],
            App::DataSource => vec![schema::DATASOURCE_FILE],
        }
    }
}

impl Entity {
    pub fn schema(&self) -> &'static str {
        match self {
            Entity::Mail => schema::MAIL,
            Entity::MailAttachment => schema::MAIL_ATTACHMENT,
            Entity::DriveFile => schema::FILE,
            Entity::Event => schema::EVENT,
            Entity::ChatMessage => schema::CHAT_MESSAGE,
            Entity::ChatChannel => schema::CHAT_CONTAINER,
            Entity::KbFile => schema::KB_FILE,
        }
    }
}

/// The `sddocname` values the backend tags hits with.
pub mod schema {
    pub const MAIL: &str = "mail";
    pub const MAIL_ATTACHMENT: &str = "mail_attachment";
    pub const FILE: &str = "file";
    pub const EVENT: &str = "event";
    pub const CHAT_MESSAGE: &str = "chat_message";
    pub const CHAT_CONTAINER: &str = "chat_container";
    pub const CHAT_USER: &str = "chat_user";
    pub const KB_FILE: &str = "kb_file";
    pub const DATASOURCE_FILE: &str = "datasource_file";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankProfile {
    NativeRank,
    GlobalSorted,
    AttachmentRank,
}

impl RankProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankProfile::NativeRank => "default_native",
            RankProfile::GlobalSorted => "global_sorted",
            RankProfile::AttachmentRank => "attachment_rank",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TimestampRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

impl TimestampRange {
    pub fn new(from: Option<i64>, to: Option<i64>) -> Self {
        Self { from, to }
    }

    pub fn is_valid(&self) -> bool {
        match (self.from, self.to) {
            (Some(from), Some(to)) => from <= to,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailParticipants {
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
}

impl MailParticipants {
    pub fn is_empty(&self) -> bool {
        self.from.is_empty() && self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty()
    }

    pub fn all_participants(&self) -> Vec<&str> {
        self.from
            .iter()
            .chain(self.to.iter())
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .map(String::as_str)
            .collect()
    }

    /// Names which still need resolution to addresses.
    pub fn unresolved_names(&self) -> Vec<&str> {
        self.all_participants()
            .into_iter()
            .filter(|participant| !participant.contains('@'))
            .collect()
    }
}

/// One search-backend result. The relevance score lives beside the schema
/// tagged fields, mirroring the backend's `root.children[]` layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub relevance: f64,
    pub fields: HitFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "sddocname", rename_all = "snake_case")]
pub enum HitFields {
    Mail(MailFields),
    MailAttachment(MailAttachmentFields),
    File(FileFields),
    Event(EventFields),
    ChatMessage(ChatMessageFields),
    ChatContainer(ChatContainerFields),
    ChatUser(ChatUserFields),
    KbFile(KbFileFields),
    DatasourceFile(DatasourceFileFields),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailFields {
    pub doc_id: String,
    pub thread_id: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub timestamp: i64,
    pub chunks: Vec<String>,
    pub labels: Vec<String>,
    /// Tenant docId -> the per-user docId for every mailbox which holds a
    /// copy of this message.
    pub user_map: HashMap<String, String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailAttachmentFields {
    pub doc_id: String,
    pub mail_id: String,
    pub filename: String,
    pub timestamp: i64,
    pub chunks: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileFields {
    pub doc_id: String,
    pub title: String,
    pub owner: String,
    pub mime_type: String,
    pub timestamp: i64,
    pub chunks: Vec<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFields {
    pub doc_id: String,
    pub name: String,
    pub description: String,
    pub attendees: Vec<String>,
    pub start_time: i64,
    pub end_time: i64,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatMessageFields {
    pub doc_id: String,
    pub text: String,
    pub channel_id: String,
    pub channel_name: String,
    pub username: String,
    pub thread_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatContainerFields {
    pub doc_id: String,
    pub name: String,
    pub description: String,
    pub creator: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatUserFields {
    pub doc_id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KbFileFields {
    pub doc_id: String,
    pub title: String,
    pub collection_id: String,
    pub timestamp: i64,
    pub chunks: Vec<String>,
    pub image_file_names: Vec<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasourceFileFields {
    pub doc_id: String,
    pub name: String,
    pub timestamp: i64,
    pub chunks: Vec<String>,
}

impl SearchHit {
    pub fn doc_id(&self) -> &str {
        match &self.fields {
            HitFields::Mail(fields) => &fields.doc_id,
            HitFields::MailAttachment(fields) => &fields.doc_id,
            HitFields::File(fields) => &fields.doc_id,
            HitFields::Event(fields) => &fields.doc_id,
            HitFields::ChatMessage(fields) => &fields.doc_id,
            HitFields::ChatContainer(fields) => &fields.doc_id,
            HitFields::ChatUser(fields) => &fields.doc_id,
            HitFields::KbFile(fields) => &fields.doc_id,
            HitFields::DatasourceFile(fields) => &fields.doc_id,
        }
    }

    pub fn schema(&self) -> &'static str {
        match &self.fields {
            HitFields::Mail(_) => schema::MAIL,
            HitFields::MailAttachment(_) => schema::MAIL_ATTACHMENT,
            HitFields::File(_) => schema::FILE,
            HitFields::Event(_) => schema::EVENT,
            HitFields::ChatMessage(_) => schema::CHAT_MESSAGE,
            HitFields::ChatContainer(_) => schema::CHAT_CONTAINER,
            HitFields::ChatUser(_) => schema::CHAT_USER,
            HitFields::KbFile(_) => schema::KB_FILE,
            HitFields::DatasourceFile(_) => schema::DATASOURCE_FILE,
        }
    }

    pub fn title(&self) -> &str {
        match &self.fields {
            HitFields::Mail(fields) => &fields.subject,
            HitFields::MailAttachment(fields) => &fields.filename,
            HitFields::File(fields) => &fields.title,
            HitFields::Event(fields) => &fields.name,
            HitFields::ChatMessage(fields) => &fields.text,
            HitFields::ChatContainer(fields) => &fields.name,
            HitFields::ChatUser(fields) => &fields.name,
            HitFields::KbFile(fields) => &fields.title,
            HitFields::DatasourceFile(fields) => &fields.name,
        }
    }

    pub fn app(&self) -> App {
        match &self.fields {
            HitFields::Mail(_) | HitFields::MailAttachment(_) => App::Gmail,
            HitFields::File(_) => App::Drive,
            HitFields::Event(_) => App::Calendar,
            HitFields::ChatMessage(_) | HitFields::ChatContainer(_) | HitFields::ChatUser(_) => {
                App::Chat
            }
            HitFields::KbFile(_) => App::KnowledgeBase,
            HitFields::DatasourceFile(_) => App::DataSource,
        }
    }

    pub fn entity(&self) -> Entity {
        match &self.fields {
            HitFields::Mail(_) => Entity::Mail,
            HitFields::MailAttachment(_) => Entity::MailAttachment,
            HitFields::File(_) => Entity::DriveFile,
            HitFields::Event(_) => Entity::Event,
            HitFields::ChatMessage(_) | HitFields::ChatUser(_) => Entity::ChatMessage,
            HitFields::ChatContainer(_) => Entity::ChatChannel,
            HitFields::KbFile(_) => Entity::KbFile,
            HitFields::DatasourceFile(_) => Entity::DriveFile,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.fields {
            HitFields::Mail(fields) => fields.url.as_deref(),
            HitFields::File(fields) => fields.url.as_deref(),
            HitFields::Event(fields) => fields.url.as_deref(),
            HitFields::KbFile(fields) => fields.url.as_deref(),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match &self.fields {
            HitFields::Mail(fields) => fields.timestamp,
            HitFields::MailAttachment(fields) => fields.timestamp,
            HitFields::File(fields) => fields.timestamp,
            HitFields::Event(fields) => fields.start_time,
            HitFields::ChatMessage(fields) => fields.timestamp,
            HitFields::ChatContainer(fields) => fields.timestamp,
            HitFields::ChatUser(_) => 0,
            HitFields::KbFile(fields) => fields.timestamp,
            HitFields::DatasourceFile(fields) => fields.timestamp,
        }
    }

    pub fn chunks(&self) -> &[String] {
        match &self.fields {
            HitFields::Mail(fields) => &fields.chunks,
            HitFields::MailAttachment(fields) => &fields.chunks,
            HitFields::File(fields) => &fields.chunks,
            HitFields::ChatMessage(_) => &[],
            HitFields::KbFile(fields) => &fields.chunks,
            HitFields::DatasourceFile(fields) => &fields.chunks,
            _ => &[],
        }
    }

    /// Image file names embedded in this document, addressable through
    /// `[doc_index_image_index]` markers.
    pub fn image_file_names(&self) -> &[String] {
        match &self.fields {
            HitFields::KbFile(fields) => &fields.image_file_names,
            _ => &[],
        }
    }

    /// Hits which never surface as user-visible citations.
    pub fn is_hidden_from_citations(&self) -> bool {
        matches!(
            self.fields,
            HitFields::DatasourceFile(_) | HitFields::MailAttachment(_)
        )
    }

    pub fn thread_id(&self) -> Option<&str> {
        match &self.fields {
            HitFields::Mail(fields) if !fields.thread_id.is_empty() => Some(&fields.thread_id),
            _ => None,
        }
    }
}

/// Merges thread-expansion results into the original hit list without
/// disturbing the ranking order. Messages already present keep their
/// position; new thread siblings are appended. Running the merge twice with
/// the same expansion is a no-op.
pub fn merge_thread_expansion(
    mut hits: Vec<SearchHit>,
    expansion: Vec<SearchHit>,
) -> Vec<SearchHit> {
    let mut seen = hits
        .iter()
        .map(|hit| hit.doc_id().to_owned())
        .collect::<std::collections::HashSet<_>>();
    for sibling in expansion {
        if seen.insert(sibling.doc_id().to_owned()) {
            hits.push(sibling);
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail_hit(doc_id: &str, thread_id: &str) -> SearchHit {
        SearchHit {
            relevance: 0.5,
            fields: HitFields::Mail(MailFields {
                doc_id: doc_id.to_owned(),
                thread_id: thread_id.to_owned(),
                subject: "subject".to_owned(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_hit_fields_deserialize_by_sddocname() {
        let raw = serde_json::json!({
            "relevance": 0.8,
            "fields": {
                "sddocname": "mail",
                "docId": "m1",
                "threadId": "t1",
                "subject": "quarterly numbers",
                "from": "alice@acme.com",
                "timestamp": 1700000000000i64,
                "chunks": ["body"],
            }
        });
        let hit: SearchHit = serde_json::from_value(raw).expect("mail hit to parse");
        assert_eq!(hit.doc_id(), "m1");
        assert_eq!(hit.schema(), schema::MAIL);
        assert_eq!(hit.app(), App::Gmail);
    }

    #[test]
    fn test_merge_thread_expansion_is_idempotent() {
        let hits = vec![mail_hit("m1", "t1"), mail_hit("m2", "t2")];
        let expansion = vec![mail_hit("m1", "t1"), mail_hit("m3", "t1")];
        let merged = merge_thread_expansion(hits, expansion.clone());
        assert_eq!(
            merged.iter().map(|h| h.doc_id()).collect::<Vec<_>>(),
            vec!["m1", "m2", "m3"]
        );
        let merged_again = merge_thread_expansion(merged.clone(), expansion);
        assert_eq!(merged.len(), merged_again.len());
    }

    #[test]
    fn test_timestamp_range_validity() {
        assert!(TimestampRange::new(Some(1), Some(2)).is_valid());
        assert!(TimestampRange::new(None, Some(2)).is_valid());
        assert!(!TimestampRange::new(Some(3), Some(2)).is_valid());
    }
}
