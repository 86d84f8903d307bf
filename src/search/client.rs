//! Typed facade over the hybrid (BM25 + vector) search backend. Every
//! retrieval strategy goes through this client, so scoping rules like agent
//! restrictions and thread expansion live here and nowhere else.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{
    merge_thread_expansion, schema, App, Entity, HitFields, MailParticipants, RankProfile,
    SearchHit, TimestampRange,
};

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("search backend request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("search backend returned {0}: {1}")]
    Backend(u16, String),

    #[error("failed to decode search response: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("document {1} not found in schema {0}")]
    DocumentNotFound(String, String),
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SearchOptions {
    pub limit: usize,
    pub offset: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp_range: Option<TimestampRange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub excluded_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub not_in_mail_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mail_participants: Option<MailParticipants>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collection_selections: Vec<String>,
}

impl SearchOptions {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn set_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn set_alpha(mut self, alpha: Option<f64>) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn set_rank_profile(mut self, rank_profile: RankProfile) -> Self {
        self.rank_profile = Some(rank_profile.as_str().to_owned());
        self
    }

    pub fn set_timestamp_range(mut self, timestamp_range: Option<TimestampRange>) -> Self {
        self.timestamp_range = timestamp_range;
        self
    }

    pub fn set_excluded_ids(mut self, excluded_ids: Vec<String>) -> Self {
        self.excluded_ids = excluded_ids;
        self
    }

    pub fn set_not_in_mail_labels(mut self, labels: Vec<String>) -> Self {
        self.not_in_mail_labels = labels;
        self
    }

    pub fn set_mail_participants(mut self, participants: Option<MailParticipants>) -> Self {
        self.mail_participants = participants;
        self
    }

    pub fn set_collection_selections(mut self, selections: Vec<String>) -> Self {
        self.collection_selections = selections;
        self
    }
}

/// The scope an agent binding restricts retrieval to, read from the agents
/// table and applied as intersect filters on every search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentScope {
    #[serde(default)]
    pub apps: Vec<App>,
    #[serde(default)]
    pub data_source_ids: Vec<String>,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub kb_file_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchRequestBody<'a> {
    query: &'a str,
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    apps: Option<&'a [App]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entities: Option<&'a [Entity]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_scope: Option<&'a AgentScope>,
    #[serde(flatten)]
    options: &'a SearchOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetItemsRequestBody<'a> {
    email: &'a str,
    schemas: &'a [&'static str],
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp_range: Option<TimestampRange>,
    limit: usize,
    offset: usize,
    ascending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    mail_participants: Option<&'a MailParticipants>,
    #[serde(skip_serializing_if = "Option::is_none")]
    excluded_ids: Option<&'a [String]>,
}

#[derive(Debug, Deserialize)]
struct SearchResponseBody {
    root: SearchResponseRoot,
}

#[derive(Debug, Deserialize)]
struct SearchResponseRoot {
    #[serde(default)]
    children: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub struct SearchClient {
    client: reqwest::Client,
    base_url: String,
}

impl SearchClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_for_hits<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Backend(status.as_u16(), body));
        }
        let parsed = response.json::<SearchResponseBody>().await?;
        Ok(parsed.root.children)
    }

    /// Hybrid search over the workspace index.
    pub async fn search(
        &self,
        query: &str,
        email: &str,
        apps: Option<&[App]>,
        entities: Option<&[Entity]>,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let body = SearchRequestBody {
            query,
            email,
            apps,
            entities,
            file_ids: None,
            channel_ids: None,
            agent_scope: None,
            options,
        };
        self.post_for_hits("/search", &body).await
    }

    /// Same surface as `search` but intersected with an agent's scope.
    pub async fn search_agent(
        &self,
        query: &str,
        email: &str,
        apps: Option<&[App]>,
        entities: Option<&[Entity]>,
        agent_scope: &AgentScope,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let body = SearchRequestBody {
            query,
            email,
            apps,
            entities,
            file_ids: None,
            channel_ids: None,
            agent_scope: Some(agent_scope),
            options,
        };
        self.post_for_hits("/search", &body).await
    }

    /// Exact-fetch path for "give me N items matching these filters"
    /// queries. Results are timestamp sorted with the requested direction,
    /// there is no relevance ranking involved.
    pub async fn get_items(
        &self,
        email: &str,
        schemas: &[&'static str],
        timestamp_range: Option<TimestampRange>,
        limit: usize,
        offset: usize,
        ascending: bool,
        mail_participants: Option<&MailParticipants>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let body = GetItemsRequestBody {
            email,
            schemas,
            timestamp_range,
            limit,
            offset,
            ascending,
            mail_participants,
            excluded_ids: None,
        };
        self.post_for_hits("/items", &body).await
    }

    /// Search restricted to a fixed set of file ids (context pills,
    /// attachments, knowledge-base selections).
    pub async fn search_in_files(
        &self,
        query: &str,
        email: &str,
        file_ids: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let body = SearchRequestBody {
            query,
            email,
            apps: None,
            entities: None,
            file_ids: Some(file_ids),
            channel_ids: None,
            agent_scope: None,
            options,
        };
        self.post_for_hits("/search/files", &body).await
    }

    /// Hierarchical retrieval over knowledge-base collections: folder ids
    /// expand to every file underneath them.
    pub async fn search_kb_collection(
        &self,
        query: &str,
        email: &str,
        file_ids: &[String],
        folder_ids: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct KbRequestBody<'a> {
            query: &'a str,
            email: &'a str,
            file_ids: &'a [String],
            folder_ids: &'a [String],
            limit: usize,
        }
        self.post_for_hits(
            "/search/kb",
            &KbRequestBody {
                query,
                email,
                file_ids,
                folder_ids,
                limit,
            },
        )
        .await
    }

    /// Expands mail message ids to their full threads.
    pub async fn search_email_threads(
        &self,
        thread_ids: &[String],
        email: &str,
    ) -> Result<Vec<SearchHit>, SearchError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ThreadRequestBody<'a> {
            thread_ids: &'a [String],
            email: &'a str,
        }
        self.post_for_hits(
            "/mail/threads",
            &ThreadRequestBody { thread_ids, email },
        )
        .await
    }

    /// Scoped chat search, paired with `search_threads` to pull in every
    /// reply of the matched messages.
    pub async fn search_channel(
        &self,
        query: &str,
        email: &str,
        channel_ids: &[String],
        limit: usize,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let options = SearchOptions::new(limit);
        let body = SearchRequestBody {
            query,
            email,
            apps: Some(&[App::Chat]),
            entities: None,
            file_ids: None,
            channel_ids: Some(channel_ids),
            agent_scope: None,
            options: &options,
        };
        self.post_for_hits("/search", &body).await
    }

    pub async fn search_threads(
        &self,
        thread_ids: &[String],
    ) -> Result<Vec<SearchHit>, SearchError> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ChatThreadRequestBody<'a> {
            thread_ids: &'a [String],
        }
        self.post_for_hits("/chat/threads", &ChatThreadRequestBody { thread_ids })
            .await
    }

    pub async fn get_document(
        &self,
        doc_schema: &str,
        doc_id: &str,
    ) -> Result<SearchHit, SearchError> {
        self.get_document_or_null(doc_schema, doc_id)
            .await?
            .ok_or_else(|| {
                SearchError::DocumentNotFound(doc_schema.to_owned(), doc_id.to_owned())
            })
    }

    pub async fn get_document_or_null(
        &self,
        doc_schema: &str,
        doc_id: &str,
    ) -> Result<Option<SearchHit>, SearchError> {
        let response = self
            .client
            .get(self.endpoint(&format!("/document/{}/{}", doc_schema, doc_id)))
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Backend(status.as_u16(), body));
        }
        let hit = response.json::<SearchHit>().await?;
        Ok(Some(hit))
    }

    /// Raw image bytes for an image referenced inside a document.
    pub async fn get_image(&self, image_path: &str) -> Result<Vec<u8>, SearchError> {
        let response = self
            .client
            .get(self.endpoint("/image"))
            .query(&[("path", image_path)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Backend(status.as_u16(), body));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Display name of a chat user, used to enrich channel hits with their
    /// creator.
    pub async fn get_user_name(&self, user_id: &str) -> Result<Option<String>, SearchError> {
        let hit = self
            .get_document_or_null(schema::CHAT_USER, user_id)
            .await?;
        Ok(hit.and_then(|hit| match hit.fields {
            HitFields::ChatUser(fields) => Some(fields.name),
            _ => None,
        }))
    }

    /// Replaces every mail hit with the full set of messages in its thread.
    /// Idempotent: siblings already present are not duplicated. Callers on
    /// the `GetItems` path skip this, the user asked for exactly N items.
    pub async fn expand_email_threads(
        &self,
        hits: Vec<SearchHit>,
        email: &str,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let thread_ids = hits
            .iter()
            .filter_map(|hit| hit.thread_id())
            .map(str::to_owned)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        if thread_ids.is_empty() {
            return Ok(hits);
        }
        let expansion = self.search_email_threads(&thread_ids, email).await?;
        Ok(merge_thread_expansion(hits, expansion))
    }
}
