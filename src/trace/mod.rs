//! A small span tree for recording what a request actually did: router
//! decision, strategy iterations, search counts, context sizes, costs. The
//! whole tree serializes to JSON and is stored per (chat, message).

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TraceSpan {
    pub name: String,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TraceSpan>,
}

impl TraceSpan {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            started_at: chrono::Utc::now().timestamp_millis(),
            ended_at: None,
            attributes: serde_json::Map::new(),
            children: Vec::new(),
        }
    }

    /// Starts a child span and hands back a mutable handle to it. The child
    /// is part of the tree immediately, so it is recorded even if the
    /// request aborts before `end` is called.
    pub fn start_child(&mut self, name: &str) -> &mut TraceSpan {
        self.children.push(TraceSpan::new(name));
        self.children.last_mut().expect("child just pushed")
    }

    pub fn set_attr(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.attributes.insert(key.to_owned(), value.into());
    }

    pub fn end(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(chrono::Utc::now().timestamp_millis());
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_tree_serializes_nested_children() {
        let mut root = TraceSpan::new("answer");
        root.set_attr("chat_id", "c1");
        {
            let child = root.start_child("router");
            child.set_attr("is_follow_up", false);
            child.end();
        }
        root.end();
        let json = root.to_json();
        assert_eq!(json["name"], "answer");
        assert_eq!(json["children"][0]["name"], "router");
        assert_eq!(json["children"][0]["attributes"]["is_follow_up"], false);
        assert!(json["ended_at"].is_i64());
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut span = TraceSpan::new("s");
        span.end();
        let first = span.ended_at;
        span.end();
        assert_eq!(span.ended_at, first);
    }
}
