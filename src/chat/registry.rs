use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Process-wide map from chat external id to the cancellation handle of its
/// active stream. The stop endpoint cancels through here; the owning request
/// task is responsible for removal on every exit path.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: DashMap<String, CancellationToken>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
        }
    }

    /// Registers a fresh stream for the chat, replacing (and cancelling) any
    /// stale entry left behind by a previous stream.
    pub fn register(&self, chat_external_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .streams
            .insert(chat_external_id.to_owned(), token.clone())
        {
            previous.cancel();
        }
        token
    }

    /// Cancels the active stream for a chat. Returns whether a stream was
    /// actually registered; stopping a missing stream is a no-op.
    pub fn stop(&self, chat_external_id: &str) -> bool {
        match self.streams.get(chat_external_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, chat_external_id: &str) {
        self.streams.remove(chat_external_id);
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_stop_remove_lifecycle() {
        let registry = StreamRegistry::new();
        let token = registry.register("chat-1");
        assert!(!token.is_cancelled());
        assert!(registry.stop("chat-1"));
        assert!(token.is_cancelled());
        registry.remove("chat-1");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stop_unknown_chat_is_noop() {
        let registry = StreamRegistry::new();
        assert!(!registry.stop("missing"));
    }

    #[test]
    fn test_reregister_cancels_previous_stream() {
        let registry = StreamRegistry::new();
        let first = registry.register("chat-1");
        let second = registry.register("chat-1");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(registry.len(), 1);
    }
}
