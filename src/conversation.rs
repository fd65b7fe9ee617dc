use std::path::Path;

use tracing::debug;

use crate::error::AgentError;
use crate::storage::Storage;
use crate::types::{ConversationMetadata, Message, MetadataPatch};

pub const METADATA_FILE: &str = "metadata.json";
pub const TRANSCRIPT_FILE: &str = "transcript.jsonl";

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

struct Loaded {
    metadata: ConversationMetadata,
    messages: Vec<Message>,
}

/// The one writer to a conversation directory. After `load` or
/// `initialize`, the in-memory transcript and metadata are canonical and
/// every mutation goes through here: appends hit disk first, wholesale
/// replacement (compaction) goes through an atomic rewrite.
pub struct ConversationStore {
    storage: Storage,
    loaded: Option<Loaded>,
}

impl ConversationStore {
    /// A store rooted at the conversation directory itself.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            storage: Storage::new(dir.as_ref()),
            loaded: None,
        }
    }

    /// Create a fresh conversation: metadata plus an empty transcript file.
    /// Refuses to touch a directory that already holds one.
    pub fn initialize(&mut self, model: Option<&str>) -> Result<(), AgentError> {
        if self.storage.base().join(METADATA_FILE).exists() {
            return Err(AgentError::AlreadyExists(self.storage.base().into()));
        }
        let now = now_ms();
        let metadata = ConversationMetadata {
            created_at: now,
            updated_at: now,
            compaction_count: 0,
            model: model.map(String::from),
        };
        self.storage.write_json(METADATA_FILE, &metadata)?;
        self.storage.write_jsonl::<Message>(TRANSCRIPT_FILE, &[])?;
        self.loaded = Some(Loaded {
            metadata,
            messages: Vec::new(),
        });
        Ok(())
    }

    /// Read both files into memory. Subsequent reads serve from memory.
    pub fn load(&mut self) -> Result<(), AgentError> {
        let metadata: ConversationMetadata = self.storage.read_json(METADATA_FILE)?;
        let messages: Vec<Message> = self.storage.read_all_jsonl(TRANSCRIPT_FILE)?;
        debug!(
            messages = messages.len(),
            compaction_count = metadata.compaction_count,
            "conversation loaded"
        );
        self.loaded = Some(Loaded { metadata, messages });
        Ok(())
    }

    fn loaded(&self) -> Result<&Loaded, AgentError> {
        self.loaded.as_ref().ok_or(AgentError::NotLoaded)
    }

    fn loaded_mut(&mut self) -> Result<&mut Loaded, AgentError> {
        self.loaded.as_mut().ok_or(AgentError::NotLoaded)
    }

    /// Append one message: disk first, then memory, then the advisory
    /// `updated_at` stamp. A crash after the append loses only the stamp;
    /// the transcript is the source of truth.
    pub fn append_message(&mut self, message: Message) -> Result<(), AgentError> {
        self.loaded()?;
        self.storage.append_jsonl(TRANSCRIPT_FILE, &message)?;

        let state = self.loaded_mut()?;
        state.messages.push(message);
        state.metadata.updated_at = now_ms();
        let metadata = state.metadata.clone();
        self.storage.write_json(METADATA_FILE, &metadata)?;
        Ok(())
    }

    /// Atomic wholesale rewrite of the transcript. Compaction's tool.
    pub fn replace_transcript(&mut self, messages: &[Message]) -> Result<(), AgentError> {
        self.loaded()?;
        self.storage.write_jsonl(TRANSCRIPT_FILE, messages)?;

        let state = self.loaded_mut()?;
        state.messages = messages.to_vec();
        state.metadata.updated_at = now_ms();
        let metadata = state.metadata.clone();
        self.storage.write_json(METADATA_FILE, &metadata)?;
        Ok(())
    }

    /// Merge `compaction_count` / `model` into the metadata. `created_at`
    /// is immutable; `updated_at` moves to now.
    pub fn update_metadata(&mut self, patch: MetadataPatch) -> Result<(), AgentError> {
        let state = self.loaded_mut()?;
        if let Some(count) = patch.compaction_count {
            state.metadata.compaction_count = count;
        }
        if let Some(model) = patch.model {
            state.metadata.model = Some(model);
        }
        state.metadata.updated_at = now_ms();
        let metadata = state.metadata.clone();
        self.storage.write_json(METADATA_FILE, &metadata)?;
        Ok(())
    }

    pub fn messages(&self) -> Result<&[Message], AgentError> {
        Ok(&self.loaded()?.messages)
    }

    pub fn metadata(&self) -> Result<&ConversationMetadata, AgentError> {
        Ok(&self.loaded()?.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentBlock, MessageContent};
    use serde_json::json;

    fn message(n: u32) -> Message {
        Message::user_text(format!("message {n}"))
    }

    #[test]
    fn initialize_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(Some("m1")).unwrap();

        assert!(store.messages().unwrap().is_empty());
        let meta = store.metadata().unwrap();
        assert_eq!(meta.compaction_count, 0);
        assert_eq!(meta.model.as_deref(), Some("m1"));
        assert_eq!(meta.created_at, meta.updated_at);
        assert!(dir.path().join(TRANSCRIPT_FILE).exists());
    }

    #[test]
    fn initialize_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(None).unwrap();

        let mut second = ConversationStore::new(dir.path());
        let err = second.initialize(None).unwrap_err();
        assert!(matches!(err, AgentError::AlreadyExists(_)));
    }

    #[test]
    fn access_before_load_is_not_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        assert!(matches!(store.messages(), Err(AgentError::NotLoaded)));
        assert!(matches!(store.metadata(), Err(AgentError::NotLoaded)));
    }

    #[test]
    fn append_persists_and_updates_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(None).unwrap();
        let created = store.metadata().unwrap().created_at;

        store.append_message(message(1)).unwrap();
        store.append_message(message(2)).unwrap();
        assert_eq!(store.messages().unwrap().len(), 2);
        assert_eq!(store.metadata().unwrap().created_at, created);

        // Fresh store on the same directory sees the same transcript.
        let mut reloaded = ConversationStore::new(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.messages().unwrap(), store.messages().unwrap());
    }

    #[test]
    fn load_tolerates_partial_tail_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(None).unwrap();
        for n in 0..3 {
            store.append_message(message(n)).unwrap();
        }

        let path = dir.path().join(TRANSCRIPT_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw.truncate(raw.len() - 1);
        std::fs::write(&path, raw).unwrap();

        let mut recovered = ConversationStore::new(dir.path());
        recovered.load().unwrap();
        assert_eq!(recovered.messages().unwrap(), &[message(0), message(1)]);
    }

    #[test]
    fn replace_transcript_rewrites_disk_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(None).unwrap();
        for n in 0..4 {
            store.append_message(message(n)).unwrap();
        }

        let replacement = vec![
            Message::user_text("[Conversation Summary]\n\nIt happened."),
            message(3),
        ];
        store.replace_transcript(&replacement).unwrap();
        assert_eq!(store.messages().unwrap(), replacement.as_slice());

        let mut reloaded = ConversationStore::new(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.messages().unwrap(), replacement.as_slice());
    }

    #[test]
    fn replace_transcript_does_not_retain_caller_vector() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(None).unwrap();

        let mut ours = vec![message(0)];
        store.replace_transcript(&ours).unwrap();
        ours[0] = message(99);
        assert_eq!(store.messages().unwrap(), &[message(0)]);
    }

    #[test]
    fn update_metadata_merges_and_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(Some("m1")).unwrap();
        let created = store.metadata().unwrap().created_at;

        store
            .update_metadata(MetadataPatch {
                compaction_count: Some(2),
                model: None,
            })
            .unwrap();
        let meta = store.metadata().unwrap();
        assert_eq!(meta.compaction_count, 2);
        assert_eq!(meta.model.as_deref(), Some("m1"));
        assert_eq!(meta.created_at, created);

        store
            .update_metadata(MetadataPatch {
                compaction_count: None,
                model: Some("m2".into()),
            })
            .unwrap();
        assert_eq!(store.metadata().unwrap().model.as_deref(), Some("m2"));
        assert_eq!(store.metadata().unwrap().compaction_count, 2);
    }

    #[test]
    fn block_messages_roundtrip_through_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConversationStore::new(dir.path());
        store.initialize(None).unwrap();

        let assistant = Message::assistant(vec![ContentBlock::ToolUse {
            id: "t1".into(),
            name: "calc".into(),
            input: json!({"expr": "6*7"}),
        }]);
        store.append_message(assistant.clone()).unwrap();

        let mut reloaded = ConversationStore::new(dir.path());
        reloaded.load().unwrap();
        let messages = reloaded.messages().unwrap();
        assert_eq!(messages, &[assistant]);
        assert!(matches!(messages[0].content, MessageContent::Blocks(_)));
    }
}
