//! Per-user chat history on disk.
//!
//! Each user owns one JSON document named after their id:
//!
//! ```json
//! { "version": 1, "messages": [ ... ] }
//! ```
//!
//! A bare JSON array of messages is still read as the unversioned layout.

use crate::{error::StorageError, message::Message};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

pub const HISTORY_VERSION: u32 = 1;

/// Identity whose history is being read or written.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserKey {
    User(String),
    Guest,
}

impl UserKey {
    /// Blank or missing ids belong to the guest. Any other id, including
    /// the literal `guest`, is a signed-in user.
    pub fn from_user_id(user_id: Option<&str>) -> Self {
        match user_id.map(str::trim) {
            Some(id) if !id.is_empty() => Self::User(id.to_string()),
            _ => Self::Guest,
        }
    }

    /// Distinct keys always map to distinct file names.
    pub fn file_name(&self) -> String {
        match self {
            Self::User(id) => format!("chat_history_{}.json", encode_id(id)),
            Self::Guest => "chat_history.json".to_string(),
        }
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "{id}"),
            Self::Guest => write!(f, "guest"),
        }
    }
}

/// Keeps ASCII letters, digits and `-`; every other byte, `_` included,
/// becomes `_xx` in lowercase hex. The result is reversible and cannot
/// contain a path separator.
fn encode_id(id: &str) -> String {
    let mut encoded = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("_{byte:02x}"));
        }
    }
    encoded
}

#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// `Ok(None)` when nothing was ever saved for `key`.
    async fn load(&self, key: &UserKey) -> Result<Option<Vec<Message>>, StorageError>;
    async fn save(&self, key: &UserKey, messages: &[Message]) -> Result<(), StorageError>;
    /// Removing a history that does not exist succeeds.
    async fn clear(&self, key: &UserKey) -> Result<(), StorageError>;
}

#[derive(Serialize)]
struct HistoryDocument<'a> {
    version: u32,
    messages: &'a [Message],
}

fn decode_document(bytes: &[u8]) -> Result<Vec<Message>, StorageError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    match value {
        serde_json::Value::Array(_) => Ok(serde_json::from_value(value)?),
        serde_json::Value::Object(mut document) => {
            let found = document
                .get("version")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u32;
            if found > HISTORY_VERSION {
                return Err(StorageError::UnsupportedVersion {
                    found,
                    supported: HISTORY_VERSION,
                });
            }
            let messages = document.remove("messages").unwrap_or_default();
            if messages.is_null() {
                return Ok(Vec::new());
            }
            Ok(serde_json::from_value(messages)?)
        }
        _ => Err(StorageError::Serialization(serde::de::Error::custom(
            "history document must be an object or an array",
        ))),
    }
}

/// Stores every history as a JSON file inside one directory.
#[derive(Debug, Clone)]
pub struct JsonFileHistoryRepository {
    dir: PathBuf,
}

impl JsonFileHistoryRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &UserKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

#[async_trait]
impl HistoryRepository for JsonFileHistoryRepository {
    async fn load(&self, key: &UserKey) -> Result<Option<Vec<Message>>, StorageError> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let messages = decode_document(&bytes)?;
        debug!(path = %path.display(), count = messages.len(), "Loaded chat history");
        Ok(Some(messages))
    }

    async fn save(&self, key: &UserKey, messages: &[Message]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&HistoryDocument {
            version: HISTORY_VERSION,
            messages,
        })?;

        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), count = messages.len(), "Saved chat history");
        Ok(())
    }

    async fn clear(&self, key: &UserKey) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageStatus;
    use tempfile::TempDir;

    fn sample_history() -> Vec<Message> {
        let mut failed = Message::ai_text("抱歉");
        failed.status = MessageStatus::Failed;
        vec![
            Message::ai_text("こんにちは！"),
            Message::user_text("元気です"),
            Message::user_audio("你好", PathBuf::from("/tmp/voice_msg_1.m4a"), 2.5),
            failed,
        ]
    }

    fn as_json(messages: &[Message]) -> serde_json::Value {
        serde_json::to_value(messages).unwrap()
    }

    #[test]
    fn test_file_names() {
        assert_eq!(UserKey::Guest.file_name(), "chat_history.json");
        assert_eq!(
            UserKey::User("abc-123".into()).file_name(),
            "chat_history_abc-123.json"
        );
        assert_eq!(
            UserKey::User("../../etc/passwd".into()).file_name(),
            "chat_history__2e_2e_2f_2e_2e_2fetc_2fpasswd.json"
        );
        assert_eq!(
            UserKey::User("guest".into()).file_name(),
            "chat_history_guest.json"
        );
    }

    #[test]
    fn test_file_names_never_collide() {
        let ids = ["a.b@x.com", "a_b_x_com", "a_2eb", "a.b", "a_b", "ユーザー", "", "guest"];
        let mut names: Vec<String> = ids
            .iter()
            .map(|id| UserKey::User((*id).into()).file_name())
            .chain(std::iter::once(UserKey::Guest.file_name()))
            .collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[tokio::test]
    async fn test_similar_ids_do_not_share_history() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        repo.save(&UserKey::User("a.b@x.com".into()), &[Message::user_text("secret of a.b")])
            .await
            .unwrap();

        assert!(repo.load(&UserKey::User("a_b_x_com".into())).await.unwrap().is_none());
        assert!(repo.load(&UserKey::User("guest".into())).await.unwrap().is_none());
        assert!(repo.load(&UserKey::Guest).await.unwrap().is_none());
    }

    #[test]
    fn test_from_user_id() {
        assert_eq!(UserKey::from_user_id(None), UserKey::Guest);
        assert_eq!(UserKey::from_user_id(Some("  ")), UserKey::Guest);
        assert_eq!(UserKey::from_user_id(Some("guest")), UserKey::User("guest".into()));
        assert_eq!(UserKey::from_user_id(Some("u1")), UserKey::User("u1".into()));
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        let key = UserKey::User("u1".into());
        let history = sample_history();

        repo.save(&key, &history).await.unwrap();
        let loaded = repo.load(&key).await.unwrap().expect("history present");

        assert_eq!(as_json(&loaded), as_json(&history));
        assert!(!dir.path().join("chat_history_u1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_audio_durations_round_trip_exactly() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        let key = UserKey::User("u1".into());
        // Durations with full 17-digit mantissas, which a lossy float parser misreads.
        let mut x: u64 = 0x9e37_79b9_7f4a_7c15;
        let history: Vec<Message> = (0..2000)
            .map(|i| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                let duration = 1.0 + (x >> 11) as f64 / (1u64 << 53) as f64 * 59.0;
                Message::user_audio("", PathBuf::from(format!("/tmp/voice_msg_{i}.m4a")), duration)
            })
            .chain([Message::user_audio("", PathBuf::from("/tmp/a.m4a"), 27.796934134499466)])
            .collect();

        repo.save(&key, &history).await.unwrap();
        let loaded = repo.load(&key).await.unwrap().unwrap();

        assert_eq!(loaded.len(), history.len());
        for (saved, restored) in history.iter().zip(&loaded) {
            assert_eq!(
                saved.audio_duration.map(f64::to_bits),
                restored.audio_duration.map(f64::to_bits),
                "duration {:?} changed",
                saved.audio_duration
            );
        }
    }

    #[tokio::test]
    async fn test_document_is_versioned() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        repo.save(&UserKey::Guest, &sample_history()).await.unwrap();

        let raw = std::fs::read(dir.path().join("chat_history.json")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["messages"].as_array().unwrap().len(), 4);
        assert_eq!(value["messages"][2]["type"], "audio");
    }

    #[tokio::test]
    async fn test_missing_history_is_none() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path().join("not-created-yet"));
        assert!(repo.load(&UserKey::Guest).await.unwrap().is_none());
        repo.clear(&UserKey::Guest).await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_removes_only_that_user() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        let alice = UserKey::User("alice".into());
        let bob = UserKey::User("bob".into());
        repo.save(&alice, &sample_history()).await.unwrap();
        repo.save(&bob, &sample_history()).await.unwrap();

        repo.clear(&alice).await.unwrap();

        assert!(repo.load(&alice).await.unwrap().is_none());
        assert!(repo.load(&bob).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_legacy_array_is_accepted() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        let history = sample_history();
        std::fs::write(
            dir.path().join("chat_history.json"),
            serde_json::to_vec(&history).unwrap(),
        )
        .unwrap();

        let loaded = repo.load(&UserKey::Guest).await.unwrap().unwrap();
        assert_eq!(as_json(&loaded), as_json(&history));
    }

    #[tokio::test]
    async fn test_newer_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        std::fs::write(
            dir.path().join("chat_history.json"),
            br#"{"version": 2, "messages": [{"shape": "unknown"}]}"#,
        )
        .unwrap();

        let result = repo.load(&UserKey::Guest).await;
        assert!(matches!(
            result,
            Err(StorageError::UnsupportedVersion { found: 2, supported: 1 })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let repo = JsonFileHistoryRepository::new(dir.path());
        std::fs::write(dir.path().join("chat_history.json"), b"{not json").unwrap();

        let result = repo.load(&UserKey::Guest).await;
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
