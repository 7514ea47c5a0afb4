//! Session persistence with a lightweight index
//!
//! Layout under the base directory:
//! - `<session id>.json` - the full `Session` aggregate
//! - `index.json` - `SessionIndex` (summaries plus the active session id)

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::conversation::{Session, SessionIndex, SessionSummary, DEFAULT_SESSION_NAME};
use std::fs;
use std::path::{Path, PathBuf};

const INDEX_FILE: &str = "index.json";

/// Where the executor hands a session after every generation.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn persist(&self, session: &Session) -> Result<()>;
}

/// JSON file store for sessions
pub struct SessionStore {
    base_path: PathBuf,
    index: Mutex<SessionIndex>,
}

impl SessionStore {
    /// Open (or create) a store rooted at `base_path`.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .with_context(|| format!("creating session dir {}", base_path.display()))?;

        let index = match read_index(&base_path.join(INDEX_FILE)) {
            Some(index) => index,
            None => {
                tracing::info!(dir = %base_path.display(), "session index missing, rebuilding");
                rebuild_index(&base_path)
            }
        };

        let store = Self {
            base_path,
            index: Mutex::new(index),
        };
        store.write_index()?;
        Ok(store)
    }

    /// Store in the platform data directory.
    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com.local", "Little Helper", "LittleHelper")
            .map(|p| p.data_dir().join("sessions"))
            .unwrap_or_else(|| PathBuf::from("./sessions"))
    }

    /// File for `id`. Ids that could name a path outside the store are refused.
    fn session_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(anyhow!("invalid session id: {:?}", id));
        }
        Ok(self.base_path.join(format!("{}.json", id)))
    }

    /// Create, persist and activate a fresh session.
    pub fn create(&self, system_prompt: Option<&str>) -> Result<Session> {
        let session = Session::new(DEFAULT_SESSION_NAME, system_prompt);
        self.save(&session)?;
        self.set_active(&session.id)?;
        tracing::info!(session = %session.id, "created session");
        Ok(session)
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.session_path(&session.id)?, &json)?;

        self.index.lock().upsert(SessionSummary::from(session));
        self.write_index()?;
        tracing::debug!(session = %session.id, nodes = session.nodes.len(), "saved session");
        Ok(())
    }

    /// Read and check a session. Turns left streaming by an earlier run are
    /// settled as errors.
    pub fn load(&self, id: &str) -> Result<Session> {
        let path = self.session_path(id)?;
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut session: Session = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing session {}", id))?;

        let problems = session.integrity_violations();
        if !problems.is_empty() {
            tracing::warn!(session = %id, ?problems, "refusing malformed session file");
            return Err(anyhow!("session {} is malformed: {}", id, problems.join("; ")));
        }

        let interrupted = session.settle_interrupted();
        if interrupted > 0 {
            tracing::warn!(session = %id, count = interrupted, "settled interrupted generations");
        }
        Ok(session)
    }

    /// Remove a session file and its index entry. Returns false if unknown.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let path = self.session_path(id)?;
        let existed = path.exists();
        if existed {
            fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
        }
        let indexed = self.index.lock().remove(id);
        self.write_index()?;
        if existed || indexed {
            tracing::info!(session = %id, "deleted session");
        }
        Ok(existed || indexed)
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<Session> {
        let mut session = self.load(id)?;
        session.name = name.trim().to_string();
        session.touch();
        self.save(&session)?;
        Ok(session)
    }

    /// Summaries, most recently updated first
    pub fn list(&self) -> Vec<SessionSummary> {
        self.index.lock().sessions.clone()
    }

    pub fn active_id(&self) -> Option<String> {
        self.index.lock().active_session_id.clone()
    }

    pub fn set_active(&self, id: &str) -> Result<()> {
        {
            let mut index = self.index.lock();
            if !index.sessions.iter().any(|s| s.id == id) {
                return Err(anyhow!("unknown session: {}", id));
            }
            index.active_session_id = Some(id.to_string());
        }
        self.write_index()
    }

    /// The active session, or the newest one, or a new one.
    pub fn load_or_create_active(&self, system_prompt: Option<&str>) -> Result<Session> {
        let candidate = self
            .active_id()
            .or_else(|| self.list().first().map(|s| s.id.clone()));
        if let Some(id) = candidate {
            match self.load(&id) {
                Ok(session) => {
                    self.set_active(&session.id)?;
                    return Ok(session);
                }
                Err(e) => tracing::warn!(session = %id, error = %e, "could not load active session"),
            }
        }
        self.create(system_prompt)
    }

    fn write_index(&self) -> Result<()> {
        let json = {
            let index = self.index.lock();
            serde_json::to_vec_pretty(&*index)?
        };
        write_atomic(&self.base_path.join(INDEX_FILE), &json)
    }
}

#[async_trait]
impl SessionPersistence for SessionStore {
    async fn persist(&self, session: &Session) -> Result<()> {
        self.save(session)
    }
}

fn read_index(path: &Path) -> Option<SessionIndex> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(index) => Some(index),
        Err(e) => {
            tracing::warn!(error = %e, "session index unreadable");
            None
        }
    }
}

/// Scan session files to recover an index.
fn rebuild_index(dir: &Path) -> SessionIndex {
    let mut index = SessionIndex::default();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(INDEX_FILE)
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            if let Ok(bytes) = fs::read(&path) {
                if let Ok(session) = serde_json::from_slice::<Session>(&bytes) {
                    index.upsert(SessionSummary::from(&session));
                }
            }
        }
    }
    index
}

/// Write through a sibling temp file so readers never see a torn file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::conversation::{Node, NodeMetadata, NodeRole, NodeStatus};

    fn add_user_turn(session: &mut Session, content: &str) {
        let node = Node {
            id: format!("n{}", session.nodes.len()),
            parent_id: Some(session.root_node_id.clone()),
            children_ids: vec![],
            last_selected_child_id: None,
            content: content.to_string(),
            role: NodeRole::User,
            status: NodeStatus::Complete,
            timestamp: chrono::Utc::now(),
            metadata: NodeMetadata::default(),
            name: None,
        };
        let root_id = session.root_node_id.clone();
        session
            .node_mut(&root_id)
            .unwrap()
            .children_ids
            .push(node.id.clone());
        session.active_leaf_id = node.id.clone();
        session.nodes.insert(node.id.clone(), node);
        session.touch();
    }

    #[test]
    fn test_save_load_roundtrip_and_index_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut session = store.create(Some("sys")).unwrap();
        add_user_turn(&mut session, "hello");
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.active_leaf_id, session.active_leaf_id);

        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].message_count, 1);
        assert_eq!(store.active_id(), Some(session.id.clone()));
    }

    #[test]
    fn test_index_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = SessionStore::open(dir.path()).unwrap();
            store.create(None).unwrap().id
        };

        let raw = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert!(raw.contains("activeSessionId"));
        assert!(raw.contains("messageCount"));

        let reopened = SessionStore::open(dir.path()).unwrap();
        assert_eq!(reopened.active_id(), Some(id.clone()));
        assert_eq!(reopened.list()[0].id, id);
    }

    #[test]
    fn test_missing_index_is_rebuilt_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = SessionStore::open(dir.path()).unwrap();
            store.create(None).unwrap().id
        };
        fs::remove_file(dir.path().join(INDEX_FILE)).unwrap();

        let store = SessionStore::open(dir.path()).unwrap();
        let list = store.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert!(store.active_id().is_none());
    }

    #[test]
    fn test_delete_clears_active_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = store.create(None).unwrap();

        assert!(store.delete(&session.id).unwrap());
        assert!(store.list().is_empty());
        assert!(store.active_id().is_none());
        assert!(store.load(&session.id).is_err());
        assert!(!store.delete(&session.id).unwrap());
    }

    #[test]
    fn test_load_rejects_malformed_tree() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let mut session = store.create(None).unwrap();
        session.active_leaf_id = "nowhere".into();
        store.save(&session).unwrap();

        let err = store.load(&session.id).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_rename_and_set_active_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = store.create(None).unwrap();

        let renamed = store.rename(&session.id, "  Trip planning ").unwrap();
        assert_eq!(renamed.name, "Trip planning");
        assert_eq!(store.list()[0].name, "Trip planning");
        assert!(store.set_active("ghost").is_err());
    }

    #[test]
    fn test_ids_cannot_escape_store_dir() {
        let outer = tempfile::tempdir().unwrap();
        let dir = outer.path().join("sessions");
        let store = SessionStore::open(&dir).unwrap();
        let outside = outer.path().join("escape.json");
        fs::write(&outside, "{}").unwrap();

        assert!(store.delete("../escape").is_err());
        assert!(store.load("../escape").is_err());
        assert!(store.delete("a/b").is_err());
        assert!(store.load("..\\escape").is_err());
        assert!(store.load("").is_err());
        assert!(outside.exists());

        let mut session = Session::new("t", None);
        session.id = "../escape".into();
        assert!(store.save(&session).is_err());
        assert_eq!(fs::read_to_string(&outside).unwrap(), "{}");
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_load_settles_interrupted_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let mut session = store.create(None).unwrap();
        add_user_turn(&mut session, "hello");
        let user_id = session.active_leaf_id.clone();
        let answer = Node {
            id: "streaming".into(),
            parent_id: Some(user_id.clone()),
            children_ids: vec![],
            last_selected_child_id: None,
            content: "partial".into(),
            role: NodeRole::Assistant,
            status: NodeStatus::Generating,
            timestamp: chrono::Utc::now(),
            metadata: NodeMetadata::default(),
            name: None,
        };
        session.node_mut(&user_id).unwrap().children_ids.push(answer.id.clone());
        session.active_leaf_id = answer.id.clone();
        session.nodes.insert(answer.id.clone(), answer);
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        let node = loaded.node("streaming").unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.content, "partial");
        assert!(node.metadata.error.is_some());
        assert_eq!(loaded.node(&user_id).unwrap().status, NodeStatus::Complete);
    }

    #[tokio::test]
    async fn test_persist_trait_writes_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let session = Session::new("Via trait", None);

        let persistence: &dyn SessionPersistence = &store;
        persistence.persist(&session).await.unwrap();
        assert_eq!(store.load(&session.id).unwrap().name, "Via trait");
    }
}
