//! ChatExecutor - drives one user turn from utterance to terminal node.
//!
//! Flow of `execute`:
//! 1. claim the session's generation guard (or report `Busy`)
//! 2. resolve the selected model
//! 3. attach the user node (unless retrying from an existing anchor)
//! 4. attach a `Generating` assistant placeholder and make it active
//! 5. build the outbound context from root to anchor
//! 6. fold stream chunks into the placeholder in arrival order
//! 7. settle the node as `Complete` or `Error`, release, persist
//!
//! The session lock is only ever taken between awaits.

use parking_lot::RwLock;
use providers::{ChatRequest, ChatResponse, ChatTransport};
use services::SessionPersistence;
use shared::agent_api::StreamChunk;
use shared::conversation::{Node, NodeId, NodeMetadata, NodeRole, NodeStatus, Session};
use shared::error::{TreeError, ValidationError};
use shared::events::ChatEvent;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::branch_navigator::{self, SiblingDirection};
use crate::context_manager::ContextPipeline;
use crate::generation::GenerationRegistry;
use crate::node_manager::{self, DeleteOutcome, NodeConfig};
use crate::profiles::{ProfileResolver, ResolvedModel};
use crate::SharedSession;

pub const CANCELLED_MESSAGE: &str = "Generation cancelled";
const UPSTREAM_FAILURE_MESSAGE: &str = "Upstream request failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Another generation holds this session; nothing was touched
    Busy,
    /// Model selection failed; nothing was touched
    Invalid(ValidationError),
    /// The requested anchor does not exist; nothing was touched
    Rejected(TreeError),
    Finished {
        assistant_node_id: NodeId,
        status: NodeStatus,
    },
}

impl ExecuteOutcome {
    pub fn assistant_node_id(&self) -> Option<&str> {
        match self {
            ExecuteOutcome::Finished {
                assistant_node_id, ..
            } => Some(assistant_node_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegeneratePlan {
    pub should_regenerate: bool,
    pub user_content: Option<String>,
    pub parent_node_id: Option<NodeId>,
}

/// The user turn a retry hangs its new answer under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegenerateAnchor {
    pub user_content: String,
    pub parent_node_id: NodeId,
}

impl From<RegenerateAnchor> for RegeneratePlan {
    fn from(anchor: RegenerateAnchor) -> Self {
        Self {
            should_regenerate: true,
            user_content: Some(anchor.user_content),
            parent_node_id: Some(anchor.parent_node_id),
        }
    }
}

pub struct ChatExecutor {
    transport: Arc<dyn ChatTransport>,
    resolver: Arc<dyn ProfileResolver>,
    context: Arc<dyn ContextPipeline>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    events: Option<UnboundedSender<ChatEvent>>,
    generations: GenerationRegistry,
    selected_model: RwLock<Option<String>>,
    stream: bool,
}

impl ChatExecutor {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        resolver: Arc<dyn ProfileResolver>,
        context: Arc<dyn ContextPipeline>,
    ) -> Self {
        Self {
            transport,
            resolver,
            context,
            persistence: None,
            events: None,
            generations: GenerationRegistry::new(),
            selected_model: RwLock::new(None),
            stream: true,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Mirror generation progress into `events`.
    pub fn with_events(mut self, events: UnboundedSender<ChatEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_selected_model(self, selection_key: Option<String>) -> Self {
        self.select_model(selection_key);
        self
    }

    /// Set the `<profile>/<model>` key used by the next generation.
    pub fn select_model(&self, selection_key: Option<String>) {
        *self.selected_model.write() = selection_key;
    }

    pub fn selected_model(&self) -> Option<String> {
        self.selected_model.read().clone()
    }

    pub fn is_generating(&self, session_id: &str) -> bool {
        self.generations.state(session_id).is_generating()
    }

    /// Stop the session's running stream. Partial content is kept.
    pub fn cancel(&self, session_id: &str) -> bool {
        let cancelled = self.generations.cancel(session_id);
        if cancelled {
            tracing::info!(session = %session_id, "generation cancel requested");
        }
        cancelled
    }

    pub async fn execute(
        &self,
        session: &SharedSession,
        user_content: &str,
        parent_node_id: Option<&str>,
    ) -> ExecuteOutcome {
        let session_id = session.lock().id.clone();
        let Some(guard) = self.generations.try_begin(&session_id) else {
            tracing::info!(session = %session_id, "generation already in flight, request ignored");
            return ExecuteOutcome::Busy;
        };

        let selection = self.selected_model();
        let resolved = match self.resolver.resolve(selection.as_deref()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "model selection rejected");
                return ExecuteOutcome::Invalid(e);
            }
        };

        let opened = open_turn(&mut session.lock(), user_content, parent_node_id, &resolved);
        let (assistant_id, path) = match opened {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "turn anchor rejected");
                return ExecuteOutcome::Rejected(e);
            }
        };

        let request = ChatRequest {
            profile_id: resolved.profile.id.clone(),
            model_id: resolved.model.id.clone(),
            messages: self.context.build_context(&path),
            stream: self.stream,
        };
        tracing::info!(
            session = %session_id,
            node = %assistant_id,
            model = %request.model_id,
            messages = request.messages.len(),
            "generation started"
        );
        self.emit(ChatEvent::Started {
            session_id: session_id.clone(),
            node_id: assistant_id.clone(),
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = guard.token().clone();
        let mut send = self.transport.send_request(request, tx);
        let mut stream_error: Option<String> = None;

        let result = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break None,
                Some(chunk) = rx.recv() => {
                    self.apply_chunk(session, &session_id, &assistant_id, chunk, &mut stream_error);
                }
                result = &mut send => break Some(result),
            }
        };
        drop(send);
        // Chunks already delivered still count, even after a cancel.
        while let Ok(chunk) = rx.try_recv() {
            self.apply_chunk(session, &session_id, &assistant_id, chunk, &mut stream_error);
        }

        let settled = settle(result, stream_error);
        let status = settled.status;
        {
            let mut session = session.lock();
            match session.node_mut(&assistant_id) {
                Some(node) => {
                    node.status = settled.status;
                    if let Some(content) = settled.content {
                        node.content = content;
                    }
                    if let Some(error) = &settled.error {
                        node.metadata.error = Some(error.clone());
                    }
                }
                None => {
                    tracing::warn!(node = %assistant_id, "assistant node removed during generation");
                }
            }
            session.touch();
        }

        match &settled.error {
            Some(error) => {
                tracing::warn!(session = %session_id, node = %assistant_id, error = %error, "generation failed")
            }
            None => tracing::info!(session = %session_id, node = %assistant_id, "generation complete"),
        }
        self.emit(ChatEvent::Finished {
            session_id: session_id.clone(),
            node_id: assistant_id.clone(),
            status,
        });

        drop(guard);
        self.persist(session).await;

        ExecuteOutcome::Finished {
            assistant_node_id: assistant_id,
            status,
        }
    }

    /// Retry `node_id`: a new assistant answer as a sibling of the old one.
    pub async fn regenerate(
        &self,
        session: &SharedSession,
        node_id: &str,
    ) -> Result<ExecuteOutcome, TreeError> {
        let anchor = Self::try_prepare_regenerate(&session.lock(), node_id)?;
        Ok(self
            .execute(session, &anchor.user_content, Some(&anchor.parent_node_id))
            .await)
    }

    /// Overwrite a node's text in place. Role, status and position stay.
    pub fn edit_message(&self, session: &mut Session, node_id: &str, new_content: &str) -> bool {
        let Some(node) = session.node_mut(node_id) else {
            tracing::debug!(node = %node_id, "edit target not found");
            return false;
        };
        node.content = new_content.to_string();
        session.touch();
        true
    }

    pub fn prepare_regenerate(session: &Session, node_id: &str) -> RegeneratePlan {
        match Self::try_prepare_regenerate(session, node_id) {
            Ok(anchor) => anchor.into(),
            Err(e) => {
                tracing::info!(node = %node_id, error = %e, "regenerate refused");
                RegeneratePlan::default()
            }
        }
    }

    /// Find the user turn to retry from.
    ///
    /// An assistant node retries from its parent, which must be a user node.
    /// A user node is its own anchor. Anything else is refused.
    pub fn try_prepare_regenerate(
        session: &Session,
        node_id: &str,
    ) -> Result<RegenerateAnchor, TreeError> {
        let node = session
            .node(node_id)
            .ok_or_else(|| TreeError::not_found(node_id))?;
        let anchor = match node.role {
            NodeRole::User => node,
            NodeRole::Assistant => {
                let parent = node
                    .parent_id
                    .as_deref()
                    .and_then(|p| session.node(p))
                    .ok_or_else(|| TreeError::MalformedTree {
                        reason: format!("assistant node {} has no parent", node_id),
                    })?;
                if parent.role != NodeRole::User {
                    return Err(TreeError::MalformedTree {
                        reason: format!(
                            "assistant node {} hangs under a {} node",
                            node_id,
                            parent.role.as_str()
                        ),
                    });
                }
                parent
            }
            NodeRole::System => {
                return Err(TreeError::MalformedTree {
                    reason: format!("cannot regenerate system node {}", node_id),
                })
            }
        };
        Ok(RegenerateAnchor {
            user_content: anchor.content.clone(),
            parent_node_id: anchor.id.clone(),
        })
    }

    pub fn switch_branch(&self, session: &mut Session, node_id: &str) -> bool {
        node_manager::update_active_leaf(session, node_id)
    }

    /// Move to the neighbouring answer branch and make its leaf active.
    pub fn switch_to_sibling_branch(
        &self,
        session: &mut Session,
        node_id: &str,
        direction: SiblingDirection,
    ) -> NodeId {
        let target = branch_navigator::switch_to_sibling(session, node_id, direction);
        if target != node_id {
            node_manager::update_active_leaf(session, &target);
        }
        target
    }

    /// Cascading delete. The returned nodes are for the caller's own cleanup.
    pub fn delete_message(&self, session: &mut Session, node_id: &str) -> DeleteOutcome {
        node_manager::hard_delete_node(session, node_id)
    }

    fn apply_chunk(
        &self,
        session: &SharedSession,
        session_id: &str,
        node_id: &str,
        chunk: StreamChunk,
        stream_error: &mut Option<String>,
    ) {
        match chunk {
            StreamChunk::Text(text) => {
                {
                    let mut session = session.lock();
                    let Some(node) = session.node_mut(node_id) else {
                        return;
                    };
                    node.content.push_str(&text);
                    session.touch();
                }
                self.emit(ChatEvent::Delta {
                    session_id: session_id.to_string(),
                    node_id: node_id.to_string(),
                    text,
                });
            }
            StreamChunk::Reasoning(text) => {
                let mut session = session.lock();
                if let Some(node) = session.node_mut(node_id) {
                    node.metadata
                        .reasoning
                        .get_or_insert_with(String::new)
                        .push_str(&text);
                }
            }
            StreamChunk::Done { stop_reason } => {
                tracing::debug!(node = %node_id, stop_reason = ?stop_reason, "stream done");
            }
            StreamChunk::Error(message) => {
                tracing::debug!(node = %node_id, "stream reported an error");
                *stream_error = Some(message);
            }
        }
    }

    fn emit(&self, event: ChatEvent) {
        if let Some(events) = &self.events {
            // Nobody listening is fine.
            let _ = events.send(event);
        }
    }

    async fn persist(&self, session: &SharedSession) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let snapshot = session.lock().clone();
        if let Err(e) = persistence.persist(&snapshot).await {
            tracing::warn!(session = %snapshot.id, error = %e, "failed to persist session");
        }
    }
}

/// Attach the turn's nodes. Returns the placeholder id and the root-to-anchor
/// path the context is built from. No mutation on error.
fn open_turn(
    session: &mut Session,
    user_content: &str,
    parent_node_id: Option<&str>,
    resolved: &ResolvedModel,
) -> Result<(NodeId, Vec<Node>), TreeError> {
    let anchor_id = match parent_node_id {
        Some(anchor) if session.contains(anchor) => anchor.to_string(),
        Some(anchor) => return Err(TreeError::not_found(anchor)),
        None => {
            let user = node_manager::create_node(NodeConfig::new(
                NodeRole::User,
                user_content,
                Some(session.active_leaf_id.clone()),
            ));
            let user_id = user.id.clone();
            if !node_manager::add_node_to_session(session, user) {
                return Err(TreeError::not_found(&session.active_leaf_id));
            }
            session.auto_title(user_content);
            user_id
        }
    };

    let placeholder = node_manager::create_node(
        NodeConfig::new(NodeRole::Assistant, "", Some(anchor_id.clone()))
            .status(NodeStatus::Generating)
            .metadata(NodeMetadata {
                model_id: Some(resolved.model.id.clone()),
                model_name: Some(resolved.model.name.clone()),
                ..NodeMetadata::default()
            }),
    );
    let assistant_id = placeholder.id.clone();
    node_manager::add_node_to_session(session, placeholder);
    node_manager::update_active_leaf(session, &assistant_id);

    let path = branch_navigator::path_to(session, &anchor_id)
        .iter()
        .filter_map(|id| session.node(id).cloned())
        .collect();
    Ok((assistant_id, path))
}

struct Settled {
    status: NodeStatus,
    /// Replaces the streamed text when set
    content: Option<String>,
    error: Option<String>,
}

/// `None` result means the stream was cancelled.
fn settle(
    result: Option<anyhow::Result<Option<ChatResponse>>>,
    stream_error: Option<String>,
) -> Settled {
    let failed = |error: String| Settled {
        status: NodeStatus::Error,
        content: None,
        error: Some(error),
    };
    match result {
        None => failed(CANCELLED_MESSAGE.to_string()),
        Some(Err(e)) => failed(e.to_string()),
        Some(Ok(None)) => {
            failed(stream_error.unwrap_or_else(|| UPSTREAM_FAILURE_MESSAGE.to_string()))
        }
        Some(Ok(Some(response))) => Settled {
            status: NodeStatus::Complete,
            content: (!response.is_stream).then_some(response.content),
            error: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_manager::DefaultContextPipeline;
    use crate::profiles::SettingsProfileResolver;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use shared::agent_api::ChatMessage;
    use shared::settings::GatewaySettings;
    use tokio::sync::Notify;

    const MODEL: &str = "local/llama3.2:3b";

    enum Ending {
        Complete,
        Whole(String),
        Swallowed,
        Fail(String),
    }

    struct ScriptedTransport {
        chunks: Vec<StreamChunk>,
        ending: Ending,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn new(chunks: Vec<StreamChunk>, ending: Ending) -> Arc<Self> {
            Arc::new(Self {
                chunks,
                ending,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn text(parts: &[&str]) -> Arc<Self> {
            let mut chunks: Vec<StreamChunk> =
                parts.iter().map(|p| StreamChunk::Text(p.to_string())).collect();
            chunks.push(StreamChunk::Done {
                stop_reason: Some("stop".into()),
            });
            Self::new(chunks, Ending::Complete)
        }

        fn last_messages(&self) -> Vec<ChatMessage> {
            self.requests
                .lock()
                .last()
                .map(|r| r.messages.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send_request(
            &self,
            request: ChatRequest,
            tx: UnboundedSender<StreamChunk>,
        ) -> anyhow::Result<Option<ChatResponse>> {
            let is_stream = request.stream;
            self.requests.lock().push(request);
            let mut text = String::new();
            for chunk in &self.chunks {
                if let StreamChunk::Text(t) = chunk {
                    text.push_str(t);
                }
                let _ = tx.send(chunk.clone());
            }
            match &self.ending {
                Ending::Complete => Ok(Some(ChatResponse {
                    content: text,
                    is_stream,
                })),
                Ending::Whole(content) => Ok(Some(ChatResponse {
                    content: content.clone(),
                    is_stream: false,
                })),
                Ending::Swallowed => Ok(None),
                Ending::Fail(message) => Err(anyhow!("{}", message)),
            }
        }
    }

    /// Sends one chunk, signals `entered`, then waits for `release`.
    struct GatedTransport {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        hang: bool,
    }

    #[async_trait]
    impl ChatTransport for GatedTransport {
        async fn send_request(
            &self,
            _request: ChatRequest,
            tx: UnboundedSender<StreamChunk>,
        ) -> anyhow::Result<Option<ChatResponse>> {
            let _ = tx.send(StreamChunk::Text("partial".into()));
            self.entered.notify_one();
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.release.notified().await;
            Ok(Some(ChatResponse {
                content: "partial".into(),
                is_stream: true,
            }))
        }
    }

    #[derive(Default)]
    struct RecordingPersistence {
        saved: Mutex<Vec<Session>>,
    }

    #[async_trait]
    impl SessionPersistence for RecordingPersistence {
        async fn persist(&self, session: &Session) -> anyhow::Result<()> {
            self.saved.lock().push(session.clone());
            Ok(())
        }
    }

    fn executor(transport: Arc<dyn ChatTransport>) -> ChatExecutor {
        ChatExecutor::new(
            transport,
            Arc::new(SettingsProfileResolver::new(GatewaySettings::default())),
            Arc::new(DefaultContextPipeline::default()),
        )
        .with_selected_model(Some(MODEL.into()))
    }

    fn new_session() -> SharedSession {
        Arc::new(Mutex::new(Session::new(
            shared::conversation::DEFAULT_SESSION_NAME,
            None,
        )))
    }

    fn finished_id(outcome: &ExecuteOutcome) -> NodeId {
        outcome
            .assistant_node_id()
            .map(str::to_string)
            .unwrap_or_else(|| panic!("expected a finished generation, got {:?}", outcome))
    }

    #[tokio::test]
    async fn test_execute_streams_into_new_assistant_leaf() {
        let transport = ScriptedTransport::text(&["Hel", "lo"]);
        let store = Arc::new(RecordingPersistence::default());
        let executor = executor(transport.clone()).with_persistence(store.clone());
        let session = new_session();

        let outcome = executor.execute(&session, "Say hello", None).await;
        let assistant = finished_id(&outcome);

        let s = session.lock();
        let node = s.node(&assistant).unwrap();
        assert_eq!(node.content, "Hello");
        assert_eq!(node.status, NodeStatus::Complete);
        assert_eq!(node.metadata.model_id.as_deref(), Some("llama3.2:3b"));
        assert_eq!(s.active_leaf_id, assistant);
        assert_eq!(s.name, "Say hello");

        let user = s.node(node.parent_id.as_deref().unwrap()).unwrap();
        assert_eq!(user.role, NodeRole::User);
        assert_eq!(user.parent_id.as_deref(), Some(s.root_node_id.as_str()));
        assert!(s.is_well_formed());

        assert_eq!(transport.last_messages(), vec![ChatMessage::new("user", "Say hello")]);
        assert!(!executor.is_generating(&s.id));

        let saved = store.saved.lock();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].node(&assistant).unwrap().status, NodeStatus::Complete);
    }

    #[tokio::test]
    async fn test_regenerate_branches_a_sibling_answer() {
        let transport = ScriptedTransport::text(&["answer"]);
        let executor = executor(transport.clone());
        let session = new_session();

        let b = finished_id(&executor.execute(&session, "What is Rust?", None).await);
        let user_a = session.lock().node(&b).unwrap().parent_id.clone().unwrap();

        let plan = ChatExecutor::prepare_regenerate(&session.lock(), &b);
        assert_eq!(
            plan,
            RegeneratePlan {
                should_regenerate: true,
                user_content: Some("What is Rust?".into()),
                parent_node_id: Some(user_a.clone()),
            }
        );

        let c = finished_id(&executor.regenerate(&session, &b).await.unwrap());
        let mut s = session.lock();
        assert_eq!(s.node(&user_a).unwrap().children_ids, vec![b.clone(), c.clone()]);
        assert_eq!(s.nodes.len(), 4);
        assert_eq!(s.active_leaf_id, c);
        // The old answer is not part of the retried prompt.
        assert_eq!(transport.last_messages(), vec![ChatMessage::new("user", "What is Rust?")]);

        assert_eq!(
            branch_navigator::switch_to_sibling(&s, &c, SiblingDirection::Prev),
            b
        );
        let landed = executor.switch_to_sibling_branch(&mut s, &c, SiblingDirection::Prev);
        assert_eq!(landed, b);
        assert_eq!(s.active_leaf_id, b);
        assert_eq!(
            s.node(&user_a).unwrap().last_selected_child_id.as_deref(),
            Some(b.as_str())
        );
    }

    #[tokio::test]
    async fn test_follow_up_context_excludes_placeholder() {
        let transport = ScriptedTransport::text(&["first answer"]);
        let executor = executor(transport.clone());
        let session = new_session();

        executor.execute(&session, "one", None).await;
        executor.execute(&session, "two", None).await;

        assert_eq!(
            transport.last_messages(),
            vec![
                ChatMessage::new("user", "one"),
                ChatMessage::new("assistant", "first answer"),
                ChatMessage::new("user", "two"),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_execute_while_generating_is_ignored() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let executor = executor(Arc::new(GatedTransport {
            entered: entered.clone(),
            release: release.clone(),
            hang: false,
        }));
        let session = new_session();

        let (first, _) = tokio::join!(executor.execute(&session, "slow question", None), async {
            entered.notified().await;
            let before = session.lock().clone();
            assert!(executor.is_generating(&before.id));

            let second = executor.execute(&session, "impatient", None).await;
            assert_eq!(second, ExecuteOutcome::Busy);
            let regen = executor.regenerate(&session, &before.active_leaf_id).await;
            assert_eq!(regen, Ok(ExecuteOutcome::Busy));

            let after = session.lock().clone();
            assert_eq!(after.nodes.len(), before.nodes.len());
            assert_eq!(after.active_leaf_id, before.active_leaf_id);
            release.notify_one();
        });

        let assistant = finished_id(&first);
        let s = session.lock();
        assert_eq!(s.nodes.len(), 3);
        assert_eq!(s.node(&assistant).unwrap().status, NodeStatus::Complete);
        assert!(!executor.is_generating(&s.id));
    }

    #[tokio::test]
    async fn test_other_sessions_are_not_blocked() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gated = executor(Arc::new(GatedTransport {
            entered: entered.clone(),
            release: release.clone(),
            hang: false,
        }));
        let busy = new_session();
        let other = new_session();

        let (_, second) = tokio::join!(gated.execute(&busy, "a", None), async {
            entered.notified().await;
            assert!(!gated.is_generating(&other.lock().id));
            let claimed = gated.generations.try_begin(&other.lock().id).is_some();
            release.notify_one();
            claimed
        });
        assert!(second);
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_content() {
        let entered = Arc::new(Notify::new());
        let executor = executor(Arc::new(GatedTransport {
            entered: entered.clone(),
            release: Arc::new(Notify::new()),
            hang: true,
        }));
        let session = new_session();
        let session_id = session.lock().id.clone();

        let (outcome, _) = tokio::join!(executor.execute(&session, "long essay", None), async {
            entered.notified().await;
            assert!(executor.cancel(&session_id));
        });

        assert_eq!(
            outcome,
            ExecuteOutcome::Finished {
                assistant_node_id: session.lock().active_leaf_id.clone(),
                status: NodeStatus::Error,
            }
        );
        let s = session.lock();
        let node = s.active_leaf().unwrap();
        assert_eq!(node.content, "partial");
        assert_eq!(node.metadata.error.as_deref(), Some(CANCELLED_MESSAGE));
        assert!(!executor.is_generating(&session_id));
        assert!(!executor.cancel(&session_id));
    }

    #[tokio::test]
    async fn test_request_failure_marks_only_that_node() {
        let executor = executor(ScriptedTransport::new(vec![], Ending::Fail("connection refused".into())));
        let session = new_session();

        let assistant = finished_id(&executor.execute(&session, "hi", None).await);
        let s = session.lock();
        let node = s.node(&assistant).unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        assert!(node.content.is_empty());
        assert_eq!(node.metadata.error.as_deref(), Some("connection refused"));

        let user = s.node(node.parent_id.as_deref().unwrap()).unwrap();
        assert_eq!(user.status, NodeStatus::Complete);
        assert!(s.is_well_formed());
    }

    #[tokio::test]
    async fn test_swallowed_failure_uses_reported_message() {
        let chunks = vec![
            StreamChunk::Text("half".into()),
            StreamChunk::Error("overloaded".into()),
        ];
        let executor = executor(ScriptedTransport::new(chunks, Ending::Swallowed));
        let session = new_session();

        let assistant = finished_id(&executor.execute(&session, "hi", None).await);
        let s = session.lock();
        let node = s.node(&assistant).unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.content, "half");
        assert_eq!(node.metadata.error.as_deref(), Some("overloaded"));
    }

    #[tokio::test]
    async fn test_swallowed_failure_without_report_gets_default_message() {
        let executor = executor(ScriptedTransport::new(vec![], Ending::Swallowed));
        let session = new_session();

        let assistant = finished_id(&executor.execute(&session, "hi", None).await);
        let s = session.lock();
        assert_eq!(
            s.node(&assistant).unwrap().metadata.error.as_deref(),
            Some(UPSTREAM_FAILURE_MESSAGE)
        );
    }

    #[tokio::test]
    async fn test_non_streaming_sets_content_wholesale() {
        let transport = ScriptedTransport::new(vec![], Ending::Whole("full answer".into()));
        let executor = executor(transport.clone()).with_streaming(false);
        let session = new_session();

        let assistant = finished_id(&executor.execute(&session, "hi", None).await);
        assert!(!transport.requests.lock()[0].stream);
        let s = session.lock();
        assert_eq!(s.node(&assistant).unwrap().content, "full answer");
        assert_eq!(s.node(&assistant).unwrap().status, NodeStatus::Complete);
    }

    #[tokio::test]
    async fn test_reasoning_is_kept_out_of_content() {
        let chunks = vec![
            StreamChunk::Reasoning("let me ".into()),
            StreamChunk::Reasoning("think".into()),
            StreamChunk::Text("42".into()),
            StreamChunk::Done { stop_reason: None },
        ];
        let executor = executor(ScriptedTransport::new(chunks, Ending::Complete));
        let session = new_session();

        let assistant = finished_id(&executor.execute(&session, "meaning?", None).await);
        let s = session.lock();
        let node = s.node(&assistant).unwrap();
        assert_eq!(node.content, "42");
        assert_eq!(node.metadata.reasoning.as_deref(), Some("let me think"));
    }

    #[tokio::test]
    async fn test_events_follow_stream_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let executor = executor(ScriptedTransport::text(&["a", "b"])).with_events(tx);
        let session = new_session();

        let assistant = finished_id(&executor.execute(&session, "hi", None).await);
        let session_id = session.lock().id.clone();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let delta = |text: &str| ChatEvent::Delta {
            session_id: session_id.clone(),
            node_id: assistant.clone(),
            text: text.into(),
        };
        assert_eq!(
            events,
            vec![
                ChatEvent::Started {
                    session_id: session_id.clone(),
                    node_id: assistant.clone(),
                },
                delta("a"),
                delta("b"),
                ChatEvent::Finished {
                    session_id: session_id.clone(),
                    node_id: assistant.clone(),
                    status: NodeStatus::Complete,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_validation_failure_leaves_tree_untouched() {
        let transport = ScriptedTransport::text(&["never"]);
        let executor = executor(transport.clone()).with_selected_model(None);
        let session = new_session();
        let before = session.lock().clone();

        let outcome = executor.execute(&session, "hi", None).await;
        assert_eq!(outcome, ExecuteOutcome::Invalid(ValidationError::NoModelSelected));

        executor.select_model(Some("local/unknown".into()));
        let outcome = executor.execute(&session, "hi", None).await;
        assert!(matches!(
            outcome,
            ExecuteOutcome::Invalid(ValidationError::ModelNotFound { .. })
        ));

        let after = session.lock();
        assert_eq!(after.nodes, before.nodes);
        assert_eq!(after.name, before.name);
        assert!(transport.requests.lock().is_empty());
        assert!(!executor.is_generating(&after.id));
    }

    #[tokio::test]
    async fn test_unknown_anchor_is_rejected() {
        let executor = executor(ScriptedTransport::text(&["x"]));
        let session = new_session();

        let outcome = executor.execute(&session, "hi", Some("ghost")).await;
        assert_eq!(outcome, ExecuteOutcome::Rejected(TreeError::not_found("ghost")));
        assert_eq!(session.lock().nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_refuses_malformed_anchor() {
        let executor = executor(ScriptedTransport::text(&["x"]));
        let session = new_session();
        let stray = {
            let mut s = session.lock();
            let root = s.root_node_id.clone();
            let node = node_manager::create_node(NodeConfig::new(NodeRole::Assistant, "hello", Some(root)));
            let id = node.id.clone();
            node_manager::add_node_to_session(&mut s, node);
            id
        };

        assert!(matches!(
            executor.regenerate(&session, &stray).await,
            Err(TreeError::MalformedTree { .. })
        ));
        assert_eq!(session.lock().nodes.len(), 2);
    }

    #[test]
    fn test_prepare_regenerate_contract() {
        let mut session = Session::new("t", None);
        let root = session.root_node_id.clone();
        let user = node_manager::create_node(NodeConfig::new(NodeRole::User, "q", Some(root.clone())));
        let user_id = user.id.clone();
        node_manager::add_node_to_session(&mut session, user);
        let stray = node_manager::create_node(NodeConfig::new(NodeRole::Assistant, "a", Some(root.clone())));
        let stray_id = stray.id.clone();
        node_manager::add_node_to_session(&mut session, stray);

        let plan = ChatExecutor::prepare_regenerate(&session, &user_id);
        assert!(plan.should_regenerate);
        assert_eq!(plan.user_content.as_deref(), Some("q"));
        assert_eq!(plan.parent_node_id.as_deref(), Some(user_id.as_str()));

        assert_eq!(ChatExecutor::prepare_regenerate(&session, &stray_id), RegeneratePlan::default());
        assert!(!ChatExecutor::prepare_regenerate(&session, &root).should_regenerate);
        assert!(!ChatExecutor::prepare_regenerate(&session, "missing").should_regenerate);
    }

    #[test]
    fn test_edit_switch_and_delete_verbs() {
        let executor = executor(ScriptedTransport::text(&[]));
        let mut session = Session::new("t", None);
        let root = session.root_node_id.clone();
        let user = node_manager::create_node(NodeConfig::new(NodeRole::User, "tpyo", Some(root.clone())));
        let user_id = user.id.clone();
        node_manager::add_node_to_session(&mut session, user);

        assert!(executor.edit_message(&mut session, &user_id, "typo"));
        let node = session.node(&user_id).unwrap();
        assert_eq!(node.content, "typo");
        assert_eq!(node.role, NodeRole::User);
        assert!(!executor.edit_message(&mut session, "missing", "x"));

        assert!(executor.switch_branch(&mut session, &user_id));
        assert_eq!(session.active_leaf_id, user_id);
        assert!(!executor.switch_branch(&mut session, "missing"));

        let outcome = executor.delete_message(&mut session, &user_id);
        assert!(outcome.success);
        assert_eq!(outcome.deleted_nodes.len(), 1);
        assert_eq!(session.active_leaf_id, root);
        assert!(!executor.delete_message(&mut session, &root).success);
    }
}
