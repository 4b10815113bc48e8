use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::config::Config;
use crate::gateway::protocol::{ClientMessage, ServerMessage};

use super::buffer::CircularBuffer;
use super::error::AgentMuxError;
use super::pathguard::PathGuard;
use super::pty::{self, PtyEvent, PtyHandle};
use super::resolver::ToolResolver;
use super::scheduler;
use super::store::{SessionRecord, SessionStore};
use super::tool::{SpawnOptions, ToolKind};

pub type SessionId = Uuid;
pub type ConnectionId = u64;

const MAX_SESSION_NAME_LEN: usize = 80;
const BACKLOG_REPLAY_CHUNKS: usize = 200;
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const IMAGE_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const IMAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const ACTIVITY_BROADCAST_MIN_GAP: Duration = Duration::from_secs(1);
const IMAGE_UPLOADS_PER_MINUTE: usize = 5;
const VOICE_UPLOADS_PER_MINUTE: usize = 10;
const TEMP_IMAGES_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub working_dir: PathBuf,
    pub active: bool,
    pub agent: Option<ToolKind>,
    pub priority: Priority,
    pub created: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_count: usize,
}

#[derive(Debug, Clone)]
struct TempImage {
    #[allow(dead_code)]
    path: PathBuf,
    created_at: Instant,
}

struct Session {
    id: SessionId,
    name: String,
    working_dir: PathBuf,
    created: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    last_activity_broadcast: Option<Instant>,
    agent: Option<ToolKind>,
    priority: Priority,
    connections: HashSet<ConnectionId>,
    output_buffer: CircularBuffer,
    pending_bytes: Arc<AtomicUsize>,
    pty: Option<Arc<PtyHandle>>,
    output_tail: String,
    temp_images: VecDeque<TempImage>,
    image_uploads: VecDeque<Instant>,
    voice_uploads: VecDeque<Instant>,
    /// Notified by `set_priority` on a bg→fg transition so the session's
    /// `output_loop` can flush whatever it's been coalescing immediately,
    /// instead of waiting out the background window it started under.
    flush_signal: Arc<Notify>,
}

impl Session {
    fn new(name: String, working_dir: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            working_dir,
            created: now,
            last_activity: now,
            last_activity_broadcast: None,
            agent: None,
            priority: Priority::default(),
            connections: HashSet::new(),
            output_buffer: CircularBuffer::default(),
            pending_bytes: Arc::new(AtomicUsize::new(0)),
            pty: None,
            output_tail: String::new(),
            temp_images: VecDeque::new(),
            image_uploads: VecDeque::new(),
            voice_uploads: VecDeque::new(),
            flush_signal: Arc::new(Notify::new()),
        }
    }

    fn from_record(record: SessionRecord) -> Self {
        let mut output_buffer = CircularBuffer::default();
        for chunk in &record.output_tail {
            output_buffer.push(chunk.clone());
        }
        Self {
            id: record.id,
            name: record.name,
            working_dir: record.working_dir,
            created: record.created,
            last_activity: record.last_activity,
            last_activity_broadcast: None,
            // Invariant: a session with no running PTY always has agent =
            // None, regardless of what tool it last ran before a restart.
            agent: None,
            priority: record.priority,
            connections: HashSet::new(),
            output_buffer,
            pending_bytes: Arc::new(AtomicUsize::new(0)),
            pty: None,
            output_tail: String::new(),
            temp_images: VecDeque::new(),
            image_uploads: VecDeque::new(),
            voice_uploads: VecDeque::new(),
            flush_signal: Arc::new(Notify::new()),
        }
    }

    fn active(&self) -> bool {
        self.agent.is_some() && self.pty.is_some()
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            name: self.name.clone(),
            working_dir: self.working_dir.clone(),
            active: self.active(),
            agent: self.agent,
            priority: self.priority,
            created: self.created,
            last_activity: self.last_activity,
            connection_count: self.connections.len(),
        }
    }

    fn to_record(&self) -> SessionRecord {
        SessionRecord {
            id: self.id,
            name: self.name.clone(),
            working_dir: self.working_dir.clone(),
            created: self.created,
            last_activity: self.last_activity,
            agent: self.agent,
            priority: self.priority,
            output_tail: self.output_buffer.slice(BACKLOG_REPLAY_CHUNKS),
        }
    }
}

/// Outbound frame queued for one connection. Kept independent of axum's
/// `Message` type so the core crate doesn't need to know about the
/// WebSocket transport; the gateway translates at the edge.
#[derive(Clone)]
pub enum WsOutbound {
    Text(Arc<str>),
    Binary(Arc<[u8]>),
    Close,
}

impl WsOutbound {
    pub fn approx_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Close => 0,
        }
    }
}

struct ConnectionHandle {
    tx: mpsc::UnboundedSender<WsOutbound>,
    joined: std::sync::Mutex<Option<SessionId>>,
    paused: AtomicBool,
    queued_bytes: AtomicUsize,
}

impl ConnectionHandle {
    fn enqueue(&self, msg: WsOutbound) -> bool {
        let len = msg.approx_len();
        if self.tx.send(msg).is_ok() {
            self.queued_bytes.fetch_add(len, Ordering::Relaxed);
            true
        } else {
            false
        }
    }
}

/// Owns every session, connection, and the scheduling decisions that
/// decide which connection sees which output chunk. This is the single
/// logical writer for all session state: every mutating call takes
/// `&Session` exclusively for the duration of one DashMap shard lock, so
/// concurrent callers never interleave writes to the same session.
pub struct Registry {
    sessions: DashMap<SessionId, Session>,
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_connection_id: AtomicU64,
    config: Config,
    resolver: ToolResolver,
    store: Arc<SessionStore>,
}

impl Registry {
    pub fn new(config: Config, store: Arc<SessionStore>) -> Arc<Self> {
        let sessions = DashMap::new();
        for (id, record) in store.load() {
            sessions.insert(id, Session::from_record(record));
        }
        Arc::new(Self {
            sessions,
            connections: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            config,
            resolver: ToolResolver::new(),
            store,
        })
    }

    fn path_guard(&self) -> PathGuard {
        PathGuard::new(self.config.root_dir.clone())
    }

    pub fn resolver(&self) -> &ToolResolver {
        &self.resolver
    }

    // ---- session lifecycle -------------------------------------------------

    pub fn create_session(&self, name: Option<String>, working_dir: Option<String>) -> Result<SessionSummary, AgentMuxError> {
        let resolved_dir = match working_dir {
            Some(path) => self.path_guard().validate(&path)?,
            None => self.config.root_dir.clone(),
        };
        if !resolved_dir.is_dir() {
            return Err(AgentMuxError::Validation(format!(
                "working directory '{}' does not exist",
                resolved_dir.display()
            )));
        }

        let name = name.unwrap_or_else(|| {
            resolved_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "session".to_string())
        });
        if name.trim().is_empty() || name.len() > MAX_SESSION_NAME_LEN {
            return Err(AgentMuxError::Validation("session name must be 1-80 characters".into()));
        }

        let session = Session::new(name, resolved_dir);
        let summary = session.summary();
        self.sessions.insert(session.id, session);
        self.store.mark_dirty();
        Ok(summary)
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.sessions.iter().map(|e| e.value().summary()).collect()
    }

    pub fn get_summary(&self, id: SessionId) -> Option<SessionSummary> {
        self.sessions.get(&id).map(|e| e.summary())
    }

    pub fn delete_session(self: &Arc<Self>, id: SessionId) -> Result<(), AgentMuxError> {
        let removed = self
            .sessions
            .remove(&id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?
            .1;
        if let Some(pty) = removed.pty.clone() {
            tokio::spawn(async move {
                pty.stop().await;
            });
        }
        let text: Option<Arc<str>> = serde_json::to_string(&ServerMessage::SessionDeleted { session_id: id }).ok().map(Into::into);
        for connection_id in removed.connections {
            if let Some(handle) = self.connections.get(&connection_id) {
                *handle.joined.lock().unwrap() = None;
                if let Some(text) = &text {
                    handle.enqueue(WsOutbound::Text(text.clone()));
                }
            }
        }
        self.store.mark_dirty();
        Ok(())
    }

    pub fn set_priority(&self, id: SessionId, priority: Priority) -> Result<(), AgentMuxError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
        let previous = session.priority;
        session.priority = priority;
        if previous == Priority::Background && priority == Priority::Foreground {
            session.flush_signal.notify_one();
        }
        Ok(())
    }

    // ---- tool lifecycle -----------------------------------------------------

    pub async fn start_tool(
        self: &Arc<Self>,
        id: SessionId,
        tool: ToolKind,
        cols: u16,
        rows: u16,
        dangerously_skip_permissions: bool,
    ) -> Result<(), AgentMuxError> {
        let working_dir = {
            let session = self
                .sessions
                .get(&id)
                .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
            if session.active() {
                return Err(AgentMuxError::Conflict(format!("session '{id}' already has a running tool")));
            }
            session.working_dir.clone()
        };

        let binary = self
            .resolver
            .resolve(tool)
            .ok_or_else(|| AgentMuxError::ToolUnavailable(format!("'{}' was not found on PATH", tool.as_str())))?;

        let opts = SpawnOptions {
            working_dir,
            cols,
            rows,
            dangerously_skip_permissions,
        };

        let (handle, event_rx) = tokio::task::spawn_blocking(move || pty::spawn(tool, binary, opts))
            .await
            .map_err(|e| AgentMuxError::ToolUnavailable(format!("spawn task failed: {e}")))??;

        let flush_signal = {
            let mut session = self
                .sessions
                .get_mut(&id)
                .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
            session.agent = Some(tool);
            session.pty = Some(Arc::new(handle));
            session.last_activity = Utc::now();
            session.flush_signal.clone()
        };
        self.store.mark_dirty();

        self.broadcast_to_session(id, &ServerMessage::ToolStarted { session_id: id, tool });

        let registry = self.clone();
        tokio::spawn(async move {
            registry.output_loop(id, event_rx, flush_signal).await;
        });

        Ok(())
    }

    pub async fn stop_tool(&self, id: SessionId) -> Result<(), AgentMuxError> {
        let pty = {
            let session = self
                .sessions
                .get(&id)
                .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
            session.pty.clone()
        };
        if let Some(pty) = pty {
            pty.stop().await;
        }
        Ok(())
    }

    pub fn write_input(&self, id: SessionId, data: &str) -> Result<(), AgentMuxError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
        let pty = session
            .pty
            .clone()
            .ok_or_else(|| AgentMuxError::Conflict(format!("session '{id}' has no running tool")))?;
        session.last_activity = Utc::now();
        drop(session);
        pty.write_stdin(data.as_bytes());
        Ok(())
    }

    pub fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<(), AgentMuxError> {
        let session = self
            .sessions
            .get(&id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
        if let Some(pty) = &session.pty {
            pty.resize(cols, rows);
        }
        Ok(())
    }

    // ---- connection lifecycle ------------------------------------------------

    pub fn register_connection(&self) -> (ConnectionId, mpsc::UnboundedReceiver<WsOutbound>) {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ConnectionHandle {
            tx,
            joined: std::sync::Mutex::new(None),
            paused: AtomicBool::new(false),
            queued_bytes: AtomicUsize::new(0),
        });
        self.connections.insert(id, handle);
        (id, rx)
    }

    pub fn acknowledge_send(&self, connection_id: ConnectionId, len: usize) {
        if let Some(handle) = self.connections.get(&connection_id) {
            handle.queued_bytes.fetch_sub(len.min(handle.queued_bytes.load(Ordering::Relaxed)), Ordering::Relaxed);
        }
    }

    pub fn unregister_connection(&self, connection_id: ConnectionId) {
        if let Some((_, handle)) = self.connections.remove(&connection_id) {
            if let Some(session_id) = *handle.joined.lock().unwrap() {
                if let Some(mut session) = self.sessions.get_mut(&session_id) {
                    session.connections.remove(&connection_id);
                }
            }
        }
    }

    pub fn join(&self, connection_id: ConnectionId, session_id: SessionId) -> Result<Vec<String>, AgentMuxError> {
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or_else(|| AgentMuxError::NotFound("unknown connection".into()))?
            .clone();
        if !self.sessions.contains_key(&session_id) {
            return Err(AgentMuxError::NotFound(format!("no session '{session_id}'")));
        }

        // Resolve and release any previous membership before acquiring the
        // new session's guard — holding two `get_mut` guards into the same
        // map at once risks a shard-lock deadlock if they happen to land
        // in the same shard.
        let previous = handle.joined.lock().unwrap().replace(session_id);
        if let Some(previous) = previous {
            if previous != session_id {
                if let Some(mut prev) = self.sessions.get_mut(&previous) {
                    prev.connections.remove(&connection_id);
                }
            }
        }

        let mut session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{session_id}'")))?;
        session.connections.insert(connection_id);
        Ok(session.output_buffer.slice(BACKLOG_REPLAY_CHUNKS))
    }

    pub fn leave(&self, connection_id: ConnectionId) {
        if let Some(handle) = self.connections.get(&connection_id) {
            if let Some(session_id) = handle.joined.lock().unwrap().take() {
                if let Some(mut session) = self.sessions.get_mut(&session_id) {
                    session.connections.remove(&connection_id);
                }
            }
        }
    }

    pub fn set_flow_control(&self, connection_id: ConnectionId, paused: bool) {
        if let Some(handle) = self.connections.get(&connection_id) {
            handle.paused.store(paused, Ordering::Relaxed);
            if !paused {
                if let Some(session_id) = *handle.joined.lock().unwrap() {
                    if let Some(session) = self.sessions.get(&session_id) {
                        for chunk in session.output_buffer.slice(BACKLOG_REPLAY_CHUNKS) {
                            handle.enqueue(WsOutbound::Binary(chunk.into_bytes().into()));
                        }
                    }
                }
            }
        }
    }

    // ---- output path ----------------------------------------------------------

    async fn output_loop(
        self: Arc<Self>,
        id: SessionId,
        mut events: mpsc::UnboundedReceiver<PtyEvent>,
        flush_signal: Arc<Notify>,
    ) {
        let mut pending: Vec<String> = Vec::new();
        let mut pending_bytes: usize = 0;
        let mut deadline: Option<Instant> = None;

        loop {
            let sleep = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = flush_signal.notified() => {
                    if !pending.is_empty() {
                        self.flush_session(id, std::mem::take(&mut pending)).await;
                        pending_bytes = 0;
                        deadline = None;
                    }
                }
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(PtyEvent::Output(text)) => {
                            pending_bytes += text.len();
                            pending.push(text);
                            self.touch_pending(id, pending_bytes);

                            let immediate = self
                                .sessions
                                .get(&id)
                                .map(|s| scheduler::thresholds(s.priority).immediate_flush_bytes)
                                .unwrap_or(usize::MAX);

                            if pending_bytes >= immediate {
                                self.flush_session(id, std::mem::take(&mut pending)).await;
                                pending_bytes = 0;
                                deadline = None;
                            } else if deadline.is_none() {
                                let window = self
                                    .sessions
                                    .get(&id)
                                    .map(|s| scheduler::thresholds(s.priority).coalesce_window)
                                    .unwrap_or(Duration::from_millis(16));
                                deadline = Some(Instant::now() + window);
                            }
                        }
                        Some(PtyEvent::Exit { code, signal }) => {
                            if !pending.is_empty() {
                                self.flush_session(id, std::mem::take(&mut pending)).await;
                            }
                            self.handle_tool_stopped(id, code, signal).await;
                            break;
                        }
                        Some(PtyEvent::Error(err)) => {
                            log::warn!("session {id} pty error: {err}");
                            self.handle_tool_stopped(id, None, None).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = sleep, if deadline.is_some() => {
                    self.flush_session(id, std::mem::take(&mut pending)).await;
                    pending_bytes = 0;
                    deadline = None;
                }
            }
        }
    }

    fn touch_pending(&self, id: SessionId, bytes: usize) {
        if let Some(session) = self.sessions.get(&id) {
            session.pending_bytes.store(bytes, Ordering::Relaxed);
        }
    }

    async fn flush_session(&self, id: SessionId, chunks: Vec<String>) {
        if chunks.is_empty() {
            return;
        }
        let joined: String = chunks.concat();

        let connections: Vec<ConnectionId> = {
            let mut session = match self.sessions.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            session.output_buffer.push(joined.clone());
            session.pending_bytes.store(0, Ordering::Relaxed);
            session.last_activity = Utc::now();

            session.output_tail.push_str(&joined);
            let max_tail = 10_000;
            if session.output_tail.len() > max_tail {
                let start = session.output_tail.len() - max_tail;
                session.output_tail = session.output_tail[start..].to_string();
            }
            if let Some(tool) = session.agent {
                if let Some(answer) = tool.trust_prompt(&session.output_tail) {
                    if let Some(pty) = &session.pty {
                        pty.write_stdin(answer.as_bytes());
                    }
                }
            }

            session.connections.iter().copied().collect()
        };

        let priority = self.sessions.get(&id).map(|s| s.priority).unwrap_or_default();
        let cutoff = scheduler::thresholds(priority).backpressure_cutoff;
        let payload: Arc<[u8]> = joined.into_bytes().into();

        for connection_id in connections {
            if let Some(handle) = self.connections.get(&connection_id) {
                if handle.paused.load(Ordering::Relaxed) {
                    continue;
                }
                if handle.queued_bytes.load(Ordering::Relaxed) >= cutoff {
                    continue;
                }
                handle.enqueue(WsOutbound::Binary(payload.clone()));
            }
        }

        self.maybe_broadcast_activity(id).await;
    }

    async fn maybe_broadcast_activity(&self, id: SessionId) {
        let should_send = {
            let mut session = match self.sessions.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            let ready = session
                .last_activity_broadcast
                .map(|t| t.elapsed() >= ACTIVITY_BROADCAST_MIN_GAP)
                .unwrap_or(true);
            if ready {
                session.last_activity_broadcast = Some(Instant::now());
            }
            ready
        };
        if should_send {
            self.broadcast_except_joined(id, &ServerMessage::SessionActivity { session_id: id });
        }
    }

    async fn handle_tool_stopped(&self, id: SessionId, code: Option<i32>, signal: Option<i32>) {
        let tool = {
            let mut session = match self.sessions.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            let tool = session.agent.take();
            session.pty = None;
            session.last_activity = Utc::now();
            tool
        };
        self.store.mark_dirty();
        self.broadcast_to_session(id, &ServerMessage::Exit { session_id: id, code, signal });
        if let Some(tool) = tool {
            self.broadcast_to_session(id, &ServerMessage::ToolStopped { session_id: id, tool });
        }
    }

    // ---- broadcasting -----------------------------------------------------

    fn broadcast_to_session(&self, id: SessionId, message: &ServerMessage) {
        let Ok(text) = serde_json::to_string(message) else { return };
        let text: Arc<str> = text.into();
        if let Some(session) = self.sessions.get(&id) {
            for connection_id in &session.connections {
                if let Some(handle) = self.connections.get(connection_id) {
                    handle.enqueue(WsOutbound::Text(text.clone()));
                }
            }
        }
    }

    fn broadcast_except_joined(&self, id: SessionId, message: &ServerMessage) {
        let Ok(text) = serde_json::to_string(message) else { return };
        let text: Arc<str> = text.into();
        for entry in self.connections.iter() {
            let joined = *entry.value().joined.lock().unwrap();
            if joined != Some(id) {
                entry.value().enqueue(WsOutbound::Text(text.clone()));
            }
        }
    }

    pub async fn broadcast_server_restarting(&self, reason: &str) {
        let message = ServerMessage::ServerRestarting { reason: reason.to_string() };
        if let Ok(text) = serde_json::to_string(&message) {
            let text: Arc<str> = text.into();
            for entry in self.connections.iter() {
                entry.value().enqueue(WsOutbound::Text(text.clone()));
            }
        }
    }

    pub async fn broadcast_memory_warning(&self, resident_bytes: u64) {
        let message = ServerMessage::MemoryWarning { resident_bytes };
        if let Ok(text) = serde_json::to_string(&message) {
            let text: Arc<str> = text.into();
            for entry in self.connections.iter() {
                entry.value().enqueue(WsOutbound::Text(text.clone()));
            }
        }
    }

    // ---- client message dispatch -------------------------------------------

    pub async fn handle_client_message(self: &Arc<Self>, connection_id: ConnectionId, value: serde_json::Value) {
        let message = match ClientMessage::parse(&value) {
            Ok(m) => m,
            Err(e) => {
                self.send_error(connection_id, &e.to_string());
                return;
            }
        };

        let joined = self
            .connections
            .get(&connection_id)
            .and_then(|h| *h.joined.lock().unwrap());

        let result = match message {
            ClientMessage::CreateSession { name, working_dir } => {
                self.create_session(name, working_dir).map(|s| {
                    self.send(connection_id, &ServerMessage::SessionCreated {
                        session_id: s.id,
                        name: s.name,
                        working_dir: s.working_dir,
                    });
                })
            }
            ClientMessage::JoinSession { session_id } => self.join(connection_id, session_id).map(|backlog| {
                self.send(connection_id, &ServerMessage::SessionJoined { session_id, backlog_chunks: backlog.len() });
                if let Some(handle) = self.connections.get(&connection_id) {
                    for chunk in backlog {
                        handle.enqueue(WsOutbound::Binary(chunk.into_bytes().into()));
                    }
                }
            }),
            ClientMessage::LeaveSession => {
                if let Some(session_id) = joined {
                    self.leave(connection_id);
                    self.send(connection_id, &ServerMessage::SessionLeft { session_id });
                }
                Ok(())
            }
            ClientMessage::Start { tool, cols, rows, dangerously_skip_permissions } => match joined {
                Some(session_id) => {
                    self.start_tool(session_id, tool, cols.unwrap_or(80), rows.unwrap_or(24), dangerously_skip_permissions)
                        .await
                }
                None => Err(AgentMuxError::Conflict("join a session before starting a tool".into())),
            },
            ClientMessage::Input { data } => match joined {
                Some(session_id) => self.write_input(session_id, &data),
                None => Err(AgentMuxError::Conflict("join a session before sending input".into())),
            },
            ClientMessage::Resize { cols, rows } => match joined {
                Some(session_id) => self.resize(session_id, cols, rows),
                None => Err(AgentMuxError::Conflict("join a session before resizing".into())),
            },
            ClientMessage::Stop => match joined {
                Some(session_id) => self.stop_tool(session_id).await,
                None => Err(AgentMuxError::Conflict("join a session before stopping".into())),
            },
            ClientMessage::SetPriority { sessions } => {
                let mut result = Ok(());
                for (session_id, priority) in sessions {
                    if let Err(e) = self.set_priority(session_id, priority) {
                        result = Err(e);
                    }
                }
                result
            }
            ClientMessage::FlowControl { paused } => {
                self.set_flow_control(connection_id, paused);
                Ok(())
            }
            ClientMessage::Ping => {
                self.send(connection_id, &ServerMessage::Pong);
                Ok(())
            }
        };

        if let Err(e) = result {
            self.send_error(connection_id, &e.to_string());
        }
    }

    fn send(&self, connection_id: ConnectionId, message: &ServerMessage) {
        if let (Some(handle), Ok(text)) = (self.connections.get(&connection_id), serde_json::to_string(message)) {
            handle.enqueue(WsOutbound::Text(text.into()));
        }
    }

    fn send_error(&self, connection_id: ConnectionId, message: &str) {
        self.send(connection_id, &ServerMessage::Error { message: message.to_string() });
    }

    // ---- uploads rate limiting ----------------------------------------------

    pub fn record_image_upload(&self, id: SessionId, path: PathBuf) -> Result<(), AgentMuxError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
        prune_window(&mut session.image_uploads, Duration::from_secs(60));
        if session.image_uploads.len() >= IMAGE_UPLOADS_PER_MINUTE {
            return Err(AgentMuxError::RateLimit("too many image uploads in the last minute".into()));
        }
        session.image_uploads.push_back(Instant::now());
        if session.temp_images.len() >= TEMP_IMAGES_CAP {
            session.temp_images.pop_front();
        }
        session.temp_images.push_back(TempImage { path, created_at: Instant::now() });
        Ok(())
    }

    pub fn record_voice_upload(&self, id: SessionId) -> Result<(), AgentMuxError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AgentMuxError::NotFound(format!("no session '{id}'")))?;
        prune_window(&mut session.voice_uploads, Duration::from_secs(60));
        if session.voice_uploads.len() >= VOICE_UPLOADS_PER_MINUTE {
            return Err(AgentMuxError::RateLimit("too many voice uploads in the last minute".into()));
        }
        session.voice_uploads.push_back(Instant::now());
        Ok(())
    }

    // ---- maintenance --------------------------------------------------------

    pub fn spawn_maintenance_loops(self: &Arc<Self>) {
        let idle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                idle.sweep_idle();
            }
        });

        let images = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IMAGE_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                images.sweep_images();
            }
        });
    }

    fn sweep_idle(&self) {
        let now = Utc::now();
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| {
                let s = e.value();
                !s.active() && s.connections.is_empty() && (now - s.last_activity).to_std().map(|d| d > IDLE_SESSION_TTL).unwrap_or(false)
            })
            .map(|e| *e.key())
            .collect();
        for id in stale {
            log::info!("sweeping idle session {id}");
            self.sessions.remove(&id);
        }
        if !self.sessions.is_empty() {
            self.store.mark_dirty();
        }
    }

    fn sweep_images(&self) {
        for mut entry in self.sessions.iter_mut() {
            entry.value_mut().temp_images.retain(|img| img.created_at.elapsed() < IMAGE_TTL);
        }
    }

    pub fn persist(&self) {
        let records: Vec<SessionRecord> = self.sessions.iter().map(|e| e.value().to_record()).collect();
        self.store.mark_dirty();
        if let Err(e) = self.store.save(&records) {
            log::error!("failed to persist sessions: {e}");
        }
    }

    pub fn snapshot_for_crash(&self) -> Vec<SessionRecord> {
        self.sessions.iter().map(|e| e.value().to_record()).collect()
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }
}

fn prune_window(timestamps: &mut VecDeque<Instant>, window: Duration) {
    while let Some(front) = timestamps.front() {
        if front.elapsed() > window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
