//! Session supervisor: owns agent processes and relays their events.
//!
//! Each session runs four tasks:
//! - stdout pump: frames and decodes output, updates tracker and mediator,
//!   forwards every event to the boundary
//! - stderr pump: forwards diagnostic lines
//! - job worker: runs approved tool calls and denial notices one at a time,
//!   writing each report back as a user turn
//! - exit watcher: waits for exit or abort, then emits the terminal event
//!
//! Mediator transitions happen synchronously inside the stdout pump; anything
//! that touches the filesystem or shell is handed to the job worker.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tether_core::{
    DecodedEvent, DenialAction, DenialDetector, EventKind, ExecutionContext, LineFramer,
    LocalToolExecutor, PermissionMediator, PhraseDenialDetector, ProtocolEvent, TetherConfig,
    ToolInvocation, ToolUseTracker, Verdict, approved_report, decode, denied_report,
    user_turn_line,
};
use tether_proto::{
    BoundaryEvent, ImageAttachment, PermissionDecision, ResumeStore, StartOptions,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent_command::AgentCommand;

/// Time an aborted agent gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How long output pumps may keep draining after the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from starting a session.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn agent '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Agent process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Point-in-time view of one live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub spawn_id: String,
    pub pid: Option<u32>,
    pub cwd: PathBuf,
    /// Tool calls seen but not yet resolved, sorted by id.
    pub pending_tool_ids: Vec<String>,
    /// Tool names awaiting a user decision, head of the queue first.
    pub awaiting_decision: Vec<String>,
    pub always_allowed: Vec<String>,
}

/// Work for a session's job worker.
#[derive(Debug)]
enum Job {
    Execute(ToolInvocation),
    Deny(ToolInvocation),
}

#[derive(Debug, Default)]
struct SessionState {
    tracker: ToolUseTracker,
    mediator: PermissionMediator,
}

/// State shared by a session's tasks and the registry.
struct SessionShared {
    session_id: String,
    generation: u64,
    spawn_id: String,
    pid: Option<u32>,
    exec: ExecutionContext,
    state: Mutex<SessionState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    /// Set on abort; later output from this process is dropped.
    aborted: AtomicBool,
    /// Set once a terminal `session:error` went out.
    failed: AtomicBool,
    events: mpsc::UnboundedSender<BoundaryEvent>,
}

impl SessionShared {
    fn emit(&self, event: BoundaryEvent) {
        if self.events.send(event).is_err() {
            debug!(session_id = %self.session_id, "Boundary receiver dropped");
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }

    /// Drops any further output from this process and asks its watcher to
    /// stop it.
    fn supersede(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.request_shutdown();
    }

    /// Emits `session:error` and tears the process down.
    fn fail(&self, message: String) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            error!(session_id = %self.session_id, "{message}");
            self.emit(BoundaryEvent::SessionError {
                session_id: self.session_id.clone(),
                message,
            });
        }
        self.request_shutdown();
    }

    /// Writes one user turn to the agent's stdin.
    ///
    /// Returns `false` when stdin is already gone. A failed write is a
    /// lifecycle error and ends the session.
    async fn write_turn(&self, text: &str, images: &[ImageAttachment]) -> bool {
        let line = user_turn_line(text, images);
        let mut stdin = self.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            debug!(session_id = %self.session_id, "Stdin closed, dropping turn");
            return false;
        };

        let written = async {
            pipe.write_all(line.as_bytes()).await?;
            pipe.flush().await
        }
        .await;

        if let Err(e) = written {
            *stdin = None;
            drop(stdin);
            self.fail(format!("Failed to write to agent stdin: {e}"));
            return false;
        }
        true
    }

    fn request_decision(&self, invocation: &ToolInvocation) {
        info!(
            session_id = %self.session_id,
            tool = %invocation.name,
            tool_use_id = %invocation.id,
            "Requesting permission decision"
        );
        self.emit(BoundaryEvent::PermissionRequest {
            session_id: self.session_id.clone(),
            tool_use_id: invocation.id.clone(),
            tool_name: invocation.name.clone(),
            input: invocation.input.clone(),
        });
    }
}

/// Registry entry for a live session.
struct SessionHandle {
    shared: Arc<SessionShared>,
    jobs: mpsc::UnboundedSender<Job>,
}

type Registry = Arc<RwLock<HashMap<String, SessionHandle>>>;

/// Spawns and supervises agent sessions keyed by UI session id.
///
/// Cheap to clone; clones share the registry and the event channel.
#[derive(Clone)]
pub struct SessionSupervisor {
    config: Arc<TetherConfig>,
    detector: Arc<dyn DenialDetector>,
    store: Arc<dyn ResumeStore>,
    executor: LocalToolExecutor,
    sessions: Registry,
    generation: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<BoundaryEvent>,
    base_env: Arc<HashMap<String, String>>,
    default_cwd: PathBuf,
    grace_period: Duration,
}

impl SessionSupervisor {
    /// Creates a supervisor and the receiving end of its boundary events.
    ///
    /// Spawned agents inherit a sanitized copy of this process's environment.
    pub fn new(
        config: TetherConfig,
        store: Arc<dyn ResumeStore>,
    ) -> (Self, mpsc::UnboundedReceiver<BoundaryEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let detector = PhraseDenialDetector::with_extra(&config.permissions.extra_denial_phrases);
        let default_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let supervisor = Self {
            config: Arc::new(config),
            detector: Arc::new(detector),
            store,
            executor: LocalToolExecutor::new(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(1)),
            events,
            base_env: Arc::new(std::env::vars().collect()),
            default_cwd,
            grace_period: DEFAULT_GRACE_PERIOD,
        };
        (supervisor, rx)
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Arc<dyn DenialDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Replaces the environment spawned agents are derived from.
    #[must_use]
    pub fn with_base_env(mut self, env: HashMap<String, String>) -> Self {
        self.base_env = Arc::new(env);
        self
    }

    /// Working directory for sessions that do not name one.
    #[must_use]
    pub fn with_default_cwd(mut self, cwd: PathBuf) -> Self {
        self.default_cwd = cwd;
        self
    }

    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Starts an agent process for `session_id`.
    ///
    /// Any process already running under that id is aborted first. A spawn
    /// failure is reported as `session:error` and returned.
    pub async fn start(&self, session_id: &str, options: StartOptions) -> Result<(), SupervisorError> {
        self.abort(session_id).await;

        let resume_id = self.resolve_resume_id(session_id, &options);
        let command = AgentCommand::build(
            &self.config.agent,
            &options,
            resume_id,
            Uuid::new_v4().to_string(),
            self.base_env.iter().map(|(k, v)| (k.clone(), v.clone())),
            self.default_cwd.clone(),
        );

        info!(
            session_id = %session_id,
            spawn_id = %command.spawn_id,
            resume_id = ?command.resume_id,
            cwd = %command.cwd.display(),
            "Starting agent: {} {}",
            command.program,
            command.args.join(" ")
        );

        let mut child = match spawn(&command) {
            Ok(child) => child,
            Err(e) => {
                let _ = self.events.send(BoundaryEvent::SessionError {
                    session_id: session_id.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.start_kill();
            let err = SupervisorError::MissingPipe("stdio");
            let _ = self.events.send(BoundaryEvent::SessionError {
                session_id: session_id.to_string(),
                message: err.to_string(),
            });
            return Err(err);
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let pid = child.id();
        let shared = Arc::new(SessionShared {
            session_id: session_id.to_string(),
            generation: self.generation.fetch_add(1, Ordering::SeqCst),
            spawn_id: command.spawn_id.clone(),
            pid,
            exec: ExecutionContext::new(
                command.cwd.clone(),
                command.env.clone(),
                self.config.executor.clone(),
            ),
            state: Mutex::new(SessionState::default()),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            shutdown: Mutex::new(Some(shutdown_tx)),
            aborted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            events: self.events.clone(),
        });

        {
            // Registration and the start notification happen under the lock so
            // an older process's terminal event can never land after them.
            let mut sessions = self.sessions.write().await;
            let displaced = sessions.insert(
                session_id.to_string(),
                SessionHandle {
                    shared: Arc::clone(&shared),
                    jobs: jobs_tx.clone(),
                },
            );
            // A concurrent start for the same id got here first.
            if let Some(displaced) = displaced {
                info!(
                    session_id = %session_id,
                    spawn_id = %displaced.shared.spawn_id,
                    "Replacing session started concurrently"
                );
                displaced.shared.supersede();
            }
            shared.emit(BoundaryEvent::SessionStarted {
                session_id: session_id.to_string(),
                spawn_id: command.spawn_id.clone(),
                pid,
            });
        }

        tokio::spawn(run_jobs(Arc::clone(&shared), jobs_rx, self.executor));
        let stdout_task = tokio::spawn(pump_stdout(
            stdout,
            Arc::clone(&shared),
            jobs_tx,
            Arc::clone(&self.detector),
            Arc::clone(&self.store),
        ));
        let stderr_task = tokio::spawn(pump_stderr(stderr, Arc::clone(&shared)));
        tokio::spawn(watch_exit(
            child,
            shutdown_rx,
            [stdout_task, stderr_task],
            Arc::clone(&shared),
            Arc::clone(&self.sessions),
            self.grace_period,
        ));

        if let Some(prompt) = options.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            shared.write_turn(prompt, &options.images).await;
        }

        Ok(())
    }

    fn resolve_resume_id(&self, session_id: &str, options: &StartOptions) -> Option<String> {
        options
            .resume_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| {
                options
                    .continue_last
                    .then(|| self.store.resume_id(session_id))
                    .flatten()
            })
    }

    /// Sends a user turn into a live session. Unknown sessions are ignored.
    pub async fn send(&self, session_id: &str, text: &str, images: &[ImageAttachment]) {
        let Some(shared) = self.shared(session_id).await else {
            debug!(session_id = %session_id, "Send to unknown session ignored");
            return;
        };
        shared.write_turn(text, images).await;
    }

    /// Applies the user's decision to the session's outstanding request.
    ///
    /// Stale decisions (no session, nothing awaiting) are ignored.
    pub async fn respond(&self, session_id: &str, decision: PermissionDecision) {
        let handle = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|h| (Arc::clone(&h.shared), h.jobs.clone()))
        };
        let Some((shared, jobs)) = handle else {
            debug!(session_id = %session_id, "Decision for unknown session ignored");
            return;
        };

        let Some(resolution) = shared.state().mediator.respond(decision) else {
            debug!(session_id = %session_id, ?decision, "Stale permission decision ignored");
            return;
        };

        info!(
            session_id = %session_id,
            tool = %resolution.decided.name,
            ?decision,
            "Permission decision applied"
        );

        let decided = match resolution.verdict {
            Verdict::Approved(_) => Job::Execute(resolution.decided),
            Verdict::Denied => Job::Deny(resolution.decided),
        };
        let queued = std::iter::once(decided).chain(resolution.auto_approved.into_iter().map(Job::Execute));
        for job in queued {
            if jobs.send(job).is_err() {
                debug!(session_id = %session_id, "Job worker gone, dropping job");
            }
        }

        if let Some(next) = resolution.next_request {
            shared.request_decision(&next);
        }
    }

    /// Terminates a session. Safe to call for unknown or finished sessions.
    ///
    /// The session leaves the registry immediately; the process is signalled
    /// and reaped in the background.
    pub async fn abort(&self, session_id: &str) {
        let removed = self.sessions.write().await.remove(session_id);
        let Some(handle) = removed else {
            debug!(session_id = %session_id, "Abort for unknown session is a no-op");
            return;
        };
        info!(session_id = %session_id, spawn_id = %handle.shared.spawn_id, "Aborting session");
        handle.shared.supersede();
    }

    /// Aborts every live session.
    pub async fn abort_all(&self) {
        for session_id in self.list_sessions().await {
            self.abort(&session_id).await;
        }
    }

    /// Live session ids, sorted.
    pub async fn list_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let shared = self.shared(session_id).await?;
        let state = shared.state();
        Some(SessionSnapshot {
            session_id: shared.session_id.clone(),
            spawn_id: shared.spawn_id.clone(),
            pid: shared.pid,
            cwd: shared.exec.cwd.clone(),
            pending_tool_ids: state.tracker.pending_ids(),
            awaiting_decision: state.mediator.awaiting_tools(),
            always_allowed: state.mediator.always_allowed(),
        })
    }

    async fn shared(&self, session_id: &str) -> Option<Arc<SessionShared>> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|h| Arc::clone(&h.shared))
    }
}

fn spawn(command: &AgentCommand) -> Result<Child, SupervisorError> {
    Command::new(&command.program)
        .args(&command.args)
        .current_dir(&command.cwd)
        .env_clear()
        .envs(&command.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            program: command.program.clone(),
            source,
        })
}

async fn pump_stdout(
    mut stdout: impl AsyncRead + Unpin,
    shared: Arc<SessionShared>,
    jobs: mpsc::UnboundedSender<Job>,
    detector: Arc<dyn DenialDetector>,
    store: Arc<dyn ResumeStore>,
) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(session_id = %shared.session_id, "Error reading agent stdout: {e}");
                break;
            }
        };
        for line in framer.feed(&buf[..n]) {
            handle_line(&shared, &jobs, detector.as_ref(), &store, &line).await;
        }
    }
    if let Some(rest) = framer.finish() {
        handle_line(&shared, &jobs, detector.as_ref(), &store, &rest).await;
    }
}

async fn handle_line(
    shared: &SessionShared,
    jobs: &mpsc::UnboundedSender<Job>,
    detector: &dyn DenialDetector,
    store: &Arc<dyn ResumeStore>,
    line: &str,
) {
    if line.trim().is_empty() || shared.is_aborted() {
        return;
    }

    let event = match decode(line) {
        DecodedEvent::Protocol(event) => event,
        DecodedEvent::Raw(text) => {
            shared.emit(BoundaryEvent::Raw {
                session_id: shared.session_id.clone(),
                text,
            });
            return;
        }
    };

    let actions = apply_event(shared, detector, &event);

    if event.kind == EventKind::System
        && let Some(resume_id) = event.agent_session_id()
    {
        debug!(session_id = %shared.session_id, %resume_id, "Recording resume id");
        record_resume_id(store, &shared.session_id, resume_id).await;
    }

    shared.emit(BoundaryEvent::Agent {
        session_id: shared.session_id.clone(),
        payload: event.payload,
    });

    for action in actions {
        match action {
            DenialAction::Execute(invocation, approval) => {
                info!(
                    session_id = %shared.session_id,
                    tool = %invocation.name,
                    ?approval,
                    "Auto-approving denied tool call"
                );
                if jobs.send(Job::Execute(invocation)).is_err() {
                    debug!(session_id = %shared.session_id, "Job worker gone, dropping job");
                }
            }
            DenialAction::RequestDecision(invocation) => shared.request_decision(&invocation),
            DenialAction::Queued { position } => {
                debug!(session_id = %shared.session_id, position, "Denial queued behind pending decision");
            }
        }
    }
}

/// Stores may touch the filesystem, so the write runs on the blocking pool.
/// It is awaited to keep the stored id in step with the relayed events.
async fn record_resume_id(store: &Arc<dyn ResumeStore>, session_id: &str, resume_id: &str) {
    let store = Arc::clone(store);
    let key = session_id.to_string();
    let value = resume_id.to_string();
    let written = tokio::task::spawn_blocking(move || store.set_resume_id(&key, &value)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(session_id = %session_id, "Failed to store resume id: {e}"),
        Err(e) => warn!(session_id = %session_id, "Resume id writer panicked: {e}"),
    }
}

/// Runs tracker and mediator transitions for one event.
fn apply_event(
    shared: &SessionShared,
    detector: &dyn DenialDetector,
    event: &ProtocolEvent,
) -> Vec<DenialAction> {
    let mut guard = shared.state();
    let state = &mut *guard;
    match event.kind {
        EventKind::Assistant => {
            state.tracker.observe_assistant(event);
            Vec::new()
        }
        EventKind::User => state
            .tracker
            .resolve_results(event, detector)
            .into_iter()
            .map(|invocation| state.mediator.on_denial(invocation))
            .collect(),
        _ => Vec::new(),
    }
}

async fn pump_stderr(mut stderr: impl AsyncRead + Unpin, shared: Arc<SessionShared>) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 4096];
    let emit = |text: String| {
        if !text.trim().is_empty() && !shared.is_aborted() {
            shared.emit(BoundaryEvent::Stderr {
                session_id: shared.session_id.clone(),
                text,
            });
        }
    };
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => framer.feed(&buf[..n]).into_iter().for_each(emit),
            Err(e) => {
                warn!(session_id = %shared.session_id, "Error reading agent stderr: {e}");
                break;
            }
        }
    }
    if let Some(rest) = framer.finish() {
        emit(rest);
    }
}

/// Runs approved executions and denial notices in decision order.
async fn run_jobs(
    shared: Arc<SessionShared>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    executor: LocalToolExecutor,
) {
    while let Some(job) = jobs.recv().await {
        if shared.is_aborted() {
            break;
        }
        let report = match job {
            Job::Execute(invocation) => {
                let outcome = executor.execute(&shared.exec, &invocation).await;
                if let Err(e) = &outcome {
                    warn!(
                        session_id = %shared.session_id,
                        tool = %invocation.name,
                        "Approved tool call failed: {e}"
                    );
                }
                approved_report(&invocation.name, &outcome)
            }
            Job::Deny(invocation) => denied_report(&invocation.name),
        };
        if shared.is_aborted() || !shared.write_turn(&report, &[]).await {
            break;
        }
    }
    debug!(session_id = %shared.session_id, "Job worker stopped");
}

async fn watch_exit(
    mut child: Child,
    mut shutdown: oneshot::Receiver<()>,
    pumps: [JoinHandle<()>; 2],
    shared: Arc<SessionShared>,
    sessions: Registry,
    grace_period: Duration,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut shutdown => terminate(&mut child, &shared.session_id, grace_period).await,
    };

    // Descendants may hold the pipes open; both pumps share one deadline.
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    for mut pump in pumps {
        if tokio::time::timeout_at(deadline, &mut pump).await.is_err() {
            warn!(session_id = %shared.session_id, "Output pump did not drain after exit");
            shared.aborted.store(true, Ordering::SeqCst);
            pump.abort();
            let _ = pump.await;
        }
    }
    // Nothing from this process may follow its terminal event.
    shared.aborted.store(true, Ordering::SeqCst);
    shared.stdin.lock().await.take();

    let mut sessions = sessions.write().await;
    let superseded = match sessions.get(&shared.session_id) {
        Some(handle) if handle.shared.generation == shared.generation => {
            sessions.remove(&shared.session_id);
            false
        }
        Some(_) => true,
        None => false,
    };

    if superseded {
        debug!(session_id = %shared.session_id, spawn_id = %shared.spawn_id, "Superseded process exited");
        return;
    }

    match status {
        Ok(status) => {
            info!(session_id = %shared.session_id, ?status, "Agent process exited");
            if !shared.failed.load(Ordering::SeqCst) {
                shared.emit(BoundaryEvent::SessionEnded {
                    session_id: shared.session_id.clone(),
                    exit_code: status.code(),
                });
            }
        }
        Err(e) => shared.fail(format!("Failed to wait for agent process: {e}")),
    }
}

/// Asks the process to stop, then kills it if it outlives the grace period.
async fn terminate(
    child: &mut Child,
    session_id: &str,
    grace_period: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            debug!(session_id = %session_id, pid, "Sending SIGTERM");
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(session_id = %session_id, "Failed to send SIGTERM: {e}");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(session_id = %session_id, "Agent did not exit gracefully, force killing");
            child.kill().await?;
            child.wait().await
        }
    }
}
