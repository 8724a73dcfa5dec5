//! Engine module (Step 3 in architecture).
//! Drives an external GTP engine (KataGo gomoku build) as a long-lived child process.
//! `EngineSession` owns the process and its state machine:
//! Stopped → Starting → Ready → Analyzing → AwaitingResult → Ready, with any
//! I/O failure landing in Faulted and the next request restarting the process
//! and replaying the full move history.
//! `EngineHandle` runs the session on its own task so the polling loop never
//! blocks on engine I/O; dropping an `AnalysisTicket` cancels its analysis.

use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::board::{MoveHistory, Pos, Stone};
use crate::config::{EngineConfig, RuleMode, SearchMode};
use crate::error::{AssistError, AssistResult};
use crate::gtp::{self, Candidate, Command, Line};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Ready,
    Analyzing,
    AwaitingResult,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Stopped => "stopped",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Analyzing => "analyzing",
            SessionState::AwaitingResult => "awaiting result",
            SessionState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

// *************** Transport ***************

/// Line-oriented duplex channel to an engine.
#[async_trait]
pub trait EngineTransport: Send {
    async fn send_line(&mut self, line: &str) -> io::Result<()>;
    /// Next line without its terminator; None once the engine closed its output.
    async fn recv_line(&mut self) -> io::Result<Option<String>>;
    async fn close(&mut self);
}

pub struct LineTransport<R, W> {
    lines: Lines<R>,
    writer: W,
    child: Option<Child>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, child: Option<Child>) -> Self {
        Self {
            lines: reader.lines(),
            writer,
            child,
        }
    }
}

#[async_trait]
impl<R, W> EngineTransport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    async fn recv_line(&mut self) -> io::Result<Option<String>> {
        self.lines.next_line().await
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
        if let Some(child) = self.child.as_mut() {
            if timeout(CLOSE_GRACE, child.wait()).await.is_err() {
                warn!("engine did not exit after quit, killing it");
                let _ = child.kill().await;
            }
        }
    }
}

/// Produces a fresh engine connection; called on first use and after every fault.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn EngineTransport>>;
}

/// Spawns the engine binary with piped stdio. Stderr is forwarded to the log.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(config: &EngineConfig, rule: RuleMode) -> Self {
        Self {
            program: config.program.clone(),
            args: config.launch_args(rule),
        }
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Box<dyn EngineTransport>> {
        let mut child = ProcessCommand::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn engine {}", self.program.display()))?;

        let stdin = child.stdin.take().context("Engine stdin not captured")?;
        let stdout = child.stdout.take().context("Engine stdout not captured")?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "engine_stderr", "{}", line);
                }
            });
        }
        info!(program = %self.program.display(), args = ?self.args, "engine process spawned");
        Ok(Box::new(LineTransport::new(
            BufReader::new(stdout),
            stdin,
            Some(child),
        )))
    }
}

// *************** Session ***************

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// Leading candidate reached `visits_threshold`.
    VisitThreshold,
    /// The engine closed the analysis stream itself.
    Completed,
    /// `max_analysis_ms` elapsed first.
    Deadline,
    /// Answered by `genmove`.
    BestMove,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Analysis {
    pub to_move: Stone,
    /// Ranked best first; may be empty if the engine only offered a pass.
    pub candidates: Vec<Candidate>,
    pub stop: StopReason,
    pub elapsed: Duration,
}

impl Analysis {
    pub fn leader(&self) -> Option<&Candidate> {
        self.candidates.first()
    }
}

enum Step {
    Cancelled,
    Deadline,
    Line(AssistResult<Line>),
}

pub struct EngineSession {
    config: EngineConfig,
    board_size: usize,
    launcher: Box<dyn EngineLauncher>,
    transport: Option<Box<dyn EngineTransport>>,
    state_tx: watch::Sender<SessionState>,
    /// Position the current process has been told about.
    synced: MoveHistory,
    last_fault: Option<Instant>,
    restarts: u32,
}

impl EngineSession {
    pub fn new(config: EngineConfig, board_size: usize, launcher: Box<dyn EngineLauncher>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Stopped);
        Self {
            config,
            board_size,
            launcher,
            transport: None,
            state_tx,
            synced: MoveHistory::new(board_size),
            last_fault: None,
            restarts: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "engine state");
        }
    }

    /// Launches the process and runs the handshake.
    pub async fn start(&mut self) -> AssistResult<()> {
        self.set_state(SessionState::Starting);
        self.synced.clear();
        match self.launcher.launch().await {
            Ok(transport) => self.transport = Some(transport),
            Err(e) => {
                return Err(self.fault(AssistError::EngineHandshakeFailed(format!("{:#}", e))));
            }
        }
        match self.handshake().await {
            Ok(version) => {
                info!(protocol = %version, size = self.board_size, "engine ready");
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    AssistError::EngineHandshakeFailed(_) => e,
                    other => AssistError::EngineHandshakeFailed(other.to_string()),
                };
                Err(self.fault(e))
            }
        }
    }

    async fn handshake(&mut self) -> AssistResult<String> {
        let limit = self.config.handshake_timeout();
        let version = self.command(&Command::ProtocolVersion, limit).await?;
        self.command(&Command::BoardSize(self.board_size), limit).await?;
        self.command(&Command::ClearBoard, limit).await?;
        Ok(version)
    }

    /// Drops the process and records the fault; returns the error for propagation.
    fn fault(&mut self, err: AssistError) -> AssistError {
        warn!("engine faulted: {}", err);
        self.transport = None;
        self.synced.clear();
        self.last_fault = Some(Instant::now());
        self.set_state(SessionState::Faulted);
        err
    }

    fn absorb<T>(&mut self, result: AssistResult<T>) -> AssistResult<T> {
        match result {
            Err(e) if e.is_engine_fault() => Err(self.fault(e)),
            other => other,
        }
    }

    async fn ensure_ready(&mut self) -> AssistResult<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            SessionState::Stopped | SessionState::Starting => self.start().await,
            SessionState::Faulted => {
                if let Some(at) = self.last_fault {
                    if at.elapsed() < self.config.restart_backoff() {
                        return Err(AssistError::EngineCrashed(
                            "engine restart is backing off".into(),
                        ));
                    }
                }
                self.restarts += 1;
                info!(attempt = self.restarts, "restarting engine");
                self.start().await
            }
            SessionState::Analyzing | SessionState::AwaitingResult => {
                // A previous analysis was dropped mid-stream.
                let result = self.finish_stream(0).await;
                self.absorb(result)
            }
        }
    }

    async fn send(&mut self, command: &Command) -> AssistResult<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| AssistError::EngineCrashed("no engine process".into()))?;
        let text = command.to_string();
        debug!(command = %text, "gtp >");
        transport
            .send_line(&text)
            .await
            .map_err(|e| AssistError::EngineCrashed(format!("write failed: {}", e)))
    }

    async fn read_line(&mut self, limit: Duration) -> AssistResult<Line> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| AssistError::EngineCrashed("no engine process".into()))?;
        match timeout(limit, transport.recv_line()).await {
            Err(_) => Err(AssistError::EngineTimeout("waiting for engine output".into())),
            Ok(Err(e)) => Err(AssistError::EngineCrashed(format!("read failed: {}", e))),
            Ok(Ok(None)) => Err(AssistError::EngineCrashed("engine process exited".into())),
            Ok(Ok(Some(line))) => Ok(gtp::classify(&line)),
        }
    }

    async fn drain_to_blank(&mut self, limit: Duration) -> AssistResult<()> {
        while self.read_line(limit).await? != Line::Blank {}
        Ok(())
    }

    /// Sends one command and returns the payload of its `=` reply.
    async fn command(&mut self, command: &Command, limit: Duration) -> AssistResult<String> {
        self.send(command).await?;
        let reply = loop {
            match self.read_line(limit).await? {
                Line::Success(payload) => break Ok(payload),
                Line::Failure(message) => break Err(message),
                Line::Blank | Line::Info(_) => {}
                Line::Other(text) => debug!(%text, "ignoring engine output"),
            }
        };
        self.drain_to_blank(limit).await?;
        reply.map_err(|message| {
            AssistError::EngineCrashed(format!("`{}` rejected: {}", command, message))
        })
    }

    /// Brings the process board in line with `history`: plays the missing
    /// tail, or clears and replays everything when the histories diverged.
    async fn sync_history(&mut self, history: &MoveHistory) -> AssistResult<()> {
        let limit = self.config.response_timeout();
        if !self.synced.is_prefix_of(history.moves()) {
            debug!(known = self.synced.len(), "engine board diverged, replaying history");
            self.command(&Command::ClearBoard, limit).await?;
            self.synced.clear();
        }
        for mv in &history.moves()[self.synced.len()..] {
            let play = Command::Play {
                stone: mv.stone,
                vertex: mv.pos.to_gtp(self.board_size),
            };
            self.command(&play, limit).await?;
        }
        self.synced = history.clone();
        Ok(())
    }

    /// Interrupts a running `kata-analyze` and waits for the acknowledgment.
    /// `unacked` is the number of `=` replies still owed for earlier commands.
    async fn finish_stream(&mut self, unacked: usize) -> AssistResult<()> {
        self.set_state(SessionState::AwaitingResult);
        let limit = self.config.response_timeout();
        self.send(&Command::ProtocolVersion).await?;
        let mut skip = unacked;
        loop {
            match self.read_line(limit).await? {
                Line::Success(_) if skip > 0 => skip -= 1,
                Line::Success(_) => break,
                Line::Failure(message) => {
                    return Err(AssistError::EngineCrashed(format!(
                        "cancellation refused: {}",
                        message
                    )));
                }
                _ => {}
            }
        }
        self.drain_to_blank(limit).await?;
        self.set_state(SessionState::Ready);
        Ok(())
    }

    /// Asks the engine for the side to move in `history`. Resolves early with
    /// `AnalysisAbandoned` when `cancel` completes first; the process is kept.
    pub async fn analyze<C>(&mut self, history: &MoveHistory, cancel: C) -> AssistResult<Analysis>
    where
        C: Future<Output = ()>,
    {
        debug_assert_eq!(history.size(), self.board_size);
        self.ensure_ready().await?;
        let result = match self.config.mode {
            SearchMode::Analyze => self.run_analysis(history, cancel).await,
            SearchMode::Genmove => self.run_genmove(history).await,
        };
        self.absorb(result)
    }

    /// Single `genmove` for the side to move, taken back afterwards.
    pub async fn best_move(&mut self, history: &MoveHistory) -> AssistResult<Analysis> {
        self.ensure_ready().await?;
        let result = self.run_genmove(history).await;
        self.absorb(result)
    }

    async fn run_analysis<C>(&mut self, history: &MoveHistory, cancel: C) -> AssistResult<Analysis>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        self.sync_history(history).await?;

        let to_move = history.next_color();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.max_analysis();
        let limit = self.config.response_timeout();
        self.send(&Command::KataAnalyze {
            stone: to_move,
            interval_cs: self.config.report_interval_cs,
        })
        .await?;
        self.set_state(SessionState::Analyzing);

        let mut acked = false;
        let mut candidates: Vec<Candidate> = Vec::new();
        let stop = loop {
            let step = tokio::select! {
                _ = &mut cancel => Step::Cancelled,
                _ = sleep_until(deadline) => Step::Deadline,
                line = self.read_line(limit) => Step::Line(line),
            };
            let line = match step {
                Step::Cancelled => {
                    debug!("analysis abandoned by requester");
                    self.finish_stream(usize::from(!acked)).await?;
                    return Err(AssistError::AnalysisAbandoned);
                }
                Step::Deadline => break StopReason::Deadline,
                Step::Line(line) => line?,
            };
            match line {
                Line::Success(_) => acked = true,
                Line::Failure(message) => {
                    return Err(AssistError::EngineCrashed(format!(
                        "analysis refused: {}",
                        message
                    )));
                }
                Line::Info(text) => {
                    let parsed = gtp::parse_analysis_line(&text, self.board_size)
                        .map_err(|e| AssistError::EngineCrashed(e.to_string()))?;
                    if !parsed.is_empty() {
                        candidates = parsed;
                    }
                    let threshold = self.config.visits_threshold;
                    if candidates.first().is_some_and(|c| c.visits >= threshold) {
                        break StopReason::VisitThreshold;
                    }
                }
                Line::Blank if acked => break StopReason::Completed,
                Line::Blank => {}
                Line::Other(text) => debug!(%text, "ignoring engine output"),
            }
        };

        match stop {
            StopReason::Completed => {
                self.set_state(SessionState::AwaitingResult);
                self.set_state(SessionState::Ready);
            }
            _ => self.finish_stream(usize::from(!acked)).await?,
        }

        candidates.truncate(self.config.max_candidates);
        let elapsed = started.elapsed();
        match candidates.first() {
            Some(leader) => info!(
                leader = %leader,
                stop = ?stop,
                elapsed_ms = elapsed.as_millis() as u64,
                "analysis finished"
            ),
            None => warn!(stop = ?stop, "analysis finished without candidates"),
        }
        Ok(Analysis {
            to_move,
            candidates,
            stop,
            elapsed,
        })
    }

    async fn run_genmove(&mut self, history: &MoveHistory) -> AssistResult<Analysis> {
        self.sync_history(history).await?;
        let to_move = history.next_color();
        let started = Instant::now();

        self.set_state(SessionState::Analyzing);
        let vertex = self
            .command(&Command::GenMove(to_move), self.config.max_analysis())
            .await?;
        self.set_state(SessionState::AwaitingResult);
        let pos = Pos::from_gtp(&vertex, self.board_size);
        // A board point or pass was played on the engine's board; take it
        // back. `resign` plays nothing, so there is nothing to undo.
        if pos.is_some() || vertex.trim().eq_ignore_ascii_case("pass") {
            self.command(&Command::Undo, self.config.response_timeout())
                .await?;
        } else {
            debug!(%vertex, "genmove played nothing, skipping undo");
        }
        self.set_state(SessionState::Ready);

        let candidates = match pos {
            Some(pos) => vec![Candidate {
                pos,
                gtp: vertex.to_ascii_uppercase(),
                visits: 0,
                winrate: None,
                order: 0,
                pv: Vec::new(),
            }],
            None => {
                warn!(%vertex, "engine offered no board move");
                Vec::new()
            }
        };
        Ok(Analysis {
            to_move,
            candidates,
            stop: StopReason::BestMove,
            elapsed: started.elapsed(),
        })
    }

    /// Sends `quit` and waits for the process to exit.
    pub async fn shutdown(&mut self) {
        if self.transport.is_some() {
            if matches!(
                self.state(),
                SessionState::Analyzing | SessionState::AwaitingResult
            ) {
                let _ = self.finish_stream(0).await;
            }
            let _ = self
                .command(&Command::Quit, self.config.response_timeout())
                .await;
            if let Some(mut transport) = self.transport.take() {
                transport.close().await;
            }
            info!("engine stopped");
        }
        self.synced.clear();
        self.set_state(SessionState::Stopped);
    }
}

// *************** Worker ***************

enum EngineRequest {
    Analyze {
        history: MoveHistory,
        reply: oneshot::Sender<AssistResult<Analysis>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Pending analysis. Dropping it cancels the work on the engine side.
pub struct AnalysisTicket {
    rx: oneshot::Receiver<AssistResult<Analysis>>,
}

impl AnalysisTicket {
    /// Non-blocking poll for the result.
    pub fn try_take(&mut self) -> Option<AssistResult<Analysis>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(AssistError::EngineCrashed(
                "engine worker dropped the request".into(),
            ))),
        }
    }

    pub async fn wait(self) -> AssistResult<Analysis> {
        self.rx.await.unwrap_or_else(|_| {
            Err(AssistError::EngineCrashed(
                "engine worker dropped the request".into(),
            ))
        })
    }
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    state: watch::Receiver<SessionState>,
}

impl EngineHandle {
    /// Moves the session onto its own task.
    pub fn spawn(session: EngineSession, queue_depth: usize) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let state = session.subscribe();
        let task = tokio::spawn(run_worker(session, rx));
        (EngineHandle { tx, state }, task)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn submit(&self, history: MoveHistory) -> AssistResult<AnalysisTicket> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(EngineRequest::Analyze { history, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    AssistError::EngineTimeout("engine request queue is full".into())
                }
                TrySendError::Closed(_) => {
                    AssistError::EngineCrashed("engine worker stopped".into())
                }
            })?;
        Ok(AnalysisTicket { rx })
    }

    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(EngineRequest::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_worker(mut session: EngineSession, mut rx: mpsc::Receiver<EngineRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            EngineRequest::Analyze { history, mut reply } => {
                if reply.is_closed() {
                    debug!("skipping analysis abandoned while queued");
                    continue;
                }
                let outcome = session.analyze(&history, reply.closed()).await;
                match &outcome {
                    Ok(_) | Err(AssistError::AnalysisAbandoned) => {}
                    Err(e) => warn!("analysis failed: {}", e),
                }
                let _ = reply.send(outcome);
            }
            EngineRequest::Shutdown { done } => {
                session.shutdown().await;
                let _ = done.send(());
                return;
            }
        }
    }
    session.shutdown().await;
}

// *************** Test engine ***************

/// In-process stand-in for the engine binary, speaking GTP over a duplex pipe.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::{DuplexStream, duplex, split};

    use super::*;

    #[derive(Clone, Debug)]
    pub(crate) struct Script {
        /// Vertices reported by analysis, best first.
        pub candidates: Vec<&'static str>,
        pub visit_step: u64,
        pub report_every: Duration,
        /// Analysis starts but never reports.
        pub silent: bool,
        pub reject_handshake: bool,
        /// Launch indices whose process exits as soon as analysis starts.
        pub crash_on_launch: Vec<usize>,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                candidates: vec!["J9", "G7", "K10"],
                visit_step: 10,
                report_every: Duration::from_millis(5),
                silent: false,
                reject_handshake: false,
                crash_on_launch: Vec::new(),
            }
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeLauncher {
        script: Arc<Mutex<Script>>,
        logs: Arc<Mutex<Vec<Arc<Mutex<Vec<String>>>>>>,
    }

    impl FakeLauncher {
        pub(crate) fn new(script: Script) -> Self {
            Self {
                script: Arc::new(Mutex::new(script)),
                logs: Arc::default(),
            }
        }

        pub(crate) fn launches(&self) -> usize {
            self.logs.lock().len()
        }

        /// Commands received by the process of the given launch.
        pub(crate) fn log(&self, launch: usize) -> Vec<String> {
            self.logs.lock()[launch].lock().clone()
        }

        pub(crate) fn set_script(&self, edit: impl FnOnce(&mut Script)) {
            edit(&mut self.script.lock());
        }
    }

    #[async_trait]
    impl EngineLauncher for FakeLauncher {
        async fn launch(&self) -> Result<Box<dyn EngineTransport>> {
            let (client, engine) = duplex(64 * 1024);
            let log = Arc::new(Mutex::new(Vec::new()));
            let index = {
                let mut logs = self.logs.lock();
                logs.push(log.clone());
                logs.len() - 1
            };
            tokio::spawn(serve(engine, self.script.clone(), log, index));
            let (read, write) = split(client);
            Ok(Box::new(LineTransport::new(BufReader::new(read), write, None)))
        }
    }

    fn info_line(script: &Script, visits: u64) -> String {
        let segments: Vec<String> = script
            .candidates
            .iter()
            .enumerate()
            .map(|(rank, mv)| {
                format!(
                    "info move {} visits {} winrate {:.2} order {} pv {}",
                    mv,
                    visits / (rank as u64 + 1),
                    0.55 - rank as f32 * 0.05,
                    rank,
                    mv
                )
            })
            .collect();
        format!("{}\n", segments.join(" "))
    }

    async fn serve(
        stream: DuplexStream,
        script: Arc<Mutex<Script>>,
        log: Arc<Mutex<Vec<String>>>,
        index: usize,
    ) {
        let (read, mut write) = split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut pending: Option<String> = None;
        loop {
            let line = match pending.take() {
                Some(line) => line,
                None => match lines.next_line().await {
                    Ok(Some(line)) => line,
                    _ => return,
                },
            };
            let command = line.trim().to_string();
            if command.is_empty() {
                continue;
            }
            log.lock().push(command.clone());
            let current = script.lock().clone();

            let reply = match command.split_whitespace().next().unwrap_or_default() {
                "protocol_version" if current.reject_handshake => "? not today".to_string(),
                "protocol_version" => "= 2".to_string(),
                "boardsize" | "clear_board" | "play" | "undo" => "=".to_string(),
                "genmove" => format!("= {}", current.candidates[0]),
                "quit" => {
                    let _ = write.write_all(b"=\n\n").await;
                    return;
                }
                "kata-analyze" => {
                    if write.write_all(b"=\n").await.is_err() {
                        return;
                    }
                    if current.crash_on_launch.contains(&index) {
                        let _ = write
                            .write_all(info_line(&current, current.visit_step).as_bytes())
                            .await;
                        return;
                    }
                    let mut visits = 0;
                    let mut ticker = tokio::time::interval(current.report_every);
                    loop {
                        let interrupt = tokio::select! {
                            next = lines.next_line() => Some(next),
                            _ = ticker.tick(), if !current.silent => None,
                        };
                        match interrupt {
                            Some(next) => {
                                let _ = write.write_all(b"\n").await;
                                match next {
                                    Ok(Some(line)) => {
                                        pending = Some(line);
                                        break;
                                    }
                                    _ => return,
                                }
                            }
                            None => {
                                visits += current.visit_step;
                                let report = info_line(&current, visits);
                                if write.write_all(report.as_bytes()).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    continue;
                }
                _ => "? unknown command".to_string(),
            };
            if write.write_all(format!("{}\n\n", reply).as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeLauncher, Script};
    use super::*;
    use std::future::pending;

    fn test_config() -> EngineConfig {
        EngineConfig {
            visits_threshold: 50,
            handshake_timeout_ms: 1_000,
            response_timeout_ms: 1_000,
            max_analysis_ms: 5_000,
            restart_backoff_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn history_of(points: &[(usize, usize)]) -> MoveHistory {
        let mut history = MoveHistory::new(15);
        for &(row, col) in points {
            let stone = history.next_color();
            history.push(Pos::new(row, col), stone).unwrap();
        }
        history
    }

    fn session(config: EngineConfig, launcher: &FakeLauncher) -> EngineSession {
        EngineSession::new(config, 15, Box::new(launcher.clone()))
    }

    #[tokio::test]
    async fn test_handshake_then_analysis_stops_at_threshold() {
        let launcher = FakeLauncher::new(Script::default());
        let mut session = session(test_config(), &launcher);
        assert_eq!(session.state(), SessionState::Stopped);

        let analysis = session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        assert_eq!(analysis.stop, StopReason::VisitThreshold);
        assert_eq!(analysis.to_move, Stone::White);
        let leader = analysis.leader().unwrap();
        assert_eq!(leader.gtp, "J9");
        assert!(leader.visits >= 50);
        assert_eq!(analysis.candidates.len(), 3);
        assert_eq!(session.state(), SessionState::Ready);

        let log = launcher.log(0);
        assert_eq!(
            &log[..5],
            ["protocol_version", "boardsize 15", "clear_board", "play B H8", "kata-analyze W 10"]
        );
        // Cancellation sentinel, not a kill.
        assert_eq!(log.last().map(String::as_str), Some("protocol_version"));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_crash_mid_analysis_faults_then_replays_history() {
        let launcher = FakeLauncher::new(Script {
            crash_on_launch: vec![0],
            ..Script::default()
        });
        let mut session = session(test_config(), &launcher);
        let history = history_of(&[(7, 7), (6, 8)]);

        let err = session.analyze(&history, pending()).await.unwrap_err();
        assert!(matches!(err, AssistError::EngineCrashed(_)));
        assert_eq!(session.state(), SessionState::Faulted);

        let analysis = session.analyze(&history, pending()).await.unwrap();
        assert_eq!(analysis.to_move, Stone::Black);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(
            &launcher.log(1)[..6],
            [
                "protocol_version",
                "boardsize 15",
                "clear_board",
                "play B H8",
                "play W J9",
                "kata-analyze B 10"
            ]
        );
    }

    #[tokio::test]
    async fn test_restart_respects_backoff() {
        let launcher = FakeLauncher::new(Script {
            crash_on_launch: vec![0],
            ..Script::default()
        });
        let config = EngineConfig {
            restart_backoff_ms: 60_000,
            ..test_config()
        };
        let mut session = session(config, &launcher);
        let history = history_of(&[(7, 7)]);
        assert!(session.analyze(&history, pending()).await.is_err());
        let err = session.analyze(&history, pending()).await.unwrap_err();
        assert!(err.to_string().contains("backing off"));
        assert_eq!(launcher.launches(), 1);
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_cancel_keeps_process_reusable() {
        let launcher = FakeLauncher::new(Script {
            silent: true,
            ..Script::default()
        });
        let mut session = session(test_config(), &launcher);
        let history = history_of(&[(7, 7)]);

        let err = session
            .analyze(&history, tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(err, AssistError::AnalysisAbandoned);
        assert_eq!(session.state(), SessionState::Ready);

        launcher.set_script(|s| s.silent = false);
        let analysis = session.analyze(&history, pending()).await.unwrap();
        assert_eq!(analysis.stop, StopReason::VisitThreshold);
        assert_eq!(launcher.launches(), 1);
        assert_eq!(
            launcher.log(0)[4..],
            [
                "kata-analyze W 10",
                "protocol_version",
                "kata-analyze W 10",
                "protocol_version"
            ]
        );
    }

    #[tokio::test]
    async fn test_handshake_rejection() {
        let launcher = FakeLauncher::new(Script {
            reject_handshake: true,
            ..Script::default()
        });
        let mut session = session(test_config(), &launcher);
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, AssistError::EngineHandshakeFailed(_)));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_diverged_history_is_replayed_from_scratch() {
        let launcher = FakeLauncher::new(Script::default());
        let mut session = session(test_config(), &launcher);
        session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        session
            .analyze(&history_of(&[(0, 0)]), pending())
            .await
            .unwrap();
        let log = launcher.log(0);
        let second_clear = log.iter().rposition(|c| c == "clear_board").unwrap();
        assert!(second_clear > 2);
        assert_eq!(log[second_clear + 1], "play B A15");
    }

    #[tokio::test]
    async fn test_extended_history_only_plays_new_moves() {
        let launcher = FakeLauncher::new(Script::default());
        let mut session = session(test_config(), &launcher);
        session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        session
            .analyze(&history_of(&[(7, 7), (6, 8)]), pending())
            .await
            .unwrap();
        let log = launcher.log(0);
        assert_eq!(log.iter().filter(|c| *c == "clear_board").count(), 1);
        assert_eq!(log.iter().filter(|c| *c == "play B H8").count(), 1);
        assert!(log.contains(&"play W J9".to_string()));
    }

    #[tokio::test]
    async fn test_deadline_returns_best_so_far() {
        let launcher = FakeLauncher::new(Script::default());
        let config = EngineConfig {
            visits_threshold: 1_000_000,
            max_analysis_ms: 100,
            ..test_config()
        };
        let mut session = session(config, &launcher);
        let analysis = session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        assert_eq!(analysis.stop, StopReason::Deadline);
        assert!(!analysis.candidates.is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_genmove_mode_takes_move_back() {
        let launcher = FakeLauncher::new(Script::default());
        let config = EngineConfig {
            mode: SearchMode::Genmove,
            ..test_config()
        };
        let mut session = session(config, &launcher);
        let analysis = session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        assert_eq!(analysis.stop, StopReason::BestMove);
        assert_eq!(analysis.leader().unwrap().pos, Pos::new(6, 8));
        let log = launcher.log(0);
        assert_eq!(log[log.len() - 2..], ["genmove W", "undo"]);
    }

    #[tokio::test]
    async fn test_genmove_resign_skips_undo() {
        let launcher = FakeLauncher::new(Script {
            candidates: vec!["resign"],
            ..Script::default()
        });
        let config = EngineConfig {
            mode: SearchMode::Genmove,
            ..test_config()
        };
        let mut session = session(config, &launcher);
        let analysis = session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        assert!(analysis.candidates.is_empty());
        assert_eq!(session.state(), SessionState::Ready);

        launcher.set_script(|s| s.candidates = vec!["K10"]);
        let analysis = session
            .analyze(&history_of(&[(7, 7), (6, 8), (6, 6)]), pending())
            .await
            .unwrap();
        assert_eq!(analysis.leader().unwrap().gtp, "K10");
        assert_eq!(
            launcher.log(0),
            [
                "protocol_version",
                "boardsize 15",
                "clear_board",
                "play B H8",
                "genmove W",
                "play W J9",
                "play B G9",
                "genmove W",
                "undo"
            ]
        );
    }

    #[tokio::test]
    async fn test_genmove_pass_is_taken_back() {
        let launcher = FakeLauncher::new(Script {
            candidates: vec!["pass"],
            ..Script::default()
        });
        let config = EngineConfig {
            mode: SearchMode::Genmove,
            ..test_config()
        };
        let mut session = session(config, &launcher);
        let analysis = session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap();
        assert!(analysis.candidates.is_empty());
        let log = launcher.log(0);
        assert_eq!(log[log.len() - 2..], ["genmove W", "undo"]);
    }

    #[tokio::test]
    async fn test_unresponsive_engine_times_out_then_restarts() {
        let launcher = FakeLauncher::new(Script {
            silent: true,
            ..Script::default()
        });
        let config = EngineConfig {
            response_timeout_ms: 100,
            ..test_config()
        };
        let mut session = session(config, &launcher);
        let history = history_of(&[(7, 7), (6, 8)]);

        let err = session.analyze(&history, pending()).await.unwrap_err();
        assert!(matches!(err, AssistError::EngineTimeout(_)));
        assert_eq!(session.state(), SessionState::Faulted);

        launcher.set_script(|s| s.silent = false);
        let analysis = session.analyze(&history, pending()).await.unwrap();
        assert_eq!(analysis.stop, StopReason::VisitThreshold);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(
            &launcher.log(1)[..6],
            [
                "protocol_version",
                "boardsize 15",
                "clear_board",
                "play B H8",
                "play W J9",
                "kata-analyze B 10"
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_report_faults_session() {
        let launcher = FakeLauncher::new(Script {
            candidates: vec!["Z99"],
            ..Script::default()
        });
        let mut session = session(test_config(), &launcher);

        let err = session
            .analyze(&history_of(&[(7, 7)]), pending())
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::EngineCrashed(_)));
        assert!(err.to_string().contains("Z99"));
        assert_eq!(session.state(), SessionState::Faulted);
    }

    #[tokio::test]
    async fn test_best_move_on_empty_board() {
        let launcher = FakeLauncher::new(Script::default());
        let mut session = session(test_config(), &launcher);
        let analysis = session.best_move(&history_of(&[])).await.unwrap();
        assert_eq!(analysis.to_move, Stone::Black);
        assert_eq!(analysis.leader().unwrap().gtp, "J9");
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_handle_runs_requests_and_cancels_dropped_tickets() {
        let launcher = FakeLauncher::new(Script::default());
        let (handle, _task) = EngineHandle::spawn(session(test_config(), &launcher), 2);
        let history = history_of(&[(7, 7)]);

        let analysis = handle.submit(history.clone()).unwrap().wait().await.unwrap();
        assert_eq!(analysis.leader().unwrap().gtp, "J9");

        launcher.set_script(|s| s.silent = true);
        let ticket = handle.submit(history.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(ticket);

        launcher.set_script(|s| s.silent = false);
        let mut ticket = handle.submit(history).unwrap();
        let analysis = loop {
            if let Some(outcome) = ticket.try_take() {
                break outcome.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(analysis.stop, StopReason::VisitThreshold);
        assert_eq!(launcher.launches(), 1);

        handle.shutdown().await;
        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(launcher.log(0).last().map(String::as_str), Some("quit"));
    }
}
