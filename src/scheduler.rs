//! Scheduler module (Step 4 in architecture).
//! Polls frames, reconciles the stable board with the move history and decides
//! what to show: a cached move, an engine analysis, or a status explaining why
//! there is none. The scheduler is the only writer of the move history; other
//! components see copies through `Snapshot`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, info, warn};

use crate::board::{BoardState, Cell, Move, MoveHistory, Pos, Stone};
use crate::cache::{CacheStats, ChessManualEntry, ChessManualStore};
use crate::capture::{Frame, FrameSource};
use crate::config::{BoardConfig, Config, RuleMode, SchedulerConfig};
use crate::engine::{Analysis, AnalysisTicket, EngineHandle, SessionState};
use crate::error::{AssistError, AssistResult};
use crate::fingerprint::Fingerprint;
use crate::gtp::Candidate;
use crate::recognizer::{BoardRecognizer, Observation};
use crate::rules;

#[derive(Clone, Debug, PartialEq)]
pub struct Suggestion {
    pub stone: Stone,
    pub pos: Pos,
    pub gtp: String,
    pub visits: u64,
    pub winrate: Option<f32>,
    /// Principal variation from the engine; empty for manual hits.
    pub pv: Vec<String>,
    pub from_cache: bool,
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({} visits", self.stone, self.gtp, self.visits)?;
        if let Some(w) = self.winrate {
            write!(f, ", winrate {:.1}%", w * 100.0)?;
        }
        write!(f, ")")?;
        if self.from_cache {
            write!(f, " [manual]")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Status {
    /// Nothing to advise yet, or the side to move is not advised.
    Waiting,
    Analyzing,
    Suggestion(Suggestion),
    Ambiguous { unknown: usize },
    Inconsistent { changed: usize },
    /// Engine could not answer; retried on a later cycle.
    Unavailable(String),
    /// Every candidate broke a rule, or the engine only offered a pass.
    Rejected(String),
    CaptureFailed(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Waiting => write!(f, "waiting"),
            Status::Analyzing => write!(f, "analyzing..."),
            Status::Suggestion(s) => write!(f, "suggest {}", s),
            Status::Ambiguous { unknown } => write!(f, "board unclear ({} unknown cells)", unknown),
            Status::Inconsistent { changed } => {
                write!(f, "board does not follow the game ({} cells differ)", changed)
            }
            Status::Unavailable(reason) => write!(f, "engine unavailable: {}", reason),
            Status::Rejected(reason) => write!(f, "no valid move: {}", reason),
            Status::CaptureFailed(reason) => write!(f, "capture failed: {}", reason),
        }
    }
}

/// Read-only view published after every cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub board: BoardState,
    pub moves: usize,
    pub last_move: Option<Move>,
    pub to_move: Stone,
    pub status: Status,
    pub engine: SessionState,
    pub cache: CacheStats,
}

/// What an outstanding analysis was asked about.
struct Request {
    fingerprint: Fingerprint,
    board: BoardState,
    to_move: Stone,
}

struct Pending {
    ticket: AnalysisTicket,
    request: Request,
}

pub struct Scheduler {
    recognizer: BoardRecognizer,
    history: MoveHistory,
    cache: Arc<ChessManualStore>,
    engine: EngineHandle,
    rule: RuleMode,
    config: SchedulerConfig,
    flush_every: usize,
    pending: Option<Pending>,
    /// Position the current status was decided for.
    decided: Option<Fingerprint>,
    inconsistent: u32,
    /// Outcome of the last decision, restored once the board reads cleanly again.
    decision: Status,
    status: Status,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl Scheduler {
    pub fn new(config: &Config, cache: Arc<ChessManualStore>, engine: EngineHandle) -> Self {
        let history = MoveHistory::new(config.board.grid_size);
        let initial = Snapshot {
            board: history.board().clone(),
            moves: 0,
            last_move: None,
            to_move: history.next_color(),
            status: Status::Waiting,
            engine: engine.state(),
            cache: cache.stats(),
        };
        let (snapshot_tx, _) = watch::channel(initial);
        Self {
            recognizer: BoardRecognizer::new(config.board.clone()),
            history,
            cache,
            engine,
            rule: config.board.rule,
            config: config.scheduler.clone(),
            flush_every: config.cache.flush_every,
            pending: None,
            decided: None,
            inconsistent: 0,
            decision: Status::Waiting,
            status: Status::Waiting,
            snapshot_tx,
        }
    }

    pub fn board_config(&self) -> &BoardConfig {
        self.recognizer.config()
    }

    pub fn history(&self) -> &MoveHistory {
        &self.history
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            board: self.history.board().clone(),
            moves: self.history.len(),
            last_move: self.history.last().copied(),
            to_move: self.history.next_color(),
            status: self.status.clone(),
            engine: self.engine.state(),
            cache: self.cache.stats(),
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// One decision cycle over an already captured frame.
    pub fn tick(&mut self, frame: &Frame) -> Status {
        self.collect_pending();

        match self.recognizer.observe(frame) {
            Err(e) => {
                warn!("{}", e);
                self.status = Status::CaptureFailed(e.to_string());
            }
            Ok(Observation::Ambiguous { unknown }) => {
                debug!("{}", AssistError::RecognitionAmbiguous { unknown });
                self.status = Status::Ambiguous { unknown };
            }
            Ok(Observation::Pending) => {}
            Ok(Observation::Stable { board, .. }) => match self.reconcile(&board) {
                Ok(_) => {
                    if self.decided.as_ref() != Some(&Fingerprint::of(self.history.board())) {
                        self.decide();
                    } else {
                        self.status = self.decision.clone();
                    }
                }
                Err(e) => {
                    if self.inconsistent == 1 {
                        warn!("{}", e);
                    } else {
                        debug!(streak = self.inconsistent, "{}", e);
                    }
                    if let AssistError::RecognitionInconsistent { changed } = e {
                        self.status = Status::Inconsistent { changed };
                    }
                }
            },
        }

        self.publish();
        self.status.clone()
    }

    /// Applies a stable board to the history. Ok(true) when the history changed.
    fn reconcile(&mut self, board: &BoardState) -> AssistResult<bool> {
        let current = self.history.board();
        if board == current {
            self.inconsistent = 0;
            return Ok(false);
        }
        let changes = current.diff(board);

        if let [change] = changes.as_slice() {
            let expected = self.history.next_color();
            if change.before == Cell::Empty && change.after.stone() == Some(expected) {
                if let Ok(mv) = self.history.push(change.pos, expected) {
                    info!(
                        index = mv.index,
                        stone = %mv.stone,
                        vertex = %mv.pos.to_gtp(self.history.size()),
                        "move played"
                    );
                    self.inconsistent = 0;
                    return Ok(true);
                }
            }
        }

        if board.is_blank() {
            info!(previous_moves = self.history.len(), "board cleared, new game");
            self.history.clear();
            self.inconsistent = 0;
            return Ok(true);
        }

        if let Some(len) = (0..self.history.len())
            .rev()
            .find(|&len| self.history.replay_board(len) == *board)
        {
            info!(from = self.history.len(), to = len, "takeback");
            self.history.truncate(len);
            self.inconsistent = 0;
            return Ok(true);
        }

        if self.history.is_empty() {
            if let Some(rebuilt) = MoveHistory::rebuild_from(board) {
                info!(stones = board.stone_count(), "adopted position already on the board");
                self.history = rebuilt;
                self.inconsistent = 0;
                return Ok(true);
            }
        }

        self.inconsistent += 1;
        if self.inconsistent >= self.config.resync_after {
            if let Some(rebuilt) = MoveHistory::rebuild_from(board) {
                warn!(
                    streak = self.inconsistent,
                    "board keeps disagreeing with the game record, resyncing from the board"
                );
                self.history = rebuilt;
                self.inconsistent = 0;
                return Ok(true);
            }
        }
        Err(AssistError::RecognitionInconsistent {
            changed: changes.len(),
        })
    }

    fn set_decision(&mut self, status: Status) {
        self.decision = status.clone();
        self.status = status;
    }

    /// Looks the current position up, or hands it to the engine.
    fn decide(&mut self) {
        // Dropping the ticket cancels a stale analysis.
        self.pending = None;
        let board = self.history.board().clone();
        let fingerprint = Fingerprint::of(&board);
        let to_move = self.history.next_color();
        self.decided = Some(fingerprint.clone());

        if !self.config.advise.covers(to_move) {
            debug!(side = %to_move, "side not advised");
            self.set_decision(Status::Waiting);
            return;
        }

        if let Some(entry) = self.cache.lookup(&fingerprint) {
            match rules::check_move(&board, entry.recommended, to_move, self.rule) {
                Ok(()) => {
                    debug!(fingerprint = %fingerprint, "chess manual hit");
                    self.set_decision(Status::Suggestion(Suggestion {
                        stone: to_move,
                        pos: entry.recommended,
                        gtp: entry.gtp,
                        visits: entry.visits,
                        winrate: entry.winrate,
                        pv: Vec::new(),
                        from_cache: true,
                    }));
                    return;
                }
                Err(reason) => warn!(%reason, "cached move no longer valid, asking the engine"),
            }
        }

        match self.engine.submit(self.history.clone()) {
            Ok(ticket) => {
                self.pending = Some(Pending {
                    ticket,
                    request: Request {
                        fingerprint,
                        board,
                        to_move,
                    },
                });
                self.set_decision(Status::Analyzing);
            }
            Err(e) => {
                warn!("could not submit analysis: {}", e);
                self.decided = None;
                self.set_decision(Status::Unavailable(e.to_string()));
            }
        }
    }

    fn collect_pending(&mut self) {
        let outcome = match self.pending.as_mut() {
            Some(pending) => pending.ticket.try_take(),
            None => return,
        };
        if let Some(outcome) = outcome {
            if let Some(pending) = self.pending.take() {
                self.apply_result(pending.request, outcome);
            }
        }
    }

    /// Waits for the outstanding analysis, if any, and applies it.
    pub async fn await_pending(&mut self) -> Option<Status> {
        let Pending { ticket, request } = self.pending.take()?;
        let outcome = ticket.wait().await;
        self.apply_result(request, outcome);
        self.publish();
        Some(self.status.clone())
    }

    fn apply_result(&mut self, request: Request, outcome: AssistResult<Analysis>) {
        if Fingerprint::of(self.history.board()) != request.fingerprint {
            debug!("discarding analysis for a position no longer on the board");
            return;
        }
        let analysis = match outcome {
            Ok(analysis) => analysis,
            Err(AssistError::AnalysisAbandoned) => return,
            Err(e) => {
                self.decided = None;
                self.set_decision(Status::Unavailable(e.to_string()));
                return;
            }
        };
        match self.select(&request, &analysis) {
            Ok(candidate) => {
                self.cache.insert(ChessManualEntry {
                    fingerprint: request.fingerprint,
                    recommended: candidate.pos,
                    gtp: candidate.gtp.clone(),
                    visits: candidate.visits,
                    winrate: candidate.winrate,
                    created: Utc::now(),
                });
                self.maybe_flush();
                self.set_decision(Status::Suggestion(Suggestion {
                    stone: request.to_move,
                    pos: candidate.pos,
                    gtp: candidate.gtp,
                    visits: candidate.visits,
                    winrate: candidate.winrate,
                    pv: candidate.pv,
                    from_cache: false,
                }));
            }
            Err(reason) => {
                warn!("no usable candidate: {}", reason);
                self.set_decision(Status::Rejected(reason));
            }
        }
    }

    /// First ranked candidate that passes the rule check.
    fn select(&self, request: &Request, analysis: &Analysis) -> Result<Candidate, String> {
        let mut first_violation = None;
        for candidate in &analysis.candidates {
            match rules::check_move(&request.board, candidate.pos, request.to_move, self.rule) {
                Ok(()) => return Ok(candidate.clone()),
                Err(reason) => {
                    debug!(candidate = %candidate, %reason, "candidate rejected");
                    first_violation.get_or_insert(AssistError::RuleViolation {
                        pos: candidate.pos,
                        reason,
                    });
                }
            }
        }
        Err(match first_violation {
            Some(violation) => violation.to_string(),
            None => "engine offered no board move".to_string(),
        })
    }

    fn maybe_flush(&self) {
        if self.flush_every > 0 && self.cache.unflushed() >= self.flush_every {
            if let Err(e) = self.cache.flush() {
                warn!("Failed to flush chess manual: {:#}", e);
            }
        }
    }

    /// Polls `source` every `poll_interval_ms` until `shutdown` resolves.
    pub async fn run<F>(&mut self, source: Box<dyn FrameSource>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let source = Arc::new(Mutex::new(source));
        let mut ticker = interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(interval_ms = self.config.poll_interval_ms, "polling started");

        loop {
            let stop = tokio::select! {
                _ = &mut shutdown => true,
                _ = ticker.tick() => false,
            };
            if stop {
                info!("polling stopped");
                break;
            }
            match self.capture(&source).await {
                Ok(frame) => {
                    self.tick(&frame);
                }
                Err(e) => {
                    warn!("{:#}", e);
                    self.status = Status::CaptureFailed(format!("{:#}", e));
                    self.publish();
                }
            }
        }
        Ok(())
    }

    async fn capture(&self, source: &Arc<Mutex<Box<dyn FrameSource>>>) -> Result<Frame> {
        let source = source.clone();
        let job = tokio::task::spawn_blocking(move || source.lock().capture());
        match timeout(self.config.capture_timeout(), job).await {
            Err(_) => bail!(
                "Capture timed out after {} ms",
                self.config.capture_timeout_ms
            ),
            Ok(joined) => joined.context("Capture task panicked")?,
        }
    }
}
