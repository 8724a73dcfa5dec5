//! Console output (Step 5 in architecture).
//! Prints the board and the current advice whenever the game or the status changes.

use std::fmt::Write as _;

use tokio::sync::watch;

use crate::scheduler::{Snapshot, Status};

pub struct ConsoleReport {
    last: Option<(usize, Status)>,
}

impl ConsoleReport {
    pub fn new() -> Self {
        Self { last: None }
    }

    /// Runs until the scheduler drops its sender.
    pub async fn run(mut self, mut rx: watch::Receiver<Snapshot>) {
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if let Some(text) = self.update(&snapshot) {
                println!("{}", text);
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Rendered text when the snapshot differs from the last one printed.
    /// Engine state and cache counters alone do not trigger output.
    fn update(&mut self, snapshot: &Snapshot) -> Option<String> {
        let key = (snapshot.moves, snapshot.status.clone());
        if self.last.as_ref() == Some(&key) {
            return None;
        }
        self.last = Some(key);
        Some(render(snapshot))
    }
}

impl Default for ConsoleReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn render(snapshot: &Snapshot) -> String {
    let mut out = String::new();
    let size = snapshot.board.size();
    let _ = write!(out, "{}", snapshot.board);
    match snapshot.last_move {
        Some(mv) => {
            let _ = writeln!(
                out,
                "Move {}: {} {}, {} to play",
                snapshot.moves,
                mv.stone,
                mv.pos.to_gtp(size),
                snapshot.to_move
            );
        }
        None => {
            let _ = writeln!(out, "No moves yet, {} to play", snapshot.to_move);
        }
    }
    let _ = writeln!(out, "Status: {}", snapshot.status);
    if let Status::Suggestion(suggestion) = &snapshot.status {
        if !suggestion.pv.is_empty() {
            let _ = writeln!(out, "Line: {}", suggestion.pv.join(" "));
        }
    }
    let _ = write!(
        out,
        "Engine: {} | Manual hit rate: {:.0}% ({} hits, {} misses)",
        snapshot.engine,
        snapshot.cache.hit_rate() * 100.0,
        snapshot.cache.hits,
        snapshot.cache.misses
    );
    out
}
