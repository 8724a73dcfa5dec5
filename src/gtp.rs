//! GTP wire format: command text, reply classification and `kata-analyze`
//! info lines. Replies start with `=` (success) or `?` (failure), optionally
//! followed by a numeric id, and end with a blank line.

use std::fmt;

use crate::board::{Pos, Stone};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ProtocolVersion,
    BoardSize(usize),
    ClearBoard,
    Play { stone: Stone, vertex: String },
    Undo,
    GenMove(Stone),
    KataAnalyze { stone: Stone, interval_cs: u32 },
    Quit,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ProtocolVersion => write!(f, "protocol_version"),
            Command::BoardSize(n) => write!(f, "boardsize {}", n),
            Command::ClearBoard => write!(f, "clear_board"),
            Command::Play { stone, vertex } => write!(f, "play {} {}", stone.gtp(), vertex),
            Command::Undo => write!(f, "undo"),
            Command::GenMove(stone) => write!(f, "genmove {}", stone.gtp()),
            Command::KataAnalyze { stone, interval_cs } => {
                write!(f, "kata-analyze {} {}", stone.gtp(), interval_cs)
            }
            Command::Quit => write!(f, "quit"),
        }
    }
}

/// One line read from the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Line {
    Blank,
    Success(String),
    Failure(String),
    Info(String),
    Other(String),
}

pub fn classify(raw: &str) -> Line {
    let line = raw.trim();
    if line.is_empty() {
        return Line::Blank;
    }
    if let Some(rest) = line.strip_prefix('=') {
        return Line::Success(strip_id(rest));
    }
    if let Some(rest) = line.strip_prefix('?') {
        return Line::Failure(strip_id(rest));
    }
    if line.starts_with("info ") {
        return Line::Info(line.to_string());
    }
    Line::Other(line.to_string())
}

fn strip_id(rest: &str) -> String {
    rest.trim_start_matches(|c: char| c.is_ascii_digit())
        .trim()
        .to_string()
}

/// One candidate from an analysis report.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub pos: Pos,
    pub gtp: String,
    pub visits: u64,
    pub winrate: Option<f32>,
    pub order: usize,
    pub pv: Vec<String>,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.winrate {
            Some(w) => write!(f, "{} v{} {:.1}%", self.gtp, self.visits, w * 100.0),
            None => write!(f, "{} v{}", self.gtp, self.visits),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedLine(pub String);

impl fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed analysis line: {}", self.0)
    }
}

const LIST_KEYS: [&str; 3] = ["pv", "pvVisits", "pvEdgeVisits"];

/// Parses one `info move .. visits .. winrate .. order .. pv ..` line, which
/// may hold several `info` segments. Passes are dropped; the result is
/// ordered by the engine's ranking.
pub fn parse_analysis_line(line: &str, size: usize) -> Result<Vec<Candidate>, MalformedLine> {
    let mut candidates = Vec::new();
    for segment in line.split("info ").map(str::trim).filter(|s| !s.is_empty()) {
        let tokens: Vec<&str> = segment.split_whitespace().collect();
        let mut mv = None;
        let mut visits = None;
        let mut winrate = None;
        let mut order = None;
        let mut pv = Vec::new();

        let mut i = 0;
        while i < tokens.len() {
            let key = tokens[i];
            if LIST_KEYS.contains(&key) {
                let mut j = i + 1;
                while j < tokens.len() && !tokens[j].chars().all(|c| c.is_ascii_alphabetic()) {
                    j += 1;
                }
                if key == "pv" {
                    pv = tokens[i + 1..j].iter().map(|s| s.to_string()).collect();
                }
                i = j;
                continue;
            }
            let value = tokens.get(i + 1).copied();
            match key {
                "move" => mv = value,
                "visits" => visits = value.and_then(|v| v.parse::<u64>().ok()),
                "winrate" => winrate = value.and_then(|v| v.parse::<f32>().ok()),
                "order" => order = value.and_then(|v| v.parse::<usize>().ok()),
                _ => {}
            }
            i += 2;
        }

        let mv = mv.ok_or_else(|| MalformedLine(segment.to_string()))?;
        let visits = visits.ok_or_else(|| MalformedLine(segment.to_string()))?;
        if mv.eq_ignore_ascii_case("pass") {
            continue;
        }
        let pos = Pos::from_gtp(mv, size).ok_or_else(|| MalformedLine(segment.to_string()))?;
        candidates.push(Candidate {
            pos,
            gtp: mv.to_ascii_uppercase(),
            visits,
            winrate,
            order: order.unwrap_or(candidates.len()),
            pv,
        });
    }
    candidates.sort_by(|a, b| a.order.cmp(&b.order).then(b.visits.cmp(&a.visits)));
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_text() {
        assert_eq!(Command::BoardSize(15).to_string(), "boardsize 15");
        assert_eq!(
            Command::Play {
                stone: Stone::White,
                vertex: "H8".into()
            }
            .to_string(),
            "play W H8"
        );
        assert_eq!(
            Command::KataAnalyze {
                stone: Stone::Black,
                interval_cs: 10
            }
            .to_string(),
            "kata-analyze B 10"
        );
    }

    #[test]
    fn test_classify_replies() {
        assert_eq!(classify("= 2"), Line::Success("2".into()));
        assert_eq!(classify("="), Line::Success(String::new()));
        assert_eq!(classify("=7 H8"), Line::Success("H8".into()));
        assert_eq!(classify("? unknown command"), Line::Failure("unknown command".into()));
        assert_eq!(classify("   "), Line::Blank);
        assert!(matches!(classify("info move H8 visits 3"), Line::Info(_)));
        assert!(matches!(classify("KataGo v1.15"), Line::Other(_)));
    }

    #[test]
    fn test_parse_multi_candidate_line() {
        let line = "info move H8 visits 120 utility 0.1 winrate 0.56 order 0 pv H8 J9 G7 \
                    info move J9 visits 40 winrate 0.51 order 1 pv J9 H8 \
                    info move pass visits 2 winrate 0.1 order 2 pv pass";
        let candidates = parse_analysis_line(line, 15).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].gtp, "H8");
        assert_eq!(candidates[0].pos, Pos::new(7, 7));
        assert_eq!(candidates[0].visits, 120);
        assert_eq!(candidates[0].pv, vec!["H8", "J9", "G7"]);
        assert_eq!(candidates[1].order, 1);
        assert!((candidates[1].winrate.unwrap() - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_parse_orders_by_rank() {
        let line = "info move A1 visits 5 order 1 pv A1 info move B2 visits 3 order 0 pv B2";
        let candidates = parse_analysis_line(line, 15).unwrap();
        assert_eq!(candidates[0].gtp, "B2");
    }

    #[test]
    fn test_parse_pv_visits_list_is_skipped() {
        let line = "info move H8 visits 10 order 0 pv H8 J9 pvVisits 10 4 winrate 0.6";
        let candidates = parse_analysis_line(line, 15).unwrap();
        assert_eq!(candidates[0].pv, vec!["H8", "J9"]);
        assert!((candidates[0].winrate.unwrap() - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_parse_rejects_missing_visits() {
        assert!(parse_analysis_line("info move H8 winrate 0.5", 15).is_err());
        assert!(parse_analysis_line("info move Z99 visits 3", 15).is_err());
    }
}
