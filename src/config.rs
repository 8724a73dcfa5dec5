//! Config module.
//! Manages I/O for gomoku_config.json (board geometry, thresholds, engine, cache, loop timing).
//! Uses serde for JSON serialization; every field has a default.
//! Auto-generates the default file if missing.
//! `validate` rejects inconsistent geometry before anything starts.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::board::{DEFAULT_BOARD_SIZE, MAX_BOARD_SIZE, Stone};
use crate::error::AssistError;

pub const DEFAULT_CONFIG_PATH: &str = "gomoku_config.json";
const MIN_BOARD_SIZE: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleMode {
    #[default]
    Renju,
    Freestyle,
}

impl fmt::Display for RuleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleMode::Renju => write!(f, "RENJU"),
            RuleMode::Freestyle => write!(f, "FREESTYLE"),
        }
    }
}

/// Which side(s) get a suggestion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Advise {
    #[default]
    Both,
    Black,
    White,
}

impl Advise {
    pub fn covers(self, stone: Stone) -> bool {
        match self {
            Advise::Both => true,
            Advise::Black => stone == Stone::Black,
            Advise::White => stone == Stone::White,
        }
    }
}

/// Geometry of the captured board region and the color bands used to read it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub grid_size: usize,
    pub cell_size: u32,
    pub piece_size: u32,
    pub image_size: u32,
    pub left: u32,
    pub top: u32,
    /// Max normalized distance to pure black for a pixel to count as black.
    pub black_threshold: f32,
    /// Max normalized distance to pure white for a pixel to count as white.
    pub white_threshold: f32,
    pub rule: RuleMode,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_BOARD_SIZE,
            cell_size: 84,
            piece_size: 80,
            image_size: 84 * DEFAULT_BOARD_SIZE as u32 + 80,
            left: 625,
            top: 69,
            black_threshold: 0.25,
            white_threshold: 0.25,
            rule: RuleMode::Renju,
        }
    }
}

impl BoardConfig {
    /// Pixel center of an intersection inside the captured region.
    pub fn intersection(&self, row: usize, col: usize) -> (u32, u32) {
        let radius = self.piece_size / 2;
        (
            radius + col as u32 * self.cell_size,
            radius + row as u32 * self.cell_size,
        )
    }

    pub fn expected_image_size(&self) -> u32 {
        self.cell_size * self.grid_size as u32 + self.piece_size
    }

    pub fn validate(&self) -> Result<(), AssistError> {
        if !(MIN_BOARD_SIZE..=MAX_BOARD_SIZE).contains(&self.grid_size) {
            return Err(AssistError::ConfigInvalid(format!(
                "grid_size {} outside {}..={}",
                self.grid_size, MIN_BOARD_SIZE, MAX_BOARD_SIZE
            )));
        }
        if self.cell_size == 0 || self.piece_size == 0 {
            return Err(AssistError::ConfigInvalid(
                "cell_size and piece_size must be positive".into(),
            ));
        }
        if self.piece_size > self.cell_size {
            return Err(AssistError::ConfigInvalid(format!(
                "piece_size {} larger than cell_size {}",
                self.piece_size, self.cell_size
            )));
        }
        let expected = self.expected_image_size();
        if self.image_size.abs_diff(expected) > self.cell_size {
            return Err(AssistError::ConfigInvalid(format!(
                "image_size {} does not match cell_size*{} + piece_size = {}",
                self.image_size, self.grid_size, expected
            )));
        }
        for (name, value) in [
            ("black_threshold", self.black_threshold),
            ("white_threshold", self.white_threshold),
        ] {
            if !(value > 0.0 && value < 1.0) {
                return Err(AssistError::ConfigInvalid(format!(
                    "{} {} must be inside (0, 1)",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// How the engine is asked for a move.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Streamed `kata-analyze`, stopped at the visit threshold.
    #[default]
    Analyze,
    /// Single `genmove`, taken back with `undo`.
    Genmove,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: SearchMode,
    pub program: PathBuf,
    pub config_path: PathBuf,
    pub model_path: PathBuf,
    /// Extra arguments appended after the generated ones.
    pub extra_args: Vec<String>,
    /// Stop analysis once the leading candidate has this many visits.
    pub visits_threshold: u64,
    /// `kata-analyze` report interval in centiseconds.
    pub report_interval_cs: u32,
    pub handshake_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_analysis_ms: u64,
    pub restart_backoff_ms: u64,
    /// Ranked candidates kept from each analysis.
    pub max_candidates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Analyze,
            program: PathBuf::from("engine/gom15x_trt"),
            config_path: PathBuf::from("engine/engine.cfg"),
            model_path: PathBuf::from("weights/zhizi_renju28b_s1600.bin.gz"),
            extra_args: Vec::new(),
            visits_threshold: 1600,
            report_interval_cs: 10,
            handshake_timeout_ms: 30_000,
            response_timeout_ms: 5_000,
            max_analysis_ms: 15_000,
            restart_backoff_ms: 2_000,
            max_candidates: 7,
        }
    }
}

impl EngineConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn max_analysis(&self) -> Duration {
        Duration::from_millis(self.max_analysis_ms)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    /// Full argument list for a GTP session under the given rule.
    pub fn launch_args(&self, rule: RuleMode) -> Vec<String> {
        let mut args = vec![
            "gtp".to_string(),
            "-config".to_string(),
            self.config_path.display().to_string(),
            "-model".to_string(),
            self.model_path.display().to_string(),
            "-override-config".to_string(),
            format!("basicRule={}", rule),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub chess_manual_size: usize,
    pub chess_manual_path: PathBuf,
    /// Flush to disk after this many inserts (0 = only on shutdown).
    pub flush_every: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chess_manual_size: 10_000,
            chess_manual_path: PathBuf::from("chess_manual.json"),
            flush_every: 20,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub capture_timeout_ms: u64,
    /// Consecutive inconsistent stable readings before the history is rebuilt.
    pub resync_after: u32,
    pub advise: Advise,
    /// Capacity of the request channel to the engine worker.
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            capture_timeout_ms: 2_000,
            resync_after: 3,
            advise: Advise::Both,
            queue_depth: 4,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub board: BoardConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Loads the config file, writing the defaults first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Config> {
        if !path.exists() {
            let config = Config::default();
            config.save(path)?;
            info!(path = %path.display(), "wrote default config");
            return Ok(config);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| AssistError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, text).with_context(|| format!("Failed to write config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), AssistError> {
        self.board.validate()?;
        if self.engine.visits_threshold == 0 {
            return Err(AssistError::ConfigInvalid(
                "visits_threshold must be positive".into(),
            ));
        }
        if self.engine.max_candidates == 0 {
            return Err(AssistError::ConfigInvalid(
                "max_candidates must be positive".into(),
            ));
        }
        let timings = [
            ("report_interval_cs", u64::from(self.engine.report_interval_cs)),
            ("handshake_timeout_ms", self.engine.handshake_timeout_ms),
            ("response_timeout_ms", self.engine.response_timeout_ms),
            ("max_analysis_ms", self.engine.max_analysis_ms),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, value)| *value == 0) {
            return Err(AssistError::ConfigInvalid(format!("{} must be positive", name)));
        }
        if self.cache.chess_manual_size == 0 {
            return Err(AssistError::ConfigInvalid(
                "chess_manual_size must be positive".into(),
            ));
        }
        if self.scheduler.poll_interval_ms == 0 || self.scheduler.queue_depth == 0 {
            return Err(AssistError::ConfigInvalid(
                "poll_interval_ms and queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_engine_timings_rejected() {
        let mut config = Config::default();
        config.engine.response_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, AssistError::ConfigInvalid(_)));
        assert!(err.to_string().contains("response_timeout_ms"));

        let mut config = Config::default();
        config.engine.report_interval_cs = 0;
        assert!(config.validate().unwrap_err().to_string().contains("report_interval_cs"));

        let mut config = Config::default();
        config.engine.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.max_analysis_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_size_mismatch_rejected() {
        let mut board = BoardConfig::default();
        board.image_size = 600;
        let err = board.validate().unwrap_err();
        assert!(matches!(err, AssistError::ConfigInvalid(_)));
        assert!(err.to_string().contains("image_size"));
    }

    #[test]
    fn test_image_size_tolerates_one_cell() {
        // Region that ends at the last intersection plus a stone radius.
        let mut board = BoardConfig::default();
        board.image_size = board.cell_size * (board.grid_size as u32 - 1) + board.piece_size;
        assert!(board.validate().is_ok());
    }

    #[test]
    fn test_piece_larger_than_cell_rejected() {
        let mut board = BoardConfig::default();
        board.piece_size = board.cell_size + 1;
        board.image_size = board.expected_image_size();
        assert!(board.validate().is_err());
    }

    #[test]
    fn test_threshold_bounds() {
        let mut board = BoardConfig::default();
        board.white_threshold = 1.5;
        assert!(board.validate().is_err());
    }

    #[test]
    fn test_intersection_centers() {
        let board = BoardConfig::default();
        assert_eq!(board.intersection(0, 0), (40, 40));
        assert_eq!(board.intersection(7, 7), (40 + 7 * 84, 40 + 7 * 84));
    }

    #[test]
    fn test_launch_args_carry_rule() {
        let engine = EngineConfig::default();
        let args = engine.launch_args(RuleMode::Freestyle);
        assert_eq!(args[0], "gtp");
        assert!(args.contains(&"basicRule=FREESTYLE".to_string()));
    }

    #[test]
    fn test_load_or_init_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gomoku_config.json");
        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config, Config::default());
        let reloaded = Config::load_or_init(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"board": {"rule": "FREESTYLE"}, "engine": {"visits_threshold": 50}}"#)
            .unwrap();
        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.board.rule, RuleMode::Freestyle);
        assert_eq!(config.engine.visits_threshold, 50);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_load_rejects_inconsistent_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        fs::write(&path, r#"{"board": {"image_size": 100}}"#).unwrap();
        let err = Config::load_or_init(&path).unwrap_err();
        let assist = err.downcast_ref::<AssistError>().unwrap();
        assert!(matches!(assist, AssistError::ConfigInvalid(_)));
    }
}
