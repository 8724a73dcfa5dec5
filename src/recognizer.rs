//! Board recognizer: turns a captured region into a classified grid.
//! Each intersection is sampled over a square 80% of a stone wide; pixels are
//! bucketed by normalized RGB distance to pure black / pure white. A cell whose
//! buckets disagree is Unknown, never a guessed stone.
//! Readings pass through a debounce: two consecutive identical, fully known
//! readings are needed before the board counts as stable.

use std::collections::hash_map::DefaultHasher;
use std::env;
use std::fs;
use std::hash::{Hash, Hasher};

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use tracing::{debug, warn};

use crate::board::{BoardState, Cell};
use crate::capture::Frame;
use crate::config::BoardConfig;
use crate::error::{AssistError, AssistResult};

/// Share of sampled pixels that must agree for a stone.
pub const STONE_FRACTION: f32 = 0.6;
/// Max share of stone-colored pixels tolerated on an empty intersection (grid lines, star points).
pub const EMPTY_FRACTION: f32 = 0.2;
const SAMPLE_SCALE: f32 = 0.8;
/// Euclidean distance between pure black and pure white in RGB space.
const MAX_DISTANCE_SQ: f32 = 3.0 * 255.0 * 255.0;

const DEBUG_PATH: &str = "screenshots/debug_board.png";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Classified {
    Empty,
    Black,
    White,
    Unknown,
}

/// One recognition pass: classification plus a confidence score per cell.
#[derive(Clone, Debug)]
pub struct Reading {
    size: usize,
    cells: Vec<Classified>,
    confidence: Vec<f32>,
}

impl PartialEq for Reading {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size && self.cells == other.cells
    }
}

impl Reading {
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> Classified {
        self.cells[row * self.size + col]
    }

    pub fn confidence(&self, row: usize, col: usize) -> f32 {
        self.confidence[row * self.size + col]
    }

    pub fn unknown_count(&self) -> usize {
        self.cells
            .iter()
            .filter(|&&c| c == Classified::Unknown)
            .count()
    }

    /// The board this reading describes, None while any cell is Unknown.
    pub fn to_board(&self) -> Option<BoardState> {
        let cells = self
            .cells
            .iter()
            .map(|c| match c {
                Classified::Empty => Some(Cell::Empty),
                Classified::Black => Some(Cell::Black),
                Classified::White => Some(Cell::White),
                Classified::Unknown => None,
            })
            .collect::<Option<Vec<Cell>>>()?;
        BoardState::from_cells(self.size, cells)
    }
}

/// Result of feeding one frame through recognition and debounce.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    /// At least one Unknown cell; nothing is accepted this cycle.
    Ambiguous { unknown: usize },
    /// A new reading waiting for confirmation by the next cycle.
    Pending,
    /// The confirmed board. `changed` is true on the cycle it was confirmed.
    Stable { board: BoardState, changed: bool },
}

/// Debounce over successive readings.
#[derive(Debug, Default)]
pub struct StabilityFilter {
    stable: Option<BoardState>,
    candidate: Option<BoardState>,
}

impl StabilityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stable(&self) -> Option<&BoardState> {
        self.stable.as_ref()
    }

    pub fn feed(&mut self, reading: &Reading) -> Observation {
        let board = match reading.to_board() {
            Some(board) => board,
            None => {
                self.candidate = None;
                return Observation::Ambiguous {
                    unknown: reading.unknown_count(),
                };
            }
        };

        if let Some(stable) = &self.stable {
            if *stable == board {
                self.candidate = None;
                return Observation::Stable {
                    board,
                    changed: false,
                };
            }
        }

        if self.candidate.as_ref() == Some(&board) {
            self.candidate = None;
            self.stable = Some(board.clone());
            return Observation::Stable {
                board,
                changed: true,
            };
        }

        self.candidate = Some(board);
        match &self.stable {
            // Keep reporting the last confirmed board while the new one waits.
            Some(stable) => Observation::Stable {
                board: stable.clone(),
                changed: false,
            },
            None => Observation::Pending,
        }
    }
}

pub struct BoardRecognizer {
    config: BoardConfig,
    filter: StabilityFilter,
    last_digest: Option<u64>,
    last_reading: Option<Reading>,
    debug_dump: bool,
}

impl BoardRecognizer {
    pub fn new(config: BoardConfig) -> Self {
        Self {
            config,
            filter: StabilityFilter::new(),
            last_digest: None,
            last_reading: None,
            debug_dump: env::var_os("DEBUG_CAPTURE").is_some(),
        }
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Recognizes one frame and advances the debounce. Identical frame bytes
    /// reuse the previous reading without sampling again.
    pub fn observe(&mut self, frame: &Frame) -> AssistResult<Observation> {
        let digest = frame_digest(&frame.image);
        let reading = match (&self.last_reading, self.last_digest) {
            (Some(previous), Some(last)) if last == digest => {
                debug!("stale capture, reusing previous reading");
                previous.clone()
            }
            _ => {
                let reading = self.read(&frame.image)?;
                if self.debug_dump {
                    self.dump_debug(&frame.image, &reading);
                }
                self.last_digest = Some(digest);
                self.last_reading = Some(reading.clone());
                reading
            }
        };
        Ok(self.filter.feed(&reading))
    }

    /// Classifies every intersection of a region of exactly image_size pixels.
    pub fn read(&self, image: &RgbImage) -> AssistResult<Reading> {
        let expected = self.config.image_size;
        if image.width() != expected || image.height() != expected {
            return Err(AssistError::FrameSize {
                width: image.width(),
                height: image.height(),
                expected,
            });
        }

        let size = self.config.grid_size;
        let black_limit = limit_sq(self.config.black_threshold);
        let white_limit = limit_sq(self.config.white_threshold);
        let half = ((self.config.piece_size as f32 * SAMPLE_SCALE) / 2.0).max(1.0) as u32;

        let mut cells = Vec::with_capacity(size * size);
        let mut confidence = Vec::with_capacity(size * size);
        for row in 0..size {
            for col in 0..size {
                let (cx, cy) = self.config.intersection(row, col);
                let stats = sample(image, cx, cy, half, black_limit, white_limit);
                let (class, score) = stats.classify();
                cells.push(class);
                confidence.push(score);
            }
        }
        Ok(Reading {
            size,
            cells,
            confidence,
        })
    }

    fn dump_debug(&self, image: &RgbImage, reading: &Reading) {
        let mut annotated = image.clone();
        let radius = (self.config.piece_size / 2) as i32;
        for row in 0..reading.size() {
            for col in 0..reading.size() {
                let (cx, cy) = self.config.intersection(row, col);
                let center = (cx as i32, cy as i32);
                match reading.get(row, col) {
                    Classified::Black => {
                        draw_hollow_circle_mut(&mut annotated, center, radius, Rgb([0, 200, 0]))
                    }
                    Classified::White => {
                        draw_hollow_circle_mut(&mut annotated, center, radius, Rgb([0, 0, 220]))
                    }
                    Classified::Unknown => {
                        let side = (radius * 2).max(1) as u32;
                        let rect = Rect::at(center.0 - radius, center.1 - radius)
                            .of_size(side, side);
                        draw_hollow_rect_mut(&mut annotated, rect, Rgb([230, 0, 0]));
                    }
                    Classified::Empty => {}
                }
            }
        }
        let saved = fs::create_dir_all("screenshots")
            .map_err(|e| e.to_string())
            .and_then(|_| annotated.save(DEBUG_PATH).map_err(|e| e.to_string()));
        if let Err(e) = saved {
            warn!("Failed to save debug board image: {}", e);
        }
    }
}

struct SampleStats {
    total: u32,
    black: u32,
    white: u32,
}

impl SampleStats {
    fn classify(&self) -> (Classified, f32) {
        if self.total == 0 {
            return (Classified::Unknown, 0.0);
        }
        let black = self.black as f32 / self.total as f32;
        let white = self.white as f32 / self.total as f32;
        if black >= STONE_FRACTION {
            (Classified::Black, black)
        } else if white >= STONE_FRACTION {
            (Classified::White, white)
        } else if black <= EMPTY_FRACTION && white <= EMPTY_FRACTION {
            (Classified::Empty, 1.0 - black.max(white))
        } else {
            (Classified::Unknown, 1.0 - (black - white).abs())
        }
    }
}

fn limit_sq(threshold: f32) -> f32 {
    threshold * threshold * MAX_DISTANCE_SQ
}

fn sample(
    image: &RgbImage,
    cx: u32,
    cy: u32,
    half: u32,
    black_limit: f32,
    white_limit: f32,
) -> SampleStats {
    let x0 = cx.saturating_sub(half);
    let y0 = cy.saturating_sub(half);
    let x1 = (cx + half + 1).min(image.width());
    let y1 = (cy + half + 1).min(image.height());

    let mut stats = SampleStats {
        total: 0,
        black: 0,
        white: 0,
    };
    for y in y0..y1 {
        for x in x0..x1 {
            let Rgb([r, g, b]) = *image.get_pixel(x, y);
            let (r, g, b) = (r as f32, g as f32, b as f32);
            let to_black = r * r + g * g + b * b;
            let to_white = (255.0 - r).powi(2) + (255.0 - g).powi(2) + (255.0 - b).powi(2);
            stats.total += 1;
            if to_black < black_limit {
                stats.black += 1;
            } else if to_white < white_limit {
                stats.white += 1;
            }
        }
    }
    stats
}

fn frame_digest(image: &RgbImage) -> u64 {
    let mut hasher = DefaultHasher::new();
    image.dimensions().hash(&mut hasher);
    image.as_raw().hash(&mut hasher);
    hasher.finish()
}
