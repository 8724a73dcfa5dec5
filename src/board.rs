//! Board model: stones, cells, immutable board states and the move history.
//! Row 0 is the top edge of the captured image. GTP vertices use columns A..Z
//! without I and count rows from the bottom, so (7,7) on 15x15 is `H8`.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BOARD_SIZE: usize = 15;
pub const MAX_BOARD_SIZE: usize = 25;

const GTP_COLUMNS: &[u8] = b"ABCDEFGHJKLMNOPQRSTUVWXYZ";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stone {
    Black,
    White,
}

impl Stone {
    pub fn opponent(self) -> Stone {
        match self {
            Stone::Black => Stone::White,
            Stone::White => Stone::Black,
        }
    }

    /// Color token used by GTP commands.
    pub fn gtp(self) -> &'static str {
        match self {
            Stone::Black => "B",
            Stone::White => "W",
        }
    }
}

impl fmt::Display for Stone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stone::Black => write!(f, "Black"),
            Stone::White => write!(f, "White"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Cell {
    #[default]
    Empty,
    Black,
    White,
}

impl Cell {
    pub fn stone(self) -> Option<Stone> {
        match self {
            Cell::Empty => None,
            Cell::Black => Some(Stone::Black),
            Cell::White => Some(Stone::White),
        }
    }

    fn symbol(self) -> char {
        match self {
            Cell::Empty => '.',
            Cell::Black => 'X',
            Cell::White => 'O',
        }
    }
}

impl From<Stone> for Cell {
    fn from(stone: Stone) -> Self {
        match stone {
            Stone::Black => Cell::Black,
            Stone::White => Cell::White,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pos {
    pub row: u8,
    pub col: u8,
}

impl Pos {
    pub fn new(row: usize, col: usize) -> Self {
        debug_assert!(row < MAX_BOARD_SIZE && col < MAX_BOARD_SIZE);
        Self {
            row: row as u8,
            col: col as u8,
        }
    }

    pub fn to_gtp(self, size: usize) -> String {
        let column = GTP_COLUMNS[self.col as usize] as char;
        format!("{}{}", column, size - self.row as usize)
    }

    /// Parses a GTP vertex such as `H8`. Returns None for `pass`, `resign`
    /// and anything off the board.
    pub fn from_gtp(vertex: &str, size: usize) -> Option<Pos> {
        let vertex = vertex.trim();
        let mut chars = vertex.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let col = GTP_COLUMNS.iter().position(|&c| c as char == letter)?;
        let number: usize = chars.as_str().parse().ok()?;
        if col >= size || number == 0 || number > size {
            return None;
        }
        Some(Pos::new(size - number, col))
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.row, self.col)
    }
}

/// One changed cell between two board states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellChange {
    pub pos: Pos,
    pub before: Cell,
    pub after: Cell,
}

/// Immutable N x N board. "Placing" a stone returns a new state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BoardState {
    size: usize,
    cells: Vec<Cell>,
}

impl BoardState {
    pub fn empty(size: usize) -> Self {
        Self {
            size,
            cells: vec![Cell::Empty; size * size],
        }
    }

    /// Builds a board from row-major cells; None when the length is not size².
    pub fn from_cells(size: usize, cells: Vec<Cell>) -> Option<Self> {
        (cells.len() == size * size).then_some(Self { size, cells })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn contains(&self, row: i32, col: i32) -> bool {
        row >= 0 && col >= 0 && (row as usize) < self.size && (col as usize) < self.size
    }

    pub fn get(&self, pos: Pos) -> Cell {
        self.cells[pos.row as usize * self.size + pos.col as usize]
    }

    /// Cell at signed coordinates, None off the board.
    pub fn get_signed(&self, row: i32, col: i32) -> Option<Cell> {
        self.contains(row, col)
            .then(|| self.cells[row as usize * self.size + col as usize])
    }

    pub fn is_empty_at(&self, pos: Pos) -> bool {
        self.get(pos) == Cell::Empty
    }

    pub fn with_stone(&self, pos: Pos, stone: Stone) -> BoardState {
        let mut next = self.clone();
        next.cells[pos.row as usize * self.size + pos.col as usize] = stone.into();
        next
    }

    pub fn diff(&self, other: &BoardState) -> Vec<CellChange> {
        self.cells
            .iter()
            .zip(other.cells.iter())
            .enumerate()
            .filter(|(_, (before, after))| before != after)
            .map(|(idx, (&before, &after))| CellChange {
                pos: Pos::new(idx / self.size, idx % self.size),
                before,
                after,
            })
            .collect()
    }

    pub fn count(&self, stone: Stone) -> usize {
        let cell = Cell::from(stone);
        self.cells.iter().filter(|&&c| c == cell).count()
    }

    pub fn stone_count(&self) -> usize {
        self.cells.iter().filter(|c| **c != Cell::Empty).count()
    }

    pub fn is_blank(&self) -> bool {
        self.stone_count() == 0
    }

    pub fn stones(&self, stone: Stone) -> Vec<Pos> {
        let cell = Cell::from(stone);
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, c)| **c == cell)
            .map(|(idx, _)| Pos::new(idx / self.size, idx % self.size))
            .collect()
    }

    /// A board reachable by alternating play with Black first.
    pub fn is_effective(&self) -> bool {
        let black = self.count(Stone::Black);
        let white = self.count(Stone::White);
        black == white || black == white + 1
    }

    /// Side to move, None when the stone counts cannot come from real play.
    pub fn to_move(&self) -> Option<Stone> {
        let black = self.count(Stone::Black);
        let white = self.count(Stone::White);
        if black == white {
            Some(Stone::Black)
        } else if black == white + 1 {
            Some(Stone::White)
        } else {
            None
        }
    }
}

impl fmt::Display for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header: Vec<String> = GTP_COLUMNS[..self.size]
            .iter()
            .map(|&c| (c as char).to_string())
            .collect();
        writeln!(f, "    {}", header.join(" "))?;
        for row in 0..self.size {
            let symbols: Vec<String> = self.cells[row * self.size..(row + 1) * self.size]
                .iter()
                .map(|c| c.symbol().to_string())
                .collect();
            writeln!(f, "{:2}  {}", self.size - row, symbols.join(" "))?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub pos: Pos,
    pub stone: Stone,
    /// Zero-based position in the game record.
    pub index: usize,
}

/// Why a move cannot extend the history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryError {
    Occupied(Pos),
    WrongColor { expected: Stone },
    OffBoard(Pos),
}

/// Authoritative game record. The current board is derived from it and kept
/// in sync on every mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MoveHistory {
    size: usize,
    moves: Vec<Move>,
    board: BoardState,
}

impl MoveHistory {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            moves: Vec::new(),
            board: BoardState::empty(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn len(&self) -> usize {
        self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn last(&self) -> Option<&Move> {
        self.moves.last()
    }

    pub fn board(&self) -> &BoardState {
        &self.board
    }

    pub fn next_color(&self) -> Stone {
        match self.moves.last() {
            Some(last) => last.stone.opponent(),
            None => Stone::Black,
        }
    }

    pub fn push(&mut self, pos: Pos, stone: Stone) -> Result<Move, HistoryError> {
        if pos.row as usize >= self.size || pos.col as usize >= self.size {
            return Err(HistoryError::OffBoard(pos));
        }
        let expected = self.next_color();
        if stone != expected {
            return Err(HistoryError::WrongColor { expected });
        }
        if !self.board.is_empty_at(pos) {
            return Err(HistoryError::Occupied(pos));
        }
        let mv = Move {
            pos,
            stone,
            index: self.moves.len(),
        };
        self.board = self.board.with_stone(pos, stone);
        self.moves.push(mv);
        Ok(mv)
    }

    pub fn truncate(&mut self, len: usize) {
        if len >= self.moves.len() {
            return;
        }
        self.moves.truncate(len);
        self.board = self.replay_board(len);
    }

    pub fn clear(&mut self) {
        self.moves.clear();
        self.board = BoardState::empty(self.size);
    }

    /// Board after the first `len` moves.
    pub fn replay_board(&self, len: usize) -> BoardState {
        self.moves
            .iter()
            .take(len)
            .fold(BoardState::empty(self.size), |board, mv| {
                board.with_stone(mv.pos, mv.stone)
            })
    }

    /// True when `other` starts with every move of `self` in order.
    pub fn is_prefix_of(&self, other: &[Move]) -> bool {
        self.moves.len() <= other.len()
            && self
                .moves
                .iter()
                .zip(other.iter())
                .all(|(a, b)| a.pos == b.pos && a.stone == b.stone)
    }

    /// Replaces the record with an order consistent with `board`: stones are
    /// interleaved Black, White, Black... The real order is lost, so this is
    /// only used when the visual board and the record cannot be reconciled.
    pub fn rebuild_from(board: &BoardState) -> Option<MoveHistory> {
        if !board.is_effective() {
            return None;
        }
        let blacks = board.stones(Stone::Black);
        let whites = board.stones(Stone::White);
        let mut history = MoveHistory::new(board.size());
        for i in 0..blacks.len() {
            history.push(blacks[i], Stone::Black).ok()?;
            if let Some(&white) = whites.get(i) {
                history.push(white, Stone::White).ok()?;
            }
        }
        Some(history)
    }
}
