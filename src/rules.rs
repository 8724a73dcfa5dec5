//! Rule constraints applied to engine output before it is shown.
//! Every mode requires an empty on-board point. RENJU additionally forbids
//! Black from making an overline, a double-four or a double-three, unless
//! the same stone completes an exact five.
//! Threes are judged one level deep: the completing point of a three is not
//! itself re-checked for forbidden shapes.

use std::fmt;

use crate::board::{BoardState, Cell, Pos, Stone};
use crate::config::RuleMode;

/// Half-width of the window scanned along each direction.
const REACH: i32 = 9;
const WINDOW: usize = (2 * REACH + 1) as usize;
const CENTER: usize = REACH as usize;
const DIRECTIONS: [(i32, i32); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Forbidden {
    OffBoard,
    Occupied,
    Overline,
    DoubleFour,
    DoubleThree,
}

impl fmt::Display for Forbidden {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Forbidden::OffBoard => write!(f, "outside the board"),
            Forbidden::Occupied => write!(f, "point already occupied"),
            Forbidden::Overline => write!(f, "overline (six or more in a row)"),
            Forbidden::DoubleFour => write!(f, "double-four"),
            Forbidden::DoubleThree => write!(f, "double-three"),
        }
    }
}

/// Checks `stone` playing at `pos` on `board` under `rule`.
pub fn check_move(
    board: &BoardState,
    pos: Pos,
    stone: Stone,
    rule: RuleMode,
) -> Result<(), Forbidden> {
    if pos.row as usize >= board.size() || pos.col as usize >= board.size() {
        return Err(Forbidden::OffBoard);
    }
    if !board.is_empty_at(pos) {
        return Err(Forbidden::Occupied);
    }
    if rule == RuleMode::Renju && stone == Stone::Black {
        if let Some(reason) = forbidden_reason(board, pos) {
            return Err(reason);
        }
    }
    Ok(())
}

/// Renju forbidden-shape test for a black stone at an empty `pos`.
pub fn forbidden_reason(board: &BoardState, pos: Pos) -> Option<Forbidden> {
    let lines: Vec<[Slot; WINDOW]> = DIRECTIONS
        .iter()
        .map(|&dir| extract(board, pos, dir))
        .collect();

    if makes_five(board, pos, Stone::Black, RuleMode::Renju) {
        return None;
    }
    if lines.iter().any(|line| run_len(line, CENTER) >= 6) {
        return Some(Forbidden::Overline);
    }

    let fours: Vec<usize> = lines.iter().map(four_count).collect();
    if fours.iter().sum::<usize>() >= 2 {
        return Some(Forbidden::DoubleFour);
    }

    let threes = lines
        .iter()
        .zip(fours.iter())
        .filter(|(line, fours)| **fours == 0 && is_three(line))
        .count();
    if threes >= 2 {
        return Some(Forbidden::DoubleThree);
    }
    None
}

/// True when `stone` at `pos` completes five (exactly five for Black in RENJU).
pub fn makes_five(board: &BoardState, pos: Pos, stone: Stone, rule: RuleMode) -> bool {
    let exact = rule == RuleMode::Renju && stone == Stone::Black;
    DIRECTIONS.iter().any(|&(dr, dc)| {
        let mut run = 1;
        for sign in [1, -1] {
            let (mut r, mut c) = (pos.row as i32 + sign * dr, pos.col as i32 + sign * dc);
            while board.get_signed(r, c) == Some(stone.into()) {
                run += 1;
                r += sign * dr;
                c += sign * dc;
            }
        }
        if exact { run == 5 } else { run >= 5 }
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Own,
    Empty,
    Blocked,
}

/// Cells along one direction through `pos`, with a black stone placed at the center.
fn extract(board: &BoardState, pos: Pos, (dr, dc): (i32, i32)) -> [Slot; WINDOW] {
    let mut line = [Slot::Blocked; WINDOW];
    for (i, slot) in line.iter_mut().enumerate() {
        let offset = i as i32 - REACH;
        let r = pos.row as i32 + offset * dr;
        let c = pos.col as i32 + offset * dc;
        *slot = match board.get_signed(r, c) {
            Some(Cell::Black) => Slot::Own,
            Some(Cell::Empty) => Slot::Empty,
            _ => Slot::Blocked,
        };
    }
    line[CENTER] = Slot::Own;
    line
}

fn run_len(line: &[Slot; WINDOW], idx: usize) -> usize {
    if line[idx] != Slot::Own {
        return 0;
    }
    let left = line[..idx].iter().rev().take_while(|&&s| s == Slot::Own).count();
    let right = line[idx + 1..].iter().take_while(|&&s| s == Slot::Own).count();
    left + 1 + right
}

/// Empty points that would turn the run through the center into exactly five.
fn completions(line: &[Slot; WINDOW]) -> Vec<usize> {
    (CENTER - 4..=CENTER + 4)
        .filter(|&i| line[i] == Slot::Empty)
        .filter(|&i| {
            let mut probe = *line;
            probe[i] = Slot::Own;
            run_len(&probe, CENTER) == 5
        })
        .collect()
}

/// Number of distinct fours through the center in this line (0, 1 or 2).
fn four_count(line: &[Slot; WINDOW]) -> usize {
    let points = completions(line);
    match points.as_slice() {
        [] => 0,
        [_] => 1,
        // Both ends of one unbroken four.
        [a, b] if b - a == 5 => 1,
        _ => 2,
    }
}

/// A straight four: four in a row whose both ends complete an exact five.
fn is_straight_four(line: &[Slot; WINDOW]) -> bool {
    let points = completions(line);
    points.len() == 2 && points[1] - points[0] == 5
}

/// A three: one more stone on this line can make a straight four.
fn is_three(line: &[Slot; WINDOW]) -> bool {
    (CENTER - 4..=CENTER + 4)
        .filter(|&i| i != CENTER && line[i] == Slot::Empty)
        .any(|i| {
            let mut probe = *line;
            probe[i] = Slot::Own;
            run_len(&probe, i) < 6 && is_straight_four(&probe)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board_with(stones: &[(usize, usize, Stone)]) -> BoardState {
        stones
            .iter()
            .fold(BoardState::empty(15), |b, &(r, c, s)| b.with_stone(Pos::new(r, c), s))
    }

    #[test]
    fn test_exact_overline_rejected() {
        // X X X _ X X on row 7; filling the gap makes six.
        let board = board_with(&[
            (7, 3, Stone::Black),
            (7, 4, Stone::Black),
            (7, 5, Stone::Black),
            (7, 7, Stone::Black),
            (7, 8, Stone::Black),
        ]);
        assert_eq!(
            check_move(&board, Pos::new(7, 6), Stone::Black, RuleMode::Renju),
            Err(Forbidden::Overline)
        );
        // White may, and so may Black in freestyle.
        assert!(check_move(&board, Pos::new(7, 6), Stone::White, RuleMode::Renju).is_ok());
        assert!(check_move(&board, Pos::new(7, 6), Stone::Black, RuleMode::Freestyle).is_ok());
    }

    #[test]
    fn test_exact_five_allowed() {
        let board = board_with(&[
            (7, 3, Stone::Black),
            (7, 4, Stone::Black),
            (7, 5, Stone::Black),
            (7, 6, Stone::Black),
        ]);
        assert!(check_move(&board, Pos::new(7, 7), Stone::Black, RuleMode::Renju).is_ok());
        assert!(makes_five(&board, Pos::new(7, 7), Stone::Black, RuleMode::Renju));
    }

    #[test]
    fn test_double_three_rejected() {
        // Open twos crossing at (7,7): row and column.
        let board = board_with(&[
            (7, 5, Stone::Black),
            (7, 6, Stone::Black),
            (5, 7, Stone::Black),
            (6, 7, Stone::Black),
        ]);
        assert_eq!(
            check_move(&board, Pos::new(7, 7), Stone::Black, RuleMode::Renju),
            Err(Forbidden::DoubleThree)
        );
    }

    #[test]
    fn test_blocked_three_is_not_counted() {
        // Row shape is closed by a white stone, leaving only one live three.
        let board = board_with(&[
            (7, 4, Stone::White),
            (7, 5, Stone::Black),
            (7, 6, Stone::Black),
            (7, 8, Stone::White),
            (5, 7, Stone::Black),
            (6, 7, Stone::Black),
        ]);
        assert!(check_move(&board, Pos::new(7, 7), Stone::Black, RuleMode::Renju).is_ok());
    }

    #[test]
    fn test_double_four_rejected() {
        let board = board_with(&[
            (7, 4, Stone::Black),
            (7, 5, Stone::Black),
            (7, 6, Stone::Black),
            (7, 3, Stone::White),
            (4, 7, Stone::Black),
            (5, 7, Stone::Black),
            (6, 7, Stone::Black),
            (3, 7, Stone::White),
        ]);
        assert_eq!(
            check_move(&board, Pos::new(7, 7), Stone::Black, RuleMode::Renju),
            Err(Forbidden::DoubleFour)
        );
    }

    #[test]
    fn test_double_four_in_one_line() {
        let board = board_with(&[
            (7, 2, Stone::Black),
            (7, 4, Stone::Black),
            (7, 6, Stone::Black),
            (7, 8, Stone::Black),
        ]);
        // Playing (7,5) gives X _ X X X _ X: both gaps complete an exact five.
        assert_eq!(
            check_move(&board, Pos::new(7, 5), Stone::Black, RuleMode::Renju),
            Err(Forbidden::DoubleFour)
        );
    }

    #[test]
    fn test_four_three_allowed() {
        let board = board_with(&[
            (7, 4, Stone::Black),
            (7, 5, Stone::Black),
            (7, 6, Stone::Black),
            (7, 3, Stone::White),
            (5, 7, Stone::Black),
            (6, 7, Stone::Black),
        ]);
        assert!(check_move(&board, Pos::new(7, 7), Stone::Black, RuleMode::Renju).is_ok());
    }

    #[test]
    fn test_occupied_and_off_board() {
        let board = board_with(&[(7, 7, Stone::White)]);
        assert_eq!(
            check_move(&board, Pos::new(7, 7), Stone::Black, RuleMode::Freestyle),
            Err(Forbidden::Occupied)
        );
        assert_eq!(
            check_move(&board, Pos::new(15, 0), Stone::Black, RuleMode::Freestyle),
            Err(Forbidden::OffBoard)
        );
    }

    #[test]
    fn test_white_five_with_overline_counts() {
        let board = board_with(&[
            (0, 0, Stone::White),
            (0, 1, Stone::White),
            (0, 2, Stone::White),
            (0, 4, Stone::White),
            (0, 5, Stone::White),
        ]);
        assert!(makes_five(&board, Pos::new(0, 3), Stone::White, RuleMode::Renju));
        assert!(!makes_five(&board, Pos::new(1, 3), Stone::White, RuleMode::Renju));
    }
}
