//! Cache key for a board position: `"{N}:"` + URL-safe base64 of the cells
//! packed two bits each, row-major. Orientation is not normalized, so mirrored
//! positions get distinct keys.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};

use crate::board::{BoardState, Cell};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(board: &BoardState) -> Self {
        let cells = board.cells();
        let mut packed = vec![0u8; cells.len().div_ceil(4)];
        for (idx, cell) in cells.iter().enumerate() {
            let bits = match cell {
                Cell::Empty => 0u8,
                Cell::Black => 1,
                Cell::White => 2,
            };
            packed[idx / 4] |= bits << ((idx % 4) * 2);
        }
        Fingerprint(format!("{}:{}", board.size(), URL_SAFE_NO_PAD.encode(packed)))
    }

    /// Board size encoded in the key, None for a malformed key.
    pub fn board_size(&self) -> Option<usize> {
        self.0.split_once(':')?.0.parse().ok()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
