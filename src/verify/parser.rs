//! Parsers for the fixed-width grids printed by `i2cdump` and `i2cdetect`.
//!
//! Both tools print one row per 16-address window:
//!
//! ```text
//!      0  1  2  3  4  5  6  7  8  9  a  b  c  d  e  f    0123456789abcdef
//! 00: 00 01 02 ff XX                                     ....?
//! ```
//!
//! A row starts with its hex offset and a colon, followed by 16 three-character cells
//! (a space and two characters). Cells outside the requested range are blank. Whatever
//! follows the sixteenth cell (the ASCII rendering of `i2cdump`) is ignored. Cells are
//! read by column position rather than by splitting on whitespace, because the ASCII
//! column can itself look like hex (`ab` for bytes `0x61 0x62`).

use crate::topology::{I2cAddress, RegisterValue};

const CELLS_PER_ROW: usize = 16;
const CELL_WIDTH: usize = 3;

/// One non-blank cell of a grid row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GridCell<'a> {
    /// Absolute offset (row base plus column).
    offset: usize,
    text: &'a str,
}

/// Yield every non-blank cell in row order.
fn grid_cells(text: &str) -> impl Iterator<Item = GridCell<'_>> {
    text.lines().filter_map(parse_row).flatten()
}

fn parse_row(line: &str) -> Option<Vec<GridCell<'_>>> {
    let line = line.trim_end_matches('\r');
    let (label, rest) = line.split_once(':')?;
    let label = label.trim();
    if label.is_empty() || !label.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let base = usize::from_str_radix(label, 16).ok()?;

    let mut cells = Vec::with_capacity(CELLS_PER_ROW);
    for column in 0..CELLS_PER_ROW {
        let start = column * CELL_WIDTH + 1;
        let Some(cell) = rest.get(start..start + 2) else {
            break;
        };
        let cell = cell.trim();
        if !cell.is_empty() {
            cells.push(GridCell {
                offset: base + column,
                text: cell,
            });
        }
    }
    Some(cells)
}

/// Turn `i2cdump` output into register values in ascending address order.
///
/// The offset column and the trailing ASCII rendering are skipped, header and
/// diagnostic lines are ignored, and the `XX` placeholder becomes
/// [`RegisterValue::Unreadable`]. A cell that is neither hex nor the placeholder is
/// also reported as unreadable so the comparison against the golden values fails.
pub fn parse_dump_output(raw: &str) -> Vec<RegisterValue> {
    grid_cells(raw)
        .map(|cell| {
            u8::from_str_radix(cell.text, 16)
                .map(RegisterValue::Byte)
                .unwrap_or(RegisterValue::Unreadable)
        })
        .collect()
}

/// Read the cell for `address` out of `i2cdetect` output.
///
/// Returns `Some(true)` when the device answered (its address is printed) or a driver
/// already owns it (`UU`), `Some(false)` for `--`, and `None` when the grid has no cell
/// for the address at all.
pub fn parse_detect_output(raw: &str, address: I2cAddress) -> Option<bool> {
    let wanted = usize::from(address.value());
    grid_cells(raw)
        .find(|cell| cell.offset == wanted)
        .map(|cell| match cell.text {
            "--" => false,
            "UU" => true,
            other => u8::from_str_radix(other, 16).is_ok_and(|v| usize::from(v) == wanted),
        })
}
