//! Printhead byte layout.
//!
//! The printhead consumes one 72-byte run per image column. Inside a run the
//! bits are not in row order: nozzles fire in six interleaved groups, and the
//! head is split into two halves of 276 nozzles each. The tables below are the
//! printhead nozzle-group contract and must not be derived or reordered.

use crate::dither::{Bitmap, OFF};
use crate::error::{EncodingError, Error};

/// Number of nozzles across the printhead, i.e. the maximum bitmap height.
pub const PRINTHEAD_HEIGHT: usize = 552;

/// Bytes emitted per image column.
pub const COLUMN_BYTES: usize = 72;

/// Bytes of the intermediate one-bit-per-row column bitset.
const COLUMN_BITSET_BYTES: usize = PRINTHEAD_HEIGHT / 8;

/// Rows per printhead half; the interleave restarts every period.
const NOZZLE_PERIOD: usize = 276;

/// Nozzle firing groups within a period.
const NOZZLE_GROUPS: usize = 6;

/// Destination byte offset of each firing group inside a half.
const GROUP_OFFSETS: [usize; NOZZLE_GROUPS] = [0, 48, 24, 60, 12, 36];

/// Destination of a source row inside its column run: `(byte, mask)`.
#[inline]
fn nozzle_position(row: usize) -> (usize, u8) {
    let group = row % NOZZLE_GROUPS;
    let in_period = row % NOZZLE_PERIOD;
    let base = (row / NOZZLE_PERIOD) * NOZZLE_GROUPS;
    let group_index = ((in_period - group) / NOZZLE_GROUPS) / 8;
    let bit = (in_period / NOZZLE_GROUPS) % 8;
    (base + GROUP_OFFSETS[group] + group_index, 0x80 >> bit)
}

/// Rearrange a row-major bilevel bitmap into the printhead's column-major
/// layout. Output is `width * 72` bytes.
pub fn format_binary_to_hardware_layout(bitmap: &Bitmap) -> Result<Vec<u8>, Error> {
    let (width, height) = (bitmap.width, bitmap.height);
    if height > PRINTHEAD_HEIGHT {
        return Err(EncodingError::TooTall {
            height,
            max: PRINTHEAD_HEIGHT,
        }
        .into());
    }
    if bitmap.data.len() != width * height {
        return Err(EncodingError::BufferSize {
            width,
            height,
            channels: 1,
            expected: width * height,
            actual: bitmap.data.len(),
        }
        .into());
    }

    let mut out = vec![0u8; width * COLUMN_BYTES];
    let mut bitset = [0u8; COLUMN_BITSET_BYTES];

    for x in 0..width {
        bitset.fill(0);
        for y in 0..height {
            if bitmap.data[y * width + x] != OFF {
                bitset[y / 8] |= 0x80 >> (y % 8);
            }
        }

        let run = &mut out[x * COLUMN_BYTES..(x + 1) * COLUMN_BYTES];
        for (i, &byte) in bitset.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for b in 0..8 {
                if byte & (0x80 >> b) != 0 {
                    let (dest, mask) = nozzle_position(i * 8 + b);
                    run[dest] |= mask;
                }
            }
        }
    }

    Ok(out)
}
