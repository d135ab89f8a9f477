//! Protocol frames and the cursor that cuts a payload into them.
//!
//! A frame is `[header][!header][payload][crc_hi][crc_lo]`. The header byte
//! selects the payload size; a short final payload is padded with `PAD_BYTE`.
//! The CRC covers every byte before it.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::debug;

use crate::data::{packet_count, TransferData};
use crate::error::{Error, FramingError};

/// Header, complement and two CRC bytes.
pub const FRAME_OVERHEAD: usize = 4;

/// Fill byte for the unused tail of the last payload.
pub const PAD_BYTE: u8 = 0x1A;

/// Minimum interval between progress signals when the value is unchanged.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Frame header, selecting payload size and progress precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Soh,
    Stx,
    StxA,
    StxB,
    StxC,
    StxD,
    StxE,
}

impl FrameKind {
    pub const ALL: [FrameKind; 7] = [
        Self::Soh,
        Self::Stx,
        Self::StxA,
        Self::StxB,
        Self::StxC,
        Self::StxD,
        Self::StxE,
    ];

    pub fn header(self) -> u8 {
        match self {
            Self::Soh => 0x18,
            Self::Stx => 0x19,
            Self::StxA => 0x1A,
            Self::StxB => 0x1B,
            Self::StxC => 0x1C,
            Self::StxD => 0x1D,
            Self::StxE => 0x1E,
        }
    }

    /// Payload bytes carried by one frame.
    pub fn payload_size(self) -> usize {
        match self {
            Self::Soh => 128,
            Self::Stx => 512,
            Self::StxA => 1024,
            Self::StxB => 2048,
            Self::StxC => 5120,
            Self::StxD => 10240,
            Self::StxE => 124,
        }
    }

    /// Decimal places shown in the progress percentage.
    pub fn precision(self) -> u32 {
        match self {
            Self::Soh | Self::StxE => 2,
            Self::Stx => 1,
            _ => 0,
        }
    }

    pub fn frame_size(self) -> usize {
        self.payload_size() + FRAME_OVERHEAD
    }

    pub fn from_header(header: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.header() == header)
    }

    fn name(self) -> &'static str {
        match self {
            Self::Soh => "SOH",
            Self::Stx => "STX",
            Self::StxA => "STX_A",
            Self::StxB => "STX_B",
            Self::StxC => "STX_C",
            Self::StxD => "STX_D",
            Self::StxE => "STX_E",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FrameKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.to_uppercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| format!("unknown frame kind '{}'", s))
    }
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, MSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// A complete frame, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    bytes: Vec<u8>,
}

impl Packet {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> u8 {
        self.bytes[0]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[2..self.bytes.len() - 2]
    }

    pub fn crc(&self) -> u16 {
        let n = self.bytes.len();
        u16::from_be_bytes([self.bytes[n - 2], self.bytes[n - 1]])
    }

    /// Header complement and CRC both check out.
    pub fn is_valid(&self) -> bool {
        let n = self.bytes.len();
        n >= FRAME_OVERHEAD
            && self.bytes[1] == !self.bytes[0]
            && crc16(&self.bytes[..n - 2]) == self.crc()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Wrap a payload chunk into a frame of `kind`.
pub fn packet_format(kind: FrameKind, chunk: &[u8]) -> Packet {
    let header = kind.header();
    let mut bytes = Vec::with_capacity(chunk.len() + FRAME_OVERHEAD);
    bytes.push(header);
    bytes.push(!header);
    bytes.extend_from_slice(chunk);
    let crc = crc16(&bytes);
    bytes.extend_from_slice(&crc.to_be_bytes());
    Packet { bytes }
}

/// Rate-limited progress percentage.
#[derive(Debug, Clone)]
pub struct Progress {
    scale: f64,
    scaled: i64,
    last_signal: Option<Instant>,
}

impl Progress {
    pub fn new(precision: u32) -> Self {
        Progress {
            scale: 10f64.powi(precision as i32),
            scaled: 0,
            last_signal: None,
        }
    }

    pub fn percent(&self) -> f64 {
        self.scaled as f64 / self.scale
    }

    /// Recompute from `done` of `total`; true when the rounded value changed
    /// or a second has passed since the last signal.
    pub fn update(&mut self, done: usize, total: usize, now: Instant) -> bool {
        let ratio = if total == 0 {
            1.0
        } else {
            done as f64 / total as f64
        };
        let scaled = (ratio * 100.0 * self.scale).round() as i64;
        let changed = scaled != self.scaled;
        self.scaled = scaled;

        let due = match self.last_signal {
            None => true,
            Some(last) => now.duration_since(last) >= PROGRESS_INTERVAL,
        };
        if changed || due {
            self.last_signal = Some(now);
            true
        } else {
            false
        }
    }
}

/// Cursor over the packets of a payload.
///
/// `index` counts packets across all rows and starts at -1. For multi-row
/// payloads `current_row` and `index_in_current_row` follow the same scheme
/// inside the current row.
pub struct PacketFramer<'a> {
    kind: FrameKind,
    data: &'a dyn TransferData,
    total_packet_count: usize,
    index: i64,
    current_row: usize,
    index_in_current_row: i64,
    row_packet_count: usize,
    row_payload: Vec<u8>,
    bytes_framed: usize,
    progress: Progress,
}

impl<'a> PacketFramer<'a> {
    pub fn new(kind: FrameKind, data: &'a dyn TransferData) -> Result<Self, Error> {
        let total_packet_count = data.total_packet_count(kind.payload_size());
        if data.row_count() == 0 || total_packet_count == 0 {
            return Err(FramingError::EmptyPayload.into());
        }

        let mut framer = PacketFramer {
            kind,
            data,
            total_packet_count,
            index: -1,
            current_row: 0,
            index_in_current_row: -1,
            row_packet_count: 0,
            row_payload: Vec::new(),
            bytes_framed: 0,
            progress: Progress::new(kind.precision()),
        };
        framer.load_row(0)?;
        debug!(
            "framing {} bytes in {} row(s) as {} x {} packets",
            data.total_len(),
            data.row_count(),
            total_packet_count,
            kind
        );
        Ok(framer)
    }

    fn load_row(&mut self, row: usize) -> Result<(), Error> {
        let payload = self.data.load_row(row)?;
        let expected = self.data.row_len(row);
        if payload.len() != expected {
            return Err(FramingError::LengthMismatch {
                row,
                expected,
                actual: payload.len(),
            }
            .into());
        }
        self.current_row = row;
        self.row_packet_count = packet_count(payload.len(), self.kind.payload_size());
        self.row_payload = payload;
        self.index_in_current_row = -1;
        Ok(())
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn index(&self) -> i64 {
        self.index
    }

    pub fn current_row(&self) -> usize {
        self.current_row
    }

    pub fn index_in_current_row(&self) -> i64 {
        self.index_in_current_row
    }

    pub fn total_packet_count(&self) -> usize {
        self.total_packet_count
    }

    /// Payload bytes framed so far, padding excluded.
    pub fn bytes_framed(&self) -> usize {
        self.bytes_framed
    }

    pub fn has_next_packet(&self) -> bool {
        self.index + 1 < self.total_packet_count as i64
    }

    pub fn has_next_packet_in_row(&self) -> bool {
        self.index_in_current_row + 1 < self.row_packet_count as i64
    }

    pub fn has_next_row(&self) -> bool {
        self.current_row + 1 < self.data.row_count()
    }

    /// Load the next row and rewind the in-row cursor.
    pub fn cursor_move_to_next_row(&mut self) -> Result<(), Error> {
        if !self.has_next_row() {
            return Err(FramingError::NoNextRow(self.current_row).into());
        }
        self.load_row(self.current_row + 1)?;
        debug!(
            "row {}: {} bytes, {} packets",
            self.current_row,
            self.row_payload.len(),
            self.row_packet_count
        );
        Ok(())
    }

    /// Advance and return the next raw payload chunk, padded to the frame's
    /// payload size.
    pub fn get_next_packet(&mut self) -> Result<Vec<u8>, Error> {
        if !self.has_next_packet_in_row() {
            return Err(FramingError::RowExhausted {
                row: self.current_row,
                index: self.index_in_current_row,
                count: self.row_packet_count,
            }
            .into());
        }
        self.index += 1;
        self.index_in_current_row += 1;

        let size = self.kind.payload_size();
        let start = self.index_in_current_row as usize * size;
        let end = (start + size).min(self.row_payload.len());
        let mut chunk = Vec::with_capacity(size);
        chunk.extend_from_slice(&self.row_payload[start..end]);
        self.bytes_framed += chunk.len();
        chunk.resize(size, PAD_BYTE);
        Ok(chunk)
    }

    /// Frame a chunk with this cursor's header kind.
    pub fn packet_format(&self, chunk: &[u8]) -> Packet {
        packet_format(self.kind, chunk)
    }

    /// Next frame in cursor order, crossing row boundaries as needed.
    /// `None` once every row is exhausted.
    pub fn next_frame(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if self.has_next_packet_in_row() {
                let chunk = self.get_next_packet()?;
                return Ok(Some(self.packet_format(&chunk)));
            }
            if !self.has_next_row() {
                return Ok(None);
            }
            self.cursor_move_to_next_row()?;
        }
    }

    /// Update the progress percentage; true when the UI should refresh.
    pub fn invalidate_progress(&mut self) -> bool {
        self.invalidate_progress_at(Instant::now())
    }

    pub(crate) fn invalidate_progress_at(&mut self, now: Instant) -> bool {
        let done = (self.index + 1) as usize;
        self.progress.update(done, self.total_packet_count, now)
    }

    pub fn progress(&self) -> f64 {
        self.progress.percent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{LayoutDirection, MultiRowData, OtaData, RowData};
    use crate::store::test_store;

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn frame_table() {
        let sizes: Vec<(u8, usize, u32)> = FrameKind::ALL
            .iter()
            .map(|k| (k.header(), k.payload_size(), k.precision()))
            .collect();
        assert_eq!(
            sizes,
            vec![
                (0x18, 128, 2),
                (0x19, 512, 1),
                (0x1A, 1024, 0),
                (0x1B, 2048, 0),
                (0x1C, 5120, 0),
                (0x1D, 10240, 0),
                (0x1E, 124, 2),
            ]
        );
        assert_eq!(FrameKind::from_header(0x1E), Some(FrameKind::StxE));
        assert_eq!(FrameKind::from_header(0x17), None);
        assert_eq!("stx-e".parse::<FrameKind>(), Ok(FrameKind::StxE));
        assert_eq!("SOH".parse::<FrameKind>(), Ok(FrameKind::Soh));
        assert!("stx-f".parse::<FrameKind>().is_err());
    }

    #[test]
    fn packet_layout() {
        let packet = packet_format(FrameKind::Soh, &[0x42; 128]);
        assert_eq!(packet.len(), 132);
        assert_eq!(packet.header(), 0x18);
        assert_eq!(packet.as_bytes()[1], 0xE7);
        assert_eq!(packet.payload(), &[0x42; 128][..]);
        assert_eq!(packet.crc(), crc16(&packet.as_bytes()[..130]));
        assert!(packet.is_valid());
    }

    #[test]
    fn corrupted_packet_is_invalid() {
        let packet = packet_format(FrameKind::StxE, &[0; 124]);
        let mut bytes = packet.as_bytes().to_vec();
        bytes[10] ^= 0x01;
        assert!(!Packet { bytes }.is_valid());
    }

    #[test]
    fn chunks_reassemble_payload() {
        let store = test_store();
        for len in [1usize, 123, 124, 125, 1000, 4096] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            let ota = OtaData::create(&store, &payload).unwrap();
            for kind in FrameKind::ALL {
                let mut framer = PacketFramer::new(kind, &ota).unwrap();
                let mut joined = Vec::new();
                while framer.has_next_packet() {
                    let chunk = framer.get_next_packet().unwrap();
                    assert_eq!(chunk.len(), kind.payload_size());
                    let frame = framer.packet_format(&chunk);
                    assert_eq!(frame.len(), kind.frame_size());
                    assert!(frame.is_valid());
                    joined.extend(chunk);
                }
                assert_eq!(framer.index(), framer.total_packet_count() as i64 - 1);
                assert!(joined[len..].iter().all(|&b| b == PAD_BYTE));
                joined.truncate(len);
                assert_eq!(joined, payload, "{} bytes as {}", len, kind);
                assert_eq!(framer.bytes_framed(), len);
            }
        }
    }

    #[test]
    fn exhausted_row_is_an_error() {
        let store = test_store();
        let row = RowData::create(&store, &[1; 10], false).unwrap();
        let mut framer = PacketFramer::new(FrameKind::StxE, &row).unwrap();
        framer.get_next_packet().unwrap();
        assert!(!framer.has_next_packet());
        assert!(matches!(
            framer.get_next_packet(),
            Err(Error::Framing(FramingError::RowExhausted { .. }))
        ));
        assert!(matches!(
            framer.cursor_move_to_next_row(),
            Err(Error::Framing(FramingError::NoNextRow(0)))
        ));
    }

    #[test]
    fn multi_row_cursor() {
        let store = test_store();
        let mut data = MultiRowData::new(LayoutDirection::Vertical, false);
        data.push(RowData::create(&store, &[1; 200], false).unwrap())
            .unwrap();
        data.push(RowData::create(&store, &[2; 50], false).unwrap())
            .unwrap();

        let mut framer = PacketFramer::new(FrameKind::StxE, &data).unwrap();
        assert_eq!(framer.total_packet_count(), 3);
        assert!(framer.has_next_row());

        let first = framer.get_next_packet().unwrap();
        assert_eq!(first, vec![1; 124]);
        let second = framer.get_next_packet().unwrap();
        assert_eq!(&second[..76], &[1; 76][..]);
        assert_eq!(&second[76..], &[PAD_BYTE; 48][..]);
        assert!(!framer.has_next_packet_in_row());
        assert!(framer.has_next_packet());

        framer.cursor_move_to_next_row().unwrap();
        assert_eq!(framer.current_row(), 1);
        assert_eq!(framer.index_in_current_row(), -1);
        assert!(!framer.has_next_row());

        let third = framer.get_next_packet().unwrap();
        assert_eq!(&third[..50], &[2; 50][..]);
        assert_eq!(framer.index(), 2);
        assert_eq!(framer.index_in_current_row(), 0);
        assert!(!framer.has_next_packet());
        assert!(framer.next_frame().unwrap().is_none());
    }

    #[test]
    fn next_frame_walks_all_rows() {
        let store = test_store();
        let mut data = MultiRowData::new(LayoutDirection::Vertical, false);
        for len in [300, 124, 1] {
            data.push(RowData::create(&store, &vec![0; len], false).unwrap())
                .unwrap();
        }
        let mut framer = PacketFramer::new(FrameKind::StxE, &data).unwrap();
        let mut frames = 0;
        while let Some(frame) = framer.next_frame().unwrap() {
            assert_eq!(frame.len(), 128);
            frames += 1;
        }
        assert_eq!(frames, 3 + 1 + 1);
        assert_eq!(frames, framer.total_packet_count());
    }

    #[test]
    fn progress_is_throttled() {
        let mut progress = Progress::new(0);
        let start = Instant::now();
        assert!(progress.update(0, 1000, start));
        // 0.4% rounds to 0: unchanged and within a second
        assert!(!progress.update(4, 1000, start + Duration::from_millis(10)));
        assert!(progress.update(5, 1000, start + Duration::from_millis(20)));
        assert_eq!(progress.percent(), 1.0);
        assert!(!progress.update(6, 1000, start + Duration::from_millis(500)));
        assert!(progress.update(6, 1000, start + Duration::from_millis(1020)));
    }

    #[test]
    fn progress_precision() {
        let mut progress = Progress::new(2);
        progress.update(1, 3, Instant::now());
        assert_eq!(progress.percent(), 33.33);
        let mut progress = Progress::new(1);
        progress.update(2, 3, Instant::now());
        assert_eq!(progress.percent(), 66.7);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let store = test_store();
        let ota = OtaData::create(&store, &[]).unwrap();
        assert!(matches!(
            PacketFramer::new(FrameKind::Soh, &ota),
            Err(Error::Framing(FramingError::EmptyPayload))
        ));
    }
}
