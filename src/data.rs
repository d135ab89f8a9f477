//! Encoded payloads kept on disk and the length arithmetic the framer needs.

use std::path::{Path, PathBuf};

use crate::error::{Error, FramingError};
use crate::store::PayloadStore;

/// How the rows of a multi-row print are laid out on paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutDirection {
    #[default]
    Vertical,
    Horizontal,
}

/// Number of `chunk`-sized packets needed for `len` bytes.
#[inline]
pub fn packet_count(len: usize, chunk: usize) -> usize {
    (len + chunk - 1) / chunk
}

/// A payload split into one or more rows, each framed independently.
///
/// Single-blob payloads expose exactly one row.
pub trait TransferData: Send + Sync {
    fn row_count(&self) -> usize;

    fn row_len(&self, row: usize) -> usize;

    /// Read the bytes of `row` from storage.
    fn load_row(&self, row: usize) -> Result<Vec<u8>, Error>;

    fn total_len(&self) -> usize {
        (0..self.row_count()).map(|r| self.row_len(r)).sum()
    }

    /// Packets needed when every row is padded to a whole packet.
    fn total_packet_count(&self, chunk: usize) -> usize {
        (0..self.row_count())
            .map(|r| packet_count(self.row_len(r), chunk))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredBlob {
    data_length: usize,
    path: PathBuf,
}

impl StoredBlob {
    fn create(store: &PayloadStore, prefix: &str, bytes: &[u8]) -> Result<Self, Error> {
        let path = store.save(prefix, bytes)?;
        Ok(StoredBlob {
            data_length: bytes.len(),
            path,
        })
    }

    fn load(&self, row: usize) -> Result<Vec<u8>, Error> {
        let bytes = PayloadStore::load(&self.path)?;
        if bytes.len() != self.data_length {
            return Err(FramingError::LengthMismatch {
                row,
                expected: self.data_length,
                actual: bytes.len(),
            }
            .into());
        }
        Ok(bytes)
    }
}

/// One printable row of packed printhead data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowData {
    blob: StoredBlob,
    compressed: bool,
}

impl RowData {
    pub fn create(store: &PayloadStore, bytes: &[u8], compressed: bool) -> Result<Self, Error> {
        Ok(RowData {
            blob: StoredBlob::create(store, "row", bytes)?,
            compressed,
        })
    }

    pub fn data_length(&self) -> usize {
        self.blob.data_length
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn path(&self) -> &Path {
        &self.blob.path
    }

    /// Load the payload; fails if the stored file no longer matches
    /// `data_length`.
    pub fn data(&self) -> Result<Vec<u8>, Error> {
        self.blob.load(0)
    }

    pub fn packet_count(&self, chunk: usize) -> usize {
        packet_count(self.blob.data_length, chunk)
    }
}

impl TransferData for RowData {
    fn row_count(&self) -> usize {
        1
    }

    fn row_len(&self, _row: usize) -> usize {
        self.blob.data_length
    }

    fn load_row(&self, _row: usize) -> Result<Vec<u8>, Error> {
        self.data()
    }
}

/// Ordered rows sharing one layout direction and compression flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiRowData {
    rows: Vec<RowData>,
    direction: LayoutDirection,
    compressed: bool,
}

impl MultiRowData {
    pub fn new(direction: LayoutDirection, compressed: bool) -> Self {
        MultiRowData {
            rows: Vec::new(),
            direction,
            compressed,
        }
    }

    pub fn push(&mut self, row: RowData) -> Result<(), Error> {
        if row.compressed != self.compressed {
            return Err(FramingError::CompressionMismatch {
                row: self.rows.len(),
                expected: self.compressed,
            }
            .into());
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn rows(&self) -> &[RowData] {
        &self.rows
    }

    pub fn direction(&self) -> LayoutDirection {
        self.direction
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Delete every row file from the store.
    pub fn remove_files(&self) -> Result<(), Error> {
        for row in &self.rows {
            PayloadStore::remove(row.path())?;
        }
        Ok(())
    }
}

impl TransferData for MultiRowData {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn row_len(&self, row: usize) -> usize {
        self.rows[row].data_length()
    }

    fn load_row(&self, row: usize) -> Result<Vec<u8>, Error> {
        self.rows[row].blob.load(row)
    }
}

/// Fixed-size logo bitmap in printhead layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoData {
    blob: StoredBlob,
}

impl LogoData {
    pub fn create(store: &PayloadStore, bytes: &[u8]) -> Result<Self, Error> {
        Ok(LogoData {
            blob: StoredBlob::create(store, "logo", bytes)?,
        })
    }

    pub fn data_length(&self) -> usize {
        self.blob.data_length
    }

    pub fn path(&self) -> &Path {
        &self.blob.path
    }
}

impl TransferData for LogoData {
    fn row_count(&self) -> usize {
        1
    }

    fn row_len(&self, _row: usize) -> usize {
        self.blob.data_length
    }

    fn load_row(&self, _row: usize) -> Result<Vec<u8>, Error> {
        self.blob.load(0)
    }
}

/// Raw firmware image, shipped byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaData {
    blob: StoredBlob,
}

impl OtaData {
    pub fn create(store: &PayloadStore, bytes: &[u8]) -> Result<Self, Error> {
        Ok(OtaData {
            blob: StoredBlob::create(store, "ota", bytes)?,
        })
    }

    /// Copy a firmware file into the store.
    pub fn from_file(store: &PayloadStore, firmware: &Path) -> Result<Self, Error> {
        let bytes = PayloadStore::load(firmware)?;
        Self::create(store, &bytes)
    }

    pub fn data_length(&self) -> usize {
        self.blob.data_length
    }

    pub fn path(&self) -> &Path {
        &self.blob.path
    }
}

impl TransferData for OtaData {
    fn row_count(&self) -> usize {
        1
    }

    fn row_len(&self, _row: usize) -> usize {
        self.blob.data_length
    }

    fn load_row(&self, _row: usize) -> Result<Vec<u8>, Error> {
        self.blob.load(0)
    }
}
