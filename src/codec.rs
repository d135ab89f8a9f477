//! Reversible byte codecs for packed printhead data.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};

use crate::error::{EncodingError, Error};

/// Lossless compressor applied to packed column data before storage.
pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// PackBits run-length coding.
///
/// A header byte `n` in `0..=127` is followed by `n + 1` literal bytes; a
/// header in `-127..=-1` repeats the next byte `1 - n` times. `-128` is never
/// emitted.
#[derive(Debug, Default, Clone, Copy)]
pub struct PackBits;

const MAX_RUN: usize = 128;

impl Codec for PackBits {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut packed = Vec::with_capacity(data.len() / 2);
        let mut i = 0;

        while i < data.len() {
            let run_value = data[i];
            let mut run_length = 1;
            while i + run_length < data.len()
                && run_length < MAX_RUN
                && data[i + run_length] == run_value
            {
                run_length += 1;
            }

            if run_length > 1 {
                packed.push((1i16 - run_length as i16) as i8 as u8);
                packed.push(run_value);
                i += run_length;
                continue;
            }

            // Literal run stops where a repeat of two or more begins.
            let start = i;
            i += 1;
            while i < data.len()
                && i - start < MAX_RUN
                && !(i + 1 < data.len() && data[i] == data[i + 1])
            {
                i += 1;
            }
            packed.push((i - start - 1) as u8);
            packed.extend_from_slice(&data[start..i]);
        }

        Ok(packed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(data.len() * 2);
        let mut i = 0;

        while i < data.len() {
            let header = data[i] as i8;
            i += 1;
            if header >= 0 {
                let len = header as usize + 1;
                let literal = data.get(i..i + len).ok_or_else(truncated)?;
                out.extend_from_slice(literal);
                i += len;
            } else if header != -128 {
                let value = *data.get(i).ok_or_else(truncated)?;
                out.extend(std::iter::repeat(value).take(1 + (-(header as i16)) as usize));
                i += 1;
            }
        }

        Ok(out)
    }
}

fn truncated() -> Error {
    EncodingError::Codec {
        codec: "PackBits",
        reason: "truncated input".to_string(),
    }
    .into()
}

fn zlib_error(err: std::io::Error) -> Error {
    EncodingError::Codec {
        codec: "zlib",
        reason: err.to_string(),
    }
    .into()
}

/// zlib stream at the default compression level.
#[derive(Debug, Default, Clone, Copy)]
pub struct Zlib;

impl Codec for Zlib {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).map_err(zlib_error)?;
        encoder.finish().map_err(zlib_error)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(zlib_error)?;
        Ok(out)
    }
}
