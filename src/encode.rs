//! Row and multi-row encoding: image → printhead payload files.

use std::path::Path;
use std::thread::{self, JoinHandle};

use image::{imageops::FilterType, DynamicImage, GenericImageView};
use log::{debug, info, warn};

use crate::codec::{Codec, PackBits};
use crate::data::{LayoutDirection, LogoData, MultiRowData, RowData};
use crate::dither::{binarize, floyd_steinberg, GrayBuffer};
use crate::error::{EncodingError, Error};
use crate::layout::{format_binary_to_hardware_layout, PRINTHEAD_HEIGHT};
use crate::store::PayloadStore;

/// Printable height every row is scaled to.
pub const TARGET_HEIGHT: u32 = PRINTHEAD_HEIGHT as u32;

/// One source image for a printable row.
///
/// `top_beyond`/`bottom_beyond` are pixels above and below the printable
/// area. They take part in dithering but are cut before packing.
#[derive(Debug, Clone)]
pub struct RowImage {
    image: DynamicImage,
    top_beyond: u32,
    bottom_beyond: u32,
}

impl RowImage {
    pub fn new(image: DynamicImage) -> Self {
        RowImage {
            image,
            top_beyond: 0,
            bottom_beyond: 0,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let image = image::open(path).map_err(|source| EncodingError::Source {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(image))
    }

    pub fn beyond(self, top: u32, bottom: u32) -> Self {
        RowImage {
            top_beyond: top,
            bottom_beyond: bottom,
            ..self
        }
    }
}

/// Encoding settings.
///
/// # Example
///
/// ```
/// use inkline::{EncodeOptions, LayoutDirection};
///
/// let options = EncodeOptions::new(140)
///     .dithering(false)
///     .direction(LayoutDirection::Horizontal);
/// ```
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    threshold: u8,
    dithering: bool,
    compress: bool,
    flip: bool,
    direction: LayoutDirection,
    contiguous: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self::new(128)
    }
}

impl EncodeOptions {
    pub fn new(threshold: u8) -> Self {
        EncodeOptions {
            threshold,
            dithering: true,
            compress: false,
            flip: false,
            direction: LayoutDirection::Vertical,
            contiguous: false,
        }
    }

    pub fn dithering(self, dithering: bool) -> Self {
        EncodeOptions { dithering, ..self }
    }

    pub fn compress(self, compress: bool) -> Self {
        EncodeOptions { compress, ..self }
    }

    /// Mirror each row left to right.
    pub fn flip(self, flip: bool) -> Self {
        EncodeOptions { flip, ..self }
    }

    pub fn direction(self, direction: LayoutDirection) -> Self {
        EncodeOptions { direction, ..self }
    }

    /// Rows are adjacent crops of one image; dithering error flows between
    /// them.
    pub fn contiguous_cropped_images(self, contiguous: bool) -> Self {
        EncodeOptions { contiguous, ..self }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }
}

/// Turns row images into stored printhead payloads.
pub struct Encoder<C: Codec = PackBits> {
    store: PayloadStore,
    codec: C,
    options: EncodeOptions,
}

impl Encoder<PackBits> {
    pub fn new(store: PayloadStore, options: EncodeOptions) -> Self {
        Self::with_codec(store, PackBits, options)
    }
}

impl<C: Codec> Encoder<C> {
    pub fn with_codec(store: PayloadStore, codec: C, options: EncodeOptions) -> Self {
        Encoder {
            store,
            codec,
            options,
        }
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    /// Encode a single image as a one-row payload.
    pub fn encode(&self, image: &DynamicImage) -> Result<MultiRowData, Error> {
        self.encode_rows(&[RowImage::new(image.clone())])
    }

    /// Encode every row. Any failure discards the rows already written.
    pub fn encode_rows(&self, rows: &[RowImage]) -> Result<MultiRowData, Error> {
        let options = &self.options;
        let mut data = MultiRowData::new(options.direction, options.compress);
        let mut carry: Option<Vec<i32>> = None;

        info!(
            "encoding {} row(s), threshold {}, dithering {}, {:?}",
            rows.len(),
            options.threshold,
            options.dithering,
            options.direction
        );

        for (index, row) in rows.iter().enumerate() {
            let is_last = index + 1 == rows.len();
            let result = self
                .row_bytes(row, carry.as_deref(), !is_last && options.contiguous)
                .and_then(|(bytes, carry_out)| {
                    carry = carry_out;
                    RowData::create(&self.store, &bytes, options.compress)
                })
                .and_then(|row_data| data.push(row_data));

            if let Err(err) = result {
                warn!("row {} failed, discarding {} encoded row(s)", index, data.len());
                if let Err(cleanup) = data.remove_files() {
                    debug!("cleanup failed: {}", cleanup);
                }
                return Err(EncodingError::Row {
                    index,
                    source: Box::new(err),
                }
                .into());
            }
        }

        Ok(data)
    }

    /// Encode a logo bitmap; no error carry.
    pub fn encode_logo(&self, image: &DynamicImage) -> Result<LogoData, Error> {
        let (bytes, _) = self.row_bytes(&RowImage::new(image.clone()), None, false)?;
        LogoData::create(&self.store, &bytes)
    }

    /// Packed (and compressed if enabled) bytes of one row, plus the error row
    /// for the next segment when `want_carry` is set.
    fn row_bytes(
        &self,
        row: &RowImage,
        carry_in: Option<&[i32]>,
        want_carry: bool,
    ) -> Result<(Vec<u8>, Option<Vec<i32>>), Error> {
        let options = &self.options;
        let (image, top) = prepare(row, options)?;
        let (width, height) = image.dimensions();
        let rgba = image.to_rgba8();
        let gray = GrayBuffer::from_pixels(width as usize, height as usize, 4, rgba.as_raw())?;

        let mut carry_out = if want_carry {
            Some(vec![0i32; gray.width])
        } else {
            None
        };

        let bitmap = if options.dithering {
            floyd_steinberg(&gray, options.threshold, carry_in, carry_out.as_deref_mut())?
        } else {
            binarize(&gray, options.threshold)
        };

        let printable = bitmap.crop_rows(top as usize, PRINTHEAD_HEIGHT);
        let packed = format_binary_to_hardware_layout(&printable)?;
        debug!(
            "row {}x{} packed to {} bytes",
            printable.width,
            printable.height,
            packed.len()
        );

        let bytes = if options.compress {
            let compressed = self.codec.compress(&packed)?;
            debug!("compressed {} -> {} bytes", packed.len(), compressed.len());
            compressed
        } else {
            packed
        };

        Ok((bytes, carry_out))
    }
}

impl<C: Codec + 'static> Encoder<C> {
    /// Run [`Encoder::encode_rows`] on a worker thread.
    pub fn spawn(self, rows: Vec<RowImage>) -> JoinHandle<Result<MultiRowData, Error>> {
        thread::spawn(move || self.encode_rows(&rows))
    }
}

/// Wait for a worker started with [`Encoder::spawn`].
pub fn join(handle: JoinHandle<Result<MultiRowData, Error>>) -> Result<MultiRowData, Error> {
    handle
        .join()
        .map_err(|_| Error::from(EncodingError::WorkerPanicked))?
}

/// Rotate, mirror and scale a row so its printable band is exactly
/// `TARGET_HEIGHT` tall. Returns the image and the scaled top beyond.
fn prepare(row: &RowImage, options: &EncodeOptions) -> Result<(DynamicImage, u32), Error> {
    let mut image = match options.direction {
        LayoutDirection::Vertical => row.image.clone(),
        LayoutDirection::Horizontal => row.image.rotate90(),
    };
    if options.flip {
        image = image.fliph();
    }

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodingError::Empty.into());
    }
    let (top, bottom) = (row.top_beyond, row.bottom_beyond);
    if top as u64 + bottom as u64 >= height as u64 {
        return Err(EncodingError::NoValidArea {
            top,
            bottom,
            height,
        }
        .into());
    }

    let valid = height - top - bottom;
    if valid == TARGET_HEIGHT {
        return Ok((image, top));
    }

    let scale = TARGET_HEIGHT as f64 / valid as f64;
    let scaled_top = (top as f64 * scale).round() as u32;
    let scaled_bottom = (bottom as f64 * scale).round() as u32;
    let scaled_width = ((width as f64 * scale).round() as u32).max(1);
    let scaled_height = scaled_top + TARGET_HEIGHT + scaled_bottom;
    debug!(
        "scaling {}x{} to {}x{}",
        width, height, scaled_width, scaled_height
    );

    Ok((
        image.resize_exact(scaled_width, scaled_height, FilterType::Triangle),
        scaled_top,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TransferData;
    use crate::layout::COLUMN_BYTES;
    use crate::store::test_store;
    use image::{GrayImage, Luma, RgbImage};

    fn gray_image(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([value])))
    }

    #[test]
    fn row_is_scaled_to_printhead() {
        let store = test_store();
        let encoder = Encoder::new(store.clone(), EncodeOptions::new(128));
        let data = encoder.encode(&gray_image(50, 276, 0)).unwrap();
        assert_eq!(data.len(), 1);
        // 50 columns doubled to 100
        assert_eq!(data.total_len(), 100 * COLUMN_BYTES);
        assert!(data.load_row(0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn beyond_rows_are_not_printed() {
        let mut pixels = GrayImage::from_pixel(4, TARGET_HEIGHT + 20, Luma([0]));
        for y in 0..10 {
            for x in 0..4 {
                pixels.put_pixel(x, y, Luma([255]));
            }
        }
        let row = RowImage::new(DynamicImage::ImageLuma8(pixels)).beyond(10, 10);
        let options = EncodeOptions::new(128).dithering(false);
        let store = test_store();
        let encoder = Encoder::new(store.clone(), options);
        let data = encoder.encode_rows(&[row]).unwrap();
        assert!(data.load_row(0).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn horizontal_rows_are_rotated() {
        let options = EncodeOptions::new(128).direction(LayoutDirection::Horizontal);
        let store = test_store();
        let encoder = Encoder::new(store.clone(), options);
        // 552 wide, 30 tall becomes 30 columns after rotation
        let data = encoder.encode(&gray_image(TARGET_HEIGHT, 30, 0)).unwrap();
        assert_eq!(data.total_len(), 30 * COLUMN_BYTES);
        assert_eq!(data.direction(), LayoutDirection::Horizontal);
    }

    #[test]
    fn flip_mirrors_columns() {
        let mut pixels = RgbImage::new(2, TARGET_HEIGHT);
        for y in 0..TARGET_HEIGHT {
            pixels.put_pixel(0, y, image::Rgb([255, 255, 255]));
        }
        let image = DynamicImage::ImageRgb8(pixels);
        let plain = EncodeOptions::new(128).dithering(false);

        let store = test_store();
        let straight = Encoder::new(store.clone(), plain.clone())
            .encode(&image)
            .unwrap()
            .load_row(0)
            .unwrap();
        let flipped = Encoder::new(store.clone(), plain.flip(true))
            .encode(&image)
            .unwrap()
            .load_row(0)
            .unwrap();

        assert_eq!(straight[..COLUMN_BYTES], flipped[COLUMN_BYTES..]);
        assert!(straight[COLUMN_BYTES..].iter().all(|&b| b == 0));
    }

    #[test]
    fn compressed_rows_round_trip() {
        let options = EncodeOptions::new(128).compress(true);
        let store = test_store();
        let encoder = Encoder::new(store.clone(), options);
        let data = encoder.encode(&gray_image(40, TARGET_HEIGHT, 128)).unwrap();
        assert!(data.is_compressed());
        assert!(data.rows()[0].is_compressed());

        let stored = data.load_row(0).unwrap();
        let unpacked = PackBits.decompress(&stored).unwrap();
        assert_eq!(unpacked.len(), 40 * COLUMN_BYTES);
    }

    #[test]
    fn contiguous_rows_share_dithering() {
        let full = gray_image(16, TARGET_HEIGHT * 2, 100);
        let top = RowImage::new(full.crop_imm(0, 0, 16, TARGET_HEIGHT));
        let bottom = RowImage::new(full.crop_imm(0, TARGET_HEIGHT, 16, TARGET_HEIGHT));

        let options = EncodeOptions::new(128).contiguous_cropped_images(true);
        let store = test_store();
        let joined = Encoder::new(store.clone(), options)
            .encode_rows(&[top, bottom])
            .unwrap();

        // Reference: dither the uncut image in one pass, then pack each half.
        let gray = GrayBuffer::new(16, 2 * PRINTHEAD_HEIGHT, vec![100; 16 * 2 * PRINTHEAD_HEIGHT])
            .unwrap();
        let whole = floyd_steinberg(&gray, 128, None, None).unwrap();
        for half in 0..2 {
            let expected = format_binary_to_hardware_layout(
                &whole.crop_rows(half * PRINTHEAD_HEIGHT, PRINTHEAD_HEIGHT),
            )
            .unwrap();
            assert_eq!(joined.load_row(half).unwrap(), expected, "row {}", half);
        }
    }

    #[test]
    fn failed_row_aborts_the_build() {
        let store = test_store();
        let encoder = Encoder::new(store.clone(), EncodeOptions::new(128));
        let rows = vec![
            RowImage::new(gray_image(8, TARGET_HEIGHT, 0)),
            RowImage::new(gray_image(8, 10, 0)).beyond(5, 5),
        ];
        let err = encoder.encode_rows(&rows).unwrap_err();
        assert!(matches!(
            err,
            Error::Encoding(EncodingError::Row { index: 1, .. })
        ));
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[test]
    fn missing_file_is_an_encoding_error() {
        let err = RowImage::open("/nonexistent/inkline.png").unwrap_err();
        assert!(matches!(err, Error::Encoding(EncodingError::Source { .. })));
    }

    #[test]
    fn worker_thread_encodes() {
        let store = test_store();
        let encoder = Encoder::new(store.clone(), EncodeOptions::new(128));
        let handle = encoder.spawn(vec![RowImage::new(gray_image(3, TARGET_HEIGHT, 0))]);
        let data = join(handle).unwrap();
        assert_eq!(data.total_len(), 3 * COLUMN_BYTES);
    }
}
