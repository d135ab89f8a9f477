//! Grayscale reduction, Floyd-Steinberg dithering and binarization.
//!
//! Converts 8-bit RGB/RGBA pixels into a bilevel bitmap, one byte per pixel,
//! where `ON` marks a dot the printhead fires. Dithering errors can be carried
//! across segment boundaries so that stitched crops of one source image dither
//! as if they were a single bitmap.

use crate::error::{EncodingError, Error};

/// Value of a firing pixel in a bilevel bitmap.
pub const ON: u8 = 255;
/// Value of a blank pixel in a bilevel bitmap.
pub const OFF: u8 = 0;

// Integer luma weights, sum to 256.
const LUMA_R: u32 = 77;
const LUMA_G: u32 = 151;
const LUMA_B: u32 = 28;

/// Integer luma approximation `(R*77 + G*151 + B*28) >> 8`.
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * LUMA_R + g as u32 * LUMA_G + b as u32 * LUMA_B) >> 8) as u8
}

/// Single channel 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayBuffer {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayBuffer {
    pub fn new(width: usize, height: usize, data: Vec<u8>) -> Result<Self, Error> {
        check_len(width, height, 1, data.len())?;
        Ok(GrayBuffer {
            width,
            height,
            data,
        })
    }

    /// Reduce an interleaved RGB or RGBA buffer to gray.
    ///
    /// Alpha is composited over white first, so transparent pixels never fire.
    pub fn from_pixels(
        width: usize,
        height: usize,
        channels: usize,
        pixels: &[u8],
    ) -> Result<Self, Error> {
        if channels != 3 && channels != 4 {
            return Err(EncodingError::Channels(channels).into());
        }
        check_len(width, height, channels, pixels.len())?;

        let data = pixels
            .chunks_exact(channels)
            .map(|px| {
                let gray = luma(px[0], px[1], px[2]);
                if channels == 4 {
                    over_white(gray, px[3])
                } else {
                    gray
                }
            })
            .collect();

        Ok(GrayBuffer {
            width,
            height,
            data,
        })
    }
}

fn over_white(gray: u8, alpha: u8) -> u8 {
    let a = alpha as u32;
    ((gray as u32 * a + 255 * (255 - a)) / 255) as u8
}

fn check_len(width: usize, height: usize, channels: usize, actual: usize) -> Result<(), Error> {
    if width == 0 || height == 0 {
        return Err(EncodingError::Empty.into());
    }
    let expected = width * height * channels;
    if actual != expected {
        return Err(EncodingError::BufferSize {
            width,
            height,
            channels,
            expected,
            actual,
        }
        .into());
    }
    Ok(())
}

/// Row-major bilevel bitmap, one byte per pixel (`ON` or `OFF`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl Bitmap {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x] != OFF
    }

    pub fn count_on(&self) -> usize {
        self.data.iter().filter(|&&v| v != OFF).count()
    }

    /// Copy of rows `top..top + height`.
    pub fn crop_rows(&self, top: usize, height: usize) -> Bitmap {
        let start = top * self.width;
        Bitmap {
            width: self.width,
            height,
            data: self.data[start..start + height * self.width].to_vec(),
        }
    }
}

/// Plain threshold: a pixel is `ON` iff `gray >= threshold`.
pub fn binarize(gray: &GrayBuffer, threshold: u8) -> Bitmap {
    let data = gray
        .data
        .iter()
        .map(|&g| if g >= threshold { ON } else { OFF })
        .collect();

    Bitmap {
        width: gray.width,
        height: gray.height,
        data,
    }
}

/// Floyd-Steinberg error diffusion with integer weights 7/16, 3/16, 5/16, 1/16.
///
/// Each share is floored, so negative errors round toward minus infinity.
///
/// `carry_in` is added to the first row before thresholding. When `carry_out`
/// is given, the contributions that would land on row `height` are written
/// there instead of being dropped. Both must be exactly `width` long.
pub fn floyd_steinberg(
    gray: &GrayBuffer,
    threshold: u8,
    carry_in: Option<&[i32]>,
    mut carry_out: Option<&mut [i32]>,
) -> Result<Bitmap, Error> {
    let width = gray.width;
    let height = gray.height;
    let threshold = threshold as i32;

    if let Some(row) = carry_in {
        check_error_row(width, row.len())?;
    }
    if let Some(row) = carry_out.as_deref_mut() {
        check_error_row(width, row.len())?;
        row.fill(0);
    }

    let mut buf: Vec<i32> = gray.data.iter().map(|&g| g as i32).collect();
    if let Some(row) = carry_in {
        for (px, err) in buf[..width].iter_mut().zip(row) {
            *px += err;
        }
    }

    let mut out = vec![OFF; width * height];

    for y in 0..height {
        let last_row = y + 1 == height;
        for x in 0..width {
            let i = y * width + x;
            let old = buf[i];
            let new = if old >= threshold { ON } else { OFF };
            out[i] = new;

            let err = old - new as i32;
            if x + 1 < width {
                buf[i + 1] += (err * 7).div_euclid(16);
            }

            let below: Option<&mut [i32]> = if !last_row {
                Some(&mut buf[(y + 1) * width..(y + 2) * width])
            } else {
                carry_out.as_deref_mut()
            };
            if let Some(below) = below {
                if x > 0 {
                    below[x - 1] += (err * 3).div_euclid(16);
                }
                below[x] += (err * 5).div_euclid(16);
                if x + 1 < width {
                    below[x + 1] += err.div_euclid(16);
                }
            }
        }
    }

    Ok(Bitmap {
        width,
        height,
        data: out,
    })
}

fn check_error_row(width: usize, actual: usize) -> Result<(), Error> {
    if actual != width {
        return Err(EncodingError::ErrorRowWidth { width, actual }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(width: usize, height: usize, value: u8) -> GrayBuffer {
        GrayBuffer::new(width, height, vec![value; width * height]).unwrap()
    }

    #[test]
    fn luma_weights() {
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
        assert_eq!(luma(0, 0, 255), 27);
    }

    #[test]
    fn rgba_transparent_is_white() {
        let gray = GrayBuffer::from_pixels(2, 1, 4, &[0, 0, 0, 0, 0, 0, 0, 255]).unwrap();
        assert_eq!(gray.data, vec![255, 0]);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(GrayBuffer::from_pixels(2, 2, 3, &[0; 11]).is_err());
        assert!(GrayBuffer::from_pixels(2, 2, 2, &[0; 8]).is_err());
        assert!(GrayBuffer::new(0, 2, vec![]).is_err());

        let gray = uniform(4, 2, 0);
        let mut short = vec![0; 3];
        assert!(floyd_steinberg(&gray, 128, Some(&[0; 5]), None).is_err());
        assert!(floyd_steinberg(&gray, 128, None, Some(&mut short)).is_err());
    }

    #[test]
    fn binarize_is_inclusive() {
        let gray = GrayBuffer::new(3, 1, vec![127, 128, 129]).unwrap();
        assert_eq!(binarize(&gray, 128).data, vec![OFF, ON, ON]);
    }

    #[test]
    fn small_diffusion_matches_reference() {
        let gray = GrayBuffer::new(4, 2, vec![0, 255, 0, 255, 128, 128, 128, 128]).unwrap();
        let out = floyd_steinberg(&gray, 128, None, None).unwrap();
        assert_eq!(out.data, vec![OFF, ON, OFF, ON, ON, OFF, ON, OFF]);
    }

    #[test]
    fn negative_error_shares_round_down() {
        // 128 fires, err = -127: right -889/16 -> -56, below -635/16 -> -40,
        // below-right -127/16 -> -8. The second pixel (72) stays off.
        let gray = GrayBuffer::new(2, 1, vec![128, 128]).unwrap();
        let mut carry = vec![0; 2];
        let out = floyd_steinberg(&gray, 128, None, Some(&mut carry)).unwrap();
        assert_eq!(out.data, vec![ON, OFF]);
        assert_eq!(carry, vec![-40 + 13, -8 + 22]);
    }

    #[test]
    fn extremes_do_not_dither() {
        let black = floyd_steinberg(&uniform(16, 16, 0), 128, None, None).unwrap();
        assert_eq!(black.count_on(), 0);
        let white = floyd_steinberg(&uniform(16, 16, 255), 128, None, None).unwrap();
        assert_eq!(white.count_on(), 256);
    }

    #[test]
    fn quantization_error_is_bounded() {
        let (w, h) = (64, 64);
        for level in [32u8, 64, 128, 200, 240] {
            let gray = uniform(w, h, level);
            let out = floyd_steinberg(&gray, 128, None, None).unwrap();
            let input: i64 = gray.data.iter().map(|&v| v as i64).sum();
            let output: i64 = out.data.iter().map(|&v| v as i64).sum();
            assert!(
                (input - output).abs() <= 255 * (w + h) as i64,
                "level {}: {} vs {}",
                level,
                input,
                output
            );
        }
    }

    #[test]
    fn carry_makes_segments_continuous() {
        let (w, h1, h2) = (23, 7, 9);
        let data: Vec<u8> = (0..w * (h1 + h2)).map(|i| ((i * 37) % 256) as u8).collect();

        let whole = GrayBuffer::new(w, h1 + h2, data.clone()).unwrap();
        let expected = floyd_steinberg(&whole, 100, None, None).unwrap();

        let top = GrayBuffer::new(w, h1, data[..w * h1].to_vec()).unwrap();
        let bottom = GrayBuffer::new(w, h2, data[w * h1..].to_vec()).unwrap();
        let mut carry = vec![0; w];
        let a = floyd_steinberg(&top, 100, None, Some(&mut carry)).unwrap();
        let b = floyd_steinberg(&bottom, 100, Some(&carry), None).unwrap();

        let mut stitched = a.data;
        stitched.extend(b.data);
        assert_eq!(stitched, expected.data);
    }

    #[test]
    fn carry_out_is_reset_before_use() {
        let gray = uniform(4, 1, 128);
        let mut carry = vec![1000; 4];
        floyd_steinberg(&gray, 128, None, Some(&mut carry)).unwrap();
        assert!(carry.iter().all(|&e| e.abs() < 128));
    }
}
