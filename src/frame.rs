//! Video frames and the Motion-JPEG helpers shared by the recorder, the
//! frame sources and the remote detector.

use std::borrow::Cow;
use std::io::Write;
use std::ops::Range;

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};

/// A captured RGB frame and the moment it was read from the source.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Utc>) -> Self {
        Self { image, captured_at }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Resize `image` to `(width, height)`, borrowing it untouched when it
/// already has that size.
pub fn resize_to(image: &RgbImage, (width, height): (u32, u32)) -> Cow<'_, RgbImage> {
    if image.dimensions() == (width, height) {
        Cow::Borrowed(image)
    } else {
        Cow::Owned(imageops::resize(image, width, height, FilterType::Triangle))
    }
}

/// Encode an RGB image as a baseline JPEG into `writer`.
pub fn encode_jpeg<W: Write>(
    image: &RgbImage,
    quality: u8,
    writer: &mut W,
) -> Result<(), image::ImageError> {
    let encoder = JpegEncoder::new_with_quality(writer, quality);
    image.write_with_encoder(encoder)
}

/// Encode an RGB image as JPEG bytes.
pub fn jpeg_bytes(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    encode_jpeg(image, quality, &mut buf)?;
    Ok(buf)
}

pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?.to_rgb8())
}

/// One image slot inside a Motion-JPEG byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MjpegChunk {
    /// A structurally complete JPEG image.
    Image(Range<usize>),
    /// An image whose marker structure is broken. Spans up to the next
    /// start-of-image marker.
    Damaged(Range<usize>),
}

/// Walk a Motion-JPEG byte stream, reporting intact and damaged images in
/// stream order.
///
/// Follows the marker segments of each image instead of searching for the
/// raw end-of-image bytes, which may legitimately appear inside table
/// payloads. A damaged image is skipped by resynchronizing on the next
/// start-of-image marker. A truncated trailing image is ignored.
pub fn scan_jpeg_frames(data: &[u8]) -> Vec<MjpegChunk> {
    let mut chunks = Vec::new();
    let mut pos = 0;

    while let Some(start) = find_start_of_image(data, pos) {
        match end_of_image(data, start) {
            Some(end) => {
                chunks.push(MjpegChunk::Image(start..end));
                pos = end;
            }
            None => match find_start_of_image(data, start + 2) {
                Some(next) => {
                    chunks.push(MjpegChunk::Damaged(start..next));
                    pos = next;
                }
                None => break,
            },
        }
    }

    chunks
}

/// Locate the intact JPEG images inside a Motion-JPEG byte stream.
pub fn split_jpeg_frames(data: &[u8]) -> Vec<Range<usize>> {
    scan_jpeg_frames(data)
        .into_iter()
        .filter_map(|chunk| match chunk {
            MjpegChunk::Image(range) => Some(range),
            MjpegChunk::Damaged(_) => None,
        })
        .collect()
}

fn find_start_of_image(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == [0xFF, 0xD8])
        .map(|offset| from + offset)
}

fn end_of_image(data: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 2;

    loop {
        if *data.get(i)? != 0xFF {
            return None;
        }
        let marker = *data.get(i + 1)?;
        match marker {
            // Fill byte before a marker
            0xFF => {
                i += 1;
                continue;
            }
            0xD9 => return Some(i + 2),
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                i += 2;
                continue;
            }
            _ => {}
        }

        let len = u16::from_be_bytes([*data.get(i + 2)?, *data.get(i + 3)?]) as usize;
        i += 2 + len;

        if marker == 0xDA {
            // Entropy-coded data runs until the next real marker
            loop {
                if *data.get(i)? == 0xFF {
                    let next = *data.get(i + 1)?;
                    if next == 0x00 || (0xD0..=0xD7).contains(&next) {
                        i += 2;
                        continue;
                    }
                    break;
                }
                i += 1;
            }
        }
    }
}
