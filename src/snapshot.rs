// src/snapshot.rs
//
// Evidence crops for alarms and their JPEG encoding for transport.

use image::{ImageBuffer, RgbImage};

use crate::types::{Frame, Rect};

const JPEG_QUALITY: u8 = 80;

/// Region saved as evidence: the object box grown by a quarter of its size
/// on the top/left and to 1.5× overall, clamped to the frame.
pub fn evidence_region(rect: &Rect, frame_width: usize, frame_height: usize) -> Option<Rect> {
    let cols = frame_width as i32;
    let rows = frame_height as i32;

    let x = (rect.x - rect.width / 4).max(0);
    let y = (rect.y - rect.height / 4).max(0);
    let width = (cols - x).min(rect.width * 3 / 2);
    let height = (rows - y).min(rect.height * 3 / 2);

    let region = Rect::new(x, y, width, height);
    if region.is_degenerate() {
        None
    } else {
        Some(region)
    }
}

pub fn crop_evidence(frame: &Frame, rect: &Rect) -> Option<RgbImage> {
    if frame.is_empty() {
        return None;
    }
    let region = evidence_region(rect, frame.width, frame.height)?;

    let (x0, y0) = (region.x as usize, region.y as usize);
    let (w, h) = (region.width as usize, region.height as usize);
    let stride = frame.width * 3;

    let mut data = Vec::with_capacity(w * h * 3);
    for row in y0..y0 + h {
        let start = row * stride + x0 * 3;
        data.extend_from_slice(&frame.data[start..start + w * 3]);
    }

    ImageBuffer::from_raw(w as u32, h as u32, data)
}

pub fn encode_jpeg(img: &RgbImage) -> Option<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY);
    img.write_with_encoder(encoder).ok()?;
    Some(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_expands_around_object() {
        let region = evidence_region(&Rect::new(150, 150, 50, 50), 720, 480).unwrap();
        assert_eq!(region, Rect::new(138, 138, 75, 75));
    }

    #[test]
    fn test_region_clamped_to_frame() {
        let region = evidence_region(&Rect::new(0, 0, 100, 100), 120, 120).unwrap();
        assert_eq!(region, Rect::new(0, 0, 120, 120));

        let region = evidence_region(&Rect::new(700, 460, 40, 40), 720, 480).unwrap();
        assert_eq!(region, Rect::new(690, 450, 30, 30));
    }

    #[test]
    fn test_region_outside_frame_is_none() {
        assert!(evidence_region(&Rect::new(800, 10, 20, 20), 720, 480).is_none());
    }

    #[test]
    fn test_crop_from_empty_frame_is_none() {
        let frame = Frame::blank(0, 0, 0.0);
        assert!(crop_evidence(&frame, &Rect::new(0, 0, 10, 10)).is_none());
    }

    #[test]
    fn test_crop_copies_pixels() {
        let mut frame = Frame::blank(4, 4, 0.0);
        // Mark pixel (1,1) red.
        let idx = (4 + 1) * 3;
        frame.data[idx] = 255;
        let crop = crop_evidence(&frame, &Rect::new(1, 1, 2, 2)).unwrap();
        assert_eq!(crop.dimensions(), (3, 3));
        assert_eq!(crop.get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_jpeg_encoding_produces_bytes() {
        let img = RgbImage::new(8, 8);
        let jpeg = encode_jpeg(&img).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
