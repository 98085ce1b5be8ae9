//! Pixel conversion into the packed ARGB working format

use bytes::Bytes;

use crate::capture::frame::{Frame, PixelFormat, Rotation};
use crate::error::FilterError;

/// Packed 0xAARRGGBB image the filter effects operate on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgbImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u32>,
}

impl ArgbImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0xff00_0000; width as usize * height as usize],
        }
    }

    pub fn filled(width: u32, height: u32, argb: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![argb; width as usize * height as usize],
        }
    }

    /// Decode a camera frame, turning it upright according to its rotation
    pub fn from_frame(frame: &Frame) -> Result<Self, FilterError> {
        let (width, height) = (frame.width(), frame.height());
        let expected = frame.format().frame_len(width, height);
        if frame.data.len() < expected {
            return Err(FilterError::ShortBuffer {
                expected,
                actual: frame.data.len(),
            });
        }

        let image = match frame.format() {
            PixelFormat::Nv21 => nv21_to_argb(&frame.data, width, height),
            PixelFormat::Argb => Self {
                width,
                height,
                pixels: frame.data[..expected]
                    .chunks_exact(4)
                    .map(|p| u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
                    .collect(),
            },
        };

        Ok(image.rotated(frame.meta.rotation))
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u32 {
        self.pixels[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, argb: u32) {
        self.pixels[(y * self.width + x) as usize] = argb;
    }

    /// Rotate clockwise by `rotation`
    pub fn rotated(self, rotation: Rotation) -> Self {
        let (w, h) = (self.width, self.height);
        match rotation {
            Rotation::Deg0 => self,
            Rotation::Deg180 => Self {
                width: w,
                height: h,
                pixels: self.pixels.into_iter().rev().collect(),
            },
            Rotation::Deg90 | Rotation::Deg270 => {
                let mut out = Self::new(h, w);
                for y in 0..h {
                    for x in 0..w {
                        let (nx, ny) = if rotation == Rotation::Deg90 {
                            (h - 1 - y, x)
                        } else {
                            (y, w - 1 - x)
                        };
                        out.set(nx, ny, self.get(x, y));
                    }
                }
                out
            }
        }
    }

    /// Serialise as A, R, G, B bytes per pixel
    pub fn into_bytes(self) -> Bytes {
        let mut out = Vec::with_capacity(self.pixels.len() * 4);
        for p in self.pixels {
            out.extend_from_slice(&p.to_be_bytes());
        }
        Bytes::from(out)
    }
}

#[inline]
fn clamp(v: i32) -> u32 {
    v.clamp(0, 255) as u32
}

/// BT.601 limited-range NV21 (Y plane, then interleaved V/U) to ARGB
pub fn nv21_to_argb(data: &[u8], width: u32, height: u32) -> ArgbImage {
    let (w, h) = (width as usize, height as usize);
    let chroma_stride = 2 * w.div_ceil(2);
    let (luma, chroma) = data.split_at(w * h);
    let mut image = ArgbImage::new(width, height);

    for y in 0..h {
        let chroma_row = &chroma[(y / 2) * chroma_stride..];
        for x in 0..w {
            let c = luma[y * w + x] as i32 - 16;
            let v = chroma_row[(x / 2) * 2] as i32 - 128;
            let u = chroma_row[(x / 2) * 2 + 1] as i32 - 128;

            let r = clamp((298 * c + 409 * v + 128) >> 8);
            let g = clamp((298 * c - 100 * u - 208 * v + 128) >> 8);
            let b = clamp((298 * c + 516 * u + 128) >> 8);

            image.pixels[y * w + x] = 0xff00_0000 | (r << 16) | (g << 8) | b;
        }
    }

    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;

    fn nv21(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let mut data = vec![y; (width * height) as usize];
        let chroma = PixelFormat::Nv21.frame_len(width, height) - data.len();
        for _ in 0..chroma / 2 {
            data.push(v);
            data.push(u);
        }
        data
    }

    #[test]
    fn neutral_chroma_gives_gray() {
        let image = nv21_to_argb(&nv21(4, 2, 128, 128, 128), 4, 2);
        assert!(image.pixels.iter().all(|&p| p == 0xff82_8282));

        let white = nv21_to_argb(&nv21(2, 2, 235, 128, 128), 2, 2);
        assert!(white.pixels.iter().all(|&p| p == 0xffff_ffff));
    }

    #[test]
    fn strong_v_is_red() {
        let image = nv21_to_argb(&nv21(2, 2, 81, 90, 240), 2, 2);
        let p = image.pixels[0];
        let (r, g, b) = ((p >> 16) & 0xff, (p >> 8) & 0xff, p & 0xff);
        assert!(r > 230 && g < 20 && b < 20, "got {r} {g} {b}");
    }

    #[test]
    fn short_frames_are_rejected() {
        let frame = Frame::new(vec![0u8; 5], FrameMetadata::new(1, 4, 2, PixelFormat::Nv21));
        assert!(matches!(
            ArgbImage::from_frame(&frame),
            Err(FilterError::ShortBuffer { expected: 12, actual: 5 })
        ));
    }

    #[test]
    fn quarter_turn_moves_top_left_to_top_right() {
        let mut image = ArgbImage::new(3, 2);
        image.set(0, 0, 1);
        let turned = image.clone().rotated(Rotation::Deg90);
        assert_eq!((turned.width, turned.height), (2, 3));
        assert_eq!(turned.get(1, 0), 1);

        let back = turned.rotated(Rotation::Deg270);
        assert_eq!(back, image);
    }

    #[test]
    fn argb_bytes_survive_decoding() {
        let image = ArgbImage::filled(2, 1, 0x8012_3456);
        let frame = Frame::new(
            image.clone().into_bytes(),
            FrameMetadata::new(1, 2, 1, PixelFormat::Argb),
        );
        assert_eq!(ArgbImage::from_frame(&frame).unwrap(), image);
    }
}
