//! Image effects applied by the video filters

use serde::{Deserialize, Serialize};

use crate::filters::convert::ArgbImage;

/// Axis-aligned box in image coordinates. May extend past the image; the
/// effects clip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clip to a `width` x `height` image as half-open (x0, y0, x1, y1)
    pub fn clip(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (self.x as i64 + self.width as i64).min(width as i64);
        let y1 = (self.y as i64 + self.height as i64).min(height as i64);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as u32, y0 as u32, x1 as u32, y1 as u32))
    }
}

/// Per-pixel foreground confidence in `[0, 1]`, possibly at a lower
/// resolution than the image it describes
#[derive(Debug, Clone, PartialEq)]
pub struct ForegroundMask {
    pub width: u32,
    pub height: u32,
    pub confidence: Vec<f32>,
}

impl ForegroundMask {
    /// Confidence at image pixel (x, y) of an image sized `w` x `h`
    fn sample(&self, x: u32, y: u32, w: u32, h: u32) -> f32 {
        if self.width == 0 || self.height == 0 {
            return 1.0;
        }
        let mx = (x as u64 * self.width as u64 / w as u64) as u32;
        let my = (y as u64 * self.height as u64 / h as u64) as u32;
        self.confidence
            .get((my * self.width + mx) as usize)
            .copied()
            .unwrap_or(1.0)
    }
}

#[inline]
fn channels(p: u32) -> [u32; 4] {
    [(p >> 24) & 0xff, (p >> 16) & 0xff, (p >> 8) & 0xff, p & 0xff]
}

#[inline]
fn pack(c: [u32; 4]) -> u32 {
    (c[0] << 24) | (c[1] << 16) | (c[2] << 8) | c[3]
}

/// Replace each `block` x `block` cell inside `rect` with its average colour
pub fn pixelate(image: &mut ArgbImage, rect: Rect, block: u32) {
    let Some((x0, y0, x1, y1)) = rect.clip(image.width, image.height) else {
        return;
    };
    let block = block.max(1);

    for by in (y0..y1).step_by(block as usize) {
        for bx in (x0..x1).step_by(block as usize) {
            let (ex, ey) = ((bx + block).min(x1), (by + block).min(y1));

            let mut sum = [0u32; 4];
            for y in by..ey {
                for x in bx..ex {
                    let c = channels(image.get(x, y));
                    for i in 0..4 {
                        sum[i] += c[i];
                    }
                }
            }
            let count = (ex - bx) * (ey - by);
            let avg = pack([0xff, sum[1] / count, sum[2] / count, sum[3] / count]);

            for y in by..ey {
                for x in bx..ex {
                    image.set(x, y, avg);
                }
            }
        }
    }
}

/// Separable box blur with the given radius
pub fn box_blur(image: &ArgbImage, radius: u32) -> ArgbImage {
    if radius == 0 || image.pixels.is_empty() {
        return image.clone();
    }
    let horizontal = blur_pass(image, radius, true);
    blur_pass(&horizontal, radius, false)
}

fn blur_pass(image: &ArgbImage, radius: u32, horizontal: bool) -> ArgbImage {
    let (w, h) = (image.width, image.height);
    let (len, lines) = if horizontal { (w, h) } else { (h, w) };
    let at = |line: u32, i: u32| {
        if horizontal {
            image.get(i, line)
        } else {
            image.get(line, i)
        }
    };

    let mut out = ArgbImage::new(w, h);
    let r = radius as i64;
    for line in 0..lines {
        // Edge pixels are clamped, so every window holds 2r + 1 samples
        let clamped = |i: i64| at(line, i.clamp(0, len as i64 - 1) as u32);
        let mut sum = [0u32; 4];
        for i in -r..=r {
            let c = channels(clamped(i));
            for k in 0..4 {
                sum[k] += c[k];
            }
        }

        let window = 2 * radius + 1;
        for i in 0..len as i64 {
            let avg = pack([
                sum[0] / window,
                sum[1] / window,
                sum[2] / window,
                sum[3] / window,
            ]);
            if horizontal {
                out.set(i as u32, line, avg);
            } else {
                out.set(line, i as u32, avg);
            }

            let leaving = channels(clamped(i - r));
            let entering = channels(clamped(i + r + 1));
            for k in 0..4 {
                sum[k] = sum[k] + entering[k] - leaving[k];
            }
        }
    }
    out
}

/// Blur every pixel whose foreground confidence is below `threshold`
pub fn blur_background(image: &mut ArgbImage, mask: &ForegroundMask, radius: u32, threshold: f32) {
    let blurred = box_blur(image, radius);
    let (w, h) = (image.width, image.height);
    for y in 0..h {
        for x in 0..w {
            if mask.sample(x, y, w, h) < threshold {
                image.set(x, y, blurred.get(x, y));
            }
        }
    }
}
