//! Repacking of driver buffers into tightly packed NV21
//!
//! Drivers pad rows to `bytesperline` and many UVC cameras only offer packed
//! YUYV. Everything downstream of the capture device expects unpadded NV21.

use crate::capture::frame::PixelFormat;

fn chroma_dims(width: u32, height: u32) -> (usize, usize) {
    (width.div_ceil(2) as usize, height.div_ceil(2) as usize)
}

#[inline]
fn average(a: u8, b: u8) -> u8 {
    ((u16::from(a) + u16::from(b) + 1) / 2) as u8
}

/// Drop row padding from an NV21 buffer whose planes share `stride`.
/// `None` when the buffer is too short for the geometry.
pub fn compact_nv21(src: &[u8], width: u32, height: u32, stride: u32) -> Option<Vec<u8>> {
    let (w, h, stride) = (width as usize, height as usize, stride as usize);
    let (cw, ch) = chroma_dims(width, height);
    let chroma_row = cw * 2;
    if stride < w.max(chroma_row) {
        return None;
    }
    if h == 0 {
        return Some(Vec::new());
    }
    // The last chroma row need not carry padding
    let needed = stride * (h + ch) - (stride - chroma_row);
    if src.len() < needed {
        return None;
    }

    let mut out = Vec::with_capacity(PixelFormat::Nv21.frame_len(width, height));
    for row in src.chunks(stride).take(h) {
        out.extend_from_slice(&row[..w]);
    }
    for row in src[stride * h..].chunks(stride).take(ch) {
        out.extend_from_slice(&row[..chroma_row]);
    }
    Some(out)
}

/// Convert packed YUYV (4:2:2) to NV21 (4:2:0), averaging chroma over each
/// pair of rows. Width must be even.
pub fn yuyv_to_nv21(src: &[u8], width: u32, height: u32, stride: u32) -> Option<Vec<u8>> {
    let (w, h, stride) = (width as usize, height as usize, stride as usize);
    if width % 2 != 0 || stride < w * 2 {
        return None;
    }
    if h == 0 {
        return Some(Vec::new());
    }
    if src.len() < stride * (h - 1) + w * 2 {
        return None;
    }

    let (cw, ch) = chroma_dims(width, height);
    let mut out = vec![0u8; PixelFormat::Nv21.frame_len(width, height)];
    let (luma, chroma) = out.split_at_mut(w * h);

    for y in 0..h {
        let row = &src[y * stride..y * stride + w * 2];
        for (x, pixel) in row.chunks_exact(2).enumerate() {
            luma[y * w + x] = pixel[0];
        }
    }

    for cy in 0..ch {
        let top = &src[2 * cy * stride..];
        let bottom = &src[(2 * cy + 1).min(h - 1) * stride..];
        let out_row = &mut chroma[cy * cw * 2..(cy + 1) * cw * 2];
        for cx in 0..cw {
            let i = cx * 4;
            out_row[cx * 2] = average(top[i + 3], bottom[i + 3]);
            out_row[cx * 2 + 1] = average(top[i + 1], bottom[i + 1]);
        }
    }

    Some(out)
}
