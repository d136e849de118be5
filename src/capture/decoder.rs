use zune_jpeg::JpegDecoder;

use super::frame::{FrameFormat, PixelFormat};
use crate::error::CaptureError;

/// Decodes a raw device buffer into packed RGB24, written straight into `out`.
///
/// `out` is a frame slot and must hold exactly `frame.frame_len()` bytes.
pub fn decode_into(
    data: &[u8],
    format: PixelFormat,
    frame: FrameFormat,
    out: &mut [u8],
) -> Result<(), CaptureError> {
    if data.is_empty() {
        return Err(CaptureError::EmptyFrame);
    }

    match format {
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            decoder
                .decode_headers()
                .map_err(|e| CaptureError::Decode(e.to_string()))?;
            let needed = decoder.output_buffer_size().unwrap_or(0);
            if needed != out.len() {
                return Err(CaptureError::SizeMismatch {
                    expected: out.len(),
                    actual: needed,
                });
            }
            decoder
                .decode_into(out)
                .map_err(|e| CaptureError::Decode(e.to_string()))
        }
        PixelFormat::Rgb24 => {
            check_len(data.len(), out.len())?;
            out.copy_from_slice(data);
            Ok(())
        }
        PixelFormat::Bgr24 => {
            check_len(data.len(), out.len())?;
            for (dst, src) in out.chunks_exact_mut(3).zip(data.chunks_exact(3)) {
                dst[0] = src[2];
                dst[1] = src[1];
                dst[2] = src[0];
            }
            Ok(())
        }
        PixelFormat::Yuyv4 => {
            let pixels = frame.width as usize * frame.height as usize;
            check_len(data.len(), pixels * 2)?;
            check_len(out.len(), pixels * 3)?;
            yuyv_to_rgb(data, out);
            Ok(())
        }
    }
}

fn check_len(actual: usize, expected: usize) -> Result<(), CaptureError> {
    if actual == expected {
        Ok(())
    } else {
        Err(CaptureError::SizeMismatch { expected, actual })
    }
}

/// BT.601 limited-range YUYV 4:2:2 to RGB24.
fn yuyv_to_rgb(src: &[u8], dst: &mut [u8]) {
    for (yuyv, rgb) in src.chunks_exact(4).zip(dst.chunks_exact_mut(6)) {
        let u = yuyv[1] as i32 - 128;
        let v = yuyv[3] as i32 - 128;
        write_rgb(yuyv[0], u, v, &mut rgb[..3]);
        write_rgb(yuyv[2], u, v, &mut rgb[3..]);
    }
}

#[inline]
fn write_rgb(y: u8, u: i32, v: i32, out: &mut [u8]) {
    let c = 298 * (y as i32 - 16);
    out[0] = ((c + 409 * v + 128) >> 8).clamp(0, 255) as u8;
    out[1] = ((c - 100 * u - 208 * v + 128) >> 8).clamp(0, 255) as u8;
    out[2] = ((c + 516 * u + 128) >> 8).clamp(0, 255) as u8;
}
