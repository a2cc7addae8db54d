//! Format encoders: electron counts to output bytes
//!
//! Every encoder walks the scene readout cursor row by row. When the output
//! stride is smaller than the sensor width, rows and columns are subsampled
//! by `sensor_width / stride`, skipping the native pixels in between.

use bytemuck::{Pod, Zeroable};
use rand::Rng;

use super::buffer::LockedBuffer;
use super::format::PixelFormat;
use super::scene::{Scene, B, GB, GR, R};
use super::{
    BASE_GAIN_FACTOR, BLACK_LEVEL, MAX_RAW_VALUE, READ_NOISE_VAR_AFTER_GAIN,
    READ_NOISE_VAR_BEFORE_GAIN, SATURATION_ELECTRONS,
};
use crate::error::{CameraError, Result};

/// Points in the synthetic depth cloud
pub const POINT_CLOUD_POINTS: usize = 16;
/// Serialized size of the depth cloud: a u32 count followed by the points
pub const POINT_CLOUD_BYTES: usize = 4 + POINT_CLOUD_POINTS * std::mem::size_of::<DepthPoint>();

const POINT_CONFIDENCE: f32 = 0.8;
const POINT_JITTER_STDDEV: f32 = 0.1;

/// Largest value of a 13-bit depth sample
const MAX_DEPTH: u32 = 8191;

/// Half-width of the uniform stand-in for a unit Gaussian
const NOISE_SPAN: f32 = 1.25;

/// One (x, y, z, confidence) depth point
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct DepthPoint {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub confidence: f32,
}

fn total_gain(gain: u32) -> f32 {
    gain as f32 / 100.0 * BASE_GAIN_FACTOR
}

fn noise_sample<N: Rng>(noise: &mut N) -> f32 {
    noise.gen_range(-NOISE_SPAN..NOISE_SPAN)
}

/// Subsampling step for an output `stride` against the sensor width
fn step(sensor_width: u32, stride: u32) -> u32 {
    if stride == 0 {
        1
    } else {
        (sensor_width / stride).max(1)
    }
}

/// Render `buffer` from the scene at the given sensitivity.
///
/// Compressed buffers and formats without an encoder are rejected without
/// writing anything.
pub fn render<N: Rng>(
    buffer: &mut LockedBuffer,
    scene: &mut Scene,
    gain: u32,
    noise: &mut N,
) -> Result<()> {
    match buffer.format() {
        PixelFormat::Raw16 => capture_raw(buffer, scene, gain, noise),
        PixelFormat::Rgb888 => capture_rgb(buffer, scene, gain, 3),
        PixelFormat::Rgba8888 => capture_rgb(buffer, scene, gain, 4),
        PixelFormat::Nv21 => capture_nv21(buffer, scene, gain),
        PixelFormat::Depth16 => capture_depth(buffer, scene, gain),
        PixelFormat::DepthPointCloud => capture_depth_cloud(buffer, noise),
        format @ (PixelFormat::Yv12 | PixelFormat::Blob) => Err(CameraError::UnsupportedFormat {
            stream_id: buffer.stream_id(),
            format: format.to_string(),
        }),
    }
}

/// 16-bit RGGB mosaic with shot and read noise.
///
/// A buffer narrower than the sensor reads every `inc`-th pixel, keeping the
/// mosaic pattern on the output grid.
pub fn capture_raw<N: Rng>(
    buffer: &mut LockedBuffer,
    scene: &mut Scene,
    gain: u32,
    noise: &mut N,
) -> Result<()> {
    let (sensor_w, sensor_h) = scene.sensor_size();
    let inc = step(sensor_w, buffer.stride());
    let width = (sensor_w / inc).min(buffer.stride()).min(buffer.width());
    let height = (sensor_h / inc).min(buffer.height());
    let stride = buffer.stride().max(width) as usize;
    buffer.ensure_len(stride * height as usize * 2)?;

    let total_gain = total_gain(gain);
    let noise_var_gain = total_gain * total_gain;
    let read_noise_var = READ_NOISE_VAR_BEFORE_GAIN * noise_var_gain + READ_NOISE_VAR_AFTER_GAIN;
    const BAYER: [usize; 4] = [R, GR, GB, B];

    let dst = buffer.pixels_mut();
    for y in 0..height {
        scene.set_readout_pixel(0, y * inc);
        let row = &mut dst[y as usize * stride * 2..];
        for x in 0..width {
            let channel = BAYER[((y & 1) * 2 + (x & 1)) as usize];
            let electrons = scene.pixel_electrons()[channel].min(SATURATION_ELECTRONS);

            let signal = (electrons as f32 * total_gain).min(MAX_RAW_VALUE as f32);
            let stddev = (read_noise_var + noise_var_gain * electrons as f32).sqrt();
            let raw = signal + BLACK_LEVEL as f32 + stddev * noise_sample(noise);

            let value = raw.clamp(0.0, u16::MAX as f32) as u16;
            let at = x as usize * 2;
            row[at..at + 2].copy_from_slice(&value.to_le_bytes());
            scene.skip_pixels(inc - 1);
        }
    }
    buffer.set_bytes_used(stride * height as usize * 2);
    Ok(())
}

/// Fixed-point (6 fractional bits) scale from electrons to 8-bit codes
fn scale64x_8bit(gain: u32) -> u32 {
    (64.0 * total_gain(gain) * 255.0 / MAX_RAW_VALUE as f32) as u32
}

/// Packed RGB or RGBA, reading R, Gr and B straight off each pixel
pub fn capture_rgb(buffer: &mut LockedBuffer, scene: &mut Scene, gain: u32, bpp: usize) -> Result<()> {
    let (sensor_w, sensor_h) = scene.sensor_size();
    let stride = buffer.stride();
    let inc = step(sensor_w, stride);
    let out_w = (sensor_w / inc).min(stride).min(buffer.width().max(1));
    let out_h = (sensor_h / inc).min(buffer.height());
    let pitch = stride as usize * bpp;
    buffer.ensure_len(pitch * out_h as usize)?;

    let scale64x = scale64x_8bit(gain);
    let to_8bit = |count: u32| -> u8 {
        let scaled = count.saturating_mul(scale64x);
        if scaled < 255 * 64 {
            (scaled / 64) as u8
        } else {
            255
        }
    };

    let dst = buffer.pixels_mut();
    for out_y in 0..out_h {
        scene.set_readout_pixel(0, out_y * inc);
        let row = &mut dst[out_y as usize * pitch..];
        for out_x in 0..out_w as usize {
            let pixel = scene.pixel_electrons();
            let px = &mut row[out_x * bpp..out_x * bpp + bpp];
            px[0] = to_8bit(pixel[R]);
            px[1] = to_8bit(pixel[GR]);
            px[2] = to_8bit(pixel[B]);
            if bpp == 4 {
                px[3] = 255;
            }
            scene.skip_pixels(inc - 1);
        }
    }
    buffer.set_bytes_used(pitch * out_h as usize);
    Ok(())
}

/// YUV 4:2:0 with interleaved VU, JFIF coefficients in fixed point
pub fn capture_nv21(buffer: &mut LockedBuffer, scene: &mut Scene, gain: u32) -> Result<()> {
    const RGB_TO_Y: [i32; 3] = [19, 37, 7];
    const RGB_TO_CB: [i32; 4] = [-10, -21, 32, 524_288];
    const RGB_TO_CR: [i32; 4] = [32, -26, -5, 524_288];
    const SCALE_OUT_SQ: i32 = 64 * 64;
    const SATURATION: i32 = 64 * 255;

    let (sensor_w, sensor_h) = scene.sensor_size();
    let stride = buffer.stride();
    let inc = step(sensor_w, stride);
    let out_w = (sensor_w / inc).min(stride) as usize;
    let out_h = (sensor_h / inc).min(buffer.height()) as usize;
    let pitch = stride as usize;
    buffer.ensure_len(pitch * out_h + pitch * out_h.div_ceil(2))?;

    let scale64x = scale64x_8bit(gain) as i32;
    let saturate = |count: u32| -> i32 { (count as i32).saturating_mul(scale64x).min(SATURATION) };
    let to_u8 = |v: i32| v.clamp(0, 255) as u8;

    let dst = buffer.pixels_mut();
    for out_y in 0..out_h {
        scene.set_readout_pixel(0, out_y as u32 * inc);
        let luma_row = out_y * pitch;
        let chroma_row = (out_h + out_y / 2) * pitch;
        for out_x in 0..out_w {
            let pixel = scene.pixel_electrons();
            let (r, g, b) = (saturate(pixel[R]), saturate(pixel[GR]), saturate(pixel[B]));

            dst[luma_row + out_x] = to_u8((RGB_TO_Y[0] * r + RGB_TO_Y[1] * g + RGB_TO_Y[2] * b) / SCALE_OUT_SQ);
            if out_y % 2 == 0 && out_x % 2 == 0 {
                let cr = (RGB_TO_CR[0] * r + RGB_TO_CR[1] * g + RGB_TO_CR[2] * b + RGB_TO_CR[3]) / SCALE_OUT_SQ;
                let cb = (RGB_TO_CB[0] * r + RGB_TO_CB[1] * g + RGB_TO_CB[2] * b + RGB_TO_CB[3]) / SCALE_OUT_SQ;
                dst[chroma_row + out_x] = to_u8(cr);
                if out_x + 1 < pitch {
                    dst[chroma_row + out_x + 1] = to_u8(cb);
                }
            }
            scene.skip_pixels(inc - 1);
        }
    }
    buffer.set_bytes_used(pitch * out_h + pitch * out_h.div_ceil(2));
    Ok(())
}

/// 16-bit depth using the Gr channel as a stand-in, 13 significant bits
pub fn capture_depth(buffer: &mut LockedBuffer, scene: &mut Scene, gain: u32) -> Result<()> {
    let (sensor_w, sensor_h) = scene.sensor_size();
    let stride = buffer.stride();
    let inc = step(sensor_w, stride);
    let out_w = (sensor_w / inc).min(stride) as usize;
    let out_h = (sensor_h / inc).min(buffer.height()) as usize;
    let pitch = stride as usize * 2;
    buffer.ensure_len(pitch * out_h)?;

    let scale64x = (64.0 * total_gain(gain) * MAX_DEPTH as f32 / MAX_RAW_VALUE as f32) as u32;

    let dst = buffer.pixels_mut();
    for out_y in 0..out_h {
        scene.set_readout_pixel(0, out_y as u32 * inc);
        let row = &mut dst[out_y * pitch..];
        for out_x in 0..out_w {
            let depth = scene.pixel_electrons()[GR].saturating_mul(scale64x);
            // Out-of-range depth reads as "no measurement".
            let value = if depth < MAX_DEPTH * 64 { (depth / 64) as u16 } else { 0 };
            row[out_x * 2..out_x * 2 + 2].copy_from_slice(&value.to_le_bytes());
            scene.skip_pixels(inc - 1);
        }
    }
    buffer.set_bytes_used(pitch * out_h);
    Ok(())
}

/// A 4x4 grid of jittered points three units in front of the camera
pub fn capture_depth_cloud<N: Rng>(buffer: &mut LockedBuffer, noise: &mut N) -> Result<()> {
    buffer.ensure_len(POINT_CLOUD_BYTES)?;

    let mut points = [DepthPoint::zeroed(); POINT_CLOUD_POINTS];
    for (i, point) in points.iter_mut().enumerate() {
        let (x, y) = ((i % 4) as f32, (i / 4) as f32);
        *point = DepthPoint {
            x: x - 1.5 + noise_sample(noise) * POINT_JITTER_STDDEV,
            y: y - 1.5 + noise_sample(noise) * POINT_JITTER_STDDEV,
            z: 3.0 + noise_sample(noise) * POINT_JITTER_STDDEV,
            confidence: POINT_CONFIDENCE,
        };
    }

    let dst = buffer.pixels_mut();
    dst[..4].copy_from_slice(&(POINT_CLOUD_POINTS as u32).to_le_bytes());
    dst[4..POINT_CLOUD_BYTES].copy_from_slice(bytemuck::cast_slice(&points));
    buffer.set_bytes_used(POINT_CLOUD_BYTES);
    Ok(())
}

/// Read the points back out of a rendered depth cloud
pub fn parse_depth_cloud(data: &[u8]) -> Option<Vec<DepthPoint>> {
    let count = u32::from_le_bytes(data.get(..4)?.try_into().ok()?) as usize;
    let bytes = data.get(4..4 + count * std::mem::size_of::<DepthPoint>())?;
    Some(bytemuck::pod_collect_to_vec(bytes))
}
