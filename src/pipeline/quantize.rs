//! Pixel quantizer: 8-bit grayscale page → packed 1- or 2-bit plane.
//!
//! ## Algorithm
//!
//! * Strength `0` is flat thresholding to the nearest of the evenly spaced
//!   levels (`0/255` or `0/85/170/255`); ties go to the brighter level.
//! * Strength `> 0` is Floyd–Steinberg error diffusion in row-major order.
//!   The residual of each pixel, scaled by the strength, is pushed to the
//!   right (7/16), below-left (3/16), below (5/16) and below-right (1/16)
//!   neighbours. Shares that fall outside the bitmap are dropped.
//!
//! Level indices are then optionally inverted (dark mode) and packed
//! according to [`PLANE_LAYOUT`]: rows padded to a byte boundary, pixels
//! MSB-first, code 0 = black.
//!
//! The whole computation is a pure function of its inputs, so it can run on
//! any blocking worker. [`DitherPool`] bounds how many run at once.

use crate::config::BitDepth;
use crate::error::InkError;
use crate::pipeline::render::PageBitmap;
use std::sync::Arc;
use tokio::sync::{oneshot, Semaphore};

/// Order of pixels inside a packed byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    /// Leftmost pixel in the most significant bits.
    MsbFirst,
    /// Leftmost pixel in the least significant bits.
    LsbFirst,
}

/// Meaning of the numeric level codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Code 0 is black, the maximum code is white.
    WhiteHigh,
    /// Code 0 is white, the maximum code is black.
    BlackHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub bit_order: BitOrder,
    pub polarity: Polarity,
}

/// Layout written into every container plane.
pub const PLANE_LAYOUT: PlaneLayout = PlaneLayout {
    bit_order: BitOrder::MsbFirst,
    polarity: Polarity::WhiteHigh,
};

/// Per-page quantizer settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizeOptions {
    pub bit_depth: BitDepth,
    /// Error-diffusion strength; clamped into `[0, 1]` when used.
    pub strength: f32,
    pub dark_mode: bool,
}

/// A packed page plane plus the position of its page in the book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizedPlane {
    pub width: u32,
    pub height: u32,
    pub bit_depth: BitDepth,
    pub chapter_index: usize,
    pub page_number: usize,
    pub data: Vec<u8>,
}

/// Bytes in one packed row.
pub fn row_bytes(width: u32, bit_depth: BitDepth) -> usize {
    (width as usize * bit_depth.bits() as usize).div_ceil(8)
}

/// Byte length of a packed plane: `ceil(width × bits / 8) × height`.
pub fn plane_len(width: u32, height: u32, bit_depth: BitDepth) -> usize {
    row_bytes(width, bit_depth) * height as usize
}

/// Quantize one page with [`PLANE_LAYOUT`].
pub fn quantize(bitmap: &PageBitmap, options: &QuantizeOptions) -> QuantizedPlane {
    quantize_with_layout(bitmap, options, PLANE_LAYOUT)
}

pub fn quantize_with_layout(
    bitmap: &PageBitmap,
    options: &QuantizeOptions,
    layout: PlaneLayout,
) -> QuantizedPlane {
    let strength = if options.strength.is_nan() {
        0.0
    } else {
        options.strength.clamp(0.0, 1.0)
    };

    let mut indices = if strength == 0.0 {
        threshold(bitmap.pixels(), options.bit_depth)
    } else {
        diffuse(
            bitmap.pixels(),
            bitmap.width() as usize,
            bitmap.height() as usize,
            options.bit_depth,
            strength,
        )
    };

    let max_code = (options.bit_depth.levels() - 1) as u8;
    if options.dark_mode {
        for idx in indices.iter_mut() {
            *idx = max_code - *idx;
        }
    }

    QuantizedPlane {
        width: bitmap.width(),
        height: bitmap.height(),
        bit_depth: options.bit_depth,
        chapter_index: bitmap.chapter_index,
        page_number: bitmap.page_number,
        data: pack_levels(
            &indices,
            bitmap.width(),
            bitmap.height(),
            options.bit_depth,
            layout,
        ),
    }
}

/// Gray value of level `index` at `bit_depth`.
pub fn level_value(index: u8, bit_depth: BitDepth) -> u8 {
    let step = 255 / (bit_depth.levels() as u32 - 1);
    (u32::from(index) * step) as u8
}

/// Index of the nearest level to `value`; ties round toward white.
fn nearest_level(value: f32, bit_depth: BitDepth) -> u8 {
    let max = (bit_depth.levels() - 1) as f32;
    let step = 255.0 / max;
    (value / step).round().clamp(0.0, max) as u8
}

fn threshold(pixels: &[u8], bit_depth: BitDepth) -> Vec<u8> {
    pixels
        .iter()
        .map(|&p| nearest_level(f32::from(p), bit_depth))
        .collect()
}

fn diffuse(pixels: &[u8], width: usize, height: usize, bit_depth: BitDepth, strength: f32) -> Vec<u8> {
    let mut out = vec![0u8; width * height];
    let mut err_cur = vec![0f32; width];
    let mut err_nxt = vec![0f32; width];

    for y in 0..height {
        let row = &pixels[y * width..(y + 1) * width];
        let last_row = y + 1 == height;

        for x in 0..width {
            let value = f32::from(row[x]) + err_cur[x];
            let idx = nearest_level(value, bit_depth);
            out[y * width + x] = idx;

            let residual = (value - f32::from(level_value(idx, bit_depth))) * strength;
            if residual == 0.0 {
                continue;
            }
            if x + 1 < width {
                err_cur[x + 1] += residual * 7.0 / 16.0;
            }
            if !last_row {
                if x > 0 {
                    err_nxt[x - 1] += residual * 3.0 / 16.0;
                }
                err_nxt[x] += residual * 5.0 / 16.0;
                if x + 1 < width {
                    err_nxt[x + 1] += residual * 1.0 / 16.0;
                }
            }
        }

        std::mem::swap(&mut err_cur, &mut err_nxt);
        err_nxt.fill(0.0);
    }

    out
}

/// Pack level indices (0 = black) into row-aligned bytes.
pub fn pack_levels(
    indices: &[u8],
    width: u32,
    height: u32,
    bit_depth: BitDepth,
    layout: PlaneLayout,
) -> Vec<u8> {
    let bits = bit_depth.bits() as usize;
    let per_byte = 8 / bits;
    let max_code = (bit_depth.levels() - 1) as u8;
    let stride = row_bytes(width, bit_depth);
    let width = width as usize;
    let mut out = vec![0u8; stride * height as usize];

    for (y, row) in indices.chunks_exact(width).take(height as usize).enumerate() {
        let out_row = &mut out[y * stride..(y + 1) * stride];
        for (x, &idx) in row.iter().enumerate() {
            let code = match layout.polarity {
                Polarity::WhiteHigh => idx,
                Polarity::BlackHigh => max_code - idx,
            };
            let slot = x % per_byte;
            let shift = match layout.bit_order {
                BitOrder::MsbFirst => 8 - bits * (slot + 1),
                BitOrder::LsbFirst => bits * slot,
            };
            out_row[x / per_byte] |= code << shift;
        }
    }

    out
}

// ── Worker pool ──────────────────────────────────────────────────────────

/// Bounded offload of quantization onto blocking workers.
///
/// Cloning is cheap and shares the bound, so one pool can serve every file of
/// a batch.
#[derive(Debug, Clone)]
pub struct DitherPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl DitherPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Hand a page to a worker once one is free; the plane arrives on the receiver.
    pub async fn submit(
        &self,
        bitmap: PageBitmap,
        options: QuantizeOptions,
    ) -> Result<oneshot::Receiver<QuantizedPlane>, InkError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| InkError::Internal("Dither pool closed".into()))?;

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let plane = quantize(&bitmap, &options);
            drop(permit);
            // Receiver gone means the file was abandoned.
            let _ = tx.send(plane);
        });
        Ok(rx)
    }

    pub async fn quantize(
        &self,
        bitmap: PageBitmap,
        options: QuantizeOptions,
    ) -> Result<QuantizedPlane, InkError> {
        let page = bitmap.page_number;
        let rx = self.submit(bitmap, options).await?;
        rx.await.map_err(|_| {
            InkError::Internal(format!("Dither worker for page {page} exited without a result"))
        })
    }
}
