//! Grid composition: letterboxing synchronized frames onto one canvas.
//!
//! The canvas is a square NV12 frame divided into a jagged grid of cells.
//! Each cell is assigned a stream name (or left empty); present frames are
//! letterboxed into their cell with bilinear resampling, everything else is
//! filled with the neutral gray the downstream network was trained on
//! (luma 114, chroma 128).
//!
//! Geometry contract: for canvas side S and R rows, row r is `S/R` pixels
//! tall (integer floor) starting at `r*(S/R)`; columns divide the same way
//! within each row's own length.

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::frame::Nv12Frame;

/// Neutral fill for unoccupied canvas area, luma plane.
pub const NEUTRAL_LUMA: u8 = 114;
/// Neutral fill for unoccupied canvas area, both chroma components.
pub const NEUTRAL_CHROMA: u8 = 128;

// ----------------------------------------------------------------------------
// GridSpec
// ----------------------------------------------------------------------------

/// Cell layout for one loader's canvas.
///
/// Rows may differ in length (jagged); `None` cells stay neutral. The same
/// stream may appear in more than one cell (fan-out).
#[derive(Clone, Debug)]
pub struct GridSpec {
    cells: Vec<Vec<Option<String>>>,
    canvas: u32,
}

impl GridSpec {
    pub fn new(cells: Vec<Vec<Option<String>>>, canvas: u32) -> Result<Self> {
        if cells.is_empty() || cells.iter().any(|row| row.is_empty()) {
            return Err(anyhow!("grid must have at least one non-empty row"));
        }
        if canvas == 0 || canvas % 2 != 0 {
            return Err(anyhow!("canvas side must be a positive even number"));
        }
        if canvas as usize / cells.len() == 0 {
            return Err(anyhow!("canvas side {} too small for {} rows", canvas, cells.len()));
        }
        if let Some(row) = cells.iter().find(|row| canvas as usize / row.len() == 0) {
            return Err(anyhow!(
                "canvas side {} too small for a row of {} cells",
                canvas,
                row.len()
            ));
        }
        Ok(Self { cells, canvas })
    }

    /// Build from the persisted matrix form, where `""` marks an empty cell.
    pub fn from_matrix(matrix: &[Vec<String>], canvas: u32) -> Result<Self> {
        let cells = matrix
            .iter()
            .map(|row| {
                row.iter()
                    .map(|name| {
                        if name.is_empty() {
                            None
                        } else {
                            Some(name.clone())
                        }
                    })
                    .collect()
            })
            .collect();
        Self::new(cells, canvas)
    }

    /// Persisted matrix form.
    pub fn to_matrix(&self) -> Vec<Vec<String>> {
        self.cells
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.clone().unwrap_or_default())
                    .collect()
            })
            .collect()
    }

    pub fn canvas(&self) -> u32 {
        self.canvas
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> &[Vec<Option<String>>] {
        &self.cells
    }

    /// Cell dimensions in row `r`: floor(canvas/rows) by floor(canvas/row_len).
    pub fn cell_size(&self, row: usize) -> (u32, u32) {
        let cell_h = self.canvas / self.cells.len() as u32;
        let cell_w = self.canvas / self.cells[row].len() as u32;
        (cell_w, cell_h)
    }

    /// Distinct stream names referenced by the grid.
    pub fn stream_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .cells
            .iter()
            .flatten()
            .filter_map(|cell| cell.as_deref())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

// ----------------------------------------------------------------------------
// TileBatcher
// ----------------------------------------------------------------------------

/// Composes one synchronized frame set into a canvas.
pub struct TileBatcher {
    grid: GridSpec,
}

impl TileBatcher {
    pub fn new(grid: GridSpec) -> Self {
        Self { grid }
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    /// Compose the canvas for one cycle.
    ///
    /// Missing streams and letterbox failures leave their cells neutral; the
    /// canvas timestamp is the maximum over cells actually filled. Returns
    /// `None` when zero cells were filled (the cycle is skipped, not an
    /// error).
    pub fn compose(&self, frames: &HashMap<String, Nv12Frame>) -> Option<Nv12Frame> {
        let side = self.grid.canvas;
        let mut y = vec![NEUTRAL_LUMA; (side * side) as usize];
        let mut uv = vec![NEUTRAL_CHROMA; (side * side / 2) as usize];

        let mut filled = 0usize;
        let mut timestamp_ms = 0u64;

        for (row, cells) in self.grid.cells.iter().enumerate() {
            let (cell_w, cell_h) = self.grid.cell_size(row);
            let y0 = row as u32 * cell_h;

            for (col, cell) in cells.iter().enumerate() {
                let Some(name) = cell else { continue };
                let Some(frame) = frames.get(name.as_str()) else {
                    continue;
                };
                let x0 = col as u32 * cell_w;

                match letterbox(frame, cell_w, cell_h) {
                    Ok((cell_y, cell_uv)) => {
                        blit(
                            &mut y,
                            side as usize,
                            x0 as usize,
                            y0 as usize,
                            &cell_y,
                            cell_w as usize,
                            cell_h as usize,
                        );
                        blit(
                            &mut uv,
                            side as usize, // uv stride: (side/2) pairs * 2 bytes
                            (x0 / 2) as usize * 2,
                            (y0 / 2) as usize,
                            &cell_uv,
                            (cell_w / 2) as usize * 2,
                            (cell_h / 2) as usize,
                        );
                        filled += 1;
                        timestamp_ms = timestamp_ms.max(frame.timestamp_ms);
                    }
                    Err(e) => {
                        log::error!("letterbox failed at cell [{},{}]: {:#}", row, col, e);
                    }
                }
            }
        }

        if filled == 0 {
            return None;
        }
        log::debug!(
            "canvas composed: filled={} side={} timestamp={}",
            filled,
            side,
            timestamp_ms
        );
        Some(Nv12Frame::new(y, uv, side, side, timestamp_ms))
    }
}

// ----------------------------------------------------------------------------
// Letterboxing
// ----------------------------------------------------------------------------

/// Aspect-preserving resize of `src` into a `cell_w` x `cell_h` cell.
///
/// Returns the cell's luma plane and its half-resolution interleaved chroma
/// plane, neutral-padded symmetrically (within one pixel per axis).
fn letterbox(src: &Nv12Frame, cell_w: u32, cell_h: u32) -> Result<(Vec<u8>, Vec<u8>)> {
    if src.width == 0 || src.height == 0 {
        return Err(anyhow!("source frame has zero dimension"));
    }

    let scale = f64::min(
        cell_w as f64 / src.width as f64,
        cell_h as f64 / src.height as f64,
    );
    let new_w = ((src.width as f64 * scale).round() as u32).clamp(1, cell_w);
    let new_h = ((src.height as f64 * scale).round() as u32).clamp(1, cell_h);
    let pad_x = (cell_w - new_w) / 2;
    let pad_y = (cell_h - new_h) / 2;

    // Luma at full resolution.
    let resized_y = resize_bilinear(
        &src.y,
        src.width as usize,
        src.height as usize,
        new_w as usize,
        new_h as usize,
        1,
    );
    let mut cell_y = vec![NEUTRAL_LUMA; (cell_w * cell_h) as usize];
    blit(
        &mut cell_y,
        cell_w as usize,
        pad_x as usize,
        pad_y as usize,
        &resized_y,
        new_w as usize,
        new_h as usize,
    );

    // Chroma at half resolution, two interleaved components.
    let resized_uv = resize_bilinear(
        &src.uv,
        (src.width / 2) as usize,
        (src.height / 2) as usize,
        (new_w / 2).max(1) as usize,
        (new_h / 2).max(1) as usize,
        2,
    );
    let mut cell_uv = vec![NEUTRAL_CHROMA; (cell_w * cell_h / 2) as usize];
    blit(
        &mut cell_uv,
        (cell_w / 2) as usize * 2,
        (pad_x / 2) as usize * 2,
        (pad_y / 2) as usize,
        &resized_uv,
        (new_w / 2).max(1) as usize * 2,
        (new_h / 2).max(1) as usize,
    );

    Ok((cell_y, cell_uv))
}

/// Bilinear plane resize with `channels` interleaved components per pixel.
fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
    channels: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * channels];
    if src_w == 0 || src_h == 0 {
        return dst;
    }

    let x_ratio = src_w as f64 / dst_w as f64;
    let y_ratio = src_h as f64 / dst_h as f64;

    for dy in 0..dst_h {
        // Pixel-center mapping keeps the image from shifting half a texel.
        let sy = ((dy as f64 + 0.5) * y_ratio - 0.5).max(0.0);
        let y0 = (sy as usize).min(src_h - 1);
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = sy - y0 as f64;

        for dx in 0..dst_w {
            let sx = ((dx as f64 + 0.5) * x_ratio - 0.5).max(0.0);
            let x0 = (sx as usize).min(src_w - 1);
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = sx - x0 as f64;

            for ch in 0..channels {
                let p00 = src[(y0 * src_w + x0) * channels + ch] as f64;
                let p01 = src[(y0 * src_w + x1) * channels + ch] as f64;
                let p10 = src[(y1 * src_w + x0) * channels + ch] as f64;
                let p11 = src[(y1 * src_w + x1) * channels + ch] as f64;

                let top = p00 + (p01 - p00) * fx;
                let bottom = p10 + (p11 - p10) * fx;
                let value = top + (bottom - top) * fy;
                dst[(dy * dst_w + dx) * channels + ch] = value.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    dst
}

/// Copy a packed `src_w` x `src_h` block into `dst` at (x0, y0).
fn blit(
    dst: &mut [u8],
    dst_stride: usize,
    x0: usize,
    y0: usize,
    src: &[u8],
    src_w: usize,
    src_h: usize,
) {
    for row in 0..src_h {
        let dst_start = (y0 + row) * dst_stride + x0;
        let src_start = row * src_w;
        dst[dst_start..dst_start + src_w].copy_from_slice(&src[src_start..src_start + src_w]);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
