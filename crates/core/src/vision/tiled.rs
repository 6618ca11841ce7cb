use anyhow::{Context, Result};
use candle_core::Tensor;

use super::{
    PatchRequest, PatchifiedImage, Planes, VisionEncoder, as_rows, pad_run, prepare_planes,
    split_views,
};
use crate::{
    settings::VisionSettings,
    tokenizer::{TextTokenizer, TokenId},
};

/// Sentinel ids framing tiled vision runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMarkers {
    pub start: TokenId,
    pub end: TokenId,
    pub global: TokenId,
    pub pad: TokenId,
}

/// Grid labels and row terminator for a split image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileLayout {
    pub grid_h: usize,
    pub grid_w: usize,
    /// First id of `<row_{h+1}_col_{w+1}>`, row-major.
    pub labels: Vec<TokenId>,
    pub newline: TokenId,
}

/// Target geometry when the image is split into tiles, `None` when it fits one tile.
///
/// Each side is rounded to the nearest multiple of `unit` and clamped to
/// `[unit, max_size]`, with `max_size` floored to a whole number of tiles.
pub fn split_geometry(height: u32, width: u32, unit: u32, max_size: u32) -> Option<(u32, u32)> {
    let unit = unit.max(1);
    if height <= unit && width <= unit {
        return None;
    }
    let cap = (max_size / unit).max(1).saturating_mul(unit);
    let snap = |value: u32| {
        let units = (value as f64 / unit as f64).round() as u32;
        units.max(1).saturating_mul(unit).min(cap)
    };
    Some((snap(height), snap(width)))
}

/// Cuts `planes` into `grid_h x grid_w` tiles of `unit x unit`, laid out
/// `[tiles, 3, unit, unit]` in row-major tile order.
pub fn tile_pixels(planes: &Planes, grid_h: usize, grid_w: usize, unit: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(grid_h * grid_w * 3 * unit * unit);
    for gy in 0..grid_h {
        for gx in 0..grid_w {
            for c in 0..3 {
                for y in 0..unit {
                    for x in 0..unit {
                        data.push(planes.at(c, gy * unit + y, gx * unit + x));
                    }
                }
            }
        }
    }
    data
}

/// Tile blocks (when split) followed by the global block.
pub fn tile_ids(markers: &TileMarkers, layout: Option<&TileLayout>, rows: usize) -> Vec<TokenId> {
    let mut ids = Vec::new();
    if let Some(layout) = layout {
        for h in 0..layout.grid_h {
            for w in 0..layout.grid_w {
                ids.push(markers.start);
                ids.push(layout.labels[h * layout.grid_w + w]);
                ids.extend(pad_run(markers.pad, rows));
            }
            ids.push(layout.newline);
        }
        ids.push(layout.newline);
    }
    ids.push(markers.start);
    ids.push(markers.global);
    ids.extend(pad_run(markers.pad, rows));
    ids.push(markers.end);
    ids
}

pub(crate) fn patchify(
    encoder: &dyn VisionEncoder,
    settings: &VisionSettings,
    request: &PatchRequest<'_>,
    tokenizer: &dyn TextTokenizer,
) -> Result<PatchifiedImage> {
    let tokens = &settings.tokens;
    let (start, end) = tokens
        .start
        .zip(tokens.end)
        .context("tiled scheme requires vision start and end ids")?;
    let markers = TileMarkers {
        start,
        end,
        global: tokens.global,
        pad: tokens.pad,
    };
    let unit = settings.size_unit.max(1);
    let device = encoder.device();
    let (mean, norm) = (settings.image_mean, settings.image_norm);
    let global = prepare_planes(request.image, unit, unit, mean, norm)?;

    let geometry = request.geometry;
    let (embeddings, layout) =
        match split_geometry(geometry.height, geometry.width, unit, settings.max_size) {
            Some((height, width)) => {
                let planes = prepare_planes(request.image, width, height, mean, norm)?;
                let unit = unit as usize;
                let (grid_h, grid_w) = (height as usize / unit, width as usize / unit);
                let views = grid_h * grid_w + 1;
                let mut data = tile_pixels(&planes, grid_h, grid_w, unit);
                data.extend_from_slice(global.as_slice());
                let pixels = Tensor::from_vec(data, (views, 3, unit, unit), device)?;
                let embeddings = split_views(encoder.forward(&[pixels])?, views)?;

                let mut labels = Vec::with_capacity(grid_h * grid_w);
                for h in 0..grid_h {
                    for w in 0..grid_w {
                        let label = format!("<row_{}_col_{}>", h + 1, w + 1);
                        labels.push(tokenizer.encode_single(&label)?);
                    }
                }
                let layout = TileLayout {
                    grid_h,
                    grid_w,
                    labels,
                    newline: tokenizer.encode_single("\n")?,
                };
                (embeddings, Some(layout))
            }
            None => {
                let pixels = global.into_tensor(device)?;
                (vec![as_rows(encoder.forward(&[pixels])?)?], None)
            }
        };

    Ok(PatchifiedImage {
        embeddings,
        ids: tile_ids(&markers, layout.as_ref(), settings.rows_per_tile),
        grid: None,
    })
}
