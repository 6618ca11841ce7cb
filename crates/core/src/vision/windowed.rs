use anyhow::{Context, Result, ensure};
use candle_core::{DType, Tensor};

use super::{
    GridDescriptor, PatchRequest, PatchifiedImage, Planes, VisionEncoder, as_rows, pad_run,
    prepare_planes,
};
use crate::settings::VisionSettings;

/// Rounds `value` to the nearest multiple of `factor`, never below one factor.
pub fn round_to_factor(value: u32, factor: u32) -> u32 {
    let factor = factor.max(1);
    let units = (value as f64 / factor as f64).round() as u32;
    units.max(1).saturating_mul(factor)
}

/// Flattens the image into `[seq, 3 * temporal * patch * patch]` rows ordered
/// `(t, h / merge, w / merge, merge_h, merge_w)`; each row holds
/// `(channel, temporal, patch_y, patch_x)`. The single frame is repeated over `temporal`.
pub fn flatten_patches(planes: &Planes, grid: &GridDescriptor, temporal: usize) -> Vec<f32> {
    let p = grid.patch_size;
    let m = grid.merge_size;
    let row_len = 3 * temporal * p * p;
    let mut data = Vec::with_capacity(grid.patch_count() * row_len);
    for _t in 0..grid.grid_t {
        for hb in 0..grid.grid_h / m {
            for wb in 0..grid.grid_w / m {
                for mh in 0..m {
                    for mw in 0..m {
                        let y0 = (hb * m + mh) * p;
                        let x0 = (wb * m + mw) * p;
                        for c in 0..3 {
                            for _frame in 0..temporal {
                                for py in 0..p {
                                    for px in 0..p {
                                        data.push(planes.at(c, y0 + py, x0 + px));
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    data
}

/// `[2, seq]` (h plane then w plane) patch coordinates in flattened row order.
pub fn grid_position_ids(grid: &GridDescriptor) -> Vec<i64> {
    let m = grid.merge_size;
    let seq = grid.patch_count();
    let frame = grid.grid_h * grid.grid_w;
    let wblock = m * m;
    let hblock = wblock * (grid.grid_w / m);
    let mut ids = vec![0i64; 2 * seq];
    for t in 0..grid.grid_t {
        for i in 0..grid.grid_h {
            let (h_idx, h_off) = (i / m, i % m);
            for j in 0..grid.grid_w {
                let (w_idx, w_off) = (j / m, j % m);
                let index = t * frame + h_idx * hblock + w_idx * wblock + h_off * m + w_off;
                ids[index] = i as i64;
                ids[seq + index] = j as i64;
            }
        }
    }
    ids
}

/// Window ordering over merged units and cumulative window bounds in patch rows.
///
/// Windows cover `window x window` merged units; the merged grid is padded by
/// `window - (n % window)` on each side, so an exact multiple still gains a padded window.
pub fn window_index(grid: &GridDescriptor, window: usize) -> (Vec<i64>, Vec<usize>) {
    let window = window.max(1);
    let m = grid.merge_size;
    let merge_unit = m * m;
    let llm_h = grid.grid_h / m;
    let llm_w = grid.grid_w / m;
    let windows_h = (llm_h + window - llm_h % window) / window;
    let windows_w = (llm_w + window - llm_w % window) / window;

    let mut index = Vec::with_capacity(grid.grid_t * llm_h * llm_w);
    let mut cu_seqlens = vec![0usize];
    for t in 0..grid.grid_t {
        for win_h in 0..windows_h {
            for win_w in 0..windows_w {
                let mut count = 0usize;
                for i in 0..window {
                    let h = win_h * window + i;
                    if h >= llm_h {
                        continue;
                    }
                    for j in 0..window {
                        let w = win_w * window + j;
                        if w >= llm_w {
                            continue;
                        }
                        index.push((t * llm_h * llm_w + h * llm_w + w) as i64);
                        count += 1;
                    }
                }
                let last = cu_seqlens.last().copied().unwrap_or(0);
                cu_seqlens.push(last + count * merge_unit);
            }
        }
    }
    (index, cu_seqlens)
}

/// `[2, 1, seq, seq]`: plane 0 is all zeros, plane 1 is zero inside each window block and
/// the lowest `f32` elsewhere.
pub fn window_mask(seq: usize, cu_seqlens: &[usize]) -> Vec<f32> {
    let plane = seq * seq;
    let mut mask = vec![0f32; 2 * plane];
    mask[plane..].fill(f32::MIN);
    for bounds in cu_seqlens.windows(2) {
        let (lo, hi) = (bounds[0], bounds[1].min(seq));
        for j in lo..hi {
            mask[plane + j * seq + lo..plane + j * seq + hi].fill(0.0);
        }
    }
    mask
}

pub(crate) fn patchify(
    encoder: &dyn VisionEncoder,
    settings: &VisionSettings,
    request: &PatchRequest<'_>,
    window_attention: bool,
) -> Result<PatchifiedImage> {
    let (start, end) = settings
        .tokens
        .start
        .zip(settings.tokens.end)
        .context("windowed-grid scheme requires vision start and end ids")?;
    let factor = settings.grid_factor();
    let height = round_to_factor(request.geometry.height, factor);
    let width = round_to_factor(request.geometry.width, factor);
    let planes = prepare_planes(
        request.image,
        width,
        height,
        settings.image_mean,
        settings.image_norm,
    )?;

    let temporal = settings.temporal_patch_size.max(1);
    let grid = GridDescriptor {
        grid_t: 1,
        grid_h: height as usize / settings.patch_size,
        grid_w: width as usize / settings.patch_size,
        patch_size: settings.patch_size,
        merge_size: settings.merge_size,
    };
    let seq = grid.patch_count();
    let device = encoder.device();
    let row_len = 3 * temporal * settings.patch_size * settings.patch_size;

    let patches = Tensor::from_vec(flatten_patches(&planes, &grid, temporal), (seq, row_len), device)?;
    let position_ids = Tensor::from_vec(grid_position_ids(&grid), (2, seq), device)?;
    let mut inputs = vec![patches, position_ids];
    if window_attention {
        let (index, cu_seqlens) = window_index(&grid, settings.window_size);
        let index_len = index.len();
        inputs.push(Tensor::from_vec(
            window_mask(seq, &cu_seqlens),
            (2, 1, seq, seq),
            device,
        )?);
        inputs.push(Tensor::from_vec(index, index_len, device)?);
    } else {
        inputs.push(Tensor::zeros((1, seq, seq), DType::F32, device)?);
    }

    let embedding = as_rows(encoder.forward(&inputs)?)?;
    let rows = embedding.dim(0)?;
    let merged = grid.merged();
    ensure!(
        rows == merged.cells(),
        "vision module returned {rows} rows for a {}x{}x{} merged grid",
        merged.t,
        merged.h,
        merged.w
    );

    let mut ids = Vec::with_capacity(rows + 2);
    ids.push(start);
    ids.extend(pad_run(settings.tokens.pad, rows));
    ids.push(end);
    Ok(PatchifiedImage {
        embeddings: vec![embedding],
        ids,
        grid: Some(grid),
    })
}
