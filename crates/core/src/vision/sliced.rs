use anyhow::{Context, Result, ensure};
use candle_core::Tensor;
use image::DynamicImage;

use super::{PatchRequest, PatchifiedImage, Planes, VisionEncoder, pad_run, prepare_planes, split_views};
use crate::{
    settings::{VisionSettings, VisionTokens},
    tokenizer::{TextTokenizer, TokenId},
};

/// Global view size, refine view size and slice grid, all `(height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceLayout {
    pub global: (u32, u32),
    pub refine: (u32, u32),
    pub grid: (u32, u32),
}

/// Grid candidates for the slice search, as `(grid_h, grid_w)`.
///
/// Slice counts `multiple - 1` (only when `multiple > 1`), `multiple` and `multiple + 1`
/// are kept when they lie in `[1, max_slice_nums]`; each contributes every divisor pair and
/// its transpose.
pub fn grid_candidates(multiple: u32, max_slice_nums: u32) -> Vec<(u32, u32)> {
    let mut nums = Vec::with_capacity(3);
    if multiple > 1 {
        nums.push(multiple - 1);
    }
    nums.push(multiple);
    nums.push(multiple + 1);

    let mut candidates = Vec::new();
    for num in nums.into_iter().filter(|&n| (1..=max_slice_nums).contains(&n)) {
        let mut m = 1;
        while m * m <= num {
            if num % m == 0 {
                candidates.push((m, num / m));
                if m * m != num {
                    candidates.push((num / m, m));
                }
            }
            m += 1;
        }
    }
    if candidates.is_empty() {
        candidates.push((1, 1));
    }
    candidates
}

/// Grid whose aspect ratio is closest (in log space) to `width / height`; the first
/// candidate wins ties.
pub fn best_grid(height: u32, width: u32, scale_resolution: u32, max_slice_nums: u32) -> (u32, u32) {
    let ratio = (width as f64 * height as f64) / (scale_resolution as f64).powi(2);
    let multiple = (ratio.ceil() as u32).min(max_slice_nums);
    let log_ratio = (width as f64 / height as f64).ln();
    let key = |grid: &(u32, u32)| {
        if grid.0 == 0 {
            return f64::INFINITY;
        }
        (log_ratio - (grid.1 as f64 / grid.0 as f64).ln()).abs()
    };
    let mut candidates = grid_candidates(multiple, max_slice_nums).into_iter();
    let mut best = candidates.next().unwrap_or((1, 1));
    let mut best_key = key(&best);
    for candidate in candidates {
        let candidate_key = key(&candidate);
        if candidate_key < best_key {
            best = candidate;
            best_key = candidate_key;
        }
    }
    best
}

/// Size a view is resized to before slicing, rounded to whole patches (at least one).
///
/// Without `upscale`, views within `scale_resolution^2` pixels keep their size; otherwise the
/// view is rescaled to roughly `scale_resolution^2` pixels at the same aspect ratio.
pub fn target_size(height: u32, width: u32, upscale: bool, patch: u32, scale_resolution: u32) -> (u32, u32) {
    let area = width as u64 * height as u64;
    let (target_h, target_w) = if !upscale && area <= (scale_resolution as u64).pow(2) {
        (height as f64, width as f64)
    } else {
        let r = if height != 0 {
            width as f64 / height as f64
        } else {
            0.0
        };
        if r > 0.0 {
            let th = (scale_resolution as f64 / r.sqrt()).trunc();
            (th, (th * r).trunc())
        } else {
            (0.0, scale_resolution as f64)
        }
    };
    let patch = patch.max(1);
    let snap = |value: f64| ((value / patch as f64).round() as u32)
        .saturating_mul(patch)
        .max(patch);
    (snap(target_h), snap(target_w))
}

pub fn best_slice_layout(
    height: u32,
    width: u32,
    patch: u32,
    scale_resolution: u32,
    max_slice_nums: u32,
) -> SliceLayout {
    let grid = best_grid(height, width, scale_resolution, max_slice_nums);
    let global = target_size(height, width, false, patch, scale_resolution);
    let slice_h = (height as f64 / grid.0 as f64) as u32;
    let slice_w = (width as f64 / grid.1 as f64) as u32;
    let best_patch = target_size(slice_h, slice_w, true, patch, scale_resolution);
    SliceLayout {
        global,
        refine: (best_patch.0 * grid.0, best_patch.1 * grid.1),
        grid,
    }
}

/// One slice in `[3, patch, n_h * n_w * patch]` layout.
#[derive(Debug, Clone)]
pub struct SliceView {
    pub data: Vec<f32>,
    pub patches_h: usize,
    pub patches_w: usize,
}

impl SliceView {
    pub fn patch_count(&self) -> usize {
        self.patches_h * self.patches_w
    }
}

/// Cuts `planes` into `grid` slices; patches of each slice are laid side by side along the
/// last axis in row-major patch order.
pub fn reorder_slices(planes: &Planes, grid: (usize, usize), patch: usize) -> Vec<SliceView> {
    let (grid_h, grid_w) = grid;
    let sub_h = planes.height() / grid_h;
    let sub_w = planes.width() / grid_w;
    let (patches_h, patches_w) = (sub_h / patch, sub_w / patch);
    let mut views = Vec::with_capacity(grid_h * grid_w);
    for gy in 0..grid_h {
        for gx in 0..grid_w {
            let mut data = Vec::with_capacity(3 * patch * patches_h * patches_w * patch);
            for c in 0..3 {
                for py in 0..patch {
                    for ph in 0..patches_h {
                        for pw in 0..patches_w {
                            let y = gy * sub_h + ph * patch + py;
                            let x0 = gx * sub_w + pw * patch;
                            data.extend((0..patch).map(|px| planes.at(c, y, x0 + px)));
                        }
                    }
                }
            }
            views.push(SliceView {
                data,
                patches_h,
                patches_w,
            });
        }
    }
    views
}

/// Bucketed position ids `[views, max_patches]`; padding positions stay 0.
pub fn bucket_position_ids(views: &[SliceView], max_patches: usize, per_side: usize) -> Vec<i64> {
    let mut ids = vec![0i64; views.len() * max_patches];
    for (i, view) in views.iter().enumerate() {
        for h in 0..view.patches_h {
            let bucket_h = ((h as f32 / view.patches_h as f32) * per_side as f32).floor() as i64;
            for w in 0..view.patches_w {
                let bucket_w =
                    ((w as f32 / view.patches_w as f32) * per_side as f32).floor() as i64;
                ids[i * max_patches + h * view.patches_w + w] = bucket_h * per_side as i64 + bucket_w;
            }
        }
    }
    ids
}

/// `[views, max_patches]`: 0 for valid patches, the lowest `f32` beyond each view's count.
pub fn slice_attention_mask(views: &[SliceView], max_patches: usize) -> Vec<f32> {
    let mut mask = vec![0f32; views.len() * max_patches];
    for (i, view) in views.iter().enumerate() {
        mask[i * max_patches + view.patch_count()..(i + 1) * max_patches].fill(f32::MIN);
    }
    mask
}

/// `[id_start] index [id_end] [start] pad.. [end]` then `[slice_start] pad.. [slice_end]`
/// per refine slice.
pub fn slice_ids(
    tokens: &VisionTokens,
    boundaries: (TokenId, TokenId),
    index_ids: &[TokenId],
    refine_slices: usize,
    rows: usize,
) -> Vec<TokenId> {
    let (start, end) = boundaries;
    let mut ids = Vec::with_capacity(index_ids.len() + 4 + (refine_slices + 1) * (rows + 2));
    ids.push(tokens.id_start);
    ids.extend_from_slice(index_ids);
    ids.push(tokens.id_end);
    ids.push(start);
    ids.extend(pad_run(tokens.pad, rows));
    ids.push(end);
    for _ in 0..refine_slices {
        ids.push(tokens.slice_start);
        ids.extend(pad_run(tokens.pad, rows));
        ids.push(tokens.slice_end);
    }
    ids
}

fn view_planes(
    image: &DynamicImage,
    size: (u32, u32),
    settings: &VisionSettings,
) -> Result<Planes> {
    prepare_planes(image, size.1, size.0, settings.image_mean, settings.image_norm)
}

pub(crate) fn patchify(
    encoder: &dyn VisionEncoder,
    settings: &VisionSettings,
    request: &PatchRequest<'_>,
    tokenizer: &dyn TextTokenizer,
) -> Result<PatchifiedImage> {
    let tokens = &settings.tokens;
    let boundaries = tokens
        .start
        .zip(tokens.end)
        .context("sliced scheme requires vision start and end ids")?;
    let patch = settings.size_unit.max(1);
    let geometry = request.geometry;
    let layout = best_slice_layout(
        geometry.height,
        geometry.width,
        patch,
        settings.scale_resolution,
        settings.max_slice_nums as u32,
    );
    let patch = patch as usize;
    let grid = (layout.grid.0 as usize, layout.grid.1 as usize);

    let mut views = reorder_slices(&view_planes(request.image, layout.global, settings)?, (1, 1), patch);
    views.extend(reorder_slices(
        &view_planes(request.image, layout.refine, settings)?,
        grid,
        patch,
    ));
    let batch = views.len();
    let max_patches = views.iter().map(SliceView::patch_count).max().unwrap_or(0);
    ensure!(max_patches > 0, "sliced views contain no patches");

    let row_len = max_patches * patch;
    let mut pixels = Vec::with_capacity(batch * 3 * patch * row_len);
    for view in &views {
        let view_len = view.patch_count() * patch;
        for line in view.data.chunks(view_len) {
            pixels.extend_from_slice(line);
            pixels.resize(pixels.len() + row_len - view_len, 0.0);
        }
    }
    let mut tgt_sizes = Vec::with_capacity(batch * 2);
    for view in &views {
        tgt_sizes.push(view.patches_h as i64);
        tgt_sizes.push(view.patches_w as i64);
    }

    let device = encoder.device();
    let inputs = [
        Tensor::from_vec(pixels, (batch, 3, patch, row_len), device)?,
        Tensor::from_vec(
            bucket_position_ids(&views, max_patches, settings.patches_per_side),
            (batch, max_patches),
            device,
        )?,
        Tensor::from_vec(slice_attention_mask(&views, max_patches), (batch, max_patches), device)?,
        Tensor::from_vec(tgt_sizes, (batch, 2), device)?,
    ];
    let embeddings = split_views(encoder.forward(&inputs)?, batch)?;

    let index_ids = tokenizer.encode(&request.image_index.to_string())?;
    Ok(PatchifiedImage {
        embeddings,
        ids: slice_ids(tokens, boundaries, &index_ids, batch - 1, settings.rows_per_tile),
        grid: None,
    })
}
