use anyhow::Result;

use super::{PatchRequest, PatchifiedImage, VisionEncoder, as_rows, pad_run, prepare_planes};
use crate::{
    settings::{VisionSettings, VisionTokens},
    tokenizer::TokenId,
};

/// Rounds `value` up to a multiple of `unit`, never below one unit.
pub fn round_up_to(value: u32, unit: u32) -> u32 {
    let unit = unit.max(1);
    value.div_ceil(unit).max(1).saturating_mul(unit)
}

/// `[start] + pad x rows + [end]`, with the boundaries only when both are configured.
pub fn boundary_run(tokens: &VisionTokens, rows: usize) -> Vec<TokenId> {
    let mut ids = Vec::with_capacity(rows + 2);
    match (tokens.start, tokens.end) {
        (Some(start), Some(end)) => {
            ids.push(start);
            ids.extend(pad_run(tokens.pad, rows));
            ids.push(end);
        }
        _ => ids.extend(pad_run(tokens.pad, rows)),
    }
    ids
}

pub(crate) fn patchify(
    encoder: &dyn VisionEncoder,
    settings: &VisionSettings,
    request: &PatchRequest<'_>,
) -> Result<PatchifiedImage> {
    let height = round_up_to(request.geometry.height, settings.size_unit);
    let width = round_up_to(request.geometry.width, settings.size_unit);
    let pixels = prepare_planes(
        request.image,
        width,
        height,
        settings.image_mean,
        settings.image_norm,
    )?
    .into_tensor(encoder.device())?;
    let embedding = as_rows(encoder.forward(&[pixels])?)?;
    let rows = embedding.dim(0)?;
    Ok(PatchifiedImage {
        embeddings: vec![embedding],
        ids: boundary_run(&settings.tokens, rows),
        grid: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        prompt::SizeHint,
        vision::testing::{RecordingEncoder, solid_image},
    };

    #[test]
    fn rounding_up_respects_unit() {
        assert_eq!(round_up_to(448, 1), 448);
        assert_eq!(round_up_to(449, 32), 480);
        assert_eq!(round_up_to(0, 16), 16);
        assert_eq!(round_up_to(5, 0), 5);
        assert_eq!(round_up_to(u32::MAX, 28), u32::MAX);
    }

    #[test]
    fn boundaries_require_both_sentinels() {
        let mut tokens = VisionTokens::default();
        tokens.pad = 9;
        tokens.start = Some(1);
        tokens.end = Some(2);
        assert_eq!(boundary_run(&tokens, 2), vec![1, 9, 9, 2]);
        tokens.end = None;
        assert_eq!(boundary_run(&tokens, 2), vec![9, 9]);
    }

    #[test]
    fn single_forward_yields_one_buffer() -> Result<()> {
        let encoder = RecordingEncoder::new(&["image"], |_| vec![1, 6]);
        let settings = VisionSettings {
            size_unit: 28,
            ..VisionSettings::default()
        };
        let image = solid_image(50, 40);
        let request = PatchRequest {
            image: &image,
            geometry: SizeHint::new(30, 60).expect("hint"),
            image_index: 0,
        };
        let patched = patchify(&encoder, &settings, &request)?;
        assert_eq!(encoder.input_shapes(), vec![vec![1, 3, 56, 84]]);
        assert_eq!(patched.embeddings.len(), 1);
        assert_eq!(patched.rows(), 6);
        assert_eq!(patched.ids.len(), 8);
        assert_eq!(patched.pad_count(settings.tokens.pad), 6);
        Ok(())
    }
}
