use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use omni_prompt_core::{VisionEncoder, VisionScheme, VisionSettings};

/// Vision module stand-in that returns zero embeddings of the shape a real export would.
pub struct ShapeOnlyEncoder {
    names: Vec<String>,
    scheme: VisionScheme,
    device: Device,
    hidden: usize,
    merge_area: usize,
    rows_per_view: usize,
    default_rows: usize,
}

impl ShapeOnlyEncoder {
    pub fn new(
        names: Vec<String>,
        settings: &VisionSettings,
        hidden: usize,
        default_rows: usize,
    ) -> Self {
        Self {
            scheme: VisionScheme::select(&names),
            names,
            device: Device::Cpu,
            hidden,
            merge_area: settings.merge_size.max(1).pow(2),
            rows_per_view: settings.rows_per_tile,
            default_rows,
        }
    }

    fn output_shape(&self, inputs: &[Tensor]) -> Result<Vec<usize>> {
        let leading = inputs.first().map(|t| t.dims().to_vec()).unwrap_or_default();
        match self.scheme {
            VisionScheme::WindowedGrid { .. } => {
                ensure!(!leading.is_empty(), "patches input is missing");
                Ok(vec![leading[0] / self.merge_area, self.hidden])
            }
            VisionScheme::Tiled | VisionScheme::Sliced => {
                ensure!(!leading.is_empty(), "pixel_values input is missing");
                Ok(vec![leading[0], self.rows_per_view, self.hidden])
            }
            VisionScheme::Default => Ok(vec![self.default_rows, self.hidden]),
        }
    }
}

impl VisionEncoder for ShapeOnlyEncoder {
    fn input_names(&self) -> &[String] {
        &self.names
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let shape = self.output_shape(inputs)?;
        Ok(Tensor::zeros(shape, DType::F32, &self.device)?)
    }
}
