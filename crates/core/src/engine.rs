//! Inference engine boundary and the ONNX Runtime implementation.
//!
//! The pipeline only talks to [`InferenceEngine`]: load the model, report its
//! metadata, run one NCHW tensor. [`OrtEngine`] supports FP32 models (plain
//! run or IoBinding) and FP16 models (inputs converted through `half`).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::debug;

use crate::backend::{build_session, SessionConfig};
use crate::model::ModelDescriptor;
use crate::types::Normalization;

/// What a loaded engine reports about its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelMetadata {
    /// Largest square input the model accepts, if bounded.
    pub sample_size: Option<usize>,
    pub channels: usize,
    pub scale: usize,
    /// Value range the model consumes and produces.
    pub normalization: Normalization,
}

pub trait InferenceEngine: Send + 'static {
    fn load(&mut self) -> Result<()>;

    fn unload(&mut self) -> Result<()>;

    fn is_loaded(&self) -> bool;

    /// Only meaningful after a successful `load`.
    fn metadata(&self) -> Result<ModelMetadata>;

    /// Run one `[1, C, H, W]` tensor. The result must have `output_shape`.
    fn run(&mut self, input: Array4<f32>, output_shape: [usize; 4]) -> Result<Array4<f32>>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn load(&mut self) -> Result<()> {
        (**self).load()
    }

    fn unload(&mut self) -> Result<()> {
        (**self).unload()
    }

    fn is_loaded(&self) -> bool {
        (**self).is_loaded()
    }

    fn metadata(&self) -> Result<ModelMetadata> {
        (**self).metadata()
    }

    fn run(&mut self, input: Array4<f32>, output_shape: [usize; 4]) -> Result<Array4<f32>> {
        (**self).run(input, output_shape)
    }
}

struct LoadedModel {
    session: Session,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    /// Fixed spatial input dims `(h, w)` declared by the graph.
    static_hw: Option<(usize, usize)>,
    channels: usize,
    scale: usize,
}

pub struct OrtEngine {
    descriptor: ModelDescriptor,
    model_path: PathBuf,
    trt_cache_dir: Option<PathBuf>,
    use_iobinding: bool,
    loaded: Option<LoadedModel>,
}

impl OrtEngine {
    pub fn new(descriptor: ModelDescriptor, model_path: PathBuf) -> Self {
        Self {
            descriptor,
            model_path,
            trt_cache_dir: None,
            use_iobinding: false,
            loaded: None,
        }
    }

    pub fn from_descriptor(descriptor: ModelDescriptor) -> Self {
        let model_path = descriptor.path.clone();
        Self::new(descriptor, model_path)
    }

    pub fn with_trt_cache_dir(mut self, dir: PathBuf) -> Self {
        self.trt_cache_dir = Some(dir);
        self
    }

    pub fn with_iobinding(mut self, enabled: bool) -> Self {
        self.use_iobinding = enabled;
        self
    }

    pub fn is_fp16(&self) -> bool {
        self.loaded.as_ref().is_some_and(|m| m.is_fp16)
    }
}

/// Positive dims of a 4-D NCHW shape, `None` for symbolic axes.
fn static_nchw(dtype: &ort::value::ValueType) -> Option<[Option<usize>; 4]> {
    match dtype {
        ort::value::ValueType::Tensor { shape, .. } => {
            let dims: Vec<i64> = shape.iter().copied().collect();
            if dims.len() != 4 {
                return None;
            }
            let dim = |i: usize| usize::try_from(dims[i]).ok().filter(|d| *d > 0);
            Some([dim(0), dim(1), dim(2), dim(3)])
        }
        _ => None,
    }
}

impl InferenceEngine for OrtEngine {
    fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Ok(());
        }

        debug!(
            model = %self.model_path.display(),
            scale = self.descriptor.scale,
            device = %self.descriptor.device,
            use_iobinding = self.use_iobinding,
            "Loading ONNX super-resolution model"
        );

        let config = SessionConfig {
            model_path: &self.model_path,
            device: self.descriptor.device,
            trt_cache_dir: self.trt_cache_dir.as_deref(),
        };
        let session = build_session(&config)?;

        let input = session
            .inputs()
            .first()
            .context("ONNX model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("ONNX model declares no outputs")?;

        let input_name = self
            .descriptor
            .input_name
            .clone()
            .unwrap_or_else(|| input.name().to_string());
        let output_name = self
            .descriptor
            .output_name
            .clone()
            .unwrap_or_else(|| output.name().to_string());
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        let in_dims = static_nchw(input.dtype());
        let out_dims = static_nchw(output.dtype());
        let static_hw = in_dims.and_then(|d| Some((d[2]?, d[3]?)));
        let channels = in_dims
            .and_then(|d| d[1])
            .unwrap_or(self.descriptor.channels as usize);
        let scale = match (static_hw, out_dims.and_then(|d| d[2])) {
            (Some((in_h, _)), Some(out_h)) if out_h % in_h == 0 => out_h / in_h,
            _ => self.descriptor.scale as usize,
        };

        debug!(
            %input_name, %output_name, is_fp16, ?static_hw, channels, scale,
            "Detected model IO"
        );

        self.loaded = Some(LoadedModel {
            session,
            input_name,
            output_name,
            is_fp16,
            static_hw,
            channels,
            scale,
        });
        Ok(())
    }

    fn unload(&mut self) -> Result<()> {
        if self.loaded.take().is_some() {
            debug!(model = %self.model_path.display(), "Released ONNX session");
        }
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn metadata(&self) -> Result<ModelMetadata> {
        let model = self.loaded.as_ref().context("ONNX model is not loaded")?;
        let sample_size = model
            .static_hw
            .map(|(h, w)| h.min(w))
            .or(self.descriptor.sample_size.map(|s| s as usize));
        Ok(ModelMetadata {
            sample_size,
            channels: model.channels,
            scale: model.scale,
            normalization: self.descriptor.normalization,
        })
    }

    fn run(&mut self, input: Array4<f32>, output_shape: [usize; 4]) -> Result<Array4<f32>> {
        let use_iobinding = self.use_iobinding;
        let pad_align = (self.descriptor.pad_align as usize).max(1);
        let model = self.loaded.as_mut().context("ONNX model is not loaded")?;

        let (_, _, h, w) = input.dim();
        let (target_h, target_w) = match model.static_hw {
            Some((sh, sw)) => {
                if h > sh || w > sw {
                    bail!("input {h}x{w} exceeds the model's fixed input size {sh}x{sw}");
                }
                (sh, sw)
            }
            None => (align_up(h, pad_align), align_up(w, pad_align)),
        };
        let padded = reflect_pad(&input, target_h, target_w);

        let raw = if model.is_fp16 {
            run_fp16_inference(
                &mut model.session,
                &padded,
                &model.input_name,
                &model.output_name,
            )?
        } else {
            let input_tensor = Tensor::from_array(padded)?;
            if use_iobinding {
                run_with_iobinding(
                    &mut model.session,
                    &model.input_name,
                    &input_tensor,
                    &model.output_name,
                )?
            } else {
                let outputs = model
                    .session
                    .run(ort::inputs![model.input_name.as_str() => &input_tensor])?;
                outputs[model.output_name.as_str()]
                    .try_extract_array::<f32>()?
                    .to_owned()
            }
        };

        crop_output(raw.into_dimensionality::<Ix4>()?, output_shape)
    }
}

fn align_up(dim: usize, align: usize) -> usize {
    dim.div_ceil(align) * align
}

/// Symmetric reflection index for padding past the edge.
fn mirror(i: usize, len: usize) -> usize {
    let period = 2 * len;
    let j = i % period;
    if j < len {
        j
    } else {
        period - 1 - j
    }
}

/// Reflection-pad the spatial dims of an NCHW array up to `target_h`×`target_w`.
fn reflect_pad(arr: &Array4<f32>, target_h: usize, target_w: usize) -> Array4<f32> {
    let (n, c, h, w) = arr.dim();
    if h == target_h && w == target_w {
        return arr.clone();
    }
    Array4::from_shape_fn((n, c, target_h, target_w), |(b, ch, y, x)| {
        arr[[b, ch, mirror(y, h), mirror(x, w)]]
    })
}

fn crop_output(output: Array4<f32>, expected: [usize; 4]) -> Result<Array4<f32>> {
    let [n, c, h, w] = expected;
    let (on, oc, oh, ow) = output.dim();
    if (on, oc, oh, ow) == (n, c, h, w) {
        return Ok(output);
    }
    if on != n || oc != c || oh < h || ow < w {
        bail!(
            "model produced shape [{on}, {oc}, {oh}, {ow}], cannot crop to [{n}, {c}, {h}, {w}]"
        );
    }
    Ok(output.slice(s![.., .., ..h, ..w]).to_owned())
}

fn run_with_iobinding(
    session: &mut Session,
    input_name: &str,
    input_tensor: &Tensor<f32>,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let mut binding = session.create_binding()?;
    binding.bind_input(input_name, input_tensor)?;
    binding.bind_output_to_device(output_name, &session.allocator().memory_info())?;
    let outputs = session.run_binding(&binding)?;
    let output_view = outputs[output_name].try_extract_array::<f32>()?;
    Ok(output_view.to_owned())
}

fn run_fp16_inference(
    session: &mut Session,
    input: &Array4<f32>,
    input_name: &str,
    output_name: &str,
) -> Result<ArrayD<f32>> {
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);

    let fp16_array = ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
    let input_tensor = Tensor::from_array(fp16_array)?;
    let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
    let output_view = outputs[output_name].try_extract_array::<f16>()?;

    let fp16_owned = output_view.as_standard_layout();
    let fp16_slice = fp16_owned
        .as_slice()
        .context("output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);

    Ok(ArrayD::from_shape_vec(output_view.shape().to_vec(), f32_data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionDevice;

    fn ramp(h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((1, 2, h, w), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32)
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(7, 1), 7);
    }

    #[test]
    fn test_mirror_is_symmetric() {
        let idx: Vec<usize> = (0..8).map(|i| mirror(i, 3)).collect();
        assert_eq!(idx, vec![0, 1, 2, 2, 1, 0, 0, 1]);
        assert!((0..5).all(|i| mirror(i, 1) == 0));
    }

    #[test]
    fn test_reflect_pad_copies_edges() {
        let arr = ramp(3, 2);
        let padded = reflect_pad(&arr, 4, 4);
        assert_eq!(padded.dim(), (1, 2, 4, 4));
        assert_eq!(padded.slice(s![.., .., ..3, ..2]), arr);
        assert_eq!(padded[[0, 1, 3, 0]], arr[[0, 1, 2, 0]]);
        assert_eq!(padded[[0, 0, 0, 2]], arr[[0, 0, 0, 1]]);
        assert_eq!(padded[[0, 0, 0, 3]], arr[[0, 0, 0, 0]]);
    }

    #[test]
    fn test_reflect_pad_noop_when_aligned() {
        let arr = ramp(4, 4);
        assert_eq!(reflect_pad(&arr, 4, 4), arr);
    }

    #[test]
    fn test_crop_output() {
        let out = ramp(8, 8);
        let cropped = crop_output(out.clone(), [1, 2, 6, 5]).expect("crop");
        assert_eq!(cropped.dim(), (1, 2, 6, 5));
        assert_eq!(cropped[[0, 1, 5, 4]], out[[0, 1, 5, 4]]);

        assert!(crop_output(out.clone(), [1, 3, 4, 4]).is_err());
        assert!(crop_output(out, [1, 2, 9, 4]).is_err());
    }

    #[test]
    fn test_unloaded_engine_reports_errors() {
        let descriptor =
            ModelDescriptor::from_path("missing.onnx", 2, Some(64), ExecutionDevice::Cpu);
        let mut engine = OrtEngine::from_descriptor(descriptor);
        assert!(!engine.is_loaded());
        assert!(!engine.is_fp16());
        assert!(engine.metadata().is_err());
        assert!(engine.run(ramp(4, 4), [1, 2, 8, 8]).is_err());
        engine.unload().expect("unload is idempotent");
    }
}
