//! Latent initialization for image-to-image diffusion.
//!
//! A `strength` in `[0, 1]` decides how much of the denoising schedule runs:
//! the image is encoded to latents, noised to the first kept timestep, and
//! the remaining steps denoise from there.

use anyhow::{bail, Context, Result};
use ndarray::Array4;

use crate::engine::InferenceEngine;
use crate::types::{Image, Normalization};

/// Latent scaling factor of the Stable Diffusion 1.x VAE.
pub const DEFAULT_LATENT_SCALING_FACTOR: f32 = 0.18215;

/// Keep the tail of a descending schedule. Returns the kept timesteps and
/// how many denoising steps remain.
pub fn truncate_timesteps(schedule: &[i64], strength: f32) -> Result<(Vec<i64>, usize)> {
    if !(0.0..=1.0).contains(&strength) {
        bail!("strength must be within [0, 1], got {strength}");
    }
    let total = schedule.len();
    let init_steps = ((total as f32 * strength).round() as usize).min(total);
    let start = total - init_steps;
    Ok((schedule[start..].to_vec(), init_steps))
}

/// `sqrt(alpha_bar_t) * latents + sqrt(1 - alpha_bar_t) * noise`.
pub fn add_noise(
    latents: &Array4<f32>,
    noise: &Array4<f32>,
    alphas_cumprod: &[f32],
    timestep: i64,
) -> Result<Array4<f32>> {
    if latents.shape() != noise.shape() {
        bail!(
            "noise shape {:?} does not match latent shape {:?}",
            noise.shape(),
            latents.shape()
        );
    }
    let alpha_bar = usize::try_from(timestep)
        .ok()
        .and_then(|t| alphas_cumprod.get(t).copied())
        .with_context(|| {
            format!(
                "timestep {timestep} is outside the {}-step noise schedule",
                alphas_cumprod.len()
            )
        })?;
    if !(0.0..=1.0).contains(&alpha_bar) {
        bail!("alpha_bar {alpha_bar} at timestep {timestep} is not a probability");
    }

    let signal = alpha_bar.sqrt();
    let sigma = (1.0 - alpha_bar).sqrt();
    Ok(latents * signal + noise * sigma)
}

/// Encode `image` with a VAE encoder, scale the latents and noise them to `timestep`.
/// The latent shape is taken from `noise`.
pub fn prepare_latents<E: InferenceEngine + ?Sized>(
    encoder: &mut E,
    image: &Image,
    noise: &Array4<f32>,
    alphas_cumprod: &[f32],
    timestep: i64,
    scaling_factor: f32,
) -> Result<Array4<f32>> {
    let (n, c, h, w) = noise.dim();
    let input = image.renormalized(Normalization::MinusOneToOne).into_tensor();
    let latents = encoder
        .run(input, [n, c, h, w])
        .context("VAE encoder failed")?;
    if latents.dim() != (n, c, h, w) {
        bail!(
            "VAE encoder returned shape {:?}, expected {:?}",
            latents.shape(),
            noise.shape()
        );
    }
    add_noise(&(latents * scaling_factor), noise, alphas_cumprod, timestep)
}

/// Cumulative alpha products of the "scaled linear" beta schedule.
pub fn scaled_linear_alphas_cumprod(train_steps: usize, beta_start: f32, beta_end: f32) -> Vec<f32> {
    let divisor = train_steps.saturating_sub(1).max(1) as f32;
    let (start, end) = (beta_start.sqrt(), beta_end.sqrt());
    (0..train_steps)
        .scan(1.0_f32, |acc, i| {
            let beta = (start + (end - start) * i as f32 / divisor).powi(2);
            *acc *= 1.0 - beta;
            Some(*acc)
        })
        .collect()
}

/// Evenly spaced descending timesteps ("leading" spacing).
pub fn leading_timesteps(inference_steps: usize, train_steps: usize) -> Vec<i64> {
    if inference_steps == 0 {
        return Vec::new();
    }
    let stride = (train_steps / inference_steps).max(1);
    (0..inference_steps)
        .map(|i| (i * stride) as i64)
        .filter(|t| (*t as usize) < train_steps)
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModelMetadata;

    #[test]
    fn test_truncate_keeps_tail() {
        let schedule = [900, 800, 700, 600, 500, 400, 300, 200, 100, 0];
        let (kept, steps) = truncate_timesteps(&schedule, 0.3).expect("truncate");
        assert_eq!(kept, vec![200, 100, 0]);
        assert_eq!(steps, 3);

        let (kept, steps) = truncate_timesteps(&schedule, 1.0).expect("full");
        assert_eq!(kept.len(), 10);
        assert_eq!(steps, 10);

        let (kept, steps) = truncate_timesteps(&schedule, 0.0).expect("none");
        assert!(kept.is_empty());
        assert_eq!(steps, 0);
    }

    #[test]
    fn test_truncate_rounds_to_nearest() {
        let schedule = [3, 2, 1, 0];
        assert_eq!(truncate_timesteps(&schedule, 0.6).expect("t").1, 2);
        assert_eq!(truncate_timesteps(&schedule, 0.7).expect("t").1, 3);
    }

    #[test]
    fn test_truncate_rejects_bad_strength() {
        assert!(truncate_timesteps(&[1, 0], -0.1).is_err());
        assert!(truncate_timesteps(&[1, 0], 1.5).is_err());
        assert!(truncate_timesteps(&[1, 0], f32::NAN).is_err());
    }

    #[test]
    fn test_add_noise_mixes_signal_and_noise() {
        let latents = Array4::from_elem((1, 4, 2, 2), 2.0);
        let noise = Array4::from_elem((1, 4, 2, 2), 1.0);
        let alphas = [0.64, 0.25];

        let noised = add_noise(&latents, &noise, &alphas, 1).expect("noise");
        // sqrt(0.25) * 2 + sqrt(0.75) * 1
        let expected = 0.5 * 2.0 + 0.75_f32.sqrt();
        assert!(noised.iter().all(|v| (v - expected).abs() < 1e-6));

        let clean = add_noise(&latents, &noise, &[1.0], 0).expect("clean");
        assert_eq!(clean, latents);
    }

    #[test]
    fn test_add_noise_validates_inputs() {
        let latents = Array4::<f32>::zeros((1, 4, 2, 2));
        assert!(add_noise(&latents, &Array4::zeros((1, 4, 2, 3)), &[0.5], 0).is_err());
        assert!(add_noise(&latents, &latents, &[0.5], 1).is_err());
        assert!(add_noise(&latents, &latents, &[0.5], -1).is_err());
        assert!(add_noise(&latents, &latents, &[1.5], 0).is_err());
    }

    /// Averages 2x2 blocks of the first channel into every latent channel.
    struct BlockEncoder {
        seen_min: f32,
    }

    impl InferenceEngine for BlockEncoder {
        fn load(&mut self) -> Result<()> {
            Ok(())
        }

        fn unload(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_loaded(&self) -> bool {
            true
        }

        fn metadata(&self) -> Result<ModelMetadata> {
            Ok(ModelMetadata {
                sample_size: None,
                channels: 3,
                scale: 1,
                normalization: Normalization::MinusOneToOne,
            })
        }

        fn run(&mut self, input: Array4<f32>, output_shape: [usize; 4]) -> Result<Array4<f32>> {
            self.seen_min = input.iter().copied().fold(f32::INFINITY, f32::min);
            Ok(Array4::from_shape_fn(output_shape, |(_, _, y, x)| {
                let mut sum = 0.0;
                for dy in 0..2 {
                    for dx in 0..2 {
                        sum += input[[0, 0, y * 2 + dy, x * 2 + dx]];
                    }
                }
                sum / 4.0
            }))
        }
    }

    #[test]
    fn test_prepare_latents_encodes_in_minus_one_to_one() {
        let image = Image::zeros(3, 4, 4, Normalization::ZeroToOne).expect("image");
        let noise = Array4::<f32>::zeros((1, 4, 2, 2));
        let mut encoder = BlockEncoder { seen_min: 0.0 };

        let latents = prepare_latents(&mut encoder, &image, &noise, &[1.0], 0, 0.5)
            .expect("latents");
        assert_eq!(encoder.seen_min, -1.0);
        assert_eq!(latents.dim(), (1, 4, 2, 2));
        assert!(latents.iter().all(|v| (*v + 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_schedule_helpers() {
        let alphas = scaled_linear_alphas_cumprod(1000, 0.00085, 0.012);
        assert_eq!(alphas.len(), 1000);
        assert!((alphas[0] - (1.0 - 0.00085)).abs() < 1e-6);
        assert!(alphas.windows(2).all(|w| w[1] < w[0]));

        let timesteps = leading_timesteps(10, 1000);
        assert_eq!(timesteps.first(), Some(&900));
        assert_eq!(timesteps.last(), Some(&0));
        assert_eq!(timesteps.len(), 10);
        assert!(leading_timesteps(0, 1000).is_empty());
    }
}
