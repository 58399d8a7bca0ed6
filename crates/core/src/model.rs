use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::backend::ExecutionDevice;
use crate::types::Normalization;

pub const CATALOG_FILE_NAME: &str = "catalog.json";

/// Scale assumed for discovered models whose filename carries no `x2`/`4x` hint.
pub const DEFAULT_SCALE: u32 = 4;

fn default_channels() -> u32 {
    3
}

fn default_pad_align() -> u32 {
    4
}

/// Immutable configuration of one upscaling model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    /// Absolute, or relative to the catalog's models directory.
    pub path: PathBuf,
    pub scale: u32,
    /// Largest square input the model accepts. `None` when the model takes any size.
    #[serde(default)]
    pub sample_size: Option<u32>,
    #[serde(default = "default_channels")]
    pub channels: u32,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub device: ExecutionDevice,
    #[serde(default)]
    pub is_fp16: bool,
    /// Spatial input dims must be multiples of this.
    #[serde(default = "default_pad_align")]
    pub pad_align: u32,
    #[serde(default)]
    pub input_name: Option<String>,
    #[serde(default)]
    pub output_name: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    pub fn from_path(
        path: impl Into<PathBuf>,
        scale: u32,
        sample_size: Option<u32>,
        device: ExecutionDevice,
    ) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();
        let is_fp16 = name.to_ascii_lowercase().contains("fp16");

        Self {
            name,
            path,
            scale,
            sample_size,
            channels: default_channels(),
            normalization: Normalization::default(),
            device,
            is_fp16,
            pad_align: default_pad_align(),
            input_name: None,
            output_name: None,
            sha256: None,
        }
    }

    pub fn with_device(mut self, device: ExecutionDevice) -> Self {
        self.device = device;
        self
    }

    pub fn with_sample_size(mut self, sample_size: Option<u32>) -> Self {
        self.sample_size = sample_size;
        self
    }
}

/// Scale hint from names like `RealESRGAN_x4plus`, `2x_AnimeJaNai` or `4xNomos`.
pub fn guess_scale(filename: &str) -> Option<u32> {
    let lower = filename.to_ascii_lowercase();
    for token in lower.split(|c: char| !c.is_ascii_alphanumeric()) {
        let bytes = token.as_bytes();
        let digit_at = |i: usize| bytes.get(i).copied().filter(u8::is_ascii_digit);
        let not_digit_at = |i: usize| bytes.get(i).is_none_or(|b| !b.is_ascii_digit());

        // x4, x4plus
        if bytes.first() == Some(&b'x') {
            if let Some(d) = digit_at(1) {
                if not_digit_at(2) {
                    return scale_from_digit(d);
                }
            }
        }
        // 4x, 4xnomos
        if let Some(d) = digit_at(0) {
            if bytes.get(1) == Some(&b'x') {
                return scale_from_digit(d);
            }
        }
    }
    None
}

fn scale_from_digit(d: u8) -> Option<u32> {
    match d - b'0' {
        s @ 1..=8 => Some(u32::from(s)),
        _ => None,
    }
}

fn builtin_catalog() -> Vec<ModelDescriptor> {
    vec![
        ModelDescriptor {
            name: "RealESRGAN_x4plus_anime_6B".into(),
            path: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            scale: 4,
            sample_size: Some(256),
            channels: 3,
            normalization: Normalization::ZeroTo255,
            device: ExecutionDevice::Cuda,
            is_fp16: false,
            pad_align: 4,
            input_name: Some("image.1".into()),
            output_name: Some("image".into()),
            sha256: None,
        },
        ModelDescriptor {
            name: "AnimeJaNai_V3_L1_Sharp_HD_x2_FP16".into(),
            path: "the_database_AnimeJaNaiV3L1_sharp_HD_x2_fp16_op17.onnx".into(),
            scale: 2,
            sample_size: Some(512),
            channels: 3,
            normalization: Normalization::ZeroToOne,
            device: ExecutionDevice::Cuda,
            is_fp16: true,
            pad_align: 4,
            input_name: Some("input".into()),
            output_name: Some("output".into()),
            sha256: None,
        },
    ]
}

/// Named models available under one models directory.
pub struct ModelCatalog {
    models_dir: PathBuf,
    entries: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Add every `.onnx` file in the models directory not already listed.
    pub fn discover(&mut self) -> Result<usize> {
        let dir = &self.models_dir;
        if !dir.exists() {
            debug!(dir = %dir.display(), "Models directory does not exist");
            return Ok(0);
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        let mut found: Vec<PathBuf> = Vec::new();
        for entry in read_dir {
            let path = entry?.path();
            let is_onnx = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
            if is_onnx && path.is_file() {
                found.push(path);
            }
        }
        found.sort();

        let mut added = 0;
        for path in found {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let relative = PathBuf::from(filename);
            if self.entries.iter().any(|e| e.path == relative) {
                continue;
            }

            let guessed = guess_scale(filename);
            let descriptor = ModelDescriptor::from_path(
                relative,
                guessed.unwrap_or(DEFAULT_SCALE),
                None,
                ExecutionDevice::default(),
            );
            if self.get(&descriptor.name).is_some() {
                continue;
            }

            info!(
                filename,
                scale = descriptor.scale,
                scale_guessed = guessed.is_some(),
                is_fp16 = descriptor.is_fp16,
                "Discovered ONNX model"
            );
            self.entries.push(descriptor);
            added += 1;
        }

        Ok(added)
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelDescriptor] {
        &self.entries
    }

    pub fn insert(&mut self, descriptor: ModelDescriptor) {
        match self.entries.iter_mut().find(|e| e.name == descriptor.name) {
            Some(existing) => *existing = descriptor,
            None => self.entries.push(descriptor),
        }
    }

    pub fn resolve_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        if descriptor.path.is_absolute() {
            descriptor.path.clone()
        } else {
            self.models_dir.join(&descriptor.path)
        }
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.resolve_path(e).is_file())
            .unwrap_or(false)
    }

    /// Check the model file against its configured SHA256, if any.
    pub fn verify(&self, name: &str) -> Result<()> {
        let entry = self
            .get(name)
            .with_context(|| format!("Unknown model: {name}"))?;
        let path = self.resolve_path(entry);

        let Some(expected) = &entry.sha256 else {
            warn!(model = %name, "No SHA256 hash configured, skipping verification");
            return Ok(());
        };

        let actual = sha256_file(&path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            bail!("SHA256 mismatch for {name}: expected {expected}, got {actual}");
        }
        info!(model = %name, "Hash verified OK");
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("Failed to serialize model catalog")
    }

    /// Merge entries from JSON; names already present are kept.
    pub fn load_json(&mut self, json: &str) -> Result<usize> {
        let loaded: Vec<ModelDescriptor> =
            serde_json::from_str(json).context("Failed to parse model catalog JSON")?;
        let mut added = 0;
        for entry in loaded {
            if self.get(&entry.name).is_none() {
                self.entries.push(entry);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Merge `<models_dir>/catalog.json` when it exists.
    pub fn load_catalog_file(&mut self) -> Result<usize> {
        let path = self.models_dir.join(CATALOG_FILE_NAME);
        if !path.is_file() {
            return Ok(0);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.load_json(&json)
            .with_context(|| format!("Invalid model catalog {}", path.display()))
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_path_defaults() {
        let d = ModelDescriptor::from_path(
            "/models/2x_Compact_fp16.onnx",
            2,
            Some(128),
            ExecutionDevice::Cpu,
        );
        assert_eq!(d.name, "2x_Compact_fp16");
        assert_eq!(d.scale, 2);
        assert_eq!(d.sample_size, Some(128));
        assert_eq!(d.channels, 3);
        assert_eq!(d.normalization, Normalization::ZeroToOne);
        assert_eq!(d.device, ExecutionDevice::Cpu);
        assert_eq!(d.pad_align, 4);
        assert!(d.is_fp16);
        assert!(d.input_name.is_none());
    }

    #[test]
    fn test_guess_scale() {
        assert_eq!(guess_scale("RealESRGAN_x4plus_anime_6B.onnx"), Some(4));
        assert_eq!(guess_scale("AnimeJaNaiV3L1_sharp_HD_x2_fp16_op17.onnx"), Some(2));
        assert_eq!(guess_scale("2x_AnimeJaNai.onnx"), Some(2));
        assert_eq!(guess_scale("4xNomos8k.onnx"), Some(4));
        assert_eq!(guess_scale("model_X3.onnx"), Some(3));
        assert_eq!(guess_scale("x264_denoise.onnx"), None);
        assert_eq!(guess_scale("vae_encoder.onnx"), None);
        assert_eq!(guess_scale("0x_broken.onnx"), None);
    }

    #[test]
    fn test_descriptor_json_fills_defaults() {
        let json = r#"{"name":"m","path":"m.onnx","scale":2}"#;
        let d: ModelDescriptor = serde_json::from_str(json).expect("parse");
        assert_eq!(d.channels, 3);
        assert_eq!(d.pad_align, 4);
        assert_eq!(d.sample_size, None);
        assert_eq!(d.device, ExecutionDevice::Cuda);
        assert_eq!(d.normalization, Normalization::ZeroToOne);
    }

    #[test]
    fn test_builtin_catalog() {
        let catalog = ModelCatalog::with_builtin_models(PathBuf::from("models"));
        assert_eq!(catalog.list().len(), 2);

        let esrgan = catalog.get("RealESRGAN_x4plus_anime_6B").expect("esrgan");
        assert_eq!(esrgan.scale, 4);
        assert_eq!(esrgan.normalization, Normalization::ZeroTo255);
        assert_eq!(
            catalog.resolve_path(esrgan),
            PathBuf::from("models/RealESRGAN_x4plus_anime_6B.onnx")
        );
        assert!(catalog.get("missing").is_none());
    }

    #[test]
    fn test_discover_scans_onnx_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("RealESRGAN_x2plus.onnx"), b"onnx").expect("write");
        fs::write(dir.path().join("mystery.ONNX"), b"onnx").expect("write");
        fs::write(dir.path().join("notes.txt"), b"text").expect("write");

        let mut catalog = ModelCatalog::new(dir.path().to_path_buf());
        assert_eq!(catalog.discover().expect("discover"), 2);
        assert_eq!(catalog.list().len(), 2);

        let x2 = catalog.get("RealESRGAN_x2plus").expect("x2 model");
        assert_eq!(x2.scale, 2);
        assert_eq!(x2.path, PathBuf::from("RealESRGAN_x2plus.onnx"));
        assert!(catalog.is_available("RealESRGAN_x2plus"));

        let mystery = catalog.get("mystery").expect("mystery model");
        assert_eq!(mystery.scale, DEFAULT_SCALE);

        assert_eq!(catalog.discover().expect("rediscover"), 0);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut catalog = ModelCatalog::new(dir.path().join("nope"));
        assert_eq!(catalog.discover().expect("discover"), 0);
        assert!(catalog.list().is_empty());
    }

    #[test]
    fn test_discover_skips_builtin_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("RealESRGAN_x4plus_anime_6B.onnx"), b"onnx").expect("write");

        let mut catalog = ModelCatalog::with_builtin_models(dir.path().to_path_buf());
        assert_eq!(catalog.discover().expect("discover"), 0);
        assert!(catalog.is_available("RealESRGAN_x4plus_anime_6B"));
        assert!(!catalog.is_available("AnimeJaNai_V3_L1_Sharp_HD_x2_FP16"));
    }

    #[test]
    fn test_json_roundtrip_merges_by_name() {
        let source = ModelCatalog::with_builtin_models(PathBuf::from("a"));
        let json = source.to_json().expect("json");

        let mut target = ModelCatalog::new(PathBuf::from("b"));
        target.insert(ModelDescriptor::from_path(
            "RealESRGAN_x4plus_anime_6B.onnx",
            3,
            None,
            ExecutionDevice::Cpu,
        ));
        assert_eq!(target.load_json(&json).expect("load"), 1);
        assert_eq!(target.list().len(), 2);
        assert_eq!(
            target.get("RealESRGAN_x4plus_anime_6B").expect("kept").scale,
            3
        );
        assert!(target.load_json("not json").is_err());
    }

    #[test]
    fn test_load_catalog_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut catalog = ModelCatalog::new(dir.path().to_path_buf());
        assert_eq!(catalog.load_catalog_file().expect("no file"), 0);

        let json = r#"[{"name":"custom","path":"/abs/custom.onnx","scale":2,"sample_size":64}]"#;
        fs::write(dir.path().join(CATALOG_FILE_NAME), json).expect("write");
        assert_eq!(catalog.load_catalog_file().expect("load"), 1);

        let custom = catalog.get("custom").expect("custom");
        assert_eq!(custom.sample_size, Some(64));
        assert_eq!(catalog.resolve_path(custom), PathBuf::from("/abs/custom.onnx"));
    }

    #[test]
    fn test_verify_sha256() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("m.onnx"), b"abc").expect("write");

        let mut catalog = ModelCatalog::new(dir.path().to_path_buf());
        let mut d = ModelDescriptor::from_path("m.onnx", 2, None, ExecutionDevice::Cpu);
        d.sha256 =
            Some("BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD".into());
        catalog.insert(d.clone());
        catalog.verify("m").expect("hash matches");

        d.sha256 = Some("00".into());
        catalog.insert(d);
        let err = catalog.verify("m").unwrap_err();
        assert!(err.to_string().contains("SHA256 mismatch"));
        assert!(catalog.verify("unknown").is_err());
    }
}
