use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tch::Device;

use humfit_renderer::render::RenderSettings;

use crate::error::{FitError, Result};
use crate::optim::PlateauConfig;

/// Device and seed of one run, passed explicitly to every entry point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunConfig {
    pub device: Device,
    pub seed: u64,
}

impl RunConfig {
    pub fn new(device: Device, seed: u64) -> Self {
        Self { device, seed }
    }

    /// Runs on `device`, or on the CPU when CUDA is requested but absent.
    pub fn resolve(device: Device, seed: u64) -> Self {
        Self { device: resolve_device(device, tch::Cuda::is_available()), seed }
    }
}

fn resolve_device(requested: Device, cuda_available: bool) -> Device {
    match requested {
        Device::Cuda(index) if !cuda_available => {
            info!("CUDA device {} is not available, running on CPU", index);
            Device::Cpu
        }
        device => device,
    }
}

/// Configuration of one fit, usually loaded from a json5 file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    /// Directory holding the `subject_<s>` folders.
    pub dataset_root: PathBuf,
    pub subject: u32,
    pub pose: String,
    /// Body model arrays, `.npz` or `.safetensors`.
    pub model_path: PathBuf,
    /// OBJ carrying the UV layout of the body model.
    pub uv_template_path: PathBuf,
    /// Maximum number of epochs.
    pub iterations: usize,
    #[serde(default)]
    pub subdivision: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: i64,
    #[serde(default)]
    pub save_path: Option<PathBuf>,
    #[serde(default = "default_texture_size")]
    pub texture_size: i64,
    /// Camera indices `0..num_cameras` are tried.
    #[serde(default = "default_num_cameras")]
    pub num_cameras: usize,
    #[serde(default)]
    pub initial_fit: InitialFitSource,
    #[serde(default = "default_pose_iterations")]
    pub pose_iterations: usize,
    #[serde(default = "default_shape_iterations")]
    pub shape_iterations: usize,
    #[serde(default)]
    pub optim: OptimConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub render: RenderConfig,
    /// `"cpu"` or `"cuda(N)"`; a missing CUDA device falls back to the CPU.
    #[serde(
        serialize_with = "serialize_device",
        deserialize_with = "deserialize_device",
        default = "default_device"
    )]
    pub device: Device,
    #[serde(default)]
    pub seed: u64,
}

impl FitConfig {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: FitConfig = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects sizes and strides the photo sampling and renderer cannot use.
    pub fn validate(&self) -> Result<()> {
        let positive = |field: &'static str, value: i64| {
            if value < 1 {
                Err(FitError::InvalidConfig { field, reason: format!("{value} is not positive") })
            } else {
                Ok(())
            }
        };
        positive("rescale_factor", self.rescale_factor)?;
        positive("texture_size", self.texture_size)?;
        positive("render.tile_size", self.render.tile_size)?;
        if self.render.sigma.is_nan() || self.render.sigma <= 0.0 {
            return Err(FitError::InvalidConfig {
                field: "render.sigma",
                reason: format!("{} is not positive", self.render.sigma),
            });
        }
        Ok(())
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig::resolve(self.device, self.seed)
    }

    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(&self.dataset_root, self.subject, &self.pose)
    }
}

/// Where the initial body parameters come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialFitSource {
    /// `smplx_init.json` next to the keypoints.
    #[default]
    #[serde(rename = "file")]
    File,
    /// Rest pose, mean shape, unit scale.
    #[serde(rename = "neutral")]
    Neutral,
}

/// Learning rates and plateau scheduling of the three parameter groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub pose_shape_lr: f64,
    pub geometry_lr: f64,
    pub texture_lr: f64,
    pub scheduler: PlateauConfig,
    /// Stop once geometry and texture rates fall below this fraction of
    /// their initial value.
    pub early_stop_ratio: f64,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            pose_shape_lr: 0.01,
            geometry_lr: 1e-4,
            texture_lr: 0.01,
            scheduler: PlateauConfig::default(),
            early_stop_ratio: 0.01,
        }
    }
}

/// Weights of the loss terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    pub rgb: f64,
    pub silhouette: f64,
    pub laplacian: f64,
    pub keypoints: f64,
    /// Weight of `||disp||_2`, off when `None`.
    pub displacement: Option<f64>,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self { rgb: 1.0, silhouette: 1.0, laplacian: 1.0, keypoints: 1.0, displacement: None }
    }
}

/// Appearance settings of the renders. The render size follows the photos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub sigma: f64,
    pub ambient: f64,
    pub diffuse: f64,
    pub background: [f64; 3],
    pub znear: f64,
    pub tile_size: i64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let settings = RenderSettings::default();
        Self {
            sigma: settings.sigma,
            ambient: settings.ambient,
            diffuse: settings.diffuse,
            background: settings.background,
            znear: settings.znear,
            tile_size: settings.tile_size,
        }
    }
}

impl RenderConfig {
    pub fn settings(&self, image_size: (i64, i64), rescale_factor: i64) -> RenderSettings {
        RenderSettings {
            image_size,
            rescale_factor,
            sigma: self.sigma,
            ambient: self.ambient,
            diffuse: self.diffuse,
            background: self.background,
            znear: self.znear,
            tile_size: self.tile_size,
        }
    }
}

/// File layout of one subject/pose capture.
///
/// ```text
/// <root>/subject_<s>/body/cameras.json
/// <root>/subject_<s>/body/<pose>/image/image<idx:07>.jpg
/// <root>/subject_<s>/body/<pose>/mask/image<idx:07>.png
/// <root>/subject_<s>/body/<pose>/reconstruction/keypoints.txt
/// <root>/subject_<s>/body/<pose>/reconstruction/smplx_init.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    pub root: PathBuf,
    pub subject: u32,
    pub pose: String,
}

impl DatasetLayout {
    pub fn new<P: AsRef<Path>>(root: P, subject: u32, pose: &str) -> Self {
        Self { root: root.as_ref().to_path_buf(), subject, pose: pose.to_string() }
    }

    pub fn body_dir(&self) -> PathBuf {
        self.root.join(format!("subject_{}", self.subject)).join("body")
    }

    pub fn pose_dir(&self) -> PathBuf {
        self.body_dir().join(&self.pose)
    }

    pub fn cameras_path(&self) -> PathBuf {
        self.body_dir().join("cameras.json")
    }

    pub fn photo_path(&self, camera_index: usize) -> PathBuf {
        self.pose_dir().join("image").join(format!("image{camera_index:07}.jpg"))
    }

    pub fn keypoints_path(&self) -> PathBuf {
        self.pose_dir().join("reconstruction").join("keypoints.txt")
    }

    pub fn initial_fit_path(&self) -> PathBuf {
        self.pose_dir().join("reconstruction").join("smplx_init.json")
    }
}

fn default_rescale_factor() -> i64 {
    3
}

fn default_texture_size() -> i64 {
    1024
}

fn default_num_cameras() -> usize {
    107
}

fn default_pose_iterations() -> usize {
    200
}

fn default_shape_iterations() -> usize {
    100
}

fn default_device() -> Device {
    Device::Cuda(0)
}

fn serialize_device<S>(device: &Device, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let text = match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(n) => format!("cuda({})", n),
        other => return Err(S::Error::custom(format!("unsupported device {:?}", other))),
    };
    text.serialize(serializer)
}

fn deserialize_device<'de, D>(deserializer: D) -> std::result::Result<Device, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    parse_device(&name).ok_or_else(|| D::Error::custom(format!("invalid device name {}", name)))
}

fn parse_device(name: &str) -> Option<Device> {
    match name {
        "cpu" => Some(Device::Cpu),
        "cuda" => Some(Device::Cuda(0)),
        _ => {
            let number = name.strip_prefix("cuda(")?.strip_suffix(')')?;
            number.parse().ok().map(Device::Cuda)
        }
    }
}
