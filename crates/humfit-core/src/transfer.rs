use std::fs;
use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use humfit_smplx::body_models::BodyModel;
use humfit_smplx::constants::NUM_BODY_JOINTS;

use crate::config::DatasetLayout;
use crate::error::{FitError, Result};
use crate::params::InitialFit;

/// Produces starting body parameters for the fitting body model, typically
/// by fitting it to a reconstruction made with another body model.
pub trait ParameterTransfer {
    /// # Arguments
    /// * `model` - The body model being fitted.
    /// * `subject`, `pose` - The capture to fit.
    /// * `pose_iterations`, `shape_iterations` - Optimisation budget of the
    ///   transfer's pose and shape stages.
    fn initial_fit(
        &self,
        model: &dyn BodyModel,
        subject: u32,
        pose: &str,
        pose_iterations: usize,
        shape_iterations: usize,
    ) -> Result<InitialFit>;
}

/// Rest pose, mean shape, unit scale.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralTransfer;

impl ParameterTransfer for NeutralTransfer {
    fn initial_fit(&self, model: &dyn BodyModel, subject: u32, pose: &str, _: usize, _: usize) -> Result<InitialFit> {
        info!("starting subject {} pose {} from the neutral body", subject, pose);
        let options = (Kind::Float, model.device());
        Ok(InitialFit {
            global_orient: Tensor::zeros([1, 3], options),
            transl: Tensor::zeros([1, 3], options),
            body_pose: Tensor::zeros([1, NUM_BODY_JOINTS, 3], options),
            betas: Tensor::zeros([1, model.num_betas()], options),
            scale: Tensor::ones([1], options),
        })
    }
}

/// Nested or flat lists of numbers, flattened on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Values {
    Scalar(f64),
    List(Vec<Values>),
}

impl Values {
    fn flatten(&self, out: &mut Vec<f32>) {
        match self {
            Values::Scalar(x) => out.push(*x as f32),
            Values::List(items) => items.iter().for_each(|item| item.flatten(out)),
        }
    }

    fn to_tensor(&self) -> Tensor {
        let mut flat = Vec::new();
        self.flatten(&mut flat);
        Tensor::from_slice(&flat)
    }
}

/// Contents of `smplx_init.json`, an initial fit computed offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialFitRecord {
    pub global_orient: Values,
    pub transl: Values,
    pub body_pose: Values,
    pub betas: Values,
    pub scale: Values,
    #[serde(default)]
    pub pose_iterations: Option<usize>,
    #[serde(default)]
    pub shape_iterations: Option<usize>,
}

impl InitialFitRecord {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn to_initial_fit(&self) -> InitialFit {
        InitialFit {
            global_orient: self.global_orient.to_tensor(),
            transl: self.transl.to_tensor(),
            body_pose: self.body_pose.to_tensor(),
            betas: self.betas.to_tensor(),
            scale: self.scale.to_tensor(),
        }
    }
}

/// Reads the initial fit stored with each capture.
#[derive(Debug, Clone)]
pub struct FitFileTransfer {
    root: std::path::PathBuf,
}

impl FitFileTransfer {
    pub fn new<P: AsRef<Path>>(dataset_root: P) -> Self {
        Self { root: dataset_root.as_ref().to_path_buf() }
    }
}

impl ParameterTransfer for FitFileTransfer {
    fn initial_fit(
        &self,
        model: &dyn BodyModel,
        subject: u32,
        pose: &str,
        pose_iterations: usize,
        shape_iterations: usize,
    ) -> Result<InitialFit> {
        let path = DatasetLayout::new(&self.root, subject, pose).initial_fit_path();
        let record = InitialFitRecord::open(&path).map_err(|err| match err {
            FitError::Io { source } if source.kind() == std::io::ErrorKind::NotFound => {
                FitError::InvalidInitialFit(format!("{} not found", path.display()))
            }
            err => err,
        })?;

        let mismatched = |stored: Option<usize>, requested: usize| stored.is_some_and(|s| s != requested);
        if mismatched(record.pose_iterations, pose_iterations) || mismatched(record.shape_iterations, shape_iterations) {
            warn!(
                "initial fit was computed with {:?}/{:?} pose/shape iterations, {}/{} requested",
                record.pose_iterations, record.shape_iterations, pose_iterations, shape_iterations
            );
        }
        debug!("reading initial fit from {}", path.display());
        record.to_initial_fit().validated(model)
    }
}
