use tch::{Device, Kind, Tensor};

use humfit_smplx::body_models::{BodyModel, BodyPose};
use humfit_smplx::constants::{NUM_BODY_JOINTS, NUM_HAND_JOINTS};

use crate::error::{FitError, Result};

/// Pose and shape of the body, every rotation as an axis-angle 3-vector.
#[derive(Debug)]
pub struct BodyParams {
    /// 1x3
    pub global_orient: Tensor,
    /// 1x3
    pub transl: Tensor,
    /// 1x21x3
    pub body_pose: Tensor,
    /// 1x15x3
    pub left_hand_pose: Tensor,
    /// 1x15x3
    pub right_hand_pose: Tensor,
    /// 1x1x3
    pub jaw_pose: Tensor,
    /// 1xE
    pub expression: Tensor,
    /// 1xB
    pub betas: Tensor,
    /// 1
    pub scale: Tensor,
}

impl BodyParams {
    /// Rest pose, mean shape, unit scale, no translation.
    pub fn neutral(num_betas: i64, num_expression_coeffs: i64, device: Device) -> Self {
        let options = (Kind::Float, device);
        Self {
            global_orient: Tensor::zeros([1, 3], options),
            transl: Tensor::zeros([1, 3], options),
            body_pose: Tensor::zeros([1, NUM_BODY_JOINTS, 3], options),
            left_hand_pose: Tensor::zeros([1, NUM_HAND_JOINTS, 3], options),
            right_hand_pose: Tensor::zeros([1, NUM_HAND_JOINTS, 3], options),
            jaw_pose: Tensor::zeros([1, 1, 3], options),
            expression: Tensor::zeros([1, num_expression_coeffs], options),
            betas: Tensor::zeros([1, num_betas], options),
            scale: Tensor::ones([1], options),
        }
    }

    /// Starts from an initial fit with hands, jaw and expression at rest.
    pub fn from_initial_fit(fit: &InitialFit, num_expression_coeffs: i64) -> Self {
        let options = (Kind::Float, fit.betas.device());
        Self {
            global_orient: fit.global_orient.shallow_clone(),
            transl: fit.transl.shallow_clone(),
            body_pose: fit.body_pose.shallow_clone(),
            left_hand_pose: Tensor::zeros([1, NUM_HAND_JOINTS, 3], options),
            right_hand_pose: Tensor::zeros([1, NUM_HAND_JOINTS, 3], options),
            jaw_pose: Tensor::zeros([1, 1, 3], options),
            expression: Tensor::zeros([1, num_expression_coeffs], options),
            betas: fit.betas.shallow_clone(),
            scale: fit.scale.shallow_clone(),
        }
    }

    /// Rotation-matrix pose fed to the body model.
    pub fn body_pose_matrices(&self) -> BodyPose {
        BodyPose::from_axis_angle(
            &self.global_orient,
            &self.body_pose,
            &self.jaw_pose,
            &self.left_hand_pose,
            &self.right_hand_pose,
            &self.betas,
            &self.expression,
        )
    }

    pub fn detach(&self) -> Self {
        Self {
            global_orient: self.global_orient.detach(),
            transl: self.transl.detach(),
            body_pose: self.body_pose.detach(),
            left_hand_pose: self.left_hand_pose.detach(),
            right_hand_pose: self.right_hand_pose.detach(),
            jaw_pose: self.jaw_pose.detach(),
            expression: self.expression.detach(),
            betas: self.betas.detach(),
            scale: self.scale.detach(),
        }
    }
}

/// Global pose, body pose, shape and scale produced by a parameter transfer.
#[derive(Debug)]
pub struct InitialFit {
    /// 1x3
    pub global_orient: Tensor,
    /// 1x3
    pub transl: Tensor,
    /// 1x21x3
    pub body_pose: Tensor,
    /// 1xB
    pub betas: Tensor,
    /// 1
    pub scale: Tensor,
}

impl InitialFit {
    /// Checks shapes against `model` and reshapes to the canonical layout.
    pub fn validated(self, model: &dyn BodyModel) -> Result<Self> {
        let reshape = |name: &str, xs: Tensor, shape: &[i64]| -> Result<Tensor> {
            let expected: i64 = shape.iter().product();
            if xs.numel() as i64 != expected {
                return Err(FitError::InvalidInitialFit(format!(
                    "{name} has {} values, expected {expected}",
                    xs.numel()
                )));
            }
            Ok(xs.to_kind(Kind::Float).to_device(model.device()).reshape(shape))
        };
        Ok(Self {
            global_orient: reshape("global_orient", self.global_orient, &[1, 3])?,
            transl: reshape("transl", self.transl, &[1, 3])?,
            body_pose: reshape("body_pose", self.body_pose, &[1, NUM_BODY_JOINTS, 3])?,
            betas: reshape("betas", self.betas, &[1, model.num_betas()])?,
            scale: reshape("scale", self.scale, &[1])?,
        })
    }
}
