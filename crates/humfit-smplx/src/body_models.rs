use std::collections::HashMap;

use log::debug;
use tch::{Device, IndexOp, Kind, TchError, Tensor};
use humfit_utils::module::{ModuleMT, TensorCollection};
use crate::constants::{NUM_BODY_JOINTS, NUM_HAND_JOINTS, NUM_JOINTS, SHAPE_SPACE_DIM, SMPLX_VERTEX_IDS};
use crate::lbs::{batch_rodrigues, lbs};
use crate::model::data::DataModel;
use crate::vertex_joints::VertexJointSelector;

/// Pose and shape input of the body model, with every rotation given as a
/// rotation matrix.
#[derive(Debug)]
pub struct BodyPose {
    /// Bx1x3x3
    pub global_orient: Tensor,
    /// Bx21x3x3
    pub body_pose: Tensor,
    /// Bx1x3x3
    pub jaw_pose: Tensor,
    /// Bx1x3x3
    pub leye_pose: Tensor,
    /// Bx1x3x3
    pub reye_pose: Tensor,
    /// Bx15x3x3
    pub left_hand_pose: Tensor,
    /// Bx15x3x3
    pub right_hand_pose: Tensor,
    /// BxNB
    pub betas: Tensor,
    /// BxNE
    pub expression: Tensor,
}

impl BodyPose {
    /// Converts axis-angle rotations to matrices. Any leading layout works as
    /// long as the last dimension holds the 3-vectors; eyes stay at rest.
    pub fn from_axis_angle(
        global_orient: &Tensor,
        body_pose: &Tensor,
        jaw_pose: &Tensor,
        left_hand_pose: &Tensor,
        right_hand_pose: &Tensor,
        betas: &Tensor,
        expression: &Tensor,
    ) -> Self {
        let batch_size = betas.size()[0];
        let to_mats = |aa: &Tensor, joints: i64| {
            batch_rodrigues(&aa.reshape([-1, 3])).view([batch_size, joints, 3, 3])
        };
        let rest = Tensor::eye(3, (betas.kind(), betas.device()))
            .view([1, 1, 3, 3])
            .expand([batch_size, 1, 3, 3], false)
            .contiguous();

        Self {
            global_orient: to_mats(global_orient, 1),
            body_pose: to_mats(body_pose, NUM_BODY_JOINTS),
            jaw_pose: to_mats(jaw_pose, 1),
            leye_pose: rest.shallow_clone(),
            reye_pose: rest,
            left_hand_pose: to_mats(left_hand_pose, NUM_HAND_JOINTS),
            right_hand_pose: to_mats(right_hand_pose, NUM_HAND_JOINTS),
            betas: betas.shallow_clone(),
            expression: expression.shallow_clone(),
        }
    }

    /// All joint rotations in model order, Bx55x3x3.
    pub fn full_pose(&self) -> Tensor {
        Tensor::cat(&[
            &self.global_orient,
            &self.body_pose,
            &self.jaw_pose,
            &self.leye_pose,
            &self.reye_pose,
            &self.left_hand_pose,
            &self.right_hand_pose,
        ], 1)
    }
}

impl TensorCollection for BodyPose {
    fn to_device(&self, device: Device) -> Self {
        Self::from_vec(self.as_tensor_vec().iter().map(|t| t.to_device(device)).collect())
    }

    fn as_tensor_vec(&self) -> Vec<Tensor> {
        vec![
            self.global_orient.shallow_clone(),
            self.body_pose.shallow_clone(),
            self.jaw_pose.shallow_clone(),
            self.leye_pose.shallow_clone(),
            self.reye_pose.shallow_clone(),
            self.left_hand_pose.shallow_clone(),
            self.right_hand_pose.shallow_clone(),
            self.betas.shallow_clone(),
            self.expression.shallow_clone(),
        ]
    }

    fn from_vec(tensors: Vec<Tensor>) -> Self {
        assert_eq!(tensors.len(), 9, "Expected nine tensors");
        let mut it = tensors.into_iter();
        let mut next = || it.next().unwrap_or_else(Tensor::new);
        Self {
            global_orient: next(),
            body_pose: next(),
            jaw_pose: next(),
            leye_pose: next(),
            reye_pose: next(),
            left_hand_pose: next(),
            right_hand_pose: next(),
            betas: next(),
            expression: next(),
        }
    }
}

/// Output of the body model forward pass.
#[derive(Debug)]
pub struct BodyOutput {
    /// BxVx3
    pub vertices: Tensor,
    /// Bx(J + extra)x3, regressed joints followed by vertex-selected keypoints.
    pub joints: Tensor,
    /// BxJx3x3
    pub full_pose: Tensor,
}

impl TensorCollection for BodyOutput {
    fn to_device(&self, device: Device) -> Self {
        Self {
            vertices: self.vertices.to_device(device),
            joints: self.joints.to_device(device),
            full_pose: self.full_pose.to_device(device),
        }
    }

    fn as_tensor_vec(&self) -> Vec<Tensor> {
        vec![self.vertices.shallow_clone(), self.joints.shallow_clone(), self.full_pose.shallow_clone()]
    }

    fn from_vec(tensors: Vec<Tensor>) -> Self {
        assert_eq!(tensors.len(), 3, "Expected three tensors");
        Self {
            vertices: tensors[0].shallow_clone(),
            joints: tensors[1].shallow_clone(),
            full_pose: tensors[2].shallow_clone(),
        }
    }
}

/// A skinned parametric body: pose and shape in, posed vertices and joints out,
/// over a fixed triangle topology.
pub trait BodyModel: ModuleMT<BodyPose, BodyOutput> {
    /// Triangle indices, Fx3 int64.
    fn faces(&self) -> &Tensor;
    fn num_verts(&self) -> i64;
    fn num_betas(&self) -> i64;
    fn num_expression_coeffs(&self) -> i64;
    fn device(&self) -> Device;
}

/// Construction options of [`SMPLX`].
#[derive(Debug, Clone)]
pub struct SmplxOptions {
    pub num_betas: i64,
    pub num_expression_coeffs: i64,
    pub vertex_ids: HashMap<String, i64>,
    pub use_hands: bool,
    pub use_feet_keypoints: bool,
}

impl Default for SmplxOptions {
    fn default() -> Self {
        Self {
            num_betas: 10,
            num_expression_coeffs: 10,
            vertex_ids: SMPLX_VERTEX_IDS.clone(),
            use_hands: true,
            use_feet_keypoints: true,
        }
    }
}

/// The SMPL-X body model, taking rotation matrices as input.
#[derive(Debug)]
pub struct SMPLX {
    pub model: DataModel,

    /// Shape followed by expression blend shapes, Vx3x(NB + NE).
    shapedirs: Tensor,

    /// Pose blend shapes flattened for a single matmul, Px(V * 3).
    posedirs: Tensor,

    pub num_betas: i64,
    pub num_expression_coeffs: i64,

    vertex_joint_selector: VertexJointSelector,

    pub device: Device,
}

impl ModuleMT<BodyPose, BodyOutput> for SMPLX {
    fn forward_mt(&self, xs: BodyPose, _train: bool) -> BodyOutput {
        debug!("betas: {:?}, expression: {:?}", xs.betas.size(), xs.expression.size());

        let full_pose = xs.full_pose();
        let shape_components = Tensor::cat(&[&xs.betas, &xs.expression], -1);

        let (vertices, joints) = lbs(
            &shape_components,
            &full_pose,
            &self.model.v_template,
            &self.shapedirs,
            &self.posedirs,
            &self.model.j_regressor,
            &self.model.parents,
            &self.model.weights,
            false,
        );

        let joints = self.vertex_joint_selector.forward_mt((vertices.shallow_clone(), joints), false);

        debug!("vertices: {:?}, joints: {:?}", vertices.size(), joints.size());

        BodyOutput { vertices, joints, full_pose }
    }
}

impl SMPLX {
    pub fn new(model: DataModel, options: &SmplxOptions, device: Device) -> Result<Self, TchError> {
        if model.num_joints() != NUM_JOINTS {
            return Err(TchError::Shape(format!(
                "SMPL-X expects {} joints, model has {}",
                NUM_JOINTS,
                model.num_joints()
            )));
        }

        let available = model.shapedirs.size()[2];
        let num_betas = options.num_betas.min(SHAPE_SPACE_DIM).min(available);

        let expr_dirs = match &model.expressiondirs {
            Some(dirs) => dirs.i((.., .., ..options.num_expression_coeffs.min(dirs.size()[2]))),
            None if available > SHAPE_SPACE_DIM => {
                let end = (SHAPE_SPACE_DIM + options.num_expression_coeffs).min(available);
                model.shapedirs.i((.., .., SHAPE_SPACE_DIM..end))
            }
            None => model.shapedirs.i((.., .., ..0)),
        };
        let num_expression_coeffs = expr_dirs.size()[2];
        if num_betas < options.num_betas || num_expression_coeffs < options.num_expression_coeffs {
            return Err(TchError::Shape(format!(
                "model provides {} shape and {} expression components, {} and {} requested",
                num_betas, num_expression_coeffs, options.num_betas, options.num_expression_coeffs
            )));
        }

        let shapedirs = Tensor::cat(&[&model.shapedirs.i((.., .., ..num_betas)), &expr_dirs], 2)
            .to_device(device);

        let num_pose_basis = model.posedirs.size()[2];
        let posedirs = model.posedirs.reshape([-1, num_pose_basis]).transpose(0, 1).contiguous().to_device(device);

        let vertex_joint_selector = VertexJointSelector::new(
            device,
            &options.vertex_ids,
            options.use_hands,
            options.use_feet_keypoints,
        );
        if let Some(max_id) = vertex_joint_selector.max_vertex_index() {
            if max_id >= model.num_verts() {
                return Err(TchError::Shape(format!(
                    "keypoint vertex {} out of range for {} vertices",
                    max_id,
                    model.num_verts()
                )));
            }
        }

        let model = DataModel {
            v_template: model.v_template.to_device(device),
            f: model.f.to_device(device),
            j_regressor: model.j_regressor.to_device(device),
            weights: model.weights.to_device(device),
            ..model
        };

        Ok(Self {
            model,
            shapedirs,
            posedirs,
            num_betas,
            num_expression_coeffs,
            vertex_joint_selector,
            device,
        })
    }

    pub fn from_file<P: AsRef<std::path::Path>>(path: P, options: &SmplxOptions, device: Device) -> Result<Self, TchError> {
        let model = DataModel::load_from_file(path, device)?;
        model.log_tensor_sizes();
        Self::new(model, options, device)
    }

    /// Total joint count including the vertex-selected keypoints.
    pub fn num_output_joints(&self) -> i64 {
        NUM_JOINTS + self.vertex_joint_selector.num_extra_joints()
    }

    pub fn extra_repr(&self) -> String {
        let msg = [
            format!("Number of joints: {}", self.model.num_joints()),
            format!("Betas: {}", self.num_betas),
            format!("Expression coefficients: {}", self.num_expression_coeffs),
        ];
        msg.join("\n")
    }

    /// Zero shape and expression coefficients with every joint at rest.
    pub fn rest_pose(&self, batch_size: i64) -> BodyPose {
        let options = (Kind::Float, self.device);
        let aa = |joints: i64| Tensor::zeros([batch_size, joints, 3], options);
        BodyPose::from_axis_angle(
            &aa(1),
            &aa(NUM_BODY_JOINTS),
            &aa(1),
            &aa(NUM_HAND_JOINTS),
            &aa(NUM_HAND_JOINTS),
            &Tensor::zeros([batch_size, self.num_betas], options),
            &Tensor::zeros([batch_size, self.num_expression_coeffs], options),
        )
    }
}

impl BodyModel for SMPLX {
    fn faces(&self) -> &Tensor {
        &self.model.f
    }

    fn num_verts(&self) -> i64 {
        self.model.num_verts()
    }

    fn num_betas(&self) -> i64 {
        self.num_betas
    }

    fn num_expression_coeffs(&self) -> i64 {
        self.num_expression_coeffs
    }

    fn device(&self) -> Device {
        self.device
    }
}
