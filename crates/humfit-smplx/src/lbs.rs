use tch::{IndexOp, Kind, Tensor};

/// Performs Linear Blend Skinning with the given shape and pose parameters
///
/// Parameters
/// ----------
/// betas: Tensor of shape BxNB
///     The tensor of shape (and expression) coefficients
/// pose: Tensor of shape Bx(J * 3) or BxJx3x3
///     The pose parameters, axis-angle when `pose2rot` is set,
///     rotation matrices otherwise
/// v_template: Tensor of shape Vx3
///     The template mesh that will be deformed
/// shapedirs: Tensor of shape Vx3xNB
///     The tensor of PCA shape displacements
/// posedirs: Tensor of shape Px(V * 3)
///     The pose PCA coefficients, P = (J - 1) * 9
/// j_regressor: Tensor of shape JxV
///     The regressor array that is used to calculate the joints from
///     the position of the vertices
/// parents: slice of length J
///     The kinematic tree, `parents[0]` is the root and ignored
/// lbs_weights: Tensor of shape VxJ
///     The linear blend skinning weights that represent how much the
///     rotation matrix of each part affects each vertex
///
/// Returns
/// -------
/// (Tensor, Tensor)
///     verts: Tensor of shape BxVx3
///         The vertices of the mesh after applying the shape and pose
///         displacements.
///     joints: Tensor of shape BxJx3
///         The posed joints of the model
#[allow(clippy::too_many_arguments)]
pub fn lbs(
    betas: &Tensor,
    pose: &Tensor,
    v_template: &Tensor,
    shapedirs: &Tensor,
    posedirs: &Tensor,
    j_regressor: &Tensor,
    parents: &[i64],
    lbs_weights: &Tensor,
    pose2rot: bool,
) -> (Tensor, Tensor) {
    let batch_size = betas.size()[0].max(pose.size()[0]);
    let device = betas.device();
    let dtype = betas.kind();

    // Add shape contribution
    let v_shaped = v_template + blend_shapes(betas, shapedirs);

    // Get the joints
    let j = vertices2joints(j_regressor, &v_shaped);

    let rot_mats = if pose2rot {
        batch_rodrigues(&pose.reshape([-1, 3])).view([batch_size, -1, 3, 3])
    } else {
        pose.reshape([batch_size, -1, 3, 3])
    };

    // Add pose blend shapes
    let ident = Tensor::eye(3, (dtype, device));
    let pose_feature = (rot_mats.i((.., 1..)) - &ident).reshape([batch_size, -1]);
    let pose_offsets = pose_feature.matmul(posedirs).view([batch_size, -1, 3]);
    let v_posed = &pose_offsets + &v_shaped;

    // Get the global joint location
    let (j_transformed, a) = batch_rigid_transform(&rot_mats, &j, parents);

    // Do skinning
    let num_joints = j_regressor.size()[0];
    let w = lbs_weights.unsqueeze(0).expand([batch_size, -1, -1], false);
    let t = w
        .matmul(&a.view([batch_size, num_joints, 16]))
        .view([batch_size, -1, 4, 4]);

    let homogen_coord = Tensor::ones([batch_size, v_posed.size()[1], 1], (dtype, device));
    let v_posed_homo = Tensor::cat(&[&v_posed, &homogen_coord], 2);
    let v_homo = t.matmul(&v_posed_homo.unsqueeze(-1));

    let verts = v_homo.i((.., .., ..3, 0));

    (verts, j_transformed)
}

/// Calculates the 3D joint locations from the vertices
///
/// j_regressor is JxV, vertices is BxVx3, the result is BxJx3.
pub fn vertices2joints(j_regressor: &Tensor, vertices: &Tensor) -> Tensor {
    Tensor::einsum("bik,ji->bjk", &[vertices, j_regressor], None::<i64>)
}

/// Calculates the per vertex displacement due to the blend shapes
///
/// betas is Bx(num_betas), shape_disps is Vx3x(num_betas), the result is BxVx3.
pub fn blend_shapes(betas: &Tensor, shape_disps: &Tensor) -> Tensor {
    Tensor::einsum("bl,mkl->bmk", &[betas, shape_disps], None::<i64>)
}

/// Calculates the rotation matrices for a batch of rotation vectors
///
/// Parameters
/// ----------
/// rot_vecs: Tensor of shape Nx3
///     Array of N axis-angle vectors
///
/// Returns
/// -------
/// Tensor of shape Nx3x3
///     The rotation matrices for the given axis-angle parameters
pub fn batch_rodrigues(rot_vecs: &Tensor) -> Tensor {
    let batch_size = rot_vecs.size()[0];
    let device = rot_vecs.device();
    let dtype = rot_vecs.kind();

    // One angle per row; the offset keeps the direction finite at zero rotation
    let angle = (rot_vecs + 1e-8).norm_scalaropt_dim(2, [1i64], true);
    let rot_dir = rot_vecs / &angle;

    let cos = angle.cos().unsqueeze(1);
    let sin = angle.sin().unsqueeze(1);

    let rx = rot_dir.narrow(1, 0, 1);
    let ry = rot_dir.narrow(1, 1, 1);
    let rz = rot_dir.narrow(1, 2, 1);

    let zeros = Tensor::zeros([batch_size, 1], (dtype, device));
    let k = Tensor::cat(&[
        &zeros, &-&rz, &ry,
        &rz, &zeros, &-&rx,
        &-&ry, &rx, &zeros,
    ], 1).view([batch_size, 3, 3]);

    let ident = Tensor::eye(3, (dtype, device)).unsqueeze(0);
    &ident + &sin * &k + (1 - &cos) * k.bmm(&k)
}

/// Creates a batch of 4x4 transformation matrices from Bx3x3 rotations and
/// Bx3x1 translations.
fn transform_mat(r: &Tensor, t: &Tensor) -> Tensor {
    let batch_size = r.size()[0];
    let top = Tensor::cat(&[r, t], 2);
    let bottom = Tensor::from_slice(&[0.0f64, 0.0, 0.0, 1.0])
        .to_kind(r.kind())
        .to_device(r.device())
        .view([1, 1, 4])
        .expand([batch_size, 1, 4], false);
    Tensor::cat(&[top, bottom], 1)
}

/// Applies a batch of rigid transformations to the joints
///
/// Parameters
/// ----------
/// rot_mats: Tensor of shape BxJx3x3
///     Tensor of rotation matrices
/// joints: Tensor of shape BxJx3
///     Locations of joints
/// parents: slice of length J
///     The kinematic tree, every parent precedes its children
///
/// Returns
/// -------
/// (Tensor, Tensor)
///     posed_joints: Tensor of shape BxJx3
///         The locations of the joints after applying the pose rotations
///     rel_transforms: Tensor of shape BxJx4x4
///         The relative (with respect to the root joint) rigid transformations
///         for all the joints
pub fn batch_rigid_transform(rot_mats: &Tensor, joints: &Tensor, parents: &[i64]) -> (Tensor, Tensor) {
    let batch_size = rot_mats.size()[0];
    let num_joints = joints.size()[1];
    let device = joints.device();

    let joints = joints.unsqueeze(-1);

    let parent_idx = Tensor::from_slice(&parents[1..]).to_device(device);
    let rel_joints = Tensor::cat(&[
        joints.narrow(1, 0, 1),
        joints.narrow(1, 1, num_joints - 1) - joints.index_select(1, &parent_idx),
    ], 1);

    let transforms_mat = transform_mat(
        &rot_mats.reshape([-1, 3, 3]),
        &rel_joints.reshape([-1, 3, 1]),
    ).reshape([batch_size, num_joints, 4, 4]);

    let mut transform_chain = vec![transforms_mat.i((.., 0))];
    for (i, &parent) in parents.iter().enumerate().skip(1) {
        let local = transforms_mat.i((.., i as i64));
        transform_chain.push(transform_chain[parent as usize].matmul(&local));
    }

    let transforms = Tensor::stack(&transform_chain, 1);
    let posed_joints = transforms.i((.., .., ..3, 3));

    let joints_homogen = Tensor::cat(&[&joints, &Tensor::zeros([batch_size, num_joints, 1, 1], (joints.kind(), device))], 2);
    let offsets = transforms.matmul(&joints_homogen);
    let rel_transforms = &transforms
        - Tensor::cat(&[&Tensor::zeros([batch_size, num_joints, 4, 3], (joints.kind(), device)), &offsets], 3);

    (posed_joints, rel_transforms)
}

/// Checks that every joint's parent precedes it.
pub fn validate_parents(parents: &[i64]) -> bool {
    parents
        .iter()
        .enumerate()
        .skip(1)
        .all(|(i, &parent)| parent >= 0 && (parent as usize) < i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn chain_parents(num_joints: usize) -> Vec<i64> {
        let mut parents = vec![-1i64];
        parents.extend((0..num_joints as i64 - 1).map(|i| i / 2));
        parents
    }

    #[test]
    fn test_vertices2joints() {
        let j_regressor = Tensor::randn([10, 100], (Kind::Float, Device::Cpu));
        let vertices = Tensor::randn([2, 100, 3], (Kind::Float, Device::Cpu));

        let joints = vertices2joints(&j_regressor, &vertices);

        assert_eq!(joints.size(), &[2, 10, 3]);
    }

    #[test]
    fn test_blend_shapes_linear() {
        let betas = Tensor::from_slice(&[2.0f32, 0.0]).view([1, 2]);
        let shape_disps = Tensor::randn([5, 3, 2], (Kind::Float, Device::Cpu));

        let offsets = blend_shapes(&betas, &shape_disps);

        assert_eq!(offsets.size(), &[1, 5, 3]);
        let expected = shape_disps.select(2, 0).unsqueeze(0) * 2.0;
        assert!(offsets.allclose(&expected, 1e-5, 1e-6, false));
    }

    #[test]
    fn test_batch_rodrigues_known_rotations() {
        let half_pi = std::f32::consts::FRAC_PI_2;
        let rot_vecs = Tensor::from_slice(&[0.0f32, 0.0, half_pi, 0.0, 0.0, 0.0]).view([2, 3]);

        let rot_mats = batch_rodrigues(&rot_vecs);

        let expected = Tensor::from_slice(&[
            0.0f32, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0,
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0,
        ]).view([2, 3, 3]);
        assert!(rot_mats.allclose(&expected, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_batch_rodrigues_is_orthonormal_per_row() {
        let rot_vecs = Tensor::randn([8, 3], (Kind::Float, Device::Cpu)) * 2.0;
        let rot_mats = batch_rodrigues(&rot_vecs);

        let product = rot_mats.bmm(&rot_mats.transpose(1, 2));
        let ident = Tensor::eye(3, (Kind::Float, Device::Cpu)).unsqueeze(0).expand([8, 3, 3], false);
        assert!(product.allclose(&ident, 1e-4, 1e-4, false));
    }

    #[test]
    fn test_transform_mat() {
        let r = Tensor::randn([2, 3, 3], (Kind::Float, Device::Cpu));
        let t = Tensor::randn([2, 3, 1], (Kind::Float, Device::Cpu));

        let m = transform_mat(&r, &t);

        assert_eq!(m.size(), &[2, 4, 4]);
        assert!(m.i((.., ..3, 3)).allclose(&t.squeeze_dim(-1), 1e-6, 1e-6, false));
        assert_eq!(m.i((0, 3, 3)).double_value(&[]), 1.0);
    }

    #[test]
    fn test_batch_rigid_transform_identity_keeps_joints() {
        let batch_size = 2;
        let num_joints = 7;
        let ident = Tensor::eye(3, (Kind::Float, Device::Cpu));
        let rot_mats = ident.view([1, 1, 3, 3]).expand([batch_size, num_joints, 3, 3], false).contiguous();
        let joints = Tensor::randn([batch_size, num_joints, 3], (Kind::Float, Device::Cpu));

        let (posed_joints, rel_transforms) = batch_rigid_transform(&rot_mats, &joints, &chain_parents(7));

        assert_eq!(posed_joints.size(), &[batch_size, num_joints, 3]);
        assert!(posed_joints.allclose(&joints, 1e-5, 1e-5, false));

        // Identity rotations give identity relative transforms
        let expected = Tensor::eye(4, (Kind::Float, Device::Cpu)).view([1, 1, 4, 4]).expand([batch_size, num_joints, 4, 4], false);
        assert!(rel_transforms.allclose(&expected, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_lbs_rest_pose_reproduces_template() {
        let num_vertices = 20;
        let num_joints = 5;
        let num_betas = 4;
        let parents = chain_parents(num_joints as usize);

        let betas = Tensor::zeros([1, num_betas], (Kind::Float, Device::Cpu));
        let pose = Tensor::zeros([1, num_joints * 3], (Kind::Float, Device::Cpu));
        let v_template = Tensor::randn([num_vertices, 3], (Kind::Float, Device::Cpu));
        let shapedirs = Tensor::randn([num_vertices, 3, num_betas], (Kind::Float, Device::Cpu));
        let posedirs = Tensor::randn([(num_joints - 1) * 9, num_vertices * 3], (Kind::Float, Device::Cpu));
        let j_regressor = Tensor::rand([num_joints, num_vertices], (Kind::Float, Device::Cpu));
        let lbs_weights = Tensor::rand([num_vertices, num_joints], (Kind::Float, Device::Cpu)).softmax(-1, Kind::Float);

        let (verts, joints) = lbs(
            &betas, &pose, &v_template, &shapedirs, &posedirs, &j_regressor, &parents, &lbs_weights, true,
        );

        assert_eq!(verts.size(), &[1, num_vertices, 3]);
        assert_eq!(joints.size(), &[1, num_joints, 3]);
        assert!(verts.squeeze_dim(0).allclose(&v_template, 1e-4, 1e-4, false));
        let rest_joints = vertices2joints(&j_regressor, &v_template.unsqueeze(0));
        assert!(joints.allclose(&rest_joints, 1e-4, 1e-4, false));
    }

    #[test]
    fn test_lbs_rotation_matrix_input_matches_axis_angle() {
        let num_vertices = 12;
        let num_joints = 4;
        let parents = chain_parents(num_joints as usize);

        let betas = Tensor::randn([1, 3], (Kind::Float, Device::Cpu));
        let pose = Tensor::randn([1, num_joints * 3], (Kind::Float, Device::Cpu)) * 0.3;
        let v_template = Tensor::randn([num_vertices, 3], (Kind::Float, Device::Cpu));
        let shapedirs = Tensor::randn([num_vertices, 3, 3], (Kind::Float, Device::Cpu)) * 0.1;
        let posedirs = Tensor::randn([(num_joints - 1) * 9, num_vertices * 3], (Kind::Float, Device::Cpu)) * 0.01;
        let j_regressor = Tensor::rand([num_joints, num_vertices], (Kind::Float, Device::Cpu));
        let lbs_weights = Tensor::rand([num_vertices, num_joints], (Kind::Float, Device::Cpu)).softmax(-1, Kind::Float);

        let rot_mats = batch_rodrigues(&pose.view([-1, 3])).view([1, num_joints, 3, 3]);

        let (verts_aa, joints_aa) = lbs(
            &betas, &pose, &v_template, &shapedirs, &posedirs, &j_regressor, &parents, &lbs_weights, true,
        );
        let (verts_rm, joints_rm) = lbs(
            &betas, &rot_mats, &v_template, &shapedirs, &posedirs, &j_regressor, &parents, &lbs_weights, false,
        );

        assert!(verts_aa.allclose(&verts_rm, 1e-5, 1e-5, false));
        assert!(joints_aa.allclose(&joints_rm, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_validate_parents() {
        assert!(validate_parents(&[-1, 0, 0, 1, 2]));
        assert!(!validate_parents(&[-1, 0, 3, 1]));
        assert!(!validate_parents(&[-1, -1]));
    }
}
