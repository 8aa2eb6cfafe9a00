use std::collections::HashMap;

use tch::{Device, Tensor};
use humfit_utils::module::ModuleMT;

/// Appends keypoints read directly off mesh vertices (nose, eyes, ears,
/// feet, finger tips) to the regressed joints.
#[derive(Debug)]
pub struct VertexJointSelector {
    /// Indices of extra joints to be selected from vertices.
    extra_joints_idxs: Tensor,
}

impl ModuleMT<(Tensor, Tensor), Tensor> for VertexJointSelector {
    /// Takes `(vertices BxVx3, joints BxJx3)` and returns `Bx(J + extra)x3`.
    fn forward_mt(&self, xs: (Tensor, Tensor), _train: bool) -> Tensor {
        let (vertices, joints) = xs;
        let extra_joints = vertices.index_select(1, &self.extra_joints_idxs);
        Tensor::cat(&[joints, extra_joints], 1)
    }
}

impl VertexJointSelector {
    /// Creates a new VertexJointSelector instance.
    ///
    /// The extra joints are ordered face (nose, reye, leye, rear, lear), then
    /// feet, then finger tips of the left and right hand. Names missing from
    /// `vertex_ids` are skipped.
    pub fn new(
        device: Device,
        vertex_ids: &HashMap<String, i64>,
        use_hands: bool,
        use_feet_keypoints: bool,
    ) -> Self {
        let mut extra_joints_idxs = Vec::new();

        let mut push = |key: &str| {
            if let Some(&id) = vertex_ids.get(key) {
                extra_joints_idxs.push(id);
            }
        };

        for key in ["nose", "reye", "leye", "rear", "lear"] {
            push(key);
        }

        if use_feet_keypoints {
            for key in ["LBigToe", "LSmallToe", "LHeel", "RBigToe", "RSmallToe", "RHeel"] {
                push(key);
            }
        }

        if use_hands {
            for hand_id in ["l", "r"] {
                for tip_name in ["thumb", "index", "middle", "ring", "pinky"] {
                    push(&format!("{}{}", hand_id, tip_name));
                }
            }
        }

        Self {
            extra_joints_idxs: Tensor::from_slice(&extra_joints_idxs).to_device(device),
        }
    }

    pub fn num_extra_joints(&self) -> i64 {
        self.extra_joints_idxs.size()[0]
    }

    /// Largest selected vertex index, if any joint is selected.
    pub fn max_vertex_index(&self) -> Option<i64> {
        if self.num_extra_joints() == 0 {
            None
        } else {
            Some(self.extra_joints_idxs.max().int64_value(&[]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn setup_vertex_ids() -> HashMap<String, i64> {
        let mut vertex_ids = HashMap::new();
        for (i, key) in ["nose", "reye", "leye", "rear", "lear"].iter().enumerate() {
            vertex_ids.insert(key.to_string(), i as i64);
        }
        for (i, key) in ["LBigToe", "LSmallToe", "LHeel", "RBigToe", "RSmallToe", "RHeel"].iter().enumerate() {
            vertex_ids.insert(key.to_string(), 5 + i as i64);
        }
        for hand in ["l", "r"] {
            for finger in ["thumb", "index", "middle", "ring", "pinky"] {
                vertex_ids.insert(format!("{}{}", hand, finger), vertex_ids.len() as i64);
            }
        }
        vertex_ids
    }

    #[test]
    fn test_vertex_joint_selector_all_features() {
        let device = Device::Cpu;
        let selector = VertexJointSelector::new(device, &setup_vertex_ids(), true, true);

        let vertices = Tensor::rand([1, 100, 3], (Kind::Float, device));
        let joints = Tensor::rand([1, 10, 3], (Kind::Float, device));

        let result = selector.forward_mt((vertices, joints), false);

        // 10 (original) + 5 (face) + 6 (feet) + 10 (hands) = 31
        assert_eq!(result.size(), &[1, 31, 3]);
        assert_eq!(selector.num_extra_joints(), 21);
        assert_eq!(selector.max_vertex_index(), Some(20));
    }

    #[test]
    fn test_vertex_joint_selector_face_order() {
        let device = Device::Cpu;
        let selector = VertexJointSelector::new(device, &setup_vertex_ids(), false, false);

        let vertices = Tensor::arange(30, (Kind::Float, device)).view([1, 10, 3]);
        let joints = Tensor::zeros([1, 2, 3], (Kind::Float, device));

        let result = selector.forward_mt((vertices.shallow_clone(), joints), false);

        // 2 (original) + 5 (face)
        assert_eq!(result.size(), &[1, 7, 3]);
        assert!(result.narrow(1, 2, 5).allclose(&vertices.narrow(1, 0, 5), 1e-6, 1e-6, false));
    }

    #[test]
    fn test_vertex_joint_selector_missing_names_skipped() {
        let mut vertex_ids = HashMap::new();
        vertex_ids.insert("nose".to_string(), 3);
        let selector = VertexJointSelector::new(Device::Cpu, &vertex_ids, true, true);
        assert_eq!(selector.num_extra_joints(), 1);
    }
}
