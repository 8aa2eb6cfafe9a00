use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};
use tch::{Device, IndexOp, Kind, TchError, Tensor};

/// Raw body-model arrays as stored in the model file.
///
/// Loaded from `.npz` (as distributed for SMPL-X, with object arrays stripped)
/// or `.safetensors`. Keys follow the distributed archives: `v_template`, `f`,
/// `shapedirs`, `posedirs`, `J_regressor`, `kintree_table`, `weights`, and
/// optionally `expressiondirs`, `vt`, `ft`.
#[derive(Debug)]
pub struct DataModel {
    /// Template vertices, Vx3.
    pub v_template: Tensor,
    /// Triangle indices, Fx3 int64.
    pub f: Tensor,
    /// Shape (and possibly expression) blend shapes, Vx3xS.
    pub shapedirs: Tensor,
    /// Separate expression blend shapes, Vx3xE, when the archive carries them.
    pub expressiondirs: Option<Tensor>,
    /// Pose blend shapes as stored, Vx3xP.
    pub posedirs: Tensor,
    /// Joint regressor, JxV.
    pub j_regressor: Tensor,
    /// Parent of every joint, root first.
    pub parents: Vec<i64>,
    /// Skinning weights, VxJ.
    pub weights: Tensor,
    /// Template UV coordinates, Tx2.
    pub vt: Option<Tensor>,
    /// Template UV faces, Fx3 int64.
    pub ft: Option<Tensor>,
}

impl DataModel {
    pub fn load_from_file<P: AsRef<Path>>(path: P, device: Device) -> Result<Self, TchError> {
        let path = path.as_ref();
        let named = match path.extension().and_then(|ext| ext.to_str()) {
            Some("npz") => Tensor::read_npz(path)?,
            Some("safetensors") => Tensor::read_safetensors(path)?,
            _ => {
                return Err(TchError::FileFormat(format!(
                    "unsupported body model file {}, expected .npz or .safetensors",
                    path.display()
                )))
            }
        };
        info!("Loaded {} arrays from {}", named.len(), path.display());
        Self::from_tensors(named.into_iter().collect(), device)
    }

    /// Builds the model from named arrays, converting to float / int64 on `device`.
    pub fn from_tensors(mut tensors: HashMap<String, Tensor>, device: Device) -> Result<Self, TchError> {
        let mut take = |key: &str| -> Result<Tensor, TchError> {
            debug!("Processing {}...", key);
            tensors
                .remove(key)
                .ok_or_else(|| TchError::FileFormat(format!("body model is missing `{key}`")))
        };

        let float = |t: Tensor| t.to_kind(Kind::Float).to_device(device);
        let long = |t: Tensor| t.to_kind(Kind::Int64).to_device(device);

        let v_template = float(take("v_template")?);
        let f = long(take("f")?);
        let shapedirs = float(take("shapedirs")?);
        let posedirs = float(take("posedirs")?);
        let j_regressor = float(take("J_regressor")?);
        let kintree_table = take("kintree_table")?.to_kind(Kind::Int64);
        let weights = float(take("weights")?);

        let expressiondirs = tensors.remove("expressiondirs").map(float);
        let vt = tensors.remove("vt").map(float);
        let ft = tensors.remove("ft").map(long);

        // Row 0 of the kinematic tree holds the parents; the root's entry is a sentinel
        let mut parents = Vec::<i64>::try_from(&kintree_table.i(0).contiguous())?;
        if let Some(root) = parents.first_mut() {
            *root = -1;
        }

        let model = Self { v_template, f, shapedirs, expressiondirs, posedirs, j_regressor, parents, weights, vt, ft };
        model.validate()?;
        Ok(model)
    }

    pub fn num_verts(&self) -> i64 {
        self.v_template.size()[0]
    }

    pub fn num_joints(&self) -> i64 {
        self.j_regressor.size()[0]
    }

    fn validate(&self) -> Result<(), TchError> {
        let num_verts = self.num_verts();
        let num_joints = self.num_joints();
        let shape_err = |what: &str, got: Vec<i64>| Err(TchError::Shape(format!("{what} has shape {got:?}")));

        if self.v_template.size() != [num_verts, 3] {
            return shape_err("v_template", self.v_template.size());
        }
        if self.f.dim() != 2 || self.f.size()[1] != 3 {
            return shape_err("f", self.f.size());
        }
        let sd = self.shapedirs.size();
        if sd.len() != 3 || sd[0] != num_verts || sd[1] != 3 {
            return shape_err("shapedirs", sd);
        }
        let pd = self.posedirs.size();
        if pd.len() != 3 || pd[0] != num_verts || pd[1] != 3 || pd[2] != (num_joints - 1) * 9 {
            return shape_err("posedirs", pd);
        }
        if self.j_regressor.size() != [num_joints, num_verts] {
            return shape_err("J_regressor", self.j_regressor.size());
        }
        if self.weights.size() != [num_verts, num_joints] {
            return shape_err("weights", self.weights.size());
        }
        if self.parents.len() as i64 != num_joints || !crate::lbs::validate_parents(&self.parents) {
            return Err(TchError::Shape(format!("invalid kinematic tree {:?}", self.parents)));
        }
        Ok(())
    }

    pub fn log_tensor_sizes(&self) {
        info!("Body model contents:");
        info!("v_template: {:?}", self.v_template.size());
        info!("f: {:?}", self.f.size());
        info!("shapedirs: {:?}", self.shapedirs.size());
        if let Some(expressiondirs) = &self.expressiondirs {
            info!("expressiondirs: {:?}", expressiondirs.size());
        }
        info!("posedirs: {:?}", self.posedirs.size());
        info!("J_regressor: {:?}", self.j_regressor.size());
        info!("weights: {:?}", self.weights.size());
        info!("joints: {}", self.parents.len());
    }
}
