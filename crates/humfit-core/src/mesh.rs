use log::info;
use tch::Tensor;

use humfit_renderer::mesh::{TextureMap, TexturedMesh};
use humfit_smplx::body_models::BodyModel;
use humfit_utils::mesh_ops::{vertex_normals, Subdivision};
use humfit_utils::module::ModuleMT;

use crate::error::{FitError, Result};
use crate::obj::UvLayout;
use crate::params::BodyParams;

/// Turns body parameters, a displacement field and a texture into a textured
/// mesh. The topology (and whether it is subdivided) is fixed at creation.
pub struct MeshConstructor<'a> {
    model: &'a dyn BodyModel,
    subdivision: Option<Subdivision>,
    faces: Tensor,
    uv_layout: UvLayout,
}

impl<'a> MeshConstructor<'a> {
    /// # Arguments
    /// * `model` - Body model evaluated on every construction.
    /// * `uv_layout` - One UV face per model face.
    /// * `subdivide` - Split every face into four once.
    pub fn new(model: &'a dyn BodyModel, uv_layout: UvLayout, subdivide: bool) -> Result<Self> {
        let mesh_faces = model.faces().size()[0];
        if uv_layout.num_faces() != mesh_faces {
            return Err(FitError::UvLayoutMismatch { uv_faces: uv_layout.num_faces(), mesh_faces });
        }
        let uv_layout = uv_layout.to_device(model.device());

        if !subdivide {
            return Ok(Self { model, subdivision: None, faces: model.faces().shallow_clone(), uv_layout });
        }

        let subdivision = Subdivision::new(model.faces(), model.num_verts())?;
        let uv_subdivision = Subdivision::new(&uv_layout.faces_uvs, uv_layout.num_uvs())?;
        let uv_layout = UvLayout {
            verts_uvs: uv_subdivision.subdivide(&uv_layout.verts_uvs),
            faces_uvs: uv_subdivision.faces().shallow_clone(),
        };
        info!(
            "subdividing {} vertices into {}, {} faces into {}",
            model.num_verts(),
            subdivision.num_verts(),
            mesh_faces,
            subdivision.faces().size()[0]
        );
        Ok(Self { model, faces: subdivision.faces().shallow_clone(), subdivision: Some(subdivision), uv_layout })
    }

    /// Vertex count of constructed meshes, which displacements must match.
    pub fn num_verts(&self) -> i64 {
        match &self.subdivision {
            Some(subdivision) => subdivision.num_verts(),
            None => self.model.num_verts(),
        }
    }

    /// Fx3 faces of constructed meshes.
    pub fn faces(&self) -> &Tensor {
        &self.faces
    }

    pub fn uv_layout(&self) -> &UvLayout {
        &self.uv_layout
    }

    pub fn is_subdivided(&self) -> bool {
        self.subdivision.is_some()
    }

    /// Builds the posed, scaled and translated mesh.
    ///
    /// Displacements push every vertex along its area-weighted normal,
    /// computed on the scaled mesh before translation.
    ///
    /// # Arguments
    /// * `params` - Axis-angle pose, shape, scale and translation.
    /// * `texture_map` - 1xSxSx3 texture.
    /// * `verts_disps` - Optional Nx1 displacement, N = [`Self::num_verts`].
    pub fn construct(&self, params: &BodyParams, texture_map: &Tensor, verts_disps: Option<&Tensor>) -> Result<TexturedMesh> {
        let output = self.model.forward_mt(params.body_pose_matrices(), false);
        let verts = match &self.subdivision {
            Some(subdivision) => subdivision.subdivide(&output.vertices),
            None => output.vertices,
        };

        let scaled = verts * &params.scale;
        let verts = match verts_disps {
            None => scaled + &params.transl,
            Some(disps) => {
                let actual = disps.size().first().copied().unwrap_or(0);
                if actual != self.num_verts() || disps.numel() as i64 != actual {
                    return Err(FitError::DisplacementMismatch { expected: self.num_verts(), actual });
                }
                let normals = vertex_normals(&scaled.squeeze_dim(0), &self.faces);
                &scaled + (normals * disps.view([-1, 1])).unsqueeze(0) + &params.transl
            }
        };

        let texture = TextureMap::new(
            texture_map.shallow_clone(),
            self.uv_layout.verts_uvs.shallow_clone(),
            self.uv_layout.faces_uvs.shallow_clone(),
        )?;
        Ok(TexturedMesh::new(verts, self.faces.shallow_clone(), texture)?)
    }
}
