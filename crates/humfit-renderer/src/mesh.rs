use tch::{Kind, TchError, Tensor};

/// A UV texture bound to a mesh.
#[derive(Debug)]
pub struct TextureMap {
    /// Texture image, 1xSxSx3, values in [0, 1].
    pub map: Tensor,
    /// UV coordinates, Tx2, origin at the bottom-left of the image.
    pub verts_uvs: Tensor,
    /// UV indices per face, Fx3 int64.
    pub faces_uvs: Tensor,
}

impl TextureMap {
    pub fn new(map: Tensor, verts_uvs: Tensor, faces_uvs: Tensor) -> Result<Self, TchError> {
        let map_size = map.size();
        if map_size.len() != 4 || map_size[0] != 1 || map_size[3] != 3 {
            return Err(TchError::Shape(format!("texture map must be 1xHxWx3, got {map_size:?}")));
        }
        if verts_uvs.dim() != 2 || verts_uvs.size()[1] != 2 {
            return Err(TchError::Shape(format!("verts_uvs must be Tx2, got {:?}", verts_uvs.size())));
        }
        if faces_uvs.dim() != 2 || faces_uvs.size()[1] != 3 {
            return Err(TchError::Shape(format!("faces_uvs must be Fx3, got {:?}", faces_uvs.size())));
        }
        Ok(Self { map, verts_uvs, faces_uvs: faces_uvs.to_kind(Kind::Int64) })
    }

    pub fn detach(&self) -> Self {
        Self {
            map: self.map.detach(),
            verts_uvs: self.verts_uvs.shallow_clone(),
            faces_uvs: self.faces_uvs.shallow_clone(),
        }
    }
}

/// A triangle mesh with a UV texture, batch of one.
#[derive(Debug)]
pub struct TexturedMesh {
    /// 1xVx3
    pub verts: Tensor,
    /// 1xFx3 int64
    pub faces: Tensor,
    pub texture: TextureMap,
}

impl TexturedMesh {
    pub fn new(verts: Tensor, faces: Tensor, texture: TextureMap) -> Result<Self, TchError> {
        let verts = if verts.dim() == 2 { verts.unsqueeze(0) } else { verts };
        let faces = if faces.dim() == 2 { faces.unsqueeze(0) } else { faces };

        let vs = verts.size();
        if vs.len() != 3 || vs[0] != 1 || vs[2] != 3 {
            return Err(TchError::Shape(format!("verts must be 1xVx3, got {vs:?}")));
        }
        let fs = faces.size();
        if fs.len() != 3 || fs[0] != 1 || fs[2] != 3 {
            return Err(TchError::Shape(format!("faces must be 1xFx3, got {fs:?}")));
        }
        if texture.faces_uvs.size()[0] != fs[1] {
            return Err(TchError::Shape(format!(
                "{} UV faces for {} mesh faces",
                texture.faces_uvs.size()[0],
                fs[1]
            )));
        }

        Ok(Self { verts, faces: faces.to_kind(Kind::Int64), texture })
    }

    pub fn num_verts(&self) -> i64 {
        self.verts.size()[1]
    }

    pub fn num_faces(&self) -> i64 {
        self.faces.size()[1]
    }

    /// Vertices without the batch dimension, Vx3.
    pub fn verts_packed(&self) -> Tensor {
        self.verts.squeeze_dim(0)
    }

    /// Faces without the batch dimension, Fx3.
    pub fn faces_packed(&self) -> Tensor {
        self.faces.squeeze_dim(0)
    }

    pub fn detach(&self) -> Self {
        Self {
            verts: self.verts.detach(),
            faces: self.faces.shallow_clone(),
            texture: self.texture.detach(),
        }
    }
}
