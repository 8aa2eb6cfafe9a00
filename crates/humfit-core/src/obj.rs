use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use image::{ImageBuffer, Rgb};
use log::debug;
use tch::{Device, Tensor};

use humfit_utils::tensor::{to_vec_f32, to_vec_i64};

use crate::error::{FitError, Result};

/// Texture coordinates of a mesh and their per-face indices.
#[derive(Debug)]
pub struct UvLayout {
    /// Tx2, origin at the bottom-left of the texture.
    pub verts_uvs: Tensor,
    /// Fx3 int64
    pub faces_uvs: Tensor,
}

impl UvLayout {
    pub fn num_faces(&self) -> i64 {
        self.faces_uvs.size()[0]
    }

    pub fn num_uvs(&self) -> i64 {
        self.verts_uvs.size()[0]
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self { verts_uvs: self.verts_uvs.to_device(device), faces_uvs: self.faces_uvs.to_device(device) }
    }
}

/// Reads the `vt` records and the texture indices of the `f` records of an
/// OBJ file. Polygons are split into triangle fans.
pub fn load_uv_layout<P: AsRef<Path>>(path: P, device: Device) -> Result<UvLayout> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let invalid = |line: usize, reason: String| FitError::InvalidObj { path: path.to_path_buf(), line, reason };

    let mut uvs: Vec<f32> = Vec::new();
    let mut faces: Vec<i64> = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        let number = number + 1;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("vt") => {
                let coords = tokens
                    .take(2)
                    .map(|t| t.parse::<f32>().map_err(|e| invalid(number, format!("bad texture coordinate {t:?}: {e}"))))
                    .collect::<Result<Vec<_>>>()?;
                if coords.len() != 2 {
                    return Err(invalid(number, "texture coordinate needs u and v".to_string()));
                }
                uvs.extend(coords);
            }
            Some("f") => {
                let num_uvs = (uvs.len() / 2) as i64;
                let corners = tokens
                    .map(|t| texture_index(t, num_uvs).ok_or_else(|| invalid(number, format!("face corner {t:?} has no valid texture index"))))
                    .collect::<Result<Vec<_>>>()?;
                if corners.len() < 3 {
                    return Err(invalid(number, "face needs at least three corners".to_string()));
                }
                for i in 1..corners.len() - 1 {
                    faces.extend([corners[0], corners[i], corners[i + 1]]);
                }
            }
            _ => {}
        }
    }

    if faces.is_empty() {
        return Err(invalid(0, "no textured faces".to_string()));
    }

    let verts_uvs = Tensor::from_slice(&uvs).view([-1, 2]).to_device(device);
    let faces_uvs = Tensor::from_slice(&faces).view([-1, 3]).to_device(device);
    debug!("loaded {} uvs and {} uv faces from {}", verts_uvs.size()[0], faces_uvs.size()[0], path.display());
    Ok(UvLayout { verts_uvs, faces_uvs })
}

/// Zero-based texture index of an OBJ face corner `v/vt[/vn]`, negative
/// indices counting back from the last `vt` seen.
fn texture_index(corner: &str, num_uvs: i64) -> Option<i64> {
    let index: i64 = corner.split('/').nth(1)?.parse().ok()?;
    let index = if index < 0 { num_uvs + index } else { index - 1 };
    (0..num_uvs).contains(&index).then_some(index)
}

/// Writes a textured mesh as `<name>.obj`, `<name>.mtl` and `<name>.png`.
///
/// # Arguments
/// * `path` - Destination of the OBJ file; siblings share its stem.
/// * `verts` - Vx3 positions.
/// * `faces` - Fx3 vertex indices.
/// * `verts_uvs` - Tx2 texture coordinates.
/// * `faces_uvs` - Fx3 texture indices.
/// * `texture` - SxSx3 texture in [0, 1].
pub fn save_obj<P: AsRef<Path>>(
    path: P,
    verts: &Tensor,
    faces: &Tensor,
    verts_uvs: &Tensor,
    faces_uvs: &Tensor,
    texture: &Tensor,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| FitError::InvalidObj { path: path.to_path_buf(), line: 0, reason: "no file name".to_string() })?;
    let mtl_path = path.with_extension("mtl");
    let png_path = path.with_extension("png");

    let verts = to_vec_f32(verts)?;
    let faces = to_vec_i64(faces)?;
    let uvs = to_vec_f32(verts_uvs)?;
    let faces_uvs = to_vec_i64(faces_uvs)?;
    if faces.len() != faces_uvs.len() {
        return Err(FitError::UvLayoutMismatch { uv_faces: (faces_uvs.len() / 3) as i64, mesh_faces: (faces.len() / 3) as i64 });
    }

    let mut writer = BufWriter::new(File::create(path)?);
    writeln!(writer, "mtllib {stem}.mtl")?;
    writeln!(writer, "usemtl mesh")?;
    for v in verts.chunks_exact(3) {
        writeln!(writer, "v {:.6} {:.6} {:.6}", v[0], v[1], v[2])?;
    }
    for vt in uvs.chunks_exact(2) {
        writeln!(writer, "vt {:.6} {:.6}", vt[0], vt[1])?;
    }
    for (f, ft) in faces.chunks_exact(3).zip(faces_uvs.chunks_exact(3)) {
        writeln!(writer, "f {}/{} {}/{} {}/{}", f[0] + 1, ft[0] + 1, f[1] + 1, ft[1] + 1, f[2] + 1, ft[2] + 1)?;
    }
    writer.flush()?;

    let mut writer = BufWriter::new(File::create(&mtl_path)?);
    writeln!(writer, "newmtl mesh")?;
    writeln!(writer, "Ka 1.000 1.000 1.000")?;
    writeln!(writer, "Kd 1.000 1.000 1.000")?;
    writeln!(writer, "Ks 0.000 0.000 0.000")?;
    writeln!(writer, "map_Kd {stem}.png")?;
    writer.flush()?;

    save_texture(&png_path, texture)?;
    debug!("saved mesh to {}", path.display());
    Ok(())
}

/// Writes an HxWx3 tensor in [0, 1] as an 8-bit RGB image.
pub fn save_texture<P: AsRef<Path>>(path: P, texture: &Tensor) -> Result<()> {
    let size = texture.size();
    let (height, width) = match size[..] {
        [h, w, 3] => (h, w),
        [1, h, w, 3] => (h, w),
        _ => return Err(tch::TchError::Shape(format!("texture must be HxWx3, got {size:?}")).into()),
    };
    let bytes = to_vec_f32(&(texture.clamp(0.0, 1.0) * 255.0).round())?
        .into_iter()
        .map(|x| x as u8)
        .collect::<Vec<_>>();
    let path: PathBuf = path.as_ref().to_path_buf();
    let buffer = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width as u32, height as u32, bytes)
        .ok_or_else(|| FitError::InvalidPhoto { path: path.clone(), reason: "texture buffer size".to_string() })?;
    buffer.save(&path)?;
    Ok(())
}

/// Number of `v` and `f` records of an OBJ file.
pub fn count_obj_elements<P: AsRef<Path>>(path: P) -> Result<(usize, usize)> {
    let reader = BufReader::new(File::open(path)?);
    let mut counts = (0, 0);
    for line in reader.lines() {
        match line?.split_whitespace().next() {
            Some("v") => counts.0 += 1,
            Some("f") => counts.1 += 1,
            _ => {}
        }
    }
    Ok(counts)
}
