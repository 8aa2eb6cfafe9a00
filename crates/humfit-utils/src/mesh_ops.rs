use std::collections::BTreeMap;

use tch::{Kind, TchError, Tensor};

use crate::tensor::{last_dim_norm, normalize_last_dim, to_vec_i64};

/// Gathers per-vertex features into per-face-corner features.
///
/// `vertices_features` is `(batch, num_verts, C)` and `faces` is `(num_faces, K)`,
/// the result is `(batch, num_faces, K, C)`.
pub fn face_vertices(vertices_features: &Tensor, faces: &Tensor) -> Tensor {
    assert_eq!(vertices_features.dim(), 3, "vertices_features must have 3 dimensions of shape (batch_size, num_points, knum)");
    assert_eq!(faces.dim(), 2, "faces must have 2 dimensions of shape (num_faces, num_vertices)");

    let [batch, _, channels] = vertices_features.size()[..] else { unreachable!() };
    let [num_faces, corners] = faces.size()[..] else { unreachable!() };

    let flat = faces.to_kind(Kind::Int64).reshape([-1]);
    vertices_features
        .index_select(1, &flat)
        .view([batch, num_faces, corners, channels])
}

/// Area-weighted vertex normals of a single mesh, `verts (V, 3)` and `faces (F, 3)`.
///
/// Every face contributes its (unnormalized) cross products to its three
/// corners, so larger faces weigh more. Unreferenced vertices get a zero normal.
pub fn vertex_normals(verts: &Tensor, faces: &Tensor) -> Tensor {
    let faces = faces.to_kind(Kind::Int64);
    let corners = face_vertices(&verts.unsqueeze(0), &faces).squeeze_dim(0);
    let v0 = corners.select(1, 0);
    let v1 = corners.select(1, 1);
    let v2 = corners.select(1, 2);

    let normals = Tensor::zeros_like(verts)
        .index_add(0, &faces.select(1, 1), &(&v2 - &v1).linalg_cross(&(&v0 - &v1), -1))
        .index_add(0, &faces.select(1, 2), &(&v0 - &v2).linalg_cross(&(&v1 - &v2), -1))
        .index_add(0, &faces.select(1, 0), &(&v1 - &v0).linalg_cross(&(&v2 - &v0), -1));

    normalize_last_dim(&normals, 1e-6)
}

/// One level of midpoint subdivision over a fixed topology.
///
/// The unique edges are enumerated once; a subdivided vertex buffer is the
/// original vertices followed by one midpoint per edge, and every face is
/// split into four. Features of any width (positions, UVs) can be subdivided
/// with the same instance as long as they are laid out on the same faces.
#[derive(Debug)]
pub struct Subdivision {
    edges: Tensor,
    faces: Tensor,
    num_input_verts: i64,
    num_edges: i64,
}

impl Subdivision {
    pub fn new(faces: &Tensor, num_verts: i64) -> Result<Self, TchError> {
        let device = faces.device();
        let flat = to_vec_i64(faces)?;
        if flat.len() % 3 != 0 {
            return Err(TchError::Shape(format!("faces must be triangles, got {:?}", faces.size())));
        }
        if let Some(bad) = flat.iter().find(|&&v| v < 0 || v >= num_verts) {
            return Err(TchError::Shape(format!("face index {bad} out of range for {num_verts} vertices")));
        }

        let sorted = |a: i64, b: i64| if a < b { (a, b) } else { (b, a) };

        let mut edge_ids = BTreeMap::new();
        for tri in flat.chunks_exact(3) {
            for edge in [sorted(tri[1], tri[2]), sorted(tri[0], tri[2]), sorted(tri[0], tri[1])] {
                edge_ids.insert(edge, 0i64);
            }
        }
        for (i, id) in edge_ids.values_mut().enumerate() {
            *id = num_verts + i as i64;
        }

        // Corner faces first, then the centre faces, each group in input face order
        let num_faces = flat.len() / 3;
        let mut groups: [Vec<i64>; 4] = std::array::from_fn(|_| Vec::with_capacity(num_faces * 3));
        for tri in flat.chunks_exact(3) {
            let (v0, v1, v2) = (tri[0], tri[1], tri[2]);
            let e0 = edge_ids[&sorted(v1, v2)];
            let e1 = edge_ids[&sorted(v0, v2)];
            let e2 = edge_ids[&sorted(v0, v1)];
            groups[0].extend_from_slice(&[v0, e2, e1]);
            groups[1].extend_from_slice(&[v1, e0, e2]);
            groups[2].extend_from_slice(&[v2, e1, e0]);
            groups[3].extend_from_slice(&[e0, e1, e2]);
        }
        let new_faces: Vec<i64> = groups.concat();

        let num_edges = edge_ids.len() as i64;
        let edges: Vec<i64> = edge_ids.keys().flat_map(|&(a, b)| [a, b]).collect();

        log::debug!("Subdivision: {} verts, {} faces -> {} verts, {} faces", num_verts, num_faces, num_verts + num_edges, num_faces * 4);

        Ok(Self {
            edges: Tensor::from_slice(&edges).view([num_edges, 2]).to_device(device),
            faces: Tensor::from_slice(&new_faces).view([4 * num_faces as i64, 3]).to_device(device),
            num_input_verts: num_verts,
            num_edges,
        })
    }

    /// Faces of the subdivided mesh, `(4F, 3)` int64.
    pub fn faces(&self) -> &Tensor {
        &self.faces
    }

    /// Vertex count after subdivision, `V + E`.
    pub fn num_verts(&self) -> i64 {
        self.num_input_verts + self.num_edges
    }

    /// Appends edge midpoints to per-vertex features laid out as `(..., V, C)`.
    pub fn subdivide(&self, features: &Tensor) -> Tensor {
        let dim = features.dim() as i64 - 2;
        assert_eq!(
            features.size()[dim as usize],
            self.num_input_verts,
            "subdivision expects {} vertices",
            self.num_input_verts
        );
        let a = features.index_select(dim, &self.edges.select(1, 0));
        let b = features.index_select(dim, &self.edges.select(1, 1));
        Tensor::cat(&[features.shallow_clone(), (a + b) * 0.5], dim)
    }
}

/// Symmetric cotangent weights as a list of `(row, col, weight)` entries.
///
/// Each triangle contributes `cot(angle) / 4` to the edge opposite that angle,
/// in both directions. Degenerate triangles are kept finite by clamping the
/// squared area.
fn cot_weights(verts: &Tensor, faces: &Tensor) -> (Tensor, Tensor, Tensor) {
    let corners = face_vertices(&verts.unsqueeze(0), faces).squeeze_dim(0);
    let v0 = corners.select(1, 0);
    let v1 = corners.select(1, 1);
    let v2 = corners.select(1, 2);

    let a = last_dim_norm(&(&v1 - &v2)).squeeze_dim(-1);
    let b = last_dim_norm(&(&v0 - &v2)).squeeze_dim(-1);
    let c = last_dim_norm(&(&v0 - &v1)).squeeze_dim(-1);

    // Heron's formula
    let s = (&a + &b + &c) * 0.5;
    let area = (&s * (&s - &a) * (&s - &b) * (&s - &c)).clamp_min(1e-12).sqrt();

    let (a2, b2, c2) = (a.square(), b.square(), c.square());
    let cot_a = (&b2 + &c2 - &a2) / &area;
    let cot_b = (&a2 + &c2 - &b2) / &area;
    let cot_c = (&a2 + &b2 - &c2) / &area;
    let cot = Tensor::stack(&[cot_a, cot_b, cot_c], 1) / 4.0;

    let device = faces.device();
    let ii = faces.index_select(1, &Tensor::from_slice(&[1i64, 2, 0]).to_device(device)).reshape([-1]);
    let jj = faces.index_select(1, &Tensor::from_slice(&[2i64, 0, 1]).to_device(device)).reshape([-1]);
    let cot = cot.reshape([-1]);

    let rows = Tensor::cat(&[&ii, &jj], 0);
    let cols = Tensor::cat(&[&jj, &ii], 0);
    let weights = Tensor::cat(&[&cot, &cot], 0);
    (rows, cols, weights)
}

/// Cotangent Laplacian smoothing loss of a single mesh.
///
/// The Laplacian and its row normalization are built from the current
/// vertex positions without gradient tracking; the gradient flows only
/// through the vertex positions being smoothed. Returns the mean over
/// vertices of `|| L v / sum_j L_ij - v ||`.
pub fn laplacian_smoothing_cot(verts: &Tensor, faces: &Tensor) -> Tensor {
    let faces = faces.to_kind(Kind::Int64);
    let num_verts = verts.size()[0];

    let (rows, cols, weights, norm_w) = tch::no_grad(|| {
        let (rows, cols, weights) = cot_weights(verts, &faces);
        let row_sums = Tensor::zeros([num_verts], (verts.kind(), verts.device())).index_add(0, &rows, &weights);
        let positive = row_sums.gt(0.0);
        let norm_w = row_sums.reciprocal().where_self(&positive, &row_sums);
        (rows, cols, weights, norm_w)
    });

    let neighbours = verts.index_select(0, &cols) * weights.unsqueeze(1);
    let lv = Tensor::zeros_like(verts).index_add(0, &rows, &neighbours);
    let residual = lv * norm_w.unsqueeze(1) - verts;

    last_dim_norm(&residual).mean(Kind::Float)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn grid(n: i64) -> (Tensor, Tensor) {
        let mut verts = Vec::new();
        for i in 0..n {
            for j in 0..n {
                verts.extend_from_slice(&[j as f32, i as f32, 0.0]);
            }
        }
        let mut faces = Vec::new();
        for i in 0..n - 1 {
            for j in 0..n - 1 {
                let v = i * n + j;
                faces.extend_from_slice(&[v, v + 1, v + n + 1, v, v + n + 1, v + n]);
            }
        }
        let num_faces = faces.len() as i64 / 3;
        (
            Tensor::from_slice(&verts).view([n * n, 3]),
            Tensor::from_slice(&faces).view([num_faces, 3]),
        )
    }

    fn tetrahedron() -> (Tensor, Tensor) {
        let verts = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]).view([4, 3]);
        let faces = Tensor::from_slice(&[0i64, 2, 1, 0, 1, 3, 0, 3, 2, 1, 2, 3]).view([4, 3]);
        (verts, faces)
    }

    #[test]
    fn test_face_vertices() {
        let vertices_features = Tensor::from_slice(&[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
            7.0, 8.0, 9.0, 10.0, 11.0, 12.0,
        ]).reshape([2, 3, 2]);

        let faces = Tensor::from_slice(&[0, 1, 2, 1, 2, 0]).reshape([2, 3]).to_kind(Kind::Int64);

        let expected = Tensor::from_slice(&[
            1.0, 2.0, 3.0, 4.0, 5.0, 6.0,
            3.0, 4.0, 5.0, 6.0, 1.0, 2.0,
            7.0, 8.0, 9.0, 10.0, 11.0, 12.0,
            9.0, 10.0, 11.0, 12.0, 7.0, 8.0,
        ]).reshape([2, 2, 3, 2]);

        let result = face_vertices(&vertices_features, &faces);

        assert_eq!(result.size(), &[2, 2, 3, 2]);
        assert!(result.allclose(&expected, 1e-5, 1e-8, false));
    }

    #[test]
    fn test_vertex_normals_flat_grid() {
        let (verts, faces) = grid(3);
        let normals = vertex_normals(&verts, &faces);
        let expected = Tensor::from_slice(&[0.0f32, 0.0, 1.0]).view([1, 3]).expand([9, 3], true);
        assert!(normals.allclose(&expected, 1e-5, 1e-6, false));
    }

    #[test]
    fn test_vertex_normals_point_outwards() {
        let (verts, faces) = tetrahedron();
        let normals = vertex_normals(&verts, &faces);
        let centroid = verts.mean_dim(0, true, Kind::Float);
        let outward = (&verts - centroid) * &normals;
        let dots = outward.sum_dim_intlist(&[-1i64][..], false, Kind::Float);
        assert!(dots.gt(0.0).all().int64_value(&[]) == 1);

        let lengths = last_dim_norm(&normals);
        assert!(lengths.allclose(&Tensor::ones_like(&lengths), 1e-5, 1e-6, false));
    }

    #[test]
    fn test_subdivision_counts() {
        let (verts, faces) = tetrahedron();
        let subdivision = Subdivision::new(&faces, 4).unwrap();

        // 4 vertices + 6 edges
        assert_eq!(subdivision.num_verts(), 10);
        assert_eq!(subdivision.faces().size(), &[16, 3]);

        let subdivided = subdivision.subdivide(&verts.unsqueeze(0));
        assert_eq!(subdivided.size(), &[1, 10, 3]);
        assert!(subdivided.narrow(1, 0, 4).squeeze_dim(0).allclose(&verts, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_subdivision_midpoints_and_orientation() {
        let verts = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0]).view([3, 3]);
        let faces = Tensor::from_slice(&[0i64, 1, 2]).view([1, 3]);
        let subdivision = Subdivision::new(&faces, 3).unwrap();
        let subdivided = subdivision.subdivide(&verts);

        // Edges enumerate sorted: (0,1), (0,2), (1,2)
        let expected = Tensor::from_slice(&[
            0.0f32, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 2.0, 0.0,
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0,
        ]).view([6, 3]);
        assert!(subdivided.allclose(&expected, 1e-6, 1e-6, false));

        // Every sub-face keeps the +z orientation of the parent
        let normals = vertex_normals(&subdivided, subdivision.faces());
        let z = normals.select(1, 2);
        assert!(z.allclose(&Tensor::ones_like(&z), 1e-5, 1e-6, false));
    }

    #[test]
    fn test_subdivision_rejects_out_of_range_faces() {
        let faces = Tensor::from_slice(&[0i64, 1, 5]).view([1, 3]);
        assert!(Subdivision::new(&faces, 3).is_err());
    }

    #[test]
    fn test_laplacian_zero_on_flat_interior() {
        let (verts, faces) = grid(3);
        let (rows, cols, weights) = cot_weights(&verts, &faces);
        let row_sums = Tensor::zeros([9], (Kind::Float, Device::Cpu)).index_add(0, &rows, &weights);
        let lv = Tensor::zeros_like(&verts).index_add(0, &rows, &(verts.index_select(0, &cols) * weights.unsqueeze(1)));
        let centre = lv.get(4) / row_sums.get(4);
        assert!(centre.allclose(&verts.get(4), 1e-5, 1e-5, false));
    }

    #[test]
    fn test_laplacian_positive_on_noise() {
        let (verts, faces) = grid(4);
        tch::manual_seed(3);
        let noisy = &verts + Tensor::randn([16, 3], (Kind::Float, Device::Cpu)) * 0.3;

        let rough = laplacian_smoothing_cot(&noisy, &faces).double_value(&[]);
        assert!(rough.is_finite());
        assert!(rough > 0.0);
    }

    #[test]
    fn test_laplacian_gradient_reaches_vertices() {
        let (verts, faces) = tetrahedron();
        let verts = verts.set_requires_grad(true);
        let loss = laplacian_smoothing_cot(&verts, &faces);
        loss.backward();
        let grad = verts.grad();
        assert!(grad.defined());
        assert!(grad.isfinite().all().int64_value(&[]) == 1);
    }
}
