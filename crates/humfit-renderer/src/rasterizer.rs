use tch::{Kind, Tensor};

use humfit_utils::mesh_ops::face_vertices;
use humfit_utils::tensor::{normalize_last_dim, validate_tensor};

use crate::camera::{photo_to_render, Camera};
use crate::mesh::TexturedMesh;

const AREA_EPS: f64 = 1e-10;

/// Per-face data of a mesh seen from one camera.
///
/// Screen positions are in render-grid coordinates, so the centre of render
/// pixel `(i, j)` is `(j, i)`.
#[derive(Debug)]
pub struct ScreenFaces {
    /// Fx3x2 corner positions on the render grid.
    pub xy: Tensor,
    /// Fx3 corner depths, clamped to the near plane.
    pub depth: Tensor,
    /// Fx3x3 corner positions in the camera frame.
    pub view: Tensor,
    /// F, faces with every corner in front of the near plane.
    pub valid: Tensor,
    /// Fx4 screen bounding boxes `(xmin, ymin, xmax, ymax)`, detached.
    pub bounds: Tensor,
}

impl ScreenFaces {
    pub fn new(mesh: &TexturedMesh, camera: &Camera, rescale_factor: i64, znear: f64) -> Self {
        let verts = mesh.verts_packed();
        let faces = mesh.faces_packed();

        let view = camera.world_to_view(&verts);
        let photo = camera.view_to_photo(&view, znear);
        let xy = photo_to_render(&photo, rescale_factor);

        let view = face_vertices(&view.unsqueeze(0), &faces).squeeze_dim(0);
        let xy = face_vertices(&xy.unsqueeze(0), &faces).squeeze_dim(0);
        let raw_depth = view.select(-1, 2);
        let valid = raw_depth.gt(znear).all_dim(-1, false);
        let depth = raw_depth.clamp_min(znear);

        let bounds = tch::no_grad(|| {
            let (min, _) = xy.min_dim(1, false);
            let (max, _) = xy.max_dim(1, false);
            Tensor::cat(&[min, max], 1)
        });

        Self { xy, depth, view, valid, bounds }
    }

    pub fn num_faces(&self) -> i64 {
        self.xy.size()[0]
    }

    /// Indices of valid faces whose bounding box, grown by `margin`, touches
    /// the pixel rectangle `[x0, x1] x [y0, y1]`.
    pub fn cull(&self, x0: f64, y0: f64, x1: f64, y1: f64, margin: f64) -> Tensor {
        let b = &self.bounds;
        let keep = self
            .valid
            .logical_and(&b.select(1, 2).ge(x0 - margin))
            .logical_and(&b.select(1, 0).le(x1 + margin))
            .logical_and(&b.select(1, 3).ge(y0 - margin))
            .logical_and(&b.select(1, 1).le(y1 + margin));
        keep.nonzero().squeeze_dim(1)
    }
}

/// A rectangle of render pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub row: i64,
    pub col: i64,
    pub height: i64,
    pub width: i64,
}

impl Tile {
    /// Splits an image into tiles of at most `size x size` pixels, row-major.
    pub fn grid(height: i64, width: i64, size: i64) -> Vec<Vec<Tile>> {
        let size = size.max(1);
        (0..height)
            .step_by(size as usize)
            .map(|row| {
                (0..width)
                    .step_by(size as usize)
                    .map(|col| Tile {
                        row,
                        col,
                        height: size.min(height - row),
                        width: size.min(width - col),
                    })
                    .collect()
            })
            .collect()
    }

    /// Pixel centres of the tile, row-major, Px2 as `(x, y)`.
    pub fn pixels(&self, options: (Kind, tch::Device)) -> Tensor {
        let ys = Tensor::arange_start(self.row, self.row + self.height, options);
        let xs = Tensor::arange_start(self.col, self.col + self.width, options);
        let ys = ys.view([-1, 1]).expand([self.height, self.width], false);
        let xs = xs.view([1, -1]).expand([self.height, self.width], false);
        Tensor::stack(&[xs, ys], -1).reshape([-1, 2])
    }

    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        (
            self.col as f64,
            self.row as f64,
            (self.col + self.width - 1) as f64,
            (self.row + self.height - 1) as f64,
        )
    }
}

/// z component of the 2D cross product `u x v` over the last dimension.
fn cross2(u: &Tensor, v: &Tensor) -> Tensor {
    u.select(-1, 0) * v.select(-1, 1) - u.select(-1, 1) * v.select(-1, 0)
}

/// Squared distance from points to segments `a -> b`, broadcasting over the
/// leading dimensions.
fn segment_sq_distance(p: &Tensor, a: &Tensor, b: &Tensor) -> Tensor {
    let ab = b - a;
    let ap = p - a;
    let denom = ab.square().sum_dim_intlist(&[-1i64][..], true, Kind::Float).clamp_min(AREA_EPS);
    let t = ((&ap * &ab).sum_dim_intlist(&[-1i64][..], true, Kind::Float) / denom).clamp(0.0, 1.0);
    let closest = a + t * ab;
    (p - closest).square().sum_dim_intlist(&[-1i64][..], false, Kind::Float)
}

/// Signed squared distance from every pixel `(P, 2)` to every triangle
/// `(F, 3, 2)`, negative inside. Degenerate triangles count as outside.
pub fn signed_sq_distance(pixels: &Tensor, triangles: &Tensor) -> Tensor {
    let p = pixels.unsqueeze(1);
    let a = triangles.select(1, 0).unsqueeze(0);
    let b = triangles.select(1, 1).unsqueeze(0);
    let c = triangles.select(1, 2).unsqueeze(0);

    let dist = segment_sq_distance(&p, &a, &b)
        .minimum(&segment_sq_distance(&p, &b, &c))
        .minimum(&segment_sq_distance(&p, &c, &a));

    let inside = tch::no_grad(|| {
        let e0 = cross2(&(&b - &a), &(&p - &a));
        let e1 = cross2(&(&c - &b), &(&p - &b));
        let e2 = cross2(&(&a - &c), &(&p - &c));
        let positive = e0.ge(0.0).logical_and(&e1.ge(0.0)).logical_and(&e2.ge(0.0));
        let negative = e0.le(0.0).logical_and(&e1.le(0.0)).logical_and(&e2.le(0.0));
        let area = cross2(&(&b - &a), &(&c - &a)).abs();
        positive.logical_or(&negative).logical_and(&area.gt(AREA_EPS))
    });

    (-&dist).where_self(&inside, &dist)
}

/// Soft coverage of a tile: `1 - prod_f (1 - sigmoid(-d_f / sigma))`.
pub fn soft_coverage(pixels: &Tensor, triangles: &Tensor, sigma: f64) -> Tensor {
    let d = signed_sq_distance(pixels, triangles);
    // log(1 - sigmoid(x)) = -softplus(x)
    let log_transmittance = -(-d / sigma).softplus().sum_dim_intlist(&[-1i64][..], false, Kind::Float);
    1.0 - log_transmittance.exp()
}

/// Nearest covering face per pixel, chosen without gradient tracking.
///
/// Returns `(face index into `candidates`, hit mask)`; pixels without a hit
/// point at the first candidate.
pub fn nearest_faces(pixels: &Tensor, triangles: &Tensor, depth: &Tensor) -> (Tensor, Tensor) {
    tch::no_grad(|| {
        let bary = barycentrics(&pixels.unsqueeze(1), &triangles.unsqueeze(0));
        let a = triangles.select(1, 0);
        let proper = cross2(&(triangles.select(1, 1) - &a), &(triangles.select(1, 2) - &a))
            .abs()
            .gt(AREA_EPS)
            .unsqueeze(0);
        let inside = bary.ge(0.0).all_dim(-1, false).logical_and(&proper);
        let inv_depth = (&bary / depth.unsqueeze(0)).sum_dim_intlist(&[-1i64][..], false, Kind::Float);
        let pixel_depth = inv_depth.reciprocal();
        let pixel_depth = pixel_depth.where_self(&inside, &Tensor::full_like(&pixel_depth, f64::INFINITY));
        let (closest, index) = pixel_depth.min_dim(1, false);
        (index, closest.isfinite())
    })
}

/// Screen-space barycentric coordinates `(..., 3)` of points `(..., 2)` in
/// triangles `(..., 3, 2)`; degenerate triangles get a tiny signed area.
pub fn barycentrics(points: &Tensor, triangles: &Tensor) -> Tensor {
    let a = triangles.select(-2, 0);
    let b = triangles.select(-2, 1);
    let c = triangles.select(-2, 2);

    let area = cross2(&(&b - &a), &(&c - &a));
    let tiny = area.abs().lt(AREA_EPS);
    let area = Tensor::full_like(&area, AREA_EPS).where_self(&tiny, &area);

    let l0 = cross2(&(&c - &b), &(points - &b)) / &area;
    let l1 = cross2(&(&a - &c), &(points - &c)) / &area;
    let l2 = cross2(&(&b - &a), &(points - &a)) / &area;
    Tensor::stack(&[l0, l1, l2], -1)
}

/// Per-pixel attributes of the selected faces.
#[derive(Debug)]
pub struct Fragments {
    /// P, hit mask.
    pub hit: Tensor,
    /// Px3 perspective-correct barycentrics, uniform where nothing is hit.
    pub weights: Tensor,
    /// P, selected face per pixel (global index).
    pub face: Tensor,
}

/// Hard rasterization of one tile.
pub fn rasterize_tile(screen: &ScreenFaces, tile: &Tile) -> Option<Fragments> {
    let (x0, y0, x1, y1) = tile.bounds();
    let candidates = screen.cull(x0, y0, x1, y1, 0.5);
    if candidates.size()[0] == 0 {
        return None;
    }

    let pixels = tile.pixels((screen.xy.kind(), screen.xy.device()));
    let triangles = screen.xy.index_select(0, &candidates);
    let depth = screen.depth.index_select(0, &candidates);

    let (local, hit) = nearest_faces(&pixels, &triangles.detach(), &depth.detach());
    let face = candidates.index_select(0, &local);

    let tri = screen.xy.index_select(0, &face);
    let z = screen.depth.index_select(0, &face);
    let screen_bary = barycentrics(&pixels, &tri);

    // Pixels that miss get uniform weights so no division below can blow up
    let uniform = Tensor::full_like(&screen_bary, 1.0 / 3.0);
    let screen_bary = screen_bary.where_self(&hit.unsqueeze(-1), &uniform);
    let corrected = &screen_bary / z;
    let weights = &corrected / corrected.sum_dim_intlist(&[-1i64][..], true, Kind::Float);

    validate_tensor(&weights, &[tile.height * tile.width, 3], "weights");
    Some(Fragments { hit, weights, face })
}

/// Bilinear texture lookup. `map` is 1xSxSx3, `uv` is Px2 with v pointing up.
pub fn sample_texture(map: &Tensor, uv: &Tensor) -> Tensor {
    let input = map.permute([0, 3, 1, 2]);
    let gx = uv.select(1, 0) * 2.0 - 1.0;
    let gy = (1.0 - uv.select(1, 1)) * 2.0 - 1.0;
    let grid = Tensor::stack(&[gx, gy], -1).view([1, 1, -1, 2]).to_kind(input.kind());
    // bilinear, border padding, corner-aligned
    let sampled = input.grid_sampler(&grid, 0, 1, true);
    sampled.view([3, -1]).transpose(0, 1)
}

/// Camera-frame unit normals per face, Fx3.
pub fn face_normals(view: &Tensor) -> Tensor {
    let v0 = view.select(1, 0);
    let v1 = view.select(1, 1);
    let v2 = view.select(1, 2);
    normalize_last_dim(&(&v1 - &v0).linalg_cross(&(&v2 - &v0), -1), 1e-12)
}
