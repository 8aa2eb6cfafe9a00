use log::trace;
use tch::{Kind, TchError, Tensor};

use humfit_utils::tensor::{normalize_last_dim, validate_tensor};

use crate::camera::Camera;
use crate::mesh::TexturedMesh;
use crate::rasterizer::{face_normals, rasterize_tile, sample_texture, soft_coverage, ScreenFaces, Tile};

/// Image geometry and appearance of a render.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    /// Full photo resolution `(height, width)` the cameras are calibrated for.
    pub image_size: (i64, i64),
    /// Render every `rescale_factor`-th photo pixel on both axes.
    pub rescale_factor: i64,
    /// Softness of silhouette edges, in squared render pixels.
    pub sigma: f64,
    pub ambient: f64,
    pub diffuse: f64,
    /// RGB where no face is hit.
    pub background: [f64; 3],
    pub znear: f64,
    /// Side of the square pixel tiles faces are culled against.
    pub tile_size: i64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            image_size: (1080, 1920),
            rescale_factor: 3,
            sigma: 1.0,
            ambient: 0.5,
            diffuse: 0.5,
            background: [0.0; 3],
            znear: 1e-2,
            tile_size: 16,
        }
    }
}

impl RenderSettings {
    /// Render resolution `(height, width)`, matching a photo sampled with
    /// stride `rescale_factor`.
    pub fn output_size(&self) -> (i64, i64) {
        let r = self.rescale_factor.max(1);
        let (h, w) = self.image_size;
        ((h + r - 1) / r, (w + r - 1) / r)
    }

    /// Distance beyond which a face contributes less than `exp(-18)` coverage.
    fn soft_margin(&self) -> f64 {
        (18.0 * self.sigma).sqrt() + 1.0
    }
}

/// Renders a mesh to a `[1, H, W, 4]` RGBA image.
pub trait Render {
    fn render(&self, mesh: &TexturedMesh) -> Result<Tensor, TchError>;
}

/// Builds the pair of renderers used for one camera.
pub trait RenderBackend {
    /// Returns `(silhouette renderer, shaded renderer)`.
    fn renderers(&self, camera: &Camera, settings: &RenderSettings) -> (Box<dyn Render>, Box<dyn Render>);
}

/// Tile-based soft rasterizer written with tensor ops only.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftRasterizer;

impl RenderBackend for SoftRasterizer {
    fn renderers(&self, camera: &Camera, settings: &RenderSettings) -> (Box<dyn Render>, Box<dyn Render>) {
        (
            Box::new(SilhouetteRenderer { camera: *camera, settings: settings.clone() }),
            Box::new(ShadedRenderer { camera: *camera, settings: settings.clone() }),
        )
    }
}

fn stitch(rows: Vec<Vec<Tensor>>) -> Tensor {
    let rows: Vec<Tensor> = rows.into_iter().map(|tiles| Tensor::cat(&tiles, 1)).collect();
    Tensor::cat(&rows, 0)
}

/// Soft silhouette in the alpha channel, RGB zero.
#[derive(Debug)]
pub struct SilhouetteRenderer {
    camera: Camera,
    settings: RenderSettings,
}

impl Render for SilhouetteRenderer {
    fn render(&self, mesh: &TexturedMesh) -> Result<Tensor, TchError> {
        let settings = &self.settings;
        let (height, width) = settings.output_size();
        let screen = ScreenFaces::new(mesh, &self.camera, settings.rescale_factor, settings.znear);
        let options = (screen.xy.kind(), screen.xy.device());
        let margin = settings.soft_margin();

        let mut rows = Vec::new();
        for tile_row in Tile::grid(height, width, settings.tile_size) {
            let mut tiles = Vec::with_capacity(tile_row.len());
            for tile in tile_row {
                let (x0, y0, x1, y1) = tile.bounds();
                let candidates = screen.cull(x0, y0, x1, y1, margin);
                let alpha = if candidates.size()[0] == 0 {
                    Tensor::zeros([tile.height, tile.width], options)
                } else {
                    trace!("tile {:?}: {} faces", tile, candidates.size()[0]);
                    let triangles = screen.xy.index_select(0, &candidates);
                    soft_coverage(&tile.pixels(options), &triangles, settings.sigma)
                        .view([tile.height, tile.width])
                };
                tiles.push(alpha);
            }
            rows.push(tiles);
        }

        let alpha = stitch(rows).unsqueeze(-1);
        let rgb = Tensor::zeros([height, width, 3], options);
        let image = Tensor::cat(&[rgb, alpha], -1).unsqueeze(0);
        validate_tensor(&image, &[1, height, width, 4], "silhouette");
        Ok(image)
    }
}

/// Textured, lit render with hard visibility; alpha is the coverage mask.
#[derive(Debug)]
pub struct ShadedRenderer {
    camera: Camera,
    settings: RenderSettings,
}

impl Render for ShadedRenderer {
    fn render(&self, mesh: &TexturedMesh) -> Result<Tensor, TchError> {
        let settings = &self.settings;
        let (height, width) = settings.output_size();
        let screen = ScreenFaces::new(mesh, &self.camera, settings.rescale_factor, settings.znear);
        let options = (screen.xy.kind(), screen.xy.device());

        let texture = &mesh.texture;
        let face_uvs = texture
            .verts_uvs
            .to_kind(options.0)
            .index_select(0, &texture.faces_uvs.reshape([-1]))
            .view([-1, 3, 2]);
        let normals = face_normals(&screen.view);
        let background = Tensor::from_slice(&settings.background).to_kind(options.0).to_device(options.1);

        let mut rows = Vec::new();
        for tile_row in Tile::grid(height, width, settings.tile_size) {
            let mut tiles = Vec::with_capacity(tile_row.len());
            for tile in tile_row {
                let num_pixels = tile.height * tile.width;
                let rgba = match rasterize_tile(&screen, &tile) {
                    None => Tensor::cat(
                        &[
                            background.view([1, 3]).expand([num_pixels, 3], false),
                            Tensor::zeros([num_pixels, 1], options),
                        ],
                        1,
                    ),
                    Some(fragments) => {
                        let w = fragments.weights.unsqueeze(-1);
                        let uv = (&w * face_uvs.index_select(0, &fragments.face))
                            .sum_dim_intlist(&[1i64][..], false, Kind::Float);
                        let texels = sample_texture(&texture.map, &uv);

                        // Headlight: light travels from the camera centre to the surface
                        let point = (&w * screen.view.index_select(0, &fragments.face))
                            .sum_dim_intlist(&[1i64][..], false, Kind::Float);
                        let to_camera = normalize_last_dim(&(-point), 1e-12);
                        let n_dot_l = (normals.index_select(0, &fragments.face) * to_camera)
                            .sum_dim_intlist(&[-1i64][..], true, Kind::Float)
                            .clamp_min(0.0);
                        let shade = n_dot_l * settings.diffuse + settings.ambient;

                        let hit = fragments.hit.unsqueeze(-1);
                        let colour = (texels * shade).where_self(&hit, &background.view([1, 3]));
                        Tensor::cat(&[colour, hit.to_kind(options.0)], 1)
                    }
                };
                tiles.push(rgba.view([tile.height, tile.width, 4]));
            }
            rows.push(tiles);
        }

        let image = stitch(rows).unsqueeze(0);
        validate_tensor(&image, &[1, height, width, 4], "shaded");
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::TextureMap;
    use tch::Device;

    // Square of side 2 at depth 5, facing the camera
    fn square_mesh(texture: Tensor) -> TexturedMesh {
        let verts = Tensor::from_slice(&[
            -1.0f32, -1.0, 5.0, -1.0, 1.0, 5.0, 1.0, 1.0, 5.0, 1.0, -1.0, 5.0,
        ]).view([4, 3]);
        let faces = Tensor::from_slice(&[0i64, 1, 2, 0, 2, 3]).view([2, 3]);
        let verts_uvs = Tensor::from_slice(&[0.0f32, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0]).view([4, 2]);
        let map = TextureMap::new(texture, verts_uvs, faces.shallow_clone()).unwrap();
        TexturedMesh::new(verts, faces, map).unwrap()
    }

    fn settings() -> RenderSettings {
        RenderSettings {
            image_size: (40, 40),
            rescale_factor: 2,
            sigma: 0.1,
            tile_size: 8,
            ..RenderSettings::default()
        }
    }

    fn camera() -> Camera {
        Camera::identity([50.0, 50.0], [20.0, 20.0])
    }

    #[test]
    fn test_output_size_matches_strided_photo() {
        let settings = RenderSettings { image_size: (1080, 1920), rescale_factor: 3, ..RenderSettings::default() };
        assert_eq!(settings.output_size(), (360, 640));
        let settings = RenderSettings { image_size: (7, 5), rescale_factor: 2, ..RenderSettings::default() };
        assert_eq!(settings.output_size(), (4, 3));
    }

    #[test]
    fn test_silhouette_covers_projected_square() {
        let mesh = square_mesh(Tensor::ones([1, 4, 4, 3], (Kind::Float, Device::Cpu)));
        let (silhouette, _) = SoftRasterizer.renderers(&camera(), &settings());

        let image = silhouette.render(&mesh).unwrap();
        assert_eq!(image.size(), &[1, 20, 20, 4]);

        // The square spans photo pixels 10..30, render pixels 5..15
        let alpha = image.select(3, 3).squeeze_dim(0);
        assert!(alpha.double_value(&[10, 10]) > 0.99);
        assert!(alpha.double_value(&[1, 1]) < 1e-3);
        assert!(alpha.double_value(&[10, 18]) < 1e-3);
    }

    #[test]
    fn test_shaded_render_uses_texture_and_background() {
        let texture = Tensor::full([1, 4, 4, 3], 0.8, (Kind::Float, Device::Cpu));
        let mesh = square_mesh(texture);
        let settings = RenderSettings { background: [0.0, 0.0, 1.0], ..settings() };
        let (_, shaded) = SoftRasterizer.renderers(&camera(), &settings);

        let image = shaded.render(&mesh).unwrap().squeeze_dim(0);

        // Facing the headlight at the centre: ambient + diffuse = 1
        let centre = image.get(10).get(10);
        let expected = Tensor::from_slice(&[0.8f32, 0.8, 0.8, 1.0]);
        assert!(centre.allclose(&expected, 1e-2, 1e-2, false));

        let corner = image.get(0).get(0);
        let expected = Tensor::from_slice(&[0.0f32, 0.0, 1.0, 0.0]);
        assert!(corner.allclose(&expected, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_renders_are_differentiable() {
        let texture = Tensor::full([1, 4, 4, 3], 0.5, (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let mut mesh = square_mesh(texture.shallow_clone());
        let offset = Tensor::zeros([1, 4, 3], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        mesh.verts = &mesh.verts + &offset;

        let (silhouette, shaded) = SoftRasterizer.renderers(&camera(), &settings());
        let loss = silhouette.render(&mesh).unwrap().select(3, 3).sum(Kind::Float)
            + shaded.render(&mesh).unwrap().narrow(3, 0, 3).sum(Kind::Float);
        loss.backward();

        let vert_grad = offset.grad();
        assert!(vert_grad.isfinite().all().int64_value(&[]) == 1);
        assert!(vert_grad.abs().sum(Kind::Float).double_value(&[]) > 0.0);
        assert!(texture.grad().abs().sum(Kind::Float).double_value(&[]) > 0.0);
    }

    #[test]
    fn test_mesh_behind_camera_is_invisible() {
        let mut mesh = square_mesh(Tensor::ones([1, 4, 4, 3], (Kind::Float, Device::Cpu)));
        mesh.verts = &mesh.verts * Tensor::from_slice(&[1.0f32, 1.0, -1.0]);
        let (silhouette, shaded) = SoftRasterizer.renderers(&camera(), &settings());

        let alpha = silhouette.render(&mesh).unwrap().select(3, 3);
        let mask = shaded.render(&mesh).unwrap().select(3, 3);
        assert_eq!(alpha.abs().sum(Kind::Float).double_value(&[]), 0.0);
        assert_eq!(mask.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }
}
