use std::fmt;
use std::path::Path;

use log::info;
use tch::nn::VarStore;
use tch::{Kind, Reduction, Tensor};

use humfit_renderer::mesh::TexturedMesh;
use humfit_renderer::render::{Render, RenderBackend};
use humfit_smplx::body_models::BodyModel;
use humfit_utils::mesh_ops::laplacian_smoothing_cot;

use crate::cameras::CameraSource;
use crate::config::{FitConfig, LossConfig, RunConfig};
use crate::error::Result;
use crate::keypoints::{keypoints_loss, KeypointTarget};
use crate::mesh::MeshConstructor;
use crate::obj::{load_uv_layout, save_obj};
use crate::optim::{should_stop_early, ParamGroup};
use crate::params::BodyParams;
use crate::photos::{prepare_photos, PhotoSet, Segmenter};
use crate::progress::progress_bar;
use crate::transfer::ParameterTransfer;

/// External pieces a fit depends on.
pub struct Collaborators<'a> {
    pub model: &'a dyn BodyModel,
    pub cameras: &'a dyn CameraSource,
    pub segmenter: &'a dyn Segmenter,
    pub transfer: &'a dyn ParameterTransfer,
    pub renderer: &'a dyn RenderBackend,
}

/// Why the optimisation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Geometry and texture learning rates decayed during this epoch.
    Converged { epoch: usize },
    /// Every epoch of the budget ran.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FitState {
    Initializing,
    Optimizing,
    Converged,
    Exhausted,
    Finalized,
}

impl fmt::Display for FitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FitState::Initializing => "initializing",
            FitState::Optimizing => "optimizing",
            FitState::Converged => "converged",
            FitState::Exhausted => "exhausted",
            FitState::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

impl FitState {
    fn advance(&mut self, next: FitState) {
        info!("fit {} -> {}", self, next);
        *self = next;
    }
}

/// Detached outcome of a fit.
#[derive(Debug)]
pub struct FitResult {
    pub params: BodyParams,
    /// Nx1, clamped to be non-negative.
    pub verts_disps: Tensor,
    /// 1xSxSx3, clamped to [0, 1].
    pub texture: Tensor,
    /// Optimiser state of the displacements before clamping.
    pub raw_verts_disps: Tensor,
    /// Optimiser state of the texture before clamping.
    pub raw_texture: Tensor,
    /// Mesh built from the final parameters.
    pub mesh: TexturedMesh,
    pub termination: Termination,
    /// Sum of the per-camera losses of each epoch.
    pub epoch_losses: Vec<f64>,
    /// Cameras in the order they were visited.
    pub camera_indices: Vec<usize>,
}

/// Every term of one camera step, before weighting.
struct LossTerms {
    rgb: Tensor,
    silhouette: Tensor,
    laplacian: Tensor,
    keypoints: Tensor,
}

impl LossTerms {
    fn total(&self, weights: &LossConfig, verts_disps: &Tensor) -> Tensor {
        let loss = &self.rgb * weights.rgb
            + &self.silhouette * weights.silhouette
            + &self.laplacian * weights.laplacian
            + &self.keypoints * weights.keypoints;
        match weights.displacement {
            Some(weight) => loss + verts_disps.norm() * weight,
            None => loss,
        }
    }
}

/// Fits pose, shape, displacements and texture of one subject/pose to its
/// multi-view photos.
///
/// # Arguments
/// * `run` - Device and seed; the body model must live on `run.device`.
/// * `collaborators` - Body model, calibration, segmentation, initial fit and renderer.
/// * `config` - Capture, budgets, learning rates, loss weights and output location.
pub fn neural_render(run: &RunConfig, collaborators: &Collaborators<'_>, config: &FitConfig) -> Result<FitResult> {
    config.validate()?;
    let mut state = FitState::Initializing;
    info!("fit {} for subject {} pose {} on {:?}", state, config.subject, config.pose, run.device);
    let model = collaborators.model;
    let layout = config.layout();

    let keypoints = KeypointTarget::load(layout.keypoints_path(), run.device)?;
    let photos = prepare_photos(
        run,
        &layout,
        collaborators.cameras,
        collaborators.segmenter,
        config.num_cameras,
        config.rescale_factor,
    )?;
    let uv_layout = load_uv_layout(&config.uv_template_path, run.device)?;
    let constructor = MeshConstructor::new(model, uv_layout, config.subdivision)?;

    info!("fitting the body model to the initial reconstruction");
    let initial = collaborators
        .transfer
        .initial_fit(model, config.subject, &config.pose, config.pose_iterations, config.shape_iterations)?
        .validated(model)?;

    let options = (Kind::Float, run.device);
    let pose_shape_vs = VarStore::new(run.device);
    let body_pose = pose_shape_vs.root().var_copy("body_pose", &initial.body_pose);
    let betas = pose_shape_vs.root().var_copy("betas", &initial.betas);
    let geometry_vs = VarStore::new(run.device);
    let verts_disps = geometry_vs.root().var_copy("verts_disps", &Tensor::zeros([constructor.num_verts(), 1], options));
    let texture_vs = VarStore::new(run.device);
    let texture = texture_vs
        .root()
        .var_copy("texture", &Tensor::zeros([1, config.texture_size, config.texture_size, 3], options));

    let mut params = BodyParams::from_initial_fit(&initial, model.num_expression_coeffs());
    params.body_pose = body_pose;
    params.betas = betas;

    let optim = &config.optim;
    let mut pose_shape = ParamGroup::new("pose_shape", pose_shape_vs, optim.pose_shape_lr, &optim.scheduler)?;
    let mut geometry = ParamGroup::new("geometry", geometry_vs, optim.geometry_lr, &optim.scheduler)?;
    let mut texture_group = ParamGroup::new("texture", texture_vs, optim.texture_lr, &optim.scheduler)?;

    let settings = config.render.settings(photos.image_size, config.rescale_factor);
    let renderers: Vec<(Box<dyn Render>, Box<dyn Render>)> =
        photos.cameras.iter().map(|camera| collaborators.renderer.renderers(camera, &settings)).collect();
    info!("rendering at {:?} for photos of {:?}", settings.output_size(), photos.image_size);

    state.advance(FitState::Optimizing);
    let pb = progress_bar((config.iterations * photos.len()) as u64);
    let mut termination = Termination::Exhausted;
    let mut epoch_losses = Vec::with_capacity(config.iterations);

    for epoch in 0..config.iterations {
        let mut total_loss = 0.0;
        let mut last_mesh = None;

        for (k, (silhouette_renderer, shaded_renderer)) in renderers.iter().enumerate() {
            let texture_output = texture.clamp(0.0, 1.0);
            let verts_disps_output = verts_disps.clamp_min(0.0);
            let mesh = constructor.construct(&params, &texture_output, Some(&verts_disps_output))?;

            let terms = camera_loss_terms(
                model,
                &params,
                &keypoints,
                &photos,
                k,
                &mesh,
                silhouette_renderer.as_ref(),
                shaded_renderer.as_ref(),
            )?;
            let loss = terms.total(&config.loss, &verts_disps_output);

            pose_shape.zero_grad();
            geometry.zero_grad();
            texture_group.zero_grad();
            loss.backward();
            pose_shape.step();
            geometry.step();
            texture_group.step();

            let value = loss.double_value(&[]);
            total_loss += value;
            pb.set_message(format!("neural rendering loss = {:.6}", value));
            pb.inc(1);
            last_mesh = Some(mesh);
        }

        info!("neural rendering total loss for iteration {}: {:.6}", epoch + 1, total_loss);
        epoch_losses.push(total_loss);
        pose_shape.scheduler_step(total_loss);
        geometry.scheduler_step(total_loss);
        texture_group.scheduler_step(total_loss);

        if let (Some(save_path), Some(mesh)) = (&config.save_path, &last_mesh) {
            if epoch % 2 == 0 && epoch > 0 {
                let filename = format!("mesh_subj_{}_pose_{}_iter_{}.obj", config.subject, config.pose, epoch);
                save_mesh(&save_path.join(filename), mesh)?;
            }
        }

        if should_stop_early(geometry.scheduler(), texture_group.scheduler(), optim.early_stop_ratio) {
            info!("geometry and texture learning rates decayed, stopping after iteration {}", epoch + 1);
            termination = Termination::Converged { epoch };
            break;
        }
    }
    pb.finish_with_message("neural rendering done");

    state.advance(match termination {
        Termination::Converged { .. } => FitState::Converged,
        Termination::Exhausted => FitState::Exhausted,
    });

    let params = params.detach();
    let raw_verts_disps = verts_disps.detach().copy();
    let raw_texture = texture.detach().copy();
    let verts_disps = raw_verts_disps.clamp_min(0.0);
    let texture = raw_texture.clamp(0.0, 1.0);
    let mesh = tch::no_grad(|| constructor.construct(&params, &texture, Some(&verts_disps)))?;

    if let Some(save_path) = &config.save_path {
        let filename = format!("final_subj_{}_pose_{}.obj", config.subject, config.pose);
        save_mesh(&save_path.join(filename), &mesh)?;
    }
    state.advance(FitState::Finalized);

    Ok(FitResult {
        params,
        verts_disps,
        texture,
        raw_verts_disps,
        raw_texture,
        mesh,
        termination,
        epoch_losses,
        camera_indices: photos.camera_indices.clone(),
    })
}

#[allow(clippy::too_many_arguments)]
fn camera_loss_terms(
    model: &dyn BodyModel,
    params: &BodyParams,
    keypoints: &KeypointTarget,
    photos: &PhotoSet,
    k: usize,
    mesh: &TexturedMesh,
    silhouette_renderer: &dyn Render,
    shaded_renderer: &dyn Render,
) -> Result<LossTerms> {
    let rgb_render = shaded_renderer.render(mesh)?.get(0).narrow(-1, 0, 3);
    let silhouette_render = silhouette_renderer.render(mesh)?.get(0).select(-1, 3);

    Ok(LossTerms {
        rgb: rgb_render.l1_loss(&photos.rgbs[k], Reduction::Mean),
        silhouette: silhouette_render.l1_loss(&photos.silhouettes[k], Reduction::Mean),
        laplacian: laplacian_smoothing_cot(&mesh.verts_packed(), &mesh.faces_packed()),
        keypoints: keypoints_loss(model, params, keypoints)?,
    })
}

fn save_mesh(path: &Path, mesh: &TexturedMesh) -> Result<()> {
    info!("saving {}", path.display());
    save_obj(
        path,
        &mesh.verts_packed(),
        &mesh.faces_packed(),
        &mesh.texture.verts_uvs,
        &mesh.texture.faces_uvs,
        &mesh.texture.map.get(0),
    )
}
