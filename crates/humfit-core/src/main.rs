use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use log::info;

use humfit_core::cameras::CameraRig;
use humfit_core::config::{FitConfig, InitialFitSource};
use humfit_core::fit::{neural_render, Collaborators, Termination};
use humfit_core::photos::MaskFileSegmenter;
use humfit_core::transfer::{FitFileTransfer, NeutralTransfer, ParameterTransfer};
use humfit_renderer::render::SoftRasterizer;
use humfit_smplx::body_models::{SmplxOptions, SMPLX};

/// Fits a textured SMPL-X mesh to the multi-view photos of one capture.
#[derive(FromArgs)]
struct Args {
    /// the config file.
    #[argh(option, default = "PathBuf::from(\"fit.json5\")")]
    config: PathBuf,
    /// override the number of epochs.
    #[argh(option)]
    iterations: Option<usize>,
    /// override the output directory.
    #[argh(option)]
    save_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let args: Args = argh::from_env();
    let mut config =
        FitConfig::open(&args.config).with_context(|| format!("loading config {}", args.config.display()))?;
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if args.save_path.is_some() {
        config.save_path = args.save_path;
    }
    let run = config.run_config();

    info!("loading body model {}", config.model_path.display());
    let model = SMPLX::from_file(&config.model_path, &SmplxOptions::default(), run.device)
        .with_context(|| format!("loading body model {}", config.model_path.display()))?;
    info!("{}", model.extra_repr());

    let layout = config.layout();
    let cameras = CameraRig::from_layout(&layout)
        .with_context(|| format!("loading cameras {}", layout.cameras_path().display()))?;
    let transfer: Box<dyn ParameterTransfer> = match config.initial_fit {
        InitialFitSource::File => Box::new(FitFileTransfer::new(&config.dataset_root)),
        InitialFitSource::Neutral => Box::new(NeutralTransfer),
    };

    let collaborators = Collaborators {
        model: &model,
        cameras: &cameras,
        segmenter: &MaskFileSegmenter,
        transfer: transfer.as_ref(),
        renderer: &SoftRasterizer,
    };
    let result = neural_render(&run, &collaborators, &config)?;

    match result.termination {
        Termination::Converged { epoch } => info!("converged after {} iterations", epoch + 1),
        Termination::Exhausted => info!("ran all {} iterations", config.iterations),
    }
    if let Some(loss) = result.epoch_losses.last() {
        info!("final total loss {:.6}", loss);
    }
    info!(
        "final mesh has {} vertices and {} faces",
        result.mesh.num_verts(),
        result.mesh.num_faces()
    );
    Ok(())
}
