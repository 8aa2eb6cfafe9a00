use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tch::{Device, Kind, Tensor};

use humfit_renderer::camera::Camera;

use crate::cameras::CameraSource;
use crate::config::{DatasetLayout, RunConfig};
use crate::error::{FitError, Result};
use crate::progress::progress_bar;

/// A photo split into the person and everything else.
#[derive(Debug)]
pub struct Segmentation {
    /// 1xHxWx3 float in [0, 1].
    pub photo: Tensor,
    /// 1xHxW bool, person pixels set.
    pub silhouette: Tensor,
    /// 1xHxWx3 float, the photo with the background zeroed.
    pub rgb: Tensor,
}

/// Person segmentation of a photo.
pub trait Segmenter {
    fn segment(&self, photo_path: &Path, device: Device) -> Result<Segmentation>;
}

/// Reads a pre-computed person mask stored next to each photo, in a `mask`
/// directory beside the `image` directory and with a `.png` extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct MaskFileSegmenter;

impl MaskFileSegmenter {
    pub fn mask_path(photo_path: &Path) -> Option<PathBuf> {
        let stem = photo_path.file_stem()?;
        let pose_dir = photo_path.parent()?.parent()?;
        Some(pose_dir.join("mask").join(stem).with_extension("png"))
    }
}

impl Segmenter for MaskFileSegmenter {
    fn segment(&self, photo_path: &Path, device: Device) -> Result<Segmentation> {
        let invalid = |reason: String| FitError::InvalidPhoto { path: photo_path.to_path_buf(), reason };

        let photo = image::open(photo_path)?.to_rgb8();
        let mask_path = Self::mask_path(photo_path).ok_or_else(|| invalid("no mask location".to_string()))?;
        let mask = image::open(&mask_path)?.to_luma8();
        if photo.dimensions() != mask.dimensions() {
            return Err(invalid(format!("photo is {:?}, mask is {:?}", photo.dimensions(), mask.dimensions())));
        }

        let (width, height) = photo.dimensions();
        let (width, height) = (width as i64, height as i64);
        let photo = (Tensor::from_slice(photo.as_raw()).view([1, height, width, 3]).to_kind(Kind::Float) / 255.0)
            .to_device(device);
        let silhouette = Tensor::from_slice(mask.as_raw()).view([1, height, width]).gt(127).to_device(device);
        let rgb = &photo * silhouette.unsqueeze(-1).to_kind(Kind::Float);

        Ok(Segmentation { photo, silhouette, rgb })
    }
}

/// Silhouettes and colours of every usable camera, index aligned.
#[derive(Debug)]
pub struct PhotoSet {
    pub camera_indices: Vec<usize>,
    pub cameras: Vec<Camera>,
    /// HxW float in {0, 1}, sampled with stride `rescale_factor`.
    pub silhouettes: Vec<Tensor>,
    /// HxWx3 float in [0, 1], sampled with stride `rescale_factor`.
    pub rgbs: Vec<Tensor>,
    /// Full photo resolution `(height, width)`.
    pub image_size: (i64, i64),
}

impl PhotoSet {
    pub fn len(&self) -> usize {
        self.camera_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.camera_indices.is_empty()
    }
}

/// Keeps every `stride`-th pixel on both axes of an HxW(xC) image.
pub fn downsample(image: &Tensor, stride: i64) -> Result<Tensor> {
    if stride < 1 {
        return Err(FitError::InvalidConfig { field: "rescale_factor", reason: format!("stride {stride} is not positive") });
    }
    let rows = image.f_slice(0, None::<i64>, None::<i64>, stride)?;
    Ok(rows.f_slice(1, None::<i64>, None::<i64>, stride)?)
}

/// Segments the photo of every candidate camera in a seeded random order.
///
/// Cameras missing from the rig are skipped; every other error aborts.
///
/// # Arguments
/// * `run` - Device and seed of the run.
/// * `layout` - Where the subject's photos live.
/// * `cameras` - Calibration lookup.
/// * `segmenter` - Person segmentation.
/// * `num_candidates` - Camera indices `0..num_candidates` are tried.
/// * `rescale_factor` - Sampling stride on both axes.
pub fn prepare_photos(
    run: &RunConfig,
    layout: &DatasetLayout,
    cameras: &dyn CameraSource,
    segmenter: &dyn Segmenter,
    num_candidates: usize,
    rescale_factor: i64,
) -> Result<PhotoSet> {
    if rescale_factor < 1 {
        return Err(FitError::InvalidConfig {
            field: "rescale_factor",
            reason: format!("{rescale_factor} is not a positive stride"),
        });
    }
    let mut order: Vec<usize> = (0..num_candidates).collect();
    order.shuffle(&mut StdRng::seed_from_u64(run.seed));

    let pb = progress_bar(num_candidates as u64);
    pb.set_message("segmenting photos");

    let mut photos = PhotoSet {
        camera_indices: Vec::new(),
        cameras: Vec::new(),
        silhouettes: Vec::new(),
        rgbs: Vec::new(),
        image_size: (0, 0),
    };

    for index in order {
        pb.inc(1);
        let camera = match cameras.camera(layout.subject, index) {
            Ok(camera) => camera,
            Err(FitError::MissingCamera { .. }) => {
                info!("camera with index {} does not exist", index);
                continue;
            }
            Err(err) => return Err(err),
        };

        let photo_path = layout.photo_path(index);
        let segmentation = segmenter.segment(&photo_path, run.device)?;
        let size = segmentation.silhouette.size();
        let image_size = (size[1], size[2]);
        if photos.is_empty() {
            photos.image_size = image_size;
        } else if photos.image_size != image_size {
            return Err(FitError::InvalidPhoto {
                path: photo_path,
                reason: format!("size {:?} differs from {:?}", image_size, photos.image_size),
            });
        }

        let silhouette = downsample(&segmentation.silhouette.get(0), rescale_factor)?.to_kind(Kind::Float);
        let rgb = downsample(&segmentation.rgb.get(0), rescale_factor)?;
        debug!("camera {}: silhouette {:?}", index, silhouette.size());

        photos.camera_indices.push(index);
        photos.cameras.push(camera);
        photos.silhouettes.push(silhouette);
        photos.rgbs.push(rgb);
    }
    pb.finish_with_message(format!("{} cameras", photos.len()));

    if photos.is_empty() {
        return Err(FitError::NoCameras { candidates: num_candidates });
    }
    info!("prepared {} of {} candidate cameras", photos.len(), num_candidates);
    Ok(photos)
}
