#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use image::{GrayImage, Luma, Rgb, RgbImage};
use tch::{Device, Kind, Tensor};

use humfit_core::cameras::{CameraRecord, CameraRig};
use humfit_core::config::{DatasetLayout, FitConfig, InitialFitSource, LossConfig, OptimConfig, RenderConfig};
use humfit_core::transfer::{InitialFitRecord, Values};
use humfit_renderer::camera::Camera;
use humfit_smplx::body_models::{SmplxOptions, SMPLX};
use humfit_smplx::model::data::DataModel;

pub const SUBJECT: u32 = 1;
pub const POSE: &str = "00000001";
pub const IMAGE_SIZE: (u32, u32) = (24, 32);

const NUM_JOINTS: i64 = 55;

/// Unit octahedron rigged with a full SMPL-X joint hierarchy.
pub fn synthetic_model() -> SMPLX {
    tch::manual_seed(7);
    let options = (Kind::Float, Device::Cpu);
    let v_template = Tensor::from_slice(&[
        1.0f32, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0, 0.0,
        0.0, -1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, -1.0,
    ]).view([6, 3]);

    let mut parents: Vec<i64> = vec![-1];
    parents.extend((1..NUM_JOINTS).map(|i| (i - 1) / 2));
    let kintree_table = Tensor::stack(
        &[Tensor::from_slice(&parents), Tensor::arange(NUM_JOINTS, (Kind::Int64, Device::Cpu))],
        0,
    );

    let mut arrays = HashMap::new();
    arrays.insert("v_template".to_string(), v_template);
    arrays.insert("f".to_string(), octahedron_faces());
    arrays.insert("shapedirs".to_string(), Tensor::randn([6, 3, 310], options) * 0.01);
    arrays.insert("posedirs".to_string(), Tensor::randn([6, 3, (NUM_JOINTS - 1) * 9], options) * 0.01);
    arrays.insert("J_regressor".to_string(), Tensor::rand([NUM_JOINTS, 6], options).softmax(-1, Kind::Float));
    arrays.insert("kintree_table".to_string(), kintree_table);
    arrays.insert("weights".to_string(), Tensor::rand([6, NUM_JOINTS], options).softmax(-1, Kind::Float));

    let data = DataModel::from_tensors(arrays, Device::Cpu).unwrap();
    SMPLX::new(data, &small_options(), Device::Cpu).unwrap()
}

pub fn octahedron_faces() -> Tensor {
    Tensor::from_slice(&[
        0i64, 2, 4, 2, 1, 4, 1, 3, 4, 3, 0, 4,
        2, 0, 5, 1, 2, 5, 3, 1, 5, 0, 3, 5,
    ]).view([8, 3])
}

/// Keypoint vertices wrapped onto the six octahedron vertices.
pub fn small_options() -> SmplxOptions {
    let names = [
        "nose", "reye", "leye", "rear", "lear",
        "LBigToe", "LSmallToe", "LHeel", "RBigToe", "RSmallToe", "RHeel",
        "lthumb", "lindex", "lmiddle", "lring", "lpinky",
        "rthumb", "rindex", "rmiddle", "rring", "rpinky",
    ];
    SmplxOptions {
        vertex_ids: names.iter().enumerate().map(|(i, n)| (n.to_string(), i as i64 % 6)).collect(),
        ..SmplxOptions::default()
    }
}

/// OBJ whose texture indices reuse the vertex indices of the octahedron.
pub fn octahedron_uv_obj() -> String {
    let uvs = [[0.5, 0.5], [0.0, 0.5], [0.5, 1.0], [0.5, 0.0], [1.0, 0.5], [0.25, 0.25]];
    let mut text = String::from("# octahedron uv template\n");
    for [u, v] in uvs {
        text.push_str(&format!("vt {u} {v}\n"));
    }
    let faces = Vec::<i64>::try_from(&octahedron_faces().view(-1)).unwrap();
    for f in faces.chunks(3) {
        text.push_str(&format!("f {0}/{0} {1}/{1} {2}/{2}\n", f[0] + 1, f[1] + 1, f[2] + 1));
    }
    text
}

/// Front camera at distance 5, looking down +z.
pub fn front_camera() -> Camera {
    Camera::new(
        [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        [0.0, 0.0, 5.0],
        [40.0, 40.0],
        [IMAGE_SIZE.1 as f64 / 2.0, IMAGE_SIZE.0 as f64 / 2.0],
    )
}

/// Back camera at distance 5, half a turn about y.
pub fn back_camera() -> Camera {
    Camera::new(
        [[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]],
        [0.0, 0.0, 5.0],
        [40.0, 40.0],
        [IMAGE_SIZE.1 as f64 / 2.0, IMAGE_SIZE.0 as f64 / 2.0],
    )
}

/// A capture on disk: camera rig, photos with masks, keypoints, initial fit
/// and the UV template.
pub struct SyntheticDataset {
    pub dir: tempfile::TempDir,
    pub layout: DatasetLayout,
    pub uv_template_path: PathBuf,
}

impl SyntheticDataset {
    pub fn new(cameras: &[(usize, Camera)]) -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = DatasetLayout::new(dir.path(), SUBJECT, POSE);
        fs::create_dir_all(layout.pose_dir().join("image")).unwrap();
        fs::create_dir_all(layout.pose_dir().join("mask")).unwrap();
        fs::create_dir_all(layout.pose_dir().join("reconstruction")).unwrap();

        let records: BTreeMap<usize, CameraRecord> = cameras.iter().map(|(i, c)| (*i, CameraRecord::from(c))).collect();
        CameraRig::new(SUBJECT, records).save(layout.cameras_path()).unwrap();

        for (index, _) in cameras {
            write_photo(&layout.photo_path(*index));
        }

        let keypoints = (0..25).map(|_| "0.0 0.1 0.0").collect::<Vec<_>>().join("\n");
        fs::write(layout.keypoints_path(), format!("# x y z\n{keypoints}\n")).unwrap();

        let zeros = |n: usize| Values::List(vec![Values::Scalar(0.0); n]);
        InitialFitRecord {
            global_orient: zeros(3),
            transl: zeros(3),
            body_pose: zeros(63),
            betas: zeros(10),
            scale: Values::Scalar(1.0),
            pose_iterations: Some(200),
            shape_iterations: Some(100),
        }
        .save(layout.initial_fit_path())
        .unwrap();

        let uv_template_path = dir.path().join("octahedron_uv.obj");
        fs::write(&uv_template_path, octahedron_uv_obj()).unwrap();

        Self { dir, layout, uv_template_path }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Small, fast fit of this capture.
    pub fn config(&self, iterations: usize) -> FitConfig {
        FitConfig {
            dataset_root: self.root().to_path_buf(),
            subject: SUBJECT,
            pose: POSE.to_string(),
            model_path: self.root().join("unused.npz"),
            uv_template_path: self.uv_template_path.clone(),
            iterations,
            subdivision: false,
            rescale_factor: 2,
            save_path: None,
            texture_size: 8,
            num_cameras: 4,
            initial_fit: InitialFitSource::File,
            pose_iterations: 200,
            shape_iterations: 100,
            optim: OptimConfig::default(),
            loss: LossConfig::default(),
            render: RenderConfig { tile_size: 8, ..RenderConfig::default() },
            device: Device::Cpu,
            seed: 0,
        }
    }
}

/// Grey photo with a bright disc in the middle and the matching mask.
fn write_photo(photo_path: &Path) {
    let (height, width) = IMAGE_SIZE;
    let inside = |x: u32, y: u32| {
        let dx = x as f64 - width as f64 / 2.0;
        let dy = y as f64 - height as f64 / 2.0;
        dx * dx + dy * dy < 36.0
    };
    let photo = RgbImage::from_fn(width, height, |x, y| if inside(x, y) { Rgb([200, 120, 80]) } else { Rgb([60, 60, 60]) });
    photo.save(photo_path).unwrap();

    let mask_path = photo_path.parent().unwrap().parent().unwrap().join("mask").join(photo_path.file_stem().unwrap()).with_extension("png");
    let mask = GrayImage::from_fn(width, height, |x, y| if inside(x, y) { Luma([255]) } else { Luma([0]) });
    mask.save(mask_path).unwrap();
}
