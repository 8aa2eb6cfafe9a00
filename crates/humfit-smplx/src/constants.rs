use std::collections::HashMap;
use lazy_static::lazy_static;

lazy_static! {
    /// SMPL-X vertex indices used as extra keypoints (face, feet, finger tips).
    pub static ref SMPLX_VERTEX_IDS: HashMap<String, i64> = {
        let mut smplx = HashMap::new();
        smplx.insert("nose".to_string(), 9120);
        smplx.insert("reye".to_string(), 9929);
        smplx.insert("leye".to_string(), 9448);
        smplx.insert("rear".to_string(), 616);
        smplx.insert("lear".to_string(), 6);
        smplx.insert("rthumb".to_string(), 8079);
        smplx.insert("rindex".to_string(), 7669);
        smplx.insert("rmiddle".to_string(), 7794);
        smplx.insert("rring".to_string(), 7905);
        smplx.insert("rpinky".to_string(), 8022);
        smplx.insert("lthumb".to_string(), 5361);
        smplx.insert("lindex".to_string(), 4933);
        smplx.insert("lmiddle".to_string(), 5058);
        smplx.insert("lring".to_string(), 5169);
        smplx.insert("lpinky".to_string(), 5286);
        smplx.insert("LBigToe".to_string(), 5770);
        smplx.insert("LSmallToe".to_string(), 5780);
        smplx.insert("LHeel".to_string(), 8846);
        smplx.insert("RBigToe".to_string(), 8463);
        smplx.insert("RSmallToe".to_string(), 8474);
        smplx.insert("RHeel".to_string(), 8635);

        smplx
    };
}

/// Body joints excluding the root.
pub const NUM_BODY_JOINTS: i64 = 21;
/// Joints per hand.
pub const NUM_HAND_JOINTS: i64 = 15;
/// Root, body, jaw, both eyes and both hands.
pub const NUM_JOINTS: i64 = 1 + NUM_BODY_JOINTS + 3 + 2 * NUM_HAND_JOINTS;
/// Leading shape components in `shapedirs`; expression components follow.
pub const SHAPE_SPACE_DIM: i64 = 300;
