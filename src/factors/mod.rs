//! Error-term implementations
//!
//! - `pose_factor`: SE(3) pose comparison between a transform expression and a measured pose

pub mod pose_factor;

pub use pose_factor::{PoseErrorTerm, PoseMeasurement};
