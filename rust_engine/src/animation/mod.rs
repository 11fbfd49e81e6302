//! 姿态与动作文件
//!
//! 只负责解析/写出，应用到骨架由 `Armature::apply_pose` / `apply_motion` 完成。

mod motion_file;
mod pose_file;

pub use motion_file::{Channel, MotionFile, MotionJoint};
pub use pose_file::{PoseFile, PoseRecord, PoseSpace};
