//! Armature Engine - 人体模型姿态骨架与蒙皮变形引擎
//!
//! 提供与建模工具姿态模式等价的功能：
//! - 从骨架定义构建层级骨骼
//! - 静止/姿态/全局矩阵维护与层级传播
//! - 约束求解（复制旋转/位置/变换、拉伸、极向目标、旋转限制）
//! - 顶点权重归一化与蒙皮计算
//! - 姿态文件与动作捕捉文件读取

pub mod animation;
pub mod config;
pub mod model;
pub mod morph;
pub mod skeleton;
pub mod skinning;

pub use animation::{MotionFile, PoseFile, PoseRecord, PoseSpace};
pub use config::ArmatureConfig;
pub use model::{DependentMesh, ProxyMesh, ProxyRef};
pub use morph::{RestModifier, TargetModifier};
pub use skeleton::{
    Armature, Axis, Bone, BoneDef, BoneFlags, BonePoint, Constraint, ConstraintDef, EulerOrder,
    PointRef, PoseReport, PoseSnapshot, RigDefinition, RigOption, RotationReadout,
};
pub use skinning::{BoneWeights, SkinningResolver};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArmatureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Duplicate bone: {0}")]
    DuplicateBone(String),

    #[error("Bone {bone} references undefined parent {parent}")]
    MissingParent { bone: String, parent: String },

    #[error("Bone hierarchy cycle through {0}")]
    HierarchyCycle(String),

    #[error("Zero-length bone: {0}")]
    ZeroLengthBone(String),

    #[error("Bone {bone}: invalid joint location: {reason}")]
    InvalidJoint { bone: String, reason: String },

    #[error("Bone {bone} has a constraint on undefined bone {target}")]
    UnknownConstraintTarget { bone: String, target: String },

    #[error("Cyclic constraint dependency: {bone} depends on {target}")]
    ConstraintCycle { bone: String, target: String },

    #[error("Weight table references undefined bone {0}")]
    UnknownWeightBone(String),

    #[error("Invalid weight {weight} for bone {bone}, vertex {vertex}")]
    InvalidWeight { bone: String, vertex: usize, weight: f64 },

    #[error("Vertex index {vertex} out of range ({count} vertices)")]
    VertexOutOfRange { vertex: usize, count: usize },

    #[error("Unknown bone: {0}")]
    UnknownBone(String),

    #[error("Bone is locked: {0}")]
    LockedBone(String),

    #[error("Invalid axis index: {0}")]
    InvalidAxis(usize),

    #[error("Motion parse error: {0}")]
    MotionParse(String),

    #[error("Target parse error: {0}")]
    TargetParse(String),

    #[error("Proxy parse error: {0}")]
    ProxyParse(String),
}

pub type Result<T> = std::result::Result<T, ArmatureError>;
