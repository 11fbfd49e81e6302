//! 骨骼系统和约束求解

mod armature;
mod bone;
mod constraint;
pub mod math;
mod rig;

pub use armature::{Armature, PoseReport, PoseSnapshot, RotationReadout};
pub use bone::{Bone, BoneFlags, LAYER_MAIN};
pub use constraint::{blend, Constraint, CopySettings, Point};
pub use math::{Axis, EulerOrder};
pub use rig::{BoneDef, BonePoint, ConstraintDef, CopyDef, PointRef, RigDefinition, RigOption, ShapeKind};
