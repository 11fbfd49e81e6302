//! 静止坐标变形（蒙皮前）

mod modifier;

pub use modifier::{RestModifier, TargetCache, TargetModifier};
