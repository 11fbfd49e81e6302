//! 依附于基础网格的网格

mod proxy;

pub use proxy::{ProxyMesh, ProxyRef};

use glam::DVec3;

/// 每次骨架更新后从基础网格重新推导顶点的网格
pub trait DependentMesh {
    fn name(&self) -> &str;

    /// 按更新后的基础网格坐标重新计算自身顶点
    fn refit(&mut self, base: &[DVec3]);

    fn coords(&self) -> &[DVec3];
}
