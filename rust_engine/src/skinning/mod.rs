//! 顶点蒙皮计算

mod skinning;

pub use skinning::{compute_skinning, normalize_weights, SkinningResolver, WeightGroup};

use glam::{DMat4, DVec3, DVec4};

/// 单根骨骼的归一化顶点权重
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoneWeights {
    /// 受影响的顶点索引（升序）
    pub verts: Vec<usize>,
    /// 与 `verts` 一一对应的归一化权重
    pub weights: Vec<f64>,
}

impl BoneWeights {
    pub fn is_empty(&self) -> bool {
        self.verts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.verts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.verts.iter().copied().zip(self.weights.iter().copied())
    }
}

/// 蒙皮输入数据
pub struct SkinningInput<'a> {
    /// 静止顶点（齐次坐标，w = 1）
    pub rest_coords: &'a [DVec4],
    /// 每根骨骼的蒙皮基（全局 · 静止逆）
    pub bone_matrices: &'a [DMat4],
    pub resolver: &'a SkinningResolver,
    /// 顶点数达到此值时并行计算
    pub parallel_threshold: usize,
}

/// 蒙皮输出数据
pub struct SkinningOutput {
    /// 变换后的顶点位置
    pub positions: Vec<DVec3>,
}
