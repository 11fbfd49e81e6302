//! 骨架配置
//!
//! 所有参数扁平化，构建骨架时按值传入，由 Armature 持有。

use crate::skeleton::EulerOrder;

/// 骨架配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct ArmatureConfig {
    // ========== 滑块 ==========
    /// 四元数滑块缩放（滑块值 = 分量 × 此值），默认 1000.0
    pub quat_slider_scale: f64,
    /// 欧拉角滑块使用的轴顺序，默认世界 X→Y→Z
    pub euler_order: EulerOrder,

    // ========== 蒙皮 ==========
    /// 顶点数达到此值时使用 rayon 并行蒙皮，默认 4096
    pub parallel_skinning_threshold: usize,

    // ========== 显示 ==========
    /// 初始可见层掩码，默认 1（主层）
    pub visible_layers: u32,

    // ========== 动作文件 ==========
    /// 是否应用根骨骼的位置通道，默认 false
    pub motion_root_translation: bool,
    /// 位置通道缩放（动作文件单位 → 网格单位），默认 1.0
    pub motion_scale: f64,

    // ========== 调试 ==========
    /// 构建时是否输出每根骨骼的矩阵，默认 false
    pub debug_log: bool,
}

impl Default for ArmatureConfig {
    fn default() -> Self {
        Self {
            // 与姿态面板一致：滑块 ±1000 对应四元数分量 ±1
            quat_slider_scale: 1000.0,
            euler_order: EulerOrder::XYZ,

            parallel_skinning_threshold: 4096,

            visible_layers: 1,

            // 动作文件的根位置通常与网格单位不一致，默认只取旋转
            motion_root_translation: false,
            motion_scale: 1.0,

            debug_log: false,
        }
    }
}

impl ArmatureConfig {
    /// 四元数分量 → 滑块值
    pub fn quat_to_slider(&self, component: f64) -> f64 {
        component * self.quat_slider_scale
    }

    /// 滑块值 → 四元数分量
    pub fn slider_to_quat(&self, value: f64) -> f64 {
        if self.quat_slider_scale.abs() < f64::EPSILON {
            value
        } else {
            value / self.quat_slider_scale
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slider_scaling() {
        let config = ArmatureConfig::default();
        assert_eq!(config.quat_to_slider(0.5), 500.0);
        assert!((config.slider_to_quat(250.0) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_zero_scale_passthrough() {
        let config = ArmatureConfig {
            quat_slider_scale: 0.0,
            ..ArmatureConfig::default()
        };
        assert_eq!(config.slider_to_quat(0.3), 0.3);
    }
}
