//! 矩阵/变换工具
//!
//! 骨骼使用 Y 轴从头部指向尾部的局部坐标系，世界坐标系 Y 轴向上。
//! 所有矩阵为列主序，`a * b` 即先应用 b 再应用 a。

use std::f64::consts::PI;

use glam::{DMat3, DMat4, DQuat, DVec3};

/// 数值比较默认容差
pub const EPSILON: f64 = 1e-6;

/// 骨骼方向与参考轴（Y）平行的判定容差
const PARALLEL_TOLERANCE: f64 = 1e-12;

/// 骨骼最短长度，低于此值视为零长度
const MIN_BONE_LENGTH: f64 = 1e-9;

/// 坐标轴
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn unit(self) -> DVec3 {
        match self {
            Axis::X => DVec3::X,
            Axis::Y => DVec3::Y,
            Axis::Z => DVec3::Z,
        }
    }
}

/// 欧拉角轴顺序（静态世界坐标系，按应用先后排列）
///
/// `XYZ` 表示先绕世界 X、再绕世界 Y、最后绕世界 Z 旋转，
/// 即 `R = Rz · Ry · Rx`；`ZYX` 为其逆序。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EulerOrder([Axis; 3]);

impl EulerOrder {
    pub const XYZ: Self = Self([Axis::X, Axis::Y, Axis::Z]);
    pub const ZYX: Self = Self([Axis::Z, Axis::Y, Axis::X]);

    /// 三个轴必须互不相同
    pub fn new(first: Axis, second: Axis, third: Axis) -> Option<Self> {
        if first == second || second == third || first == third {
            return None;
        }
        Some(Self([first, second, third]))
    }

    /// 解析 "XYZ" / "zxy" 之类的字符串
    pub fn parse(text: &str) -> Option<Self> {
        let axes: Vec<Axis> = text
            .chars()
            .map(|c| match c.to_ascii_uppercase() {
                'X' => Some(Axis::X),
                'Y' => Some(Axis::Y),
                'Z' => Some(Axis::Z),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()?;
        if axes.len() != 3 {
            return None;
        }
        Self::new(axes[0], axes[1], axes[2])
    }

    pub fn axes(self) -> [Axis; 3] {
        self.0
    }

    /// 指定轴在顺序中的位置
    pub fn position(self, axis: Axis) -> usize {
        self.0.iter().position(|&a| a == axis).unwrap_or(0)
    }

    /// 逆循环顺序（XZY、YXZ、ZYX）需要对角度取反
    fn is_anticyclic(self) -> bool {
        (self.0[0].index() + 1) % 3 != self.0[1].index()
    }
}

impl Default for EulerOrder {
    fn default() -> Self {
        Self::XYZ
    }
}

/// 由头尾点和扭转角构建静止矩阵
///
/// 返回 `(长度, 矩阵)`：矩阵局部 Y 轴从 head 指向 tail，绕 Y 扭转 roll，平移为 head。
/// 头尾重合时返回 None。
pub fn rest_matrix(head: DVec3, tail: DVec3, roll: f64) -> Option<(f64, DMat4)> {
    let vector = tail - head;
    let length = vector.length();
    if !length.is_finite() || length < MIN_BONE_LENGTH {
        return None;
    }
    let direction = vector / length;
    let yproj = direction.y;

    let swing = if yproj >= 1.0 - PARALLEL_TOLERANCE {
        DQuat::IDENTITY
    } else if yproj <= -1.0 + PARALLEL_TOLERANCE {
        // 反向平行时叉积退化，改用固定的垂直轴
        DQuat::from_rotation_x(PI)
    } else {
        let axis = DVec3::Y.cross(direction).normalize();
        DQuat::from_axis_angle(axis, yproj.clamp(-1.0, 1.0).acos())
    };

    let rotation = swing * DQuat::from_rotation_y(roll);
    Some((length, DMat4::from_rotation_translation(rotation, head)))
}

/// 欧拉角 → 旋转矩阵，`angles[n]` 为绕 `order` 第 n 个轴的角度（弧度）
pub fn euler_to_matrix(angles: DVec3, order: EulerOrder) -> DMat3 {
    let [a0, a1, a2] = order.axes();
    DMat3::from_axis_angle(a2.unit(), angles[2])
        * DMat3::from_axis_angle(a1.unit(), angles[1])
        * DMat3::from_axis_angle(a0.unit(), angles[0])
}

/// 旋转矩阵 → 欧拉角，与 [`euler_to_matrix`] 互逆
pub fn matrix_to_euler(matrix: &DMat3, order: EulerOrder) -> DVec3 {
    let [ai, aj, ak] = order.axes();
    let (i, j, k) = (ai.index(), aj.index(), ak.index());
    let m = |row: usize, col: usize| matrix.col(col)[row];

    let cy = m(i, i).hypot(m(j, i));
    let (mut x, mut y, mut z) = if cy > 4.0 * f64::EPSILON {
        (
            m(k, j).atan2(m(k, k)),
            (-m(k, i)).atan2(cy),
            m(j, i).atan2(m(i, i)),
        )
    } else {
        // 万向节锁：第三个角归零
        ((-m(j, k)).atan2(m(j, j)), (-m(k, i)).atan2(cy), 0.0)
    };

    if order.is_anticyclic() {
        x = -x;
        y = -y;
        z = -z;
    }
    DVec3::new(x, y, z)
}

/// 四元数 → 旋转矩阵，零四元数返回单位矩阵
pub fn quat_to_matrix(quat: DQuat) -> DMat3 {
    let length = quat.length();
    if !length.is_finite() || length < EPSILON {
        return DMat3::IDENTITY;
    }
    DMat3::from_quat(quat / length)
}

/// 旋转矩阵 → 四元数（规范化为 w >= 0）
pub fn matrix_to_quat(matrix: &DMat3) -> DQuat {
    canonical(DQuat::from_mat3(matrix).normalize())
}

/// 取 w >= 0 的等价四元数
pub fn canonical(quat: DQuat) -> DQuat {
    if quat.w < 0.0 {
        -quat
    } else {
        quat
    }
}

/// 由三个自由分量重建 w：`sign(w_prev) * sqrt(max(0, 1 - x² - y² - z²))`
///
/// 若 x、y、z 已超出单位球，则缩放回单位长度且 w 取 0。
pub fn normalize_quat_w(w_prev: f64, x: f64, y: f64, z: f64) -> DQuat {
    let r2 = x * x + y * y + z * z;
    if !r2.is_finite() {
        return DQuat::IDENTITY;
    }
    if r2 > 1.0 {
        let scale = 1.0 / r2.sqrt();
        return DQuat::from_xyzw(x * scale, y * scale, z * scale, 0.0);
    }
    let sign = if w_prev >= 0.0 { 1.0 } else { -1.0 };
    DQuat::from_xyzw(x, y, z, sign * (1.0 - r2).max(0.0).sqrt())
}

/// 4x4 矩阵左上 3x3
pub fn rotation_block(matrix: &DMat4) -> DMat3 {
    DMat3::from_mat4(*matrix)
}

/// 替换旋转块，保留平移列
pub fn with_rotation(matrix: &DMat4, rotation: DMat3) -> DMat4 {
    DMat4::from_cols(
        rotation.x_axis.extend(0.0),
        rotation.y_axis.extend(0.0),
        rotation.z_axis.extend(0.0),
        matrix.w_axis,
    )
}

/// 平移分量
pub fn translation(matrix: &DMat4) -> DVec3 {
    matrix.w_axis.truncate()
}

/// 去掉缩放后的纯旋转
pub fn pure_rotation(matrix: &DMat4) -> DQuat {
    let (_, rotation, _) = matrix.to_scale_rotation_translation();
    canonical(rotation.normalize())
}

/// 由旋转矩阵提取绕 Y 轴的扭转角
pub fn roll_from_matrix(matrix: &DMat3) -> f64 {
    let m = |row: usize, col: usize| matrix.col(col)[row];
    let qy = m(0, 2) - m(2, 0);
    let qw = m(0, 0) + m(1, 1) + m(2, 2) + 1.0;
    if qw < 1e-4 {
        PI
    } else {
        2.0 * qy.atan2(qw)
    }
}
