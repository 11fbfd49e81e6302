//! 骨骼节点

use bitflags::bitflags;
use glam::{DMat3, DMat4, DQuat, DVec3};

use super::constraint::Constraint;
use super::math::{self, Axis, EulerOrder};
use crate::{ArmatureError, Result};

bitflags! {
    /// 骨骼标志
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BoneFlags: u32 {
        /// 头部与父骨骼尾部相连
        const CONNECTED = 1 << 0;
        /// 参与蒙皮
        const DEFORM = 1 << 1;
        /// 遵守约束（每帧求解约束列表）
        const RESTRICTED = 1 << 2;
        /// 以线框方式显示（自定义形状）
        const WIRE = 1 << 3;
        /// 旋转锁定，拒绝交互式修改
        const LOCKED = 1 << 4;
    }
}

impl Default for BoneFlags {
    fn default() -> Self {
        BoneFlags::DEFORM | BoneFlags::CONNECTED
    }
}

/// 主层
pub const LAYER_MAIN: u32 = 1;

/// 骨骼节点
///
/// 矩阵含义：
/// - `matrix_rest`：静止矩阵（世界空间）
/// - `matrix_relative`：相对父骨骼静止矩阵的静止矩阵，构建后固定
/// - `matrix_pose`：相对自身静止坐标系的姿态增量
/// - `matrix_global`：应用姿态后的世界矩阵
/// - `matrix_verts`：蒙皮基 = `matrix_global · inverse(matrix_rest)`
#[derive(Clone, Debug)]
pub struct Bone {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,

    pub head: DVec3,
    pub tail: DVec3,
    pub roll: f64,
    pub length: f64,

    pub flags: BoneFlags,
    pub layers: u32,

    pub(crate) constraints: Vec<Constraint>,

    pub(crate) matrix_rest: DMat4,
    pub(crate) matrix_relative: DMat4,
    pub(crate) matrix_pose: DMat4,
    pub(crate) matrix_global: DMat4,
    pub(crate) matrix_verts: DMat4,
}

impl Bone {
    pub fn new(name: impl Into<String>, head: DVec3, tail: DVec3, roll: f64) -> Self {
        Self {
            name: name.into(),
            parent: None,
            children: Vec::new(),
            head,
            tail,
            roll,
            length: 0.0,
            flags: BoneFlags::default(),
            layers: LAYER_MAIN,
            constraints: Vec::new(),
            matrix_rest: DMat4::IDENTITY,
            matrix_relative: DMat4::IDENTITY,
            matrix_pose: DMat4::IDENTITY,
            matrix_global: DMat4::IDENTITY,
            matrix_verts: DMat4::IDENTITY,
        }
    }

    /// 首次构建：姿态归零并计算静止矩阵
    ///
    /// 父骨骼必须已构建。
    pub fn build(&mut self, parent: Option<&Bone>) -> Result<()> {
        self.matrix_pose = DMat4::IDENTITY;
        self.build_rest(parent)
    }

    /// 头尾改变后重建静止几何，保留当前姿态
    pub fn rebuild(&mut self, head: DVec3, tail: DVec3, parent: Option<&Bone>) -> Result<()> {
        self.head = head;
        self.tail = tail;
        self.build_rest(parent)
    }

    fn build_rest(&mut self, parent: Option<&Bone>) -> Result<()> {
        let (length, rest) = math::rest_matrix(self.head, self.tail, self.roll)
            .ok_or_else(|| ArmatureError::ZeroLengthBone(self.name.clone()))?;
        self.length = length;
        self.matrix_rest = rest;

        match parent {
            Some(parent) => {
                self.matrix_relative = parent.matrix_rest.inverse() * rest;
                self.matrix_global = parent.matrix_global * self.matrix_relative;
            }
            None => {
                self.matrix_relative = rest;
                self.matrix_global = rest;
            }
        }
        self.update_skinning_basis();
        Ok(())
    }

    /// 由父骨骼全局矩阵和姿态重新计算全局矩阵
    pub fn update_global(&mut self, parent_global: Option<DMat4>) {
        let local = self.matrix_relative * self.matrix_pose;
        self.matrix_global = match parent_global {
            Some(parent) => parent * local,
            None => local,
        };
    }

    /// 静止显示：全局矩阵直接取静止矩阵
    pub(crate) fn show_rest(&mut self) {
        self.matrix_global = self.matrix_rest;
        self.matrix_verts = DMat4::IDENTITY;
    }

    /// 蒙皮基 = 全局 · 静止逆
    pub fn compute_skinning_basis(&self) -> DMat4 {
        self.matrix_global * self.matrix_rest.inverse()
    }

    pub(crate) fn update_skinning_basis(&mut self) {
        self.matrix_verts = self.compute_skinning_basis();
    }

    /// 由当前全局矩阵反推姿态：`inverse(relative) · inverse(parent_global) · global`
    ///
    /// 调用方需保证父骨骼的全局矩阵在读取与写回之间没有变化。
    pub fn pose_from_global(&self, parent_global: Option<DMat4>) -> DMat4 {
        let relative_inv = self.matrix_relative.inverse();
        match parent_global {
            Some(parent) => relative_inv * parent.inverse() * self.matrix_global,
            None => relative_inv * self.matrix_global,
        }
    }

    /// 姿态归零
    pub fn zero_transformation(&mut self) {
        self.matrix_pose = DMat4::IDENTITY;
    }

    /// 修改姿态旋转的单个分量
    ///
    /// `as_quat` 为真时 `value` 是四元数分量（x/y/z），w 按原符号重建；
    /// 否则 `value` 是绕 `axis` 的欧拉角（弧度，按 `order` 分解）。
    /// 返回修改后的四元数 w，供滑块反馈。
    pub fn set_rotation(&mut self, axis: Axis, value: f64, as_quat: bool, order: EulerOrder) -> f64 {
        let current = math::rotation_block(&self.matrix_pose);
        let quat = if as_quat {
            let q = math::matrix_to_quat(&current);
            let mut xyz = DVec3::new(q.x, q.y, q.z);
            xyz[axis.index()] = value;
            math::normalize_quat_w(q.w, xyz.x, xyz.y, xyz.z)
        } else {
            let mut angles = math::matrix_to_euler(&current, order);
            angles[order.position(axis)] = value;
            math::matrix_to_quat(&math::euler_to_matrix(angles, order))
        };
        self.set_pose_rotation(quat);
        quat.w
    }

    /// 增量旋转（角度制）
    ///
    /// `world` 为真时左乘到全局矩阵后反推姿态（需要父骨骼全局矩阵为最新），
    /// 否则直接左乘到姿态矩阵。
    pub fn rotate(&mut self, angle_degrees: f64, axis: Axis, world: bool, parent_global: Option<DMat4>) {
        let rotation = DMat3::from_axis_angle(axis.unit(), angle_degrees.to_radians());
        if world {
            let global = rotation * math::rotation_block(&self.matrix_global);
            self.matrix_global = math::with_rotation(&self.matrix_global, global);
            self.matrix_pose = self.pose_from_global(parent_global);
        } else {
            let pose = rotation * math::rotation_block(&self.matrix_pose);
            self.matrix_pose = math::with_rotation(&self.matrix_pose, pose);
        }
    }

    /// 设置姿态旋转，保留姿态平移
    pub fn set_pose_rotation(&mut self, rotation: DQuat) {
        self.matrix_pose = math::with_rotation(&self.matrix_pose, math::quat_to_matrix(rotation));
    }

    /// 设置姿态平移，保留姿态旋转
    pub fn set_pose_translation(&mut self, translation: DVec3) {
        self.matrix_pose.w_axis = translation.extend(1.0);
    }

    pub fn set_pose_euler(&mut self, angles: DVec3, order: EulerOrder) {
        let rotation = math::euler_to_matrix(angles, order);
        self.matrix_pose = math::with_rotation(&self.matrix_pose, rotation);
    }

    pub fn pose_quaternion(&self) -> DQuat {
        math::matrix_to_quat(&math::rotation_block(&self.matrix_pose))
    }

    pub fn pose_euler(&self, order: EulerOrder) -> DVec3 {
        math::matrix_to_euler(&math::rotation_block(&self.matrix_pose), order)
    }

    /// 当前（姿态后）头部位置
    pub fn head_position(&self) -> DVec3 {
        math::translation(&self.matrix_global)
    }

    /// 当前（姿态后）尾部位置，拉伸缩放会体现在这里
    pub fn tail_position(&self) -> DVec3 {
        self.matrix_global.transform_point3(DVec3::Y * self.length)
    }

    /// 静止矩阵中的扭转角
    pub fn rest_roll(&self) -> f64 {
        match math::rest_matrix(self.head, self.tail, 0.0) {
            Some((_, plain)) => {
                let relative = math::rotation_block(&plain).transpose() * math::rotation_block(&self.matrix_rest);
                math::roll_from_matrix(&relative)
            }
            None => 0.0,
        }
    }

    pub fn is_deform(&self) -> bool {
        self.flags.contains(BoneFlags::DEFORM)
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(BoneFlags::LOCKED)
    }

    pub fn respects_constraints(&self) -> bool {
        self.flags.contains(BoneFlags::RESTRICTED)
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn matrix_rest(&self) -> DMat4 {
        self.matrix_rest
    }

    pub fn matrix_relative(&self) -> DMat4 {
        self.matrix_relative
    }

    pub fn matrix_pose(&self) -> DMat4 {
        self.matrix_pose
    }

    pub fn matrix_global(&self) -> DMat4 {
        self.matrix_global
    }

    pub fn matrix_verts(&self) -> DMat4 {
        self.matrix_verts
    }

    pub(crate) fn set_matrix_pose(&mut self, pose: DMat4) {
        self.matrix_pose = pose;
    }

    pub(crate) fn set_matrix_global(&mut self, global: DMat4) {
        self.matrix_global = global;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    fn built(name: &str, head: DVec3, tail: DVec3, parent: Option<&Bone>) -> Bone {
        let mut bone = Bone::new(name, head, tail, 0.0);
        bone.build(parent).unwrap();
        bone
    }

    #[test]
    fn test_zero_length_bone_is_error() {
        let mut bone = Bone::new("Bad", DVec3::ONE, DVec3::ONE, 0.0);
        match bone.build(None) {
            Err(ArmatureError::ZeroLengthBone(name)) => assert_eq!(name, "Bad"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_build_child_relative() {
        let root = built("Root", DVec3::ZERO, DVec3::Y, None);
        let child = built("Child", DVec3::Y, DVec3::new(0.0, 1.0, 1.0), Some(&root));
        assert!((root.matrix_global * child.matrix_relative).abs_diff_eq(child.matrix_rest, 1e-12));
        assert!(child.matrix_verts.abs_diff_eq(DMat4::IDENTITY, 1e-12));
        assert!(child.tail_position().abs_diff_eq(DVec3::new(0.0, 1.0, 1.0), 1e-12));
    }

    #[test]
    fn test_set_rotation_quaternion_component() {
        let mut bone = built("B", DVec3::ZERO, DVec3::Y, None);
        let w = bone.set_rotation(Axis::X, 0.6, true, EulerOrder::XYZ);
        assert!((w - 0.8).abs() < 1e-12);
        let q = bone.pose_quaternion();
        assert!(q.abs_diff_eq(DQuat::from_xyzw(0.6, 0.0, 0.0, 0.8), 1e-12));
    }

    #[test]
    fn test_set_rotation_euler_component() {
        let mut bone = built("B", DVec3::ZERO, DVec3::Y, None);
        bone.set_rotation(Axis::Y, 0.5, false, EulerOrder::XYZ);
        let w = bone.set_rotation(Axis::Z, 0.25, false, EulerOrder::XYZ);
        let angles = bone.pose_euler(EulerOrder::XYZ);
        assert!(angles.abs_diff_eq(DVec3::new(0.0, 0.5, 0.25), 1e-12));
        assert!((w - bone.pose_quaternion().w).abs() < 1e-12);
    }

    #[test]
    fn test_set_rotation_keeps_pose_translation() {
        let mut bone = built("B", DVec3::ZERO, DVec3::Y, None);
        bone.set_pose_translation(DVec3::new(1.0, 2.0, 3.0));
        bone.set_rotation(Axis::X, 0.3, false, EulerOrder::XYZ);
        assert_eq!(math::translation(&bone.matrix_pose), DVec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_rotate_local() {
        let mut bone = built("B", DVec3::ZERO, DVec3::Y, None);
        bone.rotate(90.0, Axis::X, false, None);
        bone.update_global(None);
        assert!(bone.tail_position().abs_diff_eq(DVec3::Z, 1e-12));
    }

    #[test]
    fn test_rotate_world_matches_pose() {
        let root = built("Root", DVec3::ZERO, DVec3::X, None);
        let mut child = built("Child", DVec3::X, DVec3::new(2.0, 0.0, 0.0), Some(&root));
        child.rotate(90.0, Axis::Z, true, Some(root.matrix_global));
        let expected = child.matrix_global;
        child.update_global(Some(root.matrix_global));
        assert!(child.matrix_global.abs_diff_eq(expected, 1e-12));
        // 世界 Z 轴旋转 90°：X 方向的骨骼指向 Y
        assert!(child.tail_position().abs_diff_eq(DVec3::new(1.0, 1.0, 0.0), 1e-12));
    }

    #[test]
    fn test_pose_from_global_inverts_update() {
        let root = built("Root", DVec3::ZERO, DVec3::Y, None);
        let mut child = built("Child", DVec3::Y, DVec3::new(1.0, 2.0, 0.0), Some(&root));
        child.set_pose_euler(DVec3::new(0.2, -0.4, 0.9), EulerOrder::XYZ);
        child.update_global(Some(root.matrix_global));
        let pose = child.pose_from_global(Some(root.matrix_global));
        assert!(pose.abs_diff_eq(child.matrix_pose, 1e-12));
    }

    #[test]
    fn test_zero_transformation() {
        let mut bone = built("B", DVec3::ZERO, DVec3::Y, None);
        bone.rotate(45.0, Axis::Y, false, None);
        bone.zero_transformation();
        assert_eq!(bone.matrix_pose, DMat4::IDENTITY);
    }

    #[test]
    fn test_rest_roll_recovered() {
        let mut bone = Bone::new("B", DVec3::ZERO, DVec3::new(0.0, 0.0, 1.0), 0.35);
        bone.build(None).unwrap();
        assert!((bone.rest_roll() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_default_flags() {
        let bone = Bone::new("B", DVec3::ZERO, DVec3::Y, FRAC_PI_2);
        assert!(bone.is_deform());
        assert!(!bone.is_locked());
        assert!(!bone.respects_constraints());
        assert_eq!(bone.layers, LAYER_MAIN);
    }
}
