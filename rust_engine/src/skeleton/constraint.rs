//! 骨骼约束
//!
//! 约束在骨骼自身的全局矩阵传播完成后求解，只修改拥有者的全局矩阵，
//! 不回写姿态矩阵；因此同一姿态下重复更新结果一致。

use glam::{DMat3, DMat4, DQuat, DVec3};

use super::bone::Bone;
use super::math::{self, EulerOrder};

/// 复制类约束的公共参数
#[derive(Clone, Debug, PartialEq)]
pub struct CopySettings {
    pub target: usize,
    /// 参与复制的轴（X/Y/Z）
    pub axes: [bool; 3],
    /// 取反的轴
    pub invert: [bool; 3],
    /// 影响权重 0..1
    pub influence: f64,
}

impl CopySettings {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            axes: [true; 3],
            invert: [false; 3],
            influence: 1.0,
        }
    }

    fn is_full(&self) -> bool {
        self.axes.iter().all(|&a| a) && !self.invert.iter().any(|&i| i)
    }
}

/// 已解析的约束点
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Point {
    Head(usize),
    Tail(usize),
    Fixed(DVec3),
}

impl Point {
    fn bone(&self) -> Option<usize> {
        match *self {
            Point::Head(i) | Point::Tail(i) => Some(i),
            Point::Fixed(_) => None,
        }
    }

    fn resolve(&self, bones: &[Bone]) -> DVec3 {
        match *self {
            Point::Head(i) => bones[i].head_position(),
            Point::Tail(i) => bones[i].tail_position(),
            Point::Fixed(p) => p,
        }
    }
}

/// 骨骼约束（目标已解析为骨骼索引）
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    CopyRotation(CopySettings),
    CopyLocation(CopySettings),
    CopyTransform(CopySettings),
    /// Y 轴指向目标头部，可选按距离拉伸
    StretchTo {
        target: usize,
        stretch: bool,
        preserve_volume: bool,
        influence: f64,
    },
    /// 局部欧拉角限制，按轴给出 (min, max) 弧度
    RotationLimit {
        limits: [Option<(f64, f64)>; 3],
        order: EulerOrder,
        influence: f64,
    },
    /// 绕自身 Y 轴扭转，使垂直参考向量指向极向目标
    PoleTarget {
        goal: Point,
        pole: Point,
        pole_angle: f64,
        influence: f64,
    },
}

impl Constraint {
    pub fn kind(&self) -> &'static str {
        match self {
            Constraint::CopyRotation(_) => "CopyRotation",
            Constraint::CopyLocation(_) => "CopyLocation",
            Constraint::CopyTransform(_) => "CopyTransform",
            Constraint::StretchTo { .. } => "StretchTo",
            Constraint::RotationLimit { .. } => "RotationLimit",
            Constraint::PoleTarget { .. } => "PoleTarget",
        }
    }

    pub fn influence(&self) -> f64 {
        match self {
            Constraint::CopyRotation(s) | Constraint::CopyLocation(s) | Constraint::CopyTransform(s) => {
                s.influence
            }
            Constraint::StretchTo { influence, .. }
            | Constraint::RotationLimit { influence, .. }
            | Constraint::PoleTarget { influence, .. } => *influence,
        }
    }

    /// 求解前必须已更新的骨骼
    pub fn dependencies(&self) -> Vec<usize> {
        match self {
            Constraint::CopyRotation(s) | Constraint::CopyLocation(s) | Constraint::CopyTransform(s) => {
                vec![s.target]
            }
            Constraint::StretchTo { target, .. } => vec![*target],
            Constraint::RotationLimit { .. } => Vec::new(),
            Constraint::PoleTarget { goal, pole, .. } => goal.bone().into_iter().chain(pole.bone()).collect(),
        }
    }

    /// 求解约束并写入拥有者的全局矩阵
    pub fn apply(&self, owner: usize, bones: &mut [Bone]) {
        let influence = self.influence();
        if influence <= 0.0 {
            return;
        }

        let bone = &bones[owner];
        let current = bone.matrix_global;
        let desired = match self {
            Constraint::CopyRotation(s) => Some(copy_rotation(s, bone, &bones[s.target])),
            Constraint::CopyLocation(s) => Some(copy_location(s, bone, &bones[s.target])),
            Constraint::CopyTransform(s) => Some(copy_transform(s, bone, &bones[s.target])),
            Constraint::StretchTo {
                target,
                stretch,
                preserve_volume,
                ..
            } => stretch_to(bone, bones[*target].head_position(), *stretch, *preserve_volume),
            Constraint::RotationLimit { limits, order, .. } => {
                let parent_global = bone.parent.map(|p| bones[p].matrix_global);
                rotation_limit(bone, parent_global, limits, *order)
            }
            Constraint::PoleTarget {
                goal,
                pole,
                pole_angle,
                ..
            } => pole_target(bone, goal.resolve(bones), pole.resolve(bones), *pole_angle),
        };

        if let Some(desired) = desired {
            bones[owner].set_matrix_global(blend(current, desired, influence));
        }
    }
}

/// 按权重混合两个变换：旋转 slerp，平移与缩放线性插值
pub fn blend(current: DMat4, desired: DMat4, influence: f64) -> DMat4 {
    if influence >= 1.0 {
        return desired;
    }
    if influence <= 0.0 {
        return current;
    }
    let (s0, r0, t0) = current.to_scale_rotation_translation();
    let (s1, r1, t1) = desired.to_scale_rotation_translation();
    DMat4::from_scale_rotation_translation(
        s0.lerp(s1, influence),
        r0.normalize().slerp(r1.normalize(), influence),
        t0.lerp(t1, influence),
    )
}

fn copied_rotation(settings: &CopySettings, own: DQuat, target: DQuat) -> DQuat {
    if settings.is_full() {
        return target;
    }
    let order = EulerOrder::XYZ;
    let mut angles = math::matrix_to_euler(&DMat3::from_quat(own), order);
    let source = math::matrix_to_euler(&DMat3::from_quat(target), order);
    for i in 0..3 {
        if settings.axes[i] {
            angles[i] = if settings.invert[i] { -source[i] } else { source[i] };
        }
    }
    math::matrix_to_quat(&math::euler_to_matrix(angles, order))
}

fn copied_location(settings: &CopySettings, own: DVec3, target: DVec3) -> DVec3 {
    let mut location = own;
    for i in 0..3 {
        if settings.axes[i] {
            location[i] = if settings.invert[i] { -target[i] } else { target[i] };
        }
    }
    location
}

fn copy_rotation(settings: &CopySettings, owner: &Bone, target: &Bone) -> DMat4 {
    let (scale, rotation, translation) = owner.matrix_global.to_scale_rotation_translation();
    let target_rotation = math::pure_rotation(&target.matrix_global);
    let rotation = copied_rotation(settings, rotation.normalize(), target_rotation);
    DMat4::from_scale_rotation_translation(scale, rotation, translation)
}

fn copy_location(settings: &CopySettings, owner: &Bone, target: &Bone) -> DMat4 {
    let mut result = owner.matrix_global;
    let location = copied_location(settings, owner.head_position(), target.head_position());
    result.w_axis = location.extend(1.0);
    result
}

fn copy_transform(settings: &CopySettings, owner: &Bone, target: &Bone) -> DMat4 {
    let (scale, rotation, translation) = owner.matrix_global.to_scale_rotation_translation();
    let (target_scale, target_rotation, target_translation) = target.matrix_global.to_scale_rotation_translation();
    let scale = if settings.axes.iter().all(|&a| a) { target_scale } else { scale };
    DMat4::from_scale_rotation_translation(
        scale,
        copied_rotation(settings, rotation.normalize(), target_rotation.normalize()),
        copied_location(settings, translation, target_translation),
    )
}

fn stretch_to(owner: &Bone, goal: DVec3, stretch: bool, preserve_volume: bool) -> Option<DMat4> {
    let head = owner.head_position();
    let vector = goal - head;
    let distance = vector.length();
    if distance < 1e-9 {
        return None;
    }

    let (mut scale, rotation, _) = owner.matrix_global.to_scale_rotation_translation();
    let rotation = rotation.normalize();
    let current_y = rotation * DVec3::Y;
    let swing = DQuat::from_rotation_arc(current_y, vector / distance);
    let rotation = (swing * rotation).normalize();

    if stretch && owner.length > 1e-9 {
        let stretched = distance / owner.length;
        if preserve_volume && stretched > 0.0 {
            let factor = (scale.y / stretched).abs().sqrt();
            scale.x *= factor;
            scale.z *= factor;
        }
        scale.y = stretched;
    }
    Some(DMat4::from_scale_rotation_translation(scale, rotation, head))
}

fn rotation_limit(
    owner: &Bone,
    parent_global: Option<DMat4>,
    limits: &[Option<(f64, f64)>; 3],
    order: EulerOrder,
) -> Option<DMat4> {
    let pose = owner.pose_from_global(parent_global);
    let (scale, rotation, translation) = pose.to_scale_rotation_translation();
    let mut angles = math::matrix_to_euler(&DMat3::from_quat(rotation.normalize()), order);

    let mut clamped = false;
    for axis in math::Axis::ALL {
        if let Some((min, max)) = limits[axis.index()] {
            let position = order.position(axis);
            let value = angles[position].clamp(min.min(max), max.max(min));
            if value != angles[position] {
                angles[position] = value;
                clamped = true;
            }
        }
    }
    if !clamped {
        return None;
    }

    let rotation = math::matrix_to_quat(&math::euler_to_matrix(angles, order));
    let pose = DMat4::from_scale_rotation_translation(scale, rotation, translation);
    let local = owner.matrix_relative * pose;
    Some(match parent_global {
        Some(parent) => parent * local,
        None => local,
    })
}

fn pole_target(owner: &Bone, goal: DVec3, pole: DVec3, pole_angle: f64) -> Option<DMat4> {
    let head = owner.head_position();
    let yvec = goal - head;
    let yy = yvec.dot(yvec);
    if yy < 1e-12 {
        return None;
    }
    let mut xvec = pole - head;
    xvec -= yvec * (xvec.dot(yvec) / yy);
    let xlen = xvec.length();
    if xlen <= 1e-6 {
        return None;
    }
    let xvec = xvec / xlen;

    let zvec = owner.matrix_global.z_axis.truncate().normalize_or_zero();
    if zvec == DVec3::ZERO {
        return None;
    }
    let angle0 = xvec.dot(zvec).clamp(-1.0, 1.0).asin();
    let twist = DMat3::from_rotation_y(pole_angle - angle0);
    let rotation = math::rotation_block(&owner.matrix_global) * twist;
    Some(math::with_rotation(&owner.matrix_global, rotation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::math::Axis;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

    fn root(name: &str, head: DVec3, tail: DVec3) -> Bone {
        let mut bone = Bone::new(name, head, tail, 0.0);
        bone.build(None).unwrap();
        bone
    }

    fn effective_pose(bone: &Bone) -> DMat4 {
        bone.pose_from_global(None)
    }

    #[test]
    fn test_copy_rotation_half_influence() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("B", DVec3::new(2.0, 0.0, 0.0), DVec3::new(2.0, 1.0, 0.0)),
        ];
        bones[1].rotate(90.0, Axis::X, false, None);
        bones[1].update_global(None);
        bones[0].update_global(None);

        let constraint = Constraint::CopyRotation(CopySettings {
            influence: 0.5,
            ..CopySettings::new(1)
        });
        constraint.apply(0, &mut bones);

        let pose = effective_pose(&bones[0]);
        let expected = DMat4::from_rotation_x(FRAC_PI_4);
        assert!(pose.abs_diff_eq(expected, 1e-9));
        // 位置不受旋转复制影响
        assert!(bones[0].head_position().abs_diff_eq(DVec3::ZERO, 1e-12));
    }

    #[test]
    fn test_copy_rotation_single_axis_inverted() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("B", DVec3::X, DVec3::new(1.0, 1.0, 0.0)),
        ];
        bones[1].set_pose_euler(DVec3::new(0.3, 0.2, 0.0), EulerOrder::XYZ);
        bones[1].update_global(None);

        let constraint = Constraint::CopyRotation(CopySettings {
            axes: [false, true, false],
            invert: [false, true, false],
            ..CopySettings::new(1)
        });
        constraint.apply(0, &mut bones);

        let angles = math::matrix_to_euler(&math::rotation_block(&bones[0].matrix_global), EulerOrder::XYZ);
        assert!(angles.abs_diff_eq(DVec3::new(0.0, -0.2, 0.0), 1e-9));
    }

    #[test]
    fn test_copy_location_masked() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("B", DVec3::new(1.0, 2.0, 3.0), DVec3::new(1.0, 3.0, 3.0)),
        ];
        let constraint = Constraint::CopyLocation(CopySettings {
            axes: [true, false, true],
            invert: [false, false, true],
            ..CopySettings::new(1)
        });
        constraint.apply(0, &mut bones);
        assert!(bones[0].head_position().abs_diff_eq(DVec3::new(1.0, 0.0, -3.0), 1e-12));
    }

    #[test]
    fn test_copy_location_lerp() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("B", DVec3::new(4.0, 0.0, 0.0), DVec3::new(4.0, 1.0, 0.0)),
        ];
        let constraint = Constraint::CopyLocation(CopySettings {
            influence: 0.25,
            ..CopySettings::new(1)
        });
        constraint.apply(0, &mut bones);
        assert!(bones[0].head_position().abs_diff_eq(DVec3::new(1.0, 0.0, 0.0), 1e-12));
    }

    #[test]
    fn test_copy_transform() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("B", DVec3::new(0.0, 0.0, 5.0), DVec3::new(1.0, 0.0, 5.0)),
        ];
        let constraint = Constraint::CopyTransform(CopySettings::new(1));
        constraint.apply(0, &mut bones);
        assert!(bones[0].matrix_global.abs_diff_eq(bones[1].matrix_global, 1e-9));
    }

    #[test]
    fn test_stretch_to_reaches_target() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("T", DVec3::new(3.0, 0.0, 0.0), DVec3::new(3.0, 1.0, 0.0)),
        ];
        let constraint = Constraint::StretchTo {
            target: 1,
            stretch: true,
            preserve_volume: true,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);
        assert!(bones[0].tail_position().abs_diff_eq(DVec3::new(3.0, 0.0, 0.0), 1e-9));
        let (scale, _, _) = bones[0].matrix_global.to_scale_rotation_translation();
        assert!((scale.x * scale.y * scale.z - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stretch_to_without_stretch_keeps_length() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("T", DVec3::new(0.0, 0.0, 4.0), DVec3::new(0.0, 1.0, 4.0)),
        ];
        let constraint = Constraint::StretchTo {
            target: 1,
            stretch: false,
            preserve_volume: false,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);
        assert!(bones[0].tail_position().abs_diff_eq(DVec3::Z, 1e-9));
    }

    #[test]
    fn test_stretch_to_coincident_target_is_noop() {
        let mut bones = vec![
            root("A", DVec3::ZERO, DVec3::Y),
            root("T", DVec3::ZERO, DVec3::X),
        ];
        let before = bones[0].matrix_global;
        let constraint = Constraint::StretchTo {
            target: 1,
            stretch: true,
            preserve_volume: false,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);
        assert_eq!(bones[0].matrix_global, before);
    }

    #[test]
    fn test_rotation_limit_clamps_local_euler() {
        let mut bones = vec![root("A", DVec3::ZERO, DVec3::Y)];
        bones[0].set_pose_euler(DVec3::new(1.2, 0.1, -0.9), EulerOrder::XYZ);
        bones[0].update_global(None);
        let constraint = Constraint::RotationLimit {
            limits: [Some((-0.5, 0.5)), None, Some((-0.2, 0.2))],
            order: EulerOrder::XYZ,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);
        let pose = effective_pose(&bones[0]);
        let angles = math::matrix_to_euler(&math::rotation_block(&pose), EulerOrder::XYZ);
        assert!(angles.abs_diff_eq(DVec3::new(0.5, 0.1, -0.2), 1e-9));
        // 姿态矩阵本身不被约束修改
        assert!(bones[0].pose_euler(EulerOrder::XYZ).abs_diff_eq(DVec3::new(1.2, 0.1, -0.9), 1e-9));
    }

    #[test]
    fn test_rotation_limit_inside_range_untouched() {
        let mut bones = vec![root("A", DVec3::ZERO, DVec3::Y)];
        bones[0].set_pose_euler(DVec3::new(0.1, 0.0, 0.0), EulerOrder::XYZ);
        bones[0].update_global(None);
        let before = bones[0].matrix_global;
        let constraint = Constraint::RotationLimit {
            limits: [Some((-0.5, 0.5)); 3],
            order: EulerOrder::XYZ,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);
        assert_eq!(bones[0].matrix_global, before);
    }

    #[test]
    fn test_pole_target_aligns_reference_vector() {
        let mut bones = vec![root("Arm", DVec3::ZERO, DVec3::Y)];
        let pole_angle = 0.3;
        let constraint = Constraint::PoleTarget {
            goal: Point::Fixed(DVec3::new(0.0, 2.0, 0.0)),
            pole: Point::Fixed(DVec3::new(1.0, 1.0, 1.0)),
            pole_angle,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);

        let global = bones[0].matrix_global;
        let x = DVec3::new(1.0, 0.0, 1.0).normalize();
        let z = global.z_axis.truncate().normalize();
        assert!((x.dot(z) - pole_angle.sin()).abs() < 1e-9);
        // Y 轴不变
        assert!(global.y_axis.truncate().abs_diff_eq(DVec3::Y, 1e-12));
    }

    #[test]
    fn test_pole_target_degenerate_pole_is_noop() {
        let mut bones = vec![root("Arm", DVec3::ZERO, DVec3::Y)];
        let before = bones[0].matrix_global;
        let constraint = Constraint::PoleTarget {
            goal: Point::Fixed(DVec3::new(0.0, 2.0, 0.0)),
            pole: Point::Fixed(DVec3::new(0.0, 5.0, 0.0)),
            pole_angle: 0.0,
            influence: 1.0,
        };
        constraint.apply(0, &mut bones);
        assert_eq!(bones[0].matrix_global, before);
    }

    #[test]
    fn test_blend_is_rigid() {
        let a = DMat4::IDENTITY;
        let b = DMat4::from_rotation_translation(DQuat::from_rotation_z(FRAC_PI_2), DVec3::new(2.0, 0.0, 0.0));
        let mid = blend(a, b, 0.5);
        let (scale, rotation, translation) = mid.to_scale_rotation_translation();
        assert!(scale.abs_diff_eq(DVec3::ONE, 1e-12));
        assert!(rotation.abs_diff_eq(DQuat::from_rotation_z(FRAC_PI_4), 1e-12));
        assert!(translation.abs_diff_eq(DVec3::X, 1e-12));
    }

    #[test]
    fn test_dependencies() {
        let c = Constraint::PoleTarget {
            goal: Point::Tail(3),
            pole: Point::Fixed(DVec3::ZERO),
            pole_angle: 0.0,
            influence: 1.0,
        };
        assert_eq!(c.dependencies(), vec![3]);
        assert_eq!(Constraint::CopyLocation(CopySettings::new(7)).dependencies(), vec![7]);
        assert_eq!(c.kind(), "PoleTarget");
    }
}
