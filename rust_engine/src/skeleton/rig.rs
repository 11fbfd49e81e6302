//! 骨架定义（由外部装配文件读取器解析后交给 Armature）

use std::collections::HashMap;

use glam::DVec3;

use super::bone::{BoneFlags, LAYER_MAIN};
use super::constraint::{Constraint, CopySettings, Point};
use super::math::EulerOrder;
use crate::{ArmatureError, Result};

/// 骨骼头/尾点
#[derive(Clone, Debug, PartialEq)]
pub enum BonePoint {
    /// 固定坐标
    Fixed(DVec3),
    /// 一组网格顶点的平均位置加偏移，网格变形后随之移动
    Joint { verts: Vec<usize>, offset: DVec3 },
}

impl From<DVec3> for BonePoint {
    fn from(point: DVec3) -> Self {
        BonePoint::Fixed(point)
    }
}

impl BonePoint {
    pub fn joint(verts: Vec<usize>) -> Self {
        BonePoint::Joint {
            verts,
            offset: DVec3::ZERO,
        }
    }

    /// 按当前基础坐标求值
    pub fn resolve(&self, bone: &str, coords: &[DVec3]) -> Result<DVec3> {
        match self {
            BonePoint::Fixed(point) => Ok(*point),
            BonePoint::Joint { verts, offset } => {
                if verts.is_empty() {
                    return Err(ArmatureError::InvalidJoint {
                        bone: bone.to_string(),
                        reason: "empty vertex list".to_string(),
                    });
                }
                let mut sum = DVec3::ZERO;
                for &v in verts {
                    let co = coords.get(v).ok_or(ArmatureError::VertexOutOfRange {
                        vertex: v,
                        count: coords.len(),
                    })?;
                    sum += *co;
                }
                Ok(sum / verts.len() as f64 + *offset)
            }
        }
    }
}

/// 自定义显示形状
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeKind {
    Circle,
    Box,
}

/// 骨骼选项
#[derive(Clone, Debug, PartialEq)]
pub enum RigOption {
    /// `-nc`
    NotConnected,
    /// `-nd`
    NotDeform,
    /// `-res`
    Restricted,
    /// `-lock`
    Locked,
    /// `-circ N` / `-box N`
    Shape { kind: ShapeKind, size: u32 },
    /// `-layers MASK`
    Layers(u32),
    /// `-ik GOAL`
    Ik { goal: String },
    /// `-pt POLE [ANGLE]`，角度为度
    Pole { target: String, angle: f64 },
}

impl RigOption {
    /// 解析单个选项，未知或格式错误的选项返回 None 并记录警告
    pub fn parse(key: &str, values: &[&str]) -> Option<Self> {
        let option = match key {
            "-nc" => Some(RigOption::NotConnected),
            "-nd" => Some(RigOption::NotDeform),
            "-res" => Some(RigOption::Restricted),
            "-lock" => Some(RigOption::Locked),
            "-circ" | "-box" => values.first().and_then(|v| v.parse().ok()).map(|size| RigOption::Shape {
                kind: if key == "-circ" { ShapeKind::Circle } else { ShapeKind::Box },
                size,
            }),
            "-layers" => values.first().and_then(|v| parse_mask(v)).map(RigOption::Layers),
            "-ik" => values.first().map(|goal| RigOption::Ik { goal: goal.to_string() }),
            "-pt" => values.first().and_then(|target| {
                let angle = match values.get(1) {
                    Some(a) => a.parse().ok()?,
                    None => 0.0,
                };
                Some(RigOption::Pole {
                    target: target.to_string(),
                    angle,
                })
            }),
            _ => None,
        };
        if option.is_none() {
            log::warn!("忽略骨骼选项: {} {:?}", key, values);
        }
        option
    }

    /// 解析 `(key, values)` 序列
    pub fn parse_all<'a, I, V>(pairs: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (&'a str, V)>,
        V: AsRef<[&'a str]>,
    {
        pairs
            .into_iter()
            .filter_map(|(key, values)| Self::parse(key, values.as_ref()))
            .collect()
    }
}

fn parse_mask(text: &str) -> Option<u32> {
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// 约束点引用
#[derive(Clone, Debug, PartialEq)]
pub enum PointRef {
    Head(String),
    Tail(String),
    Fixed(DVec3),
}

/// 复制类约束定义
#[derive(Clone, Debug, PartialEq)]
pub struct CopyDef {
    pub target: String,
    pub axes: [bool; 3],
    pub invert: [bool; 3],
    pub influence: f64,
}

impl CopyDef {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            axes: [true; 3],
            invert: [false; 3],
            influence: 1.0,
        }
    }

    pub fn with_axes(mut self, axes: [bool; 3]) -> Self {
        self.axes = axes;
        self
    }

    pub fn with_invert(mut self, invert: [bool; 3]) -> Self {
        self.invert = invert;
        self
    }

    pub fn with_influence(mut self, influence: f64) -> Self {
        self.influence = influence;
        self
    }
}

/// 约束定义（目标以骨骼名引用）
#[derive(Clone, Debug, PartialEq)]
pub enum ConstraintDef {
    CopyRotation(CopyDef),
    CopyLocation(CopyDef),
    CopyTransform(CopyDef),
    StretchTo {
        target: String,
        stretch: bool,
        preserve_volume: bool,
        influence: f64,
    },
    RotationLimit {
        limits: [Option<(f64, f64)>; 3],
        influence: f64,
    },
    PoleTarget {
        goal: PointRef,
        pole: PointRef,
        pole_angle: f64,
        influence: f64,
    },
}

impl ConstraintDef {
    /// 按名称表解析为运行时约束
    pub fn resolve(&self, owner: &str, lookup: &HashMap<String, usize>, order: EulerOrder) -> Result<Constraint> {
        let index = |target: &str| {
            lookup
                .get(target)
                .copied()
                .ok_or_else(|| ArmatureError::UnknownConstraintTarget {
                    bone: owner.to_string(),
                    target: target.to_string(),
                })
        };
        let point = |p: &PointRef| -> Result<Point> {
            Ok(match p {
                PointRef::Head(name) => Point::Head(index(name)?),
                PointRef::Tail(name) => Point::Tail(index(name)?),
                PointRef::Fixed(v) => Point::Fixed(*v),
            })
        };
        let copy = |def: &CopyDef| -> Result<CopySettings> {
            Ok(CopySettings {
                target: index(&def.target)?,
                axes: def.axes,
                invert: def.invert,
                influence: def.influence.clamp(0.0, 1.0),
            })
        };

        Ok(match self {
            ConstraintDef::CopyRotation(def) => Constraint::CopyRotation(copy(def)?),
            ConstraintDef::CopyLocation(def) => Constraint::CopyLocation(copy(def)?),
            ConstraintDef::CopyTransform(def) => Constraint::CopyTransform(copy(def)?),
            ConstraintDef::StretchTo {
                target,
                stretch,
                preserve_volume,
                influence,
            } => Constraint::StretchTo {
                target: index(target)?,
                stretch: *stretch,
                preserve_volume: *preserve_volume,
                influence: influence.clamp(0.0, 1.0),
            },
            ConstraintDef::RotationLimit { limits, influence } => Constraint::RotationLimit {
                limits: *limits,
                order,
                influence: influence.clamp(0.0, 1.0),
            },
            ConstraintDef::PoleTarget {
                goal,
                pole,
                pole_angle,
                influence,
            } => Constraint::PoleTarget {
                goal: point(goal)?,
                pole: point(pole)?,
                pole_angle: *pole_angle,
                influence: influence.clamp(0.0, 1.0),
            },
        })
    }
}

/// 单根骨骼定义：`(name, head, tail, roll, parent|"-", options)`
#[derive(Clone, Debug, PartialEq)]
pub struct BoneDef {
    pub name: String,
    pub head: BonePoint,
    pub tail: BonePoint,
    pub roll: f64,
    pub parent: Option<String>,
    pub options: Vec<RigOption>,
    pub constraints: Vec<ConstraintDef>,
}

impl BoneDef {
    pub fn new(name: impl Into<String>, head: impl Into<BonePoint>, tail: impl Into<BonePoint>, roll: f64) -> Self {
        Self {
            name: name.into(),
            head: head.into(),
            tail: tail.into(),
            roll,
            parent: None,
            options: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// 设置父骨骼，"-" 表示无父骨骼
    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = if parent == "-" { None } else { Some(parent.to_string()) };
        self
    }

    pub fn with_option(mut self, option: RigOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// 由选项得到骨骼标志
    pub fn flags(&self) -> BoneFlags {
        let mut flags = BoneFlags::default();
        for option in &self.options {
            match option {
                RigOption::NotConnected => flags.remove(BoneFlags::CONNECTED),
                RigOption::NotDeform => flags.remove(BoneFlags::DEFORM),
                RigOption::Restricted => flags.insert(BoneFlags::RESTRICTED),
                RigOption::Locked => flags.insert(BoneFlags::LOCKED),
                RigOption::Shape { .. } => flags.insert(BoneFlags::WIRE),
                _ => {}
            }
        }
        if !self.all_constraints().is_empty() {
            flags.insert(BoneFlags::RESTRICTED);
        }
        flags
    }

    pub fn layers(&self) -> u32 {
        self.options
            .iter()
            .rev()
            .find_map(|o| match o {
                RigOption::Layers(mask) => Some(*mask),
                _ => None,
            })
            .unwrap_or(LAYER_MAIN)
    }

    pub fn shape(&self) -> Option<(ShapeKind, u32)> {
        self.options.iter().find_map(|o| match o {
            RigOption::Shape { kind, size } => Some((*kind, *size)),
            _ => None,
        })
    }

    /// 显式约束加上 `-ik`/`-pt` 选项生成的极向约束
    pub fn all_constraints(&self) -> Vec<ConstraintDef> {
        let mut constraints = self.constraints.clone();
        let goal = self.options.iter().find_map(|o| match o {
            RigOption::Ik { goal } => Some(goal.clone()),
            _ => None,
        });
        let pole = self.options.iter().find_map(|o| match o {
            RigOption::Pole { target, angle } => Some((target.clone(), *angle)),
            _ => None,
        });
        match (goal, pole) {
            (Some(goal), Some((pole, angle))) => constraints.push(ConstraintDef::PoleTarget {
                goal: PointRef::Head(goal),
                pole: PointRef::Head(pole),
                pole_angle: angle.to_radians(),
                influence: 1.0,
            }),
            (Some(goal), None) => log::debug!("{}: -ik {} 缺少 -pt，不生成极向约束", self.name, goal),
            _ => {}
        }
        constraints
    }
}

/// 完整骨架定义：骨骼记录 + 顶点权重表
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RigDefinition {
    pub bones: Vec<BoneDef>,
    pub weights: Vec<(String, Vec<(usize, f64)>)>,
}

impl RigDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bone(&mut self, bone: BoneDef) -> &mut Self {
        self.bones.push(bone);
        self
    }

    /// 追加顶点组；同名组会合并
    pub fn add_weights(&mut self, bone: impl Into<String>, weights: Vec<(usize, f64)>) -> &mut Self {
        let bone = bone.into();
        match self.weights.iter_mut().find(|(name, _)| *name == bone) {
            Some((_, existing)) => existing.extend(weights),
            None => self.weights.push((bone, weights)),
        }
        self
    }
}
