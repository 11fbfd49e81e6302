//! 骨架：骨骼表、权重表、静止坐标和每帧更新
//!
//! 更新顺序：按求值顺序（父骨骼与约束目标在前）传播全局矩阵并求解约束 →
//! 计算蒙皮基 → 蒙皮 → 通知依附网格。

use std::collections::HashMap;
use std::path::Path;

use glam::{DMat4, DQuat, DVec3, DVec4};

use super::bone::Bone;
use super::math::{self, Axis};
use super::rig::{BoneDef, RigDefinition, ShapeKind};
use crate::animation::{MotionFile, PoseFile, PoseSpace};
use crate::config::ArmatureConfig;
use crate::model::DependentMesh;
use crate::morph::RestModifier;
use crate::skinning::{
    compute_skinning, normalize_weights, BoneWeights, SkinningInput, SkinningResolver, WeightGroup,
};
use crate::{ArmatureError, Result};

/// 全部骨骼姿态的快照
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseSnapshot {
    poses: HashMap<String, DMat4>,
}

impl PoseSnapshot {
    pub fn get(&self, bone: &str) -> Option<DMat4> {
        self.poses.get(bone).copied()
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }
}

/// 姿态/动作应用结果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoseReport {
    pub applied: usize,
    pub skipped: usize,
}

/// 滑块显示值
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotationReadout {
    /// 四元数 (w, x, y, z) × 滑块缩放
    pub quat: [f64; 4],
    /// 欧拉角（度），按配置的轴顺序
    pub euler_degrees: DVec3,
}

/// 姿态骨架
pub struct Armature {
    config: ArmatureConfig,
    definition: RigDefinition,
    /// 骨骼索引 → 定义索引
    def_index: Vec<usize>,

    bones: Vec<Bone>,
    name_to_index: HashMap<String, usize>,
    roots: Vec<usize>,
    eval_order: Vec<usize>,

    base_coords: Vec<DVec3>,
    rest_coords: Vec<DVec4>,
    bone_weights: Vec<BoneWeights>,
    resolver: SkinningResolver,
    coords: Vec<DVec3>,

    rest_position: bool,
    visible_layers: u32,
    modifier: Option<Box<dyn RestModifier>>,
    dependents: Vec<Box<dyn DependentMesh>>,
}

impl Armature {
    /// 由骨架定义和基础网格坐标构建骨架
    ///
    /// 配置错误（重复骨骼、缺失父骨骼、零长度骨骼、约束循环等）直接返回，不产生半成品。
    pub fn build(definition: RigDefinition, base_coords: Vec<DVec3>, config: ArmatureConfig) -> Result<Self> {
        let def_index = parents_first(&definition.bones)?;

        let mut name_to_index = HashMap::with_capacity(def_index.len());
        for (i, &d) in def_index.iter().enumerate() {
            name_to_index.insert(definition.bones[d].name.clone(), i);
        }

        let mut bones = Vec::with_capacity(def_index.len());
        let mut roots = Vec::new();
        for (i, &d) in def_index.iter().enumerate() {
            let def = &definition.bones[d];
            let (head, tail) = resolve_points(def, &base_coords)?;
            let mut bone = Bone::new(def.name.clone(), head, tail, def.roll);
            bone.flags = def.flags();
            bone.layers = def.layers();
            bone.parent = def.parent.as_ref().and_then(|p| name_to_index.get(p).copied());
            match bone.parent {
                Some(p) => bones_children(&mut bones, p, i),
                None => roots.push(i),
            }
            bones.push(bone);
        }
        build_rest(&mut bones, None)?;

        for (i, &d) in def_index.iter().enumerate() {
            let def = &definition.bones[d];
            let constraints = def
                .all_constraints()
                .iter()
                .map(|c| c.resolve(&def.name, &name_to_index, config.euler_order))
                .collect::<Result<Vec<_>>>()?;
            bones[i].constraints = constraints;
        }
        let eval_order = evaluation_order(&bones)?;

        let bone_weights = bone_weights(&definition, &bones, &name_to_index, base_coords.len())?;
        let resolver = SkinningResolver::new(&bone_weights, base_coords.len());

        let visible_layers = config.visible_layers;
        let mut armature = Self {
            config,
            definition,
            def_index,
            bones,
            name_to_index,
            roots,
            eval_order,
            base_coords,
            rest_coords: Vec::new(),
            bone_weights,
            resolver,
            coords: Vec::new(),
            rest_position: false,
            visible_layers,
            modifier: None,
            dependents: Vec::new(),
        };

        log::info!(
            "骨架构建完成: {} 根骨骼 ({} 个根), {} 个顶点, {} 根变形骨骼",
            armature.bones.len(),
            armature.roots.len(),
            armature.base_coords.len(),
            armature.bone_weights.iter().filter(|w| !w.is_empty()).count()
        );
        if armature.config.debug_log {
            for bone in &armature.bones {
                log::debug!(
                    "  {} parent={:?} head={:?} tail={:?} length={:.4} flags={:?} constraints={}",
                    bone.name,
                    bone.parent.map(|p| armature.bones[p].name.as_str()),
                    bone.head,
                    bone.tail,
                    bone.length,
                    bone.flags,
                    bone.constraints.len()
                );
            }
        }

        armature.sync_rest_verts();
        armature.update();
        Ok(armature)
    }

    /// 基础网格变化后重建静止几何和权重，保留姿态
    pub fn rebuild(&mut self, base_coords: Vec<DVec3>) -> Result<()> {
        let mut points = Vec::with_capacity(self.bones.len());
        for &d in &self.def_index {
            points.push(resolve_points(&self.definition.bones[d], &base_coords)?);
        }
        let mut bones = self.bones.clone();
        build_rest(&mut bones, Some(points.as_slice()))?;
        let bone_weights = bone_weights(&self.definition, &bones, &self.name_to_index, base_coords.len())?;

        self.resolver = SkinningResolver::new(&bone_weights, base_coords.len());
        self.bone_weights = bone_weights;
        self.bones = bones;
        self.base_coords = base_coords;
        if let Some(modifier) = self.modifier.as_mut() {
            modifier.invalidate();
        }

        log::info!("骨架重建完成: {} 个顶点", self.base_coords.len());
        self.sync_rest_verts();
        self.update();
        Ok(())
    }

    /// 每帧更新
    pub fn update(&mut self) {
        if self.rest_position {
            for bone in &mut self.bones {
                bone.show_rest();
            }
            self.coords = self.rest_coords.iter().map(|c| c.truncate()).collect();
        } else {
            pose_bones(&mut self.bones, &self.eval_order);
            for bone in &mut self.bones {
                bone.update_skinning_basis();
            }
            let bone_matrices: Vec<DMat4> = self.bones.iter().map(|b| b.matrix_verts).collect();
            let output = compute_skinning(&SkinningInput {
                rest_coords: &self.rest_coords,
                bone_matrices: &bone_matrices,
                resolver: &self.resolver,
                parallel_threshold: self.config.parallel_skinning_threshold,
            });
            self.coords = output.positions;
        }

        for dependent in &mut self.dependents {
            dependent.refit(&self.coords);
        }
        log::trace!(
            "骨架更新: {} 根骨骼, {} 个顶点, {} 个依附网格",
            self.bones.len(),
            self.coords.len(),
            self.dependents.len()
        );
    }

    /// 由基础坐标（经修改器）重新生成静止坐标
    pub fn sync_rest_verts(&mut self) {
        let mut rest = self.base_coords.clone();
        if let Some(modifier) = self.modifier.as_mut() {
            modifier.apply(&self.base_coords, &mut rest);
        }
        self.rest_coords = rest.into_iter().map(|c| c.extend(1.0)).collect();
    }

    pub fn set_modifier(&mut self, modifier: Box<dyn RestModifier>) {
        log::info!("安装静止坐标修改器: {}", modifier.name());
        self.modifier = Some(modifier);
        self.sync_rest_verts();
        self.update();
    }

    pub fn remove_modifier(&mut self) -> Option<Box<dyn RestModifier>> {
        let modifier = self.modifier.take();
        if let Some(m) = &modifier {
            log::info!("移除静止坐标修改器: {}", m.name());
        }
        self.sync_rest_verts();
        self.update();
        modifier
    }

    /// 修改器输入变化后重新应用
    pub fn update_modifier(&mut self) {
        if let Some(modifier) = self.modifier.as_mut() {
            modifier.invalidate();
        }
        self.sync_rest_verts();
        self.update();
    }

    pub fn modifier(&self) -> Option<&dyn RestModifier> {
        self.modifier.as_deref()
    }

    pub fn modifier_mut(&mut self) -> Option<&mut (dyn RestModifier + 'static)> {
        self.modifier.as_deref_mut()
    }

    /// 保存全部姿态并归零
    pub fn store(&mut self) -> PoseSnapshot {
        let poses = self
            .bones
            .iter()
            .map(|b| (b.name.clone(), b.matrix_pose))
            .collect();
        for bone in &mut self.bones {
            bone.zero_transformation();
        }
        self.update();
        PoseSnapshot { poses }
    }

    /// 恢复快照；快照中没有的骨骼归零
    pub fn restore(&mut self, snapshot: &PoseSnapshot) {
        for bone in &mut self.bones {
            match snapshot.get(&bone.name) {
                Some(pose) => bone.set_matrix_pose(pose),
                None => {
                    log::warn!("快照中没有骨骼 {}，姿态归零", bone.name);
                    bone.zero_transformation();
                }
            }
        }
        self.update();
    }

    /// 全部姿态归零
    pub fn clear(&mut self) {
        for bone in &mut self.bones {
            bone.zero_transformation();
        }
        self.update();
    }

    /// 表情/变形编辑后在保留姿态的前提下重新同步静止坐标
    pub fn adapt(&mut self) {
        let snapshot = self.store();
        self.sync_rest_verts();
        self.restore(&snapshot);
    }

    pub fn read_pose_file<P: AsRef<Path>>(&mut self, path: P) -> Result<PoseReport> {
        let pose = PoseFile::load(path)?;
        Ok(self.apply_pose(&pose))
    }

    /// 应用姿态记录；未知骨骼跳过并警告
    pub fn apply_pose(&mut self, pose: &PoseFile) -> PoseReport {
        let mut report = PoseReport {
            applied: 0,
            skipped: pose.skipped,
        };
        for record in &pose.records {
            let Some(&index) = self.name_to_index.get(&record.bone) else {
                log::warn!("姿态文件中的骨骼不存在: {}", record.bone);
                report.skipped += 1;
                continue;
            };
            let rotation = match record.space {
                PoseSpace::Local => record.rotation,
                PoseSpace::Global => {
                    let frame = math::rotation_block(&self.pose_frame(index));
                    let local = frame.transpose() * math::quat_to_matrix(record.rotation);
                    math::matrix_to_quat(&local)
                }
            };
            self.bones[index].set_pose_rotation(rotation);
            report.applied += 1;
        }
        self.update();
        log::info!("姿态应用完成: {} 条, 跳过 {} 条", report.applied, report.skipped);
        report
    }

    /// `parent.global · relative`，父链按当前姿态传播，不含约束
    fn pose_frame(&self, index: usize) -> DMat4 {
        let mut chain = Vec::new();
        let mut cursor = self.bones[index].parent;
        while let Some(p) = cursor {
            chain.push(p);
            cursor = self.bones[p].parent;
        }
        let mut global = DMat4::IDENTITY;
        for &p in chain.iter().rev() {
            global = global * self.bones[p].matrix_relative * self.bones[p].matrix_pose;
        }
        global * self.bones[index].matrix_relative
    }

    pub fn read_motion_file<P: AsRef<Path>>(&mut self, path: P) -> Result<PoseReport> {
        let motion = MotionFile::load(path)?;
        Ok(self.apply_motion(&motion))
    }

    /// 应用动作文件的第一帧
    pub fn apply_motion(&mut self, motion: &MotionFile) -> PoseReport {
        let mut report = PoseReport {
            applied: 0,
            skipped: 0,
        };
        if motion.leading_skipped > 0 {
            log::warn!("动作文件前 {} 帧格式错误，改用第一个可用帧", motion.leading_skipped);
        }
        for (j, joint) in motion.joints.iter().enumerate() {
            let Some(&index) = self.name_to_index.get(&joint.name) else {
                log::warn!("动作文件中的关节没有对应骨骼: {}", joint.name);
                report.skipped += 1;
                continue;
            };
            let Some((rotation, position)) = motion.joint_transform(j, 0) else {
                report.skipped += 1;
                continue;
            };

            let bone = &mut self.bones[index];
            let rest = math::rotation_block(&bone.matrix_rest);
            let pose = rest.transpose() * rotation * rest;
            bone.set_pose_rotation(math::matrix_to_quat(&pose));

            if joint.parent.is_none() && self.config.motion_root_translation {
                if let Some(position) = position {
                    let delta = (position - joint.offset) * self.config.motion_scale;
                    bone.set_pose_translation(rest.transpose() * delta);
                }
            }
            report.applied += 1;
        }
        self.update();
        log::info!("动作首帧应用完成: {} 个关节, 跳过 {} 个", report.applied, report.skipped);
        report
    }

    /// 导出所有非零姿态为局部四元数记录
    pub fn pose_file(&self) -> PoseFile {
        let mut pose = PoseFile::default();
        for bone in &self.bones {
            let q = bone.pose_quaternion();
            if !q.abs_diff_eq(DQuat::IDENTITY, 1e-9) {
                pose.push(bone.name.clone(), PoseSpace::Local, q);
            }
        }
        pose
    }

    fn editable_bone(&self, name: &str, axis_index: usize) -> Result<(usize, Axis)> {
        let index = self.index_of(name)?;
        let axis = Axis::from_index(axis_index).ok_or(ArmatureError::InvalidAxis(axis_index))?;
        if self.bones[index].is_locked() {
            return Err(ArmatureError::LockedBone(name.to_string()));
        }
        Ok((index, axis))
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.name_to_index
            .get(name)
            .copied()
            .ok_or_else(|| ArmatureError::UnknownBone(name.to_string()))
    }

    /// 滑块修改旋转分量，返回更新后的四元数 w（滑块单位）
    ///
    /// 四元数滑块值按 `quat_slider_scale` 缩放，欧拉角滑块为度。
    pub fn set_bone_rotation(&mut self, name: &str, axis_index: usize, slider_value: f64, as_quat: bool) -> Result<f64> {
        let (index, axis) = self.editable_bone(name, axis_index)?;
        let value = if as_quat {
            self.config.slider_to_quat(slider_value)
        } else {
            slider_value.to_radians()
        };
        let w = self.bones[index].set_rotation(axis, value, as_quat, self.config.euler_order);
        self.update();
        Ok(self.config.quat_to_slider(w))
    }

    /// 交互式增量旋转（度）
    ///
    /// 世界空间旋转依赖父骨骼全局矩阵为最新，上一次 update 之后不得有其他修改。
    pub fn rotate_bone(&mut self, name: &str, angle_degrees: f64, axis_index: usize, world: bool) -> Result<()> {
        let (index, axis) = self.editable_bone(name, axis_index)?;
        let parent_global = self.bones[index].parent.map(|p| self.bones[p].matrix_global);
        self.bones[index].rotate(angle_degrees, axis, world, parent_global);
        self.update();
        Ok(())
    }

    pub fn set_bone_pose(&mut self, name: &str, rotation: DQuat) -> Result<()> {
        let index = self.index_of(name)?;
        self.bones[index].set_pose_rotation(rotation);
        self.update();
        Ok(())
    }

    pub fn set_bone_translation(&mut self, name: &str, translation: DVec3) -> Result<()> {
        let index = self.index_of(name)?;
        self.bones[index].set_pose_translation(translation);
        self.update();
        Ok(())
    }

    pub fn zero_bone(&mut self, name: &str) -> Result<()> {
        let index = self.index_of(name)?;
        self.bones[index].zero_transformation();
        self.update();
        Ok(())
    }

    pub fn rotation_readout(&self, name: &str) -> Result<RotationReadout> {
        let bone = &self.bones[self.index_of(name)?];
        let q = bone.pose_quaternion();
        let scale = |c: f64| self.config.quat_to_slider(c);
        let euler = bone.pose_euler(self.config.euler_order);
        Ok(RotationReadout {
            quat: [scale(q.w), scale(q.x), scale(q.y), scale(q.z)],
            euler_degrees: DVec3::new(euler.x.to_degrees(), euler.y.to_degrees(), euler.z.to_degrees()),
        })
    }

    /// 约束后的全局矩阵对应的姿态（不写回）
    pub fn effective_pose(&self, name: &str) -> Option<DMat4> {
        let bone = self.bone(name)?;
        Some(bone.pose_from_global(bone.parent.map(|p| self.bones[p].matrix_global)))
    }

    pub fn set_rest_position(&mut self, rest: bool) {
        self.rest_position = rest;
        self.update();
    }

    pub fn rest_position(&self) -> bool {
        self.rest_position
    }

    pub fn set_visible_layers(&mut self, mask: u32) {
        self.visible_layers = mask;
    }

    pub fn visible_layers(&self) -> u32 {
        self.visible_layers
    }

    /// 可见层上的骨骼
    pub fn controls(&self) -> Vec<&str> {
        self.bones
            .iter()
            .filter(|b| b.layers & self.visible_layers != 0)
            .map(|b| b.name.as_str())
            .collect()
    }

    pub fn deforms(&self) -> Vec<&str> {
        self.bones
            .iter()
            .filter(|b| b.is_deform())
            .map(|b| b.name.as_str())
            .collect()
    }

    pub fn custom_shape(&self, name: &str) -> Option<(ShapeKind, u32)> {
        let index = *self.name_to_index.get(name)?;
        self.definition.bones[self.def_index[index]].shape()
    }

    pub fn add_dependent(&mut self, mut mesh: Box<dyn DependentMesh>) {
        mesh.refit(&self.coords);
        self.dependents.push(mesh);
    }

    pub fn remove_dependent(&mut self, name: &str) -> Option<Box<dyn DependentMesh>> {
        let position = self.dependents.iter().position(|d| d.name() == name)?;
        Some(self.dependents.remove(position))
    }

    pub fn dependent(&self, name: &str) -> Option<&dyn DependentMesh> {
        self.dependents.iter().find(|d| d.name() == name).map(|d| &**d)
    }

    pub fn bone(&self, name: &str) -> Option<&Bone> {
        self.name_to_index.get(name).map(|&i| &self.bones[i])
    }

    pub fn bone_index(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// 父骨骼在前
    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn bone_head(&self, name: &str) -> Option<DVec3> {
        self.bone(name).map(|b| b.head_position())
    }

    pub fn bone_tail(&self, name: &str) -> Option<DVec3> {
        self.bone(name).map(|b| b.tail_position())
    }

    pub fn bone_weights(&self, name: &str) -> Option<&BoneWeights> {
        self.name_to_index.get(name).map(|&i| &self.bone_weights[i])
    }

    /// 蒙皮后的顶点坐标
    pub fn coords(&self) -> &[DVec3] {
        &self.coords
    }

    pub fn rest_coords(&self) -> &[DVec4] {
        &self.rest_coords
    }

    pub fn base_coords(&self) -> &[DVec3] {
        &self.base_coords
    }

    pub fn config(&self) -> &ArmatureConfig {
        &self.config
    }
}

fn bones_children(bones: &mut [Bone], parent: usize, child: usize) {
    if let Some(p) = bones.get_mut(parent) {
        p.children.push(child);
    }
}

fn resolve_points(def: &BoneDef, coords: &[DVec3]) -> Result<(DVec3, DVec3)> {
    Ok((def.head.resolve(&def.name, coords)?, def.tail.resolve(&def.name, coords)?))
}

/// 按顺序构建静止矩阵；`points` 给出时为重建（保留姿态）
fn build_rest(bones: &mut [Bone], points: Option<&[(DVec3, DVec3)]>) -> Result<()> {
    for i in 0..bones.len() {
        let (before, after) = bones.split_at_mut(i);
        let bone = &mut after[0];
        let parent = bone.parent.map(|p| &before[p]);
        match points {
            Some(points) => bone.rebuild(points[i].0, points[i].1, parent)?,
            None => bone.build(parent)?,
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Visiting,
    Done,
}

/// 定义顺序 → 父骨骼在前的顺序（稳定）
fn parents_first(defs: &[BoneDef]) -> Result<Vec<usize>> {
    let mut lookup: HashMap<&str, usize> = HashMap::with_capacity(defs.len());
    for (i, def) in defs.iter().enumerate() {
        if lookup.insert(def.name.as_str(), i).is_some() {
            return Err(ArmatureError::DuplicateBone(def.name.clone()));
        }
    }
    let mut parents = Vec::with_capacity(defs.len());
    for def in defs {
        let parent = match &def.parent {
            Some(name) => Some(*lookup.get(name.as_str()).ok_or_else(|| ArmatureError::MissingParent {
                bone: def.name.clone(),
                parent: name.clone(),
            })?),
            None => None,
        };
        parents.push(parent);
    }

    let mut marks = vec![Mark::New; defs.len()];
    let mut order = Vec::with_capacity(defs.len());
    for start in 0..defs.len() {
        // 沿父链向上收集尚未放置的骨骼
        let mut chain = Vec::new();
        let mut cursor = Some(start);
        while let Some(i) = cursor {
            match marks[i] {
                Mark::Done => break,
                Mark::Visiting => return Err(ArmatureError::HierarchyCycle(defs[i].name.clone())),
                Mark::New => {
                    marks[i] = Mark::Visiting;
                    chain.push(i);
                    cursor = parents[i];
                }
            }
        }
        for &i in chain.iter().rev() {
            marks[i] = Mark::Done;
            order.push(i);
        }
    }
    Ok(order)
}

/// 求值顺序：父骨骼和约束目标先于拥有者；约束依赖成环时报错
fn evaluation_order(bones: &[Bone]) -> Result<Vec<usize>> {
    fn visit(i: usize, bones: &[Bone], marks: &mut [Mark], order: &mut Vec<usize>) -> Result<()> {
        if marks[i] == Mark::Done {
            return Ok(());
        }
        marks[i] = Mark::Visiting;
        let deps = bones[i]
            .parent
            .into_iter()
            .chain(bones[i].constraints.iter().flat_map(|c| c.dependencies()));
        for dep in deps {
            match marks[dep] {
                Mark::Done => {}
                Mark::Visiting => {
                    return Err(ArmatureError::ConstraintCycle {
                        bone: bones[i].name.clone(),
                        target: bones[dep].name.clone(),
                    })
                }
                Mark::New => visit(dep, bones, marks, order)?,
            }
        }
        marks[i] = Mark::Done;
        order.push(i);
        Ok(())
    }

    let mut marks = vec![Mark::New; bones.len()];
    let mut order = Vec::with_capacity(bones.len());
    for i in 0..bones.len() {
        visit(i, bones, &mut marks, &mut order)?;
    }
    Ok(order)
}

/// 传播全局矩阵并求解约束
fn pose_bones(bones: &mut [Bone], order: &[usize]) {
    for &i in order {
        let parent_global = bones[i].parent.map(|p| bones[p].matrix_global);
        bones[i].update_global(parent_global);
        if bones[i].respects_constraints() && !bones[i].constraints.is_empty() {
            let constraints = std::mem::take(&mut bones[i].constraints);
            for constraint in &constraints {
                constraint.apply(i, bones);
            }
            bones[i].constraints = constraints;
        }
    }
}

fn bone_weights(
    definition: &RigDefinition,
    bones: &[Bone],
    lookup: &HashMap<String, usize>,
    vertex_count: usize,
) -> Result<Vec<BoneWeights>> {
    let mut groups = Vec::with_capacity(definition.weights.len());
    for (name, weights) in &definition.weights {
        let bone = *lookup
            .get(name)
            .ok_or_else(|| ArmatureError::UnknownWeightBone(name.clone()))?;
        if !bones[bone].is_deform() {
            log::debug!("忽略非变形骨骼 {} 的 {} 个权重", name, weights.len());
            continue;
        }
        groups.push(WeightGroup {
            bone,
            name: name.as_str(),
            weights: weights.as_slice(),
        });
    }
    normalize_weights(&groups, bones.len(), vertex_count)
}
