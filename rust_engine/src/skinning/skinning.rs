//! 顶点蒙皮计算

use std::collections::BTreeMap;

use glam::{DMat4, DVec3, DVec4};
use rayon::prelude::*;

use super::{BoneWeights, SkinningInput, SkinningOutput};
use crate::{ArmatureError, Result};

/// 原始顶点组（未归一化）
pub struct WeightGroup<'a> {
    pub bone: usize,
    pub name: &'a str,
    pub weights: &'a [(usize, f64)],
}

/// 归一化顶点组权重
///
/// 每个顶点在所有组中的权重之和归一化为 1；总权重为 0 的顶点不出现在结果中。
/// 同一组内重复的顶点权重相加。返回按骨骼索引排列的权重表。
pub fn normalize_weights(groups: &[WeightGroup<'_>], bone_count: usize, vertex_count: usize) -> Result<Vec<BoneWeights>> {
    let mut merged: Vec<(usize, BTreeMap<usize, f64>)> = Vec::with_capacity(groups.len());
    let mut totals = vec![0.0f64; vertex_count];

    for group in groups {
        let mut entries = BTreeMap::new();
        for &(vertex, weight) in group.weights {
            if vertex >= vertex_count {
                return Err(ArmatureError::VertexOutOfRange {
                    vertex,
                    count: vertex_count,
                });
            }
            if !weight.is_finite() || weight < 0.0 {
                return Err(ArmatureError::InvalidWeight {
                    bone: group.name.to_string(),
                    vertex,
                    weight,
                });
            }
            *entries.entry(vertex).or_insert(0.0) += weight;
            totals[vertex] += weight;
        }
        merged.push((group.bone, entries));
    }

    let mut result = vec![BoneWeights::default(); bone_count];
    for (bone, entries) in merged {
        let Some(slot) = result.get_mut(bone) else {
            continue;
        };
        for (vertex, weight) in entries {
            let total = totals[vertex];
            if total > 0.0 && weight > 0.0 {
                slot.verts.push(vertex);
                slot.weights.push(weight / total);
            }
        }
    }

    let dropped = totals.iter().filter(|&&t| t == 0.0).count();
    if dropped > 0 {
        log::debug!("{} 个顶点没有骨骼权重，保持静止位置", dropped);
    }
    Ok(result)
}

/// 按顶点组织的权重表（CSR）
#[derive(Clone, Debug, Default)]
pub struct SkinningResolver {
    offsets: Vec<usize>,
    influences: Vec<(usize, f64)>,
}

impl SkinningResolver {
    pub fn new(bone_weights: &[BoneWeights], vertex_count: usize) -> Self {
        let mut counts = vec![0usize; vertex_count];
        for weights in bone_weights {
            for &v in &weights.verts {
                if v < vertex_count {
                    counts[v] += 1;
                }
            }
        }

        let mut offsets = Vec::with_capacity(vertex_count + 1);
        let mut running = 0;
        offsets.push(0);
        for count in &counts {
            running += count;
            offsets.push(running);
        }

        let mut cursor: Vec<usize> = offsets[..vertex_count].to_vec();
        let mut influences = vec![(0usize, 0.0f64); running];
        for (bone, weights) in bone_weights.iter().enumerate() {
            for (v, w) in weights.iter() {
                if v < vertex_count {
                    influences[cursor[v]] = (bone, w);
                    cursor[v] += 1;
                }
            }
        }

        Self { offsets, influences }
    }

    pub fn vertex_count(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// 指定顶点的 (骨骼, 权重) 列表
    pub fn influences(&self, vertex: usize) -> &[(usize, f64)] {
        match (self.offsets.get(vertex), self.offsets.get(vertex + 1)) {
            (Some(&start), Some(&end)) => &self.influences[start..end],
            _ => &[],
        }
    }

    pub fn is_influenced(&self, vertex: usize) -> bool {
        !self.influences(vertex).is_empty()
    }

    fn skin_vertex(&self, vertex: usize, rest: DVec4, matrices: &[DMat4]) -> DVec3 {
        let influences = self.influences(vertex);
        if influences.is_empty() {
            return rest.truncate();
        }
        let mut sum = DVec4::ZERO;
        for &(bone, weight) in influences {
            sum += get_matrix(matrices, bone) * rest * weight;
        }
        sum.truncate()
    }
}

/// 计算蒙皮：`Σ weight · (basis · rest)`，无权重顶点保持静止位置
pub fn compute_skinning(input: &SkinningInput) -> SkinningOutput {
    let vertex_count = input.rest_coords.len();
    let mut positions = vec![DVec3::ZERO; vertex_count];
    let resolver = input.resolver;
    let matrices = input.bone_matrices;

    if vertex_count >= input.parallel_threshold {
        positions
            .par_iter_mut()
            .zip(input.rest_coords.par_iter())
            .enumerate()
            .for_each(|(v, (out, rest))| {
                *out = resolver.skin_vertex(v, *rest, matrices);
            });
    } else {
        for (v, (out, rest)) in positions.iter_mut().zip(input.rest_coords).enumerate() {
            *out = resolver.skin_vertex(v, *rest, matrices);
        }
    }

    SkinningOutput { positions }
}

fn get_matrix(matrices: &[DMat4], index: usize) -> DMat4 {
    matrices.get(index).copied().unwrap_or(DMat4::IDENTITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group<'a>(bone: usize, name: &'a str, weights: &'a [(usize, f64)]) -> WeightGroup<'a> {
        WeightGroup { bone, name, weights }
    }

    #[test]
    fn test_normalize_sums_to_one() {
        let a = [(0, 3.0), (1, 1.0)];
        let b = [(0, 7.0), (2, 0.0)];
        let weights = normalize_weights(&[group(0, "X", &a), group(1, "Y", &b)], 2, 4).unwrap();
        assert_eq!(weights[0].verts, vec![0, 1]);
        assert!((weights[0].weights[0] - 0.3).abs() < 1e-12);
        assert!((weights[0].weights[1] - 1.0).abs() < 1e-12);
        assert_eq!(weights[1].verts, vec![0]);
        assert!((weights[1].weights[0] - 0.7).abs() < 1e-12);

        for v in 0..2 {
            let total: f64 = weights
                .iter()
                .flat_map(|w| w.iter())
                .filter(|&(vv, _)| vv == v)
                .map(|(_, w)| w)
                .sum();
            assert!((total - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalize_merges_duplicates() {
        let a = [(0, 1.0), (0, 1.0)];
        let b = [(0, 2.0)];
        let weights = normalize_weights(&[group(0, "X", &a), group(1, "Y", &b)], 2, 1).unwrap();
        assert_eq!(weights[0].len(), 1);
        assert!((weights[0].weights[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_rejects_bad_input() {
        let negative = [(0, -1.0)];
        assert!(matches!(
            normalize_weights(&[group(0, "X", &negative)], 1, 1),
            Err(ArmatureError::InvalidWeight { vertex: 0, .. })
        ));
        let nan = [(0, f64::NAN)];
        assert!(matches!(
            normalize_weights(&[group(0, "X", &nan)], 1, 1),
            Err(ArmatureError::InvalidWeight { .. })
        ));
        let out_of_range = [(5, 1.0)];
        assert!(matches!(
            normalize_weights(&[group(0, "X", &out_of_range)], 1, 2),
            Err(ArmatureError::VertexOutOfRange { vertex: 5, count: 2 })
        ));
    }

    #[test]
    fn test_blended_vertex() {
        let a = [(0, 3.0)];
        let b = [(0, 7.0)];
        let weights = normalize_weights(&[group(0, "X", &a), group(1, "Y", &b)], 2, 2).unwrap();
        let resolver = SkinningResolver::new(&weights, 2);
        assert!(resolver.is_influenced(0));
        assert!(!resolver.is_influenced(1));

        let rest = [DVec4::new(1.0, 1.0, 1.0, 1.0), DVec4::new(5.0, 5.0, 5.0, 1.0)];
        let matrices = [
            DMat4::from_translation(DVec3::new(10.0, 0.0, 0.0)),
            DMat4::from_translation(DVec3::new(0.0, 10.0, 0.0)),
        ];
        let output = compute_skinning(&SkinningInput {
            rest_coords: &rest,
            bone_matrices: &matrices,
            resolver: &resolver,
            parallel_threshold: usize::MAX,
        });
        assert!(output.positions[0].abs_diff_eq(DVec3::new(4.0, 8.0, 1.0), 1e-12));
        assert_eq!(output.positions[1], DVec3::new(5.0, 5.0, 5.0));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let verts: Vec<(usize, f64)> = (0..64).map(|v| (v, 1.0 + v as f64)).collect();
        let other: Vec<(usize, f64)> = (0..64).step_by(2).map(|v| (v, 2.0)).collect();
        let weights = normalize_weights(&[group(0, "A", &verts), group(1, "B", &other)], 2, 64).unwrap();
        let resolver = SkinningResolver::new(&weights, 64);
        let rest: Vec<DVec4> = (0..64).map(|v| DVec4::new(v as f64, 1.0, -1.0, 1.0)).collect();
        let matrices = [
            DMat4::from_rotation_z(0.3),
            DMat4::from_translation(DVec3::new(0.0, 2.0, 0.0)),
        ];
        let run = |threshold| {
            compute_skinning(&SkinningInput {
                rest_coords: &rest,
                bone_matrices: &matrices,
                resolver: &resolver,
                parallel_threshold: threshold,
            })
            .positions
        };
        let sequential = run(usize::MAX);
        let parallel = run(0);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_identity_bases_reproduce_rest() {
        let a = [(0, 0.2), (1, 0.5)];
        let b = [(0, 0.8)];
        let weights = normalize_weights(&[group(0, "A", &a), group(1, "B", &b)], 2, 2).unwrap();
        let resolver = SkinningResolver::new(&weights, 2);
        let rest = [DVec4::new(0.1, 0.2, 0.3, 1.0), DVec4::new(-1.0, 2.0, 4.0, 1.0)];
        let output = compute_skinning(&SkinningInput {
            rest_coords: &rest,
            bone_matrices: &[DMat4::IDENTITY, DMat4::IDENTITY],
            resolver: &resolver,
            parallel_threshold: usize::MAX,
        });
        assert!(output.positions[0].abs_diff_eq(rest[0].truncate(), 1e-12));
        assert!(output.positions[1].abs_diff_eq(rest[1].truncate(), 1e-12));
    }
}
