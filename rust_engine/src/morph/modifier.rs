//! 静止坐标修改器

use std::fs;
use std::path::Path;

use glam::DVec3;

use crate::{ArmatureError, Result};

/// 蒙皮前修改静止坐标的程序化变形
pub trait RestModifier {
    fn name(&self) -> &str;

    /// 由基础坐标计算修改后的静止坐标，`out` 与 `base` 等长且已填入基础坐标
    fn apply(&mut self, base: &[DVec3], out: &mut [DVec3]);

    /// 修改器权重
    fn value(&self) -> f64;

    fn set_value(&mut self, value: f64);

    /// 输入变化后丢弃缓存
    fn invalidate(&mut self) {}
}

/// 稀疏偏移展开后的稠密缓存
///
/// 只在顶点数变化或显式失效时重建。
#[derive(Clone, Debug, Default)]
pub struct TargetCache {
    dense: Option<Vec<DVec3>>,
}

impl TargetCache {
    pub fn is_built(&self) -> bool {
        self.dense.is_some()
    }

    pub fn invalidate(&mut self) {
        self.dense = None;
    }

    fn get_or_build(&mut self, name: &str, offsets: &[(usize, DVec3)], vertex_count: usize) -> &[DVec3] {
        if self.dense.as_ref().map_or(false, |d| d.len() != vertex_count) {
            self.dense = None;
        }
        self.dense.get_or_insert_with(|| {
            let mut dense = vec![DVec3::ZERO; vertex_count];
            let mut outside = 0;
            for &(index, offset) in offsets {
                match dense.get_mut(index) {
                    Some(slot) => *slot += offset,
                    None => outside += 1,
                }
            }
            if outside > 0 {
                log::warn!("{}: {} 个偏移超出顶点范围 ({})，已忽略", name, outside, vertex_count);
            }
            dense
        })
    }
}

/// 目标文件修改器：`out = base + value · offset`
#[derive(Clone, Debug)]
pub struct TargetModifier {
    name: String,
    offsets: Vec<(usize, DVec3)>,
    value: f64,
    cache: TargetCache,
}

impl TargetModifier {
    pub fn new(name: impl Into<String>, offsets: Vec<(usize, DVec3)>) -> Self {
        Self {
            name: name.into(),
            offsets,
            value: 1.0,
            cache: TargetCache::default(),
        }
    }

    /// 从目标文件加载，修改器名取文件名
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(name, &bytes)
    }

    /// 解析 `index dx dy dz` 行；格式错误的行跳过，全部无效时报错
    pub fn parse(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let (content, _, _) = encoding_rs::UTF_8.decode(bytes);

        let mut offsets = Vec::new();
        let mut skipped = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_offset(line) {
                Some(entry) => offsets.push(entry),
                None => {
                    log::warn!("{}: 目标行格式错误，跳过: {}", name, line);
                    skipped += 1;
                }
            }
        }

        if offsets.is_empty() && skipped > 0 {
            return Err(ArmatureError::TargetParse(format!("{}: no valid offset", name)));
        }
        log::info!("目标 {} 解析完成: {} 个偏移, 跳过 {} 行", name, offsets.len(), skipped);
        Ok(Self::new(name, offsets))
    }

    pub fn offsets(&self) -> &[(usize, DVec3)] {
        &self.offsets
    }

    pub fn cache(&self) -> &TargetCache {
        &self.cache
    }
}

fn parse_offset(line: &str) -> Option<(usize, DVec3)> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.len() != 4 {
        return None;
    }
    let index = words[0].parse().ok()?;
    let mut v = [0.0f64; 3];
    for (value, word) in v.iter_mut().zip(&words[1..]) {
        *value = word.parse().ok().filter(|x: &f64| x.is_finite())?;
    }
    Some((index, DVec3::from_array(v)))
}

impl RestModifier for TargetModifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, base: &[DVec3], out: &mut [DVec3]) {
        let value = self.value;
        let dense = self.cache.get_or_build(&self.name, &self.offsets, base.len());
        for ((out, base), offset) in out.iter_mut().zip(base).zip(dense) {
            *out = *base + *offset * value;
        }
    }

    fn value(&self) -> f64 {
        self.value
    }

    /// 缓存只存偏移，权重变化不需要重建
    fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    fn invalidate(&mut self) {
        self.cache.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        let text = b"# target\n0 0.1 0.0 0.0\n2 0 1 0\nbad line\n3 1 2\n";
        let target = TargetModifier::parse("smile", text).unwrap();
        assert_eq!(target.name(), "smile");
        assert_eq!(target.offsets().len(), 2);
        assert_eq!(target.offsets()[1], (2, DVec3::Y));
    }

    #[test]
    fn test_parse_all_invalid_is_error() {
        assert!(matches!(
            TargetModifier::parse("t", b"x y z w\n"),
            Err(ArmatureError::TargetParse(_))
        ));
        assert!(TargetModifier::parse("empty", b"").unwrap().offsets().is_empty());
    }

    #[test]
    fn test_apply_scaled_offsets() {
        let mut target = TargetModifier::new("t", vec![(1, DVec3::new(0.0, 2.0, 0.0)), (5, DVec3::ONE)]);
        target.set_value(0.5);
        let base = [DVec3::ZERO, DVec3::X, DVec3::Z];
        let mut out = base;
        target.apply(&base, &mut out);
        assert_eq!(out, [DVec3::ZERO, DVec3::new(1.0, 1.0, 0.0), DVec3::Z]);
        assert!(target.cache().is_built());
    }

    #[test]
    fn test_cache_invalidation() {
        let mut target = TargetModifier::new("t", vec![(0, DVec3::X)]);
        let base = [DVec3::ZERO];
        let mut out = base;
        target.apply(&base, &mut out);
        assert!(target.cache().is_built());
        RestModifier::invalidate(&mut target);
        assert!(!target.cache().is_built());

        // 顶点数变化时自动重建
        let base = [DVec3::ZERO, DVec3::ZERO];
        let mut out = base;
        target.apply(&base, &mut out);
        assert_eq!(out[0], DVec3::X);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("armature_target_{}.target", std::process::id()));
        fs::write(&path, "0 1 0 0\n").unwrap();
        let target = TargetModifier::load(&path).unwrap();
        let _ = fs::remove_file(&path);
        assert_eq!(target.name(), format!("armature_target_{}", std::process::id()));
        assert_eq!(target.offsets().to_vec(), vec![(0usize, DVec3::X)]);
    }
}
