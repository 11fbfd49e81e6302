//! 代理网格（头发、衣物）

use std::fs;
use std::path::Path;

use glam::DVec3;

use super::DependentMesh;
use crate::{ArmatureError, Result};

/// 代理顶点引用的基础网格位置
#[derive(Clone, Debug, PartialEq)]
pub enum ProxyRef {
    /// 直接跟随一个基础顶点
    Exact(usize),
    /// 三个基础顶点的加权和加偏移
    Triangle {
        verts: [usize; 3],
        weights: [f64; 3],
        offset: DVec3,
    },
}

impl ProxyRef {
    fn resolve(&self, base: &[DVec3]) -> Option<DVec3> {
        match self {
            ProxyRef::Exact(v) => base.get(*v).copied(),
            ProxyRef::Triangle { verts, weights, offset } => {
                let mut sum = *offset;
                for (v, w) in verts.iter().zip(weights) {
                    sum += *base.get(*v)? * *w;
                }
                Some(sum)
            }
        }
    }
}

/// 由基础网格派生顶点的代理网格
#[derive(Clone, Debug)]
pub struct ProxyMesh {
    name: String,
    refs: Vec<ProxyRef>,
    coords: Vec<DVec3>,
}

impl ProxyMesh {
    pub fn new(name: impl Into<String>, refs: Vec<ProxyRef>) -> Self {
        let coords = vec![DVec3::ZERO; refs.len()];
        Self {
            name: name.into(),
            refs,
            coords,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::parse(name, &bytes)
    }

    /// 解析 `# verts` 段：每行 `v` 或 `v0 v1 v2 w0 w1 w2 d0 d1 d2`
    pub fn parse(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let (content, _, _) = encoding_rs::UTF_8.decode(bytes);

        let mut refs = Vec::new();
        let mut in_verts = false;
        for (number, line) in content.lines().enumerate() {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if words[0] == "#" {
                in_verts = words.get(1) == Some(&"verts");
                continue;
            }
            if !in_verts {
                continue;
            }
            let parsed = parse_ref(&words).ok_or_else(|| {
                ArmatureError::ProxyParse(format!("{}: invalid proxy vertex at line {}", name, number + 1))
            })?;
            refs.push(parsed);
        }

        log::info!("代理网格 {} 解析完成: {} 个顶点", name, refs.len());
        Ok(Self::new(name, refs))
    }

    pub fn refs(&self) -> &[ProxyRef] {
        &self.refs
    }
}

fn parse_ref(words: &[&str]) -> Option<ProxyRef> {
    match words.len() {
        1 => Some(ProxyRef::Exact(words[0].parse().ok()?)),
        9 => {
            let mut verts = [0usize; 3];
            let mut numbers = [0.0f64; 6];
            for (slot, word) in verts.iter_mut().zip(&words[..3]) {
                *slot = word.parse().ok()?;
            }
            for (slot, word) in numbers.iter_mut().zip(&words[3..]) {
                *slot = word.parse().ok().filter(|v: &f64| v.is_finite())?;
            }
            Some(ProxyRef::Triangle {
                verts,
                weights: [numbers[0], numbers[1], numbers[2]],
                offset: DVec3::new(numbers[3], numbers[4], numbers[5]),
            })
        }
        _ => None,
    }
}

impl DependentMesh for ProxyMesh {
    fn name(&self) -> &str {
        &self.name
    }

    fn refit(&mut self, base: &[DVec3]) {
        let mut missing = 0;
        for (coord, r) in self.coords.iter_mut().zip(&self.refs) {
            match r.resolve(base) {
                Some(p) => *coord = p,
                None => missing += 1,
            }
        }
        if missing > 0 {
            log::warn!("{}: {} 个代理顶点引用超出基础网格范围", self.name, missing);
        }
    }

    fn coords(&self) -> &[DVec3] {
        &self.coords
    }
}
