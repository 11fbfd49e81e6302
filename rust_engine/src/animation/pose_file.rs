//! 姿态文件解析
//!
//! 纯文本，每行一根骨骼：`骨骼名 quat|gquat w x y z`。
//! `quat` 为相对静止坐标系的局部旋转，`gquat` 为世界空间旋转。

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use glam::DQuat;

use crate::Result;

/// 旋转所在空间
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoseSpace {
    /// `quat`
    Local,
    /// `gquat`
    Global,
}

impl PoseSpace {
    pub fn keyword(self) -> &'static str {
        match self {
            PoseSpace::Local => "quat",
            PoseSpace::Global => "gquat",
        }
    }

    fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "quat" => Some(PoseSpace::Local),
            "gquat" => Some(PoseSpace::Global),
            _ => None,
        }
    }
}

/// 单条骨骼记录
#[derive(Clone, Debug, PartialEq)]
pub struct PoseRecord {
    pub bone: String,
    pub space: PoseSpace,
    pub rotation: DQuat,
}

/// 姿态文件数据
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseFile {
    pub records: Vec<PoseRecord>,
    /// 解析时跳过的格式错误行数
    pub skipped: usize,
}

impl PoseFile {
    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(Self::parse(&bytes))
    }

    /// 解析姿态数据，格式错误的行跳过并计数
    pub fn parse(bytes: &[u8]) -> Self {
        let (content, _, had_errors) = encoding_rs::UTF_8.decode(bytes);
        if had_errors {
            log::warn!("姿态文件包含无效 UTF-8 字节，已替换");
        }

        let mut records = Vec::new();
        let mut skipped = 0;
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Self::parse_line(line) {
                Some(record) => records.push(record),
                None => {
                    log::warn!("姿态文件第 {} 行格式错误，跳过: {}", number + 1, line);
                    skipped += 1;
                }
            }
        }

        log::info!("姿态文件解析完成: {} 条记录, 跳过 {} 行", records.len(), skipped);
        Self { records, skipped }
    }

    fn parse_line(line: &str) -> Option<PoseRecord> {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.len() != 6 {
            return None;
        }
        let space = PoseSpace::from_keyword(words[1])?;
        let mut values = [0.0f64; 4];
        for (value, word) in values.iter_mut().zip(&words[2..]) {
            *value = word.parse().ok().filter(|v: &f64| v.is_finite())?;
        }
        let [w, x, y, z] = values;
        Some(PoseRecord {
            bone: words[0].to_string(),
            space,
            rotation: DQuat::from_xyzw(x, y, z, w),
        })
    }

    pub fn push(&mut self, bone: impl Into<String>, space: PoseSpace, rotation: DQuat) {
        self.records.push(PoseRecord {
            bone: bone.into(),
            space,
            rotation,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for record in &self.records {
            let q = record.rotation;
            // String 写入不会失败
            let _ = writeln!(
                text,
                "{} {} {:.6} {:.6} {:.6} {:.6}",
                record.bone,
                record.space.keyword(),
                q.w,
                q.x,
                q.y,
                q.z
            );
        }
        text
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }
}
