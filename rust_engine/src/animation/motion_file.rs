//! 动作捕捉文件解析（HIERARCHY / MOTION 两段式文本）
//!
//! 只解析关节树和逐帧通道值，不做插值或播放。

use std::fs;
use std::path::Path;

use glam::{DMat3, DVec3};

use crate::skeleton::Axis;
use crate::{ArmatureError, Result};

/// 通道类型
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Position(Axis),
    Rotation(Axis),
}

impl Channel {
    fn parse(word: &str) -> Option<Self> {
        let mut chars = word.chars();
        let axis = match chars.next()?.to_ascii_uppercase() {
            'X' => Axis::X,
            'Y' => Axis::Y,
            'Z' => Axis::Z,
            _ => return None,
        };
        match chars.as_str().to_ascii_lowercase().as_str() {
            "position" => Some(Channel::Position(axis)),
            "rotation" => Some(Channel::Rotation(axis)),
            _ => None,
        }
    }
}

/// 关节
#[derive(Clone, Debug, PartialEq)]
pub struct MotionJoint {
    pub name: String,
    pub parent: Option<usize>,
    pub offset: DVec3,
    pub channels: Vec<Channel>,
    /// 该关节第一个通道在帧数据中的位置
    pub channel_start: usize,
}

/// 动作文件数据
#[derive(Clone, Debug, PartialEq)]
pub struct MotionFile {
    pub joints: Vec<MotionJoint>,
    pub frame_time: f64,
    pub frames: Vec<Vec<f64>>,
    /// 格式错误而跳过的帧数
    pub skipped_frames: usize,
    /// 第一个可用帧之前被跳过的帧数；非零时 `frames[0]` 不是文件中的第一帧
    pub leading_skipped: usize,
}

struct Tokens<'a> {
    inner: std::str::SplitWhitespace<'a>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self) -> Option<&'a str> {
        self.inner.next()
    }

    fn expect(&mut self, what: &str) -> Result<&'a str> {
        self.next()
            .ok_or_else(|| ArmatureError::MotionParse(format!("unexpected end of hierarchy, expected {}", what)))
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let word = self.expect(what)?;
        word.parse()
            .map_err(|_| ArmatureError::MotionParse(format!("invalid {}: {}", what, word)))
    }
}

impl MotionFile {
    /// 从文件加载
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::parse(&bytes)
    }

    /// 解析动作数据
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let (content, _, _) = encoding_rs::UTF_8.decode(bytes);

        let motion_at = content
            .lines()
            .position(|line| line.trim() == "MOTION")
            .ok_or_else(|| ArmatureError::MotionParse("missing MOTION section".to_string()))?;
        let hierarchy: Vec<&str> = content.lines().take(motion_at).collect();
        let hierarchy = hierarchy.join("\n");

        let joints = Self::parse_hierarchy(&hierarchy)?;
        let channel_count: usize = joints.iter().map(|j| j.channels.len()).sum();

        let mut frame_time = 0.0;
        let mut frames = Vec::new();
        let mut skipped_frames = 0;
        let mut leading_skipped = 0;
        for line in content.lines().skip(motion_at + 1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("Frames:") {
                log::debug!("动作文件声明帧数: {}", rest.trim());
                continue;
            }
            if let Some(rest) = line.strip_prefix("Frame Time:") {
                frame_time = rest.trim().parse().unwrap_or(0.0);
                continue;
            }

            let values: Option<Vec<f64>> = line
                .split_whitespace()
                .map(|w| w.parse::<f64>().ok().filter(|v| v.is_finite()))
                .collect();
            match values {
                Some(values) if values.len() == channel_count => frames.push(values),
                _ => {
                    if frames.is_empty() {
                        leading_skipped += 1;
                    }
                    skipped_frames += 1;
                    log::warn!("动作帧格式错误，跳过 (期望 {} 个通道值)", channel_count);
                }
            }
        }

        if frames.is_empty() {
            return Err(ArmatureError::MotionParse("no usable frame".to_string()));
        }

        log::info!(
            "动作文件解析完成: {} 个关节, {} 帧, 跳过 {} 帧",
            joints.len(),
            frames.len(),
            skipped_frames
        );

        Ok(Self {
            joints,
            frame_time,
            frames,
            skipped_frames,
            leading_skipped,
        })
    }

    fn parse_hierarchy(text: &str) -> Result<Vec<MotionJoint>> {
        let mut tokens = Tokens {
            inner: text.split_whitespace(),
        };
        let mut joints: Vec<MotionJoint> = Vec::new();
        // 块栈：Some(关节) 或 None（End Site）
        let mut stack: Vec<Option<usize>> = Vec::new();
        let mut pending: Option<Option<usize>> = None;
        let mut channel_start = 0;

        while let Some(token) = tokens.next() {
            match token {
                "HIERARCHY" => {}
                "ROOT" | "JOINT" => {
                    let name = tokens.expect("joint name")?.to_string();
                    let parent = stack.iter().rev().find_map(|entry| *entry);
                    if token == "JOINT" && parent.is_none() {
                        return Err(ArmatureError::MotionParse(format!("joint {} outside ROOT", name)));
                    }
                    joints.push(MotionJoint {
                        name,
                        parent,
                        offset: DVec3::ZERO,
                        channels: Vec::new(),
                        channel_start,
                    });
                    pending = Some(Some(joints.len() - 1));
                }
                "End" => {
                    tokens.expect("Site")?;
                    pending = Some(None);
                }
                "{" => {
                    let entry = pending
                        .take()
                        .ok_or_else(|| ArmatureError::MotionParse("unexpected '{'".to_string()))?;
                    stack.push(entry);
                }
                "}" => {
                    stack
                        .pop()
                        .ok_or_else(|| ArmatureError::MotionParse("unbalanced '}'".to_string()))?;
                }
                "OFFSET" => {
                    let offset = DVec3::new(
                        tokens.number("offset")?,
                        tokens.number("offset")?,
                        tokens.number("offset")?,
                    );
                    if let Some(Some(joint)) = stack.last() {
                        joints[*joint].offset = offset;
                    }
                }
                "CHANNELS" => {
                    let count: usize = tokens.number("channel count")?;
                    let Some(Some(joint)) = stack.last().copied() else {
                        return Err(ArmatureError::MotionParse("CHANNELS outside joint".to_string()));
                    };
                    // 数量来自文件，不据此预分配
                    let mut channels = Vec::new();
                    for _ in 0..count {
                        let word = tokens.expect("channel")?;
                        let channel = Channel::parse(word)
                            .ok_or_else(|| ArmatureError::MotionParse(format!("unknown channel: {}", word)))?;
                        channels.push(channel);
                    }
                    joints[joint].channel_start = channel_start;
                    channel_start += count;
                    joints[joint].channels = channels;
                }
                other => {
                    return Err(ArmatureError::MotionParse(format!("unexpected token: {}", other)));
                }
            }
        }

        if !stack.is_empty() {
            return Err(ArmatureError::MotionParse("unterminated joint block".to_string()));
        }
        if joints.is_empty() {
            return Err(ArmatureError::MotionParse("missing ROOT".to_string()));
        }
        Ok(joints)
    }

    /// 第一个可用帧（格式错误的帧已跳过，见 `leading_skipped`）
    pub fn first_frame(&self) -> Option<&[f64]> {
        self.frames.first().map(|f| f.as_slice())
    }

    pub fn joint_index(&self, name: &str) -> Option<usize> {
        self.joints.iter().position(|j| j.name == name)
    }

    /// 某帧某关节的旋转（按通道声明顺序组合，`R = R_c1 · R_c2 · R_c3`，角度制）
    /// 与位置通道（无位置通道时为 None）
    pub fn joint_transform(&self, joint: usize, frame: usize) -> Option<(DMat3, Option<DVec3>)> {
        let joint = self.joints.get(joint)?;
        let values = self.frames.get(frame)?;
        let values = values.get(joint.channel_start..joint.channel_start + joint.channels.len())?;

        let mut rotation = DMat3::IDENTITY;
        let mut position: Option<DVec3> = None;
        for (channel, value) in joint.channels.iter().zip(values) {
            match channel {
                Channel::Rotation(axis) => {
                    rotation *= DMat3::from_axis_angle(axis.unit(), value.to_radians());
                }
                Channel::Position(axis) => {
                    position.get_or_insert(DVec3::ZERO)[axis.index()] = *value;
                }
            }
        }
        Some((rotation, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "HIERARCHY
ROOT Hips
{
  OFFSET 0.0 10.0 0.0
  CHANNELS 6 Xposition Yposition Zposition Zrotation Xrotation Yrotation
  JOINT Spine
  {
    OFFSET 0.0 1.0 0.0
    CHANNELS 3 Zrotation Xrotation Yrotation
    End Site
    {
      OFFSET 0.0 1.0 0.0
    }
  }
}
MOTION
Frames: 2
Frame Time: 0.033333
1.0 10.0 2.0 0.0 0.0 0.0 90.0 0.0 0.0
0 0 0 0 0 0 0 0 0
";

    #[test]
    fn test_parse_hierarchy() {
        let motion = MotionFile::parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(motion.joints.len(), 2);
        assert_eq!(motion.joints[0].name, "Hips");
        assert_eq!(motion.joints[0].parent, None);
        assert_eq!(motion.joints[0].offset, DVec3::new(0.0, 10.0, 0.0));
        assert_eq!(motion.joints[1].parent, Some(0));
        assert_eq!(motion.joints[1].channel_start, 6);
        assert_eq!(
            motion.joints[1].channels,
            vec![
                Channel::Rotation(Axis::Z),
                Channel::Rotation(Axis::X),
                Channel::Rotation(Axis::Y)
            ]
        );
        assert_eq!(motion.frames.len(), 2);
        assert!((motion.frame_time - 0.033333).abs() < 1e-12);
        assert_eq!(motion.joint_index("Spine"), Some(1));
    }

    #[test]
    fn test_joint_transform() {
        let motion = MotionFile::parse(SAMPLE.as_bytes()).unwrap();
        let (rotation, position) = motion.joint_transform(0, 0).unwrap();
        assert_eq!(position, Some(DVec3::new(1.0, 10.0, 2.0)));
        assert!(rotation.abs_diff_eq(DMat3::IDENTITY, 1e-12));

        let (rotation, position) = motion.joint_transform(1, 0).unwrap();
        assert_eq!(position, None);
        assert!(rotation.abs_diff_eq(DMat3::from_rotation_z(std::f64::consts::FRAC_PI_2), 1e-12));
    }

    #[test]
    fn test_channel_order_composition() {
        let text = "HIERARCHY
ROOT A
{
  OFFSET 0 0 0
  CHANNELS 3 Xrotation Yrotation Zrotation
}
MOTION
Frames: 1
Frame Time: 0.1
10 20 30
";
        let motion = MotionFile::parse(text.as_bytes()).unwrap();
        let (rotation, _) = motion.joint_transform(0, 0).unwrap();
        let expected = DMat3::from_rotation_x(10f64.to_radians())
            * DMat3::from_rotation_y(20f64.to_radians())
            * DMat3::from_rotation_z(30f64.to_radians());
        assert!(rotation.abs_diff_eq(expected, 1e-12));
    }

    #[test]
    fn test_bad_frames_skipped() {
        let text = "HIERARCHY
ROOT A
{
  OFFSET 0 0 0
  CHANNELS 1 Zrotation
}
MOTION
Frames: 3
Frame Time: 0.1
oops
1 2
45
";
        let motion = MotionFile::parse(text.as_bytes()).unwrap();
        assert_eq!(motion.skipped_frames, 2);
        assert_eq!(motion.leading_skipped, 2);
        assert_eq!(motion.first_frame(), Some(&[45.0][..]));

        let trailing = "HIERARCHY\nROOT A\n{\nCHANNELS 1 Zrotation\n}\nMOTION\n10\nbad\n";
        let motion = MotionFile::parse(trailing.as_bytes()).unwrap();
        assert_eq!(motion.skipped_frames, 1);
        assert_eq!(motion.leading_skipped, 0);
    }

    #[test]
    fn test_huge_channel_count_is_error() {
        let text = b"HIERARCHY\nROOT A\n{\nOFFSET 0 0 0\nCHANNELS 18446744073709551615 Xrotation\n}\nMOTION\n0\n";
        assert!(matches!(MotionFile::parse(text), Err(ArmatureError::MotionParse(_))));
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            MotionFile::parse(b"HIERARCHY\nROOT A\n{\n}\n"),
            Err(ArmatureError::MotionParse(_))
        ));
        let no_frames = "HIERARCHY\nROOT A\n{\nCHANNELS 1 Zrotation\n}\nMOTION\nFrames: 0\nFrame Time: 0.1\n";
        assert!(matches!(
            MotionFile::parse(no_frames.as_bytes()),
            Err(ArmatureError::MotionParse(_))
        ));
        let bad_channel = "HIERARCHY\nROOT A\n{\nCHANNELS 1 Wrotation\n}\nMOTION\n0\n";
        assert!(matches!(
            MotionFile::parse(bad_channel.as_bytes()),
            Err(ArmatureError::MotionParse(_))
        ));
        let unbalanced = "HIERARCHY\nROOT A\n{\nCHANNELS 1 Zrotation\nMOTION\n0\n";
        assert!(matches!(
            MotionFile::parse(unbalanced.as_bytes()),
            Err(ArmatureError::MotionParse(_))
        ));
    }
}
