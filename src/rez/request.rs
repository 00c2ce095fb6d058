//! 包请求：`name`、`name==1.0`、`name-1`、`name-1+`、`~name`（弱引用）、`!name`（冲突）、`^name`（补丁移除）

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::rez::{GatewayError, Version};

/// 版本范围
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionRange {
    Any,
    /// `==1.0`
    Exact(Version),
    /// `-1`：版本段以 1 开头
    Prefix(Version),
    /// `-1+` 或 `>=1`
    AtLeast(Version),
}

impl VersionRange {
    pub fn contains(&self, version: &Version) -> bool {
        match self {
            VersionRange::Any => true,
            VersionRange::Exact(v) => version == v,
            VersionRange::Prefix(v) => version.has_prefix(v),
            VersionRange::AtLeast(v) => version >= v,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, VersionRange::Any)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRange::Any => Ok(()),
            VersionRange::Exact(v) => write!(f, "=={v}"),
            VersionRange::Prefix(v) => write!(f, "-{v}"),
            VersionRange::AtLeast(v) => write!(f, "-{v}+"),
        }
    }
}

/// 请求种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Normal,
    /// `~name`：不强制拉入，只在出现时约束版本
    Weak,
    /// `!name`：不得出现在解析结果中
    Conflict,
    /// `^name`：仅用于补丁，从请求中移除同名项
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageRequest {
    pub name: String,
    pub range: VersionRange,
    pub kind: RequestKind,
}

fn request_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<flag>[~!^])?(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?:(?P<op>==|>=|-)(?P<ver>[A-Za-z0-9_.]+)(?P<plus>\+)?)?$",
        )
        .expect("static regex")
    })
}

impl PackageRequest {
    pub fn new(name: impl Into<String>, range: VersionRange) -> Self {
        Self {
            name: name.into(),
            range,
            kind: RequestKind::Normal,
        }
    }

    /// `name==version`
    pub fn exact(name: impl Into<String>, version: &Version) -> Self {
        Self::new(name, VersionRange::Exact(version.clone()))
    }

    pub fn is_weak(&self) -> bool {
        self.kind == RequestKind::Weak
    }

    /// 去掉 `~` 等标记，得到同名同范围的普通请求
    pub fn to_normal(&self) -> Self {
        Self::new(self.name.clone(), self.range.clone())
    }

    /// 将补丁请求叠加到 `base` 上：同名替换、`^name` 移除、其余追加
    pub fn patch(base: &[PackageRequest], patch: &[PackageRequest]) -> Vec<PackageRequest> {
        let mut out: Vec<PackageRequest> = base.to_vec();
        for p in patch {
            let existing = out.iter().position(|r| r.name == p.name);
            match (p.kind, existing) {
                (RequestKind::Remove, Some(idx)) => {
                    out.remove(idx);
                }
                (RequestKind::Remove, None) => {}
                (_, Some(idx)) => out[idx] = p.clone(),
                (_, None) => out.push(p.clone()),
            }
        }
        out
    }

    /// 空格分隔的请求串
    pub fn parse_list(raw: &str) -> Result<Vec<PackageRequest>, GatewayError> {
        raw.split_whitespace().map(str::parse).collect()
    }
}

impl FromStr for PackageRequest {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let caps = request_re()
            .captures(raw.trim())
            .ok_or_else(|| GatewayError::RequestParse(raw.to_string()))?;

        let kind = match caps.name("flag").map(|m| m.as_str()) {
            Some("~") => RequestKind::Weak,
            Some("!") => RequestKind::Conflict,
            Some("^") => RequestKind::Remove,
            _ => RequestKind::Normal,
        };
        let range = match (caps.name("op"), caps.name("ver")) {
            (Some(op), Some(ver)) => {
                let ver = Version::from(ver.as_str());
                let plus = caps.name("plus").is_some();
                match op.as_str() {
                    "==" if !plus => VersionRange::Exact(ver),
                    ">=" if !plus => VersionRange::AtLeast(ver),
                    "-" if plus => VersionRange::AtLeast(ver),
                    "-" => VersionRange::Prefix(ver),
                    _ => return Err(GatewayError::RequestParse(raw.to_string())),
                }
            }
            _ => VersionRange::Any,
        };

        Ok(Self {
            name: caps["name"].to_string(),
            range,
            kind,
        })
    }
}

impl fmt::Display for PackageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match self.kind {
            RequestKind::Normal => "",
            RequestKind::Weak => "~",
            RequestKind::Conflict => "!",
            RequestKind::Remove => "^",
        };
        write!(f, "{flag}{}{}", self.name, self.range)
    }
}

impl TryFrom<String> for PackageRequest {
    type Error = GatewayError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<PackageRequest> for String {
    fn from(req: PackageRequest) -> Self {
        req.to_string()
    }
}
