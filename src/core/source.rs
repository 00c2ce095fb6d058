//! 名称来源：Profile / 应用列表可以是显式列表、回调或目录

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use walkdir::WalkDir;

pub type NameCallback = Arc<dyn Fn() -> anyhow::Result<Vec<String>> + Send + Sync>;

#[derive(Clone)]
pub enum NameSource {
    Explicit(Vec<String>),
    /// 调用方提供（数据库查询等），控制器不关心实现
    Callback(NameCallback),
    /// 目录下的子目录名
    Directory(PathBuf),
}

impl fmt::Debug for NameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameSource::Explicit(names) => f.debug_tuple("Explicit").field(names).finish(),
            NameSource::Callback(_) => f.write_str("Callback(..)"),
            NameSource::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
        }
    }
}

impl fmt::Display for NameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameSource::Explicit(names) => write!(f, "[{}]", names.join(", ")),
            NameSource::Callback(_) => f.write_str("<callback>"),
            NameSource::Directory(path) => write!(f, "{}", path.display()),
        }
    }
}

impl From<Vec<String>> for NameSource {
    fn from(names: Vec<String>) -> Self {
        NameSource::Explicit(names)
    }
}

impl From<&[&str]> for NameSource {
    fn from(names: &[&str]) -> Self {
        NameSource::Explicit(names.iter().map(|s| s.to_string()).collect())
    }
}

impl NameSource {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<String>> + Send + Sync + 'static,
    {
        NameSource::Callback(Arc::new(f))
    }

    /// 列出名称，失败时返回 Err；空名称被丢弃
    pub fn try_list(&self) -> anyhow::Result<Vec<String>> {
        let names = match self {
            NameSource::Explicit(names) => names.clone(),
            NameSource::Callback(f) => f()?,
            NameSource::Directory(path) => {
                let mut names = Vec::new();
                for entry in WalkDir::new(path).min_depth(1).max_depth(1).sort_by_file_name() {
                    let entry = entry?;
                    if entry.file_type().is_dir() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names
            }
        };
        Ok(names
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect())
    }

    /// 列出名称；失败只记录日志并返回空列表
    pub fn list(&self) -> Vec<String> {
        match self.try_list() {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(error = %e, "Could not find profiles in {}", self);
                Vec::new()
            }
        }
    }
}
