//! 包定义
//!
//! 对应 Rez 的 package.py，这里以 TOML/serde 描述：名称、版本、依赖、工具、环境命令与任意元数据。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rez::{PackageRequest, Version};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub requires: Vec<PackageRequest>,
    /// 包内可启动的可执行程序
    #[serde(default)]
    pub tools: Vec<String>,
    /// 激活时写入环境的变量，值中可引用 `${VAR}`
    #[serde(default)]
    pub environ: BTreeMap<String, String>,
    /// label / icon / hidden 等展示用元数据
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<Version>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            requires: Vec::new(),
            tools: Vec::new(),
            environ: BTreeMap::new(),
            data: serde_json::Map::new(),
        }
    }

    pub fn with_requires(mut self, requires: &[&str]) -> Result<Self, crate::rez::GatewayError> {
        self.requires = requires
            .iter()
            .map(|r| r.parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self)
    }

    pub fn with_environ(mut self, key: &str, value: &str) -> Self {
        self.environ.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_data(mut self, key: &str, value: serde_json::Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// `name-version`，排除规则匹配的对象
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    /// `name==version`，应用在会话中的标识
    pub fn request_string(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }

    pub fn as_request(&self) -> PackageRequest {
        PackageRequest::exact(self.name.clone(), &self.version)
    }

    /// 声明为弱引用的依赖（即 Profile 暴露的应用）
    pub fn weak_requires(&self) -> impl Iterator<Item = &PackageRequest> {
        self.requires.iter().filter(|r| r.is_weak())
    }
}
