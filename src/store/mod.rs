//! 设置持久化：键值存储
//!
//! 控制器用它记住启动 Profile / 应用、偏好开关、补丁串与序列化模式。
//! 布尔值可能以字符串形式保存（"1"/"true"/"0"/"false"），读取时统一归一化。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

pub trait PersistentStore: Send + Sync {
    fn store(&self, key: &str, value: Value);

    fn retrieve(&self, key: &str) -> Option<Value>;

    /// 清空所有设置（`--clear-settings`）
    fn clear(&self);

    fn retrieve_or(&self, key: &str, default: Value) -> Value {
        self.retrieve(key).unwrap_or(default)
    }

    fn retrieve_bool(&self, key: &str, default: bool) -> bool {
        self.retrieve(key).and_then(|v| truthy(&v)).unwrap_or(default)
    }

    fn retrieve_string(&self, key: &str) -> Option<String> {
        match self.retrieve(key)? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::String(_) | Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// 宽松的布尔解析；无法判断时返回 None
pub fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) | Some(2) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.to_lowercase().as_str() {
            "1" | "2" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// 进程内存储（测试与无持久化运行）
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn store(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn retrieve(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn clear(&self) {
        if let Ok(mut values) = self.values.lock() {
            values.clear();
        }
    }
}

/// 单个 JSON 文件，每次写入后整体落盘
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<serde_json::Map<String, Value>>,
}

impl JsonFileStore {
    /// 打开设置文件；不存在时从空设置开始
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            serde_json::from_str(&data)?
        } else {
            serde_json::Map::new()
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn flush(&self, values: &serde_json::Map<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(values)?)?;
        Ok(())
    }
}

impl PersistentStore for JsonFileStore {
    fn store(&self, key: &str, value: Value) {
        let Ok(mut values) = self.values.lock() else {
            return;
        };
        values.insert(key.to_string(), value);
        if let Err(e) = self.flush(&values) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to save settings");
        }
    }

    fn retrieve(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn clear(&self) {
        let Ok(mut values) = self.values.lock() else {
            return;
        };
        values.clear();
        if let Err(e) = self.flush(&values) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to clear settings");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_bool_normalisation() {
        let store = MemoryStore::new();
        store.store("a", json!("1"));
        store.store("b", json!("false"));
        store.store("c", json!(2));
        store.store("d", json!("maybe"));
        assert!(store.retrieve_bool("a", false));
        assert!(!store.retrieve_bool("b", true));
        assert!(store.retrieve_bool("c", false));
        assert!(store.retrieve_bool("d", true));
        assert!(!store.retrieve_bool("missing", false));
    }

    #[test]
    fn test_json_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings").join("allzpark.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.store("startupProfile", json!("foo"));
        store.store("showAllApps", json!("true"));
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.retrieve_string("startupProfile").as_deref(), Some("foo"));
        assert!(reopened.retrieve_bool("showAllApps", false));

        reopened.clear();
        assert!(JsonFileStore::open(&path).unwrap().retrieve("startupProfile").is_none());
    }
}
