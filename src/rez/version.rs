//! 版本号与自然排序
//!
//! 版本按「数字段按数值、文本段按字典序」比较，保证 1.10 排在 1.9 之后。

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// 包版本（保留原始字符串，比较时按自然顺序）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Num(&'a str),
    Text(&'a str),
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+|\D+").expect("static regex"))
}

impl Version {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 点/横线分隔的版本段，用于前缀匹配（"1" 匹配 "1.2"，不匹配 "10"）
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(['.', '-']).filter(|s| !s.is_empty())
    }

    /// `prefix` 的每一段都与本版本开头的段相同
    pub fn has_prefix(&self, prefix: &Version) -> bool {
        let mut own = self.segments();
        prefix.segments().all(|p| own.next() == Some(p))
    }

    fn tokens(&self) -> Vec<Token<'_>> {
        token_re()
            .find_iter(&self.0)
            .map(|m| {
                let s = m.as_str();
                if s.as_bytes()[0].is_ascii_digit() {
                    Token::Num(s)
                } else {
                    Token::Text(s)
                }
            })
            .collect()
    }
}

fn cmp_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let (left, right) = (self.tokens(), other.tokens());
        for (a, b) in left.iter().zip(right.iter()) {
            let ord = match (a, b) {
                (Token::Num(a), Token::Num(b)) => cmp_numeric(a, b),
                (Token::Text(a), Token::Text(b)) => a.cmp(b),
                (Token::Num(_), Token::Text(_)) => Ordering::Less,
                (Token::Text(_), Token::Num(_)) => Ordering::Greater,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        left.len()
            .cmp(&right.len())
            // 自然顺序相等时（如 1.0 与 1.00）退回字符串比较，保持与 Eq 一致
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for Version {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_order() {
        let mut versions: Vec<Version> = ["1.10", "1.9", "1.0.0", "2", "1.0.0.beta"]
            .into_iter()
            .map(Version::from)
            .collect();
        versions.sort();
        let sorted: Vec<&str> = versions.iter().map(|v| v.as_str()).collect();
        assert_eq!(sorted, vec!["1.0.0", "1.0.0.beta", "1.9", "1.10", "2"]);
    }

    #[test]
    fn test_prefix_matches_whole_segments() {
        let v = Version::from("1.2.3");
        assert!(v.has_prefix(&Version::from("1")));
        assert!(v.has_prefix(&Version::from("1.2")));
        assert!(!v.has_prefix(&Version::from("1.3")));
        assert!(!Version::from("10").has_prefix(&Version::from("1")));
    }

    #[test]
    fn test_leading_zeros_are_not_equal() {
        assert_ne!(Version::from("1.0"), Version::from("1.00"));
        assert_ne!(
            Version::from("1.0").cmp(&Version::from("1.00")),
            Ordering::Equal
        );
    }
}
