//! 排除过滤器：glob 规则（如 `*.beta`），匹配 `name-version`

use std::fmt;

use crate::rez::{GatewayError, Package};

#[derive(Debug, Clone, Default)]
pub struct PackageFilter {
    rules: Vec<glob::Pattern>,
}

impl PackageFilter {
    /// 空白或逗号分隔的多条规则；空串得到空过滤器
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let rules = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|rule| {
                glob::Pattern::new(rule).map_err(|e| GatewayError::FilterParse {
                    rule: rule.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn excludes(&self, package: &Package) -> bool {
        let qualified = package.qualified_name();
        self.rules.iter().any(|rule| rule.matches(&qualified))
    }
}

impl fmt::Display for PackageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rules: Vec<&str> = self.rules.iter().map(|r| r.as_str()).collect();
        f.write_str(&rules.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beta_rule() {
        let filter = PackageFilter::parse("*.beta").unwrap();
        assert!(filter.excludes(&Package::new("app_A", "1.0.0.beta")));
        assert!(!filter.excludes(&Package::new("app_A", "1.0.0")));
        assert_eq!(filter.to_string(), "*.beta");
    }

    #[test]
    fn test_empty_and_invalid() {
        assert!(PackageFilter::parse("  ").unwrap().is_empty());
        assert!(matches!(
            PackageFilter::parse("[*"),
            Err(GatewayError::FilterParse { .. })
        ));
    }
}
