//! 回溯求解器
//!
//! 按请求顺序逐个满足：普通请求选取满足全部约束的最高版本并展开其依赖，失败则回溯到下一个候选；
//! 弱请求只约束版本不拉入包；冲突请求禁止包出现。家族缺失直接返回错误（与 Rez 一致）。

use std::collections::{HashMap, VecDeque};

use crate::rez::{GatewayError, Package, PackageFilter, PackageRequest, RequestKind, VersionRange};

const MAX_STEPS: usize = 10_000;

#[derive(Debug)]
pub(crate) enum SolveOutcome {
    Solved(Vec<Package>),
    Failed(String),
}

#[derive(Clone, Default)]
struct Frame {
    resolved: Vec<Package>,
    ranges: HashMap<String, Vec<VersionRange>>,
    conflicts: HashMap<String, Vec<VersionRange>>,
    queue: VecDeque<PackageRequest>,
}

impl Frame {
    fn get(&self, name: &str) -> Option<&Package> {
        self.resolved.iter().find(|p| p.name == name)
    }

    fn admits(&self, package: &Package) -> bool {
        let in_range = self
            .ranges
            .get(&package.name)
            .map_or(true, |ranges| ranges.iter().all(|r| r.contains(&package.version)));
        let conflicting = self
            .conflicts
            .get(&package.name)
            .map_or(false, |ranges| ranges.iter().any(|r| r.contains(&package.version)));
        in_range && !conflicting
    }
}

struct Solver<'a> {
    families: &'a HashMap<String, Vec<Package>>,
    filter: Option<&'a PackageFilter>,
    searched: &'a [String],
    steps: usize,
    failure: Option<String>,
}

impl<'a> Solver<'a> {
    fn fail(&mut self, reason: String) -> Result<Option<Vec<Package>>, GatewayError> {
        self.failure = Some(reason);
        Ok(None)
    }

    fn run(&mut self, mut frame: Frame) -> Result<Option<Vec<Package>>, GatewayError> {
        while let Some(req) = frame.queue.pop_front() {
            self.steps += 1;
            if self.steps > MAX_STEPS {
                return self.fail(format!("gave up after {MAX_STEPS} solver steps"));
            }

            match req.kind {
                RequestKind::Remove => {}
                RequestKind::Conflict => {
                    if let Some(pkg) = frame.get(&req.name) {
                        if req.range.contains(&pkg.version) {
                            let reason = format!("{} conflicts with {}", pkg.qualified_name(), req);
                            return self.fail(reason);
                        }
                    }
                    frame.conflicts.entry(req.name.clone()).or_default().push(req.range);
                }
                RequestKind::Weak => {
                    if let Some(pkg) = frame.get(&req.name) {
                        if !req.range.contains(&pkg.version) {
                            let reason = format!("{} conflicts with {}", pkg.qualified_name(), req);
                            return self.fail(reason);
                        }
                    }
                    frame.ranges.entry(req.name.clone()).or_default().push(req.range);
                }
                RequestKind::Normal => {
                    if let Some(pkg) = frame.get(&req.name) {
                        if req.range.contains(&pkg.version) {
                            continue;
                        }
                        let reason = format!("{} conflicts with {}", pkg.qualified_name(), req);
                        return self.fail(reason);
                    }
                    frame.ranges.entry(req.name.clone()).or_default().push(req.range.clone());

                    let families = self.families;
                    let family = families.get(&req.name).ok_or_else(|| {
                        GatewayError::PackageFamilyNotFound {
                            name: req.name.clone(),
                            searched: self.searched.to_vec(),
                        }
                    })?;
                    let filter = self.filter;
                    let mut candidates: Vec<&Package> = family
                        .iter()
                        .filter(|p| frame.admits(p))
                        .filter(|p| !filter.map_or(false, |f| f.excludes(p)))
                        .collect();
                    if candidates.is_empty() {
                        return self.fail(format!("no version of {} satisfies {}", req.name, req));
                    }
                    candidates.sort_by(|a, b| b.version.cmp(&a.version));

                    for candidate in candidates {
                        let mut next = frame.clone();
                        next.resolved.push(candidate.clone());
                        next.queue.extend(candidate.requires.iter().cloned());
                        if let Some(resolved) = self.run(next)? {
                            return Ok(Some(resolved));
                        }
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(frame.resolved))
    }
}

pub(crate) fn solve(
    families: &HashMap<String, Vec<Package>>,
    requests: &[PackageRequest],
    filter: Option<&PackageFilter>,
    searched: &[String],
) -> Result<SolveOutcome, GatewayError> {
    let mut solver = Solver {
        families,
        filter,
        searched,
        steps: 0,
        failure: None,
    };
    let frame = Frame {
        queue: requests.iter().cloned().collect(),
        ..Frame::default()
    };
    Ok(match solver.run(frame)? {
        Some(resolved) => SolveOutcome::Solved(resolved),
        None => SolveOutcome::Failed(
            solver
                .failure
                .unwrap_or_else(|| "resolve failed".to_string()),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(packages: Vec<Package>) -> HashMap<String, Vec<Package>> {
        let mut families: HashMap<String, Vec<Package>> = HashMap::new();
        for p in packages {
            families.entry(p.name.clone()).or_default().push(p);
        }
        families
    }

    fn requests(raw: &str) -> Vec<PackageRequest> {
        PackageRequest::parse_list(raw).unwrap()
    }

    fn names(outcome: SolveOutcome) -> Vec<String> {
        match outcome {
            SolveOutcome::Solved(pkgs) => pkgs.iter().map(|p| p.qualified_name()).collect(),
            SolveOutcome::Failed(reason) => panic!("unexpected failure: {reason}"),
        }
    }

    #[test]
    fn test_picks_highest_and_expands_requires() {
        let families = repo(vec![
            Package::new("foo", "1").with_requires(&["lib"]).unwrap(),
            Package::new("lib", "1.9"),
            Package::new("lib", "1.10"),
        ]);
        let out = solve(&families, &requests("foo"), None, &[]).unwrap();
        assert_eq!(names(out), vec!["foo-1", "lib-1.10"]);
    }

    #[test]
    fn test_weak_requirement_is_not_pulled_in() {
        let families = repo(vec![
            Package::new("foo", "1").with_requires(&["~app"]).unwrap(),
            Package::new("app", "1"),
        ]);
        let out = solve(&families, &requests("foo"), None, &[]).unwrap();
        assert_eq!(names(out), vec!["foo-1"]);
    }

    #[test]
    fn test_backtracks_past_conflicting_candidate() {
        let families = repo(vec![
            Package::new("tool", "2").with_requires(&["lib-2"]).unwrap(),
            Package::new("tool", "1").with_requires(&["lib-1"]).unwrap(),
            Package::new("lib", "1"),
            Package::new("lib", "2"),
        ]);
        let out = solve(&families, &requests("lib-1 tool"), None, &[]).unwrap();
        assert_eq!(names(out), vec!["lib-1", "tool-1"]);
    }

    #[test]
    fn test_conflict_fails_with_description() {
        let families = repo(vec![
            Package::new("foo", "1").with_requires(&["anti"]).unwrap(),
            Package::new("anti", "1").with_requires(&["!app"]).unwrap(),
            Package::new("app", "1"),
        ]);
        match solve(&families, &requests("foo==1 app==1"), None, &[]).unwrap() {
            SolveOutcome::Failed(reason) => assert!(reason.contains("app")),
            SolveOutcome::Solved(_) => panic!("expected conflict"),
        }
    }

    #[test]
    fn test_missing_family_is_an_error() {
        let families = repo(vec![Package::new("app", "1")
            .with_requires(&["missing"])
            .unwrap()]);
        let err = solve(&families, &requests("app"), None, &["memory".into()]).unwrap_err();
        assert!(matches!(err, GatewayError::PackageFamilyNotFound { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_filter_hides_excluded_versions() {
        let families = repo(vec![Package::new("app", "1.0.0"), Package::new("app", "1.0.0.beta")]);
        let filter = PackageFilter::parse("*.beta").unwrap();
        let out = solve(&families, &requests("app"), Some(&filter), &[]).unwrap();
        assert_eq!(names(out), vec!["app-1.0.0"]);
    }
}
