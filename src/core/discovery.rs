//! 后台发现：Profile 枚举与应用解析
//!
//! 这里的函数都在 spawn_blocking 中运行：只读网关、计算结果，不触碰 SessionState。
//! 需要写进控制台的消息收集在 `notes` 里，由控制循环统一输出。

use std::sync::Arc;

use crate::core::error::ControlError;
use crate::core::events::LogLevel;
use crate::core::hooks::ApplicationHooks;
use crate::core::session::{AppContext, AppMetadata, AppPackage, Application, ProfileFamily};
use crate::core::NameSource;
use crate::rez::{Package, PackageFilter, PackageRequest, ResolverGateway, VersionRange};

pub type Notes = Vec<(LogLevel, String)>;

#[derive(Debug)]
pub struct ProfileDiscovery {
    /// 按名称首次出现的顺序
    pub families: Vec<ProfileFamily>,
    /// 最后发现的名称
    pub default: Option<String>,
    pub notes: Notes,
}

/// 列出名称并为每个名称查找全部版本；没有任何版本的名称得到 Broken 占位
pub fn discover_profiles(
    gateway: &dyn ResolverGateway,
    root: &NameSource,
    filter: &PackageFilter,
) -> ProfileDiscovery {
    let mut notes = Notes::new();
    let names = match root.try_list() {
        Ok(names) => names,
        Err(e) => {
            tracing::debug!(error = %e, "profile listing failed");
            notes.push((LogLevel::Error, format!("Could not find profiles in {root}")));
            Vec::new()
        }
    };

    let mut families: Vec<ProfileFamily> = Vec::new();
    let mut default = None;
    for name in names {
        let packages = match gateway.find(&name, &VersionRange::Any, Some(filter)) {
            Ok(packages) => packages,
            Err(e) => {
                notes.push((LogLevel::Error, e.to_string()));
                Vec::new()
            }
        };
        if packages.is_empty() {
            notes.push((LogLevel::Warning, format!("No package found for profile '{name}'")));
        }
        let family = ProfileFamily::new(name.clone(), packages);
        match families.iter_mut().find(|f| f.name == name) {
            Some(existing) => *existing = family,
            None => families.push(family),
        }
        default = Some(name);
    }

    ProfileDiscovery {
        families,
        default,
        notes,
    }
}

/// 应用枚举的偏好输入
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filter: PackageFilter,
    pub patch: Vec<PackageRequest>,
    pub patch_with_filter: bool,
    pub show_all_apps: bool,
    pub show_hidden_apps: bool,
    /// showAllApps 时使用的应用列表
    pub applications: Option<NameSource>,
    /// 当前（或上次）选中的应用请求
    pub current_app: Option<String>,
}

#[derive(Debug)]
pub struct AppListing {
    /// 所有应用的 Context（包括隐藏的），按枚举顺序
    pub contexts: Vec<(String, AppContext)>,
    /// 可见应用
    pub apps: Vec<Application>,
    /// 补丁改变了当前应用的版本时，新的请求
    pub startup_application: Option<String>,
    pub notes: Notes,
}

struct Candidate {
    request: String,
    name: String,
    context: AppContext,
    versions: Vec<Package>,
}

fn app_requests(
    hooks: &dyn ApplicationHooks,
    profile: &Package,
    options: &ListOptions,
    notes: &mut Notes,
) -> Vec<PackageRequest> {
    let mut requests = Vec::new();
    if options.show_all_apps {
        match &options.applications {
            None => notes.push((
                LogLevel::Warning,
                "Requires an [applications] listing to show all apps".to_string(),
            )),
            Some(source) => match source.try_list() {
                Ok(names) => {
                    for name in names {
                        match name.parse::<PackageRequest>() {
                            Ok(req) => requests.push(req.to_normal()),
                            Err(e) => notes.push((LogLevel::Error, e.to_string())),
                        }
                    }
                }
                Err(e) => notes.push((
                    LogLevel::Warning,
                    format!("Could not show all apps, missing applications listing ({e})"),
                )),
            },
        }
    }
    if requests.is_empty() {
        requests = hooks.applications_from_package(profile);
    }
    requests
}

fn resolve_app(
    gateway: &dyn ResolverGateway,
    profile: &Package,
    request: &PackageRequest,
    options: &ListOptions,
    notes: &mut Notes,
) -> Candidate {
    let stripped = request.to_normal().to_string();

    let mut versions = match gateway.find(&request.name, &request.range, Some(&options.filter)) {
        Ok(found) => found,
        Err(e) => {
            notes.push((LogLevel::Error, e.to_string()));
            Vec::new()
        }
    };
    versions.sort_by(|a, b| a.version.cmp(&b.version));

    let Some(latest) = versions.last().cloned() else {
        let reason = format!(
            "No package matched for request '{stripped}', may have been excluded by package filter."
        );
        notes.push((LogLevel::Error, reason.clone()));
        return Candidate {
            request: stripped.clone(),
            name: request.name.clone(),
            context: AppContext::Broken {
                request: stripped,
                reason,
            },
            versions,
        };
    };

    let joint = vec![profile.as_request(), latest.as_request()];
    let line = joint.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(" ");
    notes.push((LogLevel::Debug, format!("Resolving request: {line}")));

    let broken = |mode: &str, line: String, e: crate::rez::GatewayError, notes: &mut Notes| {
        notes.push((LogLevel::Error, format!("{mode} failed: {e}")));
        AppContext::Broken {
            request: line,
            reason: e.to_string(),
        }
    };

    let mut context = match gateway.resolve(&joint, Some(&options.filter)) {
        Ok(ctx) => AppContext::Resolved(ctx),
        Err(e) => broken("Resolve", line, e, notes),
    };

    if !options.patch.is_empty() {
        if let Some(ctx) = context.resolved().cloned() {
            let patched = ctx.patched_request(&options.patch);
            let line = patched.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(" ");
            notes.push((LogLevel::Debug, format!("Patching request: {line}")));
            let filter = options.patch_with_filter.then_some(&options.filter);
            context = match gateway.resolve(&patched, filter) {
                Ok(ctx) => AppContext::Resolved(ctx),
                Err(e) => broken("Patch", line, e, notes),
            };
        }
    }

    // 补丁可能改变应用自身的版本，请求键随之变化
    let resolved_request = context
        .resolved()
        .and_then(|ctx| ctx.resolved_packages().iter().find(|p| p.name == latest.name))
        .map(Package::request_string);

    Candidate {
        request: resolved_request.unwrap_or_else(|| latest.request_string()),
        name: latest.name.clone(),
        context,
        versions,
    }
}

fn associate(candidate: &Candidate, notes: &mut Notes) -> AppPackage {
    if let AppContext::Broken { .. } = candidate.context {
        return AppPackage::Broken {
            request: candidate.request.clone(),
        };
    }
    if let Some(reason) = candidate.context.failure_description() {
        notes.push((
            LogLevel::Error,
            format!(
                "Context for '{}' had no resolved packages, failure reason as follow:\n===\n{}\n===\nIf above description isn't clear, try graphing it.",
                candidate.request, reason
            ),
        ));
        return AppPackage::Broken {
            request: candidate.request.clone(),
        };
    }
    match candidate
        .context
        .resolved_packages()
        .iter()
        .find(|p| p.request_string() == candidate.request)
    {
        Some(package) => AppPackage::Found(package.clone()),
        None => {
            notes.push((
                LogLevel::Warning,
                format!(
                    "Couldn't find a corresponding package for application {}. This can happen if an application is patched away, using the ^-operator.",
                    candidate.request
                ),
            ));
            AppPackage::Broken {
                request: candidate.request.clone(),
            }
        }
    }
}

/// 解析 Profile 本身，再逐个解析其应用
///
/// Profile 家族缺失返回网关错误，Profile 求解失败返回 ProfileNotResolved；
/// 单个应用的失败只记录为 Broken，不影响其它应用。
pub fn list_apps(
    gateway: &dyn ResolverGateway,
    hooks: &dyn ApplicationHooks,
    profile: &Package,
    options: &ListOptions,
) -> Result<AppListing, ControlError> {
    let mut notes = Notes::new();

    let started = std::time::Instant::now();
    let profile_request = vec![profile.as_request()];
    notes.push((
        LogLevel::Debug,
        format!("Resolving request: {}", profile.request_string()),
    ));
    let profile_context = gateway.resolve(&profile_request, Some(&options.filter))?;
    if !profile_context.success() {
        return Err(ControlError::ProfileNotResolved {
            profile: profile.request_string(),
            description: profile_context
                .failure_description()
                .unwrap_or("unknown failure")
                .to_string(),
        });
    }
    notes.push((
        LogLevel::Debug,
        format!(
            "Resolved profile context in {:.2} seconds",
            started.elapsed().as_secs_f64()
        ),
    ));

    let current_name = options
        .current_app
        .as_deref()
        .map(|r| r.split("==").next().unwrap_or(r).to_string());

    let started = std::time::Instant::now();
    let mut startup_application = None;
    let mut candidates = Vec::new();
    for request in app_requests(hooks, profile, options, &mut notes) {
        let candidate = resolve_app(gateway, profile, &request, options, &mut notes);
        if candidate.context.success() && current_name.as_deref() == Some(candidate.name.as_str()) {
            startup_application = Some(candidate.request.clone());
        }
        candidates.push(candidate);
    }
    notes.push((
        LogLevel::Debug,
        format!(
            "Resolved all contexts in {:.2} seconds",
            started.elapsed().as_secs_f64()
        ),
    ));

    let mut apps = Vec::new();
    let mut contexts = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let package = associate(&candidate, &mut notes);
        let (metadata, tools, detached) = match package.package() {
            Some(pkg) => {
                let detached = pkg
                    .data
                    .get("detached")
                    .and_then(crate::store::truthy)
                    .unwrap_or(false);
                let tools = if pkg.tools.is_empty() {
                    vec![candidate.name.clone()]
                } else {
                    pkg.tools.clone()
                };
                (hooks.metadata_from_package(pkg), tools, detached)
            }
            None => (
                AppMetadata {
                    label: candidate.name.clone(),
                    ..AppMetadata::default()
                },
                vec![candidate.name.clone()],
                false,
            ),
        };

        if !metadata.hidden || options.show_hidden_apps {
            apps.push(Application {
                request: candidate.request.clone(),
                name: candidate.name.clone(),
                package,
                metadata,
                tools,
                detached,
                versions: candidate.versions.iter().map(|p| p.version.clone()).collect(),
            });
        }
        contexts.push((candidate.request, candidate.context));
    }

    Ok(AppListing {
        contexts,
        apps,
        startup_application,
        notes,
    })
}

/// 供控制器在后台线程中调用的拥有型参数
pub(crate) struct ListAppsJob {
    pub gateway: Arc<dyn ResolverGateway>,
    pub hooks: Arc<dyn ApplicationHooks>,
    pub profile: Package,
    pub options: ListOptions,
}

impl ListAppsJob {
    pub fn run(self) -> Result<AppListing, ControlError> {
        list_apps(
            self.gateway.as_ref(),
            self.hooks.as_ref(),
            &self.profile,
            &self.options,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hooks::DefaultHooks;
    use crate::rez::{GatewayError, PackageRepository};
    use serde_json::json;

    fn repo() -> PackageRepository {
        PackageRepository::from_packages(vec![
            Package::new("foo", "1.0.0")
                .with_requires(&["~app_A", "~app_B", "~app_C", "~ghost"])
                .unwrap(),
            Package::new("app_A", "1.0.0"),
            Package::new("app_A", "1.0.0.beta"),
            Package::new("app_B", "1.0.0").with_requires(&["missing_dep"]).unwrap(),
            Package::new("app_C", "1")
                .with_data("hidden", json!(true))
                .with_data("label", json!("Hidden C")),
        ])
    }

    fn options() -> ListOptions {
        ListOptions {
            filter: PackageFilter::parse("*.beta").unwrap(),
            ..ListOptions::default()
        }
    }

    fn profile(repo: &PackageRepository) -> Package {
        repo.find("foo", &VersionRange::Any, None).unwrap().remove(0)
    }

    #[test]
    fn test_discover_profiles_marks_missing_as_broken() {
        let repo = repo();
        let root = NameSource::from(&["foo", "nope"][..]);
        let found = discover_profiles(&repo, &root, &PackageFilter::default());
        assert_eq!(found.families.len(), 2);
        assert!(!found.families[0].is_broken());
        assert!(found.families[1].is_broken());
        assert_eq!(found.default.as_deref(), Some("nope"));
    }

    #[test]
    fn test_failing_listing_yields_no_profiles() {
        let repo = repo();
        let root = NameSource::callback(|| anyhow::bail!("offline"));
        let found = discover_profiles(&repo, &root, &PackageFilter::default());
        assert!(found.families.is_empty());
        assert!(found.default.is_none());
        assert!(found
            .notes
            .iter()
            .any(|(_, m)| m.starts_with("Could not find profiles in")));
    }

    #[test]
    fn test_failures_are_isolated_per_application() {
        let repo = repo();
        let listing = list_apps(&repo, &DefaultHooks, &profile(&repo), &options()).unwrap();

        let keys: Vec<&str> = listing.contexts.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["app_A==1.0.0", "app_B==1.0.0", "app_C==1", "ghost"]);

        let (_, app_a) = &listing.contexts[0];
        assert!(app_a.success());
        let (_, app_b) = &listing.contexts[1];
        assert!(!app_b.success());
        assert!(app_b.failure_description().is_some_and(|d| d.contains("missing_dep")));
        let (_, ghost) = &listing.contexts[3];
        assert!(!ghost.success());

        // 隐藏应用照常解析，只是不出现在列表里
        assert!(listing.contexts[2].1.success());
        let visible: Vec<&str> = listing.apps.iter().map(|a| a.request.as_str()).collect();
        assert_eq!(visible, vec!["app_A==1.0.0", "app_B==1.0.0", "ghost"]);
        assert!(listing.apps[1].is_broken());
        assert_eq!(listing.apps[0].tools, vec!["app_A"]);
    }

    #[test]
    fn test_show_hidden_apps() {
        let repo = repo();
        let opts = ListOptions {
            show_hidden_apps: true,
            ..options()
        };
        let listing = list_apps(&repo, &DefaultHooks, &profile(&repo), &opts).unwrap();
        let app_c = listing.apps.iter().find(|a| a.name == "app_C").unwrap();
        assert_eq!(app_c.metadata.label, "Hidden C");
    }

    #[test]
    fn test_patch_remaps_current_application() {
        let repo = PackageRepository::from_packages(vec![
            Package::new("foo", "1").with_requires(&["~app_B"]).unwrap(),
            Package::new("app_B", "1"),
            Package::new("app_B", "2"),
        ]);
        let opts = ListOptions {
            patch: PackageRequest::parse_list("app_B==1").unwrap(),
            current_app: Some("app_B==2".into()),
            ..ListOptions::default()
        };
        let foo = repo.find("foo", &VersionRange::Any, None).unwrap().remove(0);
        let listing = list_apps(&repo, &DefaultHooks, &foo, &opts).unwrap();
        assert_eq!(listing.apps[0].request, "app_B==1");
        assert_eq!(listing.startup_application.as_deref(), Some("app_B==1"));
        assert_eq!(listing.apps[0].versions.len(), 2);
    }

    #[test]
    fn test_show_all_apps_falls_back_to_profile() {
        let repo = repo();
        let opts = ListOptions {
            show_all_apps: true,
            ..options()
        };
        let listing = list_apps(&repo, &DefaultHooks, &profile(&repo), &opts).unwrap();
        assert_eq!(listing.contexts.len(), 4);
        assert!(listing
            .notes
            .iter()
            .any(|(level, _)| *level == LogLevel::Warning));

        let opts = ListOptions {
            show_all_apps: true,
            applications: Some(NameSource::from(&["app_C"][..])),
            ..options()
        };
        let listing = list_apps(&repo, &DefaultHooks, &profile(&repo), &opts).unwrap();
        assert_eq!(listing.contexts.len(), 1);
    }

    #[test]
    fn test_profile_level_failures() {
        let repo = PackageRepository::from_packages(vec![
            Package::new("broken", "1").with_requires(&["nowhere"]).unwrap(),
            Package::new("torn", "1").with_requires(&["lib-1", "dep"]).unwrap(),
            Package::new("dep", "1").with_requires(&["lib-2"]).unwrap(),
            Package::new("lib", "1"),
            Package::new("lib", "2"),
        ]);
        let broken = repo.find("broken", &VersionRange::Any, None).unwrap().remove(0);
        let err = list_apps(&repo, &DefaultHooks, &broken, &ListOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            ControlError::Gateway(GatewayError::PackageFamilyNotFound { .. })
        ));

        let torn = repo.find("torn", &VersionRange::Any, None).unwrap().remove(0);
        let err = list_apps(&repo, &DefaultHooks, &torn, &ListOptions::default()).unwrap_err();
        assert!(matches!(err, ControlError::ProfileNotResolved { .. }));
    }
}
