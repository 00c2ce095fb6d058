//! 错误分类
//!
//! 所有后台操作的错误都在控制循环这一处汇总：按错误种类决定迁移到哪个阶段、给用户什么消息，
//! 以及是否算作「已处理」。未处理的错误进入 errored，并把完整信息写进控制台。

use crate::core::error::ControlError;
use crate::core::state::PhaseEvent;
use crate::rez::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub event: PhaseEvent,
    pub message: String,
    pub handled: bool,
}

impl Classification {
    fn handled(event: PhaseEvent, message: String) -> Self {
        Self {
            event,
            message,
            handled: true,
        }
    }

    fn unhandled(message: String) -> Self {
        Self {
            event: PhaseEvent::ToErrored,
            message,
            handled: false,
        }
    }
}

/// `package_paths` 用于缺失包的提示
pub fn classify(err: &ControlError, package_paths: &[String]) -> Classification {
    match err {
        ControlError::ProfileMissing { name, searched } => {
            let searched = if searched.is_empty() {
                package_paths
            } else {
                searched.as_slice()
            };
            Classification::handled(
                PhaseEvent::ToNoApps,
                ControlError::not_found_message(name, searched),
            )
        }
        ControlError::ProfileNotResolved { .. } => {
            Classification::handled(PhaseEvent::ToNotResolved, err.to_string())
        }
        ControlError::Gateway(gateway) => match gateway {
            GatewayError::PackageFamilyNotFound { name, searched } => Classification::handled(
                PhaseEvent::ToPkgNotFound,
                ControlError::not_found_message(name, searched),
            ),
            GatewayError::PackageNotFound { request } => Classification::handled(
                PhaseEvent::ToPkgNotFound,
                ControlError::not_found_message(request, package_paths),
            ),
            GatewayError::ResolvedContext(_) => {
                Classification::handled(PhaseEvent::ToReady, err.to_string())
            }
            GatewayError::RequestParse(_) | GatewayError::FilterParse { .. } => {
                Classification::handled(PhaseEvent::ToNoApps, err.to_string())
            }
            _ => Classification::unhandled(err.to_string()),
        },
        _ => Classification::unhandled(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> Vec<String> {
        vec!["/packages/int".into(), "/packages/ext".into()]
    }

    #[test]
    fn test_missing_profile_goes_to_noapps_with_paths() {
        let c = classify(
            &ControlError::ProfileMissing {
                name: "ghost".into(),
                searched: vec![],
            },
            &paths(),
        );
        assert_eq!(c.event, PhaseEvent::ToNoApps);
        assert!(c.handled);
        assert!(c.message.contains("'ghost'"));
        assert!(c.message.contains("/packages/ext"));
    }

    #[test]
    fn test_gateway_kinds() {
        let family = ControlError::from(GatewayError::PackageFamilyNotFound {
            name: "occoc".into(),
            searched: vec!["C:\\".into()],
        });
        let c = classify(&family, &paths());
        assert_eq!(c.event, PhaseEvent::ToPkgNotFound);
        assert!(c.message.contains("C:\\"));

        let failed = ControlError::from(GatewayError::ResolvedContext("get_environ".into()));
        assert_eq!(classify(&failed, &paths()).event, PhaseEvent::ToReady);

        let parse = ControlError::from(GatewayError::RequestParse("a b".into()));
        assert_eq!(classify(&parse, &paths()).event, PhaseEvent::ToNoApps);
    }

    #[test]
    fn test_execution_errors_are_unhandled() {
        for err in [
            ControlError::from(GatewayError::UndefinedVariable {
                package: "app-1".into(),
                variable: "X".into(),
            }),
            ControlError::from(GatewayError::CommandExecution("boom".into())),
            ControlError::WorkerPanicked("oops".into()),
        ] {
            let c = classify(&err, &paths());
            assert_eq!(c.event, PhaseEvent::ToErrored);
            assert!(!c.handled);
            assert_eq!(c.message, err.to_string());
        }
    }

    #[test]
    fn test_unresolvable_profile() {
        let c = classify(
            &ControlError::ProfileNotResolved {
                profile: "foo==1".into(),
                description: "conflict".into(),
            },
            &paths(),
        );
        assert_eq!(c.event, PhaseEvent::ToNotResolved);
        assert!(c.handled);
    }
}
