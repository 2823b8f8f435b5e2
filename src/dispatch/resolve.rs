//! Binding and version selection for one conversation.

use crate::manifest::current_platform;
use crate::store::{ScopeKind, Skill, SkillBinding, SkillStore, SkillVersion};

use super::ConversationContext;

/// Whether an enabled binding applies to `context`.
pub fn binding_matches(binding: &SkillBinding, context: &ConversationContext) -> bool {
    if !binding.enabled {
        return false;
    }
    let wanted = match binding.scope {
        ScopeKind::System => return true,
        ScopeKind::User => context.user_id.as_deref(),
        ScopeKind::Session => context.session_id.as_deref(),
        ScopeKind::BattleRun => context.battle_run_id.as_deref(),
    };
    wanted.is_some() && binding.scope_id.as_deref() == wanted
}

/// The single binding that governs a skill in `context`.
///
/// Highest scope priority wins (battle run > session > user > system).
/// Within one scope the most recently updated binding wins, and on equal
/// timestamps the last one scanned.
pub fn select_binding<'a>(
    bindings: &'a [SkillBinding],
    context: &ConversationContext,
) -> Option<&'a SkillBinding> {
    let mut chosen: Option<&SkillBinding> = None;
    for binding in bindings.iter().filter(|b| binding_matches(b, context)) {
        let replace = match chosen {
            None => true,
            Some(current) => {
                (binding.scope.priority(), binding.updated_at)
                    >= (current.scope.priority(), current.updated_at)
            }
        };
        if replace {
            chosen = Some(binding);
        }
    }
    chosen
}

/// Why a skill contributes no handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    NoVersion,
    NotRunnable { version: String, status: String },
    UnsupportedPlatform { version: String },
}

/// The version a skill runs with: the binding's pin, else the skill's
/// default, else the most recently activated one. The chosen version must
/// be active, installed and support the current platform.
pub async fn resolve_version(
    store: &SkillStore,
    skill: &Skill,
    binding: Option<&SkillBinding>,
) -> std::result::Result<SkillVersion, Unresolved> {
    let pinned = binding.and_then(|b| b.version_id).or(skill.default_version_id);
    let version = match pinned {
        Some(id) => store.version(id).await,
        None => store.latest_active_version(skill.id).await,
    }
    .ok_or(Unresolved::NoVersion)?;

    if !version.is_runnable() {
        return Err(Unresolved::NotRunnable {
            version: version.version.clone(),
            status: version.status.to_string(),
        });
    }
    if !version.manifest.supports_platform(current_platform()) {
        return Err(Unresolved::UnsupportedPlatform {
            version: version.version.clone(),
        });
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::Value;
    use uuid::Uuid;

    fn binding(scope: ScopeKind, scope_id: Option<&str>, age_secs: i64) -> SkillBinding {
        let at = Utc::now() - Duration::seconds(age_secs);
        SkillBinding {
            id: Uuid::new_v4(),
            skill_id: Uuid::nil(),
            version_id: None,
            scope,
            scope_id: scope_id.map(str::to_string),
            enabled: true,
            policy: Value::Null,
            created_at: at,
            updated_at: at,
        }
    }

    fn context() -> ConversationContext {
        ConversationContext {
            session_id: Some("s1".into()),
            user_id: Some("u1".into()),
            battle_run_id: Some("b1".into()),
            message_id: None,
        }
    }

    #[test]
    fn test_scope_matching() {
        let ctx = context();
        assert!(binding_matches(&binding(ScopeKind::System, None, 0), &ctx));
        assert!(binding_matches(&binding(ScopeKind::User, Some("u1"), 0), &ctx));
        assert!(!binding_matches(&binding(ScopeKind::User, Some("u2"), 0), &ctx));
        assert!(!binding_matches(
            &binding(ScopeKind::Session, Some("s1"), 0),
            &ConversationContext::default()
        ));

        let mut disabled = binding(ScopeKind::System, None, 0);
        disabled.enabled = false;
        assert!(!binding_matches(&disabled, &ctx));
    }

    #[test]
    fn test_highest_priority_scope_wins() {
        let bindings = vec![
            binding(ScopeKind::BattleRun, Some("b1"), 100),
            binding(ScopeKind::System, None, 0),
            binding(ScopeKind::Session, Some("s1"), 0),
            binding(ScopeKind::User, Some("u1"), 0),
        ];
        let chosen = select_binding(&bindings, &context()).unwrap();
        assert_eq!(chosen.scope, ScopeKind::BattleRun);

        let ctx = ConversationContext {
            battle_run_id: None,
            ..context()
        };
        assert_eq!(select_binding(&bindings, &ctx).unwrap().scope, ScopeKind::Session);
        assert!(select_binding(&[], &ctx).is_none());
    }

    #[test]
    fn test_same_scope_prefers_latest_then_last_scanned() {
        let older = binding(ScopeKind::System, None, 60);
        let newer = binding(ScopeKind::System, None, 0);
        let bindings = vec![newer.clone(), older];
        assert_eq!(select_binding(&bindings, &context()).unwrap().id, newer.id);

        let first = binding(ScopeKind::System, None, 0);
        let mut second = first.clone();
        second.id = Uuid::new_v4();
        let bindings = vec![first, second.clone()];
        assert_eq!(select_binding(&bindings, &context()).unwrap().id, second.id);
    }
}
