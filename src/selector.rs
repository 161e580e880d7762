// ABOUTME: Selects environments by filter, sort order, or a free-form hint
// ABOUTME: Confidence scores are advisory; callers decide whether to ask before acting

use crate::environment::{Environment, EnvironmentStatus};
use crate::manager::{EnvironmentManager, ManagerError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Confidence attached to a selection. Advisory only: a caller that wants
/// certainty should confirm anything below [`CONFIDENCE_EXACT`].
pub const CONFIDENCE_EXACT: f64 = 1.0;
pub const CONFIDENCE_INTERACTIVE: f64 = 0.8;
pub const CONFIDENCE_SINGLE: f64 = 0.6;
pub const CONFIDENCE_HEURISTIC: f64 = 0.5;

/// Agent names recognized in selection hints, matched against the
/// environment's agent-type tag.
const AGENT_KEYWORDS: &[&str] = &["claude", "cursor", "codex", "aider", "goose", "copilot"];

/// Filters combined with AND: an environment must satisfy every populated
/// field to be selected.
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Substring match on the environment name
    pub name: Option<String>,
    pub status: Option<EnvironmentStatus>,
    pub branch: Option<String>,
    /// Exact match on the agent-type tag
    pub agent: Option<String>,
    pub created_before: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
}

impl SelectionCriteria {
    pub fn matches(&self, env: &Environment) -> bool {
        if let Some(name) = &self.name {
            if !env.name.contains(name.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if env.status != status {
                return false;
            }
        }
        if let Some(branch) = &self.branch {
            if &env.branch != branch {
                return false;
            }
        }
        if let Some(agent) = &self.agent {
            if env.agent_type() != Some(agent.as_str()) {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if env.created_at >= before {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if env.created_at <= after {
                return false;
            }
        }
        true
    }

    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.status.is_none()
            && self.branch.is_none()
            && self.agent.is_none()
            && self.created_before.is_none()
            && self.created_after.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
    Name,
    /// Running first, then creating, stopped, error
    Status,
}

/// A chosen environment plus how sure the selector is about the choice.
#[derive(Debug, Clone)]
pub struct Selection {
    pub environment: Environment,
    pub confidence: f64,
    pub reason: String,
}

/// Chooses environments for commands that accept a filter or a loose hint
/// instead of an exact name.
pub struct EnvironmentSelector {
    manager: Arc<EnvironmentManager>,
}

impl EnvironmentSelector {
    pub fn new(manager: Arc<EnvironmentManager>) -> Self {
        Self { manager }
    }

    /// Environments matching the criteria, in the requested order.
    pub async fn select(
        &self,
        criteria: &SelectionCriteria,
        order: SortOrder,
    ) -> Result<Vec<Environment>, ManagerError> {
        let mut envs: Vec<Environment> = self
            .manager
            .list()
            .await?
            .into_iter()
            .filter(|env| criteria.matches(env))
            .collect();
        sort_environments(&mut envs, order);
        Ok(envs)
    }

    /// Resolve a free-form hint like "newest running claude env" to one
    /// environment.
    ///
    /// An exact name match always wins. Otherwise the hint is tokenized into
    /// status, agent, and ordering terms; unrecognized hints fall back to a
    /// name substring match. `None` means nothing matched at all.
    pub async fn smart_select(&self, hint: &str) -> Result<Option<Selection>, ManagerError> {
        let envs = self.manager.list().await?;
        let hint = hint.trim();

        if let Some(env) = envs.iter().find(|e| e.name == hint) {
            return Ok(Some(Selection {
                environment: env.clone(),
                confidence: CONFIDENCE_EXACT,
                reason: format!("exact name match for '{}'", hint),
            }));
        }

        let (criteria, order) = interpret_hint(hint);
        debug!("Hint '{}' interpreted as {:?} ordered {:?}", hint, criteria, order);

        let mut candidates: Vec<Environment> = envs
            .into_iter()
            .filter(|env| criteria.matches(env))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }
        sort_environments(&mut candidates, order);

        if candidates.len() == 1 {
            let environment = candidates.into_iter().next().unwrap();
            let reason = format!("only environment matching '{}'", hint);
            return Ok(Some(Selection {
                environment,
                confidence: CONFIDENCE_SINGLE,
                reason,
            }));
        }

        let environment = candidates.into_iter().next().unwrap();
        Ok(Some(Selection {
            environment,
            confidence: CONFIDENCE_HEURISTIC,
            reason: format!("best of several environments matching '{}'", hint),
        }))
    }

    /// Resolve a hint by asking the caller to choose among the candidates.
    /// The chooser sees the filtered, sorted list and returns an index.
    pub async fn interactive_select<F>(
        &self,
        criteria: &SelectionCriteria,
        order: SortOrder,
        chooser: F,
    ) -> Result<Option<Selection>, ManagerError>
    where
        F: FnOnce(&[Environment]) -> Option<usize>,
    {
        let candidates = self.select(criteria, order).await?;
        if candidates.is_empty() {
            return Ok(None);
        }
        Ok(chooser(&candidates)
            .and_then(|i| candidates.get(i).cloned())
            .map(|environment| Selection {
                environment,
                confidence: CONFIDENCE_INTERACTIVE,
                reason: "chosen interactively".to_string(),
            }))
    }
}

pub fn sort_environments(envs: &mut [Environment], order: SortOrder) {
    match order {
        SortOrder::Newest => envs.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        SortOrder::Oldest => envs.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        SortOrder::Name => envs.sort_by(|a, b| a.name.cmp(&b.name)),
        SortOrder::Status => envs.sort_by(|a, b| {
            a.status
                .sort_priority()
                .cmp(&b.status.sort_priority())
                .then_with(|| b.created_at.cmp(&a.created_at))
        }),
    }
}

fn interpret_hint(hint: &str) -> (SelectionCriteria, SortOrder) {
    let mut criteria = SelectionCriteria::default();
    let mut order = SortOrder::Newest;

    for token in hint.to_ascii_lowercase().split_whitespace() {
        match token {
            "running" | "stopped" | "creating" | "error" => {
                criteria.status = Some(EnvironmentStatus::parse(token));
            }
            "newest" | "latest" | "recent" => order = SortOrder::Newest,
            "oldest" => order = SortOrder::Oldest,
            _ if AGENT_KEYWORDS.contains(&token) => {
                criteria.agent = Some(token.to_string());
            }
            // Filler words carry no signal
            "env" | "environment" | "the" | "my" | "a" | "an" => {}
            _ => {}
        }
    }

    // Nothing recognized: treat the whole hint as a name fragment
    if criteria.is_empty() {
        criteria.name = Some(hint.to_string());
    }
    (criteria, order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::manager::tests::ScriptedRunner;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    fn env(name: &str, status: EnvironmentStatus, age_hours: i64) -> Environment {
        Environment {
            name: name.to_string(),
            status,
            created_at: Utc::now() - Duration::hours(age_hours),
            ..Default::default()
        }
    }

    fn with_agent(mut env: Environment, agent: &str) -> Environment {
        env.env_vars
            .insert("AGENT_TYPE".to_string(), agent.to_string());
        env
    }

    fn selector_listing(envs: &[Environment]) -> (EnvironmentSelector, Arc<ScriptedRunner>) {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push(0, &serde_json::to_string(envs).unwrap(), "");
        let manager = Arc::new(EnvironmentManager::new(&EngineConfig::default(), runner.clone()));
        (EnvironmentSelector::new(manager), runner)
    }

    #[test]
    fn test_criteria_filters_are_anded() {
        let criteria = SelectionCriteria {
            name: Some("api".to_string()),
            status: Some(EnvironmentStatus::Running),
            ..Default::default()
        };
        let matching = env("api-server", EnvironmentStatus::Running, 1);
        let wrong_status = env("api-server", EnvironmentStatus::Stopped, 1);
        let wrong_name = env("web", EnvironmentStatus::Running, 1);

        assert!(criteria.matches(&matching));
        assert!(!criteria.matches(&wrong_status));
        assert!(!criteria.matches(&wrong_name));
    }

    #[test]
    fn test_agent_criteria_matches_tag() {
        let criteria = SelectionCriteria {
            agent: Some("claude".to_string()),
            ..Default::default()
        };
        let tagged = with_agent(env("a", EnvironmentStatus::Running, 1), "claude");
        let other = with_agent(env("b", EnvironmentStatus::Running, 1), "aider");
        let untagged = env("c", EnvironmentStatus::Running, 1);

        assert!(criteria.matches(&tagged));
        assert!(!criteria.matches(&other));
        assert!(!criteria.matches(&untagged));
    }

    #[test]
    fn test_created_window_criteria() {
        let criteria = SelectionCriteria {
            created_after: Some(Utc::now() - Duration::hours(6)),
            ..Default::default()
        };
        assert!(criteria.matches(&env("recent", EnvironmentStatus::Running, 2)));
        assert!(!criteria.matches(&env("ancient", EnvironmentStatus::Running, 24)));

        let criteria = SelectionCriteria {
            created_before: Some(Utc::now() - Duration::hours(6)),
            ..Default::default()
        };
        assert!(!criteria.matches(&env("recent", EnvironmentStatus::Running, 2)));
        assert!(criteria.matches(&env("ancient", EnvironmentStatus::Running, 24)));
    }

    #[test]
    fn test_sort_orders() {
        let mut envs = vec![
            env("b-old", EnvironmentStatus::Stopped, 10),
            env("a-new", EnvironmentStatus::Error, 1),
            env("c-mid", EnvironmentStatus::Running, 5),
        ];

        sort_environments(&mut envs, SortOrder::Newest);
        assert_eq!(envs[0].name, "a-new");

        sort_environments(&mut envs, SortOrder::Oldest);
        assert_eq!(envs[0].name, "b-old");

        sort_environments(&mut envs, SortOrder::Name);
        assert_eq!(envs[0].name, "a-new");
        assert_eq!(envs[2].name, "c-mid");

        sort_environments(&mut envs, SortOrder::Status);
        assert_eq!(envs[0].name, "c-mid");
        assert_eq!(envs[2].name, "a-new");
    }

    #[tokio::test]
    async fn test_exact_name_match_has_full_confidence() {
        let (selector, _) = selector_listing(&[
            env("feature-auth", EnvironmentStatus::Running, 1),
            env("feature-auth-2", EnvironmentStatus::Running, 2),
        ]);

        let selection = selector.smart_select("feature-auth").await.unwrap().unwrap();
        assert_eq!(selection.environment.name, "feature-auth");
        assert_eq!(selection.confidence, CONFIDENCE_EXACT);
    }

    #[tokio::test]
    async fn test_hint_combines_status_and_agent_filters() {
        let (selector, _) = selector_listing(&[
            with_agent(env("old-claude", EnvironmentStatus::Running, 10), "claude"),
            with_agent(env("new-claude", EnvironmentStatus::Running, 1), "claude"),
            with_agent(env("aider-env", EnvironmentStatus::Running, 1), "aider"),
            with_agent(env("stopped-claude", EnvironmentStatus::Stopped, 1), "claude"),
        ]);

        let selection = selector
            .smart_select("newest running claude environment")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.environment.name, "new-claude");
        assert_eq!(selection.confidence, CONFIDENCE_HEURISTIC);
    }

    #[tokio::test]
    async fn test_single_candidate_gets_higher_confidence() {
        let (selector, _) = selector_listing(&[
            env("only-stopped", EnvironmentStatus::Stopped, 1),
            env("runner", EnvironmentStatus::Running, 1),
        ]);

        let selection = selector.smart_select("stopped").await.unwrap().unwrap();
        assert_eq!(selection.environment.name, "only-stopped");
        assert_eq!(selection.confidence, CONFIDENCE_SINGLE);
    }

    #[tokio::test]
    async fn test_unrecognized_hint_falls_back_to_name_fragment() {
        let (selector, _) = selector_listing(&[
            env("payments-svc", EnvironmentStatus::Running, 1),
            env("web", EnvironmentStatus::Running, 1),
        ]);

        let selection = selector.smart_select("payments").await.unwrap().unwrap();
        assert_eq!(selection.environment.name, "payments-svc");
    }

    #[tokio::test]
    async fn test_no_match_is_none() {
        let (selector, _) = selector_listing(&[env("web", EnvironmentStatus::Running, 1)]);
        assert!(selector.smart_select("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interactive_selection_confidence() {
        let (selector, _) = selector_listing(&[
            env("a", EnvironmentStatus::Running, 1),
            env("b", EnvironmentStatus::Running, 2),
        ]);

        let selection = selector
            .interactive_select(&SelectionCriteria::default(), SortOrder::Name, |envs| {
                assert_eq!(envs.len(), 2);
                Some(1)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selection.environment.name, "b");
        assert_eq!(selection.confidence, CONFIDENCE_INTERACTIVE);
    }

    #[tokio::test]
    async fn test_select_returns_all_matches_sorted() {
        let (selector, _) = selector_listing(&[
            env("b", EnvironmentStatus::Running, 2),
            env("a", EnvironmentStatus::Running, 1),
            env("c", EnvironmentStatus::Stopped, 3),
        ]);

        let criteria = SelectionCriteria {
            status: Some(EnvironmentStatus::Running),
            ..Default::default()
        };
        let envs = selector.select(&criteria, SortOrder::Name).await.unwrap();
        let names: Vec<&str> = envs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
