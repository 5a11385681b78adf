//! KeywordDecomposer - rule-based decomposition without an oracle.
//!
//! Each rule fires when the objective mentions one of its keywords and some
//! roster capability contains one of its capability hints. Writing-style
//! rules depend on every task emitted before them.

use async_trait::async_trait;

use crate::domain::{
    Capability, DEFAULT_PRIORITY, DecomposeError, Decomposition, Edge, TaskSpec,
};
use crate::ports::ObjectiveDecomposer;

#[derive(Debug, Clone)]
pub struct KeywordRule {
    /// Objective keywords (lowercase) that trigger the rule.
    pub keywords: Vec<String>,

    /// Substrings (lowercase) matched against roster capability names.
    pub capability_hints: Vec<String>,

    /// `{objective}` is replaced with the objective text.
    pub template: String,

    pub priority: u8,

    /// Depend on every task emitted by earlier rules.
    pub after_previous: bool,
}

impl KeywordRule {
    pub fn new(keywords: &[&str], capability_hints: &[&str], template: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            capability_hints: capability_hints.iter().map(|h| h.to_lowercase()).collect(),
            template: template.to_string(),
            priority: DEFAULT_PRIORITY,
            after_previous: false,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn after_previous(mut self) -> Self {
        self.after_previous = true;
        self
    }

    fn matches(&self, objective: &str) -> bool {
        self.keywords.iter().any(|k| objective.contains(k.as_str()))
    }

    fn pick<'a>(&self, capabilities: &'a [Capability]) -> Option<&'a Capability> {
        capabilities.iter().find(|c| {
            let name = c.as_str().to_lowercase();
            self.capability_hints.iter().any(|h| name.contains(h.as_str()))
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeywordDecomposer {
    rules: Vec<KeywordRule>,
}

impl Default for KeywordDecomposer {
    fn default() -> Self {
        Self {
            rules: vec![
                KeywordRule::new(
                    &["research", "analyze"],
                    &["research"],
                    "Research and gather information for: {objective}",
                )
                .with_priority(DEFAULT_PRIORITY + 1),
                KeywordRule::new(
                    &["write", "report", "document"],
                    &["writ", "content"],
                    "Write and document findings for: {objective}",
                )
                .after_previous(),
                KeywordRule::new(
                    &["analyze", "evaluate"],
                    &["analyst"],
                    "Analyze and evaluate data for: {objective}",
                )
                .with_priority(DEFAULT_PRIORITY + 1),
            ],
        }
    }
}

impl KeywordDecomposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decomposer with no built-in rules.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: KeywordRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Synchronous core of `decompose`.
    pub fn plan(
        &self,
        objective: &str,
        capabilities: &[Capability],
    ) -> Result<Decomposition, DecomposeError> {
        let text = objective.trim();
        if text.is_empty() {
            return Err(DecomposeError::Rejected("empty objective".into()));
        }
        let Some(first) = capabilities.first() else {
            return Err(DecomposeError::Unavailable(
                "no worker capabilities to assign".into(),
            ));
        };

        let lowered = text.to_lowercase();
        let mut tasks = Vec::new();
        let mut edges = Vec::new();
        for rule in &self.rules {
            if !rule.matches(&lowered) {
                continue;
            }
            let Some(capability) = rule.pick(capabilities) else {
                continue;
            };
            let index = tasks.len();
            if rule.after_previous {
                edges.extend((0..index).map(|from| Edge::new(from, index)));
            }
            tasks.push(
                TaskSpec::new(rule.template.replace("{objective}", text), capability.clone())
                    .with_priority(rule.priority),
            );
        }

        if tasks.is_empty() {
            tasks.push(TaskSpec::new(
                format!("Complete the objective: {text}"),
                first.clone(),
            ));
        }
        Ok(Decomposition::new(tasks, edges))
    }
}

#[async_trait]
impl ObjectiveDecomposer for KeywordDecomposer {
    async fn decompose(
        &self,
        objective: &str,
        capabilities: &[Capability],
    ) -> Result<Decomposition, DecomposeError> {
        self.plan(objective, capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn roster() -> Vec<Capability> {
        ["analyst", "content-writer", "researcher"]
            .into_iter()
            .map(Capability::from)
            .collect()
    }

    #[test]
    fn research_then_write() {
        let d = KeywordDecomposer::new()
            .plan("Research rust schedulers and write a report", &roster())
            .unwrap();

        assert_eq!(d.tasks.len(), 2);
        assert_eq!(d.tasks[0].required_capability.as_str(), "researcher");
        assert_eq!(d.tasks[1].required_capability.as_str(), "content-writer");
        assert_eq!(d.edges, vec![Edge::new(0, 1)]);
    }

    #[test]
    fn analysis_runs_alongside_research() {
        let d = KeywordDecomposer::new()
            .plan("Analyze the market", &roster())
            .unwrap();

        assert_eq!(d.tasks.len(), 2);
        assert_eq!(d.tasks[1].required_capability.as_str(), "analyst");
        assert!(d.edges.is_empty());
    }

    #[rstest]
    #[case::no_keyword("Plan a party")]
    #[case::no_matching_worker("Evaluate options")]
    fn falls_back_to_one_task(#[case] objective: &str) {
        let caps = vec![Capability::from("generalist")];
        let d = KeywordDecomposer::new().plan(objective, &caps).unwrap();

        assert_eq!(d.tasks.len(), 1);
        assert_eq!(d.tasks[0].required_capability.as_str(), "generalist");
    }

    #[test]
    fn empty_roster_is_unavailable() {
        let err = KeywordDecomposer::new().plan("research", &[]).unwrap_err();
        assert!(matches!(err, DecomposeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn custom_rule_is_applied() {
        let decomposer = KeywordDecomposer::empty().with_rule(
            KeywordRule::new(&["deploy"], &["ops"], "Ship {objective}").with_priority(9),
        );
        let d = decomposer
            .decompose("deploy v2", &[Capability::from("ops")])
            .await
            .unwrap();

        assert_eq!(d.tasks[0].description, "Ship deploy v2");
        assert_eq!(d.tasks[0].priority, 9);
    }
}
