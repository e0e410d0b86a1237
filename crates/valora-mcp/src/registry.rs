//! Agent registry and capability index
//!
//! Agents are indexed three ways: by id, by kind, and by each declared
//! capability. All mutation goes through the router's own methods.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use valora_core::{AgentId, AgentKind};

use valora_agents::Agent;

#[derive(Debug, Default)]
pub struct Registry {
    agents: HashMap<AgentId, Arc<Agent>>,
    by_kind: HashMap<AgentKind, HashSet<AgentId>>,
    by_capability: HashMap<String, HashSet<AgentId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an agent under every index, returning a replaced agent with
    /// the same id if there was one
    pub fn insert(&mut self, agent: Arc<Agent>) -> Option<Arc<Agent>> {
        let id = agent.id().clone();
        let replaced = self.remove(&id);
        self.by_kind.entry(agent.kind()).or_default().insert(id.clone());
        for capability in agent.capabilities() {
            self.by_capability
                .entry(capability.clone())
                .or_default()
                .insert(id.clone());
        }
        self.agents.insert(id, agent);
        replaced
    }

    /// Remove an agent from every index
    pub fn remove(&mut self, id: &str) -> Option<Arc<Agent>> {
        let agent = self.agents.remove(id)?;
        if let Some(ids) = self.by_kind.get_mut(&agent.kind()) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_kind.remove(&agent.kind());
            }
        }
        for capability in agent.capabilities() {
            if let Some(ids) = self.by_capability.get_mut(capability) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_capability.remove(capability);
                }
            }
        }
        Some(agent)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<Agent>> {
        self.agents.values()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn ids_of_kind(&self, kind: AgentKind) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .by_kind
            .get(&kind)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Capability -> sorted agent ids, for the `get_capability_map` command
    pub fn capability_map(&self) -> HashMap<String, Vec<AgentId>> {
        self.by_capability
            .iter()
            .map(|(capability, ids)| {
                let mut ids: Vec<AgentId> = ids.iter().cloned().collect();
                ids.sort();
                (capability.clone(), ids)
            })
            .collect()
    }

    /// Pick the best helper for a set of required capabilities.
    ///
    /// Every agent except `exclude` is scored as
    /// `|declared ∩ required| / |required|`; zero-match agents are dropped.
    /// An empty requirement set makes all other agents equally eligible.
    /// Ties break on agent id so routing stays deterministic. Routing is
    /// advisory only; the chosen agent's own behavior decides whether to
    /// actually help.
    pub fn best_helper(&self, required: &[String], exclude: &str) -> Option<(Arc<Agent>, f64)> {
        let required: HashSet<&str> = required.iter().map(String::as_str).collect();

        let mut candidates: Vec<(&Arc<Agent>, f64)> = self
            .agents
            .values()
            .filter(|agent| agent.id() != exclude)
            .filter_map(|agent| {
                if required.is_empty() {
                    return Some((agent, 1.0));
                }
                let matched = required
                    .iter()
                    .filter(|c| agent.has_capability(c))
                    .count();
                if matched == 0 {
                    None
                } else {
                    Some((agent, matched as f64 / required.len() as f64))
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id().cmp(b.0.id()))
        });

        candidates
            .into_iter()
            .next()
            .map(|(agent, score)| (agent.clone(), score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use valora_core::BusError;

    struct Noop;

    #[async_trait]
    impl valora_agents::Behavior for Noop {
        async fn process_request(&self, payload: &Value) -> Result<Value, BusError> {
            Ok(payload.clone())
        }
    }

    fn agent(id: &str, kind: AgentKind, caps: &[&str]) -> Arc<Agent> {
        Arc::new(Agent::new(
            id,
            kind,
            caps.iter().map(|c| c.to_string()).collect(),
            Box::new(Noop),
        ))
    }

    #[test]
    fn test_insert_and_indexes() {
        let mut registry = Registry::new();
        registry.insert(agent("v", AgentKind::Valuation, &["income_analysis"]));
        registry.insert(agent("d", AgentKind::DataQuality, &["data_validation"]));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("v"));
        assert_eq!(registry.ids_of_kind(AgentKind::Valuation), vec!["v"]);
        assert_eq!(
            registry.capability_map()["data_validation"],
            vec!["d".to_string()]
        );
    }

    #[test]
    fn test_replacement_on_duplicate_id() {
        let mut registry = Registry::new();
        registry.insert(agent("v", AgentKind::Valuation, &["income_analysis"]));
        let replaced = registry.insert(agent("v", AgentKind::Valuation, &["comparables"]));

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        // The old capability index entry is gone
        assert!(!registry.capability_map().contains_key("income_analysis"));
        assert!(registry.capability_map().contains_key("comparables"));
    }

    #[test]
    fn test_remove_cleans_every_index() {
        let mut registry = Registry::new();
        registry.insert(agent("v", AgentKind::Valuation, &["income_analysis"]));
        assert!(registry.remove("v").is_some());
        assert!(registry.is_empty());
        assert!(registry.capability_map().is_empty());
        assert!(registry.ids_of_kind(AgentKind::Valuation).is_empty());
        assert!(registry.remove("v").is_none());
    }

    #[test]
    fn test_best_helper_prefers_higher_coverage() {
        let mut registry = Registry::new();
        registry.insert(agent("a", AgentKind::Utility, &["x"]));
        registry.insert(agent("b", AgentKind::Utility, &["x", "y"]));

        let (best, score) = registry
            .best_helper(&["x".into(), "y".into()], "requester")
            .unwrap();
        assert_eq!(best.id(), "b");
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_best_helper_excludes_requester_and_zero_matches() {
        let mut registry = Registry::new();
        registry.insert(agent("a", AgentKind::Utility, &["x"]));
        registry.insert(agent("b", AgentKind::Utility, &["z"]));

        // `a` is the requester, `b` matches nothing
        assert!(registry.best_helper(&["x".into()], "a").is_none());
    }

    #[test]
    fn test_best_helper_empty_requirements_treats_all_as_eligible() {
        let mut registry = Registry::new();
        registry.insert(agent("b", AgentKind::Utility, &[]));
        registry.insert(agent("a", AgentKind::Utility, &["x"]));

        let (best, score) = registry.best_helper(&[], "requester").unwrap();
        // Equal scores tie-break on id
        assert_eq!(best.id(), "a");
        assert!((score - 1.0).abs() < f64::EPSILON);
    }
}
