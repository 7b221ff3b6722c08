//! Named resource budgets for job admission.
//!
//! The scheduler gates each job on a set of named counting resources ("cpu"
//! and "memory" by convention, plus whatever the build defines). Limits are
//! configured once; the manager tracks what is currently available. Resources
//! without a configured limit are unlimited. The manager is not internally
//! synchronized: it is owned by the scheduler and only touched under the
//! admission lock.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One resource demanded by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub name: String,
    pub count: i64,
}

impl ResourceRequirement {
    #[must_use]
    pub fn new(name: impl Into<String>, count: i64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

/// Configured limits, name → positive count.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    limits: BTreeMap<String, i64>,
}

impl ResourceLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, count: i64) {
        self.limits.insert(name.into(), count);
    }

    /// Configured limit for `name`, or `None` when unlimited.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<i64> {
        self.limits.get(name).copied()
    }
}

impl FromIterator<(String, i64)> for ResourceLimits {
    fn from_iter<T: IntoIterator<Item = (String, i64)>>(iter: T) -> Self {
        Self {
            limits: iter.into_iter().collect(),
        }
    }
}

/// Tracks available counts against the configured limits.
#[derive(Debug)]
pub struct ResourceManager {
    limits: ResourceLimits,
    available: BTreeMap<String, i64>,
}

impl ResourceManager {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        let available = limits.limits.clone();
        Self { limits, available }
    }

    /// Whether every limited requirement can be satisfied right now.
    ///
    /// Requirements with `count <= 0` are ignored, and requirements on
    /// resources without a configured limit are always satisfied.
    #[must_use]
    pub fn can_acquire(&self, requirements: &[ResourceRequirement]) -> bool {
        requirements.iter().all(|req| {
            if req.count <= 0 || self.limits.get(&req.name).is_none() {
                return true;
            }
            self.available
                .get(&req.name)
                .is_some_and(|avail| *avail >= req.count)
        })
    }

    /// Decrement available counts. Callers must have observed a true
    /// [`can_acquire`](Self::can_acquire) under the same lock.
    pub fn acquire(&mut self, requirements: &[ResourceRequirement]) {
        for req in requirements {
            if req.count <= 0 || self.limits.get(&req.name).is_none() {
                continue;
            }
            if let Some(avail) = self.available.get_mut(&req.name) {
                *avail -= req.count;
            }
        }
    }

    /// Increment available counts, clamped to the configured limit so a
    /// mismatched release can never push availability past the budget.
    pub fn release(&mut self, requirements: &[ResourceRequirement]) {
        for req in requirements {
            if req.count <= 0 {
                continue;
            }
            let Some(limit) = self.limits.get(&req.name) else {
                continue;
            };
            if let Some(avail) = self.available.get_mut(&req.name) {
                *avail = (*avail + req.count).min(limit);
            }
        }
    }

    /// Currently available count, or `None` for untracked (unlimited) names.
    #[must_use]
    pub fn available(&self, name: &str) -> Option<i64> {
        self.available.get(name).copied()
    }

    #[must_use]
    pub fn limit(&self, name: &str) -> Option<i64> {
        self.limits.get(name)
    }
}

/// Parse a requirement list of the form
/// `[{"name": "cpu", "count": 2}, …]`.
///
/// Malformed entries are dropped; unparseable input yields an empty list with
/// a diagnostic on the log stream rather than an error, because a bad
/// annotation on one job must not sink the build.
#[must_use]
pub fn parse_resources_json(input: &str) -> Vec<ResourceRequirement> {
    if input.is_empty() {
        return Vec::new();
    }
    let value: serde_json::Value = match serde_json::from_str(input) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, "failed to parse resources JSON");
            return Vec::new();
        }
    };
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let object = item.as_object()?;
            let name = object.get("name")?.as_str()?;
            let count = object.get("count")?.as_i64()?;
            (!name.is_empty() && count > 0).then(|| ResourceRequirement::new(name, count))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_mem_limits() -> ResourceLimits {
        [("cpu".to_string(), 4), ("memory".to_string(), 8)]
            .into_iter()
            .collect()
    }

    #[test]
    fn admission_respects_limits() {
        let mut mgr = ResourceManager::new(cpu_mem_limits());
        let three_cpu = vec![ResourceRequirement::new("cpu", 3)];
        assert!(mgr.can_acquire(&three_cpu));
        mgr.acquire(&three_cpu);

        assert!(!mgr.can_acquire(&[ResourceRequirement::new("cpu", 2)]));
        assert!(mgr.can_acquire(&[
            ResourceRequirement::new("cpu", 1),
            ResourceRequirement::new("memory", 8),
        ]));

        mgr.release(&three_cpu);
        assert_eq!(mgr.available("cpu"), Some(4));
    }

    #[test]
    fn unlimited_resources_always_admit() {
        let mgr = ResourceManager::new(cpu_mem_limits());
        assert!(mgr.can_acquire(&[ResourceRequirement::new("gpu", 1_000_000)]));
        assert_eq!(mgr.available("gpu"), None);
        assert_eq!(mgr.limit("gpu"), None);
    }

    #[test]
    fn nonpositive_requirements_are_ignored() {
        let mut mgr = ResourceManager::new(cpu_mem_limits());
        let junk = vec![
            ResourceRequirement::new("cpu", 0),
            ResourceRequirement::new("memory", -3),
        ];
        assert!(mgr.can_acquire(&junk));
        mgr.acquire(&junk);
        assert_eq!(mgr.available("cpu"), Some(4));
        assert_eq!(mgr.available("memory"), Some(8));
    }

    #[test]
    fn release_clamps_to_the_limit() {
        let mut mgr = ResourceManager::new(cpu_mem_limits());
        mgr.release(&[ResourceRequirement::new("cpu", 100)]);
        assert_eq!(mgr.available("cpu"), Some(4));
    }

    #[test]
    fn availability_stays_within_bounds_across_interleavings() {
        let mut mgr = ResourceManager::new(cpu_mem_limits());
        let one = vec![ResourceRequirement::new("cpu", 1)];
        let two = vec![ResourceRequirement::new("cpu", 2)];
        for _ in 0..50 {
            if mgr.can_acquire(&two) {
                mgr.acquire(&two);
            }
            if mgr.can_acquire(&one) {
                mgr.acquire(&one);
            }
            mgr.release(&two);
            mgr.release(&one);
            let avail = mgr.available("cpu").unwrap();
            assert!((0..=4).contains(&avail), "available {avail} out of range");
        }
    }

    #[test]
    fn parses_well_formed_requirement_lists() {
        let reqs = parse_resources_json(r#"[{"name": "cpu", "count": 2}, {"name": "gpu", "count": 1}]"#);
        assert_eq!(
            reqs,
            vec![
                ResourceRequirement::new("cpu", 2),
                ResourceRequirement::new("gpu", 1),
            ]
        );
    }

    #[test]
    fn drops_malformed_entries() {
        let reqs = parse_resources_json(
            r#"[{"name": "cpu", "count": 2}, {"name": "", "count": 3}, {"count": 1}, {"name": "mem", "count": 0}, 42]"#,
        );
        assert_eq!(reqs, vec![ResourceRequirement::new("cpu", 2)]);
    }

    #[test]
    fn unparseable_input_yields_empty() {
        assert!(parse_resources_json("").is_empty());
        assert!(parse_resources_json("not json").is_empty());
        assert!(parse_resources_json(r#"{"name": "cpu"}"#).is_empty());
    }
}
