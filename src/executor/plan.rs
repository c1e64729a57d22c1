//! Translates a planner's flat step list into a concrete task DAG: new ids
//! minted in order, dependency references resolved, cycles and unknown
//! agent types rejected before anything is persisted.

use crate::error::{OrchestratorError, Result};
use crate::store::model::Task;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    Index(usize),
    Id(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    pub agent_type: String,
    pub description: String,
    #[serde(default)]
    pub use_tdd: bool,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
}

/// Mints task ids for each step (via `mint_id`), resolves dependency
/// references, rejects unknown agent types and dependency cycles, and
/// returns tasks in the order they were declared. Does not persist
/// anything — the caller decides what to do with the result.
pub fn translate_plan(
    job_id: &str,
    steps: &[PlanStep],
    known_agent_types: &HashSet<String>,
    mint_id: impl Fn() -> String,
) -> Result<Vec<Task>> {
    if steps.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = steps.iter().map(|_| mint_id()).collect();
    let id_by_index: HashMap<usize, String> = ids.iter().enumerate().map(|(i, id)| (i, id.clone())).collect();
    let known_ids: HashSet<String> = ids.iter().cloned().collect();

    for step in steps {
        if step.agent_type != "planner" && !known_agent_types.contains(&step.agent_type) {
            return Err(OrchestratorError::PlanUnknownAgent(step.agent_type.clone()));
        }
    }

    let mut tasks = Vec::with_capacity(steps.len());
    let mut dependency_sets: Vec<HashSet<String>> = Vec::with_capacity(steps.len());

    for (i, step) in steps.iter().enumerate() {
        let mut deps = HashSet::new();
        for dep in &step.dependencies {
            let resolved = match dep {
                DependencyRef::Index(idx) => id_by_index
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| OrchestratorError::PlanCycle(format!("dependency index {idx} out of range"))),
                DependencyRef::Id(id) => {
                    if known_ids.contains(id) {
                        Ok(id.clone())
                    } else {
                        Err(OrchestratorError::PlanCycle(format!(
                            "dependency id {id} does not reference a task in this plan"
                        )))
                    }
                }
            }?;
            deps.insert(resolved);
        }
        dependency_sets.push(deps.clone());

        let mut task = Task::new(
            ids[i].clone(),
            job_id.to_string(),
            step.agent_type.clone(),
            step.description.clone(),
            deps,
        );
        task.use_tdd = step.use_tdd;
        tasks.push(task);
    }

    assert_acyclic(&ids, &dependency_sets)?;
    Ok(tasks)
}

fn assert_acyclic(ids: &[String], dependency_sets: &[HashSet<String>]) -> Result<()> {
    let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (i, deps) in dependency_sets.iter().enumerate() {
        let task_id = ids[i].as_str();
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(task_id);
            *indegree.get_mut(task_id).unwrap() += 1;
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0usize;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(children) = dependents.get(id) {
            for child in children {
                let deg = indegree.get_mut(child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(child);
                }
            }
        }
    }

    if visited != ids.len() {
        return Err(OrchestratorError::PlanCycle(
            "plan contains a dependency cycle".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> impl FnMut() -> String {
        let mut n = 0;
        move || {
            n += 1;
            format!("t{n}")
        }
    }

    #[test]
    fn resolves_index_dependencies_in_order() {
        let known = ["coding".to_string()].into_iter().collect();
        let steps = vec![
            PlanStep {
                agent_type: "coding".to_string(),
                description: "write models".to_string(),
                use_tdd: false,
                dependencies: vec![],
            },
            PlanStep {
                agent_type: "coding".to_string(),
                description: "write api".to_string(),
                use_tdd: false,
                dependencies: vec![DependencyRef::Index(0)],
            },
        ];
        let mut mint = ids();
        let tasks = translate_plan("j1", &steps, &known, &mut mint).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[1].dependencies.contains(&tasks[0].id));
    }

    #[test]
    fn rejects_unknown_agent_type() {
        let known = ["coding".to_string()].into_iter().collect();
        let steps = vec![PlanStep {
            agent_type: "mystery".to_string(),
            description: "do something".to_string(),
            use_tdd: false,
            dependencies: vec![],
        }];
        let mut mint = ids();
        let result = translate_plan("j1", &steps, &known, &mut mint);
        assert!(matches!(result, Err(OrchestratorError::PlanUnknownAgent(_))));
    }

    #[test]
    fn rejects_cycles() {
        let known = ["coding".to_string()].into_iter().collect();
        let steps = vec![
            PlanStep {
                agent_type: "coding".to_string(),
                description: "a".to_string(),
                use_tdd: false,
                dependencies: vec![DependencyRef::Index(1)],
            },
            PlanStep {
                agent_type: "coding".to_string(),
                description: "b".to_string(),
                use_tdd: false,
                dependencies: vec![DependencyRef::Index(0)],
            },
        ];
        let mut mint = ids();
        let result = translate_plan("j1", &steps, &known, &mut mint);
        assert!(matches!(result, Err(OrchestratorError::PlanCycle(_))));
    }
}
