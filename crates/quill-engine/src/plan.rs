use std::collections::{HashMap, HashSet};

use quill_core::config::{JobSettings, WorkerRole};

use crate::error::EngineError;

/// One schedulable task: a worker plus the tasks whose output it consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub worker: String,
    pub depends_on: Vec<String>,
    /// The job fails when an essential task fails.
    pub essential: bool,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, worker: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            worker: worker.into(),
            depends_on: Vec::new(),
            essential: true,
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn essential(mut self, essential: bool) -> Self {
        self.essential = essential;
        self
    }
}

/// A validated task DAG.
#[derive(Clone, Debug)]
pub struct JobPlan {
    tasks: Vec<TaskSpec>,
}

impl JobPlan {
    /// Task names must be unique, dependencies must exist, and the graph must
    /// be acyclic.
    pub fn new(tasks: Vec<TaskSpec>) -> Result<Self, EngineError> {
        if tasks.is_empty() {
            return Err(EngineError::Plan("plan has no tasks".into()));
        }

        let mut names = HashSet::new();
        for task in &tasks {
            if !names.insert(task.name.as_str()) {
                return Err(EngineError::Plan(format!("duplicate task '{}'", task.name)));
            }
        }
        for task in &tasks {
            if let Some(dep) = task.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(EngineError::Plan(format!(
                    "task '{}' depends on unknown task '{dep}'",
                    task.name
                )));
            }
            if task.depends_on.contains(&task.name) {
                return Err(EngineError::Plan(format!("task '{}' depends on itself", task.name)));
            }
        }

        let plan = Self { tasks };
        plan.topological_order()?;
        Ok(plan)
    }

    /// Analysis runs first and feeds research and keywords, which then run in
    /// parallel; post waits for both, dialog only for research. Essential
    /// flags come from `settings`.
    pub fn default_plan(settings: &JobSettings) -> Result<Self, EngineError> {
        let spec = |role: WorkerRole, deps: &[&str]| {
            TaskSpec::new(role.as_str(), role.as_str())
                .after(deps)
                .essential(settings.is_essential(role.as_str()))
        };
        Self::new(vec![
            spec(WorkerRole::Analysis, &[]),
            spec(WorkerRole::Research, &["analysis"]),
            spec(WorkerRole::Keywords, &["analysis"]),
            spec(WorkerRole::Post, &["research", "keywords"]),
            spec(WorkerRole::Dialog, &["research"]),
        ])
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Kahn's algorithm; errors on a cycle.
    pub fn topological_order(&self) -> Result<Vec<&str>, EngineError> {
        let mut indegree: HashMap<&str, usize> = self
            .tasks
            .iter()
            .map(|t| (t.name.as_str(), t.depends_on.len()))
            .collect();
        let mut ready: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| t.depends_on.is_empty())
            .map(|t| t.name.as_str())
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(name) = ready.pop() {
            order.push(name);
            for task in self.tasks.iter().filter(|t| t.depends_on.iter().any(|d| d == name)) {
                if let Some(n) = indegree.get_mut(task.name.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push(task.name.as_str());
                    }
                }
            }
        }

        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(EngineError::Plan(format!("dependency cycle among {stuck:?}")));
        }
        Ok(order)
    }
}
