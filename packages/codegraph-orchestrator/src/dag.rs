use crate::config::error::validate_identifier;
use crate::config::ConfigError;
use crate::dependency_graph::INDEX_STAGE;
use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

/// Checkpoint address: `{stage}:{repository}:{snapshot}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub stage: StageId,
    pub repo_id: String,
    pub snapshot_id: String,
}

impl CacheKey {
    pub fn new(stage: StageId, repo_id: impl Into<String>, snapshot_id: impl Into<String>) -> Self {
        Self {
            stage,
            repo_id: repo_id.into(),
            snapshot_id: snapshot_id.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(stage), Some(repo), Some(snapshot), None)
                if !stage.is_empty() && !repo.is_empty() && !snapshot.is_empty() =>
            {
                Ok(Self::new(StageId::new(stage), repo, snapshot))
            }
            _ => Err(OrchestratorError::parse(format!("Invalid cache key: {}", s))),
        }
    }

    /// Retention lineage: all snapshots of one stage in one repository.
    pub fn lineage(&self) -> (StageId, String) {
        (self.stage.clone(), self.repo_id.clone())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.stage, self.repo_id, self.snapshot_id)
    }
}

/// Cache key manager for one (repository, snapshot) pair
#[derive(Debug, Clone)]
pub struct CacheKeyManager {
    repo_id: String,
    snapshot_id: String,
}

impl CacheKeyManager {
    pub fn new(repo_id: String, snapshot_id: String) -> Self {
        Self {
            repo_id,
            snapshot_id,
        }
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    /// Get cache key for a stage
    pub fn key_for_stage(&self, stage: &StageId) -> CacheKey {
        CacheKey::new(stage.clone(), &self.repo_id, &self.snapshot_id)
    }

    /// Same stage, another snapshot of the same repository
    pub fn key_for_snapshot(&self, stage: &StageId, snapshot_id: &str) -> CacheKey {
        CacheKey::new(stage.clone(), &self.repo_id, snapshot_id)
    }
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Stage node in DAG
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageNode {
    pub id: StageId,
    pub name: String,
    #[serde(default, rename = "depends_on")]
    pub dependencies: Vec<StageId>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl StageNode {
    pub fn new(
        id: StageId,
        name: impl Into<String>,
        dependencies: Vec<StageId>,
        optional: bool,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            dependencies,
            parallel_group: None,
            optional,
            timeout_ms,
        }
    }

    pub fn with_parallel_group(mut self, group: impl Into<String>) -> Self {
        self.parallel_group = Some(group.into());
        self
    }
}

/// Ordered phases; every stage of a phase depends only on earlier phases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    phases: Vec<Vec<StageId>>,
}

impl ExecutionPlan {
    pub fn phases(&self) -> &[Vec<StageId>] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageId> {
        self.phases.iter().flatten()
    }

    /// Index of the phase containing `stage`
    pub fn phase_of(&self, stage: &StageId) -> Option<usize> {
        self.phases.iter().position(|phase| phase.contains(stage))
    }
}

/// Pipeline DAG with topological sort
#[derive(Debug, Clone)]
pub struct PipelineDAG {
    stages: HashMap<StageId, StageNode>,
    plan: ExecutionPlan,
}

impl PipelineDAG {
    /// Create a new DAG from stage definitions
    pub fn new(stages: Vec<StageNode>) -> Result<Self> {
        let mut stage_map = HashMap::new();
        for mut stage in stages {
            validate_identifier("stage id", stage.id.as_str())?;
            if stage.id == INDEX_STAGE {
                return Err(ConfigError::InvalidIdentifier {
                    field: "stage id".to_string(),
                    value: stage.id.to_string(),
                    reason: "reserved for dependency index checkpoints".to_string(),
                }
                .into());
            }
            stage.dependencies.sort();
            stage.dependencies.dedup();
            let id = stage.id.clone();
            if stage_map.insert(id.clone(), stage).is_some() {
                return Err(ConfigError::DuplicateStage(id.to_string()).into());
            }
        }

        // Validate dependencies exist
        for stage in stage_map.values() {
            for dep in &stage.dependencies {
                if !stage_map.contains_key(dep) {
                    return Err(OrchestratorError::MissingDependency(format!(
                        "Stage {} depends on non-existent stage {}",
                        stage.id, dep
                    )));
                }
            }
        }

        let plan = Self::topological_sort(&stage_map)?;

        Ok(Self {
            stages: stage_map,
            plan,
        })
    }

    /// Default pipeline (ir ∥ lexical → chunks → vector)
    pub fn default_pipeline() -> Result<Self> {
        Self::new(Self::default_stages())
    }

    pub fn default_stages() -> Vec<StageNode> {
        vec![
            StageNode::new(StageId::IR, "IR Generation", vec![], false, 300_000)
                .with_parallel_group("foundation"),
            StageNode::new(
                StageId::LEXICAL,
                "Lexical Indexing",
                vec![],
                false,
                300_000,
            )
            .with_parallel_group("foundation"),
            StageNode::new(
                StageId::CHUNKS,
                "Chunk Building",
                vec![StageId::IR],
                false,
                180_000,
            ),
            StageNode::new(
                StageId::VECTOR,
                "Vector Indexing",
                vec![StageId::CHUNKS],
                true,
                600_000,
            ),
        ]
    }

    /// Kahn's algorithm, grouping each zero in-degree wave into one phase
    fn topological_sort(stages: &HashMap<StageId, StageNode>) -> Result<ExecutionPlan> {
        let mut in_degree: HashMap<&StageId, usize> = stages
            .values()
            .map(|stage| (&stage.id, stage.dependencies.len()))
            .collect();

        let mut dependents: HashMap<&StageId, Vec<&StageId>> = HashMap::new();
        for stage in stages.values() {
            for dep in &stage.dependencies {
                dependents.entry(dep).or_default().push(&stage.id);
            }
        }

        let mut phases = Vec::new();
        let mut processed = 0;

        while processed < stages.len() {
            let mut ready: Vec<StageId> = in_degree
                .iter()
                .filter(|(_, &degree)| degree == 0)
                .map(|(id, _)| (*id).clone())
                .collect();

            if ready.is_empty() {
                let unresolved: HashSet<&StageId> = in_degree.keys().copied().collect();
                return Err(OrchestratorError::DagCycleDetected {
                    stages: Self::cycle_members(stages, unresolved),
                });
            }

            ready.sort();

            for stage_id in &ready {
                in_degree.remove(stage_id);
                processed += 1;

                for dependent in dependents.get(stage_id).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                    }
                }
            }

            phases.push(ready);
        }

        Ok(ExecutionPlan { phases })
    }

    /// Strip stages that merely hang off a cycle, leaving the ones on it.
    fn cycle_members(
        stages: &HashMap<StageId, StageNode>,
        mut unresolved: HashSet<&StageId>,
    ) -> Vec<String> {
        loop {
            let depended_on: HashSet<&StageId> = unresolved
                .iter()
                .flat_map(|id| stages[*id].dependencies.iter())
                .filter(|dep| unresolved.contains(dep))
                .collect();

            let before = unresolved.len();
            unresolved.retain(|id| depended_on.contains(id));
            if unresolved.len() == before {
                break;
            }
        }

        let mut names: Vec<String> = unresolved.into_iter().map(|id| id.to_string()).collect();
        names.sort();
        names
    }

    /// Get the execution plan
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Get execution order
    pub fn execution_order(&self) -> &[Vec<StageId>] {
        self.plan.phases()
    }

    /// Get stage node
    pub fn get_stage(&self, id: &StageId) -> Option<&StageNode> {
        self.stages.get(id)
    }

    pub fn stage_ids(&self) -> impl Iterator<Item = &StageId> {
        self.stages.keys()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Get execution plan as string (for logging)
    pub fn execution_plan(&self) -> String {
        self.plan
            .phases()
            .iter()
            .enumerate()
            .map(|(i, group)| {
                let stage_names: Vec<_> = group
                    .iter()
                    .map(|id| self.stages[id].name.as_str())
                    .collect();

                if group.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, stage_names.join(" ∥ "))
                } else {
                    format!("Phase {}: {}", i + 1, stage_names[0])
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Get required cache keys for a stage
    pub fn required_cache_keys(
        &self,
        stage_id: &StageId,
        cache_mgr: &CacheKeyManager,
    ) -> Vec<CacheKey> {
        let stage = match self.stages.get(stage_id) {
            Some(s) => s,
            None => return vec![],
        };

        stage
            .dependencies
            .iter()
            .map(|dep_id| cache_mgr.key_for_stage(dep_id))
            .collect()
    }

    /// Every stage that transitively depends on `stage_id`
    pub fn dependents_closure(&self, stage_id: &StageId) -> BTreeSet<StageId> {
        let mut reverse: BTreeMap<&StageId, Vec<&StageId>> = BTreeMap::new();
        for stage in self.stages.values() {
            for dep in &stage.dependencies {
                reverse.entry(dep).or_default().push(&stage.id);
            }
        }

        let mut closure = BTreeSet::new();
        let mut queue = VecDeque::from([stage_id]);
        while let Some(current) = queue.pop_front() {
            for dependent in reverse.get(current).into_iter().flatten() {
                if closure.insert((*dependent).clone()) {
                    queue.push_back(*dependent);
                }
            }
        }
        closure
    }
}
