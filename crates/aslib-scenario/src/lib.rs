use aslib_arff::{ArffError, Attribute, Cell, Relation};
use aslib_core::{
    atomic_write_bytes, ensure_dir, DataId, Evaluation, FlowId, RunStatus, ScenarioSource, SetupId,
    TaskId,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};

pub const RUNS_FILE: &str = "algorithm_runs.arff";
pub const FEATURE_VALUES_FILE: &str = "feature_values.arff";
pub const FEATURE_RUNSTATUS_FILE: &str = "feature_runstatus.arff";
pub const DESCRIPTION_FILE: &str = "description.txt";

const FEATURE_STEP_ALL: &str = "ALL";

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario request needs at least one task and one setup")]
    EmptyRequest,
    #[error("no evaluation results for tasks: {}", join_ids(.0))]
    NoResultsForTasks(Vec<TaskId>),
    #[error("algorithms absent from the evaluation listing: {}", .0.join(", "))]
    MissingAlgorithms(Vec<String>),
    #[error("evaluations incomplete: {}", join_cells(.0))]
    IncompleteMatrix(Vec<(TaskId, String)>),
    #[error("setups named '{algorithm}' resolve to multiple flows: {}", join_ids(flows))]
    InconsistentFlowMapping {
        algorithm: String,
        flows: Vec<FlowId>,
    },
    #[error("setup listing for algorithm '{algorithm}' is missing setups: {}", join_ids(setups))]
    MissingSetupMetadata {
        algorithm: String,
        setups: Vec<SetupId>,
    },
    #[error(transparent)]
    Fetch(#[from] anyhow::Error),
    #[error("failed to write {}: {reason}", .path.display())]
    Write { path: PathBuf, reason: anyhow::Error },
    #[error(transparent)]
    Arff(#[from] ArffError),
    #[error("failed to serialize scenario description")]
    Yaml(#[from] serde_yaml::Error),
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_cells(cells: &[(TaskId, String)]) -> String {
    cells
        .iter()
        .map(|(task, algorithm)| format!("task {} has no result for '{}'", task, algorithm))
        .collect::<Vec<_>>()
        .join("; ")
}

/// What to build: which tasks, which setups under which algorithm names,
/// which measure, and where the bundle goes.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub tasks: Vec<TaskId>,
    /// Setup id to algorithm name, many-to-one. Setups sharing a name are
    /// treated as one algorithm (re-runs with different seeds, typically).
    pub setups: BTreeMap<SetupId, String>,
    pub measure: String,
    pub scenario_name: String,
    pub output_dir: PathBuf,
    pub require_complete: bool,
    /// Fill value for absent (task, algorithm) cells when completeness is
    /// not required. Defaults to 0, which assumes a maximized measure;
    /// override for measures where lower is better.
    pub missing_value: f64,
}

impl ScenarioSpec {
    pub fn new(
        tasks: Vec<TaskId>,
        setups: BTreeMap<SetupId, String>,
        measure: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        scenario_name: impl Into<String>,
    ) -> Self {
        ScenarioSpec {
            tasks,
            setups,
            measure: measure.into(),
            scenario_name: scenario_name.into(),
            output_dir: output_dir.into(),
            require_complete: false,
            missing_value: 0.0,
        }
    }

    /// Default 1:1 naming for a flat setup list.
    pub fn default_setup_names(setups: &[SetupId]) -> BTreeMap<SetupId, String> {
        setups
            .iter()
            .map(|&id| (id, format!("Setup_{}", id)))
            .collect()
    }

    pub fn scenario_dir(&self) -> PathBuf {
        self.output_dir.join(&self.scenario_name)
    }
}

/// Bidirectional setup index, built eagerly from the requested mapping:
/// id -> algorithm name and name -> all ids collapsed under it.
#[derive(Debug, Clone)]
struct SetupIndex {
    id_to_name: BTreeMap<SetupId, String>,
    name_to_ids: BTreeMap<String, Vec<SetupId>>,
}

impl SetupIndex {
    fn new(mapping: &BTreeMap<SetupId, String>) -> Self {
        let mut name_to_ids: BTreeMap<String, Vec<SetupId>> = BTreeMap::new();
        for (&id, name) in mapping {
            name_to_ids.entry(name.clone()).or_default().push(id);
        }
        SetupIndex {
            id_to_name: mapping.clone(),
            name_to_ids,
        }
    }

    fn name_of(&self, setup: SetupId) -> Option<&str> {
        self.id_to_name.get(&setup).map(String::as_str)
    }

    fn ids_for(&self, name: &str) -> &[SetupId] {
        self.name_to_ids.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.name_to_ids.keys().map(String::as_str)
    }
}

/// Sparse task x algorithm result matrix plus the bookkeeping collected
/// while indexing the evaluation listing.
#[derive(Debug, Default)]
struct Aggregation {
    results: BTreeMap<TaskId, BTreeMap<String, f64>>,
    obtained_tasks: BTreeSet<TaskId>,
    obtained_algorithms: BTreeSet<String>,
    task_data_id: BTreeMap<TaskId, DataId>,
    setup_flow_id: BTreeMap<SetupId, FlowId>,
}

fn aggregate(spec: &ScenarioSpec, index: &SetupIndex, records: &[Evaluation]) -> Aggregation {
    let requested_tasks: BTreeSet<TaskId> = spec.tasks.iter().copied().collect();
    let mut agg = Aggregation::default();
    for record in records {
        let name = match index.name_of(record.setup_id) {
            Some(name) => name,
            None => continue,
        };
        if !requested_tasks.contains(&record.task_id) {
            continue;
        }
        agg.task_data_id.insert(record.task_id, record.data_id);
        agg.setup_flow_id.insert(record.setup_id, record.flow_id);
        agg.obtained_tasks.insert(record.task_id);
        agg.obtained_algorithms.insert(name.to_string());
        // one value per (task, algorithm); later records overwrite
        agg.results
            .entry(record.task_id)
            .or_default()
            .insert(name.to_string(), record.value);
    }
    let flows: BTreeSet<FlowId> = agg.setup_flow_id.values().copied().collect();
    debug!(
        tasks = agg.obtained_tasks.len(),
        algorithms = agg.obtained_algorithms.len(),
        flows = flows.len(),
        "aggregated evaluation listing"
    );
    agg
}

/// Requested-versus-obtained comparison, as data. Enforcement is a separate
/// step so callers can inspect coverage without committing to a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completeness {
    /// Requested tasks with no result for any algorithm. Unusable data,
    /// fatal under every policy.
    pub missing_tasks: Vec<TaskId>,
    /// Requested algorithm names with no result on any task.
    pub missing_algorithms: Vec<String>,
    /// (task, algorithm) cells with no value although both the task and the
    /// algorithm produced results elsewhere.
    pub missing_cells: Vec<(TaskId, String)>,
}

impl Completeness {
    fn assess(spec: &ScenarioSpec, index: &SetupIndex, agg: &Aggregation) -> Self {
        let missing_tasks: Vec<TaskId> = spec
            .tasks
            .iter()
            .copied()
            .filter(|task| !agg.obtained_tasks.contains(task))
            .collect();
        let missing_algorithms: Vec<String> = index
            .names()
            .filter(|name| !agg.obtained_algorithms.contains(*name))
            .map(str::to_string)
            .collect();
        let mut missing_cells = Vec::new();
        for &task in &agg.obtained_tasks {
            for algorithm in &agg.obtained_algorithms {
                let present = agg
                    .results
                    .get(&task)
                    .map(|row| row.contains_key(algorithm))
                    .unwrap_or(false);
                if !present {
                    missing_cells.push((task, algorithm.clone()));
                }
            }
        }
        Completeness {
            missing_tasks,
            missing_algorithms,
            missing_cells,
        }
    }

    pub fn is_full(&self) -> bool {
        self.missing_tasks.is_empty()
            && self.missing_algorithms.is_empty()
            && self.missing_cells.is_empty()
    }

    /// A task absent from the listing has zero results by definition, so it
    /// fails regardless of policy. The remaining gaps only fail in strict
    /// mode; otherwise the serializer fills them with placeholder rows.
    fn enforce(&self, require_complete: bool) -> Result<(), ScenarioError> {
        if !self.missing_tasks.is_empty() {
            return Err(ScenarioError::NoResultsForTasks(self.missing_tasks.clone()));
        }
        if !require_complete {
            return Ok(());
        }
        if !self.missing_algorithms.is_empty() {
            return Err(ScenarioError::MissingAlgorithms(
                self.missing_algorithms.clone(),
            ));
        }
        if !self.missing_cells.is_empty() {
            return Err(ScenarioError::IncompleteMatrix(self.missing_cells.clone()));
        }
        Ok(())
    }
}

/// Per-task meta-features and the feature names common to every obtained
/// task, in first-seen order.
#[derive(Debug, Default)]
struct FeatureMatrix {
    common: Vec<String>,
    per_task: BTreeMap<TaskId, BTreeMap<String, f64>>,
}

fn reconcile_features(
    source: &dyn ScenarioSource,
    agg: &Aggregation,
) -> Result<FeatureMatrix, ScenarioError> {
    let mut cache: BTreeMap<DataId, Vec<(String, f64)>> = BTreeMap::new();
    let mut common: Option<Vec<String>> = None;
    let mut per_task = BTreeMap::new();
    for (&task, &data_id) in &agg.task_data_id {
        if !cache.contains_key(&data_id) {
            let qualities = source.dataset_features(data_id)?;
            cache.insert(data_id, qualities);
        }
        let qualities = &cache[&data_id];
        debug!(task, data_id, features = qualities.len(), "dataset qualities");

        let names: BTreeSet<&str> = qualities.iter().map(|(name, _)| name.as_str()).collect();
        common = Some(match common {
            None => qualities.iter().map(|(name, _)| name.clone()).collect(),
            Some(seed) => seed
                .into_iter()
                .filter(|name| names.contains(name.as_str()))
                .collect(),
        });
        per_task.insert(task, qualities.iter().cloned().collect());
    }
    let common = common.unwrap_or_default();
    info!(features = common.len(), "common feature set computed");
    Ok(FeatureMatrix { common, per_task })
}

#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmEntry {
    pub deterministic: bool,
    pub version: String,
    pub configuration: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureStep {
    pub provides: Vec<String>,
}

/// The scenario descriptor, serialized as YAML to `description.txt`. Field
/// order here is the on-disk key order.
#[derive(Debug, Clone, Serialize)]
pub struct Description {
    pub scenario_id: String,
    pub performance_measures: Vec<String>,
    pub maximize: Vec<bool>,
    pub performance_type: Vec<String>,
    pub algorithm_cutoff_time: u64,
    pub algorithm_cutoff_memory: String,
    pub features_cutoff_time: String,
    pub features_cutoff_memory: String,
    pub algorithms_deterministic: BTreeMap<String, AlgorithmEntry>,
    pub algorithms_stochastic: String,
    pub features_deterministic: Vec<String>,
    pub features_stochastic: String,
    pub number_of_feature_steps: u64,
    pub feature_steps: BTreeMap<String, FeatureStep>,
    pub default_steps: Vec<String>,
}

fn build_description(
    source: &dyn ScenarioSource,
    spec: &ScenarioSpec,
    index: &SetupIndex,
    agg: &Aggregation,
    features: &FeatureMatrix,
) -> Result<Description, ScenarioError> {
    let mut algorithms = BTreeMap::new();
    for name in &agg.obtained_algorithms {
        let ids = index.ids_for(name);
        let listed = source.setup_flows(ids)?;
        let absent: Vec<SetupId> = ids
            .iter()
            .copied()
            .filter(|id| !listed.contains_key(id))
            .collect();
        if !absent.is_empty() {
            return Err(ScenarioError::MissingSetupMetadata {
                algorithm: name.clone(),
                setups: absent,
            });
        }
        let mut flows: Vec<FlowId> = listed.values().copied().collect();
        flows.sort_unstable();
        flows.dedup();
        let flow_id = match flows.as_slice() {
            [flow_id] => *flow_id,
            _ => {
                return Err(ScenarioError::InconsistentFlowMapping {
                    algorithm: name.clone(),
                    flows,
                })
            }
        };
        let flow = source.flow(flow_id)?;
        algorithms.insert(
            name.clone(),
            AlgorithmEntry {
                deterministic: true,
                version: flow.version,
                // hyperparameter settings are not reconstructed from setups
                configuration: String::new(),
            },
        );
    }

    let mut feature_steps = BTreeMap::new();
    feature_steps.insert(
        FEATURE_STEP_ALL.to_string(),
        FeatureStep {
            provides: features.common.clone(),
        },
    );
    Ok(Description {
        scenario_id: format!("OpenML_{}", spec.scenario_name),
        performance_measures: vec![spec.measure.clone()],
        maximize: vec![true],
        performance_type: vec![spec.measure.clone()],
        algorithm_cutoff_time: 0,
        algorithm_cutoff_memory: "?".to_string(),
        features_cutoff_time: "?".to_string(),
        features_cutoff_memory: "?".to_string(),
        algorithms_deterministic: algorithms,
        algorithms_stochastic: String::new(),
        features_deterministic: features.common.clone(),
        features_stochastic: String::new(),
        number_of_feature_steps: 1,
        feature_steps,
        default_steps: vec![FEATURE_STEP_ALL.to_string()],
    })
}

fn runstatus_attribute(name: &str) -> Attribute {
    Attribute::nominal(name, RunStatus::DOMAIN.iter().map(|s| s.as_str()))
}

fn build_run_relation(spec: &ScenarioSpec, agg: &Aggregation) -> Relation {
    let mut relation = Relation::new(
        "ALGORITHM_RUNS",
        vec![
            Attribute::text("instance_id"),
            Attribute::numeric("repetition"),
            Attribute::text("algorithm"),
            Attribute::numeric(spec.measure.clone()),
            runstatus_attribute("runstatus"),
        ],
    );
    for &task in &agg.obtained_tasks {
        for algorithm in &agg.obtained_algorithms {
            let (value, status) = match agg.results.get(&task).and_then(|row| row.get(algorithm)) {
                Some(&value) => (value, RunStatus::Ok),
                None => (spec.missing_value, RunStatus::Other),
            };
            relation.push_row(vec![
                Cell::Int(task),
                Cell::Int(1),
                Cell::Str(algorithm.clone()),
                Cell::Num(value),
                Cell::Str(status.as_str().to_string()),
            ]);
        }
    }
    relation
}

fn build_feature_relations(agg: &Aggregation, features: &FeatureMatrix) -> (Relation, Relation) {
    let mut value_attributes = vec![Attribute::text("instance_id"), Attribute::numeric("repetition")];
    for name in &features.common {
        value_attributes.push(Attribute::numeric(name.clone()));
    }
    let mut values = Relation::new("FEATURES", value_attributes);
    let mut status = Relation::new(
        "FEATURES_RUNSTATUS",
        vec![
            Attribute::text("instance_id"),
            Attribute::numeric("repetition"),
            runstatus_attribute(FEATURE_STEP_ALL),
        ],
    );
    for &task in &agg.obtained_tasks {
        let mut row = vec![Cell::Int(task), Cell::Int(1)];
        for name in &features.common {
            let value = features
                .per_task
                .get(&task)
                .and_then(|qualities| qualities.get(name))
                .copied()
                .unwrap_or(f64::NAN);
            row.push(Cell::Num(value));
        }
        values.push_row(row);
        // a feature fetch failure is fatal upstream, so extraction is ok here
        status.push_row(vec![
            Cell::Int(task),
            Cell::Int(1),
            Cell::Str(RunStatus::Ok.as_str().to_string()),
        ]);
    }
    (values, status)
}

fn write_relation(path: PathBuf, relation: &Relation) -> Result<(), ScenarioError> {
    let text = relation.render()?;
    atomic_write_bytes(&path, text.as_bytes())
        .map_err(|reason| ScenarioError::Write { path, reason })
}

fn write_scenario(
    spec: &ScenarioSpec,
    agg: &Aggregation,
    features: &FeatureMatrix,
    description: &Description,
) -> Result<PathBuf, ScenarioError> {
    let scenario_dir = spec.scenario_dir();
    ensure_dir(&scenario_dir).map_err(|reason| ScenarioError::Write {
        path: scenario_dir.clone(),
        reason,
    })?;

    let runs = build_run_relation(spec, agg);
    write_relation(scenario_dir.join(RUNS_FILE), &runs)?;

    let (values, status) = build_feature_relations(agg, features);
    write_relation(scenario_dir.join(FEATURE_VALUES_FILE), &values)?;
    write_relation(scenario_dir.join(FEATURE_RUNSTATUS_FILE), &status)?;

    let yaml = serde_yaml::to_string(description)?;
    let description_path = scenario_dir.join(DESCRIPTION_FILE);
    atomic_write_bytes(&description_path, yaml.as_bytes()).map_err(|reason| {
        ScenarioError::Write {
            path: description_path,
            reason,
        }
    })?;

    info!(dir = %scenario_dir.display(), "scenario bundle written");
    Ok(scenario_dir)
}

#[derive(Debug, Clone)]
pub struct ScenarioSummary {
    pub scenario_dir: PathBuf,
    pub tasks: usize,
    pub algorithms: usize,
    pub features: usize,
    pub run_rows: usize,
}

/// Build one scenario bundle: list evaluations, aggregate, enforce the
/// completeness policy, reconcile meta-features, then serialize the four
/// artifacts under `<output_dir>/<scenario_name>`.
pub fn generate_scenario(
    source: &dyn ScenarioSource,
    spec: &ScenarioSpec,
) -> Result<ScenarioSummary, ScenarioError> {
    if spec.tasks.is_empty() || spec.setups.is_empty() {
        return Err(ScenarioError::EmptyRequest);
    }
    let index = SetupIndex::new(&spec.setups);
    let setup_ids: Vec<SetupId> = spec.setups.keys().copied().collect();

    let records = source.list_evaluations(&spec.measure, &setup_ids, &spec.tasks)?;
    info!(records = records.len(), measure = %spec.measure, "evaluation listing fetched");
    let agg = aggregate(spec, &index, &records);

    Completeness::assess(spec, &index, &agg).enforce(spec.require_complete)?;

    let features = reconcile_features(source, &agg)?;
    let description = build_description(source, spec, &index, &agg, &features)?;
    let scenario_dir = write_scenario(spec, &agg, &features, &description)?;

    Ok(ScenarioSummary {
        scenario_dir,
        tasks: agg.obtained_tasks.len(),
        algorithms: agg.obtained_algorithms.len(),
        features: features.common.len(),
        run_rows: agg.obtained_tasks.len() * agg.obtained_algorithms.len(),
    })
}

#[derive(Debug, Clone)]
pub struct CoverageSummary {
    pub tasks_requested: usize,
    pub tasks_obtained: usize,
    pub algorithms_requested: usize,
    pub algorithms_obtained: usize,
    pub completeness: Completeness,
}

/// Aggregate and assess without writing anything: what would a scenario
/// build see for this request, and what is missing.
pub fn describe_coverage(
    source: &dyn ScenarioSource,
    spec: &ScenarioSpec,
) -> Result<CoverageSummary, ScenarioError> {
    if spec.tasks.is_empty() || spec.setups.is_empty() {
        return Err(ScenarioError::EmptyRequest);
    }
    let index = SetupIndex::new(&spec.setups);
    let setup_ids: Vec<SetupId> = spec.setups.keys().copied().collect();

    let records = source.list_evaluations(&spec.measure, &setup_ids, &spec.tasks)?;
    let agg = aggregate(spec, &index, &records);
    let completeness = Completeness::assess(spec, &index, &agg);

    Ok(CoverageSummary {
        tasks_requested: spec.tasks.len(),
        tasks_obtained: agg.obtained_tasks.len(),
        algorithms_requested: index.name_to_ids.len(),
        algorithms_obtained: agg.obtained_algorithms.len(),
        completeness,
    })
}
