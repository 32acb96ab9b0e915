use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

pub type TaskId = u64;
pub type SetupId = u64;
pub type FlowId = u64;
pub type DataId = u64;

/// One evaluation record as listed by OpenML: a single measure value for a
/// run of one setup on one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub task_id: TaskId,
    pub setup_id: SetupId,
    pub flow_id: FlowId,
    pub data_id: DataId,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyInfo {
    pub id: u64,
    pub tasks: Vec<TaskId>,
    pub setups: Vec<SetupId>,
}

/// Run status domain shared by the ARFF runstatus columns. This generator
/// only ever emits `Ok` and `Other`; the remaining values are reserved slots
/// in the output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Timeout,
    Memout,
    NotApplicable,
    Crash,
    Other,
}

impl RunStatus {
    pub const DOMAIN: [RunStatus; 6] = [
        RunStatus::Ok,
        RunStatus::Timeout,
        RunStatus::Memout,
        RunStatus::NotApplicable,
        RunStatus::Crash,
        RunStatus::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Timeout => "timeout",
            RunStatus::Memout => "memout",
            RunStatus::NotApplicable => "not_applicable",
            RunStatus::Crash => "crash",
            RunStatus::Other => "other",
        }
    }
}

/// The narrow interface to the evaluation store. The scenario pipeline only
/// ever talks to OpenML through these four lookups; tests substitute an
/// in-memory implementation.
pub trait ScenarioSource {
    /// All recorded values of `measure` for the given setups on the given
    /// tasks. May return fewer records than setups × tasks.
    fn list_evaluations(
        &self,
        measure: &str,
        setups: &[SetupId],
        tasks: &[TaskId],
    ) -> Result<Vec<Evaluation>>;

    /// Meta-feature (quality) name/value pairs of one dataset, in the order
    /// the store reports them.
    fn dataset_features(&self, data_id: DataId) -> Result<Vec<(String, f64)>>;

    /// Flow id per setup id, for the requested setups that the store knows.
    fn setup_flows(&self, setups: &[SetupId]) -> Result<BTreeMap<SetupId, FlowId>>;

    fn flow(&self, flow_id: FlowId) -> Result<Flow>;
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "aslib_core_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn run_status_domain_matches_arff_order() {
        let names: Vec<&str> = RunStatus::DOMAIN.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec!["ok", "timeout", "memout", "not_applicable", "crash", "other"]
        );
    }

    #[test]
    fn atomic_write_creates_parents_and_leaves_no_tmp_files() {
        let root = temp_root("atomic");
        let target = root.join("nested").join("out.txt");
        atomic_write_bytes(&target, b"payload").expect("write");
        assert_eq!(fs::read(&target).expect("read back"), b"payload");

        let leftovers: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "tmp files left behind: {:?}", leftovers);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn atomic_write_overwrites_existing_content() {
        let root = temp_root("overwrite");
        let target = root.join("out.txt");
        atomic_write_bytes(&target, b"first").expect("first write");
        atomic_write_bytes(&target, b"second").expect("second write");
        assert_eq!(fs::read(&target).expect("read back"), b"second");
        let _ = fs::remove_dir_all(root);
    }
}
