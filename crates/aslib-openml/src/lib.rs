use anyhow::{anyhow, Context, Result};
use aslib_core::{DataId, Evaluation, Flow, FlowId, ScenarioSource, SetupId, StudyInfo, TaskId};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const DEFAULT_API_URL: &str = "https://www.openml.org/api/v1/json";

/// Blocking client for the OpenML JSON API v1. Only the lookups the
/// scenario pipeline needs are implemented; every response is decoded by a
/// pure `parse_*` function so decoding is testable without a server.
pub struct OpenmlClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl OpenmlClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("aslib-openml/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;
        Ok(OpenmlClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn study(&self, study_id: u64) -> Result<StudyInfo> {
        let doc = self
            .get_json(&format!("study/{}", study_id))?
            .ok_or_else(|| anyhow!("study {} not found", study_id))?;
        parse_study(&doc)
    }

    /// GET a path under the API root. `Ok(None)` means the server answered
    /// 412, which OpenML uses for list queries with an empty result set.
    fn get_json(&self, path: &str) -> Result<Option<Value>> {
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "openml request");
        let response = self
            .http
            .get(&url)
            .send()
            .with_context(|| format!("openml request failed: {}", url))?;
        let status = response.status();
        if status.as_u16() == 412 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(anyhow!("openml request failed: status {} for {}", status, url));
        }
        let doc = response
            .json::<Value>()
            .with_context(|| format!("openml response was not json: {}", url))?;
        Ok(Some(doc))
    }
}

impl ScenarioSource for OpenmlClient {
    fn list_evaluations(
        &self,
        measure: &str,
        setups: &[SetupId],
        tasks: &[TaskId],
    ) -> Result<Vec<Evaluation>> {
        let path = format!(
            "evaluation/list/function/{}/task/{}/setup/{}",
            measure,
            join_ids(tasks),
            join_ids(setups)
        );
        match self.get_json(&path)? {
            Some(doc) => parse_evaluations(&doc),
            None => Ok(Vec::new()),
        }
    }

    fn dataset_features(&self, data_id: DataId) -> Result<Vec<(String, f64)>> {
        let doc = self
            .get_json(&format!("data/qualities/{}", data_id))?
            .ok_or_else(|| anyhow!("no qualities for dataset {}", data_id))?;
        parse_qualities(&doc)
    }

    fn setup_flows(&self, setups: &[SetupId]) -> Result<BTreeMap<SetupId, FlowId>> {
        let path = format!("setup/list/setup/{}", join_ids(setups));
        match self.get_json(&path)? {
            Some(doc) => parse_setup_flows(&doc),
            None => Ok(BTreeMap::new()),
        }
    }

    fn flow(&self, flow_id: FlowId) -> Result<Flow> {
        let doc = self
            .get_json(&format!("flow/{}", flow_id))?
            .ok_or_else(|| anyhow!("flow {} not found", flow_id))?;
        parse_flow(&doc)
    }
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

// OpenML serializes most numbers as json strings; accept both.
fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_u64(record: &Value, field: &str) -> Result<u64> {
    record
        .get(field)
        .and_then(lenient_u64)
        .ok_or_else(|| anyhow!("evaluation record missing numeric field '{}': {}", field, record))
}

pub fn parse_evaluations(doc: &Value) -> Result<Vec<Evaluation>> {
    let records = doc
        .pointer("/evaluations/evaluation")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("malformed evaluation listing: missing /evaluations/evaluation"))?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let task_id = field_u64(record, "task_id")?;
        let setup_id = field_u64(record, "setup_id")?;
        let flow_id = field_u64(record, "flow_id")?;
        let data_id = field_u64(record, "data_id")?;
        let value = record.get("value").and_then(lenient_f64);
        match value {
            Some(value) => out.push(Evaluation {
                task_id,
                setup_id,
                flow_id,
                data_id,
                value,
            }),
            None => {
                warn!(task_id, setup_id, "evaluation record has no value, skipping");
            }
        }
    }
    Ok(out)
}

/// Quality values that do not parse as numbers (empty strings for qualities
/// the server could not compute) decode as NaN so the quality still counts
/// toward the feature intersection.
pub fn parse_qualities(doc: &Value) -> Result<Vec<(String, f64)>> {
    let records = doc
        .pointer("/data_qualities/quality")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("malformed qualities document: missing /data_qualities/quality"))?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let name = record
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("quality record missing name: {}", record))?;
        let value = record
            .get("value")
            .and_then(lenient_f64)
            .unwrap_or(f64::NAN);
        out.push((name.to_string(), value));
    }
    Ok(out)
}

pub fn parse_setup_flows(doc: &Value) -> Result<BTreeMap<SetupId, FlowId>> {
    let records = doc
        .pointer("/setups/setup")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("malformed setup listing: missing /setups/setup"))?;
    let mut out = BTreeMap::new();
    for record in records {
        let setup_id = field_u64(record, "setup_id")?;
        let flow_id = field_u64(record, "flow_id")?;
        out.insert(setup_id, flow_id);
    }
    Ok(out)
}

pub fn parse_flow(doc: &Value) -> Result<Flow> {
    let name = doc
        .pointer("/flow/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("malformed flow document: missing /flow/name"))?
        .to_string();
    let version = match doc.pointer("/flow/version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(anyhow!("malformed flow document: missing /flow/version")),
    };
    Ok(Flow { name, version })
}

pub fn parse_study(doc: &Value) -> Result<StudyInfo> {
    let study = doc
        .pointer("/study")
        .ok_or_else(|| anyhow!("malformed study document: missing /study"))?;
    let id = field_u64(study, "id")?;
    let tasks = id_list(study, "/tasks/task_id")?;
    let setups = id_list(study, "/setups/setup_id")?;
    Ok(StudyInfo { id, tasks, setups })
}

fn id_list(study: &Value, pointer: &str) -> Result<Vec<u64>> {
    let entries = study
        .pointer(pointer)
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("malformed study document: missing {}", pointer))?;
    entries
        .iter()
        .map(|v| lenient_u64(v).ok_or_else(|| anyhow!("non-numeric id in study list: {}", v)))
        .collect()
}
