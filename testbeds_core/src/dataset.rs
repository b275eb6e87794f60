//! Task instances and per-task ignore lists, loaded once at startup.

use crate::models::{TaskInstance, TestResult};
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Read-only lookup of task instances by id.
#[derive(Debug, Default, Clone)]
pub struct InstanceStore {
    by_id: HashMap<String, TaskInstance>,
}

impl InstanceStore {
    pub fn new(instances: impl IntoIterator<Item = TaskInstance>) -> Self {
        Self {
            by_id: instances
                .into_iter()
                .map(|i| (i.instance_id.clone(), i))
                .collect(),
        }
    }

    /// Load a JSON array of SWE-bench records.
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path).await?;
        let instances: Vec<TaskInstance> = serde_json::from_slice(&raw)
            .map_err(|e| Error::backend(format!("decode {}", path.display()), e))?;
        tracing::info!(count = instances.len(), "loaded task instances");
        Ok(Self::new(instances))
    }

    pub fn get(&self, instance_id: &str) -> Option<&TaskInstance> {
        self.by_id.get(instance_id)
    }

    pub fn require(&self, instance_id: &str) -> Result<&TaskInstance> {
        self.get(instance_id)
            .ok_or_else(|| Error::NotFound(format!("instance {instance_id}")))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct IgnoredRecord {
    instance_id: String,
    tests: HashMap<String, Vec<IgnoredTest>>,
}

#[derive(Debug, Deserialize)]
struct IgnoredTest {
    method: String,
    status: String,
}

/// Known-flaky tests per task, keyed by `(instance_id, file_path)`.
#[derive(Debug, Default, Clone)]
pub struct IgnoredTests {
    by_instance: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl IgnoredTests {
    /// A missing file yields an empty ignore list.
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("ignored tests file not found; nothing will be ignored");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let records: Vec<IgnoredRecord> = serde_json::from_slice(&raw)
            .map_err(|e| Error::backend(format!("decode {}", path.display()), e))?;
        Ok(Self::from_records(records))
    }

    fn from_records(records: Vec<IgnoredRecord>) -> Self {
        let mut by_instance: HashMap<String, HashMap<String, BTreeSet<String>>> = HashMap::new();
        for record in records {
            let files = by_instance.entry(record.instance_id).or_default();
            for (file_path, tests) in record.tests {
                let methods: BTreeSet<String> = tests
                    .into_iter()
                    .filter(|t| t.status == "FAILED" || t.status == "ERROR")
                    .map(|t| t.method)
                    .collect();
                if !methods.is_empty() {
                    files.entry(file_path).or_default().extend(methods);
                }
            }
        }
        Self { by_instance }
    }

    pub fn insert(&mut self, instance_id: &str, file_path: &str, method: &str) {
        self.by_instance
            .entry(instance_id.to_string())
            .or_default()
            .entry(file_path.to_string())
            .or_default()
            .insert(method.to_string());
    }

    pub fn is_ignored(&self, instance_id: &str, result: &TestResult) -> bool {
        let (Some(file_path), Some(method)) = (&result.file_path, &result.method) else {
            return false;
        };
        self.by_instance
            .get(instance_id)
            .and_then(|files| files.get(file_path))
            .is_some_and(|methods| methods.contains(method))
    }

    /// Drop ignored results, returning how many were removed.
    pub fn filter(&self, instance_id: &str, results: &mut Vec<TestResult>) -> usize {
        let before = results.len();
        results.retain(|r| !self.is_ignored(instance_id, r));
        before - results.len()
    }
}
