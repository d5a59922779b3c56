//! Policy report core types.
//!
//! - Evaluation results grouped into coalescible [`ResultBatch`]es
//! - The [`CompositeKey`] that decides which batches are "the same" unit of work
//! - Report records handed to the delivery side
//! - Narrow collaborator traits ([`PolicyCatalog`], [`Builder`], [`Creator`])

#![forbid(unsafe_code)]

pub mod key;
pub mod report;

pub use key::{build_key, fnv1a64, CompositeKey, KEY_SEPARATOR};
pub use report::{ReportRecord, ReportResult, ReportScope, Summary};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;

/// Outcome of a single rule evaluation, as reported in policy reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Pass,
    Fail,
    Warn,
    Error,
    Skip,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Pass => "pass",
            RuleStatus::Fail => "fail",
            RuleStatus::Warn => "warn",
            RuleStatus::Error => "error",
            RuleStatus::Skip => "skip",
        }
    }
}

/// Identity of an evaluated Kubernetes resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    /// Empty for cluster-scoped resources.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

impl ResourceSpec {
    /// `Kind/Name` for cluster-scoped resources, `Kind/Namespace/Name` otherwise.
    pub fn key(&self) -> String {
        if self.namespace.is_empty() {
            format!("{}/{}", self.kind, self.name)
        } else {
            format!("{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ViolatedRule {
    pub name: String,
    #[serde(rename = "type", default)]
    pub rule_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: RuleStatus,
}

/// A resource identity paired with the rules evaluated against it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvaluationResult {
    pub resource: ResourceSpec,
    #[serde(default)]
    pub rules: SmallVec<[ViolatedRule; 4]>,
}

/// Policy application results for all matched resources of one policy.
/// `namespace` is empty when the batch targets cluster-wide resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultBatch {
    pub policy_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub results: Vec<EvaluationResult>,
}

impl ResultBatch {
    pub fn key(&self) -> CompositeKey {
        build_key(self)
    }

    /// Total number of rule outcomes across all results.
    pub fn rule_count(&self) -> usize {
        self.results.iter().map(|r| r.rules.len()).sum()
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

/// Typed replacement for comparing the `results` of two reports.
pub fn results_changed<T: PartialEq>(old: &[T], new: &[T]) -> bool {
    old.len() != new.len() || old != new
}

/// Minimal view of a policy definition as needed to build a report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyMeta {
    pub name: String,
    /// `None` for cluster policies.
    pub namespace: Option<String>,
    pub annotations: SmallVec<[(String, String); 4]>,
}

impl PolicyMeta {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Read-only lookup of live policy definitions. A missing policy is `Ok(None)`.
#[async_trait]
pub trait PolicyCatalog: Send + Sync {
    async fn cluster_policy(&self, name: &str) -> anyhow::Result<Option<PolicyMeta>>;
    async fn policy(&self, namespace: &str, name: &str) -> anyhow::Result<Option<PolicyMeta>>;
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("policy lookup failed for {policy}: {source}")]
    Catalog {
        policy: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid result batch: {0}")]
    InvalidBatch(String),
}

/// Turns a batch into a persistable record.
///
/// `Ok(None)` means there is nothing to report (e.g. the policy was deleted
/// after evaluation); an error makes the batch eligible for retry.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, batch: &ResultBatch) -> Result<Option<ReportRecord>, BuildError>;
}

/// Durable delivery of built records. `add` must not block; `run` owns the
/// delivery loop and its own network retries until `shutdown` fires.
#[async_trait]
pub trait Creator: Send + Sync {
    fn add(&self, record: ReportRecord);
    async fn run(&self, shutdown: CancellationToken);
}

pub mod prelude {
    pub use super::{
        build_key, results_changed, BuildError, Builder, CompositeKey, Creator, EvaluationResult,
        PolicyCatalog, PolicyMeta, ReportRecord, ReportResult, ReportScope, ResourceSpec, ResultBatch,
        RuleStatus, Summary, ViolatedRule,
    };
}
