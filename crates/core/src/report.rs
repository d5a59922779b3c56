//! Report records produced from result batches.

use serde::{Deserialize, Serialize};

use crate::{CompositeKey, ResourceSpec, RuleStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReportScope {
    Namespaced,
    Cluster,
}

impl ReportScope {
    pub fn kind(&self) -> &'static str {
        match self {
            ReportScope::Namespaced => "ReportChangeRequest",
            ReportScope::Cluster => "ClusterReportChangeRequest",
        }
    }

    fn name_prefix(&self) -> &'static str {
        match self {
            ReportScope::Namespaced => "rcr",
            ReportScope::Cluster => "crcr",
        }
    }
}

/// One (resource, rule) outcome inside a report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportResult {
    pub policy: String,
    pub rule: String,
    #[serde(default)]
    pub message: String,
    pub result: RuleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    pub resources: Vec<ResourceSpec>,
    pub scored: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub pass: u32,
    pub fail: u32,
    pub warn: u32,
    pub error: u32,
    pub skip: u32,
}

impl Summary {
    pub fn record(&mut self, status: RuleStatus) {
        let slot = match status {
            RuleStatus::Pass => &mut self.pass,
            RuleStatus::Fail => &mut self.fail,
            RuleStatus::Warn => &mut self.warn,
            RuleStatus::Error => &mut self.error,
            RuleStatus::Skip => &mut self.skip,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn total(&self) -> u32 {
        self.pass + self.fail + self.warn + self.error + self.skip
    }
}

/// A fully built report change request ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub name: String,
    /// `None` for cluster-scoped records.
    pub namespace: Option<String>,
    pub scope: ReportScope,
    pub policy: String,
    pub results: Vec<ReportResult>,
    pub summary: Summary,
    /// Unix seconds.
    pub generated_at: i64,
}

impl ReportRecord {
    /// Deterministic object name derived from the batch key, so repeated
    /// builds of the same unit of work target the same object.
    pub fn record_name(scope: ReportScope, key: &CompositeKey) -> String {
        format!("{}-{:016x}", scope.name_prefix(), key.fingerprint())
    }
}
