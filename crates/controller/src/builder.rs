//! Default [`Builder`]: turns a result batch into a report change request
//! using live policy definitions from a [`PolicyCatalog`].

use async_trait::async_trait;
use polrep_core::{
    BuildError, Builder, PolicyCatalog, PolicyMeta, ReportRecord, ReportResult, ReportScope, ResultBatch, Summary,
};
use rustc_hash::FxHashMap;
use tracing::debug;

pub const ANNOTATION_CATEGORY: &str = "policies.kyverno.io/category";
pub const ANNOTATION_SEVERITY: &str = "policies.kyverno.io/severity";

/// Builds records for batches whose policy still exists.
///
/// Policy names of the form `namespace/name` refer to namespaced policies,
/// anything else to a cluster policy.
pub struct CatalogBuilder<C> {
    catalog: C,
}

impl<C: PolicyCatalog> CatalogBuilder<C> {
    pub fn new(catalog: C) -> Self { Self { catalog } }

    async fn lookup(&self, policy_name: &str) -> Result<Option<PolicyMeta>, BuildError> {
        let found = match policy_name.split_once('/') {
            Some((ns, name)) => self.catalog.policy(ns, name).await,
            None => self.catalog.cluster_policy(policy_name).await,
        };
        found.map_err(|source| BuildError::Catalog { policy: policy_name.to_string(), source })
    }
}

#[async_trait]
impl<C: PolicyCatalog> Builder for CatalogBuilder<C> {
    async fn build(&self, batch: &ResultBatch) -> Result<Option<ReportRecord>, BuildError> {
        if batch.policy_name.is_empty() {
            return Err(BuildError::InvalidBatch("empty policy name".into()));
        }
        if batch.rule_count() == 0 {
            return Ok(None);
        }
        let Some(policy) = self.lookup(&batch.policy_name).await? else {
            debug!(policy = %batch.policy_name, "policy no longer exists; skipping report");
            return Ok(None);
        };

        let scope = if batch.is_cluster_scoped() { ReportScope::Cluster } else { ReportScope::Namespaced };
        let category = policy.annotation(ANNOTATION_CATEGORY).map(str::to_string);
        let severity = policy.annotation(ANNOTATION_SEVERITY).map(str::to_string);

        let mut summary = Summary::default();
        let mut results = Vec::with_capacity(batch.rule_count());
        for evaluated in &batch.results {
            for rule in &evaluated.rules {
                summary.record(rule.status);
                results.push(ReportResult {
                    policy: batch.policy_name.clone(),
                    rule: rule.name.clone(),
                    message: rule.message.clone(),
                    result: rule.status,
                    category: category.clone(),
                    severity: severity.clone(),
                    resources: vec![evaluated.resource.clone()],
                    scored: true,
                });
            }
        }

        Ok(Some(ReportRecord {
            name: ReportRecord::record_name(scope, &batch.key()),
            namespace: (!batch.is_cluster_scoped()).then(|| batch.namespace.clone()),
            scope,
            policy: batch.policy_name.clone(),
            results,
            summary,
            generated_at: chrono::Utc::now().timestamp(),
        }))
    }
}

/// In-memory catalog, keyed by `name` (cluster) or `namespace/name`.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    policies: FxHashMap<String, PolicyMeta>,
    permissive: bool,
}

impl StaticCatalog {
    pub fn new() -> Self { Self::default() }

    /// Every lookup succeeds with a bare policy; used for dry runs.
    pub fn permissive() -> Self { Self { policies: FxHashMap::default(), permissive: true } }

    pub fn insert(&mut self, policy: PolicyMeta) {
        let key = match &policy.namespace {
            Some(ns) => format!("{}/{}", ns, policy.name),
            None => policy.name.clone(),
        };
        self.policies.insert(key, policy);
    }

    fn find(&self, key: &str, name: &str, namespace: Option<&str>) -> Option<PolicyMeta> {
        self.policies.get(key).cloned().or_else(|| {
            self.permissive.then(|| PolicyMeta {
                name: name.to_string(),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            })
        })
    }
}

#[async_trait]
impl PolicyCatalog for StaticCatalog {
    async fn cluster_policy(&self, name: &str) -> anyhow::Result<Option<PolicyMeta>> {
        Ok(self.find(name, name, None))
    }

    async fn policy(&self, namespace: &str, name: &str) -> anyhow::Result<Option<PolicyMeta>> {
        Ok(self.find(&format!("{}/{}", namespace, name), name, Some(namespace)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polrep_core::{EvaluationResult, ResourceSpec, RuleStatus, ViolatedRule};

    fn rule(name: &str, status: RuleStatus) -> ViolatedRule {
        ViolatedRule { name: name.into(), rule_type: "Validation".into(), message: format!("{} evaluated", name), status }
    }

    fn batch(policy: &str, ns: &str) -> ResultBatch {
        ResultBatch {
            policy_name: policy.into(),
            namespace: ns.into(),
            results: vec![EvaluationResult {
                resource: ResourceSpec { kind: "Pod".into(), namespace: ns.into(), name: "web".into(), ..Default::default() },
                rules: smallvec::smallvec![rule("labels", RuleStatus::Fail), rule("limits", RuleStatus::Pass)],
            }],
        }
    }

    fn catalog() -> StaticCatalog {
        let mut c = StaticCatalog::new();
        c.insert(PolicyMeta {
            name: "require-labels".into(),
            namespace: None,
            annotations: smallvec::smallvec![
                (ANNOTATION_CATEGORY.into(), "Best Practices".into()),
                (ANNOTATION_SEVERITY.into(), "medium".into()),
            ],
        });
        c.insert(PolicyMeta { name: "local".into(), namespace: Some("team-a".into()), ..Default::default() });
        c
    }

    #[tokio::test]
    async fn builds_one_result_per_rule() {
        let b = CatalogBuilder::new(catalog());
        let rec = b.build(&batch("require-labels", "ns1")).await.unwrap().expect("record");
        assert_eq!(rec.scope, ReportScope::Namespaced);
        assert_eq!(rec.namespace.as_deref(), Some("ns1"));
        assert!(rec.name.starts_with("rcr-"));
        assert_eq!(rec.results.len(), 2);
        assert_eq!((rec.summary.fail, rec.summary.pass), (1, 1));
        assert_eq!(rec.results[0].category.as_deref(), Some("Best Practices"));
        assert_eq!(rec.results[0].severity.as_deref(), Some("medium"));
        assert_eq!(rec.results[0].resources[0].name, "web");
    }

    #[tokio::test]
    async fn cluster_batches_become_cluster_records() {
        let b = CatalogBuilder::new(catalog());
        let rec = b.build(&batch("require-labels", "")).await.unwrap().expect("record");
        assert_eq!(rec.scope, ReportScope::Cluster);
        assert!(rec.namespace.is_none());
        assert!(rec.name.starts_with("crcr-"));
    }

    #[tokio::test]
    async fn namespaced_policy_names_use_policy_lookup() {
        let b = CatalogBuilder::new(catalog());
        assert!(b.build(&batch("team-a/local", "team-a")).await.unwrap().is_some());
        assert!(b.build(&batch("team-b/local", "team-b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_policy_is_skipped_not_failed() {
        let b = CatalogBuilder::new(catalog());
        assert!(b.build(&batch("gone", "ns1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batches_without_rules_are_skipped() {
        let b = CatalogBuilder::new(StaticCatalog::permissive());
        let empty = ResultBatch { policy_name: "p".into(), namespace: "ns1".into(), results: vec![] };
        assert!(b.build(&empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_policy_name_is_an_error() {
        let b = CatalogBuilder::new(StaticCatalog::permissive());
        let err = b.build(&batch("", "ns1")).await.unwrap_err();
        assert!(matches!(err, BuildError::InvalidBatch(_)));
    }

    #[tokio::test]
    async fn permissive_catalog_accepts_any_policy() {
        let b = CatalogBuilder::new(StaticCatalog::permissive());
        assert!(b.build(&batch("anything", "ns1")).await.unwrap().is_some());
    }

    struct BrokenCatalog;

    #[async_trait]
    impl PolicyCatalog for BrokenCatalog {
        async fn cluster_policy(&self, _name: &str) -> anyhow::Result<Option<PolicyMeta>> {
            Err(anyhow::anyhow!("informer not synced"))
        }
        async fn policy(&self, _namespace: &str, _name: &str) -> anyhow::Result<Option<PolicyMeta>> {
            Err(anyhow::anyhow!("informer not synced"))
        }
    }

    #[tokio::test]
    async fn catalog_errors_are_retryable_build_errors() {
        let b = CatalogBuilder::new(BrokenCatalog);
        let err = b.build(&batch("require-labels", "ns1")).await.unwrap_err();
        assert!(matches!(err, BuildError::Catalog { .. }));
        assert!(err.to_string().contains("informer not synced"));
    }
}
