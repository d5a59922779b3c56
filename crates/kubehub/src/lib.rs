//! Kubernetes wiring for the report request controller.
//!
//! - [`KubePolicyCatalog`]: live Kyverno `ClusterPolicy`/`Policy` lookups
//! - [`RequestCreator`]: coalescing delivery loop over a [`ReportSink`]
//! - [`KubeSink`]: server-side apply of `ReportChangeRequest` objects

#![forbid(unsafe_code)]

pub mod creator;

pub use creator::{RequestCreator, ReportSink, StdoutSink, DEFAULT_FLUSH_INTERVAL};

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use polrep_core::{PolicyCatalog, PolicyMeta, ReportRecord, ReportScope};
use tracing::debug;

pub const POLICY_GROUP: &str = "kyverno.io";
pub const POLICY_VERSION: &str = "v1";
pub const REPORT_VERSION: &str = "v1alpha2";
pub const FIELD_MANAGER: &str = "polrep";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

fn api_resource(version: &str, kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(POLICY_GROUP, version, kind))
}

/// Policy lookups against the API server.
#[derive(Clone)]
pub struct KubePolicyCatalog {
    client: Client,
    cluster_policies: ApiResource,
    policies: ApiResource,
}

impl KubePolicyCatalog {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cluster_policies: api_resource(POLICY_VERSION, "ClusterPolicy"),
            policies: api_resource(POLICY_VERSION, "Policy"),
        }
    }

    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }
}

fn policy_meta(obj: &DynamicObject) -> PolicyMeta {
    PolicyMeta {
        name: obj.metadata.name.clone().unwrap_or_default(),
        namespace: obj.metadata.namespace.clone(),
        annotations: obj
            .metadata
            .annotations
            .as_ref()
            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl PolicyCatalog for KubePolicyCatalog {
    async fn cluster_policy(&self, name: &str) -> Result<Option<PolicyMeta>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &self.cluster_policies);
        let found = api.get_opt(name).await.with_context(|| format!("getting ClusterPolicy {}", name))?;
        debug!(policy = %name, found = found.is_some(), "cluster policy lookup");
        Ok(found.as_ref().map(policy_meta))
    }

    async fn policy(&self, namespace: &str, name: &str) -> Result<Option<PolicyMeta>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &self.policies);
        let found = api
            .get_opt(name)
            .await
            .with_context(|| format!("getting Policy {}/{}", namespace, name))?;
        debug!(policy = %name, ns = %namespace, found = found.is_some(), "policy lookup");
        Ok(found.as_ref().map(policy_meta))
    }
}

/// Render a record as a `kyverno.io/v1alpha2` change request object.
pub fn report_object(record: &ReportRecord) -> Result<DynamicObject> {
    let ar = api_resource(REPORT_VERSION, record.scope.kind());
    let mut obj = DynamicObject::new(&record.name, &ar);
    obj.metadata = ObjectMeta {
        name: Some(record.name.clone()),
        namespace: match record.scope {
            ReportScope::Namespaced => record.namespace.clone(),
            ReportScope::Cluster => None,
        },
        labels: Some([(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string())].into_iter().collect()),
        ..Default::default()
    };
    let mut results = serde_json::to_value(&record.results).context("serializing report results")?;
    if let Some(items) = results.as_array_mut() {
        for item in items {
            item["timestamp"] = serde_json::json!({ "seconds": record.generated_at, "nanos": 0 });
        }
    }
    obj.data = serde_json::json!({
        "results": results,
        "summary": serde_json::to_value(record.summary).context("serializing report summary")?,
    });
    Ok(obj)
}

/// Delivers records with server-side apply; re-applying the same record
/// name updates the existing object.
#[derive(Clone)]
pub struct KubeSink {
    client: Client,
}

impl KubeSink {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait]
impl ReportSink for KubeSink {
    async fn apply(&self, record: &ReportRecord) -> Result<()> {
        let ar = api_resource(REPORT_VERSION, record.scope.kind());
        let api: Api<DynamicObject> = match (record.scope, record.namespace.as_deref()) {
            (ReportScope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (ReportScope::Namespaced, None) => anyhow::bail!("namespaced report {} has no namespace", record.name),
            (ReportScope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        };
        let obj = report_object(record)?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&record.name, &params, &Patch::Apply(&obj))
            .await
            .with_context(|| format!("applying {} {}", record.scope.kind(), record.name))?;
        Ok(())
    }
}
