use crate::errors::*;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Probe;
use kube::ResourceExt;
use kube_derive::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Label on statefulsets and pods naming the owning QuarksStatefulSet.
pub const LABEL_QSTS_NAME: &str = "quarks.cloudfoundry.org/quarks-statefulset-name";
pub const LABEL_POD_ORDINAL: &str = "quarks.cloudfoundry.org/pod-ordinal";
pub const LABEL_SPEC_INDEX: &str = "quarks.cloudfoundry.org/spec-index";
pub const LABEL_STARTUP_ORDINAL: &str = "quarks.cloudfoundry.org/startup-ordinal";
pub const LABEL_ZONE_INDEX: &str = "quarks.cloudfoundry.org/zone-index";
pub const LABEL_ZONE_NAME: &str = "quarks.cloudfoundry.org/zone";
/// Set by the statefulset controller on every pod it creates.
pub const LABEL_REVISION_HASH: &str = "controller-revision-hash";

/// JSON map of revision-hash -> pod-ordinal -> startup-ordinal.
pub const ANNOTATION_REVISIONS: &str = "quarks.cloudfoundry.org/revisions";

pub const DEFAULT_ZONE_NODE_LABEL: &str = "topology.kubernetes.io/zone";

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq, Default, JsonSchema)]
#[kube(
    group = "quarks.cloudfoundry.org",
    version = "v1alpha1",
    kind = "QuarksStatefulSet",
    status = "QuarksStatefulSetStatus",
    shortname = "qsts",
    printcolumn = r#"{"name":"ready", "type":"boolean", "jsonPath":".status.ready"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct QuarksStatefulSetSpec {
    /// A template for a regular StatefulSet
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub template: StatefulSet,

    /// Indicate whether to update Pods in the StatefulSet when an env value or mount changes
    #[serde(default)]
    pub update_on_config_change: bool,

    /// Defines probes to determine active/passive component instances, keyed by container name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub active_passive_probes: BTreeMap<String, Probe>,

    /// Indicates the availability zones that the QuarksStatefulSet needs to span
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,

    /// Indicates the node label that a node locates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_node_label: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QuarksStatefulSetStatus {
    /// ready is true once the newest generation has rolled out and all its replicas are ready.
    #[serde(default)]
    pub ready: bool,

    /// lastReconcile is the RFC 3339 time of the last successful reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile: Option<String>,
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..SchemaObject::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}

/// A zone a generation is pinned to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Zone {
    pub index: usize,
    pub name: String,
}

impl QuarksStatefulSetSpec {
    /// Desired replicas per zone, defaulting like a plain statefulset.
    pub fn replicas(&self) -> i32 {
        self.template
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1)
    }

    pub fn is_active_passive(&self) -> bool {
        !self.active_passive_probes.is_empty()
    }

    /// One slot per zone, or a single unzoned slot.
    pub fn zone_slots(&self) -> Vec<Option<Zone>> {
        if self.zones.is_empty() {
            return vec![None];
        }
        self.zones
            .iter()
            .enumerate()
            .map(|(index, name)| {
                Some(Zone {
                    index,
                    name: name.clone(),
                })
            })
            .collect()
    }

    pub fn zone_node_label(&self) -> &str {
        self.zone_node_label
            .as_deref()
            .unwrap_or(DEFAULT_ZONE_NODE_LABEL)
    }
}

impl QuarksStatefulSet {
    /// namespace/name, for log lines and error messages.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_default(),
            self.name_any()
        )
    }

    /// Decodes the revisions annotation. An absent annotation is an empty map,
    /// a malformed one is a data-integrity error.
    pub fn revisions(&self) -> Result<Revisions> {
        match self.annotations().get(ANNOTATION_REVISIONS) {
            None => Ok(Revisions::default()),
            Some(raw) if raw.is_empty() => Ok(Revisions::default()),
            Some(raw) => Revisions::decode(raw)
                .map_err(|e| ErrorKind::InvalidRevisions(self.key(), e.to_string()).into()),
        }
    }

    pub fn set_revisions(&mut self, revisions: &Revisions) -> Result<()> {
        let encoded = revisions.encode()?;
        self.annotations_mut()
            .insert(ANNOTATION_REVISIONS.to_string(), encoded);
        Ok(())
    }
}

/// Startup ordinals handed out per controller revision.
///
/// Backed by ordered maps so the encoded annotation is byte-stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revisions(BTreeMap<String, BTreeMap<String, String>>);

impl Revisions {
    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    pub fn startup_ordinal(&self, revision: &str, pod_ordinal: &str) -> Option<&str> {
        self.0
            .get(revision)
            .and_then(|ordinals| ordinals.get(pod_ordinal))
            .map(String::as_str)
    }

    pub fn set(&mut self, revision: &str, pod_ordinal: &str, startup_ordinal: &str) {
        self.0
            .entry(revision.to_string())
            .or_default()
            .insert(pod_ordinal.to_string(), startup_ordinal.to_string());
    }

    /// Drops every revision not in `live`, returning the dropped hashes.
    pub fn retain_live(&mut self, live: &BTreeSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .0
            .keys()
            .filter(|r| !live.contains(*r))
            .cloned()
            .collect();
        for r in &stale {
            self.0.remove(r);
        }
        stale
    }

    pub fn revisions(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
