use crate::errors::*;
use crate::qsts::{QuarksStatefulSet, Zone, LABEL_QSTS_NAME, LABEL_ZONE_INDEX, LABEL_ZONE_NAME};
use crate::{deadline, reference};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams};
use kube::{Resource, ResourceExt};
use log::debug;
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::time::Duration;

/// Integer generation number on every statefulset owned by a QuarksStatefulSet.
pub const ANNOTATION_VERSION: &str = "quarks.cloudfoundry.org/version";
/// SHA-1 of the derived spec and labels the generation was built from.
pub const ANNOTATION_SIGNATURE: &str = "quarks.cloudfoundry.org/statefulset-signature";
/// SHA-1 of referenced ConfigMap/Secret payloads, stamped on the pod template.
pub const ANNOTATION_CONFIG_SHA1: &str = "quarks.cloudfoundry.org/config-sha1";

/// One numbered statefulset of a QuarksStatefulSet.
#[derive(Clone, Debug)]
pub struct Generation {
    pub statefulset: StatefulSet,
    pub version: u32,
}

impl Generation {
    /// Stand-in for "no generation yet", so creating the first and the next
    /// generation look the same to callers.
    pub fn placeholder() -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_VERSION.to_string(), "0".to_string());
        Generation {
            statefulset: StatefulSet {
                metadata: ObjectMeta {
                    annotations: Some(annotations),
                    ..ObjectMeta::default()
                },
                ..StatefulSet::default()
            },
            version: 0,
        }
    }

    pub fn exists(&self) -> bool {
        self.version > 0
    }
}

pub fn generation_name(owner: &str, zone: Option<&Zone>, version: u32) -> String {
    match zone {
        Some(z) => format!("{}-z{}-v{}", owner, z.index, version),
        None => format!("{}-v{}", owner, version),
    }
}

pub fn version_of(sts: &StatefulSet) -> Result<u32> {
    let name = sts.name_any();
    let raw = sts
        .annotations()
        .get(ANNOTATION_VERSION)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::from(ErrorKind::MissingVersion(name.clone())))?;
    raw.parse()
        .map_err(|_| ErrorKind::InvalidVersion(name, raw.clone()).into())
}

pub fn zone_of(sts: &StatefulSet) -> Option<usize> {
    sts.labels()
        .get(LABEL_ZONE_INDEX)
        .and_then(|z| z.parse().ok())
}

pub fn is_controlled_by(sts: &StatefulSet, owner: &QuarksStatefulSet) -> bool {
    let uid = match owner.uid() {
        Some(uid) => uid,
        None => return false,
    };
    sts.owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}

/// Picks the highest version among `generations`. A generation without a
/// parsable version annotation was not made by us and fails the whole call.
pub fn select_current<'a, I>(generations: I) -> Result<Generation>
where
    I: IntoIterator<Item = &'a StatefulSet>,
{
    let mut current = Generation::placeholder();
    for sts in generations {
        let version = version_of(sts)?;
        if version > current.version {
            current = Generation {
                statefulset: sts.clone(),
                version,
            };
        }
    }
    Ok(current)
}

/// All statefulsets in the owner's namespace controlled by it.
pub async fn list_owned(
    api: &Api<StatefulSet>,
    owner: &QuarksStatefulSet,
    timeout: Duration,
) -> Result<Vec<StatefulSet>> {
    let lp = ListParams::default();
    let list = deadline(timeout, "list statefulsets", api.list(&lp))
        .await
        .chain_err(|| format!("failed to list statefulsets owned by '{}'", owner.key()))?;
    Ok(list
        .items
        .into_iter()
        .filter(|s| is_controlled_by(s, owner))
        .collect())
}

/// Returns the newest generation owned by `owner`, or the version-0
/// placeholder if there is none, along with every owned generation. Read only.
pub async fn current_generation(
    api: &Api<StatefulSet>,
    owner: &QuarksStatefulSet,
    timeout: Duration,
) -> Result<(Generation, Vec<StatefulSet>)> {
    let owned = list_owned(api, owner, timeout).await?;
    let current = select_current(owned.iter())?;
    debug!(
        "Latest StatefulSet owned by QuarksStatefulSet '{}' has version '{}'",
        owner.key(),
        current.version
    );
    Ok((current, owned))
}

/// The parts of a derived statefulset that decide whether a new generation is needed.
#[derive(Serialize)]
struct Signed<'a> {
    spec: StatefulSetSpec,
    labels: &'a BTreeMap<String, String>,
}

impl<'a> Signed<'a> {
    // replicas are scaled in place, the update strategy belongs to the rollout
    // mutator and claim templates cannot be changed on a live statefulset.
    fn new(spec: &StatefulSetSpec, labels: &'a BTreeMap<String, String>) -> Self {
        let mut spec = spec.clone();
        spec.replicas = None;
        spec.update_strategy = None;
        spec.volume_claim_templates = None;
        Signed { spec, labels }
    }

    fn checksum(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha1::digest(&encoded)))
    }
}

pub fn signature(spec: &StatefulSetSpec, labels: &BTreeMap<String, String>) -> Result<String> {
    Signed::new(spec, labels).checksum()
}

/// Inputs beyond the QuarksStatefulSet itself that shape a generation.
#[derive(Clone, Debug, Default)]
pub struct Inputs {
    /// Digest of referenced ConfigMap/Secret payloads, set with updateOnConfigChange.
    pub config_sha1: Option<String>,
    /// Latest versioned secret name per base name.
    pub latest_secrets: BTreeMap<String, String>,
}

/// Derives generation `version` of `owner`, optionally pinned to `zone`.
pub fn build(
    owner: &QuarksStatefulSet,
    version: u32,
    zone: Option<&Zone>,
    inputs: &Inputs,
) -> Result<StatefulSet> {
    let owner_name = owner.name_any();
    let namespace = owner.namespace().ok_or_else(|| {
        Error::from(ErrorKind::MissingNamespace(
            "QuarksStatefulSet".into(),
            owner_name.clone(),
        ))
    })?;
    let owner_ref = owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::from(ErrorKind::MissingObject(
            "uid of QuarksStatefulSet".into(),
            owner.key(),
        ))
    })?;

    let template = &owner.spec.template;
    let mut labels = template.metadata.labels.clone().unwrap_or_default();
    labels.insert(LABEL_QSTS_NAME.to_string(), owner_name.clone());
    if let Some(z) = zone {
        labels.insert(LABEL_ZONE_INDEX.to_string(), z.index.to_string());
        labels.insert(LABEL_ZONE_NAME.to_string(), z.name.clone());
    }

    let mut spec = template.spec.clone().unwrap_or_default();
    {
        let pod_meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
        let pod_labels = pod_meta.labels.get_or_insert_with(BTreeMap::new);
        pod_labels.insert(LABEL_QSTS_NAME.to_string(), owner_name.clone());
        if let Some(z) = zone {
            pod_labels.insert(LABEL_ZONE_INDEX.to_string(), z.index.to_string());
            pod_labels.insert(LABEL_ZONE_NAME.to_string(), z.name.clone());
        }
        if let Some(sha) = &inputs.config_sha1 {
            pod_meta
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_CONFIG_SHA1.to_string(), sha.clone());
        }
    }
    if let Some(z) = zone {
        spec.selector
            .match_labels
            .get_or_insert_with(BTreeMap::new)
            .insert(LABEL_ZONE_INDEX.to_string(), z.index.to_string());
        let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
        pin_to_zone(pod_spec, owner.spec.zone_node_label(), &z.name);
    }
    if !inputs.latest_secrets.is_empty() {
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            reference::rewrite_secret_names(pod_spec, &inputs.latest_secrets);
        }
    }

    let mut annotations = template.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(ANNOTATION_VERSION.to_string(), version.to_string());
    annotations.insert(ANNOTATION_SIGNATURE.to_string(), signature(&spec, &labels)?);

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(generation_name(&owner_name, zone, version)),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner_ref]),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        status: None,
    })
}

fn pin_to_zone(pod_spec: &mut k8s_openapi::api::core::v1::PodSpec, node_label: &str, zone: &str) {
    let affinity = pod_spec.affinity.get_or_insert_with(Affinity::default);
    affinity.node_affinity = Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: node_label.to_string(),
                    operator: "In".to_string(),
                    values: Some(vec![zone.to_string()]),
                }]),
                ..NodeSelectorTerm::default()
            }],
        }),
        ..NodeAffinity::default()
    });
}

/// What the reconciler must do to bring `current` in line with `desired`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Materialize a new generation.
    Create,
    /// Same generation, different replica count.
    Scale(i32),
    Keep,
}

pub fn replicas_of(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

pub fn decide(current: &Generation, desired: &StatefulSet) -> Decision {
    if !current.exists() {
        return Decision::Create;
    }
    let have = current.statefulset.annotations().get(ANNOTATION_SIGNATURE);
    let want = desired.annotations().get(ANNOTATION_SIGNATURE);
    if have != want {
        return Decision::Create;
    }
    let replicas = replicas_of(desired);
    if replicas_of(&current.statefulset) != replicas {
        return Decision::Scale(replicas);
    }
    Decision::Keep
}
