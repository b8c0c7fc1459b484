//! Admission handler stamping pod-ordinal, spec-index and startup-ordinal
//! labels onto QuarksStatefulSet pods.

use crate::deadline;
use crate::errors::*;
use crate::generation;
use crate::qsts::{
    QuarksStatefulSet, Revisions, LABEL_POD_ORDINAL, LABEL_QSTS_NAME, LABEL_REVISION_HASH,
    LABEL_SPEC_INDEX, LABEL_STARTUP_ORDINAL, LABEL_ZONE_INDEX,
};
use error_chain::ChainedError;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, PostParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse};
use kube::{Client, ResourceExt};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Ordinal suffix of a statefulset pod name, `None` for names outside that
/// convention.
pub fn ordinal_from_pod_name(name: &str) -> Option<u32> {
    let (_, suffix) = name.rsplit_once('-')?;
    suffix.parse().ok()
}

/// Zone index from the pod's labels. Absent or garbage degrades to zone 0.
pub fn zone_index(labels: &BTreeMap<String, String>) -> u32 {
    labels
        .get(LABEL_ZONE_INDEX)
        .and_then(|z| z.parse().ok())
        .unwrap_or(0)
}

/// `zone_index * replicas + ordinal`. A zone index too large to fit is
/// treated like an unparsable one, as zone 0.
pub fn spec_index(zone_index: u32, replicas: i32, ordinal: u32) -> u32 {
    zone_index
        .checked_mul(replicas.max(0) as u32)
        .and_then(|base| base.checked_add(ordinal))
        .unwrap_or(ordinal)
}

/// Only pods of a QuarksStatefulSet that went through the statefulset
/// controller are labelled.
pub fn is_target(pod: &Pod) -> bool {
    let labels = pod.labels();
    labels.contains_key(LABEL_QSTS_NAME) && labels.contains_key(LABEL_REVISION_HASH)
}

/// Controller revisions still represented by the given generations.
pub fn live_revisions<'a, I>(generations: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a StatefulSet>,
{
    let mut live = BTreeSet::new();
    for sts in generations {
        if let Some(status) = &sts.status {
            live.extend(status.current_revision.clone());
            live.extend(status.update_revision.clone());
        }
        live.extend(sts.labels().get(LABEL_REVISION_HASH).cloned());
    }
    live
}

/// Resolves the startup ordinal of `ordinal` under `revision`, recording it
/// in `revisions`. A recorded value is reused, otherwise the number of
/// already admitted peers in the revision is handed out.
pub fn assign_startup_ordinal(
    revisions: &mut Revisions,
    revision: &str,
    ordinal: &str,
    peers: usize,
) -> String {
    let startup = match revisions.startup_ordinal(revision, ordinal) {
        Some(s) => s.to_string(),
        None => peers.to_string(),
    };
    revisions.set(revision, ordinal, &startup);
    startup
}

/// Resolves the identity labels of pod `name` with `ordinal` and records its
/// startup ordinal on `qsts`.
///
/// Revisions no longer present in `owned` are dropped first. `peers` are the
/// pods carrying the same revision label, only counted when no startup
/// ordinal is recorded yet.
pub fn assign_identity(
    qsts: &mut QuarksStatefulSet,
    owned: &[StatefulSet],
    name: &str,
    ordinal: u32,
    labels: &BTreeMap<String, String>,
    peers: &[Pod],
) -> Result<BTreeMap<String, String>> {
    let revision = labels.get(LABEL_REVISION_HASH).cloned().unwrap_or_default();
    let mut live = live_revisions(owned);
    // the pod's own revision may not be in the statefulset status yet
    live.insert(revision.clone());

    let mut revisions = qsts.revisions()?;
    for stale in revisions.retain_live(&live) {
        debug!("Dropping revision '{}' from '{}'", stale, qsts.key());
    }

    let ordinal_key = ordinal.to_string();
    let admitted = peers
        .iter()
        .filter(|p| p.name_any() != name)
        .filter(|p| p.labels().get(LABEL_REVISION_HASH) == Some(&revision))
        .count();
    let startup = assign_startup_ordinal(&mut revisions, &revision, &ordinal_key, admitted);
    qsts.set_revisions(&revisions)?;

    let mut identity = BTreeMap::new();
    identity.insert(LABEL_POD_ORDINAL.to_string(), ordinal_key);
    identity.insert(
        LABEL_SPEC_INDEX.to_string(),
        spec_index(zone_index(labels), qsts.spec.replicas(), ordinal).to_string(),
    );
    identity.insert(LABEL_STARTUP_ORDINAL.to_string(), startup);
    Ok(identity)
}

/// JSON patch adding the identity labels to `pod`.
pub fn label_patch(pod: &Pod, identity: &BTreeMap<String, String>) -> Result<json_patch::Patch> {
    let mut mutated = pod.clone();
    let labels = mutated.labels_mut();
    for (k, v) in identity {
        labels.insert(k.clone(), v.clone());
    }
    Ok(json_patch::diff(
        &serde_json::to_value(pod)?,
        &serde_json::to_value(&mutated)?,
    ))
}

#[derive(Clone)]
pub struct PodMutator {
    client: Client,
    timeout: Duration,
}

impl PodMutator {
    pub fn new(client: Client, timeout: Duration) -> Self {
        info!("Creating a Pod mutator for QuarksStatefulSet");
        PodMutator { client, timeout }
    }

    pub async fn handle(&self, req: &AdmissionRequest<Pod>) -> AdmissionResponse {
        let pod = match &req.object {
            Some(pod) => pod,
            None => return AdmissionResponse::from(req),
        };
        if !is_target(pod) {
            return AdmissionResponse::from(req);
        }

        let patch = match self.identity(req, pod).await {
            Ok(None) => return AdmissionResponse::from(req),
            Ok(Some(identity)) => label_patch(pod, &identity),
            Err(e) => Err(e),
        };
        let res = patch.and_then(|p| {
            AdmissionResponse::from(req)
                .with_patch(p)
                .map_err(|e| e.to_string().into())
        });
        match res {
            Ok(res) => res,
            Err(e) => {
                warn!(
                    "Denying pod '{}/{}': {}",
                    req.namespace.as_deref().unwrap_or_default(),
                    pod_name(req, pod),
                    e.display_chain()
                );
                AdmissionResponse::from(req).deny(e.to_string())
            }
        }
    }

    /// Labels to add, `None` when the pod name carries no ordinal.
    async fn identity(
        &self,
        req: &AdmissionRequest<Pod>,
        pod: &Pod,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let name = pod_name(req, pod);
        let ordinal = match ordinal_from_pod_name(&name) {
            Some(o) => o,
            None => {
                debug!("Pod '{}' has no ordinal suffix, skipping", name);
                return Ok(None);
            }
        };
        let namespace = req
            .namespace
            .clone()
            .or_else(|| pod.namespace())
            .ok_or_else(|| Error::from(ErrorKind::MissingNamespace("Pod".into(), name.clone())))?;
        let labels = pod.labels();
        let owner = labels.get(LABEL_QSTS_NAME).cloned().unwrap_or_default();
        let revision = labels.get(LABEL_REVISION_HASH).cloned().unwrap_or_default();
        debug!(
            "Mutating pod '{}/{}', adding ordinals for revision '{}'",
            namespace, name, revision
        );

        let qsts_api: Api<QuarksStatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        let mut qsts = deadline(self.timeout, "get quarksstatefulset", qsts_api.get_opt(&owner))
            .await
            .chain_err(|| format!("failed to get qsts owning '{}/{}'", namespace, name))?
            .ok_or_else(|| {
                Error::from(ErrorKind::MissingObject(
                    "QuarksStatefulSet".into(),
                    format!("{}/{}", namespace, owner),
                ))
            })?;

        let sts_api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
        let owned = generation::list_owned(&sts_api, &qsts, self.timeout).await?;

        let recorded = qsts
            .revisions()?
            .startup_ordinal(&revision, &ordinal.to_string())
            .is_some();
        let peers = if recorded {
            Vec::new()
        } else {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            let lp = ListParams::default().labels(&format!("{}={}", LABEL_REVISION_HASH, revision));
            deadline(self.timeout, "list pods", pods.list(&lp))
                .await
                .chain_err(|| format!("failed to list pods in namespace '{}'", namespace))?
                .items
        };
        let identity = assign_identity(&mut qsts, &owned, &name, ordinal, labels, &peers)?;

        deadline(
            self.timeout,
            "update quarksstatefulset",
            qsts_api.replace(&owner, &PostParams::default(), &qsts),
        )
        .await
        .chain_err(|| {
            format!(
                "failed to update revisions annotation on qsts '{}' for revision '{}'",
                qsts.key(),
                revision
            )
        })?;

        Ok(Some(identity))
    }
}

fn pod_name(req: &AdmissionRequest<Pod>, pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| req.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use json_patch::{AddOperation, PatchOperation};
    use k8s_openapi::api::apps::v1::StatefulSetStatus;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn ordinals_from_names() {
        assert_eq!(ordinal_from_pod_name("foo-v1-0"), Some(0));
        assert_eq!(ordinal_from_pod_name("foo-z1-v3-12"), Some(12));
        assert_eq!(ordinal_from_pod_name("foo-v1-x"), None);
        assert_eq!(ordinal_from_pod_name("foo"), None);
        assert_eq!(ordinal_from_pod_name("foo-"), None);
    }

    #[test]
    fn spec_index_is_zone_aware() {
        let zoned = pod("a-z1-v1-2", &[(LABEL_ZONE_INDEX, "1")]);
        assert_eq!(spec_index(zone_index(zoned.labels()), 3, 2), 5);

        let broken = pod("a-v1-2", &[(LABEL_ZONE_INDEX, "abc")]);
        assert_eq!(spec_index(zone_index(broken.labels()), 3, 2), 2);

        let huge = pod("a-v1-1", &[(LABEL_ZONE_INDEX, "2000000000")]);
        assert_eq!(spec_index(zone_index(huge.labels()), 3, 1), 1);
        assert_eq!(spec_index(1, 3, u32::MAX), u32::MAX);

        let unzoned = pod("a-v1-2", &[]);
        assert_eq!(spec_index(zone_index(unzoned.labels()), 3, 2), 2);
    }

    #[test]
    fn targets_need_owner_and_revision() {
        assert!(is_target(&pod(
            "a-v1-0",
            &[(LABEL_QSTS_NAME, "a"), (LABEL_REVISION_HASH, "abcd")]
        )));
        assert!(!is_target(&pod("a-v1-0", &[(LABEL_QSTS_NAME, "a")])));
        assert!(!is_target(&pod("a-v1-0", &[(LABEL_REVISION_HASH, "abcd")])));
    }

    #[test]
    fn startup_ordinals_count_peers_per_revision() {
        let mut revisions = Revisions::default();
        assert_eq!(assign_startup_ordinal(&mut revisions, "abcd", "0", 0), "0");
        assert_eq!(revisions.encode().unwrap(), r#"{"abcd":{"0":"0"}}"#);

        assert_eq!(assign_startup_ordinal(&mut revisions, "abcd", "1", 1), "1");
        assert_eq!(
            revisions.encode().unwrap(),
            r#"{"abcd":{"0":"0","1":"1"}}"#
        );
    }

    #[test]
    fn restarted_pod_keeps_its_startup_ordinal() {
        let mut revisions = Revisions::decode(r#"{"abcd":{"0":"1","1":"0"}}"#).unwrap();
        // peers would say otherwise, the recorded value wins
        assert_eq!(assign_startup_ordinal(&mut revisions, "abcd", "0", 0), "1");
        assert_eq!(assign_startup_ordinal(&mut revisions, "abcd", "1", 5), "0");
        assert_eq!(
            revisions.encode().unwrap(),
            r#"{"abcd":{"0":"1","1":"0"}}"#
        );
    }

    #[test]
    fn stale_revisions_are_collected() {
        let generation = StatefulSet {
            status: Some(StatefulSetStatus {
                current_revision: Some("abcd".into()),
                update_revision: Some("abcd".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let live = live_revisions(&[generation]);
        let mut revisions = Revisions::decode(r#"{"abcd":{"0":"0"},"efgh":{"1":"0"}}"#).unwrap();
        assert_eq!(revisions.retain_live(&live), vec!["efgh".to_string()]);
        assert_eq!(revisions.encode().unwrap(), r#"{"abcd":{"0":"0"}}"#);
    }

    fn owner_with_revisions(raw: &str) -> QuarksStatefulSet {
        let mut q = QuarksStatefulSet::new("example", Default::default());
        q.metadata.namespace = Some("ns".into());
        q.annotations_mut()
            .insert(crate::qsts::ANNOTATION_REVISIONS.to_string(), raw.to_string());
        q
    }

    fn generation_at(revision: &str) -> StatefulSet {
        StatefulSet {
            status: Some(StatefulSetStatus {
                current_revision: Some(revision.into()),
                update_revision: Some(revision.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn admission_collects_counts_and_records() {
        let mut q = owner_with_revisions(r#"{"abcd":{"1":"0"},"efgh":{"0":"0"}}"#);
        let owned = vec![generation_at("abcd")];
        let labels: BTreeMap<String, String> = vec![
            (LABEL_QSTS_NAME.to_string(), "example".to_string()),
            (LABEL_REVISION_HASH.to_string(), "abcd".to_string()),
        ]
        .into_iter()
        .collect();
        let peers = vec![
            pod("example-v1-1", &[(LABEL_REVISION_HASH, "abcd")]),
            pod("example-v1-0", &[(LABEL_REVISION_HASH, "abcd")]),
        ];

        let identity = assign_identity(&mut q, &owned, "example-v1-0", 0, &labels, &peers).unwrap();
        assert_eq!(identity.get(LABEL_POD_ORDINAL).unwrap(), "0");
        assert_eq!(identity.get(LABEL_SPEC_INDEX).unwrap(), "0");
        assert_eq!(identity.get(LABEL_STARTUP_ORDINAL).unwrap(), "1");
        // efgh is gone, the new assignment is persisted on the owner
        assert_eq!(
            q.annotations().get(crate::qsts::ANNOTATION_REVISIONS).unwrap(),
            r#"{"abcd":{"0":"1","1":"0"}}"#
        );
    }

    #[test]
    fn admission_reuses_recorded_startup_ordinal() {
        let mut q = owner_with_revisions(r#"{"abcd":{"1":"0"}}"#);
        let labels: BTreeMap<String, String> = vec![
            (LABEL_REVISION_HASH.to_string(), "abcd".to_string()),
            (LABEL_ZONE_INDEX.to_string(), "1".to_string()),
        ]
        .into_iter()
        .collect();
        // no generation reports abcd yet, the pod's own revision keeps it alive
        let identity = assign_identity(&mut q, &[], "example-z1-v1-1", 1, &labels, &[]).unwrap();
        assert_eq!(identity.get(LABEL_STARTUP_ORDINAL).unwrap(), "0");
        assert_eq!(identity.get(LABEL_SPEC_INDEX).unwrap(), "2");
        assert_eq!(
            q.annotations().get(crate::qsts::ANNOTATION_REVISIONS).unwrap(),
            r#"{"abcd":{"1":"0"}}"#
        );
    }

    #[test]
    fn label_patch_adds_identity() {
        let p = pod(
            "example-v1-1",
            &[(LABEL_QSTS_NAME, "example"), (LABEL_REVISION_HASH, "abcd")],
        );
        let mut identity = BTreeMap::new();
        identity.insert(LABEL_POD_ORDINAL.to_string(), "1".to_string());
        identity.insert(LABEL_STARTUP_ORDINAL.to_string(), "0".to_string());

        let patch = label_patch(&p, &identity).unwrap();
        assert_eq!(patch.0.len(), 2);
        assert!(patch.0.contains(&PatchOperation::Add(AddOperation {
            path: "/metadata/labels/quarks.cloudfoundry.org~1pod-ordinal".into(),
            value: json!("1"),
        })));
        assert!(patch.0.contains(&PatchOperation::Add(AddOperation {
            path: "/metadata/labels/quarks.cloudfoundry.org~1startup-ordinal".into(),
            value: json!("0"),
        })));
    }

    #[test]
    fn replicas_per_zone_cover_every_ordinal() {
        let indexes: BTreeSet<u32> = (0..4u32)
            .map(|o| ordinal_from_pod_name(&format!("qsts-v1-{}", o)).unwrap())
            .collect();
        assert_eq!(indexes, (0..4).collect());
    }
}
