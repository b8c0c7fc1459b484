//! Active/passive mode: exec probes decide which pods are active.

use crate::deadline;
use crate::errors::*;
use crate::generation::{self, version_of};
use crate::manager::Data;
use crate::qsts::QuarksStatefulSet;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Probe};
use kube::api::{Api, AttachParams, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use log::{debug, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const LABEL_POD_ACTIVE: &str = "quarks.cloudfoundry.org/pod-active";
pub const POD_ACTIVE: &str = "active";

const DEFAULT_PERIOD: Duration = Duration::from_secs(30);

/// Shortest `periodSeconds` among the probes.
pub fn probe_period(probes: &BTreeMap<String, Probe>) -> Duration {
    probes
        .values()
        .filter_map(|p| p.period_seconds)
        .filter(|s| *s > 0)
        .min()
        .map(|s| Duration::from_secs(s as u64))
        .unwrap_or(DEFAULT_PERIOD)
}

fn probe_timeout(probe: &Probe, fallback: Duration) -> Duration {
    probe
        .timeout_seconds
        .filter(|s| *s > 0)
        .map(|s| Duration::from_secs(s as u64))
        .unwrap_or(fallback)
}

pub fn is_active(pod: &Pod) -> bool {
    pod.labels()
        .get(LABEL_POD_ACTIVE)
        .map(|v| v == POD_ACTIVE)
        .unwrap_or(false)
}

/// Merge patch setting or clearing the active label.
pub fn active_label_patch(active: bool) -> serde_json::Value {
    let value = if active { json!(POD_ACTIVE) } else { json!(null) };
    json!({ "metadata": { "labels": { LABEL_POD_ACTIVE: value } } })
}

/// Runs the exec action of `probe` in `container`. Ok(false) means the
/// command ran and failed.
pub async fn run_probe(
    pods: &Api<Pod>,
    pod: &str,
    container: &str,
    probe: &Probe,
    timeout: Duration,
) -> Result<bool> {
    let command = probe
        .exec
        .as_ref()
        .and_then(|e| e.command.clone())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            Error::from(ErrorKind::Probe(
                pod.to_string(),
                container.to_string(),
                "only exec probes with a command are supported".into(),
            ))
        })?;

    let ap = attach_params(container);
    let run = async {
        let mut attached = pods.exec(pod, command, &ap).await?;
        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };
        Ok::<_, kube::Error>(status.and_then(|s| s.status).map(|s| s == "Success"))
    };
    let outcome = deadline(probe_timeout(probe, timeout), "exec probe", run)
        .await
        .chain_err(|| ErrorKind::Probe(pod.to_string(), container.to_string(), "exec failed".into()))?;
    Ok(outcome.unwrap_or(false))
}

/// Probes are judged by their exit status alone, no output stream is opened.
fn attach_params(container: &str) -> AttachParams {
    AttachParams::default()
        .container(container)
        .stdout(false)
        .stderr(false)
}

/// True when every probe passes in `pod`. Probe errors count as failures.
pub async fn probe_pod(
    pods: &Api<Pod>,
    pod: &Pod,
    probes: &BTreeMap<String, Probe>,
    timeout: Duration,
) -> bool {
    let name = pod.name_any();
    for (container, probe) in probes {
        match run_probe(pods, &name, container, probe, timeout).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                debug!("{}", e);
                return false;
            }
        }
    }
    true
}

fn owned_by_any(pod: &Pod, generations: &[&StatefulSet]) -> bool {
    pod.owner_references().iter().any(|r| {
        generations
            .iter()
            .any(|g| g.uid().map(|uid| uid == r.uid).unwrap_or(false))
    })
}

/// Labels the pods of the current generation according to their probes.
pub async fn reconcile(qsts: Arc<QuarksStatefulSet>, ctx: Arc<Data>) -> Result<Action> {
    let probes = &qsts.spec.active_passive_probes;
    if probes.is_empty() {
        return Ok(Action::await_change());
    }
    let namespace = qsts.namespace().ok_or_else(|| {
        Error::from(ErrorKind::MissingNamespace(
            "QuarksStatefulSet".into(),
            qsts.name_any(),
        ))
    })?;
    if !ctx.monitored.contains(&namespace) {
        return Ok(Action::await_change());
    }

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
    let (newest, owned) = generation::current_generation(&sts_api, &qsts, ctx.timeout).await?;
    let newest = newest.version;
    let mut current = Vec::new();
    for sts in &owned {
        if version_of(sts)? == newest {
            current.push(sts);
        }
    }

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let list = deadline(ctx.timeout, "list pods", pods.list(&ListParams::default()))
        .await
        .chain_err(|| format!("failed to list pods for '{}'", qsts.key()))?;

    for pod in list.items.iter().filter(|p| owned_by_any(p, &current)) {
        let active = probe_pod(&pods, pod, probes, ctx.timeout).await;
        if active == is_active(pod) {
            continue;
        }
        let name = pod.name_any();
        info!(
            "Marking pod '{}/{}' as {}",
            namespace,
            name,
            if active { "active" } else { "passive" }
        );
        let patch = active_label_patch(active);
        deadline(
            ctx.timeout,
            "patch pod",
            pods.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .chain_err(|| format!("failed to label pod '{}/{}'", namespace, name))?;
    }

    ctx.backoff.reset(qsts.as_ref());
    Ok(Action::requeue(probe_period(probes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ExecAction;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn probes_attach_without_output_streams() {
        let ap = attach_params("nats");
        assert_eq!(ap.container.as_deref(), Some("nats"));
        assert!(!ap.stdout);
        assert!(!ap.stderr);
        assert!(!ap.stdin);
    }

    fn probe(period: Option<i32>) -> Probe {
        Probe {
            period_seconds: period,
            exec: Some(ExecAction {
                command: Some(vec!["/bin/sh".into(), "-c".into(), "true".into()]),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn period_is_the_shortest_probe_period() {
        let mut probes = BTreeMap::new();
        assert_eq!(probe_period(&probes), DEFAULT_PERIOD);

        probes.insert("a".to_string(), probe(Some(10)));
        probes.insert("b".to_string(), probe(Some(2)));
        probes.insert("c".to_string(), probe(None));
        assert_eq!(probe_period(&probes), Duration::from_secs(2));
    }

    #[test]
    fn probe_timeout_falls_back() {
        let mut p = probe(None);
        assert_eq!(probe_timeout(&p, Duration::from_secs(9)), Duration::from_secs(9));
        p.timeout_seconds = Some(3);
        assert_eq!(probe_timeout(&p, Duration::from_secs(9)), Duration::from_secs(3));
    }

    #[test]
    fn active_label() {
        let mut pod = Pod {
            metadata: ObjectMeta {
                name: Some("a-v1-0".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!is_active(&pod));
        pod.labels_mut()
            .insert(LABEL_POD_ACTIVE.to_string(), POD_ACTIVE.to_string());
        assert!(is_active(&pod));

        assert_eq!(
            active_label_patch(true),
            json!({ "metadata": { "labels": { "quarks.cloudfoundry.org/pod-active": "active" } } })
        );
        assert_eq!(
            active_label_patch(false)["metadata"]["labels"][LABEL_POD_ACTIVE],
            serde_json::Value::Null
        );
    }
}
