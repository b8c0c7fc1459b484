//! Canary rollout of a generation, driven by a partition on the statefulset.
//!
//! The whole state lives in statefulset annotations:
//!
//! * `canary-rollout-enabled`: `"true"` opts the statefulset in.
//! * `canary-rollout`: `CanaryUpscale`, `Failed` or `Done`.
//! * `canary-watch-time` / `update-watch-time`: windows in milliseconds.
//! * `update-start-time`: epoch milliseconds the current window started at.
//!
//! The mutating handler resets the state whenever a template arrives, the
//! rollout controller advances it from pod observations.

use crate::active_passive;
use crate::errors::*;
use crate::generation::replicas_of;
use crate::manager::Data;
use crate::pod_mutator::ordinal_from_pod_name;
use crate::qsts::{QuarksStatefulSet, LABEL_QSTS_NAME, LABEL_REVISION_HASH};
use crate::{deadline, now_millis};
use error_chain::ChainedError;
use k8s_openapi::api::apps::v1::{
    RollingUpdateStatefulSetStrategy, StatefulSet, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation};
use kube::ResourceExt;
use kube_runtime::controller::Action;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const ANNOTATION_CANARY_ROLLOUT: &str = "quarks.cloudfoundry.org/canary-rollout";
pub const ANNOTATION_CANARY_ROLLOUT_ENABLED: &str = "quarks.cloudfoundry.org/canary-rollout-enabled";
pub const ANNOTATION_CANARY_WATCH_TIME: &str = "quarks.cloudfoundry.org/canary-watch-time";
pub const ANNOTATION_UPDATE_WATCH_TIME: &str = "quarks.cloudfoundry.org/update-watch-time";
pub const ANNOTATION_UPDATE_START_TIME: &str = "quarks.cloudfoundry.org/update-start-time";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RolloutState {
    CanaryUpscale,
    Failed,
    Done,
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RolloutState::CanaryUpscale => "CanaryUpscale",
            RolloutState::Failed => "Failed",
            RolloutState::Done => "Done",
        };
        f.write_str(s)
    }
}

impl FromStr for RolloutState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CanaryUpscale" => Ok(RolloutState::CanaryUpscale),
            "Failed" => Ok(RolloutState::Failed),
            "Done" => Ok(RolloutState::Done),
            other => bail!("unknown rollout state '{}'", other),
        }
    }
}

pub fn is_enabled(sts: &StatefulSet) -> bool {
    sts.annotations()
        .get(ANNOTATION_CANARY_ROLLOUT_ENABLED)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Current rollout state, `None` when absent or unreadable.
pub fn state_of(sts: &StatefulSet) -> Option<RolloutState> {
    sts.annotations()
        .get(ANNOTATION_CANARY_ROLLOUT)
        .and_then(|s| s.parse().ok())
}

pub fn partition_of(sts: &StatefulSet) -> i32 {
    sts.spec
        .as_ref()
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(0)
}

fn set_partition(sts: &mut StatefulSet, partition: i32) {
    let spec = sts.spec.get_or_insert_with(Default::default);
    let strategy = spec
        .update_strategy
        .get_or_insert_with(StatefulSetUpdateStrategy::default);
    strategy.type_ = Some("RollingUpdate".to_string());
    strategy
        .rolling_update
        .get_or_insert_with(RollingUpdateStatefulSetStrategy::default)
        .partition = Some(partition);
}

fn enter_canary(sts: &mut StatefulSet, partition: i32, now_ms: i64) {
    set_partition(sts, partition);
    let annotations = sts.annotations_mut();
    annotations.insert(
        ANNOTATION_CANARY_ROLLOUT.to_string(),
        RolloutState::CanaryUpscale.to_string(),
    );
    annotations.insert(ANNOTATION_UPDATE_START_TIME.to_string(), now_ms.to_string());
}

/// A freshly created statefulset has nothing to protect, all replicas roll
/// out at once.
pub fn configure_initial_rollout(sts: &mut StatefulSet, now_ms: i64) {
    enter_canary(sts, 0, now_ms);
}

/// A changed template first reaches only the highest ordinal.
pub fn configure_rollout(sts: &mut StatefulSet, now_ms: i64) {
    let partition = (replicas_of(sts) - 1).max(0);
    enter_canary(sts, partition, now_ms);
}

/// Copies the rollout state of the live generation onto `desired` before it
/// replaces `live`. The mutating handler restarts the rollout if the
/// template changed, otherwise the state carries over as is.
pub fn carry_over(live: &StatefulSet, desired: &mut StatefulSet) {
    for key in &[ANNOTATION_CANARY_ROLLOUT, ANNOTATION_UPDATE_START_TIME] {
        if let Some(v) = live.annotations().get(*key) {
            desired.annotations_mut().insert(key.to_string(), v.clone());
        }
    }
    if let Some(strategy) = live.spec.as_ref().and_then(|s| s.update_strategy.clone()) {
        desired.spec.get_or_insert_with(Default::default).update_strategy = Some(strategy);
    }
}

/// Defaults for statefulsets that carry no watch-time annotations.
#[derive(Clone, Copy, Debug)]
pub struct Timings {
    pub canary_watch_time: Duration,
    pub update_watch_time: Duration,
    /// Upper bound between two evaluations of an in-flight rollout.
    pub interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            canary_watch_time: Duration::from_secs(30),
            update_watch_time: Duration::from_secs(300),
            interval: Duration::from_secs(5),
        }
    }
}

fn millis_annotation(annotations: &BTreeMap<String, String>, key: &str) -> Option<u64> {
    annotations.get(key).and_then(|v| v.trim().parse().ok())
}

/// The watch window in effect. A canary (partition above zero) is watched
/// for `canary-watch-time`, a full rollout for `update-watch-time`; each
/// falls back to the other annotation and then to `timings`.
pub fn watch_window(annotations: &BTreeMap<String, String>, partition: i32, timings: &Timings) -> Duration {
    let canary = millis_annotation(annotations, ANNOTATION_CANARY_WATCH_TIME);
    let update = millis_annotation(annotations, ANNOTATION_UPDATE_WATCH_TIME);
    let (preferred, fallback, default) = if partition > 0 {
        (canary, update, timings.canary_watch_time)
    } else {
        (update, canary, timings.update_watch_time)
    };
    preferred
        .or(fallback)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodObservation {
    pub ordinal: u32,
    pub revision: Option<String>,
    pub healthy: bool,
}

/// Everything the state machine looks at, read off one statefulset.
#[derive(Clone, Debug)]
pub struct RolloutView {
    pub state: Option<RolloutState>,
    pub partition: i32,
    pub replicas: i32,
    /// False while the statefulset controller lags behind the spec.
    pub observed: bool,
    pub update_revision: Option<String>,
    pub started_ms: Option<i64>,
    pub window: Duration,
    pub pods: Vec<PodObservation>,
}

impl RolloutView {
    pub fn new(sts: &StatefulSet, pods: Vec<PodObservation>, timings: &Timings) -> Self {
        let partition = partition_of(sts);
        let status = sts.status.as_ref();
        let observed = match (sts.metadata.generation, status.and_then(|s| s.observed_generation)) {
            (Some(want), Some(have)) => have >= want,
            (None, _) => true,
            (Some(_), None) => false,
        };
        RolloutView {
            state: state_of(sts),
            partition,
            replicas: replicas_of(sts),
            observed,
            update_revision: status.and_then(|s| s.update_revision.clone()),
            started_ms: sts
                .annotations()
                .get(ANNOTATION_UPDATE_START_TIME)
                .and_then(|v| v.parse().ok()),
            window: watch_window(sts.annotations(), partition, timings),
            pods,
        }
    }

    /// Every ordinal at or above the partition runs the update revision and
    /// is healthy.
    pub fn gate_passes(&self) -> bool {
        let revision = match &self.update_revision {
            Some(r) => r,
            None => return false,
        };
        (self.partition.max(0)..self.replicas.max(0)).all(|ordinal| {
            self.pods.iter().any(|p| {
                p.ordinal == ordinal as u32 && p.healthy && p.revision.as_ref() == Some(revision)
            })
        })
    }
}

/// What to do with an observed rollout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// Not rolling out.
    Idle,
    /// No window started yet, record one now.
    Start,
    Wait(Duration),
    /// The canary passed, roll out to every replica under a fresh window.
    Advance,
    Done,
    Failed,
}

pub fn step(view: &RolloutView, now_ms: i64, interval: Duration) -> Step {
    if view.state != Some(RolloutState::CanaryUpscale) {
        return Step::Idle;
    }
    let started = match view.started_ms {
        Some(s) => s,
        None => return Step::Start,
    };

    if view.observed && view.gate_passes() {
        return if view.partition > 0 {
            Step::Advance
        } else {
            Step::Done
        };
    }

    let elapsed = Duration::from_millis((now_ms - started).max(0) as u64);
    if elapsed >= view.window {
        return Step::Failed;
    }
    Step::Wait((view.window - elapsed).min(interval))
}

/// Merge patch persisting `step`, `None` when nothing changes.
pub fn step_patch(step: &Step, now_ms: i64) -> Option<serde_json::Value> {
    let annotations = |state: RolloutState| {
        json!({ "metadata": { "annotations": { ANNOTATION_CANARY_ROLLOUT: state.to_string() } } })
    };
    match step {
        Step::Idle | Step::Wait(_) => None,
        Step::Start => Some(json!({
            "metadata": { "annotations": { ANNOTATION_UPDATE_START_TIME: now_ms.to_string() } }
        })),
        Step::Advance => Some(json!({
            "metadata": { "annotations": { ANNOTATION_UPDATE_START_TIME: now_ms.to_string() } },
            "spec": { "updateStrategy": {
                "type": "RollingUpdate",
                "rollingUpdate": { "partition": 0 }
            } }
        })),
        Step::Done => Some(annotations(RolloutState::Done)),
        Step::Failed => Some(annotations(RolloutState::Failed)),
    }
}

/// Applies the rollout configuration to an admitted statefulset. Returns the
/// patch, or `None` when the statefulset is not opted in or its template is
/// unchanged.
pub fn mutate_statefulset(req: &AdmissionRequest<StatefulSet>, now_ms: i64) -> Result<Option<json_patch::Patch>> {
    let sts = match &req.object {
        Some(sts) if is_enabled(sts) => sts,
        _ => return Ok(None),
    };

    let mut mutated = sts.clone();
    match req.operation {
        Operation::Create => configure_initial_rollout(&mut mutated, now_ms),
        Operation::Update => {
            let old = req.old_object.as_ref().and_then(|o| o.spec.as_ref()).map(|s| &s.template);
            let new = sts.spec.as_ref().map(|s| &s.template);
            if old == new {
                return Ok(None);
            }
            debug!("StatefulSet '{}/{}' has changed", sts.namespace().unwrap_or_default(), sts.name_any());
            configure_rollout(&mut mutated, now_ms);
        }
        _ => return Ok(None),
    }

    Ok(Some(json_patch::diff(
        &serde_json::to_value(sts)?,
        &serde_json::to_value(&mutated)?,
    )))
}

/// Admission entry point for statefulset create/update.
pub fn handle(req: &AdmissionRequest<StatefulSet>) -> AdmissionResponse {
    let res = mutate_statefulset(req, now_millis()).and_then(|patch| match patch {
        None => Ok(AdmissionResponse::from(req)),
        Some(p) => AdmissionResponse::from(req)
            .with_patch(p)
            .map_err(|e| e.to_string().into()),
    });
    match res {
        Ok(res) => res,
        Err(e) => {
            warn!("Denying statefulset '{}': {}", req.name, e.display_chain());
            AdmissionResponse::from(req).deny(e.to_string())
        }
    }
}

fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

fn is_owned_by(pod: &Pod, sts: &StatefulSet) -> bool {
    match sts.uid() {
        Some(uid) => pod.owner_references().iter().any(|r| r.uid == uid),
        None => false,
    }
}

fn selector(sts: &StatefulSet) -> Option<String> {
    let labels = sts.spec.as_ref()?.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(","),
    )
}

async fn observe_pods(sts: &StatefulSet, namespace: &str, ctx: &Data) -> Result<Vec<PodObservation>> {
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let mut lp = ListParams::default();
    if let Some(s) = selector(sts) {
        lp = lp.labels(&s);
    }
    let list = deadline(ctx.timeout, "list pods", pods.list(&lp))
        .await
        .chain_err(|| format!("failed to list pods of statefulset '{}/{}'", namespace, sts.name_any()))?;

    // in active/passive mode the probes decide health instead of readiness
    let probes = match sts.labels().get(LABEL_QSTS_NAME) {
        Some(owner) => {
            let qsts: Api<QuarksStatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
            deadline(ctx.timeout, "get quarksstatefulset", qsts.get_opt(owner))
                .await?
                .map(|q| q.spec.active_passive_probes)
                .unwrap_or_default()
        }
        None => BTreeMap::new(),
    };

    let mut observed = Vec::new();
    for pod in list.items.iter().filter(|p| is_owned_by(p, sts)) {
        let ordinal = match ordinal_from_pod_name(&pod.name_any()) {
            Some(o) => o,
            None => continue,
        };
        let healthy = if probes.is_empty() {
            is_ready(pod)
        } else {
            active_passive::probe_pod(&pods, pod, &probes, ctx.timeout).await
        };
        observed.push(PodObservation {
            ordinal,
            revision: pod.labels().get(LABEL_REVISION_HASH).cloned(),
            healthy,
        });
    }
    Ok(observed)
}

/// Rollout controller reconcile for one generation.
pub async fn reconcile(sts: Arc<StatefulSet>, ctx: Arc<Data>) -> Result<Action> {
    let name = sts.name_any();
    let namespace = sts
        .namespace()
        .ok_or_else(|| Error::from(ErrorKind::MissingNamespace("StatefulSet".into(), name.clone())))?;
    if !ctx.monitored.contains(&namespace) || !is_enabled(&sts) {
        return Ok(Action::await_change());
    }
    if state_of(&sts) != Some(RolloutState::CanaryUpscale) {
        ctx.backoff.reset(sts.as_ref());
        return Ok(Action::await_change());
    }

    let pods = observe_pods(&sts, &namespace, &ctx).await?;
    let view = RolloutView::new(&sts, pods, &ctx.timings);
    let now = now_millis();
    let next = step(&view, now, ctx.timings.interval);
    debug!("Rollout of '{}/{}' at partition {}: {:?}", namespace, name, view.partition, next);

    if let Some(patch) = step_patch(&next, now) {
        let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &namespace);
        deadline(
            ctx.timeout,
            "patch statefulset",
            api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .chain_err(|| format!("failed to update rollout of '{}/{}'", namespace, name))?;
    }
    ctx.backoff.reset(sts.as_ref());

    Ok(match next {
        Step::Wait(d) => Action::requeue(d),
        Step::Start | Step::Advance => Action::requeue(ctx.timings.interval),
        Step::Failed => {
            warn!(
                "Rollout of statefulset '{}/{}' failed after {:?}",
                namespace, name, view.window
            );
            Action::await_change()
        }
        Step::Done => {
            info!("Rollout of statefulset '{}/{}' is done", namespace, name);
            Action::await_change()
        }
        Step::Idle => Action::await_change(),
    })
}
