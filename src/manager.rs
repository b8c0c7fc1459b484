use crate::config::Config;
use crate::generation::{self, Decision, Generation, Inputs};
use crate::monitored::{self, Namespaces};
use crate::pod_mutator::PodMutator;
use crate::qsts::{QuarksStatefulSet, LABEL_QSTS_NAME};
use crate::reference::{self, RefKind, LABEL_SECRET_KIND, VERSIONED_SECRET_KIND};
use crate::rollout::{self, RolloutState, Timings};
use crate::trigger::Triggers;
use crate::{active_passive, deadline, errors::*};
use dashmap::DashMap;
use error_chain::ChainedError;
use futures::{future, future::BoxFuture, FutureExt, StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use kube_runtime::controller::{self, Action, Controller};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use kube_runtime::{reflector, watcher, WatchStreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde_json::json;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;

const CRD_NAME: &str = "quarksstatefulsets.quarks.cloudfoundry.org";
const RESYNC: Duration = Duration::from_secs(300);
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Per-object retry delays, doubled on every consecutive failure.
#[derive(Debug, Default)]
pub struct Backoff {
    failures: DashMap<String, u32>,
}

fn backoff_key<K: Resource<DynamicType = ()>>(obj: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        obj.meta().namespace.as_deref().unwrap_or_default(),
        obj.meta().name.as_deref().unwrap_or_default()
    )
}

impl Backoff {
    pub fn next<K: Resource<DynamicType = ()>>(&self, obj: &K) -> Duration {
        let failures = {
            let mut entry = self.failures.entry(backoff_key(obj)).or_insert(0);
            *entry += 1;
            *entry
        };
        let delay = BACKOFF_BASE * 2u32.saturating_pow((failures - 1).min(6));
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        delay.min(BACKOFF_MAX) + jitter
    }

    pub fn reset<K: Resource<DynamicType = ()>>(&self, obj: &K) {
        self.failures.remove(&backoff_key(obj));
    }
}

// Context for our reconcilers
pub struct Data {
    /// kubernetes client
    pub client: Client,
    /// deadline for every API call
    pub timeout: Duration,
    pub timings: Timings,
    pub triggers: Triggers,
    pub monitored: Namespaces,
    pub backoff: Backoff,
    /// identity of the events we publish
    pub reporter: Reporter,
}

/// A generation is settled once nothing about it is in flight anymore.
pub fn is_settled(sts: &StatefulSet) -> bool {
    if rollout::is_enabled(sts) {
        return rollout::state_of(sts) == Some(RolloutState::Done);
    }
    is_ready(sts)
}

pub fn is_ready(sts: &StatefulSet) -> bool {
    let replicas = generation::replicas_of(sts);
    let status = match &sts.status {
        Some(s) => s,
        None => return replicas == 0,
    };
    let observed = match (sts.metadata.generation, status.observed_generation) {
        (Some(want), Some(have)) => have >= want,
        _ => true,
    };
    observed
        && status.ready_replicas.unwrap_or(0) >= replicas
        && status.updated_replicas.unwrap_or(0) >= replicas
}

/// SHA-1 over the names and payloads of the given objects.
pub fn config_digest(config_maps: &[ConfigMap], secrets: &[Secret]) -> Result<String> {
    let mut hasher = Sha1::new();
    for cm in config_maps {
        hasher.update(cm.name_any().as_bytes());
        hasher.update(serde_json::to_vec(&(&cm.data, &cm.binary_data))?);
    }
    for secret in secrets {
        hasher.update(secret.name_any().as_bytes());
        hasher.update(serde_json::to_vec(&secret.data)?);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Gathers what a generation derives from besides the QuarksStatefulSet:
/// the latest versioned secrets and the digest of referenced payloads.
async fn generation_inputs(qsts: &QuarksStatefulSet, namespace: &str, ctx: &Data) -> Result<Inputs> {
    let mut inputs = Inputs::default();
    if !qsts.spec.update_on_config_change {
        return Ok(inputs);
    }

    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let lp = ListParams::default().labels(&format!("{}={}", LABEL_SECRET_KIND, VERSIONED_SECRET_KIND));
    let versioned = deadline(ctx.timeout, "list secrets", secrets.list(&lp))
        .await
        .chain_err(|| format!("failed to list versioned secrets in '{}'", namespace))?;
    inputs.latest_secrets = reference::latest_versions(&versioned.items);

    let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), namespace);
    let mut found_cms = Vec::new();
    for name in reference::referenced_by(qsts, RefKind::ConfigMap) {
        match deadline(ctx.timeout, "get configmap", config_maps.get_opt(&name)).await? {
            Some(cm) => found_cms.push(cm),
            None => debug!("ConfigMap '{}/{}' referenced by '{}' not found", namespace, name, qsts.key()),
        }
    }
    let mut found_secrets = Vec::new();
    for name in reference::referenced_by(qsts, RefKind::Secret) {
        let name = reference::VersionedName::parse(&name)
            .and_then(|v| inputs.latest_secrets.get(&v.base).cloned())
            .unwrap_or(name);
        match deadline(ctx.timeout, "get secret", secrets.get_opt(&name)).await? {
            Some(s) => found_secrets.push(s),
            None => debug!("Secret '{}/{}' referenced by '{}' not found", namespace, name, qsts.key()),
        }
    }
    inputs.config_sha1 = Some(config_digest(&found_cms, &found_secrets)?);
    Ok(inputs)
}

/// Tells users that a claim template change will not reach the statefulsets.
async fn publish_claims_warning(qsts: &QuarksStatefulSet, ctx: &Data) {
    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone(), qsts.object_ref(&()));
    let event = Event {
        type_: EventType::Warning,
        reason: "VolumeClaimTemplatesWarning".into(),
        note: Some(
            "Change in VolumeClaimTemplates won't be performed in sts as it's not supported by Kubernetes".into(),
        ),
        action: "Reconcile".into(),
        secondary: None,
    };
    if let Err(e) = deadline(ctx.timeout, "publish event", recorder.publish(event)).await {
        warn!("could not publish event for '{}': {}", qsts.key(), e.display_chain());
    }
}

/// What a reconcile does to the generations of a QuarksStatefulSet.
#[derive(Clone, Debug, PartialEq)]
enum Plan {
    /// Materialize the next version as new statefulsets.
    Create,
    /// Move the live statefulsets of a canary-enabled owner to the next
    /// version in place, so the changed template rolls through the partition.
    Update(Vec<StatefulSet>),
    /// Only replica counts differ, possibly none.
    Scale(Vec<(String, i32)>),
}

/// Compares the desired generations at `current.version` with what exists.
fn plan(
    qsts: &QuarksStatefulSet,
    current: &Generation,
    owned: &[StatefulSet],
    inputs: &Inputs,
) -> Result<Plan> {
    if !current.exists() {
        return Ok(Plan::Create);
    }
    let mut scales = Vec::new();
    let mut live = Vec::new();
    let mut changed = false;
    for zone in qsts.spec.zone_slots() {
        let zone_index = zone.as_ref().map(|z| z.index);
        let sts = match owned.iter().find(|s| {
            generation::version_of(s).ok() == Some(current.version) && generation::zone_of(s) == zone_index
        }) {
            Some(sts) => sts,
            None => return Ok(Plan::Create),
        };
        let existing = Generation {
            statefulset: sts.clone(),
            version: current.version,
        };
        let desired = generation::build(qsts, current.version, zone.as_ref(), inputs)?;
        match generation::decide(&existing, &desired) {
            Decision::Create => changed = true,
            Decision::Scale(replicas) => scales.push((sts.name_any(), replicas)),
            Decision::Keep => {}
        }
        live.push((sts, zone));
    }
    if !changed {
        return Ok(Plan::Scale(scales));
    }

    let mut updates = Vec::new();
    for (sts, zone) in live {
        let mut next = generation::build(qsts, current.version + 1, zone.as_ref(), inputs)?;
        if !rollout::is_enabled(&next) {
            return Ok(Plan::Create);
        }
        next.metadata.name = sts.metadata.name.clone();
        next.metadata.resource_version = sts.metadata.resource_version.clone();
        rollout::carry_over(sts, &mut next);
        updates.push(next);
    }
    Ok(Plan::Update(updates))
}

/// Names of the generations older than `version`. Empty until every
/// generation at `version` is settled, so a failed or running rollout keeps
/// its predecessor.
fn superseded(owned: &[StatefulSet], version: u32) -> Vec<String> {
    let newest_settled = owned
        .iter()
        .filter(|s| generation::version_of(s).ok() == Some(version))
        .all(is_settled);
    if !newest_settled {
        return Vec::new();
    }
    owned
        .iter()
        .filter(|s| generation::version_of(s).ok() < Some(version))
        .map(|s| s.name_any())
        .collect()
}

async fn reconcile(qsts: Arc<QuarksStatefulSet>, ctx: Arc<Data>) -> Result<Action> {
    let name = qsts.name_any();
    let ns = qsts.namespace().ok_or_else(|| {
        Error::from(ErrorKind::MissingNamespace("QuarksStatefulSet".into(), name.clone()))
    })?;
    if !ctx.monitored.contains(&ns) {
        debug!("Skipping QuarksStatefulSet '{}/{}', namespace is not monitored", ns, name);
        return Ok(Action::await_change());
    }
    if qsts.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    debug!("Reconciling QuarksStatefulSet '{}/{}'", ns, name);
    if ctx.triggers.take_claims_warning(&qsts.key()) {
        publish_claims_warning(&qsts, &ctx).await;
    }

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    let (current, owned) = generation::current_generation(&sts_api, &qsts, ctx.timeout).await?;
    let inputs = generation_inputs(&qsts, &ns, &ctx).await?;

    let scales = match plan(&qsts, &current, &owned, &inputs)? {
        Plan::Scale(scales) => scales,
        Plan::Create => {
            let version = current.version + 1;
            for zone in qsts.spec.zone_slots() {
                let sts = generation::build(&qsts, version, zone.as_ref(), &inputs)?;
                info!("Creating statefulset '{}/{}' (version {})", ns, sts.name_any(), version);
                deadline(ctx.timeout, "create statefulset", sts_api.create(&PostParams::default(), &sts))
                    .await
                    .chain_err(|| format!("could not create statefulset for '{}/{}'", ns, name))?;
            }
            ctx.backoff.reset(qsts.as_ref());
            return Ok(Action::requeue(ctx.timings.interval));
        }
        Plan::Update(updates) => {
            for sts in updates {
                let sts_name = sts.name_any();
                info!(
                    "Updating statefulset '{}/{}' to version {}",
                    ns,
                    sts_name,
                    current.version + 1
                );
                deadline(
                    ctx.timeout,
                    "update statefulset",
                    sts_api.replace(&sts_name, &PostParams::default(), &sts),
                )
                .await
                .chain_err(|| format!("could not update statefulset '{}/{}'", ns, sts_name))?;
            }
            ctx.backoff.reset(qsts.as_ref());
            return Ok(Action::requeue(ctx.timings.interval));
        }
    };

    for (generation_name, replicas) in scales {
        info!("Scaling statefulset '{}/{}' to {} replicas", ns, generation_name, replicas);
        let patch = json!({ "spec": { "replicas": replicas } });
        deadline(
            ctx.timeout,
            "scale statefulset",
            sts_api.patch(&generation_name, &PatchParams::default(), &Patch::Merge(&patch)),
        )
        .await
        .chain_err(|| format!("could not scale statefulset '{}/{}'", ns, generation_name))?;
    }

    let newest: Vec<&StatefulSet> = owned
        .iter()
        .filter(|s| generation::version_of(s).ok() == Some(current.version))
        .collect();
    let settled = newest.iter().all(|s| is_settled(s));
    for old_name in superseded(&owned, current.version) {
        info!("Deleting superseded statefulset '{}/{}'", ns, old_name);
        deadline(
            ctx.timeout,
            "delete statefulset",
            sts_api.delete(&old_name, &DeleteParams::background()),
        )
        .await
        .chain_err(|| format!("could not delete statefulset '{}/{}'", ns, old_name))?;
    }

    let ready = settled && newest.iter().all(|s| is_ready(s));
    let status = json!({
        "status": {
            "ready": ready,
            "lastReconcile": chrono::Utc::now().to_rfc3339(),
        }
    });
    let qsts_api: Api<QuarksStatefulSet> = Api::namespaced(ctx.client.clone(), &ns);
    deadline(
        ctx.timeout,
        "update quarksstatefulset status",
        qsts_api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status)),
    )
    .await
    .chain_err(|| format!("could not update status of '{}/{}'", ns, name))?;

    ctx.backoff.reset(qsts.as_ref());
    Ok(if settled {
        // try again in 5min
        Action::requeue(RESYNC)
    } else {
        Action::requeue(ctx.timings.interval)
    })
}

fn error_policy<K: Resource<DynamicType = ()>>(obj: Arc<K>, error: &Error, ctx: Arc<Data>) -> Action {
    let delay = ctx.backoff.next(obj.as_ref());
    warn!(
        "reconcile of {} failed, retrying in {:?}: {}",
        backoff_key(obj.as_ref()),
        delay,
        error.display_chain()
    );
    Action::requeue(delay)
}

pub struct Manager {
    context: Arc<Data>,
}

/// Manager owning the QuarksStatefulSet, rollout and active/passive controllers
impl Manager {
    /// Lifecycle initialization interface for app
    ///
    /// This returns a `Manager` that drives the controllers + a future to be awaited
    /// It is up to `main` to wait for the controller streams.
    pub async fn new(client: Client, config: &Config) -> Result<(Self, BoxFuture<'static, ()>)> {
        let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
        deadline(config.timeout(), "get crd", crds.get_opt(CRD_NAME))
            .await?
            .ok_or_else(|| {
                Error::from(ErrorKind::MissingObject(
                    "CustomResourceDefinition".into(),
                    CRD_NAME.into(),
                ))
            })
            .chain_err(|| "install the quarksstatefulset crd first")?;

        let (ns_reader, ns_writer) = reflector::store::<Namespace>();
        let ns_watch = watcher(
            Api::<Namespace>::all(client.clone()),
            watcher::Config::default().labels(&monitored::selector(&config.monitored_id)),
        )
        .default_backoff()
        .reflect(ns_writer)
        .for_each(|_| future::ready(()));

        let context = Arc::new(Data {
            client: client.clone(),
            timeout: config.timeout(),
            timings: config.timings(),
            triggers: Triggers::default(),
            monitored: Namespaces::new(config.monitored_id.clone(), ns_reader),
            backoff: Backoff::default(),
            reporter: Reporter {
                controller: "quarks-statefulset".into(),
                instance: config.pod_name.clone(),
            },
        });

        let (qsts_reader, qsts_writer) = reflector::store::<QuarksStatefulSet>();
        let (filter, prune) = (context.clone(), context.clone());
        let qsts_stream = watcher(
            Api::<QuarksStatefulSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .reflect(qsts_writer)
        .inspect_ok(move |event| prune.triggers.prune_quarks_statefulsets(event))
        .applied_objects()
        .try_filter(move |q| future::ready(filter.triggers.quarks_statefulset(q)));

        // payload digests are forgotten again once an object is deleted
        let (cm_store, cm_ctx) = (qsts_reader.clone(), context.clone());
        let cm_prune = context.clone();
        let config_maps = watcher(Api::<ConfigMap>::all(client.clone()), watcher::Config::default())
            .default_backoff()
            .inspect_ok(move |event| cm_prune.triggers.prune_config_maps(event))
            .applied_objects();
        let (secret_store, secret_ctx) = (qsts_reader.clone(), context.clone());
        let secret_prune = context.clone();
        let secrets = watcher(Api::<Secret>::all(client.clone()), watcher::Config::default())
            .default_backoff()
            .inspect_ok(move |event| secret_prune.triggers.prune_secrets(event))
            .applied_objects();
        let qsts_drainer = Controller::for_stream(qsts_stream, qsts_reader)
            .with_config(controller::Config::default().concurrency(config.max_quarks_statefulset_workers))
            .owns(
                Api::<StatefulSet>::all(client.clone()),
                watcher::Config::default().labels(LABEL_QSTS_NAME),
            )
            .watches_stream(config_maps, move |cm| {
                let owners = cm_store.state();
                cm_ctx.triggers.config_map(&cm, owners.iter().map(|q| q.as_ref()))
            })
            .watches_stream(secrets, move |secret| {
                let owners = secret_store.state();
                secret_ctx.triggers.secret(&secret, owners.iter().map(|q| q.as_ref()))
            })
            .run(reconcile, error_policy, context.clone())
            .for_each(|res| {
                match res {
                    Ok((obj, _)) => debug!("Reconciled {}", obj),
                    Err(e) => debug!("QuarksStatefulSet controller: {}", e),
                }
                future::ready(())
            });

        let rollout_drainer = Controller::new(
            Api::<StatefulSet>::all(client.clone()),
            watcher::Config::default().labels(LABEL_QSTS_NAME),
        )
        .owns(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default().labels(LABEL_QSTS_NAME),
        )
        .run(rollout::reconcile, error_policy, context.clone())
        .for_each(|res| {
            if let Err(e) = res {
                debug!("rollout controller: {}", e);
            }
            future::ready(())
        });

        let active_passive_drainer = Controller::new(
            Api::<QuarksStatefulSet>::all(client.clone()),
            watcher::Config::default(),
        )
        .run(active_passive::reconcile, error_policy, context.clone())
        .for_each(|res| {
            if let Err(e) = res {
                debug!("active/passive controller: {}", e);
            }
            future::ready(())
        });

        // what we do with the controller streams from .run() ^^ does not matter
        // but we do need to consume them, hence a joined future
        let drainer = future::join4(qsts_drainer, rollout_drainer, active_passive_drainer, ns_watch)
            .map(|_| ())
            .boxed();

        Ok((Self { context }, drainer))
    }

    /// Admission handler for pods, sharing the manager's client.
    pub fn pod_mutator(&self) -> PodMutator {
        PodMutator::new(self.context.client.clone(), self.context.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{
        RollingUpdateStatefulSetStrategy, StatefulSetSpec, StatefulSetStatus, StatefulSetUpdateStrategy,
    };
    use kube::core::admission::{AdmissionRequest, AdmissionReview};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn sts(replicas: i32, ready: i32, annotations: &[(&str, &str)]) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("example-v1".into()),
                namespace: Some("ns".into()),
                generation: Some(1),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                observed_generation: Some(1),
                ready_replicas: Some(ready),
                updated_replicas: Some(ready),
                replicas: ready,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn backoff_grows_and_resets() {
        let backoff = Backoff::default();
        let obj = sts(1, 1, &[]);
        let first = backoff.next(&obj);
        assert!(first >= BACKOFF_BASE && first < BACKOFF_BASE + Duration::from_secs(1));
        let second = backoff.next(&obj);
        assert!(second >= BACKOFF_BASE * 2 && second < BACKOFF_BASE * 2 + Duration::from_secs(1));
        for _ in 0..10 {
            assert!(backoff.next(&obj) < BACKOFF_MAX + Duration::from_secs(1));
        }

        backoff.reset(&obj);
        assert!(backoff.next(&obj) < BACKOFF_BASE + Duration::from_secs(1));
    }

    #[test]
    fn settled_without_canary_means_ready() {
        assert!(is_settled(&sts(2, 2, &[])));
        assert!(!is_settled(&sts(2, 1, &[])));

        let mut lagging = sts(2, 2, &[]);
        lagging.metadata.generation = Some(2);
        assert!(!is_settled(&lagging));
    }

    #[test]
    fn settled_with_canary_means_done() {
        let enabled = (rollout::ANNOTATION_CANARY_ROLLOUT_ENABLED, "true");
        assert!(!is_settled(&sts(2, 2, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "CanaryUpscale")])));
        assert!(!is_settled(&sts(2, 0, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "Failed")])));
        assert!(is_settled(&sts(2, 2, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "Done")])));
    }

    fn config_map(name: &str, value: &str) -> ConfigMap {
        let mut data = BTreeMap::new();
        data.insert("key1".to_string(), value.to_string());
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn config_digest_follows_payloads() {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("example2".into()),
                ..Default::default()
            },
            data: Some(
                vec![("key1".to_string(), ByteString(b"v".to_vec()))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        let base = config_digest(&[config_map("example1", "v")], &[secret.clone()]).unwrap();
        assert_eq!(base.len(), 40);
        assert_eq!(
            base,
            config_digest(&[config_map("example1", "v")], &[secret.clone()]).unwrap()
        );
        assert_ne!(
            base,
            config_digest(&[config_map("example1", "modified")], &[secret.clone()]).unwrap()
        );
        assert_ne!(base, config_digest(&[config_map("example1", "v")], &[]).unwrap());
    }

    fn owner() -> QuarksStatefulSet {
        let mut q = QuarksStatefulSet::new(
            "example",
            crate::qsts::QuarksStatefulSetSpec {
                template: StatefulSet {
                    spec: Some(StatefulSetSpec {
                        replicas: Some(2),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        q.metadata.namespace = Some("ns".into());
        q.metadata.uid = Some("1234".into());
        q
    }

    #[test]
    fn plan_creates_scales_or_keeps() {
        let q = owner();
        let inputs = Inputs::default();
        assert_eq!(plan(&q, &Generation::placeholder(), &[], &inputs).unwrap(), Plan::Create);

        let v1 = generation::build(&q, 1, None, &inputs).unwrap();
        let current = generation::select_current(std::iter::once(&v1)).unwrap();
        assert_eq!(
            plan(&q, &current, &[v1.clone()], &inputs).unwrap(),
            Plan::Scale(vec![])
        );

        let mut scaled = q.clone();
        scaled.spec.template.spec.as_mut().unwrap().replicas = Some(4);
        assert_eq!(
            plan(&scaled, &current, &[v1.clone()], &inputs).unwrap(),
            Plan::Scale(vec![("example-v1".to_string(), 4)])
        );

        let mut relabeled = q.clone();
        relabeled
            .spec
            .template
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("tier".into(), "db".into());
        assert_eq!(plan(&relabeled, &current, &[v1.clone()], &inputs).unwrap(), Plan::Create);

        let changed_config = Inputs {
            config_sha1: Some("abc".into()),
            ..Inputs::default()
        };
        assert_eq!(plan(&q, &current, &[v1], &changed_config).unwrap(), Plan::Create);
    }

    #[test]
    fn plan_with_zones_requires_every_zone() {
        let mut q = owner();
        q.spec.zones = vec!["z1".into(), "z2".into()];
        let inputs = Inputs::default();
        let zones = q.spec.zone_slots();
        let z0 = generation::build(&q, 1, zones[0].as_ref(), &inputs).unwrap();
        let z1 = generation::build(&q, 1, zones[1].as_ref(), &inputs).unwrap();
        let current = generation::select_current(vec![&z0, &z1]).unwrap();

        assert_eq!(plan(&q, &current, &[z0.clone()], &inputs).unwrap(), Plan::Create);
        assert_eq!(plan(&q, &current, &[z0, z1], &inputs).unwrap(), Plan::Scale(vec![]));
    }

    fn canary_owner() -> QuarksStatefulSet {
        let mut q = owner();
        q.spec.template.spec.as_mut().unwrap().replicas = Some(3);
        q.spec.template.metadata.annotations = Some(
            vec![
                (rollout::ANNOTATION_CANARY_ROLLOUT_ENABLED.to_string(), "true".to_string()),
                (rollout::ANNOTATION_CANARY_WATCH_TIME.to_string(), "1000".to_string()),
                (rollout::ANNOTATION_UPDATE_WATCH_TIME.to_string(), "20000".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        q
    }

    fn rolled_out(mut sts: StatefulSet) -> StatefulSet {
        sts.metadata.resource_version = Some("7".into());
        sts.annotations_mut().insert(
            rollout::ANNOTATION_CANARY_ROLLOUT.to_string(),
            RolloutState::Done.to_string(),
        );
        sts.spec.as_mut().unwrap().update_strategy = Some(StatefulSetUpdateStrategy {
            type_: Some("RollingUpdate".into()),
            rolling_update: Some(RollingUpdateStatefulSetStrategy {
                partition: Some(0),
                ..Default::default()
            }),
        });
        sts
    }

    fn admission(object: &StatefulSet, old: &StatefulSet) -> AdmissionRequest<StatefulSet> {
        let review = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "apps", "version": "v1", "kind": "StatefulSet" },
                "resource": { "group": "apps", "version": "v1", "resource": "statefulsets" },
                "requestKind": { "group": "apps", "version": "v1", "kind": "StatefulSet" },
                "requestResource": { "group": "apps", "version": "v1", "resource": "statefulsets" },
                "name": object.name_any(),
                "namespace": "ns",
                "operation": "UPDATE",
                "userInfo": { "username": "admin" },
                "object": object,
                "oldObject": old,
                "dryRun": false
            }
        });
        let review: AdmissionReview<StatefulSet> = serde_json::from_value(review).unwrap();
        review.try_into().unwrap()
    }

    #[test]
    fn canary_spec_update_rolls_through_the_partition() {
        let q = canary_owner();
        let inputs = Inputs::default();
        let v1 = rolled_out(generation::build(&q, 1, None, &inputs).unwrap());
        let current = generation::select_current(std::iter::once(&v1)).unwrap();

        let mut updated = q.clone();
        updated.spec.template.spec.as_mut().unwrap().template.metadata = Some(ObjectMeta {
            labels: Some(vec![("testpodupdated".to_string(), "yes".to_string())].into_iter().collect()),
            ..Default::default()
        });
        let next = match plan(&updated, &current, &[v1.clone()], &inputs).unwrap() {
            Plan::Update(next) => next,
            other => panic!("expected an in-place update, got {:?}", other),
        };
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].name_any(), "example-v1");
        assert_eq!(next[0].metadata.resource_version.as_deref(), Some("7"));
        assert_eq!(generation::version_of(&next[0]).unwrap(), 2);

        // the replace goes through the statefulset admission handler
        let patch = rollout::mutate_statefulset(&admission(&next[0], &v1), 5_000)
            .unwrap()
            .unwrap();
        let mut patched = serde_json::to_value(&next[0]).unwrap();
        json_patch::patch(&mut patched, &patch).unwrap();
        let patched: StatefulSet = serde_json::from_value(patched).unwrap();

        assert_eq!(rollout::partition_of(&patched), 2);
        assert_eq!(rollout::state_of(&patched), Some(RolloutState::CanaryUpscale));
        let view = rollout::RolloutView::new(&patched, vec![], &Timings::default());
        assert_eq!(view.window, Duration::from_millis(1000));
    }

    #[test]
    fn label_only_update_keeps_rollout_state() {
        let q = canary_owner();
        let inputs = Inputs::default();
        let v1 = rolled_out(generation::build(&q, 1, None, &inputs).unwrap());
        let current = generation::select_current(std::iter::once(&v1)).unwrap();

        let mut relabeled = q.clone();
        relabeled
            .spec
            .template
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("tier".into(), "db".into());
        let next = match plan(&relabeled, &current, &[v1.clone()], &inputs).unwrap() {
            Plan::Update(next) => next,
            other => panic!("expected an in-place update, got {:?}", other),
        };
        assert_eq!(rollout::state_of(&next[0]), Some(RolloutState::Done));
        assert_eq!(rollout::partition_of(&next[0]), 0);
        // same pod template, the admission handler leaves it alone
        assert!(rollout::mutate_statefulset(&admission(&next[0], &v1), 1).unwrap().is_none());
    }

    #[test]
    fn first_canary_generation_is_created() {
        let q = canary_owner();
        assert_eq!(
            plan(&q, &Generation::placeholder(), &[], &Inputs::default()).unwrap(),
            Plan::Create
        );
    }

    fn at_version(name: &str, version: u32, annotations: &[(&str, &str)]) -> StatefulSet {
        let mut s = sts(2, 2, annotations);
        s.metadata.name = Some(name.into());
        s.annotations_mut()
            .insert(generation::ANNOTATION_VERSION.to_string(), version.to_string());
        s
    }

    #[test]
    fn superseded_generations_wait_for_the_newest() {
        let enabled = (rollout::ANNOTATION_CANARY_ROLLOUT_ENABLED, "true");
        let old = at_version("example-v1", 1, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "Done")]);

        let failed = at_version("example-v2", 2, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "Failed")]);
        assert!(superseded(&[old.clone(), failed], 2).is_empty());

        let running = at_version("example-v2", 2, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "CanaryUpscale")]);
        assert!(superseded(&[old.clone(), running], 2).is_empty());

        let done = at_version("example-v2", 2, &[enabled, (rollout::ANNOTATION_CANARY_ROLLOUT, "Done")]);
        assert_eq!(superseded(&[old.clone(), done.clone()], 2), vec!["example-v1".to_string()]);

        let ready = at_version("example-v2", 2, &[]);
        assert_eq!(superseded(&[old, ready], 2), vec!["example-v1".to_string()]);
    }
}
