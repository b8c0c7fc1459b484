//! Turns ConfigMap/Secret writes into QuarksStatefulSet reconcile requests.

use crate::qsts::QuarksStatefulSet;
use crate::reference::{self, RefKind};
use dashmap::{DashMap, DashSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use kube_runtime::watcher;
use log::{debug, error, warn};
use serde::Serialize;
use sha1::{Digest, Sha1};
use std::collections::BTreeSet;

/// A configuration object that was written.
#[derive(Clone, Copy, Debug)]
pub enum Changed<'a> {
    ConfigMap(&'a ConfigMap),
    Secret(&'a Secret),
}

impl<'a> Changed<'a> {
    fn kind(&self) -> RefKind {
        match self {
            Changed::ConfigMap(_) => RefKind::ConfigMap,
            Changed::Secret(_) => RefKind::Secret,
        }
    }

    fn name(&self) -> String {
        match self {
            Changed::ConfigMap(c) => c.name_any(),
            Changed::Secret(s) => s.name_any(),
        }
    }

    fn namespace(&self) -> Option<String> {
        match self {
            Changed::ConfigMap(c) => c.namespace(),
            Changed::Secret(s) => s.namespace(),
        }
    }

    fn is_versioned(&self) -> bool {
        match self {
            Changed::ConfigMap(_) => false,
            Changed::Secret(s) => reference::is_versioned_secret(s),
        }
    }

    fn payload_digest(&self) -> String {
        match self {
            Changed::ConfigMap(c) => digest(&(&c.data, &c.binary_data)),
            Changed::Secret(s) => digest(&s.data),
        }
    }

    fn key(&self) -> String {
        let prefix = match self.kind() {
            RefKind::ConfigMap => CONFIG_MAP_PREFIX,
            RefKind::Secret => SECRET_PREFIX,
        };
        format!(
            "{}{}/{}",
            prefix,
            self.namespace().unwrap_or_default(),
            self.name()
        )
    }
}

fn digest<T: Serialize>(value: &T) -> String {
    match serde_json::to_vec(value) {
        Ok(bytes) => hex::encode(Sha1::digest(&bytes)),
        Err(e) => {
            // never equal to a previous digest, so the change is not swallowed
            error!("failed to digest payload: {}", e);
            format!("unencodable-{}", crate::now_millis())
        }
    }
}

/// Whether `owner` references the changed object. Versioned secrets match
/// by base name; with `require_version_check` they must also supersede the
/// version the owner currently references.
pub fn is_referenced_by(changed: Changed<'_>, owner: &QuarksStatefulSet, require_version_check: bool) -> bool {
    let references = reference::referenced_by(owner, changed.kind());
    let name = changed.name();

    if changed.is_versioned() {
        let found = reference::contains_secret_name(&references, &name);
        if require_version_check && found {
            return reference::contains_outdated_secret_version(&references, &name);
        }
        return found;
    }

    references.contains(&name)
}

/// Reconcile requests for every opted-in QuarksStatefulSet in the changed
/// object's namespace that references it.
pub fn reconciles_for<'a, I>(
    changed: Changed<'_>,
    candidates: I,
    require_version_check: bool,
) -> Vec<ObjectRef<QuarksStatefulSet>>
where
    I: IntoIterator<Item = &'a QuarksStatefulSet>,
{
    let namespace = changed.namespace();
    debug!(
        "Searching 'qsts' for references to '{}/{}'",
        namespace.as_deref().unwrap_or_default(),
        changed.name()
    );
    candidates
        .into_iter()
        .filter(|q| q.namespace() == namespace)
        .filter(|q| q.spec.update_on_config_change)
        .filter(|q| is_referenced_by(changed, q, require_version_check))
        .map(ObjectRef::from_obj)
        .collect()
}

/// What a watch event means relative to the last payload seen for the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observed {
    New,
    Changed,
    Unchanged,
}

/// Remembers the last payload digest per object so metadata-only churn can
/// be dropped.
#[derive(Debug, Default)]
pub struct PayloadFilter {
    seen: DashMap<String, String>,
}

impl PayloadFilter {
    pub fn observe(&self, key: String, digest: String) -> Observed {
        match self.seen.insert(key, digest.clone()) {
            None => Observed::New,
            Some(prev) if prev == digest => Observed::Unchanged,
            Some(_) => Observed::Changed,
        }
    }

    pub fn forget(&self, key: &str) {
        self.seen.remove(key);
    }

    /// Drops every key starting with `prefix` that is not in `live`.
    pub fn retain(&self, prefix: &str, live: &BTreeSet<String>) {
        self.seen
            .retain(|k, _| !k.starts_with(prefix) || live.contains(k));
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forgets deleted objects, and on a relist everything that was not listed.
    fn prune<K, F>(&self, event: &watcher::Event<K>, prefix: &str, key: F)
    where
        F: Fn(&K) -> String,
    {
        match event {
            watcher::Event::Applied(_) => {}
            watcher::Event::Deleted(obj) => self.forget(&key(obj)),
            watcher::Event::Restarted(objs) => {
                let live: BTreeSet<String> = objs.iter().map(&key).collect();
                self.retain(prefix, &live);
            }
        }
    }
}

/// Highest version seen per versioned secret base name, keyed `namespace/base`.
#[derive(Debug, Default)]
struct LatestVersions {
    versions: DashMap<String, u64>,
}

impl LatestVersions {
    fn key(secret: &Secret) -> Option<(String, u64)> {
        let parsed = reference::VersionedName::parse(&secret.name_any())?;
        Some((
            format!("{}/{}", secret.namespace().unwrap_or_default(), parsed.base),
            parsed.version,
        ))
    }

    /// Records `secret` and tells whether no newer version was seen before.
    fn observe(&self, secret: &Secret) -> bool {
        let (key, version) = match Self::key(secret) {
            Some(k) => k,
            None => return false,
        };
        let mut latest = self.versions.entry(key).or_insert(version);
        if *latest > version {
            return false;
        }
        *latest = version;
        true
    }

    fn prune(&self, event: &watcher::Event<Secret>) {
        match event {
            watcher::Event::Applied(_) => {}
            watcher::Event::Deleted(secret) => {
                if let Some((key, version)) = Self::key(secret) {
                    self.versions.remove_if(&key, |_, latest| *latest == version);
                }
            }
            watcher::Event::Restarted(secrets) => {
                self.versions.clear();
                for secret in secrets.iter().filter(|s| reference::is_versioned_secret(s)) {
                    self.observe(secret);
                }
            }
        }
    }
}

const CONFIG_MAP_PREFIX: &str = "configmap:";
const SECRET_PREFIX: &str = "secret:";

/// Event filtering and mapping for the QuarksStatefulSet controller's watches.
#[derive(Debug, Default)]
pub struct Triggers {
    payloads: PayloadFilter,
    secret_versions: LatestVersions,
    specs: PayloadFilter,
    claims: PayloadFilter,
    /// QuarksStatefulSets whose claim template change still has to be reported.
    claims_warnings: DashSet<String>,
}

impl Triggers {
    /// ConfigMap events: creations and payload changes are evaluated.
    pub fn config_map<'a, I>(&self, cm: &ConfigMap, candidates: I) -> Vec<ObjectRef<QuarksStatefulSet>>
    where
        I: IntoIterator<Item = &'a QuarksStatefulSet>,
    {
        let changed = Changed::ConfigMap(cm);
        match self.payloads.observe(changed.key(), changed.payload_digest()) {
            Observed::Unchanged => Vec::new(),
            Observed::New | Observed::Changed => {
                let reconciles = reconciles_for(changed, candidates, false);
                log_mapping(changed, &reconciles);
                reconciles
            }
        }
    }

    /// Secret events: a creation only counts for versioned secrets that are
    /// the newest of their name and supersede a referenced version, updates
    /// count on payload changes.
    pub fn secret<'a, I>(&self, secret: &Secret, candidates: I) -> Vec<ObjectRef<QuarksStatefulSet>>
    where
        I: IntoIterator<Item = &'a QuarksStatefulSet> + Clone,
    {
        let changed = Changed::Secret(secret);
        let reconciles = match self.payloads.observe(changed.key(), changed.payload_digest()) {
            Observed::Unchanged => return Vec::new(),
            Observed::New => {
                if !changed.is_versioned() || !self.secret_versions.observe(secret) {
                    return Vec::new();
                }
                if reconciles_for(changed, candidates.clone(), true).is_empty() {
                    return Vec::new();
                }
                reconciles_for(changed, candidates, false)
            }
            Observed::Changed => reconciles_for(changed, candidates, false),
        };
        log_mapping(changed, &reconciles);
        reconciles
    }

    pub fn prune_config_maps(&self, event: &watcher::Event<ConfigMap>) {
        self.payloads
            .prune(event, CONFIG_MAP_PREFIX, |cm| Changed::ConfigMap(cm).key());
    }

    pub fn prune_secrets(&self, event: &watcher::Event<Secret>) {
        self.payloads
            .prune(event, SECRET_PREFIX, |s| Changed::Secret(s).key());
        self.secret_versions.prune(event);
    }

    pub fn prune_quarks_statefulsets(&self, event: &watcher::Event<QuarksStatefulSet>) {
        self.specs.prune(event, "", QuarksStatefulSet::key);
        self.claims.prune(event, "", QuarksStatefulSet::key);
        if let watcher::Event::Deleted(qsts) = event {
            self.claims_warnings.remove(&qsts.key());
        }
    }

    /// True once after a claim template change of `key` was observed.
    pub fn take_claims_warning(&self, key: &str) -> bool {
        self.claims_warnings.remove(key).is_some()
    }

    /// QuarksStatefulSet events pass only when spec or labels changed.
    pub fn quarks_statefulset(&self, qsts: &QuarksStatefulSet) -> bool {
        let key = qsts.key();
        let claims = qsts
            .spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.volume_claim_templates.as_ref());
        if self.claims.observe(key.clone(), digest(&claims)) == Observed::Changed {
            warn!(
                "Change in VolumeClaimTemplates of QuarksStatefulSet '{}' won't be performed in sts as it's not supported by Kubernetes",
                key
            );
            self.claims_warnings.insert(key.clone());
        }

        let spec = digest(&(&qsts.spec, qsts.labels()));
        match self.specs.observe(key.clone(), spec) {
            Observed::Unchanged => false,
            Observed::New | Observed::Changed => {
                debug!("Update predicate passed for '{}'", key);
                true
            }
        }
    }
}

fn log_mapping(changed: Changed<'_>, reconciles: &[ObjectRef<QuarksStatefulSet>]) {
    for r in reconciles {
        debug!(
            "Enqueuing reconcile of QuarksStatefulSet '{}/{}' for {:?} '{}'",
            r.namespace.as_deref().unwrap_or_default(),
            r.name,
            changed.kind(),
            changed.name()
        );
    }
}
