use crate::qsts::QuarksStatefulSet;
use k8s_openapi::api::core::v1::{Container, PodSpec, Secret};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

pub const LABEL_SECRET_KIND: &str = "quarks.cloudfoundry.org/secret-kind";
pub const LABEL_SECRET_VERSION: &str = "quarks.cloudfoundry.org/secret-version";
pub const VERSIONED_SECRET_KIND: &str = "versionedSecret";

/// The kind of configuration object a pod spec can point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    ConfigMap,
    Secret,
}

impl RefKind {
    fn from_volumes(self, spec: &PodSpec, out: &mut BTreeSet<String>) {
        for volume in spec.volumes.iter().flatten() {
            let name = match self {
                RefKind::ConfigMap => volume.config_map.as_ref().and_then(|c| c.name.clone()),
                RefKind::Secret => volume.secret.as_ref().and_then(|s| s.secret_name.clone()),
            };
            out.extend(name);

            let sources = volume.projected.as_ref().and_then(|p| p.sources.as_ref());
            for source in sources.into_iter().flatten() {
                let name = match self {
                    RefKind::ConfigMap => source.config_map.as_ref().and_then(|c| c.name.clone()),
                    RefKind::Secret => source.secret.as_ref().and_then(|s| s.name.clone()),
                };
                out.extend(name);
            }
        }
    }

    fn from_container(self, container: &Container, out: &mut BTreeSet<String>) {
        for env_from in container.env_from.iter().flatten() {
            let name = match self {
                RefKind::ConfigMap => env_from.config_map_ref.as_ref().and_then(|r| r.name.clone()),
                RefKind::Secret => env_from.secret_ref.as_ref().and_then(|r| r.name.clone()),
            };
            out.extend(name);
        }

        for env in container.env.iter().flatten() {
            let value_from = match &env.value_from {
                Some(v) => v,
                None => continue,
            };
            let name = match self {
                RefKind::ConfigMap => value_from
                    .config_map_key_ref
                    .as_ref()
                    .and_then(|r| r.name.clone()),
                RefKind::Secret => value_from
                    .secret_key_ref
                    .as_ref()
                    .and_then(|r| r.name.clone()),
            };
            out.extend(name);
        }
    }
}

/// Names of all objects of `kind` reachable from a pod spec through volumes,
/// `envFrom` or `env[].valueFrom`, across init and regular containers.
pub fn referenced_names(spec: &PodSpec, kind: RefKind) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    kind.from_volumes(spec, &mut out);
    let containers = spec
        .init_containers
        .iter()
        .flatten()
        .chain(spec.containers.iter());
    for container in containers {
        kind.from_container(container, &mut out);
    }
    out
}

/// The pod spec inside a QuarksStatefulSet's statefulset template.
pub fn pod_spec(qsts: &QuarksStatefulSet) -> Option<&PodSpec> {
    qsts.spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
}

pub fn referenced_by(qsts: &QuarksStatefulSet, kind: RefKind) -> BTreeSet<String> {
    pod_spec(qsts)
        .map(|spec| referenced_names(spec, kind))
        .unwrap_or_default()
}

pub fn is_versioned_secret(secret: &Secret) -> bool {
    secret
        .labels()
        .get(LABEL_SECRET_KIND)
        .map(|k| k == VERSIONED_SECRET_KIND)
        .unwrap_or(false)
}

/// A versioned secret's name split into `<base>-v<version>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedName {
    pub base: String,
    pub version: u64,
}

impl VersionedName {
    pub fn parse(name: &str) -> Option<Self> {
        let (base, version) = name.rsplit_once("-v")?;
        if base.is_empty() {
            return None;
        }
        let version = version.parse().ok()?;
        Some(VersionedName {
            base: base.to_string(),
            version,
        })
    }
}

fn base_name(name: &str) -> &str {
    match name.rsplit_once("-v") {
        Some((base, v)) if !base.is_empty() && v.parse::<u64>().is_ok() => base,
        _ => name,
    }
}

/// True if any reference shares the versioned secret's base name.
pub fn contains_secret_name(references: &BTreeSet<String>, name: &str) -> bool {
    let base = base_name(name);
    references.iter().any(|r| base_name(r) == base)
}

/// True if some reference points at an older version than `name`, i.e. `name`
/// supersedes what the pod spec currently mounts.
pub fn contains_outdated_secret_version(references: &BTreeSet<String>, name: &str) -> bool {
    let changed = match VersionedName::parse(name) {
        Some(v) => v,
        None => return false,
    };
    references
        .iter()
        .filter_map(|r| VersionedName::parse(r))
        .any(|r| r.base == changed.base && r.version < changed.version)
}

/// Latest version name per base name among the given versioned secrets.
pub fn latest_versions<'a, I>(secrets: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = &'a Secret>,
{
    let mut latest: BTreeMap<String, VersionedName> = BTreeMap::new();
    for secret in secrets {
        if !is_versioned_secret(secret) {
            continue;
        }
        let parsed = match VersionedName::parse(&secret.name_any()) {
            Some(p) => p,
            None => continue,
        };
        let newer = latest
            .get(&parsed.base)
            .map(|cur| parsed.version > cur.version)
            .unwrap_or(true);
        if newer {
            latest.insert(parsed.base.clone(), parsed);
        }
    }
    latest
        .into_iter()
        .map(|(base, v)| (base.clone(), format!("{}-v{}", base, v.version)))
        .collect()
}

/// Points every secret reference of a versioned base name at its latest version.
pub fn rewrite_secret_names(spec: &mut PodSpec, latest: &BTreeMap<String, String>) {
    let rewrite = |name: &mut Option<String>| {
        if let Some(n) = name.as_mut() {
            if VersionedName::parse(n).is_none() {
                return;
            }
            if let Some(newest) = latest.get(base_name(n)) {
                *n = newest.clone();
            }
        }
    };

    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(s) = volume.secret.as_mut() {
            rewrite(&mut s.secret_name);
        }
        let sources = volume.projected.as_mut().and_then(|p| p.sources.as_mut());
        for source in sources.into_iter().flatten() {
            if let Some(s) = source.secret.as_mut() {
                rewrite(&mut s.name);
            }
        }
    }

    let containers = spec
        .init_containers
        .iter_mut()
        .flatten()
        .chain(spec.containers.iter_mut());
    for container in containers {
        for env_from in container.env_from.iter_mut().flatten() {
            if let Some(r) = env_from.secret_ref.as_mut() {
                rewrite(&mut r.name);
            }
        }
        for env in container.env.iter_mut().flatten() {
            if let Some(r) = env
                .value_from
                .as_mut()
                .and_then(|v| v.secret_key_ref.as_mut())
            {
                rewrite(&mut r.name);
            }
        }
    }
}
