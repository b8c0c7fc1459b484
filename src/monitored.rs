use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};

/// Label opting a namespace into the operator's scope.
pub const LABEL_MONITORED: &str = "quarks.cloudfoundry.org/monitored";

/// Label selector matching the namespaces of monitored id `id`.
pub fn selector(id: &str) -> String {
    format!("{}={}", LABEL_MONITORED, id)
}

/// Answers whether a namespace is monitored, from a reflector fed by a
/// namespace watch.
#[derive(Clone)]
pub struct Namespaces {
    id: String,
    store: Store<Namespace>,
}

impl Namespaces {
    pub fn new(id: String, store: Store<Namespace>) -> Self {
        Namespaces { id, store }
    }

    pub fn contains(&self, namespace: &str) -> bool {
        self.store
            .get(&ObjectRef::new(namespace))
            .map(|ns| ns.labels().get(LABEL_MONITORED) == Some(&self.id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube_runtime::reflector::store::Writer;
    use kube_runtime::watcher;

    fn namespace(name: &str, monitored: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.into()),
                labels: monitored.map(|id| {
                    vec![(LABEL_MONITORED.to_string(), id.to_string())]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn only_labelled_namespaces_are_monitored() {
        let mut writer = Writer::<Namespace>::default();
        for ns in [
            namespace("staging", Some("default")),
            namespace("other-operator", Some("other")),
            namespace("kube-system", None),
        ] {
            writer.apply_watcher_event(&watcher::Event::Applied(ns));
        }
        let namespaces = Namespaces::new("default".into(), writer.as_reader());

        assert!(namespaces.contains("staging"));
        assert!(!namespaces.contains("other-operator"));
        assert!(!namespaces.contains("kube-system"));
        assert!(!namespaces.contains("missing"));
        assert_eq!(selector("default"), "quarks.cloudfoundry.org/monitored=default");
    }
}
