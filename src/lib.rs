#[macro_use]
extern crate error_chain;

pub mod active_passive;
pub mod config;
pub mod generation;
pub mod manager;
pub mod monitored;
pub mod pod_mutator;
pub mod qsts;
pub mod reference;
pub mod rollout;
pub mod trigger;
pub mod webhook;

pub mod errors {
    // Create the Error, ErrorKind, ResultExt, and Result types
    error_chain! {
        foreign_links {
            Io(std::io::Error);
            Kube(kube::Error);
            Json(serde_json::Error);
            Yaml(serde_yaml::Error);
        }

        errors {
            MissingVersion(generation: String) {
                description("statefulset has no version annotation")
                display("the statefulset '{}' does not have the version annotation, a version could not be retrieved", generation)
            }
            InvalidVersion(generation: String, value: String) {
                description("statefulset has an unparsable version annotation")
                display("the statefulset '{}' has an invalid version annotation '{}'", generation, value)
            }
            InvalidRevisions(owner: String, reason: String) {
                description("unparsable revisions annotation")
                display("revisions annotation on '{}' is invalid: {}", owner, reason)
            }
            MissingNamespace(kind: String, name: String) {
                description("namespaced object without a namespace")
                display("{} '{}' has no namespace", kind, name)
            }
            MissingObject(kind: String, name: String) {
                description("object not found")
                display("{} '{}' not found", kind, name)
            }
            Deadline(operation: String) {
                description("operation exceeded its deadline")
                display("'{}' did not finish before the deadline", operation)
            }
            Probe(pod: String, container: String, reason: String) {
                description("probe could not be executed")
                display("probe for container '{}' in pod '{}' failed: {}", container, pod, reason)
            }
        }
    }
}

use std::future::Future;
use std::time::Duration;

/// Runs a call against the orchestration API, failing with `ErrorKind::Deadline`
/// once `timeout` has passed.
pub async fn deadline<T, F>(timeout: Duration, operation: &str, call: F) -> errors::Result<T>
where
    F: Future<Output = std::result::Result<T, kube::Error>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(errors::ErrorKind::Deadline(operation.to_string()).into()),
    }
}

/// Milliseconds since the unix epoch, the unit of every timestamp annotation.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/*
A QuarksStatefulSet wraps a StatefulSet template and adds what plain statefulsets lack:

- Versioned generations
  - Every spec/label change materializes a new statefulset `<name>-v<version>`.
  - Older generations survive while the newest one is rolling out or failed,
and are removed once it is Done.

- Canary rollouts
  - Opt-in per template via the canary-rollout-enabled annotation.
  - State lives exclusively in statefulset annotations, so a restarted operator
picks up where the last one left off.

- Stable pod identities
  - pod-ordinal and spec-index come from the pod name and zone.
  - startup-ordinal is assigned first-seen-wins per controller revision and
persisted on the QuarksStatefulSet, so restarts keep it.

- Config change triggers
  - ConfigMap/Secret payload changes re-reconcile every referencing
QuarksStatefulSet that has updateOnConfigChange set.
*/

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_passes_results_through() {
        let res = deadline(Duration::from_secs(1), "noop", async { Ok::<_, kube::Error>(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let res = deadline(Duration::from_millis(10), "sleep", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, kube::Error>(())
        })
        .await;
        match res {
            Err(errors::Error(errors::ErrorKind::Deadline(op), _)) => assert_eq!(op, "sleep"),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }
}
