//! HTTPS server for the two mutating admission handlers, and the
//! registration object pointing the API server at it.

use crate::config::Config;
use crate::errors::*;
use crate::monitored;
use crate::pod_mutator::PodMutator;
use crate::rollout;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::ByteString;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use log::{info, warn};
use std::collections::BTreeMap;

pub const PATH_MUTATE_PODS: &str = "/mutate-pods";
pub const PATH_MUTATE_STATEFULSETS: &str = "/mutate-statefulsets";
pub const SERVICE_NAME: &str = "qsts-webhook";

#[derive(Clone)]
struct Handlers {
    pods: PodMutator,
}

pub fn router(pods: PodMutator) -> Router {
    Router::new()
        .route(PATH_MUTATE_PODS, post(mutate_pods))
        .route(PATH_MUTATE_STATEFULSETS, post(mutate_statefulsets))
        .route("/readyz", get(|| async { "ok" }))
        .with_state(Handlers { pods })
}

async fn mutate_pods(
    State(handlers): State<Handlers>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Pod> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("invalid pod admission review: {}", e);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(handlers.pods.handle(&req).await.into_review())
}

async fn mutate_statefulsets(
    Json(review): Json<AdmissionReview<StatefulSet>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<StatefulSet> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("invalid statefulset admission review: {}", e);
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };
    Json(rollout::handle(&req).into_review())
}

/// Serves the admission handlers over TLS until the listener fails.
pub async fn serve(config: &Config, pods: PodMutator) -> Result<()> {
    let tls = RustlsConfig::from_pem_file(config.cert_path(), config.key_path())
        .await
        .chain_err(|| format!("failed to load webhook certificates from {:?}", config.webhook_cert_dir))?;
    info!("Starting webhook server on {}", config.webhook_addr);
    axum_server::bind_rustls(config.webhook_addr, tls)
        .serve(router(pods).into_make_service())
        .await?;
    Ok(())
}

fn client_config(config: &Config, path: &str, ca_bundle: Option<&ByteString>) -> WebhookClientConfig {
    let port = config.webhook_addr.port();
    if config.webhook_use_service_reference {
        return WebhookClientConfig {
            ca_bundle: ca_bundle.cloned(),
            service: Some(ServiceReference {
                name: SERVICE_NAME.to_string(),
                namespace: config.operator_namespace.clone(),
                path: Some(path.to_string()),
                port: Some(port as i32),
            }),
            url: None,
        };
    }
    let host = config
        .webhook_service_host
        .clone()
        .unwrap_or_else(|| format!("{}.{}.svc", SERVICE_NAME, config.operator_namespace));
    WebhookClientConfig {
        ca_bundle: ca_bundle.cloned(),
        service: None,
        url: Some(format!("https://{}:{}{}", host, port, path)),
    }
}

fn webhook(
    config: &Config,
    name: &str,
    path: &str,
    rule: RuleWithOperations,
    ca_bundle: Option<&ByteString>,
) -> MutatingWebhook {
    let mut match_labels = BTreeMap::new();
    match_labels.insert(
        monitored::LABEL_MONITORED.to_string(),
        config.monitored_id.clone(),
    );
    MutatingWebhook {
        name: format!("{}.quarks.cloudfoundry.org", name),
        admission_review_versions: vec!["v1".to_string()],
        client_config: client_config(config, path, ca_bundle),
        failure_policy: Some("Fail".to_string()),
        namespace_selector: Some(LabelSelector {
            match_labels: Some(match_labels),
            ..LabelSelector::default()
        }),
        rules: Some(vec![rule]),
        side_effects: "None".to_string(),
        ..MutatingWebhook::default()
    }
}

/// Registration for both handlers, scoped to monitored namespaces.
pub fn mutating_webhook_configuration(config: &Config, ca_bundle: Option<ByteString>) -> MutatingWebhookConfiguration {
    let pods = RuleWithOperations {
        api_groups: Some(vec!["".to_string()]),
        api_versions: Some(vec!["v1".to_string()]),
        operations: Some(vec!["CREATE".to_string()]),
        resources: Some(vec!["pods".to_string()]),
        scope: Some("Namespaced".to_string()),
    };
    let statefulsets = RuleWithOperations {
        api_groups: Some(vec!["apps".to_string()]),
        api_versions: Some(vec!["v1".to_string()]),
        operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
        resources: Some(vec!["statefulsets".to_string()]),
        scope: Some("Namespaced".to_string()),
    };

    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(format!("quarks-statefulset-hook-{}", config.operator_namespace)),
            ..ObjectMeta::default()
        },
        webhooks: Some(vec![
            webhook(config, "mutate-pods", PATH_MUTATE_PODS, pods, ca_bundle.as_ref()),
            webhook(
                config,
                "mutate-statefulsets",
                PATH_MUTATE_STATEFULSETS,
                statefulsets,
                ca_bundle.as_ref(),
            ),
        ]),
    }
}
