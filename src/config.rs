use crate::rollout::Timings;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Operator for QuarksStatefulSet resources
#[derive(Parser, Debug, Clone)]
#[command(name = "quarks-statefulset")]
#[command(version)]
pub struct Config {
    /// Only namespaces labelled with this monitored id are watched
    #[arg(long, env = "MONITORED_ID", default_value = "default")]
    pub monitored_id: String,

    /// Namespace the operator and its webhook service run in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    pub operator_namespace: String,

    /// Name of the operator pod, reported as the instance on published events
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// QuarksStatefulSets reconciled in parallel
    #[arg(long, env = "MAX_QUARKS_STATEFULSET_WORKERS", default_value_t = 1)]
    pub max_quarks_statefulset_workers: u16,

    /// Deadline in seconds for every call against the API server
    #[arg(long, env = "CTX_TIMEOUT", default_value_t = 300)]
    pub ctx_timeout: u64,

    #[arg(long, env = "QUARKS_STS_WEBHOOK_ADDR", default_value = "0.0.0.0:2999")]
    pub webhook_addr: SocketAddr,

    /// Directory holding tls.crt and tls.key (and optionally ca.crt) for the webhook server
    #[arg(long, env = "QUARKS_STS_WEBHOOK_CERT_DIR", default_value = "/tmp/qsts-hook-certs")]
    pub webhook_cert_dir: PathBuf,

    /// Host the API server reaches the webhook server at
    #[arg(long, env = "QUARKS_STS_WEBHOOK_SERVICE_HOST")]
    pub webhook_service_host: Option<String>,

    /// Register the webhooks by service reference instead of by URL
    #[arg(long, env = "QUARKS_STS_WEBHOOK_USE_SERVICE_REFERENCE", default_value_t = false)]
    pub webhook_use_service_reference: bool,

    /// Default canary watch window for statefulsets without the annotation
    #[arg(long, env = "CANARY_WATCH_TIME_MS", default_value_t = 30_000)]
    pub canary_watch_time_ms: u64,

    /// Default update watch window for statefulsets without the annotation
    #[arg(long, env = "UPDATE_WATCH_TIME_MS", default_value_t = 300_000)]
    pub update_watch_time_ms: u64,

    /// Longest pause between two evaluations of a running rollout
    #[arg(long, env = "ROLLOUT_INTERVAL_SECS", default_value_t = 5)]
    pub rollout_interval_secs: u64,

    /// Log filter, e.g. `info` or `quarks_statefulset=debug,kube=info`
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Print the CustomResourceDefinition and exit
    #[arg(long)]
    pub print_crd: bool,

    /// Print the MutatingWebhookConfiguration and exit
    #[arg(long)]
    pub print_webhooks: bool,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.ctx_timeout)
    }

    pub fn timings(&self) -> Timings {
        Timings {
            canary_watch_time: Duration::from_millis(self.canary_watch_time_ms),
            update_watch_time: Duration::from_millis(self.update_watch_time_ms),
            interval: Duration::from_secs(self.rollout_interval_secs.max(1)),
        }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.webhook_cert_dir.join("tls.crt")
    }

    pub fn key_path(&self) -> PathBuf {
        self.webhook_cert_dir.join("tls.key")
    }

    pub fn ca_path(&self) -> PathBuf {
        self.webhook_cert_dir.join("ca.crt")
    }
}
