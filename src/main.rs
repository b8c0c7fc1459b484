use clap::Parser;
use error_chain::ChainedError;
use k8s_openapi::ByteString;
use kube::{Client, CustomResourceExt};
use log::{error, info};
use quarks_statefulset::{
    config::Config, errors::*, manager::Manager, qsts::QuarksStatefulSet, webhook,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(e) = run(config).await {
        error!("{}", e.display_chain());
        eprintln!("{}", e.display_chain());
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .chain_err(|| format!("invalid log level '{}'", config.log_level))?;
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    // the `log` records of this crate reach the subscriber through tracing-log
    let installed = if config.log_json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| Error::from(e.to_string()))
}

async fn run(config: Config) -> Result<()> {
    if config.print_crd {
        print!("{}", serde_yaml::to_string(&QuarksStatefulSet::crd())?);
        return Ok(());
    }
    if config.print_webhooks {
        let ca = std::fs::read(config.ca_path()).ok().map(ByteString);
        print!(
            "{}",
            serde_yaml::to_string(&webhook::mutating_webhook_configuration(&config, ca))?
        );
        return Ok(());
    }

    init_logging(&config)?;
    info!(
        "Starting quarks-statefulset {} watching namespaces labelled with monitored id '{}'",
        env!("CARGO_PKG_VERSION"),
        config.monitored_id
    );

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    let (manager, drainer) = Manager::new(client, &config).await?;
    let server = webhook::serve(&config, manager.pod_mutator());

    tokio::select! {
        _ = drainer => {
            error!("controllers exited");
            Ok(())
        }
        res = server => res.chain_err(|| "webhook server failed"),
    }
}
