use crate::{http, index, k8s, scale, Deployments};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "deployment-scaler",
    about = "Serves deployment replica counts from a watched cache"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "deployment_scaler=info,warn",
        env = "DEPLOYMENT_SCALER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Restricts the cache to deployments in a single namespace.
    ///
    /// By default, deployments in all namespaces are cached.
    #[clap(long)]
    watch_namespace: Option<String>,

    /// How often the full set of deployments is re-listed to repair missed watch events.
    #[clap(long, default_value = "600")]
    resync_interval_secs: u64,

    /// Startup fails if the cache cannot be populated within this window.
    #[clap(long, default_value = "60")]
    sync_timeout_secs: u64,

    #[clap(long, default_value = "10000")]
    scale_timeout_ms: u64,

    /// Limits the amount of time a watch can be idle before being reset.
    ///
    /// Must be less than 295 or Kubernetes throws an error.
    #[clap(
        long,
        default_value = "290",
        value_parser = clap::value_parser!(u32).range(1..295)
    )]
    watch_timeout_secs: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            watch_namespace,
            resync_interval_secs,
            sync_timeout_secs,
            scale_timeout_ms,
            watch_timeout_secs,
        } = self;

        // The mirror is created before the runtime so that its metrics can be registered with
        // the admin server.
        let mirror = index::SharedMirror::default();

        let mut prom = <Registry>::default();
        let sync_metrics = index::SyncMetrics::register(prom.sub_registry_with_prefix("sync"));
        index::metrics::register_mirror(prom.sub_registry_with_prefix("mirror"), mirror.clone());
        let scale_metrics = scale::ScaleMetrics::register(prom.sub_registry_with_prefix("scale"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        // The admin server does not report readiness until the mirror is populated.
        let initialized = runtime.initialized_handle();

        let store = k8s::KubeStore::new(runtime.client())
            .with_namespace(watch_namespace)
            .with_watch_timeout(watch_timeout_secs);

        let params = index::Params {
            resync_interval: Duration::from_secs(resync_interval_secs),
            startup_timeout: Duration::from_secs(sync_timeout_secs),
            ..Default::default()
        };
        let (sync, reader) = index::Synchronizer::new(store.clone(), mirror, params, sync_metrics);
        let sync = sync
            .start()
            .instrument(info_span!("sync"))
            .await
            .context("failed to sync deployments")?;
        drop(initialized);

        let scaler = scale::Scaler::new(
            store,
            Duration::from_millis(scale_timeout_ms),
            scale_metrics,
        );
        let deployments = Deployments::new(reader, scaler);
        let runtime = runtime.spawn_server(http::Api::new(deployments));
        info!("Serving deployment API");

        // Block the main thread on the shutdown signal. The server drains in-flight requests
        // before the runtime completes, after which the synchronizer is stopped.
        let res = runtime.run().await;
        sync.stopped().await;
        if res.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
