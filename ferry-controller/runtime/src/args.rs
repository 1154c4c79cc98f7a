use crate::{
    index::{self, debounce, ClusterInfo},
    index_list::IndexList,
    k8s, mapping,
    metrics::MappingMetrics,
    route, status,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

// The maximum number of status patches to buffer. As a conservative estimate,
// we assume that sending a patch will take at least 1ms, so the buffer covers
// ten seconds of patches.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(name = "ferry", about = "Routes services between federated clusters")]
pub struct Args {
    #[clap(long, default_value = "ferry=info,warn", env = "FERRY_CONTROLLER_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace of hubs, routes and hub credentials.
    #[clap(long, default_value = "ferry-system", env = "FERRY_CONTROLLER_NAMESPACE")]
    namespace: String,

    /// The namespace the tunnel runs in on every hub.
    #[clap(long, default_value = "ferry-tunnel-system")]
    tunnel_namespace: String,

    #[clap(long, default_value = "/var/ferry/ssh")]
    tunnel_ssh_dir: String,

    #[clap(long, default_value = "identity")]
    identity_key_name: String,

    #[clap(long, default_value = "40000")]
    port_range_start: u16,

    #[clap(long, default_value = "10000")]
    port_range_size: u16,

    /// How long to wait for changes to settle before rendering a hub pair.
    #[clap(
        long,
        default_value = "100",
        value_parser = clap::value_parser!(u64).range(100..)
    )]
    debounce_ms: u64,

    /// How often every hub pair is rendered, whether or not anything changed.
    #[clap(long, default_value = "30")]
    resync_interval_secs: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
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
            namespace,
            tunnel_namespace,
            tunnel_ssh_dir,
            identity_key_name,
            port_range_start,
            port_range_size,
            debounce_ms,
            resync_interval_secs,
            patch_timeout_ms,
        } = self;

        let mut prom = <Registry>::default();
        let route_status = prom.sub_registry_with_prefix("route_status");
        let status_metrics = status::ControllerMetrics::register(route_status);
        let status_index_metrics = status::IndexMetrics::register(route_status);
        let mapping_metrics = MappingMetrics::register(prom.sub_registry_with_prefix("ferry"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        // Build the hub registry, which tracks every hub's gateway, credentials,
        // services and bind ports.
        let (inits_tx, inits_rx) = mpsc::unbounded_channel();
        let registry = index::Registry::shared(
            ClusterInfo {
                namespace: namespace.clone(),
                tunnel_namespace,
                port_start: port_range_start,
                port_count: port_range_size,
            },
            inits_tx.clone(),
        );

        let hubs =
            runtime.watch_namespaced::<k8s::Hub>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(registry.clone(), hubs).instrument(info_span!("hubs")),
        );

        let secrets = runtime
            .watch_namespaced::<k8s::Secret>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(registry.clone(), secrets)
                .instrument(info_span!("secrets")),
        );

        tokio::spawn(
            index::Initializer::new(registry.clone(), inits_tx, inits_rx)
                .run()
                .instrument(info_span!("hubs_init")),
        );

        // Build the status index which will maintain the status of every route.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_index = status::Index::shared(updates_tx, status_index_metrics);

        // Routes are regrouped whenever a route or a hub changes, and on every
        // resync tick.
        let (changed, changes) = debounce::channel();
        registry.write().subscribe(changed.clone());
        let route_index =
            route::Index::shared(registry.clone(), status_index.clone(), changed.clone());

        let routes =
            runtime.watch_namespaced::<k8s::Route>(namespace.clone(), watcher::Config::default());
        let routes_indexes = IndexList::new(status_index.clone())
            .push(route_index.clone())
            .shared();
        tokio::spawn(
            kubert::index::namespaced(routes_indexes, routes).instrument(info_span!("routes")),
        );

        let config = Arc::new(mapping::Config {
            identity_file: format!(
                "{}/{identity_key_name}",
                tunnel_ssh_dir.trim_end_matches('/')
            ),
            debounce: Duration::from_millis(debounce_ms),
        });
        info!(
            identity_file = %config.identity_file,
            debounce_ms,
            resync_interval_secs,
            "Starting route controller"
        );
        let route_controller = route::Controller::new(
            route_index,
            registry,
            status_index.clone(),
            config,
            mapping_metrics,
        );
        tokio::spawn(
            route_controller
                .run(changes)
                .instrument(info_span!("route_controller")),
        );
        tokio::spawn(route::resync(
            changed,
            Duration::from_secs(resync_interval_secs),
        ));

        let status_controller = status::Controller::new(
            runtime.client(),
            status_index,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
