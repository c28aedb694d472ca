use crate::{
    background::{BasicEngine, EphemeralReportWriter, GenerateController},
    client::KubeClient,
    index::{IndexMetrics, PolicyIndex, UpdateRequestIndex},
    k8s,
    lease,
    metrics::ReconcileMetrics,
    queue::{self, WorkQueue},
    status,
    sync::Syncer,
    worker,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info, info_span, Instrument};

// Events are best-effort; beyond this many undelivered events, new ones are
// dropped.
const EVENT_QUEUE_SIZE: usize = 1000;

#[derive(Debug, Parser)]
#[clap(
    name = "generate-controller",
    about = "Reconciles generate rules in the background"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "generate=info,warn",
        env = "GENERATE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace in which update requests are created.
    #[clap(long, default_value = "kyverno")]
    namespace: String,

    /// The number of update requests processed concurrently.
    #[clap(long, default_value = "10")]
    workers: usize,

    /// The deployment that owns the leader lease.
    #[clap(long, default_value = "kyverno-background-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "5000")]
    status_patch_timeout_ms: u64,

    /// How many times a failed update request is returned to pending.
    #[clap(long, default_value = "3")]
    max_retries: u32,

    /// Writes an ephemeral report for each evaluated trigger.
    #[clap(long)]
    generate_reports: bool,
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
            workers,
            controller_deployment_name,
            status_patch_timeout_ms,
            max_retries,
            generate_reports,
        } = self;

        // Build the indexes that hold policies and update requests. Changed
        // update requests are published to the work queue.
        let policy_index = PolicyIndex::shared();
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let update_request_index = UpdateRequestIndex::shared(&namespace, changes_tx);

        let mut prom = <Registry>::default();
        let policy_index_metrics = IndexMetrics::register(
            policy_index.clone(),
            prom.sub_registry_with_prefix("policy_index"),
        )
        .shared();
        let update_request_index_metrics = IndexMetrics::register(
            update_request_index.clone(),
            prom.sub_registry_with_prefix("update_request_index"),
        )
        .shared();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("update_request"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("failed to read the HOSTNAME environment variable")?;
        let claims = lease::init(&runtime, &namespace, &controller_deployment_name, &hostname).await?;

        // Spawn resource watches.

        let policies = runtime.watch_all::<k8s::Policy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(policy_index_metrics.clone(), policies)
                .instrument(info_span!("policies")),
        );

        let cluster_policies = runtime.watch_all::<k8s::ClusterPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(policy_index_metrics, cluster_policies)
                .instrument(info_span!("clusterpolicies")),
        );

        let update_requests =
            runtime.watch_namespaced::<k8s::UpdateRequest>(namespace.clone(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(update_request_index_metrics, update_requests)
                .instrument(info_span!("updaterequests")),
        );

        // Events are published from a dedicated task so that reconciliation
        // never waits on them.
        let (events, events_rx) = status::EventRecorder::channel(EVENT_QUEUE_SIZE, status_metrics.clone());
        tokio::spawn(
            status::publish_events(
                runtime.client(),
                hostname.clone(),
                events_rx,
                status_metrics.clone(),
            )
            .instrument(info_span!("events")),
        );

        let resources = Arc::new(KubeClient::new(runtime.client()));
        let statuses = status::StatusControl::new(
            runtime.client(),
            &namespace,
            Duration::from_millis(status_patch_timeout_ms),
            status_metrics,
        );
        let mut controller = GenerateController::new(
            resources.clone(),
            Arc::new(BasicEngine::new()),
            Arc::new(PolicyIndex::reader(&policy_index)),
            Arc::new(statuses.clone()),
            Arc::new(events),
        );
        if generate_reports {
            controller = controller.with_reports(Arc::new(EphemeralReportWriter::new(resources)));
        }

        let syncer = Arc::new(Syncer::new(
            Arc::new(update_request_index.clone()),
            Arc::new(statuses),
            Arc::new(controller),
            max_retries,
            reconcile_metrics,
        ));

        // Spawn the work queue and its workers.
        let queue = WorkQueue::shared();
        tokio::spawn(queue::feed(queue.clone(), changes_rx).instrument(info_span!("queue")));
        tokio::spawn(
            worker::requeue_on_claim(
                claims.clone(),
                hostname.clone(),
                Arc::new(update_request_index),
                queue.clone(),
            )
            .instrument(info_span!("lease")),
        );

        let mut tasks = Vec::with_capacity(workers);
        for id in 0..workers {
            let claims = claims.clone();
            let hostname = hostname.clone();
            let is_leader = move || claims.borrow().is_current_for(&hostname);
            tasks.push(tokio::spawn(
                worker::run(queue.clone(), syncer.clone(), is_leader)
                    .instrument(info_span!("worker", id)),
            ));
        }
        info!(%namespace, workers, "Processing update requests");

        // Once shutdown is signaled, stop handing out work and let in-flight
        // syncs complete.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = shutdown.signaled().await;
            queue.shutdown();
            release
                .release_after(futures::future::join_all(tasks))
                .await;
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
