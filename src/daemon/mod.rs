use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::{Context, Result};
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};

use warden_core::{
    builder::LogBuilder,
    bus::Bus,
    feeder::{Feeder, FeederConfig, Output},
    ingest::{EventIngestor, EVENT_CHANNEL_CAPACITY},
    policy::{HostPolicyEvent, PolicyError, PolicyEvent, PolicyIndex, PolicyMatcher},
    registry::{Container, ContainerRegistry},
    shutdown::{shutdown_channel, ShutdownSender},
    tracker::start_process_tracker,
};

use crate::cli::WardenOpts;

mod host;

/// Handles the daemon owns and hands to its collaborators: the runtime and
/// cluster watchers update `registry` and `policy_index`, the kernel probe
/// reader feeds `ingestor`, the RPC service streams from `feeder`.
pub struct Agent {
    pub registry: Arc<ContainerRegistry>,
    pub policy_index: Arc<PolicyIndex>,
    pub ingestor: Arc<EventIngestor>,
    pub feeder: Arc<Feeder>,
}

impl Agent {
    /// Entry point for the container-runtime watcher: record the container
    /// and refresh its group's policy bindings.
    pub fn register_container(&self, container: Container) {
        let namespace = container.namespace_name.clone();
        let pod_group = container.pod_group_name.clone();
        self.registry.upsert(container);
        if let Some(identities) = self.registry.group_identities(&namespace, &pod_group) {
            self.policy_index
                .bind_group(&namespace, &pod_group, identities);
            self.registry.set_group_policies(
                &namespace,
                &pod_group,
                self.policy_index.bound_policy_names(&namespace, &pod_group),
            );
        }
    }

    pub fn deregister_container(&self, container_id: &str) {
        if let Some(detached) = self.registry.remove(container_id) {
            if detached.group_dropped {
                self.policy_index
                    .drop_group(&detached.namespace_name, &detached.pod_group_name);
            } else if let Some(identities) = self
                .registry
                .group_identities(&detached.namespace_name, &detached.pod_group_name)
            {
                // the surviving group may have lost identities with the
                // departed container; rebind so stale policies detach
                self.policy_index.bind_group(
                    &detached.namespace_name,
                    &detached.pod_group_name,
                    identities,
                );
                self.registry.set_group_policies(
                    &detached.namespace_name,
                    &detached.pod_group_name,
                    self.policy_index
                        .bound_policy_names(&detached.namespace_name, &detached.pod_group_name),
                );
            }
        }
    }

    /// Entry point for the cluster policy watcher.
    pub fn apply_policy(&self, event: PolicyEvent) -> Result<(), PolicyError> {
        self.policy_index.apply(event)?;
        for (namespace, pod_group) in self.registry.group_keys() {
            let names = self.policy_index.bound_policy_names(&namespace, &pod_group);
            self.registry
                .set_group_policies(&namespace, &pod_group, names);
        }
        Ok(())
    }

    pub fn apply_host_policy(&self, event: HostPolicyEvent) -> Result<(), PolicyError> {
        self.policy_index.apply_host(event)
    }
}

pub struct Daemon {
    pub agent: Agent,
    shutdown_tx: ShutdownSender,
    server_handle: warden_api::ServerHandle,
    builder_task: JoinHandle<()>,
}

impl Daemon {
    /// Construct the pipeline and start serving. Fails fast when the log
    /// sink or the gRPC listener cannot be set up.
    pub async fn start(options: &WardenOpts) -> Result<Self> {
        log::trace!("warden daemon options: {:?}", options);

        let host_name = host::host_name();
        let host_ip = host::external_ip().unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string());
        let host_ns = host::host_namespaces().unwrap_or_default();

        let registry = Arc::new(ContainerRegistry::new());
        let node_labels = vec![format!("kubernetes.io/hostname={host_name}")];
        let policy_index = Arc::new(PolicyIndex::new(&node_labels));
        let matcher = PolicyMatcher::new(policy_index.clone(), options.enable_host_policy);

        let feeder = Arc::new(
            Feeder::new(
                FeederConfig {
                    cluster_name: options.cluster.clone(),
                    host_name: host_name.clone(),
                    host_ip,
                    output: Output::parse(&options.log_path),
                },
                matcher,
            )
            .context("cannot initialize the log feeder")?,
        );

        let tracker = start_process_tracker();
        let event_bus = Bus::new(EVENT_CHANNEL_CAPACITY);
        let ingestor = Arc::new(EventIngestor::new(event_bus.clone()));

        let (shutdown_tx, shutdown) = shutdown_channel();

        let builder = LogBuilder::new(
            registry.clone(),
            tracker,
            feeder.clone(),
            host_name.clone(),
            host_ns,
            options.enable_auditd,
        );
        let builder_task = tokio::spawn(builder.run(event_bus.subscribe(), shutdown.clone()));

        let addr = SocketAddr::from(([0, 0, 0, 0], options.grpc_port));
        let server_handle = warden_api::run_server(addr, feeder.clone(), shutdown).await?;

        feeder.print(format!("warden agent started on {host_name}"));

        Ok(Self {
            agent: Agent {
                registry,
                policy_index,
                ingestor,
                feeder,
            },
            shutdown_tx,
            server_handle,
            builder_task,
        })
    }

    /// Ordered shutdown: fire the signal, drain the server, join the
    /// pipeline. Nothing blocks indefinitely past the signal.
    pub async fn stop(self) {
        self.agent.feeder.print("warden agent shutting down");
        self.shutdown_tx.shutdown();

        log::info!("Terminating the log service...");
        self.server_handle.stop().await;

        log::info!("Terminating the pipeline...");
        let _ = self.builder_task.await;
    }
}

pub async fn run(options: &WardenOpts) -> Result<()> {
    let daemon = Daemon::start(options).await?;

    let mut sig_int = signal(SignalKind::interrupt())?;
    let mut sig_term = signal(SignalKind::terminate())?;
    let mut sig_hup = signal(SignalKind::hangup())?;

    tokio::select! {
        _ = sig_int.recv() => log::trace!("SIGINT received"),
        _ = sig_term.recv() => log::trace!("SIGTERM received"),
        _ = sig_hup.recv() => log::trace!("SIGHUP received"),
    }

    daemon.stop().await;

    Ok(())
}
