use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{transport::Server, Request, Response, Status};

use warden_core::{
    feeder::{Feeder, LogFilter, SubscriberKind},
    shutdown::ShutdownSignal,
};

use crate::proto::{
    self,
    log_service_server::{LogService, LogServiceServer},
};

/// Per-subscriber outbound queue depth. A subscriber that lets it fill up
/// falls behind the fan-out queue and is eventually unregistered.
const SUBSCRIBER_QUEUE: usize = 512;

fn to_proto_message(msg: &warden_core::log::Message) -> proto::Message {
    proto::Message {
        updated_time: msg.updated_time.clone(),
        cluster_name: msg.cluster_name.clone(),
        host_name: msg.host_name.clone(),
        host_ip: msg.host_ip.clone(),
        level: msg.level.to_string(),
        message: msg.message.clone(),
    }
}

fn to_proto_log(log: &warden_core::log::Log, cluster_name: &str) -> proto::Log {
    proto::Log {
        updated_time: log.updated_time.clone(),
        cluster_name: cluster_name.to_string(),
        host_name: log.host_name.clone(),
        namespace_name: log.namespace_name.clone(),
        pod_name: log.pod_name.clone(),
        container_id: log.container_id.clone(),
        container_name: log.container_name.clone(),
        host_pid: log.host_pid,
        ppid: log.ppid,
        pid: log.pid,
        uid: log.uid,
        policy_name: log.policy_name.clone(),
        severity: log.severity.clone(),
        tags: log.tags.clone(),
        message: log.message.clone(),
        r#type: log.log_type.to_string(),
        source: log.source.clone(),
        operation: log.operation.to_string(),
        resource: log.resource.clone(),
        data: log.data.clone(),
        action: log.action.clone(),
        result: log.result.clone(),
    }
}

pub struct FeederService {
    feeder: Arc<Feeder>,
    shutdown: ShutdownSignal,
}

impl FeederService {
    pub fn new(feeder: Arc<Feeder>, shutdown: ShutdownSignal) -> Self {
        Self { feeder, shutdown }
    }
}

#[tonic::async_trait]
impl LogService for FeederService {
    async fn health_check(
        &self,
        request: Request<proto::NonceMessage>,
    ) -> Result<Response<proto::ReplyMessage>, Status> {
        Ok(Response::new(proto::ReplyMessage {
            retval: request.into_inner().nonce,
        }))
    }

    type WatchMessagesStream = ReceiverStream<Result<proto::Message, Status>>;

    async fn watch_messages(
        &self,
        request: Request<proto::RequestMessage>,
    ) -> Result<Response<Self::WatchMessagesStream>, Status> {
        let filter = request.into_inner().filter;
        let guard = self
            .feeder
            .subscriptions()
            .register(SubscriberKind::Messages, &filter);
        let mut bus_rx = self.feeder.subscribe_messages();
        let mut shutdown = self.shutdown.clone();
        let feeder = self.feeder.clone();

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        tokio::spawn(async move {
            // the guard unregisters the subscriber on every exit path
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    msg = bus_rx.recv() => match msg {
                        Ok(msg) => {
                            if tx.send(Ok(to_proto_message(&msg))).await.is_err() {
                                // client went away
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            feeder.err(format!(
                                "message subscriber too slow, dropping it ({n} missed)"
                            ));
                            return;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type WatchLogsStream = ReceiverStream<Result<proto::Log, Status>>;

    async fn watch_logs(
        &self,
        request: Request<proto::RequestMessage>,
    ) -> Result<Response<Self::WatchLogsStream>, Status> {
        let raw_filter = request.into_inner().filter;
        let filter = LogFilter::parse(&raw_filter);
        let guard = self
            .feeder
            .subscriptions()
            .register(SubscriberKind::Logs, &raw_filter);
        let mut bus_rx = self.feeder.subscribe_logs();
        let mut shutdown = self.shutdown.clone();
        let feeder = self.feeder.clone();
        let cluster_name = self.feeder.cluster_name().to_string();

        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    log = bus_rx.recv() => match log {
                        Ok(log) => {
                            if !filter.admits(log.log_type) {
                                continue;
                            }
                            if tx.send(Ok(to_proto_log(&log, &cluster_name))).await.is_err() {
                                feeder.err(format!(
                                    "log subscriber {} disconnected",
                                    _guard.id()
                                ));
                                return;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            feeder.err(format!(
                                "log subscriber {} too slow, dropping it ({n} missed)",
                                _guard.id()
                            ));
                            return;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

pub struct ServerHandle {
    join: JoinHandle<()>,
}

impl ServerHandle {
    /// Wait for the server to drain after the shutdown signal fired.
    pub async fn stop(self) {
        let _ = self.join.await;
    }
}

/// Bind the listener and spawn the gRPC server. Binding failures are
/// startup-fatal and reported to the caller; the running server exits on the
/// process-wide shutdown signal.
pub async fn run_server(
    addr: SocketAddr,
    feeder: Arc<Feeder>,
    shutdown: ShutdownSignal,
) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind gRPC listener on {addr}"))?;
    log::info!("gRPC server listening on {addr}");

    let service = LogServiceServer::new(FeederService::new(feeder, shutdown.clone()));
    let mut signal = shutdown;
    let server = Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.recv().await;
        });

    let join = tokio::spawn(async move {
        if let Err(err) = server.await {
            log::error!("gRPC server error: {err}");
        }
    });

    Ok(ServerHandle { join })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_stream::StreamExt;
    use warden_core::{
        feeder::{FeederConfig, Output},
        log::{now_timestamp, Action, Level, Log, LogType, Operation},
        policy::{
            PathBlock, PathMatch, PolicyEvent, PolicyIndex, PolicyMatcher, SecurityPolicy,
            SecuritySpec, Selector,
        },
        shutdown::shutdown_channel,
    };

    use super::*;

    fn deny_passwd_policy() -> SecurityPolicy {
        SecurityPolicy {
            metadata: HashMap::from([
                ("name".to_string(), "deny-passwd".to_string()),
                ("namespace".to_string(), "ns1".to_string()),
            ]),
            spec: SecuritySpec {
                severity: 7,
                tags: Vec::new(),
                message: String::new(),
                selector: Selector {
                    match_labels: HashMap::from([("app".to_string(), "web".to_string())]),
                    ..Selector::default()
                },
                process: PathBlock::default(),
                file: PathBlock {
                    match_paths: vec![PathMatch {
                        path: "/etc/passwd".to_string(),
                        ..PathMatch::default()
                    }],
                    ..PathBlock::default()
                },
                network: Default::default(),
                capabilities: Default::default(),
                action: Action::Block,
            },
        }
    }

    fn service_with_policy() -> (
        FeederService,
        Arc<Feeder>,
        warden_core::shutdown::ShutdownSender,
    ) {
        let index = Arc::new(PolicyIndex::new(&[]));
        index.bind_group(
            "ns1",
            "web",
            vec![
                "namespaceName=ns1".to_string(),
                "podGroupName=web".to_string(),
                "app=web".to_string(),
            ],
        );
        index
            .apply(PolicyEvent::Added(deny_passwd_policy()))
            .unwrap();

        let feeder = Arc::new(
            Feeder::new(
                FeederConfig {
                    cluster_name: "default".to_string(),
                    host_name: "node-1".to_string(),
                    host_ip: "10.0.0.1".to_string(),
                    output: Output::None,
                },
                PolicyMatcher::new(index, false),
            )
            .unwrap(),
        );
        let (tx, shutdown) = shutdown_channel();
        (FeederService::new(feeder.clone(), shutdown), feeder, tx)
    }

    fn log(resource: &str) -> Log {
        Log {
            updated_time: now_timestamp(),
            host_name: "node-1".to_string(),
            namespace_name: "ns1".to_string(),
            pod_name: "web".to_string(),
            container_id: "c1".to_string(),
            container_name: "nginx".to_string(),
            host_pid: 42,
            ppid: 1,
            pid: 7,
            uid: 0,
            policy_name: String::new(),
            severity: String::new(),
            tags: String::new(),
            message: String::new(),
            log_type: LogType::ContainerLog,
            source: "/usr/sbin/nginx".to_string(),
            operation: Operation::File,
            resource: resource.to_string(),
            data: "fd=-100 flags=O_RDONLY".to_string(),
            action: String::new(),
            result: "Passed".to_string(),
        }
    }

    #[tokio::test]
    async fn health_check_echoes_the_nonce() {
        let (service, _feeder, _shutdown_tx) = service_with_policy();
        let reply = service
            .health_check(Request::new(proto::NonceMessage { nonce: 4242 }))
            .await
            .unwrap();
        assert_eq!(reply.into_inner().retval, 4242);
    }

    #[tokio::test]
    async fn filters_split_the_log_stream() {
        let (service, feeder, _shutdown_tx) = service_with_policy();

        let mut all = service
            .watch_logs(Request::new(proto::RequestMessage {
                filter: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        let mut policy_only = service
            .watch_logs(Request::new(proto::RequestMessage {
                filter: "policy".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        // unmatched, then matched by deny-passwd
        feeder.push_log(log("/etc/hostname"));
        feeder.push_log(log("/etc/passwd"));

        let first = all.next().await.unwrap().unwrap();
        assert_eq!(first.r#type, "ContainerLog");
        assert_eq!(first.resource, "/etc/hostname");
        assert_eq!(first.cluster_name, "default");

        let second = all.next().await.unwrap().unwrap();
        assert_eq!(second.r#type, "MatchedPolicy");
        assert_eq!(second.policy_name, "deny-passwd");
        assert_eq!(second.severity, "7");
        assert_eq!(second.action, "Block");

        // the policy subscriber only sees the matched log
        let only = policy_only.next().await.unwrap().unwrap();
        assert_eq!(only.r#type, "MatchedPolicy");
        assert_eq!(only.resource, "/etc/passwd");
    }

    #[tokio::test]
    async fn unknown_filter_yields_an_empty_stream() {
        let (service, feeder, _shutdown_tx) = service_with_policy();
        let mut stream = service
            .watch_logs(Request::new(proto::RequestMessage {
                filter: "bogus".to_string(),
            }))
            .await
            .unwrap()
            .into_inner();

        feeder.push_log(log("/etc/passwd"));

        tokio::select! {
            item = stream.next() => panic!("expected no items, got {item:?}"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    #[tokio::test]
    async fn dropped_subscriber_is_unregistered_and_reported() {
        let (service, feeder, _shutdown_tx) = service_with_policy();
        let mut messages = feeder.subscribe_messages();

        let stream = service
            .watch_logs(Request::new(proto::RequestMessage {
                filter: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(feeder.subscriptions().count(SubscriberKind::Logs), 1);

        // the client cancels its stream
        drop(stream);

        // the next deliveries hit the closed queue and evict the subscriber
        for _ in 0..3 {
            feeder.push_log(log("/etc/hostname"));
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if feeder.subscriptions().count(SubscriberKind::Logs) == 0 {
                break;
            }
        }
        assert_eq!(feeder.subscriptions().count(SubscriberKind::Logs), 0);

        let mut saw_error = false;
        while let Ok(msg) = messages.try_recv() {
            if msg.level == Level::Error && msg.message.contains("disconnected") {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn watch_messages_streams_diagnostics() {
        let (service, feeder, _shutdown_tx) = service_with_policy();
        let mut stream = service
            .watch_messages(Request::new(proto::RequestMessage {
                filter: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();

        feeder.print("policy engine ready");

        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.level, "INFO");
        assert_eq!(msg.message, "policy engine ready");
        assert_eq!(msg.host_name, "node-1");
    }
}
