use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::sync::broadcast::{self, error::RecvError};

use crate::{
    event::{EventArgs, SyscallEvent},
    feeder::Feeder,
    kernel::{capability, errno, socket},
    log::{now_timestamp, Log, LogType, Operation},
    registry::ContainerRegistry,
    shutdown::ShutdownSignal,
    tracker::{ProcessTrackerHandle, TrackerUpdate},
};

/// Consumes decoded events from the context channel, joins them with the
/// container registry and the process tracker, shapes them into logs and
/// hands them to the feeder.
pub struct LogBuilder {
    registry: Arc<ContainerRegistry>,
    tracker: ProcessTrackerHandle,
    feeder: Arc<Feeder>,
    host_name: String,
    /// (pid_ns, mnt_ns) of the host context; events carrying these ids are
    /// host-origin when no container matches.
    host_ns: (u32, u32),
    enable_auditd: bool,
    unattributed: AtomicU64,
}

impl LogBuilder {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        tracker: ProcessTrackerHandle,
        feeder: Arc<Feeder>,
        host_name: String,
        host_ns: (u32, u32),
        enable_auditd: bool,
    ) -> Self {
        Self {
            registry,
            tracker,
            feeder,
            host_name,
            host_ns,
            enable_auditd,
            unattributed: AtomicU64::new(0),
        }
    }

    /// Long-lived pipeline task. Exits on shutdown or when the ingestor side
    /// of the channel is gone.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<Arc<SyscallEvent>>,
        mut shutdown: ShutdownSignal,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                event = rx.recv() => match event {
                    Ok(event) => self.handle(&event).await,
                    Err(RecvError::Lagged(n)) => {
                        self.feeder.err(format!(
                            "event channel overflow, dropped {n} events"
                        ));
                    }
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }

    pub fn unattributed_count(&self) -> u64 {
        self.unattributed.load(Ordering::Relaxed)
    }

    async fn handle(&self, event: &SyscallEvent) {
        let container_id = match self.registry.container_by_ns(event.pid_ns, event.mnt_ns) {
            Some(id) => id,
            None if (event.pid_ns, event.mnt_ns) == self.host_ns => String::new(),
            None => {
                // not attributable and not host context
                self.unattributed.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "dropping unattributed event from pid {} (ns {}/{})",
                    event.host_pid,
                    event.pid_ns,
                    event.mnt_ns
                );
                return;
            }
        };

        match &event.args {
            EventArgs::Fork => {
                self.tracker.update(TrackerUpdate::Fork {
                    container_id,
                    pid_id: event.pid_ns,
                    mnt_id: event.mnt_ns,
                    host_pid: event.host_pid,
                    ppid: event.ppid,
                    pid: event.pid,
                    uid: event.uid,
                    comm: event.comm.clone(),
                });
                return;
            }
            EventArgs::Exit => {
                self.tracker.update(TrackerUpdate::Exit {
                    container_id,
                    pid: event.pid,
                });
                return;
            }
            EventArgs::Execve { path, .. } | EventArgs::Execveat { path, .. } => {
                self.tracker.update(TrackerUpdate::Exec {
                    container_id: container_id.clone(),
                    host_pid: event.host_pid,
                    pid: event.pid,
                    exec_path: path.clone(),
                });
            }
            _ => {}
        }

        if let Some(log) = self.build(&container_id, event).await {
            self.feeder.push_log(log);
        }
    }

    /// Shape one event into a log. Returns `None` for suppressed events.
    async fn build(&self, container_id: &str, event: &SyscallEvent) -> Option<Log> {
        let (namespace_name, pod_name, container_name) =
            self.registry.lookup_names(container_id);

        // exec events report the invoking process, everything else the actor
        let source_pid = if event.is_exec() { event.ppid } else { event.pid };
        let mut source = self.tracker.exec_path(container_id, source_pid).await;
        if source.is_empty() {
            source = event.comm.clone();
        }

        let (operation, resource, data) = match &event.args {
            EventArgs::Open { path, flags } => (
                Operation::File,
                path.clone(),
                format!("flags={flags}"),
            ),
            EventArgs::Openat { fd, path, flags } => (
                Operation::File,
                path.clone(),
                format!("fd={fd} flags={flags}"),
            ),
            EventArgs::Close { fd } => {
                (Operation::File, "close".to_string(), format!("fd={fd}"))
            }
            EventArgs::Socket {
                domain,
                ty,
                protocol,
            } => (
                Operation::Network,
                format!(
                    "syscall=socket domain={} type={} protocol={}",
                    socket::domain_name(*domain),
                    socket::type_name(*ty),
                    protocol
                ),
                String::new(),
            ),
            EventArgs::Connect { fd, addr }
            | EventArgs::Accept { fd, addr }
            | EventArgs::Bind { fd, addr } => (
                Operation::Network,
                format!("syscall={} {addr}", event.args.syscall_name()),
                format!("fd={fd}"),
            ),
            EventArgs::Listen { fd } => (
                Operation::Network,
                "syscall=listen".to_string(),
                format!("fd={fd}"),
            ),
            EventArgs::Execve { path, argv } | EventArgs::Execveat { path, argv } => {
                let mut resource = path.clone();
                if !argv.is_empty() {
                    resource.push(' ');
                    resource.push_str(&argv.join(" "));
                }
                (
                    Operation::Process,
                    resource,
                    format!("syscall={}", event.args.syscall_name()),
                )
            }
            EventArgs::Capable { capability: cap } => (
                Operation::Capabilities,
                capability::name(*cap),
                "syscall=capable".to_string(),
            ),
            EventArgs::Fork | EventArgs::Exit => return None,
        };

        // auditd reports open-family EACCES denials itself, with richer
        // context than the raw event carries
        if self.enable_auditd
            && matches!(
                event.args,
                EventArgs::Open { .. } | EventArgs::Openat { .. }
            )
            && event.retval == -errno::EACCES
        {
            return None;
        }

        let result = if event.retval < 0 {
            match errno::name(-event.retval) {
                Some(name) => name.to_string(),
                None => format!("Unknown ({})", event.retval),
            }
        } else {
            "Passed".to_string()
        };

        let log_type = if container_id.is_empty() {
            LogType::HostLog
        } else {
            LogType::ContainerLog
        };

        Some(Log {
            updated_time: now_timestamp(),
            host_name: self.host_name.clone(),
            namespace_name,
            pod_name,
            container_id: container_id.to_string(),
            container_name,
            host_pid: event.host_pid as i32,
            ppid: event.ppid as i32,
            pid: event.pid as i32,
            uid: event.uid as i32,
            policy_name: String::new(),
            severity: String::new(),
            tags: String::new(),
            message: String::new(),
            log_type,
            source,
            operation,
            resource,
            data,
            action: String::new(),
            result,
        })
    }
}
