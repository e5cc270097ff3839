use std::collections::HashMap;

use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Duration, Instant},
};

/// How long an exited process keeps serving `exec_path` lookups before its
/// node is reclaimed. Late events for a pid may arrive well after its exit.
const EXIT_GRACE: Duration = Duration::from_secs(120);
/// Reclamation timer period.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the tracker task and return a cloneable handle to it. The task
/// exits when every handle has been dropped.
pub fn start_process_tracker() -> ProcessTrackerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut tracker = ProcessTracker::new(rx);
    tokio::spawn(async move { tracker.run().await });
    ProcessTrackerHandle { tx }
}

#[derive(Clone)]
pub struct ProcessTrackerHandle {
    tx: mpsc::UnboundedSender<TrackerRequest>,
}

impl ProcessTrackerHandle {
    pub fn update(&self, update: TrackerUpdate) {
        // The tracker only stops when all handles are dropped.
        let _ = self.tx.send(TrackerRequest::Update(update));
    }

    /// Path of the current executable of `pid` inside `container_id` (empty
    /// container id addresses host processes). Unknown pids return an empty
    /// string; exited pids keep answering until the grace window expires.
    pub async fn exec_path(&self, container_id: &str, pid: u32) -> String {
        let (tx_reply, rx_reply) = oneshot::channel();
        let sent = self.tx.send(TrackerRequest::ExecPath {
            container_id: container_id.to_string(),
            pid,
            tx_reply,
        });
        if sent.is_err() {
            return String::new();
        }
        rx_reply.await.unwrap_or_default()
    }
}

#[derive(Debug)]
pub enum TrackerUpdate {
    Fork {
        container_id: String,
        pid_id: u32,
        mnt_id: u32,
        host_pid: u32,
        ppid: u32,
        pid: u32,
        uid: u32,
        comm: String,
    },
    Exec {
        container_id: String,
        host_pid: u32,
        pid: u32,
        exec_path: String,
    },
    Exit {
        container_id: String,
        pid: u32,
    },
}

enum TrackerRequest {
    Update(TrackerUpdate),
    ExecPath {
        container_id: String,
        pid: u32,
        tx_reply: oneshot::Sender<String>,
    },
}

/// Per-process node. Retained for a grace window after exit.
#[derive(Debug, Clone, Default)]
pub struct PidNode {
    pub pid_id: u32,
    pub mnt_id: u32,
    pub host_pid: u32,
    pub ppid: u32,
    pub pid: u32,
    pub uid: u32,
    pub comm: String,
    pub exec_path: String,
    pub exited: bool,
    pub exited_time: Option<Instant>,
}

struct ProcessTracker {
    rx: mpsc::UnboundedReceiver<TrackerRequest>,
    /// container id ("" for the host) -> pid -> node
    processes: HashMap<String, HashMap<u32, PidNode>>,
}

impl ProcessTracker {
    fn new(rx: mpsc::UnboundedReceiver<TrackerRequest>) -> Self {
        Self {
            rx,
            processes: HashMap::new(),
        }
    }

    async fn run(&mut self) {
        let mut cleanup = time::interval(CLEANUP_INTERVAL);
        cleanup.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                _ = cleanup.tick() => self.cleanup(),
            }
        }
    }

    fn handle_message(&mut self, req: TrackerRequest) {
        match req {
            TrackerRequest::Update(update) => self.handle_update(update),
            TrackerRequest::ExecPath {
                container_id,
                pid,
                tx_reply,
            } => {
                // expiry is checked here too: the timer only reclaims memory
                let now = Instant::now();
                let path = self
                    .processes
                    .get(&container_id)
                    .and_then(|pids| pids.get(&pid))
                    .filter(|node| !expired(node, now))
                    .map(|node| node.exec_path.clone())
                    .unwrap_or_default();
                let _ = tx_reply.send(path);
            }
        }
    }

    fn handle_update(&mut self, update: TrackerUpdate) {
        match update {
            TrackerUpdate::Fork {
                container_id,
                pid_id,
                mnt_id,
                host_pid,
                ppid,
                pid,
                uid,
                comm,
            } => {
                let pids = self.processes.entry(container_id).or_default();
                // a fork preserves the parent's executable
                let exec_path = pids
                    .get(&ppid)
                    .map(|parent| parent.exec_path.clone())
                    .unwrap_or_default();
                pids.insert(
                    pid,
                    PidNode {
                        pid_id,
                        mnt_id,
                        host_pid,
                        ppid,
                        pid,
                        uid,
                        comm,
                        exec_path,
                        exited: false,
                        exited_time: None,
                    },
                );
            }
            TrackerUpdate::Exec {
                container_id,
                host_pid,
                pid,
                exec_path,
            } => {
                let pids = self.processes.entry(container_id).or_default();
                // exec may arrive before its fork
                let node = pids.entry(pid).or_insert_with(|| PidNode {
                    host_pid,
                    pid,
                    ..PidNode::default()
                });
                node.exec_path = exec_path;
            }
            TrackerUpdate::Exit { container_id, pid } => {
                if let Some(node) = self
                    .processes
                    .get_mut(&container_id)
                    .and_then(|pids| pids.get_mut(&pid))
                {
                    node.exited = true;
                    node.exited_time = Some(Instant::now());
                } else {
                    log::debug!("(exit) pid {pid} not found in process tree");
                }
            }
        }
    }

    /// Drop nodes whose grace window expired, and container maps that ended
    /// up empty.
    fn cleanup(&mut self) {
        let now = Instant::now();
        for pids in self.processes.values_mut() {
            pids.retain(|_, node| !expired(node, now));
        }
        self.processes.retain(|_, pids| !pids.is_empty());
    }
}

fn expired(node: &PidNode, now: Instant) -> bool {
    match node.exited_time {
        Some(exited_time) if node.exited => now.duration_since(exited_time) > EXIT_GRACE,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork(container: &str, ppid: u32, pid: u32, comm: &str) -> TrackerUpdate {
        TrackerUpdate::Fork {
            container_id: container.to_string(),
            pid_id: 400,
            mnt_id: 500,
            host_pid: 1000 + pid,
            ppid,
            pid,
            uid: 0,
            comm: comm.to_string(),
        }
    }

    fn exec(container: &str, pid: u32, path: &str) -> TrackerUpdate {
        TrackerUpdate::Exec {
            container_id: container.to_string(),
            host_pid: 1000 + pid,
            pid,
            exec_path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn unknown_pid_yields_empty_path() {
        let tracker = start_process_tracker();
        assert_eq!(tracker.exec_path("c1", 7).await, "");
    }

    #[tokio::test]
    async fn exec_sets_the_path_and_fork_inherits_it() {
        let tracker = start_process_tracker();
        tracker.update(fork("c1", 1, 7, "nginx"));
        tracker.update(exec("c1", 7, "/usr/sbin/nginx"));
        tracker.update(fork("c1", 7, 8, "nginx"));

        assert_eq!(tracker.exec_path("c1", 7).await, "/usr/sbin/nginx");
        // the worker forked off pid 7 starts with its parent's executable
        assert_eq!(tracker.exec_path("c1", 8).await, "/usr/sbin/nginx");
        // other containers are unaffected
        assert_eq!(tracker.exec_path("c2", 7).await, "");
    }

    #[tokio::test]
    async fn exec_before_fork_creates_the_node() {
        let tracker = start_process_tracker();
        tracker.update(exec("c1", 12, "/usr/sbin/cron"));
        assert_eq!(tracker.exec_path("c1", 12).await, "/usr/sbin/cron");
    }

    #[tokio::test(start_paused = true)]
    async fn exited_pids_answer_until_the_grace_window_expires() {
        let tracker = start_process_tracker();
        tracker.update(fork("c1", 1, 7, "sh"));
        tracker.update(exec("c1", 7, "/bin/sh"));
        tracker.update(TrackerUpdate::Exit {
            container_id: "c1".to_string(),
            pid: 7,
        });

        assert_eq!(tracker.exec_path("c1", 7).await, "/bin/sh");

        time::advance(EXIT_GRACE + CLEANUP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(tracker.exec_path("c1", 7).await, "");
    }
}
