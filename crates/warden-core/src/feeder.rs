use std::{
    collections::HashMap,
    fs::{DirBuilder, File, OpenOptions},
    io::Write,
    os::unix::fs::DirBuilderExt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    bus::Bus,
    log::{now_timestamp, Level, Log, LogType, Message},
    policy::PolicyMatcher,
};

/// Fan-out queue depth for messages and logs. Lagging subscribers are
/// unregistered rather than allowed to block the queue.
const FANOUT_CAPACITY: usize = 1024;

/// Local sink selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout,
    None,
    File(PathBuf),
}

impl Output {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stdout" => Output::Stdout,
            "none" => Output::None,
            path => Output::File(PathBuf::from(path)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create log file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct FeederConfig {
    pub cluster_name: String,
    pub host_name: String,
    pub host_ip: String,
    pub output: Output,
}

enum Sink {
    Stdout,
    None,
    File(Mutex<File>),
}

impl Sink {
    fn open(output: &Output) -> Result<Self, FeederError> {
        match output {
            Output::Stdout => Ok(Sink::Stdout),
            Output::None => Ok(Sink::None),
            Output::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(parent)
                        .map_err(|source| FeederError::CreateDir {
                            path: parent.to_path_buf(),
                            source,
                        })?;
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| FeederError::CreateFile {
                        path: path.clone(),
                        source,
                    })?;
                Ok(Sink::File(Mutex::new(file)))
            }
        }
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        match self {
            Sink::Stdout => {
                println!("{line}");
                Ok(())
            }
            Sink::None => Ok(()),
            Sink::File(file) => {
                let mut file = file.lock().unwrap();
                writeln!(file, "{line}")
            }
        }
    }
}

/// Server-side filter of a log subscriber: `""`, `"policy"` or `"system"`.
/// Anything else admits nothing (the stream stays open and empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFilter {
    All,
    Policy,
    System,
    Nothing,
}

impl LogFilter {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "" => LogFilter::All,
            "policy" => LogFilter::Policy,
            "system" => LogFilter::System,
            _ => LogFilter::Nothing,
        }
    }

    pub fn admits(&self, log_type: LogType) -> bool {
        match self {
            LogFilter::All => true,
            LogFilter::Policy => log_type.is_matched(),
            LogFilter::System => !log_type.is_matched(),
            LogFilter::Nothing => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberKind {
    Messages,
    Logs,
}

#[derive(Debug, Clone)]
struct SubscriberInfo {
    kind: SubscriberKind,
    filter: String,
}

type SubscriberTable = Arc<Mutex<HashMap<Uuid, SubscriberInfo>>>;

/// Registry of live stream subscribers. Registration hands back a guard;
/// dropping the guard unregisters, so every stream exit path cleans up.
#[derive(Clone, Default)]
pub struct Subscriptions {
    table: SubscriberTable,
}

impl Subscriptions {
    pub fn register(&self, kind: SubscriberKind, filter: &str) -> SubscriberGuard {
        let id = Uuid::new_v4();
        self.table.lock().unwrap().insert(
            id,
            SubscriberInfo {
                kind,
                filter: filter.to_string(),
            },
        );
        log::debug!("subscriber {id} registered ({kind:?}, filter {filter:?})");
        SubscriberGuard {
            id,
            table: self.table.clone(),
        }
    }

    pub fn count(&self, kind: SubscriberKind) -> usize {
        self.table
            .lock()
            .unwrap()
            .values()
            .filter(|info| info.kind == kind)
            .count()
    }

    /// Filter string a live subscriber registered with.
    pub fn filter_of(&self, id: Uuid) -> Option<String> {
        self.table
            .lock()
            .unwrap()
            .get(&id)
            .map(|info| info.filter.clone())
    }
}

pub struct SubscriberGuard {
    id: Uuid,
    table: SubscriberTable,
}

impl SubscriberGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.table.lock().unwrap().remove(&self.id);
        log::debug!("subscriber {} unregistered", self.id);
    }
}

/// Multiplexes decorated logs and agent messages to the local sink and to
/// any number of stream subscribers.
pub struct Feeder {
    cluster_name: String,
    host_name: String,
    host_ip: String,
    sink: Sink,
    msg_bus: Bus<Message>,
    log_bus: Bus<Log>,
    matcher: PolicyMatcher,
    subscriptions: Subscriptions,
}

impl Feeder {
    pub fn new(config: FeederConfig, matcher: PolicyMatcher) -> Result<Self, FeederError> {
        Ok(Self {
            cluster_name: config.cluster_name,
            host_name: config.host_name,
            host_ip: config.host_ip,
            sink: Sink::open(&config.output)?,
            msg_bus: Bus::new(FANOUT_CAPACITY),
            log_bus: Bus::new(FANOUT_CAPACITY),
            matcher,
            subscriptions: Subscriptions::default(),
        })
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Queue an agent diagnostic record.
    pub fn push_message(&self, level: Level, text: impl Into<String>) {
        self.msg_bus.send(Message {
            updated_time: now_timestamp(),
            cluster_name: self.cluster_name.clone(),
            host_name: self.host_name.clone(),
            host_ip: self.host_ip.clone(),
            level,
            message: text.into(),
        });
    }

    pub fn print(&self, text: impl Into<String>) {
        let text = text.into();
        log::info!("{text}");
        self.push_message(Level::Info, text);
    }

    pub fn debug(&self, text: impl Into<String>) {
        let text = text.into();
        log::debug!("{text}");
        self.push_message(Level::Debug, text);
    }

    pub fn err(&self, text: impl Into<String>) {
        let text = text.into();
        log::error!("{text}");
        self.push_message(Level::Error, text);
    }

    /// Decorate a log with its policy match, emit it on the local sink and
    /// queue it for the stream subscribers. Sink failures are reported on the
    /// message channel and never stop the pipeline.
    pub fn push_log(&self, mut log: Log) {
        self.matcher.decorate(&mut log);

        match serde_json::to_string(&log) {
            Ok(line) => {
                if let Err(err) = self.sink.write_line(&line) {
                    self.err(format!("failed to write log to the local sink: {err}"));
                }
            }
            Err(err) => {
                self.err(format!("failed to encode log: {err}"));
            }
        }

        self.log_bus.send(log);
    }

    pub fn subscribe_logs(&self) -> broadcast::Receiver<Arc<Log>> {
        self.log_bus.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<Arc<Message>> {
        self.msg_bus.subscribe()
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }
}
