use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a telemetry log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogType {
    ContainerLog,
    HostLog,
    MatchedPolicy,
    MatchedHostPolicy,
}

impl LogType {
    pub fn is_matched(&self) -> bool {
        matches!(self, LogType::MatchedPolicy | LogType::MatchedHostPolicy)
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogType::ContainerLog => "ContainerLog",
            LogType::HostLog => "HostLog",
            LogType::MatchedPolicy => "MatchedPolicy",
            LogType::MatchedHostPolicy => "MatchedHostPolicy",
        };
        write!(f, "{name}")
    }
}

/// Operation class of an event, shared by logs and compiled policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Process,
    File,
    Network,
    Capabilities,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Process => "Process",
            Operation::File => "File",
            Operation::Network => "Network",
            Operation::Capabilities => "Capabilities",
        };
        write!(f, "{name}")
    }
}

/// Advisory verdict recorded on a matched log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Audit,
    Block,
}

impl Action {
    /// Precedence used by the matcher tie-break: Block > Audit > Allow.
    pub fn precedence(&self) -> u8 {
        match self {
            Action::Block => 2,
            Action::Audit => 1,
            Action::Allow => 0,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Allow => "Allow",
            Action::Audit => "Audit",
            Action::Block => "Block",
        };
        write!(f, "{name}")
    }
}

/// A container-attributed, policy-decorated telemetry record.
///
/// Field names and the `omitempty` treatment reproduce the wire format the
/// downstream consumers already parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    #[serde(rename = "updatedTime")]
    pub updated_time: String,

    #[serde(rename = "hostName")]
    pub host_name: String,

    #[serde(rename = "namespaceName", default, skip_serializing_if = "String::is_empty")]
    pub namespace_name: String,
    #[serde(rename = "podName", default, skip_serializing_if = "String::is_empty")]
    pub pod_name: String,

    #[serde(rename = "containerID", default, skip_serializing_if = "String::is_empty")]
    pub container_id: String,
    #[serde(rename = "containerName", default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,

    #[serde(rename = "hostPid")]
    pub host_pid: i32,
    pub ppid: i32,
    pub pid: i32,
    pub uid: i32,

    #[serde(rename = "policyName", default, skip_serializing_if = "String::is_empty")]
    pub policy_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tags: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(rename = "type")]
    pub log_type: LogType,
    pub source: String,
    pub operation: Operation,
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    pub result: String,
}

/// Log-level of an agent diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "ERROR")]
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// Agent-level diagnostic record carried on the message channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "updatedTime")]
    pub updated_time: String,
    #[serde(rename = "clusterName", default, skip_serializing_if = "String::is_empty")]
    pub cluster_name: String,
    #[serde(rename = "hostName")]
    pub host_name: String,
    #[serde(rename = "hostIP", default, skip_serializing_if = "String::is_empty")]
    pub host_ip: String,
    pub level: Level,
    pub message: String,
}

/// Timestamp format stamped into every log and message.
pub fn now_timestamp() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> Log {
        Log {
            updated_time: "2026-01-05T10:00:00.000000Z".to_string(),
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
            resource: "/etc/passwd".to_string(),
            data: "fd=-100 flags=O_RDONLY".to_string(),
            action: String::new(),
            result: "Passed".to_string(),
        }
    }

    #[test]
    fn json_round_trip() {
        let log = sample_log();
        let encoded = serde_json::to_string(&log).unwrap();
        let decoded: Log = serde_json::from_str(&encoded).unwrap();
        assert_eq!(log, decoded);
    }

    #[test]
    fn empty_optional_fields_are_omitted() {
        let encoded = serde_json::to_string(&sample_log()).unwrap();
        assert!(!encoded.contains("policyName"));
        assert!(!encoded.contains("severity"));
        assert!(!encoded.contains("action"));
        assert!(encoded.contains("\"type\":\"ContainerLog\""));
        assert!(encoded.contains("\"operation\":\"File\""));
        assert!(encoded.contains("\"hostPid\":42"));
    }

    #[test]
    fn matched_log_keeps_policy_fields() {
        let mut log = sample_log();
        log.log_type = LogType::MatchedPolicy;
        log.policy_name = "deny-passwd".to_string();
        log.severity = "7".to_string();
        log.action = "Block".to_string();

        let encoded = serde_json::to_string(&log).unwrap();
        assert!(encoded.contains("\"policyName\":\"deny-passwd\""));
        assert!(encoded.contains("\"severity\":\"7\""));
        assert!(encoded.contains("\"type\":\"MatchedPolicy\""));

        let decoded: Log = serde_json::from_str(&encoded).unwrap();
        assert_eq!(log, decoded);
    }

    #[test]
    fn action_precedence_order() {
        assert!(Action::Block.precedence() > Action::Audit.precedence());
        assert!(Action::Audit.precedence() > Action::Allow.precedence());
    }
}
