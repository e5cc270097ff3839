use std::{
    collections::HashSet,
    os::unix::fs::MetadataExt,
    sync::{Arc, Mutex},
};

use crate::log::{Log, LogType, Operation};

use super::{index::PolicyIndex, MatchPolicy};

/// Flag names in a log `data` field that indicate write access.
const WRITE_FLAGS: [&str; 5] = ["O_WRONLY", "O_RDWR", "O_APPEND", "O_TRUNC", "O_CREAT"];

/// Decorates pipeline logs with the winning policy match, if any.
pub struct PolicyMatcher {
    index: Arc<PolicyIndex>,
    enable_host_policy: bool,
    /// Policies already warned about an unavailable owner stat.
    warned_owner_only: Mutex<HashSet<String>>,
}

impl PolicyMatcher {
    pub fn new(index: Arc<PolicyIndex>, enable_host_policy: bool) -> Self {
        Self {
            index,
            enable_host_policy,
            warned_owner_only: Mutex::new(HashSet::new()),
        }
    }

    /// Match `log` against the policies applicable to its container (or the
    /// host set for host logs) and populate the policy fields of the winner.
    /// Candidate lists are pre-sorted by precedence, so the first match wins.
    pub fn decorate(&self, log: &mut Log) {
        let host_log = log.container_id.is_empty();
        let candidates = if host_log {
            if !self.enable_host_policy {
                return;
            }
            self.index.host_policies()
        } else {
            self.index
                .policies_for(&log.namespace_name, &log.pod_name)
        };

        let winner = candidates.iter().find(|rule| self.rule_matches(rule, log));
        if let Some(rule) = winner {
            log.policy_name = rule.policy_name.clone();
            log.severity = rule.severity.to_string();
            log.tags = rule.tags.join(",");
            log.message = rule.message.clone();
            log.action = rule.action.to_string();
            log.log_type = if host_log {
                LogType::MatchedHostPolicy
            } else {
                LogType::MatchedPolicy
            };
        }
    }

    fn rule_matches(&self, rule: &MatchPolicy, log: &Log) -> bool {
        if rule.operation != log.operation {
            return false;
        }
        if !rule.source.matches(&log.source) {
            return false;
        }
        // process resources carry the exec path followed by its arguments;
        // rules are written against the path alone
        let resource = if rule.operation == Operation::Process {
            log.resource.split_whitespace().next().unwrap_or_default()
        } else {
            log.resource.as_str()
        };
        if !rule.resource.matches(resource) {
            return false;
        }
        if rule.read_only
            && log.operation == Operation::File
            && WRITE_FLAGS.iter().any(|flag| log.data.contains(flag))
        {
            return false;
        }
        if rule.owner_only {
            match self.owner_uid(log) {
                Some(owner) => {
                    if owner != log.uid as u32 {
                        return false;
                    }
                }
                None => {
                    // stat unavailable: skip the modifier, warn once
                    let mut warned = self.warned_owner_only.lock().unwrap();
                    if warned.insert(rule.policy_name.clone()) {
                        log::debug!(
                            "ownerOnly check unavailable for policy {}, skipping the modifier",
                            rule.policy_name
                        );
                    }
                }
            }
        }
        true
    }

    fn owner_uid(&self, log: &Log) -> Option<u32> {
        let path = match log.operation {
            Operation::File => log.resource.as_str(),
            // process resources carry the exec path followed by its arguments
            Operation::Process => log.resource.split_whitespace().next()?,
            _ => return None,
        };
        std::fs::metadata(path).ok().map(|meta| meta.uid())
    }
}
