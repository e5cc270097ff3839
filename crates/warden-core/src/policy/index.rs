use std::{
    cmp::Ordering,
    collections::HashMap,
    sync::RwLock,
};

use regex::Regex;
use thiserror::Error;

use crate::{
    kernel::capability,
    log::{Action, Operation},
};

use super::{
    node_identities, selector_identities, HostSecurityPolicy, PathBlock, SecurityPolicy,
    SourceMatch,
};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy has no metadata name")]
    MissingName,
    #[error("invalid match pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("unknown network protocol {0:?}")]
    UnknownProtocol(String),
    #[error("policy {0:?} contains no rules")]
    EmptyPolicy(String),
}

/// Source-process constraint of a compiled rule.
#[derive(Debug, Clone)]
pub enum SourceMatcher {
    Any,
    Path(String),
    Directory { dir: String, recursive: bool },
}

impl SourceMatcher {
    pub fn matches(&self, source: &str) -> bool {
        match self {
            SourceMatcher::Any => true,
            SourceMatcher::Path(path) => source == path,
            SourceMatcher::Directory { dir, recursive } => prefix_match(dir, *recursive, source),
        }
    }
}

/// Resource constraint of a compiled rule.
#[derive(Debug, Clone)]
pub enum ResourceMatcher {
    Exact(String),
    Prefix { dir: String, recursive: bool },
    Pattern(Regex),
    Contains(String),
}

impl ResourceMatcher {
    pub fn matches(&self, resource: &str) -> bool {
        match self {
            ResourceMatcher::Exact(value) => resource == value,
            ResourceMatcher::Prefix { dir, recursive } => prefix_match(dir, *recursive, resource),
            ResourceMatcher::Pattern(re) => re.is_match(resource),
            ResourceMatcher::Contains(needle) => resource.contains(needle),
        }
    }
}

/// `dir` is normalized to end with `/` at compile time. Non-recursive rules
/// match direct children only.
fn prefix_match(dir: &str, recursive: bool, value: &str) -> bool {
    match value.strip_prefix(dir) {
        Some(rest) => recursive || !rest.contains('/'),
        None => false,
    }
}

fn normalize_dir(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{dir}/")
    }
}

/// Flattened, directly matchable form of one rule of a security policy.
#[derive(Debug, Clone)]
pub struct MatchPolicy {
    pub policy_name: String,
    pub severity: i32,
    pub tags: Vec<String>,
    pub message: String,
    pub source: SourceMatcher,
    pub operation: Operation,
    pub resource: ResourceMatcher,
    pub owner_only: bool,
    pub read_only: bool,
    pub action: Action,
}

impl MatchPolicy {
    /// Total order used to pick the winner among concurrent matches:
    /// Block > Audit > Allow, then highest severity, then smallest name.
    pub fn compare_precedence(&self, other: &Self) -> Ordering {
        other
            .action
            .precedence()
            .cmp(&self.action.precedence())
            .then(other.severity.cmp(&self.severity))
            .then(self.policy_name.cmp(&other.policy_name))
    }
}

fn sources_of(from_source: &[SourceMatch]) -> Vec<SourceMatcher> {
    if from_source.is_empty() {
        return vec![SourceMatcher::Any];
    }
    from_source
        .iter()
        .map(|source| {
            if !source.path.is_empty() {
                SourceMatcher::Path(source.path.clone())
            } else {
                SourceMatcher::Directory {
                    dir: normalize_dir(&source.dir),
                    recursive: source.recursive,
                }
            }
        })
        .collect()
}

/// Socket-resource substring a protocol name compiles to.
fn protocol_resource(protocol: &str) -> Result<String, PolicyError> {
    match protocol.to_lowercase().as_str() {
        "tcp" => Ok("type=SOCK_STREAM".to_string()),
        "udp" => Ok("type=SOCK_DGRAM".to_string()),
        "icmp" => Ok("protocol=1".to_string()),
        "raw" => Ok("type=SOCK_RAW".to_string()),
        other => Err(PolicyError::UnknownProtocol(other.to_string())),
    }
}

struct CompileCtx<'a> {
    policy_name: &'a str,
    severity: i32,
    tags: &'a [String],
    message: &'a str,
    action: Action,
}

impl CompileCtx<'_> {
    fn rule(
        &self,
        operation: Operation,
        source: SourceMatcher,
        resource: ResourceMatcher,
        owner_only: bool,
        read_only: bool,
    ) -> MatchPolicy {
        MatchPolicy {
            policy_name: self.policy_name.to_string(),
            severity: self.severity,
            tags: self.tags.to_vec(),
            message: self.message.to_string(),
            source,
            operation,
            resource,
            owner_only,
            read_only,
            action: self.action,
        }
    }

    fn path_block(
        &self,
        block: &PathBlock,
        operation: Operation,
        out: &mut Vec<MatchPolicy>,
    ) -> Result<(), PolicyError> {
        // readOnly only has meaning for file rules
        let read_only = |flag: bool| flag && operation == Operation::File;

        for path in &block.match_paths {
            for source in sources_of(&path.from_source) {
                out.push(self.rule(
                    operation,
                    source,
                    ResourceMatcher::Exact(path.path.clone()),
                    path.owner_only,
                    read_only(path.read_only),
                ));
            }
        }
        for dir in &block.match_directories {
            for source in sources_of(&dir.from_source) {
                out.push(self.rule(
                    operation,
                    source,
                    ResourceMatcher::Prefix {
                        dir: normalize_dir(&dir.dir),
                        recursive: dir.recursive,
                    },
                    dir.owner_only,
                    read_only(dir.read_only),
                ));
            }
        }
        for pattern in &block.match_patterns {
            let re = Regex::new(&pattern.pattern).map_err(|source| PolicyError::InvalidPattern {
                pattern: pattern.pattern.clone(),
                source,
            })?;
            out.push(self.rule(
                operation,
                SourceMatcher::Any,
                ResourceMatcher::Pattern(re),
                pattern.owner_only,
                read_only(pattern.read_only),
            ));
        }
        Ok(())
    }
}

/// Expand a raw policy into its flat rules. Every accepted policy expands
/// into at least one rule; an empty spec is an error.
fn compile(policy: &SecurityPolicy) -> Result<Vec<MatchPolicy>, PolicyError> {
    let spec = &policy.spec;
    let ctx = CompileCtx {
        policy_name: policy.name(),
        severity: spec.severity,
        tags: &spec.tags,
        message: &spec.message,
        action: spec.action,
    };

    let mut rules = Vec::new();
    ctx.path_block(&spec.process, Operation::Process, &mut rules)?;
    ctx.path_block(&spec.file, Operation::File, &mut rules)?;

    for protocol in &spec.network.match_protocols {
        let resource = protocol_resource(&protocol.protocol)?;
        for source in sources_of(&protocol.from_source) {
            rules.push(ctx.rule(
                Operation::Network,
                source,
                ResourceMatcher::Contains(resource.clone()),
                false,
                false,
            ));
        }
    }

    for cap in &spec.capabilities.match_capabilities {
        let resource = capability::canonical(&cap.capability);
        for source in sources_of(&cap.from_source) {
            rules.push(ctx.rule(
                Operation::Capabilities,
                source,
                ResourceMatcher::Exact(resource.clone()),
                false,
                false,
            ));
        }
    }

    if rules.is_empty() {
        return Err(PolicyError::EmptyPolicy(policy.name().to_string()));
    }

    Ok(rules)
}

fn compile_host(policy: &HostSecurityPolicy) -> Result<Vec<MatchPolicy>, PolicyError> {
    // Host specs share the rule grammar; reuse the container compiler through
    // a shim document.
    let shim = SecurityPolicy {
        metadata: policy.metadata.clone(),
        spec: super::SecuritySpec {
            severity: policy.spec.severity,
            tags: policy.spec.tags.clone(),
            message: policy.spec.message.clone(),
            selector: policy.spec.node_selector.clone(),
            process: policy.spec.process.clone(),
            file: policy.spec.file.clone(),
            network: policy.spec.network.clone(),
            capabilities: policy.spec.capabilities.clone(),
            action: policy.spec.action,
        },
    };
    compile(&shim)
}

/// True when every identity the selector requires is present on the group.
fn binds(required: &[String], group_identities: &[String]) -> bool {
    required
        .iter()
        .all(|identity| group_identities.iter().any(|other| other == identity))
}

#[derive(Debug, Clone)]
pub enum PolicyEvent {
    Added(SecurityPolicy),
    Modified(SecurityPolicy),
    Deleted(String),
}

#[derive(Debug, Clone)]
pub enum HostPolicyEvent {
    Added(HostSecurityPolicy),
    Modified(HostSecurityPolicy),
    Deleted(String),
}

struct CompiledPolicy {
    identities: Vec<String>,
    rules: Vec<MatchPolicy>,
}

#[derive(Default)]
struct IndexInner {
    /// policy name -> compiled policy
    policies: HashMap<String, CompiledPolicy>,
    /// "namespace/pod_group" -> identities of the registered group
    groups: HashMap<String, Vec<String>>,
    /// "namespace/pod_group" -> flattened rules of every bound policy
    bindings: HashMap<String, Vec<MatchPolicy>>,
    /// node-level rules, matched when host policies are enabled
    host_rules: Vec<MatchPolicy>,
    host_policies: HashMap<String, CompiledPolicy>,
}

/// Compiled per-selector rule sets, keyed by pod group (and by the node for
/// host policies). Writers are the cluster watchers; the policy matcher is
/// the only reader.
pub struct PolicyIndex {
    node: Vec<String>,
    inner: RwLock<IndexInner>,
}

fn group_key(namespace: &str, pod_group: &str) -> String {
    format!("{namespace}/{pod_group}")
}

impl PolicyIndex {
    pub fn new(node_labels: &[String]) -> Self {
        Self {
            node: node_identities(node_labels),
            inner: RwLock::new(IndexInner::default()),
        }
    }

    /// Apply a container-policy watch event and rebind affected groups.
    pub fn apply(&self, event: PolicyEvent) -> Result<(), PolicyError> {
        let mut inner = self.inner.write().unwrap();
        match event {
            PolicyEvent::Added(policy) | PolicyEvent::Modified(policy) => {
                if policy.name().is_empty() {
                    return Err(PolicyError::MissingName);
                }
                let namespace = policy
                    .metadata
                    .get("namespace")
                    .cloned()
                    .unwrap_or_default();
                let compiled = CompiledPolicy {
                    identities: selector_identities(&namespace, &policy.spec.selector),
                    rules: compile(&policy)?,
                };
                inner.policies.insert(policy.name().to_string(), compiled);
            }
            PolicyEvent::Deleted(name) => {
                inner.policies.remove(&name);
            }
        }
        Self::rebind_all(&mut inner);
        Ok(())
    }

    /// Apply a host-policy watch event.
    pub fn apply_host(&self, event: HostPolicyEvent) -> Result<(), PolicyError> {
        let mut inner = self.inner.write().unwrap();
        match event {
            HostPolicyEvent::Added(policy) | HostPolicyEvent::Modified(policy) => {
                if policy.name().is_empty() {
                    return Err(PolicyError::MissingName);
                }
                let compiled = CompiledPolicy {
                    identities: {
                        let mut ids: Vec<String> = policy
                            .spec
                            .node_selector
                            .match_names
                            .iter()
                            .chain(policy.spec.node_selector.match_labels.iter())
                            .map(|(k, v)| format!("{k}={v}"))
                            .collect();
                        ids.sort();
                        ids.dedup();
                        ids
                    },
                    rules: compile_host(&policy)?,
                };
                inner
                    .host_policies
                    .insert(policy.name().to_string(), compiled);
            }
            HostPolicyEvent::Deleted(name) => {
                inner.host_policies.remove(&name);
            }
        }
        let host_rules = Self::host_rules_for(&inner, &self.node);
        inner.host_rules = host_rules;
        Ok(())
    }

    /// Register a pod group and compute its bindings.
    pub fn bind_group(&self, namespace: &str, pod_group: &str, identities: Vec<String>) {
        let mut inner = self.inner.write().unwrap();
        inner.groups.insert(group_key(namespace, pod_group), identities);
        Self::rebind_all(&mut inner);
    }

    pub fn drop_group(&self, namespace: &str, pod_group: &str) {
        let mut inner = self.inner.write().unwrap();
        let key = group_key(namespace, pod_group);
        inner.groups.remove(&key);
        inner.bindings.remove(&key);
    }

    /// Flattened rules bound to a pod group. Unknown groups yield no rules.
    pub fn policies_for(&self, namespace: &str, pod_group: &str) -> Vec<MatchPolicy> {
        let inner = self.inner.read().unwrap();
        inner
            .bindings
            .get(&group_key(namespace, pod_group))
            .cloned()
            .unwrap_or_default()
    }

    pub fn host_policies(&self) -> Vec<MatchPolicy> {
        let inner = self.inner.read().unwrap();
        inner.host_rules.clone()
    }

    /// Names of the policies bound to a group, for the registry bookkeeping.
    pub fn bound_policy_names(&self, namespace: &str, pod_group: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let Some(identities) = inner.groups.get(&group_key(namespace, pod_group)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = inner
            .policies
            .iter()
            .filter(|(_, compiled)| binds(&compiled.identities, identities))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn rebind_all(inner: &mut IndexInner) {
        let mut bindings = HashMap::new();
        for (key, identities) in &inner.groups {
            let mut rules: Vec<MatchPolicy> = inner
                .policies
                .values()
                .filter(|compiled| binds(&compiled.identities, identities))
                .flat_map(|compiled| compiled.rules.iter().cloned())
                .collect();
            rules.sort_by(MatchPolicy::compare_precedence);
            bindings.insert(key.clone(), rules);
        }
        inner.bindings = bindings;
    }

    fn host_rules_for(inner: &IndexInner, node: &[String]) -> Vec<MatchPolicy> {
        let mut rules: Vec<MatchPolicy> = inner
            .host_policies
            .values()
            .filter(|compiled| binds(&compiled.identities, node))
            .flat_map(|compiled| compiled.rules.iter().cloned())
            .collect();
        rules.sort_by(MatchPolicy::compare_precedence);
        rules
    }
}
