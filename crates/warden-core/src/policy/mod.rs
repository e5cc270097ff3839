//! Declarative security-policy documents and their compiled, indexed form.
//!
//! Raw documents arrive from the cluster watcher as serde-decoded values.
//! [`PolicyIndex`](index::PolicyIndex) expands them into flat
//! [`MatchPolicy`](index::MatchPolicy) records bound per pod group, and
//! [`PolicyMatcher`](matcher::PolicyMatcher) decorates pipeline logs with the
//! winning match.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::log::Action;

mod index;
mod matcher;

pub use index::{HostPolicyEvent, MatchPolicy, PolicyError, PolicyEvent, PolicyIndex, ResourceMatcher, SourceMatcher};
pub use matcher::PolicyMatcher;

/// Identities of a pod group, derived from its coordinates and labels. The
/// same rule produces the selector side, so binding is a subset check.
pub fn derive_identities(namespace: &str, pod_group: &str, labels: &[String]) -> Vec<String> {
    let mut identities = vec![
        format!("namespaceName={namespace}"),
        format!("podGroupName={pod_group}"),
    ];
    for label in labels {
        if !identities.contains(label) {
            identities.push(label.clone());
        }
    }
    identities
}

/// Identities a selector requires from a group in `namespace`.
pub fn selector_identities(namespace: &str, selector: &Selector) -> Vec<String> {
    let mut identities = vec![format!("namespaceName={namespace}")];
    for (k, v) in &selector.match_names {
        identities.push(format!("{k}={v}"));
    }
    for (k, v) in &selector.match_labels {
        identities.push(format!("{k}={v}"));
    }
    identities.sort();
    identities.dedup();
    identities
}

/// Node identities derived from node labels, used by host-policy selectors.
pub fn node_identities(labels: &[String]) -> Vec<String> {
    let mut identities: Vec<String> = labels.to_vec();
    identities.sort();
    identities.dedup();
    identities
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "matchNames", default, skip_serializing_if = "HashMap::is_empty")]
    pub match_names: HashMap<String, String>,
    #[serde(rename = "matchLabels", default, skip_serializing_if = "HashMap::is_empty")]
    pub match_labels: HashMap<String, String>,
    /// Filled in during policy update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathMatch {
    pub path: String,
    #[serde(rename = "readOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(rename = "ownerOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub owner_only: bool,
    #[serde(rename = "fromSource", default, skip_serializing_if = "Vec::is_empty")]
    pub from_source: Vec<SourceMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectoryMatch {
    pub dir: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recursive: bool,
    #[serde(rename = "readOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(rename = "ownerOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub owner_only: bool,
    #[serde(rename = "fromSource", default, skip_serializing_if = "Vec::is_empty")]
    pub from_source: Vec<SourceMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub pattern: String,
    #[serde(rename = "readOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(rename = "ownerOnly", default, skip_serializing_if = "std::ops::Not::not")]
    pub owner_only: bool,
}

/// Union of path, directory and pattern matchers used by both process and
/// file rules (the `readOnly` modifier only has effect on file rules).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathBlock {
    #[serde(rename = "matchPaths", default, skip_serializing_if = "Vec::is_empty")]
    pub match_paths: Vec<PathMatch>,
    #[serde(rename = "matchDirectories", default, skip_serializing_if = "Vec::is_empty")]
    pub match_directories: Vec<DirectoryMatch>,
    #[serde(rename = "matchPatterns", default, skip_serializing_if = "Vec::is_empty")]
    pub match_patterns: Vec<PatternMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMatch {
    pub protocol: String,
    #[serde(rename = "fromSource", default, skip_serializing_if = "Vec::is_empty")]
    pub from_source: Vec<SourceMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkBlock {
    #[serde(rename = "matchProtocols", default, skip_serializing_if = "Vec::is_empty")]
    pub match_protocols: Vec<ProtocolMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMatch {
    pub capability: String,
    #[serde(rename = "fromSource", default, skip_serializing_if = "Vec::is_empty")]
    pub from_source: Vec<SourceMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesBlock {
    #[serde(rename = "matchCapabilities", default, skip_serializing_if = "Vec::is_empty")]
    pub match_capabilities: Vec<CapabilityMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecuritySpec {
    pub severity: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    pub selector: Selector,

    #[serde(default, skip_serializing_if = "PathBlock::is_empty")]
    pub process: PathBlock,
    #[serde(default, skip_serializing_if = "PathBlock::is_empty")]
    pub file: PathBlock,
    #[serde(default, skip_serializing_if = "NetworkBlock::is_empty")]
    pub network: NetworkBlock,
    #[serde(default, skip_serializing_if = "CapabilitiesBlock::is_empty")]
    pub capabilities: CapabilitiesBlock,

    pub action: Action,
}

impl PathBlock {
    pub fn is_empty(&self) -> bool {
        self.match_paths.is_empty()
            && self.match_directories.is_empty()
            && self.match_patterns.is_empty()
    }
}

impl NetworkBlock {
    pub fn is_empty(&self) -> bool {
        self.match_protocols.is_empty()
    }
}

impl CapabilitiesBlock {
    pub fn is_empty(&self) -> bool {
        self.match_capabilities.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub metadata: HashMap<String, String>,
    pub spec: SecuritySpec,
}

impl SecurityPolicy {
    pub fn name(&self) -> &str {
        self.metadata.get("name").map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSecuritySpec {
    pub severity: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    #[serde(rename = "nodeSelector")]
    pub node_selector: Selector,

    #[serde(default, skip_serializing_if = "PathBlock::is_empty")]
    pub process: PathBlock,
    #[serde(default, skip_serializing_if = "PathBlock::is_empty")]
    pub file: PathBlock,
    #[serde(default, skip_serializing_if = "NetworkBlock::is_empty")]
    pub network: NetworkBlock,
    #[serde(default, skip_serializing_if = "CapabilitiesBlock::is_empty")]
    pub capabilities: CapabilitiesBlock,

    pub action: Action,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSecurityPolicy {
    pub metadata: HashMap<String, String>,
    pub spec: HostSecuritySpec,
}

impl HostSecurityPolicy {
    pub fn name(&self) -> &str {
        self.metadata.get("name").map(String::as_str).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_derived_from_labels() {
        let identities = derive_identities("ns1", "web", &["app=web".to_string()]);
        assert_eq!(
            identities,
            vec![
                "namespaceName=ns1".to_string(),
                "podGroupName=web".to_string(),
                "app=web".to_string(),
            ]
        );
    }

    #[test]
    fn selector_identities_include_names_and_labels() {
        let selector = Selector {
            match_names: HashMap::from([("podGroupName".to_string(), "web".to_string())]),
            match_labels: HashMap::from([("app".to_string(), "web".to_string())]),
            identities: Vec::new(),
        };
        let identities = selector_identities("ns1", &selector);
        assert!(identities.contains(&"namespaceName=ns1".to_string()));
        assert!(identities.contains(&"podGroupName=web".to_string()));
        assert!(identities.contains(&"app=web".to_string()));
    }

    #[test]
    fn policy_document_decodes_from_json() {
        let raw = r#"{
            "metadata": {"name": "deny-passwd"},
            "spec": {
                "severity": 7,
                "tags": ["CIS"],
                "message": "passwd access",
                "selector": {"matchLabels": {"app": "web"}},
                "file": {
                    "matchPaths": [{"path": "/etc/passwd", "readOnly": true}],
                    "matchDirectories": [{"dir": "/credentials/", "recursive": true}]
                },
                "action": "Block"
            }
        }"#;
        let policy: SecurityPolicy = serde_json::from_str(raw).unwrap();
        assert_eq!(policy.name(), "deny-passwd");
        assert_eq!(policy.spec.severity, 7);
        assert_eq!(policy.spec.action, Action::Block);
        assert!(policy.spec.file.match_paths[0].read_only);
        assert!(policy.spec.file.match_directories[0].recursive);
        assert!(policy.spec.process.is_empty());
    }
}
