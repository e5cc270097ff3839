use std::{
    collections::HashMap,
    sync::RwLock,
};

use crate::policy::derive_identities;

/// A container known to the runtime watcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub container_id: String,
    pub container_name: String,

    pub host_name: String,
    pub host_ip: String,

    pub namespace_name: String,
    pub pod_group_name: String,

    pub image_name: String,
    pub labels: Vec<String>,

    pub apparmor_profile: String,
    pub selinux_profile: String,

    pub pid_ns: u32,
    pub mnt_ns: u32,
}

/// A host path mounted into one or more containers of a pod group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostMountedVolume {
    pub volume_name: String,
    pub path_name: String,
    pub volume_type: String,
    /// container name -> mounted path
    pub used_by: HashMap<String, String>,
    /// container name -> mounted read-only
    pub read_only: HashMap<String, bool>,
}

/// Cluster-level grouping of containers sharing `{namespace, pod_group}`.
/// The group owns only container ids; containers map back to their group
/// through the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodGroup {
    pub namespace_name: String,
    pub pod_group_name: String,

    pub labels: Vec<String>,
    pub identities: Vec<String>,

    pub containers: Vec<String>,
    pub host_volumes: Vec<HostMountedVolume>,

    /// Names of the security policies currently bound to this group.
    pub policy_names: Vec<String>,

    /// container name -> profile
    pub apparmor_profiles: HashMap<String, String>,
    pub selinux_profiles: HashMap<String, String>,
}

/// Result of removing a container: the group it was detached from, and
/// whether that group was garbage-collected with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub namespace_name: String,
    pub pod_group_name: String,
    pub group_dropped: bool,
}

#[derive(Default)]
struct RegistryInner {
    containers: HashMap<String, Container>,
    pod_groups: HashMap<(String, String), PodGroup>,
    /// (pid_ns, mnt_ns) -> container id, used for event attribution.
    ns_map: HashMap<(u32, u32), String>,
}

/// Mapping from container id to cluster identity, updated by the runtime and
/// cluster watchers and read by the log builder and the policy matcher.
#[derive(Default)]
pub struct ContainerRegistry {
    inner: RwLock<RegistryInner>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a container, creating its pod group on first use.
    pub fn upsert(&self, container: Container) {
        let mut inner = self.inner.write().unwrap();

        let key = (
            container.namespace_name.clone(),
            container.pod_group_name.clone(),
        );
        let group = inner.pod_groups.entry(key).or_insert_with(|| PodGroup {
            namespace_name: container.namespace_name.clone(),
            pod_group_name: container.pod_group_name.clone(),
            ..PodGroup::default()
        });

        if !group.containers.contains(&container.container_id) {
            group.containers.push(container.container_id.clone());
        }
        for label in &container.labels {
            if !group.labels.contains(label) {
                group.labels.push(label.clone());
            }
        }
        group.identities = derive_identities(
            &group.namespace_name,
            &group.pod_group_name,
            &group.labels,
        );
        if !container.apparmor_profile.is_empty() {
            group
                .apparmor_profiles
                .insert(container.container_name.clone(), container.apparmor_profile.clone());
        }
        if !container.selinux_profile.is_empty() {
            group
                .selinux_profiles
                .insert(container.container_name.clone(), container.selinux_profile.clone());
        }

        if container.pid_ns != 0 || container.mnt_ns != 0 {
            inner
                .ns_map
                .insert((container.pid_ns, container.mnt_ns), container.container_id.clone());
        }
        inner
            .containers
            .insert(container.container_id.clone(), container);
    }

    /// Remove a container. The group is dropped together with its last
    /// container unless policies are still bound to it.
    pub fn remove(&self, container_id: &str) -> Option<Detached> {
        let mut inner = self.inner.write().unwrap();
        let inner = &mut *inner;

        let container = inner.containers.remove(container_id)?;
        inner
            .ns_map
            .remove(&(container.pid_ns, container.mnt_ns));

        let key = (
            container.namespace_name.clone(),
            container.pod_group_name.clone(),
        );
        let mut group_dropped = false;
        if let Some(group) = inner.pod_groups.get_mut(&key) {
            group.containers.retain(|id| id != container_id);
            group.apparmor_profiles.remove(&container.container_name);
            group.selinux_profiles.remove(&container.container_name);
            // labels contributed only by the departed container must not
            // keep selecting policies for the survivors
            let mut labels = Vec::new();
            for id in &group.containers {
                if let Some(c) = inner.containers.get(id) {
                    for label in &c.labels {
                        if !labels.contains(label) {
                            labels.push(label.clone());
                        }
                    }
                }
            }
            group.labels = labels;
            group.identities = derive_identities(
                &group.namespace_name,
                &group.pod_group_name,
                &group.labels,
            );
            group_dropped = group.containers.is_empty() && group.policy_names.is_empty();
        }
        if group_dropped {
            inner.pod_groups.remove(&key);
        }

        Some(Detached {
            namespace_name: container.namespace_name,
            pod_group_name: container.pod_group_name,
            group_dropped,
        })
    }

    /// `(namespace, pod_group, container_name)` for a container id. Unknown
    /// ids return empty strings: the caller treats those events as
    /// host-origin or pre-attachment.
    pub fn lookup_names(&self, container_id: &str) -> (String, String, String) {
        let inner = self.inner.read().unwrap();
        match inner.containers.get(container_id) {
            Some(c) => (
                c.namespace_name.clone(),
                c.pod_group_name.clone(),
                c.container_name.clone(),
            ),
            None => (String::new(), String::new(), String::new()),
        }
    }

    pub fn lookup_pod_group(&self, namespace: &str, pod_group: &str) -> Option<PodGroup> {
        let inner = self.inner.read().unwrap();
        inner
            .pod_groups
            .get(&(namespace.to_string(), pod_group.to_string()))
            .cloned()
    }

    /// Attribution lookup from kernel namespace ids.
    pub fn container_by_ns(&self, pid_ns: u32, mnt_ns: u32) -> Option<String> {
        let inner = self.inner.read().unwrap();
        inner.ns_map.get(&(pid_ns, mnt_ns)).cloned()
    }

    pub fn group_identities(&self, namespace: &str, pod_group: &str) -> Option<Vec<String>> {
        let inner = self.inner.read().unwrap();
        inner
            .pod_groups
            .get(&(namespace.to_string(), pod_group.to_string()))
            .map(|g| g.identities.clone())
    }

    pub fn group_keys(&self) -> Vec<(String, String)> {
        let inner = self.inner.read().unwrap();
        inner.pod_groups.keys().cloned().collect()
    }

    /// Record which policies are bound to a group (written by the policy
    /// index glue when bindings change).
    pub fn set_group_policies(&self, namespace: &str, pod_group: &str, policy_names: Vec<String>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(group) = inner
            .pod_groups
            .get_mut(&(namespace.to_string(), pod_group.to_string()))
        {
            group.policy_names = policy_names;
        }
    }
}
