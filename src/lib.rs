//! Warden is a runtime container-security telemetry agent. It runs
//! privileged on every node, observes security-relevant kernel events from
//! containers and from the host, correlates them with the container registry
//! and the declarative security policies bound to each container, and serves
//! the resulting classified log stream over gRPC.
//!
//! The heavy lifting lives in [`warden_core`] (pipeline, registry, policy
//! engine) and [`warden_api`] (streaming RPC surface); this crate wires them
//! into the `wardend` daemon.

pub mod cli;
pub mod daemon;

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: log::Level) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let default_level = log::Level::Info;
        let level = if override_log_level > default_level {
            override_log_level
        } else {
            default_level
        };
        env_logger::builder()
            .filter_level(level.to_level_filter())
            .init();
    }
}
