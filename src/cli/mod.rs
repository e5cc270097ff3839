use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone)]
#[clap(name = "wardend")]
#[clap(about = "Warden runtime container-security agent")]
pub struct WardenOpts {
    /// TCP port the gRPC log service listens on
    #[clap(long, default_value_t = 32767)]
    pub grpc_port: u16,

    /// Local log sink: "stdout", "none" or a file path
    #[clap(long, default_value = "stdout")]
    pub log_path: String,

    /// Cluster name stamped into outgoing records
    #[clap(long, default_value = "")]
    pub cluster: String,

    /// Match events against host (node-level) security policies
    #[clap(long)]
    pub enable_host_policy: bool,

    /// Suppress open-family EACCES logs; auditd reports those denials
    #[clap(long)]
    pub enable_auditd: bool,

    /// Pass many times for a more verbose output. `-v` adds debug logs,
    /// `-vv` enables trace logging
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl WardenOpts {
    pub fn log_level(&self) -> log::Level {
        match self.verbose {
            0 => log::Level::Info,
            1 => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }
}

pub fn parse_from_args() -> WardenOpts {
    WardenOpts::parse()
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = std::env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = WardenOpts::parse_from(["wardend"]);
        assert_eq!(opts.grpc_port, 32767);
        assert_eq!(opts.log_path, "stdout");
        assert!(!opts.enable_host_policy);
        assert!(!opts.enable_auditd);
        assert_eq!(opts.log_level(), log::Level::Info);
    }

    #[test]
    fn flags_and_verbosity() {
        let opts = WardenOpts::parse_from([
            "wardend",
            "--grpc-port",
            "9000",
            "--log-path",
            "none",
            "--enable-host-policy",
            "--enable-auditd",
            "-vv",
        ]);
        assert_eq!(opts.grpc_port, 9000);
        assert_eq!(opts.log_path, "none");
        assert!(opts.enable_host_policy);
        assert!(opts.enable_auditd);
        assert_eq!(opts.log_level(), log::Level::Trace);
    }
}
