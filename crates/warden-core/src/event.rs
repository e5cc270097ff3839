use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
};

use crate::kernel;

/// A decoded kernel event together with the process context it was raised in.
///
/// `args` is a tagged variant keyed by the originating event id, so the shape
/// of the arguments is enforced at the type level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallEvent {
    /// Nanoseconds since boot, as reported by the probe.
    pub timestamp: u64,
    pub host_pid: u32,
    pub ppid: u32,
    pub pid: u32,
    pub uid: u32,
    pub pid_ns: u32,
    pub mnt_ns: u32,
    /// Short command name, already trimmed at the first NUL.
    pub comm: String,
    pub retval: i64,
    pub args: EventArgs,
}

impl SyscallEvent {
    pub fn is_exec(&self) -> bool {
        matches!(
            self.args,
            EventArgs::Execve { .. } | EventArgs::Execveat { .. }
        )
    }
}

/// Per-event-id argument tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventArgs {
    Open {
        path: String,
        flags: OpenFlags,
    },
    Openat {
        fd: i32,
        path: String,
        flags: OpenFlags,
    },
    Close {
        fd: i32,
    },
    Socket {
        domain: i32,
        ty: i32,
        protocol: i32,
    },
    Connect {
        fd: i32,
        addr: SockAddr,
    },
    Accept {
        fd: i32,
        addr: SockAddr,
    },
    Bind {
        fd: i32,
        addr: SockAddr,
    },
    Listen {
        fd: i32,
    },
    Execve {
        path: String,
        argv: Vec<String>,
    },
    Execveat {
        path: String,
        argv: Vec<String>,
    },
    /// The event context itself describes the new child process.
    Fork,
    Exit,
    Capable {
        capability: i32,
    },
}

impl EventArgs {
    /// Lowercase syscall name used in `resource`/`data` strings.
    pub fn syscall_name(&self) -> &'static str {
        match self {
            EventArgs::Open { .. } => "open",
            EventArgs::Openat { .. } => "openat",
            EventArgs::Close { .. } => "close",
            EventArgs::Socket { .. } => "socket",
            EventArgs::Connect { .. } => "connect",
            EventArgs::Accept { .. } => "accept",
            EventArgs::Bind { .. } => "bind",
            EventArgs::Listen { .. } => "listen",
            EventArgs::Execve { .. } => "execve",
            EventArgs::Execveat { .. } => "execveat",
            EventArgs::Fork => "fork",
            EventArgs::Exit => "exit",
            EventArgs::Capable { .. } => "capable",
        }
    }
}

/// Open(2) flag bitmask with the symbolic rendering used in log `data`
/// fields: access mode first, other flags or'ed in, joined by `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(i32);

impl OpenFlags {
    const ACC_MODE_FLAGS: [(&'static str, i32); 3] = [
        ("O_RDONLY", kernel::file::flags::O_RDONLY),
        ("O_WRONLY", kernel::file::flags::O_WRONLY),
        ("O_RDWR", kernel::file::flags::O_RDWR),
    ];

    const OTHER_FLAGS: [(&'static str, i32); 8] = [
        ("O_CREAT", kernel::file::flags::O_CREAT),
        ("O_EXCL", kernel::file::flags::O_EXCL),
        ("O_NOCTTY", kernel::file::flags::O_NOCTTY),
        ("O_TRUNC", kernel::file::flags::O_TRUNC),
        ("O_APPEND", kernel::file::flags::O_APPEND),
        ("O_NONBLOCK", kernel::file::flags::O_NONBLOCK),
        ("O_DIRECTORY", kernel::file::flags::O_DIRECTORY),
        ("O_CLOEXEC", kernel::file::flags::O_CLOEXEC),
    ];

    pub fn from_raw(flags: i32) -> Self {
        Self(flags)
    }

    /// True when the flag set requests any write access.
    pub fn is_write(&self) -> bool {
        let mode = self.0 & kernel::file::flags::O_ACCMODE;
        mode == kernel::file::flags::O_WRONLY
            || mode == kernel::file::flags::O_RDWR
            || (self.0
                & (kernel::file::flags::O_CREAT
                    | kernel::file::flags::O_TRUNC
                    | kernel::file::flags::O_APPEND))
                != 0
    }
}

impl From<OpenFlags> for i32 {
    fn from(flags: OpenFlags) -> Self {
        flags.0
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flag_names = Vec::new();

        let mode = self.0 & kernel::file::flags::O_ACCMODE;
        for (name, flag) in OpenFlags::ACC_MODE_FLAGS {
            if mode == flag {
                flag_names.push(name);
                break; // Only one is possible
            }
        }

        for (name, flag) in OpenFlags::OTHER_FLAGS {
            if (self.0 & flag) > 0 {
                flag_names.push(name);
            }
        }

        write!(f, "{}", flag_names.join("|"))
    }
}

/// Decoded socket address. Rendering order is fixed (`sa_family`, address,
/// port) so the produced resource strings are deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    V4 { addr: Ipv4Addr, port: u16 },
    V6 { addr: Ipv6Addr, port: u16 },
    Unix { path: String },
    Other { family: u16 },
}

impl SockAddr {
    pub fn family_name(&self) -> String {
        match self {
            SockAddr::V4 { .. } => "AF_INET".to_string(),
            SockAddr::V6 { .. } => "AF_INET6".to_string(),
            SockAddr::Unix { .. } => "AF_UNIX".to_string(),
            SockAddr::Other { family } => kernel::socket::domain_name(i32::from(*family)),
        }
    }

    /// Key/value pairs appended to network resource strings.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        match self {
            SockAddr::V4 { addr, port } => vec![
                ("sa_family", self.family_name()),
                ("sin_addr", addr.to_string()),
                ("sin_port", port.to_string()),
            ],
            SockAddr::V6 { addr, port } => vec![
                ("sa_family", self.family_name()),
                ("sin6_addr", addr.to_string()),
                ("sin6_port", port.to_string()),
            ],
            SockAddr::Unix { path } => vec![
                ("sa_family", self.family_name()),
                ("sun_path", path.clone()),
            ],
            SockAddr::Other { .. } => vec![("sa_family", self.family_name())],
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.pairs() {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::file::flags;

    #[test]
    fn open_flags_rendering() {
        assert_eq!(OpenFlags::from_raw(flags::O_RDONLY).to_string(), "O_RDONLY");
        assert_eq!(
            OpenFlags::from_raw(flags::O_WRONLY | flags::O_CREAT | flags::O_TRUNC).to_string(),
            "O_WRONLY|O_CREAT|O_TRUNC"
        );
        assert_eq!(
            OpenFlags::from_raw(flags::O_RDONLY | flags::O_CLOEXEC).to_string(),
            "O_RDONLY|O_CLOEXEC"
        );
    }

    #[test]
    fn open_flags_write_detection() {
        assert!(!OpenFlags::from_raw(flags::O_RDONLY).is_write());
        assert!(!OpenFlags::from_raw(flags::O_RDONLY | flags::O_CLOEXEC).is_write());
        assert!(OpenFlags::from_raw(flags::O_WRONLY).is_write());
        assert!(OpenFlags::from_raw(flags::O_RDWR).is_write());
        assert!(OpenFlags::from_raw(flags::O_RDONLY | flags::O_APPEND).is_write());
    }

    #[test]
    fn sockaddr_rendering_is_ordered() {
        let addr = SockAddr::V4 {
            addr: Ipv4Addr::new(10, 2, 0, 1),
            port: 8080,
        };
        assert_eq!(
            addr.to_string(),
            "sa_family=AF_INET sin_addr=10.2.0.1 sin_port=8080"
        );

        let unix = SockAddr::Unix {
            path: "/run/warden.sock".to_string(),
        };
        assert_eq!(unix.to_string(), "sa_family=AF_UNIX sun_path=/run/warden.sock");
    }
}
