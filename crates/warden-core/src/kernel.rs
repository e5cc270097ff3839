//! Kernel-facing constants shared by the decoder, the log builder and the
//! policy matcher.

/// Event identifiers carried in raw kernel records. Syscall-backed events use
/// the x86_64 syscall number; tracepoint-backed events use ids above the
/// syscall range.
pub mod event_id {
    pub const SYS_OPEN: u32 = 2;
    pub const SYS_CLOSE: u32 = 3;
    pub const SYS_SOCKET: u32 = 41;
    pub const SYS_CONNECT: u32 = 42;
    pub const SYS_ACCEPT: u32 = 43;
    pub const SYS_BIND: u32 = 49;
    pub const SYS_LISTEN: u32 = 50;
    pub const SYS_EXECVE: u32 = 59;
    pub const SYS_OPENAT: u32 = 257;
    pub const SYS_EXECVEAT: u32 = 322;

    pub const DO_FORK: u32 = 350;
    pub const DO_EXIT: u32 = 351;
    pub const CAP_CAPABLE: u32 = 352;
}

pub mod file {

    /// O_* macros for fcntl/open are architecture-specific
    pub mod flags {
        pub const O_ACCMODE: i32 = 3;
        pub const O_RDONLY: i32 = 0;
        pub const O_WRONLY: i32 = 1;
        pub const O_RDWR: i32 = 2;
        pub const O_CREAT: i32 = 0x40;
        pub const O_EXCL: i32 = 0x80;
        pub const O_NOCTTY: i32 = 0x100;
        pub const O_TRUNC: i32 = 0x200;
        pub const O_APPEND: i32 = 0x400;
        pub const O_NONBLOCK: i32 = 0x800;
        pub const O_DIRECTORY: i32 = 0x10000;
        pub const O_CLOEXEC: i32 = 0x80000;
    }
}

pub mod socket {
    const DOMAINS: [(&str, i32); 8] = [
        ("AF_UNSPEC", 0),
        ("AF_UNIX", 1),
        ("AF_INET", 2),
        ("AF_NETLINK", 16),
        ("AF_PACKET", 17),
        ("AF_INET6", 10),
        ("AF_BLUETOOTH", 31),
        ("AF_VSOCK", 40),
    ];

    const TYPES: [(&str, i32); 7] = [
        ("SOCK_STREAM", 1),
        ("SOCK_DGRAM", 2),
        ("SOCK_RAW", 3),
        ("SOCK_RDM", 4),
        ("SOCK_SEQPACKET", 5),
        ("SOCK_DCCP", 6),
        ("SOCK_PACKET", 10),
    ];

    // SOCK_NONBLOCK / SOCK_CLOEXEC are or'ed into the type argument.
    const TYPE_MASK: i32 = 0xf;

    pub fn domain_name(domain: i32) -> String {
        DOMAINS
            .iter()
            .find(|(_, v)| *v == domain)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| domain.to_string())
    }

    pub fn type_name(ty: i32) -> String {
        TYPES
            .iter()
            .find(|(_, v)| *v == ty & TYPE_MASK)
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| ty.to_string())
    }
}

pub mod capability {
    const NAMES: [&str; 41] = [
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_DAC_READ_SEARCH",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_SETGID",
        "CAP_SETUID",
        "CAP_SETPCAP",
        "CAP_LINUX_IMMUTABLE",
        "CAP_NET_BIND_SERVICE",
        "CAP_NET_BROADCAST",
        "CAP_NET_ADMIN",
        "CAP_NET_RAW",
        "CAP_IPC_LOCK",
        "CAP_IPC_OWNER",
        "CAP_SYS_MODULE",
        "CAP_SYS_RAWIO",
        "CAP_SYS_CHROOT",
        "CAP_SYS_PTRACE",
        "CAP_SYS_PACCT",
        "CAP_SYS_ADMIN",
        "CAP_SYS_BOOT",
        "CAP_SYS_NICE",
        "CAP_SYS_RESOURCE",
        "CAP_SYS_TIME",
        "CAP_SYS_TTY_CONFIG",
        "CAP_MKNOD",
        "CAP_LEASE",
        "CAP_AUDIT_WRITE",
        "CAP_AUDIT_CONTROL",
        "CAP_SETFCAP",
        "CAP_MAC_OVERRIDE",
        "CAP_MAC_ADMIN",
        "CAP_SYSLOG",
        "CAP_WAKE_ALARM",
        "CAP_BLOCK_SUSPEND",
        "CAP_AUDIT_READ",
        "CAP_PERFMON",
        "CAP_BPF",
        "CAP_CHECKPOINT_RESTORE",
    ];

    pub fn name(cap: i32) -> String {
        usize::try_from(cap)
            .ok()
            .and_then(|idx| NAMES.get(idx))
            .map(|name| (*name).to_string())
            .unwrap_or_else(|| format!("CAP_{cap}"))
    }

    /// Canonical `CAP_*` spelling for a capability named in a policy document
    /// (`net_raw`, `NET_RAW` and `CAP_NET_RAW` all normalize the same way).
    pub fn canonical(raw: &str) -> String {
        let upper = raw.to_uppercase();
        if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        }
    }
}

pub mod errno {
    pub const EACCES: i64 = 13;

    const NAMES: [(&str, i64); 36] = [
        ("EPERM", 1),
        ("ENOENT", 2),
        ("ESRCH", 3),
        ("EINTR", 4),
        ("EIO", 5),
        ("ENXIO", 6),
        ("E2BIG", 7),
        ("ENOEXEC", 8),
        ("EBADF", 9),
        ("ECHILD", 10),
        ("EAGAIN", 11),
        ("ENOMEM", 12),
        ("EACCES", 13),
        ("EFAULT", 14),
        ("ENOTBLK", 15),
        ("EBUSY", 16),
        ("EEXIST", 17),
        ("EXDEV", 18),
        ("ENODEV", 19),
        ("ENOTDIR", 20),
        ("EISDIR", 21),
        ("EINVAL", 22),
        ("ENFILE", 23),
        ("EMFILE", 24),
        ("ENOTTY", 25),
        ("ETXTBSY", 26),
        ("EFBIG", 27),
        ("ENOSPC", 28),
        ("ESPIPE", 29),
        ("EROFS", 30),
        ("EMLINK", 31),
        ("EPIPE", 32),
        ("EDOM", 33),
        ("ERANGE", 34),
        ("ENAMETOOLONG", 36),
        ("ELOOP", 40),
    ];

    /// Symbolic name for a positive errno value.
    pub fn name(errno: i64) -> Option<&'static str> {
        NAMES
            .iter()
            .find(|(_, v)| *v == errno)
            .map(|(name, _)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_type_ignores_flag_bits() {
        // SOCK_STREAM | SOCK_CLOEXEC
        assert_eq!(socket::type_name(1 | 0x80000), "SOCK_STREAM");
        assert_eq!(socket::domain_name(2), "AF_INET");
        assert_eq!(socket::domain_name(12345), "12345");
    }

    #[test]
    fn capability_names() {
        assert_eq!(capability::name(13), "CAP_NET_RAW");
        assert_eq!(capability::name(999), "CAP_999");
        assert_eq!(capability::canonical("net_raw"), "CAP_NET_RAW");
        assert_eq!(capability::canonical("CAP_SYS_ADMIN"), "CAP_SYS_ADMIN");
    }

    #[test]
    fn errno_lookup() {
        assert_eq!(errno::name(13), Some("EACCES"));
        assert_eq!(errno::name(2), Some("ENOENT"));
        assert_eq!(errno::name(999), None);
    }
}
