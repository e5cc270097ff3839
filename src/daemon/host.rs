use std::net::UdpSocket;

/// Short hostname of the node.
pub fn host_name() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Best-effort external address: the local address a routed UDP socket would
/// use. No packet is sent.
pub fn external_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// (pid_ns, mnt_ns) inode ids of the daemon's own context. Events carrying
/// these ids and no container attribution are host-origin.
pub fn host_namespaces() -> Option<(u32, u32)> {
    Some((ns_inode("pid")?, ns_inode("mnt")?))
}

fn ns_inode(kind: &str) -> Option<u32> {
    let link = std::fs::read_link(format!("/proc/self/ns/{kind}")).ok()?;
    let link = link.to_string_lossy();
    // formatted as "pid:[4026531836]"
    let inode = link.split(['[', ']']).nth(1)?;
    inode.parse::<u64>().ok().map(|v| v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_is_not_empty() {
        assert!(!host_name().is_empty());
    }

    #[test]
    fn own_namespaces_resolve_on_linux() {
        let (pid_ns, mnt_ns) = host_namespaces().unwrap();
        assert_ne!(pid_ns, 0);
        assert_ne!(mnt_ns, 0);
    }
}
