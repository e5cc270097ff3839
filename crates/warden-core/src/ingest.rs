//! Decoder for the fixed-layout records produced by the kernel probe.
//!
//! Records are little-endian: a fixed context header followed by a
//! per-event-id argument tail. String arguments are length-prefixed (`u16`),
//! socket addresses carry their family (`u16`) and family-specific bytes.

use std::{
    net::{Ipv4Addr, Ipv6Addr},
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Buf;
use thiserror::Error;

use crate::{
    bus::Bus,
    event::{EventArgs, OpenFlags, SockAddr, SyscallEvent},
    kernel::event_id,
};

/// Capacity of the context channel between the ingestor and the log builder.
/// Overflow drops the oldest events; drops are surfaced by the consumer.
pub const EVENT_CHANNEL_CAPACITY: usize = 2048;

const COMM_LEN: usize = 16;
/// Context header: ts + six u32 context fields + comm + event id + retval.
const HEADER_LEN: usize = 8 + 6 * 4 + COMM_LEN + 4 + 8;

const AF_UNIX: u16 = 1;
const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record truncated: wanted {wanted} more bytes while decoding {field}")]
    Truncated { field: &'static str, wanted: usize },
    #[error("unknown event id {0}")]
    UnknownEventId(u32),
    #[error("string argument is not valid utf-8")]
    BadString(#[from] std::string::FromUtf8Error),
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn ensure(&self, field: &'static str, len: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < len {
            Err(DecodeError::Truncated {
                field,
                wanted: len - self.buf.remaining(),
            })
        } else {
            Ok(())
        }
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, DecodeError> {
        self.ensure(field, 2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, DecodeError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, DecodeError> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_i64_le())
    }

    fn bytes(&mut self, field: &'static str, len: usize) -> Result<Vec<u8>, DecodeError> {
        self.ensure(field, len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Length-prefixed UTF-8 string.
    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u16(field)? as usize;
        let raw = self.bytes(field, len)?;
        Ok(String::from_utf8(raw)?)
    }

    fn sockaddr(&mut self) -> Result<SockAddr, DecodeError> {
        let family = self.u16("sockaddr family")?;
        match family {
            AF_INET => {
                let raw = self.bytes("sockaddr v4", 4)?;
                let addr = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
                let port = self.u16("sockaddr port")?;
                Ok(SockAddr::V4 { addr, port })
            }
            AF_INET6 => {
                let raw = self.bytes("sockaddr v6", 16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&raw);
                let addr = Ipv6Addr::from(octets);
                let port = self.u16("sockaddr port")?;
                Ok(SockAddr::V6 { addr, port })
            }
            AF_UNIX => {
                let path = self.string("sockaddr path")?;
                Ok(SockAddr::Unix { path })
            }
            other => Ok(SockAddr::Other { family: other }),
        }
    }

    fn string_array(&mut self, field: &'static str) -> Result<Vec<String>, DecodeError> {
        let count = self.u16(field)? as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.string(field)?);
        }
        Ok(out)
    }
}

/// Decode one raw record into a [`SyscallEvent`], enforcing the per-event-id
/// argument shape.
pub fn decode(record: &[u8]) -> Result<SyscallEvent, DecodeError> {
    let mut cur = Cursor { buf: record };
    cur.ensure("context header", HEADER_LEN)?;

    let timestamp = cur.u64("timestamp")?;
    let host_pid = cur.u32("host_pid")?;
    let ppid = cur.u32("ppid")?;
    let pid = cur.u32("pid")?;
    let uid = cur.u32("uid")?;
    let pid_ns = cur.u32("pid_ns")?;
    let mnt_ns = cur.u32("mnt_ns")?;
    let comm_raw = cur.bytes("comm", COMM_LEN)?;
    let nul = comm_raw
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(COMM_LEN);
    let comm = String::from_utf8_lossy(&comm_raw[..nul]).into_owned();
    let id = cur.u32("event_id")?;
    let retval = cur.i64("retval")?;

    let args = match id {
        event_id::SYS_OPEN => EventArgs::Open {
            path: cur.string("open path")?,
            flags: OpenFlags::from_raw(cur.i32("open flags")?),
        },
        event_id::SYS_OPENAT => EventArgs::Openat {
            fd: cur.i32("openat fd")?,
            path: cur.string("openat path")?,
            flags: OpenFlags::from_raw(cur.i32("openat flags")?),
        },
        event_id::SYS_CLOSE => EventArgs::Close {
            fd: cur.i32("close fd")?,
        },
        event_id::SYS_SOCKET => EventArgs::Socket {
            domain: cur.i32("socket domain")?,
            ty: cur.i32("socket type")?,
            protocol: cur.i32("socket protocol")?,
        },
        event_id::SYS_CONNECT => EventArgs::Connect {
            fd: cur.i32("connect fd")?,
            addr: cur.sockaddr()?,
        },
        event_id::SYS_ACCEPT => EventArgs::Accept {
            fd: cur.i32("accept fd")?,
            addr: cur.sockaddr()?,
        },
        event_id::SYS_BIND => EventArgs::Bind {
            fd: cur.i32("bind fd")?,
            addr: cur.sockaddr()?,
        },
        event_id::SYS_LISTEN => EventArgs::Listen {
            fd: cur.i32("listen fd")?,
        },
        event_id::SYS_EXECVE => EventArgs::Execve {
            path: cur.string("execve path")?,
            argv: cur.string_array("execve argv")?,
        },
        event_id::SYS_EXECVEAT => EventArgs::Execveat {
            path: cur.string("execveat path")?,
            argv: cur.string_array("execveat argv")?,
        },
        event_id::DO_FORK => EventArgs::Fork,
        event_id::DO_EXIT => EventArgs::Exit,
        event_id::CAP_CAPABLE => EventArgs::Capable {
            capability: cur.i32("capability")?,
        },
        other => return Err(DecodeError::UnknownEventId(other)),
    };

    Ok(SyscallEvent {
        timestamp,
        host_pid,
        ppid,
        pid,
        uid,
        pid_ns,
        mnt_ns,
        comm,
        retval,
        args,
    })
}

/// Converts raw probe records into [`SyscallEvent`]s on the context channel.
/// Malformed records are counted and dropped; the pipeline never aborts on
/// them.
pub struct EventIngestor {
    bus: Bus<SyscallEvent>,
    malformed: AtomicU64,
}

impl EventIngestor {
    pub fn new(bus: Bus<SyscallEvent>) -> Self {
        Self {
            bus,
            malformed: AtomicU64::new(0),
        }
    }

    pub fn ingest(&self, record: &[u8]) {
        match decode(record) {
            Ok(event) => self.bus.send(event),
            Err(err) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                log::debug!("dropping malformed kernel record: {err}");
            }
        }
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use bytes::BufMut;

    /// Build a raw record for tests: context header + caller-provided tail.
    pub fn record(
        event_id: u32,
        host_pid: u32,
        ppid: u32,
        pid: u32,
        uid: u32,
        pid_ns: u32,
        mnt_ns: u32,
        comm: &str,
        retval: i64,
        tail: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u64_le(123_456_789);
        buf.put_u32_le(host_pid);
        buf.put_u32_le(ppid);
        buf.put_u32_le(pid);
        buf.put_u32_le(uid);
        buf.put_u32_le(pid_ns);
        buf.put_u32_le(mnt_ns);
        let mut comm_bytes = [0u8; 16];
        comm_bytes[..comm.len()].copy_from_slice(comm.as_bytes());
        buf.put_slice(&comm_bytes);
        buf.put_u32_le(event_id);
        buf.put_i64_le(retval);
        buf.put_slice(tail);
        buf
    }

    pub fn put_str(buf: &mut Vec<u8>, s: &str) {
        buf.put_u16_le(s.len() as u16);
        buf.put_slice(s.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::{testutil::*, *};
    use crate::kernel::file::flags;

    #[test]
    fn decodes_openat() {
        let mut tail = Vec::new();
        tail.put_i32_le(-100);
        put_str(&mut tail, "/etc/passwd");
        tail.put_i32_le(flags::O_RDONLY);

        let raw = record(
            event_id::SYS_OPENAT,
            42,
            1,
            7,
            0,
            400,
            500,
            "nginx",
            0,
            &tail,
        );
        let event = decode(&raw).unwrap();
        assert_eq!(event.host_pid, 42);
        assert_eq!(event.comm, "nginx");
        assert_eq!(
            event.args,
            EventArgs::Openat {
                fd: -100,
                path: "/etc/passwd".to_string(),
                flags: OpenFlags::from_raw(flags::O_RDONLY),
            }
        );
    }

    #[test]
    fn decodes_connect_with_v4_sockaddr() {
        let mut tail = Vec::new();
        tail.put_i32_le(3);
        tail.put_u16_le(AF_INET);
        tail.put_slice(&[10, 2, 0, 1]);
        tail.put_u16_le(443);

        let raw = record(event_id::SYS_CONNECT, 42, 1, 7, 0, 400, 500, "curl", 0, &tail);
        let event = decode(&raw).unwrap();
        match event.args {
            EventArgs::Connect { fd, addr } => {
                assert_eq!(fd, 3);
                assert_eq!(
                    addr.to_string(),
                    "sa_family=AF_INET sin_addr=10.2.0.1 sin_port=443"
                );
            }
            other => panic!("unexpected args {other:?}"),
        }
    }

    #[test]
    fn decodes_execve_argv() {
        let mut tail = Vec::new();
        put_str(&mut tail, "/bin/sh");
        tail.put_u16_le(2);
        put_str(&mut tail, "-c");
        put_str(&mut tail, "id");

        let raw = record(event_id::SYS_EXECVE, 99, 12, 99, 0, 400, 500, "sh", 0, &tail);
        let event = decode(&raw).unwrap();
        assert_eq!(
            event.args,
            EventArgs::Execve {
                path: "/bin/sh".to_string(),
                argv: vec!["-c".to_string(), "id".to_string()],
            }
        );
        assert!(event.is_exec());
    }

    #[test]
    fn truncated_and_unknown_records_are_rejected() {
        let raw = record(event_id::SYS_CLOSE, 1, 1, 1, 0, 0, 0, "x", 0, &[]);
        assert!(matches!(
            decode(&raw),
            Err(DecodeError::Truncated { field: "close fd", .. })
        ));

        let raw = record(9999, 1, 1, 1, 0, 0, 0, "x", 0, &[]);
        assert!(matches!(decode(&raw), Err(DecodeError::UnknownEventId(9999))));
    }

    #[tokio::test]
    async fn ingestor_counts_malformed_records() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        let ingestor = EventIngestor::new(bus);

        ingestor.ingest(&[1, 2, 3]);
        assert_eq!(ingestor.malformed_count(), 1);

        let mut tail = Vec::new();
        tail.put_i32_le(4);
        ingestor.ingest(&record(event_id::SYS_CLOSE, 1, 1, 1, 0, 0, 0, "x", 0, &tail));
        assert_eq!(ingestor.malformed_count(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.args, EventArgs::Close { fd: 4 });
    }
}
