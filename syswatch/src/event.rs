use std::ffi::CStr;
use std::mem::size_of;
use std::net::Ipv6Addr;

use log::warn;
use syswatch_common::{
    ConnectData, EventHeader, ExecArgKey, ExecData, SockConnectData, EXEC_ARG_SIZE,
};

#[derive(Debug, Clone)]
pub enum Event {
    Fork(ForkEvent),
    Exec(ExecEvent),
    Connect(ConnectEvent),
}

#[derive(Debug, Clone)]
pub struct ForkEvent {
    pub time: u64,
    pub pid: u32,
    pub ppid: u32,
}

#[derive(Debug, Clone)]
pub struct ExecEvent {
    pub time: u64,
    pub pid: u32,
    pub ppid: u32,
    pub filename: String,
    pub argc: u8,
}

#[derive(Debug, Clone)]
pub struct ConnectEvent {
    pub time: u64,
    pub pid: u32,
    pub ppid: u32,
    pub addr: Ipv6Addr,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SockConnectEvent {
    pub pid: u32,
    pub addr: Ipv6Addr,
    pub port: u16,
}

/// Decodes one record from the combined ring. The tag byte is
/// validated before the buffer is reinterpreted; anything truncated or
/// unknown is dropped with a warning, since loss is an expected
/// condition for consumers.
pub fn extract_event(raw: &[u8]) -> Option<Event> {
    if raw.len() < size_of::<EventHeader>() {
        warn!("received truncated event ({} bytes)", raw.len());
        return None;
    }

    match raw[16] {
        0 => {
            let header = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const EventHeader) };
            Some(Event::Fork(ForkEvent {
                time: header.time,
                pid: header.pid,
                ppid: header.ppid,
            }))
        }
        1 => {
            if raw.len() < size_of::<ExecData>() {
                warn!("received truncated exec record ({} bytes)", raw.len());
                return None;
            }
            let data = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ExecData) };
            Some(Event::Exec(ExecEvent {
                time: data.header.time,
                pid: data.header.pid,
                ppid: data.header.ppid,
                filename: cstr_lossy(&data.filename),
                argc: data.argc,
            }))
        }
        2 => {
            if raw.len() < size_of::<ConnectData>() {
                warn!("received truncated connect record ({} bytes)", raw.len());
                return None;
            }
            let data = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const ConnectData) };
            Some(Event::Connect(ConnectEvent {
                time: data.header.time,
                pid: data.header.pid,
                ppid: data.header.ppid,
                addr: Ipv6Addr::from(data.daddr),
                port: data.dport,
            }))
        }
        tag => {
            warn!("unknown event tag {tag:#04x}");
            None
        }
    }
}

/// Decodes one standalone record from the network-only ring.
pub fn extract_sock_connect(raw: &[u8]) -> Option<SockConnectEvent> {
    if raw.len() < size_of::<SockConnectData>() {
        warn!("received truncated connect record ({} bytes)", raw.len());
        return None;
    }
    let data = unsafe { std::ptr::read_unaligned(raw.as_ptr() as *const SockConnectData) };
    Some(SockConnectEvent {
        pid: data.pid,
        addr: Ipv6Addr::from(data.daddr),
        port: data.dport,
    })
}

/// Rebuilds argv for one exec record from the spill store. `take` must
/// also delete the entry it returns, otherwise entries pile up until
/// the map rejects new inserts.
///
/// `argc` is an upper bound, not a guarantee: the kernel stops
/// inserting at the first failure, so the first missing index ends the
/// reassembly. An empty argument is still a present entry (its value
/// starts with NUL) and is kept as an empty string.
pub fn reassemble_args<F>(time: u64, pid: u32, argc: u8, mut take: F) -> Vec<String>
where
    F: FnMut(&ExecArgKey) -> Option<[u8; EXEC_ARG_SIZE]>,
{
    let mut args = Vec::with_capacity(argc as usize);
    for index in 0..argc {
        let key = ExecArgKey { time, pid, index };
        match take(&key) {
            Some(value) => args.push(cstr_lossy(&value)),
            None => break,
        }
    }
    args
}

fn cstr_lossy(bytes: &[u8]) -> String {
    CStr::from_bytes_until_nul(bytes)
        .ok()
        .and_then(|cstr| cstr.to_str().ok())
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use syswatch_common::{ipv4_mapped, EventKind, MAX_ARGS};

    fn as_bytes<T>(value: &T) -> &[u8] {
        unsafe { std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()) }
    }

    fn header(kind: EventKind) -> EventHeader {
        EventHeader {
            time: 111,
            pid: 42,
            ppid: 7,
            kind,
        }
    }

    fn exec_data(argc: u8, filename: &[u8]) -> ExecData {
        let mut data = ExecData {
            header: header(EventKind::Exec),
            argc,
            filename: [0; syswatch_common::EXEC_FILENAME_SIZE],
        };
        data.filename[..filename.len()].copy_from_slice(filename);
        data
    }

    fn spilled(value: &[u8]) -> [u8; EXEC_ARG_SIZE] {
        let mut out = [0u8; EXEC_ARG_SIZE];
        out[..value.len()].copy_from_slice(value);
        out
    }

    #[test]
    fn decodes_fork_header() {
        let data = header(EventKind::Fork);
        match extract_event(as_bytes(&data)) {
            Some(Event::Fork(event)) => {
                assert_eq!(event.time, 111);
                assert_eq!(event.pid, 42);
                assert_eq!(event.ppid, 7);
            }
            other => panic!("expected fork event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_exec_record() {
        let data = exec_data(2, b"/usr/bin/cat\0");
        match extract_event(as_bytes(&data)) {
            Some(Event::Exec(event)) => {
                assert_eq!(event.filename, "/usr/bin/cat");
                assert_eq!(event.argc, 2);
                assert_eq!(event.ppid, 7);
            }
            other => panic!("expected exec event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_connect_record() {
        // connect to 93.184.216.34:443
        let data = ConnectData {
            header: header(EventKind::Connect),
            daddr: ipv4_mapped(u32::from_be_bytes([93, 184, 216, 34])),
            dport: 443,
        };
        match extract_event(as_bytes(&data)) {
            Some(Event::Connect(event)) => {
                assert_eq!(
                    event.addr.to_ipv4_mapped(),
                    Some(Ipv4Addr::new(93, 184, 216, 34))
                );
                assert_eq!(event.port, 443);
            }
            other => panic!("expected connect event, got {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_buffers() {
        assert!(extract_event(&[0u8; 16]).is_none());
        // Valid header length but an exec tag without the exec payload.
        let mut short = [0u8; 17];
        short[16] = 1;
        assert!(extract_event(&short).is_none());
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut raw = [0u8; 17];
        raw[16] = 9;
        assert!(extract_event(&raw).is_none());
    }

    #[test]
    fn decodes_standalone_connect_record() {
        let data = SockConnectData {
            pid: 99,
            daddr: ipv4_mapped(u32::from_be_bytes([10, 0, 0, 1])),
            dport: 8080,
        };
        let event = extract_sock_connect(as_bytes(&data)).unwrap();
        assert_eq!(event.pid, 99);
        assert_eq!(event.addr.to_ipv4_mapped(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(event.port, 8080);
        assert!(extract_sock_connect(&[0u8; 21]).is_none());
    }

    #[test]
    fn reassembles_zero_args() {
        let mut calls = 0;
        let args = reassemble_args(1, 2, 0, |_| {
            calls += 1;
            None
        });
        assert!(args.is_empty());
        assert_eq!(calls, 0);
    }

    #[test]
    fn reassembly_stops_at_first_missing_entry() {
        // A spill store that filled up after three inserts: argc still
        // says five, entries exist only for indices 0..3.
        let mut store = HashMap::new();
        for index in 0..3u8 {
            store.insert(index, spilled(format!("arg{index}").as_bytes()));
        }
        let args = reassemble_args(1, 2, 5, |key| store.remove(&key.index));
        assert_eq!(args, vec!["arg0", "arg1", "arg2"]);
        assert!(store.is_empty());
    }

    #[test]
    fn reassembly_fetches_exactly_argc_keys() {
        let mut fetched = Vec::new();
        let args = reassemble_args(1, 2, MAX_ARGS as u8, |key| {
            fetched.push(key.index);
            Some(spilled(b"x\0"))
        });
        assert_eq!(args.len(), MAX_ARGS);
        assert_eq!(fetched.len(), MAX_ARGS);
        assert_eq!(*fetched.last().unwrap(), MAX_ARGS as u8 - 1);
    }

    #[test]
    fn empty_argument_stays_present() {
        let mut store = HashMap::new();
        store.insert(0u8, spilled(b"cat\0"));
        store.insert(1u8, spilled(b"\0"));
        store.insert(2u8, spilled(b"file\0"));
        let args = reassemble_args(1, 2, 3, |key| store.remove(&key.index));
        assert_eq!(args, vec!["cat", "", "file"]);
    }
}
