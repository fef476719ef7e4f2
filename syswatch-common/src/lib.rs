#![cfg_attr(not(test), no_std)]

//! Wire contract between the syswatch eBPF programs and user space.
//!
//! Every struct here crosses the kernel/user boundary through a ring
//! buffer or a hash map, so all layouts are `repr(C, packed)` with
//! fixed-size fields. Consumers decode by exact field order and width;
//! there are no sequence numbers and no padding bytes.

/// Filename capacity in [`ExecData`], terminator included.
pub const EXEC_FILENAME_SIZE: usize = 1006;
/// Capacity of one spilled argument, terminator included.
pub const EXEC_ARG_SIZE: usize = 1024;
/// Compile-time bound on the argv scan. `argc` never exceeds this.
pub const MAX_ARGS: usize = 60;
/// Spill map capacity. Inserts are rejected (never evicted) once full.
pub const EXEC_ARG_MAP_CAPACITY: u32 = 512;

/// Ring size (bytes) for the combined fork/exec/connect object.
pub const EVENTS_RING_BYTES: u32 = 32768;
/// Ring size (bytes) for the standalone network-only object.
pub const CONNECTIONS_RING_BYTES: u32 = 4096;

/// Record tag carried in the last byte of [`EventHeader`].
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Fork = 0,
    Exec = 1,
    Connect = 2,
}

/// Common leading record for every event on the combined ring.
///
/// `time` comes from a monotonic clock; ties across CPUs are possible
/// and consumers merge streams by this field, not by arrival order.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct EventHeader {
    pub time: u64,
    pub pid: u32,
    pub ppid: u32,
    pub kind: EventKind,
}

/// Exec record. `argc` counts the spill entries actually inserted and
/// may undercount the true argv length on truncation or read failure.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct ExecData {
    pub header: EventHeader,
    pub argc: u8,
    pub filename: [u8; EXEC_FILENAME_SIZE],
}

/// Connect record. `daddr` is always IPv4-mapped-IPv6, `dport` host
/// order.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ConnectData {
    pub header: EventHeader,
    pub daddr: [u8; 16],
    pub dport: u16,
}

/// Standalone record used by the network-only object; no tagged header
/// since that ring carries exactly one record type.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct SockConnectData {
    pub pid: u32,
    pub daddr: [u8; 16],
    pub dport: u16,
}

/// Spill map key. (time, pid) is assumed to identify one exec
/// occurrence; `index` is the argv position.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct ExecArgKey {
    pub time: u64,
    pub pid: u32,
    pub index: u8,
}

/// task_struct field offsets resolved from kernel BTF at attach time
/// and written into the eBPF object's globals before load. Zero means
/// unresolved; the loader treats that as fatal, the probes fall back to
/// a zero ppid.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct TaskOffsets {
    pub real_parent: u32,
    pub pid: u32,
}

impl TaskOffsets {
    pub const fn zeroed() -> Self {
        Self {
            real_parent: 0,
            pid: 0,
        }
    }
}

/// Converts a host-byte-order IPv4 address to the canonical
/// IPv4-mapped-IPv6 form `::ffff:A.B.C.D`.
///
/// Defined only for raw IPv4 input. The `[u8; 16]` return type makes it
/// impossible to feed an already-mapped address back in.
pub fn ipv4_mapped(addr: u32) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[10] = 0xff;
    out[11] = 0xff;
    out[12..16].copy_from_slice(&addr.to_be_bytes());
    out
}

#[cfg(feature = "user")]
mod user {
    use super::*;

    unsafe impl aya::Pod for ExecArgKey {}
    unsafe impl aya::Pod for TaskOffsets {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layouts_are_packed() {
        assert_eq!(size_of::<EventHeader>(), 17);
        assert_eq!(size_of::<ExecData>(), 1024);
        assert_eq!(size_of::<ConnectData>(), 35);
        assert_eq!(size_of::<SockConnectData>(), 22);
        assert_eq!(size_of::<ExecArgKey>(), 13);
    }

    #[test]
    fn mapped_prefix_is_canonical() {
        for addr in [0u32, 1, 0x7f00_0001, 0xc0a8_0001, u32::MAX] {
            let mapped = ipv4_mapped(addr);
            assert_eq!(&mapped[..10], &[0u8; 10]);
            assert_eq!(&mapped[10..12], &[0xff, 0xff]);
        }
    }

    #[test]
    fn mapped_octets_round_trip() {
        let addr = u32::from_be_bytes([10, 20, 30, 40]);
        let mapped = ipv4_mapped(addr);
        assert_eq!(&mapped[12..16], &[10, 20, 30, 40]);
    }

    #[test]
    fn maps_example_dot_com() {
        // 93.184.216.34 in host order, as the connect hook derives it
        // from a big-endian `user_ip4`.
        let wire = u32::to_be(0x5db8_d822);
        let mapped = ipv4_mapped(u32::from_be(wire));
        let mut expected = [0u8; 16];
        expected[10] = 0xff;
        expected[11] = 0xff;
        expected[12..16].copy_from_slice(&[0x5d, 0xb8, 0xd8, 0x22]);
        assert_eq!(mapped, expected);
    }
}
