#![no_std]
#![no_main]

//! Standalone network-only object: IPv4 stream connect capture with an
//! untagged record and a smaller ring, for deployments that do not
//! trace the process lifecycle.

use aya_ebpf::helpers::bpf_get_current_pid_tgid;
use aya_ebpf::{
    macros::{cgroup_sock_addr, map},
    maps::ring_buf::RingBuf,
    programs::SockAddrContext,
};
use syswatch_common::{CONNECTIONS_RING_BYTES, SockConnectData, ipv4_mapped};

const AF_INET: u32 = 2;
const SOCK_STREAM: u32 = 1;

#[map(name = "CONNECTIONS")]
static CONNECTIONS: RingBuf = RingBuf::with_byte_size(CONNECTIONS_RING_BYTES, 0);

#[cgroup_sock_addr(connect4)]
pub fn sock_connect4(ctx: SockAddrContext) -> i32 {
    let sock_addr = unsafe { &*ctx.sock_addr };
    if sock_addr.type_ != SOCK_STREAM || sock_addr.family != AF_INET {
        return 1;
    }

    if let Some(mut buf) = CONNECTIONS.reserve::<SockConnectData>(0) {
        match unsafe { buf.as_mut_ptr().as_mut() } {
            Some(record) => {
                record.pid = bpf_get_current_pid_tgid() as u32;
                record.daddr = ipv4_mapped(u32::from_be(sock_addr.user_ip4));
                record.dport = u16::from_be(sock_addr.user_port as u16);
                buf.submit(0);
            }
            None => buf.discard(0),
        }
    }

    1
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
