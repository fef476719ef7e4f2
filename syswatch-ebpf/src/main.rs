#![no_std]
#![no_main]

use aya_ebpf::bindings::BPF_NOEXIST;
use aya_ebpf::helpers::{
    bpf_get_current_pid_tgid, bpf_get_current_task, bpf_ktime_get_ns, bpf_probe_read_kernel,
    bpf_probe_read_user, bpf_probe_read_user_str_bytes,
};
use aya_ebpf::{
    macros::{cgroup_sock_addr, map, tracepoint},
    maps::{HashMap, PerCpuArray, ring_buf::RingBuf},
    programs::{SockAddrContext, TracePointContext},
};
use syswatch_common::{
    ConnectData, EventHeader, EventKind, ExecArgKey, ExecData, TaskOffsets, ipv4_mapped,
    EVENTS_RING_BYTES, EXEC_ARG_MAP_CAPACITY, EXEC_ARG_SIZE, MAX_ARGS,
};

const AF_INET: u32 = 2;
const SOCK_STREAM: u32 = 1;

#[map(name = "EVENTS")]
static EVENTS: RingBuf = RingBuf::with_byte_size(EVENTS_RING_BYTES, 0);

#[map(name = "EXEC_ARGS")]
static EXEC_ARGS: HashMap<ExecArgKey, [u8; EXEC_ARG_SIZE]> =
    HashMap::with_max_entries(EXEC_ARG_MAP_CAPACITY, 0);

// Single staging slot per CPU; never read by the consumer and never
// assumed to survive across invocations.
#[map(name = "EXEC_ARG_BUFFER")]
static EXEC_ARG_BUFFER: PerCpuArray<[u8; EXEC_ARG_SIZE]> = PerCpuArray::with_max_entries(1, 0);

// task_struct field offsets, written by the loader before load. Zeroed
// until then; reads through a zero offset degrade to a zero ppid.
#[unsafe(no_mangle)]
static TASK_OFFSETS: TaskOffsets = TaskOffsets::zeroed();

fn task_offsets() -> TaskOffsets {
    unsafe { core::ptr::read_volatile(&TASK_OFFSETS) }
}

fn read_field<T: Copy>(base: *const u8, offset: u32) -> Option<T> {
    if base.is_null() {
        return None;
    }
    unsafe { bpf_probe_read_kernel(base.add(offset as usize) as *const T).ok() }
}

fn read_ptr(base: *const u8, offset: u32) -> Option<*const u8> {
    let addr: usize = read_field(base, offset)?;
    if addr == 0 { None } else { Some(addr as *const u8) }
}

/// One hop up the process tree: current task -> real_parent -> pid.
/// Offsets come from the loader-resolved descriptor, so this works
/// across kernel versions without recompilation. A failed read yields
/// zero rather than aborting the probe.
fn resolve_ppid() -> u32 {
    let offsets = task_offsets();
    let task = unsafe { bpf_get_current_task() } as *const u8;
    let parent = match read_ptr(task, offsets.real_parent) {
        Some(p) => p,
        None => return 0,
    };
    read_field::<i32>(parent, offsets.pid).unwrap_or(0) as u32
}

#[tracepoint(category = "syscalls", name = "sys_exit_fork")]
pub fn fork_trace(_ctx: TracePointContext) -> u32 {
    if let Some(mut buf) = EVENTS.reserve::<EventHeader>(0) {
        match unsafe { buf.as_mut_ptr().as_mut() } {
            Some(header) => {
                header.time = unsafe { bpf_ktime_get_ns() };
                // Low half of pid_tgid: the returning parent-context
                // task, not the new child.
                header.pid = bpf_get_current_pid_tgid() as u32;
                header.ppid = resolve_ppid();
                header.kind = EventKind::Fork;
                buf.submit(0);
            }
            None => buf.discard(0),
        }
    }
    0
}

#[tracepoint(category = "syscalls", name = "sys_enter_execve")]
pub fn execve_trace(ctx: TracePointContext) -> u32 {
    let mut buf = match EVENTS.reserve::<ExecData>(0) {
        Some(b) => b,
        None => return 0,
    };
    // Layout according to format file of sys_enter_execve
    // offset  0–15  = common fields + __syscall_nr
    //        16     = const char *filename
    //        24     = const char *const *argv
    //        32     = const char *const *envp
    let filename_ptr = unsafe { ctx.read_at::<*const u8>(16usize) }.unwrap_or(core::ptr::null());
    let argv = unsafe { ctx.read_at::<*const *const u8>(24usize) }.unwrap_or(core::ptr::null());

    let event = match unsafe { buf.as_mut_ptr().as_mut() } {
        Some(e) => e,
        None => {
            buf.discard(0);
            return 0;
        }
    };

    let time = unsafe { bpf_ktime_get_ns() };
    let pid = bpf_get_current_pid_tgid() as u32;
    event.header.time = time;
    event.header.pid = pid;
    event.header.ppid = resolve_ppid();
    event.header.kind = EventKind::Exec;

    if unsafe { bpf_probe_read_user_str_bytes(filename_ptr, &mut event.filename) }.is_err() {
        buf.discard(0);
        return 0;
    }

    // Bounded argv scan: stage each argument in the per-CPU scratch
    // slot, then spill it keyed by (time, pid, index). The first
    // failed pointer read, null pointer, or rejected insert ends the
    // scan and fixes argc there.
    let mut argc: u8 = 0;
    if let Some(scratch) = EXEC_ARG_BUFFER.get_ptr_mut(0)
        && !argv.is_null()
    {
        for i in 0..MAX_ARGS {
            let arg_ptr = match unsafe { bpf_probe_read_user::<*const u8>(argv.add(i)) } {
                Ok(p) => p,
                Err(_) => break,
            };
            if arg_ptr.is_null() {
                break;
            }
            let value = unsafe { &mut *scratch };
            if unsafe { bpf_probe_read_user_str_bytes(arg_ptr, value) }.is_err() {
                break;
            }
            let key = ExecArgKey {
                time,
                pid,
                index: i as u8,
            };
            if EXEC_ARGS.insert(&key, value, BPF_NOEXIST as u64).is_err() {
                break;
            }
            argc = i as u8 + 1;
        }
    }

    event.argc = argc;
    buf.submit(0);
    0
}

#[cgroup_sock_addr(connect4)]
pub fn connect4_trace(ctx: SockAddrContext) -> i32 {
    let sock_addr = unsafe { &*ctx.sock_addr };
    if sock_addr.type_ != SOCK_STREAM || sock_addr.family != AF_INET {
        return 1;
    }

    if let Some(mut buf) = EVENTS.reserve::<ConnectData>(0) {
        match unsafe { buf.as_mut_ptr().as_mut() } {
            Some(event) => {
                event.header.time = unsafe { bpf_ktime_get_ns() };
                event.header.pid = bpf_get_current_pid_tgid() as u32;
                // The parent walk is not reliable in this hook context.
                event.header.ppid = 0;
                event.header.kind = EventKind::Connect;
                event.daddr = ipv4_mapped(u32::from_be(sock_addr.user_ip4));
                event.dport = u16::from_be(sock_addr.user_port as u16);
                buf.submit(0);
            }
            None => buf.discard(0),
        }
    }

    // The verdict never depends on capture; 1 is always allow.
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
