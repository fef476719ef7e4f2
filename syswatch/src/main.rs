mod btf;
mod event;
mod util;

use std::fs::File;
use std::path::PathBuf;

use anyhow::{Context as _, anyhow};
use aya::maps::{HashMap, RingBuf};
use aya::programs::{CgroupAttachMode, CgroupSockAddr, TracePoint};
use aya::{Ebpf, EbpfLoader, include_bytes_aligned};
use clap::Parser;
use env_logger::{Builder, Env};
use log::{LevelFilter, info};
use syswatch_common::{EXEC_ARG_SIZE, ExecArgKey};
use tokio::signal;

use crate::event::{Event, extract_event, extract_sock_connect, reassemble_args};
use crate::util::memlock;

#[derive(Debug, Parser)]
struct Opt {
    /// cgroup v2 mount the connect hook is attached to.
    #[clap(long, default_value = "/sys/fs/cgroup")]
    cgroup: PathBuf,
    /// Capture only connect records, via the standalone network object.
    #[clap(long)]
    net_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Set default log level to "info" if RUST_LOG is not set
    // Allows override via RUST_LOG environment variable if desired
    Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_env(Env::default().default_filter_or("info"))
        .init();
    let opt = Opt::parse();
    memlock();

    if opt.net_only {
        run_net_only(&opt).await
    } else {
        run_combined(&opt).await
    }
}

async fn run_combined(opt: &Opt) -> anyhow::Result<()> {
    // The parent walk needs task_struct offsets for this kernel. They
    // are resolved exactly once, before load; probes never retry.
    let offsets = btf::resolve_task_offsets().context("resolve task_struct offsets")?;

    let mut ebpf = EbpfLoader::new()
        .set_global("TASK_OFFSETS", &offsets, true)
        .load(include_bytes_aligned!(concat!(env!("OUT_DIR"), "/syswatch")))?;

    let program: &mut TracePoint = ebpf
        .program_mut("fork_trace")
        .ok_or_else(|| anyhow!("program fork_trace not found"))?
        .try_into()?;
    program.load()?;
    program.attach("syscalls", "sys_exit_fork")?;

    let program: &mut TracePoint = ebpf
        .program_mut("execve_trace")
        .ok_or_else(|| anyhow!("program execve_trace not found"))?
        .try_into()?;
    program.load()?;
    program.attach("syscalls", "sys_enter_execve")?;

    attach_connect(&mut ebpf, "connect4_trace", &opt.cgroup)?;

    let ring_buf = RingBuf::try_from(
        ebpf.take_map("EVENTS")
            .ok_or_else(|| anyhow!("map EVENTS not found"))?,
    )?;
    let mut exec_args: HashMap<_, ExecArgKey, [u8; EXEC_ARG_SIZE]> = HashMap::try_from(
        ebpf.take_map("EXEC_ARGS")
            .ok_or_else(|| anyhow!("map EXEC_ARGS not found"))?,
    )?;

    info!("tracing fork/exec/connect, waiting for events (Ctrl-C to exit)");

    let mut async_ring = tokio::io::unix::AsyncFd::new(ring_buf)?;
    loop {
        tokio::select! {
            guard = async_ring.readable_mut() => {
                let mut guard = guard?;
                let ring = guard.get_inner_mut();

                while let Some(raw_event) = ring.next() {
                    let event = match extract_event(&raw_event) {
                        Some(event) => event,
                        None => continue,
                    };
                    match event {
                        Event::Fork(e) => {
                            info!("fork: pid={} ppid={}", e.pid, e.ppid);
                        }
                        Event::Exec(e) => {
                            // Spill entries have to be deleted after
                            // reassembly; the kernel side never
                            // reclaims them.
                            let args = reassemble_args(e.time, e.pid, e.argc, |key| {
                                let value = exec_args.get(key, 0).ok();
                                let _ = exec_args.remove(key);
                                value
                            });
                            info!(
                                "exec: pid={} ppid={} filename={} argv={:?}",
                                e.pid, e.ppid, e.filename, args
                            );
                        }
                        Event::Connect(e) => {
                            info!("connect: pid={} dst=[{}]:{}", e.pid, e.addr, e.port);
                        }
                    }
                }

                guard.clear_ready();
            }

            _ = signal::ctrl_c() => {
                info!("received Ctrl-C, exiting");
                break;
            }
        }
    }

    Ok(())
}

async fn run_net_only(opt: &Opt) -> anyhow::Result<()> {
    let mut ebpf = Ebpf::load(include_bytes_aligned!(concat!(
        env!("OUT_DIR"),
        "/syswatch-net"
    )))?;

    attach_connect(&mut ebpf, "sock_connect4", &opt.cgroup)?;

    let ring_buf = RingBuf::try_from(
        ebpf.take_map("CONNECTIONS")
            .ok_or_else(|| anyhow!("map CONNECTIONS not found"))?,
    )?;

    info!("tracing IPv4 stream connects, waiting for records (Ctrl-C to exit)");

    let mut async_ring = tokio::io::unix::AsyncFd::new(ring_buf)?;
    loop {
        tokio::select! {
            guard = async_ring.readable_mut() => {
                let mut guard = guard?;
                let ring = guard.get_inner_mut();

                while let Some(raw_record) = ring.next() {
                    if let Some(record) = extract_sock_connect(&raw_record) {
                        info!(
                            "connect: pid={} dst=[{}]:{}",
                            record.pid, record.addr, record.port
                        );
                    }
                }

                guard.clear_ready();
            }

            _ = signal::ctrl_c() => {
                info!("received Ctrl-C, exiting");
                break;
            }
        }
    }

    Ok(())
}

fn attach_connect(ebpf: &mut Ebpf, name: &str, cgroup_path: &PathBuf) -> anyhow::Result<()> {
    let cgroup = File::open(cgroup_path)
        .with_context(|| format!("open cgroup {}", cgroup_path.display()))?;
    let program: &mut CgroupSockAddr = ebpf
        .program_mut(name)
        .ok_or_else(|| anyhow!("program {name} not found"))?
        .try_into()?;
    program.load()?;
    program.attach(&cgroup, CgroupAttachMode::Single)?;
    Ok(())
}
