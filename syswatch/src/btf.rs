//! Attach-time resolution of the task_struct field offsets the probes
//! need for the one-hop parent walk. Resolved once from kernel BTF and
//! written into the eBPF object's globals before load; failure here is
//! fatal, never a per-event condition.

use anyhow::{Context as _, Result, anyhow, bail};
use btf_rs::{Btf, Type};
use syswatch_common::TaskOffsets;

const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

pub fn resolve_task_offsets() -> Result<TaskOffsets> {
    let btf = Btf::from_file(VMLINUX_BTF).context("parse kernel BTF")?;
    resolve_from(&btf)
}

fn resolve_from(btf: &Btf) -> Result<TaskOffsets> {
    let types = btf
        .resolve_types_by_name("task_struct")
        .context("look up task_struct")?;
    // The name can also resolve to forward declarations; take the
    // struct definition.
    let strukt = types
        .iter()
        .find_map(|r#type| match r#type {
            Type::Struct(s) => Some(s),
            _ => None,
        })
        .ok_or_else(|| anyhow!("task_struct did not resolve to a struct"))?;

    let mut offsets = TaskOffsets::zeroed();
    for member in &strukt.members {
        match btf.resolve_name(member)?.as_str() {
            "real_parent" => offsets.real_parent = (member.bit_offset() / 8) as u32,
            "pid" => offsets.pid = (member.bit_offset() / 8) as u32,
            _ => {}
        }
    }

    if offsets.real_parent == 0 || offsets.pid == 0 {
        bail!("task_struct members real_parent/pid not found in kernel BTF");
    }
    Ok(offsets)
}
