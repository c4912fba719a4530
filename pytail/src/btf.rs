use anyhow::{bail, Context, Result};
use btf_rs::{Btf, Type};

const BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// Byte offset of `thread.fsbase` within `task_struct` on the running
/// kernel. The sampler needs it to find a task's TLS base; hardcoding it
/// would tie the binary to one kernel layout.
pub fn task_fsbase_offset() -> Result<u64> {
    let btf = Btf::from_file(BTF_PATH)
        .with_context(|| format!("failed to read BTF from {BTF_PATH}"))?;
    let thread = member_offset(&btf, "task_struct", "thread")?;
    let fsbase = member_offset(&btf, "thread_struct", "fsbase")?;
    Ok(thread + fsbase)
}

fn member_offset(btf: &Btf, struct_name: &str, field_name: &str) -> Result<u64> {
    let types = btf
        .resolve_types_by_name(struct_name)
        .with_context(|| format!("no type {struct_name} in kernel BTF"))?;
    for t in types {
        if let Type::Struct(s) = t {
            for member in s.members.iter() {
                if let Ok(name) = btf.resolve_name(member) {
                    if name == field_name {
                        return Ok(member.bit_offset() as u64 / 8);
                    }
                }
            }
        }
    }
    bail!("no field {field_name} in {struct_name}")
}
