//! Skb and probe argument access
//!
//! Probed functions differ in where they take their skb (and optional drop
//! reason), so argument positions come from PROBE_CONFIG. The skb->head
//! offset is set by the loader for the running kernel.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use skbtrack_common::{ProbeArg, ProbeArgs, ProbeOffsets};

/// Offset of `head` in `struct sk_buff`, patched by the loader
#[no_mangle]
static SKB_HEAD_OFFSET: u32 = 0xc0;

/// Typed arguments of a kprobe invocation
pub struct KprobeArgs<'a> {
    ctx: &'a ProbeContext,
    offsets: ProbeOffsets,
}

impl<'a> KprobeArgs<'a> {
    #[inline(always)]
    pub fn new(ctx: &'a ProbeContext, offsets: ProbeOffsets) -> Self {
        Self { ctx, offsets }
    }

    /// Address of the skb given to the probed function
    #[inline(always)]
    pub fn skb(&self) -> Result<u64, i64> {
        if !self.has_arg(ProbeArg::SkBuff) {
            return Err(-1);
        }

        match self.read_arg(ProbeArg::SkBuff) {
            0 => Err(-1),
            skb => Ok(skb),
        }
    }
}

impl ProbeArgs for KprobeArgs<'_> {
    #[inline(always)]
    fn has_arg(&self, arg: ProbeArg) -> bool {
        self.offsets.index(arg).is_some()
    }

    #[inline(always)]
    fn read_arg(&self, arg: ProbeArg) -> u64 {
        match self.offsets.index(arg) {
            Some(index) => self.ctx.arg::<u64>(index).unwrap_or(0),
            None => 0,
        }
    }
}

/// Read skb->head
///
/// Returns 0 when the read fails, which callers treat as "no head".
#[inline(always)]
pub fn read_head(skb: u64) -> u64 {
    let offset = unsafe { core::ptr::read_volatile(&SKB_HEAD_OFFSET) } as u64;
    let ptr = (skb + offset) as *const u64;

    unsafe { bpf_probe_read_kernel(ptr).unwrap_or(0) }
}
