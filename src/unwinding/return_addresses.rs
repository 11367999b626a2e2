//! Repairs return addresses hijacked by uretprobe trampolines.
//!
//! When a function is instrumented with a uretprobe, the kernel overwrites
//! the return address on the stack with the address of its trampoline, which
//! breaks unwinding of any sample taken inside the function. The uprobe
//! record is the only place where the original return address is still
//! visible (as the top 8 stack bytes, captured before the rewrite), so a
//! shadow stack per thread records `(sp, original return address)` on every
//! uprobe and drops the top entry on every uretprobe. Samples are then
//! patched before unwinding: stack dumps get the original bytes written back
//! at the hijacked location, frame-pointer callchains get trampoline ips
//! substituted by nesting depth.
//!
//! Correlation is by tid and stack discipline, not by any kernel-provided id,
//! so the shadow stack must self-heal: a new entry whose sp is above the
//! current top means the matching uretprobe was missed, and the stale top is
//! dropped.

use log::error;
use rustc_hash::FxHashMap;

use crate::proc_maps::MapsSnapshot;

#[derive(Clone, Copy, Debug)]
struct ShadowStackEntry {
    sp: u64,
    ip: u64,
    cpu: u32,
    return_address: u64,
}

#[derive(Default)]
pub struct ReturnAddressManager {
    shadow_stacks_by_tid: FxHashMap<i32, Vec<ShadowStackEntry>>,
}

impl ReturnAddressManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a shadow entry for a uprobe hit. Returns false if the hit was
    /// identified as a duplicate and must be discarded entirely.
    ///
    /// On thread migration, uprobe records can be duplicated: same sp and ip
    /// as the previous one but a different cpu. Those are dropped. An sp
    /// strictly above the current top means the top's uretprobe was missed
    /// (the function returned unobserved); stale tops are popped before
    /// pushing so the stack cannot poison later patches.
    pub fn on_uprobe(
        &mut self,
        tid: i32,
        sp: u64,
        ip: u64,
        cpu: u32,
        return_address: u64,
    ) -> bool {
        let stack = self.shadow_stacks_by_tid.entry(tid).or_default();

        if let Some(top) = stack.last() {
            if sp == top.sp && ip == top.ip && cpu != top.cpu {
                error!("Duplicate uprobe on thread migration for tid {tid}");
                return false;
            }
        }

        while let Some(top) = stack.last() {
            if sp > top.sp {
                error!("Missed uretprobe for tid {tid}, dropping stale shadow stack entry");
                stack.pop();
            } else {
                break;
            }
        }

        stack.push(ShadowStackEntry {
            sp,
            ip,
            cpu,
            return_address,
        });
        true
    }

    pub fn on_uretprobe(&mut self, tid: i32) {
        let Some(stack) = self.shadow_stacks_by_tid.get_mut(&tid) else {
            return;
        };
        stack.pop();
        if stack.is_empty() {
            self.shadow_stacks_by_tid.remove(&tid);
        }
    }

    /// Writes the original return addresses back into a stack dump, so the
    /// unwinder sees the real caller instead of the trampoline. The dump
    /// covers the addresses `[sp_at_sample, sp_at_sample + dump length)`.
    pub fn patch_sample(&self, tid: i32, sp_at_sample: u64, stack_dump: &mut [u8]) {
        let Some(stack) = self.shadow_stacks_by_tid.get(&tid) else {
            return;
        };

        let dump_end = sp_at_sample + stack_dump.len() as u64;
        for entry in stack {
            if entry.sp < sp_at_sample || entry.sp >= dump_end {
                continue;
            }
            let offset = (entry.sp - sp_at_sample) as usize;
            if offset + 8 > stack_dump.len() {
                continue;
            }
            stack_dump[offset..offset + 8].copy_from_slice(&entry.return_address.to_ne_bytes());
        }
    }

    /// Replaces trampoline instruction pointers in a frame-pointer callchain
    /// with the original return addresses, matching hijacked frames to shadow
    /// entries by nesting depth from the innermost. Returns false when the
    /// callchain has more hijacked frames than the shadow stack has entries;
    /// such a callchain cannot be repaired.
    pub fn patch_callchain(&self, tid: i32, ips: &mut [u64], maps: &MapsSnapshot) -> bool {
        let hijacked_count = ips
            .iter()
            .filter(|&&ip| maps.is_uprobes_address(ip))
            .count();
        if hijacked_count == 0 {
            return true;
        }

        let Some(stack) = self.shadow_stacks_by_tid.get(&tid) else {
            error!("Callchain of tid {tid} has trampoline frames but no shadow stack");
            return false;
        };
        if hijacked_count > stack.len() {
            error!("Callchain of tid {tid} has more trampoline frames than shadow stack entries");
            return false;
        }

        // The innermost hijacked frame corresponds to the most recent uprobe.
        let mut next_entry = stack.len();
        for ip in ips.iter_mut() {
            if maps.is_uprobes_address(*ip) {
                next_entry -= 1;
                *ip = stack[next_entry].return_address;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPROBES_MAPS: &str =
        "7ffff7ff9000-7ffff7ffa000 r-xp 00000000 00:00 0                  [uprobes]\n";

    #[test]
    fn patches_hijacked_return_address_in_stack_dump() {
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(7, 0x1000, 0x500, 0, 0xAAAA);

        // A dump starting at sp 0xFF8, with the trampoline address at the
        // location of sp 0x1000.
        let mut dump = vec![0u8; 24];
        dump[8..16].copy_from_slice(&0x7ffff7ff9123u64.to_ne_bytes());
        manager.patch_sample(7, 0xFF8, &mut dump);

        let mut patched = [0u8; 8];
        patched.copy_from_slice(&dump[8..16]);
        assert_eq!(u64::from_ne_bytes(patched), 0xAAAA);
        // Bytes outside the entry are untouched.
        assert_eq!(&dump[0..8], &[0u8; 8]);
    }

    #[test]
    fn entries_outside_the_dump_are_ignored() {
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(7, 0x2000, 0x500, 0, 0xAAAA);

        let mut dump = vec![0xFFu8; 16];
        let original = dump.clone();
        manager.patch_sample(7, 0x1000, &mut dump);
        assert_eq!(dump, original);
    }

    #[test]
    fn nested_uprobes_patch_all_their_frames() {
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(7, 0x1010, 0x500, 0, 0xAAAA);
        manager.on_uprobe(7, 0x1000, 0x600, 0, 0xBBBB);

        let mut dump = vec![0u8; 24];
        manager.patch_sample(7, 0x1000, &mut dump);

        assert_eq!(u64::from_ne_bytes(dump[0..8].try_into().unwrap()), 0xBBBB);
        assert_eq!(u64::from_ne_bytes(dump[16..24].try_into().unwrap()), 0xAAAA);
    }

    #[test]
    fn uretprobe_pops_the_top_entry() {
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(7, 0x1010, 0x500, 0, 0xAAAA);
        manager.on_uprobe(7, 0x1000, 0x600, 0, 0xBBBB);
        manager.on_uretprobe(7);

        let mut dump = vec![0u8; 32];
        manager.patch_sample(7, 0x1000, &mut dump);
        // Only the outer entry remains.
        assert_eq!(u64::from_ne_bytes(dump[0..8].try_into().unwrap()), 0);
        assert_eq!(u64::from_ne_bytes(dump[16..24].try_into().unwrap()), 0xAAAA);
    }

    #[test]
    fn missed_uretprobe_pops_stale_top_and_pushes() {
        let mut manager = ReturnAddressManager::new();
        // Inner call at low sp; its uretprobe is missed.
        assert!(manager.on_uprobe(7, 0x1000, 0x500, 0, 0xAAAA));
        // New call at a higher sp: the old entry must go.
        assert!(manager.on_uprobe(7, 0x1100, 0x600, 0, 0xBBBB));

        let mut dump = vec![0u8; 0x200];
        manager.patch_sample(7, 0x1000, &mut dump);
        assert_eq!(u64::from_ne_bytes(dump[0..8].try_into().unwrap()), 0);
        assert_eq!(
            u64::from_ne_bytes(dump[0x100..0x108].try_into().unwrap()),
            0xBBBB
        );
    }

    #[test]
    fn duplicate_uprobe_on_migration_is_dropped() {
        let mut manager = ReturnAddressManager::new();
        assert!(manager.on_uprobe(7, 0x1000, 0x500, 0, 0xAAAA));
        // Same sp and ip, different cpu: a migration duplicate.
        assert!(!manager.on_uprobe(7, 0x1000, 0x500, 1, 0xAAAA));
    }

    #[test]
    fn patches_callchain_by_nesting_depth() {
        let maps = MapsSnapshot::parse(UPROBES_MAPS);
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(7, 0x1010, 0x500, 0, 0xAAAA);
        manager.on_uprobe(7, 0x1000, 0x600, 0, 0xBBBB);

        let mut ips = vec![0x400100, 0x7ffff7ff9123, 0x7ffff7ff9456, 0x400200];
        assert!(manager.patch_callchain(7, &mut ips, &maps));
        assert_eq!(ips, vec![0x400100, 0xBBBB, 0xAAAA, 0x400200]);
    }

    #[test]
    fn callchain_with_unmatchable_trampolines_fails() {
        let maps = MapsSnapshot::parse(UPROBES_MAPS);
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(7, 0x1000, 0x500, 0, 0xAAAA);

        let mut ips = vec![0x7ffff7ff9123, 0x7ffff7ff9456];
        assert!(!manager.patch_callchain(7, &mut ips, &maps));

        // No shadow stack for the thread at all.
        let mut ips = vec![0x7ffff7ff9123];
        assert!(!manager.patch_callchain(99, &mut ips, &maps));
    }

    #[test]
    fn callchain_without_trampolines_is_untouched() {
        let maps = MapsSnapshot::parse(UPROBES_MAPS);
        let manager = ReturnAddressManager::new();
        let mut ips = vec![0x400100, 0x400200];
        assert!(manager.patch_callchain(42, &mut ips, &maps));
        assert_eq!(ips, vec![0x400100, 0x400200]);
    }

    #[test]
    fn threads_have_independent_shadow_stacks() {
        let mut manager = ReturnAddressManager::new();
        manager.on_uprobe(1, 0x1000, 0x500, 0, 0xAAAA);
        manager.on_uprobe(2, 0x1000, 0x500, 0, 0xBBBB);

        let mut dump = vec![0u8; 8];
        manager.patch_sample(1, 0x1000, &mut dump);
        assert_eq!(u64::from_ne_bytes(dump[0..8].try_into().unwrap()), 0xAAAA);
    }
}
