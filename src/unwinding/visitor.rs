//! The visitor for stack samples, callchain samples and u(ret)probe records.
//!
//! Processing these in one visitor is what makes dynamic instrumentation and
//! sampling compose: entering an instrumented function hijacks the return
//! address on the stack, so any sample falling inside such a function can
//! only be unwound after the shadow stack has put the original address back.
//! This visitor keeps the shadow stacks and open function calls per thread,
//! patches each sample before unwinding, and drops samples whose leaf is
//! inside the trampoline itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::function_calls::FunctionCallManager;
use super::return_addresses::ReturnAddressManager;
use super::unwinder::{CallstackUnwinder, PERF_REG_COUNT};
use crate::config::InstrumentedFunction;
use crate::events::{
    CallchainSampleEvent, MapsEvent, PerfEventVisitor, StackSampleEvent, UprobeEvent,
    UretprobeEvent,
};
use crate::listener::{AddressInfo, CallstackSample, ModulesUpdate, TracerListener};
use crate::proc_maps::MapsSnapshot;

#[derive(Clone, Default)]
pub struct SampleCounters {
    pub unwind_errors: Arc<AtomicU64>,
    pub discarded_samples_in_uretprobes: Arc<AtomicU64>,
    pub discarded_empty_stack_samples: Arc<AtomicU64>,
}

pub struct UnwindingVisitor<U: CallstackUnwinder> {
    listener: Arc<dyn TracerListener>,
    functions: Arc<Vec<InstrumentedFunction>>,
    current_maps: MapsSnapshot,
    unwinder: U,
    return_address_manager: ReturnAddressManager,
    function_call_manager: FunctionCallManager,
    counters: SampleCounters,
    reported_addresses: FxHashSet<u64>,
}

impl<U: CallstackUnwinder> UnwindingVisitor<U> {
    pub fn new(
        listener: Arc<dyn TracerListener>,
        functions: Arc<Vec<InstrumentedFunction>>,
        initial_maps: &str,
        mut unwinder: U,
        counters: SampleCounters,
    ) -> Self {
        let current_maps = MapsSnapshot::parse(initial_maps);
        unwinder.update_modules(&current_maps);
        UnwindingVisitor {
            listener,
            functions,
            current_maps,
            unwinder,
            return_address_manager: ReturnAddressManager::new(),
            function_call_manager: FunctionCallManager::new(),
            counters,
            reported_addresses: FxHashSet::default(),
        }
    }

    fn report_address_info_once(&mut self, info: AddressInfo) {
        if self.reported_addresses.insert(info.absolute_address) {
            self.listener.on_address_info(info);
        }
    }
}

impl<U: CallstackUnwinder> PerfEventVisitor for UnwindingVisitor<U> {
    fn visit_stack_sample(&mut self, event: &mut StackSampleEvent) {
        if event.stack.is_empty() {
            self.counters
                .discarded_empty_stack_samples
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.return_address_manager
            .patch_sample(event.tid, event.sp(), &mut event.stack);

        let regs: [u64; PERF_REG_COUNT] = event.register_array();
        let frames = self
            .unwinder
            .unwind(&regs, &event.stack, &self.current_maps);

        if frames.is_empty() {
            self.counters.unwind_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Samples can fall inside u(ret)probe trampoline code itself.
        // Discard them: even when they unwind successfully the result is
        // wrong.
        if frames[0].map_name == crate::proc_maps::UPROBES_MAP_NAME {
            self.counters
                .discarded_samples_in_uretprobes
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut pcs = Vec::with_capacity(frames.len());
        for frame in frames {
            pcs.push(frame.pc);
            self.report_address_info_once(AddressInfo {
                absolute_address: frame.pc,
                function_name: frame.function_name.unwrap_or_default(),
                offset_in_function: frame.function_offset.unwrap_or(0),
                map_name: frame.map_name,
            });
        }

        self.listener.on_callstack_sample(CallstackSample {
            pid: event.pid,
            tid: event.tid,
            timestamp_ns: event.timestamp_ns,
            pcs,
        });
    }

    fn visit_callchain_sample(&mut self, event: &mut CallchainSampleEvent) {
        // The top of a perf_event_open callchain is a context marker inside
        // kernel code; a chain without at least one user frame is useless.
        if event.ips.len() <= 1 {
            return;
        }

        // The leaf user frame can itself be inside trampoline code; those
        // samples are discarded like their DWARF counterparts.
        if self.current_maps.is_uprobes_address(event.ips[1]) {
            self.counters
                .discarded_samples_in_uretprobes
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !self.return_address_manager.patch_callchain(
            event.tid,
            &mut event.ips,
            &self.current_maps,
        ) {
            self.counters.unwind_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The first user frame is the sampled ip and is exact. Every frame
        // above it is a return address, which points after its call
        // instruction; subtract 1 so symbolizers land inside the call.
        let mut pcs = Vec::with_capacity(event.ips.len() - 1);
        pcs.push(event.ips[1]);
        for &ip in &event.ips[2..] {
            pcs.push(ip.wrapping_sub(1));
        }
        for &pc in &pcs {
            let map_name = self.current_maps.name_of(pc).unwrap_or("").to_string();
            self.report_address_info_once(AddressInfo {
                absolute_address: pc,
                function_name: String::new(),
                offset_in_function: 0,
                map_name,
            });
        }

        self.listener.on_callstack_sample(CallstackSample {
            pid: event.pid,
            tid: event.tid,
            timestamp_ns: event.timestamp_ns,
            pcs,
        });
    }

    fn visit_uprobe(&mut self, event: &UprobeEvent) {
        if !self.return_address_manager.on_uprobe(
            event.tid,
            event.sp,
            event.ip,
            event.cpu,
            event.return_address,
        ) {
            // A duplicate hit; the matching function call must not open
            // either.
            return;
        }

        let function = &self.functions[event.function_index];
        self.function_call_manager.on_uprobe(
            event.tid,
            function.absolute_address,
            event.timestamp_ns,
        );
    }

    fn visit_uretprobe(&mut self, event: &UretprobeEvent) {
        if let Some(function_call) = self.function_call_manager.on_uretprobe(
            event.pid,
            event.tid,
            event.timestamp_ns,
            event.ax,
        ) {
            self.listener.on_function_call(function_call);
        }

        self.return_address_manager.on_uretprobe(event.tid);
    }

    fn visit_maps(&mut self, event: &MapsEvent) {
        self.current_maps = MapsSnapshot::parse(&event.maps);
        self.unwinder.update_modules(&self.current_maps);
        self.listener.on_modules_update(ModulesUpdate {
            pid: event.pid,
            timestamp_ns: event.timestamp_ns,
            maps: event.maps.clone(),
        });
    }
}
