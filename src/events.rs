//! The typed event union produced by record decoding, and the visitor
//! interface through which the event processor dispatches them.

use std::os::unix::io::RawFd;

use crate::perf::records::RegsUserAll;
use crate::perf::sys::*;

/// A context switch reported by the kernel's built-in cpu-wide collection.
/// Both halves of a switch arrive as separate records; `is_switch_out` tells
/// them apart.
#[derive(Clone, Debug)]
pub struct SwitchCpuWideEvent {
    pub timestamp_ns: u64,
    pub cpu: u32,
    /// Pid/tid of the thread this record is about; -1 on a switch-out caused
    /// by thread exit.
    pub pid: i32,
    pub tid: i32,
    pub is_switch_out: bool,
}

#[derive(Clone, Debug)]
pub struct ForkEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub parent_pid: i32,
    pub parent_tid: i32,
}

#[derive(Clone, Debug)]
pub struct ExitEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub parent_pid: i32,
    pub parent_tid: i32,
}

/// A fresh snapshot of `/proc/<pid>/maps`, taken because an mmap record for
/// the target was observed. Not a kernel record itself, but it must flow
/// through the same timestamp-ordered pipeline.
#[derive(Clone, Debug)]
pub struct MapsEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub maps: String,
}

#[derive(Clone, Debug)]
pub struct StackSampleEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub regs: RegsUserAll,
    /// The valid prefix of the user stack dump (`dyn_size` bytes).
    pub stack: Vec<u8>,
}

impl StackSampleEvent {
    pub fn sp(&self) -> u64 {
        self.regs.sp
    }

    /// The registers indexed by their PERF_REG_X86_* number, as the unwinder
    /// expects them.
    pub fn register_array(&self) -> [u64; PERF_REG_X86_64_MAX as usize] {
        let regs = &self.regs;
        let mut registers = [0u64; PERF_REG_X86_64_MAX as usize];
        registers[PERF_REG_X86_AX as usize] = regs.ax;
        registers[PERF_REG_X86_BX as usize] = regs.bx;
        registers[PERF_REG_X86_CX as usize] = regs.cx;
        registers[PERF_REG_X86_DX as usize] = regs.dx;
        registers[PERF_REG_X86_SI as usize] = regs.si;
        registers[PERF_REG_X86_DI as usize] = regs.di;
        registers[PERF_REG_X86_BP as usize] = regs.bp;
        registers[PERF_REG_X86_SP as usize] = regs.sp;
        registers[PERF_REG_X86_IP as usize] = regs.ip;
        registers[PERF_REG_X86_R8 as usize] = regs.r8;
        registers[PERF_REG_X86_R9 as usize] = regs.r9;
        registers[PERF_REG_X86_R10 as usize] = regs.r10;
        registers[PERF_REG_X86_R11 as usize] = regs.r11;
        registers[PERF_REG_X86_R12 as usize] = regs.r12;
        registers[PERF_REG_X86_R13 as usize] = regs.r13;
        registers[PERF_REG_X86_R14 as usize] = regs.r14;
        registers[PERF_REG_X86_R15 as usize] = regs.r15;
        registers
    }
}

#[derive(Clone, Debug)]
pub struct CallchainSampleEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    /// Innermost first. The first entry is a kernel context marker.
    pub ips: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct UprobeEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub sp: u64,
    pub ip: u64,
    /// Top 8 stack bytes at entry: the return address, captured before the
    /// uretprobe trampoline overwrites it.
    pub return_address: u64,
    /// Index into the capture's instrumented-function list, resolved from the
    /// stream id during decode.
    pub function_index: usize,
}

#[derive(Clone, Debug)]
pub struct UretprobeEvent {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    /// AX holds the integer return value in the System V ABI.
    pub ax: u64,
    pub function_index: usize,
}

#[derive(Clone, Debug)]
pub struct TaskNewtaskEvent {
    pub timestamp_ns: u64,
    /// The new thread. The tracepoint format calls this field "pid" but it is
    /// a thread id.
    pub tid: i32,
    pub comm: String,
    /// The thread that performed the clone, from the record's generic sample
    /// fields: the tracepoint fires in the creator's context.
    pub was_created_by_tid: i32,
    pub was_created_by_pid: i32,
}

#[derive(Clone, Debug)]
pub struct SchedSwitchEvent {
    pub timestamp_ns: u64,
    pub cpu: u32,
    /// Pid of the thread being switched out, from the record's generic sample
    /// fields; -1 when the switch-out is caused by the thread exiting.
    pub prev_pid_or_minus_one: i32,
    pub prev_tid: i32,
    pub prev_state_bits: i64,
    pub next_tid: i32,
}

#[derive(Clone, Debug)]
pub struct SchedWakeupEvent {
    pub timestamp_ns: u64,
    pub woken_tid: i32,
    /// The waker, from the record's generic sample fields.
    pub was_unblocked_by_tid: i32,
    pub was_unblocked_by_pid: i32,
}

#[derive(Clone, Debug)]
pub enum PerfEventData {
    SwitchCpuWide(SwitchCpuWideEvent),
    Fork(ForkEvent),
    Exit(ExitEvent),
    Maps(MapsEvent),
    StackSample(Box<StackSampleEvent>),
    CallchainSample(CallchainSampleEvent),
    Uprobe(UprobeEvent),
    Uretprobe(UretprobeEvent),
    TaskNewtask(TaskNewtaskEvent),
    SchedSwitch(SchedSwitchEvent),
    SchedWakeup(SchedWakeupEvent),
}

/// One decoded record, tagged with the ring buffer it came from. Records from
/// one origin arrive in non-decreasing timestamp order, which is what the
/// event queue builds on.
#[derive(Clone, Debug)]
pub struct PerfEvent {
    pub origin_fd: RawFd,
    pub data: PerfEventData,
}

impl PerfEvent {
    pub fn timestamp_ns(&self) -> u64 {
        match &self.data {
            PerfEventData::SwitchCpuWide(e) => e.timestamp_ns,
            PerfEventData::Fork(e) => e.timestamp_ns,
            PerfEventData::Exit(e) => e.timestamp_ns,
            PerfEventData::Maps(e) => e.timestamp_ns,
            PerfEventData::StackSample(e) => e.timestamp_ns,
            PerfEventData::CallchainSample(e) => e.timestamp_ns,
            PerfEventData::Uprobe(e) => e.timestamp_ns,
            PerfEventData::Uretprobe(e) => e.timestamp_ns,
            PerfEventData::TaskNewtask(e) => e.timestamp_ns,
            PerfEventData::SchedSwitch(e) => e.timestamp_ns,
            PerfEventData::SchedWakeup(e) => e.timestamp_ns,
        }
    }

    /// Double-dispatches the event to a visitor. Samples are passed mutably:
    /// the unwinding visitor patches return addresses in place.
    pub fn accept(&mut self, visitor: &mut dyn PerfEventVisitor) {
        match &mut self.data {
            PerfEventData::SwitchCpuWide(e) => visitor.visit_switch_cpu_wide(e),
            PerfEventData::Fork(e) => visitor.visit_fork(e),
            PerfEventData::Exit(e) => visitor.visit_exit(e),
            PerfEventData::Maps(e) => visitor.visit_maps(e),
            PerfEventData::StackSample(e) => visitor.visit_stack_sample(e),
            PerfEventData::CallchainSample(e) => visitor.visit_callchain_sample(e),
            PerfEventData::Uprobe(e) => visitor.visit_uprobe(e),
            PerfEventData::Uretprobe(e) => visitor.visit_uretprobe(e),
            PerfEventData::TaskNewtask(e) => visitor.visit_task_newtask(e),
            PerfEventData::SchedSwitch(e) => visitor.visit_sched_switch(e),
            PerfEventData::SchedWakeup(e) => visitor.visit_sched_wakeup(e),
        }
    }
}

/// Implemented by the consumers of the timestamp-ordered event stream. Every
/// method has a no-op default so each visitor only handles the records it
/// cares about.
#[allow(unused_variables)]
pub trait PerfEventVisitor {
    fn visit_switch_cpu_wide(&mut self, event: &SwitchCpuWideEvent) {}
    fn visit_fork(&mut self, event: &ForkEvent) {}
    fn visit_exit(&mut self, event: &ExitEvent) {}
    fn visit_maps(&mut self, event: &MapsEvent) {}
    fn visit_stack_sample(&mut self, event: &mut StackSampleEvent) {}
    fn visit_callchain_sample(&mut self, event: &mut CallchainSampleEvent) {}
    fn visit_uprobe(&mut self, event: &UprobeEvent) {}
    fn visit_uretprobe(&mut self, event: &UretprobeEvent) {}
    fn visit_task_newtask(&mut self, event: &TaskNewtaskEvent) {}
    fn visit_sched_switch(&mut self, event: &SchedSwitchEvent) {}
    fn visit_sched_wakeup(&mut self, event: &SchedWakeupEvent) {}
}
