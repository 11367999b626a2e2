//! Pairs uprobe and uretprobe hits into function-call records.
//!
//! Each thread keeps a stack of open calls; the depth of a call is the
//! number of enclosing instrumented calls at the time it was pushed. A
//! uretprobe without a matching uprobe can happen at the start of a capture
//! for calls already in flight, and is dropped.

use rustc_hash::FxHashMap;

use crate::listener::FunctionCall;

struct OpenFunctionCall {
    absolute_address: u64,
    begin_timestamp_ns: u64,
    depth: u32,
}

#[derive(Default)]
pub struct FunctionCallManager {
    open_calls_by_tid: FxHashMap<i32, Vec<OpenFunctionCall>>,
}

impl FunctionCallManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_uprobe(&mut self, tid: i32, function_address: u64, timestamp_ns: u64) {
        let stack = self.open_calls_by_tid.entry(tid).or_default();
        let depth = stack.len() as u32;
        stack.push(OpenFunctionCall {
            absolute_address: function_address,
            begin_timestamp_ns: timestamp_ns,
            depth,
        });
    }

    pub fn on_uretprobe(
        &mut self,
        pid: i32,
        tid: i32,
        timestamp_ns: u64,
        return_value: u64,
    ) -> Option<FunctionCall> {
        let stack = self.open_calls_by_tid.get_mut(&tid)?;
        let open_call = stack.pop()?;
        if stack.is_empty() {
            self.open_calls_by_tid.remove(&tid);
        }

        Some(FunctionCall {
            pid,
            tid,
            absolute_address: open_call.absolute_address,
            begin_timestamp_ns: open_call.begin_timestamp_ns,
            end_timestamp_ns: timestamp_ns,
            depth: open_call.depth,
            return_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_a_single_call() {
        let mut manager = FunctionCallManager::new();
        manager.on_uprobe(7, 0xF00, 100);
        let call = manager.on_uretprobe(1, 7, 200, 42).unwrap();
        assert_eq!(
            call,
            FunctionCall {
                pid: 1,
                tid: 7,
                absolute_address: 0xF00,
                begin_timestamp_ns: 100,
                end_timestamp_ns: 200,
                depth: 0,
                return_value: 42,
            }
        );
    }

    #[test]
    fn nested_calls_get_increasing_depths() {
        let mut manager = FunctionCallManager::new();
        manager.on_uprobe(7, 0xA, 100);
        manager.on_uprobe(7, 0xB, 110);
        manager.on_uprobe(7, 0xC, 120);

        let inner = manager.on_uretprobe(1, 7, 130, 0).unwrap();
        assert_eq!((inner.absolute_address, inner.depth), (0xC, 2));
        let middle = manager.on_uretprobe(1, 7, 140, 0).unwrap();
        assert_eq!((middle.absolute_address, middle.depth), (0xB, 1));
        let outer = manager.on_uretprobe(1, 7, 150, 0).unwrap();
        assert_eq!((outer.absolute_address, outer.depth), (0xA, 0));
    }

    #[test]
    fn uretprobe_without_uprobe_is_dropped() {
        let mut manager = FunctionCallManager::new();
        assert!(manager.on_uretprobe(1, 7, 100, 0).is_none());

        // After draining a thread's stack, further returns are dropped too.
        manager.on_uprobe(7, 0xA, 100);
        assert!(manager.on_uretprobe(1, 7, 200, 0).is_some());
        assert!(manager.on_uretprobe(1, 7, 300, 0).is_none());
    }

    #[test]
    fn threads_are_independent() {
        let mut manager = FunctionCallManager::new();
        manager.on_uprobe(7, 0xA, 100);
        manager.on_uprobe(8, 0xB, 110);

        let call = manager.on_uretprobe(1, 8, 200, 0).unwrap();
        assert_eq!(call.absolute_address, 0xB);
        assert_eq!(call.depth, 0);

        let call = manager.on_uretprobe(1, 7, 210, 0).unwrap();
        assert_eq!(call.absolute_address, 0xA);
    }
}
