//! DWARF unwinding of captured stack dumps.
//!
//! The heavy lifting is done by framehop, fed with the ELF sections of every
//! executable mapping in the maps snapshot. Unwinding is fully offline: the
//! only memory the unwinder reads is the stack bytes captured with the
//! sample, never the live process.

use std::fs::File;
use std::ops::Range;

use framehop::x86_64::UnwindRegsX86_64;
use framehop::{
    CacheNative, ExplicitModuleSectionInfo, FrameAddress, MayAllocateDuringUnwind, Module,
    Unwinder, UnwinderNative,
};
use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use rustc_hash::FxHashSet;

use crate::perf::sys::{PERF_REG_X86_64_MAX, PERF_REG_X86_BP, PERF_REG_X86_IP, PERF_REG_X86_SP};
use crate::proc_maps::{MapsSnapshot, Region, UPROBES_MAP_NAME};

pub const PERF_REG_COUNT: usize = PERF_REG_X86_64_MAX as usize;

/// One unwound frame. `pc` points inside the call instruction for non-leaf
/// frames, which is what symbolizers need.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FrameData {
    pub pc: u64,
    pub function_name: Option<String>,
    pub function_offset: Option<u64>,
    pub map_name: String,
}

/// The seam between the unwinding visitor and the unwind library, so the
/// visitor can be driven with a scripted unwinder in tests.
pub trait CallstackUnwinder: Send {
    /// Called whenever the maps snapshot is replaced.
    fn update_modules(&mut self, maps: &MapsSnapshot);

    /// Unwinds from the captured registers and stack bytes. Returns an empty
    /// vector on unwind errors, unless the error was reached at a trampoline
    /// frame: the `[uprobes]` map has no unwind information, so an error
    /// there is expected and the partial result is still useful.
    fn unwind(
        &mut self,
        regs: &[u64; PERF_REG_COUNT],
        stack: &[u8],
        maps: &MapsSnapshot,
    ) -> Vec<FrameData>;
}

struct ModuleSymbols {
    avma_range: Range<u64>,
    /// (avma, size, name), sorted by avma.
    functions: Vec<(u64, u64, String)>,
}

pub struct FramehopUnwinder {
    unwinder: UnwinderNative<Vec<u8>, MayAllocateDuringUnwind>,
    cache: CacheNative<MayAllocateDuringUnwind>,
    added_modules: FxHashSet<(String, u64)>,
    symbols: Vec<ModuleSymbols>,
}

const MAX_FRAMES: usize = 1024;

impl FramehopUnwinder {
    pub fn new() -> Self {
        FramehopUnwinder {
            unwinder: UnwinderNative::new(),
            cache: CacheNative::new(),
            added_modules: FxHashSet::default(),
            symbols: Vec::new(),
        }
    }

    fn add_module_for_region(&mut self, region: &Region) {
        let file = match File::open(&region.name) {
            Ok(file) => file,
            Err(error) => {
                debug!("Could not open mapped file {}: {error}", region.name);
                return;
            }
        };
        let mmap = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(mmap) => mmap,
            Err(error) => {
                warn!("Could not mmap {}: {error}", region.name);
                return;
            }
        };
        let object_file = match object::File::parse(&mmap[..]) {
            Ok(object_file) => object_file,
            Err(error) => {
                debug!("{} has an unrecognized format: {error}", region.name);
                return;
            }
        };

        let Some(bias) = compute_bias(&object_file, region) else {
            warn!(
                "No load segment of {} covers file offset {:#x}",
                region.name, region.file_offset
            );
            return;
        };
        let base_svma = object_file
            .segments()
            .map(|segment| segment.address())
            .min()
            .unwrap_or(0);
        let base_avma = base_svma.wrapping_add(bias);

        fn section_svma<'data>(section: &impl ObjectSection<'data>) -> Range<u64> {
            section.address()..section.address() + section.size()
        }
        fn section_data<'data>(section: &impl ObjectSection<'data>) -> Option<Vec<u8>> {
            Some(section.uncompressed_data().ok()?.to_vec())
        }

        let text = object_file.section_by_name(".text");
        let eh_frame = object_file.section_by_name(".eh_frame");
        let eh_frame_hdr = object_file.section_by_name(".eh_frame_hdr");
        let got = object_file.section_by_name(".got");

        let section_info = ExplicitModuleSectionInfo {
            base_svma,
            text_svma: text.as_ref().map(section_svma),
            text: text.as_ref().and_then(section_data),
            stubs_svma: None,
            stub_helper_svma: None,
            got_svma: got.as_ref().map(section_svma),
            unwind_info: None,
            eh_frame_svma: eh_frame.as_ref().map(section_svma),
            eh_frame: eh_frame.as_ref().and_then(section_data),
            eh_frame_hdr_svma: eh_frame_hdr.as_ref().map(section_svma),
            eh_frame_hdr: eh_frame_hdr.as_ref().and_then(section_data),
            debug_frame: None,
            text_segment_svma: None,
            text_segment: None,
        };

        self.unwinder.add_module(Module::new(
            region.name.clone(),
            region.start..region.end,
            base_avma,
            section_info,
        ));

        let mut functions: Vec<(u64, u64, String)> = object_file
            .symbols()
            .chain(object_file.dynamic_symbols())
            .filter(|symbol| symbol.kind() == object::SymbolKind::Text)
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some((
                    symbol.address().wrapping_add(bias),
                    symbol.size(),
                    name.to_string(),
                ))
            })
            .collect();
        functions.sort_by_key(|&(avma, _, _)| avma);
        functions.dedup_by_key(|&mut (avma, _, _)| avma);

        self.symbols.push(ModuleSymbols {
            avma_range: region.start..region.end,
            functions,
        });
    }

    fn find_function(&self, pc: u64) -> Option<(&str, u64)> {
        let module = self
            .symbols
            .iter()
            .find(|module| module.avma_range.contains(&pc))?;
        let index = match module
            .functions
            .binary_search_by_key(&pc, |&(avma, _, _)| avma)
        {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        let (avma, size, ref name) = module.functions[index];
        // Symbols without a recorded size extend to the next symbol.
        let end = if size > 0 {
            avma + size
        } else {
            module
                .functions
                .get(index + 1)
                .map(|&(next, _, _)| next)
                .unwrap_or(module.avma_range.end)
        };
        (pc < end).then(|| (name.as_str(), pc - avma))
    }
}

impl Default for FramehopUnwinder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallstackUnwinder for FramehopUnwinder {
    fn update_modules(&mut self, maps: &MapsSnapshot) {
        for region in maps.regions() {
            if !region.is_executable || !region.name.starts_with('/') {
                continue;
            }
            let key = (region.name.clone(), region.start);
            if self.added_modules.contains(&key) {
                continue;
            }
            self.add_module_for_region(region);
            self.added_modules.insert(key);
        }
    }

    fn unwind(
        &mut self,
        regs: &[u64; PERF_REG_COUNT],
        stack: &[u8],
        maps: &MapsSnapshot,
    ) -> Vec<FrameData> {
        let ip = regs[PERF_REG_X86_IP as usize];
        let sp = regs[PERF_REG_X86_SP as usize];
        let bp = regs[PERF_REG_X86_BP as usize];
        let unwind_regs = UnwindRegsX86_64::new(ip, sp, bp);

        let mut read_stack = |address: u64| -> Result<u64, ()> {
            let offset = address.checked_sub(sp).ok_or(())?;
            let index = usize::try_from(offset).map_err(|_| ())?;
            let bytes = stack.get(index..index + 8).ok_or(())?;
            Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
        };

        let mut pcs: Vec<u64> = Vec::new();
        let mut had_error = false;
        {
            let mut iterator =
                self.unwinder
                    .iter_frames(ip, unwind_regs, &mut self.cache, &mut read_stack);
            loop {
                match iterator.next() {
                    Ok(Some(frame)) => {
                        let pc = match frame {
                            FrameAddress::InstructionPointer(address) => address,
                            // Return addresses point after the call
                            // instruction; subtract 1 so the pc lands inside
                            // it.
                            FrameAddress::ReturnAddress(address) => u64::from(address) - 1,
                        };
                        pcs.push(pc);
                        if pcs.len() >= MAX_FRAMES {
                            had_error = true;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        had_error = true;
                        break;
                    }
                }
            }
        }

        let mut frames = Vec::with_capacity(pcs.len());
        for pc in pcs {
            let map_name = maps.name_of(pc).unwrap_or("").to_string();
            let (function_name, function_offset) = match self.find_function(pc) {
                Some((name, offset)) => (Some(name.to_string()), Some(offset)),
                None => (None, None),
            };
            frames.push(FrameData {
                pc,
                function_name,
                function_offset,
                map_name,
            });
        }

        // Samples inside a function instrumented with uretprobes hit the
        // trampoline, which has no unwind information. That error is
        // expected; keep the partial callstack in that case.
        if had_error
            && frames
                .last()
                .map_or(true, |frame| frame.map_name != UPROBES_MAP_NAME)
        {
            return Vec::new();
        }

        frames
    }
}

fn compute_bias(object_file: &object::File, region: &Region) -> Option<u64> {
    for segment in object_file.segments() {
        let (file_start, file_size) = segment.file_range();
        if region.file_offset >= file_start && region.file_offset < file_start + file_size.max(1)
        {
            let svma_of_mapping_start = segment.address() + (region.file_offset - file_start);
            return Some(region.start.wrapping_sub(svma_of_mapping_start));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinds_own_modules() {
        // Smoke test against the running process: load our own maps and make
        // sure the executable's modules are accepted by framehop.
        let pid = std::process::id() as i32;
        let maps_text = crate::procfs::read_maps(pid).unwrap();
        let maps = MapsSnapshot::parse(&maps_text);

        let mut unwinder = FramehopUnwinder::new();
        unwinder.update_modules(&maps);
        assert!(!unwinder.added_modules.is_empty());

        // An unwind from garbage registers must not panic; it reports an
        // error by returning no frames.
        let regs = [0u64; PERF_REG_COUNT];
        let frames = unwinder.unwind(&regs, &[], &maps);
        assert!(frames.is_empty());
    }
}
