//! Memory-mapped view of one kernel perf_event_open ring buffer.
//!
//! The kernel writes `data_head`, we write `data_tail`. Reads of the head use
//! acquire ordering, writes of the tail release ordering, so record bytes are
//! visible before the head moves and are not reclaimed before the tail moves.

use std::io;
use std::mem::{self, MaybeUninit};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use log::error;

use super::sys::{PerfEventHeader, PerfEventMmapPage};

pub struct PerfEventRingBuffer {
    mmap_start: *mut u8,
    mmap_length: usize,
    ring: *mut u8,
    size: u64,
    // The ring size is a power of two, so modulo is a mask and division is a
    // shift. The hot loop reads every record through these.
    size_log2: u32,
    fd: RawFd,
    name: String,
}

// The mapping is owned exclusively by this struct; the raw pointers are what
// make it !Send by default.
unsafe impl Send for PerfEventRingBuffer {}

impl PerfEventRingBuffer {
    /// Maps the ring buffer of `fd`. `size_kb * 1024` must be a power-of-two
    /// multiple of the page size; the kernel additionally requires one
    /// metadata page in front, so the total mapping is `1 + 2^n` pages.
    pub fn new(fd: RawFd, size_kb: u64, name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let data_length = (size_kb * 1024) as usize;
        if data_length < page_size || !(data_length as u64).is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("ring buffer size for '{name}' is not page_size * 2^n: {data_length}"),
            ));
        }
        let mmap_length = page_size + data_length;

        let mmap_start = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mmap_start == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let mmap_start = mmap_start as *mut u8;

        let metadata = mmap_start as *const PerfEventMmapPage;
        let (data_offset, data_size) = unsafe {
            let offset = ptr::read_volatile(&(*metadata).data_offset);
            let size = ptr::read_volatile(&(*metadata).data_size);
            if size != 0 {
                (offset as usize, size)
            } else {
                // Pre-4.1 kernels leave these fields zero; the data area
                // starts after the metadata page.
                (page_size, data_length as u64)
            }
        };

        Ok(PerfEventRingBuffer {
            mmap_start,
            mmap_length,
            ring: unsafe { mmap_start.add(data_offset) },
            size: data_size,
            size_log2: data_size.trailing_zeros(),
            fd,
            name,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn metadata(&self) -> *mut PerfEventMmapPage {
        self.mmap_start as *mut PerfEventMmapPage
    }

    fn data_head(&self) -> u64 {
        let head = unsafe { ptr::read_volatile(&(*self.metadata()).data_head) };
        fence(Ordering::Acquire);
        head
    }

    fn data_tail(&self) -> u64 {
        // No fence: we are the only writer of the tail.
        unsafe { ptr::read_volatile(&(*self.metadata()).data_tail) }
    }

    fn set_data_tail(&mut self, tail: u64) {
        fence(Ordering::AcqRel);
        unsafe { ptr::write_volatile(&mut (*self.metadata()).data_tail, tail) };
    }

    pub fn has_new_record(&self) -> bool {
        self.data_tail() + mem::size_of::<PerfEventHeader>() as u64 <= self.data_head()
    }

    /// Copies the header of the record at the tail. The record must be fully
    /// present; anything else means our accounting is broken.
    pub fn read_header(&self) -> PerfEventHeader {
        let header: PerfEventHeader = self.read_value_at_offset(0);
        assert_ne!(header.kind, 0, "corrupt record header in '{}'", self.name);
        assert!(
            self.data_tail() + header.size as u64 <= self.data_head(),
            "record not fully present in '{}'",
            self.name
        );
        header
    }

    /// Copies a value of known layout from the current record.
    pub fn read_value_at_offset<T: Copy>(&self, offset: u64) -> T {
        let mut value = MaybeUninit::<T>::uninit();
        self.read_at_offset_from_tail(
            value.as_mut_ptr() as *mut u8,
            offset,
            mem::size_of::<T>() as u64,
        );
        unsafe { value.assume_init() }
    }

    pub fn read_raw_at_offset(&self, dest: &mut [u8], offset: u64) {
        self.read_at_offset_from_tail(dest.as_mut_ptr(), offset, dest.len() as u64);
    }

    /// Advances the tail past the record, releasing its bytes to the kernel.
    pub fn skip_record(&mut self, header: &PerfEventHeader) {
        let tail = self.data_tail();
        self.set_data_tail(tail + header.size as u64);
    }

    /// Reads the whole record as `T`, then skips it.
    pub fn consume_record<T: Copy>(&mut self, header: &PerfEventHeader) -> T {
        // The record body begins after the header.
        let value = self.read_value_at_offset::<T>(mem::size_of::<PerfEventHeader>() as u64);
        self.skip_record(header);
        value
    }

    fn read_at_offset_from_tail(&self, dest: *mut u8, offset_from_tail: u64, count: u64) {
        let index = self.data_tail() + offset_from_tail;
        let modulo = index & (self.size - 1);

        if count > self.size {
            error!(
                "Reading more than the size of ring buffer '{}'",
                self.name
            );
            return;
        }
        if self.data_head() > self.data_tail() + self.size {
            // The kernel only overwrites unread data when the consumer does
            // not keep up; dedicated lost records will also report this.
            error!("Too slow reading from ring buffer '{}'", self.name);
        }

        let first_index_div = index >> self.size_log2;
        let last_index_div = (index + count - 1) >> self.size_log2;
        unsafe {
            if first_index_div == last_index_div {
                ptr::copy_nonoverlapping(self.ring.add(modulo as usize), dest, count as usize);
            } else {
                // The read spans the wrap point: two copies.
                let first_part = self.size - modulo;
                ptr::copy_nonoverlapping(
                    self.ring.add(modulo as usize),
                    dest,
                    first_part as usize,
                );
                ptr::copy_nonoverlapping(
                    self.ring,
                    dest.add(first_part as usize),
                    (count - first_part) as usize,
                );
            }
        }
    }
}

impl Drop for PerfEventRingBuffer {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.mmap_start as *mut libc::c_void, self.mmap_length) };
        if ret != 0 {
            error!(
                "munmap of ring buffer '{}': {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds a fake ring buffer over an anonymous mapping so that record
    // framing can be exercised without a perf fd. The "kernel side" writes
    // records and publishes the head exactly like the real producer.
    struct FakeRing {
        buffer: PerfEventRingBuffer,
        head: u64,
    }

    impl FakeRing {
        fn new(data_length: usize) -> Self {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            let mmap_length = page_size + data_length;
            let mmap_start = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    mmap_length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            } as *mut u8;
            assert_ne!(mmap_start as *mut libc::c_void, libc::MAP_FAILED);

            unsafe {
                let metadata = mmap_start as *mut PerfEventMmapPage;
                (*metadata).data_offset = page_size as u64;
                (*metadata).data_size = data_length as u64;
            }

            let buffer = PerfEventRingBuffer {
                mmap_start,
                mmap_length,
                ring: unsafe { mmap_start.add(page_size) },
                size: data_length as u64,
                size_log2: (data_length as u64).trailing_zeros(),
                fd: -1,
                name: "fake".to_string(),
            };
            FakeRing { buffer, head: 0 }
        }

        fn produce(&mut self, kind: u32, payload: &[u8]) {
            let size = (mem::size_of::<PerfEventHeader>() + payload.len()) as u16;
            let header = PerfEventHeader {
                kind,
                misc: 0,
                size,
            };
            let header_bytes = unsafe {
                std::slice::from_raw_parts(
                    &header as *const _ as *const u8,
                    mem::size_of::<PerfEventHeader>(),
                )
            };
            for &byte in header_bytes.iter().chain(payload) {
                let index = (self.head & (self.buffer.size - 1)) as usize;
                unsafe { *self.buffer.ring.add(index) = byte };
                self.head += 1;
            }
            unsafe {
                ptr::write_volatile(
                    &mut (*self.buffer.metadata()).data_head,
                    self.head,
                );
            }
        }
    }

    #[test]
    fn delivers_each_record_exactly_once() {
        let mut ring = FakeRing::new(4096);
        assert!(!ring.buffer.has_new_record());

        for i in 0..4u8 {
            ring.produce(9, &[i; 24]);
        }

        let mut seen = 0;
        while ring.buffer.has_new_record() {
            let header = ring.buffer.read_header();
            assert_eq!(header.kind, 9);
            assert_eq!(header.size as usize, 8 + 24);
            let first: u8 = ring.buffer.read_value_at_offset(8);
            assert_eq!(first, seen);
            ring.buffer.skip_record(&header);
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert!(!ring.buffer.has_new_record());
    }

    #[test]
    fn reads_across_the_wrap_point() {
        let mut ring = FakeRing::new(4096);

        // Fill most of the ring, consume it, then write a record that spans
        // the wrap.
        let filler = vec![0xAAu8; 4056];
        ring.produce(1, &filler);
        let header = ring.buffer.read_header();
        ring.buffer.skip_record(&header);

        let mut payload = vec![0u8; 64];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = i as u8;
        }
        ring.produce(9, &payload);

        let header = ring.buffer.read_header();
        let mut read_back = vec![0u8; 64];
        ring.buffer.read_raw_at_offset(&mut read_back, 8);
        assert_eq!(read_back, payload);
        ring.buffer.skip_record(&header);
        assert!(!ring.buffer.has_new_record());
    }

    #[test]
    fn consume_record_reads_and_skips() {
        let mut ring = FakeRing::new(4096);
        let payload = 0xDEADBEEF_u64.to_ne_bytes();
        ring.produce(2, &payload);

        let header = ring.buffer.read_header();
        let value: u64 = ring.buffer.consume_record(&header);
        assert_eq!(value, 0xDEADBEEF);
        assert!(!ring.buffer.has_new_record());
    }
}
