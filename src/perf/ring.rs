//! Raw mmap'd ring-buffer plumbing for the BTS performance counter.
//!
//! Models the data ring (control page + sample ring, unused by this driver
//! beyond reading `data_offset`/`data_size` to locate the aux ring) and the
//! aux ring (where BTS actually deposits branch records) as byte-aligned
//! mappings plus explicit sequentially-consistent atomic accessors, per the
//! design note in spec §9 ("Raw pointer arithmetic over mmap"). Uses raw
//! `libc::mmap`/`munmap` rather than a higher-level wrapper, the same way
//! the teacher's `ConfigTarget` reaches for `nix::libc` directly for the
//! syscalls not worth wrapping.

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use perf_event_open_sys::bindings::perf_event_mmap_page;

use super::RawBranch;

/// `PERF_MAP_PG` in the reference: data-ring page count, excluding the
/// leading control page.
pub const DATA_PAGES: usize = 512;
/// `PERF_AUX_PG` in the reference: aux-ring page count.
pub const AUX_PAGES: usize = 1024;

fn page_size() -> usize {
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Atomically loads a `u64` field of the shared control page with
/// sequentially-consistent ordering, as the hardware-facing contract
/// requires.
///
/// # Safety
/// `ptr` must point at a valid, live, 8-byte-aligned `u64` for the duration
/// of the call.
unsafe fn atomic_load(ptr: *const u64) -> u64 {
    let value = (*(ptr as *const AtomicU64)).load(Ordering::SeqCst);
    // Mandatory read barrier on x86_64 between the aux_head load and the
    // subsequent reads of the records it bounds (spec §4.D/§9).
    fence(Ordering::Acquire);
    value
}

/// # Safety
/// Same precondition as [`atomic_load`].
unsafe fn atomic_store(ptr: *mut u64, value: u64) {
    (*(ptr as *const AtomicU64)).store(value, Ordering::SeqCst);
}

unsafe fn raw_mmap(len: usize, prot: i32, fd: RawFd, offset: i64) -> io::Result<NonNull<u8>> {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        len,
        prot,
        libc::MAP_SHARED,
        fd,
        offset,
    );
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(NonNull::new(ptr as *mut u8).expect("mmap succeeded but returned null"))
}

unsafe fn raw_munmap(ptr: NonNull<u8>, len: usize) {
    libc::munmap(ptr.as_ptr() as *mut _, len);
}

/// Owns the two mmap'd regions tied to one BTS performance-event file
/// descriptor: the control-page-plus-data ring, and the aux ring BTS
/// actually writes branch records into.
pub struct RingMapping {
    data: NonNull<u8>,
    data_len: usize,
    aux: NonNull<u8>,
    aux_len: usize,
}

impl RingMapping {
    /// Maps the data ring `(DATA_PAGES+1)` pages, reads `data_offset`/
    /// `data_size` from the resulting control page, then maps the aux ring
    /// immediately following it.
    ///
    /// # Safety
    /// `fd` must be a freshly-opened, not-yet-enabled perf-event file
    /// descriptor for a BTS counter.
    pub unsafe fn new(fd: RawFd) -> io::Result<Self> {
        let page = page_size();
        let data_len = page * (DATA_PAGES + 1);

        let data = raw_mmap(data_len, libc::PROT_READ | libc::PROT_WRITE, fd, 0)?;

        let control = data.as_ptr() as *mut perf_event_mmap_page;
        let data_offset = (*control).data_offset;
        let data_size = (*control).data_size;
        let aux_offset = data_offset + data_size;
        let aux_len = page * AUX_PAGES;

        (*control).aux_offset = aux_offset;
        (*control).aux_size = aux_len as u64;

        let aux = match raw_mmap(aux_len, libc::PROT_READ, fd, aux_offset as i64) {
            Ok(ptr) => ptr,
            Err(e) => {
                raw_munmap(data, data_len);
                return Err(e);
            }
        };

        Ok(Self {
            data,
            data_len,
            aux,
            aux_len,
        })
    }

    fn control(&self) -> *mut perf_event_mmap_page {
        self.data.as_ptr() as *mut perf_event_mmap_page
    }

    /// Sequentially-consistent load of `aux_head`, followed by the mandated
    /// read barrier.
    pub fn aux_head(&self) -> u64 {
        // SAFETY: `control()` points at the live control page for the
        // lifetime of `self`.
        unsafe { atomic_load(&(*self.control()).aux_head as *const u64) }
    }

    /// The valid branch records currently in the aux ring:
    /// `[aux_base, aux_base + aux_head)`, interpreted as `RawBranch`es.
    pub fn branches(&self) -> &[RawBranch] {
        let head = self.aux_head();
        let count = head as usize / std::mem::size_of::<RawBranch>();
        // SAFETY: the aux mapping is at least `aux_len` bytes and `head` is
        // always `<= aux_size` by construction of the perf ABI.
        unsafe { std::slice::from_raw_parts(self.aux.as_ptr() as *const RawBranch, count) }
    }

    /// Zeroes the data and aux ring head/tail pointers, as the reference
    /// does after reaping the final batch.
    pub fn reset_pointers(&self) {
        // SAFETY: see `aux_head`.
        unsafe {
            let control = self.control();
            atomic_store(&mut (*control).data_head as *mut u64, 0);
            atomic_store(&mut (*control).data_tail as *mut u64, 0);
            atomic_store(&mut (*control).aux_head as *mut u64, 0);
            atomic_store(&mut (*control).aux_tail as *mut u64, 0);
        }
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        // SAFETY: both mappings were created by `new` and are only unmapped
        // once, here.
        unsafe {
            raw_munmap(self.aux, self.aux_len);
            raw_munmap(self.data, self.data_len);
        }
    }
}

// The mapping is only ever touched from the single thread that owns the
// trace session; `Send` is required to store it in a struct moved across
// the fork boundary before the child execs.
unsafe impl Send for RingMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_plausible() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert_eq!(ps % 4096, 0);
    }
}
