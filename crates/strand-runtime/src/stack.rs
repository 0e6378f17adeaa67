//! Fiber stack allocation
//!
//! Each fiber gets an anonymous mmap'd region with a PROT_NONE guard page at
//! the low end, so stack overflow faults instead of corrupting a neighbor.

use strand_core::{RuntimeError, RuntimeResult};

/// An owned, guard-paged fiber stack.
pub struct FiberStack {
    base: *mut u8,
    total: usize,
}

unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

impl FiberStack {
    /// Map a stack of at least `size` usable bytes plus one guard page.
    pub fn allocate(size: usize) -> RuntimeResult<Self> {
        let page = page_size();
        let usable = (size + page - 1) & !(page - 1);
        let total = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let errno = unsafe { *libc::__errno_location() };
            return Err(RuntimeError::StackAlloc(errno));
        }

        // Guard page at the low end (stacks grow down).
        let rt = unsafe { libc::mprotect(base, page, libc::PROT_NONE) };
        if rt != 0 {
            let errno = unsafe { *libc::__errno_location() };
            unsafe { libc::munmap(base, total) };
            return Err(RuntimeError::StackAlloc(errno));
        }

        Ok(Self {
            base: base as *mut u8,
            total,
        })
    }

    /// High end of the mapping; the initial stack pointer starts here.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes (mapping minus the guard page).
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total - page_size()
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}
