#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree, VirtualProtect},
        winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if mem.is_null() {
                    panic!("VirtualAlloc failed");
                }
                let mem = mem as *mut u8;
                Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        /// Re-enable reads and writes on a page range that may have been
        /// protected between collections.
        pub fn protect_rw(&self, page: *mut u8, size: usize) {
            unsafe {
                let mut old = 0;
                VirtualProtect(page.cast(), size, PAGE_READWRITE, &mut old);
            }
        }

        /// Make a page range fault on any access. Debugging aid for catching
        /// stray writes into the idle survivor half.
        pub fn protect_none(&self, page: *mut u8, size: usize) {
            unsafe {
                let mut old = 0;
                VirtualProtect(page.cast(), size, PAGE_NOACCESS, &mut old);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                VirtualFree(self.start.cast(), 0, MEM_RELEASE);
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub fn new(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    core::ptr::null_mut(),
                    size as _,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    panic!("mmap failed");
                }
                libc::madvise(map, size, libc::MADV_SEQUENTIAL);
                Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                }
            }
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        /// Re-enable reads and writes on a page range that may have been
        /// protected between collections.
        pub fn protect_rw(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::mprotect(page as *mut _, size as _, libc::PROT_READ | libc::PROT_WRITE);
            }
        }

        /// Make a page range fault on any access. Debugging aid for catching
        /// stray writes into the idle survivor half.
        pub fn protect_none(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::mprotect(page as *mut _, size as _, libc::PROT_NONE);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.start() as *mut _, self.size as _);
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;
