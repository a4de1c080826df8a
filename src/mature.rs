use std::cell::Cell;

use crate::api::{HeapObjectHeader, MIN_ALLOCATION};
use crate::heap::align_usize;
use crate::mmap::Mmap;

/// The mature generation as seen by the young collector.
///
/// Promotion is assumed infallible: an implementation that cannot make room
/// must grow or abort, it may not report failure back into the middle of a
/// scavenge.
pub trait MatureSpace {
    /// Copies `obj`'s raw bytes into the mature heap and returns the new
    /// header. The caller writes the forwarding record into the original.
    fn promote_object(&mut self, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader;

    fn contains(&self, addr: *const u8) -> bool;
}

const MATURE_BLOCK_SIZE: usize = 256 * 1024;

struct Block {
    map: Mmap,
    top: Cell<usize>,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            map: Mmap::new(size),
            top: Cell::new(0),
        }
    }

    fn allocate(&self, bytes: usize) -> *mut u8 {
        let top = self.top.get();
        if top + bytes > self.map.size() {
            return std::ptr::null_mut();
        }
        self.top.set(top + bytes);
        unsafe { self.map.start().add(top) }
    }
}

/// Bump-allocated block list, enough of a mature heap to host promotions.
/// Real runtimes plug in their own old-space collector instead.
pub struct SimpleMatureSpace {
    blocks: Vec<Block>,
    bytes_promoted: usize,
}

impl SimpleMatureSpace {
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::new(MATURE_BLOCK_SIZE)],
            bytes_promoted: 0,
        }
    }

    pub fn bytes_promoted(&self) -> usize {
        self.bytes_promoted
    }

    fn allocate(&mut self, bytes: usize) -> *mut u8 {
        let mem = self.blocks.last().map(|b| b.allocate(bytes)).unwrap_or(std::ptr::null_mut());
        if !mem.is_null() {
            return mem;
        }
        self.blocks
            .push(Block::new(MATURE_BLOCK_SIZE.max(align_usize(bytes, 4096))));
        self.blocks.last().map(|b| b.allocate(bytes)).unwrap_or(std::ptr::null_mut())
    }
}

impl Default for SimpleMatureSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl MatureSpace for SimpleMatureSpace {
    fn promote_object(&mut self, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        unsafe {
            let size = align_usize((*obj).size(), MIN_ALLOCATION);
            let mem = self.allocate(size);
            if mem.is_null() {
                eprintln!("out of memory promoting {} bytes at {:p}", size, obj);
                std::process::abort();
            }
            std::ptr::copy_nonoverlapping(obj.cast::<u8>(), mem, (*obj).size());
            self.bytes_promoted += size;
            let header = mem.cast::<HeapObjectHeader>();
            (*header).clear_age();
            (*header).clear_remember();
            header
        }
    }

    fn contains(&self, addr: *const u8) -> bool {
        self.blocks
            .iter()
            .any(|b| addr >= b.map.start() as *const u8 && addr < b.map.end() as *const u8)
    }
}
