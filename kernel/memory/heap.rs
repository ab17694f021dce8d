use core::alloc::{GlobalAlloc, Layout};
use core::ops::Range;

use component::util::human_size;
use logger::{debug, info};
use spin::Mutex;

use super::frame;
use super::kernel_view::get_kernel_view;
use crate::{HEAP_ALIGN, HEAP_ALLOC_MAX, PAGE_SIZE};

// 分配头与释放记录的魔数, 用来抓 use-after-free 和越界写
const HEAP_ALLOC_MAGIC: u32 = 0xEAEA_EAEA;
const HEAP_FREE_MAGIC: u32 = 0x2525_2525;

// 初始堆池至少这么大
const HEAP_INIT_MIN: usize = 256;

//        +----------------+----------------+
//        |  ALLOC_MAGIC   |      size      |
//        +----------------+----------------+
//        |   size_inv     |    alloc_ra    |
// ptr -> +----------------+----------------+
//        |  FREE_MAGIC    |    free_ra     |
//        +---------------------------------+

#[repr(C)]
struct AllocHeader {
    magic: u32,
    size: u32,
    size_inv: u32,
    ra32: u32,
}

#[repr(C)]
struct FreeRecord {
    magic: u32,
    ra32: u32,
}

const HDR_SIZE: usize = core::mem::size_of::<AllocHeader>();

/// 双水位凸出式分配器: 从池子的高端往下切, free 不回收内存,
/// 只承诺返回的块互不重叠且 16 字节对齐. 池子不够就再向页分配器要
struct KernelHeap {
    low: usize,
    end: usize,
}

impl KernelHeap {
    const fn empty() -> Self {
        Self { low: 0, end: 0 }
    }

    fn init(&mut self, start: usize, end: usize) {
        assert!(HEAP_ALIGN.is_power_of_two());
        let start = (start + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);
        let end = end & !(HEAP_ALIGN - 1);
        assert!(start < end);
        self.low = start;
        self.end = end;
    }

    unsafe fn malloc(&mut self, size: usize, ra: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let size = (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);
        if size > HEAP_ALLOC_MAX {
            panic!("kmalloc request too large: {}", size);
        }

        let ptr;
        if size + HDR_SIZE <= self.end - self.low {
            // 当前池子够用
            ptr = self.end - size;
            self.end = ptr - HDR_SIZE;
        } else {
            // 池子不够, 向页分配器再要一块
            let npages = (size + HDR_SIZE + PAGE_SIZE - 1) / PAGE_SIZE;
            let block = match frame::alloc_phys_pages(npages) {
                Some(ppn) => frame::page_addr(ppn),
                None => return core::ptr::null_mut(),
            };
            let block_end = block + npages * PAGE_SIZE;
            ptr = block_end - size;
            // 要么换到新块 (剩得多), 要么只从新块里切这一份, 老池子接着用
            let leftover = block_end - block - size - HDR_SIZE;
            if self.end - self.low < leftover {
                self.end = ptr - HDR_SIZE;
                self.low = block;
            }
        }

        let hdr = (ptr - HDR_SIZE) as *mut AllocHeader;
        (*hdr).magic = HEAP_ALLOC_MAGIC;
        (*hdr).size = size as u32;
        (*hdr).size_inv = !(size as u32);
        (*hdr).ra32 = ra as u32;

        core::ptr::write_bytes(ptr as *mut u8, 0x33, size);
        ptr as *mut u8
    }

    unsafe fn free(&mut self, ptr: *mut u8, ra: usize) {
        let hdr = (ptr as usize - HDR_SIZE) as *mut AllocHeader;
        let rec = ptr as *mut FreeRecord;

        // 完整性检查
        if (*hdr).size != !(*hdr).size_inv {
            if (*hdr).magic != HEAP_ALLOC_MAGIC {
                panic!("kfree: corrupt heap header at {:p}", ptr);
            } else if (*hdr).size_inv == 0 && (*rec).magic == HEAP_FREE_MAGIC {
                panic!("kfree: double free at {:p}", ptr);
            } else {
                panic!("kfree: heap overrun at {:p}", ptr);
            }
        }

        let size = (*hdr).size as usize;
        core::ptr::write_bytes(
            ptr.add(core::mem::size_of::<FreeRecord>()),
            0x11,
            size - core::mem::size_of::<FreeRecord>(),
        );
        (*rec).magic = HEAP_FREE_MAGIC;
        (*rec).ra32 = ra as u32;
        (*hdr).size_inv = 0;
    }
}

struct LockedKernelHeap(Mutex<KernelHeap>);

#[global_allocator]
static HEAP_ALLOCATOR: LockedKernelHeap = LockedKernelHeap(Mutex::new(KernelHeap::empty()));

#[inline(always)]
fn caller_ra() -> usize {
    let ra: usize;
    unsafe { core::arch::asm!("mv {}, ra", out(reg) ra) };
    ra
}

// ISR 里也会分配 (就绪队列扩容之类), 持有堆锁期间必须关中断,
// 不然中断打进来再进分配器就在自旋锁上转死了
unsafe impl GlobalAlloc for LockedKernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        assert!(
            layout.align() <= HEAP_ALIGN,
            "unsupported heap alignment {}",
            layout.align()
        );
        let ra = caller_ra();
        let pie = crate::intr::disable_interrupts();
        let ptr = self.0.lock().malloc(layout.size(), ra);
        crate::intr::restore_interrupts(pie);
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let ra = caller_ra();
        let pie = crate::intr::disable_interrupts();
        self.0.lock().free(ptr, ra);
        crate::intr::restore_interrupts(pie);
    }
}

#[alloc_error_handler]
pub fn handle_alloc_error(layout: Layout) -> ! {
    panic!("Heap allocation error, layout = {:?}", layout);
}

/// 内核映像结尾到下一个页边界之间的零头喂给堆做初始池
pub fn init_heap() {
    let heap_range = initial_heap_range();
    HEAP_ALLOCATOR
        .0
        .lock()
        .init(heap_range.start, heap_range.end);

    info!(
        "Heap allocator: [{:#x}..{:#x}): {} free",
        heap_range.start,
        heap_range.end,
        heap_range.len()
    );
}

pub fn initial_heap_range() -> Range<usize> {
    let start = get_kernel_view().kernel_end();
    let mut end = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    if end - start < HEAP_INIT_MIN {
        end += PAGE_SIZE;
    }
    start..end
}

pub fn heap_test() {
    use alloc::boxed::Box;
    use alloc::string::String;
    use alloc::vec::Vec;

    debug!("testing heap allocator");

    let a = Box::new(5);
    assert_eq!(*a, 5);
    drop(a);

    let mut v: Vec<usize> = Vec::new();
    for i in 0..500 {
        v.push(i);
    }
    for (i, item) in v.iter().enumerate() {
        assert_eq!(*item, i);
    }
    drop(v);

    let mut s = String::new();
    s.push_str("random string");
    s.remove(3);
    assert_eq!(s, "ranom string");
    drop(s);

    info!(
        "Heap test passed! String, Vec and friends are available, {} of pages free",
        human_size(frame::free_phys_page_count() * crate::PAGE_SIZE)
    );
}
