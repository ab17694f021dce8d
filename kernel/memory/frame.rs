use core::ptr::NonNull;

use component::util::human_size;
use logger::{debug, info};
use qemu_config::RAM_END;

use super::address::PhysPageNum;
use crate::sync::unicore::UPSafeCell;
use crate::{PAGE_SIZE, PAGE_SIZE_BITS};

/// 空闲物理页组成链上的一段连续区间
/// 节点就放在区间第一页的开头, 空闲页反正没人用, 不用再去堆上要内存
#[repr(C)]
struct ChunkNode {
    next: Option<NonNull<ChunkNode>>,
    first_ppn: usize,
    pagecnt: usize,
}

/// 最佳适配的空闲页分配器, 释放时不做合并
pub struct ChunkFrameAllocator {
    head: Option<NonNull<ChunkNode>>,
}

unsafe impl Send for ChunkFrameAllocator {}

lazy_static! {
    static ref FRAME_ALLOCATOR: UPSafeCell<ChunkFrameAllocator> = {
        info!("FRAME_ALLOCATOR initializing...");
        unsafe { UPSafeCell::new(ChunkFrameAllocator { head: None }) }
    };
}

pub fn page_addr(ppn: PhysPageNum) -> usize {
    ppn.0 << PAGE_SIZE_BITS
}

pub fn ppn_of(addr: usize) -> PhysPageNum {
    assert_eq!(addr % PAGE_SIZE, 0);
    PhysPageNum(addr >> PAGE_SIZE_BITS)
}

impl ChunkFrameAllocator {
    /// 把一段页区间写成链表节点挂到表头
    unsafe fn push_chunk(&mut self, first_ppn: usize, pagecnt: usize) {
        let node = page_addr(PhysPageNum(first_ppn)) as *mut ChunkNode;
        (*node).next = self.head;
        (*node).first_ppn = first_ppn;
        (*node).pagecnt = pagecnt;
        self.head = NonNull::new(node);
    }

    /// 最佳适配: 找能装下 n 页的最小区间, 从它前端切下来
    fn alloc(&mut self, cnt: usize) -> Option<PhysPageNum> {
        if cnt == 0 {
            return None;
        }

        // 先找最佳区间以及它的前驱
        let mut best: Option<NonNull<ChunkNode>> = None;
        let mut best_prev: Option<NonNull<ChunkNode>> = None;
        unsafe {
            let mut prev: Option<NonNull<ChunkNode>> = None;
            let mut cur = self.head;
            while let Some(node) = cur {
                let n = node.as_ref();
                if n.pagecnt >= cnt
                    && best.map(|b| n.pagecnt < b.as_ref().pagecnt).unwrap_or(true)
                {
                    best = cur;
                    best_prev = prev;
                }
                prev = cur;
                cur = n.next;
            }
        }

        let best = best?;
        unsafe {
            let node = best.as_ref();
            let start_ppn = node.first_ppn;
            if node.pagecnt == cnt {
                // 正好用完, 整个节点摘下
                match best_prev {
                    Some(mut p) => p.as_mut().next = node.next,
                    None => self.head = node.next,
                }
            } else {
                // 从前端切下 cnt 页, 节点跟着搬到剩余区间的第一页
                let moved = page_addr(PhysPageNum(start_ppn + cnt)) as *mut ChunkNode;
                (*moved).next = node.next;
                (*moved).first_ppn = start_ppn + cnt;
                (*moved).pagecnt = node.pagecnt - cnt;
                let moved = NonNull::new_unchecked(moved);
                match best_prev {
                    Some(mut p) => p.as_mut().next = Some(moved),
                    None => self.head = Some(moved),
                }
            }
            Some(PhysPageNum(start_ppn))
        }
    }

    /// 头插一个新区间, 不与相邻区间合并
    fn dealloc(&mut self, ppn: PhysPageNum, cnt: usize) {
        if cnt == 0 {
            return;
        }
        unsafe { self.push_chunk(ppn.0, cnt) };
    }

    fn free_count(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        while let Some(node) = cur {
            unsafe {
                total += node.as_ref().pagecnt;
                cur = node.as_ref().next;
            }
        }
        total
    }
}

/// 堆喂饱之后, 从堆尾到 RAM 结尾的区域整段入池
pub fn init_frame_allocator() {
    let free_start = super::heap::initial_heap_range().end;
    let free_end = RAM_END;
    assert_eq!(0, free_start % PAGE_SIZE, "unaligned free_start: {}", free_start);
    assert!(free_start < free_end, "no free RAM for page allocator");

    info!(
        "Free page pool: [{:#x}..{:#x}), size: {}",
        free_start,
        free_end,
        human_size(free_end - free_start)
    );

    FRAME_ALLOCATOR
        .exclusive_access()
        .dealloc(ppn_of(free_start), (free_end - free_start) >> PAGE_SIZE_BITS);
}

pub fn alloc_phys_page() -> Option<PhysPageNum> {
    alloc_phys_pages(1)
}

pub fn alloc_phys_pages(cnt: usize) -> Option<PhysPageNum> {
    let ppn = FRAME_ALLOCATOR.exclusive_access().alloc(cnt);
    if ppn.is_none() {
        debug!("alloc_phys_pages({}) failed, pool dry", cnt);
    }
    ppn
}

/// 分配并清零一页
pub fn alloc_zeroed_page() -> Option<PhysPageNum> {
    let ppn = alloc_phys_page()?;
    ppn.get_bytes_array().fill(0);
    Some(ppn)
}

pub fn free_phys_page(ppn: PhysPageNum) {
    free_phys_pages(ppn, 1);
}

pub fn free_phys_pages(ppn: PhysPageNum, cnt: usize) {
    FRAME_ALLOCATOR.exclusive_access().dealloc(ppn, cnt);
}

pub fn free_phys_page_count() -> usize {
    FRAME_ALLOCATOR.exclusive_access().free_count()
}
