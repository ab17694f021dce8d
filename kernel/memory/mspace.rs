use core::ops::Range;
use core::sync::atomic::{AtomicUsize, Ordering};

use logger::{debug, info};
use qemu_config::{RAM_END, RAM_START};
use riscv::register::{satp, sstatus};
use sys_interface::syserr;

use super::address::*;
use super::frame;
use super::kernel_view::get_kernel_view;
use super::page_table::{PTEFlags, PageTable, PageTableEntry};
use crate::{SysError, SysResult, PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};

/// 地址空间标签: 直接就是 satp 的值 {MODE, ASID, 根页表页号}
pub type MTag = usize;

const MEGA_SIZE: usize = (1 << 9) * PAGE_SIZE;
const GIGA_SIZE: usize = (1 << 9) * MEGA_SIZE;

const PTE_CNT: usize = 512;

// 主地址空间的三张静态页表, 启动时填好, 之后只增不改
#[repr(C, align(4096))]
struct PtFrame([PageTableEntry; PTE_CNT]);

static mut MAIN_PT2: PtFrame = PtFrame([PageTableEntry { bits: 0 }; PTE_CNT]);
static mut MAIN_PT1: PtFrame = PtFrame([PageTableEntry { bits: 0 }; PTE_CNT]);
static mut MAIN_PT0: PtFrame = PtFrame([PageTableEntry { bits: 0 }; PTE_CNT]);

static MAIN_MTAG: AtomicUsize = AtomicUsize::new(0);

fn vpn2(vma: usize) -> usize {
    (vma >> 30) & 0x1FF
}
fn vpn1(vma: usize) -> usize {
    (vma >> 21) & 0x1FF
}
fn vpn0(vma: usize) -> usize {
    (vma >> 12) & 0x1FF
}

fn mtag_of(root: PhysPageNum) -> MTag {
    // MODE=8 即 Sv39, ASID 恒 0
    8usize << 60 | root.0
}

fn mtag_root(mtag: MTag) -> PhysPageNum {
    PhysPageNum(mtag & ((1usize << 44) - 1))
}

/// 用户半区占据的二级页表槽位
fn user_l2_slots() -> Range<usize> {
    vpn2(UMEM_START_VMA)..vpn2(UMEM_END_VMA - 1) + 1
}

pub fn main_mtag() -> MTag {
    MAIN_MTAG.load(Ordering::Relaxed)
}

pub fn active_mspace() -> MTag {
    satp::read().bits()
}

pub fn switch_mspace(mtag: MTag) -> MTag {
    let prev = active_mspace();
    unsafe {
        satp::write(mtag);
        riscv::asm::sfence_vma_all();
    }
    prev
}

pub fn reset_active_mspace() {
    unsafe {
        satp::write(main_mtag());
        riscv::asm::sfence_vma_all();
    }
}

fn active_root() -> PageTable {
    PageTable::from_root(mtag_root(active_mspace()))
}

/// 建立主地址空间并开分页:
///
///         0 到 RAM_START:           RW 吉页 (MMIO 区)
/// RAM_START 到内核映像尾:           按段给权限的 4K 页
/// 映像尾 到 RAM_START+MEGA:         RW 页 (堆与空闲池开头)
/// RAM_START+MEGA 到 RAM_END:        RW 兆页 (空闲页池)
pub fn init_kernel_space() {
    let kernel_view = get_kernel_view();
    let text = kernel_view.text_range();
    let rodata = kernel_view.rodata_range();
    let data_start = kernel_view.data_range().start;

    // 内核必须装进一个 2MB 兆页 (一个一级页表项)
    assert!(kernel_view.kernel_end() - RAM_START <= MEGA_SIZE);

    unsafe {
        let pt2 = &mut (*core::ptr::addr_of_mut!(MAIN_PT2)).0;
        let pt1 = &mut (*core::ptr::addr_of_mut!(MAIN_PT1)).0;
        let pt0 = &mut (*core::ptr::addr_of_mut!(MAIN_PT0)).0;

        // MMIO 区: 两个吉页恒等映射
        let mut pma = 0usize;
        while pma < RAM_START {
            pt2[vpn2(pma)] = PageTableEntry::leaf(
                PhysAddr::from(pma).floor(),
                PTEFlags::R | PTEFlags::W | PTEFlags::G,
            );
            pma += GIGA_SIZE;
        }

        // RAM 所在的吉区间挂二级子表
        pt2[vpn2(RAM_START)] =
            PageTableEntry::ptab(PhysAddr::from(pt1.as_ptr() as usize).floor(), PTEFlags::G);

        // RAM 第一个兆区间按内核映像分段映射
        pt1[vpn1(RAM_START)] =
            PageTableEntry::ptab(PhysAddr::from(pt0.as_ptr() as usize).floor(), PTEFlags::G);

        let mut pp = text.start;
        while pp < text.end {
            pt0[vpn0(pp)] = PageTableEntry::leaf(
                PhysAddr::from(pp).floor(),
                PTEFlags::R | PTEFlags::X | PTEFlags::G,
            );
            pp += PAGE_SIZE;
        }
        let mut pp = rodata.start;
        while pp < rodata.end {
            pt0[vpn0(pp)] =
                PageTableEntry::leaf(PhysAddr::from(pp).floor(), PTEFlags::R | PTEFlags::G);
            pp += PAGE_SIZE;
        }
        let mut pp = data_start;
        while pp < RAM_START + MEGA_SIZE {
            pt0[vpn0(pp)] = PageTableEntry::leaf(
                PhysAddr::from(pp).floor(),
                PTEFlags::R | PTEFlags::W | PTEFlags::G,
            );
            pp += PAGE_SIZE;
        }

        // 剩余 RAM 全部走兆页
        let mut pp = RAM_START + MEGA_SIZE;
        while pp < RAM_END {
            pt1[vpn1(pp)] = PageTableEntry::leaf(
                PhysAddr::from(pp).floor(),
                PTEFlags::R | PTEFlags::W | PTEFlags::G,
            );
            pp += MEGA_SIZE;
        }

        let mtag = mtag_of(PhysAddr::from(pt2.as_ptr() as usize).floor());
        MAIN_MTAG.store(mtag, Ordering::Relaxed);
        satp::write(mtag);
        riscv::asm::sfence_vma_all();

        // 允许 S 态访问带 U 位的页, 系统调用要直接读写用户缓冲区
        sstatus::set_sum();
    }

    info!(
        "Paging on, main_mtag = {:#x}, user L2 slots = {:?}",
        main_mtag(),
        user_l2_slots()
    );
}

/// 新的用户地址空间: 鲜根表, 内核半区的二级页表项逐个指针拷贝,
/// 用户半区留空
pub fn create_user_mspace() -> Option<MTag> {
    let root = frame::alloc_zeroed_page()?;
    let new = root.get_pte_array();
    let old = mtag_root(main_mtag()).get_pte_array();
    let user = user_l2_slots();
    for i in 0..PTE_CNT {
        if !user.contains(&i) {
            new[i] = old[i];
        }
    }
    Some(mtag_of(root))
}

/// 急切深拷贝当前空间的用户半区:
/// 每一级中间表都换新的, 每个叶子页分新页并拷贝内容, 权限位原样保留
/// 内核半区仍然是指针拷贝共享
pub fn clone_active_mspace() -> Option<MTag> {
    let old_root = mtag_root(active_mspace()).get_pte_array();
    let root = frame::alloc_zeroed_page()?;
    let new_root = root.get_pte_array();
    let user = user_l2_slots();

    for i in 0..PTE_CNT {
        if !user.contains(&i) {
            new_root[i] = old_root[i];
            continue;
        }
        let l2e = old_root[i];
        if !l2e.valid() || l2e.is_leaf() {
            continue;
        }
        let new_l1_ppn = frame::alloc_zeroed_page()?;
        let old_l1 = l2e.ppn().get_pte_array();
        let new_l1 = new_l1_ppn.get_pte_array();
        for j in 0..PTE_CNT {
            let l1e = old_l1[j];
            if !l1e.valid() || l1e.is_leaf() {
                continue;
            }
            let new_l0_ppn = frame::alloc_zeroed_page()?;
            let old_l0 = l1e.ppn().get_pte_array();
            let new_l0 = new_l0_ppn.get_pte_array();
            for k in 0..PTE_CNT {
                let l0e = old_l0[k];
                if !l0e.valid() || !l0e.is_leaf() {
                    continue;
                }
                let page = frame::alloc_phys_page()?;
                page.get_bytes_array()
                    .copy_from_slice(l0e.ppn().get_bytes_array());
                new_l0[k] = PageTableEntry::leaf(
                    page,
                    l0e.flags()
                        & (PTEFlags::R | PTEFlags::W | PTEFlags::X | PTEFlags::U | PTEFlags::G),
                );
            }
            new_l1[j] = PageTableEntry::ptab(new_l0_ppn, l1e.flags());
        }
        new_root[i] = PageTableEntry::ptab(new_l1_ppn, l2e.flags());
    }

    Some(mtag_of(root))
}

/// 释放当前空间的用户半区叶子页与所有中间表, 然后切回主空间
/// 主空间自身不可释放
pub fn discard_active_mspace() -> MTag {
    let cur = active_mspace();
    if cur == main_mtag() {
        return cur;
    }

    let root_ppn = mtag_root(cur);
    let root = root_ppn.get_pte_array();
    for i in user_l2_slots() {
        let l2e = root[i];
        if !l2e.valid() || l2e.is_leaf() {
            continue;
        }
        let l1 = l2e.ppn().get_pte_array();
        for j in 0..PTE_CNT {
            let l1e = l1[j];
            if !l1e.valid() || l1e.is_leaf() {
                continue;
            }
            let l0 = l1e.ppn().get_pte_array();
            for k in 0..PTE_CNT {
                let l0e = l0[k];
                if l0e.valid() && l0e.is_leaf() {
                    frame::free_phys_page(l0e.ppn());
                }
            }
            frame::free_phys_page(l1e.ppn());
        }
        frame::free_phys_page(l2e.ppn());
    }

    // 根表先退役再归还: 释放会往页开头写空闲链节点,
    // 而 satp 此刻还指着它
    reset_active_mspace();
    frame::free_phys_page(root_ppn);
    main_mtag()
}

/// 把一个物理页映射到当前空间的 vma 上
pub fn map_page(vma: usize, ppn: PhysPageNum, flags: PTEFlags) -> SysResult<()> {
    if !wellformed(vma) || vma % PAGE_SIZE != 0 {
        return Err(SysError(syserr::EINVAL));
    }
    let pte = active_root()
        .walk_create(VirtAddr(vma).floor(), true)
        .ok_or(SysError(syserr::ENOMEM))?;
    *pte = PageTableEntry::leaf(ppn, flags);
    unsafe { riscv::asm::sfence_vma_all() };
    Ok(())
}

pub fn map_range(vma: usize, size: usize, first_ppn: PhysPageNum, flags: PTEFlags) -> SysResult<()> {
    if size == 0 {
        return Err(SysError(syserr::EINVAL));
    }
    let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    for i in 0..npages {
        map_page(vma + i * PAGE_SIZE, PhysPageNum(first_ppn.0 + i), flags)?;
    }
    Ok(())
}

/// 分配一段新鲜物理页并映射过去, 返回 vma
pub fn alloc_and_map_range(vma: usize, size: usize, flags: PTEFlags) -> SysResult<usize> {
    assert!(size != 0, "alloc_and_map_range: size 0");
    let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let first = frame::alloc_phys_pages(npages).ok_or(SysError(syserr::ENOMEM))?;
    map_range(vma, size, first, flags)?;
    Ok(vma)
}

/// 改一段已映射范围的 R/W/X/U/G 位, 没映射的页跳过
pub fn set_range_flags(vma: usize, size: usize, flags: PTEFlags) {
    let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let root = active_root();
    for i in 0..npages {
        if let Some(pte) = root.walk_create(VirtAddr(vma + i * PAGE_SIZE).floor(), false) {
            if pte.valid() && pte.is_leaf() {
                pte.set_rwxug(flags);
            }
        }
    }
    unsafe { riscv::asm::sfence_vma_all() };
}

/// 解除映射并归还物理页, 没映射的页跳过
pub fn unmap_and_free_range(vma: usize, size: usize) {
    let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
    let root = active_root();
    for i in 0..npages {
        if let Some(pte) = root.walk_create(VirtAddr(vma + i * PAGE_SIZE).floor(), false) {
            if pte.valid() && pte.is_leaf() {
                frame::free_phys_page(pte.ppn());
                *pte = PageTableEntry::empty();
            }
        }
    }
    unsafe { riscv::asm::sfence_vma_all() };
}

/// 当前空间里查一个虚拟页
pub fn translate(vma: usize) -> Option<PageTableEntry> {
    active_root().translate(VirtAddr(vma).floor())
}

/// 用户态缺页: 落在用户区间就补一张零页, 指令重试;
/// 其他地址一律失败, 由异常处理把进程杀掉
pub fn handle_umode_page_fault(vma: usize) -> bool {
    if !wellformed(vma) || !(UMEM_START_VMA..UMEM_END_VMA).contains(&vma) {
        return false;
    }
    let vma = vma & !(PAGE_SIZE - 1);

    let page = match frame::alloc_zeroed_page() {
        Some(p) => p,
        None => return false,
    };
    match map_page(
        vma,
        page,
        PTEFlags::R | PTEFlags::W | PTEFlags::U | PTEFlags::G,
    ) {
        Ok(()) => {
            debug!("demand-paged a zero page at {:#x}", vma);
            true
        }
        Err(_) => {
            frame::free_phys_page(page);
            false
        }
    }
}
