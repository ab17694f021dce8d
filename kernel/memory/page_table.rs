use bitflags::bitflags;

use super::address::*;
use super::frame;

bitflags! {
    /// Sv39 页表项低 8 位
    #[derive(Clone, Copy, PartialEq)]
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;   // 用户态可访问
        const G = 1 << 5;   // 全局映射, 内核半区都带它
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// 页表项数据结构
/// 当 V 为 1 且 R/W/X 均为 0 时, 它指向下一级页表;
/// R/W/X 任一非 0 则是叶子, 包含最终的物理页号
#[derive(Copy, Clone)]
#[repr(C)]
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    /// 叶子项, A/D 位直接预置
    pub fn leaf(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        Self {
            bits: ppn.0 << 10
                | (flags | PTEFlags::V | PTEFlags::A | PTEFlags::D).bits() as usize,
        }
    }

    /// 指向下一级页表的目录项
    pub fn ptab(ppn: PhysPageNum, g_flag: PTEFlags) -> Self {
        Self {
            bits: ppn.0 << 10 | ((g_flag & PTEFlags::G) | PTEFlags::V).bits() as usize,
        }
    }

    pub fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & ((1usize << 44) - 1)).into()
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }

    pub fn valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }

    /// R/W/X 任一置位即叶子
    pub fn is_leaf(&self) -> bool {
        self.flags()
            .intersects(PTEFlags::R | PTEFlags::W | PTEFlags::X)
    }

    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }

    /// 保留 R/W/X/U/G, 换上新的权限位
    pub fn set_rwxug(&mut self, flags: PTEFlags) {
        let keep = PTEFlags::R | PTEFlags::W | PTEFlags::X | PTEFlags::U | PTEFlags::G;
        let old = self.flags() & !keep;
        self.bits = (self.ppn().0 << 10) | (old | (flags & keep)).bits() as usize;
    }
}

/// 对一棵页表的非拥有视角, 释放走 mspace 的显式遍历
pub struct PageTable {
    root_ppn: PhysPageNum,
}

impl PageTable {
    pub fn from_root(root_ppn: PhysPageNum) -> Self {
        Self { root_ppn }
    }

    pub fn root_ppn(&self) -> PhysPageNum {
        self.root_ppn
    }

    /// 沿三级页表向下走, 缺哪级目录就补哪级 (alloc = true 时)
    /// 走到巨页叶子上直接失败, 用户映射只支持 4K 叶子
    pub fn walk_create(&self, vpn: VirtPageNum, alloc: bool) -> Option<&'static mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (i, &idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[idx];
            if i == 2 {
                return Some(pte);
            }
            if !pte.valid() {
                if !alloc {
                    return None;
                }
                let sub = frame::alloc_zeroed_page()?;
                *pte = PageTableEntry::ptab(sub, PTEFlags::G);
            } else if pte.is_leaf() {
                // 巨页, 不再往下走
                return None;
            }
            ppn = pte.ppn();
        }
        unreachable!()
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        let pte = self.walk_create(vpn, false)?;
        if pte.valid() {
            Some(*pte)
        } else {
            None
        }
    }
}
