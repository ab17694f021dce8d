//! ELF 装载器: 只认 64 位小端 RISC-V, 只装 PT_LOAD 段

use logger::debug;

use crate::io::IoEndpoint;
use crate::memory::mspace;
use crate::memory::page_table::PTEFlags;
use crate::{SysError, SysResult, PAGE_SIZE, UMEM_END_VMA, UMEM_START_VMA};
use sys_interface::syserr;

// e_ident 下标
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 0x1;
const PF_W: u32 = 0x2;
const PF_R: u32 = 0x4;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

fn read_struct<T: Copy>(io: &dyn IoEndpoint, pos: u64) -> SysResult<T> {
    let mut buf = [0u8; 128];
    let size = core::mem::size_of::<T>();
    assert!(size <= buf.len());
    if io.readat(pos, &mut buf[..size])? != size {
        return Err(SysError(syserr::EIO));
    }
    Ok(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

/// 把 PT_LOAD 段逐个装进当前 (用户) 地址空间, 返回入口地址
///
/// 每段先按 R|W|U 映出来, 拷完文件内容并清零尾巴后,
/// 再把权限改成程序头要求的样子
pub fn elf_load(io: &dyn IoEndpoint) -> SysResult<usize> {
    let ehdr: Elf64Ehdr = read_struct(io, 0)?;

    if ehdr.e_ident[0..4] != [0x7f, b'E', b'L', b'F'] {
        return Err(SysError(syserr::EBADFMT));
    }
    if ehdr.e_ident[EI_CLASS] != ELFCLASS64
        || ehdr.e_ident[EI_DATA] != ELFDATA2LSB
        || ehdr.e_ident[EI_VERSION] != EV_CURRENT
        || ehdr.e_machine != EM_RISCV
    {
        return Err(SysError(syserr::EBADFMT));
    }
    let entry = ehdr.e_entry as usize;
    if !(UMEM_START_VMA..UMEM_END_VMA).contains(&entry) {
        return Err(SysError(syserr::EINVAL));
    }

    for i in 0..ehdr.e_phnum as u64 {
        let phdr: Elf64Phdr = read_struct(io, ehdr.e_phoff + i * ehdr.e_phentsize as u64)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let vaddr = phdr.p_vaddr as usize;
        let memsz = phdr.p_memsz as usize;
        let filesz = phdr.p_filesz as usize;
        if vaddr < UMEM_START_VMA || vaddr + memsz > UMEM_END_VMA || filesz > memsz {
            return Err(SysError(syserr::EINVAL));
        }

        // 段起点不一定对齐页, 映射范围取整页覆盖
        let map_start = vaddr & !(PAGE_SIZE - 1);
        let map_size = vaddr + memsz - map_start;
        mspace::alloc_and_map_range(
            map_start,
            map_size,
            PTEFlags::R | PTEFlags::W | PTEFlags::U,
        )?;

        // 现在整段都可写, 直接往用户地址里灌
        let dst = unsafe { core::slice::from_raw_parts_mut(vaddr as *mut u8, filesz) };
        if io.readat(phdr.p_offset, dst)? != filesz {
            return Err(SysError(syserr::EIO));
        }
        unsafe {
            core::ptr::write_bytes((vaddr + filesz) as *mut u8, 0, memsz - filesz);
        }

        // 按程序头把权限改回去, U 位保留
        let mut flags = PTEFlags::U;
        if phdr.p_flags & PF_R != 0 {
            flags |= PTEFlags::R;
        }
        if phdr.p_flags & PF_W != 0 {
            flags |= PTEFlags::W;
        }
        if phdr.p_flags & PF_X != 0 {
            flags |= PTEFlags::X;
        }
        mspace::set_range_flags(map_start, map_size, flags);

        debug!(
            "elf: segment [{:#x}..{:#x}) filesz {:#x} flags {:#x}",
            vaddr,
            vaddr + memsz,
            filesz,
            phdr.p_flags
        );
    }

    Ok(entry)
}
