mod fs;
mod process;

use alloc::string::String;

use crate::error::flatten;
use crate::memory::mspace;
use crate::trap::context::TrapFrame;
use crate::{SysError, SysResult, UMEM_END_VMA, UMEM_START_VMA};
use sys_interface::syscall::*;
use sys_interface::syserr;

/// 按 a7 分发, 参数在 a0..a2, 返回值回填 a0
/// exit 与成功的 exec 不会回来
pub fn syscall(tfr: &mut TrapFrame) -> isize {
    let id = tfr.x[17];
    let args = [tfr.x[10], tfr.x[11], tfr.x[12]];
    match id {
        SYSCALL_EXIT => process::sys_exit(),
        SYSCALL_EXEC => flatten(process::sys_exec(args[0] as isize, args[1], args[2])),
        SYSCALL_FORK => flatten(process::sys_fork(tfr)),
        SYSCALL_WAIT => flatten(process::sys_wait(args[0] as isize)),
        SYSCALL_PRINT => flatten(process::sys_print(args[0])),
        SYSCALL_USLEEP => flatten(process::sys_usleep(args[0])),
        SYSCALL_DEVOPEN => flatten(fs::sys_devopen(args[0] as isize, args[1], args[2])),
        SYSCALL_FSOPEN => flatten(fs::sys_fsopen(args[0] as isize, args[1])),
        SYSCALL_FSCREATE => flatten(fs::sys_fscreate(args[0])),
        SYSCALL_FSDELETE => flatten(fs::sys_fsdelete(args[0])),
        SYSCALL_CLOSE => flatten(fs::sys_close(args[0] as isize)),
        SYSCALL_READ => flatten(fs::sys_read(args[0] as isize, args[1], args[2])),
        SYSCALL_WRITE => flatten(fs::sys_write(args[0] as isize, args[1], args[2])),
        SYSCALL_IOCTL => flatten(fs::sys_ioctl(args[0] as isize, args[1], args[2])),
        SYSCALL_PIPE => flatten(fs::sys_pipe(args[0], args[1])),
        SYSCALL_IODUP => flatten(fs::sys_iodup(args[0] as isize, args[1] as isize)),
        _ => syserr::ENOTSUP,
    }
}

// 用户指针检查与搬运
// 系统调用期间 satp 装的就是本进程的地址空间, SUM 已开,
// 范围检查过的用户地址可以直接解引用; 没映射的页照缺页路径补零页

fn user_range_ok(addr: usize, len: usize) -> bool {
    addr >= UMEM_START_VMA && len <= UMEM_END_VMA - addr
}

/// 确保 [addr, addr+len) 的每一页都有映射, 需要时按缺页补页
fn ensure_mapped(addr: usize, len: usize) -> SysResult<()> {
    let mut page = addr & !(crate::PAGE_SIZE - 1);
    while page < addr + len {
        let mapped = mspace::translate(page)
            .map(|pte| pte.is_leaf())
            .unwrap_or(false);
        if !mapped && !mspace::handle_umode_page_fault(page) {
            return Err(SysError(syserr::EACCESS));
        }
        page += crate::PAGE_SIZE;
    }
    Ok(())
}

pub(crate) fn user_slice(addr: usize, len: usize) -> SysResult<&'static mut [u8]> {
    if len == 0 {
        return Ok(&mut []);
    }
    if !user_range_ok(addr, len) {
        return Err(SysError(syserr::EACCESS));
    }
    ensure_mapped(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

/// 拷一个 NUL 结尾的用户串, 上限一页
pub(crate) fn user_str(addr: usize) -> SysResult<String> {
    let mut s = String::new();
    let mut p = addr;
    loop {
        if !user_range_ok(p, 1) || s.len() >= crate::PAGE_SIZE {
            return Err(SysError(syserr::EACCESS));
        }
        ensure_mapped(p, 1)?;
        let b = unsafe { *(p as *const u8) };
        if b == 0 {
            return Ok(s);
        }
        s.push(b as char);
        p += 1;
    }
}

pub(crate) fn user_read<T: Copy>(addr: usize) -> SysResult<T> {
    let size = core::mem::size_of::<T>();
    if !user_range_ok(addr, size) {
        return Err(SysError(syserr::EACCESS));
    }
    ensure_mapped(addr, size)?;
    Ok(unsafe { core::ptr::read_unaligned(addr as *const T) })
}

pub(crate) fn user_write<T: Copy>(addr: usize, val: T) -> SysResult<()> {
    let size = core::mem::size_of::<T>();
    if !user_range_ok(addr, size) {
        return Err(SysError(syserr::EACCESS));
    }
    ensure_mapped(addr, size)?;
    unsafe { core::ptr::write_unaligned(addr as *mut T, val) };
    Ok(())
}
