//! 走 fd 的那批系统调用: 设备/文件打开, 读写, ioctl, 管道与复制

use super::{user_read, user_slice, user_str, user_write};
use crate::driver::open_device;
use crate::io::pipe::create_pipe;
use crate::io::{iowrite, Io};
use crate::process::current_process;
use crate::{fs, SysError, SysResult, PROCESS_IOMAX};
use sys_interface::syserr;
use sys_interface::sysio::*;

/// fd 参数检查 + 取出槽里的端点引用
fn fd_io(fd: isize) -> SysResult<Io> {
    if !(0..PROCESS_IOMAX as isize).contains(&fd) {
        return Err(SysError(syserr::EBADFD));
    }
    current_process()?
        .with_iotab(|t| t.get(fd as usize))
        .ok_or(SysError(syserr::EBADFD))
}

/// fd < 0 表示挑最小空闲槽; 指定的槽必须是空的
fn pick_slot(fd: isize) -> SysResult<usize> {
    let proc = current_process()?;
    proc.with_iotab(|t| {
        if fd < 0 {
            t.alloc_lowest().ok_or(SysError(syserr::EBADFD))
        } else if (fd as usize) < PROCESS_IOMAX && t.is_free(fd as usize) {
            Ok(fd as usize)
        } else {
            Err(SysError(syserr::EBADFD))
        }
    })
}

pub fn sys_devopen(fd: isize, name_uva: usize, instno: usize) -> SysResult<usize> {
    let name = user_str(name_uva)?;
    let slot = pick_slot(fd)?;
    let io = open_device(&name, instno)?;
    current_process()?.with_iotab(|t| t.set(slot, io));
    Ok(slot)
}

pub fn sys_fsopen(fd: isize, name_uva: usize) -> SysResult<usize> {
    let name = user_str(name_uva)?;
    let slot = pick_slot(fd)?;
    let io = fs::fsopen(&name)?;
    current_process()?.with_iotab(|t| t.set(slot, io));
    Ok(slot)
}

pub fn sys_fscreate(name_uva: usize) -> SysResult<usize> {
    let name = user_str(name_uva)?;
    fs::fscreate(&name)
}

pub fn sys_fsdelete(name_uva: usize) -> SysResult<usize> {
    let name = user_str(name_uva)?;
    fs::fsdelete(&name)
}

pub fn sys_close(fd: isize) -> SysResult<usize> {
    if !(0..PROCESS_IOMAX as isize).contains(&fd) {
        return Err(SysError(syserr::EBADFD));
    }
    let io = current_process()?.with_iotab(|t| t.take(fd as usize));
    match io {
        // 引用在这里掉落, 计数归零就真正关闭
        Some(_) => Ok(0),
        None => Err(SysError(syserr::EBADFD)),
    }
}

pub fn sys_read(fd: isize, buf_uva: usize, len: usize) -> SysResult<usize> {
    let io = fd_io(fd)?;
    let buf = user_slice(buf_uva, len)?;
    io.read(buf)
}

pub fn sys_write(fd: isize, buf_uva: usize, len: usize) -> SysResult<usize> {
    let io = fd_io(fd)?;
    let buf = user_slice(buf_uva, len)?;
    iowrite(io.as_ref(), buf)
}

pub fn sys_ioctl(fd: isize, cmd: usize, arg_uva: usize) -> SysResult<usize> {
    let io = fd_io(fd)?;
    // arg 是指向 u64 的用户指针, GETBLKSZ 不用它
    let mut arg: u64 = match cmd {
        IOCTL_SETEND | IOCTL_SETPOS => user_read(arg_uva)?,
        _ => 0,
    };
    let ret = io.cntl(cmd, &mut arg)?;
    if matches!(cmd, IOCTL_GETEND | IOCTL_GETPOS) {
        user_write(arg_uva, arg)?;
    }
    Ok(ret)
}

pub fn sys_pipe(wfd_uva: usize, rfd_uva: usize) -> SysResult<usize> {
    let wfd_hint: i32 = user_read(wfd_uva)?;
    let rfd_hint: i32 = user_read(rfd_uva)?;

    let (wio, rio) = create_pipe()?;
    let proc = current_process()?;

    let (wfd, rfd) = proc.with_iotab(|t| {
        let mut wfd = wfd_hint as isize;
        let mut rfd = rfd_hint as isize;
        if wfd < 0 {
            wfd = t.alloc_lowest().map(|v| v as isize).unwrap_or(-1);
        }
        if rfd < 0 {
            rfd = (0..PROCESS_IOMAX as isize)
                .find(|&i| i != wfd && t.is_free(i as usize))
                .unwrap_or(-1);
        }
        if wfd < 0
            || rfd < 0
            || wfd == rfd
            || wfd >= PROCESS_IOMAX as isize
            || rfd >= PROCESS_IOMAX as isize
            || !t.is_free(wfd as usize)
            || !t.is_free(rfd as usize)
        {
            return Err(SysError(syserr::EBADFD));
        }
        t.set(wfd as usize, wio);
        t.set(rfd as usize, rio);
        Ok((wfd, rfd))
    })?;

    user_write(wfd_uva, wfd as i32)?;
    user_write(rfd_uva, rfd as i32)?;
    Ok(0)
}

pub fn sys_iodup(oldfd: isize, newfd: isize) -> SysResult<usize> {
    if !(0..PROCESS_IOMAX as isize).contains(&oldfd) {
        return Err(SysError(syserr::EBADFD));
    }
    let proc = current_process()?;
    proc.with_iotab(|t| {
        let io = t.get(oldfd as usize).ok_or(SysError(syserr::EBADFD))?;
        let newfd = if newfd < 0 {
            t.alloc_lowest().ok_or(SysError(syserr::EBADFD))?
        } else if (newfd as usize) < PROCESS_IOMAX {
            newfd as usize
        } else {
            return Err(SysError(syserr::EBADFD));
        };
        // 目标槽原有的引用被顶掉即关闭
        t.take(newfd);
        t.set(newfd, io);
        Ok(0)
    })
}
