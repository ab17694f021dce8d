use alloc::sync::Arc;

use super::{ioblksz, ioend, Io, IoEndpoint};
use crate::sync::unicore::UPSafeCell;
use crate::{SysError, SysResult};
use sys_interface::syserr;
use sys_interface::sysio::*;

struct SeekPos {
    pos: u64,
    end: u64,
}

/// 给只会 readat/writeat 的后备端点加上游标,
/// read/write 的长度必须凑够后备块大小
pub struct SeekIo {
    bkgio: Io,
    blksz: usize,
    inner: UPSafeCell<SeekPos>,
}

pub fn create_seekable_io(bkgio: Io) -> SysResult<Io> {
    let blksz = ioblksz(bkgio.as_ref())?;
    assert!(blksz > 0);
    // 块大小必须是 2 的幂
    assert!(blksz & (blksz - 1) == 0);
    let end = ioend(bkgio.as_ref())?;

    Ok(Arc::new(SeekIo {
        bkgio,
        blksz,
        inner: unsafe { UPSafeCell::new(SeekPos { pos: 0, end }) },
    }))
}

impl IoEndpoint for SeekIo {
    fn read(&self, buf: &mut [u8]) -> SysResult<usize> {
        let (pos, end) = {
            let inner = self.inner.exclusive_access();
            (inner.pos, inner.end)
        };

        // 不能读过端点末尾
        let mut bufsz = buf.len().min((end - pos) as usize);
        if bufsz == 0 {
            return Ok(0);
        }
        if bufsz < self.blksz {
            return Err(SysError(syserr::EINVAL));
        }
        bufsz &= !(self.blksz - 1);

        let rcnt = self.bkgio.readat(pos, &mut buf[..bufsz])?;
        self.inner.exclusive_access().pos = pos + rcnt as u64;
        Ok(rcnt)
    }

    fn write(&self, buf: &[u8]) -> SysResult<usize> {
        let (pos, end) = {
            let inner = self.inner.exclusive_access();
            (inner.pos, inner.end)
        };

        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() < self.blksz {
            return Err(SysError(syserr::EINVAL));
        }
        let len = buf.len() & !(self.blksz - 1);

        // 写过末尾要先把后备端点撑大
        if end - pos < len as u64 {
            if u64::MAX - pos < len as u64 {
                return Err(SysError(syserr::EINVAL));
            }
            let mut new_end = pos + len as u64;
            self.bkgio.cntl(IOCTL_SETEND, &mut new_end)?;
            self.inner.exclusive_access().end = new_end;
        }

        let wcnt = self.bkgio.writeat(pos, &buf[..len])?;
        self.inner.exclusive_access().pos = pos + wcnt as u64;
        Ok(wcnt)
    }

    fn readat(&self, pos: u64, buf: &mut [u8]) -> SysResult<usize> {
        self.bkgio.readat(pos, buf)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> SysResult<usize> {
        self.bkgio.writeat(pos, buf)
    }

    fn cntl(&self, cmd: usize, arg: &mut u64) -> SysResult<usize> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(self.blksz),
            IOCTL_GETPOS => {
                *arg = self.inner.exclusive_access().pos;
                Ok(0)
            }
            IOCTL_SETPOS => {
                // 新位置必须对齐块大小且不越过末尾
                if *arg & (self.blksz as u64 - 1) != 0 {
                    return Err(SysError(syserr::EINVAL));
                }
                let mut inner = self.inner.exclusive_access();
                if *arg > inner.end {
                    return Err(SysError(syserr::EINVAL));
                }
                inner.pos = *arg;
                Ok(0)
            }
            IOCTL_GETEND => {
                *arg = self.inner.exclusive_access().end;
                Ok(0)
            }
            IOCTL_SETEND => {
                let ret = self.bkgio.cntl(IOCTL_SETEND, arg)?;
                self.inner.exclusive_access().end = *arg;
                Ok(ret)
            }
            // 其他命令透传给后备端点
            _ => self.bkgio.cntl(cmd, arg),
        }
    }
}
