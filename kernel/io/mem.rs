use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{Io, IoEndpoint};
use crate::sync::unicore::UPSafeCell;
use crate::{SysError, SysResult};
use sys_interface::syserr;
use sys_interface::sysio::*;

struct MemBuf {
    buf: Vec<u8>,
    size: usize,
}

/// 内存端点: 读写都按边界截断, SETEND 只允许缩小
pub struct MemIo {
    inner: UPSafeCell<MemBuf>,
}

pub fn create_memory_io(buf: Vec<u8>) -> SysResult<Io> {
    if buf.is_empty() {
        return Err(SysError(syserr::EINVAL));
    }
    let size = buf.len();
    Ok(Arc::new(MemIo {
        inner: unsafe { UPSafeCell::new(MemBuf { buf, size }) },
    }))
}

impl IoEndpoint for MemIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> SysResult<usize> {
        let inner = self.inner.exclusive_access();
        if pos >= inner.size as u64 {
            return Err(SysError(syserr::EINVAL));
        }
        let pos = pos as usize;
        let n = buf.len().min(inner.size - pos);
        buf[..n].copy_from_slice(&inner.buf[pos..pos + n]);
        Ok(n)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> SysResult<usize> {
        let mut inner = self.inner.exclusive_access();
        if pos >= inner.size as u64 {
            return Err(SysError(syserr::EINVAL));
        }
        let pos = pos as usize;
        let n = buf.len().min(inner.size - pos);
        inner.buf[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn cntl(&self, cmd: usize, arg: &mut u64) -> SysResult<usize> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(1),
            IOCTL_GETEND => {
                *arg = self.inner.exclusive_access().size as u64;
                Ok(0)
            }
            IOCTL_SETEND => {
                let mut inner = self.inner.exclusive_access();
                // 只许缩小
                if *arg > inner.size as u64 {
                    return Err(SysError(syserr::EINVAL));
                }
                inner.size = *arg as usize;
                Ok(0)
            }
            _ => Err(SysError(syserr::ENOTSUP)),
        }
    }
}
