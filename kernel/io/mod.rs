//! 统一 I/O 端点
//!
//! 端点装进 `Arc<dyn IoEndpoint>` 里流转: 克隆即增加引用,
//! 最后一个引用掉落时 Drop 充当 close. 不支持的操作由缺省方法
//! 统一回 ENOTSUP

pub mod mem;
pub mod pipe;
pub mod seek;

use alloc::sync::Arc;

use crate::{SysError, SysResult};
use sys_interface::syserr;
use sys_interface::sysio::IOCTL_GETBLKSZ;

pub type Io = Arc<dyn IoEndpoint>;

pub trait IoEndpoint: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> SysResult<usize> {
        Err(SysError(syserr::ENOTSUP))
    }

    fn write(&self, _buf: &[u8]) -> SysResult<usize> {
        Err(SysError(syserr::ENOTSUP))
    }

    fn readat(&self, _pos: u64, _buf: &mut [u8]) -> SysResult<usize> {
        Err(SysError(syserr::ENOTSUP))
    }

    fn writeat(&self, _pos: u64, _buf: &[u8]) -> SysResult<usize> {
        Err(SysError(syserr::ENOTSUP))
    }

    /// arg 统一是一个 u64 槽, GETBLKSZ 之类的不看它
    fn cntl(&self, cmd: usize, _arg: &mut u64) -> SysResult<usize> {
        if cmd == IOCTL_GETBLKSZ {
            // 缺省块大小
            Ok(1)
        } else {
            Err(SysError(syserr::ENOTSUP))
        }
    }
}

/// 写满为止: 短写就续上, 写不动了 (0) 或出错为止
pub fn iowrite(io: &dyn IoEndpoint, buf: &[u8]) -> SysResult<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.write(&buf[pos..])?;
        if n == 0 {
            return Ok(pos);
        }
        pos += n;
    }
    Ok(pos)
}

/// 读满为止, 对端 EOF 时返回已读字节数
pub fn iofill(io: &dyn IoEndpoint, buf: &mut [u8]) -> SysResult<usize> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = io.read(&mut buf[pos..])?;
        if n == 0 {
            return Ok(pos);
        }
        pos += n;
    }
    Ok(pos)
}

pub fn ioblksz(io: &dyn IoEndpoint) -> SysResult<usize> {
    let mut arg = 0u64;
    io.cntl(IOCTL_GETBLKSZ, &mut arg)
}

pub fn ioend(io: &dyn IoEndpoint) -> SysResult<u64> {
    let mut arg = 0u64;
    io.cntl(sys_interface::sysio::IOCTL_GETEND, &mut arg)?;
    Ok(arg)
}
