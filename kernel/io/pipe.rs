use alloc::sync::Arc;

use super::{Io, IoEndpoint};
use crate::memory::frame;
use crate::sync::unicore::UPSafeCell;
use crate::sync::Condition;
use crate::{SysError, SysResult, PAGE_SIZE};
use sys_interface::syserr;
use sys_interface::sysio::IOCTL_GETBLKSZ;

// 环形缓冲区就是一整页, head==tail 为空, 差一格为满
const PIPE_BUFSZ: usize = PAGE_SIZE;

struct PipeInner {
    buf_page: usize,
    head: usize,
    tail: usize,
    closed_read: bool,
    closed_write: bool,
}

impl PipeInner {
    fn buf(&mut self) -> &'static mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.buf_page as *mut u8, PIPE_BUFSZ) }
    }

    fn empty(&self) -> bool {
        self.head == self.tail
    }

    fn full(&self) -> bool {
        (self.head + 1) % PIPE_BUFSZ == self.tail
    }
}

struct PipeShared {
    readable: Condition,
    writable: Condition,
    inner: UPSafeCell<PipeInner>,
}

impl Drop for PipeShared {
    fn drop(&mut self) {
        // 两端都关了才会走到这里, 归还缓冲页
        let page = self.inner.exclusive_access().buf_page;
        frame::free_phys_page(frame::ppn_of(page));
    }
}

/// 管道的一端, 读端或写端由 is_writer 区分
pub struct PipeEnd {
    pipe: Arc<PipeShared>,
    is_writer: bool,
}

/// 返回 (写端, 读端)
pub fn create_pipe() -> SysResult<(Io, Io)> {
    let page = frame::alloc_phys_page().ok_or(SysError(syserr::ENOMEM))?;
    let shared = Arc::new(PipeShared {
        readable: Condition::new("pipe_readable"),
        writable: Condition::new("pipe_writable"),
        inner: unsafe {
            UPSafeCell::new(PipeInner {
                buf_page: frame::page_addr(page),
                head: 0,
                tail: 0,
                closed_read: false,
                closed_write: false,
            })
        },
    });
    let wio: Io = Arc::new(PipeEnd {
        pipe: Arc::clone(&shared),
        is_writer: true,
    });
    let rio: Io = Arc::new(PipeEnd {
        pipe: shared,
        is_writer: false,
    });
    Ok((wio, rio))
}

impl IoEndpoint for PipeEnd {
    /// 读空且写端还在就等; 写端关了就以已读字节数收场 (0 即 EOF)
    fn read(&self, buf: &mut [u8]) -> SysResult<usize> {
        assert!(!self.is_writer);
        let mut total = 0;
        while total < buf.len() {
            loop {
                let mut inner = self.pipe.inner.exclusive_access();
                if !inner.empty() {
                    let tail = inner.tail;
                    buf[total] = inner.buf()[tail];
                    inner.tail = (tail + 1) % PIPE_BUFSZ;
                    total += 1;
                    break;
                }
                if inner.closed_write {
                    return Ok(total);
                }
                drop(inner);
                self.pipe.readable.wait();
            }
            self.pipe.writable.broadcast();
        }
        Ok(total)
    }

    /// 写满且读端还在就等; 读端关了返回 EPIPE
    fn write(&self, buf: &[u8]) -> SysResult<usize> {
        assert!(self.is_writer);
        let mut total = 0;
        while total < buf.len() {
            loop {
                let mut inner = self.pipe.inner.exclusive_access();
                if inner.closed_read {
                    return Err(SysError(syserr::EPIPE));
                }
                if !inner.full() {
                    let head = inner.head;
                    inner.buf()[head] = buf[total];
                    inner.head = (head + 1) % PIPE_BUFSZ;
                    total += 1;
                    break;
                }
                drop(inner);
                self.pipe.writable.wait();
            }
            self.pipe.readable.broadcast();
        }
        Ok(total)
    }

    fn cntl(&self, cmd: usize, _arg: &mut u64) -> SysResult<usize> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(1),
            _ => Err(SysError(syserr::ENOTSUP)),
        }
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        // 关掉自己这端并叫醒对面, 让它看到 EOF / EPIPE
        let mut inner = self.pipe.inner.exclusive_access();
        if self.is_writer {
            inner.closed_write = true;
            drop(inner);
            self.pipe.readable.broadcast();
        } else {
            inner.closed_read = true;
            drop(inner);
            self.pipe.writable.broadcast();
        }
    }
}
