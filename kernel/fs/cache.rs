//! 块缓存
//!
//! 固定容量, 每块一把可重入锁; 脏释放直写后备端点,
//! 淘汰挑释放时间戳最小且没被持有的块

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use component::fs::ktfs::BLKSZ;

use crate::io::Io;
use crate::sync::unicore::UPSafeCell;
use crate::sync::Lock;
use crate::{SysError, SysResult, CACHE_CAPACITY};
use sys_interface::syserr;

// 在用的块时间戳挂成最大值, LRU 扫描自然跳过它
const IN_USE: u64 = u64::MAX;

struct CacheEntry {
    idx: u64,
    valid: bool,
    release: u64,
    data: [u8; BLKSZ],
    lock: Arc<Lock>,
}

struct CacheInner {
    entries: Vec<Box<CacheEntry>>,
    last_release: u64,
}

pub struct Cache {
    bkgio: Io,
    inner: UPSafeCell<CacheInner>,
}

/// get_block 发回的持块凭证, 凭它读写数据并在释放时交还
pub struct CachedBlock {
    entry: *mut CacheEntry,
}

unsafe impl Send for CachedBlock {}

impl CachedBlock {
    pub fn data(&self) -> &[u8; BLKSZ] {
        unsafe { &(*self.entry).data }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BLKSZ] {
        unsafe { &mut (*self.entry).data }
    }
}

impl Cache {
    pub fn new(bkgio: Io) -> Self {
        Self {
            bkgio,
            inner: unsafe {
                UPSafeCell::new(CacheInner {
                    entries: Vec::with_capacity(CACHE_CAPACITY),
                    last_release: 0,
                })
            },
        }
    }

    /// 取后备端点 pos 处的一块, 返回已加锁的凭证
    /// 命中直接给, 不满新建, 满了淘汰最久未用的空闲块再读盘
    pub fn get_block(&self, pos: u64) -> SysResult<CachedBlock> {
        let (entry_ptr, lock, need_read) = {
            let mut inner = self.inner.exclusive_access();

            let hit = inner.entries.iter().position(|e| e.valid && e.idx == pos);
            match hit {
                Some(i) => {
                    let e = &mut inner.entries[i];
                    e.release = IN_USE;
                    (&mut **e as *mut CacheEntry, Arc::clone(&e.lock), false)
                }
                None if inner.entries.len() < CACHE_CAPACITY => {
                    inner.entries.push(Box::new(CacheEntry {
                        idx: pos,
                        valid: true,
                        release: IN_USE,
                        data: [0; BLKSZ],
                        lock: Lock::new(),
                    }));
                    let e = inner.entries.last_mut().unwrap();
                    (&mut **e as *mut CacheEntry, Arc::clone(&e.lock), true)
                }
                None => {
                    let e = inner
                        .entries
                        .iter_mut()
                        .filter(|e| e.release != IN_USE)
                        .min_by_key(|e| e.release)
                        .expect("all cache blocks held");
                    e.idx = pos;
                    e.release = IN_USE;
                    (&mut **e as *mut CacheEntry, Arc::clone(&e.lock), true)
                }
            }
        };

        // 拿锁可能阻塞, 不能抱着表借用等
        lock.acquire();
        if need_read {
            let data = unsafe { &mut (*entry_ptr).data };
            let n = self.bkgio.readat(pos, data)?;
            if n != BLKSZ {
                lock.release();
                return Err(SysError(syserr::EIO));
            }
        }
        Ok(CachedBlock { entry: entry_ptr })
    }

    /// 交还一块; 脏块先直写回后备端点, 然后打上释放时间戳并放锁
    pub fn release_block(&self, blk: CachedBlock, dirty: bool) -> SysResult<()> {
        let entry = blk.entry;
        let (idx, lock) = unsafe { ((*entry).idx, Arc::clone(&(*entry).lock)) };

        if dirty {
            let data = unsafe { &(*entry).data };
            let n = self.bkgio.writeat(idx, data)?;
            if n != BLKSZ {
                lock.release();
                return Err(SysError(syserr::EIO));
            }
        }

        {
            let mut inner = self.inner.exclusive_access();
            let stamp = inner.last_release;
            inner.last_release += 1;
            unsafe { (*entry).release = stamp };
        }
        lock.release();
        Ok(())
    }

    /// 直写缓存没有脏块积压, flush 没事可做
    pub fn flush(&self) -> SysResult<()> {
        Ok(())
    }
}
