use alloc::sync::Arc;

use super::unicore::UPSafeCell;
use super::Condition;
use crate::intr::{disable_interrupts, restore_interrupts};
use crate::task::{self, Tid};

struct LockInner {
    owner: Option<Tid>,
    count: usize,
}

/// 可重入锁, 持有者记录在线程的持锁表里,
/// 线程退出时未释放的锁会被强制清空并广播
pub struct Lock {
    cv: Condition,
    inner: UPSafeCell<LockInner>,
}

impl Lock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cv: Condition::new("lock_cv"),
            inner: unsafe { UPSafeCell::new(LockInner { owner: None, count: 0 }) },
        })
    }

    pub fn acquire(self: &Arc<Self>) {
        let pie = disable_interrupts();
        let tid = task::api::current_tid();
        loop {
            let mut inner = self.inner.exclusive_access();
            match inner.owner {
                // 已经持有, 重入
                Some(owner) if owner == tid => {
                    inner.count += 1;
                    break;
                }
                None => {
                    inner.owner = Some(tid);
                    inner.count = 1;
                    drop(inner);
                    task::api::push_held_lock(Arc::clone(self));
                    break;
                }
                Some(_) => {
                    drop(inner);
                    self.cv.wait();
                }
            }
        }
        restore_interrupts(pie);
    }

    /// 释放一层; 释放一个不属于自己的锁是空操作
    pub fn release(self: &Arc<Self>) {
        let pie = disable_interrupts();
        let tid = task::api::current_tid();
        let mut inner = self.inner.exclusive_access();
        if inner.owner != Some(tid) {
            restore_interrupts(pie);
            return;
        }
        inner.count -= 1;
        if inner.count == 0 {
            inner.owner = None;
            drop(inner);
            task::api::pop_held_lock(self);
            self.cv.broadcast();
        }
        restore_interrupts(pie);
    }

    /// 线程退出时的强制清理: 清空持有者并唤醒所有等待者
    /// 不会把锁转交给某个等待者, 下一个抢到的 broadcast 接收者胜出
    pub(crate) fn clear_on_exit(&self) {
        let mut inner = self.inner.exclusive_access();
        inner.owner = None;
        inner.count = 0;
        drop(inner);
        self.cv.broadcast();
    }
}
