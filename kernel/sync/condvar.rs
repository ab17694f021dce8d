use alloc::collections::VecDeque;

use super::unicore::UPIntrFreeCell;
use crate::task::{self, Tid};

/// 条件变量: 一条等待线程队列加一个名字
///
/// broadcast 只是把等待线程按原顺序搬回就绪队列, 不强制切换;
/// wait 返回当且仅当本线程再次被调度
pub struct Condition {
    name: &'static str,
    wait_list: UPIntrFreeCell<VecDeque<Tid>>,
}

impl Condition {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            wait_list: unsafe { UPIntrFreeCell::new(VecDeque::new()) },
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 调用线程必须处于 RUNNING, 挂到本条件的等待队列上并让出
    pub fn wait(&self) {
        let tid = task::api::current_tid();
        task::api::mark_waiting(tid, self.name);
        self.wait_list.exclusive_access().push_back(tid);
        task::api::suspend();
    }

    /// 唤醒所有等待者, 按原来的等待顺序追加到就绪队列尾部
    /// broadcast 自身不会阻塞也不会切换, 所以从 ISR 里调用也是安全的
    pub fn broadcast(&self) {
        let mut list = self.wait_list.exclusive_access();
        while let Some(tid) = list.pop_front() {
            task::api::make_ready(tid);
        }
    }
}
