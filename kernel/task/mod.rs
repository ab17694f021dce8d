pub mod context;
pub mod switch;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use logger::{debug, info};

use crate::intr::{disable_interrupts, enable_interrupts, restore_interrupts};
use crate::memory::frame;
use crate::memory::mspace;
use crate::process::Process;
use crate::see::{halt_failure, halt_success};
use crate::sync::unicore::{reset_intr_masking, UPIntrFreeCell};
use crate::sync::{Condition, Lock};
use crate::trap::context::TrapFrame;
use crate::{SysError, SysResult, NTHR, PAGE_SIZE};
use sys_interface::syserr;

use self::context::ThreadContext;
use self::switch::__switch;

pub type Tid = usize;

pub const MAIN_TID: Tid = 0;
pub const IDLE_TID: Tid = NTHR - 1;

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum ThreadState {
    Uninit,
    Waiting,
    Running,
    Ready,
    Exited,
}

/// 内核栈顶的锚: 从用户态陷入时, trap 入口从这里找回内核 tp/gp
#[repr(C)]
pub struct StackAnchor {
    pub ktp: usize,
    pub kgp: usize,
}

pub struct Thread {
    // 上下文保存区
    pub ctx: ThreadContext,
    tid: Tid,
    pub state: ThreadState,
    pub name: &'static str,
    // 栈底 (最低地址); spawn 出来的线程栈是一整页, 退出后归还
    stack_lowest: usize,
    // 栈顶锚地址
    stack_anchor: usize,
    owns_stack_page: bool,
    pub parent: Tid,
    // 正在等待的条件名, 仅用于调试
    pub blocked_on: Option<&'static str>,
    held_locks: Vec<Arc<Lock>>,
    pub proc: Option<Arc<Process>>,
    // 本线程退出时广播, 父线程 join 在这上面等
    child_exit: Arc<Condition>,
}

struct ThreadTable {
    slots: [Option<Box<Thread>>; NTHR],
}

// idle 线程的静态栈, 栈顶同样带锚
#[repr(C, align(4096))]
struct IdleStack([u8; PAGE_SIZE]);

static mut IDLE_STACK: IdleStack = IdleStack([0; PAGE_SIZE]);

extern "C" {
    // entry.asm 里的主栈符号
    fn _main_stack_lowest();
    fn _main_stack_anchor();
}

lazy_static! {
    static ref THREADS: UPIntrFreeCell<ThreadTable> = unsafe {
        UPIntrFreeCell::new(ThreadTable {
            slots: [const { None }; NTHR],
        })
    };
    static ref READY: UPIntrFreeCell<VecDeque<Tid>> =
        unsafe { UPIntrFreeCell::new(VecDeque::new()) };
    static ref CURRENT: UPIntrFreeCell<Tid> = unsafe { UPIntrFreeCell::new(MAIN_TID) };
    // 最近一次切换的来源线程, 切换完成后在新线程里回收它的栈
    static ref PREV: UPIntrFreeCell<Tid> = unsafe { UPIntrFreeCell::new(MAIN_TID) };
}

fn read_gp() -> usize {
    let gp: usize;
    unsafe { core::arch::asm!("mv {}, gp", out(reg) gp) };
    gp
}

/// 把线程记录的地址写进它栈顶的锚
fn write_anchor(thr: &Thread) {
    let anchor = thr.stack_anchor as *mut StackAnchor;
    unsafe {
        (*anchor).ktp = thr as *const Thread as usize;
        (*anchor).kgp = read_gp();
    }
}

extern "C" fn idle_entry(_: usize, _: usize) {
    // 有活干就让出去, 没活就 wfi 等中断
    // 检查就绪队列和 wfi 之间必须关中断, 否则 ISR 在两者之间把线程置为
    // 就绪的话, wfi 会一直睡下去
    loop {
        while !READY.exclusive_access().is_empty() {
            api::yield_();
        }
        disable_interrupts();
        if READY.exclusive_access().is_empty() {
            unsafe { riscv::asm::wfi() };
        }
        enable_interrupts();
    }
}

/// 新线程首次运行时从启动跳板调进来:
/// 复位中断屏蔽计数, 回收上一个线程的栈, 打开中断
#[no_mangle]
pub extern "C" fn thread_bootstrap() {
    reset_intr_masking();
    reap_previous();
    enable_interrupts();
}

/// 切换回来后清理: 如果切换前的线程已经退出, 归还它的内核栈页
fn reap_previous() {
    let prev = *PREV.exclusive_access();
    let mut tab = THREADS.exclusive_access();
    if let Some(thr) = tab.slots[prev].as_mut() {
        if thr.state == ThreadState::Exited && thr.owns_stack_page && thr.stack_lowest != 0 {
            frame::free_phys_page(frame::ppn_of(thr.stack_lowest));
            thr.stack_lowest = 0;
        }
    }
}

pub mod api {
    use super::*;

    /// 建立 main 与 idle 两个静态线程, main 即当前执行流
    pub fn init() {
        info!("Thread manager initializing (NTHR = {})", NTHR);

        let main_thr = Box::new(Thread {
            ctx: ThreadContext::zeroed(),
            tid: MAIN_TID,
            state: ThreadState::Running,
            name: "main",
            stack_lowest: _main_stack_lowest as usize,
            stack_anchor: _main_stack_anchor as usize,
            owns_stack_page: false,
            parent: MAIN_TID,
            blocked_on: None,
            held_locks: Vec::new(),
            proc: None,
            child_exit: Arc::new(Condition::new("main.child_exit")),
        });

        let idle_stack_lowest = core::ptr::addr_of!(IDLE_STACK) as usize;
        let idle_anchor = idle_stack_lowest + PAGE_SIZE - core::mem::size_of::<StackAnchor>();
        let idle_thr = Box::new(Thread {
            ctx: ThreadContext::goto_startup(idle_anchor, idle_entry as usize, &[]),
            tid: IDLE_TID,
            state: ThreadState::Ready,
            name: "idle",
            stack_lowest: idle_stack_lowest,
            stack_anchor: idle_anchor,
            owns_stack_page: false,
            parent: MAIN_TID,
            blocked_on: None,
            held_locks: Vec::new(),
            proc: None,
            child_exit: Arc::new(Condition::new("idle.child_exit")),
        });

        write_anchor(&main_thr);
        write_anchor(&idle_thr);

        let mut tab = THREADS.exclusive_access();
        tab.slots[MAIN_TID] = Some(main_thr);
        tab.slots[IDLE_TID] = Some(idle_thr);
        drop(tab);

        READY.exclusive_access().push_back(IDLE_TID);
    }

    pub fn current_tid() -> Tid {
        *CURRENT.exclusive_access()
    }

    pub fn thread_name(tid: Tid) -> &'static str {
        THREADS.exclusive_access().slots[tid]
            .as_ref()
            .map(|t| t.name)
            .unwrap_or("?")
    }

    pub fn current_name() -> &'static str {
        thread_name(current_tid())
    }

    /// 创建新线程: 分配一页内核栈, 栈顶 16 字节做锚,
    /// 初始上下文指向启动跳板, 最多带 8 个参数
    pub fn spawn(name: &'static str, entry: usize, args: &[usize]) -> SysResult<Tid> {
        // 找空槽, 0 号与 idle 槽不参与分配
        let tid = {
            let tab = THREADS.exclusive_access();
            match (1..IDLE_TID).find(|&i| tab.slots[i].is_none()) {
                Some(i) => i,
                None => return Err(SysError(syserr::EMTHR)),
            }
        };

        let stack_ppn = frame::alloc_phys_page().ok_or(SysError(syserr::ENOMEM))?;
        let stack_lowest = frame::page_addr(stack_ppn);
        let anchor = stack_lowest + PAGE_SIZE - core::mem::size_of::<StackAnchor>();

        let thr = Box::new(Thread {
            ctx: ThreadContext::goto_startup(anchor, entry, args),
            tid,
            state: ThreadState::Ready,
            name,
            stack_lowest,
            stack_anchor: anchor,
            owns_stack_page: true,
            parent: current_tid(),
            blocked_on: None,
            held_locks: Vec::new(),
            proc: None,
            child_exit: Arc::new(Condition::new("child_exit")),
        });
        write_anchor(&thr);

        THREADS.exclusive_access().slots[tid] = Some(thr);
        READY.exclusive_access().push_back(tid);
        debug!("thread <{}:{}> spawned", name, tid);
        Ok(tid)
    }

    pub fn yield_() {
        suspend();
    }

    /// 让出处理器: 还在运行态的话放回就绪队列,
    /// 取下一个就绪线程 (没有就取 idle), 装好它的地址空间再切换.
    /// 只有当本线程再次被调度时才会返回
    pub fn suspend() {
        let pie = disable_interrupts();
        let cur = current_tid();

        let (cur_ctx, next_ctx, next_tid, next_mtag) = {
            let mut tab = THREADS.exclusive_access();
            {
                let cur_thr = tab.slots[cur].as_mut().unwrap();
                if cur_thr.state == ThreadState::Running {
                    cur_thr.state = ThreadState::Ready;
                    READY.exclusive_access().push_back(cur);
                }
            }
            let next = READY.exclusive_access().pop_front().unwrap_or(IDLE_TID);
            let cur_ctx = &mut tab.slots[cur].as_mut().unwrap().ctx as *mut ThreadContext;
            let next_thr = tab.slots[next].as_mut().unwrap();
            next_thr.state = ThreadState::Running;
            let mtag = next_thr.proc.as_ref().map(|p| p.mtag());
            (
                cur_ctx,
                &next_thr.ctx as *const ThreadContext,
                next,
                mtag,
            )
        };

        // 用户进程线程装它自己的地址空间, 纯内核线程回到 main_mtag
        match next_mtag {
            Some(mtag) if mtag != mspace::main_mtag() => {
                mspace::switch_mspace(mtag);
            }
            _ => mspace::reset_active_mspace(),
        };

        *CURRENT.exclusive_access() = next_tid;
        *PREV.exclusive_access() = cur;

        unsafe { __switch(cur_ctx, next_ctx) };

        // 再次被调度, 先看看上一个线程是否需要收尸
        reap_previous();
        restore_interrupts(pie);
    }

    /// 条件变量把线程挂起前调用: 标记等待状态
    pub fn mark_waiting(tid: Tid, cond_name: &'static str) {
        let mut tab = THREADS.exclusive_access();
        let thr = tab.slots[tid].as_mut().unwrap();
        assert_eq!(
            thr.state,
            ThreadState::Running,
            "only the running thread can wait"
        );
        thr.state = ThreadState::Waiting;
        thr.blocked_on = Some(cond_name);
    }

    /// broadcast 调用: 等待线程回到就绪队列尾部
    pub fn make_ready(tid: Tid) {
        let mut tab = THREADS.exclusive_access();
        let thr = tab.slots[tid].as_mut().unwrap();
        assert_eq!(thr.state, ThreadState::Waiting);
        thr.state = ThreadState::Ready;
        thr.blocked_on = None;
        drop(tab);
        READY.exclusive_access().push_back(tid);
    }

    /// 终止当前线程: 清空持有的锁并唤醒等待者, 广播 child_exit,
    /// 然后永不返回地让出. main 线程退出意味着整个内核正常停机
    pub fn exit() -> ! {
        let cur = current_tid();

        let locks: Vec<Arc<Lock>> = {
            let mut tab = THREADS.exclusive_access();
            core::mem::take(&mut tab.slots[cur].as_mut().unwrap().held_locks)
        };
        for lock in locks {
            lock.clear_on_exit();
        }

        if cur == MAIN_TID {
            halt_success();
        }

        let child_exit = {
            let mut tab = THREADS.exclusive_access();
            let thr = tab.slots[cur].as_mut().unwrap();
            thr.state = ThreadState::Exited;
            Arc::clone(&thr.child_exit)
        };
        child_exit.broadcast();
        suspend();
        // EXITED 线程不会再被调度
        halt_failure();
    }

    /// 等待子线程退出并回收它的槽位
    /// tid == 0 表示等任意一个孩子; 非孩子或没有孩子返回 EINVAL
    pub fn join(tid: Tid) -> SysResult<Tid> {
        let cur = current_tid();

        let target = {
            let tab = THREADS.exclusive_access();
            if tid > 0 {
                if tid >= NTHR {
                    return Err(SysError(syserr::EINVAL));
                }
                match tab.slots[tid].as_ref() {
                    Some(thr) if thr.parent == cur => tid,
                    _ => return Err(SysError(syserr::EINVAL)),
                }
            } else {
                match (1..NTHR).find(|&i| {
                    tab.slots[i]
                        .as_ref()
                        .map(|t| t.parent == cur)
                        .unwrap_or(false)
                }) {
                    Some(i) => i,
                    None => return Err(SysError(syserr::EINVAL)),
                }
            }
        };

        let child_exit = {
            let tab = THREADS.exclusive_access();
            Arc::clone(&tab.slots[target].as_ref().unwrap().child_exit)
        };
        loop {
            {
                let tab = THREADS.exclusive_access();
                if tab.slots[target].as_ref().unwrap().state == ThreadState::Exited {
                    break;
                }
            }
            child_exit.wait();
        }

        let pie = disable_interrupts();
        reclaim(target);
        restore_interrupts(pie);
        Ok(target)
    }

    /// 清槽: 死者的孩子过继给它的父亲
    fn reclaim(tid: Tid) {
        let mut tab = THREADS.exclusive_access();
        let parent = tab.slots[tid].as_ref().unwrap().parent;
        assert_eq!(tab.slots[tid].as_ref().unwrap().state, ThreadState::Exited);
        for i in 1..NTHR {
            if i != tid {
                if let Some(thr) = tab.slots[i].as_mut() {
                    if thr.parent == tid {
                        thr.parent = parent;
                    }
                }
            }
        }
        tab.slots[tid] = None;
    }

    pub fn push_held_lock(lock: Arc<Lock>) {
        let cur = current_tid();
        THREADS.exclusive_access().slots[cur]
            .as_mut()
            .unwrap()
            .held_locks
            .push(lock);
    }

    pub fn pop_held_lock(lock: &Arc<Lock>) {
        let cur = current_tid();
        let mut tab = THREADS.exclusive_access();
        let held = &mut tab.slots[cur].as_mut().unwrap().held_locks;
        if let Some(pos) = held.iter().position(|l| Arc::ptr_eq(l, lock)) {
            held.remove(pos);
        }
    }

    pub fn set_process(tid: Tid, proc: Arc<Process>) {
        THREADS.exclusive_access().slots[tid].as_mut().unwrap().proc = Some(proc);
    }

    pub fn current_process() -> Option<Arc<Process>> {
        let cur = current_tid();
        THREADS.exclusive_access().slots[cur]
            .as_ref()
            .unwrap()
            .proc
            .clone()
    }

    /// 当前线程记录的地址, 进入用户态前写进陷入帧的 tp
    pub fn current_thread_ptr() -> usize {
        let cur = current_tid();
        THREADS.exclusive_access().slots[cur]
            .as_ref()
            .unwrap()
            .as_ref() as *const Thread as usize
    }

    /// 当前线程内核栈上保留的陷入帧槽位: 锚的正下方
    pub fn current_trap_slot() -> usize {
        let cur = current_tid();
        let anchor = THREADS.exclusive_access().slots[cur]
            .as_ref()
            .unwrap()
            .stack_anchor;
        anchor - core::mem::size_of::<TrapFrame>()
    }
}
