pub mod iotab;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use logger::{debug, info};

use crate::intr::{disable_interrupts, restore_interrupts};
use crate::io::Io;
use crate::loader;
use crate::memory::mspace::{self, MTag};
use crate::sync::unicore::{UPIntrFreeCell, UPSafeCell};
use crate::sync::Condition;
use crate::task::{self, Tid};
use crate::trap::context::TrapFrame;
use crate::trap::trap_frame_jump;
use crate::{SysError, SysResult, NPROC, PAGE_SIZE, UMEM_END_VMA};
use sys_interface::syserr;

use self::iotab::IoTable;

pub type Pid = usize;

struct ProcessInner {
    tid: Tid,
    mtag: MTag,
    pub iotab: IoTable,
}

/// 进程记录: 表槽位, 所属线程, 地址空间标签, 以及 16 格 I/O 表
pub struct Process {
    idx: Pid,
    // 调度器在切换时要读 mtag, 所以用关中断的 cell
    inner: UPIntrFreeCell<ProcessInner>,
}

impl Process {
    fn new(idx: Pid, tid: Tid, mtag: MTag, iotab: IoTable) -> Arc<Self> {
        Arc::new(Self {
            idx,
            inner: unsafe { UPIntrFreeCell::new(ProcessInner { tid, mtag, iotab }) },
        })
    }

    pub fn idx(&self) -> Pid {
        self.idx
    }

    pub fn tid(&self) -> Tid {
        self.inner.exclusive_access().tid
    }

    pub fn mtag(&self) -> MTag {
        self.inner.exclusive_access().mtag
    }

    /// 对 I/O 表做一次受控访问, 闭包里不许阻塞
    pub fn with_iotab<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&mut IoTable) -> V,
    {
        self.inner.exclusive_session(|inner| f(&mut inner.iotab))
    }
}

lazy_static! {
    static ref PROCS: UPSafeCell<[Option<Arc<Process>>; NPROC]> =
        unsafe { UPSafeCell::new([const { None }; NPROC]) };
}

/// 进程管理器: 把 main 线程包装成 0 号进程, 并拉起抢占线程
pub fn init() {
    info!("Process manager initializing (NPROC = {})", NPROC);
    let main_proc = Process::new(0, task::MAIN_TID, mspace::active_mspace(), IoTable::new());
    PROCS.exclusive_access()[0] = Some(Arc::clone(&main_proc));
    task::api::set_process(task::MAIN_TID, main_proc);

    // 开启抢占式多任务
    crate::intr::start_interrupter();
}

pub fn current_process() -> SysResult<Arc<Process>> {
    task::api::current_process().ok_or(SysError(syserr::EINVAL))
}

/// 换上新的可执行映像, 成功不再返回
///
/// 旧的用户半区整个丢掉, 换一棵内核半区指针共享的新根表,
/// 装载 ELF, 在用户区间顶端铺一页初始栈并摆好 argv,
/// 最后拼一个 sret 进用户态的陷入帧跳过去
pub fn process_exec(exeio: Io, args: Vec<String>) -> SysResult<()> {
    let proc = current_process()?;

    mspace::discard_active_mspace();
    let mtag = mspace::create_user_mspace().ok_or(SysError(syserr::ENOMEM))?;
    mspace::switch_mspace(mtag);
    // 装载会阻塞在磁盘 I/O 上, 调度器切回来时要装的就是这个新空间,
    // 旧标签指向的根表已经释放, 必须先换掉
    {
        let mut inner = proc.inner.exclusive_access();
        inner.mtag = mtag;
        inner.tid = task::api::current_tid();
    }

    let entry = loader::elf_load(exeio.as_ref())?;

    use crate::memory::page_table::PTEFlags;
    mspace::alloc_and_map_range(
        UMEM_END_VMA - PAGE_SIZE,
        PAGE_SIZE,
        PTEFlags::R | PTEFlags::W | PTEFlags::U | PTEFlags::G,
    )?;
    let (usp, argv_uva, argc) = build_stack(&args)?;

    let tp = task::api::current_thread_ptr();
    let tfr = TrapFrame::app_init(entry, usp, argc, argv_uva, tp);

    debug!(
        "exec: entry = {:#x}, user sp = {:#x}, argc = {}",
        entry, usp, argc
    );
    trap_frame_jump(&tfr)
}

/// 在初始用户栈页的高端摆出 argv:
/// 先是 argc+1 个指针 (用户视角的地址, 末尾 NULL), 后跟各个串
/// 返回 (用户 sp, 用户视角的 argv 地址, argc)
fn build_stack(args: &[String]) -> SysResult<(usize, usize, usize)> {
    let argc = args.len();
    // argv[] 连同末尾 NULL 必须塞得进一页
    if argc >= PAGE_SIZE / core::mem::size_of::<usize>() - 1 {
        return Err(SysError(syserr::ENOMEM));
    }

    let mut stksz = (argc + 1) * core::mem::size_of::<usize>();
    for arg in args {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(SysError(syserr::ENOMEM));
        }
        stksz += argsz;
    }
    // RISC-V ABI 要求 sp 16 字节对齐
    stksz = (stksz + 15) & !15;
    assert!(stksz <= PAGE_SIZE);

    let argv_uva = UMEM_END_VMA - stksz;

    // 当前地址空间就是新进程的, 直接往用户页里写
    unsafe {
        let argv = argv_uva as *mut usize;
        let mut p = argv_uva + (argc + 1) * core::mem::size_of::<usize>();
        for (i, arg) in args.iter().enumerate() {
            *argv.add(i) = p;
            core::ptr::copy_nonoverlapping(arg.as_ptr(), p as *mut u8, arg.len());
            *((p + arg.len()) as *mut u8) = 0;
            p += arg.len() + 1;
        }
        *argv.add(argc) = 0;
    }

    Ok((argv_uva, argv_uva, argc))
}

/// fork: 新进程记录 + 急切拷贝的地址空间 + 逐槽加引用的 I/O 表,
/// 再造一个线程从跳板把父进程的陷入帧带进用户态.
/// 父进程等孩子拷完帧才返回, 返回值是孩子的线程号
pub fn process_fork(tfr: &TrapFrame) -> SysResult<Tid> {
    let parent = current_process()?;

    let idx = {
        let tab = PROCS.exclusive_access();
        match (0..NPROC).find(|&i| tab[i].is_none()) {
            Some(i) => i,
            None => return Err(SysError(syserr::EMPROC)),
        }
    };

    let mtag = mspace::clone_active_mspace().ok_or(SysError(syserr::ENOMEM))?;
    let iotab = parent.with_iotab(|t| t.clone());

    let child = Process::new(idx, 0, mtag, iotab);
    PROCS.exclusive_access()[idx] = Some(Arc::clone(&child));

    let done = Arc::new(Condition::new("fork_done"));

    // 孩子从就绪队列捞出来之前必须把进程挂好,
    // 否则它会带着错误的地址空间进用户态
    let pie = disable_interrupts();
    let tid = match task::api::spawn(
        "forked",
        fork_func as usize,
        &[
            &*done as *const Condition as usize,
            tfr as *const TrapFrame as usize,
        ],
    ) {
        Ok(tid) => tid,
        Err(e) => {
            restore_interrupts(pie);
            PROCS.exclusive_access()[idx] = None;
            return Err(e);
        }
    };
    child.inner.exclusive_access().tid = tid;
    task::api::set_process(tid, child);
    restore_interrupts(pie);

    // 等孩子把陷入帧拷走
    done.wait();
    Ok(tid)
}

/// 子线程入口: 拷一份父进程的陷入帧, 返回值改 0, tp 换成自己,
/// 通知父进程后跳进用户态
extern "C" fn fork_func(done: usize, tfr: usize) {
    let done = unsafe { &*(done as *const Condition) };
    let tfr = unsafe { &*(tfr as *const TrapFrame) };

    let mut child_tfr = tfr.clone();
    child_tfr.set_a0(0);
    child_tfr.x[4] = task::api::current_thread_ptr();

    done.broadcast();
    trap_frame_jump(&child_tfr)
}

/// 进程退出: 关掉所有 I/O 槽, 清表, 释放地址空间, 最后线程退出
/// 0 号进程退出视作内核正常停机
pub fn process_exit() -> ! {
    let proc = match task::api::current_process() {
        Some(p) => p,
        // 纯内核线程, 直接走线程退出
        None => task::api::exit(),
    };

    proc.with_iotab(|iotab| iotab.clear());
    PROCS.exclusive_access()[proc.idx] = None;
    mspace::discard_active_mspace();
    task::api::exit()
}
