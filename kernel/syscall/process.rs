//! 进程与线程相关的系统调用

use alloc::string::String;
use alloc::vec::Vec;

use super::{user_read, user_str};
use crate::process::{current_process, process_exec, process_exit, process_fork};
use crate::task;
use crate::timer;
use crate::trap::context::TrapFrame;
use crate::{println, SysError, SysResult, PROCESS_IOMAX};
use sys_interface::syserr;

pub fn sys_exit() -> isize {
    process_exit()
}

/// exec 前把 argv 整个拷进内核, 旧地址空间马上就没了
pub fn sys_exec(fd: isize, argc: usize, argv_uva: usize) -> SysResult<usize> {
    if !(0..PROCESS_IOMAX as isize).contains(&fd) {
        return Err(SysError(syserr::EBADFD));
    }
    let io = current_process()?
        .with_iotab(|t| t.get(fd as usize))
        .ok_or(SysError(syserr::EBADFD))?;

    // argv 连同指针数组必须能摆进一页初始栈
    if argc >= crate::PAGE_SIZE / core::mem::size_of::<usize>() - 1 {
        return Err(SysError(syserr::ENOMEM));
    }

    let mut args: Vec<String> = Vec::new();
    for i in 0..argc {
        let ptr: usize = user_read(argv_uva + i * core::mem::size_of::<usize>())?;
        args.push(user_str(ptr)?);
    }

    process_exec(io, args)?;
    unreachable!("exec does not return on success")
}

pub fn sys_fork(tfr: &TrapFrame) -> SysResult<usize> {
    process_fork(tfr)
}

pub fn sys_wait(tid: isize) -> SysResult<usize> {
    if tid < 0 {
        return Err(SysError(syserr::EINVAL));
    }
    task::api::join(tid as usize)
}

pub fn sys_print(msg_uva: usize) -> SysResult<usize> {
    let msg = user_str(msg_uva)?;
    println!(
        "Thread <{}:{}> says: {}",
        task::api::current_name(),
        task::api::current_tid(),
        msg
    );
    Ok(0)
}

pub fn sys_usleep(us: usize) -> SysResult<usize> {
    timer::sleep_us(us as u64);
    Ok(0)
}
