use core::arch::global_asm;

use logger::{info, warn};
use riscv::register::{
    scause::{self, Exception, Interrupt, Trap},
    stval, stvec,
    utvec::TrapMode,
};

use crate::memory::mspace;
use crate::process;
use crate::syscall::syscall;
use crate::task;
use crate::{intr, timer};

pub mod context;
pub mod plic;

use self::context::TrapFrame;

global_asm!(include_str!("trap.S"));

extern "C" {
    fn __trap_entry();
    fn __frame_jump(frame: usize) -> !;
}

/// stvec 指向统一入口, sscratch 清零表示当前在内核态
pub fn init() {
    info!("Trap initializing");
    unsafe {
        riscv::register::sscratch::write(0);
        stvec::write(__trap_entry as usize, TrapMode::Direct);
    }
}

/// 把陷入帧写进当前线程内核栈的帧槽, 然后经恢复路径进入用户态
/// 不再返回
pub fn trap_frame_jump(tfr: &TrapFrame) -> ! {
    // 从现在到 sret 之间帧槽和 sscratch 都处于交接状态, 不能被打断
    intr::disable_interrupts();
    let slot = task::api::current_trap_slot();
    unsafe {
        core::ptr::write(slot as *mut TrapFrame, tfr.clone());
        __frame_jump(slot)
    }
}

/// 统一分发: 系统调用, 缺页, 时钟与外部中断
/// 从用户态进来的中断处理完后让出一次, 这就是抢占点
#[no_mangle]
pub extern "C" fn handle_trap(tfr: &mut TrapFrame) {
    let scause = scause::read();
    let stval = stval::read();
    let from_user = tfr.from_user();

    match scause.cause() {
        Trap::Interrupt(Interrupt::SupervisorTimer) => {
            timer::handle_timer_interrupt();
            if from_user {
                task::api::yield_();
            }
        }

        Trap::Interrupt(Interrupt::SupervisorExternal) => {
            intr::handle_extern_interrupt();
            if from_user {
                task::api::yield_();
            }
        }

        Trap::Exception(Exception::UserEnvCall) => {
            // 从 ecall 的下一条指令继续
            tfr.sepc += 4;
            let ret = syscall(tfr);
            tfr.set_a0(ret as usize);
        }

        Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::InstructionPageFault)
            if from_user =>
        {
            // 用户区间内的缺页补一张零页重试, 其余情况进程终止
            if !mspace::handle_umode_page_fault(stval) {
                warn!(
                    "{:?} in thread <{}:{}>, bad addr = {:#x}, sepc = {:#x}, killed",
                    scause.cause(),
                    task::api::current_name(),
                    task::api::current_tid(),
                    stval,
                    tfr.sepc
                );
                process::process_exit();
            }
        }

        Trap::Exception(e) if from_user => {
            // 非法指令 / 访问错误等, 杀掉进程
            warn!(
                "{:?} in thread <{}:{}>, stval = {:#x}, sepc = {:#x}, killed",
                e,
                task::api::current_name(),
                task::api::current_tid(),
                stval,
                tfr.sepc
            );
            process::process_exit();
        }

        _ => {
            // S 态异常说明内核自身出了问题
            panic!(
                "unexpected trap {:?} in S mode, stval = {:#x}, sepc = {:#x}",
                scause.cause(),
                stval,
                tfr.sepc
            );
        }
    }
}
