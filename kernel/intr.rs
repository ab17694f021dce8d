use alloc::boxed::Box;

use logger::info;
use riscv::register::{sie, sstatus};

use crate::sync::unicore::UPIntrFreeCell;
use crate::timer::{self, Alarm};
use crate::trap::plic;
use crate::{task, NIRQ};

// 中断开关原语, 所有就绪队列/等待队列的操作都在关中断下进行
pub fn disable_interrupts() -> bool {
    let was = sstatus::read().sie();
    unsafe { sstatus::clear_sie() };
    was
}

pub fn restore_interrupts(pie: bool) {
    if pie {
        unsafe { sstatus::set_sie() };
    }
}

pub fn enable_interrupts() {
    unsafe { sstatus::set_sie() };
}

pub type Isr = Box<dyn Fn(usize) + Send + Sync>;

struct IsrTable {
    slots: [Option<Isr>; NIRQ],
}

lazy_static! {
    static ref ISRTAB: UPIntrFreeCell<IsrTable> = unsafe {
        UPIntrFreeCell::new(IsrTable {
            slots: [const { None }; NIRQ],
        })
    };
}

/// 初始化 PLIC 并打开 S 态的时钟与外部中断
/// 这里只开 sie 里的使能位, sstatus.SIE 推迟到调度器就绪后再开
pub fn init() {
    info!("Interrupt manager initializing");
    plic::init();
    unsafe {
        sie::set_stimer();
        sie::set_sext();
    }
}

pub fn enable_intr_source(srcno: usize, prio: u32, isr: Isr) {
    assert!(0 < srcno && srcno < NIRQ);
    assert!(prio > 0);

    ISRTAB.exclusive_access().slots[srcno] = Some(isr);
    plic::enable_source(srcno, prio);
}

pub fn disable_intr_source(srcno: usize) {
    plic::disable_source(srcno);
    ISRTAB.exclusive_access().slots[srcno] = None;
}

/// 外部中断: 向 PLIC 认领, 调用登记的 ISR, 再向 PLIC 回执
/// 源号 0 表示没有待处理中断
pub fn handle_extern_interrupt() {
    let srcno = plic::claim_interrupt();
    assert!(srcno < NIRQ);

    if srcno == 0 {
        return;
    }

    {
        let isrtab = ISRTAB.exclusive_access();
        match isrtab.slots[srcno] {
            Some(ref isr) => isr(srcno),
            None => panic!("no ISR registered for interrupt source {}", srcno),
        }
    }

    plic::finish_interrupt(srcno);
}

/// 抢占线程: 每 10ms 醒一次, 由它驱动时钟中断,
/// 从用户态回来的中断路径上会顺手 yield 一次
extern "C" fn interrupter(_: usize, _: usize) {
    let mut alarm = Alarm::new("interrupter");
    loop {
        timer::alarm_sleep_ms(&mut alarm, 10);
    }
}

pub fn start_interrupter() {
    task::api::spawn("interrupter", interrupter as usize, &[]).expect("spawn interrupter");
}
