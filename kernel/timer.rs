use alloc::vec::Vec;

use logger::info;
use qemu_config::CLOCK_FREQ;
use riscv::register::{sie, time};

use crate::intr::{disable_interrupts, restore_interrupts};
use crate::see::set_stcmp;
use crate::sync::unicore::UPIntrFreeCell;
use crate::sync::Condition;

/// 定时闹钟, 唤醒时刻以时钟计数 (tick) 表示
pub struct Alarm {
    cond: Condition,
    twake: u64,
}

struct SleepEntry {
    twake: u64,
    // 指向睡眠线程栈上的 Alarm 条件变量
    // 线程在唤醒前一直阻塞, 所以指针在表里期间始终有效
    cond: *const Condition,
}

unsafe impl Send for SleepEntry {}

lazy_static! {
    // 睡眠表按 twake 升序排列, 表头就是下一个要醒的
    static ref SLEEP_LIST: UPIntrFreeCell<Vec<SleepEntry>> =
        unsafe { UPIntrFreeCell::new(Vec::new()) };
}

pub fn rdtime() -> u64 {
    time::read() as u64
}

pub fn init() {
    info!("Timer initializing");
    set_stcmp(u64::MAX);
}

impl Alarm {
    pub fn new(name: &'static str) -> Self {
        Self {
            cond: Condition::new(name),
            twake: rdtime(),
        }
    }

    /// 让下一次睡眠以当前时刻为基准
    pub fn reset(&mut self) {
        self.twake = rdtime();
    }
}

/// 睡到 twake + tcnt, 唤醒时刻相对上一次, 这样周期睡眠不会漂移
pub fn alarm_sleep(al: &mut Alarm, tcnt: u64) {
    if tcnt == 0 {
        return;
    }
    al.twake = al.twake.saturating_add(tcnt);
    if al.twake < rdtime() {
        return;
    }

    // 插入与进入等待队列之间不能被时钟中断打断,
    // 否则到期广播可能发生在本线程挂上等待队列之前而丢失
    let pie = disable_interrupts();
    {
        let mut list = SLEEP_LIST.exclusive_access();
        let pos = list
            .iter()
            .position(|e| e.twake >= al.twake)
            .unwrap_or(list.len());
        list.insert(
            pos,
            SleepEntry {
                twake: al.twake,
                cond: &al.cond,
            },
        );
        // 表头变了就重编时钟
        if pos == 0 {
            set_stcmp(al.twake);
        }
    }
    al.cond.wait();
    restore_interrupts(pie);
    unsafe { sie::set_stimer() };
}

pub fn alarm_sleep_sec(al: &mut Alarm, sec: u64) {
    alarm_sleep(al, sec * CLOCK_FREQ as u64);
}

pub fn alarm_sleep_ms(al: &mut Alarm, ms: u64) {
    alarm_sleep(al, ms * (CLOCK_FREQ / 1000) as u64);
}

pub fn alarm_sleep_us(al: &mut Alarm, us: u64) {
    alarm_sleep(al, us * (CLOCK_FREQ / 1000 / 1000) as u64);
}

pub fn sleep_sec(sec: u64) {
    sleep_ms(1000 * sec);
}

pub fn sleep_ms(ms: u64) {
    sleep_us(1000 * ms);
}

pub fn sleep_us(us: u64) {
    let mut al = Alarm::new("sleep");
    alarm_sleep_us(&mut al, us);
}

/// 时钟中断: 弹出所有到期的闹钟并广播,
/// 然后把比较寄存器对准新表头, 表空则关掉时钟中断
pub fn handle_timer_interrupt() {
    let now = rdtime();
    let mut expired: Vec<*const Condition> = Vec::new();
    {
        let mut list = SLEEP_LIST.exclusive_access();
        while list.first().map(|e| e.twake <= now).unwrap_or(false) {
            expired.push(list.remove(0).cond);
        }
        match list.first() {
            Some(head) => set_stcmp(head.twake),
            None => {
                set_stcmp(u64::MAX);
                unsafe { sie::clear_stimer() };
            }
        }
    }
    for cond in expired {
        unsafe { (*cond).broadcast() };
    }
}
