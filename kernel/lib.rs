#![no_std]
#![feature(alloc_error_handler)]
#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;
extern crate alloc;

pub mod init;

mod console;
mod error;
mod intr;
mod lang_items;
mod loader;
mod see;
mod timer;

pub mod driver;
pub mod fs;
pub mod io;
pub mod memory;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod trap;

use logger::LogLevel;
pub const LOG_LEVEL: LogLevel = LogLevel::INFO;

pub use error::{SysError, SysResult};

// 配置信息
// ---------------------------------------------------------------------

pub use sys_interface::config::{
    KB, MB, PAGE_SIZE, PAGE_SIZE_BITS, PROCESS_IOMAX, UMEM_END_VMA, UMEM_START_VMA, USER_HEAP_VMA,
};

// 最多线程数, 槽 0 是 main, 最后一个槽是 idle
pub const NTHR: usize = 16;
// 最多进程数
pub const NPROC: usize = 16;
// 最多设备数
pub const NDEV: usize = 16;
// 外部中断源个数
pub const NIRQ: usize = qemu_config::PLIC_SRC_CNT;

// 堆分配对齐
pub const HEAP_ALIGN: usize = 16;
// 单次堆分配上限
pub const HEAP_ALLOC_MAX: usize = 64 * KB;

// 块缓存容量
pub const CACHE_CAPACITY: usize = 64;

// 中断优先级
pub const UART_INTR_PRIO: u32 = 3;
pub const VIOBLK_INTR_PRIO: u32 = 1;
pub const VIORNG_INTR_PRIO: u32 = 1;
