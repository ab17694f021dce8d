#![no_main]
#![no_std]

use core::arch::global_asm;
use kite::init::*;

global_asm!(include_str!("entry.asm"));

#[no_mangle]
pub fn main() -> ! {
    // 内核初始化
    if !kernel_start() {
        panic!("kernel init failed!");
    }
    panic!("first process should not return!");
}
