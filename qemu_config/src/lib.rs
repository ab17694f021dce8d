#![no_std]

//! qemu virt 机器常量, 内核与 logger 共用

/// 时钟频率, 机器每秒执行 CLOCK_FREQ 这么多 cycle
/// 因此 CLOCK_FREQ 可以理解为一秒
pub const CLOCK_FREQ: usize = 10000000;

// 微秒单位
pub const MICRO_UNIT: usize = CLOCK_FREQ / 1_000_000;
// 毫秒单位
pub const MILLI_UNIT: usize = CLOCK_FREQ / 1_000;
// 秒单位
pub const SECOND_UNIT: usize = CLOCK_FREQ;

// 物理内存: qemu virt 把 RAM 挂在 0x8000_0000
pub const RAM_START: usize = 0x8000_0000;
pub const RAM_SIZE: usize = 8 * 1024 * 1024;
pub const RAM_END: usize = RAM_START + RAM_SIZE;

// NS16550 串口, 相邻实例间隔 0x100
pub const UART0_BASE: usize = 0x1000_0000;
pub const UART_STEP: usize = 0x100;
pub const UART0_IRQ: usize = 10;

// VirtIO MMIO 槽位, 相邻实例间隔 0x1000
pub const VIRTIO0_BASE: usize = 0x1000_1000;
pub const VIRTIO_STEP: usize = 0x1000;
pub const VIRTIO0_IRQ: usize = 1;
pub const VIRTIO_COUNT: usize = 8;

// Goldfish RTC
pub const RTC_BASE: usize = 0x0010_1000;

// PLIC
pub const PLIC_BASE: usize = 0x0C00_0000;
// qemu virt 的中断源个数 (VIRT_IRQCHIP_NUM_SOURCES)
pub const PLIC_SRC_CNT: usize = 96;
// hart0 M 态与 hart0 S 态
pub const PLIC_CTX_CNT: usize = 2;

#[inline]
pub fn uart_base(instno: usize) -> usize {
    UART0_BASE + instno * UART_STEP
}

#[inline]
pub fn virtio_base(slot: usize) -> usize {
    VIRTIO0_BASE + slot * VIRTIO_STEP
}
