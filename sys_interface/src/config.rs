pub const KB: usize = 1024;
pub const MB: usize = 1024 * KB;
pub const GB: usize = 1024 * MB;

// 单页大小
pub const PAGE_SIZE: usize = 4 * KB;
// 单页页宽
pub const PAGE_SIZE_BITS: usize = 12;

// 用户虚拟地址范围, 最高一页是初始用户栈
pub const UMEM_START_VMA: usize = 0x0_C000_0000;
pub const UMEM_END_VMA: usize = 0x1_0000_0000;

// 用户堆起始地址, 按需缺页增长
pub const USER_HEAP_VMA: usize = 0x0_E000_0000;

// 每个进程最多打开的 io 对象数
pub const PROCESS_IOMAX: usize = 16;
