//! ioctl 命令号, 内核 I/O 端点与用户程序共用

pub const IOCTL_GETBLKSZ: usize = 0; // 忽略 arg
pub const IOCTL_GETEND: usize = 2; // arg 是 *mut u64
pub const IOCTL_SETEND: usize = 3; // arg 是 *const u64
pub const IOCTL_GETPOS: usize = 4; // arg 是 *mut u64
pub const IOCTL_SETPOS: usize = 5; // arg 是 *const u64
