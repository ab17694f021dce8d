//! 系统调用号, 调用号放 a7, 参数依次放 a0..a2, 返回值在 a0

pub const SYSCALL_EXIT: usize = 0; // 终止当前进程
pub const SYSCALL_EXEC: usize = 1; // 加载新的可执行映像
pub const SYSCALL_FORK: usize = 2; // 创建子进程
pub const SYSCALL_WAIT: usize = 3; // 等待子线程退出
pub const SYSCALL_PRINT: usize = 4; // 向控制台打印消息
pub const SYSCALL_USLEEP: usize = 5; // 睡眠若干微秒

pub const SYSCALL_DEVOPEN: usize = 10; // 打开设备
pub const SYSCALL_FSOPEN: usize = 11; // 打开文件
pub const SYSCALL_FSCREATE: usize = 12; // 创建文件
pub const SYSCALL_FSDELETE: usize = 13; // 删除文件

pub const SYSCALL_CLOSE: usize = 16; // 关闭 fd
pub const SYSCALL_READ: usize = 17; // 从 fd 读
pub const SYSCALL_WRITE: usize = 18; // 向 fd 写
pub const SYSCALL_IOCTL: usize = 19; // 对 fd 发 ioctl
pub const SYSCALL_PIPE: usize = 20; // 创建管道
pub const SYSCALL_IODUP: usize = 21; // 复制描述符

/// 调用号对应的名字, 用于日志
pub fn name(scnum: usize) -> &'static str {
    match scnum {
        SYSCALL_EXIT => "exit",
        SYSCALL_EXEC => "exec",
        SYSCALL_FORK => "fork",
        SYSCALL_WAIT => "wait",
        SYSCALL_PRINT => "print",
        SYSCALL_USLEEP => "usleep",
        SYSCALL_DEVOPEN => "devopen",
        SYSCALL_FSOPEN => "fsopen",
        SYSCALL_FSCREATE => "fscreate",
        SYSCALL_FSDELETE => "fsdelete",
        SYSCALL_CLOSE => "close",
        SYSCALL_READ => "read",
        SYSCALL_WRITE => "write",
        SYSCALL_IOCTL => "ioctl",
        SYSCALL_PIPE => "pipe",
        SYSCALL_IODUP => "iodup",
        _ => "unknown",
    }
}
