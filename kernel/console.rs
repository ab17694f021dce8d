use core::fmt::{self, Write};

use qemu_config::UART0_BASE;

// 控制台直接轮询 UART0, 与 logger 共用同一个口,
// 这样在设备层尚未初始化时也能输出
const LSR_THRE: u8 = 1 << 5;

pub fn console_putchar(c: u8) {
    unsafe {
        while core::ptr::read_volatile((UART0_BASE + 5) as *const u8) & LSR_THRE == 0 {}
        core::ptr::write_volatile(UART0_BASE as *mut u8, c);
    }
}

struct Console;

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        s.bytes().for_each(console_putchar);
        Ok(())
    }
}

pub fn print(args: fmt::Arguments) {
    Console.write_fmt(args).unwrap();
}

#[macro_export]
macro_rules! print {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!($fmt $(, $($arg)+)?))
    }
}

#[macro_export]
macro_rules! println {
    ($fmt: literal $(, $($arg: tt)+)?) => {
        $crate::console::print(format_args!(concat!($fmt, "\n") $(, $($arg)+)?))
    }
}
