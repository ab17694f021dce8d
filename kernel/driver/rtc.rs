//! Goldfish RTC: 两个 32 位寄存器拼出纳秒时间戳, 读低位锁存高位

use alloc::boxed::Box;
use alloc::sync::Arc;

use logger::info;

use crate::driver::register_device;
use crate::io::{Io, IoEndpoint};
use crate::{SysError, SysResult};
use sys_interface::syserr;

const TIME_LOW: usize = 0x00;
const TIME_HIGH: usize = 0x04;

#[derive(Clone, Copy)]
struct Rtc {
    base: usize,
}

impl Rtc {
    fn read_ns(&self) -> u64 {
        unsafe {
            let lo = core::ptr::read_volatile((self.base + TIME_LOW) as *const u32) as u64;
            let hi = core::ptr::read_volatile((self.base + TIME_HIGH) as *const u32) as u64;
            hi << 32 | lo
        }
    }
}

struct RtcIo {
    rtc: Rtc,
}

impl IoEndpoint for RtcIo {
    /// 读出 8 字节小端纳秒数
    fn readat(&self, _pos: u64, buf: &mut [u8]) -> SysResult<usize> {
        if buf.len() < 8 {
            return Err(SysError(syserr::EINVAL));
        }
        buf[..8].copy_from_slice(&self.rtc.read_ns().to_le_bytes());
        Ok(8)
    }

    fn read(&self, buf: &mut [u8]) -> SysResult<usize> {
        self.readat(0, buf)
    }
}

pub fn attach(base: usize) {
    let rtc = Rtc { base };
    let instno = register_device("rtc", Box::new(move || -> SysResult<Io> {
        Ok(Arc::new(RtcIo { rtc }))
    }));
    info!("rtc{} attached at {:#x}", instno, base);
}
