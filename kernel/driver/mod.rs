//! 设备注册表: 名字 + 实例号 -> 打开函数

pub mod block;
pub mod bus;
pub mod chardev;
pub mod rtc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use logger::debug;

use crate::io::Io;
use crate::sync::unicore::UPSafeCell;
use crate::{SysError, SysResult, NDEV};
use sys_interface::syserr;

type OpenFn = Box<dyn Fn() -> SysResult<Io> + Send + Sync>;

struct DevEntry {
    name: &'static str,
    open: OpenFn,
}

lazy_static! {
    static ref DEVTAB: UPSafeCell<Vec<DevEntry>> = unsafe { UPSafeCell::new(Vec::new()) };
}

/// 登记一个设备实例, 返回同名设备里的实例号
pub fn register_device(name: &'static str, open: OpenFn) -> usize {
    let mut tab = DEVTAB.exclusive_access();
    assert!(tab.len() < NDEV, "device table full");
    let instno = tab.iter().filter(|e| e.name == name).count();
    tab.push(DevEntry { name, open });
    instno
}

/// 按名字与实例号打开设备
pub fn open_device(name: &str, instno: usize) -> SysResult<Io> {
    let tab = DEVTAB.exclusive_access();
    let mut k = 0;
    for entry in tab.iter() {
        if entry.name == name {
            if k == instno {
                return (entry.open)();
            }
            k += 1;
        }
    }
    debug!("device {}{} not found", name, instno);
    Err(SysError(syserr::ENODEV))
}

/// 把 "uart1" 这样的设备串拆成 ("uart", 1), 没有数字尾缀按 0 算
pub fn parse_device_spec(spec: &str) -> SysResult<(&str, usize)> {
    if spec.is_empty() || !spec.bytes().all(|b| b > b' ' && b < 0x7f) {
        return Err(SysError(syserr::EINVAL));
    }
    let split = spec
        .bytes()
        .rposition(|b| !b.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let (name, digits) = spec.split_at(split);
    if name.is_empty() {
        return Err(SysError(syserr::EINVAL));
    }
    if digits.is_empty() {
        return Ok((name, 0));
    }
    match digits.parse::<usize>() {
        Ok(instno) => Ok((name, instno)),
        Err(_) => Err(SysError(syserr::EINVAL)),
    }
}
