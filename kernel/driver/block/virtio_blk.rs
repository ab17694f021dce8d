//! VirtIO 块设备驱动
//!
//! 一条请求 = 头描述符 (设备只读) + 若干数据描述符 (每段不超过
//! seg_max) + 一字节状态描述符 (设备可写). 提交方把链头放进可用环
//! 再敲门铃, 然后在完成条件变量上睡; ISR 清空已用环, 按槽位记下
//! 返回长度与状态并广播

use alloc::boxed::Box;
use alloc::sync::Arc;

use logger::{info, warn};

use crate::driver::bus::virtio::*;
use crate::driver::register_device;
use crate::intr::{disable_intr_source, enable_intr_source};
use crate::io::{Io, IoEndpoint};
use crate::sync::unicore::UPIntrFreeCell;
use crate::sync::{Condition, Lock};
use crate::{SysError, SysResult, VIOBLK_INTR_PRIO};
use sys_interface::syserr;
use sys_interface::sysio::{IOCTL_GETBLKSZ, IOCTL_GETEND};

// 描述符池大小, 不能超过设备的 queue_num_max
const DESC_COUNT: usize = 8;

// 请求类型
const BLK_T_IN: u32 = 0;
const BLK_T_OUT: u32 = 1;

// 块设备特性位
const BLK_F_SEG_MAX: u16 = 2;
const BLK_F_BLK_SIZE: u16 = 6;
const BLK_F_TOPOLOGY: u16 = 10;

// 配置空间字段偏移
const CFG_CAPACITY: usize = 0x00;
const CFG_SEG_MAX: usize = 0x0C;
const CFG_BLK_SIZE: usize = 0x14;

/// 请求头, 设备按这个布局读
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct BlkReq {
    type_: u32,
    reserved: u32,
    sector: u64,
}

#[derive(Clone, Copy)]
struct ReqInfo {
    in_use: bool,
    // 设备写回的已用长度
    len: u32,
    status: u8,
}

/// 虚队列与每槽请求状态, 线程和 ISR 都会碰,
/// 整个包进 UPIntrFreeCell 里
struct VirtQ {
    desc: [VirtqDesc; DESC_COUNT],
    avail: VirtqAvail<DESC_COUNT>,
    used: VirtqUsed<DESC_COUNT>,
    last_used_idx: u16,
    free: [bool; DESC_COUNT],
    reqhdrs: [BlkReq; DESC_COUNT],
    status_bytes: [u8; DESC_COUNT],
    requests: [ReqInfo; DESC_COUNT],
}

pub struct VioBlk {
    regs: VirtioMmio,
    irqno: usize,
    blk_size: u32,
    capacity: u64,
    seg_max: u32,
    // 提交路径串行化; ISR 不拿它, 只碰 vq
    lock: Arc<Lock>,
    io_done: Condition,
    vq: UPIntrFreeCell<VirtQ>,
}

/// 验明正身并协商特性后把设备挂进注册表
/// 必要特性: 环复位 + 间接描述符; 想要: 块大小 + 拓扑
pub fn attach(regs: VirtioMmio, irqno: usize) {
    regs.set_status(STAT_ACKNOWLEDGE | STAT_DRIVER);
    fence();

    let mut needed = FeatureSet::new();
    needed.add(F_RING_RESET);
    needed.add(F_INDIRECT_DESC);
    let mut wanted = FeatureSet::new();
    wanted.add(BLK_F_BLK_SIZE);
    wanted.add(BLK_F_TOPOLOGY);
    wanted.add(BLK_F_SEG_MAX);

    let enabled = match negotiate_features(&regs, wanted, needed) {
        Ok(set) => set,
        Err(()) => {
            warn!("vioblk: feature negotiation failed, device refused");
            regs.set_status(STAT_FAILED);
            return;
        }
    };

    // 设备给了块大小就用, 否则按 512 算
    let blk_size = if enabled.test(BLK_F_BLK_SIZE) {
        regs.config_read32(CFG_BLK_SIZE)
    } else {
        512
    };
    assert!(blk_size.is_power_of_two());
    let capacity = regs.config_read64(CFG_CAPACITY);
    let seg_max = if enabled.test(BLK_F_SEG_MAX) {
        regs.config_read32(CFG_SEG_MAX)
    } else {
        0
    };

    let max = regs.queue_num_max();
    if (max as usize) < DESC_COUNT {
        warn!("vioblk: queue too small ({} < {})", max, DESC_COUNT);
        regs.set_status(STAT_FAILED);
        return;
    }

    let dev: &'static VioBlk = Box::leak(Box::new(VioBlk {
        regs,
        irqno,
        blk_size,
        capacity,
        seg_max,
        lock: Lock::new(),
        io_done: Condition::new("vioblk_io_done"),
        vq: unsafe {
            UPIntrFreeCell::new(VirtQ {
                desc: [VirtqDesc::default(); DESC_COUNT],
                avail: VirtqAvail {
                    flags: 0,
                    idx: 0,
                    ring: [0; DESC_COUNT],
                },
                used: VirtqUsed {
                    flags: 0,
                    idx: 0,
                    ring: [VirtqUsedElem::default(); DESC_COUNT],
                },
                last_used_idx: 0,
                free: [true; DESC_COUNT],
                reqhdrs: [BlkReq::default(); DESC_COUNT],
                status_bytes: [0xFF; DESC_COUNT],
                requests: [ReqInfo {
                    in_use: false,
                    len: 0,
                    status: 0xFF,
                }; DESC_COUNT],
            })
        },
    }));

    // 队列内存是恒等映射的, 直接拿地址给设备
    {
        let vq = dev.vq.exclusive_access();
        dev.regs.attach_virtq(
            0,
            DESC_COUNT as u32,
            vq.desc.as_ptr() as u64,
            &vq.avail as *const _ as u64,
            &vq.used as *const _ as u64,
        );
    }

    enable_intr_source(irqno, VIOBLK_INTR_PRIO, Box::new(move |_src| dev.handle_irq()));

    let instno = register_device("vioblk", Box::new(move || dev.open()));

    dev.regs.set_status(STAT_DRIVER_OK);
    fence();

    info!(
        "vioblk{} attached: {} sectors x {} bytes, irq {}",
        instno, capacity, blk_size, irqno
    );
}

impl VioBlk {
    fn open(&'static self) -> SysResult<Io> {
        Ok(Arc::new(VioBlkIo { dev: self }))
    }

    /// 提交一条读或写请求并睡等完成, 返回设备写回的已用长度
    fn transfer(&self, pos: u64, buf: usize, len: usize, write: bool) -> SysResult<u32> {
        let blksz = self.blk_size as u64;
        if len == 0 {
            return Err(SysError(syserr::EINVAL));
        }
        // 位置与长度都要对齐扇区
        if pos % blksz != 0 || len as u64 % blksz != 0 {
            return Err(SysError(syserr::EINVAL));
        }
        if pos > self.capacity * blksz {
            return Err(SysError(syserr::EINVAL));
        }

        let sector = pos / blksz;
        let mut len = len;
        // 截到容量以内
        if sector + (len as u64 / blksz) > self.capacity {
            len = ((self.capacity - sector) * blksz) as usize;
        }

        let seg_max = if self.seg_max == 0 {
            len
        } else {
            self.seg_max as usize
        };
        let num_data = (len + seg_max - 1) / seg_max;
        let total = 1 + num_data + 1;
        assert!(total <= DESC_COUNT);

        self.lock.acquire();

        // 留出整条链的描述符
        let slot = {
            let mut guard = self.vq.exclusive_access();
            let vq = &mut *guard;
            let mut chain = [0usize; DESC_COUNT];
            let mut found = 0;
            for i in 0..DESC_COUNT {
                if vq.free[i] {
                    chain[found] = i;
                    found += 1;
                    if found == total {
                        break;
                    }
                }
            }
            if found < total {
                drop(guard);
                self.lock.release();
                return Err(SysError(syserr::EBUSY));
            }

            let slot = chain[0];
            vq.requests[slot] = ReqInfo {
                in_use: true,
                len: 0,
                status: 0xFF,
            };
            vq.reqhdrs[slot] = BlkReq {
                type_: if write { BLK_T_OUT } else { BLK_T_IN },
                reserved: 0,
                sector,
            };
            vq.status_bytes[slot] = 0xFF;

            // 头描述符
            vq.free[slot] = false;
            vq.desc[slot] = VirtqDesc {
                addr: &vq.reqhdrs[slot] as *const _ as u64,
                len: core::mem::size_of::<BlkReq>() as u32,
                flags: DESC_F_NEXT,
                next: chain[1] as u16,
            };

            // 数据描述符, 读请求设备要写缓冲区
            let mut remaining = len;
            let mut data_ptr = buf;
            for j in 1..=num_data {
                let idx = chain[j];
                let seg = remaining.min(seg_max);
                vq.free[idx] = false;
                vq.desc[idx] = VirtqDesc {
                    addr: data_ptr as u64,
                    len: seg as u32,
                    flags: DESC_F_NEXT | if write { 0 } else { DESC_F_WRITE },
                    next: chain[if j < num_data { j + 1 } else { total - 1 }] as u16,
                };
                data_ptr += seg;
                remaining -= seg;
            }

            // 状态描述符收尾
            let stat = chain[total - 1];
            vq.free[stat] = false;
            vq.desc[stat] = VirtqDesc {
                addr: &vq.status_bytes[slot] as *const _ as u64,
                len: 1,
                flags: DESC_F_WRITE,
                next: 0,
            };

            // 链头进可用环
            let avail_idx = vq.avail.idx as usize % DESC_COUNT;
            vq.avail.ring[avail_idx] = slot as u16;
            fence();
            vq.avail.idx = vq.avail.idx.wrapping_add(1);
            slot
        };

        self.regs.queue_notify(0);

        // 等 ISR 把本槽标记完成
        // 查槽位和挂上等待队列之间要关中断, 否则完成广播可能抢在
        // 入队之前发出, 这一觉就没人叫醒了
        let (used_len, status) = loop {
            let pie = crate::intr::disable_interrupts();
            let done = {
                let vq = self.vq.exclusive_access();
                let req = vq.requests[slot];
                if req.in_use {
                    None
                } else {
                    Some((req.len, req.status))
                }
            };
            match done {
                Some(result) => {
                    crate::intr::restore_interrupts(pie);
                    break result;
                }
                None => {
                    self.io_done.wait();
                    crate::intr::restore_interrupts(pie);
                }
            }
        };

        self.lock.release();

        if status != 0 {
            warn!("vioblk: request failed with status {}", status);
            return Err(SysError(syserr::EIO));
        }
        Ok(used_len)
    }

    /// 清空已用环: 整条链归还描述符池, 记下长度与状态, 广播完成
    fn handle_irq(&self) {
        let intr_status = self.regs.interrupt_status();
        if intr_status == 0 {
            return;
        }

        {
            let mut guard = self.vq.exclusive_access();
            let vq = &mut *guard;
            loop {
                let used_idx =
                    unsafe { core::ptr::read_volatile(core::ptr::addr_of!(vq.used.idx)) };
                if used_idx == vq.last_used_idx {
                    break;
                }
                let pos = vq.last_used_idx as usize % DESC_COUNT;
                let elem = unsafe {
                    core::ptr::read_volatile(core::ptr::addr_of!(vq.used.ring[pos]))
                };

                let slot = elem.id as usize;
                let mut d = slot;
                loop {
                    vq.free[d] = true;
                    if vq.desc[d].flags & DESC_F_NEXT != 0 {
                        d = vq.desc[d].next as usize;
                    } else {
                        break;
                    }
                }
                vq.requests[slot] = ReqInfo {
                    in_use: false,
                    len: elem.len,
                    status: vq.status_bytes[slot],
                };
                vq.last_used_idx = vq.last_used_idx.wrapping_add(1);
            }
        }

        self.io_done.broadcast();
        self.regs.interrupt_ack(intr_status);
        fence();
    }
}

struct VioBlkIo {
    dev: &'static VioBlk,
}

impl IoEndpoint for VioBlkIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> SysResult<usize> {
        let used = self
            .dev
            .transfer(pos, buf.as_mut_ptr() as usize, buf.len(), false)?;
        // 设备回的长度把状态字节也算进去了
        Ok(used as usize - 1)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> SysResult<usize> {
        let len = buf.len();
        self.dev.transfer(pos, buf.as_ptr() as usize, len, true)?;
        Ok(len)
    }

    fn cntl(&self, cmd: usize, arg: &mut u64) -> SysResult<usize> {
        match cmd {
            IOCTL_GETBLKSZ => Ok(self.dev.blk_size as usize),
            IOCTL_GETEND => {
                *arg = self.dev.capacity * self.dev.blk_size as u64;
                Ok(0)
            }
            _ => Err(SysError(syserr::ENOTSUP)),
        }
    }
}

impl Drop for VioBlkIo {
    fn drop(&mut self) {
        disable_intr_source(self.dev.irqno);
        self.dev.regs.reset_virtq(0);
    }
}
