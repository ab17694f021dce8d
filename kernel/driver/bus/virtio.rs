//! VirtIO MMIO 总线: 寄存器布局, 特性协商, 虚队列挂接
//!
//! 具体设备驱动 (vioblk 等) 在 virtio_attach 里按 device_id 分发

use logger::{debug, info, warn};

use crate::driver::block::virtio_blk;

pub const VIRTIO_MAGIC: u32 = 0x7472_6976; // "virt"

// 设备状态位
pub const STAT_ACKNOWLEDGE: u32 = 1 << 0;
pub const STAT_DRIVER: u32 = 1 << 1;
pub const STAT_DRIVER_OK: u32 = 1 << 2;
pub const STAT_FEATURES_OK: u32 = 1 << 3;
pub const STAT_FAILED: u32 = 1 << 7;

// 特性位号 (不是掩码)
pub const F_ANY_LAYOUT: u16 = 27;
pub const F_INDIRECT_DESC: u16 = 28;
pub const F_EVENT_IDX: u16 = 29;
pub const F_RING_RESET: u16 = 40;

// 描述符 flags
pub const DESC_F_NEXT: u16 = 1 << 0;
pub const DESC_F_WRITE: u16 = 1 << 1;
pub const DESC_F_INDIRECT: u16 = 1 << 2;

// 设备 id
pub const ID_NET: u32 = 1;
pub const ID_BLOCK: u32 = 2;
pub const ID_CONSOLE: u32 = 3;
pub const ID_RNG: u32 = 4;

// MMIO 寄存器偏移
const REG_MAGIC: usize = 0x000;
const REG_VERSION: usize = 0x004;
const REG_DEVICE_ID: usize = 0x008;
const REG_DEVICE_FEATURES: usize = 0x010;
const REG_DEVICE_FEATURES_SEL: usize = 0x014;
const REG_DRIVER_FEATURES: usize = 0x020;
const REG_DRIVER_FEATURES_SEL: usize = 0x024;
const REG_QUEUE_SEL: usize = 0x030;
const REG_QUEUE_NUM_MAX: usize = 0x034;
const REG_QUEUE_NUM: usize = 0x038;
const REG_QUEUE_READY: usize = 0x044;
const REG_QUEUE_NOTIFY: usize = 0x050;
const REG_INTERRUPT_STATUS: usize = 0x060;
const REG_INTERRUPT_ACK: usize = 0x064;
const REG_STATUS: usize = 0x070;
const REG_QUEUE_DESC: usize = 0x080;
const REG_QUEUE_DRIVER: usize = 0x090;
const REG_QUEUE_DEVICE: usize = 0x0A0;
const REG_QUEUE_RESET: usize = 0x0C0;
const REG_CONFIG: usize = 0x100;

/// 一个 MMIO 槽位上的设备寄存器窗口
#[derive(Clone, Copy)]
pub struct VirtioMmio {
    base: usize,
}

impl VirtioMmio {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn read(&self, off: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.base + off) as *const u32) }
    }

    fn write(&self, off: usize, val: u32) {
        unsafe { core::ptr::write_volatile((self.base + off) as *mut u32, val) }
    }

    fn write64(&self, off: usize, val: u64) {
        self.write(off, val as u32);
        self.write(off + 4, (val >> 32) as u32);
    }

    pub fn magic(&self) -> u32 {
        self.read(REG_MAGIC)
    }

    pub fn version(&self) -> u32 {
        self.read(REG_VERSION)
    }

    pub fn device_id(&self) -> u32 {
        self.read(REG_DEVICE_ID)
    }

    pub fn set_status(&self, bits: u32) {
        self.write(REG_STATUS, self.read(REG_STATUS) | bits);
    }

    pub fn status(&self) -> u32 {
        self.read(REG_STATUS)
    }

    pub fn queue_num_max(&self) -> u32 {
        self.read(REG_QUEUE_NUM_MAX)
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read(REG_INTERRUPT_STATUS)
    }

    pub fn interrupt_ack(&self, bits: u32) {
        self.write(REG_INTERRUPT_ACK, bits);
    }

    pub fn queue_notify(&self, qid: u32) {
        fence();
        self.write(REG_QUEUE_NOTIFY, qid);
    }

    /// 读设备配置空间里的一个字段
    pub fn config_read32(&self, off: usize) -> u32 {
        self.read(REG_CONFIG + off)
    }

    pub fn config_read64(&self, off: usize) -> u64 {
        let lo = self.config_read32(off) as u64;
        let hi = self.config_read32(off + 4) as u64;
        hi << 32 | lo
    }

    /// 把三块队列内存的物理地址交给设备并置 ready
    pub fn attach_virtq(&self, qid: u32, len: u32, desc: u64, avail: u64, used: u64) {
        self.write(REG_QUEUE_SEL, qid);
        fence();
        self.write(REG_QUEUE_NUM, len);
        self.write64(REG_QUEUE_DESC, desc);
        self.write64(REG_QUEUE_DRIVER, avail);
        self.write64(REG_QUEUE_DEVICE, used);
        fence();
        self.write(REG_QUEUE_READY, 1);
    }

    pub fn reset_virtq(&self, qid: u32) {
        self.write(REG_QUEUE_SEL, qid);
        fence();
        self.write(REG_QUEUE_RESET, 1);
    }
}

pub fn fence() {
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// 128 位特性集, 与 MMIO 的 features_sel 分组对应
#[derive(Clone, Copy, Default)]
pub struct FeatureSet([u32; 4]);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, bit: u16) {
        self.0[bit as usize / 32] |= 1 << (bit % 32);
    }

    pub fn test(&self, bit: u16) -> bool {
        self.0[bit as usize / 32] >> (bit % 32) & 1 != 0
    }
}

/// 特性协商: wanted 尽力而为, needed 缺一不可
/// 成功返回真正启用的特性集
pub fn negotiate_features(
    regs: &VirtioMmio,
    wanted: FeatureSet,
    needed: FeatureSet,
) -> Result<FeatureSet, ()> {
    let mut enabled = FeatureSet::new();
    for word in 0..4u32 {
        regs.write(REG_DEVICE_FEATURES_SEL, word);
        fence();
        let have = regs.read(REG_DEVICE_FEATURES);
        let want = wanted.0[word as usize] | needed.0[word as usize];
        let got = have & want;
        if got & needed.0[word as usize] != needed.0[word as usize] {
            return Err(());
        }
        enabled.0[word as usize] = got;
        regs.write(REG_DRIVER_FEATURES_SEL, word);
        fence();
        regs.write(REG_DRIVER_FEATURES, got);
    }
    regs.set_status(STAT_FEATURES_OK);
    fence();
    if regs.status() & STAT_FEATURES_OK == 0 {
        return Err(());
    }
    Ok(enabled)
}

/// 探一个 MMIO 槽位, 按设备 id 分发给对应驱动
pub fn virtio_attach(base: usize, irqno: usize) {
    let regs = VirtioMmio::new(base);
    if regs.magic() != VIRTIO_MAGIC || regs.version() == 0 {
        debug!("virtio slot {:#x}: bad magic/version, skipped", base);
        return;
    }
    match regs.device_id() {
        0 => {
            // 空槽位
        }
        ID_BLOCK => virtio_blk::attach(regs, irqno),
        ID_RNG => {
            // 随机数设备暂不支持
            info!("virtio slot {:#x}: viorng present, not attached", base);
        }
        id => {
            warn!("virtio slot {:#x}: unsupported device id {}", base, id);
        }
    }
}

// 虚队列共享内存结构, 布局必须与设备约定一致

#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

#[repr(C, align(2))]
pub struct VirtqAvail<const N: usize> {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; N],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct VirtqUsedElem {
    pub id: u32,
    pub len: u32,
}

#[repr(C, align(4))]
pub struct VirtqUsed<const N: usize> {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; N],
}
