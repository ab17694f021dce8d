use alloc::string::ToString;
use alloc::vec;

use logger::{debug, info};
use qemu_config::{
    uart_base, virtio_base, RTC_BASE, UART0_IRQ, VIRTIO0_IRQ, VIRTIO_COUNT,
};

use crate::memory::kernel_view::get_kernel_view;
use crate::{driver, fs, intr, memory, process, task, timer, trap};

/// 启动流程: 内存 -> 陷入 -> 中断 -> 时钟 -> 线程 -> 进程 -> 设备 ->
/// 挂文件系统 -> 执行首个用户程序
pub fn kernel_start() -> bool {
    print_banner();
    clear_bss();

    memory::init();
    trap::init();
    intr::init();
    timer::init();
    task::api::init();
    process::init();

    // 调度器就位, 可以开全局中断了; 挂载文件系统要靠 vioblk 的 ISR
    intr::enable_interrupts();

    for i in 0..3 {
        driver::chardev::ns16550a::attach(uart_base(i), UART0_IRQ + i);
    }
    driver::rtc::attach(RTC_BASE);
    for i in 0..VIRTIO_COUNT {
        driver::bus::virtio::virtio_attach(virtio_base(i), VIRTIO0_IRQ + i);
    }

    let blkio = driver::open_device("vioblk", 0).expect("failed to open vioblk0");
    fs::fsmount(blkio).expect("failed to mount ktfs");

    // 原始约定: uart1 挂在首个进程的 2 号槽上当输出口
    let uart = driver::open_device("uart", 1).expect("failed to open uart1");
    process::current_process()
        .unwrap()
        .with_iotab(|t| t.set(2, uart));

    let exeio = fs::fsopen("trekfib").expect("failed to open 'trekfib'");
    info!("running first user program 'trekfib'");
    if let Err(e) = process::process_exec(exeio, vec!["trekfib".to_string()]) {
        panic!("exec 'trekfib' failed: {:?}", e);
    }
    unreachable!()
}

fn clear_bss() {
    let kernel_view = get_kernel_view();
    let bss = kernel_view.bss_range();
    debug!(
        "bss_range: [{:#x}..{:#x}), BSS size: {}",
        bss.start,
        bss.end,
        bss.len()
    );

    // 将 bss 清零
    unsafe {
        core::ptr::write_bytes(bss.start as *mut u8, 0, bss.len());
    }
}

fn print_banner() {
    crate::println!("{}", include_str!("banner"));
    info!("KiteOS: A RISC-V64 Operating System Written In Rust");
    let kernel_view = get_kernel_view();
    let kernel_range = kernel_view.kernel_range();
    // 这里还没有堆, 只能打印裸数字
    debug!(
        "kernel_range: [{:#x}..{:#x}), kernel size: {} bytes",
        kernel_range.start,
        kernel_range.end,
        kernel_range.len()
    );
}
