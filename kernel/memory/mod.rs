pub mod address;
pub mod frame;
pub mod heap;
pub mod kernel_view;
pub mod mspace;
pub mod page_table;

use logger::info;

/// 启动顺序: 先喂堆, 再建空闲页池, 然后造主页表开分页
pub fn init() {
    info!("Memory initializing");
    heap::init_heap();
    frame::init_frame_allocator();
    mspace::init_kernel_space();
    heap::heap_test();
}
