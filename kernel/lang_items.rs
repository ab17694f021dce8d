use core::panic::PanicInfo;

use crate::see::halt_failure;
use logger::error;

#[panic_handler]
fn kernel_panic(info: &PanicInfo) -> ! {
    // 如果有位置信息
    if let Some(location) = info.location() {
        error!(
            "Kernel panic at {}:{} Detail:\n{}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        error!("Kernel panic: {}", info.message());
    }
    halt_failure()
}
