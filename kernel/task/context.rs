use super::switch::{__thread_exit_shim, __thread_startup};

// 按照 C 方式解释，编译器不得重排它们
// thread.S 里的 __switch 按这个布局存取
#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct ThreadContext {
    // 返回地址，__switch 最后一句代码需要用到它
    ra: usize,
    /// 内核栈指针
    sp: usize,
    // 被调用者保存的 12 个 s 寄存器
    s: [usize; 12],
}

impl ThreadContext {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }

    /// 新线程的初始上下文: 第一次被切换到时从 __thread_startup 开始,
    /// 跳板把 s0..s7 装进 a0..a7, 调用 s8 里的入口, 入口返回后走 s9 退出
    pub fn goto_startup(sp: usize, entry: usize, args: &[usize]) -> Self {
        assert!(args.len() <= 8);
        let mut ctx = Self {
            ra: __thread_startup as usize,
            sp,
            s: [0; 12],
        };
        ctx.s[..args.len()].copy_from_slice(args);
        ctx.s[8] = entry;
        ctx.s[9] = __thread_exit_shim as usize;
        ctx
    }
}
