use core::cell::{RefCell, RefMut};
use core::ops::{Deref, DerefMut};

use riscv::register::sstatus;

pub struct UPSafeCell<T> {
    /// inner data
    inner: RefCell<T>,
}

// 目前我们内核仅运行在单核上，因此无需在意任何多核引发的数据竞争/同步问题
// 因此我们向编译器保证 UPSafeCell 是 sync 的
unsafe impl<T> Sync for UPSafeCell<T> {}

impl<T> UPSafeCell<T> {
    /// 用户需要负责该变量只能在单线程内使用
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    /// 以可变借用形式访问
    /// 由于是 borrow_mut 所以相比原生的 RefCell 它不再允许多个读操作同时存在
    pub fn exclusive_access(&self) -> RefMut<'_, T> {
        self.inner.borrow_mut()
    }
}

// 中断屏蔽嵌套计数, 单核所以一份全局即可
struct IntrMasking {
    nested: usize,
    sie_before: bool,
}

static mut INTR_MASKING: IntrMasking = IntrMasking {
    nested: 0,
    sie_before: false,
};

fn push_off() {
    let sie = sstatus::read().sie();
    unsafe {
        sstatus::clear_sie();
        let masking = &mut *core::ptr::addr_of_mut!(INTR_MASKING);
        if masking.nested == 0 {
            masking.sie_before = sie;
        }
        masking.nested += 1;
    }
}

fn pop_off() {
    unsafe {
        let masking = &mut *core::ptr::addr_of_mut!(INTR_MASKING);
        masking.nested -= 1;
        if masking.nested == 0 && masking.sie_before {
            sstatus::set_sie();
        }
    }
}

/// 线程与 ISR 共享的数据用这个 cell: 访问期间屏蔽中断,
/// 否则 ISR 里的 borrow_mut 会与被打断线程的借用撞上
pub struct UPIntrFreeCell<T> {
    inner: RefCell<T>,
}

unsafe impl<T> Sync for UPIntrFreeCell<T> {}

pub struct UPIntrRefMut<'a, T>(Option<RefMut<'a, T>>);

impl<T> UPIntrFreeCell<T> {
    pub unsafe fn new(value: T) -> Self {
        Self {
            inner: RefCell::new(value),
        }
    }

    pub fn exclusive_access(&self) -> UPIntrRefMut<'_, T> {
        push_off();
        UPIntrRefMut(Some(self.inner.borrow_mut()))
    }

    pub fn exclusive_session<F, V>(&self, f: F) -> V
    where
        F: FnOnce(&mut T) -> V,
    {
        let mut guard = self.exclusive_access();
        f(guard.deref_mut())
    }
}

impl<'a, T> Drop for UPIntrRefMut<'a, T> {
    fn drop(&mut self) {
        // 先放借用, 再恢复中断
        self.0.take();
        pop_off();
    }
}

impl<'a, T> Deref for UPIntrRefMut<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref().unwrap().deref()
    }
}

impl<'a, T> DerefMut for UPIntrRefMut<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.as_mut().unwrap().deref_mut()
    }
}

/// 新线程第一次运行前把嵌套计数清零, 见 task 模块的启动跳板
pub(crate) fn reset_intr_masking() {
    unsafe {
        let masking = &mut *core::ptr::addr_of_mut!(INTR_MASKING);
        masking.nested = 0;
        masking.sie_before = false;
    }
}
