use sys_interface::syserr;

/// 负的错误码, 见 sys_interface::syserr
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SysError(pub isize);

pub type SysResult<T> = Result<T, SysError>;

impl SysError {
    pub fn code(self) -> isize {
        self.0
    }

    pub fn msg(self) -> &'static str {
        syserr::msg(self.0)
    }
}

impl core::fmt::Debug for SysError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SysError({}: {})", self.0, self.msg())
    }
}

/// 把结果折叠成系统调用的 a0 返回值
pub fn flatten(res: SysResult<usize>) -> isize {
    match res {
        Ok(v) => v as isize,
        Err(e) => e.code(),
    }
}
