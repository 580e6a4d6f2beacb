/// Errors returned to guest bytecode through the VM accumulator as a negative word.
///
/// These travel across the syscall boundary as plain integers (the VM has no concept of a
/// `Result`), so the discriminants are part of the kernel's stable ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum SysError {
    /// Resource temporarily unavailable (e.g. no free task slot)
    Again = 1,
    /// Cannot allocate memory
    NoMem = 2,
    /// Invalid argument
    Invalid = 3,
    /// No such process
    NoSuchProcess = 4,
    /// Operation not permitted
    NotPermitted = 5,
    /// Timed out
    Timeout = 6,
    /// Function not implemented
    NoSys = 7,
}

impl SysError {
    /// The value written into the accumulator on failure: the negated error code.
    pub fn as_word(self) -> i64 {
        -(self as i32 as i64)
    }
}

pub type SysResult<T> = Result<T, SysError>;
