/// Kernel result codes.
///
/// Every fallible operation returns one of these by value; the kernel hot
/// path never unwinds. The numbering follows the POSIX-like convention of
/// the original API so a C binding can pass the discriminant through
/// unchanged (`0` is reserved for "ok").
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Error {
    /// Operation requires thread context but was called from a handler,
    /// or the caller does not own the object.
    Perm = 1,
    /// Parameter out of range, invalid mask, or invalid object state.
    Inval = 2,
    /// Transient exhaustion: recursion limit, counter overflow.
    Again = 3,
    /// A `try_*` variant would have had to block.
    WouldBlock = 4,
    /// A bounded wait expired.
    TimedOut = 5,
    /// The wait was ended by a reset or by interrupting the thread.
    Interrupted = 6,
    /// Message size does not fit the queue's message size.
    MsgSize = 7,
    /// Error-checking mutex locked again by its owner.
    Deadlock = 8,
    /// Robust mutex acquired after its previous owner died holding it.
    /// The caller owns the mutex and must restore consistency.
    OwnerDead = 9,
    /// Robust mutex released without restoring consistency; the protected
    /// state can no longer be recovered.
    NotRecoverable = 10,
    /// Queue integrity check failed.
    BadMsg = 11,
    /// Out of memory.
    NoMem = 12,
}

impl Error {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::Perm => "operation not permitted",
            Error::Inval => "invalid argument",
            Error::Again => "resource temporarily exhausted",
            Error::WouldBlock => "operation would block",
            Error::TimedOut => "timed out",
            Error::Interrupted => "interrupted",
            Error::MsgSize => "bad message size",
            Error::Deadlock => "deadlock detected",
            Error::OwnerDead => "previous owner died",
            Error::NotRecoverable => "state not recoverable",
            Error::BadMsg => "corrupted message",
            Error::NoMem => "out of memory",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
