use thiserror::Error;

/// Closed error taxonomy shared by the syscall surface and the wire protocol.
///
/// Every variant has a stable negative code: syscalls return it in the
/// resume-value register and the migration protocol carries it in reply
/// frames, so the two sides agree on meaning without any translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Errno {
    /// Unknown environment id, or the caller lacks rights over it.
    #[error("bad environment")]
    BadEnv,
    /// Malformed argument: unaligned address, out-of-range va, bad perm bits.
    #[error("invalid argument")]
    Inval,
    /// Page allocation failed.
    #[error("out of memory")]
    NoMem,
    /// Environment table is full.
    #[error("no free environment")]
    NoFreeEnv,
    /// IPC target is not blocked in receive.
    #[error("receiver not waiting")]
    IpcNotRecv,

    // Protocol-level codes, surfaced in wire replies.
    /// Request malformed or names an environment in the wrong state.
    #[error("malformed request")]
    BadReq,
    /// Remote lease table is full.
    #[error("no lease available")]
    NoLease,
    /// Transport-level or retryable failure.
    #[error("request failed")]
    Fail,
    /// Remote receiver not in receive state.
    #[error("remote receiver not waiting")]
    NoIpc,
}

impl Errno {
    /// The negative integer carried on the wire and in resume registers.
    pub fn code(self) -> i32 {
        match self {
            Errno::BadEnv => -2,
            Errno::Inval => -3,
            Errno::NoMem => -4,
            Errno::NoFreeEnv => -5,
            Errno::IpcNotRecv => -6,
            Errno::BadReq => -200,
            Errno::NoLease => -201,
            Errno::Fail => -202,
            Errno::NoIpc => -203,
        }
    }

    pub fn from_code(code: i32) -> Option<Errno> {
        Some(match code {
            -2 => Errno::BadEnv,
            -3 => Errno::Inval,
            -4 => Errno::NoMem,
            -5 => Errno::NoFreeEnv,
            -6 => Errno::IpcNotRecv,
            -200 => Errno::BadReq,
            -201 => Errno::NoLease,
            -202 => Errno::Fail,
            -203 => Errno::NoIpc,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for e in [
            Errno::BadEnv,
            Errno::Inval,
            Errno::NoMem,
            Errno::NoFreeEnv,
            Errno::IpcNotRecv,
            Errno::BadReq,
            Errno::NoLease,
            Errno::Fail,
            Errno::NoIpc,
        ] {
            assert!(e.code() < 0);
            assert_eq!(Errno::from_code(e.code()), Some(e));
        }
        assert_eq!(Errno::from_code(0), None);
        assert_eq!(Errno::from_code(-1), None);
    }
}
