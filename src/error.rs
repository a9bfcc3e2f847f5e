use std::io;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    #[error("{0}")]
    IOError(#[from] io::Error),

    #[error("unable to acquire lock after timeout for key {key} and requestor {owner}")]
    Timeout { key: String, owner: String },

    #[error(
        "could not acquire lock on {key} on behalf of transaction {requester}, \
         waiting to complete tx: {blocker}"
    )]
    PendingLockTimeout {
        key: String,
        requester: String,
        blocker: String,
    },

    #[error("deadlock detected on key {key} for requestor {owner}")]
    Deadlock { key: String, owner: String },

    #[error("lock on key {key} already released by requestor {owner}")]
    AlreadyReleased { key: String, owner: String },

    #[error("illegal lock state: {0}")]
    IllegalState(String),
}

impl LockError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LockError::Timeout { .. } | LockError::PendingLockTimeout { .. }
        )
    }
}

impl PartialEq for LockError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::IOError(_), Self::IOError(_)) => true,
            (Self::Timeout { key: k1, owner: o1 }, Self::Timeout { key: k2, owner: o2 })
            | (Self::Deadlock { key: k1, owner: o1 }, Self::Deadlock { key: k2, owner: o2 })
            | (
                Self::AlreadyReleased { key: k1, owner: o1 },
                Self::AlreadyReleased { key: k2, owner: o2 },
            ) => k1 == k2 && o1 == o2,
            (
                Self::PendingLockTimeout {
                    key: k1,
                    requester: r1,
                    blocker: b1,
                },
                Self::PendingLockTimeout {
                    key: k2,
                    requester: r2,
                    blocker: b2,
                },
            ) => k1 == k2 && r1 == r2 && b1 == b2,
            (Self::IllegalState(s1), Self::IllegalState(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}
