use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StakingErrorKind {
    AlreadyExists,
    NotFound,
    BadSignature,
    BadParameter,
    BelowMinimum,
    InsufficientBalance,
    WrongStatus,
    Replay,
    TooEarly,
    Unresolvable,
    Internal,
}

#[derive(Clone, Debug)]
pub struct StakingError {
    pub kind: StakingErrorKind,
    pub message: String,
}

impl StakingError {
    pub fn new(kind: StakingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StakingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StakingError {}
