use thiserror::Error;

use crate::state::{StateField, StateValue};

/// Broad failure classes a document-level caller distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Memory,
    Io,
    Protocol,
    Capacity,
}

pub const VM_ERROR: i32 = -25;
pub const IO_ERROR: i32 = -12;
pub const LIMIT_CHECK: i32 = -13;
pub const RANGE_CHECK: i32 = -15;
pub const TYPE_CHECK: i32 = -20;
pub const FATAL: i32 = -100;

#[derive(Debug, Error)]
pub enum ClistError {
    #[error("out of memory while {context}")]
    VmError {
        context: &'static str,
        retryable: bool,
    },
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("instruction of {size} bytes exceeds command buffer capacity {capacity}")]
    InstructionTooLarge { size: usize, capacity: usize },
    #[error("band {band} out of range (page has {nbands} bands)")]
    BandOutOfRange { band: u32, nbands: u32 },
    #[error("invalid band range {min}..={max}")]
    InvalidRange { min: u32, max: u32 },
    #[error("tile of {bytes} bytes exceeds tile cache capacity {capacity}")]
    TileTooLarge { bytes: usize, capacity: usize },
    #[error("invalid tile: {0}")]
    InvalidTile(String),
    #[error("color {color:#x} exceeds {depth}-bit depth")]
    ColorOutOfRange { color: u64, depth: u8 },
    #[error("value {value:?} does not fit field {field:?}")]
    StateTypeMismatch { field: StateField, value: StateValue },
    #[error("opcode {0:#04x} is reserved")]
    ReservedOpcode(u8),
    #[error("no page in progress")]
    NoPage,
    #[error("a page is already in progress")]
    PageInProgress,
    #[error("recovery re-entered while already recovering")]
    RecoveryReentered,
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("page abandoned after earlier error: {message}")]
    Abandoned {
        class: ErrorClass,
        code: i32,
        message: String,
    },
}

impl ClistError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClistError::VmError { .. } => ErrorClass::Memory,
            ClistError::Io(_) => ErrorClass::Io,
            ClistError::TileTooLarge { .. } => ErrorClass::Capacity,
            ClistError::Abandoned { class, .. } => *class,
            _ => ErrorClass::Protocol,
        }
    }

    /// Negative status code reported to the caller.
    pub fn code(&self) -> i32 {
        match self {
            ClistError::VmError { .. } => VM_ERROR,
            ClistError::Io(_) => IO_ERROR,
            ClistError::InstructionTooLarge { .. } | ClistError::TileTooLarge { .. } => {
                LIMIT_CHECK
            }
            ClistError::BandOutOfRange { .. }
            | ClistError::InvalidRange { .. }
            | ClistError::ColorOutOfRange { .. }
            | ClistError::ReservedOpcode(_) => RANGE_CHECK,
            ClistError::StateTypeMismatch { .. } | ClistError::InvalidTile(_) => TYPE_CHECK,
            ClistError::Abandoned { code, .. } => *code,
            _ => FATAL,
        }
    }

    /// Out-of-memory conditions the recovery controller may act on.
    pub fn is_recoverable_vm(&self) -> bool {
        matches!(
            self,
            ClistError::VmError {
                retryable: true,
                ..
            }
        )
    }

    pub(crate) fn latched(&self) -> Self {
        match self {
            ClistError::Abandoned {
                class,
                code,
                message,
            } => ClistError::Abandoned {
                class: *class,
                code: *code,
                message: message.clone(),
            },
            other => ClistError::Abandoned {
                class: other.class(),
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

/// Non-negative outcomes. `RecoveredLowMemory` means the call succeeded only
/// after memory recovery; recording may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Status {
    #[default]
    Ok = 0,
    RecoveredLowMemory = 1,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn merge(self, other: Status) -> Status {
        self.max(other)
    }
}

/// Folds a result into the signed status convention: negative codes are
/// failures, 0 is success and 1 is success after a low-memory recovery.
pub fn status_code(result: &Result<Status, ClistError>) -> i32 {
    match result {
        Ok(status) => status.code(),
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_separate_memory_io_and_protocol() {
        let vm = ClistError::VmError {
            context: "flushing",
            retryable: true,
        };
        let io = ClistError::from(std::io::Error::other("disk gone"));
        let protocol = ClistError::InstructionTooLarge {
            size: 9000,
            capacity: 4096,
        };
        assert_eq!(vm.class(), ErrorClass::Memory);
        assert_eq!(io.class(), ErrorClass::Io);
        assert_eq!(protocol.class(), ErrorClass::Protocol);
        assert!(vm.is_recoverable_vm());
        assert!(!protocol.is_recoverable_vm());
        assert_eq!(vm.code(), VM_ERROR);
        assert_eq!(io.code(), IO_ERROR);
        assert_eq!(protocol.code(), LIMIT_CHECK);
    }

    #[test]
    fn latched_error_keeps_first_class_and_code() {
        let io = ClistError::from(std::io::Error::other("disk gone"));
        let latched = io.latched();
        assert_eq!(latched.class(), ErrorClass::Io);
        assert_eq!(latched.code(), IO_ERROR);
        assert!(latched.to_string().contains("disk gone"));
        assert_eq!(latched.latched().code(), IO_ERROR);
    }

    #[test]
    fn status_codes_fold_results() {
        assert_eq!(status_code(&Ok(Status::Ok)), 0);
        assert_eq!(status_code(&Ok(Status::RecoveredLowMemory)), 1);
        assert_eq!(status_code(&Err(ClistError::NoPage)), FATAL);
        assert_eq!(Status::Ok.merge(Status::RecoveredLowMemory), Status::RecoveredLowMemory);
    }
}
