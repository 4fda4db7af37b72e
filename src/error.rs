use thiserror::Error;

/// Failures reported by the storage collaborators (backing files and the
/// swap device). These are always fatal to the faulting process: once a
/// load has failed, the memory the process expects no longer exists
/// anywhere.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum IoError {
    #[error("The backing store returned fewer bytes than requested")]
    UnexpectedEof,

    #[error("The backing store rejected the requested offset or length")]
    OutOfBounds,

    #[error("The device reported a transfer failure")]
    Device,
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum VmError {
    #[error("Cannot allocate a physical frame")]
    NoMemory,

    #[error("No free swap slots")]
    SwapExhausted,

    #[error("Backing store I/O failed: {0}")]
    Io(#[from] IoError),

    #[error("The address is already tracked by the page table")]
    AlreadyTracked,

    #[error("The address is not tracked by the page table")]
    NotTracked,

    #[error("The page is not resident")]
    NotResident,

    #[error("The access is not permitted")]
    AccessViolation,

    #[error("The requested range overlaps an existing mapping or segment")]
    MappingOverlap,

    #[error("Cannot map a zero-length file")]
    EmptyFile,

    #[error("No mapping with the given id")]
    BadMappingId,

    #[error("Invalid value")]
    InvalidValue,
}

pub type Result<T> = core::result::Result<T, VmError>;
