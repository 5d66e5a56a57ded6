#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("No sector buffer available")]
    NoBufferAvailable,
    #[error("No handle available")]
    NoHandleAvailable,
    #[error("Lock unavailable")]
    Lock,
    #[error("Invalid configuration")]
    InvalidConfig,
    #[error("Device: {0}")]
    Dev(#[from] DevError),
    #[error("Entry: {0}")]
    Entry(#[from] EntryError),
    #[error("Name: {0}")]
    Name(#[from] NameError),
    #[error("Volume: {0}")]
    Vol(#[from] VolError),
    #[error("Journal: {0}")]
    Journal(#[from] JournalError),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    #[error("I/O failure")]
    Io,
    #[error("Timeout")]
    Timeout,
    #[error("Not present")]
    NotPresent,
    #[error("Not open")]
    NotOpen,
    #[error("Media changed")]
    Changed,
    #[error("Full")]
    Full,
    #[error("Invalid sector range")]
    InvalidSector,
    #[error("Invalid configuration")]
    InvalidConfig,
    #[error("Invalid unit number")]
    InvalidUnit,
    #[error("Invalid name")]
    InvalidName,
    #[error("Write protected")]
    WriteProtected,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryError {
    #[error("Not found")]
    NotFound,
    #[error("Parent not found")]
    ParentNotFound,
    #[error("Exists")]
    Exists,
    #[error("Not a file")]
    NotFile,
    #[error("Not a directory")]
    NotDir,
    #[error("Not empty")]
    NotEmpty,
    #[error("Read-only")]
    ReadOnly,
    #[error("Entry types differ")]
    TypeDiff,
    #[error("Volumes differ")]
    VolsDiff,
    #[error("Corrupt")]
    Corrupt,
    #[error("Root directory")]
    RootDir,
    #[error("Entry open")]
    Open,
    #[error("Directory full")]
    DirFull,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    #[error("Invalid")]
    Invalid,
    #[error("Path too long")]
    TooLong,
    #[error("Base name too long")]
    BaseTooLong,
    #[error("Buffer too short")]
    BufferShort,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolError {
    #[error("Not open")]
    NotOpen,
    #[error("Not mounted")]
    NotMounted,
    #[error("No supported file system on volume")]
    InvalidSys,
    #[error("Invalid label")]
    LabelInvalid,
    #[error("Files open")]
    FilesOpen,
    #[error("Directories open")]
    DirsOpen,
    #[error("Invalid operation")]
    InvalidOp,
    #[error("Invalid partition")]
    PartitionInvalid,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalError {
    #[error("Configuration changed")]
    CfgChanged,
    #[error("Full")]
    Full,
    #[error("Journal file invalid")]
    FileInvalid,
    #[error("Already open")]
    AlreadyOpen,
    #[error("Not started")]
    NotStarted,
    #[error("Replay failed")]
    Replay,
}

pub type Result<T> = core::result::Result<T, Error>;
