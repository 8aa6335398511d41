use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("sector address {addr} out of range (0..{total})")]
    DiskAddrInvalid { addr: u64, total: u64 },

    #[error("failed to create drive backing file at {path}")]
    #[diagnostic(help("check the directory is writable and has free space"))]
    DriveFileCreate {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory-map drive backing file at {path}")]
    DriveMmap {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid drive geometry: {message}")]
    #[diagnostic(help("cylinders, sectors/cylinder and bytes/sector must be powers of two and fit in u64"))]
    DriveInvalidArgs { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, Diagnostic)]
pub enum TransportError {
    #[error("failed to create socket")]
    SocketCreate(#[source] std::io::Error),

    #[error("failed to connect to {addr}")]
    SocketConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send frame")]
    SocketSend(#[source] std::io::Error),

    #[error("failed to receive frame")]
    SocketRecv(#[source] std::io::Error),

    #[error("connection closed by remote peer")]
    SocketClosedByRemote,

    #[error("connection terminated locally")]
    SocketTerminated,
}

#[derive(Debug, Error, Diagnostic)]
pub enum FsError {
    #[error("handle is busy: {addr} has {count} live reference(s)")]
    BusyHandle { addr: u64, count: u32 },

    #[error("capacity exceeded")]
    #[diagnostic(help("folder is at its 16-child capacity, or the allocator has no free space left"))]
    CapacityExceeded,

    #[error("'{name}' does not exist")]
    NameNotExist { name: String },

    #[error("'{name}' already exists")]
    NameAlreadyExist { name: String },

    #[error("name '{name}' is too long (must be < 64 bytes including NUL)")]
    NameTooLong { name: String },

    #[error("name '{name}' is invalid")]
    #[diagnostic(help("names must be non-empty, not '.' or '..', and contain no '/'"))]
    NameInvalid { name: String },

    #[error("access denied")]
    AccessDenied,

    #[error("folder '{name}' is not empty")]
    #[diagnostic(help("pass recursive removal explicitly to remove a non-empty folder"))]
    NotEmpty { name: String },

    #[error("file system is not formatted")]
    NotFormatted,
}

#[derive(Debug, Error, Diagnostic)]
pub enum VdfsError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Fs(#[from] FsError),

    #[error("wire protocol error")]
    Protocol(#[from] wire::ProtoError),

    #[error("io error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, VdfsError>;
