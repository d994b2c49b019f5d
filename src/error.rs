use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    /// No such virtual path.
    NotFound,
    /// rmdir on a non-empty directory.
    NotEmpty,
    /// Destination already occupied (create / rename with NoReplace).
    Exists,
    /// More drives failed than parity levels can reconstruct.
    TooManyFailures,
    /// The parity position allocator cannot satisfy the request.
    NamespaceExhausted,
    /// Malformed arguments or configuration.
    Invalid(String),
    OutOfMemory,
    Io(std::io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not found"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::Exists => write!(f, "already exists"),
            Self::TooManyFailures => write!(f, "too many failed drives for parity decode"),
            Self::NamespaceExhausted => write!(f, "parity position namespace exhausted"),
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl Error {
    /// errno-style code for the FUSE reply path.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Exists => libc::EEXIST,
            Self::TooManyFailures => libc::EIO,
            Self::NamespaceExhausted => libc::ENOSPC,
            Self::Invalid(_) => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<Error> for libc::c_int {
    fn from(value: Error) -> Self {
        value.errno()
    }
}

impl From<&Error> for libc::c_int {
    fn from(value: &Error) -> Self {
        value.errno()
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(Error::NamespaceExhausted.errno(), libc::ENOSPC);
        let io = Error::from(std::io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(io.errno(), libc::EIO);
    }
}
