//! Driver error type and its mapping onto kernel-style errno values.

use nix::errno::Errno;
use thiserror::Error;

/// Everything that can go wrong while talking to the controller
#[derive(Error, Debug)]
pub enum Error {
    /// A bounded wait expired before the hardware reported what we waited for
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The controller or the flash reported a failed operation
    #[error("I/O error: {0}")]
    Io(String),

    /// ECC could not correct the page and it does not look erased either
    #[error("uncorrectable ECC error on page {0}")]
    Uncorrectable(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested ECC step size or strength is not offered by the BCH engine
    #[error("unsupported ECC configuration: {0}")]
    UnsupportedEcc(String),

    #[error("spare area too small: {required} bytes of ECC do not fit in {available} bytes")]
    SpareTooSmall { required: u32, available: u32 },

    #[error("no NAND device found")]
    NoDevice,

    #[error("DMA mapping failed: {0}")]
    Dma(String),

    #[error(transparent)]
    Descriptor(#[from] deku::DekuError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The errno an in-kernel caller would have seen for this error
    pub fn errno(&self) -> Errno {
        match self {
            Error::Timeout(_) => Errno::ETIMEDOUT,
            Error::Io(_)
            | Error::Uncorrectable(_)
            | Error::SpareTooSmall { .. }
            | Error::Descriptor(_) => Errno::EIO,
            Error::InvalidArgument(_) | Error::UnsupportedEcc(_) => Errno::EINVAL,
            Error::NoDevice => Errno::ENODEV,
            Error::Dma(_) => Errno::ENOMEM,
        }
    }

    /// Negative status code, as returned by the NAND core callbacks
    pub fn status(&self) -> i32 {
        -(self.errno() as i32)
    }

    pub(crate) fn io(msg: impl Into<String>) -> Self {
        Error::Io(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

impl From<Error> for Errno {
    fn from(value: Error) -> Self {
        value.errno()
    }
}

#[test]
fn test_errno_mapping() {
    assert_eq!(Error::Timeout("thread").errno(), Errno::ETIMEDOUT);
    assert_eq!(Error::Uncorrectable(7).errno(), Errno::EIO);
    assert_eq!(Error::invalid("geometry").errno(), Errno::EINVAL);
    assert_eq!(Error::NoDevice.status(), -(Errno::ENODEV as i32));
    assert_eq!(Errno::from(Error::io("x")), Errno::EIO);
}
