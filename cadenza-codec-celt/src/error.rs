use cadenza_core::errors::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid frame size")]
    InvalidFrameSize,

    #[error("Invalid channel count")]
    InvalidChannelCount,

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Resource invariant violated")]
    ResourceInvariantViolated,
}

impl From<Error> for CoreError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidFrameSize => CoreError::Unsupported("celt: invalid frame size"),
            Error::InvalidChannelCount => CoreError::Unsupported("celt: invalid channel count"),
            Error::MalformedPayload => CoreError::DecodeError("celt: malformed payload"),
            Error::ResourceInvariantViolated => {
                CoreError::DecodeError("celt: resource invariant violated")
            }
        }
    }
}
