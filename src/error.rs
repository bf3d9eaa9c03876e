use std::io;

use nix;

use wire::DecodeError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "Failed to connect to the collector socket: {}", inner)]
    Connect { inner: io::Error },
    #[fail(display = "Collector handshake failed: {}", reason)]
    Handshake { reason: String },
    #[fail(display = "Socket io with the collector failed: {}", inner)]
    Io { inner: io::Error },
    #[fail(display = "Malformed record from the collector: {}", inner)]
    Decode { inner: DecodeError },
    #[fail(display = "Failed to spawn a private collector: {}", inner)]
    Spawn { inner: nix::Error },
    #[fail(
        display = "Session belongs to pid {} but the current pid is {}",
        captured,
        current
    )]
    StalePid { captured: i32, current: i32 },
}

impl From<io::Error> for Error {
    fn from(inner: io::Error) -> Self {
        Error::Io { inner }
    }
}

impl From<DecodeError> for Error {
    fn from(inner: DecodeError) -> Self {
        Error::Decode { inner }
    }
}

impl From<nix::Error> for Error {
    fn from(inner: nix::Error) -> Self {
        Error::Spawn { inner }
    }
}
