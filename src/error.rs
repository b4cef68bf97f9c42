use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("There was an error when trying to open the serial port: {0}")]
    SerialOpenError(#[from] serialport::Error),

    /// An I/O error occurred on the serial link
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
