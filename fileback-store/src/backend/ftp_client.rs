//! [`FtpTransport`] for the `suppaftp` blocking client.

use std::io::{self, Read, Write};

use anyhow::Context;
use ::suppaftp::types::FileType;
use ::suppaftp::{FtpError, FtpResult, FtpStream, Status};
use tracing::{debug, info};

use fileback_common::RemoteEntry;

use super::ftp::FtpTransport;

/// Open a control connection ready for the back-end: logged in and in
/// binary mode.
pub fn connect(host: &str, port: u16, user: &str, password: &str) -> anyhow::Result<FtpStream> {
    let mut stream = FtpStream::connect((host, port))
        .with_context(|| format!("Failed to connect to {host}:{port}"))?;
    stream
        .login(user, password)
        .with_context(|| format!("Login as {user} on {host} failed"))?;
    stream
        .transfer_type(FileType::Binary)
        .context("Failed to switch to binary mode")?;
    info!(host = %host, port, user = %user, "Connected to FTP server");
    Ok(stream)
}

/// Split negative replies (`Ok(None)`) from transport failures.
fn reply<T>(command: &str, result: FtpResult<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(FtpError::UnexpectedResponse(response)) => {
            debug!(command, ?response, "Negative reply");
            Ok(None)
        }
        Err(FtpError::ConnectionError(e)) => Err(e),
        Err(e) => Err(io::Error::other(e)),
    }
}

impl FtpTransport for FtpStream {
    type Reader = Box<dyn Read>;
    type Writer = Box<dyn Write>;

    fn change_dir(&mut self, path: &str) -> io::Result<bool> {
        Ok(reply("CWD", self.cwd(path))?.is_some())
    }

    fn make_dir(&mut self, path: &str) -> io::Result<bool> {
        Ok(reply("MKD", self.mkdir(path))?.is_some())
    }

    fn entry(&mut self, path: &str) -> io::Result<Option<RemoteEntry>> {
        let listing = match self.mlst(Some(path)) {
            Ok(listing) => listing,
            Err(FtpError::UnexpectedResponse(response))
                if matches!(response.status, Status::FileUnavailable) =>
            {
                debug!(path = %path, "MLST: no such object");
                return Ok(None);
            }
            // 500 and 502 only mean the server cannot answer.
            Err(FtpError::UnexpectedResponse(response)) => {
                return Err(io::Error::other(format!(
                    "MLST {path} refused with {:?}",
                    response.status
                )));
            }
            Err(FtpError::ConnectionError(e)) => return Err(e),
            Err(e) => return Err(io::Error::other(e)),
        };
        RemoteEntry::from_mlst(&listing).map(Some).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Unreadable MLST reply: {listing}"))
        })
    }

    fn remove(&mut self, path: &str) -> io::Result<bool> {
        Ok(reply("DELE", self.rm(path))?.is_some())
    }

    fn retrieve(&mut self, path: &str) -> io::Result<Self::Reader> {
        match reply("RETR", self.retr_as_stream(path))? {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(io::ErrorKind::NotFound, format!("RETR {path} refused"))),
        }
    }

    fn finish_retrieve(&mut self, reader: Self::Reader) -> io::Result<bool> {
        Ok(reply("RETR", self.finalize_retr_stream(reader))?.is_some())
    }

    fn store(&mut self, path: &str) -> io::Result<Self::Writer> {
        match reply("STOR", self.put_with_stream(path))? {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("STOR {path} refused"),
            )),
        }
    }

    fn finish_store(&mut self, writer: Self::Writer) -> io::Result<bool> {
        Ok(reply("STOR", self.finalize_put_stream(writer))?.is_some())
    }
}
