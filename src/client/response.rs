//! Response reception
//!
//! A reply body is first spooled to an anonymous temporary file and only
//! then interpreted: the first line is the envelope status, the rest is
//! either the textual payload or raw download bytes.

use crate::client::HttpResponse;
use crate::error::{FilegateError, Result};
use crate::protocol::{RemoteFailure, ResponseEnvelope, SEND_FAILED, SEND_OK};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use tracing::trace;

/// A received reply, positioned after its status line
#[derive(Debug)]
pub struct ServerReply {
    status: String,
    body: BufReader<File>,
    length: u64,
}

impl ServerReply {
    /// Check the HTTP status and spool the body
    pub fn receive(url: &str, response: HttpResponse) -> Result<Self> {
        if response.status != 200 {
            return Err(FilegateError::HttpStatus {
                url: url.to_string(),
                status: response.status,
            });
        }

        let mut spool = tempfile::tempfile()?;
        let mut body = response.body;
        let length = io::copy(&mut body, &mut spool)
            .map_err(|e| FilegateError::connection(url, format!("reading reply: {}", e)))?;
        spool.seek(SeekFrom::Start(0))?;
        trace!("Received {} byte reply from {}", length, url);

        let mut body = BufReader::new(spool);
        let mut status = String::new();
        let read = body.read_line(&mut status)?;
        if read == 0 {
            return Err(FilegateError::protocol("empty reply"));
        }
        let status = status.trim_end_matches(['\r', '\n']).trim().to_string();

        Ok(Self {
            length: length - read as u64,
            status,
            body,
        })
    }

    /// Status line
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Bytes after the status line
    pub fn payload_length(&self) -> u64 {
        self.length
    }

    /// Interpret the reply as a textual envelope
    pub fn into_envelope(mut self) -> Result<ResponseEnvelope> {
        let mut bytes = Vec::with_capacity(self.length as usize);
        self.body.read_to_end(&mut bytes)?;
        let rest = String::from_utf8(bytes)
            .map_err(|_| FilegateError::protocol("reply payload is not UTF-8"))?;
        ResponseEnvelope::from_parts(&self.status, &rest)
    }

    /// Interpret the reply as binary content
    ///
    /// A `SEND_FAILED` reply is turned into the reconstructed remote error.
    pub fn into_binary(mut self) -> Result<impl Read> {
        match self.status.as_str() {
            SEND_OK => Ok(self.body),
            SEND_FAILED => {
                let mut record = String::new();
                self.body.read_to_string(&mut record).map_err(|_| {
                    FilegateError::protocol("failure record is not UTF-8")
                })?;
                Err(RemoteFailure::parse(&record)?.into_error())
            }
            other => Err(FilegateError::protocol(format!(
                "unexpected status line '{}'",
                other.chars().take(64).collect::<String>()
            ))),
        }
    }
}
