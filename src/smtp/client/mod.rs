//! Low-level SMTP client: buffered command/reply exchange over a stream

use std::{
    fmt::Display,
    io::{BufRead, BufReader, Write},
};

use crate::smtp::{
    client::net::NetworkStream,
    commands::{Ehlo, Helo, Quit},
    error::{self, Error},
    response::{parse_response, Response},
    ClientId,
};

pub mod mock;
pub mod net;

/// The codec that applies SMTP transparency (dot-stuffing) to message bodies
#[derive(Clone, Copy, Debug)]
pub struct ClientCodec {
    escape_count: u8,
}

impl Default for ClientCodec {
    fn default() -> Self {
        // the body follows the CRLF after DATA, so a dot in the very first
        // column already starts a line
        ClientCodec { escape_count: 2 }
    }
}

impl ClientCodec {
    /// Creates a new client codec
    pub fn new() -> Self {
        ClientCodec::default()
    }

    /// Appends `frame` to `buf`, doubling any dot that starts a line
    pub fn encode(&mut self, frame: &[u8], buf: &mut Vec<u8>) {
        let mut start = 0;
        for (idx, byte) in frame.iter().enumerate() {
            self.escape_count = match (self.escape_count, *byte) {
                (0, b'\r') => 1,
                (1, b'\n') => 2,
                (2, b'.') => 3,
                _ => u8::from(*byte == b'\r'),
            };
            if self.escape_count == 3 {
                self.escape_count = 0;
                buf.extend_from_slice(&frame[start..idx]);
                buf.push(b'.');
                start = idx;
            }
        }
        buf.extend_from_slice(&frame[start..]);
    }
}

/// Returns the string with all CRLF replaced by `<CRLF>`, for wire logging
fn escape_crlf(string: &str) -> String {
    string.replace("\r\n", "<CRLF>")
}

/// One open connection to an SMTP server.
///
/// Negative replies are surfaced as [`Error`] values carrying the reply
/// code; network failures additionally mark the connection as broken so
/// that no further writes are attempted on it.
pub struct SmtpConnection {
    stream: BufReader<NetworkStream>,
    broken: bool,
    sent_quit: bool,
}

impl SmtpConnection {
    /// Wraps an already-open stream
    pub fn new(stream: NetworkStream) -> SmtpConnection {
        SmtpConnection {
            stream: BufReader::new(stream),
            broken: false,
            sent_quit: false,
        }
    }

    /// Reads the server greeting, then greets back with EHLO, falling back
    /// to HELO if the server rejects it permanently
    pub fn handshake(&mut self, hello_name: &ClientId) -> Result<Response, Error> {
        let greeting = self.read_response()?;
        tracing::debug!("greeting: {:?}", greeting.first_line());

        match self.command(Ehlo::new(hello_name.clone())) {
            Err(err) if err.is_permanent() => self.command(Helo::new(hello_name.clone())),
            other => other,
        }
    }

    /// Tells whether the connection is in a state where further commands
    /// are pointless
    pub fn has_broken(&self) -> bool {
        self.broken || self.sent_quit
    }

    /// Sends an SMTP command and reads the reply
    pub fn command<C: Display>(&mut self, command: C) -> Result<Response, Error> {
        self.write(command.to_string().as_bytes())?;
        self.read_response()
    }

    /// Sends the message body, dot-stuffed and terminated, and reads the
    /// final reply
    pub fn message(&mut self, message: &[u8]) -> Result<Response, Error> {
        let mut codec = ClientCodec::new();
        let mut out_buf = Vec::with_capacity(message.len());
        codec.encode(message, &mut out_buf);
        self.write(&out_buf)?;
        self.write(b"\r\n.\r\n")?;

        self.read_response()
    }

    /// Sends QUIT and remembers that the conversation is over
    pub fn quit(&mut self) -> Result<Response, Error> {
        let result = self.command(Quit);
        self.sent_quit = true;
        result
    }

    /// Ends the conversation, politely when the connection still works
    pub fn abort(&mut self) {
        if !self.broken && !self.sent_quit {
            let _ = self.quit();
        }
        let _ = self.stream.get_mut().shutdown();
        self.broken = true;
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.has_broken() {
            return Err(error::client("connection is no longer usable"));
        }
        let stream = self.stream.get_mut();
        if let Err(err) = stream.write_all(bytes).and_then(|()| stream.flush()) {
            self.broken = true;
            return Err(error::network(err));
        }

        tracing::debug!(">> {}", escape_crlf(&String::from_utf8_lossy(bytes)));
        Ok(())
    }

    /// Reads one complete (possibly multiline) reply
    pub fn read_response(&mut self) -> Result<Response, Error> {
        let mut buffer = String::with_capacity(100);

        loop {
            let read = match self.stream.read_line(&mut buffer) {
                Ok(read) => read,
                Err(err) => {
                    self.broken = true;
                    return Err(error::network(err));
                }
            };
            if read == 0 {
                break;
            }
            tracing::debug!("<< {}", escape_crlf(&buffer));
            match parse_response(&buffer) {
                Ok((_remaining, response)) => {
                    return if response.is_positive() {
                        Ok(response)
                    } else {
                        Err(error::code(
                            response.code(),
                            response.first_line().map(ToOwned::to_owned),
                        ))
                    };
                }
                Err(nom::Err::Incomplete(_)) => { /* read more */ }
                Err(nom::Err::Failure(e)) | Err(nom::Err::Error(e)) => {
                    self.broken = true;
                    return Err(error::response(e.to_string()));
                }
            }
        }

        self.broken = true;
        Err(error::response("incomplete response"))
    }
}
