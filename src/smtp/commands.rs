//! SMTP commands

use std::fmt::{self, Display, Formatter};

use crate::{smtp::ClientId, Address};

/// EHLO command
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Ehlo {
    client_id: ClientId,
}

impl Display for Ehlo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EHLO {}\r\n", self.client_id)
    }
}

impl Ehlo {
    /// Creates an EHLO command
    pub fn new(client_id: ClientId) -> Ehlo {
        Ehlo { client_id }
    }
}

/// HELO command, the fallback greeting for servers without ESMTP
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Helo {
    client_id: ClientId,
}

impl Display for Helo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "HELO {}\r\n", self.client_id)
    }
}

impl Helo {
    /// Creates a HELO command
    pub fn new(client_id: ClientId) -> Helo {
        Helo { client_id }
    }
}

/// MAIL command
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Mail {
    sender: Address,
}

impl Display for Mail {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MAIL FROM:<{}>\r\n", self.sender)
    }
}

impl Mail {
    /// Creates a MAIL command
    pub fn new(sender: Address) -> Mail {
        Mail { sender }
    }
}

/// RCPT command
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Rcpt {
    recipient: Address,
}

impl Display for Rcpt {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RCPT TO:<{}>\r\n", self.recipient)
    }
}

impl Rcpt {
    /// Creates an RCPT command
    pub fn new(recipient: Address) -> Rcpt {
        Rcpt { recipient }
    }
}

/// DATA command
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Data;

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("DATA\r\n")
    }
}

/// QUIT command
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Quit;

impl Display for Quit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("QUIT\r\n")
    }
}
