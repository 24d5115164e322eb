//! SMTP conversation layer.
//!
//! A [`Conversation`] drives one protocol exchange with one delivery server
//! for one group of recipients, reporting every recipient's outcome into the
//! send state before it returns. Conversations are handed out by a
//! [`ConversationFactory`], the injection seam for tests.

use std::{
    fmt::{self, Display, Formatter},
    net::{Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};

use crate::{
    mailer::state::{Delivery, Failure, SendGroup, SendState},
    smtp::{
        client::{
            net::{Connector, TcpConnector},
            SmtpConnection,
        },
        commands::{Data, Mail, Rcpt},
    },
    Address,
};

pub mod client;
pub mod commands;
pub mod error;
pub mod response;

pub use self::error::Error;

/// Default SMTP port
pub const SMTP_PORT: u16 = 25;

/// Default timeout for connection attempts and command exchanges
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Client identifier, the parameter to `EHLO`
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum ClientId {
    /// A fully-qualified domain name
    Domain(String),
    /// An IPv4 address literal
    Ipv4(Ipv4Addr),
    /// An IPv6 address literal
    Ipv6(Ipv6Addr),
}

const LOCALHOST_CLIENT: ClientId = ClientId::Ipv4(Ipv4Addr::new(127, 0, 0, 1));

impl Default for ClientId {
    fn default() -> Self {
        // https://tools.ietf.org/html/rfc5321#section-4.1.4
        //
        // The EHLO parameter should be the client's primary host name, with
        // an address literal as the fallback when none is available.
        hostname::get()
            .ok()
            .and_then(|s| s.into_string().map(Self::Domain).ok())
            .unwrap_or(LOCALHOST_CLIENT)
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Domain(ref value) => f.write_str(value),
            Self::Ipv4(ref value) => write!(f, "[{value}]"),
            Self::Ipv6(ref value) => write!(f, "[IPv6:{value}]"),
        }
    }
}

/// One SMTP exchange with one server for one recipient group.
///
/// `send_mail` blocks until the whole group is settled and must leave no
/// recipient of the group without a recorded outcome.
pub trait Conversation {
    /// Sends `email` from `from` to the recipients of `group`, recording a
    /// terminal outcome for each of them into `state`
    fn send_mail(&mut self, from: &Address, email: &[u8], group: &SendGroup, state: &mut SendState);
}

/// Builds [`Conversation`]s bound to a delivery server.
///
/// The production implementation opens one fresh TCP connection per
/// conversation. An implementation may reuse connections, but must never let
/// two conversations drive the same connection at the same time.
pub trait ConversationFactory: Send + Sync {
    /// Returns a conversation connected and greeted to `server`
    fn get(&self, server: &str) -> Result<Box<dyn Conversation>, Error>;
}

/// The production conversation: drives the protocol over one
/// [`SmtpConnection`]
pub struct SmtpConversation {
    conn: SmtpConnection,
    server: String,
}

impl SmtpConversation {
    /// Wraps an already-greeted connection to `server`
    pub fn new(conn: SmtpConnection, server: impl Into<String>) -> SmtpConversation {
        SmtpConversation {
            conn,
            server: server.into(),
        }
    }

    fn fail_remaining<'a, I>(&mut self, recipients: I, failure: Failure, state: &mut SendState)
    where
        I: IntoIterator<Item = &'a Address>,
    {
        for recipient in recipients {
            state.record(recipient, Err(failure.clone()));
        }
        self.conn.abort();
    }
}

impl Conversation for SmtpConversation {
    fn send_mail(
        &mut self,
        from: &Address,
        email: &[u8],
        group: &SendGroup,
        state: &mut SendState,
    ) {
        tracing::debug!(server = %self.server, recipients = group.recipients().len(), "starting conversation");

        if let Err(err) = self.conn.command(Mail::new(from.clone())) {
            let failure = Failure::smtp(&self.server, &err);
            self.fail_remaining(group.recipients(), failure, state);
            return;
        }

        let mut accepted: Vec<&Address> = Vec::new();
        let mut pending = group.recipients().iter();
        while let Some(recipient) = pending.next() {
            match self.conn.command(Rcpt::new(recipient.clone())) {
                Ok(_) => accepted.push(recipient),
                Err(err) if err.is_transient() || err.is_permanent() => {
                    // the server rejected this one recipient, the rest of
                    // the group goes on
                    tracing::debug!(%recipient, %err, "recipient rejected");
                    state.record(recipient, Err(Failure::smtp(&self.server, &err)));
                }
                Err(err) => {
                    let failure = Failure::smtp(&self.server, &err);
                    state.record(recipient, Err(failure.clone()));
                    let unrecorded: Vec<&Address> =
                        accepted.drain(..).chain(pending).collect();
                    self.fail_remaining(unrecorded, failure, state);
                    return;
                }
            }
        }

        if accepted.is_empty() {
            let _ = self.conn.quit();
            return;
        }

        match self
            .conn
            .command(Data)
            .and_then(|_| self.conn.message(email))
        {
            Ok(response) => {
                let delivery = Delivery::new(self.server.clone(), response);
                for recipient in accepted {
                    state.record(recipient, Ok(delivery.clone()));
                }
                let _ = self.conn.quit();
            }
            Err(err) => {
                let failure = Failure::smtp(&self.server, &err);
                self.fail_remaining(accepted, failure, state);
            }
        }
    }
}

/// Connects over TCP and performs the greeting before handing out the
/// conversation
pub struct TcpConversationFactory {
    hello_name: ClientId,
    port: u16,
    timeout: Option<Duration>,
    connector: Arc<dyn Connector>,
}

impl TcpConversationFactory {
    /// Creates a factory greeting servers as `hello_name`
    pub fn new(hello_name: ClientId) -> TcpConversationFactory {
        TcpConversationFactory {
            hello_name,
            port: SMTP_PORT,
            timeout: Some(DEFAULT_TIMEOUT),
            connector: Arc::new(TcpConnector),
        }
    }

    /// Overrides the SMTP port, mainly useful where port 25 is blocked
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Overrides the network timeout
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the socket factory
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }
}

impl ConversationFactory for TcpConversationFactory {
    fn get(&self, server: &str) -> Result<Box<dyn Conversation>, Error> {
        let mut stream = self.connector.connect(server, self.port, self.timeout)?;
        stream.set_timeout(self.timeout).map_err(error::network)?;

        let mut conn = SmtpConnection::new(stream);
        let response = conn.handshake(&self.hello_name)?;
        tracing::debug!(%server, greeting = ?response.first_line(), "connected");

        Ok(Box::new(SmtpConversation {
            conn,
            server: server.to_owned(),
        }))
    }
}
