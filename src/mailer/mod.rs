//! The mailer: the public entry point that ties resolution, grouping and
//! SMTP conversations together.
//!
//! A [`Mailer`] is configured once through its builder and then shared;
//! its `send` methods are safe to call concurrently from multiple threads.
//! Every call owns its own [`SendState`] and conversations, so concurrent
//! sends only meet in the resolver cache.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use crate::{
    mailer::state::{Delivery, Failure, SendResult, SendState},
    message::FieldGenerator,
    resolver::{DnsResolver, Resolve},
    smtp::{ClientId, ConversationFactory, TcpConversationFactory, SMTP_PORT},
    Address, Error, Message,
};

pub mod state;

/// Sends messages directly to each recipient's mail exchanger, or through
/// a fixed relay.
///
/// # Examples
///
/// ```no_run
/// use mxsend::{Mailer, Message};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mailer = Mailer::builder("sender.example.com").build();
///
/// let message = Message::builder()
///     .from("noa@example.com".parse()?)
///     .to("someone@example.org".parse()?)
///     .subject("greetings")
///     .body("hello over there")
///     .build()?;
///
/// let delivery = mailer.send(&message)?;
/// println!("accepted by {}", delivery.server());
/// # Ok(())
/// # }
/// ```
pub struct Mailer {
    fields: FieldGenerator,
    resolver: Option<Arc<dyn Resolve>>,
    factory: Arc<dyn ConversationFactory>,
    relay: Option<String>,
}

impl Mailer {
    /// Starts configuring a mailer that greets servers as `ehlo_hostname`.
    ///
    /// Defaults are direct delivery (system name server, port 25, 60
    /// second timeouts); see [`MailerBuilder`] for the knobs.
    pub fn builder(ehlo_hostname: impl Into<String>) -> MailerBuilder {
        MailerBuilder {
            ehlo_hostname: ehlo_hostname.into(),
            relay: None,
            name_server: None,
            port: SMTP_PORT,
            timeout: Some(crate::smtp::DEFAULT_TIMEOUT),
            resolver: None,
            factory: None,
        }
    }

    /// Sends `message` to its single recipient.
    ///
    /// Fails with [`Error::TooManyRecipients`] before any network activity
    /// when the message has several recipients. Unlike `send_multi`, a
    /// recorded delivery failure is raised as [`Error::Delivery`] here.
    pub fn send(&self, message: &Message) -> Result<Delivery, Error> {
        if message.to().len() > 1 {
            return Err(Error::TooManyRecipients);
        }
        let recipient = message.to()[0].clone();

        let mut results = self.send_multi(message)?;
        match results.remove(&recipient) {
            Some(Ok(delivery)) => Ok(delivery),
            Some(Err(failure)) => Err(Error::Delivery(failure)),
            // send_multi returns an outcome for every requested recipient
            None => unreachable!("recipient missing from result map"),
        }
    }

    /// Sends `message` to all its recipients and returns one outcome per
    /// recipient.
    ///
    /// The result map always contains exactly the recipients of the
    /// message. Per-recipient failures are entries in the map, never an
    /// `Err`: one undeliverable recipient does not keep the others from
    /// being attempted. `Err` is reserved for message validation problems,
    /// raised before any network I/O.
    pub fn send_multi(&self, message: &Message) -> Result<HashMap<Address, SendResult>, Error> {
        message.validate()?;
        // a recipient listed twice gets one delivery attempt and one outcome
        let mut recipients: Vec<Address> = Vec::with_capacity(message.to().len());
        for recipient in message.to() {
            if !recipients.contains(recipient) {
                recipients.push(recipient.clone());
            }
        }
        let email = message.formatted(&self.fields);

        let mut state = match (&self.resolver, &self.relay) {
            // a configured resolver wins over the relay
            (Some(resolver), _) => SendState::resolved(resolver.as_ref(), recipients),
            (None, Some(relay)) => SendState::fixed(relay, recipients),
            (None, None) => unreachable!("the builder installs a resolver when no relay is set"),
        };

        while let Some(group) = state.next_group() {
            tracing::debug!(server = group.server(), recipients = group.recipients().len(), "dispatching group");
            match self.factory.get(group.server()) {
                Ok(mut conversation) => {
                    conversation.send_mail(message.from(), &email, &group, &mut state);
                    // a conversation settles its whole group; this only
                    // fires when a third-party implementation drops some
                    state.fail_unrecorded(
                        &group,
                        &Failure::conversation_incomplete(group.server()),
                    );
                }
                Err(err) => {
                    tracing::debug!(server = group.server(), %err, "connection failed");
                    state.fail_unrecorded(&group, &Failure::connect(group.server(), &err));
                }
            }
        }

        Ok(state.into_results())
    }
}

/// Configuration for [`Mailer`], immutable once built
pub struct MailerBuilder {
    ehlo_hostname: String,
    relay: Option<String>,
    name_server: Option<SocketAddr>,
    port: u16,
    timeout: Option<Duration>,
    resolver: Option<Arc<dyn Resolve>>,
    factory: Option<Arc<dyn ConversationFactory>>,
}

impl MailerBuilder {
    /// Routes all mail through one relay server instead of resolving MX
    /// records per recipient domain.
    ///
    /// Setting a name server or a resolver turns resolution back on.
    pub fn relay(mut self, server: impl Into<String>) -> Self {
        self.relay = Some(server.into());
        self
    }

    /// Queries the given DNS server instead of the system default from
    /// `/etc/resolv.conf`
    pub fn name_server(mut self, name_server: SocketAddr) -> Self {
        self.name_server = Some(name_server);
        self
    }

    /// Connects to this SMTP port instead of 25, mainly useful where
    /// outbound port 25 is blocked
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Bounds connection attempts and each command exchange; `None`
    /// disables timeouts
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replaces the MX resolver (test double, alternative implementation)
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Replaces the conversation factory (test double, pooling, exotic
    /// transports)
    pub fn conversation_factory(mut self, factory: Arc<dyn ConversationFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Builds the mailer, wiring defaults for everything not overridden
    pub fn build(self) -> Mailer {
        let resolver: Option<Arc<dyn Resolve>> = match self.resolver {
            Some(resolver) => Some(resolver),
            // resolution is on unless only a relay was configured
            None if self.name_server.is_some() || self.relay.is_none() => {
                Some(Arc::new(match self.name_server {
                    Some(addr) => DnsResolver::with_name_server(addr),
                    None => DnsResolver::new(),
                }))
            }
            None => None,
        };

        let factory = self.factory.unwrap_or_else(|| {
            Arc::new(
                TcpConversationFactory::new(ClientId::Domain(self.ehlo_hostname.clone()))
                    .port(self.port)
                    .timeout(self.timeout),
            )
        });

        Mailer {
            fields: FieldGenerator::new(self.ehlo_hostname),
            resolver,
            factory,
            relay: self.relay,
        }
    }
}
