//! Per-send bookkeeping: recipient groups and outcome accumulation

use std::{
    collections::{HashMap, VecDeque},
    error::Error as StdError,
    fmt::{self, Display, Formatter},
};

use crate::{
    resolver::{Resolve, ResolveError},
    smtp::{
        self,
        response::{Code, Response},
    },
    Address,
};

/// Terminal outcome for one recipient
pub type SendResult = Result<Delivery, Failure>;

/// Tracking information for a successfully delivered recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    server: String,
    response: Response,
}

impl Delivery {
    /// Assembles a delivery outcome, for [`Conversation`] implementations
    /// outside this crate
    ///
    /// [`Conversation`]: crate::smtp::Conversation
    pub fn new(server: impl Into<String>, response: Response) -> Delivery {
        Delivery {
            server: server.into(),
            response,
        }
    }

    /// The server that accepted the message
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The server's final reply to the message body
    pub fn response(&self) -> &Response {
        &self.response
    }
}

/// What went wrong for one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// MX resolution for the recipient's domain failed
    Resolve,
    /// No connection to the delivery server could be established or greeted
    Connect,
    /// The connection broke down mid-conversation
    Network,
    /// The server rejected with a 4yz reply
    Transient,
    /// The server rejected with a 5yz reply
    Permanent,
}

/// The failure outcome recorded for a recipient that could not be
/// delivered to.
///
/// Unlike the layer errors it is built from, `Failure` is a value: it is
/// cloned into the result map for every affected recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    server: Option<String>,
    code: Option<Code>,
    message: String,
}

impl Failure {
    /// Assembles a failure outcome, for [`Conversation`] implementations
    /// outside this crate
    ///
    /// [`Conversation`]: crate::smtp::Conversation
    pub fn new(
        kind: FailureKind,
        server: Option<String>,
        code: Option<Code>,
        message: impl Into<String>,
    ) -> Failure {
        Failure {
            kind,
            server,
            code,
            message: message.into(),
        }
    }

    pub(crate) fn resolve(err: &ResolveError) -> Failure {
        Failure {
            kind: FailureKind::Resolve,
            server: None,
            code: None,
            message: err.to_string(),
        }
    }

    pub(crate) fn connect(server: &str, err: &smtp::Error) -> Failure {
        Failure {
            kind: FailureKind::Connect,
            server: Some(server.to_owned()),
            code: err.status(),
            message: err.to_string(),
        }
    }

    pub(crate) fn conversation_incomplete(server: &str) -> Failure {
        Failure {
            kind: FailureKind::Network,
            server: Some(server.to_owned()),
            code: None,
            message: "conversation ended without settling this recipient".to_owned(),
        }
    }

    pub(crate) fn smtp(server: &str, err: &smtp::Error) -> Failure {
        let kind = if err.is_transient() {
            FailureKind::Transient
        } else if err.is_permanent() {
            FailureKind::Permanent
        } else if err.is_connection() {
            FailureKind::Connect
        } else {
            FailureKind::Network
        };
        Failure {
            kind,
            server: Some(server.to_owned()),
            code: err.status(),
            message: err.to_string(),
        }
    }

    /// Failure category
    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    /// The delivery server involved, when one was selected
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// The SMTP reply code, when the server stated one
    pub fn code(&self) -> Option<Code> {
        self.code
    }

    /// Human readable reason
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Failure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.server {
            Some(ref server) => write!(f, "delivery via {server} failed: {}", self.message),
            None => write!(f, "delivery failed: {}", self.message),
        }
    }
}

impl StdError for Failure {}

/// A subset of the recipient list sharing one resolved delivery server,
/// sent together in one conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendGroup {
    server: String,
    recipients: Vec<Address>,
}

impl SendGroup {
    /// The delivery server for this group
    pub fn server(&self) -> &str {
        &self.server
    }

    /// The recipients batched for this server, in their original order
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }
}

/// Tracks one send operation: the groups still to attempt and the outcome
/// of every recipient settled so far.
///
/// Owned by a single `send_multi` call, never shared across sends.
pub struct SendState {
    groups: VecDeque<SendGroup>,
    outcomes: HashMap<Address, SendResult>,
}

impl SendState {
    /// Single-group state: every recipient goes through the given relay
    pub fn fixed(server: &str, recipients: Vec<Address>) -> SendState {
        assert!(!recipients.is_empty(), "send with no recipients");
        let mut groups = VecDeque::with_capacity(1);
        groups.push_back(SendGroup {
            server: server.to_owned(),
            recipients,
        });
        SendState {
            groups,
            outcomes: HashMap::new(),
        }
    }

    /// Resolver-driven state: recipients are grouped by the most preferred
    /// MX host of their domain. Recipients whose domain fails to resolve
    /// are settled as failed right away and belong to no group.
    pub fn resolved(resolver: &dyn Resolve, recipients: Vec<Address>) -> SendState {
        assert!(!recipients.is_empty(), "send with no recipients");

        let mut state = SendState {
            groups: VecDeque::new(),
            outcomes: HashMap::new(),
        };
        // one resolution per distinct domain within this send
        let mut hosts: HashMap<String, Result<String, Failure>> = HashMap::new();

        for recipient in recipients {
            let domain = recipient.domain();
            let resolved = hosts.entry(domain.to_owned()).or_insert_with(|| {
                match resolver.resolve_mx(domain) {
                    Ok(list) => match list.into_iter().next() {
                        Some(host) => Ok(host),
                        None => Err(Failure::resolve(&ResolveError::NoMailExchanger(
                            domain.to_owned(),
                        ))),
                    },
                    Err(err) => {
                        tracing::debug!(%domain, %err, "resolution failed");
                        Err(Failure::resolve(&err))
                    }
                }
            });

            match resolved {
                Ok(host) => match state.groups.iter_mut().find(|g| g.server == *host) {
                    Some(group) => group.recipients.push(recipient),
                    None => state.groups.push_back(SendGroup {
                        server: host.clone(),
                        recipients: vec![recipient],
                    }),
                },
                Err(failure) => {
                    let failure = failure.clone();
                    state.record(&recipient, Err(failure));
                }
            }
        }

        state
    }

    /// Yields the next group to attempt, each group exactly once
    pub fn next_group(&mut self) -> Option<SendGroup> {
        self.groups.pop_front()
    }

    /// Stores the terminal outcome for one recipient.
    ///
    /// The map is append-only: a second outcome for the same recipient can
    /// only come from a conversation driver bug and panics.
    pub fn record(&mut self, recipient: &Address, outcome: SendResult) {
        let previous = self.outcomes.insert(recipient.clone(), outcome);
        assert!(
            previous.is_none(),
            "outcome recorded twice for {recipient}"
        );
    }

    /// Settles every group recipient that has no outcome yet with a clone
    /// of `failure`
    pub fn fail_unrecorded(&mut self, group: &SendGroup, failure: &Failure) {
        for recipient in &group.recipients {
            if !self.outcomes.contains_key(recipient) {
                self.outcomes
                    .insert(recipient.clone(), Err(failure.clone()));
            }
        }
    }

    /// The accumulated recipient → outcome map
    pub fn into_results(self) -> HashMap<Address, SendResult> {
        self.outcomes
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::resolver::{Resolve, ResolveError};

    struct StubResolver;

    impl Resolve for StubResolver {
        fn resolve_mx(&self, domain: &str) -> Result<Vec<String>, ResolveError> {
            match domain {
                "example.com" => Ok(vec!["mx1.example.com".into(), "mx2.example.com".into()]),
                "example.org" => Ok(vec!["mx1.example.com".into()]),
                "example.net" => Ok(vec!["mx.example.net".into()]),
                other => Err(ResolveError::QueryFailed(format!("no route to {other}"))),
            }
        }
    }

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[test]
    fn groups_by_top_host() {
        let recipients = vec![
            addr("a@example.com"),
            addr("b@example.net"),
            addr("c@example.org"),
            addr("d@example.com"),
        ];
        let mut state = SendState::resolved(&StubResolver, recipients);

        // example.com and example.org share their most preferred host
        let first = state.next_group().unwrap();
        assert_eq!(first.server(), "mx1.example.com");
        assert_eq!(
            first.recipients(),
            &[addr("a@example.com"), addr("c@example.org"), addr("d@example.com")]
        );

        let second = state.next_group().unwrap();
        assert_eq!(second.server(), "mx.example.net");
        assert_eq!(second.recipients(), &[addr("b@example.net")]);

        assert_eq!(state.next_group(), None);
    }

    #[test]
    fn resolution_failure_settles_domain_immediately() {
        let recipients = vec![addr("a@nowhere.invalid"), addr("b@example.com")];
        let mut state = SendState::resolved(&StubResolver, recipients);

        let group = state.next_group().unwrap();
        assert_eq!(group.server(), "mx1.example.com");
        assert_eq!(group.recipients(), &[addr("b@example.com")]);
        assert_eq!(state.next_group(), None);

        let results = state.into_results();
        let failure = results[&addr("a@nowhere.invalid")].as_ref().unwrap_err();
        assert_eq!(failure.kind(), FailureKind::Resolve);
        assert!(!results.contains_key(&addr("b@example.com")));
    }

    #[test]
    fn fixed_mode_yields_one_group() {
        let recipients = vec![addr("a@example.com"), addr("b@example.net")];
        let mut state = SendState::fixed("relay.internal", recipients.clone());

        let group = state.next_group().unwrap();
        assert_eq!(group.server(), "relay.internal");
        assert_eq!(group.recipients(), recipients.as_slice());
        assert_eq!(state.next_group(), None);
    }

    #[test]
    #[should_panic(expected = "outcome recorded twice")]
    fn double_record_panics() {
        let mut state = SendState::fixed("relay.internal", vec![addr("a@example.com")]);
        let failure = Failure::resolve(&ResolveError::QueryFailed("timed out".into()));
        state.record(&addr("a@example.com"), Err(failure.clone()));
        state.record(&addr("a@example.com"), Err(failure));
    }

    #[test]
    fn fail_unrecorded_skips_settled_recipients() {
        let mut state =
            SendState::fixed("relay.internal", vec![addr("a@example.com"), addr("b@example.com")]);
        let group = state.next_group().unwrap();

        let rejected = Failure::resolve(&ResolveError::QueryFailed("rejected".into()));
        state.record(&addr("a@example.com"), Err(rejected));

        let broken = Failure::resolve(&ResolveError::QueryFailed("broken".into()));
        state.fail_unrecorded(&group, &broken);

        let results = state.into_results();
        assert_eq!(
            results[&addr("a@example.com")].as_ref().unwrap_err().message(),
            "MX query failed: rejected"
        );
        assert_eq!(
            results[&addr("b@example.com")].as_ref().unwrap_err().message(),
            "MX query failed: broken"
        );
    }
}
