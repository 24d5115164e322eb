//! mxsend delivers email directly: it resolves the mail exchangers of each
//! recipient's domain over raw DNS and speaks SMTP to them itself, with no
//! smarthost in between unless you configure one.
//!
//! A send goes through three stages:
//!
//! * the recipient domains are resolved to their most preferred MX host
//!   ([`resolver`]),
//! * recipients sharing a delivery server are batched into one group,
//! * each group is delivered in one SMTP conversation ([`smtp`]), and every
//!   recipient ends up with its own [`SendResult`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use mxsend::{Mailer, Message};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mailer = Mailer::builder("sender.example.com").build();
//!
//! let message = Message::builder()
//!     .from("noa@example.com".parse()?)
//!     .to("a@example.org".parse()?)
//!     .to("b@example.net".parse()?)
//!     .subject("direct delivery")
//!     .body("no relay involved")
//!     .build()?;
//!
//! for (recipient, outcome) in mailer.send_multi(&message)? {
//!     match outcome {
//!         Ok(delivery) => println!("{recipient}: accepted by {}", delivery.server()),
//!         Err(failure) => println!("{recipient}: {failure}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs, unsafe_code)]
#![doc(html_root_url = "https://docs.rs/mxsend/0.1.0")]

mod address;
mod error;
pub mod mailer;
mod message;
pub mod resolver;
pub mod smtp;

pub use crate::{
    address::{Address, AddressError},
    error::Error,
    mailer::{
        state::{Delivery, Failure, FailureKind, SendGroup, SendResult, SendState},
        Mailer, MailerBuilder,
    },
    message::{Message, MessageBuilder},
};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
