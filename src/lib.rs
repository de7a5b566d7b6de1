//! Directory contexts over LDAPv3.
//!
//! A [`DirectoryContext`] is a handle onto a subtree of a directory server,
//! configured by a string-keyed [`Environment`]. Contexts created from one
//! another share a single connection, which is opened lazily by the first
//! operation and closed once the last context using it is closed or dropped.
//! Environments are copy-on-write: changing a derived context's environment
//! never affects the context it was derived from.
//!
//! Besides the usual read, search, add, modify, rename and delete operations,
//! contexts can [subscribe](DirectoryContext::subscribe) to changes in the
//! directory. Subscriptions are served by [persistent searches], and
//! subscriptions asking for the same thing share one request on the wire.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate which
//! is used here for interfacing with LDAP is an excellent resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//! [persistent searches]: https://datatracker.ietf.org/doc/html/draft-ietf-ldapext-psearch-03
//!
//! # Getting started
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//!
//! use ldap_context::{
//!     config::property, ChangeEvent, ChangeTypes, DirectoryContext, Environment, SearchOptions,
//! };
//!
//! let env: Environment = [
//!     (property::PROVIDER_URL, "ldap://localhost:1389/dc=example,dc=org"),
//!     (property::PRINCIPAL, "cn=admin,dc=example,dc=org"),
//!     (property::CREDENTIALS, "adminpassword"),
//! ]
//! .into_iter()
//! .collect();
//! let context = DirectoryContext::new(env)?;
//!
//! for result in context.search("ou=users", "(objectClass=inetOrgPerson)", &SearchOptions::new()).await? {
//!     println!("{}: {:?}", result.name, result.entry.attrs);
//! }
//!
//! let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<ChangeEvent>();
//! let handle = context
//!     .subscribe("ou=users", "", &SearchOptions::new(), ChangeTypes::ALL, Arc::new(sender))
//!     .await?;
//! if let Some(event) = receiver.recv().await {
//!     println!("Received change: {event:#?}");
//! }
//! context.unsubscribe(handle).await?;
//! context.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Only simple bind is supported. SASL mechanisms are not.
//! * A failed connection is not re-established; contexts using it keep
//!   reporting [`Error::Connection`].
//! * [secrecy](https://docs.rs/secrecy) is not used for storing credentials, it
//!   probably should be

pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod entry;
pub mod env;
pub mod error;
pub mod event;
pub mod ldap;
pub mod name;
pub mod protocol;
pub mod referral;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	config::{ReferralMode, SearchControls},
	context::{DirectoryContext, NameClassPair, SearchOptions, SearchResult},
	entry::SearchEntryExt,
	env::Environment,
	error::Error,
	event::{
		ChangeEvent, ChangeListener, ChangeType, ChangeTypes, NamingErrorEvent, NamingEvent,
		SubscriptionHandle,
	},
	protocol::{Modification, SearchScope},
	referral::ReferralHandler,
};
