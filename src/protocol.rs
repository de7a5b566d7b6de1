//! The seam between contexts and the wire protocol.
//!
//! [`Connector`] opens and binds a connection, [`Session`] issues operations on
//! it. The default implementation lives in [`crate::ldap`]; anything else that
//! can speak to a directory (or pretend to, in tests) can be plugged in through
//! [`DirectoryContext::with_connector`](crate::DirectoryContext::with_connector).
use std::{collections::HashSet, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ldap3::{controls::RawControl, LdapError, LdapResult, SearchEntry};

use crate::{
	config::{ConnectionSettings, DerefAliases},
	error::Error,
};

/// Message id of a request on a connection.
pub type RequestId = i32;

/// Attribute list asking the server for all user attributes.
pub const ALL_ATTRIBUTES: &str = "*";

/// Attribute list asking the server for no attributes at all (RFC 4511 4.5.1.8).
pub const NO_ATTRIBUTES: &str = "1.1";

/// Scope of a search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SearchScope {
	/// Only the base entry.
	Object,
	/// Immediate children of the base.
	OneLevel,
	/// The base and all its descendants.
	Subtree,
}

impl From<SearchScope> for ldap3::Scope {
	fn from(scope: SearchScope) -> Self {
		match scope {
			SearchScope::Object => Self::Base,
			SearchScope::OneLevel => Self::OneLevel,
			SearchScope::Subtree => Self::Subtree,
		}
	}
}

/// Translate a requested attribute list to what goes on the wire. `None`
/// means all attributes, an empty list means none.
#[must_use]
pub fn wire_attributes(attributes: Option<&[String]>) -> Vec<String> {
	match attributes {
		None => vec![ALL_ATTRIBUTES.to_owned()],
		Some([]) => vec![NO_ATTRIBUTES.to_owned()],
		Some(attributes) => attributes.to_vec(),
	}
}

/// A search as sent to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
	/// Absolute DN of the search base.
	pub base: String,
	/// Search scope.
	pub scope: SearchScope,
	/// Filter in string form.
	pub filter: String,
	/// Attributes to return, already translated with [`wire_attributes`].
	pub attributes: Vec<String>,
	/// Return attribute names only.
	pub types_only: bool,
	/// Size limit, 0 for none.
	pub count_limit: u32,
	/// Time limit in milliseconds, 0 for none.
	pub time_limit: u32,
	/// Alias dereferencing.
	pub deref: DerefAliases,
	/// Page size, 0 disables paging.
	pub batch_size: u32,
}

/// A single change in a modify request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modification {
	/// Add values to an attribute.
	Add(String, HashSet<String>),
	/// Delete values, or the whole attribute if the set is empty.
	Delete(String, HashSet<String>),
	/// Replace all values of an attribute.
	Replace(String, HashSet<String>),
}

/// An operation issued through [`DirectoryConnection::issue`](crate::connection::DirectoryConnection::issue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
	/// Search request.
	Search(SearchRequest),
	/// Create an entry.
	Add {
		/// DN of the new entry.
		dn: String,
		/// Initial attributes.
		attributes: Vec<(String, HashSet<String>)>,
	},
	/// Modify an entry.
	Modify {
		/// DN of the entry.
		dn: String,
		/// Changes, applied in order.
		changes: Vec<Modification>,
	},
	/// Delete an entry.
	Delete {
		/// DN of the entry.
		dn: String,
	},
	/// Rename or move an entry.
	Rename {
		/// Current DN of the entry.
		dn: String,
		/// The new leftmost RDN.
		new_rdn: String,
		/// New parent, if the entry moves.
		new_superior: Option<String>,
		/// Remove the old RDN value from the entry.
		delete_old_rdn: bool,
	},
}

impl Operation {
	/// DN the operation targets.
	#[must_use]
	pub fn dn(&self) -> &str {
		match self {
			Self::Search(request) => &request.base,
			Self::Add { dn, .. }
			| Self::Modify { dn, .. }
			| Self::Delete { dn }
			| Self::Rename { dn, .. } => dn,
		}
	}

	/// Point the operation at another DN, as instructed by a referral.
	pub(crate) fn retarget(&mut self, target: String) {
		match self {
			Self::Search(request) => request.base = target,
			Self::Add { dn, .. }
			| Self::Modify { dn, .. }
			| Self::Delete { dn }
			| Self::Rename { dn, .. } => *dn = target,
		}
	}
}

/// What the server sent back for an operation.
#[derive(Debug)]
pub struct Response {
	/// Entries returned by a search.
	pub entries: Vec<SearchEntry>,
	/// URLs from search continuation references.
	pub referrals: Vec<String>,
	/// The final result.
	pub result: LdapResult,
}

impl Response {
	/// A response carrying only a final result.
	#[must_use]
	pub fn from_result(result: LdapResult) -> Self {
		Self { entries: Vec::new(), referrals: Vec::new(), result }
	}
}

/// A message read from the shared queue of asynchronous requests.
#[derive(Debug)]
pub struct Message {
	/// The request the message belongs to.
	pub id: RequestId,
	/// Message contents.
	pub kind: MessageKind,
}

/// Contents of a [`Message`].
#[derive(Debug)]
pub enum MessageKind {
	/// A search result entry together with its response controls.
	Entry {
		/// The entry.
		entry: SearchEntry,
		/// Controls attached to the entry.
		controls: Vec<RawControl>,
	},
	/// A search continuation reference.
	Reference(Vec<String>),
	/// The request completed with the given result.
	Done(LdapResult),
	/// The request was abandoned locally.
	Abandoned,
}

impl MessageKind {
	/// Whether no further messages follow for the request.
	#[must_use]
	pub fn is_final(&self) -> bool {
		matches!(self, Self::Done(_) | Self::Abandoned)
	}
}

/// Opens connections to a directory server.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
	/// Name matched against the `socket.factory` property.
	fn name(&self) -> &str;

	/// Connect and bind according to `settings`.
	async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Session>, Error>;
}

/// An established, bound connection.
#[async_trait]
pub trait Session: Send + Sync + Debug {
	/// Issue an operation and wait for its complete response.
	async fn execute(
		&self,
		operation: &Operation,
		controls: &[RawControl],
	) -> Result<Response, LdapError>;

	/// Start a search whose responses are delivered through
	/// [`next_message`](Session::next_message) instead of being awaited.
	async fn persistent_search(
		&self,
		request: &SearchRequest,
		controls: &[RawControl],
	) -> Result<RequestId, LdapError>;

	/// Abandon an outstanding request.
	async fn abandon(&self, id: RequestId) -> Result<(), LdapError>;

	/// Next message of any outstanding asynchronous request. Returns `None`
	/// once no request is outstanding.
	async fn next_message(&self) -> Result<Option<Message>, LdapError>;

	/// Number of asynchronous requests not yet completed or abandoned.
	fn outstanding(&self) -> usize;

	/// Close the connection.
	async fn unbind(&self) -> Result<(), LdapError>;
}
