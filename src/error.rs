//! Error codes

/// Result code the directory uses to redirect an operation elsewhere.
pub(crate) const RC_REFERRAL: u32 = 10;
/// Result code of a search cut short by its size limit.
pub(crate) const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
/// Result code for a missing entry.
pub(crate) const RC_NO_SUCH_OBJECT: u32 = 32;

/// Errors that can occur when using this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Establishing, binding or using the transport failed. The connection
	/// should be considered lost; no retry is attempted.
	#[error("Connection to {url} failed: {source}")]
	Connection {
		/// The provider URL the connection was made to.
		url: String,
		/// The underlying transport error.
		#[source]
		source: ldap3::LdapError,
	},
	/// The directory answered with a referral and the referral mode is
	/// `throw`. The candidates can be chased with a
	/// [`ReferralHandler`](crate::referral::ReferralHandler).
	#[error("Referral required: {referrals:?}")]
	ReferralRequired {
		/// Candidate URLs, in the order the server listed them.
		referrals: Vec<String>,
	},
	/// Following referrals took more hops than `referral.limit` allows.
	#[error("Referral hop limit of {0} exceeded")]
	ReferralLimitExceeded(u32),
	/// An environment property holds a value that failed validation.
	#[error("Invalid value {value:?} for property {name}")]
	InvalidConfigValue {
		/// Name of the offending property.
		name: String,
		/// The rejected value.
		value: String,
	},
	/// The directory answered with a non-zero, non-referral result code.
	#[error("Directory returned code {code}: {message}")]
	Protocol {
		/// LDAP result code.
		code: u32,
		/// Diagnostic message from the server.
		message: String,
		/// Matched DN reported by the server, if any.
		matched: String,
	},
	/// The context has been closed.
	#[error("Context is closed")]
	ContextClosed,
	/// No subscription is registered under the given handle.
	#[error("Listener not found")]
	ListenerNotFound,
	/// An operation was issued before the connection was established.
	#[error("Not connected")]
	NotConnected,
	/// A distinguished name or directory URL could not be parsed.
	#[error("Invalid name: {0}")]
	InvalidName(String),
	/// Reading a local file (e.g. TLS certificates) failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	/// Shorthand for [`Error::InvalidConfigValue`].
	pub(crate) fn invalid_config(name: &str, value: impl Into<String>) -> Self {
		Self::InvalidConfigValue { name: name.to_owned(), value: value.into() }
	}

	/// Convert a non-successful [`ldap3::LdapResult`] into a protocol error.
	pub(crate) fn from_result(result: ldap3::LdapResult) -> Self {
		Self::Protocol { code: result.rc, message: result.text, matched: result.matched }
	}
}
