//! Chasing referrals returned by the directory.
use std::sync::Arc;

use crate::{
	config::property,
	context::DirectoryContext,
	env::Environment,
	error::Error,
	name::DirectoryUrl,
	protocol::Connector,
};

/// Candidate targets of a referral, with a cursor over them.
///
/// Obtained from [`DirectoryContext::referral_handler`] after an operation
/// failed with [`Error::ReferralRequired`], and used internally when the
/// referral mode is `follow`.
#[derive(Debug)]
pub struct ReferralHandler {
	/// Candidate URLs in server order.
	referrals: Vec<String>,
	/// Index of the current candidate.
	cursor: usize,
	/// Environment of the referring context.
	env: Environment,
	/// Connector of the referring context.
	connector: Arc<dyn Connector>,
}

impl ReferralHandler {
	/// Create a handler for `referrals`, building contexts from `env`.
	#[must_use]
	pub fn new(referrals: Vec<String>, env: Environment, connector: Arc<dyn Connector>) -> Self {
		Self { referrals, cursor: 0, env, connector }
	}

	/// All candidate URLs.
	#[must_use]
	pub fn referrals(&self) -> &[String] {
		&self.referrals
	}

	/// The candidate under the cursor, `None` once all were skipped.
	#[must_use]
	pub fn current_target(&self) -> Option<&str> {
		self.referrals.get(self.cursor).map(String::as_str)
	}

	/// Move to the next candidate. Returns `false` if there is none.
	pub fn skip(&mut self) -> bool {
		if self.cursor < self.referrals.len() {
			self.cursor += 1;
		}
		self.cursor < self.referrals.len()
	}

	/// DN named by the current candidate, if it names one.
	pub fn target_dn(&self) -> Result<Option<String>, Error> {
		let Some(target) = self.current_target() else {
			return Ok(None);
		};
		let url = DirectoryUrl::parse(target)?;
		Ok((!url.dn.is_empty()).then_some(url.dn))
	}

	/// Create a root context for `url_override`, or the current candidate.
	///
	/// The new context inherits the referring environment, credentials
	/// included, with only the provider URL replaced and `extra` applied on
	/// top. It opens its own connection.
	pub fn build_context<I, K, V>(
		&mut self,
		url_override: Option<&str>,
		extra: I,
	) -> Result<DirectoryContext, Error>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let target = match url_override {
			Some(url) => url.to_owned(),
			None => self
				.current_target()
				.ok_or_else(|| Error::InvalidName("no referral candidate left".to_owned()))?
				.to_owned(),
		};
		DirectoryUrl::parse(&target)?;

		let mut env = self.env.fork();
		env.extend(extra);
		env.set(property::PROVIDER_URL, target);
		DirectoryContext::with_connector(env, self.connector.clone())
	}
}
