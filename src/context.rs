//! Contexts, the caller-facing handles onto a directory subtree.
//!
//! A [`DirectoryContext`] is bound to a DN and an environment. Names passed to
//! its operations are relative to that DN, unless they are absolute
//! `ldap://` URLs. Contexts derived from one another share a single
//! [`DirectoryConnection`], which is closed when the last of them is closed or
//! dropped.
use std::{
	borrow::Cow,
	collections::{HashMap, HashSet},
	fmt,
	future::Future,
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use ldap3::{
	controls::{Control, RawControl},
	SearchEntry,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
	config::{property, ConnectionSettings, ReferralMode, SearchControls},
	connection::{check_socket_factory, DirectoryConnection},
	entry::SearchEntryExt,
	env::Environment,
	error::{Error, RC_NO_SUCH_OBJECT, RC_REFERRAL, RC_SIZE_LIMIT_EXCEEDED},
	event::{ChangeListener, ChangeTypes, Subscription, SubscriptionHandle},
	ldap::Ldap3Connector,
	name::{self, DirectoryUrl},
	protocol::{
		wire_attributes, Connector, Modification, Operation, Response, SearchRequest, SearchScope,
	},
	referral::ReferralHandler,
};

/// Filter matching every entry.
const MATCH_ALL: &str = "(objectClass=*)";

/// Attribute listed for each entry by [`DirectoryContext::list`].
const OBJECT_CLASS: &str = "objectClass";

/// Boxed future, used to recurse through referrals.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-call overrides of a context's search defaults.
///
/// Fields left unset fall back to the defaults derived from the context's
/// environment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchOptions {
	/// Search scope.
	scope: Option<SearchScope>,
	/// Maximum number of entries.
	count_limit: Option<u32>,
	/// Time limit in milliseconds.
	time_limit: Option<u32>,
	/// Attributes to return.
	attributes: Option<Vec<String>>,
	/// Attach a context to each result.
	return_objects: Option<bool>,
}

impl SearchOptions {
	/// Options that change nothing.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Set the search scope.
	#[must_use]
	pub fn scope(mut self, scope: SearchScope) -> Self {
		self.scope = Some(scope);
		self
	}

	/// Limit the number of returned entries, 0 for no limit.
	#[must_use]
	pub fn count_limit(mut self, limit: u32) -> Self {
		self.count_limit = Some(limit);
		self
	}

	/// Limit the server side search time in milliseconds, 0 for no limit.
	#[must_use]
	pub fn time_limit(mut self, millis: u32) -> Self {
		self.time_limit = Some(millis);
		self
	}

	/// Return only these attributes. An empty list returns no attributes.
	#[must_use]
	pub fn attributes<I, S>(mut self, attributes: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.attributes = Some(attributes.into_iter().map(Into::into).collect());
		self
	}

	/// Attach a context bound to each returned entry.
	#[must_use]
	pub fn return_objects(mut self, return_objects: bool) -> Self {
		self.return_objects = Some(return_objects);
		self
	}

	/// Apply these options to `defaults`, copying only if something changes.
	pub(crate) fn apply<'a>(&self, defaults: &'a SearchControls) -> Cow<'a, SearchControls> {
		let changes = self.scope.is_some_and(|scope| scope != defaults.scope)
			|| self.count_limit.is_some_and(|limit| limit != defaults.count_limit)
			|| self.time_limit.is_some_and(|limit| limit != defaults.time_limit)
			|| self
				.attributes
				.as_ref()
				.is_some_and(|attributes| defaults.attributes.as_ref() != Some(attributes))
			|| self.return_objects.is_some_and(|objects| objects != defaults.return_objects);
		if !changes {
			return Cow::Borrowed(defaults);
		}

		let mut controls = defaults.clone();
		if let Some(scope) = self.scope {
			controls.scope = scope;
		}
		if let Some(limit) = self.count_limit {
			controls.count_limit = limit;
		}
		if let Some(limit) = self.time_limit {
			controls.time_limit = limit;
		}
		if let Some(attributes) = &self.attributes {
			controls.attributes = Some(attributes.clone());
		}
		if let Some(objects) = self.return_objects {
			controls.return_objects = objects;
		}
		Cow::Owned(controls)
	}
}

/// An entry returned by [`DirectoryContext::search`].
#[derive(Debug)]
pub struct SearchResult {
	/// Name of the entry relative to the search base.
	pub name: String,
	/// The entry.
	pub entry: SearchEntry,
	/// A context bound to the entry, if objects were requested.
	pub object: Option<DirectoryContext>,
}

/// An entry returned by [`DirectoryContext::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameClassPair {
	/// Name of the entry relative to the listed context.
	pub name: String,
	/// Object classes of the entry.
	pub object_classes: Vec<String>,
}

/// Mutable, per-context state.
struct ContextState {
	/// Private copy-on-write environment.
	env: Environment,
	/// Search defaults derived from `env`.
	defaults: Arc<SearchControls>,
	/// Controls sent with each request.
	request_controls: Vec<RawControl>,
	/// Controls returned with the most recent response.
	response_controls: Vec<RawControl>,
}

/// A handle onto a directory subtree.
pub struct DirectoryContext {
	/// DN this context is bound to.
	dn: String,
	/// Environment, defaults and controls.
	state: Mutex<ContextState>,
	/// Connection shared with related contexts.
	connection: Arc<DirectoryConnection>,
	/// Set once the context was closed.
	closed: AtomicBool,
}

impl fmt::Debug for DirectoryContext {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("DirectoryContext")
			.field("dn", &self.dn)
			.field("closed", &self.is_closed())
			.field("connection", &self.connection)
			.finish_non_exhaustive()
	}
}

/// Where an operation on a name is issued.
struct Target {
	/// Absolute DN of the entry.
	dn: String,
	/// Root context for URL names, closed after the operation.
	redirect: Option<DirectoryContext>,
}

impl Target {
	/// The context to issue the operation on.
	fn context<'a>(&'a self, origin: &'a DirectoryContext) -> &'a DirectoryContext {
		self.redirect.as_ref().unwrap_or(origin)
	}

	/// Close the redirect context, if any.
	async fn finish(self) {
		if let Some(redirect) = self.redirect {
			redirect.close().await;
		}
	}
}

impl DirectoryContext {
	/// Create a root context connecting through `ldap3`.
	///
	/// Nothing is sent to the server until the first operation. The context
	/// is bound to the DN in the path of the provider URL.
	pub fn new(env: Environment) -> Result<Self, Error> {
		Self::with_connector(env, Arc::new(Ldap3Connector))
	}

	/// Create a root context connecting through `connector`.
	pub fn with_connector(mut env: Environment, connector: Arc<dyn Connector>) -> Result<Self, Error> {
		let settings = ConnectionSettings::from_env(&env)?;
		check_socket_factory(&settings, connector.as_ref())?;
		let dn = DirectoryUrl::parse(settings.url.as_str())?.dn;
		let defaults = Arc::new(SearchControls::from_env(&env)?);
		let connection =
			Arc::new(DirectoryConnection::new(connector, env.fork(), settings.url.as_str()));
		debug!("Created context for {dn:?} on {}", settings.url);

		let state =
			ContextState { env, defaults, request_controls: Vec::new(), response_controls: Vec::new() };
		Ok(Self::assemble(dn, state, connection))
	}

	/// Build a context around an already counted connection reference.
	fn assemble(dn: String, state: ContextState, connection: Arc<DirectoryConnection>) -> Self {
		Self { dn, state: Mutex::new(state), connection, closed: AtomicBool::new(false) }
	}

	/// DN this context is bound to.
	#[must_use]
	pub fn dn(&self) -> &str {
		&self.dn
	}

	/// The connection this context shares with related contexts.
	#[must_use]
	pub fn connection(&self) -> &Arc<DirectoryConnection> {
		&self.connection
	}

	/// Whether [`close`](Self::close) was called.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Fail with [`Error::ContextClosed`] once closed.
	fn ensure_open(&self) -> Result<(), Error> {
		if self.is_closed() {
			return Err(Error::ContextClosed);
		}
		Ok(())
	}

	/// Every visible property of this context's environment.
	pub fn environment(&self) -> Result<HashMap<String, String>, Error> {
		self.ensure_open()?;
		Ok(self.state.lock().env.snapshot_all())
	}

	/// Set a property for this context only, returning the previous value.
	///
	/// Search defaults are recomputed. Connection properties only affect
	/// contexts that open a connection of their own. Values that fail
	/// validation are rejected and leave the environment unchanged.
	pub fn add_to_environment(
		&self,
		name: &str,
		value: impl Into<String>,
	) -> Result<Option<String>, Error> {
		self.ensure_open()?;
		let mut state = self.state.lock();
		let previous = state.env.set(name, value);
		match SearchControls::from_env(&state.env) {
			Ok(defaults) => {
				state.defaults = Arc::new(defaults);
				Ok(previous)
			}
			Err(err) => {
				match previous {
					Some(previous) => state.env.set(name, previous),
					None => state.env.remove(name),
				};
				Err(err)
			}
		}
	}

	/// Remove a property for this context only, returning the removed value.
	pub fn remove_from_environment(&self, name: &str) -> Result<Option<String>, Error> {
		self.ensure_open()?;
		let mut state = self.state.lock();
		let removed = state.env.remove(name);
		state.defaults = Arc::new(SearchControls::from_env(&state.env)?);
		Ok(removed)
	}

	/// Replace the controls sent with every subsequent request.
	pub fn set_request_controls(&self, controls: Vec<RawControl>) -> Result<(), Error> {
		self.ensure_open()?;
		self.state.lock().request_controls = controls;
		Ok(())
	}

	/// Controls sent with every request.
	#[must_use]
	pub fn request_controls(&self) -> Vec<RawControl> {
		self.state.lock().request_controls.clone()
	}

	/// Controls the server returned with the most recent response.
	#[must_use]
	pub fn response_controls(&self) -> Vec<RawControl> {
		self.state.lock().response_controls.clone()
	}

	/// Create a context on the same connection and DN, with `overrides` on
	/// top of a copy of this context's environment. Request controls are
	/// copied.
	pub fn clone_with<I, K, V>(&self, overrides: I) -> Result<Self, Error>
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let overrides =
			overrides.into_iter().map(|(name, value)| (name.into(), value.into())).collect();
		self.derive(self.dn.clone(), overrides, true)
	}

	/// Create a context sharing this context's connection.
	fn derive(
		&self,
		dn: String,
		overrides: Vec<(String, String)>,
		copy_controls: bool,
	) -> Result<Self, Error> {
		self.ensure_open()?;
		let state = {
			let mut current = self.state.lock();
			let mut env = current.env.fork();
			let defaults = if overrides.is_empty() {
				current.defaults.clone()
			} else {
				env.extend(overrides);
				Arc::new(SearchControls::from_env(&env)?)
			};
			let request_controls =
				if copy_controls { current.request_controls.clone() } else { Vec::new() };
			ContextState { env, defaults, request_controls, response_controls: Vec::new() }
		};
		self.connection.retain()?;
		Ok(Self::assemble(dn, state, self.connection.clone()))
	}

	/// A handler over `referrals` that builds contexts from this context's
	/// environment and connector.
	pub fn referral_handler(&self, referrals: Vec<String>) -> Result<ReferralHandler, Error> {
		self.ensure_open()?;
		let env = self.state.lock().env.fork();
		Ok(ReferralHandler::new(referrals, env, self.connection.connector().clone()))
	}

	/// Resolve a name passed to an operation.
	fn resolve(&self, name: &str) -> Result<Target, Error> {
		self.ensure_open()?;
		if name::is_url(name) {
			let mut handler = self.referral_handler(Vec::new())?;
			let redirect = handler.build_context(Some(name.trim()), Vec::<(String, String)>::new())?;
			Ok(Target { dn: redirect.dn.clone(), redirect: Some(redirect) })
		} else {
			Ok(Target { dn: name::compose(name, &self.dn), redirect: None })
		}
	}

	/// Current search defaults.
	fn defaults(&self) -> Arc<SearchControls> {
		self.state.lock().defaults.clone()
	}

	/// Search below `name`.
	///
	/// With the default scope of [`SearchScope::OneLevel`], the immediate
	/// children of `name` matching `filter` are returned. An empty filter
	/// matches everything.
	pub async fn search(
		&self,
		name: &str,
		filter: &str,
		options: &SearchOptions,
	) -> Result<Vec<SearchResult>, Error> {
		let target = self.resolve(name)?;
		let result = target.context(self).search_in(&target.dn, filter, options).await;
		target.finish().await;
		result
	}

	/// Search below an absolute DN.
	async fn search_in(
		&self,
		base: &str,
		filter: &str,
		options: &SearchOptions,
	) -> Result<Vec<SearchResult>, Error> {
		let defaults = self.defaults();
		let controls = options.apply(&defaults);
		let response = self.execute(Operation::Search(search_request(base, filter, &controls))).await?;

		response
			.entries
			.into_iter()
			.map(|entry| {
				let name = name::relative_name(base, &entry.dn).unwrap_or_else(|_| entry.dn.clone());
				let object = if controls.return_objects {
					Some(self.derive(entry.dn.clone(), Vec::new(), false)?)
				} else {
					None
				};
				Ok(SearchResult { name, entry, object })
			})
			.collect()
	}

	/// Read the attributes of the entry at `name`.
	///
	/// `None` returns all user attributes, an empty list returns none.
	pub async fn read(&self, name: &str, attributes: Option<&[&str]>) -> Result<SearchEntry, Error> {
		let attributes: Option<Vec<String>> =
			attributes.map(|attributes| attributes.iter().map(|attr| (*attr).to_owned()).collect());
		let target = self.resolve(name)?;
		let result = target.context(self).read_in(&target.dn, attributes).await;
		target.finish().await;
		result
	}

	/// Read the entry at an absolute DN.
	async fn read_in(&self, dn: &str, attributes: Option<Vec<String>>) -> Result<SearchEntry, Error> {
		let controls = SearchControls {
			scope: SearchScope::Object,
			count_limit: 0,
			attributes,
			return_objects: false,
			batch_size: 0,
			..(*self.defaults()).clone()
		};
		let response = self.execute(Operation::Search(search_request(dn, MATCH_ALL, &controls))).await?;
		response.entries.into_iter().next().ok_or_else(|| Error::Protocol {
			code: RC_NO_SUCH_OBJECT,
			message: format!("No entry at {dn}"),
			matched: String::new(),
		})
	}

	/// Apply `changes` to the entry at `name`, in order.
	pub async fn modify(&self, name: &str, changes: Vec<Modification>) -> Result<(), Error> {
		let target = self.resolve(name)?;
		let operation = Operation::Modify { dn: target.dn.clone(), changes };
		let result = target.context(self).execute(operation).await.map(drop);
		target.finish().await;
		result
	}

	/// Create an entry at `name` and return a context bound to it.
	pub async fn add(
		&self,
		name: &str,
		attributes: Vec<(String, HashSet<String>)>,
	) -> Result<Self, Error> {
		let target = self.resolve(name)?;
		let context = target.context(self);
		let operation = Operation::Add { dn: target.dn.clone(), attributes };
		let result = match context.execute(operation).await {
			Ok(_) => context.derive(target.dn.clone(), Vec::new(), false),
			Err(err) => Err(err),
		};
		target.finish().await;
		result
	}

	/// Delete the entry at `name`.
	pub async fn delete(&self, name: &str) -> Result<(), Error> {
		let target = self.resolve(name)?;
		let operation = Operation::Delete { dn: target.dn.clone() };
		let result = target.context(self).execute(operation).await.map(drop);
		target.finish().await;
		result
	}

	/// Rename the entry at `old_name` to `new_name`, moving it if the parent
	/// differs.
	///
	/// `new_name` is resolved against the same context as `old_name` and
	/// must not be a URL. The old RDN value is removed unless
	/// `rename.delete_old_rdn` is `false`.
	pub async fn rename(&self, old_name: &str, new_name: &str) -> Result<(), Error> {
		if name::is_url(new_name) {
			return Err(Error::InvalidName(new_name.to_owned()));
		}
		let delete_old_rdn =
			self.state.lock().env.parse_bool(property::DELETE_OLD_RDN)?.unwrap_or(true);
		let target = self.resolve(old_name)?;
		let result = async {
			let context = target.context(self);
			let new_dn = name::compose(new_name, &context.dn);
			let (new_rdn, new_parent) = name::split_leaf(&new_dn)?;
			let (_, old_parent) = name::split_leaf(&target.dn)?;
			let new_superior = (name::normalize(&new_parent)? != name::normalize(&old_parent)?)
				.then_some(new_parent);
			let operation =
				Operation::Rename { dn: target.dn.clone(), new_rdn, new_superior, delete_old_rdn };
			context.execute(operation).await.map(drop)
		}
		.await;
		target.finish().await;
		result
	}

	/// Names and object classes of the immediate children of `name`.
	pub async fn list(&self, name: &str) -> Result<Vec<NameClassPair>, Error> {
		let options = SearchOptions::new()
			.scope(SearchScope::OneLevel)
			.attributes([OBJECT_CLASS])
			.return_objects(false);
		let results = self.search(name, MATCH_ALL, &options).await?;
		Ok(results
			.into_iter()
			.map(|result| NameClassPair {
				object_classes: result.entry.attr_values(OBJECT_CLASS).to_vec(),
				name: result.name,
			})
			.collect())
	}

	/// A context bound to the entry at `name`, which must exist.
	pub async fn lookup(&self, name: &str) -> Result<Self, Error> {
		let target = self.resolve(name)?;
		let context = target.context(self);
		let result = match context.read_in(&target.dn, Some(Vec::new())).await {
			Ok(_) => context.derive(target.dn.clone(), Vec::new(), false),
			Err(err) => Err(err),
		};
		target.finish().await;
		result
	}

	/// Be notified of changes below `name`.
	///
	/// Subscriptions with the same base, scope, filter, attributes and change
	/// types on this connection share one persistent search. They outlive
	/// [`close`](Self::close) and end with [`unsubscribe`](Self::unsubscribe).
	pub async fn subscribe(
		&self,
		name: &str,
		filter: &str,
		options: &SearchOptions,
		change_types: ChangeTypes,
		listener: Arc<dyn ChangeListener>,
	) -> Result<SubscriptionHandle, Error> {
		self.ensure_open()?;
		if name::is_url(name) {
			return Err(Error::InvalidName(name.to_owned()));
		}
		let defaults = self.defaults();
		let controls = options.apply(&defaults);
		let filter = filter.trim();
		let subscription = Subscription {
			base: name::compose(name, &self.dn),
			scope: controls.scope,
			filter: if filter.is_empty() { MATCH_ALL } else { filter }.to_owned(),
			attributes: controls.attributes.clone(),
			change_types,
			context_dn: self.dn.clone(),
		};
		self.connection.connect().await?;
		self.connection.subscribe(subscription, listener).await
	}

	/// Remove a subscription made on this context's connection.
	pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), Error> {
		self.connection.notifications().unsubscribe(handle).await
	}

	/// Close this context, releasing its share of the connection.
	///
	/// Closing twice has no further effect. Subscriptions stay active.
	pub async fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.connection.release().await;
	}

	/// Issue an operation, applying the referral mode.
	async fn execute(&self, operation: Operation) -> Result<Response, Error> {
		self.execute_hops(operation, 0).await
	}

	/// Issue an operation reached after `hops` referrals.
	fn execute_hops(&self, operation: Operation, hops: u32) -> BoxFuture<'_, Result<Response, Error>> {
		Box::pin(async move {
			self.ensure_open()?;
			self.connection.connect().await?;
			let settings = self.connection.settings()?;
			let controls = self.request_controls();
			let mut response = self.connection.issue(&operation, &controls).await?;
			self.state.lock().response_controls =
				response.result.ctrls.iter().map(|Control(_, raw)| raw.clone()).collect();

			if response.result.rc == RC_REFERRAL {
				let referrals = std::mem::take(&mut response.result.refs);
				return match settings.referral {
					ReferralMode::Throw => Err(Error::ReferralRequired { referrals }),
					ReferralMode::Follow => {
						self.follow(operation, referrals, hops, &settings).await
					}
					ReferralMode::Ignore => {
						warn!("Ignoring referral for {} to {referrals:?}", operation.dn());
						Ok(Response::from_result(response.result))
					}
				};
			}

			let truncated = response.result.rc == RC_SIZE_LIMIT_EXCEEDED
				&& matches!(&operation, Operation::Search(request) if request.count_limit > 0);
			if truncated {
				debug!("Search below {} stopped at its count limit", operation.dn());
			} else if response.result.rc != 0 {
				return Err(Error::from_result(response.result));
			}

			let references = std::mem::take(&mut response.referrals);
			if references.is_empty() {
				return Ok(response);
			}
			match (settings.referral, &operation) {
				(ReferralMode::Throw, _) => {
					return Err(Error::ReferralRequired { referrals: references });
				}
				(ReferralMode::Follow, Operation::Search(request)) => {
					for reference in references {
						let mut continued = request.clone();
						if continued.scope == SearchScope::OneLevel {
							continued.scope = SearchScope::Object;
						}
						let chased = self
							.follow(
								Operation::Search(continued),
								vec![reference],
								hops,
								&settings,
							)
							.await?;
						response.entries.extend(chased.entries);
					}
				}
				_ => debug!("Dropping {} continuation references", references.len()),
			}
			Ok(response)
		})
	}

	/// Reissue `operation` on the first reachable referral candidate.
	async fn follow(
		&self,
		operation: Operation,
		referrals: Vec<String>,
		hops: u32,
		settings: &ConnectionSettings,
	) -> Result<Response, Error> {
		if hops >= settings.referral_limit {
			return Err(Error::ReferralLimitExceeded(settings.referral_limit));
		}
		// Referred servers are bound to only with supplied credentials.
		let anonymous =
			(!settings.has_credentials()).then_some((property::AUTHENTICATION, "none"));
		let mut handler = self.referral_handler(referrals)?;
		let mut last_error = None;
		while let Some(target) = handler.current_target().map(str::to_owned) {
			let mut referred = operation.clone();
			if let Some(dn) = handler.target_dn()? {
				referred.retarget(dn);
			}
			debug!("Following referral to {target}, anonymous: {}", anonymous.is_some());
			let context = handler.build_context(None, anonymous)?;
			let result = context.execute_hops(referred, hops + 1).await;
			context.close().await;
			match result {
				Err(err @ Error::Connection { .. }) => {
					warn!("Referral target {target} is unreachable: {err}");
					last_error = Some(err);
					if !handler.skip() {
						break;
					}
				}
				result => return result,
			}
		}
		Err(last_error
			.unwrap_or_else(|| Error::ReferralRequired { referrals: handler.referrals().to_vec() }))
	}
}

impl Drop for DirectoryContext {
	fn drop(&mut self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			self.connection.release_detached();
		}
	}
}

/// Build a search request from resolved controls.
fn search_request(base: &str, filter: &str, controls: &SearchControls) -> SearchRequest {
	let filter = filter.trim();
	SearchRequest {
		base: base.to_owned(),
		scope: controls.scope,
		filter: if filter.is_empty() { MATCH_ALL } else { filter }.to_owned(),
		attributes: wire_attributes(controls.attributes.as_deref()),
		types_only: controls.types_only,
		count_limit: controls.count_limit,
		time_limit: controls.time_limit,
		deref: controls.deref,
		batch_size: controls.batch_size,
	}
}
