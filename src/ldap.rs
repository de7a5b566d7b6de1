//! [`Connector`] and [`Session`] over the `ldap3` crate.

use std::{
	collections::HashMap,
	fmt,
	sync::Arc,
	time::Duration,
};

use async_trait::async_trait;
use ldap3::{
	adapters::{Adapter, PagedResults},
	controls::{Control, RawControl},
	parse_refs, LdapConnAsync, LdapError, LdapResult, Mod, ResultEntry, SearchEntry, SearchOptions,
};
use tokio::{
	sync::{mpsc, Mutex},
	task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
	config::{Authentication, ConnectionSettings},
	error::Error,
	protocol::{
		Connector, Message, MessageKind, Modification, Operation, RequestId, Response,
		SearchRequest, Session,
	},
};

/// Item of the shared response queue.
type Queued = (RequestId, Result<MessageKind, LdapError>);

/// Opens connections with `ldap3`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ldap3Connector;

impl Ldap3Connector {
	/// Name this connector answers to in the `socket.factory` property.
	pub const NAME: &'static str = "ldap3";
}

#[async_trait]
impl Connector for Ldap3Connector {
	fn name(&self) -> &str {
		Self::NAME
	}

	async fn connect(&self, settings: &ConnectionSettings) -> Result<Arc<dyn Session>, Error> {
		let url = settings.url.to_string();
		let conn_settings = settings.to_settings().await?;
		let (conn, mut ldap) = LdapConnAsync::from_url_with_settings(conn_settings, &settings.url)
			.await
			.map_err(|source| Error::Connection { url: url.clone(), source })?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("Ldap connection error {err}");
			}
		});

		if settings.authentication == Authentication::Simple {
			let principal = settings.principal.as_deref().unwrap_or_default();
			let credentials = settings.credentials.as_deref().unwrap_or_default();
			let bound = ldap.simple_bind(principal, credentials).await.and_then(LdapResult::success);
			if let Err(source) = bound {
				driver.abort();
				return Err(Error::Connection { url, source });
			}
		}
		debug!("Connected to {url}");

		let (sender, receiver) = mpsc::unbounded_channel();
		Ok(Arc::new(Ldap3Session {
			ldap,
			timeout: settings.operation_timeout,
			driver,
			sender,
			receiver: Mutex::new(receiver),
			outstanding: parking_lot::Mutex::new(HashMap::new()),
		}))
	}
}

/// A bound `ldap3` connection.
pub struct Ldap3Session {
	/// Handle used to issue operations; cloned per operation.
	ldap: ldap3::Ldap,
	/// Per-operation timeout.
	timeout: Option<Duration>,
	/// Task driving the connection.
	driver: JoinHandle<()>,
	/// Sender half of the shared response queue.
	sender: mpsc::UnboundedSender<Queued>,
	/// Receiver half of the shared response queue.
	receiver: Mutex<mpsc::UnboundedReceiver<Queued>>,
	/// Outstanding asynchronous requests and the tasks pumping their
	/// responses into the queue.
	outstanding: parking_lot::Mutex<HashMap<RequestId, JoinHandle<()>>>,
}

impl fmt::Debug for Ldap3Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Ldap3Session")
			.field("timeout", &self.timeout)
			.field("outstanding", &self.outstanding.lock().len())
			.finish_non_exhaustive()
	}
}

impl Ldap3Session {
	/// A handle for one operation, carrying the given controls and timeout.
	fn handle(&self, controls: &[RawControl]) -> ldap3::Ldap {
		let mut ldap = self.ldap.clone();
		if !controls.is_empty() {
			ldap.with_controls(controls.to_vec());
		}
		if let Some(timeout) = self.timeout {
			ldap.with_timeout(timeout);
		}
		ldap
	}

	/// Run a search to completion, collecting entries and references.
	async fn search(
		&self,
		mut ldap: ldap3::Ldap,
		request: &SearchRequest,
	) -> Result<Response, LdapError> {
		ldap.with_search_options(search_options(request));

		let mut adapters: Vec<Box<dyn Adapter<_, _>>> = Vec::new();
		if request.batch_size > 0 {
			let page_size = i32::try_from(request.batch_size).unwrap_or(i32::MAX);
			adapters.push(Box::new(PagedResults::new(page_size)));
		}

		let mut stream = ldap
			.streaming_search_with(
				adapters,
				&request.base,
				request.scope.into(),
				&request.filter,
				request.attributes.clone(),
			)
			.await?;

		let mut entries = Vec::new();
		let mut referrals = Vec::new();
		while let Some(entry) = stream.next().await? {
			if entry.is_ref() {
				referrals.extend(parse_refs(entry.0));
			} else if !entry.is_intermediate() {
				entries.push(SearchEntry::construct(entry));
			}
		}
		let result = stream.finish().await;
		Ok(Response { entries, referrals, result })
	}
}

/// Translate request limits into `ldap3` search options.
fn search_options(request: &SearchRequest) -> SearchOptions {
	// The protocol limit is in whole seconds.
	let time_limit = request.time_limit.div_ceil(1000);
	SearchOptions::new()
		.deref(request.deref.into())
		.typesonly(request.types_only)
		.sizelimit(i32::try_from(request.count_limit).unwrap_or(i32::MAX))
		.timelimit(i32::try_from(time_limit).unwrap_or(i32::MAX))
}

/// Convert a modification into its `ldap3` form.
fn to_mod(modification: &Modification) -> Mod<String> {
	match modification.clone() {
		Modification::Add(attr, values) => Mod::Add(attr, values),
		Modification::Delete(attr, values) => Mod::Delete(attr, values),
		Modification::Replace(attr, values) => Mod::Replace(attr, values),
	}
}

/// Classify an entry read from a persistent search.
fn message_kind(entry: ResultEntry) -> Option<MessageKind> {
	if entry.is_ref() {
		return Some(MessageKind::Reference(parse_refs(entry.0)));
	}
	if entry.is_intermediate() {
		return None;
	}
	let controls = entry.1.iter().map(|Control(_, raw)| raw.clone()).collect();
	Some(MessageKind::Entry { entry: SearchEntry::construct(entry), controls })
}

#[async_trait]
impl Session for Ldap3Session {
	async fn execute(
		&self,
		operation: &Operation,
		controls: &[RawControl],
	) -> Result<Response, LdapError> {
		let mut ldap = self.handle(controls);
		let result = match operation {
			Operation::Search(request) => return self.search(ldap, request).await,
			Operation::Add { dn, attributes } => ldap.add(dn, attributes.clone()).await?,
			Operation::Modify { dn, changes } => {
				ldap.modify(dn, changes.iter().map(to_mod).collect()).await?
			}
			Operation::Delete { dn } => ldap.delete(dn).await?,
			Operation::Rename { dn, new_rdn, new_superior, delete_old_rdn } => {
				ldap.modifydn(dn, new_rdn, *delete_old_rdn, new_superior.as_deref()).await?
			}
		};
		Ok(Response::from_result(result))
	}

	async fn persistent_search(
		&self,
		request: &SearchRequest,
		controls: &[RawControl],
	) -> Result<RequestId, LdapError> {
		let mut ldap = self.ldap.clone();
		ldap.with_controls(controls.to_vec());
		ldap.with_search_options(search_options(request));
		let mut stream = ldap
			.streaming_search(
				&request.base,
				request.scope.into(),
				&request.filter,
				request.attributes.clone(),
			)
			.await?;
		let id = stream.ldap_handle().last_id();

		let sender = self.sender.clone();
		let mut outstanding = self.outstanding.lock();
		let pump = tokio::spawn(async move {
			loop {
				let kind = match stream.next().await {
					Ok(Some(entry)) => match message_kind(entry) {
						Some(kind) => Ok(kind),
						None => continue,
					},
					Ok(None) => Ok(MessageKind::Done(stream.finish().await)),
					Err(err) => Err(err),
				};
				let last = !matches!(kind, Ok(ref kind) if !kind.is_final());
				if sender.send((id, kind)).is_err() || last {
					break;
				}
			}
		});
		outstanding.insert(id, pump);
		Ok(id)
	}

	async fn abandon(&self, id: RequestId) -> Result<(), LdapError> {
		if let Some(pump) = self.outstanding.lock().remove(&id) {
			pump.abort();
		}
		// Wake up a reader waiting on a queue that may now be idle.
		let _ = self.sender.send((id, Ok(MessageKind::Abandoned)));
		self.ldap.clone().abandon(id).await
	}

	async fn next_message(&self) -> Result<Option<Message>, LdapError> {
		let mut receiver = self.receiver.lock().await;
		let queued = if self.outstanding() == 0 {
			receiver.try_recv().ok()
		} else {
			receiver.recv().await
		};
		let Some((id, kind)) = queued else {
			return Ok(None);
		};
		match kind {
			Ok(kind) => {
				if kind.is_final() {
					self.outstanding.lock().remove(&id);
				}
				Ok(Some(Message { id, kind }))
			}
			Err(err) => {
				self.outstanding.lock().remove(&id);
				Err(err)
			}
		}
	}

	fn outstanding(&self) -> usize {
		self.outstanding.lock().len()
	}

	async fn unbind(&self) -> Result<(), LdapError> {
		let pumps: Vec<_> = self.outstanding.lock().drain().map(|(_, pump)| pump).collect();
		for pump in pumps {
			pump.abort();
		}
		let result = self.ldap.clone().unbind().await;
		self.driver.abort();
		result
	}
}
