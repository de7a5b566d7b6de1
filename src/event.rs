//! Change notification over persistent searches.
//!
//! Any number of subscriptions are mapped onto as few persistent searches as
//! possible: subscriptions with the same base, scope, filter, attribute set and
//! change types share one request. A single background task reads the shared
//! response queue of the connection and dispatches decoded changes to the
//! listeners of the matching request.
//!
//! Listeners are always invoked without any lock held, so a listener may
//! subscribe or unsubscribe from within its callback.
use std::{collections::HashMap, fmt, ops::BitOr, sync::Arc};

use ldap3::{controls::RawControl, SearchEntry};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::{
	control::{self, EntryChange},
	error::{Error, RC_REFERRAL},
	name,
	protocol::{
		wire_attributes, Message, MessageKind, RequestId, SearchRequest, SearchScope, Session,
	},
};

/// Kind of change reported for an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
	/// The entry was added.
	Add,
	/// The entry was deleted.
	Delete,
	/// Attributes of the entry were modified.
	Modify,
	/// The entry was renamed or moved.
	Rename,
}

impl ChangeType {
	/// Bit of this change type in the persistent search control.
	#[must_use]
	pub const fn bit(self) -> u8 {
		match self {
			Self::Add => 1,
			Self::Delete => 2,
			Self::Modify => 4,
			Self::Rename => 8,
		}
	}

	/// Change type for a bit value.
	#[must_use]
	pub const fn from_bit(bit: u8) -> Option<Self> {
		match bit {
			1 => Some(Self::Add),
			2 => Some(Self::Delete),
			4 => Some(Self::Modify),
			8 => Some(Self::Rename),
			_ => None,
		}
	}
}

/// Set of change types a subscription is interested in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChangeTypes(u8);

impl ChangeTypes {
	/// Additions.
	pub const ADD: Self = Self(ChangeType::Add.bit());
	/// Deletions.
	pub const DELETE: Self = Self(ChangeType::Delete.bit());
	/// Modifications.
	pub const MODIFY: Self = Self(ChangeType::Modify.bit());
	/// Renames.
	pub const RENAME: Self = Self(ChangeType::Rename.bit());
	/// Every kind of change.
	pub const ALL: Self = Self(0x0f);

	/// The raw bitmask.
	#[must_use]
	pub const fn bits(self) -> u8 {
		self.0
	}

	/// Whether `change` is part of the set.
	#[must_use]
	pub const fn contains(self, change: ChangeType) -> bool {
		self.0 & change.bit() != 0
	}
}

impl BitOr for ChangeTypes {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

impl From<ChangeType> for ChangeTypes {
	fn from(change: ChangeType) -> Self {
		Self(change.bit())
	}
}

/// A change to an entry.
#[derive(Clone, Debug)]
pub struct NamingEvent {
	/// What happened.
	pub change_type: ChangeType,
	/// Name of the entry before the change, relative to the subscribing
	/// context. Absent for additions.
	pub old_name: Option<String>,
	/// Name of the entry after the change, relative to the subscribing
	/// context. Absent for deletions, and for renames that moved the entry out
	/// of the context.
	pub new_name: Option<String>,
	/// The entry as returned with the notification.
	pub entry: SearchEntry,
	/// Change log number, if the server provided one.
	pub change_number: Option<i64>,
}

/// A failure reported to the listeners of a subscription.
#[derive(Clone, Debug)]
pub struct NamingErrorEvent {
	/// LDAP result code, if the failure came from the server.
	pub code: Option<u32>,
	/// Description of the failure.
	pub message: String,
}

/// Event delivered to a [`ChangeListener`].
#[derive(Clone, Debug)]
pub enum ChangeEvent {
	/// An entry changed.
	Changed(NamingEvent),
	/// The subscription failed. No further changes may arrive for it.
	Error(NamingErrorEvent),
}

/// Receiver of change events.
pub trait ChangeListener: Send + Sync {
	/// Called for every event of the subscriptions the listener is registered
	/// with, in the order the server reported the changes.
	fn on_event(&self, event: &ChangeEvent);
}

impl ChangeListener for mpsc::UnboundedSender<ChangeEvent> {
	fn on_event(&self, event: &ChangeEvent) {
		if self.send(event.clone()).is_err() {
			debug!("Change listener channel closed");
		}
	}
}

impl ChangeListener for mpsc::Sender<ChangeEvent> {
	fn on_event(&self, event: &ChangeEvent) {
		if let Err(err) = self.try_send(event.clone()) {
			warn!("Dropping change event: {err}");
		}
	}
}

/// Identifies a subscription for [`ChangeNotificationService::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

/// Parameters of a subscription.
#[derive(Clone, Debug)]
pub struct Subscription {
	/// Absolute DN of the search base.
	pub base: String,
	/// Search scope.
	pub scope: SearchScope,
	/// Filter in string form.
	pub filter: String,
	/// Attributes to return with each change; `None` for all.
	pub attributes: Option<Vec<String>>,
	/// Changes to be notified of.
	pub change_types: ChangeTypes,
	/// DN of the subscribing context; event names are relative to it.
	pub context_dn: String,
}

/// Parameters two subscriptions must share to be served by one request.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EventKey {
	/// Normalized base DN.
	base: String,
	/// Search scope.
	scope: SearchScope,
	/// Filter, verbatim.
	filter: String,
	/// Sorted, lowercased attribute names; `None` for all.
	attributes: Option<Vec<String>>,
	/// Requested change types.
	change_types: ChangeTypes,
}

impl EventKey {
	/// Key of a subscription.
	fn new(subscription: &Subscription) -> Result<Self, Error> {
		let attributes = subscription.attributes.as_ref().map(|attributes| {
			let mut attributes: Vec<String> =
				attributes.iter().map(|attribute| attribute.to_lowercase()).collect();
			attributes.sort();
			attributes.dedup();
			attributes
		});
		Ok(Self {
			base: name::normalize(&subscription.base)?,
			scope: subscription.scope,
			filter: subscription.filter.trim().to_owned(),
			attributes,
			change_types: subscription.change_types,
		})
	}
}

/// A listener attached to an [`EventEntry`].
#[derive(Clone)]
struct Registration {
	/// Handle returned to the subscriber.
	handle: SubscriptionHandle,
	/// The listener.
	listener: Arc<dyn ChangeListener>,
	/// DN names in events are made relative to.
	context_dn: String,
}

/// One persistent search and the listeners sharing it.
struct EventEntry {
	/// Coalescing key.
	key: EventKey,
	/// Registered listeners, in subscription order.
	registrations: Vec<Registration>,
}

/// Mutable state of the service.
#[derive(Default)]
struct State {
	/// Entries keyed by the request id of their persistent search.
	entries: HashMap<RequestId, EventEntry>,
	/// Request id serving each handle.
	handles: HashMap<SubscriptionHandle, RequestId>,
	/// The session requests are issued on.
	session: Option<Arc<dyn Session>>,
	/// Whether the dispatch task is running.
	running: bool,
	/// Next handle value.
	next_handle: u64,
}

/// Shared part of the service, also owned by the dispatch task.
struct Inner {
	/// Provider URL of the connection, for error reporting.
	url: String,
	/// All mutable state, behind one lock.
	state: Mutex<State>,
}

/// Multiplexes subscriptions onto persistent searches of one connection.
#[derive(Clone)]
pub struct ChangeNotificationService {
	/// Shared state.
	inner: Arc<Inner>,
}

impl fmt::Debug for ChangeNotificationService {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ChangeNotificationService")
			.field("url", &self.inner.url)
			.finish_non_exhaustive()
	}
}

impl ChangeNotificationService {
	/// Create a service without any subscriptions for the connection to
	/// `url`.
	#[must_use]
	pub fn new(url: impl Into<String>) -> Self {
		Self { inner: Arc::new(Inner { url: url.into(), state: Mutex::default() }) }
	}

	/// Register `listener` for changes matching `subscription`, issuing a new
	/// persistent search on `session` only if no existing one matches.
	pub async fn subscribe(
		&self,
		session: Arc<dyn Session>,
		subscription: Subscription,
		listener: Arc<dyn ChangeListener>,
		controls: &[RawControl],
	) -> Result<SubscriptionHandle, Error> {
		let key = EventKey::new(&subscription)?;
		let mut state = self.inner.state.lock().await;
		let session = state.session.get_or_insert(session).clone();

		let existing =
			state.entries.iter().find(|(_, entry)| entry.key == key).map(|(id, _)| *id);
		let id = match existing {
			Some(id) => id,
			None => {
				let request = SearchRequest {
					base: subscription.base.clone(),
					scope: subscription.scope,
					filter: subscription.filter.clone(),
					attributes: wire_attributes(subscription.attributes.as_deref()),
					types_only: false,
					count_limit: 0,
					time_limit: 0,
					deref: crate::config::DerefAliases::default(),
					batch_size: 0,
				};
				let mut request_controls = controls.to_vec();
				request_controls.push(control::persistent_search(subscription.change_types, true));
				let id = session
					.persistent_search(&request, &request_controls)
					.await
					.map_err(|source| Error::Connection { url: self.inner.url.clone(), source })?;
				debug!("Started persistent search {id} on {}", subscription.base);
				state.entries.insert(id, EventEntry { key, registrations: Vec::new() });
				id
			}
		};

		let handle = SubscriptionHandle(state.next_handle);
		state.next_handle += 1;
		state.handles.insert(handle, id);
		if let Some(entry) = state.entries.get_mut(&id) {
			entry.registrations.push(Registration {
				handle,
				listener,
				context_dn: subscription.context_dn,
			});
		}

		if !state.running {
			state.running = true;
			tokio::spawn(self.inner.clone().run(session));
		}
		Ok(handle)
	}

	/// Remove a subscription. The underlying persistent search is abandoned
	/// once its last listener is gone.
	pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), Error> {
		let abandon = {
			let mut state = self.inner.state.lock().await;
			let id = state.handles.remove(&handle).ok_or(Error::ListenerNotFound)?;
			let now_empty = match state.entries.get_mut(&id) {
				Some(entry) => {
					entry.registrations.retain(|registration| registration.handle != handle);
					entry.registrations.is_empty()
				}
				None => false,
			};
			if now_empty {
				state.entries.remove(&id);
				state.session.clone().map(|session| (session, id))
			} else {
				None
			}
		};

		if let Some((session, id)) = abandon {
			debug!("Abandoning persistent search {id}");
			if let Err(err) = session.abandon(id).await {
				warn!("Failed to abandon persistent search {id}: {err}");
			}
		}
		Ok(())
	}

	/// Number of persistent searches currently serving subscriptions.
	pub async fn request_count(&self) -> usize {
		self.inner.state.lock().await.entries.len()
	}

	/// Whether the dispatch task is running.
	pub async fn is_running(&self) -> bool {
		self.inner.state.lock().await.running
	}
}

impl Inner {
	/// The dispatch loop. Runs until no request is outstanding or the
	/// connection fails. A failure drops every entry along with the session,
	/// so later subscriptions start over on a fresh request.
	async fn run(self: Arc<Self>, session: Arc<dyn Session>) {
		loop {
			match session.next_message().await {
				Ok(Some(message)) => self.dispatch(&session, message).await,
				Ok(None) => {
					let mut state = self.state.lock().await;
					// A subscription may have issued a request since the queue
					// reported idle; it did so while holding the lock.
					if session.outstanding() == 0 {
						state.running = false;
						debug!("Change notification queue idle");
						return;
					}
				}
				Err(err) => {
					error!("Change notification connection failed: {err}");
					let registrations: Vec<Registration> = {
						let mut state = self.state.lock().await;
						state.running = false;
						state.session = None;
						state.handles.clear();
						state.entries.drain().flat_map(|(_, entry)| entry.registrations).collect()
					};
					let event = ChangeEvent::Error(NamingErrorEvent {
						code: None,
						message: err.to_string(),
					});
					for registration in registrations {
						registration.listener.on_event(&event);
					}
					return;
				}
			}
		}
	}

	/// Deliver one message to the listeners of its request.
	async fn dispatch(&self, session: &Arc<dyn Session>, message: Message) {
		let Message { id, kind } = message;
		let registrations = {
			let mut state = self.state.lock().await;
			let registrations = if kind.is_final() {
				state.handles.retain(|_, request| *request != id);
				state.entries.remove(&id).map(|entry| {
					debug!("Persistent search {id} finished");
					entry.registrations
				})
			} else {
				state.entries.get(&id).map(|entry| entry.registrations.clone())
			};
			registrations.unwrap_or_default()
		};

		if registrations.is_empty() {
			if !kind.is_final() {
				debug!("Abandoning request {id} without subscribers");
				if let Err(err) = session.abandon(id).await {
					warn!("Failed to abandon request {id}: {err}");
				}
			}
			return;
		}

		let deliveries: Vec<(Arc<dyn ChangeListener>, ChangeEvent)> = match kind {
			MessageKind::Entry { entry, controls } => match EntryChange::find(&controls) {
				Some(Ok(change)) => registrations
					.into_iter()
					.map(|registration| {
						let event = naming_event(&entry, &change, &registration.context_dn);
						(registration.listener, ChangeEvent::Changed(event))
					})
					.collect(),
				Some(Err(err)) => {
					warn!("Undecodable change notification on request {id}: {err}");
					let event = ChangeEvent::Error(NamingErrorEvent {
						code: None,
						message: format!("Undecodable change notification: {err}"),
					});
					registrations
						.into_iter()
						.map(|registration| (registration.listener, event.clone()))
						.collect()
				}
				None => {
					debug!("Ignoring entry without change notification on request {id}");
					Vec::new()
				}
			},
			MessageKind::Done(result) if result.rc != 0 && result.rc != RC_REFERRAL => {
				let event = ChangeEvent::Error(NamingErrorEvent {
					code: Some(result.rc),
					message: result.text,
				});
				registrations
					.into_iter()
					.map(|registration| (registration.listener, event.clone()))
					.collect()
			}
			MessageKind::Reference(_) | MessageKind::Done(_) | MessageKind::Abandoned => {
				Vec::new()
			}
		};

		for (listener, event) in deliveries {
			listener.on_event(&event);
		}
	}
}

/// Build the event for one listener, naming entries relative to its context.
fn naming_event(entry: &SearchEntry, change: &EntryChange, context_dn: &str) -> NamingEvent {
	let current = name::relative_name(context_dn, &entry.dn).ok();
	let (old_name, new_name) = match change.change_type {
		ChangeType::Add => (None, current),
		ChangeType::Delete => (current, None),
		ChangeType::Modify => (current.clone(), current),
		ChangeType::Rename => {
			let previous = change
				.previous_dn
				.as_deref()
				.and_then(|dn| name::relative_name(context_dn, dn).ok());
			(previous, current)
		}
	};
	NamingEvent {
		change_type: change.change_type,
		old_name,
		new_name,
		entry: entry.clone(),
		change_number: change.change_number,
	}
}
