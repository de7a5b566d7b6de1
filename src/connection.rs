//! A physical connection shared by many contexts.
//!
//! The connection is opened lazily by the first operation and closed when the
//! last context holding a reference releases it.
use std::sync::{
	atomic::{AtomicUsize, Ordering},
	Arc,
};

use ldap3::controls::RawControl;
use tracing::{debug, warn};

use crate::{
	config::{ConnectionSettings, ReferralMode},
	control,
	env::Environment,
	error::Error,
	event::{ChangeListener, ChangeNotificationService, Subscription, SubscriptionHandle},
	protocol::{Connector, Operation, Response, Session},
};

/// An open session and the settings it was opened with.
#[derive(Debug, Clone)]
struct Connected {
	/// The bound session.
	session: Arc<dyn Session>,
	/// Settings read when connecting.
	settings: Arc<ConnectionSettings>,
}

/// One physical connection, reference counted across contexts.
#[derive(Debug)]
pub struct DirectoryConnection {
	/// Opens the session.
	connector: Arc<dyn Connector>,
	/// Environment of the root context the connection was created for.
	env: Environment,
	/// The session, once connected.
	connected: parking_lot::Mutex<Option<Connected>>,
	/// Serializes connection attempts.
	connecting: tokio::sync::Mutex<()>,
	/// Number of contexts holding this connection.
	references: AtomicUsize,
	/// Change notification for this connection.
	notifications: ChangeNotificationService,
}

impl DirectoryConnection {
	/// Create an unconnected connection holding one reference.
	pub(crate) fn new(connector: Arc<dyn Connector>, env: Environment, url: &str) -> Self {
		Self {
			connector,
			env,
			connected: parking_lot::Mutex::new(None),
			connecting: tokio::sync::Mutex::new(()),
			references: AtomicUsize::new(1),
			notifications: ChangeNotificationService::new(url),
		}
	}

	/// The connector used to open sessions.
	pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
		&self.connector
	}

	/// Connect and bind, unless already connected.
	pub async fn connect(&self) -> Result<(), Error> {
		if self.is_connected() {
			return Ok(());
		}
		let _connecting = self.connecting.lock().await;
		if self.is_connected() {
			return Ok(());
		}
		if self.reference_count() == 0 {
			return Err(Error::ContextClosed);
		}

		let settings = ConnectionSettings::from_env(&self.env)?;
		check_socket_factory(&settings, self.connector.as_ref())?;
		debug!("Connecting to {} with {}", settings.url, self.connector.name());
		let session = self.connector.connect(&settings).await?;
		*self.connected.lock() = Some(Connected { session, settings: Arc::new(settings) });

		// The last reference may have been released while connecting.
		if self.reference_count() == 0 {
			let stale = self.connected.lock().take();
			if let Some(connected) = stale {
				disconnect(connected).await;
			}
			return Err(Error::ContextClosed);
		}
		Ok(())
	}

	/// Add a reference for a context sharing this connection.
	pub fn retain(&self) -> Result<(), Error> {
		self.references
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
				(count > 0).then_some(count + 1)
			})
			.map(drop)
			.map_err(|_| Error::ContextClosed)
	}

	/// Drop a reference, disconnecting when it was the last one.
	pub async fn release(&self) {
		if let Some(connected) = self.release_reference() {
			disconnect(connected).await;
		}
	}

	/// Drop a reference without waiting for a disconnect to complete.
	pub(crate) fn release_detached(&self) {
		if let Some(connected) = self.release_reference() {
			match tokio::runtime::Handle::try_current() {
				Ok(runtime) => {
					runtime.spawn(disconnect(connected));
				}
				Err(_) => debug!("No runtime to unbind on, dropping connection"),
			}
		}
	}

	/// Decrement the count, returning the session if it must be closed.
	fn release_reference(&self) -> Option<Connected> {
		let previous = self
			.references
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
			.ok()?;
		if previous == 1 {
			self.connected.lock().take()
		} else {
			None
		}
	}

	/// Whether a session is open.
	#[must_use]
	pub fn is_connected(&self) -> bool {
		self.connected.lock().is_some()
	}

	/// Number of contexts holding this connection.
	#[must_use]
	pub fn reference_count(&self) -> usize {
		self.references.load(Ordering::Acquire)
	}

	/// Settings of the open session.
	pub fn settings(&self) -> Result<Arc<ConnectionSettings>, Error> {
		Ok(self.session()?.settings)
	}

	/// The open session.
	fn session(&self) -> Result<Connected, Error> {
		self.connected.lock().clone().ok_or(Error::NotConnected)
	}

	/// Controls sent with every request on this connection, in addition to
	/// the caller's.
	fn request_controls(settings: &ConnectionSettings, controls: &[RawControl]) -> Vec<RawControl> {
		let mut all = controls.to_vec();
		if settings.referral == ReferralMode::Ignore {
			all.push(control::manage_dsa_it());
		}
		all
	}

	/// Issue an operation. [`connect`](Self::connect) must have been called.
	///
	/// Non-zero result codes are returned in the response, not as errors.
	pub async fn issue(
		&self,
		operation: &Operation,
		controls: &[RawControl],
	) -> Result<Response, Error> {
		let Connected { session, settings } = self.session()?;
		let controls = Self::request_controls(&settings, controls);
		session
			.execute(operation, &controls)
			.await
			.map_err(|source| Error::Connection { url: settings.url.to_string(), source })
	}

	/// Subscribe to changes. [`connect`](Self::connect) must have been called.
	pub async fn subscribe(
		&self,
		subscription: Subscription,
		listener: Arc<dyn ChangeListener>,
	) -> Result<SubscriptionHandle, Error> {
		let Connected { session, settings } = self.session()?;
		let controls = Self::request_controls(&settings, &[]);
		self.notifications.subscribe(session, subscription, listener, &controls).await
	}

	/// Change notification service of this connection.
	#[must_use]
	pub fn notifications(&self) -> &ChangeNotificationService {
		&self.notifications
	}
}

/// Reject connectors other than the one named by `socket.factory`.
pub(crate) fn check_socket_factory(
	settings: &ConnectionSettings,
	connector: &dyn Connector,
) -> Result<(), Error> {
	match settings.socket_factory.as_deref() {
		Some(name) if !name.is_empty() && name != connector.name() => {
			Err(Error::invalid_config(crate::config::property::SOCKET_FACTORY, name))
		}
		_ => Ok(()),
	}
}

/// Unbind, ignoring failures.
async fn disconnect(connected: Connected) {
	debug!("Disconnecting from {}", connected.settings.url);
	if let Err(err) = connected.session.unbind().await {
		warn!("Failed to unbind from {}: {err}", connected.settings.url);
	}
}
