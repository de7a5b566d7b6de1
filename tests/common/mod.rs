#![allow(dead_code)]
use std::{
	collections::{HashMap, HashSet},
	error::Error,
	io,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc,
	},
};

use async_trait::async_trait;
use ldap3::{controls::RawControl, LdapConnAsync, LdapError, LdapResult, SearchEntry};
use ldap_context::{
	config::{property, Authentication, ConnectionSettings},
	control::{EntryChange, MANAGE_DSA_IT_OID},
	name,
	protocol::{
		Connector, Message, MessageKind, Operation, RequestId, Response, SearchRequest, Session,
		NO_ATTRIBUTES,
	},
	ChangeType, DirectoryContext, Environment, SearchScope,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// An operation as received by the mock server.
#[derive(Clone, Debug)]
pub struct Issued {
	/// Host the operation was sent to.
	pub host: String,
	pub operation: Operation,
	pub controls: Vec<RawControl>,
}

type Queued = (RequestId, Result<MessageKind, LdapError>);

/// An in-memory directory shared by every session opened through
/// [`MockConnector`].
#[derive(Debug)]
pub struct MockDirectory {
	pub connects: AtomicUsize,
	pub unbinds: AtomicUsize,
	pub issued: Mutex<Vec<Issued>>,
	/// Bind DNs, in connection order.
	pub principals: Mutex<Vec<Option<String>>>,
	/// Authentication of each connection, in connection order.
	pub authentications: Mutex<Vec<Authentication>>,
	entries: Mutex<Vec<SearchEntry>>,
	/// Hosts answering every operation with a referral to these URLs,
	/// unless ManageDsaIT is sent.
	referrals: Mutex<HashMap<String, Vec<String>>>,
	/// Hosts adding these continuation references to every search.
	references: Mutex<HashMap<String, Vec<String>>>,
	/// Hosts refusing connections.
	unreachable: Mutex<HashSet<String>>,
	pub persistent: Mutex<Vec<(RequestId, SearchRequest, Vec<RawControl>)>>,
	pub abandoned: Mutex<Vec<RequestId>>,
	outstanding: Mutex<HashSet<RequestId>>,
	next_id: AtomicUsize,
	sender: mpsc::UnboundedSender<Queued>,
	receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued>>,
}

impl MockDirectory {
	pub fn new() -> Arc<Self> {
		let (sender, receiver) = mpsc::unbounded_channel();
		Arc::new(Self {
			connects: AtomicUsize::new(0),
			unbinds: AtomicUsize::new(0),
			issued: Mutex::default(),
			principals: Mutex::default(),
			authentications: Mutex::default(),
			entries: Mutex::default(),
			referrals: Mutex::default(),
			references: Mutex::default(),
			unreachable: Mutex::default(),
			persistent: Mutex::default(),
			abandoned: Mutex::default(),
			outstanding: Mutex::default(),
			next_id: AtomicUsize::new(100),
			sender,
			receiver: tokio::sync::Mutex::new(receiver),
		})
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}

	pub fn unbinds(&self) -> usize {
		self.unbinds.load(Ordering::SeqCst)
	}

	pub fn add_entry(&self, dn: &str, attributes: &[(&str, &[&str])]) {
		self.entries.lock().push(entry(dn, attributes));
	}

	pub fn refer(&self, host: &str, urls: &[&str]) {
		self.referrals
			.lock()
			.insert(host.to_owned(), urls.iter().map(|url| (*url).to_owned()).collect());
	}

	pub fn add_references(&self, host: &str, urls: &[&str]) {
		self.references
			.lock()
			.insert(host.to_owned(), urls.iter().map(|url| (*url).to_owned()).collect());
	}

	pub fn set_unreachable(&self, host: &str) {
		self.unreachable.lock().insert(host.to_owned());
	}

	/// Operations issued so far.
	pub fn issued(&self) -> Vec<Issued> {
		self.issued.lock().clone()
	}

	/// The most recently issued operation.
	pub fn last_issued(&self) -> Issued {
		self.issued.lock().last().cloned().expect("no operation issued")
	}

	/// Deliver a change notification for `dn` on request `id`.
	pub fn notify(&self, id: RequestId, dn: &str, change: EntryChange) {
		let kind = MessageKind::Entry { entry: entry(dn, &[]), controls: vec![change.to_control()] };
		let _ = self.sender.send((id, Ok(kind)));
	}

	/// Deliver a raw message on request `id`.
	pub fn deliver(&self, id: RequestId, kind: MessageKind) {
		if kind.is_final() {
			self.outstanding.lock().remove(&id);
		}
		let _ = self.sender.send((id, Ok(kind)));
	}

	/// Fail the connection under request `id`.
	pub fn fail(&self, id: RequestId) {
		let error = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
		let _ = self.sender.send((id, Err(error.into())));
	}

	fn search(&self, host: &str, request: &SearchRequest) -> Response {
		let entries = self
			.entries
			.lock()
			.iter()
			.filter(|entry| in_scope(&request.base, request.scope, &entry.dn))
			.map(|entry| project(entry, &request.attributes))
			.collect();
		let referrals = self.references.lock().get(host).cloned().unwrap_or_default();
		Response { entries, referrals, result: success() }
	}
}

/// Whether `dn` is selected by a search of `base` with `scope`.
fn in_scope(base: &str, scope: SearchScope, dn: &str) -> bool {
	let Ok(relative) = name::relative_name(base, dn) else {
		return false;
	};
	let depth = name::parse(&relative).map(|rdns| rdns.len()).unwrap_or(usize::MAX);
	match scope {
		SearchScope::Object => depth == 0,
		SearchScope::OneLevel => depth == 1,
		SearchScope::Subtree => true,
	}
}

/// Keep only the requested attributes.
fn project(entry: &SearchEntry, attributes: &[String]) -> SearchEntry {
	let mut projected = entry.clone();
	if attributes.iter().any(|attr| attr == NO_ATTRIBUTES) {
		projected.attrs.clear();
	} else if !attributes.iter().any(|attr| attr == "*") {
		projected
			.attrs
			.retain(|name, _| attributes.iter().any(|attr| attr.eq_ignore_ascii_case(name)));
	}
	projected
}

pub fn entry(dn: &str, attributes: &[(&str, &[&str])]) -> SearchEntry {
	SearchEntry {
		dn: dn.to_owned(),
		attrs: attributes
			.iter()
			.map(|(name, values)| {
				((*name).to_owned(), values.iter().map(|value| (*value).to_owned()).collect())
			})
			.collect(),
		bin_attrs: HashMap::new(),
	}
}

pub fn success() -> LdapResult {
	result(0, Vec::new())
}

pub fn result(rc: u32, refs: Vec<String>) -> LdapResult {
	LdapResult { rc, matched: String::new(), text: String::new(), refs, ctrls: Vec::new() }
}

/// Connects to [`MockDirectory`].
#[derive(Debug, Clone)]
pub struct MockConnector {
	pub directory: Arc<MockDirectory>,
}

#[async_trait]
impl Connector for MockConnector {
	fn name(&self) -> &str {
		"mock"
	}

	async fn connect(
		&self,
		settings: &ConnectionSettings,
	) -> Result<Arc<dyn Session>, ldap_context::Error> {
		let host = settings.url.host_str().unwrap_or_default().to_owned();
		if self.directory.unreachable.lock().contains(&host) {
			let error = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
			return Err(ldap_context::Error::Connection {
				url: settings.url.to_string(),
				source: error.into(),
			});
		}
		self.directory.connects.fetch_add(1, Ordering::SeqCst);
		self.directory.principals.lock().push(settings.principal.clone());
		self.directory.authentications.lock().push(settings.authentication);
		Ok(Arc::new(MockSession { directory: self.directory.clone(), host }))
	}
}

#[derive(Debug)]
pub struct MockSession {
	directory: Arc<MockDirectory>,
	host: String,
}

#[async_trait]
impl Session for MockSession {
	async fn execute(
		&self,
		operation: &Operation,
		controls: &[RawControl],
	) -> Result<Response, LdapError> {
		let directory = &self.directory;
		directory.issued.lock().push(Issued {
			host: self.host.clone(),
			operation: operation.clone(),
			controls: controls.to_vec(),
		});

		let manage_dsa_it = controls.iter().any(|control| control.ctype == MANAGE_DSA_IT_OID);
		if !manage_dsa_it {
			if let Some(urls) = directory.referrals.lock().get(&self.host) {
				return Ok(Response::from_result(result(10, urls.clone())));
			}
		}

		Ok(match operation {
			Operation::Search(request) => directory.search(&self.host, request),
			Operation::Add { dn, attributes } => {
				let mut added = entry(dn, &[]);
				for (name, values) in attributes {
					added.attrs.insert(name.clone(), values.iter().cloned().collect());
				}
				directory.entries.lock().push(added);
				Response::from_result(success())
			}
			Operation::Delete { dn } => {
				directory.entries.lock().retain(|entry| !entry.dn.eq_ignore_ascii_case(dn));
				Response::from_result(success())
			}
			Operation::Modify { .. } | Operation::Rename { .. } => Response::from_result(success()),
		})
	}

	async fn persistent_search(
		&self,
		request: &SearchRequest,
		controls: &[RawControl],
	) -> Result<RequestId, LdapError> {
		let directory = &self.directory;
		let id = RequestId::try_from(directory.next_id.fetch_add(1, Ordering::SeqCst))
			.unwrap_or(RequestId::MAX);
		directory.outstanding.lock().insert(id);
		directory.persistent.lock().push((id, request.clone(), controls.to_vec()));
		Ok(id)
	}

	async fn abandon(&self, id: RequestId) -> Result<(), LdapError> {
		self.directory.abandoned.lock().push(id);
		self.directory.outstanding.lock().remove(&id);
		let _ = self.directory.sender.send((id, Ok(MessageKind::Abandoned)));
		Ok(())
	}

	async fn next_message(&self) -> Result<Option<Message>, LdapError> {
		let mut receiver = self.directory.receiver.lock().await;
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
					self.directory.outstanding.lock().remove(&id);
				}
				Ok(Some(Message { id, kind }))
			}
			Err(err) => {
				self.directory.outstanding.lock().clear();
				Err(err)
			}
		}
	}

	fn outstanding(&self) -> usize {
		self.directory.outstanding.lock().len()
	}

	async fn unbind(&self) -> Result<(), LdapError> {
		self.directory.unbinds.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

/// A root context on the mock directory.
pub fn mock_context(
	directory: &Arc<MockDirectory>,
	url: &str,
	extra: &[(&str, &str)],
) -> DirectoryContext {
	let mut env: Environment = [(property::PROVIDER_URL, url)].into_iter().collect();
	env.extend(extra.iter().copied());
	DirectoryContext::with_connector(env, Arc::new(MockConnector { directory: directory.clone() }))
		.expect("valid environment")
}

/// A change notification as a server would send it.
pub fn change(change_type: ChangeType, previous_dn: Option<&str>, number: i64) -> EntryChange {
	EntryChange {
		change_type,
		previous_dn: previous_dn.map(str::to_owned),
		change_number: Some(number),
	}
}

pub async fn ldap_add_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("ou={},dc=example,dc=org", ou),
		vec![("objectClass", ["organizationalUnit"].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_delete_organizational_unit(
	ldap: &mut ldap3::Ldap,
	ou: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("ou={},dc=example,dc=org", ou)).await?.success()?;
	Ok(())
}

pub async fn ldap_connect() -> Result<ldap3::Ldap, Box<dyn Error>> {
	let (conn, mut ldap) = LdapConnAsync::new("ldap://localhost:1389").await?;
	let _handle = tokio::spawn(async move {
		if let Err(err) = conn.drive().await {
			panic!("Ldap connection error {err}");
		}
	});
	ldap.simple_bind("cn=admin,dc=example,dc=org", "adminpassword").await?;
	Ok(ldap)
}

pub async fn ldap_delete_user(ldap: &mut ldap3::Ldap, cn: &str) -> Result<(), Box<dyn Error>> {
	ldap.delete(&format!("cn={},ou=users,dc=example,dc=org", cn)).await?.success()?;
	Ok(())
}

pub async fn ldap_add_user(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	sn: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.add(
		&format!("cn={},ou=users,dc=example,dc=org", cn),
		vec![("objectClass", ["inetOrgPerson"].into()), ("sn", [sn].into())],
	)
	.await?
	.success()?;
	Ok(())
}

pub async fn ldap_user_replace_attribute(
	ldap: &mut ldap3::Ldap,
	cn: &str,
	attribute: &str,
	value: &str,
) -> Result<(), Box<dyn Error>> {
	ldap.modify(
		&format!("cn={},ou=users,dc=example,dc=org", cn),
		vec![ldap3::Mod::Replace(attribute, [value].into())],
	)
	.await?
	.success()?;
	Ok(())
}
