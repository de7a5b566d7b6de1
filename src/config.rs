//! Config for the directory client, read from an [`Environment`].
use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use rustls::{ClientConfig, RootCertStore, SupportedCipherSuite};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{env::Environment, error::Error, protocol::SearchScope};

/// Names of the environment properties understood by this crate.
pub mod property {
	/// URL of the directory server, e.g. `ldap://localhost:389/dc=example`.
	/// The path, if any, becomes the DN of the root context.
	pub const PROVIDER_URL: &str = "provider.url";
	/// `ssl` to connect with TLS on a dedicated port; unset for plain.
	pub const SECURITY_PROTOCOL: &str = "security.protocol";
	/// `none` or `simple`.
	pub const AUTHENTICATION: &str = "security.authentication";
	/// DN to bind as.
	pub const PRINCIPAL: &str = "security.principal";
	/// Password to bind with.
	pub const CREDENTIALS: &str = "security.credentials";
	/// Name of the connector that must be used to open connections.
	pub const SOCKET_FACTORY: &str = "socket.factory";
	/// Comma separated list of TLS cipher suite names.
	pub const CIPHER_SUITES: &str = "tls.cipher_suites";
	/// LDAP protocol version, defaults to 3.
	pub const VERSION: &str = "ldap.version";
	/// Page size for searches; enables the simple paged results control.
	pub const BATCH_SIZE: &str = "batch.size";
	/// Server side time limit of searches, in milliseconds.
	pub const TIME_LIMIT: &str = "time.limit";
	/// Maximum number of search results.
	pub const COUNT_LIMIT: &str = "count.limit";
	/// `never`, `searching`, `finding` or `always`.
	pub const DEREF_ALIASES: &str = "deref.aliases";
	/// `follow`, `throw` or `ignore`.
	pub const REFERRAL: &str = "referral";
	/// Maximum number of referral hops followed for one operation.
	pub const REFERRAL_LIMIT: &str = "referral.limit";
	/// Return attribute names only, without values.
	pub const TYPES_ONLY: &str = "types.only";
	/// Remove the old RDN value when renaming, defaults to `true`.
	pub const DELETE_OLD_RDN: &str = "rename.delete_old_rdn";
	/// Timeout to establish a connection, in seconds.
	pub const CONNECT_TIMEOUT: &str = "connect.timeout";
	/// Timeout of a single operation, in seconds.
	pub const OPERATION_TIMEOUT: &str = "operation.timeout";
	/// Use the StartTLS extended operation on a plain connection.
	pub const STARTTLS: &str = "tls.starttls";
	/// Disable verification of TLS certificates.
	pub const NO_TLS_VERIFY: &str = "tls.no_verify";
	/// Path of a PEM file holding the trusted root certificates.
	pub const ROOT_CERTIFICATES: &str = "tls.root_certificates";
}

/// Provider URL used when none is configured.
pub const DEFAULT_PROVIDER_URL: &str = "ldap://localhost:389";

/// Default number of referral hops followed.
const DEFAULT_REFERRAL_LIMIT: u32 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT: u64 = 5;

/// How referrals returned by the server are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralMode {
	/// Chase referrals automatically, binding with the configured credentials.
	Follow,
	/// Surface referrals as [`Error::ReferralRequired`].
	Throw,
	/// Ask the server to treat referral objects as plain entries.
	#[default]
	Ignore,
}

impl FromStr for ReferralMode {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"follow" => Ok(Self::Follow),
			"throw" => Ok(Self::Throw),
			"ignore" => Ok(Self::Ignore),
			_ => Err(()),
		}
	}
}

/// How aliases are dereferenced during searches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerefAliases {
	/// Never dereference.
	Never,
	/// Dereference while searching below the base.
	Searching,
	/// Dereference when locating the base.
	Finding,
	/// Always dereference.
	#[default]
	Always,
}

impl FromStr for DerefAliases {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"never" => Ok(Self::Never),
			"searching" => Ok(Self::Searching),
			"finding" => Ok(Self::Finding),
			"always" => Ok(Self::Always),
			_ => Err(()),
		}
	}
}

impl From<DerefAliases> for ldap3::DerefAliases {
	fn from(deref: DerefAliases) -> Self {
		match deref {
			DerefAliases::Never => Self::Never,
			DerefAliases::Searching => Self::Searching,
			DerefAliases::Finding => Self::Finding,
			DerefAliases::Always => Self::Always,
		}
	}
}

/// Authentication performed after connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authentication {
	/// Anonymous, no bind request is sent.
	None,
	/// Simple bind with principal and credentials.
	Simple,
}

impl FromStr for Authentication {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"none" => Ok(Self::None),
			"simple" => Ok(Self::Simple),
			_ => Err(()),
		}
	}
}

/// Configuration for how to connect to the directory server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionSettings {
	/// The URL to connect to, with the scheme already adjusted for the
	/// security protocol.
	pub url: Url,
	/// Authentication to perform once connected.
	pub authentication: Authentication,
	/// DN to bind as.
	pub principal: Option<String>,
	/// Password to bind with.
	pub credentials: Option<String>,
	/// Name of the connector that must be used, if any.
	pub socket_factory: Option<String>,
	/// Restrict TLS to these cipher suites. Empty means the defaults.
	pub cipher_suites: Vec<String>,
	/// LDAP protocol version.
	pub version: u8,
	/// Referral handling, fixed for the lifetime of a connection.
	pub referral: ReferralMode,
	/// Maximum number of referral hops.
	pub referral_limit: u32,
	/// Timeout to establish a connection.
	pub connect_timeout: Duration,
	/// Timeout of individual operations.
	pub operation_timeout: Option<Duration>,
	/// TLS config
	pub tls: TlsConfig,
}

/// TLS Configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
	/// Use StartTLS extended operation for establishing a secure connection,
	/// rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates
	pub no_tls_verify: bool,

	/// TLS root certificates path
	pub root_certificates_path: Option<PathBuf>,
}

impl ConnectionSettings {
	/// Read connection settings from an environment.
	pub fn from_env(env: &Environment) -> Result<Self, Error> {
		let raw_url = env.get(property::PROVIDER_URL).unwrap_or(DEFAULT_PROVIDER_URL);
		let mut url =
			Url::parse(raw_url).map_err(|_| Error::invalid_config(property::PROVIDER_URL, raw_url))?;
		if !matches!(url.scheme(), "ldap" | "ldaps" | "ldapi") {
			return Err(Error::invalid_config(property::PROVIDER_URL, raw_url));
		}

		match env.get(property::SECURITY_PROTOCOL).map(str::trim) {
			None | Some("") => {}
			Some(protocol) if protocol.eq_ignore_ascii_case("ssl") => {
				if url.scheme() == "ldap" {
					url.set_scheme("ldaps")
						.map_err(|()| Error::invalid_config(property::PROVIDER_URL, raw_url))?;
				}
			}
			Some(protocol) => {
				return Err(Error::invalid_config(property::SECURITY_PROTOCOL, protocol));
			}
		}

		let principal = env.get(property::PRINCIPAL).map(str::to_owned);
		let credentials = env.get(property::CREDENTIALS).map(str::to_owned);
		let authentication = env.parse(property::AUTHENTICATION)?.unwrap_or(if principal.is_some() {
			Authentication::Simple
		} else {
			Authentication::None
		});

		let version = env.parse::<u8>(property::VERSION)?.unwrap_or(3);
		if version != 3 {
			return Err(Error::invalid_config(property::VERSION, version.to_string()));
		}

		let cipher_suites = env
			.get(property::CIPHER_SUITES)
			.map(|suites| {
				suites
					.split(',')
					.map(str::trim)
					.filter(|suite| !suite.is_empty())
					.map(str::to_owned)
					.collect()
			})
			.unwrap_or_default();

		Ok(Self {
			url,
			authentication,
			principal,
			credentials,
			socket_factory: env.get(property::SOCKET_FACTORY).map(str::to_owned),
			cipher_suites,
			version,
			referral: env.parse(property::REFERRAL)?.unwrap_or_default(),
			referral_limit: env
				.parse(property::REFERRAL_LIMIT)?
				.unwrap_or(DEFAULT_REFERRAL_LIMIT),
			connect_timeout: Duration::from_secs(
				env.parse(property::CONNECT_TIMEOUT)?.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
			),
			operation_timeout: env.parse(property::OPERATION_TIMEOUT)?.map(Duration::from_secs),
			tls: TlsConfig {
				starttls: env.parse_bool(property::STARTTLS)?.unwrap_or(false),
				no_tls_verify: env.parse_bool(property::NO_TLS_VERIFY)?.unwrap_or(false),
				root_certificates_path: env.get(property::ROOT_CERTIFICATES).map(PathBuf::from),
			},
		})
	}

	/// Whether credentials were supplied for binding.
	#[must_use]
	pub fn has_credentials(&self) -> bool {
		self.principal.is_some() && self.credentials.is_some()
	}

	/// Create a [`LdapConnSettings`] based on these settings
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(self.connect_timeout);
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if self.tls.root_certificates_path.is_some() || !self.cipher_suites.is_empty() {
			if self.tls.no_tls_verify {
				return Err(Error::invalid_config(property::NO_TLS_VERIFY, "true"));
			}
			settings = settings.set_config(Arc::new(self.client_config().await?));
		}
		Ok(settings)
	}

	/// Build a rustls client config from the configured root certificates and
	/// cipher suites.
	async fn client_config(&self) -> Result<ClientConfig, Error> {
		let Some(path) = &self.tls.root_certificates_path else {
			return Err(Error::invalid_config(property::CIPHER_SUITES, self.cipher_suites.join(",")));
		};

		let pem = tokio::fs::read(path).await?;
		let certificates = rustls_pemfile::certs(&mut pem.as_slice())?;
		let mut roots = RootCertStore::empty();
		let (added, _ignored) = roots.add_parsable_certificates(&certificates);
		if added == 0 {
			return Err(Error::invalid_config(
				property::ROOT_CERTIFICATES,
				path.display().to_string(),
			));
		}

		let suites = self.selected_cipher_suites()?;
		let config = ClientConfig::builder()
			.with_cipher_suites(&suites)
			.with_safe_default_kx_groups()
			.with_safe_default_protocol_versions()
			.map_err(|_| Error::invalid_config(property::CIPHER_SUITES, self.cipher_suites.join(",")))?
			.with_root_certificates(roots)
			.with_no_client_auth();
		Ok(config)
	}

	/// Resolve the configured cipher suite names against the suites rustls
	/// supports.
	fn selected_cipher_suites(&self) -> Result<Vec<SupportedCipherSuite>, Error> {
		if self.cipher_suites.is_empty() {
			return Ok(rustls::DEFAULT_CIPHER_SUITES.to_vec());
		}
		self.cipher_suites
			.iter()
			.map(|name| {
				rustls::ALL_CIPHER_SUITES
					.iter()
					.find(|suite| format!("{:?}", suite.suite()).eq_ignore_ascii_case(name))
					.copied()
					.ok_or_else(|| Error::invalid_config(property::CIPHER_SUITES, name.as_str()))
			})
			.collect()
	}
}

/// Defaults applied to searches issued through a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchControls {
	/// Search scope.
	pub scope: SearchScope,
	/// Maximum number of entries to return, 0 for no limit.
	pub count_limit: u32,
	/// Server side time limit in milliseconds, 0 for no limit.
	pub time_limit: u32,
	/// Attributes to return. `None` returns all user attributes, an empty list
	/// returns none.
	pub attributes: Option<Vec<String>>,
	/// Attach a context bound to each returned entry.
	pub return_objects: bool,
	/// Alias dereferencing.
	pub deref: DerefAliases,
	/// Return attribute names without values.
	pub types_only: bool,
	/// Page size, 0 disables paging.
	pub batch_size: u32,
}

impl Default for SearchControls {
	fn default() -> Self {
		Self {
			scope: SearchScope::OneLevel,
			count_limit: 0,
			time_limit: 0,
			attributes: None,
			return_objects: false,
			deref: DerefAliases::default(),
			types_only: false,
			batch_size: 0,
		}
	}
}

impl SearchControls {
	/// Read search defaults from an environment.
	pub fn from_env(env: &Environment) -> Result<Self, Error> {
		Ok(Self {
			count_limit: env.parse(property::COUNT_LIMIT)?.unwrap_or(0),
			time_limit: env.parse(property::TIME_LIMIT)?.unwrap_or(0),
			deref: env.parse(property::DEREF_ALIASES)?.unwrap_or_default(),
			types_only: env.parse_bool(property::TYPES_ONLY)?.unwrap_or(false),
			batch_size: env.parse(property::BATCH_SIZE)?.unwrap_or(0),
			..Self::default()
		})
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used, clippy::expect_used, clippy::items_after_statements)]

	use std::{io::ErrorKind, path::PathBuf};

	use super::{property, Authentication, ConnectionSettings, ReferralMode, SearchControls};
	use crate::{config::DerefAliases, env::Environment, error::Error};

	#[test]
	fn defaults() -> Result<(), Box<dyn std::error::Error>> {
		let settings = ConnectionSettings::from_env(&Environment::new())?;
		assert_eq!(settings.url.as_str(), "ldap://localhost:389");
		assert_eq!(settings.authentication, Authentication::None);
		assert_eq!(settings.referral, ReferralMode::Ignore);
		assert_eq!(settings.referral_limit, 10);
		assert_eq!(settings.version, 3);

		assert_eq!(SearchControls::from_env(&Environment::new())?, SearchControls::default());
		Ok(())
	}

	#[test]
	fn ssl_switches_scheme() -> Result<(), Box<dyn std::error::Error>> {
		let env: Environment = [
			(property::PROVIDER_URL, "ldap://example.org:636/dc=example"),
			(property::SECURITY_PROTOCOL, "ssl"),
			(property::PRINCIPAL, "cn=admin"),
			(property::REFERRAL, "Throw"),
		]
		.into_iter()
		.collect();

		let settings = ConnectionSettings::from_env(&env)?;
		assert_eq!(settings.url.scheme(), "ldaps");
		assert_eq!(settings.authentication, Authentication::Simple);
		assert_eq!(settings.referral, ReferralMode::Throw);
		assert!(!settings.has_credentials());
		Ok(())
	}

	#[test]
	fn invalid_values_name_the_property() {
		let cases = [
			(property::PROVIDER_URL, "http://example.org"),
			(property::SECURITY_PROTOCOL, "tls"),
			(property::REFERRAL, "chase"),
			(property::VERSION, "2"),
			(property::REFERRAL_LIMIT, "-1"),
			(property::STARTTLS, "maybe"),
		];
		for (name, value) in cases {
			let env: Environment = [(name, value)].into_iter().collect();
			match ConnectionSettings::from_env(&env) {
				Err(Error::InvalidConfigValue { name: reported, .. }) => assert_eq!(reported, name),
				other => panic!("{name}={value} should be rejected, got {other:?}"),
			}
		}
	}

	#[test]
	fn search_controls_from_env() -> Result<(), Box<dyn std::error::Error>> {
		let env: Environment = [
			(property::COUNT_LIMIT, "50"),
			(property::TIME_LIMIT, "2000"),
			(property::DEREF_ALIASES, "finding"),
			(property::BATCH_SIZE, "100"),
		]
		.into_iter()
		.collect();
		let controls = SearchControls::from_env(&env)?;
		assert_eq!(controls.count_limit, 50);
		assert_eq!(controls.time_limit, 2000);
		assert_eq!(controls.deref, DerefAliases::Finding);
		assert_eq!(controls.batch_size, 100);

		let env: Environment = [(property::DEREF_ALIASES, "sometimes")].into_iter().collect();
		assert!(matches!(
			SearchControls::from_env(&env),
			Err(Error::InvalidConfigValue { name, .. }) if name == property::DEREF_ALIASES
		));
		Ok(())
	}

	#[tokio::test]
	async fn test_tls_config() -> Result<(), Box<dyn std::error::Error>> {
		// invalid path test
		let env: Environment = [(property::ROOT_CERTIFICATES, "invalid_path")].into_iter().collect();
		let settings = ConnectionSettings::from_env(&env)?;
		assert!(matches!(
			settings.to_settings().await.err().unwrap(),
			Error::Io(io_err) if io_err.kind() == ErrorKind::NotFound
		));

		// not a certificate
		let mut settings = settings;
		settings.tls.root_certificates_path = Some(PathBuf::from("src/config.rs"));
		assert!(matches!(
			settings.to_settings().await.err().unwrap(),
			Error::InvalidConfigValue { name, .. } if name == property::ROOT_CERTIFICATES
		));

		// cipher suites need a trust store
		let env: Environment =
			[(property::CIPHER_SUITES, "TLS13_AES_128_GCM_SHA256")].into_iter().collect();
		let settings = ConnectionSettings::from_env(&env)?;
		assert!(matches!(
			settings.to_settings().await.err().unwrap(),
			Error::InvalidConfigValue { name, .. } if name == property::CIPHER_SUITES
		));

		Ok(())
	}
}
