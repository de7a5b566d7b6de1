//! Distinguished name handling: splitting into RDNs, composing relative names
//! with a context's DN and recognizing directory URLs used as names.
use percent_encoding::percent_decode_str;
use url::Url;

use crate::error::Error;

/// Split a DN into its RDN components, leftmost first.
///
/// Commas escaped with a backslash or enclosed in double quotes do not split.
/// Components are trimmed; an empty DN yields no components.
pub fn parse(dn: &str) -> Result<Vec<String>, Error> {
	if dn.trim().is_empty() {
		return Ok(Vec::new());
	}

	let mut rdns = Vec::new();
	let mut current = String::new();
	let mut chars = dn.chars();
	let mut quoted = false;
	while let Some(c) = chars.next() {
		match c {
			'\\' => {
				current.push(c);
				let escaped = chars.next().ok_or_else(|| Error::InvalidName(dn.to_owned()))?;
				current.push(escaped);
			}
			'"' => {
				quoted = !quoted;
				current.push(c);
			}
			',' | ';' if !quoted => {
				rdns.push(finish_rdn(&current, dn)?);
				current.clear();
			}
			_ => current.push(c),
		}
	}
	if quoted {
		return Err(Error::InvalidName(dn.to_owned()));
	}
	rdns.push(finish_rdn(&current, dn)?);
	Ok(rdns)
}

/// Validate and trim a single RDN.
fn finish_rdn(rdn: &str, dn: &str) -> Result<String, Error> {
	let rdn = rdn.trim();
	match rdn.split_once('=') {
		Some((attr, _)) if !attr.trim().is_empty() => Ok(rdn.to_owned()),
		_ => Err(Error::InvalidName(dn.to_owned())),
	}
}

/// Compose a name relative to a context with that context's DN.
///
/// An empty name yields the context DN; an empty context DN yields the name.
#[must_use]
pub fn compose(name: &str, dn: &str) -> String {
	match (name.is_empty(), dn.is_empty()) {
		(true, _) => dn.to_owned(),
		(false, true) => name.to_owned(),
		(false, false) => format!("{name},{dn}"),
	}
}

/// Canonical form of a single RDN for comparisons.
fn normalize_rdn(rdn: &str) -> String {
	match rdn.split_once('=') {
		Some((attr, value)) => {
			format!("{}={}", attr.trim().to_lowercase(), value.trim().to_lowercase())
		}
		None => rdn.trim().to_lowercase(),
	}
}

/// Canonical form of a DN, used to compare DNs written with different
/// spacing or case.
pub fn normalize(dn: &str) -> Result<String, Error> {
	Ok(parse(dn)?.iter().map(|rdn| normalize_rdn(rdn)).collect::<Vec<_>>().join(","))
}

/// Name of `entry` relative to `ancestor`.
///
/// Fails with [`Error::InvalidName`] if `entry` is not `ancestor` or one of its
/// descendants.
pub fn relative_name(ancestor: &str, entry: &str) -> Result<String, Error> {
	let ancestor_rdns = parse(ancestor)?;
	let entry_rdns = parse(entry)?;
	let Some(prefix) = entry_rdns.len().checked_sub(ancestor_rdns.len()) else {
		return Err(Error::InvalidName(format!("{entry} is not under {ancestor}")));
	};
	let under = entry_rdns[prefix..]
		.iter()
		.zip(&ancestor_rdns)
		.all(|(left, right)| normalize_rdn(left) == normalize_rdn(right));
	if !under {
		return Err(Error::InvalidName(format!("{entry} is not under {ancestor}")));
	}
	Ok(entry_rdns[..prefix].join(","))
}

/// Split a DN into its leftmost RDN and the DN of its parent.
pub fn split_leaf(dn: &str) -> Result<(String, String), Error> {
	let mut rdns = parse(dn)?;
	if rdns.is_empty() {
		return Err(Error::InvalidName("the empty DN has no leaf".to_owned()));
	}
	let leaf = rdns.remove(0);
	Ok((leaf, rdns.join(",")))
}

/// A directory URL split into the server part and the DN it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUrl {
	/// `scheme://host[:port]`, suitable as a provider URL.
	pub provider: String,
	/// Percent-decoded DN from the URL path, possibly empty.
	pub dn: String,
}

impl DirectoryUrl {
	/// Parse an `ldap://`, `ldaps://` or `ldapi://` URL.
	pub fn parse(url: &str) -> Result<Self, Error> {
		let parsed = Url::parse(url).map_err(|_| Error::InvalidName(url.to_owned()))?;
		if !matches!(parsed.scheme(), "ldap" | "ldaps" | "ldapi") {
			return Err(Error::InvalidName(url.to_owned()));
		}
		let host = parsed.host_str().unwrap_or("localhost");
		let provider = match parsed.port() {
			Some(port) => format!("{}://{host}:{port}", parsed.scheme()),
			None => format!("{}://{host}", parsed.scheme()),
		};
		let path = parsed.path().trim_start_matches('/');
		let well_formed = path.split('%').skip(1).all(|escape| {
			escape.get(..2).is_some_and(|hex| hex.bytes().all(|byte| byte.is_ascii_hexdigit()))
		});
		if !well_formed {
			return Err(Error::InvalidName(url.to_owned()));
		}
		let dn = percent_decode_str(path)
			.decode_utf8()
			.map_err(|_| Error::InvalidName(url.to_owned()))?
			.into_owned();
		Ok(Self { provider, dn })
	}
}

/// Whether a name passed to an operation is an absolute directory URL rather
/// than a DN relative to the context.
#[must_use]
pub fn is_url(name: &str) -> bool {
	let lower = name.trim_start().to_ascii_lowercase();
	["ldap://", "ldaps://", "ldapi://"].iter().any(|scheme| lower.starts_with(scheme))
}
