//! Helper methods for extracting data from search results.
use ldap3::SearchEntry;

/// An extension trait for [`SearchEntry`] that provides convenience methods for
/// extracting data.
pub trait SearchEntryExt {
	/// All textual values of an attribute, empty if it is absent.
	///
	/// Attribute names are matched case-insensitively, since servers are free
	/// to return them in a different case than requested.
	fn attr_values(&self, attr: &str) -> &[String];

	/// Get the first value of an attribute. Will return `None` if attribute
	/// value is not valid UTF-8.
	fn attr_first(&self, attr: &str) -> Option<&str> {
		self.attr_values(attr).first().map(String::as_str)
	}

	/// Get the first value of an attribute, in binary form
	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]>;
}

impl SearchEntryExt for SearchEntry {
	fn attr_values(&self, attr: &str) -> &[String] {
		if let Some(values) = self.attrs.get(attr) {
			return values;
		}
		self.attrs
			.iter()
			.find(|(name, _)| name.eq_ignore_ascii_case(attr))
			.map_or(&[], |(_, values)| values.as_slice())
	}

	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		if let Some(value) = self.attr_first(attr) {
			return Some(value.as_bytes());
		}

		if let Some(attr) = self.bin_attrs.get(attr) {
			return attr.first().map(Vec::as_slice);
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use ldap3::SearchEntry;

	use super::SearchEntryExt;

	fn entry() -> SearchEntry {
		SearchEntry {
			dn: String::from("cn=foo,dc=example"),
			attrs: [
				(String::from("name"), vec![String::from("Foo Bar"), String::from("Bar McBaz")]),
				(String::from("objectclass"), vec![String::from("top"), String::from("person")]),
			]
			.into_iter()
			.collect(),
			bin_attrs: [(String::from("photo"), vec![vec![0xff, 0xd8]])].into_iter().collect(),
		}
	}

	#[test]
	fn attr_first() {
		let entry = entry();
		assert_eq!(
			entry.attr_first("attribute_does_not_exist"),
			None,
			"Undefined attributes should return None"
		);
		assert_eq!(entry.attr_first("name"), Some("Foo Bar"), "Should return the first value");
		assert_ne!(entry.attr_first("name"), Some("Bar McBaz"), "Should return the correct value");
	}

	#[test]
	fn attr_values_ignore_case() {
		let entry = entry();
		assert_eq!(entry.attr_values("objectClass"), ["top", "person"]);
		assert!(entry.attr_values("mail").is_empty());
	}

	#[test]
	fn bin_attr_first() {
		let entry = entry();
		assert_eq!(entry.bin_attr_first("photo"), Some(&[0xff, 0xd8][..]));
		assert_eq!(entry.bin_attr_first("name"), Some("Foo Bar".as_bytes()));
		let empty = SearchEntry {
			dn: String::new(),
			attrs: HashMap::default(),
			bin_attrs: HashMap::default(),
		};
		assert_eq!(empty.bin_attr_first("photo"), None);
	}
}
