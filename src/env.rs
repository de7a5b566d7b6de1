//! Hierarchical copy-on-write property store shared between contexts.
//!
//! An [`Environment`] consists of a private, mutable top layer and an optional
//! chain of frozen layers shared with other environments. [`Environment::fork`]
//! freezes the private layer and hands out a new environment pointing at it, so
//! forking never copies values. Writes always land in the private layer of the
//! environment they are made on, which keeps forks isolated from each other.
use std::{collections::HashMap, str::FromStr, sync::Arc};

use serde::Deserialize;

use crate::error::Error;

/// A frozen layer. `None` values are tombstones hiding older layers.
#[derive(Debug)]
struct Layer {
	/// Values set while this layer was the private layer of some environment.
	values: HashMap<String, Option<String>>,
	/// The next older layer.
	parent: Option<Arc<Layer>>,
}

/// Copy-on-write set of configuration properties.
#[derive(Debug, Default, Deserialize)]
#[serde(from = "HashMap<String, String>")]
pub struct Environment {
	/// Writable layer owned exclusively by this environment.
	local: HashMap<String, Option<String>>,
	/// Shared frozen layers, newest first.
	parent: Option<Arc<Layer>>,
}

impl Environment {
	/// Create an empty environment.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Look up a property. Returns `None` if the property is not present,
	/// which is distinct from it being present with an empty value.
	#[must_use]
	pub fn get(&self, name: &str) -> Option<&str> {
		if let Some(value) = self.local.get(name) {
			return value.as_deref();
		}
		let mut layer = self.parent.as_deref();
		while let Some(current) = layer {
			if let Some(value) = current.values.get(name) {
				return value.as_deref();
			}
			layer = current.parent.as_deref();
		}
		None
	}

	/// Set a property, returning its previous value.
	pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
		let name = name.into();
		let previous = self.get(&name).map(str::to_owned);
		self.local.insert(name, Some(value.into()));
		previous
	}

	/// Remove a property, returning its previous value.
	pub fn remove(&mut self, name: &str) -> Option<String> {
		let previous = self.get(name).map(str::to_owned);
		if self.inherits(name) {
			self.local.insert(name.to_owned(), None);
		} else {
			self.local.remove(name);
		}
		previous
	}

	/// Whether any shared layer mentions `name`.
	fn inherits(&self, name: &str) -> bool {
		let mut layer = self.parent.as_deref();
		while let Some(current) = layer {
			if current.values.contains_key(name) {
				return true;
			}
			layer = current.parent.as_deref();
		}
		false
	}

	/// Resolve every visible property into a flat map.
	#[must_use]
	pub fn snapshot_all(&self) -> HashMap<String, String> {
		let mut layers = Vec::new();
		let mut layer = self.parent.as_deref();
		while let Some(current) = layer {
			layers.push(&current.values);
			layer = current.parent.as_deref();
		}
		layers.reverse();
		layers.push(&self.local);

		let mut all = HashMap::new();
		for values in layers {
			for (name, value) in values {
				match value {
					Some(value) => all.insert(name.clone(), value.clone()),
					None => all.remove(name),
				};
			}
		}
		all
	}

	/// Freeze the private layer and return a new environment sharing it.
	///
	/// Neither environment observes writes made to the other afterwards.
	pub fn fork(&mut self) -> Self {
		if !self.local.is_empty() {
			let values = std::mem::take(&mut self.local);
			self.parent = Some(Arc::new(Layer { values, parent: self.parent.take() }));
		}
		Self { local: HashMap::new(), parent: self.parent.clone() }
	}

	/// Parse a property with [`FromStr`], reporting failures as
	/// [`Error::InvalidConfigValue`].
	pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, Error> {
		self.get(name)
			.map(|value| value.trim().parse().map_err(|_| Error::invalid_config(name, value)))
			.transpose()
	}

	/// Parse a boolean property, accepting `true`/`false` in any case.
	pub fn parse_bool(&self, name: &str) -> Result<Option<bool>, Error> {
		self.get(name)
			.map(|value| match value.trim().to_ascii_lowercase().as_str() {
				"true" => Ok(true),
				"false" => Ok(false),
				_ => Err(Error::invalid_config(name, value)),
			})
			.transpose()
	}
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		let mut env = Self::new();
		env.extend(iter);
		env
	}
}

impl<K: Into<String>, V: Into<String>> Extend<(K, V)> for Environment {
	fn extend<I: IntoIterator<Item = (K, V)>>(&mut self, iter: I) {
		for (name, value) in iter {
			self.set(name, value);
		}
	}
}

impl From<HashMap<String, String>> for Environment {
	fn from(values: HashMap<String, String>) -> Self {
		values.into_iter().collect()
	}
}
