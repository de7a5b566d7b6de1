//! Request and response controls used by this crate.
//!
//! `ldap3` transports controls as raw BER values; the persistent search
//! request control and the entry change notification response control
//! (draft-ietf-ldapext-psearch-03) are built and parsed here with the ASN.1
//! structures `ldap3` uses for its own controls.
use bytes::BytesMut;
use ldap3::{
	asn1::{
		parse_tag, parse_uint, write, ASNTag, Boolean, Enumerated, Integer, OctetString, Sequence,
		StructureTag, Tag, TagClass, Types,
	},
	controls::RawControl,
};

use crate::event::{ChangeType, ChangeTypes};

/// OID of the persistent search request control.
pub const PERSISTENT_SEARCH_OID: &str = "2.16.840.1.113730.3.4.3";
/// OID of the entry change notification response control.
pub const ENTRY_CHANGE_OID: &str = "2.16.840.1.113730.3.4.7";
/// OID of the ManageDsaIT control (RFC 3296).
pub const MANAGE_DSA_IT_OID: &str = "2.16.840.1.113730.3.4.2";

/// Errors decoding a control value.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
	/// The value ended prematurely or an element was malformed.
	#[error("Truncated control value")]
	Truncated,
	/// An element had an unexpected universal tag number.
	#[error("Unexpected tag {0}")]
	UnexpectedTag(u64),
	/// The change type is not one of add, delete, modify or rename.
	#[error("Unknown change type {0}")]
	ChangeType(i64),
	/// The previous DN is not valid UTF-8.
	#[error("Previous DN is not valid UTF-8")]
	Utf8,
	/// The control carries no value.
	#[error("Control value missing")]
	Missing,
}

/// The persistent search request control.
#[must_use]
pub fn persistent_search(change_types: ChangeTypes, changes_only: bool) -> RawControl {
	let value = Tag::Sequence(Sequence {
		inner: vec![
			Tag::Integer(Integer { inner: i64::from(change_types.bits()), ..Integer::default() }),
			Tag::Boolean(Boolean { inner: changes_only, ..Boolean::default() }),
			// returnECs: always ask for entry change notifications.
			Tag::Boolean(Boolean { inner: true, ..Boolean::default() }),
		],
		..Sequence::default()
	});
	RawControl { ctype: PERSISTENT_SEARCH_OID.to_owned(), crit: true, val: Some(encode(value)) }
}

/// The ManageDsaIT control, asking the server to return referral objects as
/// plain entries instead of referrals.
#[must_use]
pub fn manage_dsa_it() -> RawControl {
	RawControl { ctype: MANAGE_DSA_IT_OID.to_owned(), crit: true, val: None }
}

/// Decoded entry change notification control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChange {
	/// What happened to the entry.
	pub change_type: ChangeType,
	/// DN of the entry before a rename.
	pub previous_dn: Option<String>,
	/// Server change log number, if provided.
	pub change_number: Option<i64>,
}

impl EntryChange {
	/// Find and decode the entry change notification among `controls`.
	/// Returns `None` if no such control is present.
	#[must_use]
	pub fn find(controls: &[RawControl]) -> Option<Result<Self, DecodeError>> {
		controls.iter().find(|control| control.ctype == ENTRY_CHANGE_OID).map(|control| {
			control.val.as_deref().ok_or(DecodeError::Missing).and_then(Self::decode)
		})
	}

	/// Decode the control value.
	pub fn decode(value: &[u8]) -> Result<Self, DecodeError> {
		let (_, tag) = parse_tag(value).map_err(|_| DecodeError::Truncated)?;
		let mut elements = universal(tag, Types::Sequence)?
			.expect_constructed()
			.ok_or(DecodeError::Truncated)?
			.into_iter()
			.peekable();

		let element = elements.next().ok_or(DecodeError::Truncated)?;
		let raw_type = integer(element, Types::Enumerated)?;
		let change_type = u8::try_from(raw_type)
			.ok()
			.and_then(ChangeType::from_bit)
			.ok_or(DecodeError::ChangeType(raw_type))?;

		let previous_dn = match elements.next_if(|tag| is_universal(tag, Types::OctetString)) {
			Some(element) => {
				let dn = element.expect_primitive().ok_or(DecodeError::Truncated)?;
				Some(String::from_utf8(dn).map_err(|_| DecodeError::Utf8)?)
			}
			None => None,
		};
		let change_number = elements
			.next_if(|tag| is_universal(tag, Types::Integer))
			.map(|element| integer(element, Types::Integer))
			.transpose()?;
		Ok(Self { change_type, previous_dn, change_number })
	}

	/// Encode as a response control, as a server would send it.
	#[must_use]
	pub fn to_control(&self) -> RawControl {
		let mut inner = vec![Tag::Enumerated(Enumerated {
			inner: i64::from(self.change_type.bit()),
			..Enumerated::default()
		})];
		if let Some(dn) = &self.previous_dn {
			inner.push(Tag::OctetString(OctetString {
				inner: dn.as_bytes().to_vec(),
				..OctetString::default()
			}));
		}
		if let Some(number) = self.change_number {
			inner.push(Tag::Integer(Integer { inner: number, ..Integer::default() }));
		}
		let value = Tag::Sequence(Sequence { inner, ..Sequence::default() });
		RawControl { ctype: ENTRY_CHANGE_OID.to_owned(), crit: false, val: Some(encode(value)) }
	}
}

/// BER encoding of a tag.
fn encode(tag: Tag) -> Vec<u8> {
	let mut buf = BytesMut::new();
	// Only the underlying writer can fail, and it writes to memory.
	let _ = write::encode_into(&mut buf, tag.into_structure());
	buf.to_vec()
}

/// Whether `tag` is the universal type `expected`.
fn is_universal(tag: &StructureTag, expected: Types) -> bool {
	tag.class == TagClass::Universal && tag.id == expected as u64
}

/// Check that `tag` is the universal type `expected`.
fn universal(tag: StructureTag, expected: Types) -> Result<StructureTag, DecodeError> {
	if is_universal(&tag, expected) {
		Ok(tag)
	} else {
		Err(DecodeError::UnexpectedTag(tag.id))
	}
}

/// Value of a primitive integer element of type `expected`.
fn integer(tag: StructureTag, expected: Types) -> Result<i64, DecodeError> {
	let bytes = universal(tag, expected)?.expect_primitive().ok_or(DecodeError::Truncated)?;
	if bytes.is_empty() || bytes.len() > 8 {
		return Err(DecodeError::Truncated);
	}
	let (_, value) = parse_uint(&bytes).map_err(|_| DecodeError::Truncated)?;
	i64::try_from(value).map_err(|_| DecodeError::Truncated)
}
