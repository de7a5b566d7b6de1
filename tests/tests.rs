#![allow(
	clippy::dbg_macro,
	clippy::expect_used,
	clippy::missing_docs_in_private_items,
	clippy::print_stderr,
	clippy::print_stdout,
	clippy::unwrap_used
)]
use std::{collections::HashSet, error::Error, sync::Arc, time::Duration};

use ldap_context::{
	config::property, ChangeEvent, ChangeType, ChangeTypes, DirectoryContext, Environment,
	Modification, SearchEntryExt, SearchOptions, SearchScope,
};
use serial_test::serial;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod common;

use common::{
	ldap_add_organizational_unit, ldap_add_user, ldap_connect, ldap_delete_organizational_unit,
	ldap_delete_user, ldap_user_replace_attribute,
};

#[must_use]
pub fn setup_context() -> DirectoryContext {
	let env: Environment = [
		(property::PROVIDER_URL, "ldap://localhost:1389/ou=users,dc=example,dc=org"),
		(property::PRINCIPAL, "cn=admin,dc=example,dc=org"),
		(property::CREDENTIALS, "adminpassword"),
	]
	.into_iter()
	.collect();
	DirectoryContext::new(env).unwrap()
}

fn values(values: &[&str]) -> HashSet<String> {
	values.iter().map(|value| (*value).to_owned()).collect()
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_context_search_test() -> Result<(), Box<dyn Error>> {
	let tracing_filter = EnvFilter::default().add_directive(LevelFilter::DEBUG.into());
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_filter).try_init();

	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_organizational_unit(&mut ldap, "users").await;

	ldap_add_organizational_unit(&mut ldap, "users").await?;
	ldap_add_user(&mut ldap, "user01", "User1").await?;
	ldap_add_user(&mut ldap, "user02", "User2").await?;
	ldap_add_user(&mut ldap, "user03", "User3").await?;

	let context = setup_context();
	let mut results = context
		.search("", "(objectClass=inetOrgPerson)", &SearchOptions::new().attributes(["sn"]))
		.await?;
	results.sort_by(|left, right| left.name.cmp(&right.name));

	assert_eq!(results.len(), 3);
	assert_eq!(results[0].name, "cn=user01");
	assert_eq!(results[0].entry.attr_first("sn"), Some("User1"));
	assert_eq!(results[2].entry.attr_first("sn"), Some("User3"));

	let listed = context.list("").await?;
	assert_eq!(listed.len(), 3);
	assert!(listed[0].object_classes.iter().any(|class| class == "inetOrgPerson"));

	let entry = context.read("cn=user02", Some(&[][..])).await?;
	assert!(entry.attrs.is_empty());

	let limited = context.search("", "", &SearchOptions::new().count_limit(2)).await?;
	assert_eq!(limited.len(), 2);

	context.close().await;
	ldap_delete_user(&mut ldap, "user01").await?;
	ldap_delete_user(&mut ldap, "user02").await?;
	ldap_delete_user(&mut ldap, "user03").await?;
	ldap_delete_organizational_unit(&mut ldap, "users").await?;
	ldap.unbind().await?;

	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_context_update_test() -> Result<(), Box<dyn Error>> {
	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_organizational_unit(&mut ldap, "users").await;
	ldap_add_organizational_unit(&mut ldap, "users").await?;

	let context = setup_context();
	let user = context
		.add(
			"cn=user01",
			vec![
				("objectClass".to_owned(), values(&["inetOrgPerson"])),
				("sn".to_owned(), values(&["User1"])),
			],
		)
		.await?;
	assert_eq!(user.dn(), "cn=user01,ou=users,dc=example,dc=org");

	user.modify("", vec![Modification::Replace("displayName".to_owned(), values(&["MyName1"]))])
		.await?;
	let entry = context.read("cn=user01", Some(&["displayName"][..])).await?;
	assert_eq!(entry.attr_first("displayName"), Some("MyName1"));

	context.rename("cn=user01", "cn=user02").await?;
	assert!(context.lookup("cn=user01").await.is_err());
	let renamed = context.lookup("cn=user02").await?;
	assert_eq!(renamed.read("", None).await?.attr_first("sn"), Some("User1"));

	context.delete("cn=user02").await?;
	assert!(context.read("cn=user02", None).await.is_err());

	renamed.close().await;
	user.close().await;
	context.close().await;
	assert!(!context.connection().is_connected());

	ldap_delete_organizational_unit(&mut ldap, "users").await?;
	ldap.unbind().await?;

	Ok(())
}

#[ignore = "docker"]
#[tokio::test]
#[serial]
async fn ldap_context_subscription_test() -> Result<(), Box<dyn Error>> {
	let mut ldap = ldap_connect().await?;
	let _ = ldap_delete_organizational_unit(&mut ldap, "users").await;
	ldap_add_organizational_unit(&mut ldap, "users").await?;

	let context = setup_context();
	let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<ChangeEvent>();
	let handle = context
		.subscribe(
			"",
			"(objectClass=inetOrgPerson)",
			&SearchOptions::new().scope(SearchScope::Subtree),
			ChangeTypes::ADD | ChangeTypes::MODIFY,
			Arc::new(sender),
		)
		.await?;

	ldap_add_user(&mut ldap, "user01", "User1").await?;
	let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await?.unwrap();
	let ChangeEvent::Changed(event) = event else {
		panic!("Subscription failed: {event:?}");
	};
	assert_eq!(event.change_type, ChangeType::Add);
	assert_eq!(event.new_name.as_deref(), Some("cn=user01"));

	ldap_user_replace_attribute(&mut ldap, "user01", "displayName", "MyNameNew").await?;
	let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv()).await?.unwrap();
	assert!(
		matches!(&event, ChangeEvent::Changed(change) if change.change_type == ChangeType::Modify)
	);

	context.unsubscribe(handle).await?;
	context.close().await;

	ldap_delete_user(&mut ldap, "user01").await?;
	ldap_delete_organizational_unit(&mut ldap, "users").await?;
	ldap.unbind().await?;

	Ok(())
}
