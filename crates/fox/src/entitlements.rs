//! Entitlements synthesized from a provisioning profile.

use crate::profile::{ProvisioningProfile, APPLICATION_IDENTIFIER_KEY};
use crate::Result;
use plist::{Dictionary, Value};

/// Entitlement key listing the keychain groups the app may access.
pub const KEYCHAIN_ACCESS_GROUPS_KEY: &str = "keychain-access-groups";

/// Build the entitlements plist for signing `bundle_id` with `profile`.
///
/// A wildcard `application-identifier` is made concrete. With
/// `narrow_keychain_groups`, `keychain-access-groups` is reduced to the
/// bundle's own application identifier.
pub fn synthesize(
    profile: &ProvisioningProfile,
    bundle_id: &str,
    narrow_keychain_groups: bool,
) -> Result<Vec<u8>> {
    let app_id = format!("{}.{}", profile.team_id, bundle_id);
    let mut entitlements: Dictionary = profile.entitlements.clone();

    let wildcard = entitlements
        .get(APPLICATION_IDENTIFIER_KEY)
        .and_then(Value::as_string)
        .is_some_and(|id| id.ends_with('*'));
    if wildcard {
        entitlements.insert(
            APPLICATION_IDENTIFIER_KEY.to_string(),
            Value::String(app_id.clone()),
        );
    }

    if narrow_keychain_groups && entitlements.contains_key(KEYCHAIN_ACCESS_GROUPS_KEY) {
        entitlements.insert(
            KEYCHAIN_ACCESS_GROUPS_KEY.to_string(),
            Value::Array(vec![Value::String(app_id)]),
        );
    }

    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, &Value::Dictionary(entitlements))?;
    Ok(buf)
}
