//! Key naming for everything the inbox keeps in local storage.

/// Namespace prefix shared by all exported key bundles.
pub const KEY_BUNDLE_NAMESPACE: &str = "xmtp";

/// Builds the storage key for a key bundle exported on `env` for `address`.
///
/// Returns `None` when the address is blank, so callers never read or wipe a
/// bundle under a half-formed key.
pub fn key_bundle_key(env: &str, address: &str) -> Option<String> {
    let address = address.trim();
    if address.is_empty() {
        return None;
    }

    Some(format!("{KEY_BUNDLE_NAMESPACE}:{env}:keys:{address}"))
}

/// Plain (un-namespaced) keys for UI preference flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreferenceKey {
    IsOnNetwork,
    IsConnected,
    ActiveTab,
}

impl PreferenceKey {
    pub const ALL: [PreferenceKey; 3] = [Self::IsOnNetwork, Self::IsConnected, Self::ActiveTab];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IsOnNetwork => "isOnNetwork",
            Self::IsConnected => "isConnected",
            Self::ActiveTab => "@activeTab",
        }
    }
}

impl std::fmt::Display for PreferenceKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Encodes a boolean flag the way the stored preferences expect it.
pub fn encode_flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Decodes a stored flag; anything other than `"true"` reads as unset.
pub fn decode_flag(raw: Option<&str>) -> bool {
    matches!(raw.map(str::trim), Some("true"))
}
