use std::fmt;
use std::sync::Arc;

use inbox_storage::{KeyValueStore, PreferenceKey, decode_flag, encode_flag, key_bundle_key};
use snafu::{OptionExt, ResultExt};

use crate::address::Address;
use crate::chat::ConversationTab;
use crate::config::NetworkEnv;
use crate::error::{InboxError, InboxResult, PersistenceFailureSnafu, SdkSnafu, SignerUnavailableSnafu};
use crate::sdk::{
    ClientFactory, ClientOptions, KeyBundle, MessagingClient, NameResolver, SdkError, Signer,
    WalletProvider,
};
use crate::wallet::{EnsNameResolver, LocalSigner, ProviderConfig};

pub enum SessionState {
    Disconnected,
    SignerAttached {
        signer: Arc<dyn Signer>,
    },
    /// `signer` is `None` for identities generated without an external signer.
    NetworkAttached {
        signer: Option<Arc<dyn Signer>>,
        client: Arc<dyn MessagingClient>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    SignerAttached,
    NetworkAttached,
}

impl SessionState {
    pub fn phase(&self) -> SessionPhase {
        match self {
            Self::Disconnected => SessionPhase::Disconnected,
            Self::SignerAttached { .. } => SessionPhase::SignerAttached,
            Self::NetworkAttached { .. } => SessionPhase::NetworkAttached,
        }
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => formatter.write_str("Disconnected"),
            Self::SignerAttached { signer } => formatter
                .debug_struct("SignerAttached")
                .field("address", &signer.address())
                .finish(),
            Self::NetworkAttached { client, .. } => formatter
                .debug_struct("NetworkAttached")
                .field("address", client.address())
                .finish(),
        }
    }
}

/// UI flags cached in local storage between launches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Preferences {
    pub is_on_network: bool,
    pub is_connected: bool,
    pub active_tab: ConversationTab,
}

impl Preferences {
    /// Unreadable entries fall back to their defaults.
    pub fn load(storage: &dyn KeyValueStore) -> Self {
        let read = |key: PreferenceKey| match storage.get_item(key.as_str()) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(key = %key, error = %error, "failed to read preference");
                None
            }
        };

        Self {
            is_on_network: decode_flag(read(PreferenceKey::IsOnNetwork).as_deref()),
            is_connected: decode_flag(read(PreferenceKey::IsConnected).as_deref()),
            active_tab: read(PreferenceKey::ActiveTab)
                .as_deref()
                .and_then(ConversationTab::parse)
                .unwrap_or_default(),
        }
    }
}

/// What a logout managed to clean up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutReport {
    pub address: Option<Address>,
    pub key_bundle_wiped: bool,
    pub failures: Vec<String>,
}

/// Owns the signer and client for one user session, plus the locally cached
/// key bundle and preference flags.
pub struct SessionManager {
    storage: Arc<dyn KeyValueStore>,
    factory: Arc<dyn ClientFactory>,
    wallet: Option<Arc<dyn WalletProvider>>,
    names: Option<Arc<dyn NameResolver>>,
    env: NetworkEnv,
    state: SessionState,
    preferences: Preferences,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        factory: Arc<dyn ClientFactory>,
        env: NetworkEnv,
    ) -> Self {
        let preferences = Preferences::load(storage.as_ref());
        tracing::debug!(?preferences, env = %env, "session preferences loaded");
        Self {
            storage,
            factory,
            wallet: None,
            names: None,
            env,
            state: SessionState::Disconnected,
            preferences,
        }
    }

    pub fn with_wallet_provider(mut self, wallet: Arc<dyn WalletProvider>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn env(&self) -> NetworkEnv {
        self.env
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.phase()
    }

    pub fn preferences(&self) -> Preferences {
        self.preferences
    }

    pub fn client(&self) -> Option<Arc<dyn MessagingClient>> {
        match &self.state {
            SessionState::NetworkAttached { client, .. } => Some(Arc::clone(client)),
            _ => None,
        }
    }

    pub fn signer(&self) -> Option<Arc<dyn Signer>> {
        match &self.state {
            SessionState::SignerAttached { signer } => Some(Arc::clone(signer)),
            SessionState::NetworkAttached { signer, .. } => signer.clone(),
            SessionState::Disconnected => None,
        }
    }

    /// Session address: the client's when connected, else the signer's.
    pub fn address(&self) -> Option<Address> {
        match &self.state {
            SessionState::Disconnected => None,
            SessionState::SignerAttached { signer } => Some(signer.address()),
            SessionState::NetworkAttached { client, .. } => Some(client.address().clone()),
        }
    }

    /// Name provider built by [`Self::restore_from_private_key`], if any.
    pub fn name_resolver(&self) -> Option<Arc<dyn NameResolver>> {
        self.names.clone()
    }

    pub async fn connect_external_signer(&mut self) -> InboxResult<Address> {
        let wallet = self.wallet.as_ref().context(SignerUnavailableSnafu {
            stage: "wallet-provider-missing",
            details: "no wallet provider configured".to_string(),
        })?;

        let signer = wallet
            .request_signer()
            .await
            .map_err(|error| InboxError::SignerUnavailable {
                stage: "wallet-request-signer",
                details: error.to_string(),
            })?
            .context(SignerUnavailableSnafu {
                stage: "wallet-no-signer",
                details: "wallet provider returned no signer".to_string(),
            })?;

        Ok(self.attach_signer(signer))
    }

    pub fn attach_signer(&mut self, signer: Arc<dyn Signer>) -> Address {
        let address = signer.address();
        tracing::info!(address = %address, "signer attached");
        self.state = SessionState::SignerAttached { signer };
        self.set_connected(true);
        address
    }

    /// Generates a throwaway identity and connects it straight away.
    pub async fn create_ephemeral_identity(
        &mut self,
        env: NetworkEnv,
    ) -> InboxResult<Arc<dyn MessagingClient>> {
        let client = self
            .factory
            .create_random(ClientOptions::new(env))
            .await
            .context(SdkSnafu {
                stage: "create-random-client",
            })?;

        tracing::info!(address = %client.address(), env = %env, "ephemeral identity created");
        self.state = SessionState::NetworkAttached {
            signer: None,
            client: Arc::clone(&client),
        };
        self.set_connected(true);
        self.set_on_network(true);
        Ok(client)
    }

    /// Attaches a signer built from a raw secret and installs an ENS resolver
    /// for `provider`.
    pub fn restore_from_private_key(
        &mut self,
        key: &str,
        provider: &ProviderConfig,
    ) -> InboxResult<Address> {
        let signer = LocalSigner::from_private_key(key)?;
        let names = EnsNameResolver::new(provider)?;
        self.names = Some(Arc::new(names));
        Ok(self.attach_signer(Arc::new(signer)))
    }

    /// Restores the client from a cached key bundle, or creates it and caches a
    /// fresh bundle. Both paths end with a consent list refresh.
    pub async fn establish_client(
        &mut self,
        signer: Arc<dyn Signer>,
        env: NetworkEnv,
    ) -> InboxResult<Arc<dyn MessagingClient>> {
        let address = signer.address();
        let options = ClientOptions::new(env);
        let bundle_key = key_bundle_key(env.as_str(), address.as_str());

        let restored = match self.load_key_bundle(bundle_key.as_deref()) {
            Some(bundle) => match self.factory.create_from_key_bundle(bundle, options).await {
                Ok(client) => Some(client),
                Err(SdkError::MalformedKeyBundle { details, .. }) => {
                    tracing::warn!(
                        address = %address,
                        details = %details,
                        "cached key bundle rejected, creating a new client"
                    );
                    None
                }
                Err(source) => {
                    return Err(InboxError::Sdk {
                        stage: "create-client-from-bundle",
                        source,
                    });
                }
            },
            None => None,
        };

        let client = match restored {
            Some(client) => client,
            None => {
                let client = self
                    .factory
                    .create(Arc::clone(&signer), options)
                    .await
                    .context(SdkSnafu {
                        stage: "create-client",
                    })?;
                let bundle = client.export_key_bundle().await.context(SdkSnafu {
                    stage: "export-key-bundle",
                })?;
                self.store_key_bundle(
                    key_bundle_key(env.as_str(), client.address().as_str()).as_deref(),
                    &bundle,
                );
                client
            }
        };

        client.refresh_consent_list().await.context(SdkSnafu {
            stage: "establish-refresh-consent",
        })?;

        tracing::info!(address = %client.address(), env = %env, "client ready");
        self.state = SessionState::NetworkAttached {
            signer: Some(signer),
            client: Arc::clone(&client),
        };
        self.set_on_network(true);
        Ok(client)
    }

    /// "Connect to XMTP": establishes the client for the attached signer.
    /// Without a signer the session is logged out.
    pub async fn connect_to_network(&mut self) -> InboxResult<Arc<dyn MessagingClient>> {
        match &self.state {
            SessionState::NetworkAttached { client, .. } => Ok(Arc::clone(client)),
            SessionState::SignerAttached { signer } => {
                let signer = Arc::clone(signer);
                self.establish_client(signer, self.env).await
            }
            SessionState::Disconnected => {
                self.logout();
                SignerUnavailableSnafu {
                    stage: "connect-without-signer",
                    details: "no signer attached".to_string(),
                }
                .fail()
            }
        }
    }

    pub fn set_active_tab(&mut self, tab: ConversationTab) {
        self.preferences.active_tab = tab;
        self.write_item("persist-active-tab", PreferenceKey::ActiveTab.as_str(), tab.as_str());
    }

    /// Drops signer and client, then wipes the cached key bundle and the
    /// connectivity flags. Each wipe is attempted even if an earlier one failed.
    pub fn logout(&mut self) -> LogoutReport {
        let address = self.address();
        self.state = SessionState::Disconnected;
        self.preferences.is_connected = false;
        self.preferences.is_on_network = false;

        let mut report = LogoutReport {
            address: address.clone(),
            ..LogoutReport::default()
        };

        let bundle_key = address
            .as_ref()
            .and_then(|address| key_bundle_key(self.env.as_str(), address.as_str()));
        match bundle_key {
            Some(bundle_key) => match self.remove_item("wipe-key-bundle", &bundle_key) {
                Ok(()) => report.key_bundle_wiped = true,
                Err(error) => report.failures.push(error.to_string()),
            },
            None => tracing::debug!("no session address, skipping key bundle wipe"),
        }

        let flags = PreferenceKey::ALL
            .into_iter()
            .filter(|key| *key != PreferenceKey::ActiveTab);
        for key in flags {
            if let Err(error) = self.remove_item("wipe-preference-flag", key.as_str()) {
                report.failures.push(error.to_string());
            }
        }

        tracing::info!(
            address = ?report.address,
            failures = report.failures.len(),
            "logged out"
        );
        report
    }

    fn set_connected(&mut self, value: bool) {
        self.preferences.is_connected = value;
        self.write_item("persist-is-connected", PreferenceKey::IsConnected.as_str(), encode_flag(value));
    }

    fn set_on_network(&mut self, value: bool) {
        self.preferences.is_on_network = value;
        self.write_item("persist-is-on-network", PreferenceKey::IsOnNetwork.as_str(), encode_flag(value));
    }

    fn load_key_bundle(&self, key: Option<&str>) -> Option<KeyBundle> {
        let key = key?;
        match self.storage.get_item(key).context(PersistenceFailureSnafu {
            stage: "load-key-bundle",
        }) {
            Ok(value) => value.map(KeyBundle::new),
            Err(error) => {
                tracing::warn!(key, error = %error, "failed to read cached key bundle");
                None
            }
        }
    }

    fn store_key_bundle(&self, key: Option<&str>, bundle: &KeyBundle) {
        match key {
            Some(key) => self.write_item("store-key-bundle", key, bundle.as_str()),
            None => tracing::warn!("client has no address, key bundle not cached"),
        }
    }

    fn write_item(&self, stage: &'static str, key: &str, value: &str) {
        if let Err(error) = self
            .storage
            .set_item(key, value)
            .context(PersistenceFailureSnafu { stage })
        {
            tracing::warn!(key, error = %error, "failed to persist item");
        }
    }

    fn remove_item(&self, stage: &'static str, key: &str) -> InboxResult<()> {
        self.storage
            .remove_item(key)
            .context(PersistenceFailureSnafu { stage })
            .inspect_err(|error| tracing::warn!(key, error = %error, "failed to remove item"))
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SessionManager")
            .field("env", &self.env)
            .field("state", &self.state)
            .field("preferences", &self.preferences)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use inbox_storage::MemoryStorage;

    use super::*;
    use crate::memory::{InjectedWallet, MemoryNetwork};

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
    const KEY_ADDRESS: &str = "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23";

    fn manager(network: &MemoryNetwork, storage: Arc<MemoryStorage>) -> SessionManager {
        SessionManager::new(storage, network.client_factory(), NetworkEnv::Production)
    }

    fn bundle_key() -> String {
        format!("xmtp:production:keys:{KEY_ADDRESS}")
    }

    #[tokio::test]
    async fn missing_wallet_provider_is_signer_unavailable() {
        let network = MemoryNetwork::new();
        let mut session = manager(&network, Arc::new(MemoryStorage::new()));
        let error = session.connect_external_signer().await.unwrap_err();
        assert!(matches!(error, InboxError::SignerUnavailable { .. }));

        let mut session = manager(&network, Arc::new(MemoryStorage::new()))
            .with_wallet_provider(Arc::new(InjectedWallet::absent()));
        let error = session.connect_external_signer().await.unwrap_err();
        assert!(matches!(error, InboxError::SignerUnavailable { .. }));
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn first_connect_creates_and_caches_a_bundle() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        let signer: Arc<dyn Signer> = Arc::new(LocalSigner::from_private_key(KEY).unwrap());
        let mut session = manager(&network, Arc::clone(&storage))
            .with_wallet_provider(Arc::new(InjectedWallet::new(signer)));

        session.connect_external_signer().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::SignerAttached);
        let client = session.connect_to_network().await.unwrap();

        assert_eq!(client.address().as_str(), KEY_ADDRESS);
        assert_eq!(session.phase(), SessionPhase::NetworkAttached);
        assert!(storage.get_item(&bundle_key()).unwrap().is_some());
        assert_eq!(storage.get_item("isOnNetwork").unwrap().as_deref(), Some("true"));
        assert_eq!(network.stats().count("create"), 1);
        assert_eq!(network.stats().count("refresh_consent_list"), 1);
    }

    #[tokio::test]
    async fn cached_bundle_restores_without_signing() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());

        let mut first = manager(&network, Arc::clone(&storage));
        first.restore_from_private_key(KEY, &ProviderConfig::default()).unwrap();
        first.connect_to_network().await.unwrap();

        let mut second = manager(&network, Arc::clone(&storage));
        second.restore_from_private_key(KEY, &ProviderConfig::default()).unwrap();
        second.connect_to_network().await.unwrap();

        let stats = network.stats();
        assert_eq!(stats.count("create"), 1);
        assert_eq!(stats.count("create_from_key_bundle"), 1);
        assert_eq!(stats.count("refresh_consent_list"), 2);
    }

    #[tokio::test]
    async fn rejected_bundle_falls_back_to_creation() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item(&bundle_key(), "stale").unwrap();

        let mut session = manager(&network, Arc::clone(&storage));
        session.restore_from_private_key(KEY, &ProviderConfig::default()).unwrap();
        session.connect_to_network().await.unwrap();

        assert_eq!(network.stats().count("create"), 1);
        assert_ne!(storage.get_item(&bundle_key()).unwrap().as_deref(), Some("stale"));
    }

    #[tokio::test]
    async fn connecting_without_a_signer_logs_out() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item("isConnected", "true").unwrap();

        let mut session = manager(&network, Arc::clone(&storage));
        let error = session.connect_to_network().await.err().unwrap();
        assert!(matches!(error, InboxError::SignerUnavailable { .. }));
        assert_eq!(storage.get_item("isConnected").unwrap(), None);
    }

    #[test]
    fn malformed_private_key_is_invalid_key() {
        let network = MemoryNetwork::new();
        let mut session = manager(&network, Arc::new(MemoryStorage::new()));
        let error = session
            .restore_from_private_key("0xnot-a-key", &ProviderConfig::default())
            .unwrap_err();
        assert!(matches!(error, InboxError::InvalidKey { .. }));
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[test]
    fn logout_without_a_client_clears_flags() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item("isOnNetwork", "true").unwrap();
        storage.set_item("isConnected", "true").unwrap();
        storage.set_item("@activeTab", "requests").unwrap();

        let mut session = manager(&network, Arc::clone(&storage));
        assert!(session.preferences().is_on_network);

        let report = session.logout();
        assert_eq!(report.address, None);
        assert!(!report.key_bundle_wiped);
        assert!(report.failures.is_empty());
        assert_eq!(storage.get_item("isOnNetwork").unwrap(), None);
        assert_eq!(storage.get_item("isConnected").unwrap(), None);
        assert_eq!(storage.get_item("@activeTab").unwrap().as_deref(), Some("requests"));
        assert!(!session.preferences().is_connected);
    }

    #[tokio::test]
    async fn logout_wipes_the_cached_bundle() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut session = manager(&network, Arc::clone(&storage));
        session.restore_from_private_key(KEY, &ProviderConfig::default()).unwrap();
        session.connect_to_network().await.unwrap();

        let report = session.logout();
        assert!(report.key_bundle_wiped);
        assert_eq!(storage.get_item(&bundle_key()).unwrap(), None);
        assert_eq!(session.phase(), SessionPhase::Disconnected);
    }

    #[tokio::test]
    async fn ephemeral_identity_is_immediately_on_network() {
        let network = MemoryNetwork::new();
        let mut session = manager(&network, Arc::new(MemoryStorage::new()));
        let client = session.create_ephemeral_identity(NetworkEnv::Dev).await.unwrap();

        assert_eq!(session.phase(), SessionPhase::NetworkAttached);
        assert!(session.signer().is_none());
        assert_eq!(session.address().as_ref(), Some(client.address()));
    }

    #[test]
    fn active_tab_survives_a_restart() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        manager(&network, Arc::clone(&storage)).set_active_tab(ConversationTab::Requests);

        let restarted = manager(&network, storage);
        assert_eq!(restarted.preferences().active_tab, ConversationTab::Requests);
    }
}
