use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use floating_inbox::address::Address;
use floating_inbox::chat::time_text::{now_unix_ms, relative_time_label};
use floating_inbox::chat::{ConsentState, ConversationTab};
use floating_inbox::inbox::STATUS_ON_NETWORK;
use floating_inbox::memory::{InjectedWallet, MemoryNetwork, StaticNameResolver};
use floating_inbox::sdk::{MessagingClient, SdkError, Signer};
use floating_inbox::wallet::LocalSigner;
use floating_inbox::{
    FloatingInbox, InboxError, InboxSettings, LogoutReport, Screen, SessionManager,
    SettingsStore, logging,
};
use inbox_storage::{KeyValueStore, MemoryStorage, PreferenceKey, SqliteStorage, StorageError};

const PEER_NAME: &str = "bob.eth";
const PEER_ADDRESS: &str = "0xb0b0000000000000000000000000000000000b0b";
const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    ConsentFlow,
    Search,
    Logout,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "consent_flow" => Some(Self::ConsentFlow),
            "search" => Some(Self::Search),
            "logout" => Some(Self::Logout),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::ConsentFlow => "consent_flow",
            Self::Search => "search",
            Self::Logout => "logout",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("inbox action failed on `{stage}`: {source}"))]
    Inbox {
        stage: &'static str,
        source: InboxError,
    },
    #[snafu(display("peer client failed on `{stage}`: {source}"))]
    Peer {
        stage: &'static str,
        source: SdkError,
    },
    #[snafu(display("timed out waiting for a feed event on `{stage}`"))]
    EventTimeout { stage: &'static str },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings_store = match args.config_path.clone() {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    logging::init(&settings.log_filter);

    println!("scenario={}", args.scenario.name());
    println!("env={}", settings.env);
    let db_path = args.db_path.clone().or_else(|| {
        settings
            .database_path
            .as_ref()
            .map(|path| path.display().to_string())
    });
    if let Some(db_path) = db_path.as_deref() {
        println!("db_path={db_path}");
    }

    let storage = open_storage(db_path.as_deref()).await?;
    match args.scenario {
        Scenario::ConsentFlow => run_consent_flow(storage, &settings).await?,
        Scenario::Search => run_search(storage, &settings).await?,
        Scenario::Logout => run_logout(storage, &settings).await?,
        Scenario::All => {
            run_consent_flow(Arc::clone(&storage), &settings).await?;
            run_search(Arc::clone(&storage), &settings).await?;
            run_logout(storage, &settings).await?;
        }
    }

    println!("runner_ok=true");
    Ok(())
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
    let mut config_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--db" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?;
                db_path = Some(value);
            }
            "--config" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-config-value",
                    arg: "--config",
                })?;
                config_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        db_path,
        config_path,
    })
}

async fn open_storage(db_path: Option<&str>) -> RunnerResult<Arc<dyn KeyValueStore>> {
    match db_path {
        Some(db_path) => {
            let storage = SqliteStorage::open(db_path).await.context(StorageSnafu {
                stage: "open-sqlite-storage",
            })?;
            Ok(Arc::new(storage))
        }
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

/// Local user plus one peer on a shared in-process network.
struct DemoWorld {
    network: MemoryNetwork,
    peer: Arc<dyn MessagingClient>,
}

impl DemoWorld {
    fn new() -> RunnerResult<Self> {
        let network = MemoryNetwork::new();
        let peer_address = demo_address(PEER_ADDRESS)?;
        let peer: Arc<dyn MessagingClient> = network.connect(&peer_address);
        Ok(Self { network, peer })
    }

    fn inbox(
        &self,
        storage: Arc<dyn KeyValueStore>,
        settings: &InboxSettings,
        signer: Arc<dyn Signer>,
    ) -> FloatingInbox {
        let session = SessionManager::new(storage, self.network.client_factory(), settings.env)
            .with_wallet_provider(Arc::new(InjectedWallet::new(signer)));
        let names = StaticNameResolver::new().with_name(PEER_NAME, self.peer.address().clone());
        FloatingInbox::new(session, Arc::new(names), settings.allowed_scope)
    }
}

fn local_signer(settings: &InboxSettings) -> RunnerResult<Arc<dyn Signer>> {
    let signer = match settings.private_key.as_deref() {
        Some(key) => LocalSigner::from_private_key(key),
        None => LocalSigner::random(),
    }
    .context(InboxSnafu {
        stage: "build-local-signer",
    })?;
    Ok(Arc::new(signer))
}

async fn open_inbox(
    world: &DemoWorld,
    storage: Arc<dyn KeyValueStore>,
    settings: &InboxSettings,
) -> RunnerResult<FloatingInbox> {
    let mut inbox = world.inbox(storage, settings, local_signer(settings)?);
    let address = inbox.connect_wallet().await.context(InboxSnafu {
        stage: "connect-wallet",
    })?;
    println!("own_address={address}");
    let screen = inbox.screen();
    println!("screen_after_wallet={screen:?}");
    ensure_scenario(
        matches!(screen, Screen::JoinNetwork | Screen::Connecting),
        "screen",
        format!("expected the join screen, found {screen:?}"),
    )?;

    inbox.connect_to_network().await.context(InboxSnafu {
        stage: "connect-to-network",
    })?;
    expect_screen(&inbox, Screen::Conversations)?;
    Ok(inbox)
}

async fn run_consent_flow(
    storage: Arc<dyn KeyValueStore>,
    settings: &InboxSettings,
) -> RunnerResult<()> {
    let world = DemoWorld::new()?;
    let mut inbox = open_inbox(&world, storage, settings).await?;
    let own_address = inbox
        .session()
        .address()
        .context(ScenarioFailedSnafu {
            stage: "consent-own-address",
            scenario: "consent_flow",
            reason: "connected session has no address".to_string(),
        })?;

    let conversation = world
        .peer
        .new_conversation(&own_address)
        .await
        .context(PeerSnafu {
            stage: "peer-new-conversation",
        })?;
    world
        .peer
        .send(&conversation, "gm from bob")
        .await
        .context(PeerSnafu { stage: "peer-send" })?;
    next_event(&mut inbox, "consent-conversation-feed").await?;

    let requests = inbox.buckets().requests.len();
    println!("requests={requests}");
    ensure_scenario(
        requests == 1,
        "consent_flow",
        format!("expected one request, found {requests}"),
    )?;

    inbox.set_active_tab(ConversationTab::Requests);
    let request = inbox
        .visible_conversations()
        .first()
        .cloned()
        .context(ScenarioFailedSnafu {
            stage: "consent-pick-request",
            scenario: "consent_flow",
            reason: "requests tab is empty".to_string(),
        })?;
    inbox.select_conversation(request).await.context(InboxSnafu {
        stage: "consent-select",
    })?;

    let thread = inbox.thread().context(ScenarioFailedSnafu {
        stage: "consent-thread",
        scenario: "consent_flow",
        reason: "no thread after selecting the request".to_string(),
    })?;
    println!("trust_prompt={}", thread.trust_prompt().unwrap_or(""));
    println!("history_len={}", thread.messages().len());

    inbox.send_message("gm bob").await.context(InboxSnafu {
        stage: "consent-reply",
    })?;
    let peer_consent = world
        .network
        .consent_of(&own_address, world.peer.address());
    println!("peer_consent_after_reply={peer_consent}");
    ensure_scenario(
        peer_consent == ConsentState::Allowed,
        "consent_flow",
        format!("expected allowed after replying, found {peer_consent}"),
    )?;

    let allowed = inbox.buckets().allowed.len();
    println!("allowed={allowed}");
    if let Some(conversation) = inbox.buckets().allowed.first() {
        println!(
            "peer_row={} {}",
            conversation.peer_address.abbreviated(),
            relative_time_label(now_unix_ms(), conversation.created_at_unix_ms)
        );
    }
    inbox.back();
    inbox.set_active_tab(ConversationTab::Allowed);
    Ok(())
}

async fn run_search(storage: Arc<dyn KeyValueStore>, settings: &InboxSettings) -> RunnerResult<()> {
    let world = DemoWorld::new()?;
    let mut inbox = open_inbox(&world, storage, settings).await?;

    let state = inbox.search(PEER_NAME).await.clone();
    println!("search_term={}", state.term);
    println!("search_status={}", state.visible_status().unwrap_or(""));
    println!("search_create_new={}", state.create_new);
    ensure_scenario(
        state.visible_status() == Some(STATUS_ON_NETWORK) && state.create_new,
        "search",
        format!("unexpected search state for {PEER_NAME}: {state:?}"),
    )?;

    inbox.start_new_conversation().context(InboxSnafu {
        stage: "search-start-new",
    })?;
    let outcome = inbox.send_message("hello from the inbox").await.context(InboxSnafu {
        stage: "search-first-send",
    })?;
    println!("created_conversation={}", outcome.created_conversation);

    let invalid = inbox.search("not-an-address").await.clone();
    println!("invalid_status={}", invalid.visible_status().unwrap_or(""));

    let own = inbox.session().address().map(String::from).unwrap_or_default();
    let self_search = inbox.search(&own).await.clone();
    println!("self_status={}", self_search.visible_status().unwrap_or(""));
    Ok(())
}

async fn run_logout(storage: Arc<dyn KeyValueStore>, settings: &InboxSettings) -> RunnerResult<()> {
    let world = DemoWorld::new()?;
    let reports = Arc::new(Mutex::new(Vec::<LogoutReport>::new()));
    let sink = Arc::clone(&reports);

    let inbox = match settings.private_key.as_deref() {
        Some(key) => {
            let mut inbox = world.inbox(Arc::clone(&storage), settings, local_signer(settings)?);
            let address = inbox
                .start_from_key(key, &settings.provider_config())
                .context(InboxSnafu {
                    stage: "start-from-key",
                })?;
            println!("own_address={address}");
            inbox.connect_to_network().await.context(InboxSnafu {
                stage: "connect-to-network",
            })?;
            inbox
        }
        None => open_inbox(&world, Arc::clone(&storage), settings).await?,
    };
    let mut inbox = inbox.with_logout_callback(move |report| {
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
    });

    let report = inbox.logout();
    println!("logout_key_bundle_wiped={}", report.key_bundle_wiped);
    println!("logout_failures={}", report.failures.len());
    expect_screen(&inbox, Screen::Connect)?;

    let callbacks = reports.lock().unwrap_or_else(PoisonError::into_inner).len();
    println!("logout_callbacks={callbacks}");

    let flag_left = storage
        .get_item(PreferenceKey::IsConnected.as_str())
        .context(StorageSnafu {
            stage: "logout-read-flag",
        })?;
    ensure_scenario(
        report.key_bundle_wiped && callbacks == 1 && flag_left.is_none(),
        "logout",
        format!("incomplete logout: {report:?} callbacks={callbacks} flag={flag_left:?}"),
    )
}

async fn next_event(inbox: &mut FloatingInbox, stage: &'static str) -> RunnerResult<()> {
    tokio::time::timeout(EVENT_TIMEOUT, inbox.process_next_event())
        .await
        .ok()
        .filter(|applied| *applied)
        .map(|_| ())
        .context(EventTimeoutSnafu { stage })
}

fn expect_screen(inbox: &FloatingInbox, expected: Screen) -> RunnerResult<()> {
    let screen = inbox.screen();
    ensure_scenario(
        screen == expected,
        "screen",
        format!("expected {expected:?}, found {screen:?}"),
    )
}

fn ensure_scenario(condition: bool, scenario: &'static str, reason: String) -> RunnerResult<()> {
    if condition {
        return Ok(());
    }
    ScenarioFailedSnafu {
        stage: "scenario-check",
        scenario,
        reason,
    }
    .fail()
}

fn demo_address(raw: &str) -> RunnerResult<Address> {
    Address::parse(raw).context(InboxSnafu {
        stage: "demo-address",
    })
}
