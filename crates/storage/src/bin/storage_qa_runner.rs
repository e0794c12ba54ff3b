use std::env;
use std::path::Path;

use snafu::{OptionExt, ResultExt, Snafu};

use inbox_storage::{
    KeyValueStore, MemoryStorage, PreferenceKey, SqliteStorage, StorageError, decode_flag,
    encode_flag, key_bundle_key,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    db_path: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    MemoryRoundtrip,
    KvRoundtrip,
    KeyBundleNamespace,
    RemoveMissing,
    ReopenPersistence,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "memory_roundtrip" => Some(Self::MemoryRoundtrip),
            "kv_roundtrip" => Some(Self::KvRoundtrip),
            "key_bundle_namespace" => Some(Self::KeyBundleNamespace),
            "remove_missing" => Some(Self::RemoveMissing),
            "reopen_persistence" => Some(Self::ReopenPersistence),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::MemoryRoundtrip => "memory_roundtrip",
            Self::KvRoundtrip => "kv_roundtrip",
            Self::KeyBundleNamespace => "key_bundle_namespace",
            Self::RemoveMissing => "remove_missing",
            Self::ReopenPersistence => "reopen_persistence",
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
    #[snafu(display("storage validation failed: {source}"))]
    StorageValidation {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("missing required --db argument for scenario '{scenario}'"))]
    MissingDbPath {
        stage: &'static str,
        scenario: &'static str,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
    #[snafu(display("file operation failed at '{path}': {source}"))]
    FileIo {
        stage: &'static str,
        path: String,
        source: std::io::Error,
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
    println!("scenario={}", args.scenario.name());
    if let Some(db_path) = args.db_path.as_deref() {
        println!("db_path={db_path}");
    }

    match args.scenario {
        Scenario::MemoryRoundtrip => run_memory_roundtrip(),
        Scenario::KvRoundtrip => run_kv_roundtrip(require_db_path(&args, "kv_roundtrip")?).await,
        Scenario::KeyBundleNamespace => {
            run_key_bundle_namespace(require_db_path(&args, "key_bundle_namespace")?).await
        }
        Scenario::RemoveMissing => {
            run_remove_missing(require_db_path(&args, "remove_missing")?).await
        }
        Scenario::ReopenPersistence => {
            run_reopen_persistence(require_db_path(&args, "reopen_persistence")?).await
        }
        Scenario::All => run_all(args.db_path.as_deref()).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut db_path = None;
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
    })
}

async fn run_all(db_path: Option<&str>) -> RunnerResult<()> {
    run_memory_roundtrip()?;

    let Some(db_path) = db_path else {
        println!("sqlite_scenarios=skipped");
        return Ok(());
    };

    run_kv_roundtrip(db_path).await?;
    run_key_bundle_namespace(db_path).await?;
    run_remove_missing(db_path).await?;
    run_reopen_persistence(db_path).await
}

fn run_memory_roundtrip() -> RunnerResult<()> {
    let storage = MemoryStorage::new();
    assert_store_roundtrip(&storage, "memory_roundtrip")?;

    let keys = storage.keys().context(StorageValidationSnafu {
        stage: "memory-roundtrip-keys",
    })?;
    println!("memory_keys_after_cleanup={}", keys.len());
    ensure_scenario(
        keys.is_empty(),
        "memory_roundtrip",
        format!("expected no keys after cleanup, found {keys:?}"),
    )?;

    println!("memory_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_kv_roundtrip(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let storage = open_storage(db_path).await?;
    assert_store_roundtrip(&storage, "kv_roundtrip")?;

    let count = storage.item_count().context(StorageValidationSnafu {
        stage: "kv-roundtrip-count",
    })?;
    println!("kv_items_after_cleanup={count}");
    ensure_scenario(
        count == 0,
        "kv_roundtrip",
        format!("expected an empty table after cleanup, found {count} rows"),
    )?;

    println!("kv_roundtrip=true");
    println!("runner_ok=true");
    Ok(())
}

async fn run_key_bundle_namespace(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let storage = open_storage(db_path).await?;
    let address = "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23";

    let dev_key = bundle_key("dev", address)?;
    let production_key = bundle_key("production", address)?;
    println!("dev_bundle_key={dev_key}");
    println!("production_bundle_key={production_key}");

    set(&storage, &dev_key, "bundle-dev", "key-bundle-set-dev")?;
    set(&storage, &production_key, "bundle-production", "key-bundle-set-production")?;

    let dev = get(&storage, &dev_key, "key-bundle-get-dev")?;
    let production = get(&storage, &production_key, "key-bundle-get-production")?;
    let isolated = dev.as_deref() == Some("bundle-dev")
        && production.as_deref() == Some("bundle-production");
    println!("key_bundles_isolated={isolated}");
    ensure_scenario(
        isolated,
        "key_bundle_namespace",
        format!("bundles leaked across envs: dev={dev:?} production={production:?}"),
    )?;

    let blank_key_rejected = key_bundle_key("dev", "  ").is_none();
    println!("blank_address_has_no_key={blank_key_rejected}");
    ensure_scenario(
        blank_key_rejected,
        "key_bundle_namespace",
        "blank address produced a bundle key".to_string(),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_remove_missing(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    let storage = open_storage(db_path).await?;

    for key in PreferenceKey::ALL {
        storage
            .remove_item(key.as_str())
            .context(StorageValidationSnafu {
                stage: "remove-missing-preference",
            })?;
    }
    println!("remove_missing_ok=true");

    let empty_key_rejected = matches!(
        storage.remove_item(""),
        Err(StorageError::EmptyKey { .. })
    );
    println!("empty_key_rejected={empty_key_rejected}");
    ensure_scenario(
        empty_key_rejected,
        "remove_missing",
        "empty key was accepted".to_string(),
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_reopen_persistence(db_path: &str) -> RunnerResult<()> {
    reset_sqlite_files(db_path)?;
    {
        let storage = open_storage(db_path).await?;
        set(
            &storage,
            PreferenceKey::IsOnNetwork.as_str(),
            encode_flag(true),
            "reopen-set-flag",
        )?;
        set(
            &storage,
            PreferenceKey::ActiveTab.as_str(),
            "requests",
            "reopen-set-tab",
        )?;
        storage.pool().close().await;
    }

    let reopened = open_storage(db_path).await?;
    let on_network = decode_flag(
        get(&reopened, PreferenceKey::IsOnNetwork.as_str(), "reopen-get-flag")?.as_deref(),
    );
    let tab = get(&reopened, PreferenceKey::ActiveTab.as_str(), "reopen-get-tab")?;
    println!("is_on_network_after_reopen={on_network}");
    println!("active_tab_after_reopen={}", tab.as_deref().unwrap_or(""));
    ensure_scenario(
        on_network && tab.as_deref() == Some("requests"),
        "reopen_persistence",
        format!("values lost across reopen: on_network={on_network} tab={tab:?}"),
    )?;

    println!("runner_ok=true");
    Ok(())
}

fn assert_store_roundtrip(storage: &dyn KeyValueStore, scenario: &'static str) -> RunnerResult<()> {
    let key = PreferenceKey::IsConnected.as_str();
    set(storage, key, encode_flag(true), "roundtrip-set")?;
    set(storage, key, encode_flag(false), "roundtrip-overwrite")?;

    let value = get(storage, key, "roundtrip-get")?;
    ensure_scenario(
        value.as_deref() == Some(encode_flag(false)),
        scenario,
        format!("expected overwritten flag, got {value:?}"),
    )?;

    storage.remove_item(key).context(StorageValidationSnafu {
        stage: "roundtrip-remove",
    })?;
    let removed = get(storage, key, "roundtrip-get-removed")?;
    ensure_scenario(
        removed.is_none(),
        scenario,
        format!("expected removed key, got {removed:?}"),
    )
}

async fn open_storage(db_path: &str) -> RunnerResult<SqliteStorage> {
    SqliteStorage::open(db_path)
        .await
        .context(StorageValidationSnafu {
            stage: "open-sqlite-storage",
        })
}

fn bundle_key(env: &str, address: &str) -> RunnerResult<String> {
    key_bundle_key(env, address).context(ScenarioFailedSnafu {
        stage: "build-key-bundle-key",
        scenario: "key_bundle_namespace",
        reason: format!("no bundle key for {address}"),
    })
}

fn set(
    storage: &dyn KeyValueStore,
    key: &str,
    value: &str,
    stage: &'static str,
) -> RunnerResult<()> {
    storage
        .set_item(key, value)
        .context(StorageValidationSnafu { stage })
}

fn get(storage: &dyn KeyValueStore, key: &str, stage: &'static str) -> RunnerResult<Option<String>> {
    storage.get_item(key).context(StorageValidationSnafu { stage })
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

fn reset_sqlite_files(db_path: &str) -> RunnerResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let path = format!("{db_path}{suffix}");
        remove_file_if_exists(Path::new(&path), "reset-sqlite-files")?;
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path, stage: &'static str) -> RunnerResult<()> {
    if !path.exists() {
        return Ok(());
    }
    std::fs::remove_file(path).context(FileIoSnafu {
        stage,
        path: path.display().to_string(),
    })
}

fn require_db_path<'a>(args: &'a RunnerArgs, scenario: &'static str) -> RunnerResult<&'a str> {
    args.db_path.as_deref().context(MissingDbPathSnafu {
        stage: "require-db-path",
        scenario,
    })
}
