use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use mailguard::config::{Config, DEFAULT_CONFIG_PATH};
use mailguard::delivery::Backend;
use mailguard::detection::{Category, CategoryDescriptor, CompiledRule, DetectionAlgorithm, DetectionEngine, RuleCache, RuleSource};
use mailguard::error_log::ErrorLog;
use mailguard::fingerprint::{Classifier, Verdict};
use mailguard::message::ParsedMessage;
use mailguard::pipeline::{Pipeline, PipelineError, ProcessOutcome, Supervisor};
use mailguard::quarantine::MapAliasResolver;
use mailguard::recipient::Invocation;
use mailguard::statistics;
use mailguard::store::PolicyStore;
use mailguard::sync::SyncClient;
use std::io::Read;
use std::path::Path;
use std::process;
use std::str::FromStr;
use std::time::Duration;

/// sysexits.h exit codes; `libc` does not export them on Linux.
mod sysexits {
    pub const EX_OK: i32 = 0;
    pub const EX_DATAERR: i32 = 65;
    pub const EX_TEMPFAIL: i32 = 75;
}

#[tokio::main]
async fn main() {
    let matches = Command::new("mailguard-filter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Content filter for mail transfer agents")
        .long_about("Reads one message on stdin, classifies it and hands it to the configured\n\
                    delivery backend, tagged, quarantined or bounced as the policy requires.\n\
                    Administrative options operate on the policy store and exit.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("recipient")
                .long("recipient")
                .value_name("ADDRESS")
                .help("Envelope recipient, when the MTA passes it on the command line"),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .value_name("ADDRESS")
                .help("Envelope sender, used as the bounce target"),
        )
        .arg(
            Arg::new("client-address")
                .long("client-address")
                .value_name("IP")
                .help("Address of the connecting client"),
        )
        .arg(
            Arg::new("args")
                .value_name("ARGS")
                .help("Further arguments from the MTA; an address among them may name the recipient")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and compile every rule")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("correct-spam")
                .long("correct-spam")
                .value_name("FILE")
                .help("Record the message in FILE as spam (missed spam)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("correct-clean")
                .long("correct-clean")
                .value_name("FILE")
                .help("Record the message in FILE as clean (false positive)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("remove-fingerprint")
                .long("remove-fingerprint")
                .value_name("HASH")
                .help("Forget a stored fingerprint")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("import-rules")
                .long("import-rules")
                .value_name("FILE")
                .help("Import detection rules from a YAML list")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("list-rules")
                .long("list-rules")
                .help("List the detection rules in the policy store")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show processing statistics")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .help("Reset all statistics and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("purge-cache")
                .long("purge-cache")
                .help("Drop expired sync and report cache entries")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let (config, config_found) = match load_config(config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(sysexits::EX_TEMPFAIL);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::from_str(&config.logging.level).unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();
    if !config_found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    if matches.get_flag("test-config") {
        process::exit(test_config(&config));
    }

    if let Err(e) = config.validate() {
        log::error!("Invalid configuration: {e}");
        process::exit(sysexits::EX_TEMPFAIL);
    }

    match run_admin_command(&matches, &config) {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }

    process::exit(filter_message(&matches, config).await);
}

/// Returns `(config, found)`. A missing file means defaults.
fn load_config(path: &str) -> anyhow::Result<(Config, bool)> {
    let path = Path::new(path);
    if !path.exists() {
        return Ok((Config::default(), false));
    }
    let config = Config::from_file(path).with_context(|| format!("reading {}", path.display()))?;
    Ok((config, true))
}

fn generate_default_config(path: &str) {
    match Config::default().to_file(Path::new(path)) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<PolicyStore> {
    let store = PolicyStore::open(
        &config.store.path,
        Duration::from_millis(config.store.busy_timeout_ms),
    )
    .with_context(|| format!("opening policy store {}", config.store.path.display()))?;
    Ok(store)
}

/// Compile `rules` and print one line per failure. Returns the failure count.
fn report_compile_errors(rules: &[DetectionAlgorithm]) -> usize {
    let mut failures = 0;
    for rule in rules {
        if let Err(e) = CompiledRule::compile(rule) {
            println!("  ❌ {e}");
            failures += 1;
        }
    }
    failures
}

fn test_config(config: &Config) -> i32 {
    println!("Testing configuration...");
    if let Err(e) = config.validate() {
        println!("❌ {e}");
        return 1;
    }
    println!("Delivery method: {}", config.delivery.method);
    println!("Spam threshold: {} (action {})", config.spam.threshold, config.spam.action);

    let mut failures = 0;
    println!("Inline rules: {}", config.detection.rules.len());
    failures += report_compile_errors(&config.detection.rules);

    match open_store(config).and_then(|store| Ok(store.all_rules()?)) {
        Ok(stored) => {
            println!("Stored rules: {}", stored.len());
            failures += report_compile_errors(&stored);
        }
        Err(e) => println!("⚠️  Policy store unavailable: {e:#}"),
    }

    if failures > 0 {
        println!("❌ {failures} rule(s) failed to compile");
        return 1;
    }
    println!("✅ Configuration is valid");
    0
}

fn read_message_file(path: &str) -> anyhow::Result<ParsedMessage> {
    let raw = std::fs::read(path).with_context(|| format!("reading {path}"))?;
    ParsedMessage::parse(&raw).with_context(|| format!("parsing {path}"))
}

/// Handle administrative options. Returns `Ok(true)` when one ran.
fn run_admin_command(matches: &ArgMatches, config: &Config) -> anyhow::Result<bool> {
    let corrections = [("correct-spam", Verdict::Spam), ("correct-clean", Verdict::Clean)];
    for (flag, verdict) in corrections {
        if let Some(path) = matches.get_one::<String>(flag) {
            let store = open_store(config)?;
            let message = read_message_file(path)?;
            let classifier = Classifier::today(config.hash_secret());
            let body = message.decoded_body();
            let existed = classifier.correct(&store, message.subject(), &body, verdict)?;
            let fingerprint = classifier.fingerprint(message.subject(), &body)?;
            if existed {
                println!("✅ Fingerprint {} corrected to {verdict}", fingerprint.combined);
            } else {
                println!("✅ Fingerprint {} recorded as {verdict}", fingerprint.combined);
            }
            return Ok(true);
        }
    }

    if let Some(hash) = matches.get_one::<String>("remove-fingerprint") {
        let store = open_store(config)?;
        if store.remove_fingerprint(hash)? {
            println!("✅ Fingerprint {hash} removed");
        } else {
            println!("Fingerprint {hash} not found");
        }
        return Ok(true);
    }

    if let Some(path) = matches.get_one::<String>("import-rules") {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let rules: Vec<DetectionAlgorithm> =
            serde_yaml::from_str(&content).with_context(|| format!("parsing rules in {path}"))?;
        let store = open_store(config)?;
        let mut imported = 0;
        let mut rejected = 0;
        for rule in &rules {
            match CompiledRule::compile(rule) {
                Ok(_) => {
                    let id = store.upsert_rule(rule)?;
                    log::debug!("Imported rule '{}' as id {id}", rule.name);
                    imported += 1;
                }
                Err(e) => {
                    println!("  ❌ {e}");
                    rejected += 1;
                }
            }
        }
        println!("Imported {imported} rule(s), rejected {rejected}");
        return Ok(true);
    }

    if matches.get_flag("list-rules") {
        let store = open_store(config)?;
        let rules = store.all_rules()?;
        if rules.is_empty() {
            println!("No rules in the policy store");
        }
        for rule in rules {
            println!(
                "{:>5} {:<9} {:<12} {:>4} {:>4} {} [{}] {}",
                rule.id.unwrap_or_default(),
                rule.category,
                rule.detection_type,
                rule.score,
                rule.priority,
                if rule.enabled { "on " } else { "off" },
                rule.server_id.as_deref().unwrap_or("-"),
                rule.name
            );
        }
        return Ok(true);
    }

    if matches.get_flag("stats-reset") {
        let store = open_store(config)?;
        statistics::reset_stats(&store)?;
        println!("✅ Statistics reset successfully");
        return Ok(true);
    }

    if matches.get_flag("stats") {
        let store = open_store(config)?;
        let (global, rules) = statistics::get_stats(&store)?;
        let fingerprints = store.fingerprint_counts()?;
        print!("{}", statistics::format_report(&global, &rules, &fingerprints));
        return Ok(true);
    }

    if matches.get_flag("purge-cache") {
        let store = open_store(config)?;
        let removed = store.purge_expired(chrono::Utc::now())?;
        println!("Removed {removed} expired cache entries");
        return Ok(true);
    }

    Ok(false)
}

fn invocation(matches: &ArgMatches, config: &Config) -> Invocation {
    let env = config
        .mail
        .recipient_env
        .iter()
        .filter_map(|var| std::env::var(var).ok().map(|value| (var.clone(), value)))
        .collect();
    Invocation {
        env,
        recipient_arg: matches.get_one::<String>("recipient").cloned(),
        sender_arg: matches.get_one::<String>("sender").cloned(),
        args: matches
            .get_many::<String>("args")
            .map(|values| values.cloned().collect())
            .unwrap_or_default(),
        client_address: matches
            .get_one::<String>("client-address")
            .cloned()
            .or_else(|| std::env::var("CLIENT_ADDRESS").ok()),
    }
}

fn build_engine(config: &Config, store: Option<&PolicyStore>) -> DetectionEngine {
    let mut sources: Vec<&dyn RuleSource> = Vec::new();
    if let Some(store) = store {
        sources.push(store);
    }
    sources.push(&config.detection.rules);
    let cache = RuleCache::load(&sources);

    let descriptors = Category::ALL
        .iter()
        .map(|&category| CategoryDescriptor {
            category,
            threshold: config.threshold(category),
        })
        .collect();
    DetectionEngine::new(descriptors, cache)
}

/// Process the message on stdin. Returns the exit status for the MTA.
async fn filter_message(matches: &ArgMatches, config: Config) -> i32 {
    let mut raw = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut raw) {
        log::error!("Failed to read message from stdin: {e}");
        return sysexits::EX_TEMPFAIL;
    }

    let hostname = config.mail.hostname();
    let backend = match Backend::from_config(&config.delivery, &hostname) {
        Ok(backend) => backend,
        Err(e) => {
            log::error!("Cannot set up delivery: {e}");
            return sysexits::EX_TEMPFAIL;
        }
    };

    let store = match open_store(&config) {
        Ok(store) => Some(store),
        Err(e) => {
            log::warn!("{e:#}; continuing with configured rules only");
            None
        }
    };

    let sync = if config.sync.enabled {
        match SyncClient::new(&config.sync) {
            Ok(client) => Some(client),
            Err(e) => {
                log::warn!("Sync disabled: {e}");
                None
            }
        }
    } else {
        None
    };
    if let (Some(client), Some(store)) = (&sync, &store) {
        client.refresh_rules(store).await;
    }

    let aliases = match &config.spam.alias_map {
        Some(path) => MapAliasResolver::from_file(path).unwrap_or_else(|e| {
            log::warn!("Ignoring alias map: {e}");
            MapAliasResolver::empty()
        }),
        None => MapAliasResolver::empty(),
    };
    let invocation = invocation(matches, &config);

    let joined = tokio::task::spawn_blocking(move || {
        let engine = build_engine(&config, store.as_ref());
        log::debug!(
            "Loaded {} spam, {} phishing and {} virus rules",
            engine.cache().rules(Category::Spam).len(),
            engine.cache().rules(Category::Phishing).len(),
            engine.cache().rules(Category::Virus).len()
        );
        let error_log = ErrorLog::new(config.error.log_path.clone());
        let pipeline = Pipeline::new(&config, &engine, &backend, &aliases, &invocation).with_store(store.as_ref());
        let result = Supervisor::blocking(pipeline, error_log).run(&raw);
        (result, store)
    })
    .await;

    let (result, store) = match joined {
        Ok(joined) => joined,
        Err(e) => {
            log::error!("Filter task failed: {e}");
            return sysexits::EX_TEMPFAIL;
        }
    };

    match result {
        Ok(ProcessOutcome { report, .. }) => {
            if let (Some(client), Some(store), Some(report)) = (&sync, &store, &report) {
                client.report_fingerprint(store, report).await;
            }
            sysexits::EX_OK
        }
        Err(PipelineError::Parse(e)) => {
            log::error!("Rejecting unparseable input: {e}");
            sysexits::EX_DATAERR
        }
        Err(e) => {
            log::error!("No disposition reached: {e}");
            sysexits::EX_TEMPFAIL
        }
    }
}
