//! Per-message pipeline: parse, classify, decide, deliver. `Supervisor` wraps
//! it in bounded retry and applies the configured system-error fallback.

use crate::bounce::build_bounce;
use crate::config::{Config, OnSystemError};
use crate::delivery::{Deliver, DeliveryError, DeliveryOutcome, Dispatcher, Envelope, PROCESSED_HEADER};
use crate::detection::{Category, DetectionEngine, MessageContent};
use crate::disposition::{Action, DispositionRouter, ThreatVerdict};
use crate::error_log::ErrorLog;
use crate::fingerprint::{Classifier, Verdict};
use crate::message::{OutgoingMessage, ParseError, ParsedMessage};
use crate::quarantine::{AliasResolver, MaildirWriter, QuarantineError, SpamQuarantine};
use crate::recipient::{originating_address, resolve_sender, Invocation, RecipientError, RecipientResolver};
use crate::retry::{Retry, RetryError};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::store::PolicyStore;
use std::cell::RefCell;
use std::path::PathBuf;
use std::time::Duration;

/// Header carried by messages parked in the system-error area.
pub const SYSTEM_ERROR_HEADER: &str = "X-Mailguard-System-Error";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unparseable message: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Recipient(#[from] RecipientError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Quarantine(#[from] QuarantineError),
}

impl PipelineError {
    /// Errors that end the invocation without any fallback.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Parse(_))
    }

    /// Errors worth another full attempt. Parse and recipient failures
    /// would fail identically again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineError::Parse(_) | PipelineError::Recipient(_))
    }
}

/// A spam fingerprint seen for the first time, to be reported upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpamReport {
    pub fingerprint: String,
    pub category: Category,
    pub originating_address: Option<String>,
}

/// Verdict for one message, reused by every attempt over the same input.
#[derive(Debug, Clone)]
struct Classification {
    verdict: Option<ThreatVerdict>,
    report: Option<SpamReport>,
}

/// Terminal result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub action: Action,
    pub reason: String,
    pub delivery: Option<DeliveryOutcome>,
    pub stored_at: Option<PathBuf>,
    pub report: Option<SpamReport>,
    /// Set when the outcome came from the system-error fallback.
    pub fallback: bool,
}

impl ProcessOutcome {
    fn delivered(action: Action, reason: String, delivery: DeliveryOutcome) -> Self {
        Self {
            action,
            reason,
            delivery: Some(delivery),
            stored_at: None,
            report: None,
            fallback: false,
        }
    }

    fn stored(action: Action, reason: String, path: PathBuf) -> Self {
        Self {
            action,
            reason,
            delivery: None,
            stored_at: Some(path),
            report: None,
            fallback: false,
        }
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    hostname: String,
    engine: &'a DetectionEngine,
    backend: &'a dyn Deliver,
    aliases: &'a dyn AliasResolver,
    invocation: &'a Invocation,
    store: Option<&'a PolicyStore>,
    classifier: Classifier,
    resolver: RecipientResolver,
    classified: RefCell<Option<(Vec<u8>, Classification)>>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        engine: &'a DetectionEngine,
        backend: &'a dyn Deliver,
        aliases: &'a dyn AliasResolver,
        invocation: &'a Invocation,
    ) -> Self {
        Self {
            config,
            hostname: config.mail.hostname(),
            engine,
            backend,
            aliases,
            invocation,
            store: None,
            classifier: Classifier::today(config.hash_secret()),
            resolver: RecipientResolver::new(config.mail.recipient_env.clone(), config.mail.domain.clone()),
            classified: RefCell::new(None),
        }
    }

    pub fn with_store(mut self, store: Option<&'a PolicyStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    fn stats(&self) -> StatisticsCollector<'a> {
        StatisticsCollector::new(self.store)
    }

    fn dispatcher(&self) -> Dispatcher<'a> {
        Dispatcher::new(self.backend, &self.hostname)
    }

    /// One complete attempt over the raw input.
    pub fn process(&self, raw: &[u8], attempt: u32) -> Result<ProcessOutcome, PipelineError> {
        let message = ParsedMessage::parse(raw)?;
        let recipient = self.resolver.resolve(message.headers(), self.invocation)?.address;
        let sender = resolve_sender(message.headers(), self.invocation);
        let envelope = Envelope::new(sender.clone().unwrap_or_default(), recipient.clone());

        if message.headers().contains(PROCESSED_HEADER) {
            log::info!("Message already carries {PROCESSED_HEADER}, delivering unchanged");
            let delivery = self.dispatcher().dispatch(message.to_outgoing(), &envelope, attempt)?;
            return Ok(ProcessOutcome::delivered(
                Action::Allow,
                "already processed".to_string(),
                delivery,
            ));
        }

        let Classification { verdict, report } = self.classify(raw, &message);
        let decision = DispositionRouter::new(self.config).decide(&message, verdict.as_ref());

        let mut outcome = match decision.action {
            Action::Allow | Action::Headers => {
                let delivery = self.dispatcher().dispatch(decision.message, &envelope, attempt)?;
                ProcessOutcome::delivered(decision.action, decision.reason, delivery)
            }
            Action::Quarantine => {
                let quarantine = SpamQuarantine::new(
                    self.aliases,
                    &self.config.spam.maildir_path_template,
                    &self.config.spam.quarantine_folder,
                    &self.hostname,
                );
                match quarantine.store(&recipient, &decision.message.to_bytes()) {
                    Ok(path) => ProcessOutcome::stored(Action::Quarantine, decision.reason, path),
                    Err(e) => {
                        log::error!("Quarantine for {recipient} failed, rejecting instead: {e}");
                        let reason = format!("{} (quarantine failed: {e})", decision.reason);
                        self.reject(&message, sender.as_deref(), &recipient, reason, attempt)?
                    }
                }
            }
            Action::Reject => self.reject(&message, sender.as_deref(), &recipient, decision.reason, attempt)?,
        };

        outcome.report = report;
        let stats = self.stats();
        stats.record_event(StatEvent::EmailProcessed);
        stats.record_event(match outcome.action {
            Action::Allow => StatEvent::Allowed,
            Action::Headers => StatEvent::Tagged,
            Action::Quarantine => StatEvent::Quarantined,
            Action::Reject => StatEvent::Rejected,
        });
        Ok(outcome)
    }

    /// Classify once per input. Later attempts over the same bytes reuse the
    /// first result so fingerprint counters and reports are not repeated.
    fn classify(&self, raw: &[u8], message: &ParsedMessage) -> Classification {
        let mut cached = self.classified.borrow_mut();
        if let Some((seen, classification)) = cached.as_ref() {
            if seen.as_slice() == raw {
                log::debug!("Reusing classification from an earlier attempt");
                return classification.clone();
            }
        }
        let classification = self.classify_message(message);
        *cached = Some((raw.to_vec(), classification.clone()));
        classification
    }

    /// Known fingerprint first, the rule engine otherwise. Store failures
    /// only disable the fingerprint layer. Only spam and clean verdicts are
    /// fingerprinted; phishing and virus verdicts always come from the rules.
    fn classify_message(&self, message: &ParsedMessage) -> Classification {
        let body = message.decoded_body();
        let subject = message.subject();
        let fingerprinting = self.store.filter(|_| self.config.spam.hash_detection);

        let fingerprint = match fingerprinting
            .map(|_| self.classifier.fingerprint(subject, &body))
            .transpose()
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                log::warn!("Cannot fingerprint message, using rules only: {e}");
                None
            }
        };
        if let (Some(store), Some(fingerprint)) = (fingerprinting, &fingerprint) {
            match self.classifier.lookup(store, fingerprint) {
                Ok(Some(hit)) => {
                    log::info!(
                        "Fingerprint {} known as {} (seen {} times{})",
                        fingerprint.combined,
                        hit.verdict,
                        hit.occurrence_count,
                        if hit.migrated { ", migrated" } else { "" }
                    );
                    self.stats().record_event(StatEvent::FingerprintHit);
                    let verdict = match hit.verdict {
                        Verdict::Spam => Some(ThreatVerdict::known_spam(
                            self.config.spam.threshold,
                            &fingerprint.combined_hash(),
                        )),
                        Verdict::Clean => None,
                    };
                    return Classification { verdict, report: None };
                }
                Ok(None) => {}
                Err(e) => log::warn!("Fingerprint lookup failed, using rules only: {e}"),
            }
        }

        let content = MessageContent::new(message.headers(), body.clone());
        let results = self.engine.analyze_all(&content);
        let stats = self.stats();
        for rule in results.iter().flat_map(|r| r.matches.iter()) {
            stats.record_event(StatEvent::RuleMatch {
                rule_name: rule.algorithm_name.clone(),
            });
        }
        let verdict = ThreatVerdict::from_results(&results);

        let recorded = match &verdict {
            None => Some(Verdict::Clean),
            Some(v) if v.category == Category::Spam => Some(Verdict::Spam),
            Some(v) => {
                log::debug!("Not fingerprinting {} verdict", v.category);
                None
            }
        };

        let mut report = None;
        if let (Some(store), Some(fingerprint), Some(recorded)) = (fingerprinting, &fingerprint, recorded) {
            match self
                .classifier
                .record_fingerprint(store, fingerprint, subject, &body, recorded)
            {
                Ok(outcome) if outcome.created && recorded == Verdict::Spam => {
                    report = verdict.as_ref().map(|v| SpamReport {
                        fingerprint: fingerprint.combined_hash(),
                        category: v.category,
                        originating_address: originating_address(message.headers(), self.invocation),
                    });
                }
                Ok(_) => {}
                Err(e) => log::warn!("Failed to record fingerprint: {e}"),
            }
        }
        Classification { verdict, report }
    }

    /// Bounce to the sender through the normal backend. Without a sender
    /// the message goes to the system-error area.
    fn reject(
        &self,
        message: &ParsedMessage,
        sender: Option<&str>,
        recipient: &str,
        reason: String,
        attempt: u32,
    ) -> Result<ProcessOutcome, PipelineError> {
        let Some(sender) = sender else {
            log::warn!("Rejected message has no sender to bounce to, holding it instead");
            let path = self.hold(message.to_outgoing(), &format!("rejected without sender: {reason}"))?;
            return Ok(ProcessOutcome::stored(Action::Reject, reason, path));
        };

        let bounce = build_bounce(
            &self.hostname,
            sender,
            recipient,
            &self.config.spam.bounce_message,
            &reason,
            message,
        );
        let delivery = self
            .dispatcher()
            .dispatch(bounce, &Envelope::new("", sender), attempt)?;
        log::info!("Bounced message for {recipient} to {sender}");
        Ok(ProcessOutcome::delivered(Action::Reject, reason, delivery))
    }

    /// Park a message in the system-error area with the error attached.
    fn hold(&self, mut message: OutgoingMessage, error: &str) -> Result<PathBuf, QuarantineError> {
        let detail: String = error.chars().map(|c| if c.is_control() { ' ' } else { c }).collect();
        message.add_header(SYSTEM_ERROR_HEADER, &detail);
        let writer = MaildirWriter::new(&self.hostname);
        let path = writer.write(
            &self.config.error.quarantine_dir,
            None,
            &message.to_bytes(),
        )?;
        log::warn!("Message held in system-error area: {}", path.display());
        Ok(path)
    }
}

pub struct Supervisor<'a, S> {
    pipeline: Pipeline<'a>,
    retry: Retry<S>,
    error_log: ErrorLog,
}

impl<'a> Supervisor<'a, fn(Duration)> {
    pub fn blocking(pipeline: Pipeline<'a>, error_log: ErrorLog) -> Self {
        let error = &pipeline.config.error;
        let retry = Retry::blocking(error.max_retries, error.retry_delay());
        Self {
            pipeline,
            retry,
            error_log,
        }
    }
}

impl<'a, S: FnMut(Duration)> Supervisor<'a, S> {
    pub fn new(pipeline: Pipeline<'a>, sleep: S, error_log: ErrorLog) -> Self {
        let error = &pipeline.config.error;
        let retry = Retry::new(error.max_retries, error.retry_delay(), sleep);
        Self {
            pipeline,
            retry,
            error_log,
        }
    }

    /// Drive the message to a terminal outcome. Only returns an error when
    /// no disposition at all could be reached.
    pub fn run(&mut self, raw: &[u8]) -> Result<ProcessOutcome, PipelineError> {
        let pipeline = &self.pipeline;
        let error_log = &self.error_log;
        let result = self.retry.run(
            |attempt| {
                pipeline.process(raw, attempt).map_err(|e| {
                    error_log.record(attempt, &e);
                    e
                })
            },
            PipelineError::is_retryable,
        );

        match result {
            Ok((outcome, attempts)) => {
                log::info!("Finished with {} after {attempts} attempt(s): {}", outcome.action, outcome.reason);
                Ok(outcome)
            }
            Err(RetryError { attempts, error }) if error.is_fatal() => {
                log::error!("Giving up after {attempts} attempt(s): {error}");
                pipeline.stats().record_event(StatEvent::SystemError);
                Err(error)
            }
            Err(RetryError { attempts, error }) => {
                pipeline.stats().record_event(StatEvent::SystemError);
                self.fallback(raw, &error, attempts + 1)
            }
        }
    }

    fn fallback(&self, raw: &[u8], error: &PipelineError, attempt: u32) -> Result<ProcessOutcome, PipelineError> {
        let pipeline = &self.pipeline;
        let config = &pipeline.config.error;
        let message = ParsedMessage::parse(raw)?;
        let detail = error.to_string();
        log::warn!("Applying system-error policy {:?}: {detail}", config.on_system_error);

        let attempted = match config.on_system_error {
            OnSystemError::Pass => self.pass_through(&message, attempt),
            OnSystemError::Fail => self.bounce_error(&message, &detail, attempt),
            OnSystemError::Quarantine => None,
        };
        if let Some(mut outcome) = attempted {
            outcome.fallback = true;
            return Ok(outcome);
        }

        match pipeline.hold(message.to_outgoing(), &detail) {
            Ok(path) => Ok(ProcessOutcome {
                action: Action::Quarantine,
                reason: format!("system error: {detail}"),
                delivery: None,
                stored_at: Some(path),
                report: None,
                fallback: true,
            }),
            Err(e) => {
                self.error_log.record(attempt, &e);
                Err(PipelineError::Quarantine(e))
            }
        }
    }

    /// Deliver unfiltered. `None` when that is not possible either.
    fn pass_through(&self, message: &ParsedMessage, attempt: u32) -> Option<ProcessOutcome> {
        let pipeline = &self.pipeline;
        let recipient = match pipeline.resolver.resolve(message.headers(), pipeline.invocation) {
            Ok(resolved) => resolved.address,
            Err(e) => {
                log::warn!("Cannot pass message through: {e}");
                return None;
            }
        };
        let sender = resolve_sender(message.headers(), pipeline.invocation).unwrap_or_default();

        let mut outgoing = message.to_outgoing();
        if pipeline.config.error.fail_safe_mode {
            outgoing.append_footer(&pipeline.config.error.fail_safe_footer);
        }
        match pipeline
            .dispatcher()
            .dispatch(outgoing, &Envelope::new(sender, recipient), attempt)
        {
            Ok(delivery) => Some(ProcessOutcome::delivered(
                Action::Allow,
                "delivered unfiltered after system error".to_string(),
                delivery,
            )),
            Err(e) => {
                self.error_log.record(attempt, &e);
                None
            }
        }
    }

    fn bounce_error(&self, message: &ParsedMessage, detail: &str, attempt: u32) -> Option<ProcessOutcome> {
        let pipeline = &self.pipeline;
        let Some(sender) = resolve_sender(message.headers(), pipeline.invocation) else {
            log::warn!("Cannot bounce after system error: no sender");
            return None;
        };
        let recipient = pipeline
            .resolver
            .resolve(message.headers(), pipeline.invocation)
            .map(|r| r.address)
            .unwrap_or_else(|_| "unknown recipient".to_string());

        let bounce = build_bounce(
            &pipeline.hostname,
            &sender,
            &recipient,
            &pipeline.config.spam.bounce_message,
            &format!("temporary system error: {detail}"),
            message,
        );
        match pipeline
            .dispatcher()
            .dispatch(bounce, &Envelope::new("", sender.clone()), attempt)
        {
            Ok(delivery) => Some(ProcessOutcome::delivered(
                Action::Reject,
                format!("bounced to {sender} after system error"),
                delivery,
            )),
            Err(e) => {
                self.error_log.record(attempt, &e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::FakeBackend;
    use crate::detection::{CategoryDescriptor, DetectionAlgorithm, DetectionType, RuleCache, RuleSource};
    use crate::quarantine::MapAliasResolver;
    use chrono::NaiveDate;

    const SPAM: &[u8] = b"From: Promo <promo@bad.example>\n\
        To: user@example.com\n\
        Subject: ***SPAM*** test\n\
        \n\
        Visit our casino today\n";

    const CLEAN: &[u8] = b"From: friend@example.org\n\
        To: user@example.com\n\
        Subject: Lunch\n\
        \n\
        See you at noon.\n";

    fn keyword(pattern: &str, score: u32) -> DetectionAlgorithm {
        DetectionAlgorithm {
            id: None,
            server_id: None,
            name: pattern.to_string(),
            category: Category::Spam,
            detection_type: DetectionType::Keyword,
            target: "subject,body".to_string(),
            pattern: pattern.to_string(),
            score,
            enabled: true,
            priority: 0,
            created_at: None,
            updated_at: None,
        }
    }

    fn engine(config: &Config, rules: Vec<DetectionAlgorithm>) -> DetectionEngine {
        let descriptors = Category::ALL
            .iter()
            .map(|&category| CategoryDescriptor {
                category,
                threshold: config.threshold(category),
            })
            .collect();
        DetectionEngine::new(descriptors, RuleCache::load(&[&rules as &dyn RuleSource]))
    }

    struct Harness {
        dir: tempfile::TempDir,
        config: Config,
        invocation: Invocation,
        aliases: MapAliasResolver,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config::default();
            config.mail.hostname = Some("mx.example.com".to_string());
            config.spam.hash_secret = Some("test-secret".to_string());
            config.spam.maildir_path_template = format!("{}/vmail/{{domain}}/{{user}}/Maildir", dir.path().display());
            config.error.quarantine_dir = dir.path().join("system-errors");
            config.error.log_path = Some(dir.path().join("errors.log"));
            Self {
                dir,
                config,
                invocation: Invocation::default(),
                aliases: MapAliasResolver::empty(),
            }
        }

        fn error_log(&self) -> ErrorLog {
            ErrorLog::new(self.config.error.log_path.clone())
        }

        fn error_log_lines(&self) -> usize {
            std::fs::read_to_string(self.dir.path().join("errors.log"))
                .map(|c| c.lines().count())
                .unwrap_or(0)
        }

        fn files_in(&self, relative: &str) -> Vec<PathBuf> {
            match std::fs::read_dir(self.dir.path().join(relative)) {
                Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    fn classifier() -> Classifier {
        Classifier::new("test-secret", NaiveDate::from_ymd_opt(2024, 6, 1).unwrap())
    }

    fn run(h: &Harness, engine: &DetectionEngine, backend: &FakeBackend, store: Option<&PolicyStore>, raw: &[u8]) -> Result<ProcessOutcome, PipelineError> {
        let pipeline = Pipeline::new(&h.config, engine, backend, &h.aliases, &h.invocation)
            .with_store(store)
            .with_classifier(classifier());
        Supervisor::new(pipeline, |_| {}, h.error_log()).run(raw)
    }

    #[test]
    fn test_backend_fails_twice_then_succeeds() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![]);
        let backend = FakeBackend::failing(2);
        let slept = RefCell::new(Vec::new());

        let pipeline = Pipeline::new(&h.config, &engine, &backend, &h.aliases, &h.invocation);
        let mut supervisor = Supervisor::new(pipeline, |d| slept.borrow_mut().push(d), h.error_log());
        let outcome = supervisor.run(CLEAN).unwrap();

        assert_eq!(outcome.action, Action::Allow);
        assert!(!outcome.fallback);
        assert_eq!(outcome.delivery.unwrap().attempt, 3);
        assert_eq!(*backend.calls.borrow(), 3);
        assert_eq!(backend.delivered.borrow().len(), 1);
        assert_eq!(h.error_log_lines(), 2);
        assert_eq!(*slept.borrow(), vec![Duration::from_secs(5); 2]);
    }

    #[test]
    fn test_always_failing_backend_with_quarantine_policy() {
        let mut h = Harness::new();
        h.config.error.on_system_error = OnSystemError::Quarantine;
        let engine = engine(&h.config, vec![]);
        let backend = FakeBackend::always_failing();

        let outcome = run(&h, &engine, &backend, None, CLEAN).unwrap();
        assert!(outcome.fallback);
        assert_eq!(outcome.action, Action::Quarantine);
        assert_eq!(*backend.calls.borrow(), 3);

        let held = h.files_in("system-errors/new");
        assert_eq!(held.len(), 1);
        let content = std::fs::read_to_string(&held[0]).unwrap();
        assert!(content.contains(SYSTEM_ERROR_HEADER));
        assert!(content.contains("See you at noon."));
    }

    #[test]
    fn test_pass_policy_delivers_with_warning_footer() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![]);
        // Three pipeline attempts fail, the pass-through succeeds.
        let backend = FakeBackend::failing(3);

        let outcome = run(&h, &engine, &backend, None, CLEAN).unwrap();
        assert!(outcome.fallback);
        assert_eq!(outcome.action, Action::Allow);
        let delivered = backend.delivered.borrow();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].0.contains(&h.config.error.fail_safe_footer));
    }

    #[test]
    fn test_fail_policy_bounces_error_to_sender() {
        let mut h = Harness::new();
        h.config.error.on_system_error = OnSystemError::Fail;
        let engine = engine(&h.config, vec![]);
        let backend = FakeBackend::failing(3);

        let outcome = run(&h, &engine, &backend, None, CLEAN).unwrap();
        assert_eq!(outcome.action, Action::Reject);
        let delivered = backend.delivered.borrow();
        assert_eq!(delivered[0].1, Envelope::new("", "friend@example.org"));
        assert!(delivered[0].0.contains("temporary system error"));
    }

    #[test]
    fn test_spam_is_quarantined_in_recipient_folder() {
        let mut h = Harness::new();
        h.config.spam.threshold = 70;
        h.config.spam.action = Action::Quarantine;
        let engine = engine(&h.config, vec![keyword("spam", 80)]);
        let backend = FakeBackend::new();

        let outcome = run(&h, &engine, &backend, None, SPAM).unwrap();
        assert_eq!(outcome.action, Action::Quarantine);
        assert_eq!(*backend.calls.borrow(), 0);

        let stored = h.files_in("vmail/example.com/user/Maildir/.Spam/new");
        assert_eq!(stored.len(), 1);
        assert_eq!(outcome.stored_at.as_ref(), Some(&stored[0]));
        let content = std::fs::read_to_string(&stored[0]).unwrap();
        assert!(content.contains("X-Mailguard-Quarantine: category=spam score=80 threshold=70"));
    }

    #[test]
    fn test_quarantine_failure_falls_back_to_reject() {
        let mut h = Harness::new();
        let blocker = h.dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        h.config.spam.maildir_path_template = format!("{}/{{user}}", blocker.display());
        h.config.spam.action = Action::Quarantine;
        let engine = engine(&h.config, vec![keyword("casino", 90)]);
        let backend = FakeBackend::new();

        let outcome = run(&h, &engine, &backend, None, SPAM).unwrap();
        assert_eq!(outcome.action, Action::Reject);
        assert!(outcome.reason.contains("quarantine failed"));
        let delivered = backend.delivered.borrow();
        assert_eq!(delivered[0].1, Envelope::new("", "promo@bad.example"));
    }

    #[test]
    fn test_same_day_resend_hits_fingerprint() {
        let h = Harness::new();
        let store = PolicyStore::open_in_memory().unwrap();
        let with_rules = engine(&h.config, vec![keyword("casino", 60)]);
        let backend = FakeBackend::new();

        let first = run(&h, &with_rules, &backend, Some(&store), SPAM).unwrap();
        assert_eq!(first.action, Action::Headers);
        let report = first.report.expect("new spam fingerprint is reported");
        assert_eq!(
            store.fingerprint(&report.fingerprint).unwrap().unwrap().occurrence_count,
            1
        );

        // No rules at all: only the fingerprint can classify the resend.
        let without_rules = engine(&h.config, vec![]);
        let second = run(&h, &without_rules, &backend, Some(&store), SPAM).unwrap();
        assert_eq!(second.action, Action::Headers);
        assert!(second.reason.contains("fingerprint match"));
        assert_eq!(second.report, None);
        assert_eq!(
            store.fingerprint(&report.fingerprint).unwrap().unwrap().occurrence_count,
            2
        );

        let (stats, _) = crate::statistics::get_stats(&store).unwrap();
        assert_eq!(stats.total_emails, 2);
        assert_eq!(stats.fingerprint_hits, 1);
        assert_eq!(stats.tagged, 2);
    }

    #[test]
    fn test_retried_delivery_classifies_once() {
        let h = Harness::new();
        let store = PolicyStore::open_in_memory().unwrap();
        let engine = engine(&h.config, vec![keyword("casino", 60)]);
        let backend = FakeBackend::failing(2);

        let outcome = run(&h, &engine, &backend, Some(&store), SPAM).unwrap();
        assert_eq!(outcome.action, Action::Headers);
        assert_eq!(outcome.delivery.as_ref().unwrap().attempt, 3);
        assert!(!outcome.reason.contains("fingerprint match"));
        assert!(backend.delivered.borrow()[0].0.contains("X-Spam-Score: 60"));

        let report = outcome.report.expect("first sighting is reported");
        assert_eq!(
            store.fingerprint(&report.fingerprint).unwrap().unwrap().occurrence_count,
            1
        );
        let (stats, rules) = crate::statistics::get_stats(&store).unwrap();
        assert_eq!(stats.total_emails, 1);
        assert_eq!(stats.fingerprint_hits, 0);
        assert_eq!(rules.iter().find(|r| r.rule_name == "casino").unwrap().matches, 1);
    }

    #[test]
    fn test_phishing_resend_is_rejected_again() {
        let mut h = Harness::new();
        h.config.detection.phishing_action = Some(Action::Reject);
        let store = PolicyStore::open_in_memory().unwrap();
        let mut lure = keyword("casino", 95);
        lure.category = Category::Phishing;
        let engine = engine(&h.config, vec![lure]);
        let backend = FakeBackend::new();

        let first = run(&h, &engine, &backend, Some(&store), SPAM).unwrap();
        assert_eq!(first.action, Action::Reject);
        assert_eq!(first.report, None);

        let second = run(&h, &engine, &backend, Some(&store), SPAM).unwrap();
        assert_eq!(second.action, Action::Reject);
        assert!(!second.reason.contains("fingerprint match"));

        let (stats, _) = crate::statistics::get_stats(&store).unwrap();
        assert_eq!(stats.fingerprint_hits, 0);
        assert_eq!(stats.rejected, 2);
    }

    #[test]
    fn test_eight_bit_message_is_delivered_byte_for_byte() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![]);
        let backend = FakeBackend::new();

        let raw = b"From: friend@example.org\nTo: user@example.com\nSubject: caf\xe9\n\nPrix: 10\xe9\n";
        let outcome = run(&h, &engine, &backend, None, raw).unwrap();
        assert_eq!(outcome.action, Action::Allow);

        let expected = b"From: friend@example.org\nTo: user@example.com\nSubject: caf\xe9\n\
            X-Mailguard-Processed: mx.example.com\n\nPrix: 10\xe9\n";
        assert_eq!(backend.raw.borrow()[0], expected.to_vec());
    }

    #[test]
    fn test_clean_message_gets_exactly_one_footer() {
        let mut h = Harness::new();
        h.config.spam.footer = Some("-- filtered by mailguard".to_string());
        let engine = engine(&h.config, vec![keyword("casino", 90)]);
        let backend = FakeBackend::new();

        let outcome = run(&h, &engine, &backend, None, CLEAN).unwrap();
        assert_eq!(outcome.action, Action::Allow);

        let delivered = backend.delivered.borrow();
        let (text, envelope) = &delivered[0];
        assert_eq!(envelope, &Envelope::new("friend@example.org", "user@example.com"));
        let body = text.split_once("\n\n").unwrap().1;
        assert_eq!(body, "See you at noon.\n-- filtered by mailguard\n");
    }

    #[test]
    fn test_headers_action_tags_subject() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![keyword("casino", 55)]);
        let backend = FakeBackend::new();

        run(&h, &engine, &backend, None, SPAM).unwrap();
        let delivered = backend.delivered.borrow();
        assert!(delivered[0].0.contains("X-Spam-Flag: YES"));
        assert!(delivered[0].0.contains("X-Spam-Level: **********"));
        assert!(delivered[0].0.contains("X-Mailguard-Processed: mx.example.com"));
    }

    #[test]
    fn test_reject_bounces_through_backend() {
        let mut h = Harness::new();
        h.config.spam.action = Action::Reject;
        let engine = engine(&h.config, vec![keyword("casino", 90)]);
        let backend = FakeBackend::new();

        let outcome = run(&h, &engine, &backend, None, SPAM).unwrap();
        assert_eq!(outcome.action, Action::Reject);
        let delivered = backend.delivered.borrow();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].1, Envelope::new("", "promo@bad.example"));
        assert!(delivered[0].0.contains(&h.config.spam.bounce_message));
    }

    #[test]
    fn test_reject_without_sender_is_held() {
        let mut h = Harness::new();
        h.config.spam.action = Action::Reject;
        let engine = engine(&h.config, vec![keyword("casino", 90)]);
        let backend = FakeBackend::new();

        let raw = b"To: user@example.com\nSubject: casino\n\nbody\n";
        let outcome = run(&h, &engine, &backend, None, raw).unwrap();
        assert_eq!(outcome.action, Action::Reject);
        assert!(outcome.stored_at.is_some());
        assert_eq!(*backend.calls.borrow(), 0);
        assert_eq!(h.files_in("system-errors/new").len(), 1);
    }

    #[test]
    fn test_already_processed_is_delivered_unchanged() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![keyword("casino", 90)]);
        let backend = FakeBackend::new();

        let raw = b"X-Mailguard-Processed: mx0\nTo: user@example.com\nSubject: casino\n\nbody\n";
        let outcome = run(&h, &engine, &backend, None, raw).unwrap();
        assert_eq!(outcome.reason, "already processed");
        assert_eq!(backend.delivered.borrow()[0].0, String::from_utf8_lossy(raw));
    }

    #[test]
    fn test_missing_recipient_goes_to_fallback_without_retry() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![]);
        let backend = FakeBackend::new();

        let raw = b"From: a@example.org\nSubject: hi\n\nbody\n";
        let outcome = run(&h, &engine, &backend, None, raw).unwrap();
        // Pass-through needs a recipient too, so the message is held.
        assert!(outcome.fallback);
        assert_eq!(outcome.action, Action::Quarantine);
        assert_eq!(h.error_log_lines(), 1);
        assert_eq!(h.files_in("system-errors/new").len(), 1);
    }

    #[test]
    fn test_unparseable_input_is_fatal() {
        let h = Harness::new();
        let engine = engine(&h.config, vec![]);
        let backend = FakeBackend::new();

        let err = run(&h, &engine, &backend, None, b"no separator here").unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(h.error_log_lines(), 1);
    }
}
