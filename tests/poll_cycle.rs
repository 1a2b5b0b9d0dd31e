//! End-to-end poll cycles against an in-memory mailbox.
//!
//! The fakes here stand in for the IMAP server, the SMTP relay and the
//! model so the orchestrator can be driven cycle by cycle.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::watch;

use support_responder::config::{Branding, FolderConfig};
use support_responder::error::{LlmError, MailError};
use support_responder::llm::{CompletionRequest, CompletionResponse, LlmProvider};
use support_responder::mail::{
    MailMessage, MailSession, MailSource, ParsedEmail, ReplyContent, ReplySender,
};
use support_responder::pipeline::{
    AutoApprove, Confirmer, CycleReport, Decision, LlmDrafter, Pacer, Poller, PollerConfig,
    PollerDeps,
};
use support_responder::store::DedupStore;

// ── Fake mailbox ────────────────────────────────────────────────────────

#[derive(Default)]
struct Mailbox {
    folders: BTreeMap<String, Vec<(u32, String, String)>>,
    broken_folders: HashSet<String>,
    offline: bool,
    logouts: usize,
}

impl Mailbox {
    fn deliver(&mut self, folder: &str, uid: u32, sender: &str, subject: &str) {
        self.folders
            .entry(folder.to_string())
            .or_default()
            .push((uid, sender.to_string(), subject.to_string()));
    }
}

#[derive(Clone, Default)]
struct FakeServer(Arc<Mutex<Mailbox>>);

struct FakeSession {
    server: FakeServer,
    selected: Option<String>,
}

#[async_trait]
impl MailSource for FakeServer {
    async fn connect(&self) -> Result<Box<dyn MailSession>, MailError> {
        if self.0.lock().unwrap().offline {
            return Err(MailError::Connect {
                host: "imap.test".into(),
                port: 993,
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeSession {
            server: self.clone(),
            selected: None,
        }))
    }
}

#[async_trait]
impl MailSession for FakeSession {
    async fn select(&mut self, folder: &str) -> Result<(), MailError> {
        let mailbox = self.server.0.lock().unwrap();
        if mailbox.broken_folders.contains(folder) {
            return Err(MailError::Select {
                folder: folder.to_string(),
                reason: "NO [NONEXISTENT] Unknown mailbox".into(),
            });
        }
        self.selected = Some(folder.to_string());
        Ok(())
    }

    async fn list_all(&mut self) -> Result<Vec<Box<dyn MailMessage>>, MailError> {
        let folder = self
            .selected
            .clone()
            .ok_or_else(|| MailError::Protocol("no folder selected".into()))?;
        let mailbox = self.server.0.lock().unwrap();
        Ok(mailbox
            .folders
            .get(&folder)
            .into_iter()
            .flatten()
            .map(|(uid, sender, subject)| {
                Box::new(
                    ParsedEmail::new(*uid, sender.as_str(), subject.as_str())
                        .with_text("Please help."),
                ) as Box<dyn MailMessage>
            })
            .collect())
    }

    async fn append(&mut self, _folder: &str, _raw: Vec<u8>) -> Result<(), MailError> {
        Ok(())
    }

    async fn logout(&mut self) {
        self.server.0.lock().unwrap().logouts += 1;
    }
}

// ── Fake relay ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct Sent {
    folder: String,
    uid: u32,
    to: String,
    subject: String,
    body: String,
}

#[derive(Default)]
struct FakeRelay {
    sent: Mutex<Vec<Sent>>,
    rejecting: Mutex<HashSet<u32>>,
}

impl FakeRelay {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    fn reject(&self, uid: u32) {
        self.rejecting.lock().unwrap().insert(uid);
    }

    fn accept_all(&self) {
        self.rejecting.lock().unwrap().clear();
    }
}

#[async_trait]
impl ReplySender for FakeRelay {
    async fn send(
        &self,
        original: &dyn MailMessage,
        reply: &ReplyContent,
        folder: &str,
    ) -> Result<(), MailError> {
        if self.rejecting.lock().unwrap().contains(&original.uid()) {
            return Err(MailError::SendFailed {
                to: original.sender().to_string(),
                reason: "451 try again later".into(),
            });
        }
        self.sent.lock().unwrap().push(Sent {
            folder: folder.to_string(),
            uid: original.uid(),
            to: original.sender().to_string(),
            subject: reply.subject.clone(),
            body: reply.body.clone(),
        });
        Ok(())
    }
}

// ── Fake model ──────────────────────────────────────────────────────────

struct StubLlm {
    healthy: bool,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if self.healthy {
            Ok(CompletionResponse {
                content: "Try resetting your password from the login page.".into(),
            })
        } else {
            Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "503 Service Unavailable".into(),
            })
        }
    }
}

/// Declines every reply.
struct AlwaysDecline;

#[async_trait]
impl Confirmer for AlwaysDecline {
    async fn confirm(
        &self,
        _original: &dyn MailMessage,
        _reply: &ReplyContent,
        _from: &str,
    ) -> Result<Decision, MailError> {
        Ok(Decision::Skip)
    }
}

/// Counts waits and requests shutdown after the last one.
struct BoundedPacer {
    remaining: Mutex<usize>,
    stop: watch::Sender<bool>,
}

#[async_trait]
impl Pacer for BoundedPacer {
    async fn wait(&self, _interval: Duration) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            let _ = self.stop.send(true);
        }
    }
}

struct NoWait;

#[async_trait]
impl Pacer for NoWait {
    async fn wait(&self, _interval: Duration) {}
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    server: FakeServer,
    relay: Arc<FakeRelay>,
    folders: Vec<String>,
}

impl Harness {
    fn new(folders: &[&str]) -> Self {
        Self {
            server: FakeServer::default(),
            relay: Arc::new(FakeRelay::default()),
            folders: folders.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn mailbox(&self) -> std::sync::MutexGuard<'_, Mailbox> {
        self.server.0.lock().unwrap()
    }

    fn drafter(&self, healthy: bool) -> Arc<LlmDrafter> {
        let folders: IndexMap<String, FolderConfig> = self
            .folders
            .iter()
            .map(|f| {
                (
                    f.clone(),
                    FolderConfig {
                        prompt: "Answer for {company_name}.".into(),
                        documentation_file: None,
                    },
                )
            })
            .collect();
        let branding = Branding {
            company_name: "Acme".into(),
            support_email: "help@acme.test".into(),
        };
        Arc::new(LlmDrafter::new(
            Arc::new(StubLlm { healthy }),
            folders,
            branding,
        ))
    }

    fn poller_with(
        &self,
        state_file: &Path,
        healthy: bool,
        confirmer: Arc<dyn Confirmer>,
        pacer: Arc<dyn Pacer>,
        shutdown: watch::Receiver<bool>,
    ) -> Poller {
        let store = DedupStore::load(state_file, &self.folders).unwrap();
        self.build(store, healthy, confirmer, pacer, shutdown)
    }

    fn build(
        &self,
        store: DedupStore,
        healthy: bool,
        confirmer: Arc<dyn Confirmer>,
        pacer: Arc<dyn Pacer>,
        shutdown: watch::Receiver<bool>,
    ) -> Poller {
        let config = PollerConfig {
            folders: self.folders.clone(),
            from_address: "help@acme.test".into(),
            interval: Duration::from_secs(60),
        };
        let deps = PollerDeps {
            source: Arc::new(self.server.clone()),
            drafter: self.drafter(healthy),
            confirmer,
            sender: self.relay.clone(),
            pacer,
        };
        Poller::new(config, deps, store, shutdown)
    }

    fn poller(&self, state_file: &Path, shutdown: watch::Receiver<bool>) -> Poller {
        self.poller_with(
            state_file,
            true,
            Arc::new(AutoApprove),
            Arc::new(NoWait),
            shutdown,
        )
    }
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn new_message_is_answered_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("processed_emails.json");
    let h = Harness::new(&["support"]);
    h.mailbox()
        .deliver("support", 42, "alice@example.com", "Cannot log in");

    let (_tx, rx) = watch::channel(false);
    let mut poller = h.poller(&state, rx);
    let report = poller.run_cycle().await;

    assert_eq!(
        report,
        CycleReport {
            connected: true,
            handled: 1,
            saved: true,
            ..CycleReport::default()
        }
    );
    let sent = h.relay.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].folder, "support");
    assert_eq!(sent[0].to, "alice@example.com");
    assert_eq!(sent[0].subject, "Re: Cannot log in");
    assert_eq!(
        read_json(&state),
        serde_json::json!({"support": {"processed_uids": [42]}})
    );
    assert_eq!(h.mailbox().logouts, 1);
}

#[tokio::test]
async fn restart_does_not_answer_twice() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 1, "a@example.com", "One");
    h.mailbox().deliver("support", 2, "b@example.com", "Two");

    let (_tx, rx) = watch::channel(false);
    h.poller(&state, rx.clone()).run_cycle().await;
    assert_eq!(h.relay.sent().len(), 2);

    h.mailbox().deliver("support", 3, "c@example.com", "Three");
    let report = h.poller(&state, rx).run_cycle().await;

    assert_eq!(report.handled, 1);
    let uids: Vec<u32> = h.relay.sent().iter().map(|s| s.uid).collect();
    assert_eq!(uids, vec![1, 2, 3]);
    assert_eq!(
        read_json(&state),
        serde_json::json!({"support": {"processed_uids": [1, 2, 3]}})
    );
}

#[tokio::test]
async fn broken_folder_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["billing", "archive", "support"]);
    {
        let mut mailbox = h.mailbox();
        mailbox.deliver("billing", 10, "a@example.com", "Invoice");
        mailbox.deliver("archive", 20, "b@example.com", "Old");
        mailbox.deliver("support", 30, "c@example.com", "Help");
        mailbox.broken_folders.insert("archive".into());
    }

    let (_tx, rx) = watch::channel(false);
    let mut poller = h.poller(&state, rx);
    let report = poller.run_cycle().await;

    assert_eq!(report.skipped_folders, vec!["archive".to_string()]);
    assert_eq!(report.handled, 2);
    let folders: Vec<String> = h.relay.sent().into_iter().map(|s| s.folder).collect();
    assert_eq!(folders, vec!["billing".to_string(), "support".to_string()]);
    assert!(!poller.store().is_handled("archive", 20));

    h.mailbox().broken_folders.clear();
    let report = poller.run_cycle().await;
    assert_eq!(report.handled, 1);
    assert!(poller.store().is_handled("archive", 20));
}

#[tokio::test]
async fn model_outage_still_sends_fallback_replies() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 5, "dana@example.com", "Refund");
    h.mailbox().deliver("support", 6, "erin@example.com", "RE: Refund");

    let (_tx, rx) = watch::channel(false);
    let mut poller = h.poller_with(
        &state,
        false,
        Arc::new(AutoApprove),
        Arc::new(NoWait),
        rx,
    );
    let report = poller.run_cycle().await;

    assert_eq!(report.handled, 2);
    assert_eq!(report.fallbacks, 2);
    let sent = h.relay.sent();
    assert_eq!(sent[0].subject, "Re: Refund");
    assert_eq!(sent[1].subject, "RE: Refund");
    assert!(sent[0].body.starts_with("Dear dana@example.com,"));
    assert!(sent[0].body.contains("Acme Support Team"));
}

#[tokio::test]
async fn failed_send_is_retried_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 7, "a@example.com", "First");
    h.mailbox().deliver("support", 8, "b@example.com", "Second");
    h.relay.reject(7);

    let (_tx, rx) = watch::channel(false);
    let mut poller = h.poller(&state, rx);

    let first = poller.run_cycle().await;
    assert_eq!(first.failed, 1);
    assert_eq!(first.handled, 1);
    assert!(!poller.store().is_handled("support", 7));
    assert!(poller.store().is_handled("support", 8));

    h.relay.accept_all();
    let second = poller.run_cycle().await;
    assert_eq!(second.failed, 0);
    assert_eq!(second.handled, 1);

    let uids: Vec<u32> = h.relay.sent().iter().map(|s| s.uid).collect();
    assert_eq!(uids, vec![8, 7]);
}

#[tokio::test]
async fn declined_reply_is_not_sent_but_not_asked_again() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 9, "spam@example.com", "WIN NOW");

    let (_tx, rx) = watch::channel(false);
    let mut poller = h.poller_with(
        &state,
        true,
        Arc::new(AlwaysDecline),
        Arc::new(NoWait),
        rx,
    );

    let report = poller.run_cycle().await;
    assert_eq!(report.handled, 1);
    assert!(h.relay.sent().is_empty());
    assert!(poller.store().is_handled("support", 9));
}

#[tokio::test]
async fn unreachable_server_skips_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 1, "a@example.com", "Hi");
    h.mailbox().offline = true;

    let (_tx, rx) = watch::channel(false);
    let mut poller = h.poller(&state, rx);
    let report = poller.run_cycle().await;

    assert!(!report.connected);
    assert_eq!(report.handled, 0);
    assert!(!state.exists());

    h.mailbox().offline = false;
    assert_eq!(poller.run_cycle().await.handled, 1);
}

#[tokio::test]
async fn empty_cycle_leaves_state_file_alone() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);

    let (_tx, rx) = watch::channel(false);
    let report = h.poller(&state, rx).run_cycle().await;

    assert!(report.connected);
    assert!(!report.saved);
    assert!(!state.exists());
}

#[tokio::test]
async fn failed_save_is_written_on_the_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the state directory should be.
    let blocker = dir.path().join("blocked");
    std::fs::write(&blocker, b"").unwrap();
    let state = blocker.join("state.json");

    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 4, "a@example.com", "Hi");

    let (_tx, rx) = watch::channel(false);
    let store = DedupStore::new(&state, &h.folders);
    let mut poller = h.build(store, true, Arc::new(AutoApprove), Arc::new(NoWait), rx);

    let first = poller.run_cycle().await;
    assert_eq!(first.handled, 1);
    assert!(!first.saved);
    assert!(poller.store().is_handled("support", 4));

    // Still blocked: the save is attempted again and fails again.
    let second = poller.run_cycle().await;
    assert_eq!(second.handled, 0);
    assert!(!second.saved);

    std::fs::remove_file(&blocker).unwrap();
    let third = poller.run_cycle().await;
    assert_eq!(third.handled, 0);
    assert!(third.saved);
    assert_eq!(
        read_json(&state),
        serde_json::json!({"support": {"processed_uids": [4]}})
    );
    assert_eq!(h.relay.sent().len(), 1);
}

#[tokio::test]
async fn run_stops_once_shutdown_is_requested() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    let h = Harness::new(&["support"]);
    h.mailbox().deliver("support", 1, "a@example.com", "Early");
    h.mailbox().deliver("support", 2, "b@example.com", "Late");

    let (tx, rx) = watch::channel(false);
    let pacer = Arc::new(BoundedPacer {
        remaining: Mutex::new(2),
        stop: tx,
    });
    let mut poller = h.poller_with(&state, true, Arc::new(AutoApprove), pacer, rx);
    poller.run().await;

    let uids: Vec<u32> = h.relay.sent().iter().map(|s| s.uid).collect();
    assert_eq!(uids, vec![1, 2]);
    assert_eq!(h.mailbox().logouts, 2);
    assert_eq!(
        read_json(&state),
        serde_json::json!({"support": {"processed_uids": [1, 2]}})
    );
}
