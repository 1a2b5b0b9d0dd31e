//! Poll loop: scans every configured folder on a fixed interval and
//! replies to each message at most once per successful handling.
//!
//! Each cycle:
//! 1. Opens one mail session
//! 2. For each folder, in configuration order: select, list every message
//! 3. For each message not yet in the dedup store: draft → confirm → send,
//!    then mark it handled
//! 4. Saves the dedup store once if anything changed
//!
//! Failures are contained: a folder that cannot be selected is skipped, a
//! message whose handling fails stays unmarked and is retried next cycle,
//! and a failed save is retried at the end of the next cycle. A process
//! killed between marking and saving re-handles those messages on restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::MailError;
use crate::mail::{MailMessage, MailSession, MailSource, ReplySender};
use crate::pipeline::confirm::{Confirmer, Decision};
use crate::pipeline::drafter::ReplyDrafter;
use crate::store::DedupStore;

/// Where the poller currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    /// Between cycles.
    Idle,
    ScanningFolder(String),
    HandlingMessage(String, u32),
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Whether a mail session could be opened.
    pub connected: bool,
    /// Messages marked handled this cycle (sent or declined).
    pub handled: usize,
    /// Messages whose handling failed; they stay unmarked.
    pub failed: usize,
    /// Drafts that fell back to the static reply.
    pub fallbacks: usize,
    /// Folders skipped because they could not be selected or listed.
    pub skipped_folders: Vec<String>,
    /// Whether the dedup store was written.
    pub saved: bool,
    /// Whether shutdown interrupted the cycle.
    pub interrupted: bool,
}

/// Waits out the interval between cycles.
#[async_trait]
pub trait Pacer: Send + Sync {
    async fn wait(&self, interval: Duration);
}

/// Real-time pacing.
pub struct TokioPacer;

#[async_trait]
impl Pacer for TokioPacer {
    async fn wait(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

/// Collaborators the poller drives.
pub struct PollerDeps {
    pub source: Arc<dyn MailSource>,
    pub drafter: Arc<dyn ReplyDrafter>,
    pub confirmer: Arc<dyn Confirmer>,
    pub sender: Arc<dyn ReplySender>,
    pub pacer: Arc<dyn Pacer>,
}

/// Poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Folders to scan, in order.
    pub folders: Vec<String>,
    /// Our own address, shown when confirming.
    pub from_address: String,
    pub interval: Duration,
}

impl PollerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            folders: config.folder_names(),
            from_address: config.email.address.clone(),
            interval: config.check_interval,
        }
    }
}

/// Resolves once shutdown is requested. Never resolves if the sender is gone.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// The poll loop.
pub struct Poller {
    config: PollerConfig,
    source: Arc<dyn MailSource>,
    drafter: Arc<dyn ReplyDrafter>,
    confirmer: Arc<dyn Confirmer>,
    sender: Arc<dyn ReplySender>,
    pacer: Arc<dyn Pacer>,
    store: DedupStore,
    /// Marked since the last successful save.
    dirty: bool,
    state: watch::Sender<PollState>,
    shutdown: watch::Receiver<bool>,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        deps: PollerDeps,
        store: DedupStore,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            config,
            source: deps.source,
            drafter: deps.drafter,
            confirmer: deps.confirmer,
            sender: deps.sender,
            pacer: deps.pacer,
            store,
            dirty: false,
            state,
            shutdown,
        }
    }

    pub fn store(&self) -> &DedupStore {
        &self.store
    }

    pub fn state(&self) -> PollState {
        self.state.borrow().clone()
    }

    /// Follow state changes while a cycle runs.
    pub fn watch_state(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: PollState) {
        self.state.send_replace(state);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run cycles until shutdown is requested.
    ///
    /// Strictly periodic: a cycle, then a full interval, then the next cycle.
    /// Shutdown is honoured while waiting and at the confirmation prompt.
    pub async fn run(&mut self) {
        info!(
            folders = self.config.folders.len(),
            interval_secs = self.config.interval.as_secs(),
            "Poller started"
        );

        let mut cycles: u64 = 0;
        loop {
            if self.is_shutdown() {
                break;
            }
            self.run_cycle().await;
            cycles += 1;
            if self.is_shutdown() {
                break;
            }

            tokio::select! {
                _ = self.pacer.wait(self.config.interval) => {}
                _ = shutdown_requested(&mut self.shutdown) => break,
            }
        }

        info!(cycles, "Monitoring stopped");
    }

    /// Run one full cycle over every folder.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        match self.source.connect().await {
            Ok(mut session) => {
                report.connected = true;
                self.scan_folders(session.as_mut(), &mut report).await;
                session.logout().await;
            }
            Err(e) => {
                error!("Error: {e}. Will retry in next interval");
            }
        }

        self.set_state(PollState::Idle);
        self.flush(&mut report);

        if report.handled > 0 {
            info!(
                handled = report.handled,
                "Total: processed {} new email(s) across all folders", report.handled
            );
        } else if report.connected {
            info!("No new emails in any folder");
        }
        report
    }

    async fn scan_folders(&mut self, session: &mut dyn MailSession, report: &mut CycleReport) {
        let folders = self.config.folders.clone();
        for folder in folders {
            self.set_state(PollState::ScanningFolder(folder.clone()));

            if let Err(e) = session.select(&folder).await {
                warn!(folder = %folder, "Error processing folder: {e}");
                report.skipped_folders.push(folder);
                continue;
            }

            let messages = match session.list_all().await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(folder = %folder, "Error listing folder: {e}");
                    report.skipped_folders.push(folder);
                    continue;
                }
            };
            debug!(folder = %folder, count = messages.len(), "Folder listed");

            let mut processed = 0;
            for message in &messages {
                let uid = message.uid();
                if self.store.is_handled(&folder, uid) {
                    continue;
                }
                self.set_state(PollState::HandlingMessage(folder.clone(), uid));
                info!(
                    folder = %folder,
                    uid,
                    from = message.sender(),
                    subject = message.subject(),
                    date = ?message.date(),
                    "New email detected"
                );

                match self.handle_message(&folder, message.as_ref(), report).await {
                    Ok(Some(_)) => {
                        self.store.mark_handled(&folder, uid);
                        self.dirty = true;
                        processed += 1;
                        report.handled += 1;
                    }
                    Ok(None) => {
                        info!(folder = %folder, uid, "Shutdown requested, leaving message for next run");
                        report.interrupted = true;
                        return;
                    }
                    Err(e) => {
                        error!(folder = %folder, uid, "Error processing email: {e}");
                        report.failed += 1;
                    }
                }
            }

            if processed > 0 {
                info!(folder = %folder, "Processed {processed} email(s)");
            }
        }
    }

    /// Draft, confirm and send one reply. `Ok(None)` means shutdown
    /// interrupted the confirmation prompt.
    async fn handle_message(
        &mut self,
        folder: &str,
        message: &dyn MailMessage,
        report: &mut CycleReport,
    ) -> Result<Option<Decision>, MailError> {
        let draft = self.drafter.draft(message, folder).await;
        if draft.is_fallback() {
            report.fallbacks += 1;
        }
        let reply = draft.into_content();

        let decision = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => return Ok(None),
            decision = self.confirmer.confirm(message, &reply, &self.config.from_address) => decision?,
        };

        match decision {
            Decision::Send => self.sender.send(message, &reply, folder).await?,
            Decision::Skip => info!(folder, uid = message.uid(), "Reply declined"),
        }
        Ok(Some(decision))
    }

    /// Persist the store if anything was marked since the last save.
    fn flush(&mut self, report: &mut CycleReport) {
        if !self.dirty {
            return;
        }
        match self.store.save() {
            Ok(()) => {
                self.dirty = false;
                report.saved = true;
            }
            Err(e) => {
                error!("Failed to save state: {e}. Will retry next cycle");
            }
        }
    }
}
