//! Wait primitives (C8, §4.8)
//!
//! Built directly on the subscription manager (C2): `watch` owns a
//! buffered channel and a background task that unsubscribes on
//! cancellation. That task never closes the channel itself -- doing
//! so would race with a callback already in flight.

use crate::email::Email;
use crate::error::{Error, Result};
use crate::inbox::Inbox;
use crate::strategy::InboxEmail;
use crate::subscription::SubscriptionManager;
use crate::transport::GatewayTransport;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WATCH_CHANNEL_CAPACITY: usize = 16;

/// Conjunction of optional match filters (§4.8): every filter that is
/// set must match for `matches` to return true.
#[derive(Clone, Default)]
pub struct MatchOptions {
    pub subject: Option<String>,
    pub subject_regex: Option<Regex>,
    pub from: Option<String>,
    pub from_regex: Option<Regex>,
    pub predicate: Option<Arc<dyn Fn(&Email) -> bool + Send + Sync>>,
}

impl MatchOptions {
    #[must_use]
    pub fn matches(&self, email: &Email) -> bool {
        if let Some(subject) = &self.subject {
            if &email.subject != subject {
                return false;
            }
        }
        if let Some(re) = &self.subject_regex {
            if !re.is_match(&email.subject) {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if &email.from != from {
                return false;
            }
        }
        if let Some(re) = &self.from_regex {
            if !re.is_match(&email.from) {
                return false;
            }
        }
        match &self.predicate {
            Some(predicate) => predicate(email),
            None => true,
        }
    }
}

impl std::fmt::Debug for MatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatchOptions")
            .field("subject", &self.subject)
            .field("subject_regex", &self.subject_regex)
            .field("from", &self.from)
            .field("from_regex", &self.from_regex)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct WaitForEmailCountResult {
    pub emails: Vec<Email>,
}

/// Subscribe to `inbox_hash` and return a buffered channel of
/// [`Email`] (§4.8, capacity 16). Drops the email if the buffer is
/// full rather than blocking the subscriber fan-out.
///
/// Subscribes synchronously before returning -- callers that scan
/// already-arrived emails right after calling this (§4.8 point (a)
/// then (b)) depend on the subscription already being live, or an
/// email notified between the scan and a subscription registered
/// later would be missed by both.
#[must_use]
pub async fn watch(
    subscriptions: &SubscriptionManager,
    inbox_hash: &str,
    cancel: CancellationToken,
) -> mpsc::Receiver<Email> {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

    let handle = subscriptions
        .subscribe(inbox_hash, Arc::new(move |email| {
            let _ = tx.try_send(email);
        }))
        .await;

    tokio::spawn(async move {
        cancel.cancelled().await;
        handle.unsubscribe().await;
    });

    rx
}

/// Loop over `watch`, invoking `f` for each email until `cancel`
/// fires or the subscription's sender is dropped.
pub async fn watch_func(
    subscriptions: &SubscriptionManager,
    inbox_hash: &str,
    cancel: CancellationToken,
    mut f: impl FnMut(Email) + Send,
) {
    let mut rx = watch(subscriptions, inbox_hash, cancel.clone()).await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            email = rx.recv() => match email {
                Some(email) => f(email),
                None => return,
            },
        }
    }
}

/// (§4.8): subscribe first, scan already-arrived emails for a match,
/// then wait on the channel until a match or `timeout` elapses.
pub async fn wait_for_email(
    transport: &dyn GatewayTransport,
    inbox: &Inbox,
    subscriptions: &SubscriptionManager,
    opts: &MatchOptions,
    timeout: Duration,
) -> Result<Email> {
    let cancel = CancellationToken::new();
    let mut rx = watch(subscriptions, &inbox.inbox_hash, cancel.clone()).await;

    if let Some(email) = scan_existing(transport, inbox, opts).await?.into_iter().next() {
        cancel.cancel();
        return Ok(email);
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                cancel.cancel();
                return Err(Error::Timeout);
            }
            email = rx.recv() => match email {
                Some(email) if opts.matches(&email) => {
                    cancel.cancel();
                    return Ok(email);
                }
                Some(_) => {}
                None => {
                    cancel.cancel();
                    return Err(Error::Timeout);
                }
            },
        }
    }
}

/// Accumulate up to `n` distinct (by id) matching emails (§4.8).
/// `n == 0` returns immediately with an empty list; `n < 0` is a
/// usage error.
pub async fn wait_for_email_count(
    transport: &dyn GatewayTransport,
    inbox: &Inbox,
    subscriptions: &SubscriptionManager,
    opts: &MatchOptions,
    n: i64,
    timeout: Duration,
) -> Result<WaitForEmailCountResult> {
    if n < 0 {
        return Err(Error::NegativeCount(n));
    }
    if n == 0 {
        return Ok(WaitForEmailCountResult { emails: Vec::new() });
    }
    let target = usize::try_from(n).unwrap_or(usize::MAX);

    let cancel = CancellationToken::new();
    let mut rx = watch(subscriptions, &inbox.inbox_hash, cancel.clone()).await;

    let mut seen_ids = HashSet::new();
    let mut emails = Vec::new();

    for email in scan_existing(transport, inbox, opts).await? {
        if seen_ids.insert(email.id.clone()) {
            emails.push(email);
            if emails.len() == target {
                cancel.cancel();
                return Ok(WaitForEmailCountResult { emails });
            }
        }
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => {
                cancel.cancel();
                return Err(Error::Timeout);
            }
            email = rx.recv() => match email {
                Some(email) if opts.matches(&email) && seen_ids.insert(email.id.clone()) => {
                    emails.push(email);
                    if emails.len() == target {
                        cancel.cancel();
                        return Ok(WaitForEmailCountResult { emails });
                    }
                }
                Some(_) => {}
                None => {
                    cancel.cancel();
                    return Err(Error::Timeout);
                }
            },
        }
    }
}

/// Fetch current emails and return the matching ones, ordered the
/// same way the sync engine orders delivery (ascending `received_at`,
/// ties by id). Per-email fetch/decrypt failures are skipped rather
/// than aborting the whole scan.
async fn scan_existing(
    transport: &dyn GatewayTransport,
    inbox: &Inbox,
    opts: &MatchOptions,
) -> Result<Vec<Email>> {
    let metadata = transport.get_emails(&inbox.email_address, false).await?;
    let mut matched = Vec::new();
    for meta in metadata {
        match crate::sync::fetch_and_decrypt(inbox, transport, &meta.id).await {
            Ok(email) if opts.matches(&email) => matched.push(email),
            Ok(_) => {}
            Err(err) => tracing::warn!(
                inbox = %inbox.email_address,
                email_id = %meta.id,
                error = %err,
                "skipping email while scanning for an existing match"
            ),
        }
    }
    matched.sort_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)));
    Ok(matched)
}

/// Multi-inbox fan-in variant (§4.8): one channel of `{inbox, email}`
/// events across every hash in `inbox_hashes`.
///
/// Subscribes to every hash synchronously before returning, same
/// reasoning as [`watch`].
#[must_use]
pub async fn watch_inboxes(
    subscriptions: &SubscriptionManager,
    inbox_hashes: Vec<String>,
    cancel: CancellationToken,
) -> mpsc::Receiver<InboxEmail> {
    let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);

    for inbox_hash in inbox_hashes {
        let tx = tx.clone();
        let hash_for_cb = inbox_hash.clone();

        let handle = subscriptions
            .subscribe(&inbox_hash, Arc::new(move |email| {
                let _ = tx.try_send(InboxEmail {
                    inbox_hash: hash_for_cb.clone(),
                    email,
                });
            }))
            .await;

        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            handle.unsubscribe().await;
        });
    }

    rx
}
