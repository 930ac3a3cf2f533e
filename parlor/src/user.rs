//! Per-connection participant state and delivery queue.
//!
//! Every [`User`] owns a small bounded queue of outbound messages drained
//! by exactly one [`User::consume`] task. [`User::send`] never waits:
//! overflow is held in order behind the queue, and if the queue makes no
//! progress for the configured timeout the user is closed instead of
//! stalling whoever is sending. Closing is one-way and idempotent.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::key::PublicKey;
use crate::message::Message;
use crate::set::{Set, SetError};
use crate::theme::Theme;

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 24;

/// Errors returned by [`User`] operations.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    /// The user's screen is closed; nothing more will be delivered.
    #[error("user closed")]
    Closed,

    /// The highlight pattern did not compile.
    #[error("invalid highlight pattern: {0}")]
    InvalidHighlight(#[from] regex::Error),
}

/// Rendering preferences, read as one snapshot per rendered line.
#[derive(Debug, Clone, Default)]
pub struct UserConfig {
    /// Pattern whose matches are restyled in public messages.
    pub highlight: Option<Regex>,
    /// Ring the terminal bell on highlights and private messages.
    pub bell: bool,
    /// Hide room announcements.
    pub quiet: bool,
    /// Prefix lines with `[HH:MM]`.
    pub timestamp: bool,
    /// Colour theme; `None` renders without colour.
    pub theme: Option<Theme>,
    /// Offset mixed into name colouring.
    pub seed: u64,
}

/// What the transport knows about the connecting client.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Credential presented at connect time.
    pub key: Option<PublicKey>,
    /// Remote address.
    pub addr: Option<SocketAddr>,
    /// Client version string.
    pub client: String,
}

/// Queue sizing for a user's outbound messages.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    /// Capacity of the screen queue.
    pub queue: usize,
    /// How long the queue may stay full before the user is closed.
    pub timeout: Duration,
    /// Messages held behind a full queue before the user is closed.
    pub backlog: usize,
}

/// Overflow behind a full screen queue.
#[derive(Default)]
struct Backlog {
    pending: VecDeque<Message>,
    full_since: Option<Instant>,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            queue: 5,
            timeout: Duration::from_secs(5),
            backlog: 256,
        }
    }
}

/// A chat participant and its screen.
pub struct User {
    id: Uuid,
    name: RwLock<String>,
    identity: Identity,
    joined: DateTime<Utc>,
    config: Mutex<UserConfig>,
    reply_to: Mutex<Option<Weak<User>>>,
    away: Mutex<Option<String>>,
    ignored: Set<String>,
    queue: mpsc::Sender<Message>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
    backlog: Mutex<Backlog>,
    backlog_limit: usize,
    timeout: Duration,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &*self.name.read())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl User {
    /// Creates an open user with an empty delivery queue.
    pub fn new(name: impl Into<String>, identity: Identity, delivery: &Delivery) -> Arc<Self> {
        let (queue, inbox) = mpsc::channel(delivery.queue.max(1));
        let (close_tx, _) = watch::channel(false);
        let id = Uuid::now_v7();
        #[allow(clippy::cast_possible_truncation)]
        let seed = id.as_u128() as u64;
        Arc::new(Self {
            id,
            name: RwLock::new(name.into()),
            identity,
            joined: Utc::now(),
            config: Mutex::new(UserConfig {
                seed,
                ..UserConfig::default()
            }),
            reply_to: Mutex::new(None),
            away: Mutex::new(None),
            ignored: Set::new(),
            queue,
            inbox: Mutex::new(Some(inbox)),
            backlog: Mutex::new(Backlog::default()),
            backlog_limit: delivery.backlog,
            timeout: delivery.timeout,
            closed: AtomicBool::new(false),
            close_tx,
        })
    }

    /// Unique session identifier.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current display name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Changes the display name. Room membership is keyed separately; use
    /// [`crate::room::Room::rename`] to rename a member.
    ///
    /// An active highlight is replaced by a literal match on the new name.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        {
            let mut cfg = self.config.lock();
            if cfg.highlight.is_some() {
                cfg.highlight = highlight_regex(&regex::escape(&name)).ok();
            }
        }
        *self.name.write() = name;
    }

    /// Connection details.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// When the user was created.
    #[must_use]
    pub const fn joined(&self) -> DateTime<Utc> {
        self.joined
    }

    /// Snapshot of the rendering configuration.
    pub fn config(&self) -> UserConfig {
        self.config.lock().clone()
    }

    /// Updates the configuration atomically with respect to rendering.
    pub fn set_config(&self, f: impl FnOnce(&mut UserConfig)) {
        f(&mut self.config.lock());
    }

    /// Whether announcements are hidden from this user.
    pub fn is_quiet(&self) -> bool {
        self.config.lock().quiet
    }

    /// Highlights whole-word matches of `pattern` in public messages.
    ///
    /// The pattern is used as a regular expression; callers wanting a
    /// literal match should escape it.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::InvalidHighlight`] if the pattern is invalid.
    pub fn set_highlight(&self, pattern: &str) -> Result<(), UserError> {
        let re = highlight_regex(pattern)?;
        self.config.lock().highlight = Some(re);
        Ok(())
    }

    /// The last user who sent this user a private message, if still alive.
    pub fn reply_to(&self) -> Option<Arc<Self>> {
        self.reply_to.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Records who `/reply` should answer.
    pub fn set_reply_to(&self, user: &Arc<Self>) {
        *self.reply_to.lock() = Some(Arc::downgrade(user));
    }

    /// Away reason, if set.
    pub fn away(&self) -> Option<String> {
        self.away.lock().clone()
    }

    /// Sets or clears the away reason.
    pub fn set_away(&self, reason: Option<String>) {
        *self.away.lock() = reason;
    }

    /// Stops delivery of messages from `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Collision`] if `name` is already ignored.
    pub fn ignore(&self, name: &str) -> Result<(), SetError> {
        self.ignored.add(name.to_string())
    }

    /// Resumes delivery of messages from `name`.
    ///
    /// # Errors
    ///
    /// Returns [`SetError::Missing`] if `name` was not ignored.
    pub fn unignore(&self, name: &str) -> Result<(), SetError> {
        self.ignored.remove(name).map(drop)
    }

    /// Whether messages from `name` are hidden.
    pub fn is_ignoring(&self, name: &str) -> bool {
        self.ignored.contains(name)
    }

    /// Ignored names, sorted.
    pub fn ignored(&self) -> Vec<String> {
        self.ignored.items()
    }

    /// Queues `msg` for this user's screen without waiting.
    ///
    /// When the queue is full the message goes to an ordered backlog that
    /// the screen drains as it frees space. The user is closed once the
    /// queue has stayed full for the delivery timeout, or the backlog
    /// passes its limit.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Closed`] if the user was already closed or has
    /// just been closed for falling behind.
    pub fn send(self: &Arc<Self>, msg: Message) -> Result<(), UserError> {
        if self.is_closed() {
            return Err(UserError::Closed);
        }
        let mut backlog = self.backlog.lock();
        let result = self.enqueue(&mut backlog, msg);
        drop(backlog);
        match result {
            Ok(Some(since)) => {
                self.arm_watchdog(since);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(reason) => {
                tracing::warn!(user = %self.name(), timeout = ?self.timeout, reason, "delivery stalled");
                self.close();
                Err(UserError::Closed)
            }
        }
    }

    /// Returns the instant the queue started being full when a watchdog
    /// needs arming.
    fn enqueue(&self, backlog: &mut Backlog, msg: Message) -> Result<Option<Instant>, &'static str> {
        self.refill(backlog)?;
        let msg = if backlog.pending.is_empty() {
            match self.queue.try_send(msg) {
                Ok(()) => return Ok(None),
                Err(TrySendError::Closed(_)) => return Err("screen gone"),
                Err(TrySendError::Full(msg)) => msg,
            }
        } else {
            msg
        };
        backlog.pending.push_back(msg);
        if backlog.pending.len() > self.backlog_limit {
            return Err("backlog full");
        }
        match backlog.full_since {
            Some(since) if since.elapsed() >= self.timeout => Err("queue full"),
            Some(_) => Ok(None),
            None => {
                let now = Instant::now();
                backlog.full_since = Some(now);
                Ok(Some(now))
            }
        }
    }

    /// Moves backlogged messages into freed queue slots, oldest first.
    /// Any progress restarts the full-queue clock.
    fn refill(&self, backlog: &mut Backlog) -> Result<(), &'static str> {
        let mut moved = false;
        while let Some(msg) = backlog.pending.pop_front() {
            match self.queue.try_send(msg) {
                Ok(()) => moved = true,
                Err(TrySendError::Full(msg)) => {
                    backlog.pending.push_front(msg);
                    if moved {
                        backlog.full_since = Some(Instant::now());
                    }
                    return Ok(());
                }
                Err(TrySendError::Closed(_)) => return Err("screen gone"),
            }
        }
        backlog.full_since = None;
        Ok(())
    }

    /// Closes the user once the queue has made no progress for the
    /// delivery timeout. Exits when the backlog empties.
    fn arm_watchdog(self: &Arc<Self>, since: Instant) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let user = Arc::downgrade(self);
        let timeout = self.timeout;
        runtime.spawn(async move {
            let mut since = since;
            loop {
                tokio::time::sleep_until(since + timeout).await;
                let Some(user) = user.upgrade() else {
                    return;
                };
                let full_since = user.backlog.lock().full_since;
                match full_since {
                    Some(current) if current == since => {
                        tracing::warn!(user = %user.name(), ?timeout, "delivery timed out");
                        user.close();
                        return;
                    }
                    Some(current) => since = current,
                    None => return,
                }
            }
        });
    }

    /// Whether the user has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the user. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_tx.send_replace(true);
        self.backlog.lock().pending.clear();
        tracing::debug!(user = %self.name(), "user closed");
    }

    /// Resolves once the user is closed.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Renders queued messages to `writer` until the user is closed.
    ///
    /// Each message is rendered with the configuration current at the time
    /// it is written, with line breaks sent as `\r\n`. A write failure
    /// closes the user. The writer is shut down on return. Only the first
    /// call consumes; later calls return immediately.
    pub async fn consume<W>(&self, mut writer: W)
    where
        W: AsyncWrite + Unpin + Send,
    {
        let Some(mut inbox) = self.inbox.lock().take() else {
            tracing::warn!(user = %self.name(), "screen already has a consumer");
            return;
        };

        loop {
            let msg = tokio::select! {
                biased;
                () = self.closed() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if self.refill(&mut self.backlog.lock()).is_err() {
                break;
            }
            let line = msg.render(self, &self.config()).replace('\n', "\r\n");
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\r\n").await?;
                writer.flush().await
            };
            if let Err(e) = written.await {
                tracing::debug!(user = %self.name(), error = %e, "screen write failed");
                self.close();
                break;
            }
        }

        inbox.close();
        let _ = writer.shutdown().await;
    }
}

/// Cleans a requested display name.
///
/// Control and whitespace characters are dropped and the result is cut to
/// [`MAX_NAME_LEN`] characters. May return an empty string.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control() && !c.is_whitespace())
        .take(MAX_NAME_LEN)
        .collect()
}

fn highlight_regex(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"\b({pattern})\b"))
}
