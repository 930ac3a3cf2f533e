//! The room: membership, ordering, and message routing.
//!
//! All room-visible events pass through one bounded queue drained by a
//! single [`Room::serve`] task, so every member observes them in the same
//! order. For each message the consumer decides who receives it and records
//! it in [`History`] exactly once, then hands it to the members' own
//! delivery queues. Handing off never waits, so a slow member cannot hold
//! up the room.
//!
//! Command handlers run on the consumer task. Messages they produce go
//! through [`Room::post`], which queues them to be handled right after the
//! current message instead of waiting on the bounded queue the consumer
//! itself drains.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

use crate::command::Commands;
use crate::history::{DEFAULT_HISTORY_LEN, History};
use crate::message::Message;
use crate::set::{Item, Set, SetError};
use crate::user::User;

/// Errors returned by [`Room`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// The room has been closed.
    #[error("room closed")]
    Closed,

    /// The name is already taken by another member.
    #[error("name already taken")]
    Collision,

    /// The user is not a member.
    #[error("not a member")]
    Missing,
}

impl From<SetError> for RoomError {
    fn from(e: SetError) -> Self {
        match e {
            SetError::Collision => Self::Collision,
            SetError::Missing => Self::Missing,
        }
    }
}

/// Room sizing.
#[derive(Debug, Clone, Copy)]
pub struct RoomConfig {
    /// Messages kept for replay to joining users.
    pub history_len: usize,
    /// Capacity of the broadcast queue.
    pub queue_len: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            history_len: DEFAULT_HISTORY_LEN,
            queue_len: 10,
        }
    }
}

/// A user's membership in the room.
///
/// The operator flag is shared between every copy of a member, so it
/// survives renames.
#[derive(Debug, Clone)]
pub struct Member {
    user: Arc<User>,
    key: String,
    op: Arc<Mutex<OpGrant>>,
}

/// Operator status of a member. A grant with `until` lapses at that instant.
#[derive(Debug, Clone, Copy, Default)]
struct OpGrant {
    active: bool,
    until: Option<Instant>,
}

impl OpGrant {
    fn holds(self, now: Instant) -> bool {
        self.active && self.until.is_none_or(|until| now < until)
    }
}

impl Item for Member {
    fn key(&self) -> &str {
        &self.key
    }
}

impl Member {
    fn new(user: Arc<User>, op: bool) -> Self {
        Self {
            key: user.name(),
            user,
            op: Arc::new(Mutex::new(OpGrant {
                active: op,
                until: None,
            })),
        }
    }

    /// The member's user.
    #[must_use]
    pub const fn user(&self) -> &Arc<User> {
        &self.user
    }

    /// Whether the member is a room operator.
    #[must_use]
    pub fn is_op(&self) -> bool {
        self.op.lock().holds(Instant::now())
    }
}

/// A chat room.
pub struct Room {
    topic: RwLock<String>,
    motd: RwLock<String>,
    history: History,
    members: Set<Member>,
    commands: Commands,
    queue: mpsc::Sender<Message>,
    inbox: Mutex<Option<mpsc::Receiver<Message>>>,
    deferred: Mutex<VecDeque<Message>>,
    dispatch: Mutex<()>,
    wake: Notify,
    shutdown: Notify,
    closed: AtomicBool,
    started: Instant,
}

impl Room {
    /// Creates an open room. Nothing is routed until [`Room::serve`] runs.
    #[must_use]
    pub fn new(config: RoomConfig, commands: Commands) -> Self {
        let (queue, inbox) = mpsc::channel(config.queue_len.max(1));
        Self {
            topic: RwLock::new(String::new()),
            motd: RwLock::new(String::new()),
            history: History::new(config.history_len),
            members: Set::new(),
            commands,
            queue,
            inbox: Mutex::new(Some(inbox)),
            deferred: Mutex::new(VecDeque::new()),
            dispatch: Mutex::new(()),
            wake: Notify::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            started: Instant::now(),
        }
    }

    /// Adds `user` to the room, replays recent history to it, and announces
    /// the join.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Closed`] if the room is closed, or
    /// [`RoomError::Collision`] if another member has the same name.
    pub async fn join(&self, user: Arc<User>, op: bool) -> Result<Member, RoomError> {
        if self.is_closed() {
            return Err(RoomError::Closed);
        }
        let member = Member::new(Arc::clone(&user), op);
        {
            // Broadcasts hold the gate from history append to fan-out, so
            // the replay and live delivery neither overlap nor reorder.
            let _gate = self.dispatch.lock();
            self.members.add(member.clone())?;
            for msg in self.history.get(self.history.capacity()) {
                if user.send(msg).is_err() {
                    break;
                }
            }
        }
        if self.is_closed() {
            let _ = self.members.remove(&member.key);
            return Err(RoomError::Closed);
        }

        let count = self.members.len();
        tracing::info!(user = %member.key, members = count, "joined room");
        self.send(Message::announce(format!(
            "{} joined. (Connected: {count})",
            member.key
        )))
        .await?;
        Ok(member)
    }

    /// Removes `user` from the room and announces the departure.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Missing`] if `user` is not a member, or
    /// [`RoomError::Closed`] if the room closed before the announcement
    /// could be queued.
    pub async fn leave(&self, user: &Arc<User>) -> Result<(), RoomError> {
        let name = user.name();
        match self.members.get(&name) {
            Ok(member) if Arc::ptr_eq(&member.user, user) => {}
            _ => return Err(RoomError::Missing),
        }
        self.members.remove(&name)?;
        tracing::info!(user = %name, "left room");
        self.send(Message::announce(format!("{name} left."))).await
    }

    /// Renames the member `user` to `name` and announces the change.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Missing`] if `user` is not a member, or
    /// [`RoomError::Collision`] if another member already uses `name`.
    pub fn rename(&self, user: &Arc<User>, name: &str) -> Result<(), RoomError> {
        let old = user.name();
        let member = self.members.get(&old)?;
        if !Arc::ptr_eq(&member.user, user) {
            return Err(RoomError::Missing);
        }
        let renamed = Member {
            user: Arc::clone(user),
            key: name.to_string(),
            op: Arc::clone(&member.op),
        };
        self.members.replace(&old, renamed)?;
        user.set_name(name);
        tracing::info!(from = %old, to = name, "member renamed");
        self.post(Message::announce(format!("{old} is now known as {name}.")));
        Ok(())
    }

    /// Queues `msg` on the broadcast queue, waiting while it is full.
    ///
    /// # Errors
    ///
    /// Returns [`RoomError::Closed`] if the room is closed.
    pub async fn send(&self, msg: Message) -> Result<(), RoomError> {
        if self.is_closed() {
            return Err(RoomError::Closed);
        }
        self.queue.send(msg).await.map_err(|_| RoomError::Closed)
    }

    /// Queues `msg` to be handled after the message currently being
    /// handled. Never waits; meant for command handlers.
    pub fn post(&self, msg: Message) {
        if self.is_closed() {
            return;
        }
        self.deferred.lock().push_back(msg);
        self.wake.notify_one();
    }

    /// Runs the room's consumer until the room is closed.
    ///
    /// Must be running for anything sent to the room to be delivered. Only
    /// the first call consumes; later calls return immediately.
    pub async fn serve(&self) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            tracing::warn!("room is already being served");
            return;
        };
        tracing::debug!("room consumer started");

        while !self.is_closed() {
            let next = self.deferred.lock().pop_front();
            if let Some(msg) = next {
                self.handle(msg);
                continue;
            }
            tokio::select! {
                biased;
                () = self.shutdown.notified() => break,
                () = self.wake.notified() => {}
                msg = inbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
            }
        }

        inbox.close();
        let mut dropped = 0usize;
        while inbox.try_recv().is_ok() {
            dropped += 1;
        }
        dropped += self.deferred.lock().drain(..).count();
        tracing::debug!(dropped, "room consumer stopped");
    }

    fn handle(&self, msg: Message) {
        match msg {
            Message::Command(cmd) => {
                if let Err(e) = self.commands.run(self, &cmd) {
                    match &cmd.from {
                        Some(from) => {
                            tracing::debug!(user = %from.name(), command = %cmd.name, error = %e, "command failed");
                            self.post(Message::system(format!("Err: {e}"), Arc::clone(from)));
                        }
                        None => tracing::warn!(command = %cmd.name, error = %e, "ownerless command"),
                    }
                }
            }
            Message::Private(ref pm) => {
                let (from, to) = (Arc::clone(&pm.from), Arc::clone(&pm.to));
                if !to.is_ignoring(&from.name()) {
                    to.set_reply_to(&from);
                    deliver(&to, msg.clone());
                }
                if !Arc::ptr_eq(&from, &to) {
                    deliver(&from, msg);
                }
            }
            Message::System(ref m) => {
                let to = Arc::clone(&m.to);
                deliver(&to, msg);
            }
            Message::Public(_) | Message::Emote(_) | Message::Announce(_) => {
                self.broadcast(&msg);
            }
        }
    }

    fn broadcast(&self, msg: &Message) {
        let sender = msg.from().cloned();
        let sender_name = sender.as_ref().map(|u| u.name());
        let announce = matches!(msg, Message::Announce(_));

        let _gate = self.dispatch.lock();
        self.history.add(msg.clone());
        let targets: Vec<Arc<User>> = self
            .members
            .items()
            .into_iter()
            .map(|member| member.user)
            .filter(|user| {
                if sender.as_ref().is_some_and(|s| Arc::ptr_eq(s, user)) {
                    return false;
                }
                if announce && user.is_quiet() {
                    return false;
                }
                !sender_name.as_ref().is_some_and(|n| user.is_ignoring(n))
            })
            .collect();

        tracing::debug!(recipients = targets.len(), "broadcasting");
        for user in &targets {
            deliver(user, msg.clone());
        }
    }

    /// Whether the room has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every member and stops the consumer. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for member in self.members.items() {
            member.user.close();
        }
        let count = self.members.clear();
        self.shutdown.notify_one();
        tracing::info!(members = count, "room closed");
    }

    /// The member named `name`.
    pub fn member(&self, name: &str) -> Option<Arc<User>> {
        self.members.get(name).ok().map(|member| member.user)
    }

    /// Snapshot of all members, ordered by name.
    pub fn members(&self) -> Vec<Member> {
        self.members.items()
    }

    /// Member names, ordered.
    pub fn names(&self) -> Vec<String> {
        self.names_prefix("")
    }

    /// Member names starting with `prefix`, case-insensitively.
    pub fn names_prefix(&self, prefix: &str) -> Vec<String> {
        self.members
            .list_prefix(prefix)
            .into_iter()
            .map(|member| member.key)
            .collect()
    }

    /// Whether `user` is a member with operator status.
    pub fn is_op(&self, user: &Arc<User>) -> bool {
        self.members
            .get(&user.name())
            .is_ok_and(|member| Arc::ptr_eq(&member.user, user) && member.is_op())
    }

    /// Grants or revokes room operator status. Returns `false` if `user`
    /// is not a member.
    pub fn set_op(&self, user: &Arc<User>, op: bool) -> bool {
        self.update_op(
            user,
            OpGrant {
                active: op,
                until: None,
            },
        )
    }

    /// Grants room operator status that lapses after `duration`; a zero
    /// duration grants it until revoked. Returns `false` if `user` is not
    /// a member.
    pub fn grant_op(&self, user: &Arc<User>, duration: Duration) -> bool {
        let until = if duration.is_zero() {
            None
        } else {
            Instant::now().checked_add(duration)
        };
        self.update_op(
            user,
            OpGrant {
                active: true,
                until,
            },
        )
    }

    fn update_op(&self, user: &Arc<User>, grant: OpGrant) -> bool {
        match self.members.get(&user.name()) {
            Ok(member) if Arc::ptr_eq(&member.user, user) => {
                *member.op.lock() = grant;
                true
            }
            _ => false,
        }
    }

    /// The command table.
    #[must_use]
    pub const fn commands(&self) -> &Commands {
        &self.commands
    }

    /// The message backlog.
    #[must_use]
    pub const fn history(&self) -> &History {
        &self.history
    }

    /// Current topic.
    pub fn topic(&self) -> String {
        self.topic.read().clone()
    }

    /// Replaces the topic. Does not announce.
    pub fn set_topic(&self, topic: impl Into<String>) {
        *self.topic.write() = topic.into();
    }

    /// Message of the day shown to joining users.
    pub fn motd(&self) -> String {
        self.motd.read().clone()
    }

    /// Replaces the message of the day.
    pub fn set_motd(&self, motd: impl Into<String>) {
        *self.motd.write() = motd.into();
    }

    /// Time since the room was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

fn deliver(user: &Arc<User>, msg: Message) {
    if let Err(e) = user.send(msg) {
        tracing::debug!(user = %user.name(), error = %e, "dropped message");
    }
}
