//! Session driver tying a connection to the room.
//!
//! A [`Host`] owns the room and the admission policy. For each client the
//! transport calls [`Host::admit`] and then [`Host::connect`], which runs the
//! whole session: join (retrying as a guest on name collisions), show the
//! MOTD, forward input lines to the room, and leave when the client goes
//! away or is kicked.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::AsyncWrite;

use crate::auth::{Auth, AuthError};
use crate::conn::{Completer, Connection, Terminal, TerminalError};
use crate::message::{COMMAND_PREFIX, Message, parse_input};
use crate::room::{Room, RoomError};
use crate::theme::Theme;
use crate::user::{Delivery, Identity, User, sanitize_name};

/// Errors that end a session early.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The client was refused admission.
    #[error("admission refused: {0}")]
    Auth(#[from] AuthError),

    /// The room refused the join.
    #[error(transparent)]
    Room(#[from] RoomError),
}

/// Accepts clients into a room.
pub struct Host {
    room: Arc<Room>,
    auth: Arc<Auth>,
    delivery: Delivery,
    theme: Option<Theme>,
    guests: AtomicUsize,
}

impl Host {
    /// Creates a host for `room`, admitting clients according to `auth`.
    #[must_use]
    pub fn new(room: Arc<Room>, auth: Arc<Auth>) -> Self {
        Self {
            room,
            auth,
            delivery: Delivery::default(),
            theme: Some(Theme::default()),
            guests: AtomicUsize::new(0),
        }
    }

    /// Sets the delivery queue sizing for new users.
    #[must_use]
    pub const fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    /// Sets the theme new users start with; `None` disables colour.
    #[must_use]
    pub fn with_theme(mut self, theme: Option<Theme>) -> Self {
        self.theme = theme;
        self
    }

    /// The hosted room.
    #[must_use]
    pub const fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// The admission policy.
    #[must_use]
    pub const fn auth(&self) -> &Arc<Auth> {
        &self.auth
    }

    /// Checks whether `conn` may join.
    ///
    /// Bans are checked first, then the whitelist. When a passphrase is
    /// configured it is required, except from keys on an active whitelist.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing the refusal.
    pub fn admit<C: Connection>(&self, conn: &C, passphrase: Option<&str>) -> Result<(), AuthError> {
        let key = conn.public_key();
        let result = self
            .auth
            .check_bans(conn.remote_addr(), key.as_ref(), &conn.client_version())
            .and_then(|()| {
                let whitelisted = self.auth.check_public_key(key.as_ref());
                if !self.auth.accept_passphrase() {
                    return whitelisted;
                }
                if whitelisted.is_ok() && !self.auth.allow_anonymous() {
                    return Ok(());
                }
                self.auth.check_passphrase(passphrase.unwrap_or_default())
            });
        if let Err(e) = &result {
            tracing::warn!(
                name = %conn.name(),
                addr = ?conn.remote_addr(),
                error = %e,
                "connection refused"
            );
        }
        result
    }

    /// Runs a client session to completion.
    ///
    /// Output for the client is written to `writer` by a spawned screen
    /// task. Returns once the client disconnects, runs `/exit`, or is
    /// closed by the room.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Room`] if the room is closed before the client
    /// could join.
    pub async fn connect<C, T, W>(&self, conn: &C, term: &mut T, writer: W) -> Result<(), HostError>
    where
        C: Connection,
        T: Terminal,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let key = conn.public_key();
        let identity = Identity {
            key: key.clone(),
            addr: conn.remote_addr(),
            client: conn.client_version(),
        };
        let mut name = sanitize_name(&conn.name());
        if name.is_empty() {
            name = self.guest_name();
        }
        let user = User::new(name, identity, &self.delivery);
        user.set_config(|cfg| cfg.theme.clone_from(&self.theme));
        let session = user.id();

        let screen = tokio::spawn({
            let user = Arc::clone(&user);
            async move { user.consume(writer).await }
        });

        let op = self.auth.is_op(key.as_ref());
        loop {
            match self.room.join(Arc::clone(&user), op).await {
                Ok(_) => break,
                Err(RoomError::Collision) => {
                    let guest = self.guest_name();
                    tracing::debug!(session = %session, taken = %user.name(), retry = %guest, "name taken");
                    user.set_name(guest);
                }
                Err(e) => {
                    user.close();
                    let _ = screen.await;
                    conn.close();
                    return Err(e.into());
                }
            }
        }
        tracing::info!(session = %session, user = %user.name(), op, "session started");

        if let Err(e) = user.set_highlight(&regex::escape(&user.name())) {
            tracing::warn!(session = %session, error = %e, "could not set highlight");
        }
        let motd = self.room.motd();
        if !motd.is_empty() {
            let _ = user.send(Message::system(motd, Arc::clone(&user)));
        }

        term.set_autocomplete(completer(Arc::clone(&self.room)));
        term.set_prompt(&prompt(&user));

        loop {
            let line = tokio::select! {
                () = user.closed() => break,
                line = term.read_line() => line,
            };
            let line = match line {
                Ok(line) => line,
                Err(TerminalError::Eof) => break,
                Err(e @ TerminalError::LineTooLong { .. }) => {
                    tracing::debug!(session = %session, error = %e, "input line dropped");
                    let _ = user.send(Message::system(
                        format!("Input dropped: {e}."),
                        Arc::clone(&user),
                    ));
                    continue;
                }
                Err(e) => {
                    tracing::warn!(session = %session, error = %e, "terminal read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.room.send(parse_input(&line, Arc::clone(&user))).await {
                tracing::debug!(session = %session, error = %e, "room stopped accepting input");
                break;
            }
            term.set_prompt(&prompt(&user));
        }

        if let Err(e) = self.room.leave(&user).await {
            tracing::debug!(session = %session, error = %e, "leave after disconnect");
        }
        user.close();
        if let Err(e) = screen.await {
            tracing::warn!(session = %session, error = %e, "screen task failed");
        }
        conn.close();
        tracing::info!(session = %session, user = %user.name(), "session ended");
        Ok(())
    }

    fn guest_name(&self) -> String {
        format!("Guest{}", self.guests.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

fn prompt(user: &User) -> String {
    format!("[{}] ", user.name())
}

fn completer(room: Arc<Room>) -> Completer {
    Arc::new(move |line: &str, pos: usize| complete(&room, line, pos))
}

/// Completes the word before `pos`: a command name at the start of the
/// line, otherwise a member name.
///
/// A member name completed at the start of the line gets a `: ` suffix,
/// anywhere else a single space. Returns the new line and cursor position.
#[must_use]
pub fn complete(room: &Room, line: &str, pos: usize) -> Option<(String, usize)> {
    let head = line.get(..pos)?;
    let start = head.rfind(' ').map_or(0, |i| i + 1);
    let word = &head[start..];
    if word.is_empty() {
        return None;
    }

    let mut completed = head[..start].to_string();
    if start == 0 && word.starts_with(COMMAND_PREFIX) {
        completed.push_str(room.commands().names(word).first()?);
        completed.push(' ');
    } else {
        completed.push_str(&room.names_prefix(word).into_iter().next()?);
        completed.push_str(if start == 0 { ": " } else { " " });
    }
    let cursor = completed.len();
    completed.push_str(&line[pos..]);
    Some((completed, cursor))
}
