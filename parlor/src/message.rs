//! Chat message variants and per-viewer rendering.
//!
//! Messages are immutable once built. The same [`Message`] value is
//! rendered separately for every viewer, using that viewer's configuration
//! snapshot (theme, highlight, bell, timestamps).

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::theme::{BELL, Theme};
use crate::user::{User, UserConfig};

/// Prefix that marks an input line as a command.
pub const COMMAND_PREFIX: char = '/';

/// Body shown for an emote with nothing to say.
pub const EMPTY_EMOTE: &str = "is at a loss for words.";

/// Text typed by a user, visible to the whole room.
#[derive(Debug, Clone)]
pub struct PublicMsg {
    /// Message text.
    pub body: String,
    /// Author.
    pub from: Arc<User>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// An action line (`/me waves`), visible to the whole room.
#[derive(Debug, Clone)]
pub struct EmoteMsg {
    /// Action text without the command.
    pub body: String,
    /// Author.
    pub from: Arc<User>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// A message between two users.
#[derive(Debug, Clone)]
pub struct PrivateMsg {
    /// Message text.
    pub body: String,
    /// Author.
    pub from: Arc<User>,
    /// Recipient.
    pub to: Arc<User>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// Server text addressed to a single user, such as command output.
#[derive(Debug, Clone)]
pub struct SystemMsg {
    /// Message text.
    pub body: String,
    /// Recipient.
    pub to: Arc<User>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// Server text for the whole room: joins, leaves, renames.
#[derive(Debug, Clone)]
pub struct AnnounceMsg {
    /// Message text.
    pub body: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

/// A parsed command line.
#[derive(Debug, Clone)]
pub struct CommandMsg {
    /// Issuing user. Server-synthesised commands have none and are refused
    /// by the dispatcher.
    pub from: Option<Arc<User>>,
    /// Command name including the prefix, e.g. `/nick`.
    pub name: String,
    /// Whitespace-separated arguments.
    pub args: Vec<String>,
    /// The full input line.
    pub body: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl CommandMsg {
    /// Arguments from position `skip` onward, re-joined with single spaces.
    #[must_use]
    pub fn rest(&self, skip: usize) -> String {
        self.args.iter().skip(skip).cloned().collect::<Vec<_>>().join(" ")
    }
}

/// Every kind of message the room routes.
#[derive(Debug, Clone)]
pub enum Message {
    /// See [`PublicMsg`].
    Public(PublicMsg),
    /// See [`EmoteMsg`].
    Emote(EmoteMsg),
    /// See [`PrivateMsg`].
    Private(PrivateMsg),
    /// See [`SystemMsg`].
    System(SystemMsg),
    /// See [`AnnounceMsg`].
    Announce(AnnounceMsg),
    /// See [`CommandMsg`].
    Command(CommandMsg),
}

impl Message {
    /// Builds a public message from `from`.
    pub fn public(body: impl Into<String>, from: Arc<User>) -> Self {
        Self::Public(PublicMsg {
            body: body.into(),
            from,
            timestamp: Utc::now(),
        })
    }

    /// Builds an emote from `from`.
    pub fn emote(body: impl Into<String>, from: Arc<User>) -> Self {
        Self::Emote(EmoteMsg {
            body: body.into(),
            from,
            timestamp: Utc::now(),
        })
    }

    /// Builds a private message from `from` to `to`.
    pub fn private(body: impl Into<String>, from: Arc<User>, to: Arc<User>) -> Self {
        Self::Private(PrivateMsg {
            body: body.into(),
            from,
            to,
            timestamp: Utc::now(),
        })
    }

    /// Builds a system line for `to`.
    pub fn system(body: impl Into<String>, to: Arc<User>) -> Self {
        Self::System(SystemMsg {
            body: body.into(),
            to,
            timestamp: Utc::now(),
        })
    }

    /// Builds a room-wide announcement.
    pub fn announce(body: impl Into<String>) -> Self {
        Self::Announce(AnnounceMsg {
            body: body.into(),
            timestamp: Utc::now(),
        })
    }

    /// Message text.
    #[must_use]
    pub fn body(&self) -> &str {
        match self {
            Self::Public(m) => &m.body,
            Self::Emote(m) => &m.body,
            Self::Private(m) => &m.body,
            Self::System(m) => &m.body,
            Self::Announce(m) => &m.body,
            Self::Command(m) => &m.body,
        }
    }

    /// Creation time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Public(m) => m.timestamp,
            Self::Emote(m) => m.timestamp,
            Self::Private(m) => m.timestamp,
            Self::System(m) => m.timestamp,
            Self::Announce(m) => m.timestamp,
            Self::Command(m) => m.timestamp,
        }
    }

    /// Sending user, if the message has one.
    #[must_use]
    pub fn from(&self) -> Option<&Arc<User>> {
        match self {
            Self::Public(m) => Some(&m.from),
            Self::Emote(m) => Some(&m.from),
            Self::Private(m) => Some(&m.from),
            Self::Command(m) => m.from.as_ref(),
            Self::System(_) | Self::Announce(_) => None,
        }
    }

    /// Single recipient, for messages that are not room-wide.
    #[must_use]
    pub fn to(&self) -> Option<&Arc<User>> {
        match self {
            Self::Private(m) => Some(&m.to),
            Self::System(m) => Some(&m.to),
            _ => None,
        }
    }

    /// Renders the line `viewer` sees, without a line terminator.
    #[must_use]
    pub fn render(&self, viewer: &User, cfg: &UserConfig) -> String {
        let mono;
        let theme = if let Some(theme) = &cfg.theme {
            theme
        } else {
            mono = Theme::mono();
            &mono
        };

        let line = match self {
            Self::Public(m) => {
                let name = theme.color_name(&m.from.name(), cfg.seed);
                match &cfg.highlight {
                    Some(re) if re.is_match(&m.body) => {
                        let body = re.replace_all(&m.body, |caps: &regex::Captures<'_>| {
                            theme.highlight(&caps[0])
                        });
                        let bell = if cfg.bell { BELL } else { "" };
                        format!("{name}: {body}{bell}")
                    }
                    _ => format!("{name}: {}", m.body),
                }
            }
            Self::Emote(m) => {
                let body = if m.body.trim().is_empty() {
                    EMPTY_EMOTE
                } else {
                    &m.body
                };
                format!("** {} {body}", theme.color_name(&m.from.name(), cfg.seed))
            }
            Self::Private(m) if std::ptr::eq(m.from.as_ref(), viewer) => {
                theme.color_pm(&format!("[PM to {}] {}", m.to.name(), m.body))
            }
            Self::Private(m) => {
                let line = theme.color_pm(&format!("[PM from {}] {}", m.from.name(), m.body));
                if cfg.bell {
                    format!("{line}{BELL}")
                } else {
                    line
                }
            }
            Self::System(m) => theme.color_sys(&format!("-> {}", m.body)),
            Self::Announce(m) => theme.color_sys(&format!(" * {}", m.body)),
            Self::Command(m) => m.body.clone(),
        };

        if cfg.timestamp {
            format!("[{}] {line}", self.timestamp().format("%H:%M"))
        } else {
            line
        }
    }

    /// Uncoloured rendering used for the chat log.
    #[must_use]
    pub fn render_plain(&self) -> String {
        match self {
            Self::Public(m) => format!("{}: {}", m.from.name(), m.body),
            Self::Emote(m) if m.body.trim().is_empty() => {
                format!("** {} {EMPTY_EMOTE}", m.from.name())
            }
            Self::Emote(m) => format!("** {} {}", m.from.name(), m.body),
            Self::Private(m) => format!("[PM from {}] {}", m.from.name(), m.body),
            Self::System(m) => format!("-> {}", m.body),
            Self::Announce(m) => format!(" * {}", m.body),
            Self::Command(m) => m.body.clone(),
        }
    }
}

/// Turns one line of user input into a message.
///
/// A line starting with [`COMMAND_PREFIX`] becomes a [`Message::Command`]
/// whose name is the first whitespace-delimited token, prefix included.
/// Anything else is a [`Message::Public`].
pub fn parse_input(body: &str, from: Arc<User>) -> Message {
    let trimmed = body.trim();
    if !trimmed.starts_with(COMMAND_PREFIX) {
        return Message::public(body, from);
    }
    let mut tokens = trimmed.split_whitespace().map(str::to_string);
    let name = tokens.next().unwrap_or_default();
    Message::Command(CommandMsg {
        from: Some(from),
        name,
        args: tokens.collect(),
        body: trimmed.to_string(),
        timestamp: Utc::now(),
    })
}
