//! The built-in command table.
//!
//! [`init_commands`] registers the commands every user may run.
//! [`init_op_commands`] adds the moderation commands, which need the shared
//! [`Auth`] to persist bans, operators, and the whitelist.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Auth;
use crate::command::{Command, CommandError, Commands};
use crate::key::fingerprint;
use crate::message::{CommandMsg, Message};
use crate::room::Room;
use crate::theme::Theme;
use crate::user::{User, sanitize_name};

const SHRUG: &str = r"¯\_(ツ)_/¯";

/// Builds the full command table: public and operator commands.
#[must_use]
pub fn default_commands(auth: Arc<Auth>) -> Commands {
    let mut commands = Commands::new();
    init_commands(&mut commands);
    init_op_commands(&mut commands, auth);
    commands
}

fn sender(msg: &CommandMsg) -> Result<&Arc<User>, CommandError> {
    msg.from.as_ref().ok_or(CommandError::NoOwner)
}

fn reply(room: &Room, to: &Arc<User>, body: impl Into<String>) {
    room.post(Message::system(body, Arc::clone(to)));
}

fn target(room: &Room, msg: &CommandMsg) -> Result<Arc<User>, CommandError> {
    let name = msg.args.first().ok_or(CommandError::MissingArg)?;
    room.member(name).ok_or(CommandError::UserNotFound)
}

fn on_off(flag: bool) -> &'static str {
    if flag { "ON" } else { "OFF" }
}

/// Registers the commands anyone may run.
#[allow(clippy::too_many_lines)]
pub fn init_commands(c: &mut Commands) {
    c.add(Command::new("/help", "", "Show this help.", |room, msg| {
        let from = sender(msg)?;
        let mut text = format!("Available commands:\n{}", room.commands().help(false));
        if room.is_op(from) {
            let _ = write!(text, "\nOperator commands:\n{}", room.commands().help(true));
        }
        reply(room, from, text);
        Ok(())
    }));

    c.add(Command::new("/exit", "", "Leave the chat.", |_, msg| {
        sender(msg)?.close();
        Ok(())
    }));

    c.add(Command::new("/me", "<action>", "Describe what you are doing.", |room, msg| {
        let from = sender(msg)?;
        room.post(Message::emote(msg.rest(0), Arc::clone(from)));
        Ok(())
    }));

    c.add(Command::new("/nick", "<name>", "Change your name.", |room, msg| {
        let from = sender(msg)?;
        let name = sanitize_name(msg.args.first().ok_or(CommandError::MissingArg)?);
        if name.is_empty() {
            return Err(CommandError::Invalid("invalid name".to_string()));
        }
        room.rename(from, &name)?;
        Ok(())
    }));

    c.add(Command::new("/names", "", "List users who are connected.", |room, msg| {
        let from = sender(msg)?;
        let members = room.members();
        let names: Vec<String> = members
            .iter()
            .map(|member| {
                let user = member.user();
                match user.away() {
                    Some(_) => format!("{} (away)", user.name()),
                    None => user.name(),
                }
            })
            .collect();
        reply(
            room,
            from,
            format!("{} connected: {}", names.len(), names.join(", ")),
        );
        Ok(())
    }));

    c.add(Command::new("/theme", "[name]", "Show or set your colour theme.", |room, msg| {
        let from = sender(msg)?;
        let Some(id) = msg.args.first() else {
            let current = from
                .config()
                .theme
                .map_or_else(|| "mono".to_string(), |t| t.id().to_string());
            let all: Vec<&str> = Theme::all().iter().map(Theme::id).collect();
            reply(
                room,
                from,
                format!("Current theme: {current}\nAvailable themes: {}", all.join(", ")),
            );
            return Ok(());
        };
        let theme =
            Theme::named(id).ok_or_else(|| CommandError::Invalid(format!("theme not found: {id}")))?;
        let id = theme.id();
        from.set_config(|cfg| cfg.theme = Some(theme));
        reply(room, from, format!("Set theme: {id}"));
        Ok(())
    }));

    c.add(Command::new("/quiet", "", "Silence room announcements.", |room, msg| {
        let from = sender(msg)?;
        let mut quiet = false;
        from.set_config(|cfg| {
            cfg.quiet = !cfg.quiet;
            quiet = cfg.quiet;
        });
        reply(room, from, format!("Quiet mode is toggled {}", on_off(quiet)));
        Ok(())
    }));

    c.add(Command::new("/timestamp", "", "Prefix messages with the time.", |room, msg| {
        let from = sender(msg)?;
        let mut on = false;
        from.set_config(|cfg| {
            cfg.timestamp = !cfg.timestamp;
            on = cfg.timestamp;
        });
        reply(room, from, format!("Timestamps are toggled {}", on_off(on)));
        Ok(())
    }));

    c.add(Command::new("/msg", "<user> <message>", "Send a private message.", |room, msg| {
        let from = sender(msg)?;
        let to = target(room, msg)?;
        let body = msg.rest(1);
        if body.is_empty() {
            return Err(CommandError::MissingArg);
        }
        room.post(Message::private(body, Arc::clone(from), to));
        Ok(())
    }));

    c.add(Command::new("/reply", "<message>", "Reply to the last private message.", |room, msg| {
        let from = sender(msg)?;
        let to = from
            .reply_to()
            .ok_or_else(|| CommandError::Invalid("no message to reply to".to_string()))?;
        let body = msg.rest(0);
        if body.is_empty() {
            return Err(CommandError::MissingArg);
        }
        room.post(Message::private(body, Arc::clone(from), to));
        Ok(())
    }));

    c.add(Command::new("/whois", "<user>", "Information about a user.", |room, msg| {
        let from = sender(msg)?;
        let user = target(room, msg)?;
        let identity = user.identity();
        let mut text = format!("name: {}", user.name());
        let fp = fingerprint(identity.key.as_ref());
        if !fp.is_empty() {
            let _ = write!(text, "\n > fingerprint: {fp}");
        }
        if !identity.client.is_empty() {
            let _ = write!(text, "\n > client: {}", identity.client);
        }
        if room.is_op(from) && let Some(addr) = identity.addr {
            let _ = write!(text, "\n > ip: {}", addr.ip());
        }
        let _ = write!(
            text,
            "\n > joined: {}",
            user.joined().format("%Y-%m-%d %H:%M UTC")
        );
        if let Some(reason) = user.away() {
            let _ = write!(text, "\n > away: {reason}");
        }
        if room.is_op(&user) {
            text.push_str("\n > operator");
        }
        reply(room, from, text);
        Ok(())
    }));

    c.add(Command::new("/ignore", "[user]", "Hide messages from a user.", |room, msg| {
        let from = sender(msg)?;
        if msg.args.is_empty() {
            let ignored = from.ignored();
            let text = if ignored.is_empty() {
                "0 users ignored.".to_string()
            } else {
                format!("{} ignored: {}", ignored.len(), ignored.join(", "))
            };
            reply(room, from, text);
            return Ok(());
        }
        let user = target(room, msg)?;
        if Arc::ptr_eq(&user, from) {
            return Err(CommandError::Invalid("you can't ignore yourself".to_string()));
        }
        let name = user.name();
        from.ignore(&name)
            .map_err(|_| CommandError::Invalid(format!("already ignoring {name}")))?;
        reply(room, from, format!("Ignoring: {name}"));
        Ok(())
    }));

    c.add(Command::new("/unignore", "<user>", "Stop hiding messages from a user.", |room, msg| {
        let from = sender(msg)?;
        let name = msg.args.first().ok_or(CommandError::MissingArg)?;
        from.unignore(name)
            .map_err(|_| CommandError::Invalid(format!("not ignoring {name}")))?;
        reply(room, from, format!("No longer ignoring: {name}"));
        Ok(())
    }));

    c.add(Command::new("/away", "<reason>", "Mark yourself as away.", |room, msg| {
        let from = sender(msg)?;
        let reason = msg.rest(0);
        if reason.is_empty() {
            return Err(CommandError::MissingArg);
        }
        from.set_away(Some(reason.clone()));
        room.post(Message::emote(
            format!("has gone away: {reason}"),
            Arc::clone(from),
        ));
        reply(room, from, format!("You are marked as away: {reason}"));
        Ok(())
    }));

    c.add(Command::new("/back", "", "Clear your away status.", |room, msg| {
        let from = sender(msg)?;
        if from.away().is_none() {
            return Err(CommandError::Invalid("you are not away".to_string()));
        }
        from.set_away(None);
        room.post(Message::emote("is back.", Arc::clone(from)));
        reply(room, from, "You are no longer marked as away.");
        Ok(())
    }));

    c.add(Command::new("/shrug", "", SHRUG, |room, msg| {
        let from = sender(msg)?;
        room.post(Message::public(SHRUG, Arc::clone(from)));
        Ok(())
    }));

    c.add(Command::new("/uptime", "", "How long the server has been up.", |room, msg| {
        reply(room, sender(msg)?, format!("Uptime: {}", format_duration(room.uptime())));
        Ok(())
    }));

    c.add(Command::new("/version", "", "Server version.", |room, msg| {
        reply(
            room,
            sender(msg)?,
            concat!("parlor ", env!("CARGO_PKG_VERSION")),
        );
        Ok(())
    }));

    c.add(Command::new("/motd", "[message]", "Show the message of the day.", |room, msg| {
        let from = sender(msg)?;
        if msg.args.is_empty() {
            let motd = room.motd();
            let text = if motd.is_empty() { "No MOTD set.".to_string() } else { motd };
            reply(room, from, text);
            return Ok(());
        }
        if !room.is_op(from) {
            return Err(CommandError::NotOp);
        }
        room.set_motd(msg.rest(0));
        room.post(Message::announce(format!("{} updated the MOTD.", from.name())));
        Ok(())
    }));

    c.add(Command::new("/topic", "[topic]", "Show the room topic.", |room, msg| {
        let from = sender(msg)?;
        if msg.args.is_empty() {
            let topic = room.topic();
            let text = if topic.is_empty() { "No topic set.".to_string() } else { format!("Topic: {topic}") };
            reply(room, from, text);
            return Ok(());
        }
        if !room.is_op(from) {
            return Err(CommandError::NotOp);
        }
        let topic = msg.rest(0);
        room.set_topic(topic.clone());
        room.post(Message::announce(format!(
            "{} set the topic to: {topic}",
            from.name()
        )));
        Ok(())
    }));
}

/// Registers the operator-only commands.
pub fn init_op_commands(c: &mut Commands, auth: Arc<Auth>) {
    c.add(
        Command::new("/kick", "<user>", "Kick a user from the room.", |room, msg| {
            let from = sender(msg)?;
            let user = target(room, msg)?;
            room.post(Message::announce(format!(
                "{} was kicked by {}.",
                user.name(),
                from.name()
            )));
            user.close();
            Ok(())
        })
        .op_only(),
    );

    let ban_auth = Arc::clone(&auth);
    c.add(
        Command::new("/ban", "<user> [duration]", "Ban a user's key and address.", move |room, msg| {
            let from = sender(msg)?;
            let user = target(room, msg)?;
            let duration = match msg.args.get(1) {
                Some(arg) => parse_duration(arg)?,
                None => Duration::ZERO,
            };
            let identity = user.identity();
            if let Some(key) = &identity.key {
                ban_auth.ban(key, duration);
            }
            if let Some(addr) = identity.addr {
                ban_auth.ban_addr(addr.ip(), duration);
            }
            let until = if duration.is_zero() {
                String::new()
            } else {
                format!(" for {}", format_duration(duration))
            };
            room.post(Message::announce(format!(
                "{} was banned by {}{until}.",
                user.name(),
                from.name()
            )));
            user.close();
            Ok(())
        })
        .op_only(),
    );

    let banned_auth = Arc::clone(&auth);
    c.add(
        Command::new("/banned", "", "List the current bans.", move |room, msg| {
            let (fps, addrs) = banned_auth.banned();
            let mut text = String::from("Banned:");
            for fp in &fps {
                let _ = write!(text, "\n   key: {fp}");
            }
            for addr in &addrs {
                let _ = write!(text, "\n   ip: {addr}");
            }
            if fps.is_empty() && addrs.is_empty() {
                text.push_str(" nobody");
            }
            reply(room, sender(msg)?, text);
            Ok(())
        })
        .op_only(),
    );

    let op_auth = Arc::clone(&auth);
    c.add(
        Command::new(
            "/op",
            "<user> [duration]",
            "Make a user an operator, optionally for a limited time.",
            move |room, msg| {
                let from = sender(msg)?;
                let user = target(room, msg)?;
                let duration = match msg.args.get(1) {
                    Some(arg) => parse_duration(arg)?,
                    None => Duration::ZERO,
                };
                room.grant_op(&user, duration);
                if let Some(key) = &user.identity().key {
                    op_auth.op(key, duration);
                }
                let until = if duration.is_zero() {
                    String::new()
                } else {
                    format!(" for {}", format_duration(duration))
                };
                reply(room, &user, format!("Made op by {}{until}.", from.name()));
                reply(room, from, format!("{} is now an operator{until}.", user.name()));
                Ok(())
            },
        )
        .op_only(),
    );

    c.add(
        Command::new(
            "/whitelist",
            "add|remove|list|status [user|fingerprint]",
            "Manage the key whitelist.",
            move |room, msg| whitelist(room, msg, &auth),
        )
        .op_only(),
    );
}

fn whitelist(room: &Room, msg: &CommandMsg, auth: &Auth) -> Result<(), CommandError> {
    let from = sender(msg)?;
    let action = msg.args.first().ok_or(CommandError::MissingArg)?;
    let subject = msg.args.get(1);

    // A subject is an online user's name or a raw fingerprint.
    let resolve = |subject: &String| -> Result<String, CommandError> {
        if subject.starts_with("SHA256:") {
            return Ok(subject.clone());
        }
        let user = room.member(subject).ok_or(CommandError::UserNotFound)?;
        let fp = fingerprint(user.identity().key.as_ref());
        if fp.is_empty() {
            return Err(CommandError::Invalid(format!(
                "{} has no public key",
                user.name()
            )));
        }
        Ok(fp)
    };

    match action.as_str() {
        "add" => {
            let fp = resolve(subject.ok_or(CommandError::MissingArg)?)?;
            auth.whitelist_fingerprint(&fp, Duration::ZERO);
            reply(room, from, format!("Whitelisted: {fp}"));
        }
        "remove" => {
            let fp = resolve(subject.ok_or(CommandError::MissingArg)?)?;
            if !auth.unwhitelist(&fp) {
                return Err(CommandError::Invalid(format!("not whitelisted: {fp}")));
            }
            reply(room, from, format!("Removed from whitelist: {fp}"));
        }
        "list" => {
            let fps = auth.whitelisted();
            let text = if fps.is_empty() {
                "Whitelist is empty.".to_string()
            } else {
                format!("Whitelist:\n   {}", fps.join("\n   "))
            };
            reply(room, from, text);
        }
        "status" => {
            let mode = if auth.allow_anonymous() { "disabled" } else { "enabled" };
            reply(
                room,
                from,
                format!(
                    "Whitelist mode is {mode} ({} keys).",
                    auth.whitelisted().len()
                ),
            );
        }
        other => {
            return Err(CommandError::Invalid(format!(
                "unknown whitelist action: {other}"
            )));
        }
    }
    Ok(())
}

/// Parses a compact duration: `90`, `30s`, `5m`, `2h`, or `1d`.
///
/// # Errors
///
/// Returns [`CommandError::Invalid`] for anything else.
pub fn parse_duration(s: &str) -> Result<Duration, CommandError> {
    let invalid = || CommandError::Invalid(format!("invalid duration: {s}"));
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n.checked_mul(60).ok_or_else(invalid)?,
        "h" => n.checked_mul(3600).ok_or_else(invalid)?,
        "d" => n.checked_mul(86_400).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// Formats a duration as `1d2h3m4s`, omitting zero leading units.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (days, hours, mins, secs) = (
        total / 86_400,
        total % 86_400 / 3600,
        total % 3600 / 60,
        total % 60,
    );
    let mut out = String::new();
    if days > 0 {
        let _ = write!(out, "{days}d");
    }
    if days > 0 || hours > 0 {
        let _ = write!(out, "{hours}h");
    }
    if days > 0 || hours > 0 || mins > 0 {
        let _ = write!(out, "{mins}m");
    }
    let _ = write!(out, "{secs}s");
    out
}
