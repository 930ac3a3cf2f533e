//! Colour themes for rendered chat lines.
//!
//! A [`Theme`] is plain data handed to each [`crate::user::User`] at
//! construction; there is no process-wide theme table to mutate.

use std::fmt;

/// Terminal bell control character appended to highlighted lines.
pub const BELL: &str = "\x07";

const RESET: &str = "\x1b[0m";

/// A single ANSI style: an optional 256-colour foreground plus bold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    fg: Option<u8>,
    bold: bool,
}

impl Style {
    /// Style that leaves text untouched.
    pub const PLAIN: Self = Self {
        fg: None,
        bold: false,
    };

    /// Foreground colour from the 256-colour palette.
    #[must_use]
    pub const fn fg(color: u8) -> Self {
        Self {
            fg: Some(color),
            bold: false,
        }
    }

    /// Same style, bold.
    #[must_use]
    pub const fn bold(self) -> Self {
        Self { bold: true, ..self }
    }

    /// Wraps `text` in this style's escape sequences.
    #[must_use]
    pub fn paint(&self, text: &str) -> String {
        if *self == Self::PLAIN {
            return text.to_string();
        }
        let mut codes = Vec::with_capacity(2);
        if self.bold {
            codes.push("1".to_string());
        }
        if let Some(fg) = self.fg {
            codes.push(format!("38;5;{fg}"));
        }
        format!("\x1b[{}m{text}{RESET}", codes.join(";"))
    }
}

/// Named set of styles used to render lines for one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Theme {
    id: &'static str,
    names: Vec<Style>,
    sys: Style,
    pm: Style,
    highlight: Style,
}

impl Default for Theme {
    fn default() -> Self {
        Self::colors()
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id)
    }
}

impl Theme {
    /// Full palette: a spread of readable 256-colour name colours.
    #[must_use]
    pub fn colors() -> Self {
        // Skips the darkest and lightest palette entries.
        let names = (0..16u8)
            .flat_map(|i| [1 + i * 2, 2 + i * 2])
            .map(|c| Style::fg(c.wrapping_add(30) % 200 + 22))
            .collect();
        Self {
            id: "colors",
            names,
            sys: Style::fg(245),
            pm: Style::fg(7),
            highlight: Style::fg(11).bold(),
        }
    }

    /// No colour at all; highlights are still bold.
    #[must_use]
    pub fn mono() -> Self {
        Self {
            id: "mono",
            names: vec![Style::PLAIN],
            sys: Style::PLAIN,
            pm: Style::PLAIN,
            highlight: Style::PLAIN.bold(),
        }
    }

    /// Shades of green.
    #[must_use]
    pub fn hacker() -> Self {
        Self {
            id: "hacker",
            names: vec![Style::fg(82)],
            sys: Style::fg(22),
            pm: Style::fg(28),
            highlight: Style::fg(154).bold(),
        }
    }

    /// Every built-in theme, default first.
    #[must_use]
    pub fn all() -> Vec<Self> {
        vec![Self::colors(), Self::mono(), Self::hacker()]
    }

    /// Looks a built-in theme up by name.
    #[must_use]
    pub fn named(id: &str) -> Option<Self> {
        Self::all().into_iter().find(|t| t.id.eq_ignore_ascii_case(id))
    }

    /// Theme name.
    #[must_use]
    pub const fn id(&self) -> &'static str {
        self.id
    }

    /// Colours `name`, picking the colour from a stable hash of the name
    /// offset by the viewer's `seed`.
    #[must_use]
    pub fn color_name(&self, name: &str, seed: u64) -> String {
        let index = fnv1a(name).wrapping_add(seed) % self.names.len() as u64;
        let style = self.names.get(index as usize).copied().unwrap_or_default();
        style.paint(name)
    }

    /// Styles server-generated text.
    #[must_use]
    pub fn color_sys(&self, text: &str) -> String {
        self.sys.paint(text)
    }

    /// Styles a private message line.
    #[must_use]
    pub fn color_pm(&self, text: &str) -> String {
        self.pm.paint(text)
    }

    /// Styles a highlighted span.
    #[must_use]
    pub fn highlight(&self, text: &str) -> String {
        self.highlight.paint(text)
    }
}

fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}
