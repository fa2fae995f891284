//! Maps raw server console lines to a category and a display message.
//!
//! Rules are evaluated top to bottom and the first match wins. Several
//! markers appear inside each other's lines (a chat message can contain
//! "joined the game"), so the table order is part of the behaviour.

use hearth_process::LogCategory;

/// Which rule produced a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    PlayerJoined,
    PlayerLeft,
    Chat,
    VersionBanner,
    StartupComplete,
    PreparingWorld,
    WorldTiming,
    PluginLoading,
    PluginEnabled,
    BridgeOnline,
    MultiversionOnline,
    Error,
    Warning,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: LogCategory,
    pub message: String,
    pub rule: RuleKind,
}

impl Classification {
    /// True for the banner the server prints once it accepts players.
    pub fn marks_ready(&self) -> bool {
        self.rule == RuleKind::StartupComplete
    }
}

struct Rule {
    kind: RuleKind,
    matches: fn(&str) -> bool,
    category: LogCategory,
    format: fn(&str) -> String,
}

const JOINED: &str = "joined the game";
const LEFT: &str = "left the game";
const VERSION_BANNER: &str = "Starting minecraft server version";
const DONE_MARKER: &str = "Done (";
const HELP_PROMPT: &str = "For help, type";
const BRIDGE_STARTED: &str = "Started Geyser on";
const MULTIVERSION_ENABLED: &str = "ViaVersion detected server version";

static RULES: &[Rule] = &[
    Rule {
        kind: RuleKind::PlayerJoined,
        matches: |l| l.contains(JOINED),
        category: LogCategory::Player,
        format: |l| format!("{} joined the game", player_before(l, JOINED)),
    },
    Rule {
        kind: RuleKind::PlayerLeft,
        matches: |l| l.contains(LEFT),
        category: LogCategory::Player,
        format: |l| format!("{} left the game", player_before(l, LEFT)),
    },
    Rule {
        kind: RuleKind::Chat,
        matches: |l| l.contains('<') && l.contains('>'),
        category: LogCategory::Player,
        format: format_chat,
    },
    Rule {
        kind: RuleKind::VersionBanner,
        matches: |l| l.contains(VERSION_BANNER),
        category: LogCategory::Success,
        format: |l| message_part(l).to_string(),
    },
    Rule {
        kind: RuleKind::StartupComplete,
        matches: |l| l.contains(DONE_MARKER) && l.contains(HELP_PROMPT),
        category: LogCategory::Success,
        format: format_startup_complete,
    },
    Rule {
        kind: RuleKind::PreparingWorld,
        matches: |l| l.contains("Preparing spawn area") || l.contains("Preparing level"),
        category: LogCategory::World,
        format: |l| message_part(l).to_string(),
    },
    Rule {
        kind: RuleKind::WorldTiming,
        matches: |l| l.contains("Time elapsed:"),
        category: LogCategory::World,
        format: |l| message_part(l).to_string(),
    },
    Rule {
        kind: RuleKind::PluginLoading,
        matches: |l| l.contains("Loading") && l.contains("plugin"),
        category: LogCategory::Info,
        format: |l| l.to_string(),
    },
    Rule {
        kind: RuleKind::PluginEnabled,
        matches: |l| l.contains("Enabling") && l.contains("plugin"),
        category: LogCategory::Success,
        format: |l| l.to_string(),
    },
    Rule {
        kind: RuleKind::BridgeOnline,
        matches: |l| l.contains(BRIDGE_STARTED),
        category: LogCategory::Success,
        format: |_| "Bedrock crossplay bridge online".to_string(),
    },
    Rule {
        kind: RuleKind::MultiversionOnline,
        matches: |l| l.contains(MULTIVERSION_ENABLED),
        category: LogCategory::Success,
        format: |_| "Multi-version protocol support online".to_string(),
    },
    Rule {
        kind: RuleKind::Error,
        matches: |l| l.contains("ERROR") || l.contains("SEVERE"),
        category: LogCategory::Error,
        format: |l| l.to_string(),
    },
    Rule {
        kind: RuleKind::Warning,
        matches: |l| l.contains("WARN"),
        category: LogCategory::Warn,
        format: |l| l.to_string(),
    },
];

/// Pure: the same line always yields the same result.
pub fn classify(raw: &str) -> Classification {
    RULES
        .iter()
        .find(|rule| (rule.matches)(raw))
        .map(|rule| Classification {
            category: rule.category,
            message: (rule.format)(raw),
            rule: rule.kind,
        })
        .unwrap_or_else(|| Classification {
            category: LogCategory::Info,
            message: raw.to_string(),
            rule: RuleKind::Default,
        })
}

/// Text after the logger prefix, e.g. `[12:00:00] [Server thread/INFO]: `.
fn message_part(line: &str) -> &str {
    match line.find("]: ") {
        Some(idx) => &line[idx + 3..],
        None => line.trim(),
    }
}

fn player_before<'a>(line: &'a str, marker: &str) -> &'a str {
    let msg = message_part(line);
    let head = msg.find(marker).map(|idx| &msg[..idx]).unwrap_or(msg);
    head.split_whitespace().last().unwrap_or("Someone")
}

fn format_chat(line: &str) -> String {
    let msg = message_part(line);
    if let Some(open) = msg.find('<')
        && let Some(close_rel) = msg[open..].find('>')
    {
        let close = open + close_rel;
        let name = &msg[open + 1..close];
        let text = msg[close + 1..].trim();
        if !name.is_empty() {
            return format!("{name}: {text}");
        }
    }
    msg.to_string()
}

fn format_startup_complete(line: &str) -> String {
    let elapsed = line.find(DONE_MARKER).and_then(|idx| {
        let rest = &line[idx + DONE_MARKER.len()..];
        rest.find(')').map(|end| &rest[..end])
    });
    match elapsed {
        Some(t) if !t.is_empty() => format!("Server startup complete ({t})"),
        _ => "Server startup complete".to_string(),
    }
}
