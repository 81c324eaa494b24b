// Parsing probe output into scheduled tasks

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Where a scheduled task was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum TaskSource {
    /// The connecting user's crontab
    UserCrontab,
    /// A system crontab (`/etc/crontab`, `/etc/cron.d/*`)
    CronFile(String),
    /// A systemd timer unit
    SystemdTimer,
}

/// One scheduled task on a host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledTask {
    pub name: String,
    /// Five-field cron expression, `@reboot`, or `timer` for systemd units
    pub schedule: String,
    pub command: String,
    pub user: Option<String>,
    pub source: TaskSource,
    pub next_run: Option<String>,
}

/// Everything collected from one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInventory {
    pub target: String,
    pub hostname: String,
    pub tasks: Vec<ScheduledTask>,
}

/// Cron shorthands and their five-field equivalents
const CRON_MACROS: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
    ("@reboot", "@reboot"),
];

static ENV_ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\s*=").unwrap());

// One field: comma-separated values, ranges and steps; names are three letters
static CRON_FIELD: Lazy<Regex> = Lazy::new(|| {
    let elem = r"(?:\*|[0-9]+|[A-Za-z]{3})(?:-(?:[0-9]+|[A-Za-z]{3}))?(?:/[0-9]+)?";
    Regex::new(&format!("^{elem}(?:,{elem})*$")).unwrap()
});

const MARKER: &str = "### taskscan:";

/// Expand a cron `@` macro
pub fn expand_macro(token: &str) -> Option<&'static str> {
    let token = token.to_ascii_lowercase();
    CRON_MACROS
        .iter()
        .find(|(name, _)| *name == token)
        .map(|(_, expanded)| *expanded)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Section {
    Preamble,
    Hostname,
    Crontab,
    File(String),
    Timers,
}

/// Turn the marked probe output into an inventory
pub fn parse_probe_output(target: &str, output: &str) -> HostInventory {
    let mut hostname = String::new();
    let mut tasks = Vec::new();
    let mut section = Section::Preamble;

    for line in output.lines() {
        if let Some(header) = line.strip_prefix(MARKER) {
            section = match header.split_once(' ') {
                Some(("file", path)) => Section::File(path.trim().to_string()),
                _ => match header.trim() {
                    "hostname" => Section::Hostname,
                    "crontab" => Section::Crontab,
                    "timers" => Section::Timers,
                    other => {
                        tracing::debug!(host = %target, section = %other, "unknown probe section");
                        Section::Preamble
                    }
                },
            };
            continue;
        }

        match &section {
            Section::Preamble => {}
            Section::Hostname => {
                if hostname.is_empty() && !line.trim().is_empty() {
                    hostname = line.trim().to_string();
                }
            }
            Section::Crontab => {
                if let Some(task) = parse_cron_line(line, TaskSource::UserCrontab) {
                    tasks.push(task);
                }
            }
            Section::File(path) => {
                if let Some(task) = parse_cron_line(line, TaskSource::CronFile(path.clone())) {
                    tasks.push(task);
                }
            }
            Section::Timers => {
                if let Some(task) = parse_timer_line(line) {
                    tasks.push(task);
                }
            }
        }
    }

    if hostname.is_empty() {
        hostname = target.to_string();
    }

    HostInventory {
        target: target.to_string(),
        hostname,
        tasks,
    }
}

/// Parse one crontab line
///
/// System crontabs carry a user column between the schedule and the command;
/// user crontabs do not. Comments, blank lines and variable assignments yield
/// `None`, as do lines that do not look like cron entries.
pub fn parse_cron_line(line: &str, source: TaskSource) -> Option<ScheduledTask> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || ENV_ASSIGNMENT.is_match(line) {
        return None;
    }

    let system = matches!(source, TaskSource::CronFile(_));
    let (schedule, rest) = if line.starts_with('@') {
        let (token, rest) = split_first_word(line)?;
        (expand_macro(token)?.to_string(), rest)
    } else {
        let mut fields = Vec::with_capacity(5);
        let mut rest = line;
        for _ in 0..5 {
            let (field, tail) = split_first_word(rest)?;
            if !CRON_FIELD.is_match(field) {
                tracing::debug!(line = %line, "skipping malformed cron line");
                return None;
            }
            fields.push(field);
            rest = tail;
        }
        (fields.join(" "), rest)
    };

    let (user, command) = if system {
        let (user, command) = split_first_word(rest)?;
        (Some(user.to_string()), command)
    } else {
        (None, rest)
    };

    let command = command.trim();
    if command.is_empty() {
        return None;
    }

    Some(ScheduledTask {
        name: command_name(command),
        schedule,
        command: command.to_string(),
        user,
        source,
        next_run: None,
    })
}

/// Parse one line of `systemctl list-timers --no-legend`
///
/// Columns: NEXT (four words or `n/a`), LEFT, LAST, PASSED, UNIT, ACTIVATES.
/// Only UNIT is located reliably, by its `.timer` suffix.
pub fn parse_timer_line(line: &str) -> Option<ScheduledTask> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let unit_idx = tokens.iter().position(|t| t.ends_with(".timer"))?;
    let unit = tokens[unit_idx];
    let activates = tokens.get(unit_idx + 1).copied().unwrap_or("");

    let next_run = match tokens.first() {
        Some(&"n/a") | Some(&"-") | None => None,
        Some(_) if unit_idx >= 4 => Some(tokens[..4].join(" ")),
        Some(_) => None,
    };

    Some(ScheduledTask {
        name: unit.trim_end_matches(".timer").to_string(),
        schedule: "timer".to_string(),
        command: activates.to_string(),
        user: None,
        source: TaskSource::SystemdTimer,
        next_run,
    })
}

fn split_first_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(idx) => Some((&s[..idx], &s[idx..])),
        None => Some((s, "")),
    }
}

/// Short name for a command: the program's base name
fn command_name(command: &str) -> String {
    let program = command
        .split_whitespace()
        .find(|word| !ENV_ASSIGNMENT.is_match(word))
        .unwrap_or(command);
    program.rsplit('/').next().unwrap_or(program).to_string()
}
