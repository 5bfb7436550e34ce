use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;

use colored::Colorize;
use lazy_static::lazy_static;
use strum_macros::Display;

use crate::logger::{self, Message};
use crate::AppReturnCode;

/// How bad a failed check is. Sections order the per-engine summary and
/// decide the process exit code.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Display)]
pub enum CheckSection {
    Important,
    Misbehaviour,
    Notes,
    Report,
}

/// A named thing the harness checks about an engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CheckTopic {
    pub group: &'static str,
    pub id: &'static str,
    pub text: &'static str,
    pub section: CheckSection,
}

/// Stop printing individual failures of a topic after this many; engines in
/// a bad state tend to repeat the same mistake every move.
pub const MAX_CLI_LOGS_PER_ERROR: u64 = 5;

const BUILTIN_TOPICS: &[CheckTopic] = &[
    CheckTopic {
        group: "engine",
        id: "no-disconnect",
        text: "the engine stays alive and answers ready checks",
        section: CheckSection::Important,
    },
    CheckTopic {
        group: "moves",
        id: "legalmove",
        text: "best moves are legal in the current position",
        section: CheckSection::Important,
    },
    CheckTopic {
        group: "moves",
        id: "bestmove-only-when-searching",
        text: "bestmove only arrives as an answer to go",
        section: CheckSection::Important,
    },
    CheckTopic {
        group: "time",
        id: "no-loss-on-time",
        text: "moves arrive within the remaining clock time",
        section: CheckSection::Important,
    },
    CheckTopic {
        group: "time",
        id: "no-movetime-overrun",
        text: "fixed move time is not exceeded",
        section: CheckSection::Misbehaviour,
    },
    CheckTopic {
        group: "time",
        id: "no-movetime-underrun",
        text: "fixed move time is actually used",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "limits",
        id: "depth-limit-respected",
        text: "a depth limit stops the search at that depth",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "limits",
        id: "nodes-limit-respected",
        text: "a node limit stops the search near that count",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "uci",
        id: "wrong-token-in-info-line",
        text: "info lines contain only known tokens with sane values",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "uci",
        id: "parseable-output",
        text: "output lines are well-formed",
        section: CheckSection::Misbehaviour,
    },
    CheckTopic {
        group: "moves",
        id: "pv-moves-legal",
        text: "reported pv moves are legal when replayed",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "moves",
        id: "ponder-move-legal",
        text: "reported ponder moves are legal",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "moves",
        id: "currmove-legal",
        text: "reported current moves are legal",
        section: CheckSection::Notes,
    },
    CheckTopic {
        group: "proto",
        id: "pong-matches-ping",
        text: "pong answers carry the last ping number",
        section: CheckSection::Misbehaviour,
    },
    CheckTopic {
        group: "options",
        id: "option-values-accepted",
        text: "configured option values fit the declared ranges",
        section: CheckSection::Notes,
    },
];

lazy_static! {
    static ref TOPICS: Mutex<BTreeMap<&'static str, CheckTopic>> = {
        let mut map = BTreeMap::new();
        for topic in BUILTIN_TOPICS {
            _ = map.insert(topic.id, *topic);
        }
        Mutex::new(map)
    };
}

/// Registers a check topic. Re-registering the identical topic is a no-op;
/// re-registering an id with different fields is a bug in the caller.
pub fn register_topic(topic: CheckTopic) {
    // panic outside the lock so a bad caller doesn't poison the registry
    let existing = {
        let mut topics = TOPICS.lock().unwrap();
        match topics.get(topic.id) {
            Some(existing) => Some(*existing),
            None => {
                _ = topics.insert(topic.id, topic);
                None
            }
        }
    };
    if let Some(existing) = existing {
        assert_eq!(
            existing, topic,
            "conflicting re-registration of check topic '{}'",
            topic.id
        );
    }
}

pub fn lookup_topic(id: &str) -> Option<CheckTopic> {
    TOPICS.lock().unwrap().get(id).copied()
}

#[derive(Debug, Default, Copy, Clone)]
struct Counts {
    total: u64,
    failures: u64,
    suppression_noticed: bool,
}

/// Pass/fail bookkeeping of all checks for one engine.
#[derive(Debug, Default)]
pub struct EngineReport {
    engine: String,
    entries: Mutex<BTreeMap<&'static str, Counts>>,
}

impl EngineReport {
    pub fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            ..Self::default()
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Records one check outcome. Failures are logged until the topic gets
    /// noisy, then silenced with a one-time notice.
    pub fn log_report(&self, topic_id: &str, passed: bool, detail: Option<&str>) {
        let Some(topic) = lookup_topic(topic_id) else {
            panic!("check topic '{topic_id}' was never registered")
        };
        let mut entries = self.entries.lock().unwrap();
        let counts = entries.entry(topic.id).or_default();
        counts.total += 1;
        if passed {
            return;
        }
        counts.failures += 1;
        if counts.failures > MAX_CLI_LOGS_PER_ERROR {
            if !counts.suppression_noticed {
                counts.suppression_noticed = true;
                logger::log(
                    Message::Info,
                    &format!(
                        "{}: too many similar reports for '{topic_id}', suppressing further ones",
                        self.engine
                    ),
                );
            }
            return;
        }
        let severity = match topic.section {
            CheckSection::Important => Message::Error,
            CheckSection::Misbehaviour => Message::Warning,
            _ => Message::Info,
        };
        let detail = detail.map(|d| format!(" ({d})")).unwrap_or_default();
        logger::log(
            severity,
            &format!("{}: check '{topic_id}' failed{detail}", self.engine),
        );
    }

    fn failures_in(&self, section: CheckSection) -> u64 {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter_map(|(id, counts)| {
                let topic = lookup_topic(id)?;
                (topic.section == section).then_some(counts.failures)
            })
            .sum()
    }

    pub fn return_code(&self) -> AppReturnCode {
        if self.failures_in(CheckSection::Important) > 0 {
            AppReturnCode::EngineError
        } else if self.failures_in(CheckSection::Misbehaviour) > 0 {
            AppReturnCode::EngineMisbehaviour
        } else if self.failures_in(CheckSection::Notes) > 0 {
            AppReturnCode::EngineNote
        } else {
            AppReturnCode::NoError
        }
    }

    /// Renders the per-engine summary grouped by section and logs it.
    /// Returns the escalation for the process exit code.
    pub fn log_summary(&self) -> AppReturnCode {
        let entries = self.entries.lock().unwrap();
        let mut out = format!("Report for {}:\n", self.engine.bold());
        for section in [
            CheckSection::Important,
            CheckSection::Misbehaviour,
            CheckSection::Notes,
            CheckSection::Report,
        ] {
            let mut lines = vec![];
            for (id, counts) in entries.iter() {
                let Some(topic) = lookup_topic(id) else {
                    continue;
                };
                if topic.section != section {
                    continue;
                }
                let verdict = if counts.failures == 0 {
                    "ok".green().to_string()
                } else {
                    format!("{} of {} failed", counts.failures, counts.total)
                        .red()
                        .to_string()
                };
                lines.push(format!("  [{}] {}: {verdict}", topic.group, topic.text));
            }
            if !lines.is_empty() {
                _ = writeln!(out, "{section}:");
                for line in lines {
                    _ = writeln!(out, "{line}");
                }
            }
        }
        drop(entries);
        logger::log(Message::Info, out.trim_end());
        self.return_code()
    }
}
