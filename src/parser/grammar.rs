//! Status-line grammar emitted by the on-device test engine.
//!
//! Patterns are tried in a fixed order and the first match wins:
//!
//! | Kind | Example |
//! |------|---------|
//! | Started | `pkgA, Version=1.0.0.0 : Tests started (10000 ticks = 1 millisecond)` |
//! | Passed | `Ns.ClassX.Method1 : Passed (50000 ticks)` |
//! | Failed | `Ns.ClassX.Method2 : Failed (oops)` |
//! | Ignored | `Ns.ClassX : Ignored with message: not on this board` |
//! | Finished | `pkgA : Tests finished` |
//!
//! Anything else is [`StatusLine::Unrecognized`].

use regex::Regex;

/// One classified device line, borrowing from the line text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusLine<'a> {
    Started {
        module: &'a str,
        version: Option<&'a str>,
        ticks_per_ms: u64,
    },
    Passed {
        class: &'a str,
        method: &'a str,
        ticks: u64,
    },
    Failed {
        class: &'a str,
        method: &'a str,
        message: &'a str,
    },
    /// `target` is either a class name or `class.method`; resolving which
    /// needs the skeleton, so it is left to the parser.
    Ignored { target: &'a str, message: &'a str },
    Finished { module: &'a str },
    Unrecognized,
}

/// Compiled line patterns.
pub struct Grammar {
    started: Regex,
    passed: Regex,
    failed: Regex,
    ignored: Regex,
    finished: Regex,
}

impl Grammar {
    pub fn new() -> Self {
        Self {
            started: Regex::new(
                r"^\s*(?P<head>[^:]+?)\s*:\s*Tests started \((?P<ticks>\d+) ticks = 1 millisecond\)",
            )
            .unwrap(),
            passed: Regex::new(r"^\s*(?P<target>\S+)\s*:\s*Passed \((?P<ticks>\d+) ticks\)")
                .unwrap(),
            failed: Regex::new(
                r"^\s*(?P<target>\S+)\s*:\s*Failed(?:\s*\((?P<message>.*)\))?\s*$",
            )
            .unwrap(),
            ignored: Regex::new(
                r"^\s*(?P<target>\S+)\s*:\s*Ignored(?:\s+with message:\s*(?P<message>.*))?$",
            )
            .unwrap(),
            finished: Regex::new(r"^\s*(?P<head>[^:]+?)\s*:\s*Tests finished").unwrap(),
        }
    }

    /// Classifies a single line with its terminator already stripped.
    pub fn classify<'a>(&self, line: &'a str) -> StatusLine<'a> {
        if let Some(caps) = self.started.captures(line) {
            let (module, version) = split_module(caps.name("head").map_or("", |m| m.as_str()));
            if let Some(ticks_per_ms) = caps.name("ticks").and_then(|m| m.as_str().parse().ok()) {
                return StatusLine::Started {
                    module,
                    version,
                    ticks_per_ms,
                };
            }
        }

        if let Some(caps) = self.passed.captures(line)
            && let Some((class, method)) = caps.name("target").and_then(|m| split_target(m.as_str()))
            && let Some(ticks) = caps.name("ticks").and_then(|m| m.as_str().parse().ok())
        {
            return StatusLine::Passed {
                class,
                method,
                ticks,
            };
        }

        // The engine drops the parentheses when the exception has no message.
        if let Some(caps) = self.failed.captures(line)
            && let Some((class, method)) = caps.name("target").and_then(|m| split_target(m.as_str()))
        {
            return StatusLine::Failed {
                class,
                method,
                message: caps.name("message").map_or("", |m| m.as_str()),
            };
        }

        if let Some(caps) = self.ignored.captures(line)
            && let Some(target) = caps.name("target")
        {
            return StatusLine::Ignored {
                target: target.as_str(),
                message: caps.name("message").map_or("", |m| m.as_str().trim_end()),
            };
        }

        if let Some(caps) = self.finished.captures(line) {
            let (module, _) = split_module(caps.name("head").map_or("", |m| m.as_str()));
            return StatusLine::Finished { module };
        }

        StatusLine::Unrecognized
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `Name, Version=1.2.3.4` into the module key and its version digits.
fn split_module(head: &str) -> (&str, Option<&str>) {
    let Some((module, rest)) = head.split_once(',') else {
        return (head.trim(), None);
    };

    let rest = rest.trim_start_matches(|c: char| !c.is_ascii_digit());
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let version = &rest[..end];

    (
        module.trim(),
        (!version.is_empty()).then_some(version),
    )
}

/// Splits `Namespace.Class.Method` at the last dot.
pub fn split_target(target: &str) -> Option<(&str, &str)> {
    let (class, method) = target.rsplit_once('.')?;
    if class.is_empty() || method.is_empty() {
        return None;
    }
    Some((class, method))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_started() {
        let grammar = Grammar::new();
        assert_eq!(
            grammar.classify("pkgA : Tests started (10000 ticks = 1 millisecond)"),
            StatusLine::Started {
                module: "pkgA",
                version: None,
                ticks_per_ms: 10000,
            }
        );
    }

    #[test]
    fn test_classify_started_with_version() {
        let grammar = Grammar::new();
        assert_eq!(
            grammar.classify(
                "NFUnitTest, Version=1.0.2.0 : Tests started (10000 ticks = 1 millisecond)"
            ),
            StatusLine::Started {
                module: "NFUnitTest",
                version: Some("1.0.2.0"),
                ticks_per_ms: 10000,
            }
        );
    }

    #[test]
    fn test_classify_passed_splits_at_last_dot() {
        let grammar = Grammar::new();
        assert_eq!(
            grammar.classify("NFUnitTest.Math.Adds : Passed (1234 ticks)"),
            StatusLine::Passed {
                class: "NFUnitTest.Math",
                method: "Adds",
                ticks: 1234,
            }
        );
    }

    #[test]
    fn test_classify_failed_keeps_parentheses_in_message() {
        let grammar = Grammar::new();
        assert_eq!(
            grammar.classify("ClassX.Method2 : Failed (Expected (1) but was (2))"),
            StatusLine::Failed {
                class: "ClassX",
                method: "Method2",
                message: "Expected (1) but was (2)",
            }
        );
    }

    #[test]
    fn test_classify_failed_without_message() {
        let grammar = Grammar::new();
        for line in ["ClassX.Method2 : Failed ()", "ClassX.Method2 : Failed"] {
            assert_eq!(
                grammar.classify(line),
                StatusLine::Failed {
                    class: "ClassX",
                    method: "Method2",
                    message: "",
                },
                "{line}"
            );
        }
    }

    #[test]
    fn test_classify_ignored_without_message() {
        let grammar = Grammar::new();
        for line in ["Ns.ClassY : Ignored with message: ", "Ns.ClassY : Ignored"] {
            assert_eq!(
                grammar.classify(line),
                StatusLine::Ignored {
                    target: "Ns.ClassY",
                    message: "",
                },
                "{line}"
            );
        }
    }

    #[test]
    fn test_classify_ignored() {
        let grammar = Grammar::new();
        assert_eq!(
            grammar.classify("Ns.ClassY : Ignored with message: needs wifi"),
            StatusLine::Ignored {
                target: "Ns.ClassY",
                message: "needs wifi",
            }
        );
    }

    #[test]
    fn test_classify_finished() {
        let grammar = Grammar::new();
        assert_eq!(
            grammar.classify("pkgA, Version=1.0.0.0 : Tests finished"),
            StatusLine::Finished { module: "pkgA" }
        );
    }

    #[test]
    fn test_classify_unrecognized() {
        let grammar = Grammar::new();
        for line in [
            "",
            "Type 0F (STRING              ):     24 bytes",
            "Method : Passed (12 ticks)",
            "ClassX.Method1 : Passed (many ticks)",
            "GC: 2msec 43512 bytes used",
        ] {
            assert_eq!(grammar.classify(line), StatusLine::Unrecognized, "{line}");
        }
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("A.B.C"), Some(("A.B", "C")));
        assert_eq!(split_target("NoDot"), None);
        assert_eq!(split_target("Trailing."), None);
    }
}
