use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Only the crate's own sources are policed; vendored or generated trees are not.
const SOURCE_DIRS: [&str; 5] = ["calibrate", "cli", "src", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

/// One source policy: a line regex, a per-line filter, and the message shown
/// when the filter accepts a match.
struct Rule {
    pattern: String,
    accepts: fn(&str) -> bool,
    headline: &'static str,
    advice: &'static str,
}

// Collects accepted matches for one file and one rule.
struct RuleCollector<'r> {
    rule: &'r Rule,
    file_path: PathBuf,
    violations: Vec<String>,
}

impl<'r> RuleCollector<'r> {
    fn new(rule: &'r Rule, file_path: &Path) -> Self {
        Self {
            rule,
            file_path: file_path.to_path_buf(),
            violations: Vec::new(),
        }
    }

    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.rule.headline,
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.rule.advice));
        Some(error_msg)
    }
}

impl Sink for RuleCollector<'_> {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.rule.accepts)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with("//") || line.contains("/*")
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

/// Underscore-prefixed identifiers outside comments and string literals.
fn underscore_in_code(line: &str) -> bool {
    if is_comment_line(line) {
        return false;
    }
    // Odd-numbered segments between quotes are string contents.
    let in_string = line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'));
    !in_string
}

fn forbidden_word_in_comment(line: &str) -> bool {
    FORBIDDEN_WORDS.iter().any(|word| line.contains(word))
}

/// `**` is tolerated in `///` docs but nowhere else in comments.
fn stars_outside_doc_comment(line: &str) -> bool {
    !is_doc_comment(line)
}

fn comment_is_all_uppercase(line: &str) -> bool {
    let trimmed = line.trim_start();
    let comment_text = if let Some(rest) = trimmed.strip_prefix("///") {
        rest.trim()
    } else if let Some(rest) = trimmed.strip_prefix("//") {
        rest.trim()
    } else if let Some(idx) = line.find("/*") {
        let rest = &line[idx + 2..];
        match rest.find("*/") {
            Some(end) => rest[..end].trim(),
            None => rest.trim(),
        }
    } else {
        return false;
    };

    let mut letters = comment_text.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn any_line(_: &str) -> bool {
    true
}

fn rules() -> Vec<Rule> {
    vec![
        Rule {
            pattern: r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            accepts: underscore_in_code,
            headline: "underscore-prefixed bindings",
            advice: "Underscore-prefixed names are not allowed. Use the binding or remove it.",
        },
        Rule {
            pattern: format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            accepts: forbidden_word_in_comment,
            headline: "forbidden comment words",
            advice: "Comments must describe the code as it is, not its edit history.",
        },
        Rule {
            pattern: r"(//|/\*).*\*\*".to_string(),
            accepts: stars_outside_doc_comment,
            headline: "'**' sequences in non-doc comments",
            advice: "Emphasis markers belong in doc comments only.",
        },
        Rule {
            pattern: r"(//|/\*).*".to_string(),
            accepts: comment_is_all_uppercase,
            headline: "comments written entirely in uppercase",
            advice: "Write comments in sentence case or delete them.",
        },
        Rule {
            pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
            accepts: any_line,
            headline: "#[allow(dead_code)] attributes",
            advice: "Use the code or remove it; dead code is never silenced.",
        },
    ]
}

fn source_files() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .filter(|dir| Path::new(dir).is_dir())
        .flat_map(|dir| {
            WalkDir::new(dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
                .map(|e| e.into_path())
        })
        .collect()
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let files = source_files();
    let mut searcher = Searcher::new();
    for rule in rules() {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern)?;
        for path in &files {
            let mut collector = RuleCollector::new(&rule, path);
            searcher.search_path(&matcher, path, &mut collector)?;
            if let Some(error_message) = collector.check_and_get_error_message() {
                return Err(error_message.into());
            }
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = scan_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
