//! The six acceptance criteria applied to a delivered artifact.
//!
//! Each criterion is independent and reports a pass/fail with a short detail
//! naming what it found.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static INCOMPLETE_MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:TODO|FIXME|XXX)\b|\btodo!\(|\bunimplemented!\(").unwrap()
});

// A line holding nothing but an ellipsis, optionally inside a comment.
static OMISSION_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?://|#|--|/\*|\*)?\s*(?:\.\.\.|…)\s*(?:\*/)?\s*$").unwrap()
});

static OMISSION_PHRASE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:rest|remainder)\s+(?:of\s+(?:the\s+)?[\w ]{0,20}?)?(?:omitted|unchanged|elided|truncated)\b|(?:\.\.\.|…)\s*(?:existing|rest of|remaining|same as before)\b|\b(?:code|content|implementation)\s+(?:omitted|elided)\s+for\s+brevity\b",
    )
    .unwrap()
});

static EARLY_TERMINATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\bI(?:'ll| will)? stop here\b|\bstopping here\b|\b(?:due to|given)\s+(?:length|space|time)\s+(?:constraints|limits|limitations)\b|\b(?:left|leave)\s+(?:this\s+|the rest\s+)?as an exercise\b|\byou can (?:complete|finish|fill in) the rest\b|\bI(?:'ll| will) continue in (?:a|the) next\b|\bto be continued\b",
    )
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CriterionId {
    Q1,
    Q2,
    Q3,
    Q4,
    Q5,
    Q6,
}

impl CriterionId {
    pub const ALL: [CriterionId; 6] = [
        CriterionId::Q1,
        CriterionId::Q2,
        CriterionId::Q3,
        CriterionId::Q4,
        CriterionId::Q5,
        CriterionId::Q6,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            CriterionId::Q1 => "required files exist",
            CriterionId::Q2 => "no incompleteness markers",
            CriterionId::Q3 => "no omission markers",
            CriterionId::Q4 => "syntax is well formed",
            CriterionId::Q5 => "evidence attached",
            CriterionId::Q6 => "no early termination",
        }
    }

    /// What the executor should do to satisfy a failed criterion.
    pub fn remedy(&self) -> &'static str {
        match self {
            CriterionId::Q1 => "create every required file",
            CriterionId::Q2 => "finish the marked work and remove TODO/FIXME markers",
            CriterionId::Q3 => "write out the full content instead of eliding it",
            CriterionId::Q4 => "fix the syntax errors",
            CriterionId::Q5 => "attach evidence for the operation",
            CriterionId::Q6 => "complete the task instead of stopping early",
        }
    }
}

impl fmt::Display for CriterionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionResult {
    pub id: CriterionId,
    pub label: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CriterionResult {
    fn pass(id: CriterionId) -> Self {
        Self {
            id,
            label: id.label().to_string(),
            passed: true,
            detail: None,
        }
    }

    fn fail(id: CriterionId, detail: impl Into<String>) -> Self {
        Self {
            id,
            label: id.label().to_string(),
            passed: false,
            detail: Some(detail.into()),
        }
    }
}

/// A delivered artifact under review.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    /// Delivered files by path.
    pub files: BTreeMap<String, String>,
    pub required_files: Vec<String>,
    pub evidence_ids: Vec<String>,
    /// The executor's free-text response.
    pub response: String,
}

impl Candidate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(path.into(), content.into());
        self
    }

    pub fn require(mut self, path: impl Into<String>) -> Self {
        self.required_files.push(path.into());
        self
    }

    pub fn with_evidence(mut self, evidence_id: impl Into<String>) -> Self {
        self.evidence_ids.push(evidence_id.into());
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    /// Require every path and load those that can be read.
    pub fn from_disk(paths: &[PathBuf]) -> Self {
        let mut candidate = Self::new();
        for path in paths {
            let key = path.to_string_lossy().into_owned();
            if let Ok(bytes) = std::fs::read(path) {
                candidate
                    .files
                    .insert(key.clone(), String::from_utf8_lossy(&bytes).into_owned());
            }
            candidate.required_files.push(key);
        }
        candidate
    }
}

/// Evaluate all six criteria in order.
pub fn evaluate_all(candidate: &Candidate) -> Vec<CriterionResult> {
    CriterionId::ALL
        .iter()
        .map(|id| evaluate(*id, candidate))
        .collect()
}

pub fn evaluate(id: CriterionId, candidate: &Candidate) -> CriterionResult {
    let outcome = match id {
        CriterionId::Q1 => required_files_exist(candidate),
        CriterionId::Q2 => first_match_in_files(candidate, &INCOMPLETE_MARKER_REGEX),
        CriterionId::Q3 => no_omissions(candidate),
        CriterionId::Q4 => syntax_well_formed(candidate),
        CriterionId::Q5 => {
            if candidate.evidence_ids.is_empty() {
                Err("no evidence item attached".to_string())
            } else {
                Ok(())
            }
        }
        CriterionId::Q6 => match EARLY_TERMINATION_REGEX.find(&candidate.response) {
            Some(m) => Err(format!("response contains '{}'", m.as_str())),
            None => Ok(()),
        },
    };
    match outcome {
        Ok(()) => CriterionResult::pass(id),
        Err(detail) => CriterionResult::fail(id, detail),
    }
}

fn required_files_exist(candidate: &Candidate) -> Result<(), String> {
    let missing: Vec<&str> = candidate
        .required_files
        .iter()
        .filter(|p| !candidate.files.contains_key(p.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing: {}", missing.join(", ")))
    }
}

fn line_of(content: &str, offset: usize) -> usize {
    content[..offset].matches('\n').count() + 1
}

fn first_match_in_files(candidate: &Candidate, regex: &Regex) -> Result<(), String> {
    for (path, content) in &candidate.files {
        if let Some(m) = regex.find(content) {
            return Err(format!(
                "{}:{} contains '{}'",
                path,
                line_of(content, m.start()),
                m.as_str().trim()
            ));
        }
    }
    Ok(())
}

fn no_omissions(candidate: &Candidate) -> Result<(), String> {
    first_match_in_files(candidate, &OMISSION_LINE_REGEX)?;
    first_match_in_files(candidate, &OMISSION_PHRASE_REGEX)
}

fn syntax_well_formed(candidate: &Candidate) -> Result<(), String> {
    for (path, content) in &candidate.files {
        let result = match SyntaxKind::for_path(Path::new(path)) {
            Some(SyntaxKind::Json) => serde_json::from_str::<serde_json::Value>(content)
                .map(|_| ())
                .map_err(|e| format!("invalid JSON: {}", e)),
            Some(kind) => check_delimiters(content, kind),
            None => Ok(()),
        };
        result.map_err(|e| format!("{}: {}", path, e))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyntaxKind {
    Json,
    /// `//` and `/* */` comments, double-quoted strings, char literals.
    CStyle,
    /// `#` comments, single- and double-quoted strings.
    HashComment,
}

impl SyntaxKind {
    fn for_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "json" => Some(SyntaxKind::Json),
            "rs" | "js" | "jsx" | "ts" | "tsx" | "go" | "java" | "kt" | "c" | "h" | "cc"
            | "cpp" | "hpp" | "cs" | "swift" | "scala" => Some(SyntaxKind::CStyle),
            "py" | "rb" | "sh" => Some(SyntaxKind::HashComment),
            _ => None,
        }
    }
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

/// Check that brackets balance outside strings and comments.
fn check_delimiters(content: &str, kind: SyntaxKind) -> Result<(), String> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if kind == SyntaxKind::CStyle && next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if kind == SyntaxKind::CStyle && next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    if chars[i] == '\n' {
                        line += 1;
                    }
                    i += 1;
                }
                i += 2;
                continue;
            }
            '#' if kind == SyntaxKind::HashComment => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            'r' if kind == SyntaxKind::CStyle && starts_raw_string(&chars, i) => {
                i = skip_raw_string(&chars, i, &mut line)?;
                continue;
            }
            '"' => {
                i = skip_string(&chars, i, '"', &mut line)?;
                continue;
            }
            '\'' if kind == SyntaxKind::HashComment => {
                i = skip_string(&chars, i, '\'', &mut line)?;
                continue;
            }
            '\'' => {
                // char literal like 'x' or '\n'; anything else is a lifetime
                if chars.get(i + 2) == Some(&'\'') {
                    i += 3;
                    continue;
                }
                if next == Some('\\')
                    && let Some(end) = (i + 2..(i + 12).min(chars.len())).find(|&j| chars[j] == '\'')
                {
                    i = end + 1;
                    continue;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closing_for(open) == c => {}
                Some((open, opened_at)) => {
                    return Err(format!(
                        "line {}: '{}' closes '{}' opened at line {}",
                        line, c, open, opened_at
                    ));
                }
                None => return Err(format!("line {}: unexpected '{}'", line, c)),
            },
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, opened_at)) => Err(format!("unclosed '{}' opened at line {}", open, opened_at)),
        None => Ok(()),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// `r"`, `r#"` or `br#"` at `i`, not the tail of an identifier.
fn starts_raw_string(chars: &[char], i: usize) -> bool {
    let prefix_ok = match i.checked_sub(1).map(|p| chars[p]) {
        None => true,
        Some('b') => i < 2 || !is_ident_char(chars[i - 2]),
        Some(p) => !is_ident_char(p),
    };
    if !prefix_ok {
        return false;
    }
    let mut j = i + 1;
    while chars.get(j) == Some(&'#') {
        j += 1;
    }
    chars.get(j) == Some(&'"')
}

/// Skip a raw string starting at its `r`. Its body has no escapes and ends at
/// a quote followed by as many `#` as opened it.
fn skip_raw_string(chars: &[char], start: usize, line: &mut usize) -> Result<usize, String> {
    let opened_at = *line;
    let mut i = start + 1;
    let mut hashes = 0;
    while chars.get(i) == Some(&'#') {
        hashes += 1;
        i += 1;
    }
    i += 1;
    while i < chars.len() {
        match chars[i] {
            '\n' => *line += 1,
            '"' if (1..=hashes).all(|k| chars.get(i + k) == Some(&'#')) => return Ok(i + 1 + hashes),
            _ => {}
        }
        i += 1;
    }
    Err(format!("unterminated raw string opened at line {}", opened_at))
}

fn skip_string(chars: &[char], start: usize, quote: char, line: &mut usize) -> Result<usize, String> {
    let opened_at = *line;
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '\n' => *line += 1,
            c if c == quote => return Ok(i + 1),
            _ => {}
        }
        i += 1;
    }
    Err(format!("unterminated string opened at line {}", opened_at))
}
