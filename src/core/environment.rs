//! Environment store shared across step execution.
//!
//! Holds the variables a scenario has accumulated: CLI overrides first,
//! then whatever each step exports. Later writes win. Rendering a command
//! substitutes `$NAME` / `${NAME}` references with stored values and
//! refuses a command that references something nobody defined. The
//! rendered text is for people and resource tracking; the shell itself
//! expands references from the subprocess environment.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error;

/// A command referenced a variable that is not defined anywhere
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("undefined variable '{0}'")]
pub struct UndefinedVariable(pub String);

/// Ordered variable map for one scenario run
#[derive(Debug, Clone, Default)]
pub struct EnvironmentStore {
    /// Scenario variables, in insertion order
    vars: IndexMap<String, String>,

    /// Snapshot of the engine's own environment, inherited by every subprocess
    inherited: HashMap<String, String>,
}

impl EnvironmentStore {
    /// Create an empty store that knows nothing about the host environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that treats the current process environment as defined
    pub fn with_process_env() -> Self {
        Self {
            vars: IndexMap::new(),
            inherited: std::env::vars().collect(),
        }
    }

    /// Mark `key` as provided to every subprocess from outside the store
    pub fn inherit(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inherited.insert(key.into(), value.into());
    }

    /// Get a scenario variable
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Set a variable (last writer wins, original position kept)
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Set every pair from an iterator
    pub fn extend<K, V, I>(&mut self, pairs: I)
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.set(key, value);
        }
    }

    /// Iterate scenario variables in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of scenario variables
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Check whether no scenario variables are set
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Value a subprocess would see for `key` (scenario first, then inherited)
    pub fn effective(&self, key: &str) -> Option<&str> {
        self.get(key)
            .or_else(|| self.inherited.get(key).map(String::as_str))
    }

    /// Substitute scenario variables into `text`.
    ///
    /// Single-quoted text, comments and quoted heredocs are left alone.
    /// Names assigned inside `text` itself, and names inherited from the
    /// host environment, are left for the shell to expand.
    pub fn render_template(&self, text: &str) -> Result<String, UndefinedVariable> {
        let locals = local_names(text);
        Renderer {
            store: self,
            locals: &locals,
            chars: text.chars().collect(),
            pos: 0,
            out: String::with_capacity(text.len()),
        }
        .render()
    }

    /// Feed `export -p` style output into the store.
    ///
    /// Only variables whose value differs from what the subprocess was
    /// started with are recorded. Returns the names that changed.
    pub fn absorb_exports(&mut self, exported: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in parse_exports(exported) {
            if is_shell_managed(&key) || self.effective(&key) == Some(value.as_str()) {
                continue;
            }
            self.set(key.clone(), value);
            changed.push(key);
        }
        changed
    }
}

/// Quote `value` as one shell word, leaving plain words untouched
pub fn shell_word(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Variables the shell rewrites on its own in every child
fn is_shell_managed(name: &str) -> bool {
    matches!(name, "SHLVL" | "PWD" | "OLDPWD" | "_" | "SHELLOPTS" | "BASHOPTS")
        || name.starts_with("BASH_FUNC_")
}

/// Names a command assigns itself (`X=`, `export X=`, `for X in`, `read X`)
fn local_names(text: &str) -> HashSet<String> {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(
                r"(?m)(?:^|[\s;&|(`])(?:(?:export|local|readonly|declare|typeset)(?:\s+-\w+)*\s+)?([A-Za-z_][A-Za-z0-9_]*)=",
            )
            .expect("valid assignment pattern"),
            Regex::new(r"\bfor\s+([A-Za-z_][A-Za-z0-9_]*)\s+in\b").expect("valid for pattern"),
            Regex::new(r"\bread\s+(?:-[A-Za-z]+\s+)*([A-Za-z_][A-Za-z0-9_]*)")
                .expect("valid read pattern"),
        ]
    });

    patterns
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Heredoc waiting for its body to start on the next line
struct PendingHeredoc {
    delimiter: String,
    quoted: bool,
    strip_tabs: bool,
}

struct Renderer<'a> {
    store: &'a EnvironmentStore,
    locals: &'a HashSet<String>,
    chars: Vec<char>,
    pos: usize,
    out: String,
}

impl<'a> Renderer<'a> {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn render(mut self) -> Result<String, UndefinedVariable> {
        let mut in_single = false;
        let mut in_double = false;
        let mut heredocs: Vec<PendingHeredoc> = Vec::new();

        while let Some(c) = self.peek(0) {
            if in_single {
                self.out.push(c);
                self.pos += 1;
                if c == '\'' {
                    in_single = false;
                }
                continue;
            }

            match c {
                '\\' => {
                    self.out.push(c);
                    self.pos += 1;
                    if let Some(next) = self.peek(0) {
                        self.out.push(next);
                        self.pos += 1;
                    }
                }
                '\'' if !in_double => {
                    in_single = true;
                    self.out.push(c);
                    self.pos += 1;
                }
                '"' => {
                    in_double = !in_double;
                    self.out.push(c);
                    self.pos += 1;
                }
                '#' if !in_double && self.at_word_start() => self.copy_line(),
                '<' if !in_double && self.is_heredoc_operator() => {
                    if let Some(heredoc) = self.read_heredoc_operator() {
                        heredocs.push(heredoc);
                    }
                }
                '$' => self.expand()?,
                '\n' => {
                    self.out.push(c);
                    self.pos += 1;
                    for heredoc in std::mem::take(&mut heredocs) {
                        self.heredoc_body(&heredoc)?;
                    }
                }
                _ => {
                    self.out.push(c);
                    self.pos += 1;
                }
            }
        }

        Ok(self.out)
    }

    /// `<<` that is neither part of `<<<` nor preceded by another `<`
    fn is_heredoc_operator(&self) -> bool {
        self.peek(1) == Some('<')
            && self.peek(2) != Some('<')
            && (self.pos == 0 || self.chars[self.pos - 1] != '<')
    }

    fn at_word_start(&self) -> bool {
        self.pos == 0 || self.chars[self.pos - 1].is_whitespace() || self.chars[self.pos - 1] == ';'
    }

    /// Copy up to (not including) the next newline
    fn copy_line(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.out.push(c);
            self.pos += 1;
        }
    }

    /// Consume `<<[-] [']DELIM[']`, copying it through
    fn read_heredoc_operator(&mut self) -> Option<PendingHeredoc> {
        self.out.push_str("<<");
        self.pos += 2;

        let strip_tabs = self.peek(0) == Some('-');
        if strip_tabs {
            self.out.push('-');
            self.pos += 1;
        }
        while let Some(c) = self.peek(0).filter(|c| *c == ' ' || *c == '\t') {
            self.out.push(c);
            self.pos += 1;
        }

        let quote = self.peek(0).filter(|c| *c == '\'' || *c == '"');
        if let Some(q) = quote {
            self.out.push(q);
            self.pos += 1;
        }

        let mut delimiter = String::new();
        while let Some(c) = self.peek(0).filter(|c| is_name_char(*c) || *c == '-' || *c == '.') {
            delimiter.push(c);
            self.out.push(c);
            self.pos += 1;
        }

        if let Some(q) = quote {
            if self.peek(0) == Some(q) {
                self.out.push(q);
                self.pos += 1;
            }
        }

        // `$((1<<2))` is a shift, not a heredoc
        if delimiter.is_empty() || delimiter.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        Some(PendingHeredoc {
            delimiter,
            quoted: quote.is_some(),
            strip_tabs,
        })
    }

    /// Copy heredoc lines up to and including the delimiter line
    fn heredoc_body(&mut self, heredoc: &PendingHeredoc) -> Result<(), UndefinedVariable> {
        while self.pos < self.chars.len() {
            let line_end = self.chars[self.pos..]
                .iter()
                .position(|c| *c == '\n')
                .map_or(self.chars.len(), |i| self.pos + i);
            let line: String = self.chars[self.pos..line_end].iter().collect();
            let candidate = if heredoc.strip_tabs {
                line.trim_start_matches('\t')
            } else {
                line.as_str()
            };
            let is_delimiter = candidate == heredoc.delimiter;

            if heredoc.quoted || is_delimiter {
                self.out.push_str(&line);
                self.pos = line_end;
            } else {
                while self.pos < line_end {
                    match self.peek(0) {
                        Some('\\') => {
                            self.out.push('\\');
                            self.pos += 1;
                            if self.pos < line_end {
                                self.out.push(self.chars[self.pos]);
                                self.pos += 1;
                            }
                        }
                        Some('$') => self.expand()?,
                        Some(c) => {
                            self.out.push(c);
                            self.pos += 1;
                        }
                        None => break,
                    }
                }
            }

            if self.peek(0) == Some('\n') {
                self.out.push('\n');
                self.pos += 1;
            }
            if is_delimiter {
                break;
            }
        }
        Ok(())
    }

    /// Handle a `$` at the cursor
    fn expand(&mut self) -> Result<(), UndefinedVariable> {
        match self.peek(1) {
            Some('{') => {
                let close = self.chars[self.pos + 2..].iter().position(|c| *c == '}');
                let Some(len) = close else {
                    self.out.push('$');
                    self.pos += 1;
                    return Ok(());
                };
                let inner: String = self.chars[self.pos + 2..self.pos + 2 + len].iter().collect();
                let raw_end = self.pos + 3 + len;

                // ${X:-default}, ${#X}, ${X%suffix} and friends are shell business
                let is_plain = inner.chars().next().is_some_and(is_name_start)
                    && inner.chars().all(is_name_char);
                if is_plain {
                    if let Some(value) = self.lookup(&inner)? {
                        self.out.push_str(&value);
                        self.pos = raw_end;
                        return Ok(());
                    }
                }
                let raw: String = self.chars[self.pos..raw_end].iter().collect();
                self.out.push_str(&raw);
                self.pos = raw_end;
            }
            Some(c) if is_name_start(c) => {
                let start = self.pos + 1;
                let mut end = start;
                while end < self.chars.len() && is_name_char(self.chars[end]) {
                    end += 1;
                }
                let name: String = self.chars[start..end].iter().collect();
                match self.lookup(&name)? {
                    Some(value) => self.out.push_str(&value),
                    None => {
                        self.out.push('$');
                        self.out.push_str(&name);
                    }
                }
                self.pos = end;
            }
            _ => {
                self.out.push('$');
                self.pos += 1;
            }
        }
        Ok(())
    }

    /// `Some(value)` to substitute, `None` to leave the reference for the shell
    fn lookup(&self, name: &str) -> Result<Option<String>, UndefinedVariable> {
        if self.locals.contains(name) {
            return Ok(None);
        }
        if let Some(value) = self.store.get(name) {
            return Ok(Some(value.to_string()));
        }
        if self.store.inherited.contains_key(name) {
            return Ok(None);
        }
        Err(UndefinedVariable(name.to_string()))
    }
}

/// Parse `export -p` / `declare -x` listings into name/value pairs.
///
/// Handles double-quoted, single-quoted, `$'...'` and bare values, including
/// values that span several lines. Declarations without a value are skipped.
pub fn parse_exports(text: &str) -> Vec<(String, String)> {
    let chars: Vec<char> = text.chars().collect();
    let mut pos = 0;
    let mut pairs = Vec::new();

    while pos < chars.len() {
        // Skip to the start of a declaration
        while pos < chars.len() && chars[pos].is_whitespace() {
            pos += 1;
        }
        let rest: String = chars[pos..chars.len().min(pos + 16)].iter().collect();
        let prefix_len = ["declare ", "typeset ", "export "]
            .iter()
            .find(|p| rest.starts_with(*p))
            .map(|p| p.len());
        let Some(prefix_len) = prefix_len else {
            skip_line(&chars, &mut pos);
            continue;
        };
        pos += prefix_len;

        // Flags such as -x, -rx
        while pos < chars.len() && chars[pos] == '-' {
            while pos < chars.len() && !chars[pos].is_whitespace() {
                pos += 1;
            }
            while pos < chars.len() && chars[pos] == ' ' {
                pos += 1;
            }
        }

        let name_start = pos;
        while pos < chars.len() && is_name_char(chars[pos]) {
            pos += 1;
        }
        let name: String = chars[name_start..pos].iter().collect();
        if name.is_empty() || !name.starts_with(is_name_start) || chars.get(pos) != Some(&'=') {
            skip_line(&chars, &mut pos);
            continue;
        }
        pos += 1;

        let value = read_value(&chars, &mut pos);
        pairs.push((name, value));
        skip_line(&chars, &mut pos);
    }

    pairs
}

fn skip_line(chars: &[char], pos: &mut usize) {
    while *pos < chars.len() && chars[*pos] != '\n' {
        *pos += 1;
    }
    *pos += 1;
}

/// Read one shell-quoted word (possibly several concatenated quoted parts)
fn read_value(chars: &[char], pos: &mut usize) -> String {
    let mut value = String::new();

    while *pos < chars.len() {
        match chars[*pos] {
            '"' => {
                *pos += 1;
                while *pos < chars.len() && chars[*pos] != '"' {
                    if chars[*pos] == '\\'
                        && matches!(chars.get(*pos + 1), Some('"' | '\\' | '$' | '`'))
                    {
                        *pos += 1;
                    }
                    value.push(chars[*pos]);
                    *pos += 1;
                }
                *pos += 1;
            }
            '$' if chars.get(*pos + 1) == Some(&'\'') => {
                *pos += 2;
                while *pos < chars.len() && chars[*pos] != '\'' {
                    if chars[*pos] == '\\' && *pos + 1 < chars.len() {
                        *pos += 1;
                        value.push(match chars[*pos] {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            'e' | 'E' => '\u{1b}',
                            other => other,
                        });
                    } else {
                        value.push(chars[*pos]);
                    }
                    *pos += 1;
                }
                *pos += 1;
            }
            '\'' => {
                *pos += 1;
                while *pos < chars.len() && chars[*pos] != '\'' {
                    value.push(chars[*pos]);
                    *pos += 1;
                }
                *pos += 1;
            }
            '\\' if *pos + 1 < chars.len() => {
                value.push(chars[*pos + 1]);
                *pos += 2;
            }
            c if c.is_whitespace() => break,
            c => {
                value.push(c);
                *pos += 1;
            }
        }
    }

    value
}
