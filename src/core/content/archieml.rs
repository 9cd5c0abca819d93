// ArchieML parser.
//
// Documents are authored as loosely structured plain text and parsed into a
// JSON tree: `key: value` lines, nested `{scopes}`, `[arrays]` of either
// `*` bullet strings or repeated-key objects, multi-line values terminated
// by `:end`, and `:skip`/`:endskip`/`:ignore` directives. Published JSON is
// consumed by live embeds, so the grammar here is treated as frozen - any
// change in output shape is a breaking change for downstream pages.

use serde_json::{Map, Value};

/// One step into the output tree while it is being built.
#[derive(Debug, Clone, PartialEq)]
enum Seg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArrayKind {
    /// No element seen yet; the first `*` or key line decides.
    Unknown,
    /// `*` bullet items: an array of strings.
    Simple,
    /// Repeated-key blocks: an array of objects, a new element starting
    /// whenever the first-seen key reappears.
    Complex,
}

#[derive(Debug)]
struct ArrayCtx {
    path: Vec<Seg>,
    kind: ArrayKind,
    first_key: Option<String>,
}

struct Parser {
    data: Value,
    scope: Vec<Seg>,
    arrays: Vec<ArrayCtx>,
    buffer_key: Option<Vec<Seg>>,
    buffer: String,
    skipping: bool,
    done: bool,
}

/// Parses ArchieML text into a JSON object. Lines that match no rule are
/// ignored (unless buffered for a pending `:end`), so arbitrary prose can
/// surround the structured content.
pub fn load(input: &str) -> Value {
    let mut parser = Parser::new();
    for line in input.lines() {
        if parser.done {
            break;
        }
        parser.consume(line);
    }
    parser.data
}

impl Parser {
    fn new() -> Self {
        Self {
            data: Value::Object(Map::new()),
            scope: Vec::new(),
            arrays: Vec::new(),
            buffer_key: None,
            buffer: String::new(),
            skipping: false,
            done: false,
        }
    }

    fn consume(&mut self, line: &str) {
        if self.skipping {
            if let Some(cmd) = parse_command(line) {
                if cmd == "endskip" {
                    self.skipping = false;
                }
            }
            return;
        }

        if let Some(cmd) = parse_command(line) {
            match cmd.as_str() {
                "end" => self.flush_multiline(),
                "skip" => self.skipping = true,
                "endskip" => {}
                "ignore" => self.done = true,
                _ => {}
            }
            return;
        }

        if let Some((open, relative, name)) = parse_scope(line) {
            self.reset_buffer();
            match open {
                '{' => self.open_scope(relative, &name),
                _ => self.open_array(relative, &name),
            }
            return;
        }

        let in_simple_array = matches!(
            self.arrays.last(),
            Some(ArrayCtx {
                kind: ArrayKind::Simple,
                ..
            })
        );
        if !in_simple_array {
            if let Some((key, rest)) = parse_key(line) {
                self.set_key(&key, rest);
                return;
            }
        }

        let in_complex_array = matches!(
            self.arrays.last(),
            Some(ArrayCtx {
                kind: ArrayKind::Complex,
                ..
            })
        );
        if !in_complex_array && !self.arrays.is_empty() {
            if let Some(rest) = parse_bullet(line) {
                self.push_bullet(rest);
                return;
            }
        }

        // Anything else is candidate text for a pending multi-line value.
        if self.buffer_key.is_some() {
            self.buffer.push('\n');
            self.buffer.push_str(line);
        }
    }

    /// Where new values land right now: the last element of the open array,
    /// or the current object scope.
    fn base_path(&self) -> Vec<Seg> {
        match self.arrays.last() {
            Some(ctx) => {
                let mut path = ctx.path.clone();
                let len = array_len(&self.data, &ctx.path);
                path.push(Seg::Index(len.saturating_sub(1)));
                path
            }
            None => self.scope.clone(),
        }
    }

    fn set_key(&mut self, key: &str, rest: &str) {
        if let Some(ctx) = self.arrays.last_mut() {
            ctx.kind = ArrayKind::Complex;
            let starts_element = match &ctx.first_key {
                None => true,
                Some(first) => first == key,
            };
            if ctx.first_key.is_none() {
                ctx.first_key = Some(key.to_string());
            }
            if starts_element {
                let path = ctx.path.clone();
                push_element(&mut self.data, &path, Value::Object(Map::new()));
            }
        }

        let mut path = self.base_path();
        path.extend(key_segments(key));
        set_at(&mut self.data, &path, Value::String(rest.trim().to_string()));
        self.buffer_key = Some(path);
        self.buffer = rest.to_string();
    }

    fn push_bullet(&mut self, rest: &str) {
        let (path, len) = match self.arrays.last_mut() {
            Some(ctx) => {
                ctx.kind = ArrayKind::Simple;
                let path = ctx.path.clone();
                let len = array_len(&self.data, &path);
                (path, len)
            }
            None => return,
        };
        push_element(&mut self.data, &path, Value::String(rest.trim().to_string()));
        let mut slot = path;
        slot.push(Seg::Index(len));
        self.buffer_key = Some(slot);
        self.buffer = rest.to_string();
    }

    fn open_scope(&mut self, relative: bool, name: &str) {
        // Scope lines close any open array.
        self.arrays.clear();
        if name.is_empty() {
            self.scope.clear();
            return;
        }
        let mut path = if relative {
            self.scope.clone()
        } else {
            Vec::new()
        };
        path.extend(key_segments(name));
        ensure_object(&mut self.data, &path);
        self.scope = path;
    }

    fn open_array(&mut self, relative: bool, name: &str) {
        if name.is_empty() {
            // `[]` closes the innermost open array.
            self.arrays.pop();
            return;
        }
        let mut path = if relative {
            self.base_path()
        } else {
            self.arrays.clear();
            self.scope.clone()
        };
        path.extend(key_segments(name));
        ensure_array(&mut self.data, &path);
        self.arrays.push(ArrayCtx {
            path,
            kind: ArrayKind::Unknown,
            first_key: None,
        });
    }

    fn flush_multiline(&mut self) {
        if let Some(path) = self.buffer_key.take() {
            let value = format_multiline(&self.buffer);
            set_at(&mut self.data, &path, Value::String(value));
        }
        self.buffer.clear();
    }

    fn reset_buffer(&mut self) {
        self.buffer_key = None;
        self.buffer.clear();
    }
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// `key: value` with a key of `[A-Za-z0-9_.-]+`.
fn parse_key(line: &str) -> Option<(String, &str)> {
    let trimmed = line.trim_start();
    let key_end = trimmed.find(|c: char| !is_key_char(c))?;
    if key_end == 0 {
        return None;
    }
    let rest = trimmed[key_end..].trim_start_matches([' ', '\t']);
    let rest = rest.strip_prefix(':')?;
    Some((
        trimmed[..key_end].to_string(),
        rest.trim_start_matches([' ', '\t']),
    ))
}

/// `:end`, `:skip`, `:endskip` or `:ignore` (case-insensitive, trailing
/// text ignored).
fn parse_command(line: &str) -> Option<String> {
    let rest = line.trim_start().strip_prefix(':')?;
    let word: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_lowercase();
    match word.as_str() {
        "end" | "skip" | "endskip" | "ignore" => Some(word),
        _ => None,
    }
}

/// `* value` bullet inside an array.
fn parse_bullet(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('*')?;
    Some(rest.trim_start_matches([' ', '\t']))
}

/// `{name}`, `{.name}`, `{}`, `[name]`, `[.name]` or `[]`.
/// Returns (opening bracket, leading-dot flag, name).
fn parse_scope(line: &str) -> Option<(char, bool, String)> {
    let trimmed = line.trim_start();
    let mut chars = trimmed.chars();
    let open = chars.next()?;
    if open != '{' && open != '[' {
        return None;
    }
    let rest = chars.as_str().trim_start();
    let relative = rest.starts_with('.') || rest.starts_with('+');
    let rest = rest.trim_start_matches(['.', '+']).trim_start();
    let name_end = rest
        .find(|c: char| !is_key_char(c))
        .unwrap_or(rest.len());
    let name = &rest[..name_end];
    let tail = rest[name_end..].trim_start();
    let close = if open == '{' { '}' } else { ']' };
    if tail.starts_with(close) {
        Some((open, relative, name.to_string()))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Multi-line value formatting
// ---------------------------------------------------------------------------

/// Applies the `:end` block rules: a leading backslash escapes a line,
/// single-bracket `[comments]` are dropped, `[[literal]]` brackets collapse
/// to single brackets.
fn format_multiline(raw: &str) -> String {
    let formatted: Vec<String> = raw
        .split('\n')
        .map(|line| {
            let line = line.strip_prefix('\\').unwrap_or(line);
            strip_inline_comments(line)
        })
        .collect();
    formatted.join("\n").trim().to_string()
}

fn strip_inline_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '[' {
            if chars.get(i + 1) == Some(&'[') {
                // [[literal]] -> [literal]
                if let Some(close) = find_seq(&chars, i + 2, &[']', ']']) {
                    out.push('[');
                    out.extend(&chars[i + 2..close]);
                    out.push(']');
                    i = close + 2;
                    continue;
                }
            } else if let Some(close) = chars[i + 1..].iter().position(|c| *c == ']') {
                // [comment] -> dropped
                i = i + 1 + close + 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn find_seq(chars: &[char], from: usize, seq: &[char]) -> Option<usize> {
    (from..chars.len().saturating_sub(seq.len() - 1))
        .find(|&i| &chars[i..i + seq.len()] == seq)
}

// ---------------------------------------------------------------------------
// Tree building
// ---------------------------------------------------------------------------

fn key_segments(key: &str) -> Vec<Seg> {
    key.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| Seg::Key(s.to_string()))
        .collect()
}

fn navigate<'a>(root: &'a mut Value, path: &[Seg]) -> &'a mut Value {
    let mut cur = root;
    for seg in path {
        match seg {
            Seg::Key(k) => {
                if !matches!(cur, Value::Object(_)) {
                    *cur = Value::Object(Map::new());
                }
                match cur {
                    Value::Object(map) => {
                        cur = map.entry(k.clone()).or_insert(Value::Null);
                    }
                    _ => unreachable!(),
                }
            }
            Seg::Index(i) => {
                if !matches!(cur, Value::Array(_)) {
                    *cur = Value::Array(Vec::new());
                }
                match cur {
                    Value::Array(arr) => {
                        while arr.len() <= *i {
                            arr.push(Value::Null);
                        }
                        cur = &mut arr[*i];
                    }
                    _ => unreachable!(),
                }
            }
        }
    }
    cur
}

fn set_at(root: &mut Value, path: &[Seg], value: Value) {
    *navigate(root, path) = value;
}

fn ensure_object(root: &mut Value, path: &[Seg]) {
    let slot = navigate(root, path);
    if !matches!(slot, Value::Object(_)) {
        *slot = Value::Object(Map::new());
    }
}

fn ensure_array(root: &mut Value, path: &[Seg]) {
    let slot = navigate(root, path);
    if !matches!(slot, Value::Array(_)) {
        *slot = Value::Array(Vec::new());
    }
}

fn array_len(root: &Value, path: &[Seg]) -> usize {
    let mut cur = root;
    for seg in path {
        cur = match seg {
            Seg::Key(k) => match cur.get(k) {
                Some(v) => v,
                None => return 0,
            },
            Seg::Index(i) => match cur.get(i) {
                Some(v) => v,
                None => return 0,
            },
        };
    }
    cur.as_array().map(|a| a.len()).unwrap_or(0)
}

fn push_element(root: &mut Value, path: &[Seg], value: Value) {
    let slot = navigate(root, path);
    if !matches!(slot, Value::Array(_)) {
        *slot = Value::Array(Vec::new());
    }
    if let Value::Array(arr) = slot {
        arr.push(value);
    }
}
