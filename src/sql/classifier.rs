//! SQL script classification.
//!
//! Splits a submitted script into statements on top-level semicolons while
//! honouring single-quoted strings, dollar-quoted strings, `--` line comments
//! and (nested) `/* ... */` block comments, then tags each statement by its
//! leading keyword. No full SQL parse happens here; everything downstream
//! that needs real syntax (the prepare probe) asks the server.

use serde::Serialize;

/// What a statement does, judged by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatementKind {
    Select,
    Explain,
    ModifyData,
    ModifyStructure,
    Utility,
    Unknown,
}

/// A positional parameter reference (`$N`) found in a statement.
///
/// A declared name comes from an inline block comment directly after the
/// placeholder (`$1 /* user_id */`); without one the name is just `$N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRef {
    pub ordinal: u32,
    pub name: Option<String>,
}

/// A table referenced by a statement, with its alias when one is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

/// One classified statement of a script.
#[derive(Debug, Clone)]
pub struct Statement {
    /// The statement text, trimmed of surrounding whitespace.
    pub text: String,
    /// Inclusive byte range of `text` within the submitted script.
    pub start: usize,
    pub end: usize,
    pub kind: StatementKind,
    pub params: Vec<ParamRef>,
    /// CTE names introduced by a leading WITH clause.
    pub ctes: Vec<String>,
    /// Tables referenced via FROM / JOIN / INTO / UPDATE, aliases included.
    pub tables: Vec<TableRef>,
}

impl Statement {
    /// Highest `$N` ordinal used by the statement, 0 when parameter-free.
    pub fn max_param(&self) -> u32 {
        self.params.iter().map(|p| p.ordinal).max().unwrap_or(0)
    }

    /// Tables referenced by the statement minus its own CTE names. This is
    /// the set the response cache uses for data-change invalidation.
    pub fn referenced_tables(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|t| !self.ctes.iter().any(|c| c.eq_ignore_ascii_case(&t.name)))
            .map(|t| t.name.clone())
            .collect()
    }

    /// For an `explain` statement, the classification of the inner form.
    pub fn explain_inner(&self) -> Option<StatementKind> {
        if self.kind != StatementKind::Explain {
            return None;
        }
        let toks = tokenize(&self.text);
        let mut it = toks.iter().skip(1).peekable();

        // skip an option list: EXPLAIN (FORMAT JSON, ANALYZE false) ...
        if let Some(Token::Punct('(')) = it.peek() {
            let mut depth = 0usize;
            for tok in it.by_ref() {
                match tok {
                    Token::Punct('(') => depth += 1,
                    Token::Punct(')') => {
                        depth -= 1;
                        if depth == 0 {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }

        // skip legacy modifiers: EXPLAIN ANALYZE VERBOSE ...
        while let Some(Token::Word(w)) = it.peek() {
            if w == "analyze" || w == "analyse" || w == "verbose" {
                it.next();
            } else {
                break;
            }
        }

        match it.next() {
            Some(Token::Word(w)) => Some(classify_keyword(w)),
            _ => Some(StatementKind::Unknown),
        }
    }
}

/// Split and classify a script. Statements that contain nothing but
/// whitespace and comments (e.g. between two consecutive semicolons) are
/// dropped.
pub fn classify_script(script: &str) -> Vec<Statement> {
    raw_spans(script)
        .into_iter()
        .filter_map(|(start, end)| build_statement(script, start, end))
        .collect()
}

fn build_statement(script: &str, span_start: usize, span_end: usize) -> Option<Statement> {
    let raw = &script[span_start..span_end];
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = span_start + (raw.len() - raw.trim_start().len());
    let end = start + trimmed.len() - 1;

    let tokens = tokenize(trimmed);
    let leading = tokens.iter().find_map(|t| match t {
        Token::Word(w) => Some(w.as_str()),
        _ => None,
    })?;
    let kind = classify_keyword(leading);

    let (ctes, tables) = match kind {
        StatementKind::Select | StatementKind::ModifyData => extract_references(&tokens),
        _ => (Vec::new(), Vec::new()),
    };

    Some(Statement {
        text: trimmed.to_owned(),
        start,
        end,
        kind,
        params: scan_params(trimmed),
        ctes,
        tables,
    })
}

/// First bare word of a statement, comments skipped.
pub fn leading_keyword(text: &str) -> Option<String> {
    tokenize(text).into_iter().find_map(|t| match t {
        Token::Word(w) => Some(w),
        _ => None,
    })
}

fn classify_keyword(word: &str) -> StatementKind {
    match word {
        "select" | "with" | "values" | "table" | "show" => StatementKind::Select,
        "explain" => StatementKind::Explain,
        "insert" | "update" | "delete" | "merge" | "copy" => StatementKind::ModifyData,
        "create" | "alter" | "drop" | "truncate" | "rename" | "comment" | "grant" | "revoke"
        | "reindex" | "vacuum" | "cluster" | "refresh" => StatementKind::ModifyStructure,
        "begin" | "commit" | "rollback" | "set" | "reset" | "listen" | "notify" | "deallocate"
        | "prepare" | "execute" | "call" => StatementKind::Utility,
        _ => StatementKind::Unknown,
    }
}

// ---------------------------------------------------------------------------
// lexing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Normal,
    SingleQuote,
    DoubleQuote,
    LineComment,
    /// Block comments nest in PostgreSQL.
    BlockComment(usize),
    /// Inside `$tag$ ... $tag$`; the payload is the tag byte range start/len
    /// within the scanned text.
    DollarQuote(usize, usize),
}

/// Walk `text` byte by byte, calling `visit(pos, byte, mode)` for every byte
/// with the mode in effect *at* that byte. Quote and comment transitions are
/// handled here so callers never have to.
fn scan(text: &str, mut visit: impl FnMut(usize, u8, Mode)) {
    let bytes = text.as_bytes();
    let mut mode = Mode::Normal;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match mode {
            Mode::Normal => match b {
                b'\'' => {
                    visit(i, b, mode);
                    mode = Mode::SingleQuote;
                }
                b'"' => {
                    visit(i, b, mode);
                    mode = Mode::DoubleQuote;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    mode = Mode::LineComment;
                    visit(i, b, mode);
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    mode = Mode::BlockComment(1);
                    visit(i, b, mode);
                    visit(i + 1, bytes[i + 1], mode);
                    i += 2;
                    continue;
                }
                b'$' => {
                    if let Some((tag_start, tag_len, total)) = dollar_tag(bytes, i) {
                        mode = Mode::DollarQuote(tag_start, tag_len);
                        for off in 0..total {
                            visit(i + off, bytes[i + off], mode);
                        }
                        i += total;
                        continue;
                    }
                    visit(i, b, mode);
                }
                _ => visit(i, b, mode),
            },
            Mode::SingleQuote => {
                visit(i, b, mode);
                if b == b'\'' {
                    // doubled quote is an escaped quote, not a terminator
                    if bytes.get(i + 1) == Some(&b'\'') {
                        visit(i + 1, bytes[i + 1], mode);
                        i += 2;
                        continue;
                    }
                    mode = Mode::Normal;
                }
            }
            Mode::DoubleQuote => {
                visit(i, b, mode);
                if b == b'"' {
                    if bytes.get(i + 1) == Some(&b'"') {
                        visit(i + 1, bytes[i + 1], mode);
                        i += 2;
                        continue;
                    }
                    mode = Mode::Normal;
                }
            }
            Mode::LineComment => {
                if b == b'\n' {
                    mode = Mode::Normal;
                    visit(i, b, mode);
                } else {
                    visit(i, b, mode);
                }
            }
            Mode::BlockComment(depth) => {
                if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                    let next = if depth == 1 {
                        Mode::Normal
                    } else {
                        Mode::BlockComment(depth - 1)
                    };
                    visit(i, b, Mode::BlockComment(depth));
                    visit(i + 1, bytes[i + 1], Mode::BlockComment(depth));
                    mode = next;
                    i += 2;
                    continue;
                }
                if b == b'/' && bytes.get(i + 1) == Some(&b'*') {
                    mode = Mode::BlockComment(depth + 1);
                    visit(i, b, mode);
                    visit(i + 1, bytes[i + 1], mode);
                    i += 2;
                    continue;
                }
                visit(i, b, mode);
            }
            Mode::DollarQuote(tag_start, tag_len) => {
                visit(i, b, mode);
                if b == b'$' && closes_dollar(bytes, i, text, tag_start, tag_len) {
                    let total = tag_len + 2;
                    for off in 1..total {
                        if i + off < bytes.len() {
                            visit(i + off, bytes[i + off], mode);
                        }
                    }
                    mode = Mode::Normal;
                    i += total;
                    continue;
                }
            }
        }
        i += 1;
    }
}

/// Recognise a dollar-quote opener at `i`. Returns (tag start, tag length,
/// total opener length). `$1` is a parameter, not a tag: tags cannot start
/// with a digit.
fn dollar_tag(bytes: &[u8], i: usize) -> Option<(usize, usize, usize)> {
    let mut j = i + 1;
    while j < bytes.len() && (bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_') {
        j += 1;
    }
    if j >= bytes.len() || bytes[j] != b'$' {
        return None;
    }
    let tag_len = j - (i + 1);
    if tag_len > 0 && bytes[i + 1].is_ascii_digit() {
        return None;
    }
    Some((i + 1, tag_len, tag_len + 2))
}

fn closes_dollar(bytes: &[u8], i: usize, text: &str, tag_start: usize, tag_len: usize) -> bool {
    let end = i + 1 + tag_len;
    if end >= bytes.len() || bytes[end] != b'$' {
        return false;
    }
    bytes[i + 1..end] == text.as_bytes()[tag_start..tag_start + tag_len]
}

/// Top-level spans of a script, split on unquoted, uncommented semicolons.
/// A trailing statement without a semicolon is a valid span.
fn raw_spans(script: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    scan(script, |i, b, mode| {
        if mode == Mode::Normal && b == b';' {
            spans.push((start, i));
            start = i + 1;
        }
    });
    spans.push((start, script.len()));
    spans
}

/// Positions of the top-level semicolons of a script.
pub fn statement_boundaries(script: &str) -> Vec<usize> {
    let mut out = Vec::new();
    scan(script, |i, b, mode| {
        if mode == Mode::Normal && b == b';' {
            out.push(i);
        }
    });
    out
}

/// Scan for `$N` positional parameters outside string/comment context,
/// picking up a declared name from a directly following `/* name */`.
/// The result is deduplicated by ordinal and sorted.
pub fn scan_params(text: &str) -> Vec<ParamRef> {
    let bytes = text.as_bytes();
    let mut hits: Vec<usize> = Vec::new();
    scan(text, |i, b, mode| {
        if mode == Mode::Normal && b == b'$' {
            if let Some(d) = bytes.get(i + 1) {
                if d.is_ascii_digit() {
                    hits.push(i);
                }
            }
        }
    });

    let mut params: Vec<ParamRef> = Vec::new();
    for pos in hits {
        let mut j = pos + 1;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        let Ok(ordinal) = text[pos + 1..j].parse::<u32>() else {
            continue;
        };

        let name = declared_name(text, j);
        match params.iter_mut().find(|p| p.ordinal == ordinal) {
            Some(existing) => {
                if existing.name.is_none() {
                    existing.name = name;
                }
            }
            None => params.push(ParamRef { ordinal, name }),
        }
    }
    params.sort_by_key(|p| p.ordinal);
    params
}

fn declared_name(text: &str, after: usize) -> Option<String> {
    let bytes = text.as_bytes();
    let mut j = after;
    while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
        j += 1;
    }
    if !text[j..].starts_with("/*") {
        return None;
    }
    let close = text[j + 2..].find("*/")?;
    let name = text[j + 2..j + 2 + close].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(name.to_owned())
}

// ---------------------------------------------------------------------------
// active statement
// ---------------------------------------------------------------------------

/// The byte range of the statement under the cursor: the maximal span around
/// `cursor` that does not cross a top-level semicolon, with lines consisting
/// solely of whitespace or comments trimmed off both ends.
pub fn active_statement(script: &str, cursor: usize) -> Option<(usize, usize)> {
    let cursor = cursor.min(script.len());
    let boundaries = statement_boundaries(script);

    let start = boundaries
        .iter()
        .rev()
        .find(|&&b| b < cursor)
        .map(|&b| b + 1)
        .unwrap_or(0);
    let end = boundaries
        .iter()
        .find(|&&b| b >= cursor)
        .map(|&b| b)
        .unwrap_or(script.len());
    if start >= end {
        return None;
    }

    let span = &script[start..end];

    // Line pass: flag lines that carry no content once comments are ignored.
    // Block-comment state carries across lines, so a line that merely opens
    // or closes a block comment is still content-free.
    let mut lines: Vec<(usize, usize, bool)> = Vec::new();
    let mut line_start = 0usize;
    let mut line_has_content = false;
    scan(span, |i, b, mode| {
        if b == b'\n' {
            lines.push((line_start, i, line_has_content));
            line_start = i + 1;
            line_has_content = false;
            return;
        }
        let is_content = matches!(
            mode,
            Mode::Normal | Mode::SingleQuote | Mode::DoubleQuote | Mode::DollarQuote(..)
        ) && !(b as char).is_whitespace();
        if is_content {
            line_has_content = true;
        }
    });
    lines.push((line_start, span.len(), line_has_content));

    let first = lines.iter().position(|&(_, _, c)| c)?;
    let last = lines.iter().rposition(|&(_, _, c)| c)?;

    let slice_start = start + lines[first].0;
    let slice_end = start + lines[last].1;
    let slice = &script[slice_start..slice_end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let s = slice_start + (slice.len() - slice.trim_start().len());
    Some((s, s + trimmed.len() - 1))
}

// ---------------------------------------------------------------------------
// reference extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Lowercased bare word or quoted identifier (case preserved when quoted).
    Word(String),
    Punct(char),
    /// String literal or number; contents irrelevant here.
    Value,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut word_start: Option<(usize, bool)> = None; // (start, quoted)

    let mut flush = |out: &mut Vec<Token>, start: usize, end: usize, quoted: bool| {
        let mut raw = &text[start..end];
        if quoted {
            // the scan hands the closing quote byte to the next Normal visit,
            // so it may still be on the tail here
            raw = raw.strip_suffix('"').unwrap_or(raw);
            out.push(Token::Word(raw.replace("\"\"", "\"")));
            return;
        }
        if raw.is_empty() {
            return;
        }
        if raw.as_bytes()[0].is_ascii_digit() || raw.as_bytes()[0] == b'$' {
            out.push(Token::Value);
        } else {
            out.push(Token::Word(raw.to_ascii_lowercase()));
        }
    };

    scan(text, |i, b, mode| match mode {
        Mode::Normal => {
            if let Some((start, true)) = word_start {
                flush(&mut out, start, i, true);
                word_start = None;
            }
            let word_char = b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'.';
            match (word_start, word_char) {
                (None, true) => word_start = Some((i, false)),
                (Some((start, false)), false) => {
                    flush(&mut out, start, i, false);
                    word_start = None;
                }
                _ => {}
            }
            if !word_char && !(b as char).is_whitespace() {
                match b {
                    b'\'' => out.push(Token::Value),
                    b'"' => word_start = Some((i + 1, true)),
                    _ => out.push(Token::Punct(b as char)),
                }
            }
        }
        Mode::SingleQuote | Mode::DoubleQuote | Mode::DollarQuote(..) => {}
        Mode::LineComment | Mode::BlockComment(_) => {
            if let Some((start, false)) = word_start {
                flush(&mut out, start, i, false);
                word_start = None;
            }
        }
    });
    if let Some((start, quoted)) = word_start {
        flush(&mut out, start, text.len(), quoted);
    }
    out
}

const ALIAS_STOPWORDS: &[&str] = &[
    "where", "on", "join", "inner", "left", "right", "full", "cross", "natural", "group",
    "order", "limit", "offset", "having", "union", "intersect", "except", "set", "values",
    "returning", "using", "when", "then", "else", "end", "and", "or", "not", "as", "from",
    "select", "lateral", "window", "for", "fetch",
];

/// Pull CTE names and referenced tables out of a token stream. This is a
/// heuristic scan for the editor-side completion and for cache invalidation,
/// not a parser; subqueries are covered because the scan is linear over all
/// tokens.
fn extract_references(tokens: &[Token]) -> (Vec<String>, Vec<TableRef>) {
    let mut ctes: Vec<String> = Vec::new();
    let mut tables: Vec<TableRef> = Vec::new();

    // leading WITH clause: with [recursive] name [(cols)] as ( ... ) [, ...]
    let mut i = 0usize;
    if matches!(tokens.first(), Some(Token::Word(w)) if w == "with") {
        i = 1;
        if matches!(tokens.get(i), Some(Token::Word(w)) if w == "recursive") {
            i += 1;
        }
        loop {
            let Some(Token::Word(name)) = tokens.get(i) else {
                break;
            };
            ctes.push(name.clone());
            i += 1;
            // optional column list
            if matches!(tokens.get(i), Some(Token::Punct('('))) {
                i = skip_parens(tokens, i);
            }
            if !matches!(tokens.get(i), Some(Token::Word(w)) if w == "as") {
                break;
            }
            i += 1;
            // materialization hints
            while matches!(tokens.get(i), Some(Token::Word(w)) if w == "not" || w == "materialized")
            {
                i += 1;
            }
            if !matches!(tokens.get(i), Some(Token::Punct('('))) {
                break;
            }
            i = skip_parens(tokens, i);
            if matches!(tokens.get(i), Some(Token::Punct(','))) {
                i += 1;
                continue;
            }
            break;
        }
    }

    let mut j = 0usize;
    while j < tokens.len() {
        let introduces_table = matches!(
            &tokens[j],
            Token::Word(w) if w == "from" || w == "join" || w == "into" || w == "update"
        );
        if !introduces_table {
            j += 1;
            continue;
        }
        // "FOR UPDATE" / "FOR NO KEY UPDATE" are locking clauses, not verbs
        if let Token::Word(w) = &tokens[j] {
            if w == "update"
                && j > 0
                && matches!(&tokens[j - 1], Token::Word(p) if p == "for" || p == "key")
            {
                j += 1;
                continue;
            }
        }
        j += 1;
        if matches!(tokens.get(j), Some(Token::Word(w)) if w == "only" || w == "lateral") {
            j += 1;
        }
        let Some(Token::Word(name)) = tokens.get(j) else {
            j += 1;
            continue;
        };
        if ALIAS_STOPWORDS.contains(&name.as_str()) {
            continue;
        }
        let mut table = TableRef {
            name: name.clone(),
            alias: None,
        };
        j += 1;
        // function call in FROM, e.g. generate_series(1, 7)
        if matches!(tokens.get(j), Some(Token::Punct('('))) {
            j = skip_parens(tokens, j);
        }
        match tokens.get(j) {
            Some(Token::Word(w)) if w == "as" => {
                if let Some(Token::Word(alias)) = tokens.get(j + 1) {
                    table.alias = Some(alias.clone());
                    j += 2;
                }
            }
            Some(Token::Word(w)) if !ALIAS_STOPWORDS.contains(&w.as_str()) => {
                table.alias = Some(w.clone());
                j += 1;
            }
            _ => {}
        }
        if !tables.iter().any(|t| t.name == table.name && t.alias == table.alias) {
            tables.push(table);
        }
    }

    (ctes, tables)
}

fn skip_parens(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0usize;
    let mut k = open;
    while k < tokens.len() {
        match tokens[k] {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    return k + 1;
                }
            }
            _ => {}
        }
        k += 1;
    }
    k
}
