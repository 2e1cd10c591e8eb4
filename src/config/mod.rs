//! INI-dialect configuration trees.
//!
//! `[section]` headers (with `/` separating nested section names),
//! `key=value` pairs, `"..."` strings with C escapes, comma-separated
//! arrays, `;` or `#` comments, and backslash-newline continuations. A
//! repeated `[name]` header promotes the section to a *multisection*:
//! an ordered array of sections indexed `0`, `1`, ... Parsing stops at
//! the first malformed token; nothing partial is returned.

use std::error::Error;
use std::fmt;

use indexmap::IndexMap;

/// Parse failure, pointing at the offending line (1-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "configuration syntax error at line {}", self.line)
    }
}

impl Error for ParseError {}

/// One tree node: a scalar value, a section of named children, or both
/// never at once. Array nodes (value lists and multisections) use the
/// decimal indices `"0"`, `"1"`, ... as child names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub value: Option<String>,
    pub children: IndexMap<String, Node>,
}

impl Node {
    pub fn leaf(value: impl Into<String>) -> Node {
        Node {
            value: Some(value.into()),
            children: IndexMap::new(),
        }
    }

    /// All child names are decimal indices.
    pub fn is_array(&self) -> bool {
        !self.children.is_empty()
            && self
                .children
                .keys()
                .all(|key| key.bytes().all(|b| b.is_ascii_digit()))
    }

    fn is_section(&self) -> bool {
        !self.children.is_empty() && !self.is_array()
    }

    // an array whose elements are themselves sections
    fn is_multisection(&self) -> bool {
        self.is_array() && self.children.values().any(|child| !child.children.is_empty())
    }

    /// Walk a `/`-separated path; empty segments are ignored.
    pub fn find(&self, path: &str) -> Option<&Node> {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    /// Walk a `/`-separated path, creating missing nodes.
    pub fn make(&mut self, path: &str) -> &mut Node {
        let mut node = self;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node
    }
}

/// A parsed configuration: the anonymous root section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub root: Node,
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Scalar lookup by path.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.root.find(path)?.value.as_deref()
    }

    /// Scalar assignment by path, creating intermediate sections.
    pub fn set(&mut self, path: &str, value: impl Into<String>) {
        self.root.make(path).value = Some(value.into());
    }

    pub fn parse(text: &str) -> Result<Config, ParseError> {
        Parser::new(text).run()
    }

    /// Render back into the same dialect `parse` accepts. Parsing the
    /// output yields a structurally equal tree.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        emit_children(&mut out, None, &self.root);
        out
    }
}

fn emit_section(out: &mut String, path: &str, node: &Node) {
    out.push('[');
    out.push_str(path);
    out.push_str("]\n");
    emit_children(out, Some(path), node);
}

fn emit_children(out: &mut String, path: Option<&str>, node: &Node) {
    for (key, child) in &node.children {
        if child.value.is_some() || (child.is_array() && !child.is_multisection()) {
            emit_pair(out, key, child);
        }
    }

    for (key, child) in &node.children {
        let sub_path = match path {
            Some(path) => format!("{}/{}", path, key),
            None => key.clone(),
        };

        if child.is_multisection() {
            for element in child.children.values() {
                emit_section(out, &sub_path, element);
            }
        } else if child.is_section() {
            emit_section(out, &sub_path, child);
        } else if child.value.is_none() && child.children.is_empty() {
            // a section that happens to hold no keys
            emit_section(out, &sub_path, child);
        }
    }
}

fn emit_pair(out: &mut String, key: &str, node: &Node) {
    out.push_str(key);
    out.push('=');

    if node.children.is_empty() {
        emit_value(out, node.value.as_deref().unwrap_or(""));
    } else {
        let mut first = true;
        for element in node.children.values() {
            if !first {
                out.push(',');
            }
            emit_value(out, element.value.as_deref().unwrap_or(""));
            first = false;
        }
    }
    out.push('\n');
}

fn emit_value(out: &mut String, value: &str) {
    let needs_quotes = value.is_empty()
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace)
        || value
            .chars()
            .any(|c| matches!(c, ',' | ';' | '#' | '"' | '=' | '[' | ']' | '\\' | '\n'));

    if !needs_quotes {
        out.push_str(value);
        return;
    }

    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
}

struct Parser {
    lines: Vec<(usize, String)>,
}

impl Parser {
    /// Join continuation lines up front; every later stage is line-based.
    fn new(text: &str) -> Parser {
        let mut lines = Vec::new();
        let mut pending = String::new();
        let mut pending_start = 1;

        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            if pending.is_empty() {
                pending_start = line_no;
            }

            if let Some(stripped) = raw.strip_suffix('\\') {
                pending.push_str(stripped);
                continue;
            }

            pending.push_str(raw);
            lines.push((pending_start, std::mem::take(&mut pending)));
        }

        if !pending.is_empty() {
            lines.push((pending_start, pending));
        }

        Parser { lines }
    }

    fn run(self) -> Result<Config, ParseError> {
        let mut config = Config::new();
        let mut section_path = String::new();

        for (line_no, line) in &self.lines {
            let line = line.trim();
            let err = || ParseError { line: *line_no };

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let close = rest.find(']').ok_or_else(err)?;
                let name = rest[..close].trim();
                let trailer = rest[close + 1..].trim();

                if name.is_empty()
                    || !(trailer.is_empty()
                        || trailer.starts_with(';')
                        || trailer.starts_with('#'))
                    || name.contains(['[', '"', '=', ','])
                {
                    return Err(err());
                }

                section_path = Self::open_section(&mut config.root, name);
                continue;
            }

            // key=value
            let equals = line.find('=').ok_or_else(err)?;
            let key = line[..equals].trim();
            if key.is_empty() || key.contains(['[', ']', '"', ',', ';', '#']) {
                return Err(err());
            }

            let items = Self::parse_value(line[equals + 1..].trim(), err)?;

            let section = config.root.make(&section_path);
            let target = section.make(key);
            target.children.clear();
            match items.len() {
                0 => target.value = Some(String::new()),
                1 => target.value = Some(items.into_iter().next().unwrap()),
                _ => {
                    target.value = None;
                    for (index, item) in items.into_iter().enumerate() {
                        target
                            .children
                            .insert(index.to_string(), Node::leaf(item));
                    }
                }
            }
        }

        Ok(config)
    }

    /// Open (or re-open as a multisection) the named section; returns
    /// the path keys later inserted under.
    fn open_section(root: &mut Node, name: &str) -> String {
        let exists = root.find(name).map(|node| {
            (
                node.is_array(),
                !node.children.is_empty() || node.value.is_some(),
            )
        });

        match exists {
            None | Some((false, false)) => {
                root.make(name);
                name.to_string()
            }
            Some((true, _)) => {
                let node = root.make(name);
                let index = node.children.len().to_string();
                node.children.insert(index.clone(), Node::default());
                format!("{}/{}", name, index)
            }
            Some((false, true)) => {
                // second [name]: promote the existing section to element 0
                let node = root.make(name);
                let previous = std::mem::take(node);
                node.children.insert("0".to_string(), previous);
                node.children.insert("1".to_string(), Node::default());
                format!("{}/1", name)
            }
        }
    }

    fn parse_value(
        raw: &str,
        err: impl Fn() -> ParseError + Copy,
    ) -> Result<Vec<String>, ParseError> {
        fn skip_ws(chars: &mut std::iter::Peekable<std::str::Chars>) {
            while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
                chars.next();
            }
        }

        let mut items = Vec::new();
        let mut chars = raw.chars().peekable();

        loop {
            skip_ws(&mut chars);

            let item = match chars.peek() {
                // quoted strings keep their spacing verbatim
                Some('"') => {
                    chars.next();
                    let mut item = String::new();
                    Self::parse_quoted(&mut chars, &mut item, err)?;
                    item
                }
                Some(';') | Some('#') | None => String::new(),
                Some(_) => {
                    let mut item = String::new();
                    while let Some(&c) = chars.peek() {
                        match c {
                            ',' | ';' | '#' => break,
                            '"' | '[' | ']' | '=' => return Err(err()),
                            _ => {
                                item.push(c);
                                chars.next();
                            }
                        }
                    }
                    item.trim_end().to_string()
                }
            };

            // an item ends at a separator, a comment, or the line's end
            skip_ws(&mut chars);
            match chars.peek() {
                Some(',') => {
                    chars.next();
                    items.push(item);
                }
                Some(';') | Some('#') | None => {
                    items.push(item);
                    return Ok(items);
                }
                _ => return Err(err()),
            }
        }
    }

    fn parse_quoted(
        chars: &mut std::iter::Peekable<std::str::Chars>,
        out: &mut String,
        err: impl Fn() -> ParseError,
    ) -> Result<(), ParseError> {
        loop {
            match chars.next() {
                None => return Err(err()), // unterminated string
                Some('"') => return Ok(()),
                Some('\\') => {
                    let escaped = chars.next().ok_or_else(&err)?;
                    match escaped {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        '\'' => out.push('\''),
                        _ => return Err(err()),
                    }
                }
                Some(c) => out.push(c),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sections_keys_and_arrays() {
        let config = Config::parse(
            "; daemon configuration\n\
             loglevel=warn\n\
             [server]\n\
             listen=/run/relay.sock\n\
             backlog=64\n\
             groups=wheel,daemon,nobody\n\
             [server/tls]\n\
             enabled=false\n",
        )
        .unwrap();

        assert_eq!(config.get("loglevel"), Some("warn"));
        assert_eq!(config.get("server/listen"), Some("/run/relay.sock"));
        assert_eq!(config.get("server/groups/1"), Some("daemon"));
        assert_eq!(config.get("server/tls/enabled"), Some("false"));
        assert!(config.root.find("server/groups").unwrap().is_array());
    }

    #[test]
    fn quoted_strings_with_escapes() {
        let config = Config::parse("motd=\"hello\\n\\\"world\\\"\"\n").unwrap();
        assert_eq!(config.get("motd"), Some("hello\n\"world\""));
    }

    #[test]
    fn line_continuation_joins() {
        let config = Config::parse("path=/usr/bin:\\\n/usr/local/bin\n").unwrap();
        assert_eq!(config.get("path"), Some("/usr/bin:/usr/local/bin"));
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let config = Config::parse(
            "# leading comment\n\
             \n\
             key=value ; trailing comment\n",
        )
        .unwrap();
        assert_eq!(config.get("key"), Some("value"));
    }

    #[test]
    fn repeated_section_becomes_multisection() {
        let config = Config::parse(
            "[unit]\n\
             name=first\n\
             [unit]\n\
             name=second\n\
             [unit]\n\
             name=third\n",
        )
        .unwrap();

        assert_eq!(config.get("unit/0/name"), Some("first"));
        assert_eq!(config.get("unit/1/name"), Some("second"));
        assert_eq!(config.get("unit/2/name"), Some("third"));
        assert!(config.root.find("unit").unwrap().is_array());
    }

    #[test]
    fn malformed_input_is_rejected_outright() {
        for bad in [
            "[unclosed\nkey=value\n",
            "=value\n",
            "key=\"unterminated\n",
            "key=\"closed\" trailing\n",
            "key=val]ue\n",
            "[]\n",
        ] {
            assert!(Config::parse(bad).is_err(), "accepted: {:?}", bad);
        }
    }

    #[test]
    fn error_reports_the_line() {
        let err = Config::parse("ok=1\n[bad\n").unwrap_err();
        assert_eq!(err.line, 2);
    }

    #[test]
    fn serialize_round_trips_structurally() {
        let original = Config::parse(
            "title=\"a, quoted; title\"\n\
             [server]\n\
             listen=/run/relay.sock\n\
             groups=wheel,daemon\n\
             [server/tls]\n\
             enabled=true\n\
             [unit]\n\
             name=first\n\
             [unit]\n\
             name=second\n\
             [placeholder]\n",
        )
        .unwrap();

        let reparsed = Config::parse(&original.serialize()).unwrap();
        assert_eq!(original, reparsed);
    }

    #[test]
    fn set_and_get_paths() {
        let mut config = Config::new();
        config.set("daemon/workers", "4");
        assert_eq!(config.get("daemon/workers"), Some("4"));
        assert_eq!(config.get("daemon/missing"), None);
    }
}
