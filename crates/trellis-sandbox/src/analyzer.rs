//! Static inspection of code units before anything is spawned.
//!
//! The scan is lexical: comments are skipped, f-string replacement fields
//! are scanned like code, and every string body is checked for dunder names
//! and frame attributes (`d['__import__']`, `'{0.gi_frame}'.format(g)`).
//! Identifiers outside strings must be ASCII so that NFKC folding cannot
//! smuggle a denied name past the check.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationCategory {
    ModuleAccess,
    DynamicCode,
    ProcessSpawn,
    FileAccess,
    RawSyscall,
    Introspection,
}

impl ViolationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ModuleAccess => "module access",
            Self::DynamicCode => "dynamic code loading",
            Self::ProcessSpawn => "process spawn",
            Self::FileAccess => "file access",
            Self::RawSyscall => "raw syscall access",
            Self::Introspection => "interpreter introspection",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub category: ViolationCategory,
    pub construct: String,
    pub line: usize,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: {} via '{}' is not allowed",
            self.line,
            self.category.as_str(),
            self.construct
        )
    }
}

const DENIED_NAMES: &[(&str, ViolationCategory)] = &[
    ("import", ViolationCategory::ModuleAccess),
    ("importlib", ViolationCategory::ModuleAccess),
    ("builtins", ViolationCategory::ModuleAccess),
    ("sys", ViolationCategory::ModuleAccess),
    ("exec", ViolationCategory::DynamicCode),
    ("eval", ViolationCategory::DynamicCode),
    ("compile", ViolationCategory::DynamicCode),
    ("os", ViolationCategory::ProcessSpawn),
    ("subprocess", ViolationCategory::ProcessSpawn),
    ("multiprocessing", ViolationCategory::ProcessSpawn),
    ("pty", ViolationCategory::ProcessSpawn),
    ("open", ViolationCategory::FileAccess),
    ("pathlib", ViolationCategory::FileAccess),
    ("shutil", ViolationCategory::FileAccess),
    ("io", ViolationCategory::FileAccess),
    ("ctypes", ViolationCategory::RawSyscall),
    ("socket", ViolationCategory::RawSyscall),
    ("signal", ViolationCategory::RawSyscall),
    ("mmap", ViolationCategory::RawSyscall),
    ("globals", ViolationCategory::Introspection),
    ("locals", ViolationCategory::Introspection),
    ("vars", ViolationCategory::Introspection),
    ("getattr", ViolationCategory::Introspection),
    ("setattr", ViolationCategory::Introspection),
    ("delattr", ViolationCategory::Introspection),
    ("breakpoint", ViolationCategory::Introspection),
    ("memoryview", ViolationCategory::Introspection),
];

/// Attributes of frames, generators, coroutines, tracebacks and code objects
const FRAME_ATTRIBUTE_PREFIXES: &[&str] = &["gi_", "cr_", "ag_", "f_", "tb_", "co_"];

const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "rb", "br", "fr", "rf"];

/// Scan `code` and return the first denied construct, if any.
pub fn analyze(code: &str) -> Result<(), Violation> {
    scan(code, 1)
}

fn scan(code: &str, first_line: usize) -> Result<(), Violation> {
    let chars: Vec<char> = code.chars().collect();
    let mut line = first_line;
    let mut i = 0;
    // previous significant character was `.`, so the next name is an attribute
    let mut after_dot = false;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            i += 1;
        } else if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '\'' || c == '"' {
            i = skip_string(&chars, i, false, &mut line)?;
            after_dot = false;
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let next_is_quote = matches!(chars.get(i), Some('\'') | Some('"'));
            if next_is_quote && STRING_PREFIXES.contains(&word.to_ascii_lowercase().as_str()) {
                let formatted = word.to_ascii_lowercase().contains('f');
                i = skip_string(&chars, i, formatted, &mut line)?;
            } else {
                check_identifier(&word, after_dot, line)?;
            }
            after_dot = false;
        } else if !c.is_ascii() && !c.is_whitespace() {
            return Err(Violation {
                category: ViolationCategory::Introspection,
                construct: c.to_string(),
                line,
            });
        } else {
            if !c.is_whitespace() && c != '\\' {
                after_dot = c == '.';
            }
            i += 1;
        }
    }
    Ok(())
}

fn is_dunder(word: &str) -> bool {
    word.len() > 4 && word.starts_with("__") && word.ends_with("__")
}

fn is_frame_attribute(word: &str) -> bool {
    FRAME_ATTRIBUTE_PREFIXES
        .iter()
        .any(|prefix| word.starts_with(prefix))
}

fn introspection(word: &str, line: usize) -> Violation {
    Violation {
        category: ViolationCategory::Introspection,
        construct: word.to_string(),
        line,
    }
}

fn check_identifier(word: &str, attribute: bool, line: usize) -> Result<(), Violation> {
    if is_dunder(word) || (attribute && is_frame_attribute(word)) {
        return Err(introspection(word, line));
    }
    match DENIED_NAMES.iter().find(|(name, _)| *name == word) {
        Some((_, category)) => Err(Violation {
            category: *category,
            construct: word.to_string(),
            line,
        }),
        None => Ok(()),
    }
}

/// Skip the literal opening at `start`; returns the index after it.
fn skip_string(
    chars: &[char],
    start: usize,
    formatted: bool,
    line: &mut usize,
) -> Result<usize, Violation> {
    let quote = chars[start];
    let triple = chars.get(start + 1) == Some(&quote) && chars.get(start + 2) == Some(&quote);
    let delimiter = if triple { 3 } else { 1 };
    let body_start = start + delimiter;
    let body_line = *line;
    let mut i = body_start;

    let body_end = loop {
        let Some(&c) = chars.get(i) else {
            break chars.len();
        };
        if c == '\\' {
            if chars.get(i + 1) == Some(&'\n') {
                *line += 1;
            }
            i += 2;
            continue;
        }
        if c == '\n' {
            *line += 1;
            if !triple {
                break i;
            }
        }
        if c == quote
            && (!triple
                || (chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote)))
        {
            break i;
        }
        i += 1;
    };

    let body = &chars[body_start.min(body_end)..body_end];
    check_string_body(body, body_line)?;
    if formatted {
        scan_replacement_fields(body, body_line)?;
    }
    Ok((body_end + delimiter).min(chars.len()))
}

/// Names inside a literal can still reach objects through subscripts and
/// `str.format` field paths.
fn check_string_body(body: &[char], first_line: usize) -> Result<(), Violation> {
    let mut line = first_line;
    let mut i = 0;
    while i < body.len() {
        let c = body[i];
        if c == '\n' {
            line += 1;
            i += 1;
        } else if c.is_alphabetic() || c == '_' {
            let attribute = i > 0 && body[i - 1] == '.';
            let start = i;
            while i < body.len() && (body[i].is_alphanumeric() || body[i] == '_') {
                i += 1;
            }
            let word: String = body[start..i].iter().collect();
            if is_dunder(&word) || (attribute && is_frame_attribute(&word)) {
                return Err(introspection(&word, line));
            }
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn scan_replacement_fields(body: &[char], first_line: usize) -> Result<(), Violation> {
    let mut line = first_line;
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            '\n' => line += 1,
            '{' if body.get(i + 1) == Some(&'{') => i += 1,
            '{' => {
                let start = i + 1;
                let mut depth = 1;
                i += 1;
                while i < body.len() && depth > 0 {
                    match body[i] {
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                let end = if depth == 0 { i - 1 } else { i };
                let expression: String = body[start..end].iter().collect();
                scan(&expression, line)?;
                line += expression.matches('\n').count();
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(code: &str) -> Option<ViolationCategory> {
        analyze(code).err().map(|v| v.category)
    }

    #[test]
    fn test_plain_arithmetic_passes() {
        let code = "total = 0\nfor x in input['values']:\n    total += x\nresult = {'total': total}\n";
        assert!(analyze(code).is_ok());
    }

    #[test]
    fn test_denied_constructs_are_classified() {
        assert_eq!(category("import os"), Some(ViolationCategory::ModuleAccess));
        assert_eq!(
            category("from subprocess import run"),
            Some(ViolationCategory::ProcessSpawn)
        );
        assert_eq!(category("eval('1+1')"), Some(ViolationCategory::DynamicCode));
        assert_eq!(category("f = open('/etc/passwd')"), Some(ViolationCategory::FileAccess));
        assert_eq!(
            category("().__class__.__bases__[0].__subclasses__()"),
            Some(ViolationCategory::Introspection)
        );
        assert_eq!(category("x = getattr(y, 'z')"), Some(ViolationCategory::Introspection));
    }

    #[test]
    fn test_strings_and_comments_are_ignored() {
        assert!(analyze("# import os\nresult = 'please open the door'").is_ok());
        assert!(analyze("result = \"\"\"eval\nexec\"\"\"").is_ok());
        assert!(analyze("result = r'\\d+ import'").is_ok());
    }

    #[test]
    fn test_fstring_expressions_are_scanned() {
        assert!(analyze("result = f'{1 + 2} open'").is_ok());
        assert!(analyze("result = f'{{literal}} {input}'").is_ok());
        let violation = analyze("x = 1\nresult = f'{__import__(\"os\")}'").expect_err("dunder");
        assert_eq!(violation.line, 2);
        assert_eq!(violation.construct, "__import__");
    }

    #[test]
    fn test_frame_walk_from_generator_is_denied() {
        let code = "def g():\n    yield gen.gi_frame.f_back.f_back\n\
                    gen = g()\n\
                    fr = list(gen)[0]\n\
                    fr.f_builtins['__import__']('subprocess').run(['touch', '/tmp/x'])\n\
                    result = 'escaped'\n";
        let violation = analyze(code).expect_err("frame walk");
        assert_eq!(violation.category, ViolationCategory::Introspection);
        assert_eq!(violation.construct, "gi_frame");
        assert_eq!(violation.line, 2);
    }

    #[test]
    fn test_frame_attributes_denied_only_as_attributes() {
        for code in [
            "x = err.tb_frame",
            "x = coro.cr_frame",
            "x = agen.ag_frame",
            "x = fn.f_globals",
            "x = fn.co_consts",
            "x = (gen\n    .gi_code)",
            "x = gen . gi_yieldfrom",
        ] {
            assert_eq!(
                category(code),
                Some(ViolationCategory::Introspection),
                "expected denial: {}",
                code
            );
        }
        assert!(analyze("f_total = 1\nco_owner = 'x'\nresult = f_total + 1.5").is_ok());
    }

    #[test]
    fn test_names_inside_strings_are_checked() {
        let violation = analyze("b = {}\nx = b['__import__']").expect_err("dunder key");
        assert_eq!(violation.construct, "__import__");
        assert_eq!(violation.line, 2);
        assert_eq!(
            category("x = '{0.gi_frame}'.format(g)"),
            Some(ViolationCategory::Introspection)
        );
        assert!(analyze("result = 'co_pilot f_stop. gi joe'").is_ok());
    }

    #[test]
    fn test_non_ascii_identifiers_rejected() {
        assert!(analyze("ｅｘｅｃ('1')").is_err());
        assert!(analyze("result = 'héllo'").is_ok());
    }

    #[test]
    fn test_violation_reports_line() {
        let violation = analyze("a = 1\nb = 2\nimport sys").expect_err("import");
        assert_eq!(violation.line, 3);
        assert!(violation.to_string().contains("line 3"));
    }
}
