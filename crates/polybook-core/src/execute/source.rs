//! Source preparation for transient languages.
//!
//! Every compiled or scripted language gets an `nb_input(prompt)` helper
//! that announces an input request through the marker protocol and then
//! reads one line from stdin. Java additionally needs a public class to
//! name the file after, which is synthesized when the block has none.

use std::sync::LazyLock;

use regex::Regex;

use crate::language::Language;
use crate::markers::{INPUT_END, INPUT_START};

static JAVA_PUBLIC_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*public\s+(?:(?:final|abstract|strictfp)\s+)*class\s+(\w+)")
        .expect("valid java public class regex")
});

static JAVA_CLASS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:(?:final|abstract|strictfp)\s+)*class\s+(\w+)")
        .expect("valid java class regex")
});

static JAVA_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^import\s+.*;").expect("valid java import regex"));

const JAVA_DEFAULT_CLASS: &str = "Main";

/// A source file ready to be written to a scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSource {
    /// File name inside the scratch directory.
    pub file_name: String,
    /// Full file contents, helper included.
    pub contents: String,
    /// Java class to launch; `None` for other languages.
    pub entry_class: Option<String>,
}

/// Prepare a block of `language` source for the transient runner.
pub fn prepare(language: Language, source: &str) -> PreparedSource {
    match language {
        Language::C => plain("main.c", c_helper(), source),
        Language::Cpp => plain("main.cpp", cpp_helper(), source),
        Language::JavaScript => plain("main.js", js_helper(), source),
        Language::Java => prepare_java(source),
        // Python never goes through a scratch file, but keep it runnable.
        Language::Python => PreparedSource {
            file_name: "main.py".to_string(),
            contents: source.to_string(),
            entry_class: None,
        },
    }
}

fn plain(file_name: &str, helper: String, source: &str) -> PreparedSource {
    PreparedSource {
        file_name: file_name.to_string(),
        contents: format!("{helper}\n{source}"),
        entry_class: None,
    }
}

fn prepare_java(source: &str) -> PreparedSource {
    let entry = JAVA_PUBLIC_CLASS
        .captures(source)
        .or_else(|| JAVA_CLASS.captures(source))
        .and_then(|caps| Some((caps[1].to_string(), caps.get(0)?.end())));
    let (class, mut code, body_end) = match entry {
        Some((class, declared_at)) => {
            let body_end = closing_brace(source, declared_at);
            (class, source.to_string(), body_end)
        }
        None => (JAVA_DEFAULT_CLASS.to_string(), wrap_java_statements(source), None),
    };

    // The helper goes inside the entry class body.
    if let Some(brace) = body_end.or_else(|| code.rfind('}')) {
        code.insert_str(brace, &java_helper());
    }

    PreparedSource {
        file_name: format!("{class}.java"),
        contents: code,
        entry_class: Some(class),
    }
}

/// Offset of the brace closing the first block opened at or after `from`.
///
/// Braces inside comments and string or char literals are ignored.
fn closing_brace(code: &str, from: usize) -> Option<usize> {
    let bytes = code.as_bytes();
    let mut i = from + code.get(from..)?.find('{')?;
    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = code[i..].find('\n').map_or(bytes.len(), |n| i + n);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = code[i + 2..].find("*/").map_or(bytes.len(), |n| i + n + 4);
                continue;
            }
            quote @ (b'"' | b'\'') => {
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Wrap bare statements in a `Main` class, hoisting imports above it.
fn wrap_java_statements(source: &str) -> String {
    let imports: Vec<&str> = JAVA_IMPORT.find_iter(source).map(|m| m.as_str()).collect();
    let body = JAVA_IMPORT.replace_all(source, "");
    format!(
        "{}\npublic class {JAVA_DEFAULT_CLASS} {{\n    public static void main(String[] args) {{\n{}\n    }}\n}}",
        imports.join("\n"),
        body
    )
}

fn c_helper() -> String {
    format!(
        r#"#include <stdio.h>
#include <stdlib.h>
#include <string.h>

static char *nb_input(const char *prompt) {{
    static char buffer[4096];
    printf("{INPUT_START}%s{INPUT_END}", prompt);
    fflush(stdout);
    if (fgets(buffer, sizeof(buffer), stdin) == NULL) {{
        buffer[0] = '\0';
        return buffer;
    }}
    size_t len = strlen(buffer);
    if (len > 0 && buffer[len - 1] == '\n') buffer[--len] = '\0';
    if (len > 0 && buffer[len - 1] == '\r') buffer[--len] = '\0';
    return buffer;
}}
"#
    )
}

fn cpp_helper() -> String {
    format!(
        r#"#include <iostream>
#include <string>

static std::string nb_input(const std::string &prompt) {{
    std::cout << "{INPUT_START}" << prompt << "{INPUT_END}" << std::flush;
    std::string line;
    std::getline(std::cin, line);
    if (!line.empty() && line.back() == '\r') line.pop_back();
    return line;
}}
"#
    )
}

fn java_helper() -> String {
    format!(
        r#"
    private static final java.io.BufferedReader NB_STDIN =
        new java.io.BufferedReader(new java.io.InputStreamReader(System.in));

    public static String nb_input(String prompt) {{
        System.out.print("{INPUT_START}" + prompt + "{INPUT_END}");
        System.out.flush();
        try {{
            String line = NB_STDIN.readLine();
            return line == null ? "" : line;
        }} catch (java.io.IOException e) {{
            return "";
        }}
    }}
"#
    )
}

fn js_helper() -> String {
    format!(
        r#"function nb_input(prompt) {{
    const fs = require("fs");
    fs.writeSync(1, "{INPUT_START}" + String(prompt ?? "") + "{INPUT_END}");
    const bytes = [];
    const one = Buffer.alloc(1);
    for (;;) {{
        let n;
        try {{
            n = fs.readSync(0, one, 0, 1, null);
        }} catch (e) {{
            if (e.code === "EAGAIN") continue;
            if (e.code === "EOF") break;
            throw e;
        }}
        if (n === 0 || one[0] === 10) break;
        bytes.push(one[0]);
    }}
    return Buffer.from(bytes).toString("utf8").replace(/\r$/, "");
}}
"#
    )
}
