//! Build file parser.
//!
//! Parses the declarative build text into an ordered list of directives.
//! Supports line continuations (`\`), comments, case-insensitive keywords and
//! both shell and JSON (exec) forms for RUN/CMD/ENTRYPOINT/COPY.

use stagecraft_core::error::{BuildError, Result};

/// A single build instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// `FROM <image> [AS <alias>]`
    From {
        image: String,
        alias: Option<String>,
    },
    /// `RUN <command>` (shell form)
    Run { command: String },
    /// `COPY [--from=<source>] <src>... <dst>`
    Copy {
        src: Vec<String>,
        dst: String,
        from: Option<String>,
    },
    /// `WORKDIR <path>`
    Workdir { path: String },
    /// `ENV <key>=<value>` or `ENV <key> <value>`
    Env { key: String, value: String },
    /// `ENTRYPOINT ["exec", "form"]` or `ENTRYPOINT command`
    Entrypoint { exec: Vec<String> },
    /// `CMD ["exec", "form"]` or `CMD command`
    Cmd { exec: Vec<String> },
    /// `EXPOSE <port>[/<proto>]`
    Expose { port: String },
    /// `LABEL <key>=<value>`
    Label { key: String, value: String },
    /// `USER <user>[:<group>]`
    User { user: String },
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
}

impl Instruction {
    /// Upper-case directive keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Label { .. } => "LABEL",
            Instruction::User { .. } => "USER",
            Instruction::Arg { .. } => "ARG",
        }
    }
}

/// An instruction together with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    /// 1-based line number of the directive's first physical line
    pub line: usize,
    /// Normalized source text, used in diagnostics and image history
    pub text: String,
    pub instruction: Instruction,
}

/// Parsed build file: directives in declaration order.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    pub directives: Vec<Directive>,
}

impl Dockerfile {
    /// Parse build text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut directives = Vec::new();

        for (line, text) in join_continuation_lines(content) {
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if let Some(instruction) = parse_instruction(trimmed, line)? {
                directives.push(Directive {
                    line,
                    text: trimmed.to_string(),
                    instruction,
                });
            }
        }

        if directives.is_empty() {
            return Err(BuildError::Parse {
                line: 1,
                message: "build file is empty or contains no instructions".to_string(),
            });
        }

        // Only ARG may precede the first FROM
        if let Some(first) = directives
            .iter()
            .find(|d| !matches!(d.instruction, Instruction::Arg { .. }))
        {
            if !matches!(first.instruction, Instruction::From { .. }) {
                return Err(BuildError::Parse {
                    line: first.line,
                    message: format!(
                        "{} before the first FROM (only ARG may precede FROM)",
                        first.instruction.keyword()
                    ),
                });
            }
        } else {
            return Err(BuildError::Parse {
                line: 1,
                message: "no FROM instruction".to_string(),
            });
        }

        Ok(Dockerfile { directives })
    }

    /// Parse a build file from disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::ConfigError(format!(
                "Failed to read build file at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

/// Expand `$NAME` and `${NAME}` using `lookup`. Unknown names expand to the
/// empty string; `\$` yields a literal dollar sign.
pub fn expand_vars(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed {
                    out.push_str(&lookup(&name).unwrap_or_default());
                } else {
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            '$' if chars
                .peek()
                .is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') =>
            {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookup(&name).unwrap_or_default());
            }
            _ => out.push(c),
        }
    }

    out
}

/// Join lines ending with `\` into logical lines, keeping the 1-based number
/// of each logical line's first physical line.
fn join_continuation_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical_lines = Vec::new();
    let mut current = String::new();
    let mut start = 1;

    for (idx, line) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        // Comment lines inside a continuation are dropped
        if !current.is_empty() && line.trim_start().starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped.trim_end());
            current.push(' ');
        } else {
            current.push_str(line);
            logical_lines.push((start, std::mem::take(&mut current)));
        }
    }

    // Handle trailing continuation without final line
    if !current.is_empty() {
        logical_lines.push((start, current));
    }

    logical_lines
}

/// Parse a single logical line. Returns `None` for directives that are
/// recognized but not supported.
fn parse_instruction(line: &str, line_num: usize) -> Result<Option<Instruction>> {
    let (keyword, rest) = split_first_word(line);
    let keyword_upper = keyword.to_uppercase();

    let instruction = match keyword_upper.as_str() {
        "FROM" => parse_from(rest, line_num)?,
        "RUN" => parse_run(rest, line_num)?,
        "COPY" => parse_copy(rest, line_num)?,
        "WORKDIR" => parse_workdir(rest, line_num)?,
        "ENV" => parse_env(rest, line_num)?,
        "ENTRYPOINT" => Instruction::Entrypoint {
            exec: parse_exec_form("ENTRYPOINT", rest, line_num)?,
        },
        "CMD" => Instruction::Cmd {
            exec: parse_exec_form("CMD", rest, line_num)?,
        },
        "EXPOSE" => parse_expose(rest, line_num)?,
        "LABEL" => parse_label(rest, line_num)?,
        "USER" => parse_user(rest, line_num)?,
        "ARG" => parse_arg(rest, line_num)?,
        "ADD" | "VOLUME" | "SHELL" | "STOPSIGNAL" | "HEALTHCHECK" | "ONBUILD" | "MAINTAINER" => {
            tracing::warn!(
                line = line_num,
                instruction = keyword_upper.as_str(),
                "Unsupported instruction, skipping"
            );
            return Ok(None);
        }
        _ => {
            return Err(BuildError::Parse {
                line: line_num,
                message: format!("unknown instruction '{}'", keyword),
            })
        }
    };

    Ok(Some(instruction))
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

fn missing(line: usize, message: &str) -> BuildError {
    BuildError::Parse {
        line,
        message: message.to_string(),
    }
}

// --- Individual instruction parsers ---

fn parse_from(rest: &str, line_num: usize) -> Result<Instruction> {
    let mut parts: Vec<&str> = rest.split_whitespace().collect();

    // Platform selection belongs to the image transport
    if parts.first().is_some_and(|p| p.starts_with("--platform=")) {
        tracing::debug!(line = line_num, flag = parts[0], "Ignoring FROM flag");
        parts.remove(0);
    }

    match parts.as_slice() {
        [] => Err(missing(line_num, "FROM requires an image argument")),
        [image] => Ok(Instruction::From {
            image: image.to_string(),
            alias: None,
        }),
        [image, as_kw, alias] if as_kw.eq_ignore_ascii_case("AS") => Ok(Instruction::From {
            image: image.to_string(),
            alias: Some(alias.to_string()),
        }),
        // An empty name is rejected with the stage's label by the graph builder
        [image, as_kw] if as_kw.eq_ignore_ascii_case("AS") => Ok(Instruction::From {
            image: image.to_string(),
            alias: Some(String::new()),
        }),
        _ => Err(missing(line_num, "FROM expects '<image> [AS <name>]'")),
    }
}

fn parse_run(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "RUN requires a command"));
    }

    // JSON array form is joined into a shell command
    let command = if rest.starts_with('[') {
        parse_json_array(rest, line_num)?.join(" ")
    } else {
        rest.to_string()
    };

    Ok(Instruction::Run { command })
}

fn parse_copy(rest: &str, line_num: usize) -> Result<Instruction> {
    let mut remaining = rest;
    let mut from = None;

    // Leading --flags
    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        if let Some(source) = flag.strip_prefix("--from=") {
            if source.is_empty() {
                return Err(missing(line_num, "COPY --from requires a value"));
            }
            from = Some(source.to_string());
        } else if flag.starts_with("--chown=") || flag.starts_with("--chmod=") || flag == "--link" {
            tracing::debug!(line = line_num, flag, "Ignoring COPY flag");
        } else {
            return Err(BuildError::Parse {
                line: line_num,
                message: format!("unknown COPY flag '{}'", flag),
            });
        }
        remaining = after;
    }

    let parts: Vec<String> = if remaining.starts_with('[') {
        parse_json_array(remaining, line_num)?
    } else {
        remaining.split_whitespace().map(str::to_string).collect()
    };

    match parts.split_last() {
        Some((dst, src)) if !src.is_empty() => Ok(Instruction::Copy {
            src: src.to_vec(),
            dst: dst.clone(),
            from,
        }),
        _ => Err(missing(
            line_num,
            "COPY requires at least one source and a destination",
        )),
    }
}

fn parse_workdir(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "WORKDIR requires a path"));
    }
    Ok(Instruction::Workdir {
        path: rest.to_string(),
    })
}

fn parse_env(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "ENV requires a key and value"));
    }

    // ENV KEY=VALUE, unless the first '=' comes after whitespace
    if let Some(eq_pos) = rest.find('=') {
        let space_pos = rest.find(char::is_whitespace);
        if space_pos.map_or(true, |sp| eq_pos < sp) {
            return Ok(Instruction::Env {
                key: rest[..eq_pos].to_string(),
                value: unquote(&rest[eq_pos + 1..]),
            });
        }
    }

    // Legacy form: ENV KEY VALUE
    let (key, value) = split_first_word(rest);
    if value.is_empty() {
        return Err(missing(line_num, "ENV requires a value"));
    }
    Ok(Instruction::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_exec_form(keyword: &str, rest: &str, line_num: usize) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(BuildError::Parse {
            line: line_num,
            message: format!("{} requires an argument", keyword),
        });
    }

    if rest.starts_with('[') {
        parse_json_array(rest, line_num)
    } else {
        // Shell form: wrap in sh -c
        Ok(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            rest.to_string(),
        ])
    }
}

fn parse_expose(rest: &str, line_num: usize) -> Result<Instruction> {
    match rest.split_whitespace().next() {
        Some(port) => Ok(Instruction::Expose {
            port: port.to_string(),
        }),
        None => Err(missing(line_num, "EXPOSE requires a port")),
    }
}

fn parse_label(rest: &str, line_num: usize) -> Result<Instruction> {
    if rest.is_empty() {
        return Err(missing(line_num, "LABEL requires key=value"));
    }

    if let Some((key, value)) = rest.split_once('=') {
        Ok(Instruction::Label {
            key: unquote(key),
            value: unquote(value),
        })
    } else {
        // LABEL key value (legacy)
        let (key, value) = split_first_word(rest);
        Ok(Instruction::Label {
            key: key.to_string(),
            value: unquote(value),
        })
    }
}

fn parse_user(rest: &str, line_num: usize) -> Result<Instruction> {
    match rest.split_whitespace().next() {
        Some(user) => Ok(Instruction::User {
            user: user.to_string(),
        }),
        None => Err(missing(line_num, "USER requires a username")),
    }
}

fn parse_arg(rest: &str, line_num: usize) -> Result<Instruction> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(missing(line_num, "ARG requires a name"));
    }

    let (name, default) = match rest.split_once('=') {
        Some((name, default)) => (name.trim(), Some(unquote(default))),
        None => (rest, None),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BuildError::Parse {
            line: line_num,
            message: format!("invalid ARG name '{}'", name),
        });
    }

    Ok(Instruction::Arg {
        name: name.to_string(),
        default,
    })
}

// --- Helpers ---

/// Parse a JSON array string like `["a", "b", "c"]`.
fn parse_json_array(s: &str, line_num: usize) -> Result<Vec<String>> {
    serde_json::from_str(s).map_err(|e| BuildError::Parse {
        line: line_num,
        message: format!("invalid JSON array '{}': {}", s, e),
    })
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
