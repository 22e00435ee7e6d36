//! # Dockerfile Parser
//!
//! Parses a restricted Dockerfile dialect into an ordered instruction
//! list. The parser is purely syntactic: it splits lines, resolves
//! continuations, and classifies instructions, but never evaluates
//! semantics (that is the build engine's job).
//!
//! Recognized instructions: `FROM`, `RUN`, `ENV`, `EXPOSE`, `CMD`,
//! `WORKDIR`, `COPY`, `USER`, `LABEL`, `ADD`. Anything else is kept as
//! an opaque instruction with its raw argument string, so a build can
//! still hash it deterministically.

use crate::error::{Error, Result};

// =============================================================================
// Instruction
// =============================================================================

/// Instruction classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionKind {
    From,
    Run,
    Env,
    Expose,
    Cmd,
    Workdir,
    Copy,
    User,
    Label,
    Add,
    /// Unrecognized instruction, kept verbatim.
    Other(String),
}

impl InstructionKind {
    fn parse(word: &str) -> Self {
        match word.to_ascii_uppercase().as_str() {
            "FROM" => Self::From,
            "RUN" => Self::Run,
            "ENV" => Self::Env,
            "EXPOSE" => Self::Expose,
            "CMD" => Self::Cmd,
            "WORKDIR" => Self::Workdir,
            "COPY" => Self::Copy,
            "USER" => Self::User,
            "LABEL" => Self::Label,
            "ADD" => Self::Add,
            other => Self::Other(other.to_string()),
        }
    }

    /// Canonical uppercase name, as fed into the step hash.
    pub fn as_str(&self) -> &str {
        match self {
            Self::From => "FROM",
            Self::Run => "RUN",
            Self::Env => "ENV",
            Self::Expose => "EXPOSE",
            Self::Cmd => "CMD",
            Self::Workdir => "WORKDIR",
            Self::Copy => "COPY",
            Self::User => "USER",
            Self::Label => "LABEL",
            Self::Add => "ADD",
            Self::Other(name) => name,
        }
    }

    /// True for steps that never warrant an intermediate checkpoint of
    /// their own (a pure `ENV` produces no filesystem layer worth a
    /// full rootfs snapshot). The final step is always checkpointed
    /// regardless.
    pub fn skips_checkpoint(&self) -> bool {
        matches!(
            self,
            Self::Env | Self::User | Self::Workdir | Self::Label | Self::Copy | Self::Add
        )
    }
}

impl std::fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed Dockerfile step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Classified instruction type.
    pub kind: InstructionKind,
    /// Type-specific positional arguments:
    /// - `ENV` → `[key, value]`
    /// - `COPY`/`ADD` → `[src, dest]`
    /// - `CMD` → argv form
    /// - `EXPOSE` → port numbers
    /// - others → `[raw]`
    pub args: Vec<String>,
    /// Original argument string, used verbatim for `RUN` and hashing.
    pub raw: String,
}

// =============================================================================
// Dockerfile
// =============================================================================

/// A parsed Dockerfile: base image plus ordered instructions.
///
/// `FROM` is not part of [`Dockerfile::instructions`]; it seeds the
/// hash chain and rootfs initialization instead.
#[derive(Debug, Clone)]
pub struct Dockerfile {
    /// Base image name from the leading `FROM`.
    pub base: String,
    /// Instructions after `FROM`, in file order.
    pub instructions: Vec<Instruction>,
}

impl Dockerfile {
    /// Parses Dockerfile text.
    ///
    /// Line-oriented with trailing-`\` continuation. Blank lines and
    /// `#` comments are skipped. The first effective line must be
    /// `FROM`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut base: Option<String> = None;
        let mut instructions = Vec::new();

        for line in logical_lines(text) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (word, rest) = match line.split_once(char::is_whitespace) {
                Some((w, r)) => (w, r.trim().to_string()),
                None => (line, String::new()),
            };
            let kind = InstructionKind::parse(word);

            if base.is_none() {
                match kind {
                    InstructionKind::From if !rest.is_empty() => {
                        base = Some(rest);
                        continue;
                    }
                    _ => {
                        return Err(Error::InvalidArgument(
                            "Dockerfile must start with FROM".to_string(),
                        ));
                    }
                }
            } else if kind == InstructionKind::From {
                return Err(Error::InvalidArgument(
                    "multi-stage builds are not supported (second FROM)".to_string(),
                ));
            }

            instructions.push(parse_instruction(kind, rest)?);
        }

        match base {
            Some(base) => Ok(Self { base, instructions }),
            None => Err(Error::InvalidArgument(
                "Dockerfile must start with FROM".to_string(),
            )),
        }
    }

    /// Reads and parses a Dockerfile from the host filesystem.
    pub fn parse_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidArgument(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Returns the last `CMD` in argv form, if any.
    pub fn default_command(&self) -> Option<Vec<String>> {
        self.instructions
            .iter()
            .rev()
            .find(|i| i.kind == InstructionKind::Cmd)
            .map(|i| i.args.clone())
    }
}

/// Joins physical lines ending in `\` into logical lines.
fn logical_lines(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pending = String::new();
    for line in text.lines() {
        let trimmed = line.trim_end();
        if let Some(head) = trimmed.strip_suffix('\\') {
            pending.push_str(head);
            pending.push(' ');
        } else {
            pending.push_str(trimmed);
            out.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        out.push(pending);
    }
    out
}

fn parse_instruction(kind: InstructionKind, raw: String) -> Result<Instruction> {
    let args = match &kind {
        InstructionKind::Env => parse_env_args(&raw)?,
        InstructionKind::Cmd => parse_cmd_args(&raw),
        InstructionKind::Copy | InstructionKind::Add => {
            let tokens: Vec<&str> = raw.split_whitespace().collect();
            if tokens.len() < 2 {
                return Err(Error::InvalidArgument(format!(
                    "{} requires <src> <dest>",
                    kind
                )));
            }
            // Last token is the destination; everything before it is the source.
            let dest = tokens[tokens.len() - 1].to_string();
            let src = tokens[..tokens.len() - 1].join(" ");
            vec![src, dest]
        }
        InstructionKind::Expose => raw
            .split_whitespace()
            .filter(|p| p.parse::<u16>().is_ok())
            .map(str::to_string)
            .collect(),
        _ => vec![raw.clone()],
    };

    Ok(Instruction { kind, args, raw })
}

/// `ENV K V` and `ENV K=V` both yield `[key, value]`.
fn parse_env_args(raw: &str) -> Result<Vec<String>> {
    if let Some((k, v)) = raw.split_once('=') {
        let k = k.trim();
        if k.is_empty() || k.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!("bad ENV syntax: {raw}")));
        }
        return Ok(vec![k.to_string(), v.trim().to_string()]);
    }
    match raw.split_once(char::is_whitespace) {
        Some((k, v)) => Ok(vec![k.to_string(), v.trim().to_string()]),
        None => Err(Error::InvalidArgument(format!(
            "ENV requires a key and a value: {raw}"
        ))),
    }
}

/// CMD accepts shell form (`CMD echo hi` → `sh -c "echo hi"`) or
/// JSON-array form (`CMD ["a", "b"]`).
fn parse_cmd_args(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        let inner = &trimmed[1..trimmed.len() - 1];
        return inner
            .split(',')
            .map(|p| p.trim().trim_matches('"').to_string())
            .filter(|p| !p.is_empty())
            .collect();
    }
    vec!["sh".to_string(), "-c".to_string(), trimmed.to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_dockerfile() {
        let df = Dockerfile::parse("FROM alpine\nRUN echo hi\n").unwrap();
        assert_eq!(df.base, "alpine");
        assert_eq!(df.instructions.len(), 1);
        assert_eq!(df.instructions[0].kind, InstructionKind::Run);
        assert_eq!(df.instructions[0].raw, "echo hi");
    }

    #[test]
    fn test_must_start_with_from() {
        assert!(Dockerfile::parse("RUN echo hi\n").is_err());
        assert!(Dockerfile::parse("").is_err());
        assert!(Dockerfile::parse("# just a comment\n").is_err());
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let df = Dockerfile::parse("# header\n\nFROM alpine\n\n# step\nRUN true\n").unwrap();
        assert_eq!(df.base, "alpine");
        assert_eq!(df.instructions.len(), 1);
    }

    #[test]
    fn test_line_continuation() {
        let df = Dockerfile::parse("FROM alpine\nRUN apk add \\\n    curl git\n").unwrap();
        assert_eq!(df.instructions[0].raw, "apk add      curl git");
    }

    #[test]
    fn test_env_both_forms() {
        let df = Dockerfile::parse("FROM alpine\nENV A=1\nENV B two words\n").unwrap();
        assert_eq!(df.instructions[0].args, vec!["A", "1"]);
        assert_eq!(df.instructions[1].args, vec!["B", "two words"]);
    }

    #[test]
    fn test_cmd_shell_form() {
        let df = Dockerfile::parse("FROM alpine\nCMD echo hello\n").unwrap();
        assert_eq!(df.instructions[0].args, vec!["sh", "-c", "echo hello"]);
    }

    #[test]
    fn test_cmd_json_form() {
        let df = Dockerfile::parse("FROM alpine\nCMD [\"nginx\", \"-g\", \"daemon off;\"]\n")
            .unwrap();
        assert_eq!(df.instructions[0].args, vec!["nginx", "-g", "daemon off;"]);
    }

    #[test]
    fn test_copy_last_token_is_dest() {
        let df = Dockerfile::parse("FROM alpine\nCOPY ./src /app\n").unwrap();
        assert_eq!(df.instructions[0].args, vec!["./src", "/app"]);
    }

    #[test]
    fn test_expose_multiple_ports() {
        let df = Dockerfile::parse("FROM alpine\nEXPOSE 80 443 bogus\n").unwrap();
        assert_eq!(df.instructions[0].args, vec!["80", "443"]);
    }

    #[test]
    fn test_unknown_instruction_kept_raw() {
        let df = Dockerfile::parse("FROM alpine\nHEALTHCHECK CMD curl localhost\n").unwrap();
        assert_eq!(
            df.instructions[0].kind,
            InstructionKind::Other("HEALTHCHECK".to_string())
        );
        assert_eq!(df.instructions[0].args, vec!["CMD curl localhost"]);
    }

    #[test]
    fn test_second_from_rejected() {
        assert!(Dockerfile::parse("FROM alpine\nFROM ubuntu\n").is_err());
    }

    #[test]
    fn test_default_command_takes_last_cmd() {
        let df = Dockerfile::parse("FROM alpine\nCMD echo one\nCMD echo two\n").unwrap();
        assert_eq!(
            df.default_command().unwrap(),
            vec!["sh", "-c", "echo two"]
        );
    }

    #[test]
    fn test_skips_checkpoint_classification() {
        assert!(InstructionKind::Env.skips_checkpoint());
        assert!(InstructionKind::Copy.skips_checkpoint());
        assert!(InstructionKind::Label.skips_checkpoint());
        assert!(!InstructionKind::Run.skips_checkpoint());
    }
}
