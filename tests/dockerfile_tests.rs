//! Tests for the Dockerfile parser.
//!
//! Validates instruction classification, argument extraction, and the
//! restricted-dialect rules (leading FROM, continuations, ENV forms,
//! CMD forms).

use pocketlinx::dockerfile::{Dockerfile, InstructionKind};

// =============================================================================
// Structure
// =============================================================================

#[test]
fn test_full_dockerfile() {
    let text = r#"
# build the app image
FROM alpine
ENV APP_ENV=production
WORKDIR /srv/app
COPY ./src /srv/app
RUN apk add --no-cache python3
EXPOSE 8000 8443
USER app
LABEL maintainer="ops"
CMD ["python3", "server.py"]
"#;
    let df = Dockerfile::parse(text).unwrap();
    assert_eq!(df.base, "alpine");
    assert_eq!(df.instructions.len(), 8);

    let kinds: Vec<&InstructionKind> = df.instructions.iter().map(|i| &i.kind).collect();
    assert_eq!(
        kinds,
        vec![
            &InstructionKind::Env,
            &InstructionKind::Workdir,
            &InstructionKind::Copy,
            &InstructionKind::Run,
            &InstructionKind::Expose,
            &InstructionKind::User,
            &InstructionKind::Label,
            &InstructionKind::Cmd,
        ]
    );
}

#[test]
fn test_raw_preserved_for_run() {
    let df = Dockerfile::parse("FROM alpine\nRUN echo 'a b'   &&   true\n").unwrap();
    assert_eq!(df.instructions[0].raw, "echo 'a b'   &&   true");
}

#[test]
fn test_instruction_case_insensitive() {
    let df = Dockerfile::parse("from alpine\nrun echo hi\nWorkDir /app\n").unwrap();
    assert_eq!(df.base, "alpine");
    assert_eq!(df.instructions[0].kind, InstructionKind::Run);
    assert_eq!(df.instructions[1].kind, InstructionKind::Workdir);
}

// =============================================================================
// Continuations
// =============================================================================

#[test]
fn test_multi_line_run() {
    let text = "FROM alpine\nRUN apk update && \\\n    apk add curl && \\\n    rm -rf /var/cache\n";
    let df = Dockerfile::parse(text).unwrap();
    assert_eq!(df.instructions.len(), 1);
    assert!(df.instructions[0].raw.contains("apk add curl"));
    assert!(df.instructions[0].raw.contains("rm -rf /var/cache"));
}

// =============================================================================
// Arguments
// =============================================================================

#[test]
fn test_env_equals_with_spaces_in_value() {
    let df = Dockerfile::parse("FROM alpine\nENV GREETING=hello world\n").unwrap();
    assert_eq!(df.instructions[0].args, vec!["GREETING", "hello world"]);
}

#[test]
fn test_copy_multi_word_source() {
    // Last token is the destination, everything before it the source.
    let df = Dockerfile::parse("FROM alpine\nCOPY a b /dest\n").unwrap();
    assert_eq!(df.instructions[0].args, vec!["a b", "/dest"]);
}

#[test]
fn test_add_parsed_like_copy() {
    let df = Dockerfile::parse("FROM alpine\nADD ./data /opt/data\n").unwrap();
    assert_eq!(df.instructions[0].kind, InstructionKind::Add);
    assert_eq!(df.instructions[0].args, vec!["./data", "/opt/data"]);
}

#[test]
fn test_cmd_json_form_with_spaces() {
    let df =
        Dockerfile::parse("FROM alpine\nCMD [\"sh\", \"-c\", \"echo hello world\"]\n").unwrap();
    assert_eq!(df.instructions[0].args, vec!["sh", "-c", "echo hello world"]);
}

#[test]
fn test_no_cmd_yields_no_default_command() {
    let df = Dockerfile::parse("FROM alpine\nRUN true\n").unwrap();
    assert!(df.default_command().is_none());
}

// =============================================================================
// Rejections
// =============================================================================

#[test]
fn test_env_without_value_rejected() {
    assert!(Dockerfile::parse("FROM alpine\nENV LONELY\n").is_err());
}

#[test]
fn test_copy_without_dest_rejected() {
    assert!(Dockerfile::parse("FROM alpine\nCOPY onlyone\n").is_err());
}

#[test]
fn test_leading_comment_then_from_ok() {
    let df = Dockerfile::parse("# comment first\nFROM alpine\n").unwrap();
    assert_eq!(df.base, "alpine");
}

#[test]
fn test_run_before_from_rejected() {
    let err = Dockerfile::parse("RUN echo hi\nFROM alpine\n").unwrap_err();
    assert!(err.to_string().contains("FROM"));
}
