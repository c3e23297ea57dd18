//! Subprocess invocation helpers for the external codec and AEAD
//! collaborators. Both are treated as opaque executables per `spec.md` §9:
//! pass paths, capture stderr, enforce a timeout, never assume partial
//! output is usable on failure.
//!
//! Grounded on the `tokio::process::Command` + `tokio::time::timeout`
//! combination shown in `other_examples/…hazardous-sun-ouroboros-fs…server.rs`
//! (the pack's only example of subprocess-with-timeout in an async context).

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::pipeline::PipelineError;

/// Default bound on any single codec/AEAD invocation, per `spec.md` §5's
/// recommendation of "≤ 10s".
pub const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(10);

/// Invokes `<core_cmd> encode -i <input> -o <output>`.
pub async fn encode(core_cmd: &str, input: &Path, output: &Path) -> Result<(), PipelineError> {
    run(core_cmd, &["encode", "-i", &path_str(input), "-o", &path_str(output)])
        .await
        .map_err(PipelineError::CodecFailed)
}

/// Invokes `<core_cmd> decode -i <input> -o <output>`.
pub async fn decode(core_cmd: &str, input: &Path, output: &Path) -> Result<(), PipelineError> {
    run(core_cmd, &["decode", "-i", &path_str(input), "-o", &path_str(output)])
        .await
        .map_err(PipelineError::CodecFailed)
}

/// Invokes `<aead_cmd> encrypt -i <input> -o <output> --pass <passphrase>`.
pub async fn aead_encrypt(
    aead_cmd: &str,
    input: &Path,
    output: &Path,
    passphrase: &str,
) -> Result<(), PipelineError> {
    run(
        aead_cmd,
        &["encrypt", "-i", &path_str(input), "-o", &path_str(output), "--pass", passphrase],
    )
    .await
    .map_err(PipelineError::AeadFailed)
}

/// Invokes `<aead_cmd> decrypt -i <input> -o <output> --pass <passphrase>`.
pub async fn aead_decrypt(
    aead_cmd: &str,
    input: &Path,
    output: &Path,
    passphrase: &str,
) -> Result<(), PipelineError> {
    run(
        aead_cmd,
        &["decrypt", "-i", &path_str(input), "-o", &path_str(output), "--pass", passphrase],
    )
    .await
    .map_err(PipelineError::AeadFailed)
}

/// Resolves the AEAD passphrase from `AEAD_PASS` or `AEAD_PASS_FILE`,
/// preferring the inline value when both are set.
pub fn resolve_passphrase(config: &crate::config::RuntimeConfig) -> Option<String> {
    if let Some(pass) = &config.aead_pass {
        return Some(pass.clone());
    }
    config
        .aead_pass_file
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

async fn run(cmd: &str, args: &[&str]) -> Result<(), String> {
    let invocation = Command::new(cmd).args(args).output();
    let output = tokio::time::timeout(SUBPROCESS_TIMEOUT, invocation)
        .await
        .map_err(|_| format!("{cmd} timed out after {SUBPROCESS_TIMEOUT:?}"))?
        .map_err(|err| format!("{cmd} could not be spawned: {err}"))?;
    if !output.status.success() {
        return Err(format!(
            "{cmd} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }
    Ok(())
}
