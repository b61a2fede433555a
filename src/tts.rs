use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{error, info};
use uuid::Uuid;

/// Synthesizes the narration for `text` with piper and returns the path of
/// the WAV written into `work_dir`.
pub fn synthesize(model: &str, text: &str, work_dir: &Path) -> anyhow::Result<PathBuf> {
    let out_path = work_dir.join(format!("{}.wav", Uuid::new_v4()));
    info!("Synthesizing narration to {}", out_path.display());

    let mut child = Command::new("piper")
        .args(["--model", model, "--output_file"])
        .arg(&out_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .spawn()?;

    {
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Failed to open piper stdin"))?;
        stdin.write_all(text.as_bytes())?;
    }

    let status = child.wait()?;
    if !status.success() {
        error!("Piper TTS command failed for {}", out_path.display());
        anyhow::bail!("TTS engine returned non-zero for narration");
    }
    Ok(out_path)
}
