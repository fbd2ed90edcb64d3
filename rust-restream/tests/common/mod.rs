#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

/// Write an executable shell script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}

/// A fake encoder that answers `-version` and otherwise runs `body`.
pub fn fake_encoder(dir: &Path, body: &str) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        &format!(
            "if [ \"$1\" = \"-version\" ]; then echo 'ffmpeg version 6.1-test'; exit 0; fi\n{}",
            body
        ),
    )
}

/// Receive until `done` matches an item, returning everything received.
pub async fn recv_until<T, F>(rx: &mut UnboundedReceiver<T>, timeout: Duration, mut done: F) -> Vec<T>
where
    F: FnMut(&T) -> bool,
{
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => {
                let finished = done(&item);
                seen.push(item);
                if finished {
                    return seen;
                }
            }
            Ok(None) => panic!("channel closed before condition was met"),
            Err(_) => panic!("timed out after {:?}", timeout),
        }
    }
}

/// Whether a process with `pid` exists.
pub fn process_exists(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
