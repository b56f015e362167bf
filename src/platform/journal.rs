//! Streaming of a machine's system journal into the output directory.
//!
//! A journal is attached at most once per machine. Following it runs
//! `journalctl -f` over SSH and appends each line to `journal.txt` byte for
//! byte; after a reboot the same journal resumes following into the same
//! file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::SplitStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ssh::{SshClient, SshTarget};

const FOLLOW_COMMAND: &str = "journalctl -b -f --no-tail -o short-precise";

struct Follower {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct JournalState {
    path: Option<PathBuf>,
    follower: Option<Follower>,
}

/// Journal slot owned by a machine; inert until [`Journal::start`].
#[derive(Default)]
pub struct Journal {
    state: Mutex<JournalState>,
}

impl Journal {
    /// Starts following into `dir/journal.txt`.
    ///
    /// A second call on an already started journal only restarts the
    /// follower; the file is never truncated.
    pub async fn start(
        &self,
        client: &SshClient,
        target: &SshTarget,
        dir: &Path,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("journal.txt");

        let mut state = self.state.lock().await;
        if let Some(old) = state.follower.take() {
            old.stop().await;
        }
        state.follower = Some(Follower::spawn(client, target, &path).await?);
        state.path = Some(path);
        Ok(())
    }

    /// Re-attaches the follower after the remote session went away.
    pub async fn resume(&self, client: &SshClient, target: &SshTarget) -> std::io::Result<()> {
        let mut state = self.state.lock().await;
        let Some(path) = state.path.clone() else {
            return Ok(());
        };
        if let Some(old) = state.follower.take() {
            old.stop().await;
        }
        state.follower = Some(Follower::spawn(client, target, &path).await?);
        Ok(())
    }

    /// Stops following. The file stays on disk.
    pub async fn stop(&self) {
        let follower = self.state.lock().await.follower.take();
        if let Some(follower) = follower {
            follower.stop().await;
        }
    }

    pub async fn path(&self) -> Option<PathBuf> {
        self.state.lock().await.path.clone()
    }
}

impl Follower {
    async fn spawn(client: &SshClient, target: &SshTarget, path: &Path) -> std::io::Result<Self> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        let mut command = client.command(target, FOLLOW_COMMAND);
        command.stderr(Stdio::null());
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("journalctl stdout not captured"))?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let shown = path.display().to_string();

        let task = tokio::spawn(async move {
            // Raw segments: journal lines are not guaranteed to be UTF-8.
            let mut lines = SplitStream::new(BufReader::new(stdout).split(b'\n'));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.next() => match line {
                        Some(Ok(mut line)) => {
                            line.push(b'\n');
                            if let Err(e) = file.write_all(&line).await {
                                warn!("writing {} failed: {}", shown, e);
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!("journal stream for {} ended: {}", shown, e);
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = child.kill().await;
            let _ = file.flush().await;
        });

        Ok(Self { cancel, task })
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    /// A stand-in for `ssh` that ignores its arguments and runs `body`.
    fn script_ssh(dir: &Path, body: &str) -> SshClient {
        let script = dir.join("fake-ssh");
        std::fs::write(&script, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        SshClient::new("core").with_program(script.to_string_lossy())
    }

    fn fake_ssh(dir: &Path) -> SshClient {
        script_ssh(dir, "echo line-one\necho line-two\n")
    }

    async fn wait_for_lines(path: &Path, count: usize) -> String {
        for _ in 0..100 {
            let content = tokio::fs::read_to_string(path).await.unwrap_or_default();
            if content.lines().count() >= count {
                return content;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("journal never reached {count} lines");
    }

    #[tokio::test]
    async fn test_follow_appends_and_resume_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let client = fake_ssh(dir.path());
        let target = SshTarget::new("h", 22);
        let out = dir.path().join("m1");
        let journal = Journal::default();

        journal.start(&client, &target, &out).await.unwrap();
        let path = journal.path().await.unwrap();
        assert_eq!(path, out.join("journal.txt"));
        assert_eq!(wait_for_lines(&path, 2).await, "line-one\nline-two\n");
        journal.stop().await;

        // After a reboot the journal resumes into the same file.
        journal.resume(&client, &target).await.unwrap();
        let content = wait_for_lines(&path, 4).await;
        assert_eq!(content.lines().filter(|l| *l == "line-one").count(), 2);
        journal.stop().await;
    }

    #[tokio::test]
    async fn test_non_utf8_lines_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let client = script_ssh(dir.path(), "printf 'bad\\377byte\\nline-two\\n'\n");
        let out = dir.path().join("m1");
        let journal = Journal::default();

        journal
            .start(&client, &SshTarget::new("h", 22), &out)
            .await
            .unwrap();
        let path = out.join("journal.txt");
        let expected: &[u8] = b"bad\xffbyte\nline-two\n";
        let mut content = Vec::new();
        for _ in 0..100 {
            content = tokio::fs::read(&path).await.unwrap_or_default();
            if content.len() >= expected.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        journal.stop().await;
        assert_eq!(content, expected);
    }

    #[tokio::test]
    async fn test_unstarted_journal_is_inert() {
        let journal = Journal::default();
        let client = SshClient::new("core").with_program("true");
        journal
            .resume(&client, &SshTarget::new("h", 22))
            .await
            .unwrap();
        assert!(journal.path().await.is_none());
        journal.stop().await;
    }
}
