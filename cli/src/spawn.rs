use std::{
    ffi::{CStr, OsStr},
    os::unix::ffi::OsStrExt,
    process::{Child, Command},
};

use anyhow::Context;
use tracing::{debug, warn};

/// Runs a shell command for each received message
///
/// The message is passed to the command in the `msg` environment variable.
pub struct Spawner {
    command: String,
    children: Vec<Child>,
}

impl Spawner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            children: Vec::new(),
        }
    }

    pub fn spawn(&mut self, message: &CStr) -> anyhow::Result<()> {
        self.reap();
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("msg", OsStr::from_bytes(message.to_bytes()))
            .spawn()
            .with_context(|| format!("spawning {:?}", self.command))?;
        debug!(pid = child.id(), "spawned command");
        self.children.push(child);
        Ok(())
    }

    /// Forgets children that already exited
    fn reap(&mut self) {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "command exited");
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = child.id(), %err, "cannot query command");
                false
            }
        });
    }

    /// Waits for every command still running
    pub fn finish(mut self) -> anyhow::Result<()> {
        for mut child in self.children.drain(..) {
            let status = child.wait().context("waiting for command")?;
            debug!(pid = child.id(), %status, "command exited");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{ffi::CString, fs};

    use super::Spawner;

    #[test]
    fn message_in_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let mut spawner = Spawner::new(format!("printf '%s\\n' \"$msg\" >> '{}'", out.display()));

        spawner.spawn(&CString::new("hello world").unwrap()).unwrap();
        spawner.finish().unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap(), "hello world\n");
    }

    #[test]
    fn finished_children_are_reaped() {
        let mut spawner = Spawner::new("true");
        for _ in 0..3 {
            spawner.spawn(c"x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(spawner.children.len() < 3);
        spawner.finish().unwrap();
    }
}
