/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Starts the target program with the recorder preloaded.
//!
//! The recorder looks for its control socket under the process id, which
//! is unknown until the child exists. The child is therefore forked first
//! and held before `exec` until the supervisor has bound the socket.

use std::ffi::CString;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitStatus;
use nix::unistd::ForkResult;
use nix::unistd::Pid;

/// Program, arguments and environment of the target.
#[derive(Debug, Clone, Default)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// The preload object, prepended to any inherited `LD_PRELOAD`.
    pub preload: Option<PathBuf>,
}

impl Launch {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// The complete environment of the child.
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        self.environment_from(std::env::vars_os())
    }

    fn environment_from<I>(&self, inherited: I) -> Vec<(OsString, OsString)>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut vars: Vec<(OsString, OsString)> = inherited
            .into_iter()
            .filter(|(key, _)| !self.env.iter().any(|(k, _)| key.as_bytes() == k.as_bytes()))
            .collect();

        if let Some(preload) = &self.preload {
            let mut value = preload.clone().into_os_string();
            if let Some(index) = vars.iter().position(|(key, _)| key == "LD_PRELOAD") {
                let (_, inherited) = vars.remove(index);
                if !inherited.is_empty() {
                    value.push(":");
                    value.push(inherited);
                }
            }
            vars.push(("LD_PRELOAD".into(), value));
        }

        vars.extend(
            self.env
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        vars
    }

    /// Forks the child and leaves it waiting before `exec`.
    ///
    /// Must be called while the process is single threaded, before any
    /// async runtime is started.
    pub fn spawn_paused(&self) -> Result<PausedChild> {
        let program = CString::new(self.program.as_bytes())?;
        let argv = std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = self
            .environment()
            .into_iter()
            .map(|(k, v)| {
                let mut pair = k.into_vec();
                pair.push(b'=');
                pair.extend(v.into_vec());
                CString::new(pair)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (read_end, write_end) = nix::unistd::pipe()?;

        match unsafe { nix::unistd::fork() }.context("fork failed")? {
            ForkResult::Child => {
                drop(write_end);
                let mut gate = File::from(read_end);
                let mut byte = [0u8; 1];
                if matches!(gate.read(&mut byte), Ok(1)) {
                    drop(gate);
                    let _ = nix::unistd::execvpe(&program, &argv, &envp);
                }
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                drop(read_end);
                tracing::debug!(pid = child.as_raw(), program = %self.program, "forked");
                Ok(PausedChild {
                    pid: child,
                    gate: File::from(write_end),
                })
            }
        }
    }
}

/// A forked child that has not yet executed the target.
#[derive(Debug)]
pub struct PausedChild {
    pid: Pid,
    gate: File,
}

impl PausedChild {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Lets the child `exec` the target.
    pub fn release(mut self) -> Result<Child> {
        self.gate.write_all(&[1])?;
        Ok(Child { pid: self.pid })
    }
}

/// A running target.
#[derive(Debug, Clone, Copy)]
pub struct Child {
    pid: Pid,
}

impl Child {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Waits for the target to terminate and returns a shell style exit
    /// code: the exit status, or 128 plus the signal number.
    pub async fn wait(self) -> Result<i32> {
        let pid = self.pid;
        let status = tokio::task::spawn_blocking(move || waitpid(pid, None)).await??;
        Ok(exit_code(status))
    }
}

fn exit_code(status: WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => code,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
        _ => 1,
    }
}
