/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! `emd-record`: runs a program under the execution event recorder and
//! lists the dumps it produces.

use std::fs::File;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use emd_host::Launch;
use emd_host::PausedChild;
use emd_host::Session;
use emd_host::SessionConfig;
use emd_host::Server;
use emd_proto::env::*;
use emd_proto::layout::BufferConfig;
use emd_proto::layout::DEFAULT_BUFFER_SIZE;
use emd_proto::layout::DEFAULT_MAX_PARAM_SIZE;
use emd_proto::layout::DEFAULT_MAX_STACK_SIZE;
use emd_proto::DEFAULT_CONTROL_DIR;
use emd_proto::POINTER_SIZE;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(version, about)]
struct Cli {
    /// Log filter for the supervisor, such as `debug` or `emd_host=trace`.
    /// Defaults to the RUST_LOG environment variable.
    #[clap(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs a program and records its execution events.
    Run(RunArgs),
    /// Prints one line per record of a dump file.
    Summary(SummaryArgs),
}

#[derive(Debug, Clone, clap::Args)]
struct RunArgs {
    /// Directory receiving `<pid>.dump`, `<pid>.maps.<n>` and `<pid>.meta`.
    #[clap(long, value_name = "DIR", env = "EMD_DUMP_DIR", default_value = ".")]
    dump_dir: PathBuf,

    /// Directory for the control socket.
    #[clap(long, value_name = "DIR", env = ENV_CONTROL_DIR, default_value = DEFAULT_CONTROL_DIR)]
    control_dir: PathBuf,

    /// Comma separated syscall names to record. All syscalls by default.
    #[clap(long, value_name = "NAMES", value_delimiter = ',')]
    syscalls: Vec<String>,

    /// Record every syscall except the ones given to `--syscalls`.
    #[clap(long, requires = "syscalls")]
    exclude: bool,

    /// Most bytes of stack captured per syscall.
    #[clap(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_STACK_SIZE)]
    max_stack_size: u32,

    /// Most bytes captured per pointer argument.
    #[clap(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_PARAM_SIZE)]
    max_param_size: u32,

    /// Size of the shared event buffer.
    #[clap(long, value_name = "BYTES", default_value_t = DEFAULT_BUFFER_SIZE)]
    buffer_size: usize,

    /// Patch syscalls in every loaded object, not only the C library.
    #[clap(long)]
    patch_all: bool,

    /// Record `clock_gettime` and `gettimeofday`, which the vDSO serves
    /// without a syscall.
    #[clap(long)]
    hook_vdso: bool,

    /// Comma separated D-Bus message types (1 to 4) to record.
    #[clap(long, value_name = "TYPES")]
    dbus_filter: Option<String>,

    /// Comma separated X11 event types (0 to 19) to record.
    #[clap(long, value_name = "TYPES")]
    x11_filter: Option<String>,

    /// Only instrument a process whose `argv[0]` is this program.
    #[clap(long, value_name = "NAME")]
    cmdline_filter: Option<String>,

    /// The recorder's preload object. Defaults to `libemd_preload.so` next
    /// to this executable.
    #[clap(long, value_name = "PATH", env = "EMD_PRELOAD")]
    preload: Option<PathBuf>,

    /// Program to record.
    #[clap(value_name = "PROGRAM")]
    program: String,

    /// Arguments to the program.
    #[clap(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    program_args: Vec<String>,
}

#[derive(Debug, Clone, clap::Args)]
struct SummaryArgs {
    /// The dump file. Its `.meta` file is used when present.
    #[clap(value_name = "DUMP")]
    dump: PathBuf,
}

impl RunArgs {
    fn launch(&self) -> Result<Launch> {
        let preload = match &self.preload {
            Some(path) => path.clone(),
            None => find_preload()?.context("could not find libemd_preload.so, use --preload")?,
        };

        let mut launch = Launch::new(self.program.clone())
            .env(ENV_BUFFER_SIZE, self.buffer_size.to_string())
            .env(ENV_CONTROL_DIR, self.control_dir.display().to_string());
        launch.args = self.program_args.clone();
        launch.preload = Some(preload);
        if self.patch_all {
            launch = launch.env(ENV_PATCH_ALL, "1");
        }
        if self.hook_vdso {
            launch = launch.env(ENV_HOOK_VDSO, "1");
        }
        if let Some(filter) = &self.dbus_filter {
            launch = launch.env(ENV_DBUS_FILTER, filter.clone());
        }
        if let Some(filter) = &self.x11_filter {
            launch = launch.env(ENV_X11_FILTER, filter.clone());
        }
        if let Some(filter) = &self.cmdline_filter {
            launch = launch.env(ENV_CMDLINE_FILTER, filter.clone());
        }
        Ok(launch)
    }

    fn session_config(&self) -> Result<SessionConfig> {
        let numbers = emd_host::select(&self.syscalls, self.exclude).map_err(anyhow::Error::msg)?;
        Ok(SessionConfig {
            dump_dir: self.dump_dir.clone(),
            buffer: BufferConfig {
                numbers,
                max_stack_size: self.max_stack_size,
                max_param_size: self.max_param_size,
                ..emd_host::native_buffer_config()
            },
        })
    }
}

/// Looks for the preload object next to the current executable.
fn find_preload() -> Result<Option<PathBuf>, io::Error> {
    let mut path = std::env::current_exe()?;
    path.set_file_name("libemd_preload.so");
    Ok(path.is_file().then_some(path))
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn supervise(paused: PausedChild, control_dir: &Path, config: SessionConfig) -> Result<i32> {
    let pid = paused.pid().as_raw();
    let session = Arc::new(Session::new(pid, config));

    // Dropping `paused` on error makes the child exit without running the
    // program.
    let server = Server::bind(control_dir, pid)?;
    tracing::info!(pid, socket = %server.sock_path().display(), "recording");

    let serving = {
        let session = session.clone();
        tokio::spawn(async move { server.serve(session).await })
    };

    let child = paused.release()?;
    let code = child.wait().await;

    serving.abort();
    let _ = serving.await;

    let meta = tokio::task::spawn_blocking(move || session.finish()).await??;
    tracing::info!(
        pid,
        flushes = meta.stats.flushes,
        bytes = meta.stats.bytes,
        "dump complete"
    );
    code
}

fn run(args: RunArgs) -> Result<i32> {
    std::fs::create_dir_all(&args.dump_dir)
        .with_context(|| format!("failed to create {}", args.dump_dir.display()))?;
    let launch = args.launch()?;
    let config = args.session_config()?;

    // Fork before any runtime threads exist.
    let paused = launch.spawn_paused()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(supervise(paused, &args.control_dir, config))
}

fn summary(args: SummaryArgs) -> Result<()> {
    let file = File::open(&args.dump)
        .with_context(|| format!("failed to open {}", args.dump.display()))?;
    let dump = unsafe { memmap2::Mmap::map(&file) }?;

    let meta_path = args.dump.with_extension("meta");
    let pointer_width = if meta_path.is_file() {
        let meta = emd_host::read_meta(&meta_path)?;
        println!(
            "pid {} on {}, {} flushes, {} bytes, {} syscalls, {} early events",
            meta.pid,
            meta.arch,
            meta.stats.flushes,
            meta.stats.bytes,
            meta.stats.syscall_count,
            meta.stats.early_events
        );
        meta.pointer_width as usize
    } else {
        POINTER_SIZE
    };

    let stdout = io::stdout();
    let totals = emd_host::summarize(&dump, pointer_width, &mut stdout.lock())?;
    if let Some(err) = totals.error {
        anyhow::bail!("{} is damaged: {}", args.dump.display(), err);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match cli.command {
        Command::Run(args) => {
            let code = run(args)?;
            std::process::exit(code)
        }
        Command::Summary(args) => summary(args),
    }
}
