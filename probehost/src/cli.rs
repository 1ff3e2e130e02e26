//! # Cli
//!
//! Command line interface of the harness binary.

use std::{fs::OpenOptions, io::BufWriter, path::PathBuf, str::FromStr, thread, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{builder::PossibleValuesParser, Args, Parser, Subcommand};
use log::{warn, LevelFilter};
use nix::unistd::Uid;

use crate::{
    core::{
        attacher::HookSpec,
        collector::CollectResult,
        harness::{poll_timeout_from_env, Harness},
    },
    helpers::{signals::Running, time::monotonic_clock_offset},
};
use events::{file::FileRecordsWriter, DisplayFormat, HookKind, RecordDisplay, TimeFormat};

/// Interval at which the main loop checks for termination.
const RUN_WAIT_MS: u64 = 200;

/// Load and run kernel probe program artifacts.
///
/// probehost loads pre-compiled probe programs, binds their configuration
/// slots, attaches their handlers to kernel hook points and prints the trace
/// records the handlers emit.
#[derive(Parser, Debug)]
#[command(name = "probehost", version)]
pub(crate) struct ProbehostCli {
    #[command(flatten)]
    pub(crate) main_config: MainConfig,
    #[command(subcommand)]
    pub(crate) subcommand: SubCommands,
}

impl ProbehostCli {
    pub(crate) fn run(&self) -> Result<()> {
        match &self.subcommand {
            SubCommands::Run(run) => run.run(),
        }
    }
}

#[derive(Args, Debug, Default)]
pub(crate) struct MainConfig {
    #[arg(
        long,
        value_parser=PossibleValuesParser::new(["error", "warn", "info", "debug", "trace"]),
        default_value = "info",
        help = "Log level",
    )]
    pub(crate) log_level: String,
}

impl MainConfig {
    pub(crate) fn level_filter(&self) -> Result<LevelFilter> {
        Ok(LevelFilter::from_str(&self.log_level)?)
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum SubCommands {
    Run(Run),
}

/// Run a probe program artifact.
///
/// Loads the artifact, binds its configuration slots, attaches its handlers
/// and prints one line per trace record until interrupted (or until
/// --duration expires).
#[derive(Parser, Debug, Default)]
#[command(name = "run")]
pub(crate) struct Run {
    #[arg(help = "Path to the compiled probe program artifact")]
    pub(crate) artifact: PathBuf,
    #[arg(
        id = "set",
        long = "set",
        value_parser = parse_slot_value,
        help = "Set a configuration slot, SLOT=VALUE. VALUE is decimal or 0x-prefixed
hexadecimal. Slots can only be set before the handlers are attached, which is
what this does. Can be used multiple times.

Example: --set GLOBAL_u8=0x2A --set GLOBAL_u32=0xDEADBEEF"
    )]
    pub(crate) sets: Vec<(String, u64)>,
    #[arg(
        id = "hook",
        long = "hook",
        value_parser = parse_hook_spec,
        help = "Attach a handler, NAME=entry|return:SYMBOL. The hook kind must match the
handler declaration in the artifact. Can be used multiple times.

If this is not set, every handler of the artifact is attached to its declared
target.

Example: --hook my_kprobe=entry:do_one_initcall"
    )]
    pub(crate) hooks: Vec<HookSpec>,
    #[arg(short, long, help = "Also write the records to a file, as json lines")]
    pub(crate) out: Option<PathBuf>,
    #[arg(long, help = "Print the record time as UTC")]
    pub(crate) utc: bool,
    #[arg(long, help = "Stop the collection after SECONDS")]
    pub(crate) duration: Option<u64>,
}

impl Run {
    pub(crate) fn run(&self) -> Result<()> {
        if !Uid::effective().is_root() {
            bail!("Loading probe programs requires root");
        }

        let format = DisplayFormat::new()
            .time_format(match self.utc {
                true => TimeFormat::UtcDate,
                false => TimeFormat::Hidden,
            })
            .monotonic_offset(monotonic_clock_offset()?);

        let mut writer = match &self.out {
            Some(out) => Some(FileRecordsWriter::new(BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(out)
                    .with_context(|| format!("Could not create or open '{}'", out.display()))?,
            ))),
            None => None,
        };

        let harness = Harness::new().poll_timeout(poll_timeout_from_env()?);
        let run = Running::new()?;

        let handle = harness.run(
            &self.artifact,
            &self.sets,
            &self.hooks,
            move |result| match result {
                CollectResult::Record(record) => {
                    println!("{}", record.display(&format));
                    if let Some(writer) = writer.as_mut() {
                        if let Err(e) = writer.write(&record) {
                            warn!("Could not write record: {e}");
                        }
                    }
                }
                CollectResult::Dropped(count) => warn!("{count} record(s) dropped"),
                CollectResult::Closed => {
                    if let Some(writer) = writer.as_mut() {
                        let _ = writer.flush();
                    }
                }
                CollectResult::Timeout => (),
            },
        )?;

        if let Some(secs) = self.duration {
            let timer = run.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_secs(secs));
                timer.terminate();
            });
        }

        while run.running() {
            thread::sleep(Duration::from_millis(RUN_WAIT_MS));
        }

        handle.stop()
    }
}

/// Parses a SLOT=VALUE cli argument.
fn parse_slot_value(arg: &str) -> Result<(String, u64), String> {
    let (slot, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("'{arg}' does not follow the SLOT=VALUE format"))?;
    if slot.is_empty() {
        return Err(format!("Empty slot name in '{arg}'"));
    }

    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };

    match parsed {
        Ok(value) => Ok((slot.to_string(), value)),
        Err(e) => Err(format!("Invalid value in '{arg}': {e}")),
    }
}

/// Parses a NAME=entry|return:SYMBOL cli argument.
fn parse_hook_spec(arg: &str) -> Result<HookSpec, String> {
    let (handler, spec) = arg
        .split_once('=')
        .ok_or_else(|| format!("'{arg}' does not follow the NAME=entry|return:SYMBOL format"))?;
    let (kind, symbol) = spec
        .split_once(':')
        .ok_or_else(|| format!("'{arg}' does not follow the NAME=entry|return:SYMBOL format"))?;

    if handler.is_empty() || symbol.is_empty() {
        return Err(format!("Empty handler or symbol in '{arg}'"));
    }
    let kind = kind.parse::<HookKind>().map_err(|e| e.to_string())?;

    Ok(HookSpec::new(handler, kind, symbol))
}
