//! Spawning of the external `ph2dt` and `hypoDD` binaries.
//!
//! Both tools read a control file from their working directory. The
//! template control file is copied into the run directory with specific
//! line numbers overwritten so they point at the staged inputs; comment
//! lines (leading `*`) do not advance the line count. The children run
//! through `/bin/sh` so stdout/stderr land in a log file, and the parent
//! blocks until they exit. A non-zero exit is recorded but not raised: the
//! downstream loader reports the missing outputs.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::process::Command;

use camino::Utf8Path;
use log::{error, info};

use crate::config::{HypoddTool, Ph2dtTool};
use crate::rtdd_errors::RtddError;

/// Copy `src` to `dest` replacing the lines whose (comment-insensitive)
/// number appears in `lines_to_replace`.
pub fn copy_file_replace_lines(
    src: &Utf8Path,
    dest: &Utf8Path,
    lines_to_replace: &BTreeMap<usize, String>,
    comment: &str,
) -> Result<(), RtddError> {
    let content = fs::read_to_string(src)
        .map_err(|err| RtddError::Config(format!("cannot copy {src} to {dest}: {err}")))?;

    let mut out = fs::File::create(dest)
        .map_err(|err| RtddError::Config(format!("cannot copy {src} to {dest}: {err}")))?;

    let mut line_num = 0usize;
    for line in content.lines() {
        // comments do not advance the line count
        if !line.starts_with(comment) {
            line_num += 1;
        }
        match lines_to_replace.get(&line_num).filter(|_| !line.starts_with(comment)) {
            Some(replacement) => writeln!(out, "{replacement}")?,
            None => writeln!(out, "{line}")?,
        }
    }
    Ok(())
}

/// Run a shell command synchronously in `working_dir`, waiting for
/// completion. Non-zero exits are logged as errors, not raised.
pub fn start_external_process(cmd: &str, working_dir: &Utf8Path) -> Result<(), RtddError> {
    info!("Working directory {working_dir}");
    info!("Executing command: {cmd}");

    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(working_dir)
        .status()
        .map_err(|err| RtddError::Process(format!("cannot execute '{cmd}': {err}")))?;

    if !status.success() {
        error!("Command exited with non zero value ({status})");
    }
    Ok(())
}

fn require_file(path: &Utf8Path, what: &str) -> Result<(), RtddError> {
    if !path.is_file() {
        return Err(RtddError::Config(format!(
            "unable to run {what}, file doesn't exist: {path}"
        )));
    }
    Ok(())
}

/// Run `ph2dt`.
///
/// Inputs: `ph2dt.inp` (templated), `station.dat`, `phase.dat`.
/// Outputs: `station.sel`, `event.sel`, `event.dat`, `dt.ct`.
pub fn run_ph2dt(
    tool: &Ph2dtTool,
    working_dir: &Utf8Path,
    station_file: &Utf8Path,
    phase_file: &Utf8Path,
) -> Result<(), RtddError> {
    info!("Running ph2dt...");

    require_file(station_file, "ph2dt")?;
    require_file(phase_file, "ph2dt")?;
    require_file(&tool.ctrl_file, "ph2dt (control file)")?;

    let file_name = |p: &Utf8Path| p.file_name().unwrap_or(p.as_str()).to_string();
    let lines_to_replace: BTreeMap<usize, String> = [
        (1, file_name(station_file)),
        (2, file_name(phase_file)),
    ]
    .into();
    copy_file_replace_lines(
        &tool.ctrl_file,
        &working_dir.join("ph2dt.inp"),
        &lines_to_replace,
        "*",
    )?;

    // /bin/sh gives us the stdout/stderr redirection
    let cmd = format!("{} {} >ph2dt.out 2>&1", tool.exec, "ph2dt.inp");
    start_external_process(&cmd, working_dir)
}

/// Run `hypoDD`.
///
/// Inputs: `hypoDD.inp` (templated), `dt.cc`, `dt.ct`, `event.dat`,
/// `station.dat`. Outputs: `hypoDD.loc`, `hypoDD.reloc`, `hypoDD.sta`,
/// `hypoDD.res`, `hypoDD.src`.
///
/// A control file whose first line is the literal `hypoDD_2` marker is a
/// version 2 template; its extra header line shifts all replaced line
/// numbers down by one.
pub fn run_hypodd(
    tool: &HypoddTool,
    working_dir: &Utf8Path,
    dtcc_file: &Utf8Path,
    dtct_file: &Utf8Path,
    event_file: &Utf8Path,
    station_file: &Utf8Path,
    ctrl_file: &Utf8Path,
) -> Result<(), RtddError> {
    info!("Running hypodd...");

    require_file(dtcc_file, "hypodd")?;
    require_file(dtct_file, "hypodd")?;
    require_file(event_file, "hypodd")?;
    require_file(station_file, "hypodd")?;
    require_file(ctrl_file, "hypodd (control file)")?;

    let content = fs::read_to_string(ctrl_file)
        .map_err(|err| RtddError::Config(format!("cannot open hypodd control file {ctrl_file}: {err}")))?;
    let line_offset = match content.lines().next() {
        Some("hypoDD_2") => 1,
        _ => 0,
    };

    let file_name = |p: &Utf8Path| p.file_name().unwrap_or(p.as_str()).to_string();
    let lines_to_replace: BTreeMap<usize, String> = [
        (line_offset + 1, file_name(dtcc_file)),
        (line_offset + 2, file_name(dtct_file)),
        (line_offset + 3, file_name(event_file)),
        (line_offset + 4, file_name(station_file)),
        (line_offset + 5, "hypoDD.loc".to_string()),
        (line_offset + 6, "hypoDD.reloc".to_string()),
        (line_offset + 7, "hypoDD.sta".to_string()),
        (line_offset + 8, "hypoDD.res".to_string()),
        (line_offset + 9, "hypoDD.src".to_string()),
    ]
    .into();
    copy_file_replace_lines(
        ctrl_file,
        &working_dir.join("hypoDD.inp"),
        &lines_to_replace,
        "*",
    )?;

    let cmd = format!("{} {} >hypoDD.out 2>&1", tool.exec, "hypoDD.inp");
    start_external_process(&cmd, working_dir)
}
