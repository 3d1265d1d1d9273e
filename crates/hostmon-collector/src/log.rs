//! Log file keys: `log[]` follows a file from the last reported position,
//! `vfs.file.regexp[]` returns the first matching line of a file.

use std::fs::{File, Metadata};
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use hostmon_common::types::AgentResult;
use hostmon_plugin::{CaseMode, ContextProvider, ExportValue, Exporter, Meta, Plugin, PluginError};

use crate::{check_params, param, unknown_key};

const DEFAULT_MAX_LINES: usize = 20;
const MAX_LINES_LIMIT: usize = 1000;
/// Lines read per run, relative to the matched-line limit.
const READ_FACTOR: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    All,
    Skip,
}

/// Marks an item whose position has been initialised by a run.
struct Followed;

pub struct Log;

impl Exporter for Log {
    fn export(
        &self,
        key: &str,
        params: &[String],
        ctx: &dyn ContextProvider,
    ) -> Result<Option<ExportValue>, PluginError> {
        match key {
            "log" => follow(params, ctx),
            "vfs.file.regexp" => first_match(params, ctx).map(|line| Some(line.into())),
            _ => Err(unknown_key(key)),
        }
    }
}

/// `log[file,<regexp>,<encoding>,<maxlines>,<mode>,<output>]`
fn follow(
    params: &[String],
    ctx: &dyn ContextProvider,
) -> Result<Option<ExportValue>, PluginError> {
    check_params(params, 6)?;
    if ctx.client_id() == 0 {
        return Err(PluginError::unsupported("This item is available only in active mode."));
    }
    let path = param(params, 0);
    if path.is_empty() {
        return Err(PluginError::unsupported("Invalid first parameter."));
    }
    let pattern = param(params, 1);
    check_encoding(param(params, 2))?;
    let max_lines = match param(params, 3) {
        "" => DEFAULT_MAX_LINES,
        value => value
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=MAX_LINES_LIMIT).contains(n))
            .ok_or_else(|| PluginError::unsupported("Invalid fourth parameter."))?,
    };
    let mode = match param(params, 4) {
        "" | "all" => Mode::All,
        "skip" => Mode::Skip,
        _ => return Err(PluginError::unsupported("Invalid fifth parameter.")),
    };
    let template = Some(param(params, 5)).filter(|t| !t.is_empty());

    let slots = ctx.output().persist_slots_available();
    if slots == 0 {
        tracing::debug!(path, "Persistent buffer full, postponing log check");
        return Ok(None);
    }

    let meta = ctx.meta();
    let file = open(path)?;
    let info = file.metadata()?;
    let size = info.len();
    let mtime = modified_secs(&info);

    let mut offset = meta.last_log_size();
    if offset > size {
        tracing::debug!(path, offset, size, "Log file shrank, reading from the start");
        offset = 0;
    }
    if mode == Mode::Skip && offset == 0 && first_run(meta) {
        offset = size;
    }

    let limit = max_lines.min(slots);
    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(offset))?;
    let mut position = offset;
    let mut results = Vec::new();
    let mut line = Vec::new();
    let mut read_lines = 0;
    while results.len() < limit && read_lines < limit * READ_FACTOR {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        // a line still being written is picked up by the next run
        if read == 0 || line.last() != Some(&b'\n') {
            break;
        }
        read_lines += 1;
        position += read as u64;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches(['\r', '\n']);
        let matcher = ctx.global_regexp();
        if let Some(value) = matcher.matches(text, pattern, CaseMode::Sensitive, template)? {
            results.push(log_result(Some(value), position, mtime));
        }
    }

    if results.is_empty() {
        if position == meta.last_log_size() && mtime == meta.mtime() {
            return Ok(None);
        }
        results.push(log_result(None, position, mtime));
    }
    meta.set_last_log_size(position);
    meta.set_mtime(mtime);
    Ok(Some(ExportValue::Results(results)))
}

/// `vfs.file.regexp[file,regexp,<encoding>,<start line>,<end line>,<output>]`
fn first_match(params: &[String], ctx: &dyn ContextProvider) -> Result<String, PluginError> {
    check_params(params, 6)?;
    let path = param(params, 0);
    if path.is_empty() {
        return Err(PluginError::unsupported("Invalid first parameter."));
    }
    let pattern = param(params, 1);
    if pattern.is_empty() {
        return Err(PluginError::unsupported("Invalid second parameter."));
    }
    check_encoding(param(params, 2))?;
    let start = line_number(param(params, 3), 1, "Invalid fourth parameter.")?;
    let end = line_number(param(params, 4), u64::MAX, "Invalid fifth parameter.")?;
    if end < start {
        return Err(PluginError::unsupported(
            "Start line parameter must not exceed end line.",
        ));
    }
    let template = Some(param(params, 5)).filter(|t| !t.is_empty());

    let reader = BufReader::new(open(path)?);
    for (number, line) in (1u64..).zip(reader.split(b'\n')) {
        if number > end {
            break;
        }
        let line = line?;
        if number < start {
            continue;
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\r');
        let matcher = ctx.global_regexp();
        if let Some(value) = matcher.matches(text, pattern, CaseMode::Sensitive, template)? {
            return Ok(value);
        }
    }
    Ok(String::new())
}

fn open(path: &str) -> Result<File, PluginError> {
    File::open(path)
        .map_err(|e| PluginError::unsupported(format!("Cannot open file \"{path}\": {e}")))
}

fn check_encoding(encoding: &str) -> Result<(), PluginError> {
    match encoding.to_ascii_lowercase().as_str() {
        "" | "utf-8" | "utf8" => Ok(()),
        _ => Err(PluginError::unsupported(format!("Unsupported encoding \"{encoding}\"."))),
    }
}

fn line_number(value: &str, default: u64, error: &str) -> Result<u64, PluginError> {
    if value.is_empty() {
        return Ok(default);
    }
    value
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| PluginError::unsupported(error))
}

fn modified_secs(info: &Metadata) -> i32 {
    info.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i32::try_from(d.as_secs()).unwrap_or(i32::MAX))
}

/// Whether this is the first run for the item. Marks it as started.
fn first_run(meta: &Meta) -> bool {
    let mut data = meta.data();
    if data.as_ref().is_some_and(|d| d.is::<Followed>()) {
        return false;
    }
    *data = Some(Box::new(Followed));
    true
}

/// A persistent result carrying the position after the reported line. A
/// result without a value only moves the position.
fn log_result(value: Option<String>, position: u64, mtime: i32) -> AgentResult {
    let mut result = AgentResult::value(0, String::new());
    result.value = value;
    result.last_log_size = Some(position);
    result.mtime = Some(mtime);
    result.persistent = true;
    result
}

pub fn plugin() -> Plugin {
    Plugin::builder("Log")
        .metric("log", "Log file monitoring.")
        .metric("vfs.file.regexp", "Find string in a file.")
        .exporter(Arc::new(Log))
        .build()
}
