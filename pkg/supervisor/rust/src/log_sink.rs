// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::LogSinkError;
use crate::spec::LogPaths;
use crate::worker::WorkerTag;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::OwnedFormatItem;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type SharedWriter = Arc<Mutex<BufWriter<File>>>;

const MAX_LINE: usize = 64 * 1024;

/// Prefixes captured lines with a timestamp.
#[derive(Clone)]
struct Stamper {
    format: Option<Arc<OwnedFormatItem>>,
}

impl Stamper {
    fn new(timestamps: bool, date_format: &str) -> Self {
        if !timestamps {
            return Self { format: None };
        }
        match time::format_description::parse_owned::<2>(date_format) {
            Ok(format) => Self {
                format: Some(Arc::new(format)),
            },
            Err(e) => {
                warn!("invalid log date format {date_format:?}, writing lines without timestamps: {e}");
                Self { format: None }
            }
        }
    }

    fn entry(&self, line: &str) -> String {
        let Some(ref format) = self.format else {
            return format!("{line}\n");
        };
        match OffsetDateTime::now_utc().format(format.as_ref()) {
            Ok(stamp) => format!("{stamp}: {line}\n"),
            Err(_) => format!("{line}\n"),
        }
    }
}

/// Durable, append-only destination for a worker's stdout and stderr.
///
/// The files stay open across restarts. In merged mode both streams share a
/// single writer, so lines interleave in arrival order.
pub struct LogSink {
    stdout: SharedWriter,
    stderr: SharedWriter,
    stamper: Stamper,
}

impl LogSink {
    pub async fn open(
        paths: &LogPaths,
        merge: bool,
        timestamps: bool,
        date_format: &str,
    ) -> Result<LogSink, LogSinkError> {
        let stdout = Arc::new(Mutex::new(BufWriter::new(open_append(&paths.stdout).await?)));
        let stderr = if merge {
            Arc::clone(&stdout)
        } else {
            Arc::new(Mutex::new(BufWriter::new(open_append(&paths.stderr).await?)))
        };
        Ok(LogSink {
            stdout,
            stderr,
            stamper: Stamper::new(timestamps, date_format),
        })
    }

    /// Start copying both pipes into the destination files, one task per stream.
    pub fn attach<O, E>(&self, tag: WorkerTag, stdout: Option<O>, stderr: Option<E>) -> Capture
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let mut tasks = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            tasks.push(tokio::spawn(pump(
                tag.clone(),
                "stdout",
                stdout,
                Arc::clone(&self.stdout),
                self.stamper.clone(),
            )));
        }
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(pump(
                tag.clone(),
                "stderr",
                stderr,
                Arc::clone(&self.stderr),
                self.stamper.clone(),
            )));
        }
        Capture { tag, tasks }
    }
}

async fn open_append(path: &Path) -> Result<File, LogSinkError> {
    let err = |source| LogSinkError {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(err)
}

/// Copy one stream line by line until end-of-input. Lines longer than
/// `MAX_LINE` bytes are split so an unterminated stream is never buffered
/// whole.
async fn pump<R>(tag: WorkerTag, stream: &'static str, reader: R, writer: SharedWriter, stamper: Stamper)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(1024);
    // Set after a forced split; a newline right after it ends no new line.
    let mut split = false;
    loop {
        let available = match reader.fill_buf().await {
            Ok(available) => available,
            Err(e) => {
                warn!("[{tag}] reading {stream} failed: {e}");
                break;
            }
        };
        if available.is_empty() {
            if !line.is_empty() {
                write_entry(&tag, stream, &writer, &stamper, &line).await;
            }
            break;
        }
        if split && available[0] == b'\n' {
            split = false;
            reader.consume(1);
            continue;
        }
        split = false;

        let window = &available[..available.len().min(MAX_LINE - line.len())];
        let (consumed, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(end) => {
                line.extend_from_slice(&window[..end]);
                (end + 1, true)
            }
            None => {
                line.extend_from_slice(window);
                split = line.len() >= MAX_LINE;
                (window.len(), split)
            }
        };
        reader.consume(consumed);
        if complete {
            write_entry(&tag, stream, &writer, &stamper, &line).await;
            line.clear();
        }
    }
    debug!("[{tag}] {stream} reached end of input");
}

async fn write_entry(
    tag: &WorkerTag,
    stream: &'static str,
    writer: &SharedWriter,
    stamper: &Stamper,
    line: &[u8],
) {
    let line = String::from_utf8_lossy(line);
    let entry = stamper.entry(line.trim_end_matches('\r'));
    let mut out = writer.lock().await;
    let written = async {
        out.write_all(entry.as_bytes()).await?;
        out.flush().await
    }
    .await;
    if let Err(e) = written {
        warn!("[{tag}] dropped {stream} line: {e}");
    }
}

/// Running capture for one launch of the worker.
pub struct Capture {
    tag: WorkerTag,
    tasks: Vec<JoinHandle<()>>,
}

impl Capture {
    /// Wait up to `limit` in total for both streams to drain. Streams still
    /// open after that (a detached grandchild holding the pipe) are abandoned.
    pub async fn finish(self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(
                    "[{}] output still open {}ms after exit, abandoning capture",
                    self.tag,
                    limit.as_millis()
                );
                task.abort();
            }
        }
    }
}
