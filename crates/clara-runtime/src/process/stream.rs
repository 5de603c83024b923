//! Async subprocess output drains (non-UTF8-safe).
//!
//! Inference servers and other C/C++ tooling can emit non-UTF8 bytes on
//! stdout/stderr. Using `BufReader::lines()` would terminate the reader
//! task on invalid UTF-8, so lines are read as bytes and decoded lossily.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use crate::logmux::{LogLevel, LogMux};

pub fn spawn_stream_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    source: String,
    stream_type: &'static str,
    logs: Arc<LogMux>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                    }

                    let line = String::from_utf8_lossy(&buf).to_string();
                    debug!(source = %source, %stream_type, "{}: {}", stream_type, line);
                    logs.append(&source, LogLevel::Info, line);
                }
                Err(e) => {
                    debug!(source = %source, %stream_type, error = %e, "log stream reader exiting due to read error");
                    break;
                }
            }
        }

        debug!(source = %source, %stream_type, "log stream reader task exiting");
    });
}
