//! Line-oriented admission gate
//!
//! Each input line is `<key> [amount]`, amount defaulting to 1. Every line
//! read before shutdown gets one response line:
//!
//! - `ACCEPT <key> <remaining>` when the tokens were taken
//! - `DENY <key>` when the key is out of tokens
//! - `ERROR <reason>` when the line could not be parsed

use std::fmt;
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::bounded;
use tb_ratelimit::KeyedLimiter;
use tb_ratelimit::RateLimitError;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// How long `serve` waits for input before rechecking the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lines buffered between the reader thread and `serve`
const LINE_BUFFER: usize = 1024;

/// A parsed admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub key: &'a str,
    pub amount: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("unexpected trailing input: {0}")]
    TrailingInput(String),
}

/// Outcome for one request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Accept { key: String, remaining: u64 },
    Deny { key: String },
    Error(String),
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Accept { key, remaining } => write!(f, "ACCEPT {key} {remaining}"),
            Response::Deny { key } => write!(f, "DENY {key}"),
            Response::Error(reason) => write!(f, "ERROR {reason}"),
        }
    }
}

/// Parse a request line, `None` for blank lines
pub fn parse_request(line: &str) -> Option<Result<Request<'_>, RequestError>> {
    let mut parts = line.split_whitespace();
    let key = parts.next()?;

    let amount = match parts.next() {
        Some(raw) => match raw.parse::<u64>() {
            Ok(amount) => amount,
            Err(_) => return Some(Err(RequestError::InvalidAmount(raw.to_string()))),
        },
        None => 1,
    };

    if let Some(extra) = parts.next() {
        return Some(Err(RequestError::TrailingInput(extra.to_string())));
    }

    Some(Ok(Request { key, amount }))
}

/// Answer a single request line
pub fn handle_line(limiter: &dyn KeyedLimiter, line: &str) -> Option<Response> {
    let request = match parse_request(line)? {
        Ok(request) => request,
        Err(err) => {
            warn!(line, %err, "Malformed request");
            return Some(Response::Error(err.to_string()));
        }
    };

    let response = match limiter.try_take(request.key, request.amount) {
        Ok(remaining) => Response::Accept { key: request.key.to_string(), remaining },
        Err(RateLimitError::TokensExceeded { .. }) => Response::Deny { key: request.key.to_string() },
        Err(err) => Response::Error(err.to_string()),
    };

    Some(response)
}

/// Read `input` line by line on a background thread
///
/// The channel disconnects once `input` reaches EOF. A blocked read never
/// holds up shutdown since `serve` only waits on the channel.
pub fn spawn_reader<R: BufRead + Send + 'static>(input: R) -> Receiver<io::Result<String>> {
    let (tx, rx) = bounded(LINE_BUFFER);

    std::thread::spawn(move || {
        for line in input.lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    rx
}

/// Answer lines from `lines` until the sender disconnects or `running` is
/// cleared
///
/// After a stop, lines already read are still answered before returning.
/// Returns the number of requests answered.
pub fn serve<W: Write>(limiter: &dyn KeyedLimiter, lines: &Receiver<io::Result<String>>, mut output: W, running: &AtomicBool) -> io::Result<u64> {
    let mut answered = 0;

    while running.load(Ordering::Relaxed) {
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => answered += respond(limiter, &line?, &mut output)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Ok(answered),
        }
    }

    debug!("Gate stopped, answering buffered input");
    while let Ok(line) = lines.try_recv() {
        answered += respond(limiter, &line?, &mut output)?;
    }

    Ok(answered)
}

fn respond<W: Write>(limiter: &dyn KeyedLimiter, line: &str, output: &mut W) -> io::Result<u64> {
    match handle_line(limiter, line) {
        Some(response) => {
            writeln!(output, "{response}")?;
            output.flush()?;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// Clear `running` on the first Ctrl+C and exit on the second
///
/// The first signal lets `serve` finish the lines it has read. A second one
/// skips that and ends the process with the conventional SIGINT status.
pub fn install_shutdown_handler(running: Arc<AtomicBool>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        if running.swap(false, Ordering::Relaxed) {
            info!("Shutdown signal received, stopping gate");
        } else {
            warn!("Second shutdown signal, exiting immediately");
            std::process::exit(130);
        }
    })
}
