//! Instrumented blocking operations.
//!
//! Each wrapper reports to the active watchdog (if any) before delegating to
//! the std call it stands for. Code that runs on runtime workers should use
//! these instead of the raw std calls so that accidental blocking is visible.
#![cfg_attr(not(test), allow(dead_code))]

use crate::watchdog::checkpoint;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// The known set of operations that block the calling thread.
///
/// `LongPoll` is not a std call: it is raised when a scoped future held its
/// thread for longer than the watchdog threshold in a single poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockingOperation {
    ThreadSleep,
    MutexLock,
    FileRead,
    FileWrite,
    StdioWrite,
    ThreadJoin,
    LongPoll { elapsed: Duration },
}

impl BlockingOperation {
    /// Stable identifier of the underlying std call.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockingOperation::ThreadSleep => "std::thread::sleep",
            BlockingOperation::MutexLock => "std::sync::Mutex::lock",
            BlockingOperation::FileRead => "std::fs::read_to_string",
            BlockingOperation::FileWrite => "std::fs::write",
            BlockingOperation::StdioWrite => "std::io::Stderr::write_all",
            BlockingOperation::ThreadJoin => "std::thread::JoinHandle::join",
            BlockingOperation::LongPoll { .. } => "std::future::Future::poll",
        }
    }
}

impl std::fmt::Display for BlockingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockingOperation::LongPoll { elapsed } => {
                write!(f, "{} held for {}ms", self.as_str(), elapsed.as_millis())
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

pub fn sleep(duration: Duration) {
    checkpoint(BlockingOperation::ThreadSleep);
    std::thread::sleep(duration);
}

/// Lock a std mutex. A poisoned lock is recovered rather than propagated.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    checkpoint(BlockingOperation::MutexLock);
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn read_to_string(path: &Path) -> std::io::Result<String> {
    checkpoint(BlockingOperation::FileRead);
    std::fs::read_to_string(path)
}

pub fn write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    checkpoint(BlockingOperation::FileWrite);
    std::fs::write(path, contents)
}

/// Write a message to stderr, terminating it with a newline.
pub fn write_stderr(message: &str) -> std::io::Result<()> {
    checkpoint(BlockingOperation::StdioWrite);
    let mut stderr = std::io::stderr().lock();
    stderr.write_all(message.as_bytes())?;
    if !message.ends_with('\n') {
        stderr.write_all(b"\n")?;
    }
    stderr.flush()
}

pub fn join<T>(handle: std::thread::JoinHandle<T>) -> std::thread::Result<T> {
    checkpoint(BlockingOperation::ThreadJoin);
    handle.join()
}
