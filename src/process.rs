//! Executions backed by OS processes.
//!
//! [`ProcessExecution`] spawns a program. [`CallableExecution`] runs a Rust
//! closure in a forked child so it can be stopped and interrupted exactly
//! like a program.

use std::io::{self, BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::Result;
use crate::execution::{check_interrupt_signal, Execution, ExecutionError, ExecutionState};
use crate::job::InstanceReporter;

/// Default capacity of the queue between the output reader and observers.
pub const DEFAULT_OUTPUT_QUEUE: usize = 1024;

#[derive(Debug, Default)]
struct ProcessControl {
    pid: Option<libc::pid_t>,
    stopped: bool,
    interrupt_signal: Option<i32>,
}

impl ProcessControl {
    /// Early exit when a stop or interrupt arrived before the process started.
    fn cancelled(&self) -> Option<Result<ExecutionState, ExecutionError>> {
        if self.stopped {
            Some(Ok(ExecutionState::Stopped))
        } else {
            self.interrupt_signal.map(|signal| Err(interrupted_by(signal)))
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        if let Some(pid) = self.pid {
            send_signal(pid, libc::SIGTERM);
        }
    }

    fn interrupt(&mut self, signal: i32) {
        self.interrupt_signal = Some(signal);
        if let Some(pid) = self.pid {
            send_signal(pid, signal);
        }
    }

    /// Maps how the child ended onto a terminal state, giving precedence to
    /// stop and interrupt requests.
    fn outcome(&self, exit_code: Option<i32>, signal: Option<i32>) -> Result<ExecutionState, ExecutionError> {
        if self.stopped {
            return Ok(ExecutionState::Stopped);
        }
        if let Some(requested) = self.interrupt_signal {
            return Err(interrupted_by(requested));
        }
        match (exit_code, signal) {
            (Some(0), _) => Ok(ExecutionState::Completed),
            (Some(code), _) => Err(
                ExecutionError::failed(format!("Process returned non-zero code {code}"))
                    .with_param("exit_code", code),
            ),
            (None, Some(signal)) => Err(
                ExecutionError::failed(format!("Process terminated by signal {signal}"))
                    .with_param("signal", signal),
            ),
            (None, None) => Err(ExecutionError::failed("Process ended without exit status")),
        }
    }
}

fn interrupted_by(signal: i32) -> ExecutionError {
    ExecutionError::interrupted(format!("Interrupted by signal {signal}")).with_param("signal", signal)
}

fn send_signal(pid: libc::pid_t, signal: i32) {
    // Callers hold the control lock, under which the pid is cleared before
    // the child is reaped, so the pid cannot have been recycled.
    let ret = unsafe { libc::kill(pid, signal) };
    if ret != 0 {
        tracing::debug!(pid, signal, error = %io::Error::last_os_error(), "signal_not_delivered");
    }
}

/// Blocks until the child exits without reaping it: its pid stays reserved
/// until the caller reaps it.
fn wait_exited(pid: libc::pid_t) -> io::Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Capture {
    reader: JoinHandle<usize>,
    consumer: JoinHandle<()>,
}

impl Capture {
    /// Waits until every queued line was handed to observers.
    fn finish(self) {
        match self.reader.join() {
            Ok(0) => {}
            Ok(dropped) => tracing::warn!(dropped, "output_lines_dropped"),
            Err(_) => tracing::error!("output_reader_panicked"),
        }
        if self.consumer.join().is_err() {
            tracing::error!("output_consumer_panicked");
        }
    }
}

/// Runs a program as a child process.
///
/// Exit code 0 completes the execution, any other code fails it. A stop sends
/// SIGTERM and ends in `STOPPED`; an interrupt sends the requested signal and
/// ends in `INTERRUPTED` regardless of how the child reacts.
pub struct ProcessExecution {
    args: Vec<String>,
    output_queue: Option<usize>,
    control: Mutex<ProcessControl>,
    reporter: Mutex<Option<InstanceReporter>>,
    last_line: Arc<Mutex<Option<String>>>,
}

impl ProcessExecution {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            output_queue: None,
            control: Mutex::new(ProcessControl::default()),
            reporter: Mutex::new(None),
            last_line: Arc::new(Mutex::new(None)),
        }
    }

    /// Captures standard output of the child and forwards each line to the
    /// instance's output observers.
    ///
    /// Lines pass through a queue of `queue_capacity` entries. When observers
    /// fall behind, new lines are dropped instead of slowing down the child.
    pub fn capturing(args: Vec<String>, queue_capacity: usize) -> Self {
        Self {
            output_queue: Some(queue_capacity.max(1)),
            ..Self::new(args)
        }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Waits for the child, then forgets its pid and reaps it under the
    /// control lock.
    fn reap(&self, child: &mut Child) -> io::Result<ExitStatus> {
        let exited = wait_exited(child.id() as libc::pid_t);
        let mut control = lock(&self.control);
        control.pid = None;
        exited?;
        child.wait()
    }

    fn start_capture(&self, stdout: ChildStdout, capacity: usize) -> io::Result<Capture> {
        let (tx, rx) = mpsc::sync_channel::<String>(capacity);

        let reader = thread::Builder::new()
            .name("taro-output-reader".into())
            .spawn(move || {
                let mut dropped = 0;
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    match tx.try_send(line) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                            dropped += 1
                        }
                    }
                }
                dropped
            })?;

        let reporter = lock(&self.reporter).clone();
        let last_line = Arc::clone(&self.last_line);
        let consumer = thread::Builder::new()
            .name("taro-output-consumer".into())
            .spawn(move || {
                for line in rx {
                    if let Some(reporter) = &reporter {
                        reporter.output(&line);
                    }
                    *lock(&last_line) = Some(line);
                }
            })?;

        Ok(Capture { reader, consumer })
    }
}

impl Execution for ProcessExecution {
    fn is_async(&self) -> bool {
        false
    }

    fn execute(&self) -> Result<ExecutionState, ExecutionError> {
        let Some((program, args)) = self.args.split_first() else {
            return Err(ExecutionError::start_failed("No command to execute"));
        };
        let mut command = Command::new(program);
        command.args(args);
        if self.output_queue.is_some() {
            command.stdout(Stdio::piped());
        }

        let mut child = {
            let mut control = lock(&self.control);
            if let Some(early) = control.cancelled() {
                return early;
            }
            let child = command.spawn().map_err(|e| {
                tracing::warn!(program = %program, error = %e, "process_start_failed");
                ExecutionError::start_failed(e.to_string())
            })?;
            control.pid = Some(child.id() as libc::pid_t);
            child
        };
        tracing::debug!(pid = child.id(), program = %program, "process_started");

        let capture = match (self.output_queue, child.stdout.take()) {
            (Some(capacity), Some(stdout)) => match self.start_capture(stdout, capacity) {
                Ok(capture) => Some(capture),
                Err(e) => {
                    lock(&self.control).stop();
                    let _ = self.reap(&mut child);
                    return Err(ExecutionError::from_unexpected(e));
                }
            },
            _ => None,
        };

        let waited = self.reap(&mut child);
        if let Some(capture) = capture {
            capture.finish();
        }

        let status = waited.map_err(ExecutionError::from_unexpected)?;
        lock(&self.control).outcome(status.code(), status.signal())
    }

    fn status(&self) -> Option<String> {
        lock(&self.last_line).clone()
    }

    fn stop(&self) {
        lock(&self.control).stop();
    }

    fn interrupt(&self, signal: i32) -> Result<()> {
        check_interrupt_signal(signal)?;
        lock(&self.control).interrupt(signal);
        Ok(())
    }

    fn attach(&self, reporter: InstanceReporter) {
        *lock(&self.reporter) = Some(reporter);
    }
}

type Target = Box<dyn FnOnce() -> i32 + Send>;

/// Runs a closure in a forked child process; its return value is the exit code.
pub struct CallableExecution {
    target: Mutex<Option<Target>>,
    control: Mutex<ProcessControl>,
}

impl CallableExecution {
    pub fn new<F>(target: F) -> Self
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        Self {
            target: Mutex::new(Some(Box::new(target))),
            control: Mutex::new(ProcessControl::default()),
        }
    }

    fn wait(pid: libc::pid_t) -> io::Result<libc::c_int> {
        let mut status: libc::c_int = 0;
        loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            if ret != -1 {
                return Ok(status);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Execution for CallableExecution {
    fn is_async(&self) -> bool {
        false
    }

    fn execute(&self) -> Result<ExecutionState, ExecutionError> {
        let pid = {
            let mut control = lock(&self.control);
            if let Some(early) = control.cancelled() {
                return early;
            }
            let Some(target) = lock(&self.target).take() else {
                return Err(ExecutionError::start_failed("Target already executed"));
            };

            match unsafe { libc::fork() } {
                -1 => {
                    return Err(ExecutionError::start_failed(
                        io::Error::last_os_error().to_string(),
                    ));
                }
                0 => {
                    let code = panic::catch_unwind(AssertUnwindSafe(target)).unwrap_or(1);
                    unsafe { libc::_exit(code) }
                }
                pid => {
                    control.pid = Some(pid);
                    pid
                }
            }
        };
        tracing::debug!(pid, "callable_started");

        let exited = wait_exited(pid);
        let waited = {
            let mut control = lock(&self.control);
            control.pid = None;
            exited.and_then(|()| Self::wait(pid))
        };
        let status = waited.map_err(ExecutionError::from_unexpected)?;

        let (code, signal) = if libc::WIFEXITED(status) {
            (Some(libc::WEXITSTATUS(status)), None)
        } else if libc::WIFSIGNALED(status) {
            (None, Some(libc::WTERMSIG(status)))
        } else {
            (None, None)
        };
        lock(&self.control).outcome(code, signal)
    }

    fn status(&self) -> Option<String> {
        None
    }

    fn stop(&self) {
        lock(&self.control).stop();
    }

    fn interrupt(&self, signal: i32) -> Result<()> {
        check_interrupt_signal(signal)?;
        lock(&self.control).interrupt(signal);
        Ok(())
    }
}
