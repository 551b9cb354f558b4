//! Subprocess I/O pipe.
//!
//! [`Subprocess::spawn`] starts a child with all three standard streams
//! piped and hands each of them to its own task:
//!
//! - a feeder copies the [`StdinSource`] into the child's stdin and closes it,
//! - two drainers copy stdout and stderr into [`Spool`]s,
//! - a supervisor waits for the exit status, a cancellation or the deadline.
//!
//! Because the drainers never wait on the consumer, the child can always
//! make progress on its output no matter how slowly the caller reads, and
//! the feeder can block on a full stdin pipe without stalling anything
//! else. Dropping the [`Subprocess`] before the child exits kills it.

use crate::spool::{Spool, SpoolConfig, SpoolReader, SpoolWriter};
use crate::{PipeError, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on stderr kept for diagnostics.
pub const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;

/// Description of the process to run.
#[derive(Debug, Clone)]
pub struct PipeCommand {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    spool: SpoolConfig,
    timeout: Option<Duration>,
}

impl PipeCommand {
    /// Creates a command for `program`.
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            spool: SpoolConfig::default(),
            timeout: None,
        }
    }

    /// Appends an argument.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Sets the working directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Sets the spool used for stdout and stderr.
    pub fn spool(mut self, spool: SpoolConfig) -> Self {
        self.spool = spool;
        self
    }

    /// Kills the child if it has not exited after `timeout`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Program name for diagnostics.
    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }
}

/// What to feed into the child's stdin.
pub enum StdinSource {
    /// Close stdin immediately.
    Null,
    /// Copy everything from a spool.
    Spool(SpoolReader),
    /// Copy chunks from a stream.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

/// Why a child was killed on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The consumer went away.
    Cancelled,
    /// A watchdog decided the child took too long.
    Expired,
}

/// Handle that kills a running child. Cheap to clone.
#[derive(Clone, Default)]
pub struct Canceller {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl Canceller {
    /// Creates an untriggered canceller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills the child because its consumer is gone.
    pub fn cancel(&self) {
        self.trigger(CancelReason::Cancelled);
    }

    /// Kills the child because it exceeded a time limit.
    pub fn expire(&self) {
        self.trigger(CancelReason::Expired);
    }

    fn trigger(&self, reason: CancelReason) {
        self.reason.lock().get_or_insert(reason);
        self.token.cancel();
    }

    /// Returns true once either trigger fired.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until either trigger fires and reports which one won.
    pub async fn cancelled(&self) -> CancelReason {
        self.token.cancelled().await;
        (*self.reason.lock()).unwrap_or(CancelReason::Cancelled)
    }
}

/// Tracks the last time bytes moved into or out of the child.
struct Activity {
    started: Instant,
    last_millis: AtomicU64,
    finished: AtomicBool,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_millis.load(Ordering::Relaxed)))
    }
}

/// Read-only view of a child's I/O activity, for watchdogs.
#[derive(Clone)]
pub struct IdleProbe(Arc<Activity>);

impl IdleProbe {
    /// Time since bytes last moved through stdin or stdout.
    pub fn idle_for(&self) -> Duration {
        self.0.idle_for()
    }

    /// Returns true once the child has been reaped.
    pub fn is_finished(&self) -> bool {
        self.0.finished.load(Ordering::Acquire)
    }
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal that we did not send.
    Signaled,
    /// Killed after the deadline or by a watchdog.
    TimedOut,
    /// Killed because the consumer went away.
    Cancelled,
}

impl ExitOutcome {
    /// Returns true for a zero exit status.
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

/// Exit outcome plus captured stderr.
#[derive(Debug, Clone)]
pub struct ExitReport {
    /// How the child ended.
    pub outcome: ExitOutcome,
    /// Up to [`STDERR_CAPTURE_LIMIT`] bytes of stderr, lossily decoded.
    pub stderr: String,
}

impl ExitReport {
    /// Converts anything but a zero exit into the matching error.
    pub fn into_result(self) -> Result<ExitReport> {
        match self.outcome {
            ExitOutcome::Exited(0) => Ok(self),
            ExitOutcome::Exited(code) => Err(PipeError::BackendFailure {
                code,
                stderr: self.stderr,
            }),
            ExitOutcome::Signaled => Err(PipeError::BackendTerminated {
                stderr: self.stderr,
            }),
            ExitOutcome::TimedOut => Err(PipeError::BackendTimeout),
            ExitOutcome::Cancelled => Err(PipeError::Cancelled),
        }
    }
}

/// A running child process with spooled output.
pub struct Subprocess {
    program: String,
    pid: Option<u32>,
    stdout: Option<SpoolReader>,
    stderr: Option<SpoolReader>,
    outcome: watch::Receiver<Option<ExitOutcome>>,
    canceller: Canceller,
    activity: Arc<Activity>,
}

impl Subprocess {
    /// Starts the child and the tasks that service its streams.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(command: PipeCommand, stdin: StdinSource) -> Result<Self> {
        let program = command.program();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                PipeError::BackendUnavailable {
                    program: program.clone(),
                    source: e,
                }
            }
            _ => PipeError::Io(e),
        })?;

        let pid = child.id();
        let child_stdin = child.stdin.take();
        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr not captured"))?;

        debug!(program = %program, pid = ?pid, "Backend process started");

        let canceller = Canceller::new();
        let activity = Arc::new(Activity::new());
        let (stdout_writer, stdout_reader) = Spool::channel(command.spool.clone());
        let (stderr_writer, stderr_reader) = Spool::channel(command.spool.clone());

        let stdout_task = tokio::spawn(drain(
            child_stdout,
            stdout_writer,
            Some(activity.clone()),
            canceller.clone(),
        ));
        let stderr_task = tokio::spawn(drain(child_stderr, stderr_writer, None, canceller.clone()));
        let feeder = tokio::spawn(feed(
            stdin,
            child_stdin,
            activity.clone(),
            canceller.clone(),
        ));

        let (tx, rx) = watch::channel(None);
        tokio::spawn(supervise(
            child,
            activity.clone(),
            canceller.clone(),
            command.timeout,
            Drains {
                stdout: stdout_task,
                stderr: stderr_task,
                feeder,
            },
            tx,
        ));

        Ok(Self {
            program,
            pid,
            stdout: Some(stdout_reader),
            stderr: Some(stderr_reader),
            outcome: rx,
            canceller,
            activity,
        })
    }

    /// OS process id, if the child was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Takes the stdout reader. Returns `None` on the second call.
    pub fn take_stdout(&mut self) -> Option<SpoolReader> {
        self.stdout.take()
    }

    /// Takes the stderr reader. Once taken, [`wait`](Self::wait) reports
    /// an empty stderr.
    pub fn take_stderr(&mut self) -> Option<SpoolReader> {
        self.stderr.take()
    }

    /// Returns a handle that can kill the child from elsewhere.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    /// Time since bytes last moved through stdin or stdout (or since spawn).
    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// Returns a probe a watchdog can poll without holding the process.
    pub fn idle_probe(&self) -> IdleProbe {
        IdleProbe(self.activity.clone())
    }

    /// Outcome if the child has already been reaped.
    pub fn try_outcome(&self) -> Option<ExitOutcome> {
        *self.outcome.borrow()
    }

    /// Waits for the child to be reaped and its output fully spooled.
    pub async fn wait(&mut self) -> Result<ExitReport> {
        let outcome = {
            let mut rx = self.outcome.clone();
            let value = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| io::Error::other("backend supervisor stopped"))?;
            (*value).unwrap_or(ExitOutcome::Cancelled)
        };

        let stderr = match self.stderr.as_mut() {
            Some(reader) => collect_lossy(reader, STDERR_CAPTURE_LIMIT).await,
            None => String::new(),
        };

        Ok(ExitReport { outcome, stderr })
    }

    /// Kills the child if it is still running.
    pub fn cancel(&self) {
        if self.try_outcome().is_none() {
            self.canceller.cancel();
        }
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subprocess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subprocess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("outcome", &self.try_outcome())
            .finish()
    }
}

struct Drains {
    stdout: JoinHandle<()>,
    stderr: JoinHandle<()>,
    feeder: JoinHandle<()>,
}

async fn supervise(
    mut child: Child,
    activity: Arc<Activity>,
    canceller: Canceller,
    timeout: Option<Duration>,
    drains: Drains,
    tx: watch::Sender<Option<ExitOutcome>>,
) {
    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(code) => ExitOutcome::Exited(code),
                None => ExitOutcome::Signaled,
            },
            Err(e) => {
                warn!(error = %e, "Failed to wait for backend process");
                kill(&mut child).await;
                ExitOutcome::Signaled
            }
        },
        reason = canceller.cancelled() => {
            kill(&mut child).await;
            match reason {
                CancelReason::Cancelled => ExitOutcome::Cancelled,
                CancelReason::Expired => ExitOutcome::TimedOut,
            }
        }
        _ = deadline => {
            kill(&mut child).await;
            ExitOutcome::TimedOut
        }
    };

    drains.feeder.abort();
    if matches!(outcome, ExitOutcome::Cancelled) {
        drains.stdout.abort();
        drains.stderr.abort();
    } else {
        let _ = drains.stdout.await;
        let _ = drains.stderr.await;
    }

    activity.finished.store(true, Ordering::Release);
    debug!(outcome = ?outcome, "Backend process finished");
    let _ = tx.send(Some(outcome));
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill backend process");
    }
}

async fn drain<R>(
    mut source: R,
    mut sink: SpoolWriter,
    activity: Option<Arc<Activity>>,
    canceller: Canceller,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => {
                sink.finish();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to read backend output");
                return;
            }
        };
        if let Some(activity) = &activity {
            activity.touch();
        }
        if let Err(e) = sink.write(&buf[..n]).await {
            warn!(error = %e, "Failed to spool backend output");
            canceller.cancel();
            return;
        }
    }
}

async fn feed(
    source: StdinSource,
    stdin: Option<ChildStdin>,
    activity: Arc<Activity>,
    canceller: Canceller,
) {
    let Some(mut stdin) = stdin else {
        return;
    };

    let result = copy_into(source, &mut stdin, &activity).await;
    match result {
        Ok(bytes) => {
            debug!(bytes, "Backend stdin closed");
            let _ = stdin.shutdown().await;
        }
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Backend closed stdin early");
        }
        Err(e) => {
            warn!(error = %e, "Failed to feed backend stdin");
            canceller.cancel();
        }
    }
}

async fn copy_into(
    source: StdinSource,
    stdin: &mut ChildStdin,
    activity: &Activity,
) -> io::Result<u64> {
    let mut total = 0u64;
    match source {
        StdinSource::Null => {}
        StdinSource::Spool(mut reader) => {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = reader.read(&mut buf).await.map_err(io::Error::other)?;
                if n == 0 {
                    break;
                }
                stdin.write_all(&buf[..n]).await?;
                activity.touch();
                total += n as u64;
            }
        }
        StdinSource::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                stdin.write_all(&chunk).await?;
                activity.touch();
                total += chunk.len() as u64;
            }
        }
    }
    Ok(total)
}

/// Reads up to `limit` bytes, stopping quietly at the end or on error.
async fn collect_lossy(reader: &mut SpoolReader, limit: usize) -> String {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 8 * 1024];
    while out.len() < limit {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n.min(limit - out.len())]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    fn input_stream(total: usize, chunk: usize) -> BoxStream<'static, io::Result<Bytes>> {
        let chunks = total / chunk;
        futures::stream::iter((0..chunks).map(move |i| {
            Ok(Bytes::from(vec![(i % 256) as u8; chunk]))
        }))
        .boxed()
    }

    fn cat() -> PipeCommand {
        PipeCommand::new("cat").spool(SpoolConfig::with_threshold(MB))
    }

    async fn consume(reader: &mut SpoolReader, slow: bool) -> (usize, u64) {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0usize;
        let mut sum = 0u64;
        let mut reads = 0u32;
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                return (total, sum);
            }
            total += n;
            sum += buf[..n].iter().map(|&b| b as u64).sum::<u64>();
            reads += 1;
            if slow && reads % 16 == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    fn expected_sum(total: usize, chunk: usize) -> u64 {
        (0..total / chunk)
            .map(|i| (i % 256) as u64 * chunk as u64)
            .sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_large_input_with_fast_consumer() {
        let total = 50 * MB;
        let mut child = Subprocess::spawn(cat(), StdinSource::Stream(input_stream(total, 64 * 1024)))
            .unwrap();
        let mut stdout = child.take_stdout().unwrap();

        let (len, sum) = consume(&mut stdout, false).await;
        assert_eq!(len, total);
        assert_eq!(sum, expected_sum(total, 64 * 1024));

        let report = child.wait().await.unwrap();
        assert_eq!(report.outcome, ExitOutcome::Exited(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_large_input_with_slow_consumer() {
        let total = 50 * MB;
        let mut child = Subprocess::spawn(cat(), StdinSource::Stream(input_stream(total, 32 * 1024)))
            .unwrap();
        let mut stdout = child.take_stdout().unwrap();

        let (len, sum) = consume(&mut stdout, true).await;
        assert_eq!(len, total);
        assert_eq!(sum, expected_sum(total, 32 * 1024));
        assert!(child.wait().await.unwrap().outcome.success());
    }

    #[tokio::test]
    async fn output_is_drained_before_anyone_reads() {
        // 8 MiB of output exceeds any pipe buffer; the child must still exit.
        let command = PipeCommand::new("sh")
            .args(["-c", "head -c 8388608 /dev/zero"])
            .spool(SpoolConfig::with_threshold(64 * 1024));
        let mut child = Subprocess::spawn(command, StdinSource::Null).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(30), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(report.outcome.success());

        let mut out = Vec::new();
        child.take_stdout().unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 8 * MB);
    }

    #[tokio::test]
    async fn spool_can_feed_stdin() {
        let (mut writer, reader) = Spool::channel(SpoolConfig::with_threshold(4));
        writer.write(b"hello ").await.unwrap();
        writer.write(b"backend").await.unwrap();
        writer.finish();

        let mut child = Subprocess::spawn(cat(), StdinSource::Spool(reader)).unwrap();
        let mut out = Vec::new();
        child.take_stdout().unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello backend");
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let err = Subprocess::spawn(
            PipeCommand::new("/nonexistent/ges-backend-tool"),
            StdinSource::Null,
        )
        .unwrap_err();
        assert!(matches!(err, PipeError::BackendUnavailable { .. }));
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let command = PipeCommand::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        let mut child = Subprocess::spawn(command, StdinSource::Null).unwrap();

        let err = child.wait().await.unwrap().into_result().unwrap_err();
        match err {
            PipeError::BackendFailure { code, stderr } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn signal_is_reported_as_terminated() {
        let command = PipeCommand::new("sh").args(["-c", "kill -9 $$"]);
        let mut child = Subprocess::spawn(command, StdinSource::Null).unwrap();

        let err = child.wait().await.unwrap().into_result().unwrap_err();
        assert!(matches!(err, PipeError::BackendTerminated { .. }));
    }

    #[tokio::test]
    async fn deadline_kills_child() {
        let command = PipeCommand::new("sleep")
            .arg("30")
            .timeout(Some(Duration::from_millis(100)));
        let mut child = Subprocess::spawn(command, StdinSource::Null).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, ExitOutcome::TimedOut);
        assert!(matches!(report.into_result(), Err(PipeError::BackendTimeout)));
    }

    #[tokio::test]
    async fn canceller_kills_child() {
        let mut child = Subprocess::spawn(PipeCommand::new("sleep").arg("30"), StdinSource::Null)
            .unwrap();
        child.canceller().cancel();

        let report = tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, ExitOutcome::Cancelled);
    }

    #[tokio::test]
    async fn expire_reports_timeout() {
        let mut child = Subprocess::spawn(PipeCommand::new("sleep").arg("30"), StdinSource::Null)
            .unwrap();
        child.canceller().expire();

        let report = child.wait().await.unwrap();
        assert_eq!(report.outcome, ExitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn dropping_subprocess_kills_child() {
        let child = Subprocess::spawn(PipeCommand::new("sleep").arg("30"), StdinSource::Null)
            .unwrap();
        let canceller = child.canceller();
        drop(child);
        assert!(canceller.is_cancelled());
    }

    #[tokio::test]
    async fn idle_time_grows_without_output() {
        let child = Subprocess::spawn(PipeCommand::new("sleep").arg("30"), StdinSource::Null)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(child.idle_for() >= Duration::from_millis(50));
        assert!(!child.idle_probe().is_finished());
    }

    #[tokio::test]
    async fn probe_sees_exit() {
        let mut child = Subprocess::spawn(PipeCommand::new("true"), StdinSource::Null).unwrap();
        let probe = child.idle_probe();
        child.wait().await.unwrap();
        assert!(probe.is_finished());
    }
}
