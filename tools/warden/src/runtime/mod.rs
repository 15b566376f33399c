use crate::errors::WardenError;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnedProcess {
    pub handle: u64,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Terminate,
    Kill,
}

impl ProcessSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
    fn sleep_until(&self, deadline: SystemTime) -> Result<(), WardenError>;
}

/// Owns spawned children by handle. Once an exit status has been observed through
/// `try_wait` or `wait`, the child is reaped and its handle is forgotten.
pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<SpawnedProcess, WardenError>;
    fn try_wait(&self, handle: u64) -> Result<Option<i32>, WardenError>;
    fn wait(&self, handle: u64) -> Result<i32, WardenError>;
    fn signal(&self, handle: u64, signal: ProcessSignal) -> Result<(), WardenError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, WardenError>;
    /// `Ok(None)` when the path does not exist.
    fn modified(&self, path: &Path) -> Result<Option<SystemTime>, WardenError>;
    fn remove_file(&self, path: &Path) -> Result<(), WardenError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait InterruptSource: Send + Sync {
    fn interrupted(&self) -> bool;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), WardenError> {
        let now = SystemTime::now();
        if let Ok(duration) = deadline.duration_since(now) {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, WardenError> {
        std::fs::read_to_string(path)
            .map_err(|e| WardenError::Io(format!("{}: {e}", path.display())))
    }

    fn modified(&self, path: &Path) -> Result<Option<SystemTime>, WardenError> {
        match std::fs::metadata(path) {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|e| WardenError::Io(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WardenError::Io(format!("{}: {e}", path.display()))),
        }
    }

    fn remove_file(&self, path: &Path) -> Result<(), WardenError> {
        std::fs::remove_file(path).map_err(|e| WardenError::Io(format!("{}: {e}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, std::process::Child>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProcessState>, WardenError> {
        self.state
            .lock()
            .map_err(|_| WardenError::Process("process lock poisoned".to_string()))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<SpawnedProcess, WardenError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        cmd.stdin(std::process::Stdio::inherit())
            .stdout(std::process::Stdio::inherit())
            .stderr(std::process::Stdio::inherit());

        let child = cmd
            .spawn()
            .map_err(|e| WardenError::Launch(format!("{}: {e}", request.program)))?;
        let pid = child.id();
        let mut state = self.lock()?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(handle, child);
        Ok(SpawnedProcess { handle, pid })
    }

    fn try_wait(&self, handle: u64) -> Result<Option<i32>, WardenError> {
        let mut state = self.lock()?;
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| WardenError::Process(format!("unknown handle {handle}")))?;
        let status = child
            .try_wait()
            .map_err(|e| WardenError::Process(e.to_string()))?;
        match status {
            Some(status) => {
                state.children.remove(&handle);
                Ok(Some(exit_code(status)))
            }
            None => Ok(None),
        }
    }

    fn wait(&self, handle: u64) -> Result<i32, WardenError> {
        let child = {
            let mut state = self.lock()?;
            state.children.remove(&handle)
        };
        let mut child =
            child.ok_or_else(|| WardenError::Process(format!("unknown handle {handle}")))?;
        let status = child
            .wait()
            .map_err(|e| WardenError::Process(e.to_string()))?;
        Ok(exit_code(status))
    }

    fn signal(&self, handle: u64, signal: ProcessSignal) -> Result<(), WardenError> {
        let mut state = self.lock()?;
        let child = state
            .children
            .get_mut(&handle)
            .ok_or_else(|| WardenError::Process(format!("unknown handle {handle}")))?;

        match signal {
            ProcessSignal::Kill => child
                .kill()
                .map_err(|e| WardenError::Signal(format!("{}: {e}", signal.as_str()))),
            ProcessSignal::Terminate => send_terminate(child),
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &std::process::Child) -> Result<(), WardenError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM)
        .map_err(|e| WardenError::Signal(format!("SIGTERM pid={}: {e}", child.id())))
}

// No graceful signal outside unix; termination falls straight through to a kill.
#[cfg(not(unix))]
fn send_terminate(child: &mut std::process::Child) -> Result<(), WardenError> {
    child
        .kill()
        .map_err(|e| WardenError::Signal(format!("terminate pid={}: {e}", child.id())))
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Latches SIGINT and SIGTERM sent to the supervisor itself.
pub struct SignalInterruptSource {
    flag: Arc<AtomicBool>,
}

impl SignalInterruptSource {
    pub fn install() -> Result<Self, WardenError> {
        use signal_hook::consts::{SIGINT, SIGTERM};

        let flag = Arc::new(AtomicBool::new(false));
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&flag)).map_err(|e| {
                WardenError::Signal(format!("failed to install handler for {signal}: {e}"))
            })?;
        }
        Ok(Self { flag })
    }
}

impl InterruptSource for SignalInterruptSource {
    fn interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub interrupts: Arc<dyn InterruptSource>,
}

impl ProductionRuntime {
    pub fn new() -> Result<Self, WardenError> {
        Ok(Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            interrupts: Arc::new(SignalInterruptSource::install()?),
        })
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
    sleeps: Arc<Mutex<Vec<SystemTime>>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sleeps(&self) -> Vec<SystemTime> {
        self.sleeps.lock().expect("sleep lock").clone()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }

    fn sleep_until(&self, deadline: SystemTime) -> Result<(), WardenError> {
        self.sleeps.lock().expect("sleep lock").push(deadline);
        let mut now = self.now.lock().expect("clock lock");
        if deadline > *now {
            *now = deadline;
        }
        Ok(())
    }
}

#[derive(Clone)]
enum FakeMtime {
    Fixed(SystemTime),
    /// Rewritten continuously by a child until `until`, if set.
    Live {
        clock: FakeClock,
        until: Option<SystemTime>,
    },
}

#[derive(Clone)]
struct FakeFile {
    contents: String,
    modified: FakeMtime,
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, FakeFile>>>,
    removed: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<(usize, WardenError)>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files.lock().expect("files lock").insert(
            path.into(),
            FakeFile {
                contents: contents.into(),
                modified: FakeMtime::Fixed(SystemTime::UNIX_EPOCH),
            },
        );
        fs
    }

    pub fn touch(&self, path: impl Into<PathBuf>, modified: SystemTime) {
        self.set_mtime(path.into(), FakeMtime::Fixed(modified));
    }

    /// Simulates a child that keeps rewriting `path` until `until` (forever if `None`).
    pub fn keep_fresh(
        &self,
        path: impl Into<PathBuf>,
        clock: FakeClock,
        until: Option<SystemTime>,
    ) {
        self.set_mtime(path.into(), FakeMtime::Live { clock, until });
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().expect("removed lock").clone()
    }

    pub fn set_fail_next(&self, error: WardenError) {
        self.fail_after(0, error);
    }

    /// Lets `calls` operations succeed, then fails the one after.
    pub fn fail_after(&self, calls: usize, error: WardenError) {
        *self.fail_next.lock().expect("fail lock") = Some((calls, error));
    }

    fn set_mtime(&self, path: PathBuf, modified: FakeMtime) {
        self.files
            .lock()
            .expect("files lock")
            .entry(path)
            .and_modify(|file| file.modified = modified.clone())
            .or_insert(FakeFile {
                contents: String::new(),
                modified,
            });
    }

    fn maybe_fail(&self) -> Result<(), WardenError> {
        let mut pending = self.fail_next.lock().expect("fail lock");
        match pending.take() {
            Some((0, err)) => Err(err),
            Some((calls, err)) => {
                *pending = Some((calls - 1, err));
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, WardenError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .map(|file| file.contents.clone())
            .ok_or_else(|| WardenError::Io(format!("missing file {}", path.display())))
    }

    fn modified(&self, path: &Path) -> Result<Option<SystemTime>, WardenError> {
        self.maybe_fail()?;
        let files = self.files.lock().expect("files lock");
        Ok(files.get(path).map(|file| match &file.modified {
            FakeMtime::Fixed(at) => *at,
            FakeMtime::Live { clock, until } => {
                let now = clock.now();
                match until {
                    Some(until) if *until < now => *until,
                    _ => now,
                }
            }
        }))
    }

    fn remove_file(&self, path: &Path) -> Result<(), WardenError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .remove(path)
            .ok_or_else(|| WardenError::Io(format!("missing file {}", path.display())))?;
        self.removed
            .lock()
            .expect("removed lock")
            .push(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeChild {
    /// Exits with `exit_code` on the `polls`-th exit check.
    ExitsAfterPolls { polls: u32, exit_code: i32 },
    /// Runs until signalled. SIGTERM is ignored unless `honors_terminate`.
    RunsUntilSignalled { honors_terminate: bool },
    FailsToSpawn(String),
}

struct FakeChildState {
    script: FakeChild,
    polls: u32,
    exit_code: Option<i32>,
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    scripts: Arc<Mutex<VecDeque<FakeChild>>>,
    children: Arc<Mutex<HashMap<u64, FakeChildState>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    signals: Arc<Mutex<Vec<(u64, ProcessSignal)>>>,
    next_handle: Arc<Mutex<u64>>,
}

impl FakeProcessRunner {
    pub fn push_child(&self, child: FakeChild) {
        self.scripts.lock().expect("scripts lock").push_back(child);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn signals(&self) -> Vec<(u64, ProcessSignal)> {
        self.signals.lock().expect("signals lock").clone()
    }

    pub fn live_children(&self) -> usize {
        self.children.lock().expect("children lock").len()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<SpawnedProcess, WardenError> {
        self.spawned
            .lock()
            .expect("spawned lock")
            .push(request.clone());
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .ok_or_else(|| WardenError::Launch("no fake child queued".to_string()))?;
        if let FakeChild::FailsToSpawn(message) = &script {
            return Err(WardenError::Launch(format!("{}: {message}", request.program)));
        }

        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        self.children.lock().expect("children lock").insert(
            handle,
            FakeChildState {
                script,
                polls: 0,
                exit_code: None,
            },
        );
        Ok(SpawnedProcess {
            handle,
            pid: 1000 + handle as u32,
        })
    }

    fn try_wait(&self, handle: u64) -> Result<Option<i32>, WardenError> {
        let mut children = self.children.lock().expect("children lock");
        let state = children
            .get_mut(&handle)
            .ok_or_else(|| WardenError::Process(format!("unknown handle {handle}")))?;
        state.polls += 1;
        let exited = match (&state.script, state.exit_code) {
            (_, Some(code)) => Some(code),
            (FakeChild::ExitsAfterPolls { polls, exit_code }, None) if state.polls >= *polls => {
                Some(*exit_code)
            }
            _ => None,
        };
        if exited.is_some() {
            children.remove(&handle);
        }
        Ok(exited)
    }

    fn wait(&self, handle: u64) -> Result<i32, WardenError> {
        let mut children = self.children.lock().expect("children lock");
        let code = children
            .get(&handle)
            .ok_or_else(|| WardenError::Process(format!("unknown handle {handle}")))?
            .exit_code
            .ok_or_else(|| {
                WardenError::Process(format!("fake child {handle} would block forever"))
            })?;
        children.remove(&handle);
        Ok(code)
    }

    fn signal(&self, handle: u64, signal: ProcessSignal) -> Result<(), WardenError> {
        let mut children = self.children.lock().expect("children lock");
        let state = children
            .get_mut(&handle)
            .ok_or_else(|| WardenError::Process(format!("unknown handle {handle}")))?;
        self.signals
            .lock()
            .expect("signals lock")
            .push((handle, signal));
        let honors_terminate = !matches!(
            state.script,
            FakeChild::RunsUntilSignalled {
                honors_terminate: false
            }
        );
        match signal {
            ProcessSignal::Kill => state.exit_code = Some(137),
            ProcessSignal::Terminate if honors_terminate => state.exit_code = Some(143),
            ProcessSignal::Terminate => {}
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeInterruptSource {
    clock: FakeClock,
    at: Option<SystemTime>,
}

impl FakeInterruptSource {
    pub fn never() -> Self {
        Self::default()
    }

    /// Reports an interrupt once `clock` reaches `at`.
    pub fn at(clock: FakeClock, at: SystemTime) -> Self {
        Self {
            clock,
            at: Some(at),
        }
    }
}

impl InterruptSource for FakeInterruptSource {
    fn interrupted(&self) -> bool {
        self.at.is_some_and(|at| self.clock.now() >= at)
    }
}
