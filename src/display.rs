//! Virtual display acquisition
//!
//! Starts an Xvfb server for one display id and races an X11 connect-retry
//! loop against a timeout. The server is owned by the returned
//! [`DisplayHandle`]; if acquisition fails the server guard is dropped on the
//! way out, so the process never outlives the call.
//!
//! ## Retry classification
//! - socket missing / connection refused: server not listening yet, retried
//!   after [`DisplayConfig::connect_backoff`]
//! - anything else (bad display name, setup rejected, ...): returned at once
//!
//! A display id that already answers before our server starts is refused, and
//! a server that exits while we are still connecting fails the acquisition
//! instead of letting the loop reach some other server on the same id.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use x11rb::connection::Connection;
use x11rb::errors::ConnectError;
use x11rb::rust_connection::RustConnection;

use crate::error::{HarnessError, Result};
use crate::process::{ChildOutput, ProcessRole, ProcessSpec, SupervisedProcess};
use crate::teardown::TeardownLog;

/// Pause between connection attempts while the server binds its socket
pub const DEFAULT_CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// How often the server is checked for an early exit while connecting
const SERVER_POLL: Duration = Duration::from_millis(20);

/// Geometry and bootstrap settings for one virtual display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayConfig {
    /// Display id such as `:99`
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Upper bound for the whole connect-retry phase
    pub timeout: Duration,
    pub connect_backoff: Duration,
    /// Server executable, `Xvfb` unless overridden
    pub server_binary: String,
}

impl DisplayConfig {
    pub fn new(id: impl Into<String>, width: u32, height: u32, depth: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            depth,
            timeout: Duration::from_secs(5),
            connect_backoff: DEFAULT_CONNECT_BACKOFF,
            server_binary: "Xvfb".to_string(),
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn server_binary(mut self, binary: impl Into<String>) -> Self {
        self.server_binary = binary.into();
        self
    }

    /// `<server> <id> -screen 0 <W>x<H>x<D>`
    #[must_use]
    pub fn server_spec(&self) -> ProcessSpec {
        ProcessSpec::new(&self.server_binary)
            .args([
                self.id.clone(),
                "-screen".to_string(),
                "0".to_string(),
                format!("{}x{}x{}", self.width, self.height, self.depth),
            ])
            .output(ChildOutput::Discard)
    }
}

/// A connected virtual display
pub struct DisplayHandle {
    id: String,
    width: u32,
    height: u32,
    depth: u32,
    screen: usize,
    conn: RustConnection,
    // Declared last: dropped after the connection is closed
    server: SupervisedProcess,
}

impl DisplayHandle {
    /// Start the display server and wait for it to accept an X11 connection
    ///
    /// # Errors
    /// - [`HarnessError::ProcessStart`] if the server cannot be spawned (no retry)
    /// - [`HarnessError::ConnectFatal`] on a non-retryable connect error, when
    ///   the display id is already served, or when the server exits early
    /// - [`HarnessError::ConnectTimeout`] if `config.timeout` elapses first
    pub async fn acquire(config: &DisplayConfig, teardown: Option<TeardownLog>) -> Result<Self> {
        if display_in_use(&config.id).await {
            return Err(HarnessError::ConnectFatal {
                display: config.id.clone(),
                reason: "display is already served by another X server".to_string(),
            });
        }

        let mut server = SupervisedProcess::start(
            &config.server_spec(),
            ProcessRole::DisplayServer,
            &config.id,
            teardown,
        )?;

        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel(1);
        let display = config.id.clone();
        let backoff = config.connect_backoff;
        tokio::task::spawn_blocking(move || connect_loop(&display, backoff, &tx));

        let timer = tokio::time::sleep(config.timeout);
        tokio::pin!(timer);
        let mut liveness = tokio::time::interval(SERVER_POLL);

        let outcome = loop {
            tokio::select! {
                biased;
                () = &mut timer => break Err(HarnessError::ConnectTimeout {
                    display: config.id.clone(),
                    timeout: config.timeout,
                }),
                msg = rx.recv() => break msg.unwrap_or_else(|| Err(HarnessError::ConnectFatal {
                    display: config.id.clone(),
                    reason: "connect task ended without a result".to_string(),
                })),
                _ = liveness.tick() => {
                    if let Some(status) = server.try_wait() {
                        break Err(server_exited(&config.id, status));
                    }
                }
            }
        };

        // Dropping `rx` here lets an abandoned connect loop notice and exit
        let (conn, screen) = outcome?;
        // A connection is only ours if the server we started is still up
        if let Some(status) = server.try_wait() {
            return Err(server_exited(&config.id, status));
        }
        log::info!("🖥️  Display {} ready after {:?}", config.id, started.elapsed());

        let handle = Self {
            id: config.id.clone(),
            width: config.width,
            height: config.height,
            depth: config.depth,
            screen,
            conn,
            server,
        };
        let (w, h, d) = handle.screen_geometry();
        if (w, h) != (config.width, config.height) {
            log::warn!(
                "Display {} reports {}x{}x{}, requested {}x{}x{}",
                handle.id, w, h, d, config.width, config.height, config.depth
            );
        }
        Ok(handle)
    }

    /// [`DisplayHandle::acquire`] on a private runtime
    ///
    /// The runtime is shut down without waiting, so a connect loop that lost
    /// the race is abandoned rather than joined.
    ///
    /// # Errors
    /// As [`DisplayHandle::acquire`], plus [`HarnessError::Config`] when called
    /// from inside a tokio runtime, where blocking on a nested runtime would
    /// panic. Async callers use [`DisplayHandle::acquire`] directly.
    pub fn acquire_blocking(config: &DisplayConfig, teardown: Option<TeardownLog>) -> Result<Self> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(HarnessError::Config(
                "acquire_blocking called inside a tokio runtime; use DisplayHandle::acquire".into(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| HarnessError::ConnectFatal {
                display: config.id.clone(),
                reason: format!("failed to build runtime: {e}"),
            })?;
        let result = runtime.block_on(Self::acquire(config, teardown));
        runtime.shutdown_background();
        result
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requested (width, height)
    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Root screen (width, height, depth) as reported by the server
    #[must_use]
    pub fn screen_geometry(&self) -> (u32, u32, u32) {
        self.conn.setup().roots.get(self.screen).map_or((0, 0, 0), |s| {
            (
                u32::from(s.width_in_pixels),
                u32::from(s.height_in_pixels),
                u32::from(s.root_depth),
            )
        })
    }

    #[must_use]
    pub fn connection(&self) -> &RustConnection {
        &self.conn
    }

    #[must_use]
    pub fn server_pid(&self) -> u32 {
        self.server.pid()
    }
}

impl std::fmt::Debug for DisplayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("depth", &self.depth)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

type ConnectOutcome = Result<(RustConnection, usize)>;

fn server_exited(display: &str, status: std::process::ExitStatus) -> HarnessError {
    HarnessError::ConnectFatal {
        display: display.to_string(),
        reason: format!("display server exited: {status}"),
    }
}

/// Single connect attempt before our own server is started
async fn display_in_use(display: &str) -> bool {
    let display = display.to_string();
    tokio::task::spawn_blocking(move || x11rb::connect(Some(&display)).is_ok())
        .await
        .unwrap_or(false)
}

/// Runs on a blocking thread until connected, a fatal error, or abandonment
fn connect_loop(display: &str, backoff: Duration, tx: &mpsc::Sender<ConnectOutcome>) {
    let mut attempts = 0u32;
    loop {
        if tx.is_closed() {
            log::debug!("Connect loop for {} abandoned after {} attempts", display, attempts);
            return;
        }
        attempts += 1;

        match x11rb::connect(Some(display)) {
            Ok(conn) => {
                log::debug!("Connected to {} on attempt {}", display, attempts);
                let _ = tx.blocking_send(Ok(conn));
                return;
            }
            Err(e) if is_not_listening(&e) => {
                log::trace!("{} not listening yet: {}", display, e);
                std::thread::sleep(backoff);
            }
            Err(e) => {
                let _ = tx.blocking_send(Err(HarnessError::ConnectFatal {
                    display: display.to_string(),
                    reason: e.to_string(),
                }));
                return;
            }
        }
    }
}

/// The server has not bound its socket yet
fn is_not_listening(err: &ConnectError) -> bool {
    match err {
        ConnectError::IoError(io) => matches!(
            io.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_server_spec() {
        let spec = DisplayConfig::new(":99", 50, 50, 24).server_spec();
        assert_eq!(spec.command_line(), "Xvfb :99 -screen 0 50x50x24");
        assert_eq!(spec.output, ChildOutput::Discard);
    }

    #[test]
    fn test_retry_classification() {
        let refused = ConnectError::IoError(io::Error::from(io::ErrorKind::ConnectionRefused));
        let missing = ConnectError::IoError(io::Error::from(io::ErrorKind::NotFound));
        let denied = ConnectError::IoError(io::Error::from(io::ErrorKind::PermissionDenied));

        assert!(is_not_listening(&refused));
        assert!(is_not_listening(&missing));
        assert!(!is_not_listening(&denied));
        assert!(!is_not_listening(&ConnectError::InvalidScreen));
    }

    #[tokio::test]
    async fn test_missing_server_fails_fast() {
        let config = DisplayConfig::new(":231", 50, 50, 24)
            .server_binary("no-such-xvfb-binary-4711")
            .timeout(Duration::from_secs(10));

        let start = Instant::now();
        let err = DisplayHandle::acquire(&config, None).await.unwrap_err();

        assert!(matches!(err, HarnessError::ProcessStart { .. }));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    // `yes` accepts the server arguments, keeps running and never listens
    const IDLE_SERVER: &str = "yes";

    #[tokio::test]
    async fn test_unreachable_display_times_out() {
        let log = TeardownLog::new();
        let config = DisplayConfig::new(":237", 50, 50, 24)
            .server_binary(IDLE_SERVER)
            .timeout(Duration::from_millis(300));

        let start = Instant::now();
        let err = DisplayHandle::acquire(&config, Some(log.clone())).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, HarnessError::ConnectTimeout { .. }), "got {err:?}");
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(3));
        // server guard released on the error path
        assert_eq!(log.killed_pids().len(), 1);
    }

    #[tokio::test]
    async fn test_exited_server_is_fatal() {
        let log = TeardownLog::new();
        // `true` exits at once, as Xvfb does when it cannot take the display
        let config = DisplayConfig::new(":239", 50, 50, 24)
            .server_binary("true")
            .timeout(Duration::from_secs(10));

        let start = Instant::now();
        let err = DisplayHandle::acquire(&config, Some(log.clone())).await.unwrap_err();

        match err {
            HarnessError::ConnectFatal { display, reason } => {
                assert_eq!(display, ":239");
                assert!(reason.contains("display server exited"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(log.killed_pids().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_display_is_fatal() {
        let config = DisplayConfig::new("not-a-display", 50, 50, 24)
            .server_binary(IDLE_SERVER)
            .timeout(Duration::from_secs(10));

        let start = Instant::now();
        let err = DisplayHandle::acquire(&config, None).await.unwrap_err();

        assert!(matches!(err, HarnessError::ConnectFatal { .. }), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_acquire_blocking_times_out() {
        let config = DisplayConfig::new(":238", 50, 50, 24)
            .server_binary(IDLE_SERVER)
            .timeout(Duration::from_millis(100));

        let err = DisplayHandle::acquire_blocking(&config, None).unwrap_err();
        assert!(matches!(err, HarnessError::ConnectTimeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_acquire_blocking_inside_runtime_is_error() {
        let log = TeardownLog::new();
        let config = DisplayConfig::new(":236", 50, 50, 24).server_binary(IDLE_SERVER);

        let err = DisplayHandle::acquire_blocking(&config, Some(log.clone())).unwrap_err();

        assert!(matches!(err, HarnessError::Config(_)), "got {err:?}");
        // refused before any server was started
        assert!(log.records().is_empty());
    }
}
