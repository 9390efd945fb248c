//! PTY-backed terminal session multiplexer.
//!
//! Holds at most one live process handle per owner key regardless of how
//! many subscribers attach: output fans out through a broadcast channel that
//! is strictly decoupled from the process lifecycle, and a bounded
//! scrollback buffer backs the snapshot replay on reconnect.

use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task;
use uuid::Uuid;

use super::{SpawnSpec, TerminalError, TerminalKey, TerminalSessionInfo, TerminalStatus};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_SCROLLBACK_LIMIT: usize = 256 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Events delivered to terminal subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TerminalEvent {
    /// New output. `seq` increases by one per chunk for liveness tracking.
    Data { chunk: String, seq: u64 },
    /// The backing process exited; the stream ends after this event.
    Exit { exit_code: Option<i32> },
}

/// A subscriber's view of a session: metadata for the `ready` event, the
/// buffer for the `snapshot` event, and the live event receiver.
pub struct TerminalSubscription {
    pub info: TerminalSessionInfo,
    pub snapshot: String,
    pub events: broadcast::Receiver<TerminalEvent>,
}

struct SessionState {
    info: TerminalSessionInfo,
    buffer: String,
}

struct TerminalHandle {
    state: Mutex<SessionState>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    stdin_tx: mpsc::UnboundedSender<Vec<u8>>,
    events_tx: broadcast::Sender<TerminalEvent>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl TerminalHandle {
    fn current_info(&self) -> TerminalSessionInfo {
        let state = self.state.lock().expect("terminal state lock");
        let mut info = state.info.clone();
        // A session is online only with a live process and an attached
        // subscriber; a live process with no stream is "disconnected".
        if info.status == TerminalStatus::Running && self.events_tx.receiver_count() == 0 {
            info.status = TerminalStatus::Disconnected;
        }
        info
    }

    fn is_process_alive(&self) -> bool {
        let state = self.state.lock().expect("terminal state lock");
        state.info.status != TerminalStatus::Exited
    }

    fn kill(&self) {
        let mut killer = self.killer.lock().expect("terminal killer lock");
        if let Err(e) = killer.kill() {
            debug!("Terminal kill returned {:?} (process may already be gone)", e);
        }
    }
}

struct SpawnedPty {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

/// Registry of PTY-backed terminal sessions, one live process per key.
#[derive(Clone)]
pub struct TerminalMultiplexer {
    sessions: Arc<DashMap<TerminalKey, Arc<TerminalHandle>>>,
    scrollback_limit: usize,
}

impl Default for TerminalMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK_LIMIT)
    }
}

impl TerminalMultiplexer {
    /// Create a multiplexer with the given scrollback bound (bytes).
    pub fn new(scrollback_limit: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            scrollback_limit: scrollback_limit.max(1),
        }
    }

    /// Return the existing live session for the key, or spawn a new one.
    pub async fn ensure_session(
        &self,
        key: &TerminalKey,
        spec: SpawnSpec,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalSessionInfo, TerminalError> {
        if let Some(handle) = self.sessions.get(key) {
            if handle.is_process_alive() {
                return Ok(handle.current_info());
            }
        }

        let handle = self.spawn_session(key, spec, cols, rows).await?;

        // A concurrent ensure may have raced us to the key; the first live
        // process wins and the loser is killed immediately.
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_process_alive() {
                    handle.kill();
                    return Ok(entry.get().current_info());
                }
                entry.insert(Arc::clone(&handle));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&handle));
            }
        }

        Ok(handle.current_info())
    }

    /// Subscribe to a session's output. Many subscribers share the one
    /// backing process.
    pub fn subscribe(&self, key: &TerminalKey) -> Result<TerminalSubscription, TerminalError> {
        let handle = self.handle(key)?;
        let events = handle.events_tx.subscribe();
        let (info, snapshot) = {
            let state = handle.state.lock().expect("terminal state lock");
            (state.info.clone(), state.buffer.clone())
        };
        Ok(TerminalSubscription {
            info,
            snapshot,
            events,
        })
    }

    /// Full scrollback buffer, as snapshot replay and non-streaming fallback.
    pub fn read_output(&self, key: &TerminalKey) -> Result<String, TerminalError> {
        let handle = self.handle(key)?;
        let state = handle.state.lock().expect("terminal state lock");
        Ok(state.buffer.clone())
    }

    /// Forward bytes to the process's stdin. Errors when no live session
    /// exists.
    pub fn write_input(&self, key: &TerminalKey, data: &[u8]) -> Result<(), TerminalError> {
        let handle = self.handle(key)?;
        if !handle.is_process_alive() {
            return Err(TerminalError::Process(format!(
                "no live terminal session for {}",
                key
            )));
        }
        handle
            .stdin_tx
            .send(data.to_vec())
            .map_err(|_| TerminalError::Process("terminal stdin writer is gone".to_string()))
    }

    /// Resize the PTY and update session metadata. Fails without a live
    /// session.
    pub fn resize(&self, key: &TerminalKey, cols: u16, rows: u16) -> Result<(), TerminalError> {
        if cols == 0 || rows == 0 {
            return Err(TerminalError::Configuration(
                "terminal size must have non-zero rows and columns".to_string(),
            ));
        }

        let handle = self.handle(key)?;
        if !handle.is_process_alive() {
            return Err(TerminalError::Process(format!(
                "no live terminal session for {}",
                key
            )));
        }

        {
            let master = handle.master.lock().expect("terminal master lock");
            master
                .resize(PtySize {
                    cols,
                    rows,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| TerminalError::Process(e.to_string()))?;
        }

        let mut state = handle.state.lock().expect("terminal state lock");
        state.info.cols = cols;
        state.info.rows = rows;
        Ok(())
    }

    /// Kill the current process (if any), clear the buffer, and spawn a
    /// fresh one under the same key. Distinct from reconnect, which
    /// re-subscribes to the still-alive process.
    pub async fn restart(
        &self,
        key: &TerminalKey,
        spec: SpawnSpec,
        cols: u16,
        rows: u16,
    ) -> Result<TerminalSessionInfo, TerminalError> {
        if let Some((_, old)) = self.sessions.remove(key) {
            info!("Restarting terminal {}", key);
            old.kill();
        }

        let handle = self.spawn_session(key, spec, cols, rows).await?;
        let info = handle.current_info();
        self.sessions.insert(key.clone(), handle);
        Ok(info)
    }

    /// Current session metadata, if a session exists for the key.
    pub fn session_info(&self, key: &TerminalKey) -> Option<TerminalSessionInfo> {
        self.sessions.get(key).map(|h| h.current_info())
    }

    /// Terminate the session and drop its buffer.
    pub fn close(&self, key: &TerminalKey) {
        if let Some((_, handle)) = self.sessions.remove(key) {
            info!("Closing terminal {}", key);
            handle.kill();
        }
    }

    /// Deterministic teardown of every terminal of a cell, used on archive
    /// and delete.
    pub fn close_cell(&self, cell_id: &str) {
        let keys: Vec<TerminalKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().cell_id == cell_id)
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            self.close(&key);
        }
    }

    fn handle(&self, key: &TerminalKey) -> Result<Arc<TerminalHandle>, TerminalError> {
        self.sessions
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TerminalError::SessionNotFound(key.to_string()))
    }

    async fn spawn_session(
        &self,
        key: &TerminalKey,
        spec: SpawnSpec,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<TerminalHandle>, TerminalError> {
        if spec.program.trim().is_empty() {
            return Err(TerminalError::Configuration(
                "terminal spawn program must not be empty".to_string(),
            ));
        }
        if cols == 0 || rows == 0 {
            return Err(TerminalError::Configuration(
                "terminal size must have non-zero rows and columns".to_string(),
            ));
        }

        let cwd = spec.cwd.display().to_string();
        let spawn_spec = spec.clone();
        let spawned = task::spawn_blocking(move || spawn_pty_process(spawn_spec, cols, rows))
            .await
            .map_err(|e| TerminalError::Process(format!("PTY spawn task failed: {e}")))??;

        let pid = spawned.child.process_id().unwrap_or(0);
        let killer = spawned.child.clone_killer();

        let info = TerminalSessionInfo {
            session_id: Uuid::new_v4().to_string(),
            pid,
            cwd,
            cols,
            rows,
            status: TerminalStatus::Running,
            exit_code: None,
            started_at: Utc::now().to_rfc3339(),
            output_seq: 0,
            output_len: 0,
        };

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);

        let handle = Arc::new(TerminalHandle {
            state: Mutex::new(SessionState {
                info,
                buffer: String::new(),
            }),
            master: Mutex::new(spawned.master),
            stdin_tx,
            events_tx: events_tx.clone(),
            killer: Mutex::new(killer),
        });

        debug!("Spawned terminal {} (pid {})", key, pid);

        spawn_read_loop(
            spawned.reader,
            Arc::clone(&handle),
            events_tx.clone(),
            self.scrollback_limit,
        );
        spawn_write_loop(spawned.writer, stdin_rx);
        spawn_child_wait_loop(spawned.child, Arc::clone(&handle), events_tx);

        Ok(handle)
    }
}

fn spawn_pty_process(spec: SpawnSpec, cols: u16, rows: u16) -> Result<SpawnedPty, TerminalError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| TerminalError::Process(e.to_string()))?;

    let mut command = CommandBuilder::new(&spec.program);
    command.cwd(&spec.cwd);
    for arg in &spec.args {
        command.arg(arg);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(command)
        .map_err(|e| TerminalError::Process(e.to_string()))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| TerminalError::Process(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| TerminalError::Process(e.to_string()))?;

    Ok(SpawnedPty {
        master: pair.master,
        reader,
        writer,
        child,
    })
}

fn spawn_read_loop(
    mut reader: Box<dyn Read + Send>,
    handle: Arc<TerminalHandle>,
    events_tx: broadcast::Sender<TerminalEvent>,
    scrollback_limit: usize,
) {
    std::thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => {
                    let chunk = String::from_utf8_lossy(&buffer[..read]).into_owned();
                    let seq = {
                        let mut state = handle.state.lock().expect("terminal state lock");
                        state.info.output_seq += 1;
                        state.info.output_len += read as u64;
                        state.buffer.push_str(&chunk);
                        trim_scrollback(&mut state.buffer, scrollback_limit);
                        state.info.output_seq
                    };
                    let _ = events_tx.send(TerminalEvent::Data { chunk, seq });
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn spawn_write_loop(
    mut writer: Box<dyn Write + Send>,
    mut stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    std::thread::spawn(move || {
        while let Some(input) = stdin_rx.blocking_recv() {
            if input.is_empty() {
                continue;
            }
            if writer.write_all(&input).is_err() {
                break;
            }
            if writer.flush().is_err() {
                break;
            }
        }
    });
}

fn spawn_child_wait_loop(
    mut child: Box<dyn Child + Send + Sync>,
    handle: Arc<TerminalHandle>,
    events_tx: broadcast::Sender<TerminalEvent>,
) {
    std::thread::spawn(move || {
        let exit_code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!("Error waiting for terminal child: {:?}", e);
                None
            }
        };

        {
            let mut state = handle.state.lock().expect("terminal state lock");
            state.info.status = TerminalStatus::Exited;
            state.info.exit_code = exit_code;
        }
        let _ = events_tx.send(TerminalEvent::Exit { exit_code });
    });
}

/// Keep the buffer within the scrollback bound, trimming whole leading bytes
/// on a char boundary.
fn trim_scrollback(buffer: &mut String, limit: usize) {
    if buffer.len() <= limit {
        return;
    }
    let mut start = buffer.len() - limit;
    while !buffer.is_char_boundary(start) {
        start += 1;
    }
    buffer.drain(..start);
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    fn shell_spec(script: &str) -> SpawnSpec {
        SpawnSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: PathBuf::from("/tmp"),
            env: Vec::new(),
        }
    }

    async fn wait_for_output(
        mux: &TerminalMultiplexer,
        key: &TerminalKey,
        needle: &str,
    ) -> String {
        timeout(Duration::from_secs(5), async {
            loop {
                let output = mux.read_output(key).unwrap_or_default();
                if output.contains(needle) {
                    return output;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for terminal output")
    }

    #[tokio::test]
    async fn ensure_session_is_idempotent_while_alive() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::cell("cell-1");

        let first = mux
            .ensure_session(&key, shell_spec("sleep 5"), 80, 24)
            .await
            .unwrap();
        let second = mux
            .ensure_session(&key, shell_spec("sleep 5"), 80, 24)
            .await
            .unwrap();

        assert_eq!(first.pid, second.pid);
        assert_eq!(first.session_id, second.session_id);

        mux.close(&key);
    }

    #[tokio::test]
    async fn output_reaches_buffer_and_subscribers() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::cell("cell-2");

        mux.ensure_session(&key, shell_spec("printf 'ready\\n'; sleep 3"), 80, 24)
            .await
            .unwrap();
        let mut sub = mux.subscribe(&key).unwrap();

        let output = wait_for_output(&mux, &key, "ready").await;
        assert!(output.contains("ready"));

        // Subscriber sees either the snapshot or a data event with the text.
        if !sub.snapshot.contains("ready") {
            let event = timeout(Duration::from_secs(5), sub.events.recv())
                .await
                .expect("timed out")
                .expect("event stream closed");
            match event {
                TerminalEvent::Data { chunk, seq } => {
                    assert!(seq >= 1);
                    assert!(chunk.contains("ready"));
                }
                TerminalEvent::Exit { .. } => panic!("unexpected exit event"),
            }
        }

        mux.close(&key);
    }

    #[tokio::test]
    async fn reconnect_preserves_process_and_sequence() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::chat("cell-3");

        let info = mux
            .ensure_session(
                &key,
                shell_spec("printf 'one\\n'; sleep 3"),
                80,
                24,
            )
            .await
            .unwrap();
        wait_for_output(&mux, &key, "one").await;

        let first = mux.subscribe(&key).unwrap();
        drop(first);

        // Reconnect: same pid, same session, seq did not go backwards.
        let second = mux.subscribe(&key).unwrap();
        assert_eq!(second.info.pid, info.pid);
        assert_eq!(second.info.session_id, info.session_id);
        assert!(second.info.output_seq >= 1);
        assert!(second.snapshot.contains("one"));

        mux.close(&key);
    }

    #[tokio::test]
    async fn restart_replaces_process_and_clears_buffer() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::setup("cell-4");

        let before = mux
            .ensure_session(&key, shell_spec("printf 'old\\n'; sleep 3"), 80, 24)
            .await
            .unwrap();
        wait_for_output(&mux, &key, "old").await;

        let after = mux
            .restart(&key, shell_spec("printf 'new\\n'; sleep 3"), 80, 24)
            .await
            .unwrap();

        assert_ne!(before.pid, after.pid);
        assert_ne!(before.session_id, after.session_id);
        assert_eq!(after.output_seq, 0);

        let output = wait_for_output(&mux, &key, "new").await;
        assert!(!output.contains("old"));

        mux.close(&key);
    }

    #[tokio::test]
    async fn exited_session_is_respawned_on_ensure() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::cell("cell-5");

        let first = mux
            .ensure_session(&key, shell_spec("true"), 80, 24)
            .await
            .unwrap();

        // Wait for the short-lived process to exit.
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(info) = mux.session_info(&key) {
                    if info.status == TerminalStatus::Exited {
                        return;
                    }
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("process did not exit");

        let second = mux
            .ensure_session(&key, shell_spec("sleep 3"), 80, 24)
            .await
            .unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(second.status, TerminalStatus::Running);

        mux.close(&key);
    }

    #[tokio::test]
    async fn write_input_drives_the_process() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::cell("cell-6");

        mux.ensure_session(
            &key,
            shell_spec("read line; printf 'echo:%s\\n' \"$line\"; sleep 1"),
            80,
            24,
        )
        .await
        .unwrap();

        mux.write_input(&key, b"hello\n").unwrap();
        let output = wait_for_output(&mux, &key, "echo:hello").await;
        assert!(output.contains("echo:hello"));

        mux.close(&key);
    }

    #[tokio::test]
    async fn operations_on_unknown_key_fail() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::cell("missing");

        assert!(matches!(
            mux.write_input(&key, b"x"),
            Err(TerminalError::SessionNotFound(_))
        ));
        assert!(matches!(
            mux.resize(&key, 80, 24),
            Err(TerminalError::SessionNotFound(_))
        ));
        assert!(matches!(
            mux.read_output(&key),
            Err(TerminalError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn resize_rejects_zero_dimensions() {
        let mux = TerminalMultiplexer::default();
        let key = TerminalKey::cell("cell-7");

        mux.ensure_session(&key, shell_spec("sleep 3"), 80, 24)
            .await
            .unwrap();
        assert!(matches!(
            mux.resize(&key, 0, 24),
            Err(TerminalError::Configuration(_))
        ));
        mux.resize(&key, 120, 40).unwrap();
        let info = mux.session_info(&key).unwrap();
        assert_eq!((info.cols, info.rows), (120, 40));

        mux.close(&key);
    }

    #[tokio::test]
    async fn close_cell_tears_down_every_kind() {
        let mux = TerminalMultiplexer::default();
        let shell = TerminalKey::cell("cell-8");
        let chat = TerminalKey::chat("cell-8");
        let other = TerminalKey::cell("cell-9");

        mux.ensure_session(&shell, shell_spec("sleep 5"), 80, 24)
            .await
            .unwrap();
        mux.ensure_session(&chat, shell_spec("sleep 5"), 80, 24)
            .await
            .unwrap();
        mux.ensure_session(&other, shell_spec("sleep 5"), 80, 24)
            .await
            .unwrap();

        mux.close_cell("cell-8");

        assert!(mux.session_info(&shell).is_none());
        assert!(mux.session_info(&chat).is_none());
        assert!(mux.session_info(&other).is_some());

        mux.close(&other);
    }

    #[test]
    fn trim_scrollback_keeps_tail() {
        let mut buffer = "abcdefgh".to_string();
        trim_scrollback(&mut buffer, 4);
        assert_eq!(buffer, "efgh");
    }
}
