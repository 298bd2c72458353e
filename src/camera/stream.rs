//! Background streaming thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::device::{StreamSession, StreamStatus};
use super::types::CameraError;

/// Handle to the thread driving a stream session.
///
/// The thread pumps the session until its stop flag is raised or the session
/// fails, then calls `finish` on it before exiting.
pub struct StreamWorker {
    stop_signal: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StreamWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWorker")
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl StreamWorker {
    /// Spawn the `stream` thread for `session`.
    pub fn spawn(session: Box<dyn StreamSession>) -> Result<Self, CameraError> {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);
        let thread = thread::Builder::new()
            .name("stream".to_string())
            .spawn(move || run_stream_loop(session, stop))?;

        Ok(Self {
            stop_signal,
            thread: Some(thread),
        })
    }

    /// True until the thread has exited, whether asked to or not.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Raise the stop flag and block until the thread has joined.
    pub fn stop_and_join(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Stream thread panicked");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Pump `session` until `stop` is set or a step fails.
pub fn run_stream_loop(mut session: Box<dyn StreamSession>, stop: Arc<AtomicBool>) {
    log::info!("Stream thread started");
    let mut frames: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        match session.pump() {
            Ok(StreamStatus::Frame) => frames += 1,
            Ok(StreamStatus::Idle) => {}
            Err(e) => {
                log::error!("Stream error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = session.finish() {
        log::warn!("Error while closing stream: {}", e);
    }
    log::info!("Stream thread exited after {} frames", frames);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSession {
        pumps: Arc<AtomicUsize>,
        finished: Arc<AtomicBool>,
        fail_after: Option<usize>,
    }

    impl StreamSession for CountingSession {
        fn pump(&mut self) -> Result<StreamStatus, CameraError> {
            let n = self.pumps.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(CameraError::StreamFailed("pipe closed".to_string()));
            }
            thread::sleep(Duration::from_millis(5));
            Ok(StreamStatus::Frame)
        }

        fn finish(&mut self) -> Result<(), CameraError> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session(fail_after: Option<usize>) -> (Box<CountingSession>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let pumps = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let session = Box::new(CountingSession {
            pumps: Arc::clone(&pumps),
            finished: Arc::clone(&finished),
            fail_after,
        });
        (session, pumps, finished)
    }

    #[test]
    fn test_stop_and_join_finishes_session() {
        let (session, pumps, finished) = session(None);
        let mut worker = StreamWorker::spawn(session).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(worker.is_running());

        worker.stop_and_join();
        assert!(!worker.is_running());
        assert!(finished.load(Ordering::SeqCst));
        assert!(pumps.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn test_failed_session_exits_on_its_own() {
        let (session, pumps, finished) = session(Some(3));
        let mut worker = StreamWorker::spawn(session).unwrap();
        for _ in 0..100 {
            if !worker.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!worker.is_running());
        assert_eq!(pumps.load(Ordering::SeqCst), 3);
        assert!(finished.load(Ordering::SeqCst));
        worker.stop_and_join();
    }
}
