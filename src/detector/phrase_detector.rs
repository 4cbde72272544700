//! Closing-phrase detection loop.

use crate::config::DetectorConfig;
use crate::detector::matcher::PhraseMatcher;
use crate::detector::recognizer::{Recognizer, RecognizerEvent};
use crate::transport::state::ConnectionState;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorSettings {
    pub cooldown: Duration,
    pub restart_delay: Duration,
    /// Restarts allowed per run after errors or end of stream.
    pub max_restarts: u32,
}

impl DetectorSettings {
    pub fn from_config(config: &DetectorConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
            max_restarts: config.max_restarts,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self::from_config(&DetectorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhraseDetectorState {
    pub is_listening: bool,
    pub last_detection: Option<Instant>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<Box<dyn Recognizer>>,
}

/// Runs a recognizer until a closing phrase is heard.
///
/// Paused while the assistant is speaking. The detection timestamp survives
/// restarts, so a repeat within the cooldown never fires twice.
pub struct PhraseDetector {
    matcher: Arc<dyn PhraseMatcher>,
    settings: DetectorSettings,
    shared: Arc<Mutex<PhraseDetectorState>>,
    running: Option<Running>,
}

impl PhraseDetector {
    pub fn new(matcher: Arc<dyn PhraseMatcher>, settings: DetectorSettings) -> Self {
        Self {
            matcher,
            settings,
            shared: Arc::new(Mutex::new(PhraseDetectorState::default())),
            running: None,
        }
    }

    pub fn state(&self) -> PhraseDetectorState {
        self.shared.lock().map(|s| *s).unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.task.is_finished())
    }

    /// Start listening. `on_complete` runs at most once, on detection.
    ///
    /// Returns the recognizer back if a run is already active.
    pub fn start<F>(
        &mut self,
        recognizer: Box<dyn Recognizer>,
        states: watch::Receiver<ConnectionState>,
        on_complete: F,
    ) -> std::result::Result<(), Box<dyn Recognizer>>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.running.is_some() {
            return Err(recognizer);
        }

        let cancel = CancellationToken::new();
        let run = DetectorRun {
            recognizer,
            matcher: Arc::clone(&self.matcher),
            settings: self.settings,
            shared: Arc::clone(&self.shared),
            states,
            cancel: cancel.clone(),
        };
        tracing::debug!("Phrase detector started");
        let task = tokio::spawn(run.run(on_complete));
        self.running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop the loop and hand the recognizer back.
    pub async fn stop(&mut self) -> Option<Box<dyn Recognizer>> {
        let running = self.running.take()?;
        running.cancel.cancel();
        match running.task.await {
            Ok(recognizer) => Some(recognizer),
            Err(e) => {
                tracing::error!(error = %e, "Phrase detector task failed");
                None
            }
        }
    }
}

impl Drop for PhraseDetector {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }
}

struct DetectorRun {
    recognizer: Box<dyn Recognizer>,
    matcher: Arc<dyn PhraseMatcher>,
    settings: DetectorSettings,
    shared: Arc<Mutex<PhraseDetectorState>>,
    states: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

enum Step {
    Detected,
    Restart(String),
    Pause,
    Finish,
}

impl DetectorRun {
    fn set_listening(&self, listening: bool) {
        if let Ok(mut state) = self.shared.lock() {
            state.is_listening = listening;
        }
    }

    fn speaking(&self) -> bool {
        *self.states.borrow() == ConnectionState::Speaking
    }

    /// Record a detection unless one happened within the cooldown.
    fn claim_detection(&self) -> bool {
        let now = Instant::now();
        let Ok(mut state) = self.shared.lock() else {
            return false;
        };
        if let Some(last) = state.last_detection
            && now.duration_since(last) < self.settings.cooldown
        {
            return false;
        }
        state.last_detection = Some(now);
        true
    }

    async fn run<F: FnOnce()>(mut self, on_complete: F) -> Box<dyn Recognizer> {
        let mut restarts: u32 = 0;

        loop {
            if !self.wait_until_not_speaking().await {
                break;
            }

            let step = match self.recognizer.start().await {
                Ok(()) => {
                    self.set_listening(true);
                    self.listen().await
                }
                Err(e) => Step::Restart(format!("start failed: {}", e)),
            };
            self.recognizer.stop().await;
            self.set_listening(false);

            match step {
                Step::Detected => {
                    tracing::info!("Closing phrase detected");
                    on_complete();
                    break;
                }
                Step::Finish => break,
                Step::Pause => continue,
                Step::Restart(reason) => {
                    restarts += 1;
                    if restarts > self.settings.max_restarts {
                        tracing::warn!(restarts, reason = %reason, "Phrase detector giving up");
                        break;
                    }
                    tracing::debug!(restarts, reason = %reason, "Restarting recognizer");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.restart_delay) => {}
                    }
                }
            }
        }

        self.set_listening(false);
        tracing::debug!("Phrase detector stopped");
        self.recognizer
    }

    /// Returns false when the detector should end instead.
    async fn wait_until_not_speaking(&mut self) -> bool {
        while self.speaking() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.states.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
        !self.cancel.is_cancelled()
    }

    async fn listen(&mut self) -> Step {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::Finish,
                changed = self.states.changed() => {
                    if changed.is_err() {
                        return Step::Finish;
                    }
                    if self.speaking() {
                        tracing::trace!("Assistant speaking, pausing recognizer");
                        return Step::Pause;
                    }
                }
                event = self.recognizer.next_event() => match event {
                    RecognizerEvent::Final(text) => {
                        if !self.matcher.matches(&text) {
                            continue;
                        }
                        if self.speaking() {
                            tracing::debug!("Ignoring closing phrase while speaking");
                            continue;
                        }
                        if !self.claim_detection() {
                            tracing::debug!("Closing phrase within cooldown");
                            continue;
                        }
                        return Step::Detected;
                    }
                    RecognizerEvent::Error { aborted: true, .. } => return Step::Finish,
                    RecognizerEvent::Error { message, .. } => return Step::Restart(message),
                    RecognizerEvent::End => return Step::Restart("end of stream".to_string()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::matcher::ClosingPhraseMatcher;
    use crate::detector::recognizer::{ChannelRecognizer, RecognizerFeed};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector(max_restarts: u32) -> PhraseDetector {
        PhraseDetector::new(
            Arc::new(ClosingPhraseMatcher::new(["au revoir"], 1)),
            DetectorSettings {
                cooldown: Duration::from_secs(3),
                restart_delay: Duration::from_millis(300),
                max_restarts,
            },
        )
    }

    fn start(
        detector: &mut PhraseDetector,
        states: watch::Receiver<ConnectionState>,
    ) -> (RecognizerFeed, Arc<AtomicUsize>) {
        let (recognizer, feed) = ChannelRecognizer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        assert!(
            detector
                .start(Box::new(recognizer), states, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .is_ok()
        );
        (feed, fired)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closing_phrase_fires_once_and_stops() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(3);
        let (feed, fired) = start(&mut detector, rx);
        settle().await;
        assert!(detector.state().is_listening);

        feed.utterance("au revoir !");
        feed.utterance("au revoir");
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!detector.is_running());
        assert!(!detector.state().is_listening);
        assert!(detector.state().last_detection.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_tail_does_not_fire() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(3);
        let (feed, fired) = start(&mut detector, rx);
        settle().await;

        feed.utterance("au revoir, comment vas-tu");
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(detector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_while_speaking() {
        let (tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(3);
        let (feed, fired) = start(&mut detector, rx);
        settle().await;
        assert_eq!(feed.starts(), 1);

        tx.send_replace(ConnectionState::Speaking);
        settle().await;
        assert!(!detector.state().is_listening);

        feed.utterance("au revoir");
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tx.send_replace(ConnectionState::Connected);
        settle().await;
        assert!(detector.state().is_listening);
        assert_eq!(feed.starts(), 2);

        feed.utterance("au revoir");
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_error_and_end() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(5);
        let (feed, fired) = start(&mut detector, rx);
        settle().await;

        feed.error("network", false);
        settle().await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;
        assert_eq!(feed.starts(), 2);

        feed.end();
        settle().await;
        tokio::time::sleep(Duration::from_millis(350)).await;
        settle().await;
        assert_eq!(feed.starts(), 3);

        feed.utterance("Au revoir.");
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_stops_without_restart() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(5);
        let (feed, _fired) = start(&mut detector, rx);
        settle().await;

        feed.error("aborted", true);
        settle().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(feed.starts(), 1);
        assert!(!detector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_budget_is_bounded() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(2);
        let (feed, _fired) = start(&mut detector, rx);
        settle().await;

        for _ in 0..5 {
            feed.end();
            settle().await;
            tokio::time::sleep(Duration::from_millis(350)).await;
            settle().await;
        }
        assert_eq!(feed.starts(), 3);
        assert!(!detector.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_spans_restarts() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(3);
        let (feed, fired) = start(&mut detector, rx.clone());
        settle().await;
        feed.utterance("au revoir");
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let recognizer = detector.stop().await.unwrap();
        let second = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&second);
        assert!(
            detector
                .start(recognizer, rx, move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .is_ok()
        );
        settle().await;

        feed.utterance("au revoir");
        settle().await;
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        feed.utterance("au revoir");
        settle().await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_recognizer() {
        let (_tx, rx) = watch::channel(ConnectionState::Connected);
        let mut detector = detector(3);
        let (_feed, _fired) = start(&mut detector, rx);
        settle().await;

        assert!(detector.stop().await.is_some());
        assert!(detector.stop().await.is_none());
        assert!(!detector.state().is_listening);
    }
}
