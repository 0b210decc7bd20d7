//! Output pacing for streamed text.
//!
//! Text arrives from the network in bursts. The scheduler buffers it per
//! message id and hands it to a sink a few characters per tick, so the UI
//! types at a steady rate regardless of how the bytes arrived.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

/// Receives `(message id, text)` in emission order.
pub type TextSink = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TypewriterConfig {
    pub tick: Duration,
    /// Characters (not bytes) emitted per tick; at least one.
    pub chars_per_tick: usize,
}

impl Default for TypewriterConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(30),
            chars_per_tick: 2,
        }
    }
}

struct Entry {
    buffer: String,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    waiters: Vec<oneshot::Sender<()>>,
}

impl Entry {
    fn release(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        for waiter in self.waiters {
            let _ = waiter.send(());
        }
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    immediate: bool,
    next_generation: u64,
}

struct Inner {
    config: TypewriterConfig,
    sink: TextSink,
    state: Mutex<State>,
}

/// Per-message-id pacing of text towards a sink.
///
/// Emission is FIFO per id; nothing is promised across ids. The sink runs
/// while the scheduler's lock is held, so it must not call back into the
/// scheduler.
#[derive(Clone)]
pub struct TypewriterScheduler {
    inner: Arc<Inner>,
}

impl TypewriterScheduler {
    pub fn new(config: TypewriterConfig, sink: TextSink) -> Self {
        let config = TypewriterConfig {
            chars_per_tick: config.chars_per_tick.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                config,
                sink,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().expect("typewriter state poisoned")
    }

    /// Append `text` to the buffer of `id`, starting its timer if idle.
    pub fn enqueue(&self, id: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.immediate {
            // Anything still buffered goes first to keep the order.
            if let Some(entry) = state.entries.remove(id) {
                self.emit(id, &entry.buffer);
                entry.release();
            }
            self.emit(id, text);
            return;
        }

        let generation = state.next_generation;
        let entry = state.entries.entry(id.to_string()).or_insert_with(|| Entry {
            buffer: String::new(),
            timer: None,
            generation,
            waiters: Vec::new(),
        });
        let fresh = entry.generation == generation;
        entry.buffer.push_str(text);
        if entry.timer.is_none() {
            entry.timer = Some(tokio::spawn(tick_loop(
                Arc::downgrade(&self.inner),
                id.to_string(),
                entry.generation,
            )));
        }
        if fresh {
            state.next_generation += 1;
        }
    }

    /// Emit everything buffered for `id` now and resolve its waiters.
    pub fn flush(&self, id: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.remove(id) {
            self.emit(id, &entry.buffer);
            entry.release();
        }
    }

    /// Drop whatever is buffered for `id` without emitting it. Idempotent.
    pub fn clear(&self, id: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.remove(id) {
            tracing::trace!(id, dropped = entry.buffer.chars().count(), "typewriter cleared");
            entry.release();
        }
    }

    /// Resolves once everything enqueued for `id` so far has been emitted,
    /// flushed or cleared.
    pub async fn drain(&self, id: &str) {
        let rx = {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(id) else {
                return;
            };
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            rx
        };
        let _ = rx.await;
    }

    /// Flush every id. Used when the UI stops being visible.
    pub fn flush_all(&self) {
        let mut state = self.lock();
        let mut ids: Vec<String> = state.entries.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(entry) = state.entries.remove(&id) {
                self.emit(&id, &entry.buffer);
                entry.release();
            }
        }
    }

    /// While immediate, text is emitted as soon as it is enqueued.
    /// Switching on flushes everything pending.
    pub fn set_immediate(&self, immediate: bool) {
        self.lock().immediate = immediate;
        if immediate {
            self.flush_all();
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.lock().immediate
    }

    /// Follow a visibility signal: pace while visible, emit immediately
    /// while hidden.
    pub fn watch_visibility(&self, mut visible: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let is_visible = *visible.borrow_and_update();
                scheduler.set_immediate(!is_visible);
                if visible.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Characters still waiting to be emitted for `id`.
    pub fn buffered_len(&self, id: &str) -> usize {
        self.lock()
            .entries
            .get(id)
            .map(|e| e.buffer.chars().count())
            .unwrap_or(0)
    }

    /// True while `id` has state (buffered text or a running timer).
    pub fn is_active(&self, id: &str) -> bool {
        self.lock().entries.contains_key(id)
    }

    fn emit(&self, id: &str, text: &str) {
        if !text.is_empty() {
            (self.inner.sink)(id, text);
        }
    }
}

impl fmt::Debug for TypewriterScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypewriterScheduler")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

async fn tick_loop(inner: Weak<Inner>, id: String, generation: u64) {
    let Some(tick) = inner.upgrade().map(|i| i.config.tick) else {
        return;
    };
    let mut interval = tokio::time::interval_at(Instant::now() + tick, tick);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let Ok(mut state) = inner.state.lock() else {
            return;
        };
        let Some(entry) = state.entries.get_mut(&id) else {
            return;
        };
        // A clear or flush raced this tick and a new buffer took the id.
        if entry.generation != generation {
            return;
        }
        let chunk = take_chars(&mut entry.buffer, inner.config.chars_per_tick);
        if !chunk.is_empty() {
            (inner.sink)(&id, &chunk);
        }
        if entry.buffer.is_empty() {
            if let Some(mut entry) = state.entries.remove(&id) {
                // This task is the timer; do not abort ourselves.
                entry.timer = None;
                entry.release();
            }
            return;
        }
    }
}

fn take_chars(buffer: &mut String, n: usize) -> String {
    let end = buffer
        .char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(buffer.len());
    buffer.drain(..end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Arc<Mutex<Vec<(String, String)>>>;

    fn recording(config: TypewriterConfig) -> (TypewriterScheduler, Log) {
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = log.clone();
        let sink: TextSink = Arc::new(move |id, text| {
            sink_log
                .lock()
                .unwrap()
                .push((id.to_string(), text.to_string()));
        });
        (TypewriterScheduler::new(config, sink), log)
    }

    fn emitted(log: &Log, id: &str) -> String {
        log.lock()
            .unwrap()
            .iter()
            .filter(|(i, _)| i == id)
            .map(|(_, t)| t.as_str())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn emits_a_few_characters_per_tick() {
        let (tw, log) = recording(TypewriterConfig::default());
        tw.enqueue("m1", "abcdef");
        tokio::time::sleep(Duration::from_millis(31)).await;
        assert_eq!(emitted(&log, "m1"), "ab");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(emitted(&log, "m1"), "abcd");
        assert_eq!(tw.buffered_len("m1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_output_is_the_concatenation_in_order() {
        for chars_per_tick in [1, 2, 5] {
            let (tw, log) = recording(TypewriterConfig {
                chars_per_tick,
                ..Default::default()
            });
            tw.enqueue("m", "Result: ");
            tw.enqueue("m", "4");
            tw.enqueue("m", "2");
            tw.drain("m").await;
            assert_eq!(emitted(&log, "m"), "Result: 42");
            assert!(!tw.is_active("m"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn multibyte_text_splits_on_char_boundaries() {
        let (tw, log) = recording(TypewriterConfig::default());
        tw.enqueue("m", "你好世界");
        tokio::time::sleep(Duration::from_millis(31)).await;
        assert_eq!(emitted(&log, "m"), "你好");
        tw.drain("m").await;
        assert_eq!(emitted(&log, "m"), "你好世界");
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_an_empty_buffer() {
        let (tw, _log) = recording(TypewriterConfig::default());
        tw.enqueue("m", "abcdef");
        let waiter = {
            let tw = tw.clone();
            tokio::spawn(async move { tw.drain("m").await })
        };
        tokio::time::sleep(Duration::from_millis(61)).await;
        assert!(!waiter.is_finished());
        tokio::time::sleep(Duration::from_millis(30)).await;
        waiter.await.unwrap();
        assert_eq!(tw.buffered_len("m"), 0);
    }

    #[tokio::test]
    async fn drain_of_unknown_id_returns_immediately() {
        let (tw, _log) = recording(TypewriterConfig::default());
        tw.drain("nothing").await;
    }

    #[tokio::test(start_paused = true)]
    async fn clear_then_enqueue_starts_fresh() {
        let (tw, log) = recording(TypewriterConfig::default());
        tw.enqueue("m", "stale text");
        tokio::time::sleep(Duration::from_millis(31)).await;
        tw.clear("m");
        tw.clear("m");
        tw.enqueue("m", "new");
        tw.drain("m").await;
        assert_eq!(emitted(&log, "m"), "stnew");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_resolves_waiters() {
        let (tw, log) = recording(TypewriterConfig::default());
        tw.enqueue("m", "abcdef");
        let waiter = {
            let tw = tw.clone();
            tokio::spawn(async move { tw.drain("m").await })
        };
        tokio::task::yield_now().await;
        tw.clear("m");
        waiter.await.unwrap();
        assert_eq!(emitted(&log, "m"), "");
    }

    #[tokio::test(start_paused = true)]
    async fn flush_emits_everything_at_once() {
        let (tw, log) = recording(TypewriterConfig::default());
        tw.enqueue("m", "abcdef");
        tw.flush("m");
        assert_eq!(log.lock().unwrap().clone(), vec![("m".into(), "abcdef".into())]);
        assert!(!tw.is_active("m"));
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_ui_switches_to_immediate_output() {
        let (tw, log) = recording(TypewriterConfig::default());
        let (visible_tx, visible_rx) = watch::channel(true);
        let watcher = tw.watch_visibility(visible_rx);

        tw.enqueue("a", "one");
        tw.enqueue("b", "two");
        visible_tx.send(false).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(tw.is_immediate());
        assert_eq!(emitted(&log, "a"), "one");
        assert_eq!(emitted(&log, "b"), "two");

        tw.enqueue("a", "!");
        assert_eq!(emitted(&log, "a"), "one!");

        visible_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!tw.is_immediate());
        watcher.abort();
    }
}
