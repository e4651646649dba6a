//! Gapless clock-based playback scheduling.
//!
//! Inbound audio is queued in arrival order. Playback begins once the queued
//! duration reaches the prebuffer threshold, or when the prebuffer timer armed
//! by the first enqueue elapses. From then on a periodic tick keeps up to the
//! scheduling horizon of audio placed back to back on the sink's clock.
//!
//! Marks never advance the clock. Each mark arms a timer for the clock position
//! it sits at and is acknowledged to the agent when that timer fires, or
//! immediately on `clear`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{PlaybackSink, ScheduledBuffer};
use crate::core::base::{Mark, QueuedAudioItem};
use crate::core::listeners::{EventKind, Listeners};
use crate::core::outbound::OutboundChannel;
use crate::core::stats::StatsMonitor;

/// Timing parameters of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Minimum buffered audio before playback starts
    pub prebuffer: Duration,
    /// Period of the scheduling tick
    pub tick_interval: Duration,
    /// Maximum audio placed ahead of the clock
    pub horizon: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prebuffer: Duration::from_millis(250),
            tick_interval: Duration::from_millis(50),
            horizon: Duration::from_secs(1),
        }
    }
}

enum Effect {
    Started,
    Stopped,
}

struct ActiveBuffer {
    completion: JoinHandle<()>,
}

struct PendingMark {
    mark: Mark,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<QueuedAudioItem>,
    active: HashMap<u64, ActiveBuffer>,
    /// Armed mark timers keyed by arming order
    mark_timers: BTreeMap<u64, PendingMark>,
    next_playback_time: f64,
    running: bool,
    playing: bool,
    /// Bumped by every clear; completions and timers from older generations are ignored
    generation: u64,
    tick_epoch: u64,
    next_buffer_id: u64,
    next_mark_seq: u64,
    prebuffer: Option<JoinHandle<()>>,
}

struct Shared {
    sink: Arc<dyn PlaybackSink>,
    outbound: OutboundChannel,
    listeners: Arc<Listeners>,
    stats: Arc<StatsMonitor>,
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    /// Serializes mark acknowledgments so they leave in arming order
    ack_lock: tokio::sync::Mutex<()>,
}

/// FIFO playback queue driving a [`PlaybackSink`].
#[derive(Clone)]
pub struct PlaybackScheduler {
    shared: Arc<Shared>,
}

impl PlaybackScheduler {
    pub fn new(
        sink: Arc<dyn PlaybackSink>,
        outbound: OutboundChannel,
        listeners: Arc<Listeners>,
        stats: Arc<StatsMonitor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                outbound,
                listeners,
                stats,
                config,
                state: Mutex::new(SchedulerState::default()),
                ack_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> SchedulerConfig {
        self.shared.config
    }

    /// True between the first scheduled buffer and the end of the last one.
    pub fn is_playing(&self) -> bool {
        self.shared.state.lock().playing
    }

    /// Items waiting in the queue, marks included.
    pub fn queued_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Duration of audio waiting in the queue.
    pub fn buffered_secs(&self) -> f64 {
        self.shared
            .state
            .lock()
            .queue
            .iter()
            .map(QueuedAudioItem::duration_secs)
            .sum()
    }

    /// Append an item and schedule as much as the current state allows.
    pub async fn enqueue(&self, item: QueuedAudioItem) {
        let effects = self.shared.enqueue(item);
        self.shared.apply(effects).await;
    }

    /// Acknowledge every pending mark in order, then discard all queued and
    /// scheduled audio. Returns the number of marks acknowledged.
    pub async fn clear(&self) -> usize {
        self.shared.reset(true).await
    }

    /// Discard all queued and scheduled audio without acknowledging marks.
    pub async fn flush(&self) {
        self.shared.reset(false).await;
    }
}

impl std::fmt::Debug for PlaybackScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PlaybackScheduler")
            .field("queued", &state.queue.len())
            .field("active", &state.active.len())
            .field("pending_marks", &state.mark_timers.len())
            .field("playing", &state.playing)
            .finish()
    }
}

impl Shared {
    fn enqueue(self: &Arc<Self>, item: QueuedAudioItem) -> Vec<Effect> {
        let mut state = self.state.lock();
        state.queue.push_back(item);

        if state.running {
            return self.schedule_pass(&mut state);
        }

        // Marks with no audio ahead of them have nothing to wait for
        let marks_only = state.queue.iter().all(QueuedAudioItem::is_mark);
        let buffered: f64 = state.queue.iter().map(QueuedAudioItem::duration_secs).sum();
        if marks_only || buffered >= self.config.prebuffer.as_secs_f64() {
            if let Some(timer) = state.prebuffer.take() {
                timer.abort();
            }
            return self.start(&mut state);
        }

        if state.prebuffer.is_none() {
            let shared = Arc::clone(self);
            let generation = state.generation;
            let delay = self.config.prebuffer;
            state.prebuffer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let effects = shared.prebuffer_elapsed(generation);
                shared.apply(effects).await;
            }));
        }

        Vec::new()
    }

    fn prebuffer_elapsed(self: &Arc<Self>, generation: u64) -> Vec<Effect> {
        let mut state = self.state.lock();
        if state.generation != generation || state.running {
            return Vec::new();
        }
        state.prebuffer = None;
        if state.queue.is_empty() {
            return Vec::new();
        }
        self.start(&mut state)
    }

    fn start(self: &Arc<Self>, state: &mut SchedulerState) -> Vec<Effect> {
        state.running = true;
        state.tick_epoch += 1;
        let now = self.sink.current_time();
        state.next_playback_time = state.next_playback_time.max(now);

        let shared = Arc::clone(self);
        let epoch = state.tick_epoch;
        let period = self.config.tick_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(effects) = shared.tick(epoch) else {
                    break;
                };
                shared.apply(effects).await;
            }
        });

        tracing::debug!(
            "Playback scheduling started at {:.3}s with {} queued items",
            state.next_playback_time,
            state.queue.len()
        );
        self.schedule_pass(state)
    }

    fn tick(self: &Arc<Self>, epoch: u64) -> Option<Vec<Effect>> {
        let mut state = self.state.lock();
        if !state.running || state.tick_epoch != epoch {
            return None;
        }
        Some(self.schedule_pass(&mut state))
    }

    fn schedule_pass(self: &Arc<Self>, state: &mut SchedulerState) -> Vec<Effect> {
        let mut effects = Vec::new();
        let now = self.sink.current_time();
        if state.next_playback_time < now {
            state.next_playback_time = now;
        }
        let horizon = self.config.horizon.as_secs_f64();

        while state.next_playback_time - now < horizon {
            let Some(item) = state.queue.pop_front() else {
                break;
            };

            if item.samples.is_empty() {
                if let Some(mark) = item.mark {
                    let at = state.next_playback_time;
                    self.arm_mark(state, mark, at);
                }
                continue;
            }

            state.next_buffer_id += 1;
            let buffer = ScheduledBuffer {
                id: state.next_buffer_id,
                samples: item.samples.clone(),
                sample_rate: item.sample_rate,
                start_time: state.next_playback_time,
            };
            let id = buffer.id;
            let start_time = buffer.start_time;
            let end_time = buffer.end_time();

            if let Err(e) = self.sink.schedule(buffer) {
                tracing::warn!("Failed to schedule playback buffer: {}", e);
                continue;
            }
            self.stats
                .analyser()
                .push_playback(start_time, item.samples, item.sample_rate);

            let completion = self.spawn_completion(id, state.generation, end_time);
            state.active.insert(id, ActiveBuffer { completion });
            state.next_playback_time = end_time;

            if let Some(mark) = item.mark {
                self.arm_mark(state, mark, end_time);
            }

            if !state.playing {
                state.playing = true;
                effects.push(Effect::Started);
            }
        }

        if state.active.is_empty() && state.queue.is_empty() {
            state.running = false;
            if state.playing {
                state.playing = false;
                effects.push(Effect::Stopped);
            }
        }

        effects
    }

    fn spawn_completion(self: &Arc<Self>, id: u64, generation: u64, end_time: f64) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let delay = (end_time - shared.sink.current_time()).max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            let effects = shared.buffer_ended(id, generation);
            shared.apply(effects).await;
        })
    }

    fn buffer_ended(self: &Arc<Self>, id: u64, generation: u64) -> Vec<Effect> {
        let mut state = self.state.lock();
        if state.generation != generation || state.active.remove(&id).is_none() {
            return Vec::new();
        }
        if !state.running {
            return Vec::new();
        }
        self.schedule_pass(&mut state)
    }

    fn arm_mark(self: &Arc<Self>, state: &mut SchedulerState, mark: Mark, at: f64) {
        state.next_mark_seq += 1;
        let seq = state.next_mark_seq;
        let generation = state.generation;
        let delay = (at - self.sink.current_time()).max(0.0);

        let shared = Arc::clone(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            let _order = shared.ack_lock.lock().await;
            let due = shared.take_due_marks(seq, generation);
            for mark in due {
                shared.send_ack(mark).await;
            }
        });
        state.mark_timers.insert(seq, PendingMark { mark, timer });
    }

    /// Remove every mark armed at or before `seq`; earlier marks are due no later.
    fn take_due_marks(&self, seq: u64, generation: u64) -> Vec<Mark> {
        let mut state = self.state.lock();
        if state.generation != generation {
            return Vec::new();
        }
        let later = state.mark_timers.split_off(&(seq + 1));
        let due = std::mem::replace(&mut state.mark_timers, later);
        due.into_values().map(|pending| pending.mark).collect()
    }

    async fn send_ack(&self, mark: Mark) {
        let name = mark.name.clone();
        if let Err(e) = self.outbound.send_mark(mark).await {
            tracing::debug!("Dropping mark acknowledgment {}: {}", name, e);
        }
    }

    async fn reset(self: &Arc<Self>, acknowledge: bool) -> usize {
        let _order = self.ack_lock.lock().await;

        let (marks, buffer_ids, was_playing) = {
            let mut state = self.state.lock();
            let mut marks = Vec::new();

            for pending in std::mem::take(&mut state.mark_timers).into_values() {
                pending.timer.abort();
                if acknowledge {
                    marks.push(pending.mark);
                }
            }
            if acknowledge {
                marks.extend(state.queue.iter().filter_map(|item| item.mark.clone()));
            }
            state.queue.clear();

            let buffer_ids: Vec<u64> = state
                .active
                .drain()
                .map(|(id, active)| {
                    active.completion.abort();
                    id
                })
                .collect();

            if let Some(timer) = state.prebuffer.take() {
                timer.abort();
            }

            state.generation += 1;
            state.running = false;
            state.next_playback_time = 0.0;
            let was_playing = std::mem::replace(&mut state.playing, false);

            (marks, buffer_ids, was_playing)
        };

        for id in &buffer_ids {
            self.sink.stop(*id);
        }
        self.stats.analyser().clear_playback();

        let acknowledged = marks.len();
        for mark in marks {
            self.send_ack(mark).await;
        }

        tracing::debug!(
            "Playback queue {} ({} buffers stopped, {} marks acknowledged)",
            if acknowledge { "cleared" } else { "flushed" },
            buffer_ids.len(),
            acknowledged
        );

        if was_playing {
            self.apply(vec![Effect::Stopped]).await;
        }
        acknowledged
    }

    async fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Started => {
                    tracing::info!("Playback started");
                    self.stats.set_playing(true);
                    self.listeners.emit(EventKind::PlaybackStart).await;
                }
                Effect::Stopped => {
                    tracing::info!("Playback stopped");
                    self.stats.set_playing(false);
                    self.listeners.emit(EventKind::PlaybackStop).await;
                }
            }
        }
    }
}
