//! The event pipeline: bounded ingress, a single aggregator deduplicating by
//! hash tag, a tick-driven collector and parallel HTTP reporter workers.
//!
//! ```text
//! send_event -> [event channel] -> aggregator -> [collected channel] -> reporters -> HTTP
//!                                      |
//!                            map keyed by hash tag
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use super::event::{AccessMode, EventError, HashTagEvent};
use crate::config::EventServiceSection;
use crate::metrics::Metrics;

pub struct EventService {
  config: EventServiceSection,
  agg_interval: Duration,
  drain_duration: Duration,
  request_max_wait: Duration,
  event_tx: mpsc::Sender<HashTagEvent>,
  event_rx: AsyncMutex<Option<mpsc::Receiver<HashTagEvent>>>,
  collected_tx: mpsc::Sender<HashTagEvent>,
  collected_rx: AsyncMutex<mpsc::Receiver<HashTagEvent>>,
  events: Mutex<HashMap<String, HashTagEvent>>,
  client: reqwest::Client,
  metrics: Arc<Metrics>,
  stopped: AtomicBool,
  stop_tx: watch::Sender<bool>,
  handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EventService {
  pub fn new(config: EventServiceSection, metrics: Arc<Metrics>) -> Result<Arc<Self>, EventError> {
    if config.event_report.url.is_empty() {
      return Err(EventError::Client(
        "event_report.url is empty".to_string(),
      ));
    }
    let report = &config.event_report;
    let client = reqwest::Client::builder()
      .timeout(Duration::from_millis(report.request_timeout_ms))
      .pool_max_idle_per_host(report.request_max_conn)
      .pool_idle_timeout(Duration::from_millis(report.request_idle_conn_timeout_ms))
      .tcp_keepalive(Duration::from_millis(
        report.request_conn_keep_alive_interval_ms,
      ))
      .build()
      .map_err(|e| EventError::Client(e.to_string()))?;

    let (event_tx, event_rx) = mpsc::channel(config.buffer_limit);
    let (collected_tx, collected_rx) = mpsc::channel(config.buffer_limit);
    let (stop_tx, _) = watch::channel(false);

    tracing::info!(
      buffer_limit = config.buffer_limit,
      agg_interval_ms = config.agg_interval_ms,
      worker_count = report.request_worker_count,
      url = %report.url,
      "new event service"
    );

    Ok(Arc::new(Self {
      agg_interval: Duration::from_millis(config.agg_interval_ms),
      drain_duration: Duration::from_millis(config.drain_duration_ms),
      request_max_wait: Duration::from_millis(report.request_max_wait_duration_ms),
      config,
      event_tx,
      event_rx: AsyncMutex::new(Some(event_rx)),
      collected_tx,
      collected_rx: AsyncMutex::new(collected_rx),
      events: Mutex::new(HashMap::new()),
      client,
      metrics,
      stopped: AtomicBool::new(false),
      stop_tx,
      handles: Mutex::new(Vec::new()),
    }))
  }

  /// Spawn the aggregator, the collector and the reporter workers.
  pub fn start(self: &Arc<Self>) {
    let mut handles = self.handles.lock();
    handles.push(tokio::spawn(self.clone().run_aggregator()));
    handles.push(tokio::spawn(self.clone().run_collector()));
    for _ in 0..self.config.event_report.request_worker_count {
      handles.push(tokio::spawn(self.clone().run_reporter()));
    }
  }

  /// Construct, validate and enqueue one event. Never blocks the caller:
  /// with the buffer at capacity the event is dropped and an error returned.
  pub fn send_event(
    &self,
    hash_tag: &str,
    keys: &[String],
    access_mode: AccessMode,
    access_time: DateTime<Utc>,
  ) -> Result<(), EventError> {
    let event = HashTagEvent::from_keys(hash_tag, keys, access_mode, access_time)?;
    if self.stopped.load(Ordering::SeqCst) {
      return Err(EventError::Stopped);
    }
    match self.event_tx.try_send(event) {
      Ok(()) => Ok(()),
      Err(mpsc::error::TrySendError::Full(event)) => {
        tracing::warn!(event = %event, "event buffer is full, event discarded");
        Err(EventError::BufferFull {
          limit: self.config.buffer_limit,
        })
      }
      Err(mpsc::error::TrySendError::Closed(_)) => Err(EventError::Stopped),
    }
  }

  /// Merge one event into the aggregation window.
  fn aggregate_event(&self, event: HashTagEvent) {
    let mut events = self.events.lock();
    match events.get_mut(event.hash_tag()) {
      Some(saved) => saved.merge(event),
      None => {
        events.insert(event.hash_tag().to_string(), event);
      }
    }
  }

  /// Atomically drain the aggregation window; a fresh window starts empty.
  fn collect_window(&self) -> Vec<HashTagEvent> {
    let mut events = self.events.lock();
    std::mem::take(&mut *events).into_values().collect()
  }

  async fn run_aggregator(self: Arc<Self>) {
    let mut stop_rx = self.stop_tx.subscribe();
    let Some(mut rx) = self.event_rx.lock().await.take() else {
      return;
    };
    loop {
      tokio::select! {
        _ = stop_rx.changed() => break,
        event = rx.recv() => match event {
          Some(event) => self.aggregate_event(event),
          None => break,
        }
      }
    }
    // Hand the receiver back for the shutdown drain.
    *self.event_rx.lock().await = Some(rx);
  }

  async fn run_collector(self: Arc<Self>) {
    let mut stop_rx = self.stop_tx.subscribe();
    let start = tokio::time::Instant::now() + self.agg_interval;
    let mut ticker = tokio::time::interval_at(start, self.agg_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      tokio::select! {
        _ = stop_rx.changed() => break,
        _ = ticker.tick() => {
          for event in self.collect_window() {
            if self.collected_tx.send(event).await.is_err() {
              return;
            }
          }
        }
      }
    }
  }

  async fn run_reporter(self: Arc<Self>) {
    let mut stop_rx = self.stop_tx.subscribe();
    let max_event = self.config.event_report.request_max_event;
    let mut stopped = false;
    while !stopped {
      let mut events: Vec<HashTagEvent> = Vec::with_capacity(max_event);
      let deadline = tokio::time::Instant::now() + self.request_max_wait;
      loop {
        let mut rx = self.collected_rx.lock().await;
        tokio::select! {
          _ = stop_rx.changed() => {
            stopped = true;
            break;
          }
          _ = tokio::time::sleep_until(deadline) => break,
          event = rx.recv() => match event {
            Some(event) => {
              events.push(event);
              if events.len() >= max_event {
                break;
              }
            }
            None => {
              stopped = true;
              break;
            }
          }
        }
      }
      if let Err(e) = self.report_events(&events).await {
        self.record_report_error(&events, &e);
      }
    }
  }

  /// POST one micro-batch to the report endpoint. Only HTTP 200 counts as
  /// success; the batch is the caller's to drop on failure.
  async fn report_events(&self, events: &[HashTagEvent]) -> Result<(), EventError> {
    if events.is_empty() {
      return Ok(());
    }
    let body = serde_json::json!({ "events": events });
    let response = self
      .client
      .post(&self.config.event_report.url)
      .json(&body)
      .send()
      .await
      .map_err(|e| EventError::Transport(e.to_string()))?;

    let status = response.status();
    if status.as_u16() != 200 {
      let body = response.text().await.unwrap_or_default();
      return Err(EventError::BadStatus {
        code: status.as_u16(),
        body,
      });
    }
    Ok(())
  }

  fn record_report_error(&self, events: &[HashTagEvent], err: &EventError) {
    let events_str: Vec<String> = events.iter().map(|e| e.to_string()).collect();
    tracing::error!(
      events = %events_str.join(" "),
      event_count = events.len(),
      error = %err,
      "report events failed, batch dropped"
    );
    self.metrics.incr(&self.metrics.report_events_errors);
  }

  /// Idempotent shutdown: stop the workers, drain the buffers back through
  /// the aggregation map, then flush the residual map over HTTP. Drain
  /// errors are recorded but never block exit.
  pub async fn stop(&self) {
    if self
      .stopped
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return;
    }
    let _ = self.stop_tx.send(true);
    let handles = {
      let mut guard = self.handles.lock();
      std::mem::take(&mut *guard)
    };
    for handle in handles {
      let _ = handle.await;
    }
    if let Err(e) = self.drain_events().await {
      tracing::error!(error = %e, "drain events failed");
      self.metrics.incr(&self.metrics.drain_event_errors);
    }
  }

  async fn drain_events(&self) -> Result<(), EventError> {
    let deadline = std::time::Instant::now() + self.drain_duration;

    let mut drain_result = {
      let mut rx = self.collected_rx.lock().await;
      self.drain_channel(&mut rx, deadline)
    };
    if drain_result.is_ok() {
      let mut guard = self.event_rx.lock().await;
      if let Some(rx) = guard.as_mut() {
        drain_result = self.drain_channel(rx, deadline);
      }
    }

    // Best-effort flush of whatever made it into the map, even after a
    // drain timeout.
    let events = self.collect_window();
    for chunk in events.chunks(self.config.event_report.request_max_event) {
      if let Err(e) = self.report_events(chunk).await {
        self.record_report_error(chunk, &e);
      }
    }
    drain_result
  }

  /// Pull buffered events back into the aggregation map so dedup still
  /// applies, bounded by the shared drain deadline.
  fn drain_channel(
    &self,
    rx: &mut mpsc::Receiver<HashTagEvent>,
    deadline: std::time::Instant,
  ) -> Result<(), EventError> {
    loop {
      if std::time::Instant::now() >= deadline {
        return Err(EventError::DrainTimeout);
      }
      match rx.try_recv() {
        Ok(event) => self.aggregate_event(event),
        Err(_) => return Ok(()),
      }
    }
  }
}
