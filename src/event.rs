use std::time::Duration;
use swcache::worker::CoreMessage;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Host events
#[derive(Debug)]
pub enum Event {
  /// Periodic tick driving reconciliation
  Tick,
  /// Message the core broadcast to this host's client connection
  Core(CoreMessage),
  /// Ctrl-C
  Shutdown,
}

/// Event handler that merges the reconcile timer, core broadcasts and Ctrl-C
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler. The first tick fires after one full period.
  pub fn new(tick_rate: Duration, mut core_rx: mpsc::UnboundedReceiver<CoreMessage>) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn reconcile timer
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      interval.tick().await;
      loop {
        interval.tick().await;
        if tick_tx.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    // Forward core broadcasts
    let core_tx = tx.clone();
    tokio::spawn(async move {
      while let Some(message) = core_rx.recv().await {
        if core_tx.send(Event::Core(message)).is_err() {
          break;
        }
      }
    });

    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
