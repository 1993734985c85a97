use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Cooperative pause/cancel handle shared between a running task and its caller.
///
/// Pause is observed at batch boundaries, cancel before every record.
/// Cancel is sticky: once set, neither `pause` nor `resume` clears it.
#[derive(Debug, Clone)]
pub struct TaskControl {
    tx: Arc<watch::Sender<ControlSignal>>,
}

impl Default for TaskControl {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self { tx: Arc::new(tx) }
    }

    pub fn signal(&self) -> ControlSignal {
        *self.tx.borrow()
    }

    pub fn pause(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Run {
                *signal = ControlSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.tx.send_if_modified(|signal| {
            if *signal == ControlSignal::Pause {
                *signal = ControlSignal::Run;
                true
            } else {
                false
            }
        });
    }

    pub fn cancel(&self) {
        self.tx.send_replace(ControlSignal::Cancel);
    }

    pub fn is_paused(&self) -> bool {
        self.signal() == ControlSignal::Pause
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal() == ControlSignal::Cancel
    }

    /// Block until the signal leaves `Pause`. Returns `Run` or `Cancel`.
    pub(crate) async fn wait_while_paused(&self) -> ControlSignal {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|signal| *signal != ControlSignal::Pause).await {
            Ok(signal) => *signal,
            Err(_) => ControlSignal::Cancel,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_is_sticky() {
        let control = TaskControl::new();
        control.pause();
        assert!(control.is_paused());
        control.cancel();
        control.resume();
        control.pause();
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn wait_returns_when_resumed() {
        let control = TaskControl::new();
        control.pause();
        let remote = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            remote.resume();
        });
        assert_eq!(control.wait_while_paused().await, ControlSignal::Run);
    }

    #[tokio::test]
    async fn wait_returns_when_cancelled() {
        let control = TaskControl::new();
        control.pause();
        let remote = control.clone();
        tokio::spawn(async move {
            remote.cancel();
        });
        assert_eq!(control.wait_while_paused().await, ControlSignal::Cancel);
    }
}
