use std::{collections::HashMap, future::Future};

use tokio::{sync::Mutex, task::JoinHandle};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Poll,
    TypingStatus,
    TypingIdle,
    Roster,
    /// The signal channel supervisor; its backoff sleep is the reconnect timer.
    Reconnect,
}

impl TimerKey {
    const CONVERSATION_SCOPED: [TimerKey; 3] =
        [TimerKey::Poll, TimerKey::TypingStatus, TimerKey::TypingIdle];
}

/// One owning task per purpose. Replacing or clearing a key aborts the task,
/// so a late tick can never act on a conversation that is no longer active.
#[derive(Default)]
pub struct TimerRegistry {
    handles: Mutex<HashMap<TimerKey, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn spawn<F>(&self, key: TimerKey, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut handles = self.handles.lock().await;
        if let Some(previous) = handles.insert(key, tokio::spawn(task)) {
            previous.abort();
        }
    }

    pub async fn cancel(&self, key: TimerKey) -> bool {
        match self.handles.lock().await.remove(&key) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, key: TimerKey) -> bool {
        self.handles
            .lock()
            .await
            .get(&key)
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn clear_conversation(&self) {
        let mut handles = self.handles.lock().await;
        for key in TimerKey::CONVERSATION_SCOPED {
            if let Some(handle) = handles.remove(&key) {
                handle.abort();
            }
        }
        debug!("timers: conversation timers cleared");
    }

    pub async fn clear_all(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.abort();
        }
        debug!("timers: all timers cleared");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn registering_a_key_aborts_the_previous_holder() {
        let timers = TimerRegistry::new();
        timers
            .spawn(TimerKey::Poll, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        let first = timers
            .handles
            .lock()
            .await
            .get(&TimerKey::Poll)
            .map(|handle| handle.abort_handle())
            .expect("first handle");

        timers
            .spawn(TimerKey::Poll, async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(first.is_finished());
        assert!(timers.is_active(TimerKey::Poll).await);
    }

    #[tokio::test]
    async fn conversation_clear_keeps_session_timers() {
        let timers = TimerRegistry::new();
        for key in [
            TimerKey::Poll,
            TimerKey::TypingStatus,
            TimerKey::TypingIdle,
            TimerKey::Roster,
            TimerKey::Reconnect,
        ] {
            timers
                .spawn(key, async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                })
                .await;
        }

        timers.clear_conversation().await;
        assert!(!timers.is_active(TimerKey::Poll).await);
        assert!(!timers.is_active(TimerKey::TypingStatus).await);
        assert!(!timers.is_active(TimerKey::TypingIdle).await);
        assert!(timers.is_active(TimerKey::Roster).await);
        assert!(timers.is_active(TimerKey::Reconnect).await);

        timers.clear_all().await;
        assert!(!timers.is_active(TimerKey::Roster).await);
        assert!(!timers.is_active(TimerKey::Reconnect).await);
    }
}
