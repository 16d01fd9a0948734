use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

pub type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type TimerCallback = Arc<dyn Fn() -> TimerFuture + Send + Sync>;

struct TimerState {
    aborted: bool,
    /// incremented on every (re-)arm so a sleeping task can tell that it was superseded
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A one-shot timer that can be re-armed, canceled and permanently aborted.
///
/// The callback may re-arm the timer. Once the timer fires, the pending handle is cleared
///  *before* the callback runs, so neither re-arming from inside the callback nor a concurrent
///  `cancel` / `abort` interrupts a callback that is already running. After `abort`, all
///  further arming is ignored.
pub struct InterruptibleTimer {
    name: &'static str,
    default_interval: Duration,
    callback: TimerCallback,
    state: Arc<Mutex<TimerState>>,
}

impl InterruptibleTimer {
    pub fn new(name: &'static str, default_interval: Duration, callback: TimerCallback) -> InterruptibleTimer {
        InterruptibleTimer {
            name,
            default_interval,
            callback,
            state: Arc::new(Mutex::new(TimerState {
                aborted: false,
                generation: 0,
                handle: None,
            })),
        }
    }

    /// (re-)arms the timer with its default interval
    pub fn set(&self) {
        self.set_interval(self.default_interval);
    }

    pub fn set_interval(&self, interval: Duration) {
        self.arm(interval, true);
    }

    /// arms the timer unless it is already pending
    pub fn set_if_not_set(&self, interval: Duration) {
        self.arm(interval, false);
    }

    fn arm(&self, interval: Duration, replace: bool) {
        let mut state = self.state.lock();
        if state.aborted {
            return;
        }
        if state.handle.is_some() && !replace {
            return;
        }
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let timer_state = self.state.clone();
        let callback = self.callback.clone();
        let name = self.name;

        trace!("arming {} timer for {:?}", name, interval);
        state.handle = Some(tokio::spawn(async move {
            time::sleep(interval).await;
            {
                let mut state = timer_state.lock();
                if state.aborted || state.generation != generation {
                    return;
                }
                state.handle = None;
            }
            trace!("{} timer elapsed", name);
            callback().await;
        }));
    }

    /// Returns true if a pending expiry was canceled
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match state.handle.take() {
            Some(handle) => {
                handle.abort();
                state.generation += 1;
                true
            }
            None => false,
        }
    }

    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().handle.is_some()
    }
}

impl Drop for InterruptibleTimer {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_timer(interval: Duration) -> (Arc<InterruptibleTimer>, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let cb_counter = counter.clone();
        let timer = InterruptibleTimer::new("test", interval, Arc::new(move || -> TimerFuture {
            let counter = cb_counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));
        (Arc::new(timer), counter)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let (timer, counter) = counting_timer(Duration::from_secs(2));
        timer.set();
        assert!(timer.is_pending());

        time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!timer.is_pending());

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_postpones() {
        let (timer, counter) = counting_timer(Duration::from_secs(2));
        timer.set();
        time::sleep(Duration::from_secs(1)).await;
        timer.set();
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_not_set_keeps_pending_expiry() {
        let (timer, counter) = counting_timer(Duration::from_secs(2));
        timer.set();
        time::sleep(Duration::from_secs(1)).await;
        timer.set_if_not_set(Duration::from_secs(5));
        time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_abort() {
        let (timer, counter) = counting_timer(Duration::from_secs(1));
        assert!(!timer.cancel());
        timer.set();
        assert!(timer.cancel());
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        timer.abort();
        timer.set();
        assert!(!timer.is_pending());
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_rearms_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let timer_slot: Arc<Mutex<Option<Arc<InterruptibleTimer>>>> = Default::default();

        let cb_counter = counter.clone();
        let cb_slot = timer_slot.clone();
        let timer = Arc::new(InterruptibleTimer::new("rearm", Duration::from_secs(1), Arc::new(move || -> TimerFuture {
            let counter = cb_counter.clone();
            let slot = cb_slot.clone();
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    if let Some(timer) = slot.lock().as_ref() {
                        timer.set();
                    }
                }
            })
        })));
        *timer_slot.lock() = Some(timer.clone());

        timer.set();
        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        // break the reference cycle
        timer_slot.lock().take();
    }
}
