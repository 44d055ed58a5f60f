use std::sync::Arc;
use std::task::{Poll, Waker};

use parking_lot::Mutex;

/// A load in progress for one key, shared by the task running it and every task waiting on it.
pub struct Flight<E> {
    state: Mutex<FlightState<E>>,
}

struct FlightState<E> {
    landing: Option<Landing<E>>,
    // wakers to notify when the flight lands
    wakers: Vec<Waker>,
}

/// How a flight ended.
pub enum Landing<E> {
    /// The value is in the table.
    Loaded,
    /// The loader failed, every waiter sees the same error.
    Failed(Arc<E>),
    /// The loading task was dropped before it finished, a waiter has to take over.
    Abandoned,
}

impl<E> Clone for Landing<E> {
    fn clone(&self) -> Self {
        match self {
            Landing::Loaded => Landing::Loaded,
            Landing::Failed(err) => Landing::Failed(Arc::clone(err)),
            Landing::Abandoned => Landing::Abandoned,
        }
    }
}

impl<E> Flight<E> {
    pub(crate) fn start() -> Arc<Self> {
        Arc::new(Flight {
            state: Mutex::new(FlightState {
                landing: None,
                wakers: Vec::new(),
            }),
        })
    }

    pub(crate) fn poll_landing(&self, waker: &Waker) -> Poll<Landing<E>> {
        let mut state = self.state.lock();

        match &state.landing {
            Some(landing) => Poll::Ready(landing.clone()),
            None => {
                if !state.wakers.iter().any(|w| w.will_wake(waker)) {
                    state.wakers.push(waker.clone());
                }

                Poll::Pending
            }
        }
    }

    /// Only the first landing counts, later calls are ignored.
    pub(crate) fn land(&self, landing: Landing<E>) {
        let wakers = {
            let mut state = self.state.lock();
            if state.landing.is_some() {
                return;
            }

            state.landing = Some(landing);
            std::mem::take(&mut state.wakers)
        };

        for waker in wakers {
            waker.wake();
        }
    }
}
