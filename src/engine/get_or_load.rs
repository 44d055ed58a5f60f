use std::future::Future;
use std::hash::BuildHasher;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::ready;
use std::task::Context;
use std::task::Poll;

use pin_project::pinned_drop;
use tokio::time::Instant;

use super::flight::{Flight, Landing};
use super::StorageEngine;
use crate::entry::CacheEntry;

/// Resolves a key through the engine, loading it if no live entry exists.
///
/// Only one task loads a given key at a time, the others wait for that load and observe its outcome.
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project::pin_project(project = GetOrLoadProj, PinnedDrop)]
pub enum GetOrLoad<'a, K, V, E, S, F, Fut>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    Lookup {
        engine: &'a StorageEngine<K, V, E, S>,
        key: K,
        init: Option<F>,
    },
    Waiting {
        engine: &'a StorageEngine<K, V, E, S>,
        key: K,
        init: Option<F>,
        flight: Arc<Flight<E>>,
    },
    Loading {
        engine: &'a StorageEngine<K, V, E, S>,
        key: K,
        flight: Arc<Flight<E>>,
        #[pin]
        fut: Fut,
    },
    Done,
}

#[pinned_drop]
impl<'a, K, V, E, S, F, Fut> PinnedDrop for GetOrLoad<'a, K, V, E, S, F, Fut>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
{
    fn drop(self: Pin<&mut Self>) {
        // if the loader is dropped mid flight (panic or cancellation) hand the key over to the waiters.
        // on the happy path the flight has already landed and this is a no-op
        if let GetOrLoadProj::Loading {
            engine,
            key,
            flight,
            ..
        } = self.project()
        {
            let (_, shard) = engine.shard(key);
            shard.end_flight(key, flight);

            flight.land(Landing::Abandoned);
        }
    }
}

impl<'a, K, V, E, S, F, Fut> Future for GetOrLoad<'a, K, V, E, S, F, Fut>
where
    K: Eq + Hash + Clone,
    S: BuildHasher,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<V>, E>>,
{
    type Output = Result<Arc<CacheEntry<V>>, Arc<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        loop {
            match self.as_mut().project() {
                GetOrLoadProj::Lookup { engine, key, init } => {
                    let engine = *engine;
                    let (hash, shard) = engine.shard(key);
                    let now = Instant::now();

                    // do an initial read without the flights lock so hits dont serialize
                    if let Some(entry) = shard.get_live(key, hash, now) {
                        entry.touch(now);
                        return Poll::Ready(Ok(entry));
                    }

                    let (flight, leads) = {
                        let mut flights = shard.flights.lock();

                        // the value may have landed between the read and taking the lock
                        if let Some(entry) = shard.get_live(key, hash, now) {
                            entry.touch(now);
                            return Poll::Ready(Ok(entry));
                        }

                        match flights.get(&*key) {
                            Some(flight) => (Arc::clone(flight), false),
                            None => {
                                let flight = Flight::start();
                                flights.insert(key.clone(), Arc::clone(&flight));

                                (flight, true)
                            }
                        }
                    };

                    // we dont call `init` until the lock is dropped as it could panic
                    let next = if leads {
                        GetOrLoad::Loading {
                            engine,
                            key: key.clone(),
                            flight,
                            fut: init.take().expect("init is none")(),
                        }
                    } else {
                        GetOrLoad::Waiting {
                            engine,
                            key: key.clone(),
                            init: init.take(),
                            flight,
                        }
                    };

                    self.set(next);
                }
                GetOrLoadProj::Waiting {
                    engine,
                    key,
                    init,
                    flight,
                } => match flight.poll_landing(cx.waker()) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Landing::Failed(err)) => {
                        self.set(GetOrLoad::Done);
                        return Poll::Ready(Err(err));
                    }
                    // either the value is in the table now, or nobody is loading it anymore.
                    // if it was removed in the meantime we just see the empty slot and go again
                    Poll::Ready(Landing::Loaded | Landing::Abandoned) => {
                        let next = GetOrLoad::Lookup {
                            engine: *engine,
                            key: key.clone(),
                            init: init.take(),
                        };

                        self.set(next);
                    }
                },
                GetOrLoadProj::Loading {
                    engine,
                    key,
                    flight,
                    fut,
                } => {
                    let result = ready!(fut.poll(cx));

                    let engine = *engine;
                    let key = key.clone();
                    let flight = Arc::clone(flight);
                    let (hash, shard) = engine.shard(&key);

                    let output = match result {
                        Ok(value) => {
                            let entry = Arc::new(CacheEntry::new(
                                value,
                                Instant::now(),
                                engine.time_to_live,
                            ));

                            // publish the value before retiring the flight so no task can miss both
                            {
                                let mut flights = shard.flights.lock();
                                shard.insert(key.clone(), Arc::clone(&entry), hash, &engine.build_hasher);

                                if flights.get(&key).is_some_and(|f| Arc::ptr_eq(f, &flight)) {
                                    flights.remove(&key);
                                }
                            }

                            flight.land(Landing::Loaded);
                            engine.track(key, entry.expires());

                            Ok(entry)
                        }
                        Err(err) => {
                            let err = Arc::new(err);

                            shard.end_flight(&key, &flight);
                            flight.land(Landing::Failed(Arc::clone(&err)));

                            Err(err)
                        }
                    };

                    self.set(GetOrLoad::Done);
                    return Poll::Ready(output);
                }
                GetOrLoadProj::Done => panic!("GetOrLoad polled after completion"),
            }
        }
    }
}
