//! A single broadcast primitive (§4.6), used uniformly for data-change
//! notification and for the engine's transition/processed/handled event
//! feeds (§4.7). Per the REDESIGN FLAGS in the spec ("per-state lazy
//! subjects and subscription replay"), every other part of the engine is
//! built on top of this one type rather than rolling its own ad hoc
//! subscriber bookkeeping.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::error::GearboxError;

#[derive(Clone)]
enum Slot<T> {
    Empty,
    Value(T),
    Error(Arc<GearboxError>),
    Closed,
}

/// A broadcast stream with synchronous access to the most recently produced
/// value or error. New subscribers immediately observe whatever is currently
/// held (replay semantics), without waiting for the next emission.
#[derive(Clone)]
pub struct ValueStream<T> {
    rx: watch::Receiver<Slot<T>>,
}

/// The sending half, held by whatever owns the value being broadcast (the
/// data registry, or the engine for its event feeds).
pub struct ValueSink<T> {
    tx: watch::Sender<Slot<T>>,
}

/// Creates a stream with no value yet (`has_value() == false` until the
/// first `set`/`set_error`).
pub fn channel<T: Clone + Send + Sync + 'static>() -> (ValueSink<T>, ValueStream<T>) {
    let (tx, rx) = watch::channel(Slot::Empty);
    (ValueSink { tx }, ValueStream { rx })
}

/// Creates a stream pre-populated with `initial` (the `initial_value`
/// option in §4.6).
pub fn channel_with<T: Clone + Send + Sync + 'static>(initial: T) -> (ValueSink<T>, ValueStream<T>) {
    let (tx, rx) = watch::channel(Slot::Value(initial));
    (ValueSink { tx }, ValueStream { rx })
}

impl<T: Clone + Send + Sync + 'static> ValueSink<T> {
    pub fn set(&self, value: T) {
        let _ = self.tx.send(Slot::Value(value));
    }

    pub fn set_error(&self, error: GearboxError) {
        let _ = self.tx.send(Slot::Error(Arc::new(error)));
    }

    /// Marks the stream as finished; further reads keep returning the last
    /// value but `subscribe()`s made after this point observe `Closed`.
    pub fn close(&self) {
        let _ = self.tx.send(Slot::Closed);
    }

    pub fn subscribe(&self) -> ValueStream<T> {
        ValueStream { rx: self.tx.subscribe() }
    }
}

impl<T: Clone + Send + Sync + 'static> ValueStream<T> {
    pub fn has_value(&self) -> bool {
        matches!(&*self.rx.borrow(), Slot::Value(_))
    }

    pub fn value(&self) -> Option<T> {
        match &*self.rx.borrow() {
            Slot::Value(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn has_error(&self) -> bool {
        matches!(&*self.rx.borrow(), Slot::Error(_))
    }

    pub fn error(&self) -> Option<Arc<GearboxError>> {
        match &*self.rx.borrow() {
            Slot::Error(e) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(&*self.rx.borrow(), Slot::Closed)
    }

    /// Waits for the next emission (value, error, or close) distinct from
    /// whatever is currently held.
    pub async fn next(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// A lazily-evaluated transform that preserves the synchronous-access
    /// contract: reading the mapped stream re-applies `f` to whatever the
    /// source currently holds, rather than caching a derived value.
    pub fn map<U, F>(self, f: F) -> ValueStream<U>
    where
        U: Clone + Send + Sync + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        let (sink, out) = channel::<U>();
        tokio::spawn(async move {
            let mut rx = self.rx;
            loop {
                let mapped = match &*rx.borrow() {
                    Slot::Empty => None,
                    Slot::Value(v) => Some(Slot::Value(f(v.clone()))),
                    Slot::Error(e) => Some(Slot::Error(e.clone())),
                    Slot::Closed => Some(Slot::Closed),
                };
                if let Some(slot) = mapped {
                    let done = matches!(slot, Slot::Closed);
                    match slot {
                        Slot::Value(v) => sink.set(v),
                        Slot::Error(e) => {
                            let _ = sink.tx.send(Slot::Error(e));
                        }
                        Slot::Closed => sink.close(),
                        Slot::Empty => {}
                    }
                    if done {
                        break;
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        out
    }

    /// Interleaves several streams of the same type; finishes once every
    /// input stream has closed.
    pub fn merge(streams: Vec<ValueStream<T>>) -> ValueStream<T> {
        let (sink, out) = channel::<T>();
        tokio::spawn(async move {
            let remaining = Arc::new(std::sync::atomic::AtomicUsize::new(streams.len()));
            let mut handles = Vec::new();
            for stream in streams {
                let sink = ValueSink { tx: sink.tx.clone() };
                let remaining = remaining.clone();
                let mut rx = stream.rx;
                handles.push(tokio::spawn(async move {
                    loop {
                        match &*rx.borrow() {
                            Slot::Value(v) => sink.set(v.clone()),
                            Slot::Error(e) => {
                                let _ = sink.tx.send(Slot::Error(e.clone()));
                            }
                            Slot::Closed => break,
                            Slot::Empty => {}
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    if remaining.fetch_sub(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                        sink.close();
                    }
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }
        });
        out
    }

    /// Emits a combined snapshot once every input has produced at least one
    /// value; finishes as soon as any single input finishes.
    pub fn combine_latest(streams: Vec<ValueStream<T>>) -> ValueStream<Vec<T>>
    where
        T: 'static,
    {
        let (sink, out) = channel::<Vec<T>>();
        tokio::spawn(async move {
            let mut receivers: Vec<watch::Receiver<Slot<T>>> = streams.into_iter().map(|s| s.rx).collect();
            loop {
                let mut values = Vec::with_capacity(receivers.len());
                let mut all_present = true;
                for rx in &receivers {
                    match &*rx.borrow() {
                        Slot::Value(v) => values.push(v.clone()),
                        _ => {
                            all_present = false;
                            break;
                        }
                    }
                }
                if all_present {
                    sink.set(values);
                }
                let waits: Vec<_> = receivers.iter_mut().map(|rx| Box::pin(rx.changed())).collect();
                let (result, _, _) = futures::future::select_all(waits).await;
                if result.is_err() {
                    sink.close();
                    break;
                }
            }
        });
        out
    }

    /// Adapts this value stream into a [`futures_core::Stream`] of the
    /// distinct values observed from this point on (the "synchronous or
    /// on a microtask-equivalent" replay rule is honored by `WatchStream`
    /// replaying whatever is currently held as the first item).
    pub fn into_stream(self) -> impl futures_core::Stream<Item = T> {
        WatchStream::new(self.rx).filter_map(|slot| match slot {
            Slot::Value(v) => Some(v),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_gives_current_value_to_new_subscriber() {
        let (sink, stream) = channel_with(1u32);
        sink.set(2);
        let other = sink.subscribe();
        assert_eq!(other.value(), Some(2));
        assert_eq!(stream.value(), Some(2));
    }

    #[test]
    fn empty_stream_has_no_value() {
        let (_sink, stream) = channel::<u32>();
        assert!(!stream.has_value());
        assert!(stream.value().is_none());
    }

    #[tokio::test]
    async fn map_preserves_synchronous_access() {
        let (sink, stream) = channel_with(2u32);
        let mapped = stream.map(|v| v * 10);
        tokio::task::yield_now().await;
        assert_eq!(mapped.value(), Some(20));
        sink.set(3);
        // allow the background forwarder to observe the change
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(mapped.value(), Some(30));
    }
}
