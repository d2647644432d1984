use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};

use crate::vdv435::IomMessage;

/// number of workers serving all vehicles.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// per-vehicle queue bound; beyond it, stale GNSS events are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// An inbound bus event addressed to one vehicle, with the topic values the
/// handler needs for its reply.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub topic: String,
    pub data_version: Option<String>,
    pub correlation_id: Option<String>,
    pub message: IomMessage,
}

impl InboundEvent {
    fn is_droppable(&self) -> bool {
        // log-on/log-off events must never be dropped, a stale GNSS sample
        // is superseded by any newer one anyway
        matches!(self.message, IomMessage::GnssPhysicalPositionData(_))
    }
}

#[async_trait]
pub trait VehicleEventHandler: Send + Sync + 'static {
    async fn handle(&self, vehicle_ref: &str, event: InboundEvent);
}

struct VehicleEntry {
    locked: bool,
    queue: VecDeque<InboundEvent>,
}

/// Serializes event handling per vehicle on top of a shared bounded worker
/// pool: one mutex guards the lock and queue maps, at most one handler runs
/// per vehicle at any time, events of one vehicle are handled in FIFO
/// order. A panicking handler releases the vehicle again.
pub struct VehicleDispatcher<H> {
    handler: Arc<H>,
    vehicles: Arc<Mutex<HashMap<String, VehicleEntry>>>,
    pool: Arc<Semaphore>,
    queue_capacity: usize,
    accepting: Arc<AtomicBool>,
}

impl<H> Clone for VehicleDispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            vehicles: self.vehicles.clone(),
            pool: self.pool.clone(),
            queue_capacity: self.queue_capacity,
            accepting: self.accepting.clone(),
        }
    }
}

impl<H> VehicleDispatcher<H>
where
    H: VehicleEventHandler,
{
    pub fn new(handler: H, pool_size: usize, queue_capacity: usize) -> Self {
        Self {
            handler: Arc::new(handler),
            vehicles: Arc::new(Mutex::new(HashMap::new())),
            pool: Arc::new(Semaphore::new(pool_size)),
            queue_capacity,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Registers a vehicle without dispatching anything, used on technical
    /// log-on so later position events find their entry.
    pub async fn register(&self, vehicle_ref: &str) {
        self.vehicles
            .lock()
            .await
            .entry(vehicle_ref.to_owned())
            .or_insert_with(|| VehicleEntry {
                locked: false,
                queue: VecDeque::new(),
            });
    }

    /// Enqueues or directly executes an event for a vehicle.
    pub async fn dispatch(&self, vehicle_ref: &str, event: InboundEvent) {
        if !self.accepting.load(Ordering::SeqCst) {
            log::warn!(
                "VehicleDispatcher: shutting down, dropping event for vehicle {}",
                vehicle_ref
            );
            return;
        }

        let mut vehicles = self.vehicles.lock().await;
        let entry = vehicles
            .entry(vehicle_ref.to_owned())
            .or_insert_with(|| VehicleEntry {
                locked: false,
                queue: VecDeque::new(),
            });

        if entry.locked {
            // the vehicle is currently processed by a worker, enqueue
            if entry.queue.len() >= self.queue_capacity {
                if let Some(index) = entry.queue.iter().position(InboundEvent::is_droppable) {
                    entry.queue.remove(index);
                    log::warn!(
                        "VehicleDispatcher: queue for vehicle {} is full, dropped oldest GNSS event",
                        vehicle_ref
                    );
                } else if event.is_droppable() {
                    log::warn!(
                        "VehicleDispatcher: queue for vehicle {} is full, dropping incoming GNSS event",
                        vehicle_ref
                    );
                    return;
                }
            }
            entry.queue.push_back(event);
            return;
        }

        entry.locked = true;
        drop(vehicles);

        self.spawn_worker(vehicle_ref.to_owned(), event);
    }

    fn spawn_worker(&self, vehicle_ref: String, first_event: InboundEvent) {
        let handler = self.handler.clone();
        let vehicles = self.vehicles.clone();
        let pool = self.pool.clone();

        tokio::spawn(async move {
            let mut event = first_event;
            loop {
                let permit = match pool.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let result = AssertUnwindSafe(handler.handle(&vehicle_ref, event))
                    .catch_unwind()
                    .await;
                drop(permit);

                // a panic must not poison the vehicle, release it like any
                // completed handler
                if let Err(why) = result {
                    log::error!(
                        "VehicleDispatcher: handler for vehicle {} paniced: {:?}",
                        vehicle_ref,
                        why
                    );
                }

                let mut vehicles = vehicles.lock().await;
                let entry = match vehicles.get_mut(&vehicle_ref) {
                    Some(entry) => entry,
                    None => break,
                };

                match entry.queue.pop_front() {
                    Some(next) => event = next,
                    None => {
                        entry.locked = false;
                        break;
                    }
                }
            }
        });
    }

    /// Stops accepting new events; already queued events keep draining.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Waits until no vehicle is locked and all queues are empty.
    pub async fn drain(&self) {
        loop {
            {
                let vehicles = self.vehicles.lock().await;
                let busy = vehicles
                    .values()
                    .any(|entry| entry.locked || !entry.queue.is_empty());
                if !busy {
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdv435::{GnssPhysicalPosition, GnssPhysicalPositionData, Wgs84PhysicalPosition};
    use std::time::Duration;

    fn gnss_event(tag: &str) -> InboundEvent {
        InboundEvent {
            topic: tag.to_owned(),
            data_version: None,
            correlation_id: None,
            message: IomMessage::GnssPhysicalPositionData(GnssPhysicalPositionData {
                timestamp: None,
                publisher_id: None,
                timestamp_of_measurement: "2024-07-05T12:30:00+00:00".to_owned(),
                gnss_physical_position: GnssPhysicalPosition {
                    wgs_84_physical_position: Wgs84PhysicalPosition {
                        latitude: 54.0,
                        longitude: 10.0,
                    },
                },
            }),
        }
    }

    /// records the processing order and simulates slow handlers.
    struct RecordingHandler {
        log: Mutex<Vec<(String, String)>>,
        delay: Duration,
        panic_on: Option<String>,
    }

    impl RecordingHandler {
        fn new(delay: Duration) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                delay,
                panic_on: None,
            }
        }
    }

    #[async_trait]
    impl VehicleEventHandler for Arc<RecordingHandler> {
        async fn handle(&self, vehicle_ref: &str, event: InboundEvent) {
            tokio::time::sleep(self.delay).await;
            if self.panic_on.as_deref() == Some(event.topic.as_str()) {
                panic!("boom");
            }
            self.log
                .lock()
                .await
                .push((vehicle_ref.to_owned(), event.topic));
        }
    }

    #[tokio::test]
    async fn events_of_one_vehicle_are_handled_in_fifo_order() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(5)));
        let dispatcher = VehicleDispatcher::new(handler.clone(), 4, 100);

        for index in 0..5 {
            dispatcher
                .dispatch("bus-1", gnss_event(&format!("event-{}", index)))
                .await;
        }
        dispatcher.drain().await;

        let log = handler.log.lock().await;
        let order: Vec<&str> = log.iter().map(|(_, topic)| topic.as_str()).collect();
        assert_eq!(
            order,
            vec!["event-0", "event-1", "event-2", "event-3", "event-4"]
        );
    }

    #[tokio::test]
    async fn vehicles_are_processed_independently() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(2)));
        let dispatcher = VehicleDispatcher::new(handler.clone(), 4, 100);

        for vehicle in ["bus-1", "bus-2", "bus-3"] {
            for index in 0..3 {
                dispatcher
                    .dispatch(vehicle, gnss_event(&format!("{}-{}", vehicle, index)))
                    .await;
            }
        }
        dispatcher.drain().await;

        let log = handler.log.lock().await;
        assert_eq!(log.len(), 9);

        // FIFO must hold per vehicle, across vehicles the order is free
        for vehicle in ["bus-1", "bus-2", "bus-3"] {
            let topics: Vec<&str> = log
                .iter()
                .filter(|(v, _)| v == vehicle)
                .map(|(_, topic)| topic.as_str())
                .collect();
            assert_eq!(
                topics,
                vec![
                    format!("{}-0", vehicle),
                    format!("{}-1", vehicle),
                    format!("{}-2", vehicle)
                ]
            );
        }
    }

    #[tokio::test]
    async fn panicking_handler_releases_the_vehicle() {
        let mut handler = RecordingHandler::new(Duration::from_millis(1));
        handler.panic_on = Some("event-1".to_owned());
        let handler = Arc::new(handler);
        let dispatcher = VehicleDispatcher::new(handler.clone(), 2, 100);

        for index in 0..3 {
            dispatcher
                .dispatch("bus-1", gnss_event(&format!("event-{}", index)))
                .await;
        }
        dispatcher.drain().await;

        let log = handler.log.lock().await;
        let order: Vec<&str> = log.iter().map(|(_, topic)| topic.as_str()).collect();
        assert_eq!(order, vec!["event-0", "event-2"]);

        // the vehicle accepts further events afterwards
        drop(log);
        dispatcher.dispatch("bus-1", gnss_event("event-3")).await;
        dispatcher.drain().await;
        assert_eq!(handler.log.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn full_queue_drops_the_oldest_gnss_event() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(30)));
        let dispatcher = VehicleDispatcher::new(handler.clone(), 2, 2);

        // first event locks the vehicle, two fill the queue, the fourth
        // overflows it
        for index in 0..4 {
            dispatcher
                .dispatch("bus-1", gnss_event(&format!("event-{}", index)))
                .await;
        }
        dispatcher.drain().await;

        let log = handler.log.lock().await;
        let order: Vec<&str> = log.iter().map(|(_, topic)| topic.as_str()).collect();
        assert_eq!(order, vec!["event-0", "event-2", "event-3"]);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_events() {
        let handler = Arc::new(RecordingHandler::new(Duration::from_millis(1)));
        let dispatcher = VehicleDispatcher::new(handler.clone(), 2, 100);

        dispatcher.dispatch("bus-1", gnss_event("event-0")).await;
        dispatcher.shutdown();
        dispatcher.dispatch("bus-1", gnss_event("event-1")).await;
        dispatcher.drain().await;

        assert_eq!(handler.log.lock().await.len(), 1);
    }
}
