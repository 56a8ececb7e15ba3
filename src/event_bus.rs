/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The event bus thread, which receives [events](crate::events) from the rest of the node and fires the
//! handlers registered for them.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Handlers for every event type. If logging is enabled the default logger is the first handler of each
/// type, followed by the user's handlers.
pub(crate) struct EventHandlers {
    pub(crate) add_event_handlers: Vec<HandlerPtr<AddEventEvent>>,
    pub(crate) apply_miniblock_handlers: Vec<HandlerPtr<ApplyMiniblockEvent>>,
    pub(crate) promote_candidate_handlers: Vec<HandlerPtr<PromoteCandidateEvent>>,
    pub(crate) save_candidate_handlers: Vec<HandlerPtr<SaveCandidateEvent>>,
    pub(crate) produce_candidate_handlers: Vec<HandlerPtr<ProduceCandidateEvent>>,
    pub(crate) skip_candidate_handlers: Vec<HandlerPtr<SkipCandidateEvent>>,
    pub(crate) quorum_failed_handlers: Vec<HandlerPtr<QuorumFailedEvent>>,
    pub(crate) start_reconcile_handlers: Vec<HandlerPtr<StartReconcileEvent>>,
    pub(crate) end_reconcile_handlers: Vec<HandlerPtr<EndReconcileEvent>>,
    pub(crate) reconcile_retry_queued_handlers: Vec<HandlerPtr<ReconcileRetryQueuedEvent>>,
    pub(crate) load_stream_handlers: Vec<HandlerPtr<LoadStreamEvent>>,
    pub(crate) unload_stream_handlers: Vec<HandlerPtr<UnloadStreamEvent>>,
}

/// User handlers, one optional handler per event type, as passed to the node builder.
#[derive(Default)]
pub(crate) struct UserHandlers {
    pub(crate) add_event: Option<HandlerPtr<AddEventEvent>>,
    pub(crate) apply_miniblock: Option<HandlerPtr<ApplyMiniblockEvent>>,
    pub(crate) promote_candidate: Option<HandlerPtr<PromoteCandidateEvent>>,
    pub(crate) save_candidate: Option<HandlerPtr<SaveCandidateEvent>>,
    pub(crate) produce_candidate: Option<HandlerPtr<ProduceCandidateEvent>>,
    pub(crate) skip_candidate: Option<HandlerPtr<SkipCandidateEvent>>,
    pub(crate) quorum_failed: Option<HandlerPtr<QuorumFailedEvent>>,
    pub(crate) start_reconcile: Option<HandlerPtr<StartReconcileEvent>>,
    pub(crate) end_reconcile: Option<HandlerPtr<EndReconcileEvent>>,
    pub(crate) reconcile_retry_queued: Option<HandlerPtr<ReconcileRetryQueuedEvent>>,
    pub(crate) load_stream: Option<HandlerPtr<LoadStreamEvent>>,
    pub(crate) unload_stream: Option<HandlerPtr<UnloadStreamEvent>>,
}

fn handlers_for<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

impl EventHandlers {
    pub(crate) fn new(log_events: bool, user_handlers: UserHandlers) -> EventHandlers {
        EventHandlers {
            add_event_handlers: handlers_for(log_events, user_handlers.add_event),
            apply_miniblock_handlers: handlers_for(log_events, user_handlers.apply_miniblock),
            promote_candidate_handlers: handlers_for(log_events, user_handlers.promote_candidate),
            save_candidate_handlers: handlers_for(log_events, user_handlers.save_candidate),
            produce_candidate_handlers: handlers_for(log_events, user_handlers.produce_candidate),
            skip_candidate_handlers: handlers_for(log_events, user_handlers.skip_candidate),
            quorum_failed_handlers: handlers_for(log_events, user_handlers.quorum_failed),
            start_reconcile_handlers: handlers_for(log_events, user_handlers.start_reconcile),
            end_reconcile_handlers: handlers_for(log_events, user_handlers.end_reconcile),
            reconcile_retry_queued_handlers: handlers_for(log_events, user_handlers.reconcile_retry_queued),
            load_stream_handlers: handlers_for(log_events, user_handlers.load_stream),
            unload_stream_handlers: handlers_for(log_events, user_handlers.unload_stream),
        }
    }

    /// True if no handler is registered, in which case the node does not start the event bus.
    pub(crate) fn is_empty(&self) -> bool {
        self.add_event_handlers.is_empty()
            && self.apply_miniblock_handlers.is_empty()
            && self.promote_candidate_handlers.is_empty()
            && self.save_candidate_handlers.is_empty()
            && self.produce_candidate_handlers.is_empty()
            && self.skip_candidate_handlers.is_empty()
            && self.quorum_failed_handlers.is_empty()
            && self.start_reconcile_handlers.is_empty()
            && self.end_reconcile_handlers.is_empty()
            && self.reconcile_retry_queued_handlers.is_empty()
            && self.load_stream_handlers.is_empty()
            && self.unload_stream_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::AddEvent(add_event_event) =>
                self.add_event_handlers.iter().for_each(|handler| handler(&add_event_event)),

            Event::ApplyMiniblock(apply_miniblock_event) =>
                self.apply_miniblock_handlers.iter().for_each(|handler| handler(&apply_miniblock_event)),

            Event::PromoteCandidate(promote_candidate_event) =>
                self.promote_candidate_handlers.iter().for_each(|handler| handler(&promote_candidate_event)),

            Event::SaveCandidate(save_candidate_event) =>
                self.save_candidate_handlers.iter().for_each(|handler| handler(&save_candidate_event)),

            Event::ProduceCandidate(produce_candidate_event) =>
                self.produce_candidate_handlers.iter().for_each(|handler| handler(&produce_candidate_event)),

            Event::SkipCandidate(skip_candidate_event) =>
                self.skip_candidate_handlers.iter().for_each(|handler| handler(&skip_candidate_event)),

            Event::QuorumFailed(quorum_failed_event) =>
                self.quorum_failed_handlers.iter().for_each(|handler| handler(&quorum_failed_event)),

            Event::StartReconcile(start_reconcile_event) =>
                self.start_reconcile_handlers.iter().for_each(|handler| handler(&start_reconcile_event)),

            Event::EndReconcile(end_reconcile_event) =>
                self.end_reconcile_handlers.iter().for_each(|handler| handler(&end_reconcile_event)),

            Event::ReconcileRetryQueued(retry_queued_event) =>
                self.reconcile_retry_queued_handlers.iter().for_each(|handler| handler(&retry_queued_event)),

            Event::LoadStream(load_stream_event) =>
                self.load_stream_handlers.iter().for_each(|handler| handler(&load_stream_event)),

            Event::UnloadStream(unload_stream_event) =>
                self.unload_stream_handlers.iter().for_each(|handler| handler(&unload_stream_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        match event_subscriber.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // Every publisher is gone: the node is shutting down.
            Err(RecvTimeoutError::Disconnected) => return,
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::SystemTime;

    use super::*;
    use crate::types::data_types::{StreamId, StreamType};

    #[test]
    fn fires_user_handlers_until_shutdown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_handler = seen.clone();
        let user_handlers = UserHandlers {
            unload_stream: Some(Box::new(move |event: &UnloadStreamEvent| {
                seen_by_handler.lock().unwrap().push(event.stream_id.clone())
            })),
            ..Default::default()
        };
        let handlers = EventHandlers::new(false, user_handlers);
        assert!(!handlers.is_empty());
        assert!(EventHandlers::new(false, UserHandlers::default()).is_empty());

        let (publisher, subscriber) = mpsc::channel();
        let (shutdown, shutdown_receiver) = mpsc::channel();
        let bus = start_event_bus(handlers, subscriber, shutdown_receiver);

        let stream_id = StreamId::random(StreamType::Channel);
        Event::publish(
            &Some(publisher.clone()),
            Event::UnloadStream(UnloadStreamEvent { timestamp: SystemTime::now(), stream_id: stream_id.clone() }),
        );
        while seen.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        shutdown.send(()).unwrap();
        bus.join().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![stream_id]);
    }
}
