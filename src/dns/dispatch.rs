//! completion dispatcher shared by all requests of a context
//!
//! One thread per context owns the deadlines of every sent request.
//! Transports post completions to it, the dispatcher matches them to the
//! waiting request, decodes the response and emits the request's events.
//! Whichever comes first, the completion or the deadline, finishes the
//! request; the other one is ignored.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, Builder};
use std::time::{Duration, Instant};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::dns::context::DnsContext;
use crate::dns::pending::{Delivery, Registration};
use crate::dns::request::{set_state, RequestEvent, RequestState, SharedState};
use crate::dns::transport::TcpExchange;

/// The outcome of an exchange, addressed to the registration it belongs to
pub struct Completion {
    pub registration: Registration,
    pub result: Delivery,
}

pub enum Command {
    /// Arms the deadline of a sent request
    Watch(Watch),
    Complete(Completion),
}

/// A sent request waiting for its completion or its deadline
pub struct Watch {
    registration: Registration,
    context: Arc<DnsContext>,
    sent: Instant,
    deadline: Instant,
    state: SharedState,
    tcp: Option<TcpExchange>,
    events: Sender<RequestEvent>,
}

impl Watch {
    pub fn new(
        registration: Registration,
        context: Arc<DnsContext>,
        timeout: Duration,
        state: SharedState,
        tcp: Option<TcpExchange>,
        events: Sender<RequestEvent>,
    ) -> Watch {
        let sent = Instant::now();
        Watch {
            registration,
            context,
            sent,
            deadline: sent + timeout,
            state,
            tcp,
            events,
        }
    }

    fn complete(self, result: Delivery) {
        let id = self.registration.id;
        // Unregister before anything else, so late responses find no owner
        self.context.pending().remove(self.registration);
        set_state(&self.state, RequestState::Completed);

        let event = match result {
            Ok(data) => match self.context.decode(&data) {
                Ok(packet) => {
                    debug!(
                        "Response {} with {} answers after {} ms",
                        id,
                        packet.answers.len(),
                        self.sent.elapsed().as_millis()
                    );
                    RequestEvent::Message(Ok(packet))
                }
                Err(e) => {
                    warn!("Malformed response {}: {}", id, e);
                    RequestEvent::Message(Err(e.into()))
                }
            },
            Err(e) => {
                debug!("Query {} failed: {}", id, e);
                RequestEvent::Message(Err(e))
            }
        };
        self.finish(event);
    }

    fn expire(self) {
        if let Some(ref tcp) = self.tcp {
            tcp.abort();
        }
        self.context.pending().remove(self.registration);
        set_state(&self.state, RequestState::TimedOut);
        debug!(
            "Query {} timed out after {} ms",
            self.registration.id,
            self.sent.elapsed().as_millis()
        );
        self.finish(RequestEvent::Timeout);
    }

    fn finish(self, event: RequestEvent) {
        // The owner may have dropped the receiver, that is fine
        let _ = self.events.send(event);
        set_state(&self.state, RequestState::Ended);
        let _ = self.events.send(RequestEvent::End);
    }
}

/// Handle to the dispatcher thread of a context
///
/// The thread is started on first use. It runs until the dispatcher is
/// stopped or dropped and every request it watches is over.
pub struct Dispatcher {
    commands: Mutex<Option<Sender<Command>>>,
    stopped: AtomicBool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher {
            commands: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// A channel into the dispatcher thread
    pub fn sender(&self) -> io::Result<Sender<Command>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::NotConnected, "dispatcher is stopped"));
        }

        let mut slot = self.commands.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(commands) = slot.as_ref() {
            return Ok(commands.clone());
        }

        let (commands, rx) = channel();
        Builder::new()
            .name(String::from("dns-dispatcher"))
            .spawn(move || run(rx))?;
        debug!("Started DNS dispatcher");

        *slot = Some(commands.clone());
        Ok(commands)
    }

    /// Refuses new requests; those in flight still run to their end
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.commands.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

fn run(commands: Receiver<Command>) {
    let mut watches: HashMap<u16, Watch> = HashMap::new();
    let mut connected = true;

    loop {
        let next = watches.values().map(|watch| watch.deadline).min();
        let command = match (next, connected) {
            (None, false) => break,
            (None, true) => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
            (Some(deadline), true) => commands.recv_timeout(deadline.saturating_duration_since(Instant::now())),
            (Some(deadline), false) => {
                // Nothing can complete anymore, only deadlines are left
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                Err(RecvTimeoutError::Timeout)
            }
        };

        match command {
            Ok(Command::Watch(watch)) => {
                let id = watch.registration.id;
                if let Some(previous) = watches.insert(id, watch) {
                    warn!("Query {} was still watched, ending it", id);
                    previous.expire();
                }
            }
            Ok(Command::Complete(completion)) => {
                let id = completion.registration.id;
                let owned = matches!(watches.get(&id), Some(watch) if watch.registration == completion.registration);
                if !owned {
                    trace!("Dropping completion of query {}, it is already over", id);
                } else if let Some(watch) = watches.remove(&id) {
                    watch.complete(completion.result);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => connected = false,
        }

        let now = Instant::now();
        let expired = watches
            .iter()
            .filter(|(_, watch)| watch.deadline <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<u16>>();
        for id in expired {
            if let Some(watch) = watches.remove(&id) {
                watch.expire();
            }
        }
    }

    debug!("DNS dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::client::ClientError;
    use crate::dns::pending::PendingQueries;
    use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};
    use crate::settings::Settings;

    fn context() -> Arc<DnsContext> {
        let pending = PendingQueries::with_id_source(Box::new(|| 7));
        Arc::new(DnsContext::with_pending(Settings::default(), pending))
    }

    fn response(id: u16) -> Vec<u8> {
        let mut packet = DnsPacket::query(DnsQuestion::new("example.org".to_string(), QueryType::A), true);
        packet.header.id = id;
        packet.header.response = true;
        packet.to_bytes(0xFFFF).unwrap()
    }

    fn watch(context: &Arc<DnsContext>, timeout: Duration) -> (Registration, SharedState, Receiver<RequestEvent>) {
        let commands = context.dispatcher().sender().unwrap();
        let registration = context.pending().register(None, commands.clone()).unwrap();
        let state = Arc::new(Mutex::new(RequestState::Sent));
        let (events_tx, events) = channel();

        let watch = Watch::new(registration, Arc::clone(context), timeout, Arc::clone(&state), None, events_tx);
        commands.send(Command::Watch(watch)).unwrap();
        (registration, state, events)
    }

    #[test]
    fn test_completion_of_other_registration_is_ignored() {
        let context = context();
        let commands = context.dispatcher().sender().unwrap();
        let (registration, state, events) = watch(&context, Duration::from_secs(2));

        // Same id, earlier owner
        let stale = Registration {
            id: registration.id,
            token: registration.token.wrapping_sub(1),
        };
        commands
            .send(Command::Complete(Completion { registration: stale, result: Err(ClientError::LookupFailed) }))
            .unwrap();
        commands
            .send(Command::Complete(Completion { registration, result: Ok(response(7)) }))
            .unwrap();

        let events = events.iter().collect::<Vec<_>>();
        assert_eq!(2, events.len(), "unexpected events {:?}", events);
        match &events[0] {
            RequestEvent::Message(Ok(packet)) => assert_eq!(7, packet.header.id),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(events[1], RequestEvent::End));
        assert_eq!(RequestState::Ended, *state.lock().unwrap());
        assert!(context.pending().is_empty());
    }

    #[test]
    fn test_deadline_expires_watch() {
        let context = context();
        let started = Instant::now();
        let (registration, state, events) = watch(&context, Duration::from_millis(50));

        let events = events.iter().collect::<Vec<_>>();
        assert_eq!(2, events.len(), "unexpected events {:?}", events);
        assert!(matches!(events[0], RequestEvent::Timeout));
        assert!(matches!(events[1], RequestEvent::End));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(RequestState::Ended, *state.lock().unwrap());
        assert!(!context.pending().contains(registration.id));

        // A completion after the deadline finds nobody
        let commands = context.dispatcher().sender().unwrap();
        commands
            .send(Command::Complete(Completion { registration, result: Ok(response(7)) }))
            .unwrap();
    }

    #[test]
    fn test_many_watches_share_one_thread() {
        let context = Arc::new(DnsContext::new(Settings::default()));
        let watches = (0..20)
            .map(|i| watch(&context, Duration::from_millis(20 + i * 5)))
            .collect::<Vec<_>>();

        for (_, state, events) in watches {
            assert!(matches!(events.recv().unwrap(), RequestEvent::Timeout));
            assert!(matches!(events.recv().unwrap(), RequestEvent::End));
            assert_eq!(RequestState::Ended, *state.lock().unwrap());
        }
        assert!(context.pending().is_empty());
    }

    #[test]
    fn test_stopped_dispatcher_refuses_requests() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.sender().is_ok());
        dispatcher.stop();
        assert!(dispatcher.sender().is_err());
    }
}
