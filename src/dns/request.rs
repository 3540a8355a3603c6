//! a single query against a single nameserver, from sending to its end
//!
//! A `Request` goes through `Created -> Sent -> Completed | TimedOut -> Ended`.
//! Sending hands back a channel that yields exactly one `Message` or
//! `Timeout` event, followed by exactly one `End` event. Once sent, the
//! request is watched by the dispatcher of its context, so `send` never
//! blocks on the network.

use std::io::{self, ErrorKind};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, info, trace, warn};

use crate::dns::client::ClientError;
use crate::dns::context::DnsContext;
use crate::dns::dispatch::{Command, Completion, Watch};
use crate::dns::protocol::{DnsPacket, DnsQuestion, ValidationError, MAX_UDP_MESSAGE};
use crate::dns::transport::{ServerAddr, TcpExchange, Transport};

type Result<T> = std::result::Result<T, ClientError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    Completed,
    TimedOut,
    Ended,
}

/// Notifications delivered to the owner of a request
#[derive(Debug)]
pub enum RequestEvent {
    /// The round trip happened: either the decoded response, or the format or
    /// transport error that prevented one
    Message(Result<DnsPacket>),
    /// No response arrived in time
    Timeout,
    /// Always the last event of a request
    End,
}

pub(crate) type SharedState = Arc<Mutex<RequestState>>;

pub(crate) fn set_state(state: &SharedState, value: RequestState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

pub struct Request {
    context: Arc<DnsContext>,
    question: DnsQuestion,
    server: ServerAddr,
    timeout: Duration,
    recursion_desired: bool,
    state: SharedState,
}

impl Request {
    /// Prepares a request; nothing is sent until `send` is called
    ///
    /// `server` is a `ServerAddr`, a `SocketAddr`, or a string such as
    /// "8.8.8.8", which means UDP on port 53.
    pub fn new<S>(context: Arc<DnsContext>, question: DnsQuestion, server: S, timeout: Duration) -> Result<Request>
    where
        S: TryInto<ServerAddr>,
        ClientError: From<S::Error>,
    {
        if timeout.is_zero() {
            return Err(ValidationError::ZeroTimeout.into());
        }
        let server = server.try_into()?;

        Ok(Request {
            recursion_desired: context.settings().recursion_desired,
            context,
            question,
            server,
            timeout,
            state: Arc::new(Mutex::new(RequestState::Created)),
        })
    }

    /// A request on the shared context, waiting for the configured default time
    pub fn with_defaults<S>(question: DnsQuestion, server: S) -> Result<Request>
    where
        S: TryInto<ServerAddr>,
        ClientError: From<S::Error>,
    {
        let context = DnsContext::shared();
        let timeout = context.default_timeout();
        Request::new(context, question, server, timeout)
    }

    pub fn set_recursion_desired(&mut self, recursion_desired: bool) {
        self.recursion_desired = recursion_desired;
    }

    pub fn question(&self) -> &DnsQuestion {
        &self.question
    }

    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> RequestState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends the query and returns the channel its events arrive on
    ///
    /// Fails right away if the request was sent before, or if it could not be
    /// registered or encoded. Network failures are not reported here but as a
    /// `Message` event.
    pub fn send(&mut self) -> Result<Receiver<RequestEvent>> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != RequestState::Created {
                return Err(ClientError::AlreadySent);
            }
            *state = RequestState::Sent;
        }

        match self.start() {
            Ok(events) => Ok(events),
            Err(e) => {
                set_state(&self.state, RequestState::Ended);
                Err(e)
            }
        }
    }

    fn start(&self) -> Result<Receiver<RequestEvent>> {
        let addr = self.server.socket_addr();
        let commands = self.context.dispatcher().sender()?;

        // Registration comes first, a fast server may answer before send_to returns
        let peer = match self.server.transport {
            Transport::Udp => Some(addr),
            Transport::Tcp => None,
        };
        let pending = self.context.pending();
        let registration = pending.register(peer, commands.clone())?;
        let id = registration.id;

        let mut packet = DnsPacket::query(self.question.clone(), self.recursion_desired);
        packet.header.id = id;
        let data = match packet.to_bytes(MAX_UDP_MESSAGE) {
            Ok(data) => data,
            Err(e) => {
                pending.remove(registration);
                return Err(e.into());
            }
        };

        let (events_tx, events_rx) = channel();
        let tcp = match self.server.transport {
            Transport::Udp => None,
            Transport::Tcp => Some(TcpExchange::new()),
        };

        // The deadline is armed before anything goes out, so no completion
        // can reach the dispatcher ahead of its watch
        let watch = Watch::new(
            registration,
            Arc::clone(&self.context),
            self.timeout,
            Arc::clone(&self.state),
            tcp.clone(),
            events_tx,
        );
        if commands.send(Command::Watch(watch)).is_err() {
            pending.remove(registration);
            return Err(io::Error::new(ErrorKind::NotConnected, "dispatcher is gone").into());
        }

        debug!("Sending query {} for {} {} to {}", id, self.question.name, self.question.qtype, self.server);
        let sent = match tcp {
            None => self.context.udp().send(&data, addr),
            Some(exchange) => {
                let done = commands.clone();
                exchange.start(addr, data, self.timeout, move |result| {
                    // Nobody listens anymore if the request is already over
                    let _ = done.send(Command::Complete(Completion { registration, result }));
                })
            }
        };
        if let Err(e) = sent {
            let result = Err(e.into());
            let _ = commands.send(Command::Complete(Completion { registration, result }));
        }

        Ok(events_rx)
    }

    /// Sends the request and blocks until it is over
    ///
    /// A timeout is reported as `ClientError::TimeOut`.
    pub fn wait(mut self) -> Result<DnsPacket> {
        let events = self.send()?;

        let mut result = Err(ClientError::LookupFailed);
        for event in events.iter() {
            match event {
                RequestEvent::Message(message) => result = message,
                RequestEvent::Timeout => result = Err(ClientError::TimeOut),
                RequestEvent::End => break,
            }
        }

        result
    }
}
