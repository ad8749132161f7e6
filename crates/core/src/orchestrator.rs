//! Session orchestrator.
//!
//! The orchestrator is a [`Handler`] that drives up to two independent
//! roles: a receiver (listen mode) and a sender (connect mode). Every
//! transition happens inside `on_message`; collaborators answer with
//! notification messages, never with callbacks.
//!
//! ## Role lifecycles
//!
//! ```text
//! receiver: Idle -> ListenRequested  -> ReceiverInitializing -> ReceiverReady
//! sender:   Idle -> ConnectRequested -> SenderInitializing   -> Streaming
//!
//! stop (any state): active roles -> Stopping -> Stopped, looper stopped
//! ```
//!
//! The two roles do not talk to each other: activating both simply runs
//! a receiver and a sender side by side.
//!
//! ## Pacing
//!
//! Once the sender reports `InitDone(Ok)`, the orchestrator fetches the
//! first sample and schedules a `SendMore` for it through the [`Pacer`].
//! Each `SendMore` forwards its sample to the sender and fetches the next
//! one, until the source runs dry and the stop transition runs.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::looper::{Context, Handler, HandlerId, Looper, Poster};
use crate::media::{self, MediaSource, Packetization};
use crate::message::{AccessUnit, Message, Notify, ReceiverCommand, SenderCommand, TransportEvent};
use crate::pacing::Pacer;

/// Factory for the orchestrator's collaborators.
///
/// Endpoints are returned as handlers; the orchestrator registers them in
/// its own looper and talks to them only through messages.
pub trait Endpoints: Send {
    fn create_receiver(&mut self, notify: Notify) -> Box<dyn Handler<Message>>;

    fn create_sender(&mut self, notify: Notify) -> Box<dyn Handler<Message>>;

    /// Open the media asset at `locator`.
    fn open_source(&mut self, locator: &str) -> Result<Box<dyn MediaSource>>;
}

/// Orchestrator state, tracked per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Idle,
    ListenRequested,
    ConnectRequested,
    ReceiverInitializing,
    SenderInitializing,
    ReceiverReady,
    Streaming,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Receiver,
    Sender,
}

/// Observable orchestrator status.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub receiver: State,
    pub sender: State,
    /// Every transition, in order.
    pub history: Vec<(Role, State)>,
    pub receiver_port: Option<u16>,
    pub sender_port: Option<u16>,
    /// Samples handed to the sender.
    pub samples_sent: u64,
    /// Collaborator events the orchestrator does not act on.
    pub unhandled_events: u64,
    /// Receiver initialization failure. Logged only; the receiver stays
    /// half-initialized.
    pub receiver_error: Option<String>,
    /// Failure that aborted the sender path.
    pub last_error: Option<String>,
    pub stopped: bool,
}

impl Status {
    pub fn state(&self, role: Role) -> State {
        match role {
            Role::Receiver => self.receiver,
            Role::Sender => self.sender,
        }
    }

    /// States a role went through, in order.
    pub fn history_of(&self, role: Role) -> Vec<State> {
        self.history
            .iter()
            .filter(|(r, _)| *r == role)
            .map(|(_, s)| *s)
            .collect()
    }
}

type PortReporter = Box<dyn FnMut(Role, u16) + Send>;

/// The session orchestrator. See the [module docs](self).
pub struct Orchestrator {
    config: OrchestratorConfig,
    endpoints: Box<dyn Endpoints>,
    receiver: Option<HandlerId>,
    sender: Option<HandlerId>,
    source: Option<Box<dyn MediaSource>>,
    packetization: Option<Packetization>,
    pacer: Pacer,
    status: Arc<RwLock<Status>>,
    report_port: Option<PortReporter>,
    stopped: bool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, endpoints: Box<dyn Endpoints>) -> Self {
        Self {
            config,
            endpoints,
            receiver: None,
            sender: None,
            source: None,
            packetization: None,
            pacer: Pacer::new(),
            status: Arc::new(RwLock::new(Status::default())),
            report_port: None,
            stopped: false,
        }
    }

    /// Called with the locally bound media port when a role comes up.
    pub fn with_port_reporter(mut self, report: impl FnMut(Role, u16) + Send + 'static) -> Self {
        self.report_port = Some(Box::new(report));
        self
    }

    /// Register into `looper` and return a handle for driving it.
    pub fn attach(self, looper: &mut Looper<Message>) -> OrchestratorHandle {
        let status = self.status.clone();
        let id = looper.register(Box::new(self));
        OrchestratorHandle {
            poster: looper.poster(),
            id,
            status,
        }
    }

    fn state(&self, role: Role) -> State {
        self.status.read().state(role)
    }

    fn set_state(&self, role: Role, state: State) {
        let mut status = self.status.write();
        let old = status.state(role);
        tracing::debug!(?role, old_state = ?old, new_state = ?state, "state transition");
        match role {
            Role::Receiver => status.receiver = state,
            Role::Sender => status.sender = state,
        }
        status.history.push((role, state));
    }

    fn report(&mut self, role: Role, port: u16) {
        {
            let mut status = self.status.write();
            match role {
                Role::Receiver => status.receiver_port = Some(port),
                Role::Sender => status.sender_port = Some(port),
            }
        }
        if let Some(report) = self.report_port.as_mut() {
            report(role, port);
        }
    }

    fn on_listen(&mut self, ctx: &mut Context<'_, Message>) {
        if self.stopped || self.state(Role::Receiver) != State::Idle {
            tracing::warn!("listen mode already active or stopped, ignoring");
            return;
        }
        self.set_state(Role::Receiver, State::ListenRequested);

        let notify = Notify::new(ctx.poster(), ctx.id(), Message::ReceiverNotify);
        let receiver = ctx.register(self.endpoints.create_receiver(notify));
        self.receiver = Some(receiver);

        ctx.post(
            receiver,
            Message::Receiver(ReceiverCommand::RegisterPayload {
                payload_type: self.config.payload_type,
                packetization: self.config.packetization,
            }),
            0,
        );
        ctx.post(
            receiver,
            Message::Receiver(ReceiverCommand::Init {
                media_mode: self.config.media_mode,
                control_mode: self.config.control_mode,
            }),
            0,
        );

        tracing::info!(
            %receiver,
            payload_type = self.config.payload_type,
            packetization = %self.config.packetization,
            "receiver initializing"
        );
        self.set_state(Role::Receiver, State::ReceiverInitializing);
    }

    fn on_connect(&mut self, ctx: &mut Context<'_, Message>, host: String, port: u16) -> Result<()> {
        if self.stopped || self.state(Role::Sender) != State::Idle {
            tracing::warn!(%host, port, "connect mode already active or stopped, ignoring");
            return Ok(());
        }
        self.set_state(Role::Sender, State::ConnectRequested);

        if host.is_empty() {
            return Err(Error::InvalidEndpoint("empty host".to_string()));
        }
        let control_port = match port.checked_add(1) {
            Some(control_port) if port != 0 => control_port,
            _ => {
                return Err(Error::InvalidEndpoint(format!(
                    "{host}:{port} leaves no valid control port"
                )));
            }
        };

        let mut source = self.endpoints.open_source(&self.config.media_source)?;
        let (track, packetization) =
            media::find_video_track(source.as_ref())?.ok_or_else(|| Error::NoCompatibleTrack {
                tracks: source.track_count(),
            })?;
        let format = source.track_format(track)?;
        source.select_track(track)?;
        tracing::info!(
            locator = %self.config.media_source,
            track,
            %packetization,
            frame_rate = ?format.frame_rate,
            "selected video track"
        );
        self.source = Some(source);
        self.packetization = Some(packetization);

        if self.receiver.is_some() {
            tracing::info!("listen and connect roles run independently");
        }

        let notify = Notify::new(ctx.poster(), ctx.id(), Message::SenderNotify);
        let sender = ctx.register(self.endpoints.create_sender(notify));
        self.sender = Some(sender);

        ctx.post(
            sender,
            Message::Sender(SenderCommand::Init {
                remote_host: host.clone(),
                media_port: port,
                media_mode: self.config.media_mode,
                control_port,
                control_mode: self.config.control_mode,
            }),
            0,
        );

        tracing::info!(%sender, %host, port, control_port, "sender initializing");
        self.set_state(Role::Sender, State::SenderInitializing);
        Ok(())
    }

    fn on_sender_notify(&mut self, ctx: &mut Context<'_, Message>, event: TransportEvent) {
        match event {
            TransportEvent::InitDone(result) => {
                if self.state(Role::Sender) != State::SenderInitializing {
                    tracing::warn!(state = ?self.state(Role::Sender), "unexpected sender InitDone");
                    return;
                }
                match result {
                    Ok(port) => {
                        tracing::info!(port, "sender initialized");
                        self.report(Role::Sender, port);
                        self.set_state(Role::Sender, State::Streaming);
                        self.pump(ctx);
                    }
                    Err(e) => self.fail(ctx, e),
                }
            }
            TransportEvent::Error(e) => self.unhandled(Role::Sender, e),
        }
    }

    fn on_receiver_notify(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::InitDone(result) => {
                if self.state(Role::Receiver) != State::ReceiverInitializing {
                    tracing::warn!(state = ?self.state(Role::Receiver), "unexpected receiver InitDone");
                    return;
                }
                match result {
                    Ok(port) => {
                        tracing::info!(port, "receiver initialized");
                        self.report(Role::Receiver, port);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "receiver initialization failed");
                        self.status.write().receiver_error = Some(e.to_string());
                    }
                }
                self.set_state(Role::Receiver, State::ReceiverReady);
            }
            TransportEvent::Error(e) => self.unhandled(Role::Receiver, e),
        }
    }

    fn on_send_more(&mut self, ctx: &mut Context<'_, Message>, unit: AccessUnit) {
        let (Some(sender), Some(packetization)) = (self.sender, self.packetization) else {
            tracing::warn!(time_us = unit.time_us, "send-more without a sender, dropping sample");
            return;
        };
        if self.state(Role::Sender) != State::Streaming {
            tracing::warn!(state = ?self.state(Role::Sender), "send-more outside of streaming, dropping sample");
            return;
        }

        tracing::trace!(time_us = unit.time_us, bytes = unit.data.len(), "forwarding sample");
        ctx.post(
            sender,
            Message::Sender(SenderCommand::QueueBuffer {
                unit,
                payload_type: self.config.payload_type,
                packetization,
            }),
            0,
        );
        self.status.write().samples_sent += 1;

        self.pump(ctx);
    }

    /// Fetch the next sample and schedule it, or begin stopping at end of
    /// stream.
    fn pump(&mut self, ctx: &mut Context<'_, Message>) {
        match self.read_more(ctx) {
            Ok(true) => {}
            Ok(false) => {
                let samples_sent = self.status.read().samples_sent;
                tracing::info!(samples_sent, "end of stream");
                self.begin_stop(ctx, Role::Sender);
            }
            Err(e) => self.fail(ctx, e),
        }
    }

    /// Returns `Ok(false)` when the source has no more samples.
    fn read_more(&mut self, ctx: &mut Context<'_, Message>) -> Result<bool> {
        let Some(source) = self.source.as_mut() else {
            return Ok(false);
        };

        let time_us = match source.sample_time_us() {
            Ok(Some(time_us)) => time_us,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(error = %e, "source failed to report next sample, treating as end of stream");
                return Ok(false);
            }
        };

        let mut data = vec![0u8; self.config.max_sample_size];
        let len = source.read_sample(&mut data)?;
        data.truncate(len);
        source.advance()?;

        let deadline = self.pacer.schedule(time_us, ctx.now_us());
        tracing::trace!(
            time_us,
            when_us = deadline.when_us,
            delay_us = deadline.delay_us,
            bytes = len,
            "sample scheduled"
        );
        ctx.post_self(Message::SendMore(AccessUnit { time_us, data }), deadline.delay_us);
        Ok(true)
    }

    fn fail(&mut self, ctx: &mut Context<'_, Message>, error: Error) {
        tracing::error!(error = %error, "sender path aborted");
        self.status.write().last_error = Some(error.to_string());
        self.begin_stop(ctx, Role::Sender);
    }

    fn begin_stop(&mut self, ctx: &mut Context<'_, Message>, role: Role) {
        if self.state(role) != State::Stopping {
            self.set_state(role, State::Stopping);
        }
        ctx.post_self(Message::Stop, 0);
    }

    fn unhandled(&mut self, role: Role, error: Error) {
        tracing::warn!(?role, error = %error, "unhandled collaborator event");
        self.status.write().unhandled_events += 1;
    }

    fn on_stop(&mut self, ctx: &mut Context<'_, Message>) {
        if self.stopped {
            tracing::debug!("already stopped");
            return;
        }

        let active: Vec<Role> = [Role::Receiver, Role::Sender]
            .into_iter()
            .filter(|role| self.state(*role) != State::Idle)
            .collect();
        for role in &active {
            if self.state(*role) != State::Stopping {
                self.set_state(*role, State::Stopping);
            }
        }

        if let Some(receiver) = self.receiver.take()
            && let Err(e) = ctx.unregister(receiver)
        {
            tracing::warn!(error = %e, "receiver already unregistered");
        }
        if let Some(sender) = self.sender.take()
            && let Err(e) = ctx.unregister(sender)
        {
            tracing::warn!(error = %e, "sender already unregistered");
        }
        self.source = None;
        self.stopped = true;

        for role in active {
            self.set_state(role, State::Stopped);
        }
        let samples_sent = {
            let mut status = self.status.write();
            status.stopped = true;
            status.samples_sent
        };
        tracing::info!(samples_sent, "orchestrator stopped");
        ctx.stop();
    }
}

impl Handler<Message> for Orchestrator {
    fn on_message(&mut self, msg: Message, ctx: &mut Context<'_, Message>) {
        match msg {
            Message::Listen => self.on_listen(ctx),
            Message::Connect { host, port } => {
                if let Err(e) = self.on_connect(ctx, host, port) {
                    self.fail(ctx, e);
                }
            }
            Message::SenderNotify(event) => self.on_sender_notify(ctx, event),
            Message::ReceiverNotify(event) => self.on_receiver_notify(event),
            Message::SendMore(unit) => self.on_send_more(ctx, unit),
            Message::Stop => self.on_stop(ctx),
            other => tracing::warn!(kind = other.kind(), "orchestrator ignoring endpoint command"),
        }
    }
}

/// Handle for driving an [`Orchestrator`] registered in a looper.
#[derive(Clone)]
pub struct OrchestratorHandle {
    poster: Poster<Message>,
    id: HandlerId,
    status: Arc<RwLock<Status>>,
}

impl OrchestratorHandle {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Post a begin-listen.
    pub fn listen(&self) {
        self.poster.post(self.id, Message::Listen, 0);
    }

    /// Post a begin-connect to `host:port` (media) and `host:port+1`
    /// (control).
    pub fn connect(&self, host: &str, port: u16) {
        self.poster.post(
            self.id,
            Message::Connect {
                host: host.to_string(),
                port,
            },
            0,
        );
    }

    /// Post the stop transition.
    pub fn stop(&self) {
        self.poster.post(self.id, Message::Stop, 0);
    }

    pub fn status(&self) -> Status {
        self.status.read().clone()
    }
}
