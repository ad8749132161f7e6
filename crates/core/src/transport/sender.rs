use std::net::{SocketAddr, UdpSocket};
use std::thread;

use super::TransportMode;
use super::rtp::{RTP_HEADER_LEN, RtpHeader, rtp_timestamp};
use super::udp;
use crate::error::{Channel, Error, Result};
use crate::looper::{Context, Handler};
use crate::media::Packetization;
use crate::message::{AccessUnit, Message, Notify, SenderCommand, TransportEvent};

const DEFAULT_MTU: usize = 1400;

struct PendingInit {
    remote_host: String,
    control_port: u16,
    control_mode: TransportMode,
}

struct Connected {
    media: UdpSocket,
    /// Bound and connected, but nothing is sent on it.
    _control: Option<UdpSocket>,
    remote: SocketAddr,
}

enum State {
    Idle,
    Resolving(PendingInit),
    Ready(Connected),
    Failed,
}

/// Outbound RTP endpoint over UDP.
///
/// `Init` validates the transport modes and resolves the remote host on a
/// worker thread; the result comes back as `Sender(Resolved)`, after which
/// the sockets are bound and connected and `InitDone` carries the local
/// media port. `QueueBuffer` before that point is reported as
/// [`Error::NotInitialized`].
pub struct UdpSender {
    notify: Notify,
    state: State,
    header: RtpHeader,
    mtu: usize,
    packets_sent: u64,
}

impl UdpSender {
    pub fn new(notify: Notify) -> Self {
        Self::with_mtu(notify, DEFAULT_MTU)
    }

    pub fn with_mtu(notify: Notify, mtu: usize) -> Self {
        Self {
            notify,
            state: State::Idle,
            header: RtpHeader::random(),
            mtu: mtu.max(RTP_HEADER_LEN + 1),
            packets_sent: 0,
        }
    }

    fn init(
        &mut self,
        ctx: &mut Context<'_, Message>,
        remote_host: String,
        media_port: u16,
        media_mode: TransportMode,
        control_port: u16,
        control_mode: TransportMode,
    ) -> Result<()> {
        if media_mode != TransportMode::Udp {
            return Err(Error::UnsupportedTransport {
                channel: Channel::Media,
                mode: media_mode,
            });
        }
        if !matches!(control_mode, TransportMode::Udp | TransportMode::None) {
            return Err(Error::UnsupportedTransport {
                channel: Channel::Control,
                mode: control_mode,
            });
        }

        let poster = ctx.poster();
        let me = ctx.id();
        let host = remote_host.clone();
        thread::Builder::new()
            .name("rtp-sender-resolve".to_string())
            .spawn(move || {
                let resolved = udp::resolve(&host, media_port);
                poster.post(me, Message::Sender(SenderCommand::Resolved(resolved)), 0);
            })?;

        tracing::debug!(%remote_host, media_port, control_port, "resolving remote");
        self.state = State::Resolving(PendingInit {
            remote_host,
            control_port,
            control_mode,
        });
        Ok(())
    }

    fn connect(&mut self, pending: PendingInit, remote: SocketAddr) -> Result<u16> {
        let media = udp::connect_ephemeral(remote)?;
        let control = match pending.control_mode {
            TransportMode::Udp => Some(udp::connect_ephemeral(SocketAddr::new(
                remote.ip(),
                pending.control_port,
            ))?),
            _ => None,
        };
        let local_port = media.local_addr()?.port();

        tracing::info!(
            remote_host = %pending.remote_host,
            %remote,
            local_port,
            ssrc = format_args!("{:#010X}", self.header.ssrc),
            "RTP sender connected"
        );
        self.state = State::Ready(Connected {
            media,
            _control: control,
            remote,
        });
        Ok(local_port)
    }

    fn on_resolved(&mut self, resolved: Result<SocketAddr>) {
        let State::Resolving(pending) = std::mem::replace(&mut self.state, State::Failed) else {
            tracing::warn!("address resolution completed outside of initialization");
            return;
        };

        let result = resolved.and_then(|remote| self.connect(pending, remote));
        if let Err(e) = &result {
            tracing::warn!(error = %e, "RTP sender initialization failed");
        }
        self.notify.post(TransportEvent::InitDone(result));
    }

    fn queue_buffer(&mut self, unit: &AccessUnit, payload_type: u8, packetization: Packetization) -> Result<usize> {
        let State::Ready(connected) = &self.state else {
            return Err(Error::NotInitialized);
        };

        let timestamp = rtp_timestamp(unit.time_us, packetization.clock_rate());
        let chunk_size = self.mtu - RTP_HEADER_LEN;
        let chunks = unit.data.len().div_ceil(chunk_size);

        let mut packet = Vec::with_capacity(self.mtu);
        for (i, chunk) in unit.data.chunks(chunk_size).enumerate() {
            let marker = i + 1 == chunks;
            packet.clear();
            packet.extend_from_slice(&self.header.write(payload_type, marker, timestamp));
            packet.extend_from_slice(chunk);
            connected.media.send(&packet)?;
        }

        self.packets_sent += chunks as u64;
        tracing::trace!(
            time_us = unit.time_us,
            bytes = unit.data.len(),
            packets = chunks,
            seq = self.header.sequence(),
            remote = %connected.remote,
            "sample sent"
        );
        Ok(chunks)
    }
}

impl Handler<Message> for UdpSender {
    fn on_message(&mut self, msg: Message, ctx: &mut Context<'_, Message>) {
        match msg {
            Message::Sender(SenderCommand::Init {
                remote_host,
                media_port,
                media_mode,
                control_port,
                control_mode,
            }) => {
                if !matches!(self.state, State::Idle) {
                    tracing::warn!("RTP sender already initialized, ignoring Init");
                    return;
                }
                if let Err(e) = self.init(ctx, remote_host, media_port, media_mode, control_port, control_mode) {
                    self.state = State::Failed;
                    self.notify.post(TransportEvent::InitDone(Err(e)));
                }
            }
            Message::Sender(SenderCommand::Resolved(resolved)) => self.on_resolved(resolved),
            Message::Sender(SenderCommand::QueueBuffer {
                unit,
                payload_type,
                packetization,
            }) => {
                if let Err(e) = self.queue_buffer(&unit, payload_type, packetization) {
                    tracing::warn!(error = %e, time_us = unit.time_us, "failed to send sample");
                    self.notify.post(TransportEvent::Error(e));
                }
            }
            other => tracing::warn!(kind = other.kind(), "RTP sender ignoring unexpected message"),
        }
    }
}

impl Drop for UdpSender {
    fn drop(&mut self) {
        tracing::debug!(packets_sent = self.packets_sent, "RTP sender released");
    }
}
