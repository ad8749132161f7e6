use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use super::TransportMode;
use super::rtp;
use super::udp;
use crate::error::{Channel, Error, Result};
use crate::looper::{Context, Handler};
use crate::media::Packetization;
use crate::message::{Message, Notify, ReceiverCommand, TransportEvent};

/// Counters shared between a [`UdpReceiver`] and whoever created it.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub datagrams: AtomicU64,
    pub bytes: AtomicU64,
    /// Datagrams that were not RTP or carried an unregistered payload type.
    pub unmapped: AtomicU64,
}

impl ReceiverStats {
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    pub fn unmapped(&self) -> u64 {
        self.unmapped.load(Ordering::Relaxed)
    }
}

struct Bound {
    /// Held to keep the ports reserved; the reader thread owns a clone of
    /// the media socket.
    _media: UdpSocket,
    _control: Option<UdpSocket>,
    reader: JoinHandle<()>,
}

/// Inbound RTP endpoint over UDP.
///
/// Payload types must be registered before traffic is meaningful; datagrams
/// with an unknown payload type are counted as unmapped. On `Init` the
/// receiver binds an adjacent even/odd port pair and starts a reader thread
/// that posts every datagram back to the receiver as `Receiver(Datagram)`.
/// Dropping the receiver stops and joins the reader.
pub struct UdpReceiver {
    notify: Notify,
    bind_ip: IpAddr,
    payload_types: HashMap<u8, Packetization>,
    running: Arc<AtomicBool>,
    bound: Option<Bound>,
    stats: Arc<ReceiverStats>,
}

impl UdpReceiver {
    pub fn new(notify: Notify) -> Self {
        Self::bind_to(notify, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn bind_to(notify: Notify, bind_ip: IpAddr) -> Self {
        Self {
            notify,
            bind_ip,
            payload_types: HashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
            bound: None,
            stats: Arc::new(ReceiverStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    fn register_payload(&mut self, payload_type: u8, packetization: Packetization) -> Result<()> {
        match self.payload_types.entry(payload_type) {
            Entry::Occupied(existing) if *existing.get() != packetization => Err(Error::PayloadConflict {
                payload_type,
                existing: existing.get().to_string(),
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(slot) => {
                slot.insert(packetization);
                tracing::debug!(payload_type, %packetization, "payload type registered");
                Ok(())
            }
        }
    }

    fn init(
        &mut self,
        ctx: &mut Context<'_, Message>,
        media_mode: TransportMode,
        control_mode: TransportMode,
    ) -> Result<u16> {
        if self.bound.is_some() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "receiver already initialized",
            )));
        }
        if media_mode != TransportMode::Udp {
            return Err(Error::UnsupportedTransport {
                channel: Channel::Media,
                mode: media_mode,
            });
        }

        let (media, control) = match control_mode {
            TransportMode::Udp => {
                let (media, control) = udp::bind_port_pair(self.bind_ip)?;
                (media, Some(control))
            }
            TransportMode::None => (UdpSocket::bind(SocketAddr::new(self.bind_ip, 0))?, None),
            other => {
                return Err(Error::UnsupportedTransport {
                    channel: Channel::Control,
                    mode: other,
                });
            }
        };
        let local_port = media.local_addr()?.port();

        let reader_socket = media.try_clone()?;
        let poster = ctx.poster();
        let me = ctx.id();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        let reader = thread::Builder::new()
            .name("rtp-receiver".to_string())
            .spawn(move || {
                udp::read_loop(reader_socket, running, |datagram| {
                    poster.post(
                        me,
                        Message::Receiver(ReceiverCommand::Datagram {
                            len: datagram.len(),
                            payload_type: rtp::payload_type(datagram),
                        }),
                        0,
                    );
                });
            });
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.bound = Some(Bound {
            _media: media,
            _control: control,
            reader,
        });
        tracing::info!(local_port, %control_mode, "RTP receiver bound");
        Ok(local_port)
    }

    fn on_datagram(&mut self, len: usize, payload_type: Option<u8>) {
        self.stats.datagrams.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(len as u64, Ordering::Relaxed);

        match payload_type.and_then(|pt| self.payload_types.get(&pt).map(|p| (pt, *p))) {
            Some((pt, packetization)) => {
                tracing::trace!(payload_type = pt, %packetization, len, "RTP packet received");
            }
            None => {
                self.stats.unmapped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(?payload_type, len, "datagram with unmapped payload type");
            }
        }
    }
}

impl Handler<Message> for UdpReceiver {
    fn on_message(&mut self, msg: Message, ctx: &mut Context<'_, Message>) {
        match msg {
            Message::Receiver(ReceiverCommand::RegisterPayload {
                payload_type,
                packetization,
            }) => {
                if let Err(e) = self.register_payload(payload_type, packetization) {
                    tracing::warn!(error = %e, "payload registration failed");
                    self.notify.post(TransportEvent::Error(e));
                }
            }
            Message::Receiver(ReceiverCommand::Init {
                media_mode,
                control_mode,
            }) => {
                let result = self.init(ctx, media_mode, control_mode);
                if let Err(e) = &result {
                    tracing::warn!(error = %e, "RTP receiver initialization failed");
                }
                self.notify.post(TransportEvent::InitDone(result));
            }
            Message::Receiver(ReceiverCommand::Datagram { len, payload_type }) => {
                self.on_datagram(len, payload_type);
            }
            other => tracing::warn!(kind = other.kind(), "RTP receiver ignoring unexpected message"),
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(bound) = self.bound.take()
            && bound.reader.join().is_err()
        {
            tracing::warn!("RTP receiver reader thread panicked");
        }
        tracing::debug!(
            datagrams = self.stats.datagrams(),
            unmapped = self.stats.unmapped(),
            "RTP receiver released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::looper::Looper;
    use crate::transport::rtp::RtpHeader;
    use parking_lot::Mutex;

    type Events = Arc<Mutex<Vec<std::result::Result<u16, String>>>>;

    /// Creates the receiver on `Listen`, then fires RTP datagrams at it once
    /// it reports its port.
    struct Probe {
        events: Events,
        stats: Arc<Mutex<Option<Arc<ReceiverStats>>>>,
        control_mode: TransportMode,
    }

    impl Handler<Message> for Probe {
        fn on_message(&mut self, msg: Message, ctx: &mut Context<'_, Message>) {
            match msg {
                Message::Listen => {
                    let notify = Notify::new(ctx.poster(), ctx.id(), Message::ReceiverNotify);
                    let receiver = UdpReceiver::bind_to(notify, IpAddr::V4(Ipv4Addr::LOCALHOST));
                    *self.stats.lock() = Some(receiver.stats());
                    let id = ctx.register(Box::new(receiver));
                    for (payload_type, packetization) in [(33, Packetization::H264), (33, Packetization::H265)] {
                        ctx.post(
                            id,
                            Message::Receiver(ReceiverCommand::RegisterPayload {
                                payload_type,
                                packetization,
                            }),
                            0,
                        );
                    }
                    ctx.post(
                        id,
                        Message::Receiver(ReceiverCommand::Init {
                            media_mode: TransportMode::Udp,
                            control_mode: self.control_mode,
                        }),
                        0,
                    );
                }
                Message::ReceiverNotify(TransportEvent::InitDone(result)) => {
                    if let Ok(port) = &result {
                        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
                        let mut header = RtpHeader::new(7, 0);
                        for pt in [33, 33, 96] {
                            let mut packet = header.write(pt, true, 0).to_vec();
                            packet.extend_from_slice(&[0x65, 0x00]);
                            peer.send_to(&packet, ("127.0.0.1", *port)).unwrap();
                        }
                        peer.send_to(b"not rtp", ("127.0.0.1", *port)).unwrap();
                    }
                    self.events.lock().push(result.map_err(|e| e.to_string()));
                    ctx.post_self(Message::Stop, 300_000);
                }
                Message::ReceiverNotify(TransportEvent::Error(e)) => {
                    self.events.lock().push(Err(e.to_string()));
                }
                Message::Stop => ctx.stop(),
                _ => {}
            }
        }
    }

    fn run(control_mode: TransportMode) -> (Events, Option<Arc<ReceiverStats>>) {
        let mut looper = Looper::new("receiver-test");
        let events = Events::default();
        let stats = Arc::new(Mutex::new(None));
        let probe = looper.register(Box::new(Probe {
            events: events.clone(),
            stats: stats.clone(),
            control_mode,
        }));
        looper.post(probe, Message::Listen, 0);
        looper.post(probe, Message::Stop, 5_000_000);
        looper.run();
        let stats = stats.lock().clone();
        (events, stats)
    }

    #[test]
    fn receives_and_classifies_datagrams() {
        let (events, stats) = run(TransportMode::Udp);
        let events = events.lock();

        // Conflicting re-registration of payload type 33 first, then InitDone.
        assert_eq!(events.len(), 2, "events: {events:?}");
        assert!(events[0].as_ref().unwrap_err().contains("already mapped"));
        let port = *events[1].as_ref().unwrap();
        assert_eq!(port % 2, 0);

        let stats = stats.unwrap();
        assert_eq!(stats.datagrams(), 4);
        assert_eq!(stats.unmapped(), 2);
    }

    #[test]
    fn interleaved_control_is_unsupported() {
        let (events, _) = run(TransportMode::TcpInterleaved);
        let events = events.lock();
        let init = events.last().unwrap();
        assert!(init.as_ref().unwrap_err().contains("control channel"));
    }
}
