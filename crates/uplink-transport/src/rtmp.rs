//! RTMP publishing session.
//!
//! The engine drives sessions from plain OS threads, so each session owns a
//! current-thread tokio runtime and blocks on it for every network call.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, instrument, trace, warn};
use uplink_encoder::CodecConfig;

use crate::connection::RtmpEndpoint;
use crate::error::TransportError;
use crate::flv;
use crate::{NetworkStats, SessionMetadata, TransportConnector, TransportResult, TransportSession};

const READ_BUFFER_SIZE: usize = 4096;

/// Opens [`RtmpSession`]s.
#[derive(Debug, Clone)]
pub struct RtmpConnector {
    /// Deadline for TCP connect, handshake, connect and publish.
    pub connect_timeout: Duration,
    /// Deadline for a single message write.
    pub write_timeout: Duration,
}

impl Default for RtmpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConnector for RtmpConnector {
    fn open(&self, url: &str) -> TransportResult<Box<dyn TransportSession>> {
        let session = RtmpSession::connect(url, self.connect_timeout, self.write_timeout)?;
        Ok(Box::new(session))
    }
}

/// Established connection and protocol state.
struct RtmpConnection {
    stream: TcpStream,
    session: ClientSession,
}

/// One publishing RTMP session.
pub struct RtmpSession {
    runtime: Runtime,
    connection: Option<RtmpConnection>,
    write_timeout: Duration,
    bytes_sent: u64,
    dropped_frames: u64,
    /// Exponential moving average of write latency, in milliseconds.
    delay_ms: f64,
}

impl RtmpSession {
    /// Connect and start publishing on `url`.
    #[instrument(name = "rtmp_connect", skip(connect_timeout, write_timeout))]
    pub fn connect(
        url: &str,
        connect_timeout: Duration,
        write_timeout: Duration,
    ) -> TransportResult<Self> {
        let endpoint = RtmpEndpoint::parse(url)?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(TransportError::Io)?;

        let connection = runtime
            .block_on(tokio::time::timeout(connect_timeout, connect_rtmp(&endpoint)))
            .map_err(|_| TransportError::Timeout(connect_timeout.as_millis() as u64))??;

        Ok(Self {
            runtime,
            connection: Some(connection),
            write_timeout,
            bytes_sent: 0,
            dropped_frames: 0,
            delay_ms: 0.0,
        })
    }

    /// Write one session result and drain inbound traffic.
    ///
    /// On failure the connection is dropped; later calls fail fast.
    fn publish(&mut self, result: ClientSessionResult, payload_len: usize) -> TransportResult<()> {
        let connection = self.connection.as_mut().ok_or(TransportError::NotConnected)?;
        let write_timeout = self.write_timeout;

        let started = Instant::now();
        let outcome = self
            .runtime
            .block_on(write_and_drain(connection, result, write_timeout));

        match outcome {
            Ok(()) => {
                let sample = started.elapsed().as_secs_f64() * 1000.0;
                self.delay_ms = self.delay_ms * 0.875 + sample * 0.125;
                self.bytes_sent += payload_len as u64;
                Ok(())
            }
            Err(e) => {
                warn!("RTMP write failed: {}", e);
                self.dropped_frames += 1;
                self.connection = None;
                Err(e)
            }
        }
    }

    fn session(&mut self) -> TransportResult<&mut ClientSession> {
        self.connection
            .as_mut()
            .map(|c| &mut c.session)
            .ok_or(TransportError::NotConnected)
    }

    fn publish_video_tag(
        &mut self,
        tag: Bytes,
        timestamp_us: u64,
        can_be_dropped: bool,
    ) -> TransportResult<()> {
        let len = tag.len();
        let result = self
            .session()?
            .publish_video_data(tag, rtmp_timestamp(timestamp_us), can_be_dropped)
            .map_err(|e| TransportError::Send(format!("Failed to publish video: {:?}", e)))?;
        self.publish(result, len)
    }
}

impl TransportSession for RtmpSession {
    fn send_video(
        &mut self,
        payload: &[u8],
        timestamp_us: u64,
        is_key_unit: bool,
    ) -> TransportResult<()> {
        let Some(tag) = flv::avc_frame_tag(payload, is_key_unit) else {
            trace!("Access unit carried no slice data, skipping");
            return Ok(());
        };
        self.publish_video_tag(tag, timestamp_us, !is_key_unit)
    }

    fn send_audio(&mut self, payload: &[u8], timestamp_us: u64) -> TransportResult<()> {
        let tag = flv::aac_frame_tag(payload);
        let len = tag.len();
        let result = self
            .session()?
            .publish_audio_data(tag, rtmp_timestamp(timestamp_us), false)
            .map_err(|e| TransportError::Send(format!("Failed to publish audio: {:?}", e)))?;
        self.publish(result, len)
    }

    fn send_codec_config(&mut self, config: &CodecConfig) -> TransportResult<()> {
        let tag = flv::avc_sequence_header(config)
            .ok_or_else(|| TransportError::Protocol("SPS too short".to_string()))?;
        debug!(sps = config.sps.len(), pps = config.pps.len(), "Sending AVC sequence header");
        self.publish_video_tag(tag, 0, false)
    }

    fn set_metadata(&mut self, metadata: &SessionMetadata) -> TransportResult<()> {
        let meta = stream_metadata(metadata);
        let result = self
            .session()?
            .publish_metadata(&meta)
            .map_err(|e| TransportError::Send(format!("Failed to publish metadata: {:?}", e)))?;
        self.publish(result, 0)?;

        match flv::aac_sequence_header(metadata.audio_sample_rate, metadata.audio_channels) {
            Some(header) => {
                let len = header.len();
                let result = self
                    .session()?
                    .publish_audio_data(header, RtmpTimestamp::new(0), false)
                    .map_err(|e| {
                        TransportError::Send(format!("Failed to publish AAC header: {:?}", e))
                    })?;
                self.publish(result, len)?;
            }
            None => warn!(
                sample_rate = metadata.audio_sample_rate,
                channels = metadata.audio_channels,
                "Unsupported audio format, skipping AAC sequence header"
            ),
        }

        info!(
            width = metadata.width,
            height = metadata.height,
            bitrate = metadata.video_bitrate,
            "Published stream metadata"
        );
        Ok(())
    }

    fn stats(&self) -> Option<NetworkStats> {
        self.connection.as_ref()?;
        Some(NetworkStats {
            bytes_sent: self.bytes_sent,
            delay_ms: self.delay_ms.round() as u32,
            // TCP retransmits; loss shows up as delay instead.
            packet_loss_percent: 0,
            dropped_frames: self.dropped_frames,
        })
    }

    fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            let _ = self.runtime.block_on(connection.stream.shutdown());
            info!("RTMP session closed");
        }
    }
}

impl Drop for RtmpSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn stream_metadata(metadata: &SessionMetadata) -> StreamMetadata {
    let mut meta = StreamMetadata::new();
    meta.video_width = Some(metadata.width);
    meta.video_height = Some(metadata.height);
    meta.video_codec_id = Some(flv::AVC_CODEC_ID);
    meta.video_frame_rate = Some(metadata.fps as f32);
    meta.video_bitrate_kbps = Some(metadata.video_bitrate / 1000);
    meta.audio_codec_id = Some(flv::AAC_SOUND_FORMAT);
    meta.audio_sample_rate = Some(metadata.audio_sample_rate);
    meta.audio_channels = Some(metadata.audio_channels);
    meta.audio_is_stereo = Some(metadata.audio_channels > 1);
    meta.encoder = Some(concat!("uplink/", env!("CARGO_PKG_VERSION")).to_string());
    meta
}

fn rtmp_timestamp(timestamp_us: u64) -> RtmpTimestamp {
    // RTMP timestamps are 32-bit milliseconds and wrap.
    RtmpTimestamp::new((timestamp_us / 1000) as u32)
}

async fn write_and_drain(
    connection: &mut RtmpConnection,
    result: ClientSessionResult,
    write_timeout: Duration,
) -> TransportResult<()> {
    if let ClientSessionResult::OutboundResponse(packet) = result {
        tokio::time::timeout(write_timeout, connection.stream.write_all(&packet.bytes))
            .await
            .map_err(|_| TransportError::Timeout(write_timeout.as_millis() as u64))??;
    }
    drain_inbound(connection).await
}

/// Read whatever the server has sent without waiting, answering as needed.
async fn drain_inbound(connection: &mut RtmpConnection) -> TransportResult<()> {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match connection.stream.try_read(&mut buf) {
            Ok(0) => return Err(TransportError::Connection("Connection closed by server".into())),
            Ok(n) => {
                let results = connection
                    .session
                    .handle_input(&buf[..n])
                    .map_err(|e| TransportError::Protocol(format!("{:?}", e)))?;
                for result in results {
                    match result {
                        ClientSessionResult::OutboundResponse(packet) => {
                            connection.stream.write_all(&packet.bytes).await?;
                        }
                        ClientSessionResult::RaisedEvent(event) => {
                            trace!("Received event: {:?}", event);
                        }
                        _ => {}
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
}

/// Read session input until `accepted` matches a raised event.
async fn await_event(
    stream: &mut TcpStream,
    session: &mut ClientSession,
    what: &str,
    accepted: impl Fn(&ClientSessionEvent) -> TransportResult<bool>,
) -> TransportResult<()> {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Connection(format!(
                "Connection closed waiting for {}",
                what
            )));
        }

        let results = session
            .handle_input(&buf[..n])
            .map_err(|e| TransportError::Connection(format!("Session input error: {:?}", e)))?;

        let mut done = false;
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    stream.write_all(&packet.bytes).await?;
                }
                ClientSessionResult::RaisedEvent(event) => {
                    if accepted(&event)? {
                        done = true;
                    } else {
                        trace!("Received event: {:?}", event);
                    }
                }
                _ => {}
            }
        }
        if done {
            debug!("{} accepted", what);
            return Ok(());
        }
    }
}

async fn connect_rtmp(endpoint: &RtmpEndpoint) -> TransportResult<RtmpConnection> {
    info!(host = %endpoint.host, port = endpoint.port, app = %endpoint.app, "Connecting to RTMP server");

    let mut stream = TcpStream::connect(endpoint.address())
        .await
        .map_err(|e| TransportError::Connection(format!("TCP connect failed: {}", e)))?;
    stream.set_nodelay(true)?;

    let leftover = handshake(&mut stream).await?;

    let (mut session, initial) = ClientSession::new(ClientSessionConfig::new())
        .map_err(|e| TransportError::Connection(format!("Session creation failed: {:?}", e)))?;
    for result in initial {
        if let ClientSessionResult::OutboundResponse(packet) = result {
            stream.write_all(&packet.bytes).await?;
        }
    }
    if !leftover.is_empty() {
        for result in session
            .handle_input(&leftover)
            .map_err(|e| TransportError::Protocol(format!("{:?}", e)))?
        {
            if let ClientSessionResult::OutboundResponse(packet) = result {
                stream.write_all(&packet.bytes).await?;
            }
        }
    }

    let request = session
        .request_connection(endpoint.app.clone())
        .map_err(|e| TransportError::Connection(format!("Connection request failed: {:?}", e)))?;
    if let ClientSessionResult::OutboundResponse(packet) = request {
        stream.write_all(&packet.bytes).await?;
    }
    await_event(&mut stream, &mut session, "connect", |event| match event {
        ClientSessionEvent::ConnectionRequestAccepted => Ok(true),
        ClientSessionEvent::ConnectionRequestRejected { description } => Err(
            TransportError::Connection(format!("Connection rejected: {}", description)),
        ),
        _ => Ok(false),
    })
    .await?;

    let request = session
        .request_publishing(endpoint.stream_key.clone(), PublishRequestType::Live)
        .map_err(|e| TransportError::Connection(format!("Publish request failed: {:?}", e)))?;
    if let ClientSessionResult::OutboundResponse(packet) = request {
        stream.write_all(&packet.bytes).await?;
    }
    await_event(&mut stream, &mut session, "publish", |event| {
        Ok(matches!(event, ClientSessionEvent::PublishRequestAccepted))
    })
    .await?;

    info!("RTMP publishing started");
    Ok(RtmpConnection { stream, session })
}

/// Client side of the RTMP handshake. Returns bytes read past its end.
async fn handshake(stream: &mut TcpStream) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::Connection(format!("Handshake generation failed: {:?}", e)))?;
    stream.write_all(&p0_p1).await?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Connection(
                "Connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                debug!("Handshake complete");
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::Connection(format!("Handshake failed: {:?}", e)));
            }
        }
    }
}
