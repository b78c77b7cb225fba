//! The whole loop: scripted microphone → server → gapless playback.

use futures::{SinkExt, StreamExt};
use parley::audio::capture_gate::{CaptureConfig, CaptureEvent, CaptureGate};
use parley::audio::pcm::AudioFrame;
use parley::audio::source::MockAudioSource;
use parley::client::{ClientEvent, VoiceClient, VoiceClientConfig, bridge_capture};
use parley::defaults;
use parley::pipeline::capture::{CapturePipeline, CapturePipelineConfig};
use parley::playback::{
    ManualClock, PlaybackConfig, PlaybackEvent, PlaybackScheduler, RealtimeRenderer,
    RecordingOutput, TimelineOutput,
};
use parley::session::engines::{EngineRegistry, MockTranscriber};
use parley::transport::{
    ChatMode, ClientMessage, ClientSettings, ReconnectPolicy, ServerMessage, ServerSettings,
    SessionServer, TransportClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

const WAIT: Duration = Duration::from_secs(5);

fn square(amplitude: i16) -> Vec<i16> {
    (0..512)
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect()
}

async fn talk_once(chat_mode: ChatMode) -> (Vec<ClientEvent>, parley::client::ClientStats) {
    let mut registry = EngineRegistry::builtin();
    registry.register_transcriber("mock", Arc::new(MockTranscriber::new("hello")));
    registry.set_default_transcriber("mock").unwrap();
    let server = SessionServer::bind("127.0.0.1:0", registry, ServerSettings::default())
        .await
        .unwrap()
        .spawn()
        .unwrap();

    let source = MockAudioSource::new()
        .with_repeated(vec![0; 512], 5)
        .with_repeated(square(4000), 12)
        .with_repeated(vec![0; 512], 15)
        .finite();
    let mut capture = CapturePipeline::new(CapturePipelineConfig {
        realtime_files: false,
        ..CapturePipelineConfig::default()
    })
    .start(Box::new(source), CaptureGate::new(CaptureConfig::default()))
    .unwrap();

    let timeline = TimelineOutput::new(defaults::SAMPLE_RATE);
    let renderer = RealtimeRenderer::spawn(
        timeline.clone(),
        defaults::SAMPLE_RATE,
        Duration::from_millis(5),
        None,
    )
    .unwrap();
    let (scheduler, playback_events) = PlaybackScheduler::new(
        timeline,
        PlaybackConfig {
            lead_time: Duration::from_millis(20),
            ..PlaybackConfig::default()
        },
    );

    let transport = TransportClient::connect(ClientSettings {
        url: server.url("/session"),
        reconnect: ReconnectPolicy::disabled(),
        ..ClientSettings::default()
    })
    .await
    .unwrap();

    let (client, mut events) = VoiceClient::new(
        transport,
        scheduler,
        playback_events,
        VoiceClientConfig {
            chat_mode,
            linger: Duration::from_millis(300),
            ..VoiceClientConfig::default()
        },
    );
    let captured = bridge_capture(capture.take_events().unwrap());
    let stats = timeout(Duration::from_secs(10), client.run(captured))
        .await
        .expect("client did not finish")
        .unwrap();

    capture.stop();
    renderer.stop().unwrap();
    server.shutdown().await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    (seen, stats)
}

#[tokio::test]
async fn test_streamed_reply_is_heard_then_client_exits() {
    let (events, stats) = talk_once(ChatMode::Stream).await;

    assert_eq!(events.first(), Some(&ClientEvent::Connected));
    assert_eq!(events.last(), Some(&ClientEvent::Closed));
    assert!(events.contains(&ClientEvent::Transcript("hello".to_string())));

    let reply: String = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::AgentDelta(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(reply, "You said: hello.");

    let started = events
        .iter()
        .position(|e| *e == ClientEvent::Playback(PlaybackEvent::FirstAudioStart))
        .expect("playback never started");
    let finished = events
        .iter()
        .position(|e| *e == ClientEvent::Playback(PlaybackEvent::AllAudioFinished))
        .expect("playback never finished");
    assert!(started < finished);

    assert_eq!(stats.segments_sent, 1);
    assert!(stats.chunks_played >= 1);
    assert_eq!(stats.chunks_dropped, 0);
    assert_eq!(stats.barge_ins, 0);
}

#[tokio::test]
async fn test_single_mode_reply_plays_once() {
    let (events, stats) = talk_once(ChatMode::Single).await;

    assert!(events.contains(&ClientEvent::AgentMessage("You said: hello.".to_string())));
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == ClientEvent::Playback(PlaybackEvent::AllAudioFinished))
            .count(),
        1
    );
    assert_eq!(stats.chunks_played, 1);
}

/// One accepted connection, driven step by step by the test.
struct ScriptedPeer {
    socket: WebSocketStream<TcpStream>,
}

impl ScriptedPeer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        Self {
            socket: accept_async(stream).await.unwrap(),
        }
    }

    async fn send(&mut self, message: ServerMessage) {
        self.socket
            .send(Message::Text(message.to_json().unwrap()))
            .await
            .unwrap();
    }

    /// Next control message from the client, skipping audio and heartbeats.
    async fn recv(&mut self) -> ClientMessage {
        loop {
            let frame = timeout(WAIT, self.socket.next())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client hung up")
                .unwrap();
            if let Message::Text(text) = frame {
                return ClientMessage::from_json(&text).unwrap();
            }
        }
    }
}

/// Collects client events while the test waits on specific ones.
struct Observer {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    seen: Vec<ClientEvent>,
}

impl Observer {
    async fn wait_for(&mut self, expected: ClientEvent) {
        loop {
            let event = timeout(WAIT, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}", expected))
                .expect("client event stream ended");
            let found = event == expected;
            self.seen.push(event);
            if found {
                return;
            }
        }
    }

    fn finish(mut self) -> Vec<ClientEvent> {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        self.seen
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// 100 ms of reply audio.
fn chunk(amplitude: i16) -> ServerMessage {
    ServerMessage::AudioChunk {
        data: AudioFrame::from_samples(&vec![amplitude; 1600]).to_base64(),
    }
}

fn delta(text: &str) -> ServerMessage {
    ServerMessage::AgentStream {
        delta: text.to_string(),
    }
}

struct Scripted {
    client: VoiceClient<RecordingOutput>,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    capture: mpsc::UnboundedSender<CaptureEvent>,
    listener: TcpListener,
    peer: ScriptedPeer,
    output: RecordingOutput,
    observer: Observer,
}

/// A client on a hand-driven clock, connected to a server the test scripts.
async fn start_scripted(reconnect: ReconnectPolicy) -> Scripted {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/session", listener.local_addr().unwrap());
    let (transport, peer) = tokio::join!(
        TransportClient::connect(ClientSettings {
            url,
            reconnect,
            ..ClientSettings::default()
        }),
        ScriptedPeer::accept(&listener),
    );

    let output = RecordingOutput::new(ManualClock::new());
    let (scheduler, playback_events) =
        PlaybackScheduler::new(output.clone(), PlaybackConfig::default());
    let (client, events) = VoiceClient::new(
        transport.unwrap(),
        scheduler,
        playback_events,
        VoiceClientConfig {
            poll_interval: Duration::from_millis(5),
            linger: Duration::from_millis(50),
            ..VoiceClientConfig::default()
        },
    );
    let (capture, capture_rx) = mpsc::unbounded_channel();

    Scripted {
        client,
        capture_rx,
        capture,
        listener,
        peer,
        output,
        observer: Observer {
            events,
            seen: Vec::new(),
        },
    }
}

#[tokio::test]
async fn test_speech_between_late_chunks_still_barges_in() {
    let Scripted {
        client,
        capture_rx,
        capture,
        listener: _listener,
        mut peer,
        output,
        mut observer,
    } = start_scripted(ReconnectPolicy::disabled()).await;

    let script = async move {
        assert!(matches!(peer.recv().await, ClientMessage::Config { .. }));
        peer.send(delta("Once upon a time")).await;
        peer.send(chunk(3000)).await;
        wait_until("first chunk scheduled", || output.scheduled().len() == 1).await;

        // The chunk plays out while the next one is still being synthesized.
        output.clock().advance(Duration::from_secs(1));
        observer
            .wait_for(ClientEvent::Playback(PlaybackEvent::AllAudioFinished))
            .await;

        capture.send(CaptureEvent::SpeechStart).unwrap();
        assert_eq!(peer.recv().await, ClientMessage::BargeIn);
        observer.wait_for(ClientEvent::BargeIn).await;
        peer.send(ServerMessage::BargeInAck).await;
        drop(capture);
        (peer, observer)
    };

    let (stats, (_peer, observer)) = tokio::join!(
        timeout(Duration::from_secs(10), client.run(capture_rx)),
        script
    );
    let stats = stats.expect("client did not finish").unwrap();

    assert_eq!(stats.barge_ins, 1);
    assert_eq!(observer.finish().last(), Some(&ClientEvent::Closed));
}

#[tokio::test]
async fn test_barge_in_drops_reply_traffic_until_ack() {
    let Scripted {
        client,
        capture_rx,
        capture,
        listener: _listener,
        mut peer,
        output,
        mut observer,
    } = start_scripted(ReconnectPolicy::disabled()).await;

    let script = async move {
        assert!(matches!(peer.recv().await, ClientMessage::Config { .. }));
        peer.send(delta("Let me tell you")).await;
        peer.send(chunk(3000)).await;
        wait_until("reply scheduled", || output.scheduled().len() == 1).await;

        capture.send(CaptureEvent::SpeechStart).unwrap();
        assert_eq!(peer.recv().await, ClientMessage::BargeIn);
        observer
            .wait_for(ClientEvent::Playback(PlaybackEvent::Cancelled))
            .await;
        assert_eq!(output.halt_count(), 1);

        // Already in flight when the barge-in reached the server.
        peer.send(delta(" about the sea")).await;
        peer.send(chunk(3000)).await;
        peer.send(ServerMessage::AgentStreamComplete).await;
        peer.send(ServerMessage::BargeInAck).await;

        peer.send(delta("Sure.")).await;
        peer.send(chunk(2000)).await;
        peer.send(ServerMessage::AgentStreamComplete).await;
        wait_until("next reply scheduled", || output.scheduled().len() == 2).await;

        output.clock().advance(Duration::from_secs(1));
        observer
            .wait_for(ClientEvent::Playback(PlaybackEvent::AllAudioFinished))
            .await;
        drop(capture);
        (peer, observer)
    };

    let (stats, (_peer, observer)) = tokio::join!(
        timeout(Duration::from_secs(10), client.run(capture_rx)),
        script
    );
    let stats = stats.expect("client did not finish").unwrap();
    let events = observer.finish();

    assert_eq!(stats.barge_ins, 1);
    assert_eq!(stats.chunks_dropped, 1);
    assert_eq!(stats.chunks_played, 2);

    let deltas: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::AgentDelta(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(deltas, vec!["Let me tell you", "Sure."]);
    assert_eq!(
        events
            .iter()
            .filter(|e| **e == ClientEvent::ReplyComplete)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_config_is_sent_again_after_reconnect() {
    let Scripted {
        client,
        capture_rx,
        capture,
        listener,
        mut peer,
        output: _output,
        observer,
    } = start_scripted(ReconnectPolicy {
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        max_attempts: 5,
    })
    .await;

    let script = async move {
        assert!(matches!(peer.recv().await, ClientMessage::Config { .. }));
        drop(peer);

        let mut peer = ScriptedPeer::accept(&listener).await;
        match peer.recv().await {
            ClientMessage::Config { chat_mode, .. } => {
                assert_eq!(chat_mode, Some(ChatMode::Stream))
            }
            other => panic!("expected config first, got {:?}", other),
        }
        drop(capture);
        (peer, listener, observer)
    };

    let (stats, (_peer, _listener, observer)) = tokio::join!(
        timeout(Duration::from_secs(10), client.run(capture_rx)),
        script
    );
    stats.expect("client did not finish").unwrap();
    let events = observer.finish();

    assert_eq!(
        events
            .iter()
            .filter(|e| **e == ClientEvent::Connected)
            .count(),
        2
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ClientEvent::Disconnected(_)))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ClientEvent::Reconnecting { attempt: 1, .. }))
    );
    assert_eq!(events.last(), Some(&ClientEvent::Closed));
}
