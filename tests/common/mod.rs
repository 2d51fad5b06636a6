//! Shared test utilities: fake collaborators, token minting and a
//! connected in-memory client

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use jsonwebtoken::{EncodingKey, Header, encode};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use voicelink_gateway::dialogue::{DialogueModel, Exchange};
use voicelink_gateway::memory::MemoryStore;
use voicelink_gateway::transport::{ClientEnd, memory_pair};
use voicelink_gateway::voice::{AudioStream, Synthesizer, Transcriber};
use voicelink_gateway::{
    Collaborators, Error, Gateway, GatewayConfig, JwtVerifier, OutboundUnit, Result,
};

pub const SECRET: &str = "test-secret";
pub const DEVICE: &str = "esp-1";

/// How long a test waits for a frame before failing
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Ordered record of collaborator calls across all fakes
#[derive(Debug, Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub struct FakeTranscriber {
    log: Arc<CallLog>,
    pub text: Mutex<String>,
    pub fail: AtomicBool,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> Result<String> {
        self.log.push(format!("transcribe:{}", wav.len()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Stt("recognizer offline".to_string()));
        }
        Ok(self.text.lock().unwrap().clone())
    }
}

/// Replies "reply to {text}", optionally after a delay
pub struct FakeDialogue {
    log: Arc<CallLog>,
    pub delay: Mutex<Duration>,
    pub fail: AtomicBool,
    /// History and memory seen by each call
    pub seen: Mutex<Vec<(Vec<Exchange>, Option<String>)>>,
}

#[async_trait]
impl DialogueModel for FakeDialogue {
    async fn generate(
        &self,
        history: &[Exchange],
        memory: Option<&str>,
        user_text: &str,
    ) -> Result<String> {
        self.log.push(format!("generate:{user_text}"));
        self.seen
            .lock()
            .unwrap()
            .push((history.to_vec(), memory.map(str::to_string)));

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.log.push(format!("generated:{user_text}"));

        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Dialogue("model unavailable".to_string()));
        }
        Ok(format!("reply to {user_text}"))
    }
}

/// Yields `audio` as a single chunk, or keeps the stream open when
/// `endless` is set
pub struct FakeSynthesizer {
    log: Arc<CallLog>,
    pub audio: Vec<u8>,
    pub fail: AtomicBool,
    pub endless: AtomicBool,
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.log.push(format!("synthesize:{text}"));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tts("voice offline".to_string()));
        }

        let first = stream::iter(vec![Ok(self.audio.clone())]);
        if self.endless.load(Ordering::SeqCst) {
            Ok(first.chain(stream::pending()).boxed())
        } else {
            Ok(first.boxed())
        }
    }
}

pub struct FakeMemory {
    log: Arc<CallLog>,
    pub saved: Mutex<Vec<(String, String)>>,
    pub stored: Mutex<Option<String>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl MemoryStore for FakeMemory {
    async fn save(&self, device_id: &str, content: &str) -> Result<()> {
        self.log.push(format!("save:{content}"));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Memory("store unavailable".to_string()));
        }
        self.saved
            .lock()
            .unwrap()
            .push((device_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn recall(&self, _device_id: &str, query: &str) -> Result<Option<String>> {
        self.log.push(format!("recall:{query}"));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Memory("store unavailable".to_string()));
        }
        Ok(self.stored.lock().unwrap().clone())
    }
}

/// All fakes behind one gateway
pub struct Fakes {
    pub log: Arc<CallLog>,
    pub transcriber: Arc<FakeTranscriber>,
    pub dialogue: Arc<FakeDialogue>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub memory: Arc<FakeMemory>,
}

impl Fakes {
    pub fn new() -> Self {
        let log = Arc::new(CallLog::default());
        Self {
            transcriber: Arc::new(FakeTranscriber {
                log: log.clone(),
                text: Mutex::new("hello there".to_string()),
                fail: AtomicBool::new(false),
            }),
            dialogue: Arc::new(FakeDialogue {
                log: log.clone(),
                delay: Mutex::new(Duration::ZERO),
                fail: AtomicBool::new(false),
                seen: Mutex::new(Vec::new()),
            }),
            synthesizer: Arc::new(FakeSynthesizer {
                log: log.clone(),
                audio: vec![7; 10],
                fail: AtomicBool::new(false),
                endless: AtomicBool::new(false),
            }),
            memory: Arc::new(FakeMemory {
                log: log.clone(),
                saved: Mutex::new(Vec::new()),
                stored: Mutex::new(None),
                fail: AtomicBool::new(false),
            }),
            log,
        }
    }

    fn collaborators(&self, config: &GatewayConfig) -> Collaborators {
        Collaborators {
            transcriber: self.transcriber.clone(),
            dialogue: self.dialogue.clone(),
            synthesizer: self.synthesizer.clone(),
            memory: Some(self.memory.clone() as Arc<dyn MemoryStore>),
            verifier: Arc::new(JwtVerifier::new(&config.jwt_secret)),
        }
    }
}

/// Configuration with test secrets and default tunables
pub fn test_config() -> GatewayConfig {
    GatewayConfig::from_lookup(|key| match key {
        "OPENAI_API_KEY" => Some("sk-test".to_string()),
        "JWT_SECRET_KEY" => Some(SECRET.to_string()),
        _ => None,
    })
    .expect("test config")
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub fakes: Fakes,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let fakes = Fakes::new();
        let gateway = Gateway::new(&config, fakes.collaborators(&config)).expect("gateway");
        Self {
            gateway: Arc::new(gateway),
            fakes,
        }
    }

    /// Open a raw connection without sending anything
    pub fn connect(&self) -> (ClientEnd, JoinHandle<()>) {
        let (sink, source, client) = memory_pair(64);
        let gateway = Arc::clone(&self.gateway);
        let task = tokio::spawn(async move {
            gateway.serve(Box::new(sink), Box::new(source)).await;
        });
        (client, task)
    }

    /// Connect and complete the handshake, returning the welcome frame
    pub async fn connect_authenticated(&self) -> (ClientEnd, JoinHandle<()>, Value) {
        let (mut client, task) = self.connect();
        client
            .send_text(hello(&mint_token("user-1", 3_600)))
            .await
            .expect("send hello");
        let welcome = next_json(&mut client).await;
        assert_eq!(welcome["type"], "welcome", "{welcome}");
        (client, task, welcome)
    }
}

/// Sign a device token expiring `ttl_secs` from now
pub fn mint_token(subject: &str, ttl_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + ttl_secs;
    encode(
        &Header::default(),
        &json!({ "sub": subject, "exp": exp }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("mint token")
}

pub fn hello(token: &str) -> String {
    json!({
        "type": "hello",
        "device_id": DEVICE,
        "headers": { "Authorization": format!("Bearer {token}") },
        "audio_params": { "format": "pcm", "sample_rate": 16000 },
    })
    .to_string()
}

pub fn text_frame(text: &str) -> String {
    json!({ "type": "text", "text": text }).to_string()
}

/// 100ms of PCM16 at 16kHz; amplitude 0 is silence
pub fn pcm_chunk(amplitude: i16) -> Vec<u8> {
    (0..1_600)
        .flat_map(|i| (if i % 2 == 0 { amplitude } else { -amplitude }).to_le_bytes())
        .collect()
}

/// Voiced speech followed by a full second of silence
pub async fn send_utterance(client: &ClientEnd, voiced_chunks: usize) {
    for _ in 0..voiced_chunks {
        client.send_binary(pcm_chunk(8_000)).await.expect("send audio");
    }
    for _ in 0..10 {
        client.send_binary(pcm_chunk(0)).await.expect("send silence");
    }
}

/// Next unit from the gateway, failing the test after [`RECV_TIMEOUT`]
pub async fn next_unit(client: &mut ClientEnd) -> Option<OutboundUnit> {
    tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for gateway")
}

/// Next unit, which must be a JSON text frame
pub async fn next_json(client: &mut ClientEnd) -> Value {
    match next_unit(client).await {
        Some(OutboundUnit::Text(text)) => serde_json::from_str(&text).expect("json frame"),
        other => panic!("expected text frame, got {other:?}"),
    }
}

/// Read a full reply: text frame, audio announcement and its binary chunks
pub async fn next_reply(client: &mut ClientEnd) -> (String, Vec<Vec<u8>>) {
    let text = next_json(client).await;
    assert_eq!(text["type"], "text", "{text}");

    let announce = next_json(client).await;
    assert_eq!(announce["type"], "audio", "{announce}");

    let mut chunks = Vec::new();
    match next_unit(client).await {
        Some(OutboundUnit::Binary(chunk)) => chunks.push(chunk),
        other => panic!("expected audio chunk, got {other:?}"),
    }
    (text["text"].as_str().unwrap_or_default().to_string(), chunks)
}

/// Wait for the close frame, skipping anything sent before it
pub async fn next_close(client: &mut ClientEnd) -> (u16, String) {
    loop {
        match next_unit(client).await {
            Some(OutboundUnit::Close { code, reason }) => return (code, reason),
            Some(_) => {}
            None => panic!("transport ended without a close frame"),
        }
    }
}

pub fn secret(value: &str) -> SecretString {
    SecretString::from(value.to_string())
}
