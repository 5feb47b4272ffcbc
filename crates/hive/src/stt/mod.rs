//! Streaming speech-to-text.
//!
//! Devices stream utterance audio as `zmqSTTRequest` bridge frames. Frames
//! are buffered per `(device, utterance)` until one carries END_OF_SPEECH,
//! then the whole utterance is transcribed on the STT pool and exactly one
//! FINAL `zmqSTTResponse` goes back, carrying either the speech or an error
//! code.

pub mod wav;
pub mod whisper;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hiveproto::bridge::{now_ms, SttResponseType};
use hiveproto::{SttRequest, SttResponse, VadState};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::publisher::{send_bridge, Publisher};
use crate::workers::WorkerPool;

pub use whisper::WhisperTranscriber;

/// `error_code` on a failed transcription reply.
pub const TRANSCRIPTION_ERROR_CODE: i32 = 66;

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("failed to encode audio: {0}")]
    Wav(#[from] hound::Error),

    #[error("{0}")]
    Request(String),

    #[error("transcript was empty")]
    Empty,
}

/// One recognized word with offsets in seconds from the start of the audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub text: String,
    pub words: Vec<WordTiming>,
}

/// Speech recognition collaborator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcript, TranscriptionError>;
}

/// A complete utterance ready for transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub device_id: String,
    pub utterance_id: String,
    pub audio: Vec<u8>,
    /// Device timestamp of the first frame, in milliseconds.
    pub start_timestamp: u64,
    pub frames: usize,
}

/// Live utterances keyed by `(device_id, utterance_id)`.
#[derive(Debug, Default)]
pub struct UtteranceAccumulator {
    live: DashMap<(String, String), Utterance>,
}

impl UtteranceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer one frame. Returns the finished utterance on END_OF_SPEECH;
    /// the entry is gone after that, so a later frame with the same id
    /// starts over.
    pub fn on_frame(
        &self,
        device_id: &str,
        utterance_id: &str,
        audio: &[u8],
        timestamp: u64,
        vad: VadState,
    ) -> Option<Utterance> {
        let key = (device_id.to_string(), utterance_id.to_string());
        {
            let mut entry = self.live.entry(key.clone()).or_insert_with(|| Utterance {
                device_id: device_id.to_string(),
                utterance_id: utterance_id.to_string(),
                audio: Vec::new(),
                start_timestamp: timestamp,
                frames: 0,
            });
            entry.audio.extend_from_slice(audio);
            entry.frames += 1;
        }

        if vad == VadState::EndOfSpeech {
            self.live.remove(&key).map(|(_, utterance)| utterance)
        } else {
            None
        }
    }

    /// Drop every partial utterance from `device_id`.
    pub fn discard_device(&self, device_id: &str) -> usize {
        let before = self.live.len();
        self.live.retain(|(device, _), _| device != device_id);
        before - self.live.len()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

/// Transcribe an utterance into its reply frame. Never fails: errors become
/// an error-coded reply.
pub async fn transcribe_utterance(utterance: &Utterance, transcriber: &dyn Transcriber) -> SttResponse {
    let mut resp = SttResponse {
        uuid: utterance.utterance_id.clone(),
        r#type: SttResponseType::Final as i32,
        timestamp: now_ms(),
        ..Default::default()
    };

    match recognize(&utterance.audio, transcriber).await {
        Ok(transcript) => {
            let (start, end) = word_span(&transcript.words);
            resp.start_timestamp = utterance.start_timestamp.saturating_add(start);
            resp.end_timestamp = utterance.start_timestamp.saturating_add(end);
            info!(
                device.id = %utterance.device_id,
                utterance.id = %utterance.utterance_id,
                speech = %transcript.text,
                "STT final"
            );
            resp.speech = transcript.text;
        }
        Err(e) => {
            warn!(
                device.id = %utterance.device_id,
                utterance.id = %utterance.utterance_id,
                error = %e,
                "Transcription failed"
            );
            resp.error_code = TRANSCRIPTION_ERROR_CODE;
            resp.error_message = e.to_string();
        }
    }
    resp
}

async fn recognize(pcm: &[u8], transcriber: &dyn Transcriber) -> Result<Transcript, TranscriptionError> {
    let wav = wav::pcm16_to_wav(pcm)?;
    let transcript = transcriber.transcribe(wav).await?;
    if transcript.text.trim().is_empty() {
        return Err(TranscriptionError::Empty);
    }
    Ok(transcript)
}

/// Earliest word start and latest word end, in whole milliseconds.
fn word_span(words: &[WordTiming]) -> (u64, u64) {
    if words.is_empty() {
        return (0, 0);
    }
    let start = words.iter().map(|w| w.start).fold(f64::INFINITY, f64::min);
    let end = words.iter().map(|w| w.end).fold(f64::NEG_INFINITY, f64::max);
    ((start * 1000.0).max(0.0) as u64, (end * 1000.0).max(0.0) as u64)
}

/// Wires the accumulator to transcription and the reply path.
pub struct SpeechService {
    accumulator: UtteranceAccumulator,
    transcriber: Arc<dyn Transcriber>,
    publisher: Arc<dyn Publisher>,
    pool: WorkerPool,
}

impl SpeechService {
    pub fn new(transcriber: Arc<dyn Transcriber>, publisher: Arc<dyn Publisher>, pool: WorkerPool) -> Self {
        Self {
            accumulator: UtteranceAccumulator::new(),
            transcriber,
            publisher,
            pool,
        }
    }

    pub fn accumulator(&self) -> &UtteranceAccumulator {
        &self.accumulator
    }

    /// Handle one STT request frame. Returns without waiting for
    /// transcription.
    pub fn on_request(&self, device_id: &str, req: &SttRequest) {
        let vad = VadState::try_from(req.vad).unwrap_or(VadState::Unknown);
        debug!(device.id = device_id, utterance.id = %req.uuid, ?vad, bytes = req.audio_content.len(), "STT frame");

        let Some(utterance) =
            self.accumulator
                .on_frame(device_id, &req.uuid, &req.audio_content, req.timestamp, vad)
        else {
            return;
        };

        info!(
            device.id = device_id,
            utterance.id = %utterance.utterance_id,
            bytes = utterance.audio.len(),
            frames = utterance.frames,
            "Utterance reached end of speech"
        );

        let transcriber = self.transcriber.clone();
        let publisher = self.publisher.clone();
        self.pool.submit("stt", async move {
            let reply = transcribe_utterance(&utterance, transcriber.as_ref()).await;
            if let Err(e) = send_bridge(publisher.as_ref(), &utterance.device_id, &reply).await {
                warn!(device.id = %utterance.device_id, error = %e, "Failed to send STT reply");
            }
        });
    }

    pub fn release(&self, device_id: &str) {
        let dropped = self.accumulator.discard_device(device_id);
        if dropped > 0 {
            debug!(device.id = device_id, dropped, "Dropped partial utterances");
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub async fn idle(&self) {
        self.pool.idle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MemoryPublisher;
    use hiveproto::BridgeFrame;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns a canned transcript and keeps the uploaded WAVs.
    #[derive(Default)]
    struct CannedTranscriber {
        transcript: Option<Transcript>,
        uploads: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Transcriber for CannedTranscriber {
        async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcript, TranscriptionError> {
            self.uploads.lock().unwrap().push(wav);
            self.transcript
                .clone()
                .ok_or_else(|| TranscriptionError::Request("service unavailable".to_string()))
        }
    }

    fn utterance(audio: Vec<u8>) -> Utterance {
        Utterance {
            device_id: "d_1".to_string(),
            utterance_id: "u1".to_string(),
            audio,
            start_timestamp: 10_000,
            frames: 1,
        }
    }

    #[test]
    fn test_three_frames_concatenate_once() {
        let acc = UtteranceAccumulator::new();
        assert!(acc.on_frame("d_1", "u1", b"aa", 100, VadState::InProgress).is_none());
        assert!(acc.on_frame("d_1", "u1", b"bb", 200, VadState::InProgress).is_none());
        let done = acc.on_frame("d_1", "u1", b"cc", 300, VadState::EndOfSpeech).unwrap();

        assert_eq!(done.audio, b"aabbcc");
        assert_eq!(done.start_timestamp, 100);
        assert_eq!(done.frames, 3);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_consumed_utterance_is_not_revived() {
        let acc = UtteranceAccumulator::new();
        acc.on_frame("d_1", "u1", b"aa", 100, VadState::EndOfSpeech).unwrap();
        assert!(acc.on_frame("d_1", "u1", b"zz", 900, VadState::InProgress).is_none());
        let again = acc.on_frame("d_1", "u1", b"", 950, VadState::EndOfSpeech).unwrap();
        assert_eq!(again.audio, b"zz");
        assert_eq!(again.start_timestamp, 900);
    }

    #[test]
    fn test_devices_do_not_share_utterances() {
        let acc = UtteranceAccumulator::new();
        acc.on_frame("d_1", "u1", b"aa", 1, VadState::InProgress);
        acc.on_frame("d_2", "u1", b"bb", 1, VadState::InProgress);
        assert_eq!(acc.len(), 2);
        assert_eq!(acc.discard_device("d_1"), 1);
        let done = acc.on_frame("d_2", "u1", b"", 2, VadState::EndOfSpeech).unwrap();
        assert_eq!(done.audio, b"bb");
    }

    #[tokio::test]
    async fn test_success_remaps_word_times() {
        let transcriber = CannedTranscriber {
            transcript: Some(Transcript {
                text: "hi there".to_string(),
                words: vec![
                    WordTiming { word: "hi".to_string(), start: 0.25, end: 0.5 },
                    WordTiming { word: "there".to_string(), start: 0.6, end: 1.2 },
                ],
            }),
            ..Default::default()
        };
        let reply = transcribe_utterance(&utterance(vec![0, 0, 1, 0]), &transcriber).await;

        assert_eq!(reply.uuid, "u1");
        assert_eq!(reply.r#type, SttResponseType::Final as i32);
        assert_eq!(reply.speech, "hi there");
        assert_eq!(reply.start_timestamp, 10_250);
        assert_eq!(reply.end_timestamp, 11_200);
        assert_eq!(reply.error_code, 0);
        assert!(transcriber.uploads.lock().unwrap()[0].starts_with(b"RIFF"));
    }

    #[tokio::test]
    async fn test_word_times_saturate_at_clock_limit() {
        let transcriber = CannedTranscriber {
            transcript: Some(Transcript {
                text: "late".to_string(),
                words: vec![WordTiming { word: "late".to_string(), start: 0.5, end: 2.0 }],
            }),
            ..Default::default()
        };
        let mut late = utterance(vec![0, 0]);
        late.start_timestamp = u64::MAX - 1_000;

        let reply = transcribe_utterance(&late, &transcriber).await;
        assert_eq!(reply.start_timestamp, u64::MAX - 500);
        assert_eq!(reply.end_timestamp, u64::MAX);
        assert_eq!(reply.speech, "late");
    }

    #[tokio::test]
    async fn test_failure_and_empty_are_error_coded() {
        let failing = CannedTranscriber::default();
        let reply = transcribe_utterance(&utterance(vec![0, 0]), &failing).await;
        assert_eq!(reply.error_code, TRANSCRIPTION_ERROR_CODE);
        assert_eq!(reply.error_message, "service unavailable");

        let silent = CannedTranscriber {
            transcript: Some(Transcript::default()),
            ..Default::default()
        };
        let reply = transcribe_utterance(&utterance(vec![0, 0]), &silent).await;
        assert_eq!(reply.error_code, TRANSCRIPTION_ERROR_CODE);
        assert!(reply.speech.is_empty());
    }

    #[tokio::test]
    async fn test_service_replies_once_per_utterance() {
        let publisher = Arc::new(MemoryPublisher::new());
        let service = SpeechService::new(
            Arc::new(CannedTranscriber::default()),
            publisher.clone(),
            WorkerPool::new("stt", 2),
        );

        for (vad, audio) in [
            (VadState::InProgress, vec![1u8, 0]),
            (VadState::InProgress, vec![2, 0]),
            (VadState::EndOfSpeech, vec![3, 0]),
        ] {
            service.on_request(
                "d_1",
                &SttRequest {
                    uuid: "u1".to_string(),
                    audio_content: audio,
                    timestamp: 5,
                    vad: vad as i32,
                },
            );
        }
        service.idle().await;

        let sent = publisher.wait_for(1, Duration::from_secs(1)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "/devices/d_1/commands/zmq");
        let reply = BridgeFrame::parse(&sent[0].payload)
            .unwrap()
            .decode::<SttResponse>()
            .unwrap();
        assert_eq!(reply.uuid, "u1");
        assert_eq!(reply.error_code, TRANSCRIPTION_ERROR_CODE);
    }
}
