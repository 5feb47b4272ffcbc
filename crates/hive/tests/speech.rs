//! Streamed utterance audio in, one final transcript out.

mod common;

use std::time::Duration;

use common::harness;
use hiveproto::bridge::{encode_frame, ProtoSubscribe, SttResponseType};
use hiveproto::{BridgeFrame, SttRequest, SttResponse, VadState};

fn frame(uuid: &str, timestamp: u64, vad: VadState) -> Vec<u8> {
    encode_frame(&SttRequest {
        uuid: uuid.to_string(),
        audio_content: vec![0x10, 0x00, 0x20, 0x00],
        timestamp,
        vad: vad as i32,
    })
}

#[tokio::test]
async fn end_of_speech_yields_one_final_transcript() {
    let h = harness("", Duration::from_secs(1));
    h.router.handle_message(
        "$SYS/broker/log/N",
        b"New client connected from 127.0.0.1 as d_1",
    );
    h.router.idle().await;

    let topic = "/devices/d_1/events/zmq";
    h.router.handle_message(topic, &frame("utt-1", 1000, VadState::InProgress));
    h.router.handle_message(topic, &frame("utt-1", 1020, VadState::InProgress));
    h.router.handle_message(topic, &frame("utt-1", 1040, VadState::EndOfSpeech));
    h.router.idle().await;

    let bridge = h.publisher.on_topic("/devices/d_1/commands/zmq");
    let subscribes = bridge
        .iter()
        .filter(|p| BridgeFrame::parse(&p.payload).is_ok_and(|f| f.is::<ProtoSubscribe>()))
        .count();
    assert_eq!(subscribes, 1);

    let finals: Vec<SttResponse> = bridge
        .iter()
        .filter_map(|p| BridgeFrame::parse(&p.payload).ok())
        .filter(|f| f.is::<SttResponse>())
        .map(|f| f.decode::<SttResponse>().unwrap())
        .collect();
    assert_eq!(finals.len(), 1);

    let reply = &finals[0];
    assert_eq!(reply.uuid, "utt-1");
    assert_eq!(reply.r#type, SttResponseType::Final as i32);
    assert_eq!(reply.speech, "hello moxie");
    assert_eq!(reply.start_timestamp, 1250);
    assert_eq!(reply.end_timestamp, 1750);
    assert_eq!(reply.error_code, 0);
}

#[tokio::test]
async fn frames_without_end_of_speech_stay_quiet() {
    let h = harness("", Duration::from_secs(1));
    let topic = "/devices/d_2/events/zmq";
    h.router.handle_message(topic, &frame("utt-2", 5000, VadState::StartOfSpeech));
    h.router.handle_message(topic, &frame("utt-2", 5020, VadState::InProgress));
    h.router.idle().await;

    let finals = h
        .publisher
        .on_topic("/devices/d_2/commands/zmq")
        .iter()
        .filter(|p| BridgeFrame::parse(&p.payload).is_ok_and(|f| f.is::<SttResponse>()))
        .count();
    assert_eq!(finals, 0);
}
