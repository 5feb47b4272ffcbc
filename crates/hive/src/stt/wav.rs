//! PCM to WAV for the transcription upload.

use std::io::Cursor;

/// Devices stream 16 kHz mono.
pub const SAMPLE_RATE: u32 = 16_000;

/// Wrap raw signed 16-bit little-endian PCM in a WAV container. A trailing
/// odd byte is not a whole sample and is dropped.
pub fn pcm16_to_wav(pcm: &[u8]) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for chunk in pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_round_trips_samples() {
        let samples: [i16; 4] = [0, 1000, -1000, i16::MAX];
        let mut pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        pcm.push(0x7f);

        let wav = pcm16_to_wav(&pcm).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, samples);
    }
}
