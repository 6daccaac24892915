use crate::error::ChatError;
use std::{io::Cursor, time::Duration};
use symphonia::core::{
    codecs::DecoderOptions, errors::Error as SymphoniaError, formats::FormatOptions,
    io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
};

/// Recordings shorter than this are discarded without creating a message.
pub const MIN_RECORDING_SECS: f64 = 1.0;

/// Longest clip a duration is accepted for. Anything beyond is corrupt.
pub const MAX_CLIP_SECS: f64 = 3600.0;

pub fn is_recording_long_enough(duration_secs: f64) -> bool {
    duration_secs >= MIN_RECORDING_SECS
}

/// Converts a length in seconds to a playing time. Zero, negative,
/// non-finite and implausibly long values are rejected.
pub fn clip_duration(secs: f64) -> Result<Duration, ChatError> {
    if !(secs > 0.0 && secs <= MAX_CLIP_SECS) {
        return Err(ChatError::PlaybackFailed(format!("implausible audio duration: {secs}s")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| ChatError::PlaybackFailed(format!("invalid audio duration: {e}")))
}

/// Container formats we expect from the TTS provider and the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Mp4,
    Unknown,
}

impl AudioFormat {
    /// Identifies the container from its magic bytes.
    pub fn sniff(bytes: &[u8]) -> Self {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            Self::Wav
        } else if bytes.len() >= 8 && &bytes[4..8] == b"ftyp" {
            Self::Mp4
        } else if bytes.starts_with(b"ID3") || (bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0) {
            Self::Mp3
        } else {
            Self::Unknown
        }
    }

    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Self::Wav,
            "mp3" => Self::Mp3,
            "m4a" | "mp4" | "aac" => Self::Mp4,
            _ => Self::Unknown,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Mp4 => "m4a",
            Self::Unknown => "bin",
        }
    }
}

fn playback_error(context: &str, err: impl std::fmt::Display) -> ChatError {
    ChatError::PlaybackFailed(format!("{context}: {err}"))
}

/// Computes the exact playing time of an encoded clip.
///
/// Uses the frame count advertised by the container when there is one and
/// otherwise decodes the whole clip and counts frames.
pub fn decode_duration(bytes: &[u8], format: AudioFormat) -> Result<Duration, ChatError> {
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let mut hint = Hint::new();
    if format != AudioFormat::Unknown {
        hint.with_extension(format.extension());
    }

    let decoded = symphonia::default::get_probe()
        .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| playback_error("unrecognized audio", e))?;
    let mut reader = decoded.format;
    let track = reader
        .default_track()
        .ok_or_else(|| ChatError::PlaybackFailed("audio has no playable track".into()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    if let (Some(frames), Some(rate)) = (params.n_frames, params.sample_rate) {
        if rate > 0 {
            return clip_duration(frames as f64 / rate as f64);
        }
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| playback_error("unsupported codec", e))?;
    let mut frames: u64 = 0;
    let mut rate = params.sample_rate;
    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(playback_error("cannot read audio", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                frames += decoded.frames() as u64;
                rate = rate.or(Some(decoded.spec().rate));
            }
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(playback_error("cannot decode audio", e)),
        }
    }

    match rate {
        Some(rate) if rate > 0 && frames > 0 => clip_duration(frames as f64 / rate as f64),
        _ => Err(ChatError::PlaybackFailed("audio contains no frames".into())),
    }
}

/// A mono 16-bit PCM WAV clip of `samples` silent frames.
#[cfg(test)]
pub(crate) fn silent_wav(sample_rate: u32, samples: u32) -> Vec<u8> {
    let data_len = samples * 2;
    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVEfmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.resize(44 + data_len as usize, 0);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_formats() {
        assert_eq!(AudioFormat::sniff(&silent_wav(16000, 10)), AudioFormat::Wav);
        assert_eq!(AudioFormat::sniff(b"ID3\x04\x00\x00"), AudioFormat::Mp3);
        assert_eq!(AudioFormat::sniff(&[0xFF, 0xFB, 0x90, 0x00]), AudioFormat::Mp3);
        assert_eq!(AudioFormat::sniff(b"\x00\x00\x00\x20ftypM4A "), AudioFormat::Mp4);
        assert_eq!(AudioFormat::sniff(b"hello"), AudioFormat::Unknown);
        assert_eq!(AudioFormat::sniff(&[]), AudioFormat::Unknown);
    }

    #[test]
    fn test_extensions() {
        assert_eq!(AudioFormat::from_extension("M4A"), AudioFormat::Mp4);
        assert_eq!(AudioFormat::Mp4.extension(), "m4a");
        assert_eq!(AudioFormat::from_extension("ogg"), AudioFormat::Unknown);
    }

    #[test]
    fn test_decode_duration_of_wav() {
        let wav = silent_wav(16000, 24000);
        let duration = decode_duration(&wav, AudioFormat::Wav).unwrap();
        assert_eq!(duration, Duration::from_millis(1500));

        let unhinted = decode_duration(&wav, AudioFormat::Unknown).unwrap();
        assert_eq!(unhinted, Duration::from_millis(1500));
    }

    #[test]
    fn test_decode_duration_rejects_garbage() {
        let result = decode_duration(b"definitely not audio", AudioFormat::Unknown);
        assert!(matches!(result, Err(ChatError::PlaybackFailed(_))));
    }

    #[test]
    fn test_clip_duration_bounds() {
        assert_eq!(clip_duration(1.5).unwrap(), Duration::from_millis(1500));
        assert_eq!(clip_duration(MAX_CLIP_SECS).unwrap(), Duration::from_secs(3600));
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e300, MAX_CLIP_SECS + 1.0] {
            assert!(
                matches!(clip_duration(bad), Err(ChatError::PlaybackFailed(_))),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn test_minimum_recording_length() {
        assert!(!is_recording_long_enough(0.5));
        assert!(is_recording_long_enough(1.0));
        assert!(is_recording_long_enough(12.3));
    }
}
