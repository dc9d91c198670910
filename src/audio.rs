use crate::constants::{AUDIO_BITS_PER_SAMPLE, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE};

/// Collects PCM16LE chunks streamed from the browser during one recording.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    samples: Vec<i16>,
    /// Odd byte left over from the previous chunk
    pending: Option<u8>,
    active: bool,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins a recording, dropping anything left from an earlier one.
    pub fn start(&mut self) {
        self.clear();
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let mut bytes = chunk;
        if let Some(low) = self.pending.take() {
            match bytes.split_first() {
                Some((&high, rest)) => {
                    self.samples.push(i16::from_le_bytes([low, high]));
                    bytes = rest;
                }
                None => {
                    self.pending = Some(low);
                    return;
                }
            }
        }
        let mut pairs = bytes.chunks_exact(2);
        self.samples
            .extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        self.pending = pairs.remainder().first().copied();
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.pending = None;
        self.active = false;
    }

    /// Encodes the recording as a WAV file and empties the buffer.
    pub fn take_wav(&mut self) -> Option<Vec<u8>> {
        if self.samples.is_empty() {
            self.clear();
            return None;
        }
        let wav = encode_wav(&self.samples);
        self.clear();
        Some(wav)
    }
}

/// RIFF/WAVE container around mono 16-bit PCM at the recording rate.
pub fn encode_wav(samples: &[i16]) -> Vec<u8> {
    let block_align = AUDIO_CHANNELS * AUDIO_BITS_PER_SAMPLE / 8;
    let byte_rate = AUDIO_SAMPLE_RATE * block_align as u32;
    let data_len = (samples.len() * 2) as u32;

    let mut wav = Vec::with_capacity(44 + data_len as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&AUDIO_CHANNELS.to_le_bytes());
    wav.extend_from_slice(&AUDIO_SAMPLE_RATE.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&AUDIO_BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}
