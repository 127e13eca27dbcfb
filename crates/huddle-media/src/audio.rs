use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Audio sample rate shared by capture, mixer and playback (22.05kHz)
pub const SAMPLE_RATE: u32 = 22050;

/// Audio channels (mono)
pub const CHANNELS: usize = 1;

/// Frame size in samples (~93ms at 22.05kHz)
pub const FRAME_SAMPLES: usize = 2048;

/// Bytes per 16-bit sample
pub const BYTES_PER_SAMPLE: usize = 2;

/// Size of one PCM frame on the wire
pub const FRAME_BYTES: usize = FRAME_SAMPLES * CHANNELS * BYTES_PER_SAMPLE;

/// One fixed-size block of signed 16-bit mono PCM
///
/// Cloning is cheap; the samples are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    samples: Arc<[i16]>,
}

impl PcmFrame {
    pub fn silence() -> Self {
        Self {
            samples: vec![0i16; FRAME_SAMPLES].into(),
        }
    }

    /// Build a frame from little-endian PCM bytes
    ///
    /// Short payloads are padded with silence, long ones truncated to one frame.
    /// A dangling odd byte is ignored.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut samples = vec![0i16; FRAME_SAMPLES];
        for (slot, pair) in samples.iter_mut().zip(bytes.chunks_exact(BYTES_PER_SAMPLE)) {
            *slot = i16::from_le_bytes([pair[0], pair[1]]);
        }
        Self {
            samples: samples.into(),
        }
    }

    /// Build a frame from samples, padding or truncating to one frame
    pub fn from_samples(mut samples: Vec<i16>) -> Self {
        samples.resize(FRAME_SAMPLES, 0);
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn to_le_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_BYTES);
        for sample in self.samples.iter() {
            buf.put_i16_le(*sample);
        }
        buf.freeze()
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0)
    }
}

impl Default for PcmFrame {
    fn default() -> Self {
        Self::silence()
    }
}

/// Clip a 32-bit accumulated sample back into the 16-bit range
pub fn clip(sample: i32) -> i16 {
    sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Running 32-bit sum of every contributing frame
///
/// N-1 mixes are derived from the total by subtracting the recipient's own
/// frame, so one pass over all speakers serves every recipient. The subtraction
/// is exact because nothing is clipped until [`MixBus::mix_excluding`] returns.
#[derive(Debug, Clone)]
pub struct MixBus {
    acc: Vec<i32>,
    contributors: usize,
}

impl MixBus {
    pub fn new() -> Self {
        Self {
            acc: vec![0i32; FRAME_SAMPLES],
            contributors: 0,
        }
    }

    pub fn add(&mut self, frame: &PcmFrame) {
        for (acc, sample) in self.acc.iter_mut().zip(frame.samples()) {
            *acc += *sample as i32;
        }
        self.contributors += 1;
    }

    pub fn contributors(&self) -> usize {
        self.contributors
    }

    /// Mix of every contribution except `own`, clipped to 16 bits
    ///
    /// `own` must be a frame previously passed to [`MixBus::add`], or `None`
    /// when the recipient contributed nothing.
    pub fn mix_excluding(&self, own: Option<&PcmFrame>) -> PcmFrame {
        let samples = match own {
            Some(own) => self
                .acc
                .iter()
                .zip(own.samples())
                .map(|(acc, s)| clip(acc - *s as i32))
                .collect(),
            None => self.acc.iter().map(|acc| clip(*acc)).collect(),
        };
        PcmFrame::from_samples(samples)
    }
}

impl Default for MixBus {
    fn default() -> Self {
        Self::new()
    }
}
