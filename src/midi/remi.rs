//! REMI tokenizer.
//!
//! Music becomes a flat stream of events, bar by bar:
//!
//! ```text
//! Bar  Position_0  Pitch_60  Velocity_24  Duration_4  Pitch_64  Velocity_24  Duration_4
//!      Position_8  Pitch_67  ...
//! Bar  ...
//! ```
//!
//! Time is quantized to sixteenth notes in 4/4: 16 positions per bar and
//! durations of 1..=32 sixteenths. A `Position` token is only emitted when
//! the onset differs from the previous note's.
//!
//! ## Vocabulary
//!
//! ```text
//! 0            PAD
//! 1            Bar
//! 2..=17       Position_0..15
//! 18..=105     Pitch_21..108
//! 106..=137    Velocity_0..31   (uniform bins over 1..=127)
//! 138..=169    Duration_1..32
//! ```

use std::collections::BTreeMap;
use std::fmt;

use super::MidiFile;

pub const POSITIONS_PER_BAR: u32 = 16;
pub const POSITIONS_PER_BEAT: u32 = 4;
pub const PITCH_MIN: u8 = 21;
pub const PITCH_MAX: u8 = 108;
pub const VELOCITY_BINS: u32 = 32;
pub const MAX_DURATION: u32 = 32;

const POSITION_BASE: u32 = 2;
const PITCH_BASE: u32 = POSITION_BASE + POSITIONS_PER_BAR;
const VELOCITY_BASE: u32 = PITCH_BASE + (PITCH_MAX - PITCH_MIN) as u32 + 1;
const DURATION_BASE: u32 = VELOCITY_BASE + VELOCITY_BINS;
const VOCAB_SIZE: u32 = DURATION_BASE + MAX_DURATION;

pub const PAD_ID: u32 = 0;
pub const BAR_ID: u32 = 1;

/// A single REMI event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemiToken {
    Pad,
    Bar,
    Position(u32),
    Pitch(u8),
    Velocity(u32),
    Duration(u32),
}

impl RemiToken {
    pub fn id(self) -> u32 {
        match self {
            RemiToken::Pad => PAD_ID,
            RemiToken::Bar => BAR_ID,
            RemiToken::Position(p) => POSITION_BASE + p,
            RemiToken::Pitch(p) => PITCH_BASE + u32::from(p - PITCH_MIN),
            RemiToken::Velocity(v) => VELOCITY_BASE + v,
            RemiToken::Duration(d) => DURATION_BASE + d - 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        let token = match id {
            PAD_ID => RemiToken::Pad,
            BAR_ID => RemiToken::Bar,
            id if id < PITCH_BASE => RemiToken::Position(id - POSITION_BASE),
            id if id < VELOCITY_BASE => RemiToken::Pitch((id - PITCH_BASE) as u8 + PITCH_MIN),
            id if id < DURATION_BASE => RemiToken::Velocity(id - VELOCITY_BASE),
            id if id < VOCAB_SIZE => RemiToken::Duration(id - DURATION_BASE + 1),
            _ => return None,
        };
        Some(token)
    }
}

impl fmt::Display for RemiToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemiToken::Pad => write!(f, "PAD_None"),
            RemiToken::Bar => write!(f, "Bar_None"),
            RemiToken::Position(p) => write!(f, "Position_{p}"),
            RemiToken::Pitch(p) => write!(f, "Pitch_{p}"),
            RemiToken::Velocity(v) => write!(f, "Velocity_{v}"),
            RemiToken::Duration(d) => write!(f, "Duration_{d}"),
        }
    }
}

/// Stateless REMI tokenizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemiTokenizer;

impl RemiTokenizer {
    pub fn vocab_size(&self) -> usize {
        VOCAB_SIZE as usize
    }

    /// Token name → id.
    pub fn vocab(&self) -> BTreeMap<String, u32> {
        (0..VOCAB_SIZE)
            .filter_map(|id| RemiToken::from_id(id).map(|t| (t.to_string(), id)))
            .collect()
    }

    /// Tokenize every pitched (non-drum) instrument merged into one stream.
    pub fn midi_to_tokens(&self, midi: &MidiFile) -> Vec<u32> {
        let ticks_per_position = f64::from(midi.ticks_per_beat) / f64::from(POSITIONS_PER_BEAT);
        let quantize = |ticks: u64| (ticks as f64 / ticks_per_position).round() as u64;

        // (onset in positions, pitch, velocity bin, duration)
        let mut events: Vec<(u64, u8, u32, u32)> = midi
            .instruments
            .iter()
            .filter(|i| !i.is_drum)
            .flat_map(|i| i.notes.iter())
            .filter(|n| (PITCH_MIN..=PITCH_MAX).contains(&n.pitch))
            .map(|n| {
                let onset = quantize(n.start);
                let duration = (quantize(n.end).saturating_sub(onset) as u32).clamp(1, MAX_DURATION);
                (onset, n.pitch, velocity_bin(n.velocity), duration)
            })
            .collect();
        events.sort_unstable();

        let Some(last) = events.last() else {
            return Vec::new();
        };
        let num_bars = last.0 / u64::from(POSITIONS_PER_BAR) + 1;

        let mut tokens = Vec::with_capacity(events.len() * 4 + num_bars as usize);
        let mut events = events.into_iter().peekable();
        for bar in 0..num_bars {
            tokens.push(BAR_ID);
            let bar_end = (bar + 1) * u64::from(POSITIONS_PER_BAR);
            let mut previous_position = None;
            while let Some((onset, pitch, velocity, duration)) =
                events.next_if(|e| e.0 < bar_end)
            {
                let position = (onset % u64::from(POSITIONS_PER_BAR)) as u32;
                if previous_position != Some(position) {
                    tokens.push(RemiToken::Position(position).id());
                    previous_position = Some(position);
                }
                tokens.push(RemiToken::Pitch(pitch).id());
                tokens.push(RemiToken::Velocity(velocity).id());
                tokens.push(RemiToken::Duration(duration).id());
            }
        }
        tokens
    }

    /// Ids back to events; unknown ids are skipped.
    pub fn decode(&self, ids: &[u32]) -> Vec<RemiToken> {
        ids.iter().filter_map(|&id| RemiToken::from_id(id)).collect()
    }
}

fn velocity_bin(velocity: u8) -> u32 {
    let v = u32::from(velocity.clamp(1, 127)) - 1;
    (v * VELOCITY_BINS / 127).min(VELOCITY_BINS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::test_util::{single_track, smf};

    #[test]
    fn ids_roundtrip_through_tokens() {
        for id in 0..VOCAB_SIZE {
            let token = RemiToken::from_id(id).unwrap();
            assert_eq!(token.id(), id, "{token}");
        }
        assert_eq!(RemiToken::from_id(VOCAB_SIZE), None);
    }

    #[test]
    fn vocab_is_dense() {
        let tokenizer = RemiTokenizer;
        let vocab = tokenizer.vocab();
        assert_eq!(vocab.len(), tokenizer.vocab_size());
        assert_eq!(vocab["PAD_None"], PAD_ID);
        assert_eq!(vocab["Bar_None"], BAR_ID);
        assert_eq!(vocab["Pitch_21"], PITCH_BASE);
        assert_eq!(vocab["Duration_32"], VOCAB_SIZE - 1);
    }

    #[test]
    fn tokenizes_bars_positions_and_chords() {
        // 480 ticks per beat → 120 ticks per sixteenth.
        // Two notes at the downbeat, one at beat 3 of bar 2.
        let track = vec![
            (0, vec![0xc0, 0]),
            (0, vec![0x90, 60, 100]),
            (0, vec![0x90, 64, 100]),
            (240, vec![0x80, 64, 0]),
            (240, vec![0x80, 60, 0]),
        ];
        let midi = MidiFile::parse(&smf(480, &[track, single_track(1, 0, &[(2880, 120, 67)])])).unwrap();

        let tokenizer = RemiTokenizer;
        let names: Vec<String> = tokenizer
            .decode(&tokenizer.midi_to_tokens(&midi))
            .iter()
            .map(ToString::to_string)
            .collect();
        let vel = format!("Velocity_{}", velocity_bin(100));
        assert_eq!(
            names,
            vec![
                "Bar_None".to_string(),
                "Position_0".into(),
                "Pitch_60".into(),
                vel.clone(),
                "Duration_4".into(),
                "Pitch_64".into(),
                vel.clone(),
                "Duration_2".into(),
                "Bar_None".into(),
                "Position_8".into(),
                "Pitch_67".into(),
                vel,
                "Duration_1".into(),
            ]
        );
    }

    #[test]
    fn drums_and_out_of_range_pitches_are_skipped() {
        let bytes = smf(
            96,
            &[single_track(9, 0, &[(0, 24, 36)]), single_track(0, 0, &[(0, 24, 10), (24, 24, 72)])],
        );
        let midi = MidiFile::parse(&bytes).unwrap();
        let tokens = RemiTokenizer.midi_to_tokens(&midi);
        let pitches: Vec<_> = RemiTokenizer
            .decode(&tokens)
            .into_iter()
            .filter(|t| matches!(t, RemiToken::Pitch(_)))
            .collect();
        assert_eq!(pitches, vec![RemiToken::Pitch(72)]);
    }

    #[test]
    fn empty_file_has_no_tokens() {
        let midi = MidiFile::parse(&smf(96, &[vec![]])).unwrap();
        assert!(RemiTokenizer.midi_to_tokens(&midi).is_empty());
    }

    #[test]
    fn velocity_bins_cover_range() {
        assert_eq!(velocity_bin(0), 0);
        assert_eq!(velocity_bin(1), 0);
        assert_eq!(velocity_bin(127), VELOCITY_BINS - 1);
    }
}
