//! Standard MIDI File reading and REMI tokenization.
//!
//! - [`MidiFile`]: notes grouped into instruments, in ticks
//! - [`remi`]: REMI event tokenizer with a fixed vocabulary
//! - [`bar_block`]: bar-aligned, padded fixed-length blocks

pub mod bar_block;
pub mod remi;

use std::collections::HashMap;
use std::path::Path;

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use crate::{Error, Result};

/// General MIDI percussion channel (0-based).
const DRUM_CHANNEL: u8 = 9;

/// A single note, times in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    pub start: u64,
    pub end: u64,
    pub pitch: u8,
    pub velocity: u8,
}

/// Notes played by one `(track, channel)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub program: u8,
    pub is_drum: bool,
    pub notes: Vec<Note>,
}

/// Parsed MIDI file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiFile {
    pub ticks_per_beat: u16,
    pub instruments: Vec<Instrument>,
    /// First tempo event in microseconds per beat, if any.
    pub tempo: Option<u32>,
}

impl MidiFile {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let smf = Smf::parse(bytes)?;
        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(tpb) => tpb.as_int(),
            Timing::Timecode(..) => {
                return Err(Error::Midi("timecode timing is not supported".into()));
            }
        };
        if ticks_per_beat == 0 {
            return Err(Error::Midi("zero ticks per beat".into()));
        }

        let mut instruments = Vec::new();
        let mut tempo = None;

        for track in &smf.tracks {
            let mut now: u64 = 0;
            // Every track starts on program 0.
            let mut programs = [0u8; 16];
            // channel -> index into `pending`
            let mut by_channel: HashMap<u8, usize> = HashMap::new();
            let mut pending: Vec<Instrument> = Vec::new();
            // (channel, pitch) -> stack of (start, velocity)
            let mut open: HashMap<(u8, u8), Vec<(u64, u8)>> = HashMap::new();

            for event in track {
                now += u64::from(event.delta.as_int());
                match event.kind {
                    TrackEventKind::Meta(MetaMessage::Tempo(t)) if tempo.is_none() => {
                        tempo = Some(t.as_int());
                    }
                    TrackEventKind::Midi { channel, message } => {
                        let channel = channel.as_int();
                        match message {
                            MidiMessage::ProgramChange { program } => {
                                programs[usize::from(channel)] = program.as_int();
                            }
                            MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                                open.entry((channel, key.as_int()))
                                    .or_default()
                                    .push((now, vel.as_int()));
                            }
                            MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                                let pitch = key.as_int();
                                let Some((start, velocity)) =
                                    open.get_mut(&(channel, pitch)).and_then(Vec::pop)
                                else {
                                    continue;
                                };
                                let instrument = instrument_for(
                                    &mut by_channel,
                                    &mut pending,
                                    channel,
                                    programs[usize::from(channel)],
                                );
                                instrument.notes.push(Note {
                                    start,
                                    end: now,
                                    pitch,
                                    velocity,
                                });
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
            }

            // Close notes still sounding at the end of the track.
            let mut dangling: Vec<_> = open
                .into_iter()
                .flat_map(|((channel, pitch), starts)| {
                    starts.into_iter().map(move |(start, velocity)| (channel, pitch, start, velocity))
                })
                .collect();
            dangling.sort_unstable();
            for (channel, pitch, start, velocity) in dangling {
                let instrument = instrument_for(
                    &mut by_channel,
                    &mut pending,
                    channel,
                    programs[usize::from(channel)],
                );
                instrument.notes.push(Note {
                    start,
                    end: now.max(start + 1),
                    pitch,
                    velocity,
                });
            }

            for mut instrument in pending {
                if instrument.notes.is_empty() {
                    continue;
                }
                instrument.notes.sort_by_key(|n| (n.start, n.pitch));
                instruments.push(instrument);
            }
        }

        Ok(Self {
            ticks_per_beat,
            instruments,
            tempo,
        })
    }

    /// Program of the first instrument, the label used by the instrument
    /// experiment.
    pub fn first_program(&self) -> Option<u8> {
        self.instruments.first().map(|i| i.program)
    }
}

/// Instruments are created on their first finished note: within a track they
/// are ordered by first note-off, and take the program active at that point.
fn instrument_for<'a>(
    by_channel: &mut HashMap<u8, usize>,
    pending: &'a mut Vec<Instrument>,
    channel: u8,
    program: u8,
) -> &'a mut Instrument {
    let idx = *by_channel.entry(channel).or_insert_with(|| {
        pending.push(Instrument {
            program,
            is_drum: channel == DRUM_CHANNEL,
            notes: Vec::new(),
        });
        pending.len() - 1
    });
    &mut pending[idx]
}

#[cfg(test)]
pub(crate) mod test_util {
    //! Minimal SMF writer for building fixtures in tests.

    /// `(delta, bytes)` events of one track.
    pub type TrackSpec = Vec<(u32, Vec<u8>)>;

    fn vlq(mut value: u32, out: &mut Vec<u8>) {
        let mut buf = vec![(value & 0x7f) as u8];
        value >>= 7;
        while value > 0 {
            buf.push(((value & 0x7f) as u8) | 0x80);
            value >>= 7;
        }
        buf.reverse();
        out.extend(buf);
    }

    pub fn smf(ticks_per_beat: u16, tracks: &[TrackSpec]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(b"MThd");
        out.extend(6u32.to_be_bytes());
        out.extend(1u16.to_be_bytes());
        out.extend((tracks.len() as u16).to_be_bytes());
        out.extend(ticks_per_beat.to_be_bytes());
        for track in tracks {
            let mut body = Vec::new();
            for (delta, bytes) in track {
                vlq(*delta, &mut body);
                body.extend(bytes);
            }
            vlq(0, &mut body);
            body.extend([0xff, 0x2f, 0x00]);
            out.extend(b"MTrk");
            out.extend((body.len() as u32).to_be_bytes());
            out.extend(body);
        }
        out
    }

    /// One track on `channel` with `program`, playing `(start, duration, pitch)`
    /// notes back to back (notes must be sorted and non-overlapping).
    pub fn single_track(channel: u8, program: u8, notes: &[(u32, u32, u8)]) -> TrackSpec {
        let mut events = vec![(0, vec![0xc0 | channel, program])];
        let mut now = 0;
        for &(start, duration, pitch) in notes {
            events.push((start - now, vec![0x90 | channel, pitch, 100]));
            events.push((duration, vec![0x80 | channel, pitch, 0]));
            now = start + duration;
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::{single_track, smf};
    use super::*;

    #[test]
    fn parses_notes_and_program() {
        let bytes = smf(480, &[single_track(0, 41, &[(0, 480, 60), (480, 240, 64)])]);
        let midi = MidiFile::parse(&bytes).unwrap();
        assert_eq!(midi.ticks_per_beat, 480);
        assert_eq!(midi.instruments.len(), 1);
        assert_eq!(midi.first_program(), Some(41));
        let notes = &midi.instruments[0].notes;
        assert_eq!(
            notes[1],
            Note {
                start: 480,
                end: 720,
                pitch: 64,
                velocity: 100
            }
        );
    }

    #[test]
    fn note_on_with_zero_velocity_ends_note() {
        let track = vec![
            (0, vec![0x90, 60, 90]),
            (120, vec![0x90, 60, 0]),
        ];
        let midi = MidiFile::parse(&smf(96, &[track])).unwrap();
        let note = midi.instruments[0].notes[0];
        assert_eq!((note.start, note.end, note.velocity), (0, 120, 90));
    }

    #[test]
    fn drum_channel_is_flagged_and_empty_tracks_dropped() {
        let conductor = vec![(0, vec![0xff, 0x51, 0x03, 0x07, 0xa1, 0x20])];
        let bytes = smf(
            96,
            &[conductor, single_track(9, 0, &[(0, 24, 36)]), single_track(1, 24, &[(0, 96, 50)])],
        );
        let midi = MidiFile::parse(&bytes).unwrap();
        assert_eq!(midi.tempo, Some(500_000));
        assert_eq!(midi.instruments.len(), 2);
        assert!(midi.instruments[0].is_drum);
        assert_eq!(midi.instruments[1].program, 24);
    }

    #[test]
    fn programs_reset_at_each_track() {
        let conductor = vec![(0, vec![0xc0, 40])];
        let notes = vec![(0, vec![0x90, 60, 100]), (96, vec![0x80, 60, 0])];
        let midi = MidiFile::parse(&smf(96, &[conductor, notes])).unwrap();
        assert_eq!(midi.first_program(), Some(0));
    }

    #[test]
    fn instruments_ordered_by_first_note_off() {
        let track = vec![
            (0, vec![0xc0, 40]),
            (0, vec![0xc1, 24]),
            (0, vec![0x90, 60, 100]),
            (0, vec![0x91, 64, 100]),
            (10, vec![0x81, 64, 0]),
            (950, vec![0x80, 60, 0]),
        ];
        let midi = MidiFile::parse(&smf(96, &[track])).unwrap();
        let programs: Vec<u8> = midi.instruments.iter().map(|i| i.program).collect();
        assert_eq!(programs, vec![24, 40]);
        assert_eq!(midi.first_program(), Some(24));
    }

    #[test]
    fn dangling_notes_close_at_track_end() {
        let track = vec![(0, vec![0x90, 60, 90]), (200, vec![0xb0, 7, 100])];
        let midi = MidiFile::parse(&smf(96, &[track])).unwrap();
        assert_eq!(midi.instruments[0].notes[0].end, 200);
    }

    #[test]
    fn garbage_is_a_midi_error() {
        assert!(matches!(MidiFile::parse(b"not a midi file"), Err(Error::Midi(_))));
    }
}
